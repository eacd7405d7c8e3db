//! Ordered, short-circuiting evaluation.
//!
//! Both the filter chain and the recipient table are a list of stages run in
//! configured order, where the first stage to decide wins and the rest are
//! never consulted.

use std::sync::Arc;

use async_trait::async_trait;
use tern_common::internal;

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<D> {
    /// No opinion, let the next stage look at the context.
    Continue,
    /// Final answer, later stages are skipped.
    Decide(D),
}

#[async_trait]
pub trait Stage<C: Send, D: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, context: &mut C) -> Step<D>;
}

pub struct Pipeline<C: Send, D: Send> {
    stages: Vec<Arc<dyn Stage<C, D>>>,
}

impl<C: Send, D: Send> Default for Pipeline<C, D> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<C: Send, D: Send> Clone for Pipeline<C, D> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<C: Send, D: Send> Pipeline<C, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Stage<C, D>>) {
        self.stages.push(stage);
    }

    #[must_use]
    pub fn with(mut self, stage: impl Stage<C, D> + 'static) -> Self {
        self.push(Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name())
    }

    /// Run every stage in order until one decides.
    pub async fn run(&self, context: &mut C) -> Option<D> {
        for stage in &self.stages {
            match stage.evaluate(context).await {
                Step::Continue => internal!(stage = stage.name(), "Continue"),
                Step::Decide(decision) => {
                    internal!(stage = stage.name(), "Decided");
                    return Some(decision);
                }
            }
        }

        None
    }
}

impl<C: Send, D: Send> std::fmt::Debug for Pipeline<C, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|stage| stage.name()))
            .finish()
    }
}
