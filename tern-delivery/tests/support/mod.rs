#![allow(dead_code)]

pub mod mock_server;

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tern_common::{Address, Mail, Reply, ReversePath};
use tern_delivery::{TransmissionResult, Transmitter};
use tern_spool::{QueueEntry, Route};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn mail(from: &str, to: &str) -> Mail {
    Mail::new(
        from.parse::<ReversePath>().unwrap(),
        vec![to.parse().unwrap()],
        format!("From: <{from}>\r\nTo: <{to}>\r\nSubject: Lunch\r\n\r\nNoon?\r\n").into_bytes(),
    )
}

pub fn entry(from: &str, to: &str) -> QueueEntry {
    QueueEntry::new(mail(from, to), to.parse::<Address>().unwrap(), Route::Transmit)
}

/// Answers each attempt with the next scripted result, repeating the last one.
#[derive(Debug)]
pub struct ScriptedTransmitter {
    script: Mutex<VecDeque<TransmissionResult>>,
    last: TransmissionResult,
    seen: Mutex<Vec<QueueEntry>>,
    attempts: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    hold: Option<Duration>,
}

impl ScriptedTransmitter {
    pub fn always(result: TransmissionResult) -> Self {
        Self::new(Vec::new(), result)
    }

    pub fn new(script: Vec<TransmissionResult>, then: TransmissionResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: then,
            seen: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            hold: None,
        }
    }

    /// Keep each attempt busy for `hold` before answering.
    #[must_use]
    pub const fn holding(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Every entry handed over so far, as it was at the time.
    pub fn seen(&self) -> Vec<QueueEntry> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Transmitter for ScriptedTransmitter {
    async fn transmit(&self, entry: &QueueEntry) -> TransmissionResult {
        self.seen.lock().push(entry.clone());
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }

        let result = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.last.clone());

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn temporary(text: &str) -> TransmissionResult {
    TransmissionResult::TemporaryFailure {
        reply: Reply::new(451, "4.3.0", text),
        remote: Some(String::from("mx.example.com")),
    }
}

pub fn permanent(text: &str) -> TransmissionResult {
    TransmissionResult::PermanentFailure {
        reply: Reply::new(550, "5.1.1", text),
        remote: Some(String::from("mx.example.com")),
    }
}
