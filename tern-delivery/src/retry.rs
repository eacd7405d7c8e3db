//! Retry scheduling for failed delivery attempts.

use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Deserialize;
use tern_spool::QueueEntry;

use crate::error::ConfigError;

/// How long to wait before each retry.
///
/// ```ron
/// backoff: (type: "Schedule", periods: [180, 1620, 1800, 7200]),
/// backoff: (type: "Exponential", base_secs: 60, max_secs: 86400, max_attempts: 25),
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Backoff {
    /// Retry `n` waits `periods[n - 1]` seconds. The ceiling is the number of periods.
    Schedule { periods: Vec<u64> },
    /// Retry `n` waits `base * 2^(n - 1)` seconds, capped at `max_secs`.
    Exponential {
        base_secs: u64,
        max_secs: u64,
        max_attempts: u32,
    },
}

impl Backoff {
    /// The usual MTA schedule: 3m, 27m, 30m, 2h ten times, then 3h.
    pub fn standard() -> Self {
        let mut periods = vec![3 * 60, 27 * 60, 30 * 60];
        periods.extend(std::iter::repeat_n(2 * 60 * 60, 10));
        periods.push(3 * 60 * 60);
        Self::Schedule { periods }
    }

    /// Failed attempts after which the entry is given up.
    pub fn ceiling(&self) -> u32 {
        match self {
            Self::Schedule { periods } => u32::try_from(periods.len()).unwrap_or(u32::MAX),
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Wait after the `attempt`th failure (1-indexed), before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.clamp(1, self.ceiling().max(1));

        let secs = match self {
            Self::Schedule { periods } => periods
                .get(attempt as usize - 1)
                .or_else(|| periods.last())
                .copied()
                .unwrap_or_default(),
            Self::Exponential {
                base_secs,
                max_secs,
                ..
            } => {
                let exponent = attempt - 1;
                if exponent >= 63 {
                    *max_secs
                } else {
                    base_secs.saturating_mul(1 << exponent).min(*max_secs)
                }
            }
        };

        Duration::from_secs(secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Schedule { periods } if periods.is_empty() => Err(ConfigError::Backoff(
                String::from("a schedule needs at least one period"),
            )),
            Self::Exponential { base_secs: 0, .. } => Err(ConfigError::Backoff(String::from(
                "base_secs must be greater than zero",
            ))),
            Self::Exponential {
                base_secs,
                max_secs,
                ..
            } if max_secs < base_secs => Err(ConfigError::Backoff(String::from(
                "max_secs must not be less than base_secs",
            ))),
            Self::Exponential {
                max_attempts: 0, ..
            } => Err(ConfigError::Backoff(String::from(
                "max_attempts must be greater than zero",
            ))),
            _ => Ok(()),
        }
    }
}

/// What happens to an entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at `next_attempt_at`. `report_delay` is set when the attempt
    /// count passes a delay report point not yet reported.
    Retry {
        next_attempt_at: SystemTime,
        report_delay: bool,
    },
    /// Every host was busy. Try again at `next_attempt_at` without counting
    /// an attempt.
    Postpone { next_attempt_at: SystemTime },
    /// The failure was permanent.
    Bounce,
    /// Retries are exhausted.
    Abandon,
}

impl RetryDecision {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Bounce | Self::Abandon)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub backoff: Backoff,

    /// Attempt counts at which the sender is told delivery is delayed.
    pub delay_report_points: Vec<u32>,

    /// Random spread applied to each wait, as a fraction (0.2 for ±20%).
    #[serde(default)]
    pub jitter_factor: f64,

    /// Postponements allowed before a busy attempt counts as a failure.
    #[serde(default = "defaults::max_postponements")]
    pub max_postponements: u32,
}

mod defaults {
    pub const fn max_postponements() -> u32 {
        3
    }
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, delay_report_points: Vec<u32>) -> Result<Self, ConfigError> {
        let policy = Self {
            backoff,
            delay_report_points,
            jitter_factor: 0.0,
            max_postponements: defaults::max_postponements(),
        };
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    #[must_use]
    pub const fn with_max_postponements(mut self, max_postponements: u32) -> Self {
        self.max_postponements = max_postponements;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Backoff(format!(
                "jitter_factor must be within 0..=1, got {}",
                self.jitter_factor
            )));
        }

        if self.delay_report_points.contains(&0) {
            return Err(ConfigError::Backoff(String::from(
                "delay report points count failed attempts and start at 1",
            )));
        }

        Ok(())
    }

    /// Record a failed attempt on `entry` and decide what happens next.
    ///
    /// The entry's attempt count, next attempt time, last error and reported
    /// delay points are updated in place so the caller can persist them.
    pub fn on_failure(
        &self,
        entry: &mut QueueEntry,
        permanent: bool,
        reason: impl Into<String>,
        now: SystemTime,
    ) -> RetryDecision {
        entry.attempts = entry.attempts.saturating_add(1);
        entry.postponements = 0;
        entry.last_error = Some(reason.into());

        if permanent {
            return RetryDecision::Bounce;
        }

        if entry.attempts > self.backoff.ceiling() {
            return RetryDecision::Abandon;
        }

        let next_attempt_at = now + self.delay_for(entry.attempts);
        entry.next_attempt_at = next_attempt_at;

        // Points missed while a notification could not be queued are caught
        // up by a single report
        let reached = self.points_reached(entry.attempts);
        let report_delay = reached > entry.delay_reports;
        if report_delay {
            entry.delay_reports = reached;
        }

        RetryDecision::Retry {
            next_attempt_at,
            report_delay,
        }
    }

    /// Record that no host could take the attempt right now.
    ///
    /// Up to `max_postponements` times in a row the attempt is only moved to
    /// `now + after`. Beyond that it counts as a temporary failure.
    pub fn on_postpone(
        &self,
        entry: &mut QueueEntry,
        after: Duration,
        reason: impl Into<String>,
        now: SystemTime,
    ) -> RetryDecision {
        if entry.postponements < self.max_postponements {
            entry.postponements += 1;
            entry.next_attempt_at = now + after;
            entry.last_error = Some(reason.into());
            return RetryDecision::Postpone {
                next_attempt_at: entry.next_attempt_at,
            };
        }

        self.on_failure(entry, false, reason, now)
    }

    /// Number of delay report points at or below `attempts`.
    pub fn points_reached(&self, attempts: u32) -> u32 {
        let reached = self
            .delay_report_points
            .iter()
            .filter(|&&point| point <= attempts)
            .count();
        u32::try_from(reached).unwrap_or(u32::MAX)
    }

    /// Jittered wait after the `attempt`th failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let secs = delay.as_secs() as f64;
            let range = secs * self.jitter_factor;
            let jitter: f64 = rand::rng().random_range(-range..=range);
            (secs + jitter).max(0.0) as u64
        };

        Duration::from_secs(jittered)
    }
}
