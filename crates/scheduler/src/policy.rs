//! Retry policies and the decision engine that applies them.
//!
//! A task carries up to two policies: one for attempts that raised an error
//! (`on_failure`) and one for attempts that returned `Incomplete`
//! (`on_incomplete`). After every attempt the worker classifies the outcome and
//! asks [`decide`] what to do with the instance. The engine is a pure function
//! of its inputs; it never touches the store.
//!
//! ## Counters
//!
//! - `failure_count`: consecutive failed attempts, reset by any attempt that did
//!   not raise an error
//! - `repeat_count`: total attempts made
//!
//! The failure channel counts with `failure_count`, the incomplete channel with
//! `repeat_count`.
//!
//! ## Backoff
//!
//! `backoff(attempt) = retry_interval * retry_exponent^(attempt - 1)` for
//! `attempt >= 1`. An exponent of `1.0` gives a constant delay.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ConfigurationError;

/// Saturation point for runaway geometric growth.
pub const MAX_BACKOFF: Duration = Duration::from_secs(u32::MAX as u64);

/// Retry configuration for one outcome channel of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    retry_interval: Duration,
    retry_exponent: f64,
    max_retry: Option<u32>,
    on_max_retry: Option<String>,
}

impl RetryPolicy {
    /// Constant delay between attempts, retried forever.
    pub fn fixed(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            retry_exponent: 1.0,
            max_retry: None,
            on_max_retry: None,
        }
    }

    /// Geometrically growing delay between attempts, retried forever.
    pub fn exponential(
        retry_interval: Duration,
        retry_exponent: f64,
    ) -> Result<Self, ConfigurationError> {
        if !retry_exponent.is_finite() || retry_exponent < 1.0 {
            return Err(ConfigurationError::InvalidRetryExponent {
                exponent: retry_exponent,
            });
        }
        Ok(Self {
            retry_interval,
            retry_exponent,
            max_retry: None,
            on_max_retry: None,
        })
    }

    /// Limit the number of retries after the initial attempt.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Name of the task to enqueue (with the same payload) once retries run out.
    pub fn with_on_max_retry(mut self, task_name: impl Into<String>) -> Self {
        self.on_max_retry = Some(task_name.into());
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn retry_exponent(&self) -> f64 {
        self.retry_exponent
    }

    pub fn max_retry(&self) -> Option<u32> {
        self.max_retry
    }

    pub fn on_max_retry(&self) -> Option<&str> {
        self.on_max_retry.as_deref()
    }

    /// Delay before the next attempt, given the (1-indexed) attempt counter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        // A zero interval stays zero; scaling it could overflow into NaN.
        if steps == 0 || self.retry_exponent <= 1.0 || self.retry_interval.is_zero() {
            return self.retry_interval;
        }

        let factor = self.retry_exponent.powf(f64::from(steps));
        let floor = self.retry_interval.min(MAX_BACKOFF);
        Duration::try_from_secs_f64(self.retry_interval.as_secs_f64() * factor)
            .map_or(MAX_BACKOFF, |d| d.clamp(floor, MAX_BACKOFF))
    }

    /// True once the attempt counter has gone past `max_retry`.
    ///
    /// The first `max_retry` retries are honoured; attempt `max_retry + 1`
    /// (counting from the initial attempt) exhausts the policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_retry.is_some_and(|max| attempt > max)
    }
}

/// The two policy slots of a task definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicies {
    pub on_failure: Option<RetryPolicy>,
    pub on_incomplete: Option<RetryPolicy>,
}

impl RetryPolicies {
    /// No retries on either channel: every task runs once.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_on_failure(mut self, policy: RetryPolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn with_on_incomplete(mut self, policy: RetryPolicy) -> Self {
        self.on_incomplete = Some(policy);
        self
    }

    /// Fallback task names referenced by either channel.
    pub fn fallbacks(&self) -> impl Iterator<Item = &str> {
        self.on_failure
            .iter()
            .chain(self.on_incomplete.iter())
            .filter_map(RetryPolicy::on_max_retry)
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Executor returned `TaskConclusion::Complete`.
    Complete,
    /// Executor returned `TaskConclusion::Incomplete`.
    Incomplete,
    /// Executor raised an error (or panicked, or its payload did not decode).
    Failure,
}

/// Which policy slot governed a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Failure,
    Incomplete,
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Channel::Failure => f.write_str("on_failure"),
            Channel::Incomplete => f.write_str("on_incomplete"),
        }
    }
}

/// Attempt counters carried by a queued instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attempts {
    pub failure_count: u32,
    pub repeat_count: u32,
}

impl Attempts {
    pub fn new(failure_count: u32, repeat_count: u32) -> Self {
        Self {
            failure_count,
            repeat_count,
        }
    }
}

/// What to do with an instance after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Terminal success: delete the instance.
    Complete,
    /// No policy on the channel: delete after this single attempt.
    Abandon { channel: Channel, attempts: Attempts },
    /// Retry budget exceeded: delete, then enqueue the fallback if one is named.
    Exhausted {
        channel: Channel,
        attempts: Attempts,
        escalate_to: Option<String>,
    },
    /// Put the instance back to PENDING with new counters and due time.
    Reschedule {
        channel: Channel,
        attempts: Attempts,
        due_at: DateTime<Utc>,
    },
}

impl Directive {
    pub fn deletes_instance(&self) -> bool {
        !matches!(self, Directive::Reschedule { .. })
    }
}

/// Decide the fate of an instance after an attempt.
///
/// `previous` are the counters stored on the instance before the attempt ran.
pub fn decide(
    outcome: Outcome,
    previous: Attempts,
    policies: &RetryPolicies,
    now: DateTime<Utc>,
) -> Directive {
    let (channel, attempts, policy, counter) = match outcome {
        Outcome::Complete => return Directive::Complete,
        Outcome::Incomplete => {
            let attempts = Attempts::new(0, previous.repeat_count.saturating_add(1));
            (
                Channel::Incomplete,
                attempts,
                policies.on_incomplete.as_ref(),
                attempts.repeat_count,
            )
        }
        Outcome::Failure => {
            let attempts = Attempts::new(
                previous.failure_count.saturating_add(1),
                previous.repeat_count.saturating_add(1),
            );
            (
                Channel::Failure,
                attempts,
                policies.on_failure.as_ref(),
                attempts.failure_count,
            )
        }
    };

    let Some(policy) = policy else {
        return Directive::Abandon { channel, attempts };
    };

    if policy.is_exhausted(counter) {
        return Directive::Exhausted {
            channel,
            attempts,
            escalate_to: policy.on_max_retry.clone(),
        };
    }

    Directive::Reschedule {
        channel,
        attempts,
        due_at: due_after(now, policy.backoff(counter)),
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
