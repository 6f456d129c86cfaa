//! Core job types and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopdesk_core::{DeadLetterId, DomainError, InvoiceId, JobId};
use shopdesk_fiscal::EmissionPayload;

/// Job execution status (`nf_jobs.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed, possibly not yet due.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Emitted successfully.
    Done,
}

impl JobStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
        }
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// One durable unit of emission work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub invoice_id: InvoiceId,
    /// Serialized [`EmissionPayload`].
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Refreshed on every claim; outcome updates must present the value
    /// they claimed with.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    pub fn emission_payload(&self) -> Result<EmissionPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Terminal copy of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: DeadLetterId,
    pub original_job_id: JobId,
    pub invoice_id: InvoiceId,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub moved_at: DateTime<Utc>,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub dead_lettered: u64,
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry { attempts: u32, delay: Duration },
    DeadLetter { attempts: u32 },
}

/// Retry policy: exponential backoff, no jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// `2^(attempt-1) * base_delay` for 1-indexed attempts, saturating.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Decide the fate of a job that has failed `previous_attempts` times
    /// before this one.
    pub fn on_failure(&self, previous_attempts: u32, transient: bool) -> FailureAction {
        let attempts = previous_attempts.saturating_add(1);
        if transient && self.should_retry(attempts) {
            FailureAction::Retry {
                attempts,
                delay: self.delay_for_attempt(attempts),
            }
        } else {
            FailureAction::DeadLetter { attempts }
        }
    }
}

/// `now + delay`, clamped far in the future instead of overflowing.
pub(crate) fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let far = chrono::Duration::days(36_500);
    let delta = chrono::Duration::from_std(delay).unwrap_or(far).min(far);
    now.checked_add_signed(delta).unwrap_or(now + far)
}
