//! Durable emission job queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shopdesk_core::{DeadLetterId, InvoiceId, JobId};
use shopdesk_fiscal::EmissionPayload;

use super::types::{DeadLetterJob, Job, QueueStats};
use crate::StoreError;
use crate::gateway::EmissionReceipt;

/// Job queue abstraction.
///
/// Outcome operations (`complete`, `reschedule`, `move_to_dead_letter`) take
/// the job exactly as returned by [`JobQueue::claim_next`]. They fail with
/// [`StoreError::Conflict`] if the claim is no longer held, i.e. the sweep
/// released the job and another worker claimed it since.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a pending job with zero attempts and no schedule.
    async fn enqueue(
        &self,
        invoice_id: InvoiceId,
        payload: &EmissionPayload,
    ) -> Result<JobId, StoreError>;

    /// Atomically take the oldest due pending job and mark it processing.
    /// Concurrent callers never receive the same job.
    async fn claim_next(&self) -> Result<Option<Job>, StoreError>;

    /// Record the emission on the invoice, append history and mark the job
    /// done, all at once.
    async fn complete(&self, job: &Job, receipt: &EmissionReceipt) -> Result<(), StoreError>;

    /// Put the job back to pending, due after `delay`. Returns the new
    /// `next_run_at`.
    async fn reschedule(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
        delay: Duration,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Replace the job by a dead-letter row in one step.
    async fn move_to_dead_letter(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
    ) -> Result<DeadLetterId, StoreError>;

    /// Return jobs stuck in processing for longer than `lease` to pending.
    async fn release_stale(&self, lease: Duration) -> Result<u64, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Newest first.
    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterJob>, StoreError>;

    /// Move a dead letter back into the queue as a fresh job.
    async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<JobId, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;
}
