//! Emission worker.
//!
//! One cooperative loop per process: claim a due job, call the gateway
//! outside any database transaction, then apply the outcome through the
//! queue. Horizontal scale comes from running more processes; correctness
//! rests on `JobQueue::claim_next` being exclusive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::types::{FailureAction, Job, RetryPolicy};
use crate::StoreError;
use crate::config::WorkerSettings;
use crate::gateway::{EmissionError, EmissionReceipt, Emitter};
use crate::store::GatewayConfigStore;

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
    pub released_stale: u64,
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Emitted,
    Rescheduled,
    DeadLettered,
    /// The claim expired and another worker owns the job now.
    LeaseLost,
}

pub struct Worker<Q: ?Sized, G: ?Sized, E: ?Sized> {
    queue: Arc<Q>,
    configs: Arc<G>,
    emitter: Arc<E>,
    policy: RetryPolicy,
    poll_interval: Duration,
    lease: Duration,
    stats: WorkerStats,
}

impl<Q, G, E> Worker<Q, G, E>
where
    Q: JobQueue + ?Sized,
    G: GatewayConfigStore + ?Sized,
    E: Emitter + ?Sized,
{
    pub fn new(queue: Arc<Q>, configs: Arc<G>, emitter: Arc<E>, settings: &WorkerSettings) -> Self {
        Self {
            queue,
            configs,
            emitter,
            policy: settings.retry_policy(),
            poll_interval: settings.poll_interval,
            lease: settings.lease,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Claim and process at most one job.
    ///
    /// Emission failures never surface here; they become a reschedule or a
    /// dead letter. An `Err` means the queue itself failed, in which case the
    /// job stays claimed until the stale sweep returns it.
    pub async fn tick(&mut self) -> Result<TickOutcome, StoreError> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(TickOutcome::Idle);
        };
        self.stats.processed += 1;
        debug!(job_id = %job.id, invoice_id = %job.invoice_id, attempts = job.attempts, "claimed job");

        let applied = match self.attempt(&job).await {
            Ok(receipt) => self
                .queue
                .complete(&job, &receipt)
                .await
                .map(|()| {
                    info!(
                        job_id = %job.id,
                        invoice_id = %job.invoice_id,
                        assigned_number = %receipt.assigned_number,
                        "invoice emitted"
                    );
                    TickOutcome::Emitted
                }),
            Err(err) => self.fail(&job, err).await,
        };

        match applied {
            Ok(outcome) => {
                match outcome {
                    TickOutcome::Emitted => self.stats.succeeded += 1,
                    TickOutcome::Rescheduled => self.stats.rescheduled += 1,
                    TickOutcome::DeadLettered => self.stats.dead_lettered += 1,
                    TickOutcome::Idle | TickOutcome::LeaseLost => {}
                }
                Ok(outcome)
            }
            Err(StoreError::Conflict(reason)) => {
                warn!(job_id = %job.id, reason = %reason, "claim expired before the outcome was saved");
                Ok(TickOutcome::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt(&self, job: &Job) -> Result<EmissionReceipt, EmissionError> {
        let payload = job
            .emission_payload()
            .map_err(|e| EmissionError::Payload(e.to_string()))?;
        // An unreachable config table is an outage like any other: retry.
        let config = self
            .configs
            .active_for(payload.company_id)
            .await
            .map_err(|e| EmissionError::Provider(format!("gateway config unavailable: {e}")))?;
        self.emitter.emit(&payload, config.as_ref()).await
    }

    async fn fail(&self, job: &Job, err: EmissionError) -> Result<TickOutcome, StoreError> {
        let message = err.to_string();
        match self.policy.on_failure(job.attempts, err.is_transient()) {
            FailureAction::Retry { attempts, delay } => {
                let next_run_at = self.queue.reschedule(job, attempts, &message, delay).await?;
                warn!(
                    job_id = %job.id,
                    invoice_id = %job.invoice_id,
                    attempts,
                    next_run_at = %next_run_at,
                    error = %message,
                    "emission failed, retry scheduled"
                );
                Ok(TickOutcome::Rescheduled)
            }
            FailureAction::DeadLetter { attempts } => {
                let dead_letter = self.queue.move_to_dead_letter(job, attempts, &message).await?;
                error!(
                    job_id = %job.id,
                    invoice_id = %job.invoice_id,
                    dead_letter_id = %dead_letter,
                    attempts,
                    error = %message,
                    "emission abandoned, job dead-lettered"
                );
                Ok(TickOutcome::DeadLettered)
            }
        }
    }

    /// Return jobs whose claim outlived the lease to the queue.
    pub async fn sweep(&mut self) -> Result<u64, StoreError> {
        let released = self.queue.release_stale(self.lease).await?;
        if released > 0 {
            warn!(released, lease_secs = self.lease.as_secs(), "released stale jobs");
        }
        self.stats.released_stale += released;
        Ok(released)
    }

    /// Poll until `shutdown` turns true (or its sender is dropped).
    ///
    /// A claimed job always runs to completion before shutdown is honoured.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            max_attempts = self.policy.max_attempts,
            "emission worker started"
        );
        if let Err(e) = self.sweep().await {
            error!(error = %e, "stale job sweep failed");
        }
        let mut last_sweep = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if last_sweep.elapsed() >= self.lease {
                if let Err(e) = self.sweep().await {
                    error!(error = %e, "stale job sweep failed");
                }
                last_sweep = Instant::now();
            }

            let idle = match self.tick().await {
                Ok(TickOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(error = %e, "job processing failed, retrying after poll interval");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(stats = ?self.stats, "emission worker stopped");
        self.stats
    }
}
