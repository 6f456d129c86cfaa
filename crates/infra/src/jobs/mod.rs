//! Emission job queue with retry, backoff and dead-letter handling.
//!
//! - `JobQueue`: durable FIFO with exclusive claims (Postgres or in-memory)
//! - `RetryPolicy`: exponential backoff and the dead-letter threshold
//! - `Worker`: polling loop applying the policy to each claimed job

pub mod queue;
pub mod types;
pub mod worker;

pub use queue::JobQueue;
pub use types::{DeadLetterJob, FailureAction, Job, JobStatus, QueueStats, RetryPolicy};
pub use worker::{TickOutcome, Worker, WorkerStats};
