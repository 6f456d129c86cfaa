//! `JobQueue` over `nf_jobs` and `nf_jobs_dlq`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::PgConnection;
use sqlx::postgres::PgRow;
use tracing::{debug, instrument};

use shopdesk_core::{DeadLetterId, InvoiceId, JobId};
use shopdesk_fiscal::{EmissionPayload, EmissionStatus, HistoryStatus};

use super::invoices::insert_history;
use super::{PostgresBackend, attempts_from_db, attempts_to_db, column, map_sqlx_error};
use crate::StoreError;
use crate::gateway::EmissionReceipt;
use crate::jobs::types::schedule_after;
use crate::jobs::{DeadLetterJob, Job, JobQueue, JobStatus, QueueStats};
use crate::store::messages;

const JOB_COLUMNS: &str =
    "id, nota_fiscal_id, payload, status, attempts, last_error, next_run_at, criado_em, atualizado_em";

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = column(row, "status")?;
    Ok(Job {
        id: JobId::new(column(row, "id")?),
        invoice_id: InvoiceId::new(column(row, "nota_fiscal_id")?),
        payload: column(row, "payload")?,
        status: status.parse()?,
        attempts: attempts_from_db(column(row, "attempts")?),
        last_error: column(row, "last_error")?,
        next_run_at: column(row, "next_run_at")?,
        created_at: column(row, "criado_em")?,
        updated_at: column(row, "atualizado_em")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterJob, StoreError> {
    Ok(DeadLetterJob {
        id: DeadLetterId::new(column(row, "id")?),
        original_job_id: JobId::new(column(row, "original_job_id")?),
        invoice_id: InvoiceId::new(column(row, "nota_fiscal_id")?),
        payload: column(row, "payload")?,
        attempts: attempts_from_db(column(row, "attempts")?),
        last_error: column(row, "last_error")?,
        moved_at: column(row, "moved_at")?,
    })
}

pub(super) async fn insert_job(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
    payload: &serde_json::Value,
) -> Result<JobId, StoreError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO nf_jobs (nota_fiscal_id, payload, status, attempts) VALUES ($1, $2, 'pending', 0) RETURNING id",
    )
    .bind(invoice_id.get())
    .bind(payload)
    .fetch_one(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(JobId::new(id))
}

/// Row-lock the job and check the caller still holds its claim.
async fn lock_held(conn: &mut PgConnection, job: &Job) -> Result<(), StoreError> {
    let row = sqlx::query("SELECT status, atualizado_em FROM nf_jobs WHERE id = $1 FOR UPDATE")
        .bind(job.id.get())
        .fetch_optional(conn)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or_else(|| StoreError::not_found(format!("job {}", job.id)))?;

    let status: String = column(&row, "status")?;
    let updated_at: DateTime<Utc> = column(&row, "atualizado_em")?;
    if status != JobStatus::Processing.as_db_str() || updated_at != job.updated_at {
        return Err(StoreError::conflict(format!(
            "job {} is no longer held by this worker",
            job.id
        )));
    }
    Ok(())
}

#[async_trait]
impl JobQueue for PostgresBackend {
    #[instrument(skip(self, payload), fields(invoice_id = %invoice_id), err)]
    async fn enqueue(
        &self,
        invoice_id: InvoiceId,
        payload: &EmissionPayload,
    ) -> Result<JobId, StoreError> {
        let payload = serde_json::to_value(payload)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        insert_job(&mut conn, invoice_id, &payload).await
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE nf_jobs
            SET status = 'processing', atualizado_em = clock_timestamp()
            WHERE id = (
                SELECT id FROM nf_jobs
                WHERE status = 'pending'
                  AND (next_run_at IS NULL OR next_run_at <= now())
                ORDER BY criado_em, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        let job = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, attempts = job.attempts, "job claimed");
        }
        Ok(job)
    }

    #[instrument(skip(self, job, receipt), fields(job_id = %job.id, invoice_id = %job.invoice_id), err)]
    async fn complete(&self, job: &Job, receipt: &EmissionReceipt) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        lock_held(&mut tx, job).await?;

        sqlx::query(
            r#"
            UPDATE notas_fiscais
            SET numero_externo = $2,
                pdf_path = COALESCE($3, pdf_path),
                xml_path = COALESCE($4, xml_path),
                status_emissao = $5
            WHERE id = $1
            "#,
        )
        .bind(job.invoice_id.get())
        .bind(&receipt.assigned_number)
        .bind(receipt.pdf.as_ref().map(|a| a.location.as_str()))
        .bind(receipt.xml.as_ref().map(|a| a.location.as_str()))
        .bind(EmissionStatus::Emitted.as_db_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_emission", e))?;

        insert_history(
            &mut tx,
            job.invoice_id,
            HistoryStatus::Emitted,
            &messages::emitted(receipt),
        )
        .await?;

        sqlx::query(
            "UPDATE nf_jobs SET status = 'done', last_error = NULL, atualizado_em = clock_timestamp() WHERE id = $1",
        )
        .bind(job.id.get())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id, attempts), err)]
    async fn reschedule(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
        delay: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        lock_held(&mut tx, job).await?;

        let next_run_at = schedule_after(Utc::now().trunc_subsecs(6), delay);
        sqlx::query(
            r#"
            UPDATE nf_jobs
            SET status = 'pending', attempts = $2, last_error = $3, next_run_at = $4,
                atualizado_em = clock_timestamp()
            WHERE id = $1
            "#,
        )
        .bind(job.id.get())
        .bind(attempts_to_db(attempts))
        .bind(error)
        .bind(next_run_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reschedule_job", e))?;

        insert_history(
            &mut tx,
            job.invoice_id,
            HistoryStatus::RetryScheduled,
            &messages::retry_scheduled(attempts, error, next_run_at),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(next_run_at)
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id, attempts), err)]
    async fn move_to_dead_letter(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
    ) -> Result<DeadLetterId, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        lock_held(&mut tx, job).await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO nf_jobs_dlq (original_job_id, nota_fiscal_id, payload, attempts, last_error)
            SELECT id, nota_fiscal_id, payload, $2, $3 FROM nf_jobs WHERE id = $1
            RETURNING id
            "#,
        )
        .bind(job.id.get())
        .bind(attempts_to_db(attempts))
        .bind(error)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

        sqlx::query("DELETE FROM nf_jobs WHERE id = $1")
            .bind(job.id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        sqlx::query("UPDATE notas_fiscais SET status_emissao = $2 WHERE id = $1")
            .bind(job.invoice_id.get())
            .bind(EmissionStatus::Failed.as_db_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;

        insert_history(
            &mut tx,
            job.invoice_id,
            HistoryStatus::DeadLettered,
            &messages::dead_lettered(attempts, error),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(DeadLetterId::new(id))
    }

    #[instrument(skip(self), fields(lease_secs = lease.as_secs()), err)]
    async fn release_stale(&self, lease: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE nf_jobs
            SET status = 'pending', next_run_at = clock_timestamp(), atualizado_em = clock_timestamp()
            WHERE status = 'processing'
              AND atualizado_em <= clock_timestamp() - make_interval(secs => $1)
            "#,
        )
        .bind(lease.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM nf_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, original_job_id, nota_fiscal_id, payload, attempts, last_error, moved_at
            FROM nf_jobs_dlq
            ORDER BY moved_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), fields(dead_letter_id = %id), err)]
    async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<JobId, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("DELETE FROM nf_jobs_dlq WHERE id = $1 RETURNING nota_fiscal_id, payload")
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("take_dead_letter", e))?
            .ok_or_else(|| StoreError::not_found(format!("dead letter {id}")))?;
        let invoice_id = InvoiceId::new(column(&row, "nota_fiscal_id")?);
        let payload: serde_json::Value = column(&row, "payload")?;

        let job_id = insert_job(&mut tx, invoice_id, &payload).await?;
        sqlx::query("UPDATE notas_fiscais SET status_emissao = $2 WHERE id = $1")
            .bind(invoice_id.get())
            .bind(EmissionStatus::Queued.as_db_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_queued", e))?;
        insert_history(&mut tx, invoice_id, HistoryStatus::Queued, &messages::requeued(id)).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(job_id)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM nf_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;
        let dead_lettered: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nf_jobs_dlq")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_count", e))?;

        let mut stats = QueueStats {
            dead_lettered: u64::try_from(dead_lettered).unwrap_or(0),
            ..QueueStats::default()
        };
        for row in &rows {
            let status: String = column(row, "status")?;
            let total = u64::try_from(column::<i64>(row, "total")?).unwrap_or(0);
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = total,
                JobStatus::Processing => stats.processing = total,
                JobStatus::Done => stats.done = total,
            }
        }
        Ok(stats)
    }
}
