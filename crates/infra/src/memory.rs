//! In-memory backend for tests and local development.
//!
//! All tables sit behind a single mutex, so every multi-table operation is
//! atomic in the same way a database transaction would be.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shopdesk_core::{
    CompanyId, DeadLetterId, DomainError, InvoiceId, JobId, ServiceOrderId,
};
use shopdesk_fiscal::{
    EmissionMode, EmissionPayload, EmissionStatus, HistoryEntry, HistoryStatus, InvoiceComputer,
    InvoiceFilter, InvoiceRecord, ServiceOrder,
};

use crate::StoreError;
use crate::gateway::{EmissionReceipt, GatewayConfig, NewGatewayConfig};
use crate::jobs::types::schedule_after;
use crate::jobs::{DeadLetterJob, Job, JobQueue, JobStatus, QueueStats};
use crate::store::{GatewayConfigStore, InvoiceStore, IssuedInvoice, messages};

#[derive(Default)]
struct State {
    orders: BTreeMap<ServiceOrderId, ServiceOrder>,
    invoices: BTreeMap<InvoiceId, InvoiceRecord>,
    history: Vec<HistoryEntry>,
    jobs: BTreeMap<JobId, Job>,
    dead_letters: BTreeMap<DeadLetterId, DeadLetterJob>,
    configs: Vec<GatewayConfig>,
    last_id: i64,
    last_stamp: Option<DateTime<Utc>>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    /// Strictly increasing timestamps so claim tokens never repeat.
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn push_history(&mut self, invoice_id: InvoiceId, status: HistoryStatus, message: String) {
        let id = self.next_id();
        let created_at = self.stamp();
        self.history.push(HistoryEntry {
            id,
            invoice_id,
            status,
            message,
            created_at,
        });
    }

    fn insert_job(&mut self, invoice_id: InvoiceId, payload: serde_json::Value) -> JobId {
        let id = JobId::new(self.next_id());
        let now = self.stamp();
        self.jobs.insert(
            id,
            Job {
                id,
                invoice_id,
                payload,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                next_run_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// The caller must still hold the claim it was handed.
    fn held_job(&self, job: &Job) -> Result<(), StoreError> {
        match self.jobs.get(&job.id) {
            Some(current)
                if current.status == JobStatus::Processing
                    && current.updated_at == job.updated_at =>
            {
                Ok(())
            }
            Some(_) => Err(StoreError::conflict(format!(
                "job {} is no longer held by this worker",
                job.id
            ))),
            None => Err(StoreError::not_found(format!("job {}", job.id))),
        }
    }

    fn invoice_mut(&mut self, id: InvoiceId) -> Result<&mut InvoiceRecord, StoreError> {
        self.invoices
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found(format!("invoice {id}")).into())
    }
}

/// Invoice store, job queue and gateway-config store in one process.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed or replace a service order.
    pub fn insert_order(&self, order: ServiceOrder) {
        self.lock().orders.insert(order.id, order);
    }

    pub fn order(&self, id: ServiceOrderId) -> Option<ServiceOrder> {
        self.lock().orders.get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Enqueue an arbitrary JSON payload, bypassing payload typing.
    #[cfg(test)]
    pub(crate) fn enqueue_raw(&self, invoice_id: InvoiceId, payload: serde_json::Value) -> JobId {
        self.lock().insert_job(invoice_id, payload)
    }
}

#[async_trait]
impl InvoiceStore for InMemoryBackend {
    async fn issue(
        &self,
        order_id: ServiceOrderId,
        computer: &InvoiceComputer,
        mode: EmissionMode,
    ) -> Result<IssuedInvoice, StoreError> {
        let mut st = self.lock();
        let order = st
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("service order {order_id}")))?;
        let active = st
            .invoices
            .values()
            .find(|i| i.order_id == order_id && !i.is_canceled())
            .map(|i| i.id);
        let highest = st.invoices.values().map(|i| i.number).max();

        let issued_at = st.stamp();
        let new = computer.prepare(&order, active, highest, issued_at)?;
        let id = InvoiceId::new(st.next_id());
        let payload = EmissionPayload::build(id, &new, &order);
        let record = InvoiceRecord::from_new(id, new, mode);
        let payload_json = serde_json::to_value(&payload)?;

        st.invoices.insert(id, record.clone());
        if let Some(o) = st.orders.get_mut(&order_id) {
            o.invoice_id = Some(id);
        }
        st.push_history(
            id,
            HistoryStatus::Generated,
            messages::generated(record.number, order_id),
        );
        let job_id = match mode {
            EmissionMode::Queued => {
                let job_id = st.insert_job(id, payload_json);
                st.push_history(id, HistoryStatus::Queued, messages::queued());
                Some(job_id)
            }
            EmissionMode::ManualSummary => None,
        };

        Ok(IssuedInvoice {
            record,
            payload,
            job_id,
        })
    }

    async fn get(&self, id: InvoiceId) -> Result<Option<InvoiceRecord>, StoreError> {
        Ok(self.lock().invoices.get(&id).cloned())
    }

    async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        let st = self.lock();
        let mut matching: Vec<InvoiceRecord> = st
            .invoices
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn cancel(&self, id: InvoiceId, reason: &str) -> Result<InvoiceRecord, StoreError> {
        let mut st = self.lock();
        let now = st.stamp();
        let record = st.invoice_mut(id)?;
        record.cancel(reason, now)?;
        let record = record.clone();

        if let Some(order) = st.orders.get_mut(&record.order_id) {
            if order.invoice_id == Some(id) {
                order.invoice_id = None;
            }
        }
        let reason = record
            .cancellation
            .as_ref()
            .map(|c| c.reason.clone())
            .unwrap_or_default();
        st.push_history(id, HistoryStatus::Canceled, messages::canceled(&reason));
        Ok(record)
    }

    async fn history(&self, id: InvoiceId) -> Result<Vec<HistoryEntry>, StoreError> {
        let st = self.lock();
        if !st.invoices.contains_key(&id) {
            return Err(DomainError::not_found(format!("invoice {id}")).into());
        }
        Ok(st
            .history
            .iter()
            .filter(|h| h.invoice_id == id)
            .cloned()
            .collect())
    }

    async fn attach_summary(&self, id: InvoiceId, location: &str) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.invoice_mut(id)?.artifacts.html = Some(location.to_string());
        st.push_history(
            id,
            HistoryStatus::ManualSummary,
            messages::manual_summary(location),
        );
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryBackend {
    async fn enqueue(
        &self,
        invoice_id: InvoiceId,
        payload: &EmissionPayload,
    ) -> Result<JobId, StoreError> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.lock().insert_job(invoice_id, payload))
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let mut st = self.lock();
        let now = st.stamp();
        let next = st
            .jobs
            .values()
            .filter(|j| j.is_due(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = st.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job: &Job, receipt: &EmissionReceipt) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.held_job(job)?;
        let now = st.stamp();

        st.invoice_mut(job.invoice_id)?.record_emission(
            receipt.assigned_number.clone(),
            receipt.pdf.as_ref().map(|a| a.location.clone()),
            receipt.xml.as_ref().map(|a| a.location.clone()),
        );
        st.push_history(job.invoice_id, HistoryStatus::Emitted, messages::emitted(receipt));
        if let Some(j) = st.jobs.get_mut(&job.id) {
            j.status = JobStatus::Done;
            j.last_error = None;
            j.updated_at = now;
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
        delay: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut st = self.lock();
        st.held_job(job)?;
        let now = st.stamp();
        let next_run_at = schedule_after(now, delay);

        if let Some(j) = st.jobs.get_mut(&job.id) {
            j.status = JobStatus::Pending;
            j.attempts = attempts;
            j.last_error = Some(error.to_string());
            j.next_run_at = Some(next_run_at);
            j.updated_at = now;
        }
        st.push_history(
            job.invoice_id,
            HistoryStatus::RetryScheduled,
            messages::retry_scheduled(attempts, error, next_run_at),
        );
        Ok(next_run_at)
    }

    async fn move_to_dead_letter(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
    ) -> Result<DeadLetterId, StoreError> {
        let mut st = self.lock();
        st.held_job(job)?;
        let moved_at = st.stamp();
        let id = DeadLetterId::new(st.next_id());

        let Some(source) = st.jobs.remove(&job.id) else {
            return Err(StoreError::not_found(format!("job {}", job.id)));
        };
        st.dead_letters.insert(
            id,
            DeadLetterJob {
                id,
                original_job_id: source.id,
                invoice_id: source.invoice_id,
                payload: source.payload,
                attempts,
                last_error: Some(error.to_string()),
                moved_at,
            },
        );
        if let Some(invoice) = st.invoices.get_mut(&job.invoice_id) {
            invoice.emission_status = EmissionStatus::Failed;
        }
        st.push_history(
            job.invoice_id,
            HistoryStatus::DeadLettered,
            messages::dead_lettered(attempts, error),
        );
        Ok(id)
    }

    async fn release_stale(&self, lease: Duration) -> Result<u64, StoreError> {
        let mut st = self.lock();
        let now = st.stamp();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut released = 0;
        for job in st.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at <= cutoff {
                job.status = JobStatus::Pending;
                job.next_run_at = Some(now);
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterJob>, StoreError> {
        let st = self.lock();
        let mut entries: Vec<DeadLetterJob> = st.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<JobId, StoreError> {
        let mut st = self.lock();
        let entry = st
            .dead_letters
            .remove(&id)
            .ok_or_else(|| StoreError::not_found(format!("dead letter {id}")))?;

        let job_id = st.insert_job(entry.invoice_id, entry.payload);
        if let Some(invoice) = st.invoices.get_mut(&entry.invoice_id) {
            invoice.emission_status = EmissionStatus::Queued;
        }
        st.push_history(entry.invoice_id, HistoryStatus::Queued, messages::requeued(id));
        Ok(job_id)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let st = self.lock();
        let mut stats = QueueStats {
            dead_lettered: st.dead_letters.len() as u64,
            ..QueueStats::default()
        };
        for job in st.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Done => stats.done += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl GatewayConfigStore for InMemoryBackend {
    async fn active_for(&self, company_id: CompanyId) -> Result<Option<GatewayConfig>, StoreError> {
        Ok(self
            .lock()
            .configs
            .iter()
            .filter(|c| c.company_id == company_id && c.active)
            .max_by_key(|c| (c.created_at, c.id))
            .cloned())
    }

    async fn upsert(&self, config: NewGatewayConfig) -> Result<GatewayConfig, StoreError> {
        let mut st = self.lock();
        for existing in st.configs.iter_mut().filter(|c| c.company_id == config.company_id) {
            existing.active = false;
        }
        let created = GatewayConfig {
            id: st.next_id(),
            company_id: config.company_id,
            provider: config.provider,
            api_key: config.api_key,
            api_secret: config.api_secret,
            certificate: None,
            certificate_password: None,
            active: true,
            created_at: st.stamp(),
        };
        st.configs.push(created.clone());
        Ok(created)
    }

    async fn set_certificate(
        &self,
        company_id: CompanyId,
        sealed: Vec<u8>,
        password: Option<String>,
    ) -> Result<(), StoreError> {
        let mut st = self.lock();
        let config = st
            .configs
            .iter_mut()
            .filter(|c| c.company_id == company_id && c.active)
            .max_by_key(|c| (c.created_at, c.id))
            .ok_or_else(|| StoreError::not_found(format!("gateway config for company {company_id}")))?;
        config.certificate = Some(sealed);
        config.certificate_password = password;
        Ok(())
    }
}
