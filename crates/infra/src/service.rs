//! Invoice entry points: generation, queries, cancellation and history.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use shopdesk_core::{InvoiceId, ServiceOrderId};
use shopdesk_fiscal::{
    EmissionMode, HistoryEntry, InvoiceComputer, InvoiceFilter, InvoiceRecord,
    render_summary_html,
};

use crate::StoreError;
use crate::storage::{ArtifactContent, ArtifactStore};
use crate::store::{InvoiceStore, IssuedInvoice};

/// Invoice operations over an [`InvoiceStore`].
///
/// In [`EmissionMode::Queued`] the store enqueues the emission job together
/// with the invoice. In [`EmissionMode::ManualSummary`] no job is created;
/// an HTML summary is rendered and saved instead.
pub struct InvoiceService {
    store: Arc<dyn InvoiceStore>,
    artifacts: Arc<dyn ArtifactStore>,
    computer: InvoiceComputer,
    mode: EmissionMode,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        artifacts: Arc<dyn ArtifactStore>,
        computer: InvoiceComputer,
        mode: EmissionMode,
    ) -> Self {
        Self {
            store,
            artifacts,
            computer,
            mode,
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id, mode = ?self.mode), err)]
    pub async fn generate(&self, order_id: ServiceOrderId) -> Result<IssuedInvoice, StoreError> {
        let mut issued = self.store.issue(order_id, &self.computer, self.mode).await?;
        info!(
            invoice_id = %issued.record.id,
            number = %issued.record.number,
            total = %issued.record.amounts.total,
            job_id = ?issued.job_id,
            "invoice generated"
        );

        if self.mode == EmissionMode::ManualSummary {
            issued.record.artifacts.html = self.save_summary(&issued).await;
        }
        Ok(issued)
    }

    /// The invoice exists whatever happens here; failures only warn.
    async fn save_summary(&self, issued: &IssuedInvoice) -> Option<String> {
        let html = render_summary_html(&issued.payload);
        let name = format!("nota_{}.html", issued.record.number);
        let stored = match self
            .artifacts
            .save(ArtifactContent::Bytes(html.into_bytes()), &name)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(invoice_id = %issued.record.id, error = %e, "failed to save invoice summary");
                return None;
            }
        };

        if let Err(e) = self
            .store
            .attach_summary(issued.record.id, &stored.location)
            .await
        {
            warn!(invoice_id = %issued.record.id, error = %e, "failed to record invoice summary");
            return None;
        }
        Some(stored.location)
    }

    pub async fn get(&self, id: InvoiceId) -> Result<Option<InvoiceRecord>, StoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.store.list(filter).await
    }

    #[instrument(skip(self, reason), fields(invoice_id = %id), err)]
    pub async fn cancel(&self, id: InvoiceId, reason: &str) -> Result<InvoiceRecord, StoreError> {
        let record = self.store.cancel(id, reason).await?;
        info!(number = %record.number, "invoice canceled");
        Ok(record)
    }

    pub async fn history(&self, id: InvoiceId) -> Result<Vec<HistoryEntry>, StoreError> {
        self.store.history(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use shopdesk_core::DomainError;
    use shopdesk_fiscal::{EmissionStatus, HistoryStatus};

    use crate::jobs::JobQueue;
    use crate::memory::InMemoryBackend;
    use crate::testing::{FailingArtifactStore, RecordingArtifactStore, sample_order};

    fn service(
        backend: Arc<InMemoryBackend>,
        artifacts: Arc<dyn ArtifactStore>,
        mode: EmissionMode,
    ) -> InvoiceService {
        InvoiceService::new(backend, artifacts, InvoiceComputer::default(), mode)
    }

    #[tokio::test]
    async fn queued_generation_enqueues_one_job() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_order(sample_order(42));
        let artifacts = Arc::new(RecordingArtifactStore::default());
        let svc = service(backend.clone(), artifacts.clone(), EmissionMode::Queued);

        let issued = svc.generate(ServiceOrderId::new(42)).await.unwrap();

        assert_eq!(issued.record.number.to_string(), "000001");
        assert_eq!(issued.record.amounts.base, Decimal::from(300));
        assert_eq!(issued.record.emission_status, EmissionStatus::Queued);
        let job = backend.get_job(issued.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(job.emission_payload().unwrap(), issued.payload);
        assert!(artifacts.saved().is_empty());
    }

    #[tokio::test]
    async fn manual_summary_saves_html_instead_of_a_job() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_order(sample_order(42));
        let artifacts = Arc::new(RecordingArtifactStore::default());
        let svc = service(backend.clone(), artifacts.clone(), EmissionMode::ManualSummary);

        let issued = svc.generate(ServiceOrderId::new(42)).await.unwrap();

        assert!(issued.job_id.is_none());
        assert!(backend.jobs().is_empty());
        let saved = artifacts.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "nota_000001.html");
        assert!(String::from_utf8_lossy(&saved[0].1).contains("000001"));

        let stored = svc.get(issued.record.id).await.unwrap().unwrap();
        assert_eq!(stored.emission_status, EmissionStatus::ManualSummary);
        assert_eq!(stored.artifacts.html.as_deref(), Some("memory://nota_000001.html"));
        assert_eq!(issued.record.artifacts.html, stored.artifacts.html);

        let statuses: Vec<_> = svc
            .history(issued.record.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.status)
            .collect();
        assert_eq!(statuses, vec![HistoryStatus::Generated, HistoryStatus::ManualSummary]);
    }

    #[tokio::test]
    async fn summary_save_failure_keeps_the_invoice() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_order(sample_order(42));
        let svc = service(backend.clone(), Arc::new(FailingArtifactStore), EmissionMode::ManualSummary);

        let issued = svc.generate(ServiceOrderId::new(42)).await.unwrap();

        assert!(issued.record.artifacts.html.is_none());
        assert!(svc.get(issued.record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_requires_a_reason_and_is_one_way() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_order(sample_order(42));
        let svc = service(backend.clone(), Arc::new(RecordingArtifactStore::default()), EmissionMode::Queued);
        let id = svc.generate(ServiceOrderId::new(42)).await.unwrap().record.id;

        let err = svc.cancel(id, "   ").await.unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::Validation(_))));

        let canceled = svc.cancel(id, "erro de digitação").await.unwrap();
        assert_eq!(canceled.cancellation.unwrap().reason, "erro de digitação");
        assert!(backend.order(ServiceOrderId::new(42)).unwrap().invoice_id.is_none());

        let err = svc.cancel(id, "de novo").await.unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::AlreadyCanceled(x)) if x == id));

        // The queued job is left alone.
        assert_eq!(backend.stats().await.unwrap().pending, 1);
        let last = svc.history(id).await.unwrap().pop().unwrap();
        assert_eq!(last.status, HistoryStatus::Canceled);
    }

    #[tokio::test]
    async fn unknown_invoice_history_is_not_found() {
        let svc = service(
            Arc::new(InMemoryBackend::new()),
            Arc::new(RecordingArtifactStore::default()),
            EmissionMode::Queued,
        );
        let err = svc.history(InvoiceId::new(999)).await.unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::NotFound(_))));
    }
}
