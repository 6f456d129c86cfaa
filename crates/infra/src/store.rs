//! Store abstractions for invoices and gateway configuration.
//!
//! Implemented by [`crate::memory::InMemoryBackend`] and
//! [`crate::postgres::PostgresBackend`].

use async_trait::async_trait;

use shopdesk_core::{CompanyId, InvoiceId, JobId, ServiceOrderId};
use shopdesk_fiscal::{
    EmissionMode, EmissionPayload, HistoryEntry, InvoiceComputer, InvoiceFilter, InvoiceRecord,
};

use crate::StoreError;
use crate::gateway::{GatewayConfig, NewGatewayConfig};

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct IssuedInvoice {
    pub record: InvoiceRecord,
    pub payload: EmissionPayload,
    /// Set in queued mode.
    pub job_id: Option<JobId>,
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Generate the invoice for a finalized order in one transaction: number
    /// assignment, insert, order back-reference, history and, in queued
    /// mode, the emission job.
    async fn issue(
        &self,
        order_id: ServiceOrderId,
        computer: &InvoiceComputer,
        mode: EmissionMode,
    ) -> Result<IssuedInvoice, StoreError>;

    async fn get(&self, id: InvoiceId) -> Result<Option<InvoiceRecord>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError>;

    /// Cancel and clear the order's back-reference. Leaves the queue alone.
    async fn cancel(&self, id: InvoiceId, reason: &str) -> Result<InvoiceRecord, StoreError>;

    /// Oldest first.
    async fn history(&self, id: InvoiceId) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Store the manual-summary location and append its history entry.
    async fn attach_summary(&self, id: InvoiceId, location: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait GatewayConfigStore: Send + Sync {
    /// Newest active configuration of the issuer, if any.
    async fn active_for(&self, company_id: CompanyId) -> Result<Option<GatewayConfig>, StoreError>;

    /// Insert a new active configuration, deactivating the issuer's previous
    /// ones.
    async fn upsert(&self, config: NewGatewayConfig) -> Result<GatewayConfig, StoreError>;

    /// Attach an already encrypted certificate to the active configuration.
    async fn set_certificate(
        &self,
        company_id: CompanyId,
        sealed: Vec<u8>,
        password: Option<String>,
    ) -> Result<(), StoreError>;
}

/// History entry texts shared by every backend.
pub(crate) mod messages {
    use chrono::{DateTime, Utc};

    use shopdesk_core::{DeadLetterId, ServiceOrderId};
    use shopdesk_fiscal::InvoiceNumber;

    use crate::gateway::EmissionReceipt;

    pub fn generated(number: InvoiceNumber, order_id: ServiceOrderId) -> String {
        format!("Nota {number} gerada para a OS #{order_id}")
    }

    pub fn queued() -> String {
        "Emissão enfileirada".to_string()
    }

    pub fn requeued(dead_letter: DeadLetterId) -> String {
        format!("Emissão reenfileirada a partir da DLQ #{dead_letter}")
    }

    pub fn manual_summary(location: &str) -> String {
        format!("Resumo HTML gerado em {location}")
    }

    pub fn emitted(receipt: &EmissionReceipt) -> String {
        format!(
            "Nota emitida pelo provedor: número {} ({})",
            receipt.assigned_number, receipt.status
        )
    }

    pub fn retry_scheduled(attempts: u32, error: &str, at: DateTime<Utc>) -> String {
        format!(
            "Falha na tentativa {attempts}: {error}. Nova tentativa em {}",
            at.to_rfc3339()
        )
    }

    pub fn dead_lettered(attempts: u32, error: &str) -> String {
        format!("Emissão abandonada após {attempts} tentativa(s): {error}")
    }

    pub fn canceled(reason: &str) -> String {
        format!("Nota cancelada: {reason}")
    }
}
