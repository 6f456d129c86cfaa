//! Invoice records and their computation from a finalized service order.
//!
//! [`InvoiceComputer`] is pure: numbering, amounts and the duplicate check
//! all take their inputs from the caller, which owns the transaction.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopdesk_core::{
    ClientId, CompanyId, DomainError, DomainResult, Entity, InvoiceId, ServiceOrderId,
};

use crate::number::InvoiceNumber;
use crate::order::ServiceOrder;
use crate::tax::{BasePolicy, InvoiceAmounts, TaxRates};

/// How a freshly generated invoice reaches the fiscal provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmissionMode {
    /// Enqueue an emission job for the worker.
    #[default]
    Queued,
    /// Skip the provider entirely and render a local HTML summary.
    ManualSummary,
}

impl FromStr for EmissionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" | "queue" => Ok(Self::Queued),
            "manual-summary" | "manual_summary" | "manual" => Ok(Self::ManualSummary),
            other => Err(DomainError::validation(format!(
                "unknown emission mode: {other}"
            ))),
        }
    }
}

/// Emission state mirrored on the invoice (`notas_fiscais.status_emissao`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionStatus {
    Queued,
    Emitted,
    Failed,
    ManualSummary,
}

impl EmissionStatus {
    pub fn initial_for(mode: EmissionMode) -> Self {
        match mode {
            EmissionMode::Queued => Self::Queued,
            EmissionMode::ManualSummary => Self::ManualSummary,
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            EmissionStatus::Queued => "queued",
            EmissionStatus::Emitted => "emitted",
            EmissionStatus::Failed => "failed",
            EmissionStatus::ManualSummary => "manual_summary",
        }
    }
}

impl FromStr for EmissionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "emitted" => Ok(Self::Emitted),
            "failed" => Ok(Self::Failed),
            "manual_summary" => Ok(Self::ManualSummary),
            other => Err(DomainError::validation(format!(
                "unknown emission status: {other}"
            ))),
        }
    }
}

/// Status recorded on each `notas_fiscais_historico` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Generated,
    Queued,
    ManualSummary,
    Emitted,
    RetryScheduled,
    DeadLettered,
    Canceled,
}

impl HistoryStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            HistoryStatus::Generated => "generated",
            HistoryStatus::Queued => "queued",
            HistoryStatus::ManualSummary => "manual_summary",
            HistoryStatus::Emitted => "emitted",
            HistoryStatus::RetryScheduled => "retry_scheduled",
            HistoryStatus::DeadLettered => "dead_lettered",
            HistoryStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(Self::Generated),
            "queued" => Ok(Self::Queued),
            "manual_summary" => Ok(Self::ManualSummary),
            "emitted" => Ok(Self::Emitted),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "dead_lettered" => Ok(Self::DeadLettered),
            "canceled" => Ok(Self::Canceled),
            other => Err(DomainError::validation(format!(
                "unknown history status: {other}"
            ))),
        }
    }
}

/// One audit entry in an invoice's emission history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub invoice_id: InvoiceId,
    pub status: HistoryStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Storage locations of generated documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandles {
    pub pdf: Option<String>,
    pub xml: Option<String>,
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub canceled_at: DateTime<Utc>,
}

/// Invoice about to be inserted; produced by [`InvoiceComputer::prepare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub number: InvoiceNumber,
    pub order_id: ServiceOrderId,
    pub client_id: ClientId,
    pub company_id: CompanyId,
    pub issued_at: DateTime<Utc>,
    pub amounts: InvoiceAmounts,
    pub notes: Option<String>,
}

/// Persisted invoice (nota fiscal).
///
/// Amounts and number never change after creation. Only the emission result
/// and the one-way cancellation mutate the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: InvoiceId,
    pub number: InvoiceNumber,
    pub order_id: ServiceOrderId,
    pub client_id: ClientId,
    pub company_id: CompanyId,
    pub issued_at: DateTime<Utc>,
    pub amounts: InvoiceAmounts,
    pub notes: Option<String>,
    pub emission_status: EmissionStatus,
    /// Number assigned by the fiscal provider on successful emission.
    pub external_number: Option<String>,
    pub artifacts: ArtifactHandles,
    pub cancellation: Option<Cancellation>,
}

impl InvoiceRecord {
    pub fn from_new(id: InvoiceId, new: NewInvoice, mode: EmissionMode) -> Self {
        Self {
            id,
            number: new.number,
            order_id: new.order_id,
            client_id: new.client_id,
            company_id: new.company_id,
            issued_at: new.issued_at,
            amounts: new.amounts,
            notes: new.notes,
            emission_status: EmissionStatus::initial_for(mode),
            external_number: None,
            artifacts: ArtifactHandles::default(),
            cancellation: None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_some()
    }

    /// Cancel the invoice. Irreversible.
    pub fn cancel(&mut self, reason: &str, at: DateTime<Utc>) -> DomainResult<()> {
        if self.is_canceled() {
            return Err(DomainError::AlreadyCanceled(self.id));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DomainError::validation("cancellation reason is required"));
        }
        self.cancellation = Some(Cancellation {
            reason: reason.to_string(),
            canceled_at: at,
        });
        Ok(())
    }

    /// Apply a successful provider emission.
    pub fn record_emission(
        &mut self,
        external_number: impl Into<String>,
        pdf: Option<String>,
        xml: Option<String>,
    ) {
        self.external_number = Some(external_number.into());
        if pdf.is_some() {
            self.artifacts.pdf = pdf;
        }
        if xml.is_some() {
            self.artifacts.xml = xml;
        }
        self.emission_status = EmissionStatus::Emitted;
    }
}

impl Entity for InvoiceRecord {
    type Id = InvoiceId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

/// Listing filter for invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFilter {
    pub issued_from: Option<DateTime<Utc>>,
    pub issued_to: Option<DateTime<Utc>>,
    pub client_id: Option<ClientId>,
    pub include_canceled: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for InvoiceFilter {
    fn default() -> Self {
        Self {
            issued_from: None,
            issued_to: None,
            client_id: None,
            include_canceled: true,
            limit: 50,
            offset: 0,
        }
    }
}

impl InvoiceFilter {
    pub fn matches(&self, record: &InvoiceRecord) -> bool {
        self.issued_from.is_none_or(|from| record.issued_at >= from)
            && self.issued_to.is_none_or(|to| record.issued_at <= to)
            && self.client_id.is_none_or(|c| record.client_id == c)
            && (self.include_canceled || !record.is_canceled())
    }
}

/// Turns a finalized service order into a [`NewInvoice`].
///
/// Pure: the caller supplies the current highest invoice number and the
/// active invoice for the order, read inside the same transaction that will
/// insert the result.
#[derive(Debug, Clone, Default)]
pub struct InvoiceComputer {
    rates: TaxRates,
    policy: BasePolicy,
}

impl InvoiceComputer {
    pub fn new(rates: TaxRates, policy: BasePolicy) -> Self {
        Self { rates, policy }
    }

    pub fn prepare(
        &self,
        order: &ServiceOrder,
        active_invoice: Option<InvoiceId>,
        highest_number: Option<InvoiceNumber>,
        issued_at: DateTime<Utc>,
    ) -> DomainResult<NewInvoice> {
        if !order.is_finalized() {
            return Err(DomainError::NotFinalized {
                order_id: order.id,
                status: order.status.to_string(),
            });
        }
        if let Some(invoice_id) = active_invoice {
            return Err(DomainError::DuplicateInvoice {
                order_id: order.id,
                invoice_id,
            });
        }

        let amounts = InvoiceAmounts::compute(order, &self.rates, self.policy)?;
        let number = InvoiceNumber::next_after(highest_number)?;

        Ok(NewInvoice {
            number,
            order_id: order.id,
            client_id: order.client.id,
            company_id: order.company_id,
            issued_at,
            amounts,
            notes: Some(format!("Referente à OS #{}", order.id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{ClientSnapshot, LineItem, ServiceOrderStatus};
    use rust_decimal::Decimal;

    fn finalized_order() -> ServiceOrder {
        ServiceOrder {
            id: ServiceOrderId::new(42),
            company_id: CompanyId::new(1),
            client: ClientSnapshot {
                id: ClientId::new(9),
                name: "Maria".to_string(),
                document: Some("123.456.789-09".to_string()),
                email: None,
                address: None,
            },
            status: ServiceOrderStatus::Finalized,
            recorded_total: Decimal::from(300),
            products: vec![LineItem::product("Peça", Decimal::from(2), Decimal::from(50))],
            services: vec![LineItem::service("Serviço", Decimal::ONE, Decimal::from(200))],
            invoice_id: None,
        }
    }

    #[test]
    fn first_invoice_gets_number_000001() {
        let computer = InvoiceComputer::default();
        let new = computer
            .prepare(&finalized_order(), None, None, Utc::now())
            .unwrap();

        assert_eq!(new.number.to_string(), "000001");
        assert_eq!(new.order_id, ServiceOrderId::new(42));
        assert_eq!(new.client_id, ClientId::new(9));
        assert_eq!(new.amounts.base, Decimal::from(300));
        assert_eq!(
            new.amounts.total,
            new.amounts.base + new.amounts.total_taxes
        );
    }

    #[test]
    fn rejects_orders_that_are_not_finalized() {
        let computer = InvoiceComputer::default();
        let mut order = finalized_order();
        order.status = ServiceOrderStatus::InProgress;

        let err = computer.prepare(&order, None, None, Utc::now()).unwrap_err();
        match err {
            DomainError::NotFinalized { order_id, status } => {
                assert_eq!(order_id, ServiceOrderId::new(42));
                assert_eq!(status, "em_andamento");
            }
            other => panic!("expected NotFinalized, got {other:?}"),
        }
    }

    #[test]
    fn rejects_orders_with_an_active_invoice() {
        let computer = InvoiceComputer::default();
        let err = computer
            .prepare(&finalized_order(), Some(InvoiceId::new(3)), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::DuplicateInvoice { .. }));
    }

    #[test]
    fn cancellation_is_one_way() {
        let computer = InvoiceComputer::default();
        let new = computer
            .prepare(&finalized_order(), None, None, Utc::now())
            .unwrap();
        let mut record = InvoiceRecord::from_new(InvoiceId::new(1), new, EmissionMode::Queued);

        assert!(matches!(
            record.cancel("   ", Utc::now()),
            Err(DomainError::Validation(_))
        ));
        record.cancel("Cliente desistiu", Utc::now()).unwrap();
        assert!(record.is_canceled());
        assert_eq!(
            record.cancel("de novo", Utc::now()),
            Err(DomainError::AlreadyCanceled(InvoiceId::new(1)))
        );
    }

    #[test]
    fn emission_keeps_existing_artifacts_when_absent() {
        let new = InvoiceComputer::default()
            .prepare(&finalized_order(), None, None, Utc::now())
            .unwrap();
        let mut record = InvoiceRecord::from_new(InvoiceId::new(1), new, EmissionMode::Queued);
        record.artifacts.xml = Some("local:old.xml".to_string());

        record.record_emission("NF-77", Some("local:nf.pdf".to_string()), None);

        assert_eq!(record.emission_status, EmissionStatus::Emitted);
        assert_eq!(record.external_number.as_deref(), Some("NF-77"));
        assert_eq!(record.artifacts.pdf.as_deref(), Some("local:nf.pdf"));
        assert_eq!(record.artifacts.xml.as_deref(), Some("local:old.xml"));
    }

    #[test]
    fn emission_mode_parses_toggle_values() {
        assert_eq!("manual-summary".parse::<EmissionMode>().unwrap(), EmissionMode::ManualSummary);
        assert_eq!("QUEUED".parse::<EmissionMode>().unwrap(), EmissionMode::Queued);
        assert!("sometimes".parse::<EmissionMode>().is_err());
    }
}
