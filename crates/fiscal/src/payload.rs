//! Denormalized emission payload stored on each queued job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopdesk_core::{CompanyId, InvoiceId, ServiceOrderId};

use crate::invoice::NewInvoice;
use crate::number::InvoiceNumber;
use crate::order::{ClientSnapshot, LineItem, ServiceOrder};
use crate::tax::InvoiceAmounts;

/// Everything a provider call needs, copied at generation time so the worker
/// never re-reads business tables while a job is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionPayload {
    pub invoice_id: InvoiceId,
    pub invoice_number: InvoiceNumber,
    pub order_id: ServiceOrderId,
    pub company_id: CompanyId,
    pub issued_at: DateTime<Utc>,
    pub client: ClientSnapshot,
    pub products: Vec<LineItem>,
    pub services: Vec<LineItem>,
    pub amounts: InvoiceAmounts,
    pub notes: Option<String>,
}

impl EmissionPayload {
    pub fn build(invoice_id: InvoiceId, invoice: &NewInvoice, order: &ServiceOrder) -> Self {
        Self {
            invoice_id,
            invoice_number: invoice.number,
            order_id: order.id,
            company_id: invoice.company_id,
            issued_at: invoice.issued_at,
            client: order.client.clone(),
            products: order.products.clone(),
            services: order.services.clone(),
            amounts: invoice.amounts.clone(),
            notes: invoice.notes.clone(),
        }
    }

    /// Lines in billing order: products first, then services.
    pub fn lines(&self) -> impl Iterator<Item = &LineItem> {
        self.products.iter().chain(self.services.iter())
    }
}
