//! Read-only view of a service order (ordem de serviço) as consumed by the
//! invoice computation.

use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use shopdesk_core::{ClientId, CompanyId, DomainError, Entity, InvoiceId, ServiceOrderId};

/// Service order lifecycle. Only `Finalized` orders can be invoiced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrderStatus {
    Open,
    InProgress,
    Finalized,
    Canceled,
}

impl ServiceOrderStatus {
    /// Value stored in `ordens_servico.status`.
    pub fn as_db_str(self) -> &'static str {
        match self {
            ServiceOrderStatus::Open => "aberta",
            ServiceOrderStatus::InProgress => "em_andamento",
            ServiceOrderStatus::Finalized => "finalizada",
            ServiceOrderStatus::Canceled => "cancelada",
        }
    }
}

impl core::fmt::Display for ServiceOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for ServiceOrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aberta" | "open" => Ok(Self::Open),
            "em_andamento" | "em andamento" | "in_progress" | "in-progress" => Ok(Self::InProgress),
            "finalizada" | "finalized" => Ok(Self::Finalized),
            "cancelada" | "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(DomainError::validation(format!(
                "unknown service order status: {other}"
            ))),
        }
    }
}

/// Whether a line bills a product or a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Product,
    Service,
}

/// One billed line of a service order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub kind: LineKind,
    /// Catalog id of the product/service, when the line references one.
    pub item_id: Option<i64>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Line total as recorded on the order.
    pub line_total: Decimal,
}

impl LineItem {
    /// Build a line whose total is `quantity * unit_price`.
    pub fn new(
        kind: LineKind,
        description: impl Into<String>,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Self {
        Self {
            kind,
            item_id: None,
            description: description.into(),
            quantity,
            unit_price,
            line_total: quantity * unit_price,
        }
    }

    pub fn product(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self::new(LineKind::Product, description, quantity, unit_price)
    }

    pub fn service(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self::new(LineKind::Service, description, quantity, unit_price)
    }
}

/// Denormalized client data copied into the emission payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub id: ClientId,
    pub name: String,
    /// CPF or CNPJ.
    pub document: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

/// A service order with everything the invoice computation reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: ServiceOrderId,
    pub company_id: CompanyId,
    pub client: ClientSnapshot,
    pub status: ServiceOrderStatus,
    /// Total recorded on the order itself (`ordens_servico.valor_total`).
    pub recorded_total: Decimal,
    pub products: Vec<LineItem>,
    pub services: Vec<LineItem>,
    /// Back-reference to the active invoice, if one was generated.
    pub invoice_id: Option<InvoiceId>,
}

impl ServiceOrder {
    pub fn is_finalized(&self) -> bool {
        self.status == ServiceOrderStatus::Finalized
    }
}

impl Entity for ServiceOrder {
    type Id = ServiceOrderId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_db_and_english_spellings() {
        assert_eq!(
            "finalizada".parse::<ServiceOrderStatus>().unwrap(),
            ServiceOrderStatus::Finalized
        );
        assert_eq!(
            "In-Progress".parse::<ServiceOrderStatus>().unwrap(),
            ServiceOrderStatus::InProgress
        );
        assert!("paused".parse::<ServiceOrderStatus>().is_err());
    }

    #[test]
    fn line_total_is_quantity_times_unit_price() {
        let line = LineItem::product("Filtro de óleo", Decimal::from(2), Decimal::from(50));
        assert_eq!(line.line_total, Decimal::from(100));
        assert_eq!(line.kind, LineKind::Product);
    }
}
