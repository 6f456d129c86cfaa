//! Domain error model.

use thiserror::Error;

use crate::id::{InvoiceId, ServiceOrderId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. These are surfaced to the caller
/// immediately and are never retried; infrastructure failures live in the
/// infra crate's own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The service order is not in the `finalized` state.
    #[error("service order {order_id} is not finalized (status: {status})")]
    NotFinalized {
        order_id: ServiceOrderId,
        status: String,
    },

    /// A non-canceled invoice already references the service order.
    #[error("service order {order_id} already has invoice {invoice_id}")]
    DuplicateInvoice {
        order_id: ServiceOrderId,
        invoice_id: InvoiceId,
    },

    /// The invoice has already been canceled; cancellation is one-way.
    #[error("invoice {0} is already canceled")]
    AlreadyCanceled(InvoiceId),

    /// A value failed validation (e.g. blank cancellation reason).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. amount overflow).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A requested resource was not found.
    #[error("{0} not found")]
    NotFound(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
