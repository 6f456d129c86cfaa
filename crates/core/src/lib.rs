//! Shared building blocks for the fiscal pipeline.
//!
//! Pure types only: identifiers, marker traits and the domain error taxonomy.

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ClientId, CompanyId, DeadLetterId, InvoiceId, JobId, ServiceOrderId};
pub use value_object::ValueObject;
