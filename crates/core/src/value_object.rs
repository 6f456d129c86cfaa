//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects carry no identity and are never mutated in place: tax rates,
/// computed amounts and invoice numbers are compared purely by their values.
/// Two `InvoiceAmounts` with the same figures are the same amounts.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
