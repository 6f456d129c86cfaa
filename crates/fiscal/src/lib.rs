//! Fiscal document (nota fiscal) domain module.
//!
//! Business rules for turning a finalized service order into an invoice
//! record, implemented purely as deterministic domain logic (no IO, no HTTP,
//! no storage).

pub mod invoice;
pub mod number;
pub mod order;
pub mod payload;
pub mod summary;
pub mod tax;

pub use invoice::{
    ArtifactHandles, Cancellation, EmissionMode, EmissionStatus, HistoryEntry, HistoryStatus,
    InvoiceComputer, InvoiceFilter, InvoiceRecord, NewInvoice,
};
pub use number::InvoiceNumber;
pub use order::{ClientSnapshot, LineItem, LineKind, ServiceOrder, ServiceOrderStatus};
pub use payload::EmissionPayload;
pub use summary::render_summary_html;
pub use tax::{BasePolicy, InvoiceAmounts, TaxRates};
