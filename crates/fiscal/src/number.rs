//! Sequential, zero-padded invoice numbers.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use shopdesk_core::{DomainError, ValueObject};

/// Minimum width of a formatted invoice number.
pub const NUMBER_WIDTH: usize = 6;

/// Human-readable invoice number, e.g. `000001`.
///
/// Ordering follows the numeric sequence, so `1000000` sorts after `999999`
/// even though the padded width grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InvoiceNumber(u64);

impl InvoiceNumber {
    pub fn first() -> Self {
        Self(1)
    }

    pub fn from_sequence(sequence: u64) -> Result<Self, DomainError> {
        if sequence == 0 {
            return Err(DomainError::validation("invoice number must start at 1"));
        }
        Ok(Self(sequence))
    }

    /// Next number after the current highest one (`None` on an empty table).
    pub fn next_after(highest: Option<InvoiceNumber>) -> Result<Self, DomainError> {
        match highest {
            None => Ok(Self::first()),
            Some(n) => n
                .0
                .checked_add(1)
                .map(Self)
                .ok_or_else(|| DomainError::invariant("invoice number sequence exhausted")),
        }
    }

    pub fn sequence(self) -> u64 {
        self.0
    }
}

impl ValueObject for InvoiceNumber {}

impl core::fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:0width$}", self.0, width = NUMBER_WIDTH)
    }
}

impl FromStr for InvoiceNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "invalid invoice number: {s:?}"
            )));
        }
        let value = trimmed
            .parse::<u64>()
            .map_err(|e| DomainError::validation(format!("invalid invoice number {s:?}: {e}")))?;
        Self::from_sequence(value)
    }
}

impl From<InvoiceNumber> for String {
    fn from(value: InvoiceNumber) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for InvoiceNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
