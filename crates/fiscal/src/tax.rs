//! Fixed-percentage tax model.
//!
//! Four taxes are levied on every invoice:
//!
//! | Tax    | Rate  | Levied on          |
//! |--------|-------|--------------------|
//! | ICMS   | 18%   | full base          |
//! | ISS    | 5%    | services subtotal  |
//! | PIS    | 1.65% | full base          |
//! | COFINS | 7.6%  | full base          |
//!
//! Each tax is rounded to cents (half away from zero) before summing.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use shopdesk_core::{DomainError, DomainResult, ValueObject};

use crate::order::ServiceOrder;

/// Decimal places kept on every persisted amount.
pub const AMOUNT_SCALE: u32 = 2;

/// Round an amount to cents.
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Tax rates as fractions (0.18 = 18%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRates {
    pub icms: Decimal,
    pub iss: Decimal,
    pub pis: Decimal,
    pub cofins: Decimal,
}

impl Default for TaxRates {
    fn default() -> Self {
        Self {
            icms: Decimal::new(18, 2),
            iss: Decimal::new(5, 2),
            pis: Decimal::new(165, 4),
            cofins: Decimal::new(76, 3),
        }
    }
}

impl ValueObject for TaxRates {}

/// What to bill when an order has no product or service lines with value.
///
/// `FallbackToOrderTotal` taxes the order's recorded total instead, which
/// changes the tax base materially; `Strict` keeps a zero base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasePolicy {
    #[default]
    FallbackToOrderTotal,
    Strict,
}

/// Computed invoice amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceAmounts {
    pub products: Decimal,
    pub services: Decimal,
    pub base: Decimal,
    pub icms: Decimal,
    pub iss: Decimal,
    pub pis: Decimal,
    pub cofins: Decimal,
    pub total_taxes: Decimal,
    pub total: Decimal,
}

impl ValueObject for InvoiceAmounts {}

impl InvoiceAmounts {
    /// Compute amounts for an order's line items.
    pub fn compute(
        order: &ServiceOrder,
        rates: &TaxRates,
        policy: BasePolicy,
    ) -> DomainResult<Self> {
        let products = sum_lines(order.products.iter().map(|l| l.line_total))?;
        let services = sum_lines(order.services.iter().map(|l| l.line_total))?;

        let mut base = checked_add(products, services)?;
        if base.is_zero() && policy == BasePolicy::FallbackToOrderTotal {
            if order.recorded_total.is_sign_negative() {
                return Err(DomainError::validation("order total must not be negative"));
            }
            base = round_amount(order.recorded_total);
        }

        let icms = tax(rates.icms, base)?;
        let iss = tax(rates.iss, services)?;
        let pis = tax(rates.pis, base)?;
        let cofins = tax(rates.cofins, base)?;
        let total_taxes = [iss, pis, cofins]
            .into_iter()
            .try_fold(icms, checked_add)?;
        let total = checked_add(base, total_taxes)?;

        Ok(Self {
            products,
            services,
            base,
            icms,
            iss,
            pis,
            cofins,
            total_taxes,
            total,
        })
    }
}

fn sum_lines(totals: impl Iterator<Item = Decimal>) -> DomainResult<Decimal> {
    let mut sum = Decimal::ZERO;
    for total in totals {
        if total.is_sign_negative() && !total.is_zero() {
            return Err(DomainError::validation("line total must not be negative"));
        }
        sum = checked_add(sum, total)?;
    }
    Ok(round_amount(sum))
}

fn tax(rate: Decimal, amount: Decimal) -> DomainResult<Decimal> {
    rate.checked_mul(amount)
        .map(round_amount)
        .ok_or_else(|| DomainError::invariant("tax amount overflow"))
}

fn checked_add(a: Decimal, b: Decimal) -> DomainResult<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| DomainError::invariant("invoice amount overflow"))
}
