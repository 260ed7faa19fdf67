//! Fixed-point money helpers.
//!
//! Amounts are `Decimal` in the domain and integer minor units (cents) at rest
//! and on the processor wire.

use crate::errors::ServiceError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub const MINOR_UNIT_SCALE: u32 = 2;

pub fn from_minor(minor: i64) -> Decimal {
    Decimal::new(minor, MINOR_UNIT_SCALE)
}

/// Converts to minor units, refusing amounts finer than one cent.
pub fn to_minor(amount: Decimal) -> Result<i64, ServiceError> {
    let scaled = amount * Decimal::ONE_HUNDRED;
    if scaled.fract() != Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "amount {} has more than {} decimal places",
            amount, MINOR_UNIT_SCALE
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

/// `unit × quantity`, exact.
pub fn line_subtotal(unit_price: Decimal, quantity: i32) -> Decimal {
    unit_price * Decimal::from(quantity)
}
