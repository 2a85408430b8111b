//! Checked [`Decimal`] arithmetic for handler amounts.
//!
//! An amount outside the decimal range is a data inconsistency and surfaces
//! as [`HandlerError::Overflow`].

use rust_decimal::Decimal;

use super::HandlerError;

pub fn add(lhs: Decimal, rhs: Decimal, what: &'static str) -> Result<Decimal, HandlerError> {
    lhs.checked_add(rhs).ok_or(HandlerError::Overflow { what })
}

pub fn sub(lhs: Decimal, rhs: Decimal, what: &'static str) -> Result<Decimal, HandlerError> {
    lhs.checked_sub(rhs).ok_or(HandlerError::Overflow { what })
}

pub fn mul(lhs: Decimal, rhs: Decimal, what: &'static str) -> Result<Decimal, HandlerError> {
    lhs.checked_mul(rhs).ok_or(HandlerError::Overflow { what })
}

/// Division by zero is reported as an overflow as well.
pub fn div(lhs: Decimal, rhs: Decimal, what: &'static str) -> Result<Decimal, HandlerError> {
    lhs.checked_div(rhs).ok_or(HandlerError::Overflow { what })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_arithmetic() {
        assert_eq!(add(Decimal::ONE, Decimal::TWO, "sum").unwrap(), Decimal::from(3));
        assert_eq!(sub(Decimal::ONE, Decimal::TWO, "diff").unwrap(), Decimal::NEGATIVE_ONE);
        assert_eq!(mul(Decimal::TWO, Decimal::TEN, "product").unwrap(), Decimal::from(20));
        assert_eq!(div(Decimal::TEN, Decimal::TWO, "ratio").unwrap(), Decimal::from(5));
    }

    #[test]
    fn test_out_of_range_is_overflow() {
        let huge = Decimal::from_i128_with_scale(10i128.pow(20), 0);
        assert!(matches!(
            mul(huge, huge, "quote amount"),
            Err(HandlerError::Overflow { what: "quote amount" })
        ));
        assert!(matches!(
            add(Decimal::MAX, Decimal::ONE, "volume"),
            Err(HandlerError::Overflow { .. })
        ));
        assert!(matches!(
            sub(Decimal::MIN, Decimal::ONE, "balance"),
            Err(HandlerError::Overflow { .. })
        ));
        assert!(matches!(
            div(Decimal::ONE, Decimal::ZERO, "entry price"),
            Err(HandlerError::Overflow { .. })
        ));
    }
}
