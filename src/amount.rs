//! Currency amounts with centavo precision.
//!
//! Amounts are stored as whole centavos so sums and averages never drift. On the
//! wire they travel as plain JSON numbers (e.g. `1500.5`), and numeric strings are
//! accepted on input the same way the payment form submitted them.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amount must be a finite number")]
    NotFinite,
    #[error("amount must not be negative")]
    Negative,
    #[error("amount is too large")]
    Overflow,
    #[error("invalid amount: {0}")]
    Parse(String),
}

/// A non-negative amount in centavos.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "AmountRepr", into = "f64")]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    /// Largest amount a single payment may carry: one billion pesos.
    pub const MAX: Amount = Amount(100_000_000_000);

    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn from_whole(pesos: u64) -> Self {
        Self(pesos * 100)
    }

    /// Convert a decimal value, rounding to the nearest centavo.
    pub fn from_decimal(value: f64) -> Result<Self, AmountError> {
        if !value.is_finite() {
            return Err(AmountError::NotFinite);
        }
        if value < 0.0 {
            return Err(AmountError::Negative);
        }
        let cents = (value * 100.0).round();
        if cents > Self::MAX.0 as f64 {
            return Err(AmountError::Overflow);
        }
        Ok(Self(cents as u64))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_decimal(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Divide evenly, rounding half up. Returns zero for a zero divisor.
    pub fn average(&self, count: usize) -> Amount {
        if count == 0 {
            return Amount::ZERO;
        }
        let count = count as u64;
        let (quotient, remainder) = (self.0 / count, self.0 % count);
        Amount(quotient + u64::from(remainder >= count - remainder))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value: f64 = trimmed
            .parse()
            .map_err(|_| AmountError::Parse(trimmed.to_string()))?;
        Self::from_decimal(value)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl From<Amount> for f64 {
    fn from(amount: Amount) -> f64 {
        amount.as_decimal()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<AmountRepr> for Amount {
    type Error = AmountError;

    fn try_from(repr: AmountRepr) -> Result<Self, Self::Error> {
        match repr {
            AmountRepr::Number(n) => Amount::from_decimal(n),
            AmountRepr::Text(s) => s.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_two_decimals() {
        assert_eq!(Amount::from_whole(1500).to_string(), "1500.00");
        assert_eq!(Amount::from_cents(5).to_string(), "0.05");
        assert_eq!(Amount::from_decimal(12.346).unwrap().to_string(), "12.35");
    }

    #[test]
    fn rejects_negative_and_nan() {
        assert_eq!(Amount::from_decimal(-1.0), Err(AmountError::Negative));
        assert_eq!(Amount::from_decimal(f64::NAN), Err(AmountError::NotFinite));
        assert!(matches!("abc".parse::<Amount>(), Err(AmountError::Parse(_))));
    }

    #[test]
    fn accepts_numbers_and_numeric_strings() {
        let a: Amount = serde_json::from_str("250.5").unwrap();
        let b: Amount = serde_json::from_str("\"250.50\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "250.5");
    }

    #[test]
    fn average_rounds_half_up_and_guards_zero() {
        assert_eq!(Amount::from_whole(300).average(2), Amount::from_whole(150));
        assert_eq!(Amount::from_cents(100).average(3), Amount::from_cents(33));
        assert_eq!(Amount::from_cents(5).average(2), Amount::from_cents(3));
        assert_eq!(Amount::from_whole(10).average(0), Amount::ZERO);
    }

    #[test]
    fn bounds_single_amounts() {
        assert_eq!(Amount::from_decimal(1_000_000_000.0), Ok(Amount::MAX));
        assert_eq!(
            Amount::from_decimal(1_000_000_000.01),
            Err(AmountError::Overflow)
        );
        assert_eq!(
            Amount::from_decimal(1.8446744073709552e17),
            Err(AmountError::Overflow)
        );
    }

    #[test]
    fn saturated_sum_still_averages() {
        let total: Amount = [Amount::from_cents(u64::MAX), Amount::from_cents(10)]
            .into_iter()
            .sum();
        assert_eq!(total, Amount::from_cents(u64::MAX));
        assert_eq!(total.average(2), Amount::from_cents(u64::MAX / 2 + 1));
        assert_eq!(total.average(1), total);
    }
}
