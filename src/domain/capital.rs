use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Error, Money};

#[derive(Debug, Clone, Serialize)]
pub struct BankCapital {
    pub bank_code: String,
    pub initial_capital: Money,
    pub total_deposits: Money,
    pub total_loans: Money,
    pub capital: Money,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

impl BankCapital {
    pub fn new(bank_code: impl Into<String>, initial_capital: Money) -> Self {
        Self {
            bank_code: bank_code.into(),
            initial_capital,
            total_deposits: Money::ZERO,
            total_loans: Money::ZERO,
            capital: initial_capital,
            updated_at: Utc::now(),
        }
    }

    fn expected_capital(&self) -> Option<Money> {
        self.initial_capital
            .checked_add(self.total_deposits)?
            .checked_sub(self.total_loans)
    }

    /// Returns the row with deposits and loans shifted by the given deltas and
    /// capital recomputed. The receiver is left untouched.
    pub fn adjusted(&self, deposits: Money, loans: Money) -> Result<BankCapital, Error> {
        let overflow = || Error::InvariantViolation(format!("capital overflow for {}", self.bank_code));
        let mut next = self.clone();
        next.total_deposits = self.total_deposits.checked_add(deposits).ok_or_else(overflow)?;
        next.total_loans = self.total_loans.checked_add(loans).ok_or_else(overflow)?;
        next.capital = next.expected_capital().ok_or_else(overflow)?;
        if next.total_loans.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "{} would carry negative loans {}",
                self.bank_code, next.total_loans
            )));
        }
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn verify(&self) -> Result<(), Error> {
        match self.expected_capital() {
            Some(expected) if expected == self.capital => Ok(()),
            _ => Err(Error::InvariantViolation(format!(
                "{}: capital {} != {} + {} - {}",
                self.bank_code,
                self.capital,
                self.initial_capital,
                self.total_deposits,
                self.total_loans
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusted_recomputes_capital() {
        let row = BankCapital::new("vbank", Money::from_major(1_000));
        let next = row
            .adjusted(Money::from_major(-200), Money::from_major(300))
            .unwrap();
        assert_eq!(next.capital, Money::from_major(500));
        assert_eq!(row.capital, Money::from_major(1_000));
        next.verify().unwrap();
    }

    #[test]
    fn tampered_row_fails_verification() {
        let mut row = BankCapital::new("abank", Money::from_major(10));
        row.capital = Money::from_major(11);
        assert!(matches!(row.verify(), Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn loans_cannot_go_negative() {
        let row = BankCapital::new("sbank", Money::from_major(10));
        let err = row.adjusted(Money::ZERO, Money::from_major(-1)).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
