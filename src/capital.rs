use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::domain::{BankCapital, Error, Money};

/// Running capital, deposit and loan totals for every bank we settle with.
///
/// Readers copy rows out under the read lock, so they never see one side of
/// a transfer without the other.
#[derive(Debug, Default)]
pub struct CapitalTracker {
    banks: RwLock<HashMap<String, BankCapital>>,
}

/// Exclusive handle used to change several banks in one step.
pub struct CapitalWriter<'a> {
    banks: RwLockWriteGuard<'a, HashMap<String, BankCapital>>,
}

impl CapitalWriter<'_> {
    fn row(&self, bank: &str) -> Result<&BankCapital, Error> {
        self.banks
            .get(bank)
            .ok_or_else(|| Error::UnknownBank(bank.to_owned()))
    }

    pub fn contains(&self, bank: &str) -> bool {
        self.banks.contains_key(bank)
    }

    /// Deposits move from `from_bank` to `to_bank`. Both rows change or neither.
    pub fn settle_transfer(
        &mut self,
        from_bank: &str,
        to_bank: &str,
        amount: Money,
    ) -> Result<(BankCapital, BankCapital), Error> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }
        if from_bank == to_bank {
            return Err(Error::InvariantViolation(format!(
                "interbank settlement within {}",
                from_bank
            )));
        }
        let origin = self.row(from_bank)?.adjusted(-amount, Money::ZERO)?;
        let destination = self.row(to_bank)?.adjusted(amount, Money::ZERO)?;
        self.banks.insert(from_bank.to_owned(), origin.clone());
        self.banks.insert(to_bank.to_owned(), destination.clone());
        Ok((origin, destination))
    }

    pub fn issue_loan(&mut self, bank: &str, amount: Money) -> Result<BankCapital, Error> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }
        let row = self.row(bank)?;
        if row.capital < amount {
            return Err(Error::InsufficientCapital {
                bank: bank.to_owned(),
                capital: row.capital,
                requested: amount,
            });
        }
        let next = row.adjusted(Money::ZERO, amount)?;
        self.banks.insert(bank.to_owned(), next.clone());
        Ok(next)
    }

    pub fn repay_loan(&mut self, bank: &str, amount: Money) -> Result<BankCapital, Error> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }
        let next = self.row(bank)?.adjusted(Money::ZERO, -amount)?;
        self.banks.insert(bank.to_owned(), next.clone());
        Ok(next)
    }
}

impl CapitalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bank. Registering a known bank again keeps its current row.
    pub async fn register(&self, bank: &str, initial_capital: Money) -> BankCapital {
        self.banks
            .write()
            .await
            .entry(bank.to_owned())
            .or_insert_with(|| BankCapital::new(bank, initial_capital))
            .clone()
    }

    pub async fn capital(&self, bank: &str) -> Result<BankCapital, Error> {
        self.banks
            .read()
            .await
            .get(bank)
            .cloned()
            .ok_or_else(|| Error::UnknownBank(bank.to_owned()))
    }

    /// Every bank, ordered by code, read at a single point in time.
    pub async fn snapshot(&self) -> Vec<BankCapital> {
        let mut rows: Vec<_> = self.banks.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.bank_code.cmp(&b.bank_code));
        rows
    }

    pub async fn write(&self) -> CapitalWriter<'_> {
        CapitalWriter {
            banks: self.banks.write().await,
        }
    }

    pub async fn settle_transfer(
        &self,
        from_bank: &str,
        to_bank: &str,
        amount: Money,
    ) -> Result<(BankCapital, BankCapital), Error> {
        self.write().await.settle_transfer(from_bank, to_bank, amount)
    }

    pub async fn issue_loan(&self, bank: &str, amount: Money) -> Result<BankCapital, Error> {
        self.write().await.issue_loan(bank, amount)
    }

    pub async fn repay_loan(&self, bank: &str, amount: Money) -> Result<BankCapital, Error> {
        self.write().await.repay_loan(bank, amount)
    }

    pub async fn verify(&self) -> Result<(), Error> {
        self.banks
            .read()
            .await
            .values()
            .try_for_each(BankCapital::verify)
    }
}
