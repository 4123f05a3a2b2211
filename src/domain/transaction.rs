use chrono::{DateTime, Utc};

use crate::domain::{AccountId, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Applied to the balance, awaiting settlement of the other leg.
    Pending,
    /// Final. Amount and account never change again.
    Booked,
    /// Reversed; no longer counted in the balance.
    Failed,
}

/// Caller-supplied details attached to a ledger movement.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Idempotency key, unique per account.
    pub reference: Option<String>,
    pub counterparty: Option<String>,
    pub description: Option<String>,
    /// Currency the caller expects the account to hold.
    pub currency: Option<String>,
}

impl Metadata {
    pub fn reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Default::default()
        }
    }

    /// Caller ids from different kinds of movement share one account, so each
    /// kind gets its own prefix (`dep:`, `wd:`, `pay:`, ...).
    pub fn keyed(kind: &str, id: Option<&str>) -> Self {
        Self {
            reference: id.map(|id| format!("{}:{}", kind, id)),
            ..Default::default()
        }
    }

    pub fn with_counterparty(mut self, counterparty: impl Into<String>) -> Self {
        self.counterparty = Some(counterparty.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: AccountId,
    /// Signed: positive for credits, negative for debits.
    pub amount: Money,
    pub direction: Direction,
    pub status: TransactionStatus,
    pub currency: String,
    pub reference: Option<String>,
    pub counterparty: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new_id() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("tx-{}", &id[..12])
    }

    /// Contribution to the account balance.
    pub fn effect(&self) -> Money {
        match self.status {
            TransactionStatus::Failed => Money::ZERO,
            TransactionStatus::Pending | TransactionStatus::Booked => self.amount,
        }
    }
}

impl core::fmt::Display for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:?},account={},tx={},amount={},status={:?}",
            self.direction, self.account_id, self.transaction_id, self.amount, self.status
        )
    }
}
