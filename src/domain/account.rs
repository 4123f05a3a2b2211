use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::Money;

pub type AccountId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

impl core::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountType {
    #[default]
    Checking,
    /// Balance is the debt its owner still has to repay.
    Loan,
}

/// How far below zero a debit may take the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverdraftPolicy {
    #[default]
    None,
    Limit(Money),
}

impl OverdraftPolicy {
    /// A zero limit means no overdraft at all.
    pub fn up_to(limit: Money) -> Self {
        if limit.is_positive() {
            OverdraftPolicy::Limit(limit)
        } else {
            OverdraftPolicy::None
        }
    }

    pub fn floor(&self) -> Money {
        match self {
            OverdraftPolicy::None => Money::ZERO,
            OverdraftPolicy::Limit(limit) => -*limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: AccountId,
    pub client_id: String,
    pub currency: String,
    pub account_type: AccountType,
    pub overdraft: OverdraftPolicy,
}

impl NewAccount {
    pub fn checking(id: impl Into<String>, client_id: impl Into<String>, currency: &str) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            currency: currency.to_owned(),
            account_type: AccountType::Checking,
            overdraft: OverdraftPolicy::None,
        }
    }

    /// The account a borrower's outstanding debt is booked on.
    pub fn loan(id: impl Into<String>, client_id: impl Into<String>, currency: &str) -> Self {
        Self {
            account_type: AccountType::Loan,
            ..Self::checking(id, client_id, currency)
        }
    }

    pub fn with_overdraft(mut self, overdraft: OverdraftPolicy) -> Self {
        self.overdraft = overdraft;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub client_id: String,
    pub currency: String,
    pub account_type: AccountType,
    pub balance: Money,
    pub status: AccountStatus,
    pub overdraft: OverdraftPolicy,
    pub opened_at: DateTime<Utc>,
}

impl Account {
    pub fn open(new: NewAccount) -> Self {
        Self {
            id: new.id,
            client_id: new.client_id,
            currency: new.currency,
            account_type: new.account_type,
            balance: Money::ZERO,
            status: AccountStatus::Active,
            overdraft: new.overdraft,
            opened_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn is_loan(&self) -> bool {
        self.account_type == AccountType::Loan
    }

    /// Whether the balance may absorb a debit of `amount`.
    pub fn can_cover(&self, amount: Money) -> bool {
        match self.balance.checked_sub(amount) {
            Some(after) => after >= self.overdraft.floor(),
            None => false,
        }
    }
}
