use crate::domain::Money;

/// One instruction from the batch input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Open { client: String, opening_balance: Money },
    Deposit { amount: Money },
    Withdrawal { amount: Money },
    Transfer { to_bank: Option<String>, to_account: String, amount: Money },
    Freeze,
    Unfreeze,
    Close { sweep_to: Option<String> },
    Loan { amount: Money },
    Repay { amount: Money },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub bank: String,
    pub account: String,
    /// Idempotency key for money movements; payment id for transfers.
    pub id: Option<String>,
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?},bank={},account={}", self.kind, self.bank, self.account)?;
        if let Some(id) = &self.id {
            write!(f, ",id={}", id)?;
        }
        Ok(())
    }
}
