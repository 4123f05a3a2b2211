use crate::domain::{AccountStatus, Money};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Ingestion failed with: {0}")]
    Ingestion(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Insufficient funds on {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: String,
        balance: Money,
        requested: Money,
    },

    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Account {0} already exists")]
    DuplicateAccount(String),

    #[error("Account {account} is {status}")]
    AccountInactive {
        account: String,
        status: AccountStatus,
    },

    #[error("Account {account} still holds {balance}")]
    NonZeroBalance { account: String, balance: Money },

    #[error("Account {account} has {count} pending transactions")]
    PendingTransactions { account: String, count: usize },

    #[error("Source and destination are both {0}")]
    SameAccount(String),

    #[error("Reference {reference} on {account} was already used for a different movement")]
    IdempotencyConflict { account: String, reference: String },

    #[error("Currency mismatch on {account}: expected {expected}, got {got}")]
    CurrencyMismatch {
        account: String,
        expected: String,
        got: String,
    },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Money),

    #[error("Unknown bank {0}")]
    UnknownBank(String),

    #[error("Bank {bank} has insufficient capital {capital} for {requested}")]
    InsufficientCapital {
        bank: String,
        capital: Money,
        requested: Money,
    },

    #[error("Repayment of {requested} on {account} exceeds the outstanding loan {outstanding}")]
    LoanOverpayment {
        account: String,
        outstanding: Money,
        requested: Money,
    },

    #[error("Account {0} is a loan account and only moves through loan issue and repayment")]
    LoanAccount(String),

    #[error("Transfer {0} not found")]
    TransferNotFound(String),

    #[error("Transfer {0} can no longer be cancelled")]
    CancellationRejected(String),

    #[error("Remote settlement of {transfer_id} timed out after {attempts} attempts")]
    RemoteSettlementTimeout { transfer_id: String, attempts: u32 },

    #[error("Remote settlement of {transfer_id} rejected: {reason}")]
    RemoteSettlementRejected { transfer_id: String, reason: String },

    /// A ledger or capital invariant no longer holds. Never retried.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    /// Errors caused by the request itself, as opposed to remote failures or bugs.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFunds { .. }
                | Error::AccountNotFound(_)
                | Error::DuplicateAccount(_)
                | Error::AccountInactive { .. }
                | Error::NonZeroBalance { .. }
                | Error::PendingTransactions { .. }
                | Error::SameAccount(_)
                | Error::IdempotencyConflict { .. }
                | Error::CurrencyMismatch { .. }
                | Error::InvalidAmount(_)
                | Error::UnknownBank(_)
                | Error::InsufficientCapital { .. }
                | Error::LoanOverpayment { .. }
                | Error::LoanAccount(_)
                | Error::TransferNotFound(_)
                | Error::CancellationRejected(_)
        )
    }
}
