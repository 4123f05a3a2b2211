use chrono::{DateTime, Utc};

use crate::domain::{AccountId, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    AcceptedSettlementInProcess,
    AcceptedSettlementCompleted,
    Rejected,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::AcceptedSettlementInProcess)
    }
}

impl core::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What a caller asks for. `payment_id` doubles as the idempotency key.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment_id: String,
    pub debtor_account: AccountId,
    pub creditor_account: AccountId,
    /// `None` or the local bank code means an intra-bank payment.
    pub creditor_bank: Option<String>,
    pub amount: Money,
    pub currency: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Payment {
    pub payment_id: String,
    pub debtor_account: AccountId,
    pub creditor_account: AccountId,
    pub creditor_bank: String,
    pub amount: Money,
    pub currency: String,
    pub description: Option<String>,
    pub status: PaymentStatus,
    pub rejection_reason: Option<String>,
    /// Set for cross-bank payments.
    pub transfer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn accept(request: &PaymentRequest, creditor_bank: String) -> Self {
        let now = Utc::now();
        Self {
            payment_id: request.payment_id.clone(),
            debtor_account: request.debtor_account.clone(),
            creditor_account: request.creditor_account.clone(),
            creditor_bank,
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
            status: PaymentStatus::AcceptedSettlementInProcess,
            rejection_reason: None,
            transfer_id: None,
            created_at: now,
            status_updated_at: now,
        }
    }

    pub fn complete(&mut self) {
        self.status = PaymentStatus::AcceptedSettlementCompleted;
        self.status_updated_at = Utc::now();
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.status = PaymentStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        self.status_updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Processing,
    Completed,
    Failed,
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a processing transfer is in its saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Source debited, remote leg not started. Cancellable.
    Reserved,
    /// Remote credit requested.
    RemoteInFlight,
    /// Terminal.
    Done,
}

#[derive(Debug, Clone)]
pub struct InterbankTransfer {
    pub transfer_id: String,
    pub payment_id: String,
    pub from_bank: String,
    pub to_bank: String,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Money,
    pub currency: String,
    pub status: TransferStatus,
    pub phase: TransferPhase,
    /// Pending debit on the source account.
    pub debit_tx: String,
    pub attempts: u32,
    pub failure_reason: Option<String>,
    /// Set on invariant violation. The transfer stays `processing` until reconciled by hand.
    pub halted: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InterbankTransfer {
    pub fn new_id() -> String {
        format!("tr-{}", uuid::Uuid::new_v4().simple())
    }
}

/// Credit instruction sent to the destination bank. Replays with the same
/// `transfer_id` must not credit twice.
#[derive(Debug, Clone)]
pub struct SettlementInstruction {
    pub transfer_id: String,
    pub from_bank: String,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Money,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct SettlementReceipt {
    pub transfer_id: String,
    /// Credit row id on the destination ledger.
    pub remote_tx: String,
}
