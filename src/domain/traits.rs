use async_trait::async_trait;
use futures::Stream;

use crate::domain::{
    Account, BankCapital, Error, Operation, SettlementInstruction, SettlementReceipt,
};

pub trait OperationStream {
    type OpStream: Stream<Item = Result<Operation, Error>> + Send + Unpin + 'static;
    fn stream(&mut self) -> Self::OpStream;
}

pub trait DeadLetterQueue {
    fn report(&self, operation: Option<&Operation>, error: &Error);
}

pub trait OutputRepository {
    fn write_accounts(&mut self, bank: &str, accounts: &[Account]) -> Result<(), Error>;
    fn write_capital(&mut self, capital: &[BankCapital]) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// The peer refused the credit for good. Not retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The peer could not be reached or failed transiently.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Another bank's ledger as seen from here. Calls are idempotent on
/// `transfer_id`.
#[async_trait]
pub trait SettlementPeer: Send + Sync {
    fn bank_code(&self) -> &str;

    async fn credit(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, PeerError>;
}
