pub mod account;
pub mod capital;
pub mod error;
pub mod money;
pub mod operation;
pub mod payment;
pub mod traits;
pub mod transaction;

pub use account::{Account, AccountId, AccountStatus, AccountType, NewAccount, OverdraftPolicy};
pub use capital::BankCapital;
pub use error::Error;
pub use money::Money;
pub use operation::{Operation, OperationKind};
pub use payment::{
    InterbankTransfer, Payment, PaymentRequest, PaymentStatus, SettlementInstruction,
    SettlementReceipt, TransferPhase, TransferStatus,
};
pub use traits::{DeadLetterQueue, OperationStream, OutputRepository, PeerError, SettlementPeer};
pub use transaction::{Direction, Metadata, Transaction, TransactionStatus};
