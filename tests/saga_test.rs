use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use interbank_ledger::bank::Bank;
use interbank_ledger::config::{BankConfig, PeerBank, SettlementPolicy};
use interbank_ledger::domain::{
    Error, Money, NewAccount, PaymentRequest, PaymentStatus, PeerError, SettlementInstruction,
    SettlementPeer, SettlementReceipt, TransferStatus,
};
use interbank_ledger::ledger::LedgerStore;
use interbank_ledger::peer::LocalPeer;

const SOURCE: &str = "40817810099910004312";
const DESTINATION: &str = "40817810099910001234";

fn rub(s: &str) -> Money {
    Money::from_decimal_str(s).unwrap()
}

/// Never answers within the attempt timeout.
struct SilentPeer {
    calls: AtomicU32,
}

#[async_trait]
impl SettlementPeer for SilentPeer {
    fn bank_code(&self) -> &str {
        "abank"
    }

    async fn credit(
        &self,
        _instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, PeerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err(PeerError::Unavailable("too late".into()))
    }
}

struct RefusingPeer;

#[async_trait]
impl SettlementPeer for RefusingPeer {
    fn bank_code(&self) -> &str {
        "abank"
    }

    async fn credit(
        &self,
        _instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, PeerError> {
        Err(PeerError::Rejected("account closed".into()))
    }
}

fn config() -> BankConfig {
    BankConfig {
        bank_code: "vbank".into(),
        initial_capital: rub("1000000.00"),
        peers: vec![PeerBank {
            code: "abank".into(),
            initial_capital: rub("1000000.00"),
        }],
        settlement: SettlementPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(30),
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..BankConfig::default()
    }
}

async fn bank_with(peer: Arc<dyn SettlementPeer>) -> Bank {
    let bank = Bank::new(config(), vec![peer]).await.unwrap();
    bank.open_account(SOURCE, "cli-1", rub("500000.00")).await.unwrap();
    bank
}

async fn peer_ledger() -> Arc<LedgerStore> {
    let ledger = Arc::new(LedgerStore::new());
    ledger
        .open_account(NewAccount::checking(DESTINATION, "cli-2", "RUB"))
        .await
        .unwrap();
    ledger
}

fn payment(payment_id: &str, amount: &str) -> PaymentRequest {
    PaymentRequest {
        payment_id: payment_id.into(),
        debtor_account: SOURCE.into(),
        creditor_account: DESTINATION.into(),
        creditor_bank: Some("abank".into()),
        amount: rub(amount),
        currency: "RUB".into(),
        description: Some("invoice 17".into()),
    }
}

#[tokio::test]
async fn debit_beyond_balance_is_refused() {
    let bank = bank_with(Arc::new(LocalPeer::new("abank", peer_ledger().await))).await;
    let err = bank.pay(payment("pay-1", "600000.00")).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("500000.00"));
    assert!(bank.coordinator().payment("pay-1").await.is_none());
}

#[tokio::test]
async fn remote_timeouts_compensate_the_source() {
    let peer = Arc::new(SilentPeer {
        calls: AtomicU32::new(0),
    });
    let bank = bank_with(peer.clone()).await;

    let result = bank.pay(payment("pay-1", "100000.00")).await.unwrap();
    assert_eq!(result.status, PaymentStatus::Rejected);
    assert!(result.rejection_reason.unwrap().contains("timed out"));
    assert_eq!(peer.calls.load(Ordering::SeqCst), 3);

    let transfer = bank
        .coordinator()
        .transfer(result.transfer_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    assert_eq!(transfer.attempts, 3);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("500000.00"));

    let capital = bank.capital().capital("vbank").await.unwrap();
    assert_eq!(capital.capital, rub("1000000.00"));
    bank.verify().await.unwrap();
}

#[tokio::test]
async fn successful_transfer_moves_money_and_capital() {
    let remote = peer_ledger().await;
    let bank = bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await;

    let result = bank.pay(payment("pay-1", "50000.00")).await.unwrap();
    assert_eq!(result.status, PaymentStatus::AcceptedSettlementCompleted);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("450000.00"));
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), rub("50000.00"));

    let vbank = bank.capital().capital("vbank").await.unwrap();
    let abank = bank.capital().capital("abank").await.unwrap();
    assert_eq!(vbank.total_deposits, rub("-50000.00"));
    assert_eq!(vbank.capital, rub("950000.00"));
    assert_eq!(abank.total_deposits, rub("50000.00"));
    assert_eq!(abank.capital, rub("1050000.00"));

    let transfer = bank
        .coordinator()
        .transfer(result.transfer_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert!(transfer.completed_at.is_some());
    bank.verify().await.unwrap();
}

#[tokio::test]
async fn repeated_payment_id_is_a_no_op() {
    let remote = peer_ledger().await;
    let bank = bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await;

    let first = bank.pay(payment("pay-1", "10.00")).await.unwrap();
    let second = bank.pay(payment("pay-1", "10.00")).await.unwrap();
    assert_eq!(first.transfer_id, second.transfer_id);
    assert_eq!(second.status, PaymentStatus::AcceptedSettlementCompleted);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("499990.00"));
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), rub("10.00"));
    assert_eq!(bank.coordinator().transfers().await.len(), 1);
}

#[tokio::test]
async fn rejected_credit_is_not_retried() {
    let bank = bank_with(Arc::new(RefusingPeer)).await;
    let result = bank.pay(payment("pay-1", "10.00")).await.unwrap();
    assert_eq!(result.status, PaymentStatus::Rejected);

    let transfer = bank
        .coordinator()
        .transfer(result.transfer_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.attempts, 1);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("500000.00"));
}

#[tokio::test]
async fn cancel_before_remote_leg_restores_funds() {
    let remote = peer_ledger().await;
    let bank = bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await;
    let coordinator = bank.coordinator();

    let accepted = coordinator.initiate(payment("pay-1", "1000.00")).await.unwrap();
    assert_eq!(accepted.status, PaymentStatus::AcceptedSettlementInProcess);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("499000.00"));

    let transfer_id = accepted.transfer_id.unwrap();
    let cancelled = coordinator.cancel(&transfer_id).await.unwrap();
    assert_eq!(cancelled.status, TransferStatus::Failed);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("500000.00"));

    // settling a cancelled transfer does nothing
    let settled = coordinator.settle(&transfer_id).await.unwrap();
    assert_eq!(settled.status, TransferStatus::Failed);
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), Money::ZERO);
    assert_eq!(
        coordinator.payment("pay-1").await.unwrap().status,
        PaymentStatus::Rejected
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_never_overdraw() {
    let remote = peer_ledger().await;
    let bank = Arc::new(bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let bank = bank.clone();
            tokio::spawn(async move { bank.pay(payment(&format!("pay-{}", i), "100000.00")).await })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(p) if p.status == PaymentStatus::AcceptedSettlementCompleted => completed += 1,
            Ok(p) => panic!("unexpected payment state {:?}", p.status),
            Err(Error::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    assert_eq!(completed, 5);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), Money::ZERO);
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), rub("500000.00"));
    assert_eq!(
        bank.capital().capital("vbank").await.unwrap().total_deposits,
        rub("-500000.00")
    );
    bank.verify().await.unwrap();
}

#[tokio::test]
async fn withdrawal_and_payment_ids_are_independent() {
    let remote = peer_ledger().await;
    let bank = bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await;

    bank.withdraw(SOURCE, rub("10.00"), Some("p1".into())).await.unwrap();
    let result = bank.pay(payment("p1", "10.00")).await.unwrap();
    assert_eq!(result.status, PaymentStatus::AcceptedSettlementCompleted);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("499980.00"));
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), rub("10.00"));
    bank.verify().await.unwrap();
}

#[tokio::test]
async fn frozen_source_still_settles_its_reserved_payment() {
    let remote = peer_ledger().await;
    let bank = bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await;
    let coordinator = bank.coordinator();

    let accepted = coordinator.initiate(payment("pay-1", "1000.00")).await.unwrap();
    bank.freeze(SOURCE).await.unwrap();

    let transfer = coordinator
        .settle(accepted.transfer_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("499000.00"));
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), rub("1000.00"));

    // new payments from the frozen account are refused
    assert!(matches!(
        bank.pay(payment("pay-2", "1.00")).await,
        Err(Error::AccountInactive { .. })
    ));
    bank.verify().await.unwrap();
}

#[tokio::test]
async fn frozen_source_can_still_cancel() {
    let bank = bank_with(Arc::new(LocalPeer::new("abank", peer_ledger().await))).await;
    let coordinator = bank.coordinator();

    let accepted = coordinator.initiate(payment("pay-1", "1000.00")).await.unwrap();
    bank.freeze(SOURCE).await.unwrap();

    let cancelled = coordinator
        .cancel(accepted.transfer_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(cancelled.status, TransferStatus::Failed);
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), rub("500000.00"));
}

#[tokio::test]
async fn account_with_reserved_payment_cannot_close() {
    let remote = peer_ledger().await;
    let bank = bank_with(Arc::new(LocalPeer::new("abank", remote.clone()))).await;
    let coordinator = bank.coordinator();

    let accepted = coordinator.initiate(payment("pay-1", "500000.00")).await.unwrap();
    assert_eq!(bank.get_balance(SOURCE).await.unwrap(), Money::ZERO);
    assert!(matches!(
        bank.close_account(SOURCE, None).await,
        Err(Error::PendingTransactions { count: 1, .. })
    ));

    coordinator
        .settle(accepted.transfer_id.as_deref().unwrap())
        .await
        .unwrap();
    bank.close_account(SOURCE, None).await.unwrap();
    assert_eq!(remote.get_balance(DESTINATION).await.unwrap(), rub("500000.00"));
}

#[tokio::test]
async fn loan_repayment_cannot_exceed_the_debt() {
    let bank = bank_with(Arc::new(LocalPeer::new("abank", peer_ledger().await))).await;
    bank.issue_loan(SOURCE, rub("1000.00"), Some("loan-1".into()))
        .await
        .unwrap();

    let err = bank
        .repay_loan(SOURCE, rub("1000.01"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LoanOverpayment { .. }));
    assert!(err.is_client_error());

    bank.repay_loan(SOURCE, rub("1000.00"), None).await.unwrap();
    let vbank = bank.capital().capital("vbank").await.unwrap();
    assert_eq!(vbank.total_loans, Money::ZERO);
    assert_eq!(vbank.capital, rub("1000000.00"));
    bank.verify().await.unwrap();
}
