use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::capital::CapitalTracker;
use crate::config::{BankConfig, SettlementPolicy};
use crate::domain::{
    Direction, Error, InterbankTransfer, Metadata, Payment, PaymentRequest, PeerError,
    SettlementInstruction, SettlementPeer, SettlementReceipt, TransactionStatus, TransferPhase,
    TransferStatus,
};
use crate::ledger::LedgerStore;

#[derive(Debug, Default)]
struct Registry {
    payments: HashMap<String, Payment>,
    transfers: HashMap<String, InterbankTransfer>,
    /// One per payment id; held while that payment is being initiated.
    gates: HashMap<String, Arc<Mutex<()>>>,
}

impl Registry {
    fn transfer_mut(&mut self, transfer_id: &str) -> Result<&mut InterbankTransfer, Error> {
        self.transfers
            .get_mut(transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_owned()))
    }

    fn halt(&mut self, transfer_id: &str, reason: &str) {
        if let Some(transfer) = self.transfers.get_mut(transfer_id) {
            transfer.halted = Some(reason.to_owned());
        }
        tracing::error!(%transfer_id, %reason, "transfer halted, manual reconciliation required");
    }
}

/// Outcome of the remote leg after retries.
struct Delivery {
    result: Result<SettlementReceipt, Error>,
    attempts: u32,
}

/// Runs payments. Same-bank payments are one ledger transfer; cross-bank
/// payments run as a saga:
///
/// 1. reserve the amount on the source account (committed, locks released),
/// 2. ask the destination bank to credit, retrying with backoff,
/// 3. on success book the debit, move capital and complete the payment in one step,
/// 4. otherwise release the reserve and reject the payment.
pub struct TransferCoordinator {
    bank_code: String,
    policy: SettlementPolicy,
    ledger: Arc<LedgerStore>,
    capital: Arc<CapitalTracker>,
    peers: HashMap<String, Arc<dyn SettlementPeer>>,
    registry: Mutex<Registry>,
}

impl TransferCoordinator {
    pub fn new(config: &BankConfig, ledger: Arc<LedgerStore>, capital: Arc<CapitalTracker>) -> Self {
        Self {
            bank_code: config.bank_code.clone(),
            policy: config.settlement,
            ledger,
            capital,
            peers: HashMap::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn with_peer(mut self, peer: Arc<dyn SettlementPeer>) -> Self {
        self.peers.insert(peer.bank_code().to_owned(), peer);
        self
    }

    pub fn bank_code(&self) -> &str {
        &self.bank_code
    }

    /// Runs a payment to its terminal state. A `payment_id` seen before
    /// returns the recorded payment and does nothing else.
    ///
    /// Local failures (funds, unknown accounts, unknown bank) come back as
    /// errors and leave no trace. Remote failures come back as a `Rejected`
    /// payment after compensation.
    pub async fn submit(&self, request: PaymentRequest) -> Result<Payment, Error> {
        let _gate = self.gate(&request.payment_id).await;
        let payment = self.initiate_gated(request).await?;
        match &payment.transfer_id {
            Some(transfer_id) if !payment.status.is_terminal() => {
                self.settle(transfer_id).await?;
                self.payment(&payment.payment_id)
                    .await
                    .ok_or_else(|| Error::InvariantViolation(format!(
                        "payment {} vanished during settlement",
                        payment.payment_id
                    )))
            }
            _ => Ok(payment),
        }
    }

    /// Step 1. Intra-bank payments complete here; interbank ones return
    /// `AcceptedSettlementInProcess` with a reserved source debit and can
    /// still be cancelled until [`settle`](Self::settle) starts the remote leg.
    pub async fn initiate(&self, request: PaymentRequest) -> Result<Payment, Error> {
        let _gate = self.gate(&request.payment_id).await;
        self.initiate_gated(request).await
    }

    /// Requests sharing a payment id queue here, so a duplicate only ever
    /// sees the outcome of the first.
    async fn gate(&self, payment_id: &str) -> OwnedMutexGuard<()> {
        let gate = self
            .registry
            .lock()
            .await
            .gates
            .entry(payment_id.to_owned())
            .or_default()
            .clone();
        gate.lock_owned().await
    }

    async fn initiate_gated(&self, request: PaymentRequest) -> Result<Payment, Error> {
        if !request.amount.is_positive() {
            return Err(Error::InvalidAmount(request.amount));
        }
        let creditor_bank = request
            .creditor_bank
            .clone()
            .unwrap_or_else(|| self.bank_code.clone());

        if let Some(existing) = self.payment(&request.payment_id).await {
            tracing::debug!(payment_id = %request.payment_id, "duplicate payment request");
            return Ok(existing);
        }

        // the payment is recorded only once its ledger rows exist
        let mut payment = Payment::accept(&request, creditor_bank.clone());
        let result = if creditor_bank == self.bank_code {
            self.book_internal(&request, &mut payment).await
        } else {
            self.reserve_interbank(&request, &creditor_bank, &mut payment).await
        };
        if let Err(e) = result {
            tracing::info!(payment_id = %request.payment_id, error = %e, "payment refused");
            return Err(e);
        }
        Ok(payment)
    }

    async fn book_internal(&self, request: &PaymentRequest, payment: &mut Payment) -> Result<(), Error> {
        let meta = self.payment_metadata(request);
        let (debit, credit) = self
            .ledger
            .transfer(&request.debtor_account, &request.creditor_account, request.amount, meta)
            .await?;
        payment.complete();
        self.registry
            .lock()
            .await
            .payments
            .insert(payment.payment_id.clone(), payment.clone());
        tracing::info!(
            payment_id = %request.payment_id,
            debit = %debit.transaction_id,
            credit = %credit.transaction_id,
            "intra-bank payment completed"
        );
        Ok(())
    }

    async fn reserve_interbank(
        &self,
        request: &PaymentRequest,
        to_bank: &str,
        payment: &mut Payment,
    ) -> Result<(), Error> {
        if !self.peers.contains_key(to_bank) {
            return Err(Error::UnknownBank(to_bank.to_owned()));
        }
        let meta = self
            .payment_metadata(request)
            .with_counterparty(format!("{}/{}", to_bank, request.creditor_account));
        let debit = self
            .ledger
            .reserve(&request.debtor_account, request.amount, meta)
            .await?;
        if debit.status != TransactionStatus::Pending {
            return Err(Error::IdempotencyConflict {
                account: request.debtor_account.clone(),
                reference: debit.reference.unwrap_or_default(),
            });
        }

        let transfer = InterbankTransfer {
            transfer_id: InterbankTransfer::new_id(),
            payment_id: request.payment_id.clone(),
            from_bank: self.bank_code.clone(),
            to_bank: to_bank.to_owned(),
            from_account: request.debtor_account.clone(),
            to_account: request.creditor_account.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: TransferStatus::Processing,
            phase: TransferPhase::Reserved,
            debit_tx: debit.transaction_id,
            attempts: 0,
            failure_reason: None,
            halted: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        tracing::info!(
            transfer_id = %transfer.transfer_id,
            payment_id = %transfer.payment_id,
            to_bank = %transfer.to_bank,
            amount = %transfer.amount,
            "source debit reserved"
        );

        payment.transfer_id = Some(transfer.transfer_id.clone());
        let mut registry = self.registry.lock().await;
        registry.payments.insert(payment.payment_id.clone(), payment.clone());
        registry.transfers.insert(transfer.transfer_id.clone(), transfer);
        Ok(())
    }

    fn payment_metadata(&self, request: &PaymentRequest) -> Metadata {
        let meta = Metadata::keyed("pay", Some(request.payment_id.as_str())).with_currency(request.currency.clone());
        match &request.description {
            Some(description) => meta.with_description(description.clone()),
            None => meta,
        }
    }

    /// Steps 2 to 4. Settling a transfer that already finished returns it unchanged.
    pub async fn settle(&self, transfer_id: &str) -> Result<InterbankTransfer, Error> {
        let (instruction, peer) = {
            let mut registry = self.registry.lock().await;
            let transfer = registry.transfer_mut(transfer_id)?;
            if let Some(reason) = &transfer.halted {
                return Err(Error::InvariantViolation(reason.clone()));
            }
            if transfer.status != TransferStatus::Processing
                || transfer.phase != TransferPhase::Reserved
            {
                return Ok(transfer.clone());
            }
            let peer = self
                .peers
                .get(&transfer.to_bank)
                .cloned()
                .ok_or_else(|| Error::UnknownBank(transfer.to_bank.clone()))?;
            transfer.phase = TransferPhase::RemoteInFlight;
            let instruction = SettlementInstruction {
                transfer_id: transfer.transfer_id.clone(),
                from_bank: transfer.from_bank.clone(),
                from_account: transfer.from_account.clone(),
                to_account: transfer.to_account.clone(),
                amount: transfer.amount,
                currency: transfer.currency.clone(),
            };
            (instruction, peer)
        };

        let delivery = self.deliver(peer.as_ref(), &instruction).await;
        {
            let mut registry = self.registry.lock().await;
            registry.transfer_mut(transfer_id)?.attempts = delivery.attempts;
        }
        match delivery.result {
            Ok(receipt) => self.complete(transfer_id, receipt).await,
            Err(e) => self.compensate(transfer_id, &e.to_string()).await,
        }
    }

    async fn deliver(&self, peer: &dyn SettlementPeer, instruction: &SettlementInstruction) -> Delivery {
        let transfer_id = &instruction.transfer_id;
        for attempt in 1..=self.policy.max_attempts {
            let reason = match tokio::time::timeout(self.policy.attempt_timeout, peer.credit(instruction)).await {
                Ok(Ok(receipt)) => {
                    return Delivery {
                        result: Ok(receipt),
                        attempts: attempt,
                    };
                }
                Ok(Err(PeerError::Rejected(reason))) => {
                    tracing::warn!(%transfer_id, %reason, "destination bank rejected credit");
                    return Delivery {
                        result: Err(Error::RemoteSettlementRejected {
                            transfer_id: transfer_id.clone(),
                            reason,
                        }),
                        attempts: attempt,
                    };
                }
                Ok(Err(PeerError::Unavailable(reason))) => reason,
                Err(_) => format!("no answer within {:?}", self.policy.attempt_timeout),
            };
            if attempt < self.policy.max_attempts {
                let delay = self.policy.backoff(attempt);
                tracing::warn!(%transfer_id, attempt, %reason, ?delay, "remote credit failed, retrying");
                tokio::time::sleep(delay).await;
            } else {
                tracing::warn!(%transfer_id, attempt, %reason, "remote credit failed, giving up");
            }
        }
        Delivery {
            result: Err(Error::RemoteSettlementTimeout {
                transfer_id: transfer_id.clone(),
                attempts: self.policy.max_attempts,
            }),
            attempts: self.policy.max_attempts,
        }
    }

    /// Books the source debit, moves capital between both banks and completes
    /// transfer and payment under one set of locks.
    async fn complete(
        &self,
        transfer_id: &str,
        receipt: SettlementReceipt,
    ) -> Result<InterbankTransfer, Error> {
        let snapshot = self.transfer(transfer_id).await?;
        let mut source = self.ledger.lock(&snapshot.from_account).await?;
        let mut capital = self.capital.write().await;
        let mut registry = self.registry.lock().await;

        // only the reservation this transfer made may be settled
        let checked = match source.transaction(&snapshot.debit_tx) {
            Some(tx)
                if tx.status == TransactionStatus::Pending
                    && tx.direction == Direction::Debit
                    && tx.amount == -snapshot.amount =>
            {
                if capital.contains(&snapshot.from_bank) && capital.contains(&snapshot.to_bank) {
                    Ok(())
                } else {
                    Err(format!(
                        "no capital row for {} or {}",
                        snapshot.from_bank, snapshot.to_bank
                    ))
                }
            }
            other => Err(format!(
                "source debit {} is {:?} after remote credit {}",
                snapshot.debit_tx,
                other.map(|tx| (tx.status, tx.amount)),
                receipt.remote_tx
            )),
        };
        let moved = checked.and_then(|()| {
            capital
                .settle_transfer(&snapshot.from_bank, &snapshot.to_bank, snapshot.amount)
                .map_err(|e| e.to_string())
        });
        if let Err(reason) = moved {
            registry.halt(transfer_id, &reason);
            return Err(Error::InvariantViolation(reason));
        }
        source.settle(&snapshot.debit_tx)?;

        let transfer = registry.transfer_mut(transfer_id)?;
        transfer.status = TransferStatus::Completed;
        transfer.phase = TransferPhase::Done;
        transfer.completed_at = Some(Utc::now());
        let transfer = transfer.clone();
        if let Some(payment) = registry.payments.get_mut(&transfer.payment_id) {
            payment.complete();
        }
        tracing::info!(
            %transfer_id,
            remote_tx = %receipt.remote_tx,
            attempts = transfer.attempts,
            "interbank transfer completed"
        );
        Ok(transfer)
    }

    /// Releases the source reserve and fails the transfer. Running it again
    /// on a failed transfer changes nothing.
    async fn compensate(&self, transfer_id: &str, reason: &str) -> Result<InterbankTransfer, Error> {
        let snapshot = self.transfer(transfer_id).await?;
        let mut source = self.ledger.lock(&snapshot.from_account).await?;
        let mut registry = self.registry.lock().await;

        let transfer = registry.transfer_mut(transfer_id)?;
        match transfer.status {
            TransferStatus::Failed => return Ok(transfer.clone()),
            TransferStatus::Completed => {
                return Err(Error::InvariantViolation(format!(
                    "{} is completed and cannot be compensated",
                    transfer_id
                )));
            }
            TransferStatus::Processing => {}
        }

        if let Err(e) = source.release(&snapshot.debit_tx) {
            registry.halt(transfer_id, &e.to_string());
            return Err(e);
        }

        let transfer = registry.transfer_mut(transfer_id)?;
        transfer.status = TransferStatus::Failed;
        transfer.phase = TransferPhase::Done;
        transfer.failure_reason = Some(reason.to_owned());
        let transfer = transfer.clone();
        if let Some(payment) = registry.payments.get_mut(&transfer.payment_id) {
            payment.reject(reason);
        }
        tracing::info!(%transfer_id, %reason, "interbank transfer failed, source restored");
        Ok(transfer)
    }

    /// Cancels a transfer whose remote leg has not started yet.
    pub async fn cancel(&self, transfer_id: &str) -> Result<InterbankTransfer, Error> {
        let snapshot = self.transfer(transfer_id).await?;
        if snapshot.status == TransferStatus::Failed {
            return Ok(snapshot);
        }
        let mut source = self.ledger.lock(&snapshot.from_account).await?;
        let mut registry = self.registry.lock().await;
        let transfer = registry.transfer_mut(transfer_id)?;
        if transfer.status != TransferStatus::Processing || transfer.phase != TransferPhase::Reserved {
            return Err(Error::CancellationRejected(transfer_id.to_owned()));
        }

        source.release(&snapshot.debit_tx)?;
        transfer.status = TransferStatus::Failed;
        transfer.phase = TransferPhase::Done;
        transfer.failure_reason = Some("cancelled".to_owned());
        let transfer = transfer.clone();
        if let Some(payment) = registry.payments.get_mut(&transfer.payment_id) {
            payment.reject("cancelled");
        }
        tracing::info!(%transfer_id, "interbank transfer cancelled");
        Ok(transfer)
    }

    pub async fn payment(&self, payment_id: &str) -> Option<Payment> {
        self.registry.lock().await.payments.get(payment_id).cloned()
    }

    pub async fn transfer(&self, transfer_id: &str) -> Result<InterbankTransfer, Error> {
        self.registry
            .lock()
            .await
            .transfers
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_owned()))
    }

    /// All transfers, oldest first.
    pub async fn transfers(&self) -> Vec<InterbankTransfer> {
        let mut transfers: Vec<_> = self.registry.lock().await.transfers.values().cloned().collect();
        transfers.sort_by_key(|t| t.created_at);
        transfers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::{Money, NewAccount, PaymentStatus};

    /// Fails the first `failures` calls as unavailable, then credits.
    struct FlakyPeer {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SettlementPeer for FlakyPeer {
        fn bank_code(&self) -> &str {
            "abank"
        }

        async fn credit(
            &self,
            instruction: &SettlementInstruction,
        ) -> Result<SettlementReceipt, PeerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PeerError::Unavailable("connection reset".into()));
            }
            Ok(SettlementReceipt {
                transfer_id: instruction.transfer_id.clone(),
                remote_tx: "tx-remote".into(),
            })
        }
    }

    fn rub(s: &str) -> Money {
        Money::from_decimal_str(s).unwrap()
    }

    async fn coordinator(failures: u32) -> (TransferCoordinator, Arc<LedgerStore>, Arc<CapitalTracker>) {
        let mut config = BankConfig::default();
        config.settlement = SettlementPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(50),
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        let ledger = Arc::new(LedgerStore::new());
        let capital = Arc::new(CapitalTracker::new());
        capital.register("vbank", rub("1000000.00")).await;
        capital.register("abank", rub("1000000.00")).await;
        ledger
            .open_account(NewAccount::checking("src", "cli-1", "RUB"))
            .await
            .unwrap();
        ledger
            .credit("src", rub("500000.00"), Metadata::reference("seed"))
            .await
            .unwrap();
        let peer = Arc::new(FlakyPeer {
            failures,
            calls: AtomicU32::new(0),
        });
        let coordinator =
            TransferCoordinator::new(&config, ledger.clone(), capital.clone()).with_peer(peer);
        (coordinator, ledger, capital)
    }

    fn request(payment_id: &str, amount: &str) -> PaymentRequest {
        PaymentRequest {
            payment_id: payment_id.into(),
            debtor_account: "src".into(),
            creditor_account: "dst".into(),
            creditor_bank: Some("abank".into()),
            amount: rub(amount),
            currency: "RUB".into(),
            description: None,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (coordinator, ledger, _) = coordinator(2).await;
        let payment = coordinator.submit(request("pay-1", "10.00")).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::AcceptedSettlementCompleted);
        let transfer = coordinator
            .transfer(payment.transfer_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(transfer.attempts, 3);
        assert_eq!(ledger.get_balance("src").await.unwrap(), rub("499990.00"));
    }

    #[tokio::test]
    async fn compensation_runs_once() {
        let (coordinator, ledger, _) = coordinator(0).await;
        let payment = coordinator.initiate(request("pay-2", "100.00")).await.unwrap();
        let transfer_id = payment.transfer_id.unwrap();
        assert_eq!(ledger.get_balance("src").await.unwrap(), rub("499900.00"));

        coordinator.compensate(&transfer_id, "test").await.unwrap();
        coordinator.compensate(&transfer_id, "test").await.unwrap();
        assert_eq!(ledger.get_balance("src").await.unwrap(), rub("500000.00"));
        ledger.verify("src").await.unwrap();
        assert_eq!(
            coordinator.payment("pay-2").await.unwrap().status,
            PaymentStatus::Rejected
        );
    }

    #[tokio::test]
    async fn completed_transfer_is_not_compensated() {
        let (coordinator, _, capital) = coordinator(0).await;
        let payment = coordinator.submit(request("pay-3", "1.00")).await.unwrap();
        let transfer_id = payment.transfer_id.unwrap();
        assert!(matches!(
            coordinator.compensate(&transfer_id, "late").await,
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            coordinator.cancel(&transfer_id).await,
            Err(Error::CancellationRejected(_))
        ));
        capital.verify().await.unwrap();
    }

    #[tokio::test]
    async fn settling_a_released_reservation_halts_the_transfer() {
        let (coordinator, ledger, capital) = coordinator(0).await;
        let payment = coordinator.initiate(request("pay-4", "100.00")).await.unwrap();
        let transfer_id = payment.transfer_id.unwrap();
        let debit_tx = coordinator.transfer(&transfer_id).await.unwrap().debit_tx;
        ledger.release("src", &debit_tx).await.unwrap();

        assert!(matches!(
            coordinator.settle(&transfer_id).await,
            Err(Error::InvariantViolation(_))
        ));
        let transfer = coordinator.transfer(&transfer_id).await.unwrap();
        assert!(transfer.halted.is_some());
        assert_eq!(transfer.status, TransferStatus::Processing);
        assert_eq!(
            capital.capital("vbank").await.unwrap().total_deposits,
            Money::ZERO
        );

        // a halted transfer stays put until reconciled by hand
        assert!(matches!(
            coordinator.settle(&transfer_id).await,
            Err(Error::InvariantViolation(_))
        ));
        assert_eq!(ledger.get_balance("src").await.unwrap(), rub("500000.00"));
        assert_eq!(
            coordinator.payment("pay-4").await.unwrap().status,
            PaymentStatus::AcceptedSettlementInProcess
        );
    }

    #[tokio::test]
    async fn duplicate_initiations_share_one_reservation() {
        let (coordinator, ledger, _) = coordinator(0).await;
        let (first, second) = tokio::join!(
            coordinator.initiate(request("pay-5", "100.00")),
            coordinator.initiate(request("pay-5", "100.00")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.transfer_id.is_some());
        assert_eq!(first.transfer_id, second.transfer_id);
        assert_eq!(coordinator.transfers().await.len(), 1);
        assert_eq!(ledger.get_balance("src").await.unwrap(), rub("499900.00"));
    }

    #[tokio::test]
    async fn refused_duplicates_leave_no_payment_behind() {
        let (coordinator, ledger, _) = coordinator(0).await;
        let (first, second) = tokio::join!(
            coordinator.submit(request("pay-6", "600000.00")),
            coordinator.submit(request("pay-6", "600000.00")),
        );
        assert!(matches!(first, Err(Error::InsufficientFunds { .. })));
        assert!(matches!(second, Err(Error::InsufficientFunds { .. })));
        assert!(coordinator.payment("pay-6").await.is_none());
        assert!(coordinator.transfers().await.is_empty());

        // the id is still free once the account can pay
        ledger
            .credit("src", rub("100000.00"), Metadata::reference("top-up"))
            .await
            .unwrap();
        let payment = coordinator.submit(request("pay-6", "600000.00")).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::AcceptedSettlementCompleted);
    }
}
