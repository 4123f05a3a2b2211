use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use crate::bank::Bank;
use crate::domain::{
    AccountStatus, DeadLetterQueue, Error, Metadata, NewAccount, Operation, OperationKind,
    OperationStream, OutputRepository, PaymentRequest, PaymentStatus,
};
use crate::ledger::LedgerStore;

/// Feeds a batch of operations into the local bank (and into the in-process
/// peer ledgers for rows addressed to another bank), then reports the final
/// state.
pub struct Engine<I, O, D>
where
    I: OperationStream,
    O: OutputRepository,
    D: DeadLetterQueue,
{
    ingestion: I,
    output_repository: O,
    dlq: D,
    bank: Bank,
    peer_ledgers: HashMap<String, Arc<LedgerStore>>,
}

impl<I, O, D> Engine<I, O, D>
where
    I: OperationStream,
    O: OutputRepository,
    D: DeadLetterQueue,
{
    pub fn new(ingestion: I, output_repository: O, dlq: D, bank: Bank) -> Self {
        Self {
            ingestion,
            output_repository,
            dlq,
            bank,
            peer_ledgers: HashMap::new(),
        }
    }

    /// Makes rows for `bank_code` land on `ledger`, so peer accounts can be
    /// seeded from the same batch.
    pub fn with_peer_ledger(mut self, bank_code: impl Into<String>, ledger: Arc<LedgerStore>) -> Self {
        self.peer_ledgers.insert(bank_code.into(), ledger);
        self
    }

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    pub async fn process(&mut self) -> Result<(), Error> {
        let mut res = self.ingestion.stream();

        while let Some(op) = res.next().await {
            match op {
                Ok(op) => {
                    if let Err(e) = self.apply(&op).await {
                        if e.is_client_error() {
                            tracing::debug!(operation = %op, error = %e, "operation refused");
                        } else {
                            tracing::warn!(operation = %op, error = %e, "operation failed");
                        }
                        self.dlq.report(Some(&op), &e);
                    }
                }
                Err(e) => self.dlq.report(None, &e),
            }
        }

        Ok(())
    }

    async fn apply(&self, op: &Operation) -> Result<(), Error> {
        if op.bank == self.bank.code() {
            return self.apply_local(op).await;
        }
        let ledger = self
            .peer_ledgers
            .get(&op.bank)
            .ok_or_else(|| Error::UnknownBank(op.bank.clone()))?;
        self.apply_peer(ledger, op).await
    }

    async fn apply_local(&self, op: &Operation) -> Result<(), Error> {
        let bank = &self.bank;
        match &op.kind {
            OperationKind::Open {
                client,
                opening_balance,
            } => {
                bank.open_account(&op.account, client, *opening_balance).await?;
            }
            OperationKind::Deposit { amount } => {
                bank.deposit(&op.account, *amount, op.id.clone()).await?;
            }
            OperationKind::Withdrawal { amount } => {
                bank.withdraw(&op.account, *amount, op.id.clone()).await?;
            }
            OperationKind::Transfer {
                to_bank,
                to_account,
                amount,
            } => {
                let request = PaymentRequest {
                    payment_id: op
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("pay-{}", Uuid::new_v4().simple())),
                    debtor_account: op.account.clone(),
                    creditor_account: to_account.clone(),
                    creditor_bank: to_bank.clone(),
                    amount: *amount,
                    currency: bank.config().currency.clone(),
                    description: None,
                };
                let payment = bank.pay(request).await?;
                if payment.status == PaymentStatus::Rejected {
                    tracing::warn!(
                        payment_id = %payment.payment_id,
                        reason = payment.rejection_reason.as_deref().unwrap_or("unknown"),
                        "payment rejected"
                    );
                }
            }
            OperationKind::Freeze => {
                bank.freeze(&op.account).await?;
            }
            OperationKind::Unfreeze => {
                bank.unfreeze(&op.account).await?;
            }
            OperationKind::Close { sweep_to } => {
                bank.close_account(&op.account, sweep_to.as_deref()).await?;
            }
            OperationKind::Loan { amount } => {
                bank.issue_loan(&op.account, *amount, op.id.clone()).await?;
            }
            OperationKind::Repay { amount } => {
                bank.repay_loan(&op.account, *amount, op.id.clone()).await?;
            }
        }
        Ok(())
    }

    /// Peer ledgers only take account maintenance and cash movements; their
    /// payments and loans belong to the peer's own process.
    async fn apply_peer(&self, ledger: &LedgerStore, op: &Operation) -> Result<(), Error> {
        let currency = &self.bank.config().currency;
        let keyed = |kind: &str| Metadata::keyed(kind, op.id.as_deref()).with_currency(currency.clone());

        match &op.kind {
            OperationKind::Open {
                client,
                opening_balance,
            } => {
                ledger
                    .open_account(NewAccount::checking(&op.account, client, currency))
                    .await?;
                if opening_balance.is_positive() {
                    let meta = Metadata::reference(format!("open:{}", op.account))
                        .with_description("opening deposit");
                    ledger.credit(&op.account, *opening_balance, meta).await?;
                }
            }
            OperationKind::Deposit { amount } => {
                ledger.credit(&op.account, *amount, keyed("dep")).await?;
            }
            OperationKind::Withdrawal { amount } => {
                ledger.debit(&op.account, *amount, keyed("wd")).await?;
            }
            OperationKind::Freeze => {
                ledger.set_status(&op.account, AccountStatus::Frozen).await?;
            }
            OperationKind::Unfreeze => {
                ledger.set_status(&op.account, AccountStatus::Active).await?;
            }
            OperationKind::Close { sweep_to } => {
                ledger.close(&op.account, sweep_to.as_deref()).await?;
            }
            OperationKind::Transfer { .. } | OperationKind::Loan { .. } | OperationKind::Repay { .. } => {
                return Err(Error::Ingestion(format!(
                    "{} is not accepted for peer bank {}",
                    op, op.bank
                )));
            }
        }
        Ok(())
    }

    /// Reports every account (local bank first, then peers by code) and the
    /// capital table.
    pub async fn flush(&mut self) -> Result<(), Error> {
        let accounts = self.bank.accounts().await;
        self.output_repository
            .write_accounts(self.bank.code(), &accounts)?;

        let mut peers: Vec<_> = self.peer_ledgers.iter().collect();
        peers.sort_by(|a, b| a.0.cmp(b.0));
        for (code, ledger) in peers {
            let accounts = ledger.accounts().await;
            self.output_repository.write_accounts(code, &accounts)?;
        }

        let capital = self.bank.capital().snapshot().await;
        self.output_repository.write_capital(&capital)?;
        self.output_repository.flush()
    }
}
