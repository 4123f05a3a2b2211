use std::sync::Arc;

use crate::capital::CapitalTracker;
use crate::config::BankConfig;
use crate::coordinator::TransferCoordinator;
use crate::domain::{
    Account, AccountStatus, Direction, Error, Metadata, Money, NewAccount, Payment,
    PaymentRequest, SettlementPeer, Transaction, TransactionStatus,
};
use crate::ledger::LedgerStore;

/// Id of the account holding the outstanding loan of `account`.
pub fn loan_account_id(account: &str) -> String {
    format!("loan:{}", account)
}

/// One bank: its ledger, the capital book it shares with its peers, and the
/// coordinator that moves money out of it.
pub struct Bank {
    config: BankConfig,
    ledger: Arc<LedgerStore>,
    capital: Arc<CapitalTracker>,
    coordinator: TransferCoordinator,
}

impl Bank {
    /// Every peer handed in must be listed in `config.peers`, which is where
    /// its starting capital comes from.
    pub async fn new(
        config: BankConfig,
        peers: Vec<Arc<dyn SettlementPeer>>,
    ) -> Result<Self, Error> {
        let ledger = Arc::new(LedgerStore::new());
        let capital = Arc::new(CapitalTracker::new());
        capital.register(&config.bank_code, config.initial_capital).await;
        for peer in &config.peers {
            capital.register(&peer.code, peer.initial_capital).await;
        }

        let mut coordinator = TransferCoordinator::new(&config, ledger.clone(), capital.clone());
        for peer in peers {
            if !config.peers.iter().any(|p| p.code == peer.bank_code()) {
                return Err(Error::Config(format!(
                    "peer {} is missing from PEER_BANKS",
                    peer.bank_code()
                )));
            }
            coordinator = coordinator.with_peer(peer);
        }
        tracing::info!(bank = %config.bank_code, name = %config.bank_name, "bank ready");

        Ok(Self {
            config,
            ledger,
            capital,
            coordinator,
        })
    }

    pub fn code(&self) -> &str {
        &self.config.bank_code
    }

    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    pub fn capital(&self) -> &Arc<CapitalTracker> {
        &self.capital
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    /// Onboards a checking account, optionally funded with an opening deposit.
    pub async fn open_account(
        &self,
        account: &str,
        client: &str,
        opening_balance: Money,
    ) -> Result<Account, Error> {
        let new = NewAccount::checking(account, client, &self.config.currency)
            .with_overdraft(self.config.overdraft);
        let opened = self.ledger.open_account(new).await?;
        if opening_balance.is_positive() {
            let meta = Metadata::reference(format!("open:{}", account))
                .with_description("opening deposit");
            self.ledger.credit(account, opening_balance, meta).await?;
            return self.ledger.account(account).await;
        }
        Ok(opened)
    }

    /// Loan accounts only change through [`issue_loan`](Self::issue_loan)
    /// and [`repay_loan`](Self::repay_loan).
    async fn regular_account(&self, account: &str) -> Result<(), Error> {
        if self.ledger.account(account).await?.is_loan() {
            return Err(Error::LoanAccount(account.to_owned()));
        }
        Ok(())
    }

    pub async fn deposit(
        &self,
        account: &str,
        amount: Money,
        reference: Option<String>,
    ) -> Result<Transaction, Error> {
        self.regular_account(account).await?;
        let meta = Metadata::keyed("dep", reference.as_deref())
            .with_currency(self.config.currency.clone());
        self.ledger.credit(account, amount, meta).await
    }

    pub async fn withdraw(
        &self,
        account: &str,
        amount: Money,
        reference: Option<String>,
    ) -> Result<Transaction, Error> {
        self.regular_account(account).await?;
        let meta = Metadata::keyed("wd", reference.as_deref())
            .with_currency(self.config.currency.clone());
        self.ledger.debit(account, amount, meta).await
    }

    pub async fn freeze(&self, account: &str) -> Result<Account, Error> {
        self.ledger.set_status(account, AccountStatus::Frozen).await
    }

    pub async fn unfreeze(&self, account: &str) -> Result<Account, Error> {
        self.ledger.set_status(account, AccountStatus::Active).await
    }

    pub async fn close_account(&self, account: &str, sweep_to: Option<&str>) -> Result<Account, Error> {
        self.regular_account(account).await?;
        if let Some(target) = sweep_to {
            self.regular_account(target).await?;
        }
        let (closed, _) = self.ledger.close(account, sweep_to).await?;
        Ok(closed)
    }

    pub async fn pay(&self, request: PaymentRequest) -> Result<Payment, Error> {
        self.regular_account(&request.debtor_account).await?;
        let local = request
            .creditor_bank
            .as_deref()
            .is_none_or(|bank| bank == self.code());
        if local {
            self.regular_account(&request.creditor_account).await?;
        }
        self.coordinator.submit(request).await
    }

    /// Disburses a loan onto `account`. The borrower's credit, the debt on its
    /// loan account and the bank's loan total change together.
    pub async fn issue_loan(
        &self,
        account: &str,
        amount: Money,
        reference: Option<String>,
    ) -> Result<Transaction, Error> {
        let borrower = self.ledger.account(account).await?;
        if borrower.is_loan() {
            return Err(Error::LoanAccount(account.to_owned()));
        }
        let loan_id = loan_account_id(account);
        let new = NewAccount::loan(&loan_id, &borrower.client_id, &borrower.currency);
        match self.ledger.open_account(new).await {
            Ok(_) => tracing::info!(%account, loan_account = %loan_id, "loan account opened"),
            Err(Error::DuplicateAccount(_)) => {}
            Err(e) => return Err(e),
        }
        let meta = Metadata::keyed("loan", reference.as_deref()).with_description("loan disbursement");
        self.loan_movement(account, &loan_id, amount, meta, Direction::Credit)
            .await
    }

    /// Repays part of the loan of `account`, never more than is outstanding.
    pub async fn repay_loan(
        &self,
        account: &str,
        amount: Money,
        reference: Option<String>,
    ) -> Result<Transaction, Error> {
        let meta = Metadata::keyed("repay", reference.as_deref()).with_description("loan repayment");
        self.loan_movement(account, &loan_account_id(account), amount, meta, Direction::Debit)
            .await
    }

    async fn loan_movement(
        &self,
        account: &str,
        loan_id: &str,
        amount: Money,
        meta: Metadata,
        direction: Direction,
    ) -> Result<Transaction, Error> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }
        let meta = meta.with_currency(self.config.currency.clone());

        let (mut book, mut loan) = match self.ledger.lock_pair(account, loan_id).await {
            Ok(pair) => pair,
            Err(Error::AccountNotFound(missing)) if missing == loan_id => {
                return Err(Error::LoanOverpayment {
                    account: account.to_owned(),
                    outstanding: Money::ZERO,
                    requested: amount,
                });
            }
            Err(e) => return Err(e),
        };
        if book.account().is_loan() {
            return Err(Error::LoanAccount(account.to_owned()));
        }
        if !loan.account().is_loan() {
            return Err(Error::DuplicateAccount(loan_id.to_owned()));
        }

        if let Some(existing) = book.replay(direction, amount, &meta)? {
            return Ok(existing);
        }
        book.check(direction, amount, &meta)?;
        if direction == Direction::Debit && loan.balance() < amount {
            return Err(Error::LoanOverpayment {
                account: account.to_owned(),
                outstanding: loan.balance(),
                requested: amount,
            });
        }
        let loan_meta = Metadata {
            counterparty: Some(account.to_owned()),
            ..meta.clone()
        };
        loan.check(direction, amount, &loan_meta)?;

        let mut capital = self.capital.write().await;
        let row = match direction {
            Direction::Credit => capital.issue_loan(self.code(), amount)?,
            Direction::Debit => capital.repay_loan(self.code(), amount)?,
        };
        let tx = book.append(direction, amount, TransactionStatus::Booked, meta);
        loan.append(direction, amount, TransactionStatus::Booked, loan_meta);
        tracing::info!(
            %account,
            amount = %amount,
            outstanding = %loan.balance(),
            total_loans = %row.total_loans,
            capital = %row.capital,
            "{}",
            tx.description.as_deref().unwrap_or("loan movement")
        );
        Ok(tx)
    }

    pub async fn get_balance(&self, account: &str) -> Result<Money, Error> {
        self.ledger.get_balance(account).await
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.ledger.accounts().await
    }

    /// Checks every account log against its balance, every capital row, and
    /// that the loan accounts add up to the bank's loan total.
    pub async fn verify(&self) -> Result<(), Error> {
        let accounts = self.ledger.accounts().await;
        for account in &accounts {
            self.ledger.verify(&account.id).await?;
        }
        self.capital.verify().await?;

        let outstanding: Money = accounts
            .iter()
            .filter(|account| account.is_loan())
            .map(|account| account.balance)
            .sum();
        let own = self.capital.capital(self.code()).await?;
        if outstanding != own.total_loans {
            return Err(Error::InvariantViolation(format!(
                "loan accounts hold {} but {} carries {} in loans",
                outstanding,
                self.code(),
                own.total_loans
            )));
        }
        Ok(())
    }
}
