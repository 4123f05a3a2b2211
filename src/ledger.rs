use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::domain::{
    Account, AccountId, AccountStatus, Direction, Error, Metadata, Money, NewAccount, Transaction,
    TransactionStatus,
};

/// One account and its append-only transaction log. Everything in here changes
/// together under the account's lock.
#[derive(Debug)]
pub struct AccountBook {
    account: Account,
    entries: Vec<Transaction>,
    by_id: HashMap<String, usize>,
    by_reference: HashMap<String, usize>,
}

pub type AccountGuard = OwnedMutexGuard<AccountBook>;

impl AccountBook {
    fn new(account: Account) -> Self {
        Self {
            account,
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_reference: HashMap::new(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn balance(&self) -> Money {
        self.account.balance
    }

    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn transaction(&self, transaction_id: &str) -> Option<&Transaction> {
        self.by_id.get(transaction_id).map(|&idx| &self.entries[idx])
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .count()
    }

    pub fn credit(&mut self, amount: Money, meta: Metadata) -> Result<Transaction, Error> {
        self.post(Direction::Credit, amount, TransactionStatus::Booked, meta)
    }

    pub fn debit(&mut self, amount: Money, meta: Metadata) -> Result<Transaction, Error> {
        self.post(Direction::Debit, amount, TransactionStatus::Booked, meta)
    }

    /// Debit whose other leg is still outstanding. The funds leave the balance
    /// now; [`settle`](Self::settle) books it, [`release`](Self::release) undoes it.
    pub fn reserve(&mut self, amount: Money, meta: Metadata) -> Result<Transaction, Error> {
        self.post(Direction::Debit, amount, TransactionStatus::Pending, meta)
    }

    pub fn settle(&mut self, transaction_id: &str) -> Result<Transaction, Error> {
        let idx = self.index_of(transaction_id)?;
        let tx = &mut self.entries[idx];
        match tx.status {
            TransactionStatus::Pending => {
                tx.status = TransactionStatus::Booked;
                tx.updated_at = Utc::now();
            }
            TransactionStatus::Booked => {}
            TransactionStatus::Failed => {
                return Err(Error::InvariantViolation(format!(
                    "{} on {} was already reversed and cannot be booked",
                    transaction_id, self.account.id
                )));
            }
        }
        Ok(tx.clone())
    }

    /// Reverses a pending row, returning its amount to the balance. Releasing
    /// an already reversed row is a no-op.
    pub fn release(&mut self, transaction_id: &str) -> Result<Transaction, Error> {
        let idx = self.index_of(transaction_id)?;
        let tx = &mut self.entries[idx];
        match tx.status {
            TransactionStatus::Pending => {
                self.account.balance -= tx.amount;
                tx.status = TransactionStatus::Failed;
                tx.updated_at = Utc::now();
                tracing::debug!(account = %self.account.id, tx = %tx.transaction_id, "released pending debit");
            }
            TransactionStatus::Failed => {}
            TransactionStatus::Booked => {
                return Err(Error::InvariantViolation(format!(
                    "{} on {} is booked and cannot be released",
                    transaction_id, self.account.id
                )));
            }
        }
        Ok(tx.clone())
    }

    pub fn set_status(&mut self, status: AccountStatus) -> Result<Account, Error> {
        if self.account.status == AccountStatus::Closed {
            return Err(Error::AccountInactive {
                account: self.account.id.clone(),
                status: AccountStatus::Closed,
            });
        }
        if status == AccountStatus::Closed {
            let pending = self.pending_count();
            if pending > 0 {
                return Err(Error::PendingTransactions {
                    account: self.account.id.clone(),
                    count: pending,
                });
            }
            if self.account.balance != Money::ZERO {
                return Err(Error::NonZeroBalance {
                    account: self.account.id.clone(),
                    balance: self.account.balance,
                });
            }
        }
        self.account.status = status;
        Ok(self.account.clone())
    }

    /// Balance must equal the signed sum of every row that still counts.
    pub fn verify(&self) -> Result<(), Error> {
        let sum: Money = self.entries.iter().map(Transaction::effect).sum();
        if sum != self.account.balance {
            return Err(Error::InvariantViolation(format!(
                "{}: balance {} but ledger sums to {}",
                self.account.id, self.account.balance, sum
            )));
        }
        if self.account.balance < self.account.overdraft.floor() {
            return Err(Error::InvariantViolation(format!(
                "{}: balance {} below allowed floor",
                self.account.id, self.account.balance
            )));
        }
        Ok(())
    }

    pub(crate) fn post(
        &mut self,
        direction: Direction,
        amount: Money,
        status: TransactionStatus,
        meta: Metadata,
    ) -> Result<Transaction, Error> {
        if let Some(existing) = self.replay(direction, amount, &meta)? {
            return Ok(existing);
        }
        self.check(direction, amount, &meta)?;
        Ok(self.append(direction, amount, status, meta))
    }

    /// A movement already recorded under the same reference.
    pub(crate) fn replay(
        &self,
        direction: Direction,
        amount: Money,
        meta: &Metadata,
    ) -> Result<Option<Transaction>, Error> {
        let Some(reference) = &meta.reference else {
            return Ok(None);
        };
        let Some(&idx) = self.by_reference.get(reference) else {
            return Ok(None);
        };
        let existing = &self.entries[idx];
        if existing.direction == direction && existing.amount.as_minor().abs() == amount.as_minor() {
            tracing::debug!(account = %self.account.id, %reference, "replayed ledger movement");
            Ok(Some(existing.clone()))
        } else {
            Err(Error::IdempotencyConflict {
                account: self.account.id.clone(),
                reference: reference.clone(),
            })
        }
    }

    pub(crate) fn check(&self, direction: Direction, amount: Money, meta: &Metadata) -> Result<(), Error> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(amount));
        }
        if !self.account.is_active() {
            return Err(Error::AccountInactive {
                account: self.account.id.clone(),
                status: self.account.status,
            });
        }
        if let Some(currency) = &meta.currency {
            if *currency != self.account.currency {
                return Err(Error::CurrencyMismatch {
                    account: self.account.id.clone(),
                    expected: self.account.currency.clone(),
                    got: currency.clone(),
                });
            }
        }
        match direction {
            Direction::Debit if !self.account.can_cover(amount) => Err(Error::InsufficientFunds {
                account: self.account.id.clone(),
                balance: self.account.balance,
                requested: amount,
            }),
            Direction::Credit if self.account.balance.checked_add(amount).is_none() => Err(
                Error::InvariantViolation(format!("balance overflow on {}", self.account.id)),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn append(
        &mut self,
        direction: Direction,
        amount: Money,
        status: TransactionStatus,
        meta: Metadata,
    ) -> Transaction {
        let signed = match direction {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        };
        let now = Utc::now();
        let tx = Transaction {
            transaction_id: Transaction::new_id(),
            account_id: self.account.id.clone(),
            amount: signed,
            direction,
            status,
            currency: self.account.currency.clone(),
            reference: meta.reference,
            counterparty: meta.counterparty,
            description: meta.description,
            created_at: now,
            updated_at: now,
        };
        self.account.balance += signed;

        let idx = self.entries.len();
        self.by_id.insert(tx.transaction_id.clone(), idx);
        if let Some(reference) = &tx.reference {
            self.by_reference.insert(reference.clone(), idx);
        }
        self.entries.push(tx.clone());
        tracing::debug!(%tx, balance = %self.account.balance, "ledger movement");
        tx
    }

    fn index_of(&self, transaction_id: &str) -> Result<usize, Error> {
        self.by_id.get(transaction_id).copied().ok_or_else(|| {
            Error::InvariantViolation(format!(
                "{} has no transaction {}",
                self.account.id, transaction_id
            ))
        })
    }
}

/// Per-account balances and transaction logs. Mutations on one account are
/// serialized by that account's lock; different accounts never contend.
#[derive(Debug, Default)]
pub struct LedgerStore {
    books: RwLock<HashMap<AccountId, Arc<Mutex<AccountBook>>>>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_account(&self, new: NewAccount) -> Result<Account, Error> {
        let mut books = self.books.write().await;
        if books.contains_key(&new.id) {
            return Err(Error::DuplicateAccount(new.id));
        }
        let account = Account::open(new);
        tracing::info!(account = %account.id, client = %account.client_id, "account opened");
        books.insert(
            account.id.clone(),
            Arc::new(Mutex::new(AccountBook::new(account.clone()))),
        );
        Ok(account)
    }

    async fn book(&self, account: &str) -> Result<Arc<Mutex<AccountBook>>, Error> {
        self.books
            .read()
            .await
            .get(account)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(account.to_owned()))
    }

    /// Exclusive access to one account for composing a larger atomic unit.
    pub async fn lock(&self, account: &str) -> Result<AccountGuard, Error> {
        Ok(self.book(account).await?.lock_owned().await)
    }

    /// Locks two distinct accounts in id order and hands them back as `(first, second)`.
    pub async fn lock_pair(
        &self,
        first: &str,
        second: &str,
    ) -> Result<(AccountGuard, AccountGuard), Error> {
        if first == second {
            return Err(Error::SameAccount(first.to_owned()));
        }
        let a = self.book(first).await?;
        let b = self.book(second).await?;
        if first < second {
            let ga = a.lock_owned().await;
            let gb = b.lock_owned().await;
            Ok((ga, gb))
        } else {
            let gb = b.lock_owned().await;
            let ga = a.lock_owned().await;
            Ok((ga, gb))
        }
    }

    pub async fn credit(
        &self,
        account: &str,
        amount: Money,
        meta: Metadata,
    ) -> Result<Transaction, Error> {
        self.lock(account).await?.credit(amount, meta)
    }

    pub async fn debit(
        &self,
        account: &str,
        amount: Money,
        meta: Metadata,
    ) -> Result<Transaction, Error> {
        self.lock(account).await?.debit(amount, meta)
    }

    pub async fn reserve(
        &self,
        account: &str,
        amount: Money,
        meta: Metadata,
    ) -> Result<Transaction, Error> {
        self.lock(account).await?.reserve(amount, meta)
    }

    pub async fn settle(&self, account: &str, transaction_id: &str) -> Result<Transaction, Error> {
        self.lock(account).await?.settle(transaction_id)
    }

    pub async fn release(&self, account: &str, transaction_id: &str) -> Result<Transaction, Error> {
        self.lock(account).await?.release(transaction_id)
    }

    pub async fn get_balance(&self, account: &str) -> Result<Money, Error> {
        Ok(self.lock(account).await?.balance())
    }

    pub async fn account(&self, account: &str) -> Result<Account, Error> {
        Ok(self.lock(account).await?.account().clone())
    }

    pub async fn transactions(&self, account: &str) -> Result<Vec<Transaction>, Error> {
        Ok(self.lock(account).await?.entries().to_vec())
    }

    pub async fn set_status(&self, account: &str, status: AccountStatus) -> Result<Account, Error> {
        let updated = self.lock(account).await?.set_status(status)?;
        tracing::info!(account = %updated.id, status = %updated.status, "account status changed");
        Ok(updated)
    }

    pub async fn verify(&self, account: &str) -> Result<(), Error> {
        self.lock(account).await?.verify()
    }

    /// All accounts ordered by id.
    pub async fn accounts(&self) -> Vec<Account> {
        let books: Vec<_> = self.books.read().await.values().cloned().collect();
        let mut accounts = Vec::with_capacity(books.len());
        for book in books {
            accounts.push(book.lock().await.account().clone());
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    /// Moves funds between two accounts of this ledger. Both rows are written
    /// under both locks or neither is.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Money,
        meta: Metadata,
    ) -> Result<(Transaction, Transaction), Error> {
        let (mut source, mut destination) = self.lock_pair(from, to).await?;
        move_funds(&mut source, &mut destination, amount, meta)
    }

    /// Closes an account, first sweeping any remaining balance to `sweep_to`.
    pub async fn close(
        &self,
        account: &str,
        sweep_to: Option<&str>,
    ) -> Result<(Account, Option<(Transaction, Transaction)>), Error> {
        let Some(sweep_to) = sweep_to else {
            let closed = self.lock(account).await?.set_status(AccountStatus::Closed)?;
            tracing::info!(account = %closed.id, "account closed");
            return Ok((closed, None));
        };

        let (mut source, mut destination) = self.lock_pair(account, sweep_to).await?;
        let balance = source.balance();
        let swept = if balance.is_positive() {
            let meta = Metadata::reference(format!("close:{}", account))
                .with_description("balance transfer on account closure");
            Some(move_funds(&mut source, &mut destination, balance, meta)?)
        } else {
            None
        };
        let closed = source.set_status(AccountStatus::Closed)?;
        tracing::info!(account = %closed.id, %sweep_to, swept = %balance, "account closed");
        Ok((closed, swept))
    }
}

fn move_funds(
    source: &mut AccountBook,
    destination: &mut AccountBook,
    amount: Money,
    meta: Metadata,
) -> Result<(Transaction, Transaction), Error> {
    let debit_meta = Metadata {
        counterparty: meta
            .counterparty
            .clone()
            .or_else(|| Some(destination.account.id.clone())),
        ..meta.clone()
    };
    let credit_meta = Metadata {
        counterparty: Some(source.account.id.clone()),
        ..meta
    };

    let debit_replay = source.replay(Direction::Debit, amount, &debit_meta)?;
    let credit_replay = destination.replay(Direction::Credit, amount, &credit_meta)?;
    match (debit_replay, credit_replay) {
        (Some(debit), Some(credit)) => return Ok((debit, credit)),
        (None, None) => {}
        _ => {
            return Err(Error::InvariantViolation(format!(
                "transfer {} -> {} is only half recorded",
                source.account.id, destination.account.id
            )));
        }
    }

    source.check(Direction::Debit, amount, &debit_meta)?;
    destination.check(Direction::Credit, amount, &credit_meta)?;
    let debit = source.append(Direction::Debit, amount, TransactionStatus::Booked, debit_meta);
    let credit = destination.append(Direction::Credit, amount, TransactionStatus::Booked, credit_meta);
    Ok((debit, credit))
}
