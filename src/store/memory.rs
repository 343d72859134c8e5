//! In-Memory Ledger Store
//!
//! Process-local tables with the same observable semantics as the PostgreSQL
//! backend at read-committed isolation:
//!
//! - writes inside a transaction are staged and become visible to other
//!   transactions only on commit
//! - balance writes take a per-row lock held until commit or rollback
//! - foreign keys and `CHECK (amount > 0)` on transfers are enforced
//! - id sequences are never rolled back, so aborted transactions leave gaps
//!
//! Row locks are `tokio::sync::Mutex` guards. Dropping a [`MemoryTx`] releases
//! them and discards its staged writes, which is what a cancelled future does.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, trace};

use super::error::StoreError;
use super::models::*;
use super::{Ledger, Store};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

struct Shared {
    tables: Mutex<Tables>,
    row_locks: DashMap<i64, Arc<RowLock<()>>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    lock_timeout: Option<Duration>,
}

impl Shared {
    /// Table guard. Never held across an await point.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_lock(&self, id: i64) -> Arc<RowLock<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }
}

/// In-memory [`Store`] backend
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Store whose row-lock waits never time out
    pub fn new() -> Self {
        Self::with_lock_timeout(None)
    }

    /// Store whose row-lock waits fail with [`StoreError::LockTimeout`] after `lock_timeout`
    pub fn with_lock_timeout(lock_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: DashMap::new(),
                account_seq: AtomicI64::new(1),
                entry_seq: AtomicI64::new(1),
                transfer_seq: AtomicI64::new(1),
                lock_timeout,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct WriteSet {
    /// Created or updated account rows
    accounts: BTreeMap<i64, Account>,
    deleted_accounts: BTreeSet<i64>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

impl WriteSet {
    fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.deleted_accounts.is_empty()
            && self.entries.is_empty()
            && self.transfers.is_empty()
    }
}

/// Transaction (or autocommit connection) over a [`MemoryStore`]
pub struct MemoryTx {
    shared: Arc<Shared>,
    autocommit: bool,
    writes: WriteSet,
    locks: HashMap<i64, OwnedMutexGuard<()>>,
}

impl MemoryTx {
    fn new(shared: Arc<Shared>, autocommit: bool) -> Self {
        Self {
            shared,
            autocommit,
            writes: WriteSet::default(),
            locks: HashMap::new(),
        }
    }

    fn visible_account(&self, id: i64) -> Option<Account> {
        if self.writes.deleted_accounts.contains(&id) {
            return None;
        }
        if let Some(account) = self.writes.accounts.get(&id) {
            return Some(account.clone());
        }
        self.shared.tables().accounts.get(&id).cloned()
    }

    fn account_exists(&self, id: i64) -> bool {
        self.visible_account(id).is_some()
    }

    fn account_referenced(&self, id: i64) -> bool {
        let staged = self.writes.entries.values().any(|e| e.account_id == id)
            || self
                .writes
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        if staged {
            return true;
        }
        let tables = self.shared.tables();
        tables.entries.values().any(|e| e.account_id == id)
            || tables
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id)
    }

    /// Wait for the row lock of account `id`. Re-entrant within one transaction.
    async fn lock_row(&mut self, id: i64) -> Result<(), StoreError> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }

        let lock = self.shared.row_lock(id);
        let guard = match self.shared.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout(format!("accounts id={id}")))?,
            None => lock.lock_owned().await,
        };
        trace!(account_id = id, "Row lock acquired");
        self.locks.insert(id, guard);
        Ok(())
    }

    /// Lock an existing account row and return its latest committed state
    async fn lock_account(&mut self, id: i64) -> Result<Account, StoreError> {
        if !self.account_exists(id) {
            return Err(StoreError::NotFound {
                table: "accounts",
                id,
            });
        }
        self.lock_row(id).await?;
        // Re-read: another transaction may have changed or removed it while we waited
        self.visible_account(id).ok_or(StoreError::NotFound {
            table: "accounts",
            id,
        })
    }

    /// End of one statement. In autocommit mode a successful statement is
    /// published and a failed one discarded; either way its row locks go.
    fn finish_statement<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if self.autocommit {
            match result {
                Ok(_) => self.flush(),
                Err(_) => self.discard(),
            }
        }
        result
    }

    /// Publish staged writes, then release row locks
    fn flush(&mut self) {
        let writes = std::mem::take(&mut self.writes);
        {
            let mut tables = self.shared.tables();
            for id in &writes.deleted_accounts {
                tables.accounts.remove(id);
                self.shared.row_locks.remove(id);
            }
            tables.accounts.extend(writes.accounts);
            tables.entries.extend(writes.entries);
            tables.transfers.extend(writes.transfers);
        }
        self.locks.clear();
    }

    fn discard(&mut self) {
        self.writes = WriteSet::default();
        self.locks.clear();
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.writes.is_empty() || !self.locks.is_empty() {
            debug!(
                held_locks = self.locks.len(),
                "Memory transaction dropped without commit, discarding writes"
            );
        }
    }
}

fn paginate<T>(rows: Vec<T>, limit: i64, offset: i64) -> Result<Vec<T>, StoreError> {
    if limit < 0 {
        return Err(StoreError::InvalidArgument(
            "LIMIT must not be negative".into(),
        ));
    }
    if offset < 0 {
        return Err(StoreError::InvalidArgument(
            "OFFSET must not be negative".into(),
        ));
    }
    Ok(rows
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect())
}

#[async_trait]
impl Ledger for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let account = Account {
            id: self.shared.account_seq.fetch_add(1, Ordering::Relaxed),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.writes.accounts.insert(account.id, account.clone());
        self.finish_statement(Ok(account))
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.visible_account(id).ok_or(StoreError::NotFound {
            table: "accounts",
            id,
        })
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        let result = self.lock_account(id).await;
        self.finish_statement(result)
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        let mut rows: BTreeMap<i64, Account> = {
            let tables = self.shared.tables();
            tables
                .accounts
                .iter()
                .filter(|(id, _)| !self.writes.deleted_accounts.contains(*id))
                .map(|(id, a)| (*id, a.clone()))
                .collect()
        };
        rows.extend(
            self.writes
                .accounts
                .iter()
                .map(|(id, a)| (*id, a.clone())),
        );
        paginate(rows.into_values().collect(), arg.limit, arg.offset)
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        let result = async {
            let mut account = self.lock_account(arg.id).await?;
            account.balance = arg.balance;
            self.writes.accounts.insert(account.id, account.clone());
            Ok::<_, StoreError>(account)
        }
        .await;
        self.finish_statement(result)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let result = async {
            let mut account = self.lock_account(arg.id).await?;
            account.balance = account
                .balance
                .checked_add(arg.amount)
                .ok_or(StoreError::NumericOutOfRange)?;
            self.writes.accounts.insert(account.id, account.clone());
            Ok::<_, StoreError>(account)
        }
        .await;
        self.finish_statement(result)
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let result = async {
            self.lock_account(id).await?;
            if self.account_referenced(id) {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "account id={id} is still referenced by entries or transfers"
                )));
            }
            self.writes.accounts.remove(&id);
            self.writes.deleted_accounts.insert(id);
            Ok::<_, StoreError>(())
        }
        .await;
        self.finish_statement(result)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        if !self.account_exists(arg.account_id) {
            return Err(StoreError::ForeignKeyViolation(format!(
                "entries.account_id={} references a missing account",
                arg.account_id
            )));
        }
        let entry = Entry {
            id: self.shared.entry_seq.fetch_add(1, Ordering::Relaxed),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.writes.entries.insert(entry.id, entry.clone());
        self.finish_statement(Ok(entry))
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        if let Some(entry) = self.writes.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.shared
            .tables()
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { table: "entries", id })
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let mut rows: Vec<Entry> = {
            let tables = self.shared.tables();
            tables
                .entries
                .values()
                .chain(self.writes.entries.values())
                .filter(|e| e.account_id == arg.account_id)
                .cloned()
                .collect()
        };
        rows.sort_by_key(|e| e.id);
        paginate(rows, arg.limit, arg.offset)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        if arg.amount <= 0 {
            return Err(StoreError::CheckViolation(format!(
                "transfers_amount_check: amount={} must be positive",
                arg.amount
            )));
        }
        for account_id in [arg.from_account_id, arg.to_account_id] {
            if !self.account_exists(account_id) {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "transfers account id={account_id} references a missing account"
                )));
            }
        }
        let transfer = Transfer {
            id: self.shared.transfer_seq.fetch_add(1, Ordering::Relaxed),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.writes.transfers.insert(transfer.id, transfer.clone());
        self.finish_statement(Ok(transfer))
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        if let Some(transfer) = self.writes.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.shared
            .tables()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                table: "transfers",
                id,
            })
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let mut rows: Vec<Transfer> = {
            let tables = self.shared.tables();
            tables
                .transfers
                .values()
                .chain(self.writes.transfers.values())
                .filter(|t| {
                    t.from_account_id == arg.from_account_id
                        && t.to_account_id == arg.to_account_id
                })
                .cloned()
                .collect()
        };
        rows.sort_by_key(|t| t.id);
        paginate(rows, arg.limit, arg.offset)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Conn = MemoryTx;
    type Tx = MemoryTx;

    async fn acquire(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx::new(self.shared.clone(), true))
    }

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        trace!("Memory transaction begin");
        Ok(MemoryTx::new(self.shared.clone(), false))
    }

    async fn commit(&self, mut tx: MemoryTx) -> Result<(), StoreError> {
        tx.flush();
        trace!("Memory transaction committed");
        Ok(())
    }

    async fn rollback(&self, mut tx: MemoryTx) -> Result<(), StoreError> {
        tx.discard();
        trace!("Memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(store: &MemoryStore, balance: i64) -> Account {
        let mut conn = store.acquire().await.unwrap();
        conn.create_account(CreateAccountParams {
            owner: "owner".into(),
            balance,
            currency: "USD".into(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let account = seed(&store, 100).await;

        let mut tx = store.begin().await.unwrap();
        let updated = tx
            .add_account_balance(AddAccountBalanceParams {
                id: account.id,
                amount: 25,
            })
            .await
            .unwrap();
        assert_eq!(updated.balance, 125);
        // Own writes are visible inside the transaction
        assert_eq!(tx.get_account(account.id).await.unwrap().balance, 125);

        let mut other = store.acquire().await.unwrap();
        assert_eq!(other.get_account(account.id).await.unwrap().balance, 100);

        store.commit(tx).await.unwrap();
        assert_eq!(other.get_account(account.id).await.unwrap().balance, 125);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_but_not_sequence() {
        let store = MemoryStore::new();
        let account = seed(&store, 100).await;

        let mut tx = store.begin().await.unwrap();
        let entry = tx
            .create_entry(CreateEntryParams {
                account_id: account.id,
                amount: -5,
            })
            .await
            .unwrap();
        store.rollback(tx).await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let err = conn.get_entry(entry.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { table: "entries", .. }));

        let next = conn
            .create_entry(CreateEntryParams {
                account_id: account.id,
                amount: -5,
            })
            .await
            .unwrap();
        assert!(next.id > entry.id, "sequence values are not reused");
    }

    #[tokio::test]
    async fn test_row_lock_blocks_until_commit() {
        let store = MemoryStore::new();
        let account = seed(&store, 100).await;

        let mut tx1 = store.begin().await.unwrap();
        tx1.add_account_balance(AddAccountBalanceParams {
            id: account.id,
            amount: -10,
        })
        .await
        .unwrap();

        let store2 = store.clone();
        let id = account.id;
        let waiter = tokio::spawn(async move {
            let mut tx2 = store2.begin().await.unwrap();
            let updated = tx2
                .add_account_balance(AddAccountBalanceParams { id, amount: -10 })
                .await
                .unwrap();
            store2.commit(tx2).await.unwrap();
            updated.balance
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second writer must wait for the row lock");

        store.commit(tx1).await.unwrap();
        // The waiter re-reads after the lock and sees the committed value
        assert_eq!(waiter.await.unwrap(), 80);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let store = MemoryStore::with_lock_timeout(Some(Duration::from_millis(30)));
        let account = seed(&store, 100).await;

        let mut holder = store.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.get_account_for_update(account.id).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert!(err.is_retryable());

        // Dropping the holder releases the lock
        drop(holder);
        tx.get_account_for_update(account.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_constraints() {
        let store = MemoryStore::new();
        let a = seed(&store, 10).await;
        let b = seed(&store, 10).await;
        let mut conn = store.acquire().await.unwrap();

        let err = conn
            .create_transfer(CreateTransferParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation(_)));

        let err = conn
            .create_transfer(CreateTransferParams {
                from_account_id: a.id,
                to_account_id: 424242,
                amount: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

        let err = conn
            .add_account_balance(AddAccountBalanceParams {
                id: a.id,
                amount: i64::MAX,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NumericOutOfRange));

        conn.create_entry(CreateEntryParams {
            account_id: a.id,
            amount: 1,
        })
        .await
        .unwrap();
        let err = conn.delete_account(a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

        conn.delete_account(b.id).await.unwrap();
        let err = conn.get_account(b.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { table: "accounts", .. }));
    }

    #[tokio::test]
    async fn test_failed_autocommit_statement_releases_row_lock() {
        let store = MemoryStore::with_lock_timeout(Some(Duration::from_millis(200)));
        let a = seed(&store, 10).await;
        let b = seed(&store, 10).await;
        let mut conn = store.acquire().await.unwrap();

        conn.create_entry(CreateEntryParams {
            account_id: a.id,
            amount: 1,
        })
        .await
        .unwrap();
        let err = conn.delete_account(a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

        let err = conn
            .add_account_balance(AddAccountBalanceParams {
                id: b.id,
                amount: i64::MAX,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NumericOutOfRange));

        // Both rows are lockable again from another transaction
        let mut tx = store.begin().await.unwrap();
        tx.get_account_for_update(a.id).await.unwrap();
        let updated = tx
            .add_account_balance(AddAccountBalanceParams {
                id: b.id,
                amount: 5,
            })
            .await
            .unwrap();
        assert_eq!(updated.balance, 15);
        store.commit(tx).await.unwrap();

        // The failed statements left nothing behind
        assert_eq!(conn.get_account(a.id).await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_failed_statement_inside_tx_keeps_locks() {
        let store = MemoryStore::with_lock_timeout(Some(Duration::from_millis(30)));
        let a = seed(&store, 10).await;

        let mut tx = store.begin().await.unwrap();
        tx.get_account_for_update(a.id).await.unwrap();
        let err = tx
            .add_account_balance(AddAccountBalanceParams {
                id: a.id,
                amount: i64::MAX,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NumericOutOfRange));

        // Held until the transaction ends
        let mut other = store.begin().await.unwrap();
        let err = other.get_account_for_update(a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        store.rollback(tx).await.unwrap();
        other.get_account_for_update(a.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = MemoryStore::new();
        for i in 0..10 {
            seed(&store, i).await;
        }
        let mut conn = store.acquire().await.unwrap();

        let page = conn
            .list_accounts(ListAccountsParams {
                limit: 5,
                offset: 5,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 5);
        assert!(page.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(page[0].balance, 5);

        let err = conn
            .list_accounts(ListAccountsParams {
                limit: -1,
                offset: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
