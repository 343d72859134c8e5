//! Ledger Store
//!
//! Primitive row operations over accounts, entries and transfers, plus the
//! transaction boundary that composes them into all-or-nothing units of work.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  UnitOfWork  │──▶│  TxExecutor  │──▶│    Store     │  begin / commit / rollback
//! │ (callback)   │   │ (exec_tx)    │   │  Tx: Ledger  │  primitive row operations
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! Two backends implement [`Store`]:
//! - [`postgres::PgStore`] - PostgreSQL via sqlx, row locks from the database
//! - [`memory::MemoryStore`] - in-process tables with per-row async locks

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

pub use error::{ErrorKind, StoreError};
pub use memory::MemoryStore;
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, UpdateAccountParams,
};
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Primitive ledger operations
///
/// Each call runs inside whatever context the implementor represents: an open
/// transaction (see [`Store::begin`]) or an autocommit connection (see
/// [`Store::acquire`]).
#[async_trait]
pub trait Ledger: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Read an account and hold its row lock until the enclosing transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;

    async fn list_accounts(&mut self, arg: ListAccountsParams)
    -> Result<Vec<Account>, StoreError>;

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError>;

    /// `balance = balance + amount`, locking the row. Returns the updated row.
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError>;
}

/// Transaction boundary of a ledger backend
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Autocommit handle: every call is its own transaction
    type Conn: Ledger;
    /// Open transaction handle. Dropping it without commit rolls back.
    type Tx: Ledger;

    async fn acquire(&self) -> Result<Self::Conn, StoreError>;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;
}

/// A unit of work run inside a single transaction
///
/// Returning `Err` aborts the transaction; nothing the unit wrote is kept.
#[async_trait]
pub trait UnitOfWork<L: Ledger>: Send {
    type Output: Send;

    async fn run(self, ledger: &mut L) -> Result<Self::Output, StoreError>;
}

/// Runs units of work within a transaction. One attempt, no retry.
pub struct TxExecutor<S> {
    store: Arc<S>,
}

impl<S> Clone for TxExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> TxExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Begin, run `work`, then commit on `Ok` or roll back on `Err`
    ///
    /// The unit's own error is returned unmodified. A failed commit is wrapped
    /// in [`StoreError::Commit`]; a failed rollback after a failed unit is
    /// reported as [`StoreError::Rollback`] carrying both errors.
    pub async fn exec_tx<W>(&self, work: W) -> Result<W::Output, StoreError>
    where
        W: UnitOfWork<S::Tx>,
    {
        let mut tx = self.store.begin().await?;

        match work.run(&mut tx).await {
            Ok(output) => {
                if let Err(e) = self.store.commit(tx).await {
                    error!(error = %e, code = e.code(), "Commit failed");
                    return Err(StoreError::Commit(Box::new(e)));
                }
                Ok(output)
            }
            Err(err) => {
                debug!(error = %err, kind = err.kind().as_str(), "Unit of work failed, rolling back");
                if let Err(rb) = self.store.rollback(tx).await {
                    warn!(error = %err, rollback_error = %rb, "Rollback failed");
                    return Err(StoreError::Rollback {
                        source: Box::new(err),
                        rollback: Box::new(rb),
                    });
                }
                Err(err)
            }
        }
    }
}

/// Transaction isolation level requested at `begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}
