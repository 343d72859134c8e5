//! bank_ledger - Atomic Money Transfers
//!
//! Moves money between accounts of a relational ledger. One transfer creates
//! a transfer record, two offsetting entries and two balance updates inside a
//! single transaction, and stays correct under unbounded concurrency.
//!
//! # Modules
//!
//! - [`store`] - Ledger primitives, transaction executor, PostgreSQL and in-memory backends
//! - [`transfer`] - Transfer orchestrator and balance update ordering
//! - [`db`] - PostgreSQL connection pool
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup
//! - [`util`] - Random fixtures

pub mod config;
pub mod db;
pub mod logging;
pub mod store;
pub mod transfer;
pub mod util;

// Convenient re-exports at crate root
pub use store::{
    Account, Entry, ErrorKind, IsolationLevel, Ledger, MemoryStore, PgStore, Store, StoreError,
    Transfer, TxExecutor, UnitOfWork,
};
pub use transfer::{TransferService, TransferTxParams, TransferTxResult};
