//! Atomic Transfer
//!
//! Moves money between two accounts as one all-or-nothing unit of work.
//!
//! # Flow
//!
//! ```text
//! transfer_tx(from, to, amount)
//!   └─ exec_tx ─────────────────────────────────────────────┐
//!        1. create_transfer(from, to, amount)                │
//!        2. create_entry(from, -amount)                      │ one
//!        3. create_entry(to,   +amount)                      │ transaction
//!        4. add_account_balance × 2, ascending account id    │
//!   ◀── TransferTxResult { transfer, accounts, entries } ────┘
//! ```
//!
//! # Guarantees
//!
//! 1. **Atomicity**: either all five writes commit or none are visible
//! 2. **Conservation**: the two balance deltas sum to zero
//! 3. **No lock-order deadlock**: balance rows are always locked in ascending
//!    id order (see [`ordering`])
//!
//! Failures are returned unmodified and never retried here. Use
//! [`StoreError::is_retryable`] to decide whether to call again.

pub mod ordering;


pub use ordering::{BalanceUpdate, BalanceUpdatePlan};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::store::{
    Account, CreateEntryParams, CreateTransferParams, Entry, Ledger, Store, StoreError, Transfer,
    TxExecutor, UnitOfWork,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Rows written by one transfer. Accounts are in source, destination order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// The transfer as a unit of work
struct TransferTx {
    params: TransferTxParams,
}

#[async_trait]
impl<L: Ledger> UnitOfWork<L> for TransferTx {
    type Output = TransferTxResult;

    async fn run(self, ledger: &mut L) -> Result<TransferTxResult, StoreError> {
        let TransferTxParams {
            from_account_id,
            to_account_id,
            amount,
        } = self.params;

        // Validate before the first write
        let plan = BalanceUpdatePlan::for_transfer(from_account_id, to_account_id, amount)?;

        let transfer = ledger
            .create_transfer(CreateTransferParams {
                from_account_id,
                to_account_id,
                amount,
            })
            .await?;

        let from_entry = ledger
            .create_entry(CreateEntryParams {
                account_id: from_account_id,
                amount: plan.debit(),
            })
            .await?;

        let to_entry = ledger
            .create_entry(CreateEntryParams {
                account_id: to_account_id,
                amount,
            })
            .await?;

        let (from_account, to_account) = plan.apply(ledger).await?;

        Ok(TransferTxResult {
            transfer,
            from_account,
            to_account,
            from_entry,
            to_entry,
        })
    }
}

/// Stateless transfer orchestrator over a [`Store`]
pub struct TransferService<S> {
    executor: TxExecutor<S>,
    deadline: Option<Duration>,
}

impl<S> Clone for TransferService<S> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            deadline: self.deadline,
        }
    }
}

impl<S: Store> TransferService<S> {
    /// Service without a default deadline
    pub fn new(store: Arc<S>) -> Self {
        Self {
            executor: TxExecutor::new(store),
            deadline: None,
        }
    }

    pub fn from_config(store: Arc<S>, config: &TransferConfig) -> Self {
        Self::new(store).with_deadline(config.deadline())
    }

    /// Default deadline applied by [`Self::transfer_tx`]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        self.executor.store()
    }

    /// Move `amount` from one account to another in a single transaction
    pub async fn transfer_tx(
        &self,
        params: TransferTxParams,
    ) -> Result<TransferTxResult, StoreError> {
        match self.deadline {
            Some(deadline) => self.transfer_tx_with_deadline(params, deadline).await,
            None => self.execute(params).await,
        }
    }

    /// [`Self::transfer_tx`] bounded by `deadline`.
    ///
    /// On expiry the in-flight transaction is dropped, which rolls it back, and
    /// [`StoreError::DeadlineExceeded`] is returned. If the deadline fires while
    /// the commit itself is in flight, the database may still have committed.
    pub async fn transfer_tx_with_deadline(
        &self,
        params: TransferTxParams,
        deadline: Duration,
    ) -> Result<TransferTxResult, StoreError> {
        match tokio::time::timeout(deadline, self.execute(params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    from_account_id = params.from_account_id,
                    to_account_id = params.to_account_id,
                    amount = params.amount,
                    deadline = ?deadline,
                    "Transfer deadline exceeded, transaction dropped"
                );
                Err(StoreError::DeadlineExceeded(deadline))
            }
        }
    }

    async fn execute(&self, params: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        debug!(
            from_account_id = params.from_account_id,
            to_account_id = params.to_account_id,
            amount = params.amount,
            "Transfer started"
        );

        match self.executor.exec_tx(TransferTx { params }).await {
            Ok(result) => {
                info!(
                    transfer_id = result.transfer.id,
                    from_account_id = params.from_account_id,
                    to_account_id = params.to_account_id,
                    amount = params.amount,
                    from_balance = result.from_account.balance,
                    to_balance = result.to_account.balance,
                    "Transfer committed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    from_account_id = params.from_account_id,
                    to_account_id = params.to_account_id,
                    amount = params.amount,
                    code = e.code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Transfer failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreateAccountParams, ErrorKind, MemoryStore};

    async fn setup() -> (TransferService<MemoryStore>, Account, Account) {
        let store = Arc::new(MemoryStore::new());
        let mut conn = store.acquire().await.unwrap();
        let mut accounts = Vec::new();
        for owner in ["alice", "bob"] {
            accounts.push(
                conn.create_account(CreateAccountParams {
                    owner: owner.into(),
                    balance: 100,
                    currency: "USD".into(),
                })
                .await
                .unwrap(),
            );
        }
        let b = accounts.pop().unwrap();
        let a = accounts.pop().unwrap();
        (TransferService::new(store), a, b)
    }

    #[tokio::test]
    async fn test_transfer_result_shape() {
        let (service, a, b) = setup().await;

        let result = service
            .transfer_tx(TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 10,
            })
            .await
            .unwrap();

        assert_eq!(result.transfer.from_account_id, a.id);
        assert_eq!(result.transfer.to_account_id, b.id);
        assert_eq!(result.transfer.amount, 10);
        assert_eq!(result.from_entry.account_id, a.id);
        assert_eq!(result.from_entry.amount, -10);
        assert_eq!(result.to_entry.account_id, b.id);
        assert_eq!(result.to_entry.amount, 10);
        assert_eq!(result.from_account.balance, 90);
        assert_eq!(result.to_account.balance, 110);
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let (service, a, b) = setup().await;

        for amount in [0, -5] {
            let err = service
                .transfer_tx(TransferTxParams {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::CheckViolation(_)));
            assert_eq!(err.kind(), ErrorKind::Validation);
        }

        let mut conn = service.store().acquire().await.unwrap();
        assert_eq!(conn.get_account(a.id).await.unwrap().balance, 100);
        assert_eq!(conn.get_account(b.id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_min_amount_rejected_before_writes() {
        let (service, a, b) = setup().await;

        let err = service
            .transfer_tx(TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: i64::MIN,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NumericOutOfRange));
    }

    #[tokio::test]
    async fn test_self_transfer() {
        let (service, a, _) = setup().await;

        let result = service
            .transfer_tx(TransferTxParams {
                from_account_id: a.id,
                to_account_id: a.id,
                amount: 25,
            })
            .await
            .unwrap();

        assert_eq!(result.from_account, result.to_account);
        assert_eq!(result.from_account.balance, 100);
        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
    }

    #[tokio::test]
    async fn test_from_config_applies_deadline() {
        let store = Arc::new(MemoryStore::new());
        let service = TransferService::from_config(store, &TransferConfig { deadline_ms: 250 });
        assert_eq!(service.deadline, Some(Duration::from_millis(250)));

        let service = TransferService::from_config(
            service.store().clone(),
            &TransferConfig { deadline_ms: 0 },
        );
        assert_eq!(service.deadline, None);
    }
}
