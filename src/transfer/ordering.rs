//! Balance Update Ordering
//!
//! Every transaction that moves money between two accounts updates their rows
//! in ascending account-id order. Two transfers over the same pair, in either
//! direction, therefore request row locks in the same order and can never wait
//! on each other in a cycle.

use crate::store::{Account, AddAccountBalanceParams, Ledger, StoreError};

/// One `balance = balance + delta` write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub account_id: i64,
    pub delta: i64,
}

/// Ordered balance writes for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdatePlan {
    from_account_id: i64,
    to_account_id: i64,
    debit: i64,
    updates: Vec<BalanceUpdate>,
}

impl BalanceUpdatePlan {
    /// Plan the writes moving `amount` from `from_account_id` to `to_account_id`.
    ///
    /// A self-transfer nets to a single zero update so the row is locked once.
    pub fn for_transfer(
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Self, StoreError> {
        let debit = amount.checked_neg().ok_or(StoreError::NumericOutOfRange)?;

        let updates = if from_account_id == to_account_id {
            vec![BalanceUpdate {
                account_id: from_account_id,
                delta: 0,
            }]
        } else {
            let mut updates = vec![
                BalanceUpdate {
                    account_id: from_account_id,
                    delta: debit,
                },
                BalanceUpdate {
                    account_id: to_account_id,
                    delta: amount,
                },
            ];
            updates.sort_by_key(|u| u.account_id);
            updates
        };

        Ok(Self {
            from_account_id,
            to_account_id,
            debit,
            updates,
        })
    }

    /// Source entry amount, `-amount`
    pub fn debit(&self) -> i64 {
        self.debit
    }

    /// Writes in the order they will be issued
    pub fn updates(&self) -> &[BalanceUpdate] {
        &self.updates
    }

    /// Issue the writes in plan order.
    ///
    /// Returns `(from_account, to_account)` regardless of issue order.
    pub async fn apply<L: Ledger>(&self, ledger: &mut L) -> Result<(Account, Account), StoreError> {
        let mut from_account = None;
        let mut to_account = None;

        for update in &self.updates {
            let account = ledger
                .add_account_balance(AddAccountBalanceParams {
                    id: update.account_id,
                    amount: update.delta,
                })
                .await?;
            if account.id == self.from_account_id {
                from_account = Some(account.clone());
            }
            if account.id == self.to_account_id {
                to_account = Some(account);
            }
        }

        match (from_account, to_account) {
            (Some(from), Some(to)) => Ok((from, to)),
            // Unreachable for a plan built by for_transfer
            _ => Err(StoreError::Database(format!(
                "balance plan for {} -> {} did not cover both accounts",
                self.from_account_id, self.to_account_id
            ))),
        }
    }
}
