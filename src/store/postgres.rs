//! PostgreSQL Ledger Store
//!
//! Runtime-checked sqlx queries over the `accounts`, `entries` and `transfers`
//! tables. Row locks, foreign keys and the positive-amount check are the
//! database's own.

use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};

use super::error::StoreError;
use super::models::*;
use super::{IsolationLevel, Ledger, Store};
use crate::config::DatabaseConfig;
use crate::db::Database;

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// Serialises concurrent `init_schema` calls
const SCHEMA_LOCK_KEY: i64 = 0x6c65_6467_6572;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS accounts (
        id BIGSERIAL PRIMARY KEY,
        owner VARCHAR NOT NULL,
        balance BIGINT NOT NULL,
        currency VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS entries (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL REFERENCES accounts (id),
        amount BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transfers (
        id BIGSERIAL PRIMARY KEY,
        from_account_id BIGINT NOT NULL REFERENCES accounts (id),
        to_account_id BIGINT NOT NULL REFERENCES accounts (id),
        amount BIGINT NOT NULL CONSTRAINT transfers_amount_check CHECK (amount > 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner)",
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_pair_idx ON transfers (from_account_id, to_account_id)",
];

/// PostgreSQL [`Store`] backend
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    isolation: IsolationLevel,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    /// Read committed, no lock timeout
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::default(),
            lock_timeout: None,
        }
    }

    pub fn from_config(db: &Database, config: &DatabaseConfig) -> Self {
        Self::new(db.pool().clone())
            .with_isolation(config.isolation_level)
            .with_lock_timeout(config.lock_timeout())
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!("Ledger schema initialized");
        Ok(())
    }
}

/// [`Ledger`] over a PostgreSQL connection or an open transaction
pub struct PgLedger<C> {
    conn: C,
}

impl<C> PgLedger<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

#[async_trait]
impl<C> Ledger for PgLedger<C>
where
    C: DerefMut<Target = PgConnection> + Send + 'static,
{
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(arg.owner)
            .bind(arg.balance)
            .bind(arg.currency)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(StoreError::NotFound {
                table: "accounts",
                id,
            })
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        // NO KEY UPDATE leaves FK checks from concurrent entry inserts unblocked
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
        );
        sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(StoreError::NotFound {
                table: "accounts",
                id,
            })
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id LIMIT $1 OFFSET $2");
        let rows = sqlx::query_as::<_, Account>(&sql)
            .bind(arg.limit)
            .bind(arg.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(rows)
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        let sql =
            format!("UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}");
        sqlx::query_as::<_, Account>(&sql)
            .bind(arg.id)
            .bind(arg.balance)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(StoreError::NotFound {
                table: "accounts",
                id: arg.id,
            })
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        );
        sqlx::query_as::<_, Account>(&sql)
            .bind(arg.amount)
            .bind(arg.id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(StoreError::NotFound {
                table: "accounts",
                id: arg.id,
            })
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: "accounts",
                id,
            });
        }
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        );
        let entry = sqlx::query_as::<_, Entry>(&sql)
            .bind(arg.account_id)
            .bind(arg.amount)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, Entry>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(StoreError::NotFound { table: "entries", id })
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, Entry>(&sql)
            .bind(arg.account_id)
            .bind(arg.limit)
            .bind(arg.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(rows)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let sql = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        );
        let transfer = sqlx::query_as::<_, Transfer>(&sql)
            .bind(arg.from_account_id)
            .bind(arg.to_account_id)
            .bind(arg.amount)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, Transfer>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(StoreError::NotFound {
                table: "transfers",
                id,
            })
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 AND to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query_as::<_, Transfer>(&sql)
            .bind(arg.from_account_id)
            .bind(arg.to_account_id)
            .bind(arg.limit)
            .bind(arg.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Store for PgStore {
    type Conn = PgLedger<PoolConnection<Postgres>>;
    type Tx = PgLedger<Transaction<'static, Postgres>>;

    async fn acquire(&self) -> Result<Self::Conn, StoreError> {
        Ok(PgLedger::new(self.pool.acquire().await?))
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Must precede any other statement in the transaction
        let isolation = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            self.isolation.as_sql()
        );
        sqlx::query(&isolation).execute(&mut *tx).await?;

        if let Some(limit) = self.lock_timeout {
            let stmt = format!("SET LOCAL lock_timeout = {}", limit.as_millis());
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }

        debug!(isolation = self.isolation.as_sql(), "Transaction begin");
        Ok(PgLedger::new(tx))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.into_inner().rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database_url;
    use crate::store::ErrorKind;

    async fn test_store() -> PgStore {
        let db = Database::connect(&test_database_url())
            .await
            .expect("Failed to connect");
        let store = PgStore::new(db.pool().clone()).with_lock_timeout(Some(Duration::from_secs(2)));
        store.init_schema().await.expect("Failed to init schema");
        store
    }

    async fn create_random_account(conn: &mut impl Ledger) -> Account {
        conn.create_account(CreateAccountParams {
            owner: crate::util::random_owner(),
            balance: crate::util::random_money(),
            currency: crate::util::random_currency().to_string(),
        })
        .await
        .expect("create account")
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_account_crud() {
        let store = test_store().await;
        let mut conn = store.acquire().await.unwrap();

        let account = create_random_account(&mut conn).await;
        assert!(account.id > 0);
        assert_eq!(conn.get_account(account.id).await.unwrap(), account);

        let updated = conn
            .update_account(UpdateAccountParams {
                id: account.id,
                balance: 777,
            })
            .await
            .unwrap();
        assert_eq!(updated.balance, 777);

        let added = conn
            .add_account_balance(AddAccountBalanceParams {
                id: account.id,
                amount: -77,
            })
            .await
            .unwrap();
        assert_eq!(added.balance, 700);

        conn.delete_account(account.id).await.unwrap();
        let err = conn.get_account(account.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { table: "accounts", .. }));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_constraint_mapping() {
        let store = test_store().await;
        let mut conn = store.acquire().await.unwrap();
        let a = create_random_account(&mut conn).await;
        let b = create_random_account(&mut conn).await;

        let err = conn
            .create_transfer(CreateTransferParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: -1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation(_)), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = conn
            .create_entry(CreateEntryParams {
                account_id: i64::MAX,
                amount: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)), "{err:?}");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_lock_timeout_maps_to_transient() {
        let store = test_store().await;
        let account = {
            let mut conn = store.acquire().await.unwrap();
            create_random_account(&mut conn).await
        };

        let mut holder = store.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter
            .add_account_balance(AddAccountBalanceParams {
                id: account.id,
                amount: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)), "{err:?}");
        assert!(err.is_retryable());

        store.rollback(holder).await.unwrap();
    }
}
