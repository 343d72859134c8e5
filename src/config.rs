use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::store::IsolationLevel;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// hourly | daily | never
    pub rotation: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub soak: SoakConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Unset selects the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub isolation_level: IsolationLevel,
    /// 0 disables the lock wait bound
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            acquire_timeout_ms: 5000,
            isolation_level: IsolationLevel::ReadCommitted,
            lock_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    /// Default deadline for one transfer. 0 means no deadline.
    pub deadline_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { deadline_ms: 10_000 }
    }
}

impl TransferConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_ms > 0).then(|| Duration::from_millis(self.deadline_ms))
    }
}

/// Soak run shape (`bank_ledger` binary)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SoakConfig {
    pub workers: usize,
    pub transfers_per_worker: usize,
    pub amount: i64,
    pub initial_balance: i64,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            transfers_per_worker: 10,
            amount: 10,
            initial_balance: 1000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
