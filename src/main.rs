//! bank_ledger - Transfer Soak Run
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌───────────────────┐    ┌──────────┐
//! │  Config  │───▶│ Store        │───▶│ workers × N       │───▶│  Report  │
//! │  (YAML)  │    │ (PG | memory)│    │ transfer_tx A<->B │    │  (JSON)  │
//! └──────────┘    └──────────────┘    └───────────────────┘    └──────────┘
//! ```
//!
//! Usage: `bank_ledger [--env <name>]` (reads `config/<name>.yaml`, default `dev`)

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde::Serialize;

use bank_ledger::config::{AppConfig, SoakConfig};
use bank_ledger::db::Database;
use bank_ledger::store::{CreateAccountParams, Ledger, MemoryStore, PgStore, Store};
use bank_ledger::transfer::{TransferService, TransferTxParams};
use bank_ledger::util::{random_currency, random_owner};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[derive(Debug, Serialize)]
struct SoakReport {
    store: &'static str,
    transfers: usize,
    committed: usize,
    failed: usize,
    retryable_failures: usize,
    elapsed_ms: u128,
    account_a: i64,
    account_b: i64,
    balance_a: (i64, i64),
    balance_b: (i64, i64),
    conserved: bool,
}

#[derive(Default)]
struct WorkerTally {
    committed: usize,
    failed: usize,
    retryable: usize,
}

/// Sums are widened so extreme configured balances cannot overflow
fn balances_conserved(before: (i64, i64), after: (i64, i64)) -> bool {
    i128::from(before.0) + i128::from(before.1) == i128::from(after.0) + i128::from(after.1)
}

async fn run_soak<S: Store>(
    service: TransferService<S>,
    config: &SoakConfig,
    store_name: &'static str,
) -> anyhow::Result<SoakReport> {
    let store = service.store().clone();
    let mut conn = store.acquire().await?;
    let currency = random_currency().to_string();
    let open = |owner: String| CreateAccountParams {
        owner,
        balance: config.initial_balance,
        currency: currency.clone(),
    };
    let a = conn.create_account(open(random_owner())).await?;
    let b = conn.create_account(open(random_owner())).await?;

    tracing::info!(
        account_a = a.id,
        account_b = b.id,
        workers = config.workers,
        transfers_per_worker = config.transfers_per_worker,
        "Soak run started"
    );

    let started = Instant::now();
    let handles = (0..config.workers).map(|worker| {
        let service = service.clone();
        let rounds = config.transfers_per_worker;
        let amount = config.amount;
        let (a_id, b_id) = (a.id, b.id);
        tokio::spawn(async move {
            let mut tally = WorkerTally::default();
            for round in 0..rounds {
                let (from, to) = if (worker + round) % 2 == 0 {
                    (a_id, b_id)
                } else {
                    (b_id, a_id)
                };
                let params = TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount,
                };
                match service.transfer_tx(params).await {
                    Ok(_) => tally.committed += 1,
                    Err(e) => {
                        tally.failed += 1;
                        if e.is_retryable() {
                            tally.retryable += 1;
                        }
                    }
                }
            }
            tally
        })
    });

    let mut total = WorkerTally::default();
    for joined in futures::future::join_all(handles).await {
        let tally = joined.context("soak worker panicked")?;
        total.committed += tally.committed;
        total.failed += tally.failed;
        total.retryable += tally.retryable;
    }
    let elapsed = started.elapsed();

    let final_a = conn.get_account(a.id).await?.balance;
    let final_b = conn.get_account(b.id).await?.balance;
    let conserved = balances_conserved((a.balance, b.balance), (final_a, final_b));

    if conserved {
        tracing::info!(final_a, final_b, elapsed = ?elapsed, "Soak run finished");
    } else {
        tracing::error!(final_a, final_b, "Money not conserved");
    }

    Ok(SoakReport {
        store: store_name,
        transfers: config.workers * config.transfers_per_worker,
        committed: total.committed,
        failed: total.failed,
        retryable_failures: total.retryable,
        elapsed_ms: elapsed.as_millis(),
        account_a: a.id,
        account_b: b.id,
        balance_a: (a.balance, final_a),
        balance_b: (b.balance, final_b),
        conserved,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = bank_ledger::logging::init_logging(&app_config);

    tracing::info!("Starting bank_ledger soak run in {} mode", env);

    let report = match app_config.database.url.as_deref() {
        Some(url) => {
            let db = Database::from_config(url, &app_config.database)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.health_check().await?;
            let store = PgStore::from_config(&db, &app_config.database);
            store.init_schema().await?;
            let service = TransferService::from_config(Arc::new(store), &app_config.transfer);
            run_soak(service, &app_config.soak, "postgres").await?
        }
        None => {
            let store = MemoryStore::with_lock_timeout(app_config.database.lock_timeout());
            let service = TransferService::from_config(Arc::new(store), &app_config.transfer);
            run_soak(service, &app_config.soak, "memory").await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.conserved {
        anyhow::bail!("balance conservation violated");
    }
    Ok(())
}
