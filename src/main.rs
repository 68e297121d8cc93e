//! gel-pool - Main entry point.
//!
//! Runs concurrent counter-increment transactions against the in-memory
//! backend and reports how often the retry loop had to repeat an attempt.

use clap::Parser;
use gel_pool::blocking::Client;
use gel_pool::config::{Address, Config, ConnectTarget, SchedulingModel};
use gel_pool::sim::{SimFactory, SimServer};
use gel_pool::{AsyncPool, GelError, GelResult, Pool, PoolStats, RetryOptions};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Counters shared by all workers.
#[derive(Debug, Default)]
struct Tally {
    attempts: AtomicUsize,
    committed: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Serialize)]
struct Report {
    model: String,
    workers: usize,
    transactions: usize,
    committed: usize,
    failed: usize,
    attempts: usize,
    elapsed_ms: u64,
    connects: usize,
    counters: BTreeMap<String, Option<i64>>,
    pool: PoolStats,
}

fn counter_key(keys: usize) -> String {
    format!("counter{}", rand::thread_rng().gen_range(0..keys))
}

fn target() -> ConnectTarget {
    ConnectTarget::new(vec![Address::tcp("sim", gel_pool::config::DEFAULT_PORT)])
}

async fn run_tokio(config: &Config, server: &SimServer, tally: Arc<Tally>) -> GelResult<PoolStats> {
    let pool: AsyncPool<SimFactory> = Pool::with_target(
        SimFactory::new(server.clone()),
        target(),
        config.pool_config(),
    )?
    .with_retry_options(RetryOptions::new(config.attempts));

    let workers = (0..config.workers).map(|worker| {
        let pool = pool.clone();
        let tally = tally.clone();
        let transactions = config.transactions;
        let keys = config.keys;
        tokio::spawn(async move {
            for _ in 0..transactions {
                let key = counter_key(keys);
                let result = pool
                    .transaction(|tx| {
                        let query = format!("incr {}", key);
                        let tally = tally.clone();
                        async move {
                            tally.attempts.fetch_add(1, Ordering::Relaxed);
                            tx.query_single_as::<i64>(&query, &[]).await
                        }
                    })
                    .await;
                match result {
                    Ok(_) => tally.committed.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        warn!(worker, error = %e, "Transaction failed");
                        tally.failed.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        })
    });

    tokio::select! {
        joined = futures_util::future::join_all(workers) => {
            for result in joined {
                if let Err(e) = result {
                    error!(error = %e, "Worker task failed");
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; terminating pool");
            pool.terminate();
            return Err(GelError::interface("run interrupted"));
        }
    }

    let stats = pool.stats();
    pool.close(Some(CLOSE_TIMEOUT)).await?;
    Ok(stats)
}

fn run_threads(config: &Config, server: &SimServer, tally: Arc<Tally>) -> GelResult<PoolStats> {
    let client = Client::with_target(
        SimFactory::new(server.clone()),
        target(),
        config.pool_config(),
    )?
    .with_retry_options(RetryOptions::new(config.attempts));

    let handles: Vec<_> = (0..config.workers)
        .map(|worker| {
            let client = client.clone();
            let tally = tally.clone();
            let transactions = config.transactions;
            let keys = config.keys;
            std::thread::spawn(move || {
                for _ in 0..transactions {
                    let query = format!("incr {}", counter_key(keys));
                    let result = client.transaction(|tx| {
                        tally.attempts.fetch_add(1, Ordering::Relaxed);
                        tx.query_single_as::<i64>(&query, &[])
                    });
                    match result {
                        Ok(_) => tally.committed.fetch_add(1, Ordering::Relaxed),
                        Err(e) => {
                            warn!(worker, error = %e, "Transaction failed");
                            tally.failed.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }

    let stats = client.stats();
    client.close(Some(CLOSE_TIMEOUT))?;
    Ok(stats)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        eprintln!();
        eprintln!("Usage: gel-pool --workers <n> --transactions <n> [--max-concurrency <n>]");
        std::process::exit(1);
    }

    info!(
        model = %config.model,
        workers = config.workers,
        transactions = config.transactions,
        "Starting gel-pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    let server = SimServer::new();
    if let Some(n) = config.suggested_concurrency {
        server.suggest_concurrency(n);
    }
    server.refuse_connects(config.refuse_connects as usize);

    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let result = match config.model {
        SchedulingModel::Tokio => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_tokio(&config, &server, tally.clone())),
        SchedulingModel::Threads => run_threads(&config, &server, tally.clone()),
    };

    let pool = match result {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "Run failed");
            if let Some(hint) = e.suggestion() {
                eprintln!("Hint: {}", hint);
            }
            return Err(e.into());
        }
    };

    let counters = (0..config.keys)
        .map(|i| {
            let key = format!("counter{}", i);
            let value = server.value(&key);
            (key, value)
        })
        .collect();

    let report = Report {
        model: config.model.to_string(),
        workers: config.workers,
        transactions: config.workers * config.transactions,
        committed: tally.committed.load(Ordering::Relaxed),
        failed: tally.failed.load(Ordering::Relaxed),
        attempts: tally.attempts.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis() as u64,
        connects: server.connects(),
        counters,
        pool,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("Run complete");
    Ok(())
}
