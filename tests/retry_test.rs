//! Retry loop scenarios against the in-memory backend.

use gel_pool::config::{Address, ConnectTarget, PoolConfig};
use gel_pool::error::{GelError, GelResult, codes};
use gel_pool::options::{BackoffFn, RetryCondition};
use gel_pool::sim::{SimFactory, SimServer};
use gel_pool::{AsyncPool, Pool, RetryOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

fn fast_backoff() -> BackoffFn {
    Arc::new(|_| Duration::from_millis(1))
}

fn pool(server: &SimServer, attempts: u32) -> AsyncPool<SimFactory> {
    Pool::with_target(
        SimFactory::new(server.clone()),
        ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
        PoolConfig::with_max_concurrency(1),
    )
    .unwrap()
    .with_retry_options(RetryOptions::with_backoff(attempts, fast_backoff()))
}

fn conflict() -> GelError {
    GelError::server(codes::TRANSACTION_CONFLICT, "transaction conflict")
}

#[tokio::test]
async fn test_conflict_is_retried_once() {
    let server = SimServer::new();
    let pool = pool(&server, 3);
    let calls = AtomicU32::new(0);

    let result = pool
        .transaction(|tx| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("get a", &[]).await?;
                if tx.iteration() == 0 {
                    return Err(conflict());
                }
                Ok(tx.iteration())
            }
        })
        .await
        .unwrap();

    assert_eq!(result, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(server.rollbacks(), 1);
    assert_eq!(server.commits(), 1);
    assert_eq!(pool.free_size(), 1);
}

#[tokio::test]
async fn test_single_attempt_propagates_conflict() {
    let server = SimServer::new();
    let pool = pool(&server, 1);
    let calls = AtomicU32::new(0);

    let err = pool
        .transaction(|tx| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("get a", &[]).await?;
                Err::<(), _>(conflict())
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(codes::TRANSACTION_CONFLICT));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.rollbacks(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let server = SimServer::new();
    let pool = pool(&server, 3);
    let calls = AtomicU32::new(0);

    let err = pool
        .transaction(|tx| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("get a", &[]).await?;
                Err::<(), _>(conflict())
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_transaction_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(server.rollbacks(), 3);
}

async fn bump(pool: &AsyncPool<SimFactory>, barrier: &Barrier, iterations: &AtomicU32) -> GelResult<i64> {
    pool.transaction(|tx| async move {
        iterations.fetch_add(1, Ordering::SeqCst);
        tx.query("get counter", &[]).await?;
        if tx.iteration() == 0 {
            barrier.wait().await;
        }
        tx.query_single_as::<i64>("incr counter", &[])
            .await?
            .ok_or_else(|| GelError::internal("incr returned nothing"))
    })
    .await
}

#[tokio::test]
async fn test_concurrent_increments_conflict_once() {
    let server = SimServer::new();
    let first: AsyncPool<SimFactory> = Pool::with_target(
        SimFactory::new(server.clone()),
        ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
        PoolConfig::with_max_concurrency(1),
    )
    .unwrap();
    let second: AsyncPool<SimFactory> = Pool::with_target(
        SimFactory::new(server.clone()),
        ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
        PoolConfig::with_max_concurrency(1),
    )
    .unwrap();
    let barrier = Barrier::new(2);
    let iterations = AtomicU32::new(0);

    let (a, b) = tokio::join!(
        bump(&first, &barrier, &iterations),
        bump(&second, &barrier, &iterations)
    );

    let mut values = vec![a.unwrap(), b.unwrap()];
    values.sort();
    assert_eq!(values, vec![1, 2]);
    assert_eq!(iterations.load(Ordering::SeqCst), 3);
    assert_eq!(server.value("counter"), Some(2));
    assert_eq!(server.commits(), 2);
}

#[tokio::test]
async fn test_application_error_is_not_retried() {
    let server = SimServer::new();
    let pool = pool(&server, 3);
    let calls = AtomicU32::new(0);

    let err = pool
        .transaction(|tx| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.execute("set a 1", &[]).await?;
                Err::<(), _>(GelError::other(std::io::Error::other("validation failed")))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GelError::Other(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.value("a"), None);
    assert_eq!(server.rollbacks(), 1);
}

#[tokio::test]
async fn test_dropped_connection_is_retried_on_new_connection() {
    let server = SimServer::new();
    let pool = pool(&server, 3);

    let value = pool
        .transaction(|tx| {
            let server = server.clone();
            async move {
                tx.query("get a", &[]).await?;
                if tx.iteration() == 0 {
                    server.drop_connections();
                }
                tx.query_single_as::<i64>("incr a", &[]).await
            }
        })
        .await
        .unwrap();

    assert_eq!(value, Some(1));
    assert_eq!(server.connects(), 2);
    assert_eq!(server.value("a"), Some(1));
}

#[tokio::test]
async fn test_failed_start_is_retried() {
    let server = SimServer::new();
    let pool = pool(&server, 2);
    server.fail_next_privileged(GelError::server(codes::BACKEND_UNAVAILABLE, "backend restarting"));

    let value = pool
        .transaction(|tx| async move { tx.query_single_as::<i64>("incr a", &[]).await })
        .await
        .unwrap();

    assert_eq!(value, Some(1));
    assert_eq!(server.commits(), 1);
}

#[tokio::test]
async fn test_commit_conflict_exhaustion() {
    let server = SimServer::new();
    let writer = pool(&server, 1);
    let pool = pool(&server, 2);
    let calls = AtomicU32::new(0);

    let err = pool
        .transaction(|tx| {
            let calls = &calls;
            let writer = &writer;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("get a", &[]).await?;
                // a competing writer commits before this transaction does
                writer.execute("incr a", &[]).await?;
                tx.execute("incr a", &[]).await
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_transaction_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(server.value("a"), Some(2));
    assert_eq!(server.commits(), 0);
}

#[tokio::test]
async fn test_per_condition_rule() {
    let server = SimServer::new();
    let options = RetryOptions::with_backoff(1, fast_backoff()).with_rule(
        RetryCondition::TransactionConflict,
        Some(4),
        None,
    );
    let pool = pool(&server, 1).with_retry_options(options);
    let calls = AtomicU32::new(0);

    let err = pool
        .transaction(|tx| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("get a", &[]).await?;
                Err::<(), _>(conflict())
            }
        })
        .await
        .unwrap_err();
    assert!(err.is_transaction_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    calls.store(0, Ordering::SeqCst);
    let err = pool
        .transaction(|tx| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.query("get a", &[]).await?;
                Err::<(), _>(GelError::server(codes::BACKEND_UNAVAILABLE, "unavailable"))
            }
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(codes::BACKEND_UNAVAILABLE));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_manual_retry_loop() {
    let server = SimServer::new();
    let pool = pool(&server, 3);
    let mut retry = pool.retry();
    let mut result = None;

    while let Some(tx) = retry.next().await {
        tx.enter().unwrap();
        let outcome = async {
            tx.query("get a", &[]).await?;
            if tx.iteration() < 2 {
                return Err(GelError::serialization("conflict"));
            }
            tx.query_single_as::<i64>("incr a", &[]).await
        }
        .await;
        if !tx.exit(outcome.as_ref().err()).await.unwrap() {
            result = Some(outcome);
            break;
        }
    }

    assert_eq!(result.unwrap().unwrap(), Some(1));
    assert_eq!(retry.iterations(), 3);
    assert!(retry.last_error().unwrap().is_transaction_conflict());
}
