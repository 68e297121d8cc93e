//! Transaction scope and state checks.

use gel_pool::config::{Address, ConnectTarget, PoolConfig};
use gel_pool::error::GelError;
use gel_pool::sim::{SimFactory, SimServer};
use gel_pool::{AsyncPool, IsolationLevel, Pool, TransactionOptions, TransactionState};

fn pool(server: &SimServer) -> AsyncPool<SimFactory> {
    Pool::with_target(
        SimFactory::new(server.clone()),
        ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
        PoolConfig::with_max_concurrency(1),
    )
    .unwrap()
}

#[tokio::test]
async fn test_entering_twice_is_rejected() {
    let server = SimServer::new();
    let pool = pool(&server);
    let mut retry = pool.retry();
    let tx = retry.next().await.unwrap();

    tx.enter().unwrap();
    let err = tx.enter().unwrap_err();
    assert!(err.is_interface_error());
    assert!(err.to_string().contains("already in a `transaction` block"));

    assert!(!tx.exit(None).await.unwrap());
    assert!(retry.next().await.is_none());
}

#[tokio::test]
async fn test_entering_inside_body_fails_transaction() {
    let server = SimServer::new();
    let pool = pool(&server);

    let err = pool
        .transaction(|tx| async move {
            tx.query("get a", &[]).await?;
            tx.enter()
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("already in a `transaction` block"));
    assert_eq!(server.rollbacks(), 1);
    assert_eq!(pool.free_size(), 1);
}

#[tokio::test]
async fn test_lifecycle_states() {
    let server = SimServer::new();
    let pool = pool(&server);
    let mut retry = pool.retry();
    let tx = retry.next().await.unwrap();
    assert_eq!(tx.state(), TransactionState::New);
    assert_eq!(tx.iteration(), 0);

    tx.enter().unwrap();
    assert_eq!(tx.state(), TransactionState::New);
    tx.execute("set a 1", &[]).await.unwrap();
    assert!(tx.is_active());
    assert_eq!(pool.free_size(), 0);

    assert!(!tx.exit(None).await.unwrap());
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(pool.free_size(), 1);
    assert_eq!(server.value("a"), Some(1));
}

#[tokio::test]
async fn test_failed_body_rolls_back() {
    let server = SimServer::new();
    let pool = pool(&server);
    let mut retry = pool.retry();
    let tx = retry.next().await.unwrap();

    tx.enter().unwrap();
    tx.execute("set a 1", &[]).await.unwrap();
    let err = GelError::other(std::io::Error::other("bad input"));
    assert!(!tx.exit(Some(&err)).await.unwrap());

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(server.value("a"), None);

    tx.enter().unwrap();
    let err = tx.query("get a", &[]).await.unwrap_err();
    assert!(err.to_string().contains("cannot execute query; the transaction is already rolled back"));
}

#[tokio::test]
async fn test_concurrent_queries_are_rejected() {
    let server = SimServer::new();
    let pool = pool(&server);
    let mut retry = pool.retry();
    let tx = retry.next().await.unwrap();
    tx.enter().unwrap();

    server.pause();
    let (first, second) = tokio::join!(tx.query("get a", &[]), async {
        tokio::task::yield_now().await;
        let second = tx.query("get b", &[]).await;
        server.resume();
        second
    });

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(err.is_interface_error());
    assert!(err.to_string().contains("concurrent queries within the same transaction are not allowed"));
    assert!(!tx.exit(None).await.unwrap());
}

#[tokio::test]
async fn test_clones_share_the_attempt() {
    let server = SimServer::new();
    let pool = pool(&server);

    let value = pool
        .transaction(|tx| async move {
            let other = tx.clone();
            other.execute("set a 41", &[]).await?;
            tx.query_single_as::<i64>("incr a", &[]).await
        })
        .await
        .unwrap();

    assert_eq!(value, Some(42));
    assert_eq!(server.connects(), 1);
    assert_eq!(server.commits(), 1);
}

#[tokio::test]
async fn test_transaction_options_are_carried() {
    let server = SimServer::new();
    let options = TransactionOptions::default()
        .isolation(IsolationLevel::RepeatableRead)
        .readonly(true);
    let pool = pool(&server).with_transaction_options(options);
    assert_eq!(
        pool.options().transaction.start_transaction_query(),
        "START TRANSACTION ISOLATION REPEATABLE READ, READ ONLY, NOT DEFERRABLE;"
    );

    let rows = pool
        .transaction(|tx| async move { tx.query_json("get a", &[]).await })
        .await
        .unwrap();
    assert_eq!(rows, "null");
}

#[tokio::test]
async fn test_transaction_on_closed_pool() {
    let server = SimServer::new();
    let pool = pool(&server);
    pool.close(None).await.unwrap();

    let err = pool
        .transaction(|tx| async move { tx.query("get a", &[]).await })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("pool is closed"));
}
