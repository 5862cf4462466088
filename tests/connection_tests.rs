
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use remote_runner::config::ConnectConfig;
use remote_runner::error::RunnerError;
use remote_runner::remote::ops::HostOps;
use remote_runner::ssh::{ConnectionManager, ConnectionPool};
use test_harness::{
    auth_error, negotiation_error, params, unreachable_error, MockHost, MockTransport,
};

fn manager(transport: Arc<MockTransport>) -> ConnectionManager {
    ConnectionManager::with_transport(transport, ConnectConfig::default())
}

#[tokio::test]
async fn test_open_and_close() {
    let host = MockHost::linux();
    let manager = manager(MockTransport::with_host("web1", host.clone()));

    let mut conn = manager.open(params("web1")).await.unwrap();
    assert!(conn.is_open());
    assert_eq!(conn.target_id(), "deploy@web1:22");

    manager.close(&mut conn).await;
    assert!(!conn.is_open());
    assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let host = MockHost::linux();
    let manager = manager(MockTransport::with_host("web1", host.clone()));

    let mut conn = manager.open(params("web1")).await.unwrap();
    manager.close(&mut conn).await;
    manager.close(&mut conn).await;
    conn.close().await;

    assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
    assert!(matches!(conn.session(), Err(RunnerError::NotConnected(_))));
}

#[tokio::test]
async fn test_error_kinds_are_distinguishable() {
    let transport = MockTransport::new();
    let auth = MockHost::linux();
    auth.fail_connect(auth_error);
    let kex = MockHost::linux();
    kex.fail_connect(negotiation_error);
    transport.add_host("auth", auth);
    transport.add_host("kex", kex);
    let manager = manager(transport);

    let err = manager.open(params("auth")).await.unwrap_err();
    assert!(matches!(err, RunnerError::Authentication { .. }), "{err}");
    assert!(!err.is_retryable());

    let err = manager.open(params("kex")).await.unwrap_err();
    assert!(matches!(err, RunnerError::Negotiation { .. }), "{err}");
    assert!(err.is_retryable());

    let err = manager.open(params("nowhere")).await.unwrap_err();
    assert!(matches!(err, RunnerError::Unreachable { .. }), "{err}");
    assert!(err.to_string().contains("deploy@nowhere:22"));
}

#[tokio::test]
async fn test_pool_reuses_connection_per_login() {
    let host = MockHost::linux();
    let transport = MockTransport::with_host("web1", host.clone());
    let pool = ConnectionPool::new(manager(transport));

    let a = pool.acquire(&params("web1")).await.unwrap();
    let b = pool.acquire(&params("web1")).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(host.connects.load(Ordering::SeqCst), 1);

    let other_port = params("web1").port(2222);
    let c = pool.acquire(&other_port).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(host.connects.load(Ordering::SeqCst), 2);
    assert_eq!(pool.len().await, 2);
}

#[tokio::test]
async fn test_pool_reopens_closed_connection() {
    let host = MockHost::linux();
    let pool = ConnectionPool::new(manager(MockTransport::with_host("web1", host.clone())));

    let first = pool.acquire(&params("web1")).await.unwrap();
    first.lock().await.close().await;

    let second = pool.acquire(&params("web1")).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.lock().await.is_open());
    assert_eq!(host.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pool_close_all() {
    let host = MockHost::linux();
    let pool = ConnectionPool::new(manager(MockTransport::with_host("web1", host.clone())));

    let shared = pool.acquire(&params("web1")).await.unwrap();
    pool.close_all().await;

    assert!(pool.is_empty().await);
    assert!(!shared.lock().await.is_open());
    assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pool_evict() {
    let host = MockHost::linux();
    let pool = ConnectionPool::new(manager(MockTransport::with_host("web1", host.clone())));

    pool.acquire(&params("web1")).await.unwrap();
    assert!(pool.evict(&params("web1")).await);
    assert!(!pool.evict(&params("web1")).await);
    assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wait_until_online_retries_transient_failures() {
    let host = MockHost::linux();
    host.fail_connect(unreachable_error);
    let manager = manager(MockTransport::with_host("web1", host.clone()));

    let recover = host.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        recover.allow_connect();
    });

    let conn = HostOps::wait_until_online(
        &manager,
        &params("web1"),
        Duration::from_secs(2),
        Duration::from_millis(50),
    )
    .await
    .unwrap();

    assert!(conn.is_open());
    assert!(host.connects.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_wait_until_online_gives_up() {
    let host = MockHost::linux();
    host.fail_connect(unreachable_error);
    let manager = manager(MockTransport::with_host("web1", host));

    let err = HostOps::wait_until_online(
        &manager,
        &params("web1"),
        Duration::from_millis(300),
        Duration::from_millis(50),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RunnerError::Unreachable { .. }));
}

#[tokio::test]
async fn test_wait_until_online_does_not_retry_auth_failures() {
    let host = MockHost::linux();
    host.fail_connect(auth_error);
    let manager = manager(MockTransport::with_host("web1", host.clone()));

    let err = HostOps::wait_until_online(
        &manager,
        &params("web1"),
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RunnerError::Authentication { .. }));
    assert_eq!(host.connects.load(Ordering::SeqCst), 1);
}
