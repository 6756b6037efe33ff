//! Tests for the lazy connection lifecycle and idle timer

mod common;

use common::{client, config, MockDriver};
use mssql_kit::lifecycle::{ConnectionState, CONNECT_WAIT_TIMEOUT};
use mssql_kit::prelude::*;
use std::time::Duration;

async fn idle_client(driver: &MockDriver, idle_ms: u64) -> SqlClient {
    let client = SqlClient::new(driver.clone());
    client
        .init(config().with_connection_timeout(idle_ms))
        .await
        .unwrap();
    client
}

// ==================== Initialization Tests ====================

#[tokio::test]
async fn test_query_before_init_fails() {
    let driver = MockDriver::new();
    let client = SqlClient::new(driver.clone());

    assert_eq!(client.state(), ConnectionState::Uninitialized);
    let err = client.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, Error::NotInitialized));
    assert_eq!(driver.connect_attempts(), 0);
}

#[tokio::test]
async fn test_init_rejects_invalid_config() {
    let client = SqlClient::new(MockDriver::new());
    let err = client
        .init(config().with_connection_timeout(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(client.state(), ConnectionState::Uninitialized);
}

#[tokio::test]
async fn test_connects_lazily() {
    let driver = MockDriver::new();
    let client = client(&driver).await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(driver.connect_attempts(), 0);

    client.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(driver.connect_attempts(), 1);
    assert!(client.idle_timer_armed());
}

#[tokio::test]
async fn test_connection_is_reused() {
    let driver = MockDriver::new();
    let client = client(&driver).await;

    for _ in 0..5 {
        client.query("SELECT 1", &[]).await.unwrap();
    }
    assert_eq!(driver.connect_attempts(), 1);
    assert_eq!(client.stats().connects, 1);
}

#[tokio::test]
async fn test_reinit_closes_open_connection() {
    let driver = MockDriver::new();
    let client = client(&driver).await;
    client.ensure_ready().await.unwrap();

    client
        .init(config().with_database("other"))
        .await
        .unwrap();
    assert_eq!(driver.closes(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(driver.connect_attempts(), 2);
}

// ==================== Concurrency Tests ====================

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_connect() {
    let driver = MockDriver::new();
    driver.delay_connect(Duration::from_millis(200));
    let client = client(&driver).await;

    let calls = (0..8).map(|_| {
        let client = client.clone();
        async move { client.query("SELECT 1", &[]).await }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(driver.connect_attempts(), 1);
    assert_eq!(client.stats().connect_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_gives_up_on_slow_connect() {
    let driver = MockDriver::new();
    driver.delay_connect(Duration::from_secs(20));
    let client = SqlClient::new(driver.clone());
    client
        .init(
            config()
                .with_connect_timeout(60_000)
                .with_connection_timeout(120_000),
        )
        .await
        .unwrap();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.query("SELECT 1", &[]).await }
    });
    tokio::task::yield_now().await;
    assert_eq!(client.state(), ConnectionState::Connecting);

    let err = client.query("SELECT 1", &[]).await.unwrap_err();
    match err {
        Error::ConnectTimeout { waited_ms } => {
            assert_eq!(waited_ms, CONNECT_WAIT_TIMEOUT.as_millis() as u64)
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.stats().wait_timeouts, 1);

    // the caller that started the attempt has no ceiling of its own
    first.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(driver.connect_attempts(), 1);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_connect_failure_reaches_caller() {
    let driver = MockDriver::new();
    driver.fail_next_connects(1);
    let client = client(&driver).await;

    let err = client.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert!(err.to_string().contains("Login failed"));
    assert!(err.is_retriable());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.idle_timer_armed());

    // the next call starts a fresh attempt
    client.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(driver.connect_attempts(), 2);
    let stats = client.stats();
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let driver = MockDriver::new();
    driver.delay_connect(Duration::from_secs(5));
    let client = SqlClient::new(driver.clone());
    client
        .init(config().with_connect_timeout(1_000))
        .await
        .unwrap();

    let err = client.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

// ==================== Idle Timer Tests ====================

#[tokio::test(start_paused = true)]
async fn test_idle_connection_is_closed() {
    let driver = MockDriver::new();
    let client = idle_client(&driver, 1_000).await;

    client.query("SELECT 1", &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    tokio::task::yield_now().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(driver.closes(), 1);
    assert_eq!(client.stats().idle_closes, 1);
    assert!(!client.idle_timer_armed());

    // next use reconnects
    client.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(driver.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_activity_resets_idle_timer() {
    let driver = MockDriver::new();
    let client = idle_client(&driver, 1_000).await;

    client.query("SELECT 1", &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    client.query("SELECT 1", &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    tokio::task::yield_now().await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(driver.closes(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    tokio::task::yield_now().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(driver.closes(), 1);
}

// ==================== Close Tests ====================

#[tokio::test]
async fn test_close_cancels_timer() {
    let driver = MockDriver::new();
    let client = client(&driver).await;
    client.ensure_ready().await.unwrap();
    assert!(client.idle_timer_armed());

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.idle_timer_armed());
    assert_eq!(driver.closes(), 1);
    assert_eq!(client.stats().closes, 1);

    // closing again is a no-op
    client.close().await.unwrap();
    assert_eq!(driver.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_then_idle_window_does_not_double_close() {
    let driver = MockDriver::new();
    let client = idle_client(&driver, 1_000).await;
    client.ensure_ready().await.unwrap();
    client.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    tokio::task::yield_now().await;
    assert_eq!(driver.closes(), 1);
    assert_eq!(client.stats().idle_closes, 0);
}
