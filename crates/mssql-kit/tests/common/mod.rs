//! In-memory driver for exercising the client without a server

#![allow(dead_code)]

use async_trait::async_trait;
use mssql_kit::driver::{BulkCopyResult, BulkTable, Driver, DriverConnection, DriverResult};
use mssql_kit::prelude::*;
use mssql_kit::wire::Param;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A statement the mock saw
#[derive(Debug, Clone)]
pub struct Executed {
    pub sql: String,
    pub params: Vec<Param>,
}

#[derive(Clone)]
enum Scripted {
    Rows(ResultSet),
    Fail(String),
}

#[derive(Default)]
pub struct MockState {
    connect_attempts: AtomicUsize,
    closes: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    executed: Mutex<Vec<Executed>>,
    bulk_loads: Mutex<Vec<BulkTable>>,
    bulk_failure: Mutex<Option<String>>,
    scripts: Mutex<Vec<(String, Scripted)>>,
}

/// Driver whose connections answer from a script keyed by SQL fragments.
/// The most recently added matching fragment wins; unmatched statements
/// return an empty result.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, fragment: &str, result: ResultSet) -> &Self {
        self.state
            .scripts
            .lock()
            .push((fragment.to_string(), Scripted::Rows(result)));
        self
    }

    pub fn fail_on(&self, fragment: &str, message: &str) -> &Self {
        self.state
            .scripts
            .lock()
            .push((fragment.to_string(), Scripted::Fail(message.to_string())));
        self
    }

    pub fn fail_bulk(&self, message: &str) {
        *self.state.bulk_failure.lock() = Some(message.to_string());
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn delay_connect(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.executed.lock().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.sql).collect()
    }

    pub fn bulk_loads(&self) -> Vec<BulkTable> {
        self.state.bulk_loads.lock().clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, _config: &SqlConfig) -> DriverResult<Arc<dyn DriverConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "Login failed for user 'sa'",
            )));
        }

        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn query(&self, sql: &str, params: &[Param]) -> DriverResult<ResultSet> {
        self.state.executed.lock().push(Executed {
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        let scripted = self
            .state
            .scripts
            .lock()
            .iter()
            .rev()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, s)| s.clone());

        match scripted {
            Some(Scripted::Rows(result)) => Ok(result),
            Some(Scripted::Fail(message)) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                message,
            ))),
            None => Ok(ResultSet::default()),
        }
    }

    async fn bulk_copy(&self, table: &BulkTable) -> DriverResult<BulkCopyResult> {
        if let Some(message) = self.state.bulk_failure.lock().clone() {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                message,
            )));
        }
        self.state.bulk_loads.lock().push(table.clone());
        Ok(BulkCopyResult {
            rows_affected: table.rows.len() as u64,
        })
    }

    async fn close(&self) -> DriverResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config() -> SqlConfig {
    SqlConfig::new("localhost")
        .with_credentials("sa", "Passw0rd!")
        .with_database("app")
}

/// A client over `driver`, initialized with [`config`]
pub async fn client(driver: &MockDriver) -> SqlClient {
    let client = SqlClient::new(driver.clone());
    client.init(config()).await.unwrap();
    client
}

/// Result set with untyped (`NVARCHAR`) columns
pub fn result(columns: &[&str], rows: Vec<Vec<Value>>) -> ResultSet {
    let names: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    ResultSet::new(
        columns
            .iter()
            .map(|c| Column::new(*c, SqlType::NVarChar))
            .collect(),
        rows.into_iter()
            .map(|values| Row::new(names.clone(), values))
            .collect(),
    )
}

/// Zero-row probe answer exposing `columns`
pub fn columns(columns: &[&str]) -> ResultSet {
    result(columns, Vec::new())
}

/// What a MERGE with `OUTPUT $action AS [Action]` returns
pub fn actions(actions: &[&str]) -> ResultSet {
    result(
        &["Action"],
        actions.iter().map(|a| vec![Value::from(*a)]).collect(),
    )
}
