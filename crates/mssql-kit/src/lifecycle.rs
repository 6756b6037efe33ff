//! Connection lifecycle management
//!
//! One physical connection, opened lazily on first use, reused while busy and
//! closed after `connection_timeout_ms` without activity.
//!
//! ```text
//! Uninitialized --init--> Disconnected --acquire--> Connecting --ok--> Connected
//!                              ^                        |                 |
//!                              +------- failure --------+                 |
//!                              +---------- close / idle timeout ----------+
//! ```
//!
//! Callers that arrive while a connect is in flight subscribe to a watch
//! channel that is resolved exactly once with the outcome. They give up after
//! [`CONNECT_WAIT_TIMEOUT`].
//!
//! Lock order is always `state` then `timer`. The idle timer carries a
//! generation number; a timer whose generation is stale when it fires does
//! nothing.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SqlConfig;
use crate::driver::{Driver, DriverConnection};
use crate::error::{Error, Result};

/// How long a caller waits on somebody else's connect attempt
pub const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Outcome broadcast to everyone waiting on a connect attempt
type ConnectOutcome = std::result::Result<(), String>;

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No configuration supplied yet
    Uninitialized,
    /// Configured, no open connection
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Connection open
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Lifecycle counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    /// Physical connect attempts started
    pub connect_attempts: u64,
    /// Attempts that produced a connection
    pub connects: u64,
    /// Attempts that failed or timed out
    pub connect_failures: u64,
    /// Waiters that gave up on someone else's attempt
    pub wait_timeouts: u64,
    /// Explicit closes of an open connection
    pub closes: u64,
    /// Closes triggered by the idle timer
    pub idle_closes: u64,
}

/// Atomic counters for concurrent updates
#[derive(Debug, Default)]
struct AtomicLifecycleStats {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    wait_timeouts: AtomicU64,
    closes: AtomicU64,
    idle_closes: AtomicU64,
}

impl AtomicLifecycleStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LifecycleStats {
        LifecycleStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            idle_closes: self.idle_closes.load(Ordering::Relaxed),
        }
    }
}

enum Slot {
    Disconnected,
    Connecting(watch::Receiver<Option<ConnectOutcome>>),
    Connected(Arc<dyn DriverConnection>),
}

#[derive(Default)]
struct IdleTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

enum Step {
    Ready(Arc<dyn DriverConnection>),
    Wait {
        rx: watch::Receiver<Option<ConnectOutcome>>,
        ceiling: Option<Duration>,
    },
}

/// Owns the single connection and its idle timer
pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    config: RwLock<Option<Arc<SqlConfig>>>,
    state: Mutex<Slot>,
    timer: Mutex<IdleTimer>,
    stats: AtomicLifecycleStats,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager with no configuration
    pub fn new(driver: Arc<dyn Driver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            driver,
            config: RwLock::new(None),
            state: Mutex::new(Slot::Disconnected),
            timer: Mutex::new(IdleTimer::default()),
            stats: AtomicLifecycleStats::default(),
            this: this.clone(),
        })
    }

    /// Install or replace the configuration. Takes effect on the next connect.
    pub fn set_config(&self, config: SqlConfig) {
        *self.config.write() = Some(Arc::new(config));
    }

    /// Current configuration
    pub fn config(&self) -> Option<Arc<SqlConfig>> {
        self.config.read().clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        if self.config.read().is_none() {
            return ConnectionState::Uninitialized;
        }
        match &*self.state.lock() {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting(_) => ConnectionState::Connecting,
            Slot::Connected(_) => ConnectionState::Connected,
        }
    }

    /// Counters since creation
    pub fn stats(&self) -> LifecycleStats {
        self.stats.snapshot()
    }

    /// Whether an idle timer is currently armed
    pub fn idle_timer_armed(&self) -> bool {
        self.timer.lock().handle.is_some()
    }

    /// Make sure a connection is open and return it, resetting the idle timer.
    pub async fn acquire(&self) -> Result<Arc<dyn DriverConnection>> {
        loop {
            match self.next_step()? {
                Step::Ready(conn) => return Ok(conn),
                Step::Wait { rx, ceiling } => self.wait_for_connect(rx, ceiling).await?,
            }
        }
    }

    /// Re-arm the idle timer after `conn` finished a statement, if it is still current.
    pub fn touch(&self, conn: &Arc<dyn DriverConnection>) {
        let Some(idle) = self.idle_window() else {
            return;
        };
        let state = self.state.lock();
        if let Slot::Connected(current) = &*state {
            if Arc::ptr_eq(current, conn) {
                self.arm_idle_timer(&mut self.timer.lock(), idle);
            }
        }
    }

    /// Cancel the idle timer and close the connection if one is open.
    pub async fn close(&self) -> Result<()> {
        let conn = {
            let mut state = self.state.lock();
            self.cancel_idle_timer(&mut self.timer.lock());
            take_connected(&mut state)
        };

        match conn {
            Some(conn) => {
                AtomicLifecycleStats::record(&self.stats.closes);
                info!("Closing SQL Server connection");
                conn.close()
                    .await
                    .map_err(|e| Error::connection_with_source("Failed to close connection", e))
            }
            None => {
                debug!("close() with no open connection");
                Ok(())
            }
        }
    }

    fn idle_window(&self) -> Option<Duration> {
        self.config
            .read()
            .as_ref()
            .map(|c| Duration::from_millis(c.connection_timeout_ms))
    }

    fn next_step(&self) -> Result<Step> {
        let config = self.config().ok_or(Error::NotInitialized)?;
        let idle = Duration::from_millis(config.connection_timeout_ms);

        let mut state = self.state.lock();
        match &*state {
            Slot::Connected(conn) => {
                let conn = Arc::clone(conn);
                self.arm_idle_timer(&mut self.timer.lock(), idle);
                Ok(Step::Ready(conn))
            }
            Slot::Connecting(rx) => Ok(Step::Wait {
                rx: rx.clone(),
                ceiling: Some(CONNECT_WAIT_TIMEOUT),
            }),
            Slot::Disconnected => {
                let (tx, rx) = watch::channel(None);
                *state = Slot::Connecting(rx.clone());
                // armed before connecting so a caller that never returns still gets cleaned up
                self.arm_idle_timer(&mut self.timer.lock(), idle);
                AtomicLifecycleStats::record(&self.stats.connect_attempts);
                debug!(server = %config.address(), "Starting connect attempt");
                self.spawn_connect(config, tx);
                Ok(Step::Wait { rx, ceiling: None })
            }
        }
    }

    async fn wait_for_connect(
        &self,
        mut rx: watch::Receiver<Option<ConnectOutcome>>,
        ceiling: Option<Duration>,
    ) -> Result<()> {
        let outcome = match ceiling {
            Some(limit) => {
                match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
                    Ok(seen) => seen.map(|v| (*v).clone()),
                    Err(_) => {
                        AtomicLifecycleStats::record(&self.stats.wait_timeouts);
                        warn!(
                            "Gave up after {}ms waiting for connect attempt",
                            limit.as_millis()
                        );
                        return Err(Error::ConnectTimeout {
                            waited_ms: limit.as_millis() as u64,
                        });
                    }
                }
            }
            None => rx.wait_for(Option::is_some).await.map(|v| (*v).clone()),
        };

        match outcome {
            Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(message))) => Err(Error::connection(message)),
            Ok(None) | Err(_) => Err(Error::connection("connect attempt was abandoned")),
        }
    }

    fn spawn_connect(&self, config: Arc<SqlConfig>, tx: watch::Sender<Option<ConnectOutcome>>) {
        let driver = Arc::clone(&self.driver);
        let this = self.this.clone();

        // Runs detached so a cancelled caller cannot leave the slot in Connecting.
        tokio::spawn(async move {
            let started = Instant::now();
            let limit = Duration::from_millis(config.connect_timeout_ms);
            let result = match tokio::time::timeout(limit, driver.connect(&config)).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(format!(
                    "Failed to connect to {} via {}: {}",
                    config.address(),
                    driver.name(),
                    e
                )),
                Err(_) => Err(format!(
                    "Connect to {} timed out after {}ms",
                    config.address(),
                    config.connect_timeout_ms
                )),
            };

            let Some(manager) = this.upgrade() else {
                if let Ok(conn) = result {
                    let _ = conn.close().await;
                }
                return;
            };

            let outcome = manager.finish_connect(result, &config, started);
            let _ = tx.send(Some(outcome));
        });
    }

    fn finish_connect(
        &self,
        result: std::result::Result<Arc<dyn DriverConnection>, String>,
        config: &SqlConfig,
        started: Instant,
    ) -> ConnectOutcome {
        let mut state = self.state.lock();
        let mut timer = self.timer.lock();
        match result {
            Ok(conn) => {
                *state = Slot::Connected(conn);
                if timer.handle.is_none() {
                    self.arm_idle_timer(
                        &mut timer,
                        Duration::from_millis(config.connection_timeout_ms),
                    );
                }
                AtomicLifecycleStats::record(&self.stats.connects);
                info!(
                    server = %config.address(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Connected to SQL Server"
                );
                Ok(())
            }
            Err(message) => {
                *state = Slot::Disconnected;
                self.cancel_idle_timer(&mut timer);
                AtomicLifecycleStats::record(&self.stats.connect_failures);
                warn!("{}", message);
                Err(message)
            }
        }
    }

    fn arm_idle_timer(&self, timer: &mut IdleTimer, idle: Duration) {
        self.cancel_idle_timer(timer);
        let generation = timer.generation;
        let this = self.this.clone();
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(manager) = this.upgrade() {
                manager.on_idle_timeout(generation).await;
            }
        }));
    }

    fn cancel_idle_timer(&self, timer: &mut IdleTimer) {
        timer.generation = timer.generation.wrapping_add(1);
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    async fn on_idle_timeout(&self, generation: u64) {
        let conn = {
            let mut state = self.state.lock();
            let mut timer = self.timer.lock();
            if timer.generation != generation {
                return;
            }
            // this task is the armed handle; dropping it detaches instead of aborting
            timer.handle = None;
            take_connected(&mut state)
        };

        if let Some(conn) = conn {
            AtomicLifecycleStats::record(&self.stats.idle_closes);
            info!("Closing idle SQL Server connection");
            if let Err(e) = conn.close().await {
                warn!("Failed to close idle connection: {}", e);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("driver", &self.driver.name())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Move a connected slot to `Disconnected`, returning the connection. Other states are kept.
fn take_connected(slot: &mut Slot) -> Option<Arc<dyn DriverConnection>> {
    match std::mem::replace(slot, Slot::Disconnected) {
        Slot::Connected(conn) => Some(conn),
        other => {
            *slot = other;
            None
        }
    }
}
