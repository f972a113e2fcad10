//! Bounded connection pool over a single SQLite file.
//!
//! Connections are handed out as [`PooledConnection`] leases. A lease returns
//! its connection to the pool when dropped, so release happens on every exit
//! path of the borrowing code, including errors and panics.
//!
//! Acquisition order:
//! 1. reuse an idle connection,
//! 2. open a new one while below `max_connections`,
//! 3. otherwise park in a FIFO queue until a release hands over a connection
//!    or `acquire_timeout_ms` elapses.
//!
//! A released connection goes straight to the oldest live waiter instead of
//! becoming idle, which keeps service strictly FIFO.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{Result, StorageError};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub pending_requests: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub requests_served: u64,
    /// Cumulative wait divided by every served request, including ones that never waited.
    pub average_wait_ms: f64,
    pub peak_connections: usize,
    /// Longest time any idle connection has gone unused.
    pub longest_idle_ms: u64,
}

/// Result of [`ConnectionPool::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub metrics: PoolMetrics,
}

struct Slot {
    in_use: bool,
    created_at: Instant,
    last_used: Instant,
}

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    sender: oneshot::Sender<PooledConnection>,
}

#[derive(Default)]
struct Counters {
    total_created: u64,
    total_destroyed: u64,
    requests_served: u64,
    total_wait: Duration,
    peak_connections: usize,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<u64, Slot>,
    idle: Vec<(u64, Connection)>,
    waiters: VecDeque<Waiter>,
    next_connection_id: u64,
    next_waiter_id: u64,
    /// Slots reserved by acquisitions that are opening a connection outside the lock.
    opening: usize,
    shutting_down: bool,
    counters: Counters,
}

impl PoolState {
    fn register(&mut self, now: Instant) -> u64 {
        self.next_connection_id += 1;
        let id = self.next_connection_id;
        self.slots.insert(
            id,
            Slot {
                in_use: false,
                created_at: now,
                last_used: now,
            },
        );
        self.counters.total_created += 1;
        self.counters.peak_connections = self.counters.peak_connections.max(self.slots.len());
        id
    }

    fn mark_in_use(&mut self, id: u64, now: Instant) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.in_use = true;
            slot.last_used = now;
        }
    }

    fn mark_idle(&mut self, id: u64, now: Instant) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.in_use = false;
            slot.last_used = now;
        }
    }

    fn record_served(&mut self, waited: Duration) {
        self.counters.requests_served += 1;
        self.counters.total_wait += waited;
    }

    fn prune_abandoned_waiters(&mut self) {
        self.waiters.retain(|w| !w.sender.is_closed());
    }

    fn enqueue_waiter(&mut self, now: Instant) -> (u64, oneshot::Receiver<PooledConnection>) {
        let (sender, receiver) = oneshot::channel();
        self.next_waiter_id += 1;
        let id = self.next_waiter_id;
        self.waiters.push_back(Waiter {
            id,
            enqueued_at: now,
            sender,
        });
        (id, receiver)
    }

    fn destroy(&mut self, id: u64, conn: Connection) {
        self.slots.remove(&id);
        self.counters.total_destroyed += 1;
        if let Err((_, err)) = conn.close() {
            tracing::warn!(connection_id = id, error = %err, "failed to close pooled connection");
        }
    }

    fn metrics(&self) -> PoolMetrics {
        let active = self.slots.values().filter(|s| s.in_use).count();
        let longest_idle = self
            .slots
            .values()
            .filter(|s| !s.in_use)
            .map(|s| s.last_used.elapsed())
            .max()
            .unwrap_or_default();
        let served = self.counters.requests_served;
        PoolMetrics {
            total_connections: self.slots.len(),
            active_connections: active,
            idle_connections: self.idle.len(),
            pending_requests: self.waiters.len(),
            total_created: self.counters.total_created,
            total_destroyed: self.counters.total_destroyed,
            requests_served: served,
            average_wait_ms: if served == 0 {
                0.0
            } else {
                self.counters.total_wait.as_secs_f64() * 1000.0 / served as f64
            },
            peak_connections: self.counters.peak_connections,
            longest_idle_ms: longest_idle.as_millis() as u64,
        }
    }
}

struct Shared {
    path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl Shared {
    /// Lock pool state. Bookkeeping stays consistent even if a holder panicked,
    /// so a poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(self: &Arc<Self>, id: u64, conn: Connection) {
        let now = Instant::now();
        let mut state = self.lock();

        if state.shutting_down {
            state.destroy(id, conn);
            tracing::debug!(connection_id = id, "connection closed on release during shutdown");
            return;
        }

        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            state.mark_in_use(id, now);
            let lease = PooledConnection {
                id,
                conn: Some(conn),
                shared: Arc::clone(self),
            };
            match waiter.sender.send(lease) {
                Ok(()) => {
                    state.record_served(now.saturating_duration_since(waiter.enqueued_at));
                    tracing::trace!(connection_id = id, waiter_id = waiter.id, "connection handed to waiter");
                    return;
                }
                Err(mut returned) => match returned.conn.take() {
                    // waiter gave up; try the next one
                    Some(c) => conn = c,
                    None => return,
                },
            }
        }

        state.mark_idle(id, now);
        state.idle.push((id, conn));
    }
}

/// A slot reserved while a connection opens without the state lock held.
/// Dropped unclaimed (the acquiring future was cancelled), it frees the slot.
struct Reservation {
    shared: Arc<Shared>,
    claimed: bool,
}

impl Reservation {
    fn claim(mut self, state: &mut PoolState) {
        state.opening -= 1;
        self.claimed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.claimed {
            self.shared.lock().opening -= 1;
        }
    }
}

/// A connection borrowed from the pool. Returned to the pool on drop.
pub struct PooledConnection {
    id: u64,
    conn: Option<Connection>,
    shared: Arc<Shared>,
}

impl PooledConnection {
    /// Pool-assigned identifier, stable for the connection's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until the lease is dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until the lease is dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(self.id, conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

/// Bounded pool of connections to one database file. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create the pool and eagerly open `min_connections` connections.
    ///
    /// Failure to open an initial connection is logged, not returned: the pool
    /// starts under-provisioned and grows on demand.
    pub fn new(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(StorageError::InvalidPoolConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if config.min_connections > config.max_connections {
            return Err(StorageError::InvalidPoolConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                config.min_connections, config.max_connections
            )));
        }

        let pool = Self {
            shared: Arc::new(Shared {
                path: path.as_ref().to_path_buf(),
                config,
                state: Mutex::new(PoolState::default()),
            }),
        };

        let mut initial = Vec::with_capacity(pool.shared.config.min_connections);
        for _ in 0..pool.shared.config.min_connections {
            match crate::db::open_connection(&pool.shared.path) {
                Ok(conn) => initial.push(conn),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to open initial pooled connection");
                }
            }
        }

        {
            let mut state = pool.shared.lock();
            let now = Instant::now();
            for conn in initial {
                let id = state.register(now);
                state.idle.push((id, conn));
            }
            tracing::info!(
                path = %pool.shared.path.display(),
                connections = state.slots.len(),
                min = pool.shared.config.min_connections,
                max = pool.shared.config.max_connections,
                "connection pool initialized"
            );
        }

        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn lease(&self, id: u64, conn: Connection) -> PooledConnection {
        PooledConnection {
            id,
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Borrow a connection, waiting in FIFO order when the pool is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let mut may_open = true;

        let (waiter_id, mut receiver) = loop {
            let reservation = {
                let mut state = self.shared.lock();
                if state.shutting_down {
                    return Err(StorageError::PoolShutdown);
                }

                if let Some((id, conn)) = state.idle.pop() {
                    state.mark_in_use(id, started);
                    state.record_served(Duration::ZERO);
                    return Ok(self.lease(id, conn));
                }

                state.prune_abandoned_waiters();
                if may_open && state.slots.len() + state.opening < self.shared.config.max_connections {
                    state.opening += 1;
                    Reservation {
                        shared: Arc::clone(&self.shared),
                        claimed: false,
                    }
                } else {
                    let (waiter_id, receiver) = state.enqueue_waiter(started);
                    tracing::debug!(waiter_id, pending = state.waiters.len(), "pool exhausted; queued acquisition");
                    break (waiter_id, receiver);
                }
            };

            match self.open_reserved(reservation).await {
                Ok(lease) => return Ok(lease),
                Err(StorageError::PoolShutdown) => return Err(StorageError::PoolShutdown),
                Err(err) => {
                    // A release may have landed while opening; look again, then wait.
                    tracing::warn!(error = %err, "failed to open pooled connection; waiting for a release");
                    may_open = false;
                }
            }
        };

        match tokio::time::timeout(self.shared.config.acquire_timeout(), &mut receiver).await {
            Ok(Ok(lease)) => Ok(lease),
            // sender dropped without a connection: the pool shut down
            Ok(Err(_)) => Err(StorageError::PoolShutdown),
            Err(_) => self.settle_timed_out(waiter_id, receiver, started),
        }
    }

    /// Open a connection for a reserved slot. The file I/O runs on a blocking
    /// worker so the state lock is never held across it.
    async fn open_reserved(&self, reservation: Reservation) -> Result<PooledConnection> {
        let path = self.shared.path.clone();
        let opened = tokio::task::spawn_blocking(move || crate::db::open_connection(&path))
            .await
            .map_err(StorageError::from)
            .and_then(|result| result);

        let mut state = self.shared.lock();
        reservation.claim(&mut state);
        let conn = opened?;

        if state.shutting_down {
            drop(state);
            if let Err((_, err)) = conn.close() {
                tracing::warn!(error = %err, "failed to close connection opened during shutdown");
            }
            return Err(StorageError::PoolShutdown);
        }

        let now = Instant::now();
        let id = state.register(now);
        state.mark_in_use(id, now);
        state.record_served(Duration::ZERO);
        tracing::debug!(connection_id = id, total = state.slots.len(), "opened pooled connection");
        Ok(self.lease(id, conn))
    }

    /// Resolve a waiter whose timer fired. A release or a shutdown may have
    /// reached it first.
    fn settle_timed_out(
        &self,
        waiter_id: u64,
        mut receiver: oneshot::Receiver<PooledConnection>,
        started: Instant,
    ) -> Result<PooledConnection> {
        let waited_ms = started.elapsed().as_millis() as u64;
        let mut state = self.shared.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.id != waiter_id);
        if state.waiters.len() < before {
            drop(state);
            tracing::warn!(waiter_id, waited_ms, "timed out waiting for a pooled connection");
            return Err(StorageError::AcquireTimeout { waited_ms });
        }
        drop(state);

        match receiver.try_recv() {
            Ok(lease) => Ok(lease),
            Err(oneshot::error::TryRecvError::Closed) => Err(StorageError::PoolShutdown),
            Err(oneshot::error::TryRecvError::Empty) => Err(StorageError::AcquireTimeout { waited_ms }),
        }
    }

    /// Run `f` with a borrowed connection on a blocking worker.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let lease = self.acquire().await?;
        tokio::task::spawn_blocking(move || f(&*lease)).await?
    }

    /// Run `f` inside a transaction on a borrowed connection. Commits on `Ok`,
    /// rolls back on `Err`.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut lease = self.acquire().await?;
        tokio::task::spawn_blocking(move || -> Result<T> {
            let tx = lease.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await?
    }

    pub fn metrics(&self) -> PoolMetrics {
        let mut state = self.shared.lock();
        state.prune_abandoned_waiters();
        state.metrics()
    }

    /// Report problems: under-provisioned, backlog above capacity, or a failing
    /// test query.
    pub async fn health_check(&self) -> PoolHealth {
        let metrics = self.metrics();
        let mut issues = Vec::new();

        if metrics.total_connections < self.shared.config.min_connections {
            issues.push(format!(
                "connection count {} is below minimum {}",
                metrics.total_connections, self.shared.config.min_connections
            ));
        }
        if metrics.pending_requests > self.shared.config.max_connections {
            issues.push(format!(
                "{} pending requests exceed pool capacity {}",
                metrics.pending_requests, self.shared.config.max_connections
            ));
        }

        let test_query = self
            .with_connection(|conn| {
                let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
                Ok(one)
            })
            .await;
        match test_query {
            Ok(1) => {}
            Ok(other) => issues.push(format!("test query returned {other}")),
            Err(err) => issues.push(format!("test query failed: {err}")),
        }

        PoolHealth {
            healthy: issues.is_empty(),
            issues,
            metrics: self.metrics(),
        }
    }

    /// Stop the pool: reject new and pending acquisitions and close every idle
    /// connection. Leased connections are closed as they come back.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if state.shutting_down && state.slots.is_empty() {
            return;
        }
        state.shutting_down = true;

        // Dropping the senders wakes every waiter with a shutdown error.
        let rejected = state.waiters.len();
        state.waiters.clear();

        let idle = std::mem::take(&mut state.idle);
        let closed = idle.len();
        for (id, conn) in idle {
            state.destroy(id, conn);
        }

        tracing::info!(
            rejected_waiters = rejected,
            closed_connections = closed,
            leased = state.slots.len(),
            "connection pool shut down"
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }

    /// Age of the oldest live connection.
    pub fn oldest_connection_age(&self) -> Option<Duration> {
        let state = self.shared.lock();
        state.slots.values().map(|s| s.created_at.elapsed()).max()
    }
}
