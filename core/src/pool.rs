//! Connection pool over a fixed set of endpoints.
//!
//! # Design
//! All selection state lives behind one `Mutex`; a `Condvar` wakes callers
//! waiting for capacity. Connections are opened outside the lock after a
//! slot has been reserved, so a slow connect never stalls other callers.
//!
//! Endpoint selection is round-robin over live endpoints. A transport failure
//! marks the endpoint dead for `dead_timeout`, doubled per consecutive failure
//! up to 2^5. When every endpoint is dead the one due back soonest is used.
//!
//! A checked-out connection is a `PooledConnection` guard that goes back to
//! the pool when dropped, so release happens exactly once on every exit path.

use std::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connection::{Connection, Connector, TransportError};
use crate::endpoint::Endpoint;
use crate::http::{HttpRequest, HttpResponse};

const DEAD_BACKOFF_CUTOFF: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("max_connections must be at least 1")]
    ZeroCapacity,

    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),

    #[error(transparent)]
    Connect(#[from] TransportError),
}

/// Tuning knobs for `ConnectionPool`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on open connections (idle + checked out) across all endpoints.
    pub max_connections: usize,

    /// How long `acquire` waits for capacity before giving up.
    pub acquire_timeout: Duration,

    /// TCP connect timeout handed to the connector.
    pub connect_timeout: Duration,

    /// Whole-request timeout handed to the connector; `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// Base time an endpoint sits out after a transport failure.
    pub dead_timeout: Duration,

    /// Consecutive failures after which a connection is retired.
    pub max_connection_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            dead_timeout: Duration::from_secs(60),
            max_connection_failures: 3,
        }
    }
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_reused: u64,
    pub total_retired: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub failed_connects: u64,
    pub in_use: usize,
    pub idle: usize,
}

struct Slot<T> {
    conn: T,
    endpoint: usize,
    failures: u32,
    use_count: u64,
    created_at: Instant,
}

impl<T> Slot<T> {
    fn new(conn: T, endpoint: usize) -> Self {
        Self {
            conn,
            endpoint,
            failures: 0,
            use_count: 1,
            created_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct EndpointHealth {
    failures: u32,
    dead_until: Option<Instant>,
}

impl EndpointHealth {
    fn is_alive(&self, now: Instant) -> bool {
        self.dead_until.map_or(true, |until| now >= until)
    }
}

struct PoolState<T> {
    idle: Vec<Slot<T>>,
    in_use: usize,
    cursor: usize,
    health: Vec<EndpointHealth>,
    stats: PoolStats,
}

impl<T> PoolState<T> {
    fn select_endpoint(&mut self, now: Instant) -> usize {
        let len = self.health.len();
        let start = self.cursor % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if self.health[index].is_alive(now) {
                self.cursor = index + 1;
                return index;
            }
        }

        let index = (0..len)
            .min_by_key(|&i| self.health[i].dead_until)
            .unwrap_or(start);
        self.cursor = index + 1;
        index
    }

    fn mark_dead(&mut self, index: usize, now: Instant, dead_timeout: Duration) -> Duration {
        let health = &mut self.health[index];
        health.failures = health.failures.saturating_add(1);
        let exponent = (health.failures - 1).min(DEAD_BACKOFF_CUTOFF);
        let timeout = dead_timeout.saturating_mul(1u32 << exponent);
        health.dead_until = Some(now + timeout);
        timeout
    }

    fn mark_live(&mut self, index: usize) {
        let health = &mut self.health[index];
        health.failures = 0;
        health.dead_until = None;
    }

    fn open_count(&self) -> usize {
        self.in_use + self.idle.len()
    }
}

/// Hands out one connection per request from a bounded set.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    endpoints: Vec<Endpoint>,
    config: PoolConfig,
    state: Mutex<PoolState<C::Conn>>,
    available: Condvar,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, endpoints: Vec<Endpoint>, config: PoolConfig) -> Result<Self, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }
        if config.max_connections == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        info!(
            endpoints = endpoints.len(),
            max_connections = config.max_connections,
            "created connection pool"
        );

        let health = endpoints.iter().map(|_| EndpointHealth::default()).collect();
        Ok(Self {
            connector,
            endpoints,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(config.max_connections),
                in_use: 0,
                cursor: 0,
                health,
                stats: PoolStats::default(),
            }),
            config,
            available: Condvar::new(),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection, reusing an idle one for the selected endpoint
    /// or opening a new one while under capacity. Blocks for at most
    /// `acquire_timeout` when the pool is saturated.
    pub fn acquire(&self) -> Result<PooledConnection<'_, C>, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut state = self.lock();

        loop {
            let now = Instant::now();
            let index = state.select_endpoint(now);

            if let Some(pos) = state.idle.iter().rposition(|slot| slot.endpoint == index) {
                let mut slot = state.idle.remove(pos);
                slot.use_count += 1;
                state.in_use += 1;
                state.stats.total_reused += 1;
                state.stats.total_acquired += 1;
                debug!(
                    endpoint = %self.endpoints[index],
                    use_count = slot.use_count,
                    age_ms = slot.created_at.elapsed().as_millis() as u64,
                    "reusing connection"
                );
                return Ok(PooledConnection::new(self, slot));
            }

            // Full of idle connections to other endpoints: make room.
            if state.open_count() >= self.config.max_connections && !state.idle.is_empty() {
                let evicted = state.idle.remove(0);
                state.stats.total_retired += 1;
                debug!(endpoint = %self.endpoints[evicted.endpoint], "evicting idle connection");
            }

            if state.open_count() < self.config.max_connections {
                state.in_use += 1;
                drop(state);
                return self.open(index);
            }

            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                warn!(
                    in_use = state.in_use,
                    max_connections = self.config.max_connections,
                    "connection pool exhausted"
                );
                return Err(PoolError::Timeout(self.config.acquire_timeout));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Return a connection. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<'_, C>) {
        drop(conn);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.in_use = state.in_use;
        stats.idle = state.idle.len();
        stats
    }

    /// Open a connection for a slot already reserved in `in_use`.
    fn open(&self, index: usize) -> Result<PooledConnection<'_, C>, PoolError> {
        let endpoint = &self.endpoints[index];
        match self.connector.connect(endpoint) {
            Ok(conn) => {
                let mut state = self.lock();
                state.stats.total_created += 1;
                state.stats.total_acquired += 1;
                info!(endpoint = %endpoint, total_created = state.stats.total_created, "opened connection");
                drop(state);
                Ok(PooledConnection::new(self, Slot::new(conn, index)))
            }
            Err(err) => {
                let mut state = self.lock();
                state.in_use -= 1;
                state.stats.failed_connects += 1;
                let timeout = state.mark_dead(index, Instant::now(), self.config.dead_timeout);
                drop(state);
                self.available.notify_one();
                warn!(endpoint = %endpoint, error = %err, dead_for_ms = timeout.as_millis() as u64, "connect failed");
                Err(err.into())
            }
        }
    }

    fn record_success(&self, index: usize) {
        let mut state = self.lock();
        if state.health[index].failures > 0 {
            state.mark_live(index);
            info!(endpoint = %self.endpoints[index], "endpoint back in rotation");
        }
    }

    fn record_failure(&self, index: usize) {
        let timeout = self
            .lock()
            .mark_dead(index, Instant::now(), self.config.dead_timeout);
        warn!(
            endpoint = %self.endpoints[index],
            dead_for_ms = timeout.as_millis() as u64,
            "endpoint marked dead"
        );
    }

    fn check_in(&self, slot: Slot<C::Conn>) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.stats.total_released += 1;
        if slot.failures >= self.config.max_connection_failures.max(1) {
            state.stats.total_retired += 1;
            warn!(
                endpoint = %self.endpoints[slot.endpoint],
                failures = slot.failures,
                "retiring connection"
            );
        } else {
            state.idle.push(slot);
        }
        drop(state);
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C::Conn>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection checked out of a `ConnectionPool`.
///
/// Requests go through `perform` so failures count against the connection
/// and its endpoint. Dropping the guard returns the connection.
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    slot: Option<Slot<C::Conn>>,
}

impl<'a, C: Connector> PooledConnection<'a, C> {
    fn new(pool: &'a ConnectionPool<C>, slot: Slot<C::Conn>) -> Self {
        Self { pool, slot: Some(slot) }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoints[self.slot().endpoint]
    }

    pub fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let pool = self.pool;
        let slot = self.slot_mut();
        match slot.conn.perform(request) {
            Ok(response) => {
                slot.failures = 0;
                pool.record_success(slot.endpoint);
                Ok(response)
            }
            Err(err) => {
                slot.failures += 1;
                pool.record_failure(slot.endpoint);
                Err(err)
            }
        }
    }

    fn slot(&self) -> &Slot<C::Conn> {
        self.slot.as_ref().expect("slot is only taken on drop")
    }

    fn slot_mut(&mut self) -> &mut Slot<C::Conn> {
        self.slot.as_mut().expect("slot is only taken on drop")
    }
}

impl<C: Connector> Deref for PooledConnection<'_, C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        &self.slot().conn
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.check_in(slot);
        }
    }
}
