//! Pooled, self-healing broker connection manager.
//!
//! The manager owns an arena of connection entries; scoped guards
//! carry an id back into the arena rather than a reference, so a
//! connection and its channels never form a cycle. At most `P`
//! connections and `P·K` channels exist at any moment, borrow order is
//! FIFO among equal-priority waiters, and `close()` drains every
//! channel sub-pool strictly before the connection pool.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use vectorforge_core::observe::{MetricsSink, NoopSink, NoopTracer, Tracer};
use vectorforge_core::service_state::ServiceState;

use crate::config::BrokerConfig;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, BrokerTransport, FailureClass,
};

/// Pause between re-scans when waiting on connection creation
const WAIT_TICK: Duration = Duration::from_millis(5);

struct ChannelSubPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<dyn BrokerChannel>>>,
}

impl ChannelSubPool {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
        }
    }
}

struct ConnectionEntry {
    conn: Arc<dyn BrokerConnection>,
    channels: Arc<ChannelSubPool>,
}

#[derive(Default)]
struct PoolState {
    next_id: u64,
    idle: VecDeque<u64>,
    entries: HashMap<u64, ConnectionEntry>,
    // In-flight connection creations, reserved under the lock so the
    // entry count never exceeds the pool size
    creating: usize,
}

impl PoolState {
    /// Drop entries whose connection died; stale idle ids are skipped
    /// at pop time
    fn prune_closed(&mut self) {
        self.entries.retain(|id, entry| {
            let live = !entry.conn.is_closed();
            if !live {
                debug!(connection_id = id, "pruning closed connection");
            }
            live
        });
    }

    fn pop_live_idle(&mut self) -> Option<(u64, Arc<dyn BrokerConnection>, Arc<ChannelSubPool>)> {
        while let Some(id) = self.idle.pop_front() {
            if let Some(entry) = self.entries.get(&id) {
                return Some((id, Arc::clone(&entry.conn), Arc::clone(&entry.channels)));
            }
        }
        None
    }
}

/// Point-in-time manager statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    /// Connections currently owned by the arena
    pub live_connections: usize,
    /// Connection attempts since construction
    pub connection_attempts: u64,
    /// Kind of the most recent connection error
    pub last_error_kind: Option<&'static str>,
    /// Consecutive failed health checks
    pub consecutive_health_failures: u32,
}

enum ChannelPlan {
    /// An entry with a free channel slot
    Fast(u64, Arc<dyn BrokerConnection>, Arc<ChannelSubPool>),
    /// Room in the pool for another connection
    Create,
    /// Pool saturated: wait on this entry's sub-pool
    Wait(u64, Arc<dyn BrokerConnection>, Arc<ChannelSubPool>),
    /// Nothing live yet; wait for an in-flight creation
    Retry,
}

/// Manages a bounded pool of broker connections with per-connection
/// channel sub-pools and a background health loop
pub struct BrokerConnectionManager {
    config: BrokerConfig,
    transport: Arc<dyn BrokerTransport>,
    sink: Arc<dyn MetricsSink>,
    tracer: Arc<dyn Tracer>,
    state: Arc<Mutex<PoolState>>,
    returned: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    lifecycle: Mutex<ServiceState>,
    connection_attempts: AtomicU64,
    last_error_kind: Mutex<Option<&'static str>>,
    health_failures: AtomicU32,
}

impl std::fmt::Debug for BrokerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnectionManager")
            .field("config", &self.config)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish_non_exhaustive()
    }
}

impl BrokerConnectionManager {
    /// Create a manager over an adapter-supplied transport
    #[must_use]
    pub fn new(config: BrokerConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        info!(
            pool_size = config.pool_size,
            max_channels = config.max_channels_per_connection,
            "broker connection manager created"
        );
        Self {
            config,
            transport,
            sink: Arc::new(NoopSink),
            tracer: Arc::new(NoopTracer),
            state: Arc::new(Mutex::new(PoolState::default())),
            returned: Arc::new(Notify::new()),
            shutdown_tx,
            health_task: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(ServiceState::Uninitialized),
            connection_attempts: AtomicU64::new(0),
            last_error_kind: Mutex::new(None),
            health_failures: AtomicU32::new(0),
        }
    }

    /// Record error events into a metrics sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Trace connection creation and health checks
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.lifecycle.lock().clone()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            live_connections: self.state.lock().entries.len(),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            last_error_kind: *self.last_error_kind.lock(),
            consecutive_health_failures: self.health_failures.load(Ordering::Relaxed),
        }
    }

    /// Borrow a connection exclusively from the pool
    ///
    /// Lazily creates connections up to the pool size; when all are
    /// borrowed, waits FIFO until one returns or the borrow budget
    /// elapses. The guard returns the connection on drop.
    pub async fn acquire_connection(&self) -> BrokerResult<ScopedConnection> {
        let deadline = Instant::now() + self.config.connection_timeout;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(BrokerError::Shutdown);
            }
            enum Plan {
                Borrow(u64, Arc<dyn BrokerConnection>),
                Create,
                Wait,
            }
            let plan = {
                let mut state = self.state.lock();
                state.prune_closed();
                if let Some((id, conn, _channels)) = state.pop_live_idle() {
                    Plan::Borrow(id, conn)
                } else if state.entries.len() + state.creating < self.config.pool_size {
                    state.creating += 1;
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };
            match plan {
                Plan::Borrow(id, conn) => {
                    return Ok(ScopedConnection {
                        id,
                        conn,
                        state: Arc::clone(&self.state),
                        returned: Arc::clone(&self.returned),
                        closing: Arc::clone(&self.closing),
                    });
                }
                Plan::Create => {
                    let (id, conn, _channels) = self.create_entry().await?;
                    return Ok(ScopedConnection {
                        id,
                        conn,
                        state: Arc::clone(&self.state),
                        returned: Arc::clone(&self.returned),
                        closing: Arc::clone(&self.closing),
                    });
                }
                Plan::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BrokerError::Timeout(format!(
                            "connection pool exhausted after {:?}",
                            self.config.connection_timeout
                        )));
                    }
                    let _ = timeout(remaining, self.returned.notified()).await;
                }
            }
        }
    }

    /// Create a connection and register it in the arena
    async fn create_entry(
        &self,
    ) -> BrokerResult<(u64, Arc<dyn BrokerConnection>, Arc<ChannelSubPool>)> {
        let created = self.create_connection().await;
        match created {
            Ok(conn) => {
                let mut state = self.state.lock();
                state.creating -= 1;
                let id = state.next_id;
                state.next_id += 1;
                let channels = Arc::new(ChannelSubPool::new(self.config.max_channels_per_connection));
                state.entries.insert(
                    id,
                    ConnectionEntry {
                        conn: Arc::clone(&conn),
                        channels: Arc::clone(&channels),
                    },
                );
                Ok((id, conn, channels))
            }
            Err(e) => {
                self.state.lock().creating -= 1;
                self.returned.notify_one();
                Err(e)
            }
        }
    }

    /// Create a connection, retrying transient failures
    ///
    /// Authentication failures surface immediately with no further
    /// attempts; transient failures retry up to the configured budget
    /// with a delay scaling linearly in the attempt number.
    async fn create_connection(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let params = self.config.connect_params();
        let mut span = self.tracer.start_span("broker_create_connection");
        span.set_attribute("broker.url", serde_json::json!(self.config.broker_url));
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.connection_attempts.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            match self.transport.connect(&self.config.broker_url, &params).await {
                Ok(conn) => {
                    span.set_attribute("broker.attempts", serde_json::json!(attempt));
                    span.set_status(true);
                    info!(
                        attempt,
                        connect_ms = started.elapsed().as_millis() as u64,
                        "broker connection established"
                    );
                    return Ok(Arc::from(conn));
                }
                Err(e) => {
                    span.record_error(&e);
                    *self.last_error_kind.lock() = Some(e.kind());
                    self.sink
                        .counter("rabbitmq_connection_error", 1, &[("kind", e.kind())]);
                    match e.classify() {
                        FailureClass::Fatal => {
                            span.set_status(false);
                            error!(error = %e, "fatal broker connection failure");
                            return Err(e);
                        }
                        FailureClass::Transient if attempt < self.config.max_retry_attempts => {
                            let delay = self.config.retry_delay * attempt;
                            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                                "transient broker connection failure, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        FailureClass::Transient => {
                            span.set_status(false);
                            error!(attempt, error = %e, "broker connection retries exhausted");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Borrow a channel from a connection's sub-pool
    ///
    /// Prefers a connection with a free channel slot, opens a new
    /// connection when the pool has room, and otherwise waits on a
    /// saturated sub-pool until the budget elapses. QoS is set when a
    /// channel is first created; closed idle channels are dropped and
    /// re-created. A channel is never yielded on a closed connection.
    pub async fn acquire_channel(&self) -> BrokerResult<ScopedChannel> {
        let deadline = Instant::now() + self.config.channel_operation_timeout;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(BrokerError::Shutdown);
            }
            let plan = {
                let mut state = self.state.lock();
                state.prune_closed();
                let free_slot = state
                    .entries
                    .iter()
                    .find(|(_, e)| e.channels.semaphore.available_permits() > 0)
                    .map(|(id, e)| (*id, Arc::clone(&e.conn), Arc::clone(&e.channels)));
                if let Some((id, conn, channels)) = free_slot {
                    ChannelPlan::Fast(id, conn, channels)
                } else if state.entries.len() + state.creating < self.config.pool_size {
                    state.creating += 1;
                    ChannelPlan::Create
                } else if let Some((id, e)) = state.entries.iter().next() {
                    ChannelPlan::Wait(*id, Arc::clone(&e.conn), Arc::clone(&e.channels))
                } else {
                    ChannelPlan::Retry
                }
            };

            match plan {
                ChannelPlan::Fast(id, conn, channels) => {
                    let Ok(permit) = Arc::clone(&channels.semaphore).try_acquire_owned() else {
                        // Lost the slot to a concurrent borrower
                        continue;
                    };
                    return self.checkout_channel(id, conn, channels, permit).await;
                }
                ChannelPlan::Create => {
                    let (id, conn, channels) = self.create_entry().await.map_err(|e| {
                        self.sink
                            .counter("rabbitmq_channel_error", 1, &[("kind", e.kind())]);
                        e
                    })?;
                    // Fresh connections also serve exclusive borrows
                    {
                        let mut state = self.state.lock();
                        state.idle.push_back(id);
                    }
                    self.returned.notify_one();
                    let Ok(permit) = Arc::clone(&channels.semaphore).try_acquire_owned() else {
                        continue;
                    };
                    return self.checkout_channel(id, conn, channels, permit).await;
                }
                ChannelPlan::Wait(id, conn, channels) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.sink
                            .counter("rabbitmq_channel_error", 1, &[("kind", "timeout")]);
                        return Err(BrokerError::Timeout(format!(
                            "channel pool for connection {id} exhausted after {:?}",
                            self.config.channel_operation_timeout
                        )));
                    }
                    match timeout(remaining, Arc::clone(&channels.semaphore).acquire_owned()).await
                    {
                        Err(_) => {
                            self.sink
                                .counter("rabbitmq_channel_error", 1, &[("kind", "timeout")]);
                            return Err(BrokerError::Timeout(format!(
                                "channel pool for connection {id} exhausted after {:?}",
                                self.config.channel_operation_timeout
                            )));
                        }
                        Ok(Err(_)) => return Err(BrokerError::Shutdown),
                        Ok(Ok(permit)) => {
                            if conn.is_closed() {
                                // Resolved at the next scan: the entry is pruned
                                drop(permit);
                                continue;
                            }
                            return self.checkout_channel(id, conn, channels, permit).await;
                        }
                    }
                }
                ChannelPlan::Retry => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BrokerError::Timeout(
                            "no broker connection became available".into(),
                        ));
                    }
                    tokio::time::sleep(WAIT_TICK.min(remaining)).await;
                }
            }
        }
    }

    async fn checkout_channel(
        &self,
        connection_id: u64,
        conn: Arc<dyn BrokerConnection>,
        channels: Arc<ChannelSubPool>,
        permit: OwnedSemaphorePermit,
    ) -> BrokerResult<ScopedChannel> {
        let reused = channels.idle.lock().pop();
        let channel = match reused {
            Some(ch) if ch.is_open() => ch,
            Some(_dead) => {
                debug!(connection_id, "dropping closed idle channel");
                self.create_channel(&conn).await?
            }
            None => self.create_channel(&conn).await?,
        };
        // Never yield a channel whose parent connection is closed
        if conn.is_closed() {
            self.state.lock().entries.remove(&connection_id);
            return Err(BrokerError::Channel(format!(
                "parent connection {connection_id} is closed"
            )));
        }
        Ok(ScopedChannel {
            channel,
            conn,
            connection_id,
            channels,
            closing: Arc::clone(&self.closing),
            _permit: permit,
        })
    }

    async fn create_channel(
        &self,
        conn: &Arc<dyn BrokerConnection>,
    ) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = match conn.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.sink
                    .counter("rabbitmq_channel_error", 1, &[("kind", e.kind())]);
                return Err(BrokerError::Channel(format!("channel creation failed: {e}")));
            }
        };
        channel.set_qos(self.config.prefetch).await?;
        debug!(prefetch = self.config.prefetch, "broker channel created");
        Ok(Arc::from(channel))
    }

    /// Spawn the background health loop; safe to call once
    pub fn start(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.is_running() {
                warn!("broker connection manager already started");
                return;
            }
            *lifecycle = ServiceState::Running;
        }
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.monitoring_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately and checks at startup
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => manager.health_check_once().await,
                }
            }
        });
        *self.health_task.lock() = Some(handle);
        info!("broker connection manager started");
    }

    /// One health-loop iteration; the loop never aborts on failure
    async fn health_check_once(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let mut span = self.tracer.start_span("broker_health_check");
        let started = Instant::now();
        match self.acquire_channel().await {
            Ok(channel) if channel.is_open() => {
                self.health_failures.store(0, Ordering::Relaxed);
                span.set_status(true);
                debug!(
                    check_ms = started.elapsed().as_millis() as u64,
                    "broker health check passed"
                );
            }
            Ok(channel) => {
                span.set_status(false);
                self.record_health_failure(Some(channel.connection_id()), "channel not open");
            }
            Err(BrokerError::Shutdown) => {}
            Err(e) => {
                span.record_error(&e);
                span.set_status(false);
                self.record_health_failure(None, e.kind());
            }
        }
    }

    fn record_health_failure(&self, connection_id: Option<u64>, reason: &str) {
        let failures = self.health_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let failures_label = failures.to_string();
        let connection_label =
            connection_id.map_or_else(|| "unknown".to_string(), |id| id.to_string());
        self.sink.counter(
            "rabbitmq_health_check_error",
            1,
            &[
                ("connection_id", connection_label.as_str()),
                ("consecutive_failures", failures_label.as_str()),
            ],
        );
        error!(connection_id = ?connection_id, consecutive_failures = failures, reason,
            "broker health check failed");
    }

    /// Cancel the health loop and close every channel, then every
    /// connection; idempotent
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.returned.notify_waiters();

        let entries: Vec<ConnectionEntry> = {
            let mut state = self.state.lock();
            state.idle.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        // Channel sub-pools drain strictly before the connection pool
        for entry in &entries {
            entry.channels.semaphore.close();
            let channels: Vec<_> = entry.channels.idle.lock().drain(..).collect();
            for channel in channels {
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "error closing broker channel");
                }
            }
        }
        for entry in entries {
            if let Err(e) = entry.conn.close().await {
                warn!(error = %e, "error closing broker connection");
            }
        }

        *self.lifecycle.lock() = ServiceState::Stopped;
        let last_error = *self.last_error_kind.lock();
        info!(
            attempts = self.connection_attempts.load(Ordering::Relaxed),
            ?last_error,
            "broker connection manager closed"
        );
    }
}

/// Scoped exclusive borrow of a pooled connection; returns on drop
pub struct ScopedConnection {
    id: u64,
    conn: Arc<dyn BrokerConnection>,
    state: Arc<Mutex<PoolState>>,
    returned: Arc<Notify>,
    closing: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ScopedConnection {
    /// Arena id of this connection
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The underlying connection capability
    #[must_use]
    pub fn connection(&self) -> &dyn BrokerConnection {
        self.conn.as_ref()
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            if self.conn.is_closed() {
                // Recovery: drop the dead connection so later borrows
                // create a fresh one
                state.entries.remove(&self.id);
            } else if state.entries.contains_key(&self.id) {
                state.idle.push_back(self.id);
            }
        }
        self.returned.notify_one();
    }
}

/// Scoped borrow of a channel; returns to its sub-pool on drop
pub struct ScopedChannel {
    channel: Arc<dyn BrokerChannel>,
    conn: Arc<dyn BrokerConnection>,
    connection_id: u64,
    channels: Arc<ChannelSubPool>,
    closing: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ScopedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedChannel")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl ScopedChannel {
    /// Arena id of the parent connection
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The underlying channel capability
    #[must_use]
    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }

    /// Whether the channel is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

impl std::ops::Deref for ScopedChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        // A closed channel, a closed parent, or a shutdown manager
        // means the channel is discarded rather than pooled.
        if self.closing.load(Ordering::SeqCst) || !self.channel.is_open() || self.conn.is_closed()
        {
            return;
        }
        self.channels.idle.lock().push(Arc::clone(&self.channel));
    }
}
