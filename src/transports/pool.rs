//! Shared connection pool discipline (`get`/`release`/`close`/`close_all`) used by
//! every transport that maintains persistent connections (WebSocket, GraphQL,
//! gRPC, TCP, UDP). Keyed by an opaque `PoolKey`; eviction and reconnect policy are
//! generic over the pooled connection type `C`.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::errors::UtcpError;
use crate::telemetry::{Event, EventSink};

/// Identifies a pooled connection. Transports derive this from provider-identifying
/// fields: `url:name` for WebSocket/GraphQL, `host:port` for TCP/UDP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey(pub String);

impl PoolKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Anything a pool can manage the lifecycle of: connect, check liveness, close.
#[async_trait::async_trait]
pub trait PooledConnection: Send + Sync {
    fn state(&self) -> ConnectionState;
    async fn close(&self);
}

struct Entry<C> {
    conn: Arc<C>,
    last_used: Instant,
}

/// Pool configuration. Defaults match the reconnect/eviction policy shared by every
/// pooled transport.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub keep_alive: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_multiplier: u32,
    pub max_reconnect_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            keep_alive: Duration::from_secs(300),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_multiplier: 2,
            max_reconnect_attempts: 3,
        }
    }
}

/// Generic pool of connections keyed by `PoolKey`. `C` is the concrete connection
/// type a transport manages (e.g. a WebSocket stream handle).
pub struct ConnectionPool<C: PooledConnection> {
    config: PoolConfig,
    entries: Mutex<HashMap<PoolKey, Entry<C>>>,
    sink: Arc<dyn EventSink>,
    transport: &'static str,
}

impl<C: PooledConnection + 'static> ConnectionPool<C> {
    pub fn new(config: PoolConfig, sink: Arc<dyn EventSink>, transport: &'static str) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            sink,
            transport,
        }
    }

    /// Fetch a connection for `key`, opening one (or reconnecting a stale one) with
    /// `connect` if needed. Evicts the least-recently-used entry when at capacity.
    pub async fn get<F, Fut>(&self, key: &PoolKey, connect: F) -> Result<Arc<C>, UtcpError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C, UtcpError>>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key) {
            match entry.conn.state() {
                ConnectionState::Connected => {
                    entry.last_used = Instant::now();
                    self.sink.emit(Event::Connection {
                        pool_key: key.0.clone(),
                        action: "reuse",
                    });
                    return Ok(entry.conn.clone());
                }
                ConnectionState::Disconnected | ConnectionState::Error => {
                    drop(entries);
                    let conn = self.reconnect(key, &connect).await?;
                    let mut entries = self.entries.lock().await;
                    entries.insert(
                        key.clone(),
                        Entry {
                            conn: conn.clone(),
                            last_used: Instant::now(),
                        },
                    );
                    return Ok(conn);
                }
                ConnectionState::Connecting => {
                    entry.last_used = Instant::now();
                    return Ok(entry.conn.clone());
                }
            }
        }

        if entries.len() >= self.config.max_connections {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = entries.remove(&lru_key) {
                    evicted.conn.close().await;
                    self.sink.emit(Event::Connection {
                        pool_key: lru_key.0,
                        action: "evict",
                    });
                }
            }
        }

        drop(entries);
        let conn = Arc::new(connect().await.map_err(|e| {
            UtcpError::ConnectFailed(format!("{}: {e}", key.0))
        })?);
        self.sink.emit(Event::Connection {
            pool_key: key.0.clone(),
            action: "open",
        });
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.clone(),
            Entry {
                conn: conn.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(conn)
    }

    async fn reconnect<F, Fut>(&self, key: &PoolKey, connect: &F) -> Result<Arc<C>, UtcpError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C, UtcpError>>,
    {
        let mut delay = self.config.reconnect_base_delay;
        let mut last_err = None;
        for attempt in 0..self.config.max_reconnect_attempts {
            if attempt > 0 {
                sleep(delay).await;
                delay *= self.config.reconnect_multiplier;
            }
            match connect().await {
                Ok(conn) => {
                    self.sink.emit(Event::Connection {
                        pool_key: key.0.clone(),
                        action: "reconnect",
                    });
                    return Ok(Arc::new(conn));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(UtcpError::ConnectFailed(format!(
            "{}: exhausted reconnect attempts ({})",
            key.0,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Refresh `last_used` for a connection. Connections are pooled, not
    /// per-use-checked-out, so this is a no-op beyond the timestamp bump.
    pub async fn release(&self, key: &PoolKey) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.last_used = Instant::now();
        }
    }

    /// Forcibly close and remove the entry for `key`, if any.
    pub async fn close(&self, key: &PoolKey) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(key) {
            entry.conn.close().await;
            self.sink.emit(Event::Connection {
                pool_key: key.0.clone(),
                action: "close",
            });
        }
    }

    /// Close every pooled connection and clear the pool.
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;
        for (key, entry) in entries.drain() {
            entry.conn.close().await;
            self.sink.emit(Event::Connection {
                pool_key: key.0,
                action: "close",
            });
        }
    }

    /// Evict any entry idle longer than the pool's keep-alive window. Intended to be
    /// driven by a periodic sweeper task.
    pub async fn sweep_idle(&self) {
        let mut entries = self.entries.lock().await;
        let stale: Vec<PoolKey> = entries
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() > self.config.keep_alive)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(entry) = entries.remove(&key) {
                entry.conn.close().await;
                self.sink.emit(Event::Connection {
                    pool_key: key.0,
                    action: "evict",
                });
            }
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport
    }

    /// Spawn the periodic sweeper on the current tokio runtime. The returned handle
    /// can be aborted on transport shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        C: 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.sweep_idle().await;
            }
        })
    }
}
