//! Pool of persistent connections to one endpoint.
//!
//! Connections are opened on demand through a [`Connector`] and handed out as
//! [`PooledConnection`] guards. A guard marks its connection busy while it
//! lives; dropping it returns the connection to idle if the exchange was
//! completed, or discards it otherwise, so every exit path (including errors,
//! timeouts and cancelled futures) releases the connection.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐                ┌─► Connection 1 (Mutex<MixedStream>) ─► socket
//! Caller 2 ─┼─► acquire() ───┼─► Connection 2 (Mutex<MixedStream>) ─► socket
//! Caller N ─┘  (semaphore)   └─► ... opened on demand, up to max_connections
//! ```

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::mixed_stream::{MixedStream, DEFAULT_BUFFER_SIZE};
use crate::error::{LuciError, Result};

/// Default maximum number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default idle time after which a connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Opens new byte streams to the remote endpoint.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connector for plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = (self.host.clone(), self.port);
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Read buffer size of each connection's [`MixedStream`].
    pub buffer_size: usize,
    /// Upper bound on open connections; further callers wait.
    pub max_connections: usize,
    /// Idle connections older than this are closed on the next acquire.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// A persistent connection owned by the pool.
struct Connection<S> {
    id: u64,
    stream: Arc<tokio::sync::Mutex<MixedStream<S>>>,
    busy: AtomicBool,
    broken: AtomicBool,
    last_used: Mutex<Instant>,
}

impl<S> Connection<S> {
    fn new(id: u64, stream: MixedStream<S>) -> Self {
        Self {
            id,
            stream: Arc::new(tokio::sync::Mutex::new(stream)),
            busy: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> bool {
        !self.is_broken()
            && self
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Pool of connections to one endpoint.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    /// Guarded separately from every per-connection lock; never held across an await.
    connections: Mutex<Vec<Arc<Connection<C::Stream>>>>,
    permits: Semaphore,
    next_id: AtomicU64,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Self {
            connector,
            config,
            connections: Mutex::new(Vec::new()),
            permits: Semaphore::new(max),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Claim an idle connection, or open a new one if none is idle.
    ///
    /// Waits while `max_connections` connections are busy.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LuciError::ConnectionClosed)?;

        if let Some(conn) = self.claim_idle() {
            tracing::debug!("Reusing connection {}", conn.id);
            return Ok(PooledConnection::new(self, conn, permit));
        }

        let stream = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            id,
            MixedStream::with_capacity(stream, self.config.buffer_size),
        ));
        self.lock_connections().push(conn.clone());
        tracing::debug!("Opened connection {}", id);

        Ok(PooledConnection::new(self, conn, permit))
    }

    /// Make sure at least one connection is open.
    pub async fn warm_up(&self) -> Result<()> {
        if self.is_empty() {
            let mut conn = self.acquire().await?;
            conn.complete();
        }
        Ok(())
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections not currently claimed.
    pub fn idle_count(&self) -> usize {
        self.lock_connections()
            .iter()
            .filter(|c| !c.is_busy())
            .count()
    }

    fn claim_idle(&self) -> Option<Arc<Connection<C::Stream>>> {
        let mut connections = self.lock_connections();

        if let Some(limit) = self.config.idle_timeout {
            connections.retain(|c| {
                let expired = !c.is_busy() && c.idle_for() >= limit;
                if expired {
                    tracing::debug!("Evicting idle connection {}", c.id);
                }
                !expired
            });
        }

        connections.iter().find(|c| c.try_claim()).cloned()
    }

    fn release(&self, conn: &Arc<Connection<C::Stream>>, completed: bool) {
        if completed && !conn.is_broken() {
            conn.touch();
            conn.busy.store(false, Ordering::Release);
            return;
        }

        tracing::warn!("Discarding connection {} after unfinished exchange", conn.id);
        conn.broken.store(true, Ordering::Release);
        conn.busy.store(false, Ordering::Release);
        self.lock_connections().retain(|c| !Arc::ptr_eq(c, conn));
    }

    fn lock_connections(&self) -> MutexGuard<'_, Vec<Arc<Connection<C::Stream>>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped claim on a pooled connection.
///
/// Call [`complete`](Self::complete) once a full exchange has succeeded;
/// otherwise the connection is discarded on drop.
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    conn: Arc<Connection<C::Stream>>,
    completed: bool,
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Connector> PooledConnection<'a, C> {
    fn new(
        pool: &'a ConnectionPool<C>,
        conn: Arc<Connection<C::Stream>>,
        permit: SemaphorePermit<'a>,
    ) -> Self {
        Self {
            pool,
            conn,
            completed: false,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.id
    }

    /// Shared handle to the connection's stream, for `lock_owned`.
    pub fn stream(&self) -> Arc<tokio::sync::Mutex<MixedStream<C::Stream>>> {
        self.conn.stream.clone()
    }

    /// Lock the stream for the duration of an exchange.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, MixedStream<C::Stream>> {
        self.conn.stream.lock().await
    }

    /// Mark the exchange as finished so the connection is reused.
    pub fn complete(&mut self) {
        self.completed = true;
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        self.pool.release(&self.conn, self.completed);
    }
}
