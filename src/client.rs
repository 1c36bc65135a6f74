//! Client builder and request/response cycle.
//!
//! The [`ClientBuilder`] collects pool and codec settings. The [`Client`]
//! runs one exchange per call:
//! 1. Claim a connection from the pool
//! 2. Lock its stream and write the request frame
//! 3. Read frames until one carries a terminal state, discarding progress
//! 4. Return the connection to the pool
//!
//! # Example
//!
//! ```ignore
//! use luci_client::{Client, Header, Message};
//!
//! #[tokio::main]
//! async fn main() -> luci_client::Result<()> {
//!     let client = Client::builder()
//!         .request_timeout(Some(std::time::Duration::from_secs(30)))
//!         .connect("localhost", 7654)
//!         .await?;
//!
//!     let mut request = Message::new(Header::new().with("run", "ServiceList"));
//!     let answer = client.send_and_receive(&mut request).await?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::task::AbortHandle;

use crate::error::{LuciError, Result};
use crate::protocol::{CodecConfig, Header, Message, Value};
use crate::transport::{ConnectionPool, Connector, MixedStream, PoolConfig, PooledConnection, TcpConnector};

/// Builder for configuring and creating a client.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    pool: PoolConfig,
    codec: CodecConfig,
    request_timeout: Option<Duration>,
    spawn_receive: bool,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer size of each connection.
    ///
    /// Default: 2 MiB
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.pool.buffer_size = size;
        self
    }

    /// Attachments at or above this size are received to disk.
    ///
    /// Default: 500 MiB
    pub fn memory_limit(mut self, limit: u64) -> Self {
        self.codec.memory_limit = limit;
        self
    }

    /// Directory for disk-backed attachments.
    ///
    /// Default: the system temp directory
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.codec.temp_dir = dir.into();
        self
    }

    /// Reject frames whose header text is longer than this.
    ///
    /// Default: 256 MiB
    pub fn max_header_size(mut self, limit: u64) -> Self {
        self.codec.max_header_size = limit;
        self
    }

    /// Set the maximum number of open connections.
    ///
    /// Callers beyond this bound wait for a connection to be released.
    /// Default: 16
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.pool.max_connections = limit;
        self
    }

    /// Close connections idle for longer than this. `None` keeps them forever.
    ///
    /// Default: 5 minutes
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    /// Bound a whole exchange, including skipped progress frames.
    ///
    /// Default: none
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read replies on a spawned task instead of the calling one.
    ///
    /// Default: false
    pub fn spawn_receive(mut self, enable: bool) -> Self {
        self.spawn_receive = enable;
        self
    }

    /// Connect over TCP and open the first connection eagerly.
    pub async fn connect(self, host: impl Into<String>, port: u16) -> Result<Client> {
        let client = self.build(TcpConnector::new(host, port));
        client.pool.warm_up().await?;
        Ok(client)
    }

    /// Build a client over any connector. Connections are opened on first use.
    pub fn build<C: Connector>(self, connector: C) -> Client<C> {
        Client {
            pool: ConnectionPool::new(connector, self.pool),
            codec: Arc::new(self.codec),
            request_timeout: self.request_timeout,
            spawn_receive: self.spawn_receive,
        }
    }
}

/// Client for a LUCI-style service.
///
/// Methods take `&self`; share one client between tasks with an `Arc`.
/// Concurrent calls run on separate pooled connections.
pub struct Client<C: Connector = TcpConnector> {
    pool: ConnectionPool<C>,
    codec: Arc<CodecConfig>,
    request_timeout: Option<Duration>,
    spawn_receive: bool,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl<C: Connector> Client<C> {
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn codec_config(&self) -> &CodecConfig {
        &self.codec
    }

    /// Send a message and wait for its terminal answer.
    ///
    /// Progress frames are discarded. An `error` state is returned as a
    /// normal message; use [`Message::into_result`] to turn it into an error.
    /// Any failure discards the connection used for the exchange.
    pub async fn send_and_receive(&self, message: &mut Message) -> Result<Message> {
        let mut conn = self.pool.acquire().await?;

        let answer = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(&conn, message)).await {
                Ok(answer) => answer,
                Err(_) => {
                    tracing::warn!("Request on connection {} timed out after {:?}", conn.id(), limit);
                    Err(LuciError::Timeout(limit))
                }
            },
            None => self.exchange(&conn, message).await,
        };

        if answer.is_ok() {
            conn.complete();
        }
        answer
    }

    /// Build a message from `header` and send it.
    pub async fn send(&self, header: Header) -> Result<Message> {
        self.send_and_receive(&mut Message::new(header)).await
    }

    /// Write `{"result": value}` without waiting for a reply.
    pub async fn send_result(&self, result: impl Into<Value>) -> Result<()> {
        let mut message = Message::new(Header::new().with("result", result));
        let mut conn = self.pool.acquire().await?;
        {
            let mut stream = conn.lock().await;
            message.write_to(&mut *stream).await?;
        }
        conn.complete();
        Ok(())
    }

    async fn exchange(&self, conn: &PooledConnection<'_, C>, message: &mut Message) -> Result<Message> {
        let mut stream = conn.stream().lock_owned().await;
        message.write_to(&mut *stream).await?;

        if !self.spawn_receive {
            return receive_terminal(&mut *stream, &self.codec).await;
        }

        let codec = self.codec.clone();
        let task = tokio::spawn(async move { receive_terminal(&mut *stream, &codec).await });
        let _abort = AbortOnDrop(task.abort_handle());
        task.await
            .map_err(|e| {
                tracing::error!("Receive task on connection {} failed: {}", conn.id(), e);
                LuciError::TaskFailed(e.to_string())
            })?
    }
}

/// Stops a spawned receive task when the awaiting call is dropped (timeout).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Read frames until one carries a terminal state.
pub(crate) async fn receive_terminal<S: AsyncRead + Unpin>(
    stream: &mut MixedStream<S>,
    codec: &CodecConfig,
) -> Result<Message> {
    loop {
        let message = Message::read_from(stream, codec).await?;
        let state = message.state();
        if state.is_terminal() {
            return Ok(message);
        }
        tracing::debug!("Skipping {:?} message", state);
    }
}
