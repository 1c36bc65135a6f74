//! Transport module - buffered stream and connection pooling.
//!
//! Provides:
//! - [`MixedStream`]: line and exact-length I/O over one read buffer
//! - [`ConnectionPool`]: persistent connections to one endpoint

mod mixed_stream;
mod pool;

pub use mixed_stream::{MixedStream, DEFAULT_BUFFER_SIZE};
pub use pool::{
    ConnectionPool, Connector, PoolConfig, PooledConnection, TcpConnector, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS,
};
