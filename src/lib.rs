//! # tcp_connpool
//!
//! A bounded pool of reusable TCP connections to a single upstream
//! `host:port`, with a FIFO queue for callers that arrive while the pool is
//! saturated and a length-prefixed framing codec for reading messages off
//! pooled connections.
//!
//! ## Features
//!
//! - Never more than `max_open` sockets open at once
//! - Idle connections reused last-in first-out, capped at `max_idle`
//! - Saturated callers queue (bounded, with backpressure) and are served in
//!   arrival order by a background dispatcher, or time out
//! - 4-byte big-endian total-length framing with a configurable size cap
//! - Explicit shutdown that fails queued requests and closes idle sockets
//! - Metrics snapshot and Prometheus text export
//!
//! ## Quick Start
//!
//! ```no_run
//! use tcp_connpool::{PoolConfiguration, TcpConnPool};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfiguration::new()
//!         .with_host("127.0.0.1")
//!         .with_port(8080)
//!         .with_max_open(10)
//!         .with_max_idle(5)
//!         .with_request_timeout(Duration::from_secs(3));
//!     let pool = TcpConnPool::new(config)?;
//!
//!     let mut conn = pool.get().await?;
//!     conn.write_frame(b"hello").await?;
//!     pool.put(conn);
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

mod pool;
mod config;
mod connection;
mod dispatcher;
mod metrics;
mod errors;
pub mod frame;

pub use pool::TcpConnPool;
pub use config::{DEFAULT_MAX_FRAME_SIZE, PoolConfiguration};
pub use connection::{Connection, ConnectionId, Dialer, PoolId, TcpDialer};
pub use metrics::{MetricsExporter, PoolMetrics};
pub use errors::{FrameError, FrameResult, PoolError, PoolResult};
