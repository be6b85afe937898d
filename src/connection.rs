//! Pooled TCP connections and the dialer seam

use crate::errors::FrameResult;
use crate::frame;
use crate::pool::{OpenSlot, Shared};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Identifier of a connection, unique within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a pool; tells `put` whether a connection belongs to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Opens sockets to the upstream address
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream>;
}

/// Plain `TcpStream::connect` dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// A live socket checked out of (or idle in) a pool
///
/// Reads and writes go straight to the socket. Hand the connection back
/// with [`TcpConnPool::put`](crate::TcpConnPool::put) when done. Dropping
/// it closes the socket and gives its slot back to the owning pool.
pub struct Connection {
    id: ConnectionId,
    pool_id: PoolId,
    slot: OpenSlot,
    stream: TcpStream,
    created_at: Instant,
    max_frame_size: Option<usize>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        pool_id: PoolId,
        slot: OpenSlot,
        stream: TcpStream,
        max_frame_size: Option<usize>,
    ) -> Self {
        Self {
            id,
            pool_id,
            slot,
            stream,
            created_at: Instant::now(),
            max_frame_size,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The pool this connection must be released to
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The owning pool, if it is still alive
    pub(crate) fn owner(&self) -> Option<Arc<Shared>> {
        self.slot.owner()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read the next length-prefixed message off the socket
    pub async fn read_frame(&mut self) -> FrameResult<Vec<u8>> {
        frame::read_frame(&mut self.stream, self.max_frame_size).await
    }

    /// Write one length-prefixed message to the socket
    pub async fn write_frame(&mut self, payload: &[u8]) -> FrameResult<()> {
        frame::write_frame(&mut self.stream, payload).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("peer_addr", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
