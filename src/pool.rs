//! Core connection pool implementation

use crate::config::PoolConfiguration;
use crate::connection::{Connection, ConnectionId, Dialer, PoolId, TcpDialer};
use crate::dispatcher::{self, ConnRequest};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::{MetricsExporter, MetricsTracker, PoolMetrics};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable pool state, guarded by a single lock
struct PoolState {
    /// Idle connections, most recently released on top
    idle: Vec<Connection>,
    /// Idle plus checked-out connections, including slots reserved for an in-flight dial
    num_open: usize,
    closed: bool,
}

/// Outcome of the admission check run under the pool lock
pub(crate) enum Admission<'a> {
    Idle(Connection),
    Dial(SlotReservation<'a>),
    Saturated,
}

/// An open-count slot taken for a dial in progress
///
/// Dropping it without calling `keep` gives the slot back and wakes the
/// dispatcher, so a failed or cancelled dial never leaks capacity.
pub(crate) struct SlotReservation<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl SlotReservation<'_> {
    /// Hand the slot over to the connection that now occupies it
    fn occupy(mut self) -> OpenSlot {
        self.armed = false;
        OpenSlot {
            pool: self.shared.me.clone(),
        }
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().num_open -= 1;
            self.shared.available.notify_one();
        }
    }
}

/// The open-count slot held by a live connection
///
/// Travels inside the `Connection`, so however the connection ends up
/// closed (evicted on release, drained on shutdown, or simply dropped by its
/// holder) the owning pool gets the slot back exactly once.
pub(crate) struct OpenSlot {
    pool: Weak<Shared>,
}

impl OpenSlot {
    /// A slot that belongs to no pool
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { pool: Weak::new() }
    }

    pub(crate) fn owner(&self) -> Option<Arc<Shared>> {
        self.pool.upgrade()
    }
}

impl Drop for OpenSlot {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.upgrade() {
            shared.state.lock().num_open -= 1;
            shared.available.notify_one();
        }
    }
}

/// State shared between pool handles and the dispatcher task
///
/// Connections must never be dropped while `state` is locked: dropping one
/// takes the lock to give its slot back.
pub(crate) struct Shared {
    pub id: PoolId,
    me: Weak<Shared>,
    pub config: PoolConfiguration,
    addr: String,
    dialer: Arc<dyn Dialer>,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection or an open slot may have become available
    pub available: Notify,
    pub shutdown: watch::Sender<bool>,
    next_conn_id: AtomicU64,
    pub metrics: MetricsTracker,
}

impl Shared {
    /// Take an idle connection, reserve a slot for a new dial, or report saturation
    pub fn admit(&self) -> PoolResult<Admission<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        if let Some(conn) = state.idle.pop() {
            drop(state);
            MetricsTracker::incr(&self.metrics.idle_reused);
            trace!(pool = %self.id, conn = %conn.id(), "reusing idle connection");
            return Ok(Admission::Idle(conn));
        }

        if state.num_open < self.config.max_open {
            state.num_open += 1;
            return Ok(Admission::Dial(SlotReservation {
                shared: self,
                armed: true,
            }));
        }

        Ok(Admission::Saturated)
    }

    /// Dial a new connection into a reserved slot
    pub async fn dial(&self, slot: SlotReservation<'_>) -> PoolResult<Connection> {
        debug!(pool = %self.id, addr = %self.addr, "dialing new connection");

        match self.dialer.dial(&self.addr).await {
            Ok(stream) => {
                let slot = slot.occupy();
                MetricsTracker::incr(&self.metrics.total_dialed);
                let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
                Ok(Connection::new(id, self.id, slot, stream, self.config.max_frame_size))
            }
            Err(source) => {
                drop(slot);
                MetricsTracker::incr(&self.metrics.dial_failures);
                warn!(pool = %self.id, addr = %self.addr, error = %source, "dial failed");
                Err(PoolError::Dial {
                    addr: self.addr.clone(),
                    source,
                })
            }
        }
    }

    /// Return a connection to the idle set, or close it if the set is full
    ///
    /// A connection owned by another pool is forwarded to its owner.
    pub fn release(&self, conn: Connection) {
        if conn.pool_id() != self.id {
            warn!(
                pool = %self.id,
                owner = %conn.pool_id(),
                conn = %conn.id(),
                "connection released to a pool that does not own it, forwarding"
            );
            if let Some(owner) = conn.owner() {
                owner.release(conn);
            }
            return;
        }

        MetricsTracker::incr(&self.metrics.total_released);
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            debug!(pool = %self.id, conn = %conn.id(), "pool closed, closing released connection");
            drop(conn);
        } else if state.idle.len() >= self.config.max_idle {
            drop(state);
            MetricsTracker::incr(&self.metrics.evicted);
            debug!(pool = %self.id, conn = %conn.id(), "idle set full, closing released connection");
            drop(conn);
        } else {
            trace!(pool = %self.id, conn = %conn.id(), "connection returned to idle set");
            state.idle.push(conn);
            drop(state);
            self.available.notify_one();
        }
    }

    /// Mark the pool closed and hand back the idle connections
    ///
    /// The caller drops them once the lock is released, which closes the
    /// sockets and frees their slots.
    fn mark_closed(&self) -> Vec<Connection> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        std::mem::take(&mut state.idle)
    }

    fn snapshot(&self) -> (usize, usize, bool) {
        let state = self.state.lock();
        (state.num_open, state.idle.len(), state.closed)
    }
}

/// Waits for the dispatcher's answer to a queued request
///
/// If the caller stops waiting after the dispatcher already delivered a
/// connection, the connection goes back to the pool instead of being lost.
struct PendingRequest<'a> {
    reply: oneshot::Receiver<PoolResult<Connection>>,
    shared: &'a Shared,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.reply.close();
        if let Ok(Ok(conn)) = self.reply.try_recv() {
            self.shared.release(conn);
        }
    }
}

/// Bounded pool of TCP connections to one upstream `host:port`
///
/// At most `max_open` sockets exist at once. When the pool is saturated,
/// `get` queues a request that a background dispatcher resolves in arrival
/// order, failing it after `request_timeout`.
///
/// Idle connections are reused last-in first-out.
///
/// # Examples
///
/// ```no_run
/// use tcp_connpool::{PoolConfiguration, TcpConnPool};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = TcpConnPool::new(PoolConfiguration::new().with_port(9000))?;
///
/// let mut conn = pool.get().await?;
/// conn.write_frame(b"ping").await?;
/// let reply = conn.read_frame().await?;
/// pool.put(conn);
/// # let _ = reply;
/// # Ok(())
/// # }
/// ```
pub struct TcpConnPool {
    shared: Arc<Shared>,
    requests: mpsc::Sender<ConnRequest>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnPool {
    /// Create a pool that dials with `TcpStream::connect`
    ///
    /// Must be called from within a Tokio runtime; the dispatcher task is
    /// spawned onto it.
    pub fn new(config: PoolConfiguration) -> PoolResult<Self> {
        Self::with_dialer(config, TcpDialer)
    }

    /// Create a pool with a custom dialer
    pub fn with_dialer<D: Dialer>(config: PoolConfiguration, dialer: D) -> PoolResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let (requests, pending) = mpsc::channel(config.max_queue_length);
        let (shutdown, _) = watch::channel(false);
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));

        info!(
            pool = %id,
            addr = %config.addr(),
            max_open = config.max_open,
            max_idle = config.max_idle,
            max_queue_length = config.max_queue_length,
            request_timeout = ?config.request_timeout,
            "created TCP connection pool"
        );

        let shared = Arc::new_cyclic(|me| Shared {
            id,
            me: me.clone(),
            addr: config.addr(),
            config,
            dialer: Arc::new(dialer),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                num_open: 0,
                closed: false,
            }),
            available: Notify::new(),
            shutdown,
            next_conn_id: AtomicU64::new(1),
            metrics: MetricsTracker::new(),
        });

        let shutdown_rx = shared.shutdown.subscribe();
        let dispatcher = runtime.spawn(dispatcher::run(Arc::clone(&shared), pending, shutdown_rx));

        Ok(Self {
            shared,
            requests,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Acquire a connection
    ///
    /// Served from the idle set when possible, otherwise by dialing while
    /// under `max_open`. A dial failure is returned as is. When saturated
    /// the call waits in the request queue, which applies backpressure once
    /// `max_queue_length` requests are already pending, and fails with
    /// [`PoolError::Timeout`] if nothing frees up in time.
    pub async fn get(&self) -> PoolResult<Connection> {
        let conn = match self.shared.admit()? {
            Admission::Idle(conn) => conn,
            Admission::Dial(slot) => self.shared.dial(slot).await?,
            Admission::Saturated => self.wait_for_connection().await?,
        };

        MetricsTracker::incr(&self.shared.metrics.total_acquired);
        Ok(conn)
    }

    async fn wait_for_connection(&self) -> PoolResult<Connection> {
        let (reply, rx) = oneshot::channel();
        let request = ConnRequest {
            reply,
            enqueued_at: Instant::now(),
        };

        debug!(pool = %self.shared.id, "pool saturated, queueing request");
        self.requests
            .send(request)
            .await
            .map_err(|_| PoolError::Closed)?;
        MetricsTracker::incr(&self.shared.metrics.requests_queued);

        let mut pending = PendingRequest {
            reply: rx,
            shared: &self.shared,
        };
        (&mut pending.reply).await.map_err(|_| PoolError::Closed)?
    }

    /// Hand a connection back
    ///
    /// Never waits on anything but the pool lock. The connection is kept
    /// idle unless `max_idle` connections are already idle, in which case
    /// it is closed and its slot freed. A connection that is no longer
    /// usable, for instance after a [`FrameError`](crate::FrameError),
    /// should be dropped instead; that closes it and frees its slot.
    pub fn put(&self, conn: Connection) {
        self.shared.release(conn);
    }

    /// Shut the pool down
    ///
    /// Stops the dispatcher, fails queued requests with [`PoolError::Closed`]
    /// and closes idle connections. Connections still checked out are closed
    /// when they are put back. Calling it again is a no-op.
    pub async fn close(&self) {
        let idle = self.shared.mark_closed();
        let closed = idle.len();
        drop(idle);

        self.shared.shutdown.send_replace(true);
        self.shared.available.notify_one();

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(pool = %self.shared.id, error = %e, "dispatcher task failed");
            }
            info!(pool = %self.shared.id, closed_idle = closed, "TCP connection pool closed");
        }
    }

    pub fn id(&self) -> PoolId {
        self.shared.id
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.shared.config
    }

    /// Connections currently open, idle or checked out
    pub fn num_open(&self) -> usize {
        self.shared.snapshot().0
    }

    pub fn idle_count(&self) -> usize {
        self.shared.snapshot().1
    }

    pub fn is_closed(&self) -> bool {
        self.shared.snapshot().2
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        let (num_open, idle, _) = self.shared.snapshot();
        self.shared
            .metrics
            .get_metrics(num_open, idle, self.shared.config.max_open)
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        MetricsExporter::export_prometheus(&self.metrics(), pool_name, tags)
    }
}

impl Drop for TcpConnPool {
    fn drop(&mut self) {
        drop(self.shared.mark_closed());
        self.shared.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// Accepts connections and keeps them open for the life of the test
    async fn upstream() -> SocketAddr {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    fn config_for(addr: SocketAddr) -> PoolConfiguration {
        PoolConfiguration::new()
            .with_host(addr.ip().to_string())
            .with_port(addr.port())
    }

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _addr: &str) -> io::Result<TcpStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// Fails while `fail` is set, dials normally otherwise
    struct ToggleDialer {
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Dialer for ToggleDialer {
        async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            TcpDialer.dial(addr).await
        }
    }

    #[test]
    fn test_requires_runtime() {
        let err = TcpConnPool::new(PoolConfiguration::default()).err().unwrap();
        assert!(matches!(err, PoolError::NoRuntime));
    }

    #[tokio::test]
    async fn test_rejects_invalid_parameters() {
        let err = TcpConnPool::new(PoolConfiguration::new().with_host("")).err().unwrap();
        assert!(matches!(err, PoolError::InvalidParameters(_)));

        let err = TcpConnPool::new(PoolConfiguration::new().with_port(0)).err().unwrap();
        assert!(matches!(err, PoolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_get_dials_then_reuses() {
        let pool = TcpConnPool::new(config_for(upstream().await)).unwrap();

        let conn = pool.get().await.unwrap();
        let first = conn.id();
        assert_eq!(conn.pool_id(), pool.id());
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.idle_count(), 0);

        pool.put(conn);
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.id(), first);

        let metrics = pool.metrics();
        assert_eq!(metrics.total_dialed, 1);
        assert_eq!(metrics.idle_reused, 1);
        assert_eq!(metrics.total_acquired, 2);
    }

    #[tokio::test]
    async fn test_idle_reuse_is_lifo() {
        let pool = TcpConnPool::new(config_for(upstream().await)).unwrap();

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_ne!(a.id(), b.id());
        let b_id = b.id();

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.get().await.unwrap().id(), b_id);
    }

    #[tokio::test]
    async fn test_release_beyond_max_idle_closes() {
        let pool = TcpConnPool::new(config_for(upstream().await).with_max_idle(1)).unwrap();

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.num_open(), 2);

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.metrics().evicted, 1);
    }

    #[tokio::test]
    async fn test_max_idle_zero_never_keeps_connections() {
        let pool = TcpConnPool::new(config_for(upstream().await).with_max_idle(0)).unwrap();

        for _ in 0..3 {
            let conn = pool.get().await.unwrap();
            assert_eq!(pool.num_open(), 1);
            pool.put(conn);
            assert_eq!(pool.num_open(), 0);
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.metrics().total_dialed, 3);
    }

    #[tokio::test]
    async fn test_dial_failure_frees_slot() {
        let config = PoolConfiguration::new().with_max_open(1);
        let pool = TcpConnPool::with_dialer(config, RefusingDialer).unwrap();

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, PoolError::Dial { .. }));
        assert!(err.is_retryable());
        assert_eq!(pool.num_open(), 0);

        // the slot is free again, so the next call dials rather than queueing
        assert!(matches!(pool.get().await, Err(PoolError::Dial { .. })));
        assert_eq!(pool.metrics().requests_queued, 0);
        assert_eq!(pool.metrics().dial_failures, 2);
    }

    #[tokio::test]
    async fn test_saturated_request_unblocked_by_release() {
        let config = config_for(upstream().await)
            .with_max_open(2)
            .with_max_idle(1)
            .with_request_timeout(Duration::from_secs(2));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.num_open(), 2);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let released = a.id();
        let started = Instant::now();
        pool.put(a);

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id(), released);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.num_open(), 2);
        assert_eq!(pool.metrics().requests_queued, 1);

        pool.put(b);
        pool.put(conn);
    }

    #[tokio::test]
    async fn test_queued_request_times_out() {
        let timeout = Duration::from_millis(200);
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_request_timeout(timeout);
        let pool = TcpConnPool::new(config).unwrap();

        let _held = pool.get().await.unwrap();

        let started = Instant::now();
        let err = pool.get().await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, PoolError::Timeout(t) if t == timeout));
        assert!(waited >= timeout);
        assert!(waited < timeout + Duration::from_secs(1));
        assert_eq!(pool.metrics().request_timeouts, 1);
    }

    #[tokio::test]
    async fn test_queued_requests_resolve_in_order() {
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_request_timeout(Duration::from_secs(2));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());
        let held = pool.get().await.unwrap();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for label in ["first", "second", "third"] {
            let pool = Arc::clone(&pool);
            let order_tx = order_tx.clone();
            waiters.push(tokio::spawn(async move {
                let conn = pool.get().await.unwrap();
                order_tx.send(label).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.put(conn);
            }));
            // let each request reach the queue before the next one
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        pool.put(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }

        let mut order = Vec::new();
        while let Ok(label) = order_rx.try_recv() {
            order.push(label);
        }
        assert_eq!(order, ["first", "second", "third"]);
        assert_eq!(pool.num_open(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_redials_after_failure() {
        let addr = upstream().await;
        let fail = Arc::new(AtomicBool::new(false));
        let config = config_for(addr)
            .with_max_open(1)
            .with_max_idle(0)
            .with_request_timeout(Duration::from_secs(2))
            .with_redial_interval(Duration::from_millis(20));
        let pool = Arc::new(
            TcpConnPool::with_dialer(config, ToggleDialer { fail: Arc::clone(&fail) }).unwrap(),
        );

        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        fail.store(true, Ordering::SeqCst);
        pool.put(held);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());
        fail.store(false, Ordering::SeqCst);

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(pool.num_open(), 1);
        assert!(pool.metrics().dial_failures >= 1);
        pool.put(conn);
    }

    #[tokio::test]
    async fn test_abandoned_request_returns_connection() {
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_request_timeout(Duration::from_secs(2));
        let pool = TcpConnPool::new(config).unwrap();
        let held = pool.get().await.unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(gave_up.is_err());

        pool.put(held);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_request_abandoned_while_dispatched_is_skipped() {
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_request_timeout(Duration::from_millis(200));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());
        let held = pool.get().await.unwrap();

        // the dispatcher is already working on this request when it is dropped
        let gave_up = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.metrics().request_timeouts, 0);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.put(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_get_waits_while_queue_is_full() {
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_max_queue_length(1)
            .with_request_timeout(Duration::from_secs(2));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());
        let held = pool.get().await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let pool = Arc::clone(&pool);
            waiters.push(tokio::spawn(async move {
                let conn = pool.get().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.put(conn);
                Ok::<_, PoolError>(())
            }));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        // one request is with the dispatcher, one fills the queue, the
        // third is still waiting for room in the queue
        assert_eq!(pool.metrics().requests_queued, 2);
        assert!(waiters.iter().all(|w| !w.is_finished()));

        pool.put(held);
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(pool.metrics().requests_queued, 3);
        assert_eq!(pool.num_open(), 1);
    }

    #[tokio::test]
    async fn test_release_after_close_is_not_an_eviction() {
        let pool = TcpConnPool::new(config_for(upstream().await)).unwrap();
        let conn = pool.get().await.unwrap();

        pool.close().await;
        pool.put(conn);
        assert_eq!(pool.num_open(), 0);
        assert_eq!(pool.metrics().evicted, 0);
        assert_eq!(pool.metrics().total_released, 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let config = config_for(upstream().await)
            .with_max_open(2)
            .with_request_timeout(Duration::from_secs(5));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());

        let held = pool.get().await.unwrap();
        let _other = pool.get().await.unwrap();
        assert_eq!(pool.num_open(), 2);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.get().await, Err(PoolError::Closed)));

        pool.put(held);
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.idle_count(), 0);

        // second close is a no-op
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_closes_idle_connections() {
        let pool = TcpConnPool::new(config_for(upstream().await)).unwrap();
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle_count(), 2);

        pool.close().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.num_open(), 0);
    }

    #[tokio::test]
    async fn test_foreign_connection_goes_back_to_owner() {
        let addr = upstream().await;
        let owner = TcpConnPool::new(config_for(addr)).unwrap();
        let other = TcpConnPool::new(config_for(addr)).unwrap();
        assert_ne!(owner.id(), other.id());

        let conn = owner.get().await.unwrap();
        let id = conn.id();
        other.put(conn);
        assert_eq!(other.idle_count(), 0);
        assert_eq!(other.num_open(), 0);
        assert_eq!(other.metrics().total_released, 0);

        assert_eq!(owner.num_open(), 1);
        assert_eq!(owner.idle_count(), 1);
        assert_eq!(owner.get().await.unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_foreign_connection_of_dropped_pool_is_closed() {
        let addr = upstream().await;
        let owner = TcpConnPool::new(config_for(addr)).unwrap();
        let other = TcpConnPool::new(config_for(addr)).unwrap();

        let conn = owner.get().await.unwrap();
        drop(owner);
        other.put(conn);
        assert_eq!(other.num_open(), 0);
        assert_eq!(other.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_slot() {
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_request_timeout(Duration::from_millis(200));
        let pool = TcpConnPool::new(config).unwrap();

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.num_open(), 1);
        drop(conn);
        assert_eq!(pool.num_open(), 0);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.metrics().requests_queued, 0);
        pool.put(conn);
    }

    #[tokio::test]
    async fn test_dropped_connection_wakes_queued_request() {
        let config = config_for(upstream().await)
            .with_max_open(1)
            .with_request_timeout(Duration::from_secs(2));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());
        let held = pool.get().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let dropped = held.id();
        drop(held);
        let conn = waiter.await.unwrap().unwrap();
        assert_ne!(conn.id(), dropped);
        assert_eq!(pool.num_open(), 1);
        assert_eq!(pool.metrics().total_dialed, 2);
    }

    #[tokio::test]
    async fn test_connection_dropped_after_frame_error() {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut held = Vec::new();
            while let Ok((mut stream, _)) = listener.accept().await {
                // a length prefix below the prefix size
                let _ = stream.write_all(&[0, 0, 0, 1]).await;
                held.push(stream);
            }
        });

        let config = config_for(addr)
            .with_max_open(1)
            .with_request_timeout(Duration::from_millis(200));
        let pool = TcpConnPool::new(config).unwrap();

        let mut conn = pool.get().await.unwrap();
        let err = conn.read_frame().await.unwrap_err();
        assert!(matches!(err, crate::FrameError::Malformed(1)));
        drop(conn);

        assert_eq!(pool.num_open(), 0);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limits_hold_under_load() {
        let config = config_for(upstream().await)
            .with_max_open(3)
            .with_max_idle(2)
            .with_max_queue_length(4)
            .with_request_timeout(Duration::from_secs(5));
        let pool = Arc::new(TcpConnPool::new(config).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let conn = pool.get().await.unwrap();
                assert!(pool.num_open() <= 3);
                assert!(pool.idle_count() <= 2);
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.put(conn);
                assert!(pool.num_open() <= 3);
                assert!(pool.idle_count() <= 2);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.total_acquired, 20);
        assert_eq!(metrics.total_released, 20);
        assert!(metrics.num_open <= 2);
        assert_eq!(metrics.num_open, metrics.idle);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let pool = TcpConnPool::new(config_for(upstream().await)).unwrap();
        let conn = pool.get().await.unwrap();
        pool.put(conn);

        let output = pool.export_metrics_prometheus("upstream", None);
        assert!(output.contains("tcppool_connections_idle{pool=\"upstream\"} 1\n"));
        assert_eq!(pool.export_metrics()["total_released"], "1");
    }
}
