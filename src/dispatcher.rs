//! Background resolution of queued connection requests
//!
//! One dispatcher task runs per pool. It takes requests off the pending
//! queue one at a time, so requests are answered strictly in arrival order.
//! Each request waits for a release or a freed slot until its deadline
//! instead of polling the pool state in a loop.

use crate::connection::Connection;
use crate::errors::{PoolError, PoolResult};
use crate::metrics::MetricsTracker;
use crate::pool::{Admission, Shared};

use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info};

/// A saturated `get` call waiting for the dispatcher
pub(crate) struct ConnRequest {
    pub reply: oneshot::Sender<PoolResult<Connection>>,
    pub enqueued_at: StdInstant,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut requests: mpsc::Receiver<ConnRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut request = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.reply.is_closed() {
            debug!(pool = %shared.id, "requester went away before dispatch, skipping");
            continue;
        }

        let deadline = Instant::from_std(request.enqueued_at) + shared.config.request_timeout;
        let result = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(PoolError::Closed),
            _ = request.reply.closed() => {
                debug!(pool = %shared.id, "requester went away while waiting, skipping");
                continue;
            }
            result = resolve(&shared, deadline) => result,
        };
        deliver(&shared, request, result);
    }

    requests.close();
    let mut failed = 0usize;
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Err(PoolError::Closed));
        failed += 1;
    }
    info!(pool = %shared.id, failed_requests = failed, "dispatcher stopped");
}

/// Keep trying to satisfy one request until `deadline`
async fn resolve(shared: &Shared, deadline: Instant) -> PoolResult<Connection> {
    let timeout = || PoolError::Timeout(shared.config.request_timeout);

    loop {
        match shared.admit()? {
            Admission::Idle(conn) => return Ok(conn),
            Admission::Dial(slot) => match shared.dial(slot).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    debug!(pool = %shared.id, error = %err, "dial for queued request failed, retrying");
                    let retry_at = (Instant::now() + shared.config.redial_interval).min(deadline);
                    sleep_until(retry_at).await;
                    if Instant::now() >= deadline {
                        return Err(timeout());
                    }
                    continue;
                }
            },
            Admission::Saturated => {}
        }

        // A release between the admission check and this wait leaves a
        // stored permit, so the wakeup is not lost.
        if timeout_at(deadline, shared.available.notified()).await.is_err() {
            return Err(timeout());
        }
    }
}

fn deliver(shared: &Shared, request: ConnRequest, result: PoolResult<Connection>) {
    match &result {
        Ok(conn) => debug!(
            pool = %shared.id,
            conn = %conn.id(),
            waited = ?request.enqueued_at.elapsed(),
            "queued request resolved"
        ),
        Err(PoolError::Timeout(_)) => {
            MetricsTracker::incr(&shared.metrics.request_timeouts);
            debug!(pool = %shared.id, waited = ?request.enqueued_at.elapsed(), "queued request timed out");
        }
        Err(err) => debug!(pool = %shared.id, error = %err, "queued request failed"),
    }

    if let Err(Ok(conn)) = request.reply.send(result) {
        debug!(pool = %shared.id, conn = %conn.id(), "requester went away, returning connection");
        shared.release(conn);
    }
}
