//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time view of a pool's counters and occupancy
///
/// # Examples
///
/// ```
/// use tcp_connpool::{PoolConfiguration, TcpConnPool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = TcpConnPool::new(PoolConfiguration::new().with_max_open(4)).unwrap();
///
/// let metrics = pool.metrics();
/// assert_eq!(metrics.num_open, 0);
/// assert_eq!(metrics.max_open, 4);
/// assert_eq!(metrics.utilization, 0.0);
/// # }
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolMetrics {
    /// Connections successfully dialed
    pub total_dialed: usize,

    /// Dial attempts that failed
    pub dial_failures: usize,

    /// Connections handed to callers
    pub total_acquired: usize,

    /// Connections handed back via `put`
    pub total_released: usize,

    /// Acquisitions served from the idle set
    pub idle_reused: usize,

    /// Released connections closed because the idle set was full
    pub evicted: usize,

    /// Requests that had to wait in the pending queue
    pub requests_queued: usize,

    /// Queued requests that ran out of time
    pub request_timeouts: usize,

    /// Connections currently open, idle or checked out
    pub num_open: usize,

    /// Connections currently idle
    pub idle: usize,

    /// Configured open-connection limit
    pub max_open: usize,

    /// `num_open / max_open` (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_dialed".to_string(), self.total_dialed.to_string());
        metrics.insert("dial_failures".to_string(), self.dial_failures.to_string());
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("idle_reused".to_string(), self.idle_reused.to_string());
        metrics.insert("evicted".to_string(), self.evicted.to_string());
        metrics.insert("requests_queued".to_string(), self.requests_queued.to_string());
        metrics.insert("request_timeouts".to_string(), self.request_timeouts.to_string());
        metrics.insert("num_open".to_string(), self.num_open.to_string());
        metrics.insert("idle".to_string(), self.idle.to_string());
        metrics.insert("max_open".to_string(), self.max_open.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use tcp_connpool::{PoolConfiguration, TcpConnPool};
    /// use std::collections::HashMap;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let pool = TcpConnPool::new(PoolConfiguration::default()).unwrap();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("upstream".to_string(), "cache".to_string());
    ///
    /// let output = pool.export_metrics_prometheus("edge", Some(&tags));
    /// assert!(output.contains("tcppool_connections_open"));
    /// assert!(output.contains("upstream=\"cache\""));
    /// # }
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        // Gauge metrics
        Self::push(&mut output, "tcppool_connections_open", "Connections currently open", "gauge", &labels, metrics.num_open);
        Self::push(&mut output, "tcppool_connections_idle", "Connections currently idle", "gauge", &labels, metrics.idle);
        Self::push(&mut output, "tcppool_connections_max", "Configured open-connection limit", "gauge", &labels, metrics.max_open);

        output.push_str("# HELP tcppool_utilization Pool utilization ratio\n");
        output.push_str("# TYPE tcppool_utilization gauge\n");
        output.push_str(&format!("tcppool_utilization{{{}}} {:.2}\n", labels, metrics.utilization));

        // Counter metrics
        Self::push(&mut output, "tcppool_dials_total", "Connections dialed", "counter", &labels, metrics.total_dialed);
        Self::push(&mut output, "tcppool_dial_failures_total", "Failed dial attempts", "counter", &labels, metrics.dial_failures);
        Self::push(&mut output, "tcppool_acquired_total", "Connections handed to callers", "counter", &labels, metrics.total_acquired);
        Self::push(&mut output, "tcppool_released_total", "Connections released", "counter", &labels, metrics.total_released);
        Self::push(&mut output, "tcppool_idle_reused_total", "Acquisitions served from idle", "counter", &labels, metrics.idle_reused);
        Self::push(&mut output, "tcppool_evicted_total", "Released connections closed", "counter", &labels, metrics.evicted);
        Self::push(&mut output, "tcppool_requests_queued_total", "Requests that waited in the queue", "counter", &labels, metrics.requests_queued);
        Self::push(&mut output, "tcppool_request_timeouts_total", "Queued requests that timed out", "counter", &labels, metrics.request_timeouts);

        output
    }

    fn push(output: &mut String, name: &str, help: &str, kind: &str, labels: &str, value: usize) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub total_dialed: AtomicUsize,
    pub dial_failures: AtomicUsize,
    pub total_acquired: AtomicUsize,
    pub total_released: AtomicUsize,
    pub idle_reused: AtomicUsize,
    pub evicted: AtomicUsize,
    pub requests_queued: AtomicUsize,
    pub request_timeouts: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, num_open: usize, idle: usize, max_open: usize) -> PoolMetrics {
        let utilization = if max_open > 0 {
            num_open as f64 / max_open as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_dialed: self.total_dialed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            idle_reused: self.idle_reused.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            num_open,
            idle,
            max_open,
            utilization,
        }
    }
}
