//! Pool configuration options

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

/// Default cap on a single frame, prefix included (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for a TCP connection pool
///
/// # Examples
///
/// ```
/// use tcp_connpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_host("10.0.0.7")
///     .with_port(9000)
///     .with_max_open(20)
///     .with_max_idle(8)
///     .with_request_timeout(Duration::from_secs(1));
///
/// assert_eq!(config.addr(), "10.0.0.7:9000");
/// assert_eq!(config.max_open, 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfiguration {
    /// Upstream host name or IP address
    pub host: String,

    /// Upstream port
    pub port: u16,

    /// Maximum number of connections open at once, idle or checked out
    pub max_open: usize,

    /// Maximum number of connections kept idle for reuse
    pub max_idle: usize,

    /// Capacity of the pending-request queue
    pub max_queue_length: usize,

    /// How long a queued request may wait before failing with a timeout
    pub request_timeout: Duration,

    /// Pause between dial attempts made on behalf of a queued request
    pub redial_interval: Duration,

    /// Upper bound on a frame's total length when reading
    pub max_frame_size: Option<usize>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_open: 10,
            max_idle: 5,
            max_queue_length: 10,
            request_timeout: Duration::from_secs(3),
            redial_interval: Duration::from_millis(100),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the upstream host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the upstream port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the maximum number of open connections
    pub fn with_max_open(mut self, count: usize) -> Self {
        self.max_open = count;
        self
    }

    /// Set the maximum number of idle connections
    ///
    /// A value of zero disables reuse: every released connection is closed.
    pub fn with_max_idle(mut self, count: usize) -> Self {
        self.max_idle = count;
        self
    }

    /// Set the pending-request queue capacity
    pub fn with_max_queue_length(mut self, length: usize) -> Self {
        self.max_queue_length = length;
        self
    }

    /// Set the wait budget for queued requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the pause between dial attempts for a queued request
    pub fn with_redial_interval(mut self, interval: Duration) -> Self {
        self.redial_interval = interval;
        self
    }

    /// Set the maximum accepted frame length
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Accept frames of any length the prefix can express
    pub fn without_max_frame_size(mut self) -> Self {
        self.max_frame_size = None;
        self
    }

    /// The `host:port` string handed to the dialer
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the configuration before a pool is built from it
    ///
    /// # Examples
    ///
    /// ```
    /// use tcp_connpool::{PoolConfiguration, PoolError};
    ///
    /// let err = PoolConfiguration::new().with_host("").validate().unwrap_err();
    /// assert!(matches!(err, PoolError::InvalidParameters(_)));
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.host.is_empty() {
            return Err(PoolError::InvalidParameters("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(PoolError::InvalidParameters("port must not be zero".into()));
        }
        if self.max_open == 0 {
            return Err(PoolError::InvalidParameters("max_open must be at least 1".into()));
        }
        if self.max_queue_length == 0 {
            return Err(PoolError::InvalidParameters(
                "max_queue_length must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
