use std::time::Duration;

use serde::{Deserialize, Serialize};
use xproc_worker_pool::PoolConfig;

/// RPC host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Verbose host name. Used for thread names and logs
    pub name: String,
    /// Master host asks every peer to exit on shutdown
    pub master: bool,
    /// Idle dispatch workers kept alive
    pub min_workers: usize,
    /// Upper bound of dispatch workers
    pub max_workers: Option<usize>,
    /// Interval of every internal wait. Bounds shutdown latency
    pub poll_interval: Duration,
    /// Default timeout of calls made by proxies. `None` waits forever
    pub request_timeout: Option<Duration>,
    /// How long the shutdown protocol waits for every peer
    pub shutdown_timeout: Duration,
    /// Limit for reading the rest of a frame once its marker arrived.
    /// A quiet peer is fine between frames
    pub frame_read_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "xproc".into(),
            master: false,
            min_workers: 2,
            max_workers: None,
            poll_interval: Duration::from_millis(100),
            request_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(2),
            frame_read_timeout: Duration::from_secs(5),
        }
    }
}

impl HostConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    pub fn workers(mut self, min_workers: usize, max_workers: Option<usize>) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn frame_read_timeout(mut self, timeout: Duration) -> Self {
        self.frame_read_timeout = timeout;
        self
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            name: format!("{}-dispatch", self.name),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            poll_interval: self.poll_interval,
        }
    }
}
