use std::cmp;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::ConfigError;
use crate::num_cpus;

const DEFAULT_MAX_WORKERS: usize = 1000;

lazy_static! {
    static ref DEFAULT_SERVER_NAME: String = format!("rusty_appserver/{}", env!("CARGO_PKG_VERSION"));
    static ref DEFAULT_STARTUP_WORKERS: usize =
        cmp::min(cmp::max(4 * num_cpus::get(), 8), DEFAULT_MAX_WORKERS);
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    http_address: String,
    http_port: u16,
    server_name: String,

    startup_workers: usize,
    max_idle_workers: usize,
    max_workers: usize,
    worker_retry_ms: u64,
    pool_trim_secs: u64,

    start_requests: usize,
    max_requests: usize,

    connection_timeout_ms: u64,
    keep_alive_timeout_ms: u64,

    buffer_size: usize,
    max_header_lines: usize,
    max_body_bytes: usize,

    session_sweep_secs: u64,
}

impl ServerConfig {
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(raw)?;
        Ok(config.normalized())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    // now make sure the pool bounds are consistent with each other
    fn normalized(mut self) -> Self {
        self.max_workers = cmp::max(self.max_workers, 1);
        self.startup_workers = cmp::min(self.startup_workers, self.max_workers);
        self.max_requests = cmp::max(self.max_requests, 1);
        self.start_requests = cmp::min(self.start_requests, self.max_requests);
        self.buffer_size = cmp::max(self.buffer_size, 64);
        self
    }

    #[inline]
    pub fn get_http_address(&self) -> &str {
        &self.http_address
    }

    #[inline]
    pub fn set_http_address(&mut self, address: &str) {
        self.http_address = address.to_owned();
    }

    #[inline]
    pub fn get_http_port(&self) -> u16 {
        self.http_port
    }

    #[inline]
    pub fn set_http_port(&mut self, port: u16) {
        self.http_port = port;
    }

    #[inline]
    pub fn get_server_name(&self) -> &str {
        &self.server_name
    }

    #[inline]
    pub fn get_startup_workers(&self) -> usize {
        self.startup_workers
    }

    #[inline]
    pub fn set_startup_workers(&mut self, count: usize) {
        self.startup_workers = count;
        *self = self.clone().normalized();
    }

    #[inline]
    pub fn get_max_idle_workers(&self) -> usize {
        self.max_idle_workers
    }

    #[inline]
    pub fn set_max_idle_workers(&mut self, count: usize) {
        self.max_idle_workers = count;
    }

    #[inline]
    pub fn get_max_workers(&self) -> usize {
        self.max_workers
    }

    #[inline]
    pub fn set_max_workers(&mut self, count: usize) {
        self.max_workers = count;
        *self = self.clone().normalized();
    }

    #[inline]
    pub fn get_worker_retry(&self) -> Duration {
        Duration::from_millis(self.worker_retry_ms)
    }

    #[inline]
    pub fn set_worker_retry(&mut self, retry: Duration) {
        self.worker_retry_ms = retry.as_millis() as u64;
    }

    #[inline]
    pub fn get_pool_trim_period(&self) -> Duration {
        Duration::from_secs(self.pool_trim_secs)
    }

    #[inline]
    pub fn get_start_requests(&self) -> usize {
        self.start_requests
    }

    #[inline]
    pub fn get_max_requests(&self) -> usize {
        self.max_requests
    }

    #[inline]
    pub fn set_max_requests(&mut self, count: usize) {
        self.max_requests = count;
        *self = self.clone().normalized();
    }

    #[inline]
    pub fn get_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[inline]
    pub fn set_connection_timeout(&mut self, timeout: Duration) {
        self.connection_timeout_ms = timeout.as_millis() as u64;
    }

    #[inline]
    pub fn get_keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    #[inline]
    pub fn set_keep_alive_timeout(&mut self, timeout: Duration) {
        self.keep_alive_timeout_ms = timeout.as_millis() as u64;
    }

    #[inline]
    pub fn get_buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size;
        *self = self.clone().normalized();
    }

    #[inline]
    pub fn get_max_header_lines(&self) -> usize {
        self.max_header_lines
    }

    #[inline]
    pub fn get_max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    #[inline]
    pub fn get_session_sweep_period(&self) -> Duration {
        Duration::from_secs(self.session_sweep_secs)
    }

    #[inline]
    pub fn set_session_sweep_period(&mut self, period: Duration) {
        self.session_sweep_secs = period.as_secs();
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_address: String::from("127.0.0.1"),
            http_port: 8080,
            server_name: DEFAULT_SERVER_NAME.clone(),
            startup_workers: *DEFAULT_STARTUP_WORKERS,
            max_idle_workers: 50,
            max_workers: DEFAULT_MAX_WORKERS,
            worker_retry_ms: 1000,
            pool_trim_secs: 60,
            start_requests: 10,
            max_requests: 1000,
            connection_timeout_ms: 60_000,
            keep_alive_timeout_ms: 10_000,
            buffer_size: 8192,
            max_header_lines: 100,
            max_body_bytes: 8 * 1024 * 1024,
            session_sweep_secs: 60,
        }
    }
}
