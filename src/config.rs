//! Client configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a [`Client`](crate::Client).
///
/// # Example
///
/// ```
/// use replex::ClientOptions;
/// use std::time::Duration;
///
/// let opts = ClientOptions::new(["redis://localhost:6379"])
///     .select_db(2)
///     .client_name("worker-7")
///     .ping_interval(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) init_address: Vec<String>,
    pub(crate) shuffle_init: bool,
    pub(crate) select_db: Option<u32>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) client_name: Option<String>,
    pub(crate) sentinel_master: Option<String>,
    pub(crate) disable_cache: bool,
    pub(crate) conn_write_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_flush_delay: Duration,
    pub(crate) blocking_pool_size: usize,
}

impl ClientOptions {
    /// Creates options with the given seed endpoints.
    pub fn new<I, S>(init_address: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            init_address: init_address.into_iter().map(Into::into).collect(),
            shuffle_init: false,
            select_db: None,
            username: None,
            password: None,
            client_name: None,
            sentinel_master: None,
            disable_cache: false,
            conn_write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(4),
            max_flush_delay: Duration::from_micros(20),
            blocking_pool_size: 16,
        }
    }

    /// Randomizes the seed order before connecting.
    pub fn shuffle_init(mut self, enabled: bool) -> Self {
        self.shuffle_init = enabled;
        self
    }

    /// Selects a logical database after connecting. Non-clustered only.
    pub fn select_db(mut self, db: u32) -> Self {
        self.select_db = Some(db);
        self
    }

    /// Sets the ACL username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the connection name reported by `CLIENT LIST`.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Treats the seeds as sentinels monitoring the named master set.
    pub fn sentinel_master(mut self, master_set: impl Into<String>) -> Self {
        self.sentinel_master = Some(master_set.into());
        self
    }

    /// Never negotiates invalidation tracking; cached calls fall back to
    /// plain ones.
    pub fn disable_cache(mut self, disabled: bool) -> Self {
        self.disable_cache = disabled;
        self
    }

    /// Bounds each socket write.
    pub fn conn_write_timeout(mut self, timeout: Duration) -> Self {
        self.conn_write_timeout = timeout;
        self
    }

    /// Idle threshold after which a connection is health-checked with `PING`.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// How long the writer waits for stragglers before flushing a batch.
    /// Zero flushes every batch immediately.
    pub fn max_flush_delay(mut self, delay: Duration) -> Self {
        self.max_flush_delay = delay;
        self
    }

    /// Caps simultaneously leased exclusive connections per node.
    pub fn blocking_pool_size(mut self, size: usize) -> Self {
        self.blocking_pool_size = size;
        self
    }

    /// Validates the options and normalizes seed addresses to `host:port`.
    pub(crate) fn normalized_seeds(&self) -> Result<Vec<String>> {
        if self.init_address.is_empty() {
            return Err(Error::NoAddr);
        }
        self.init_address.iter().map(|a| normalize_addr(a)).collect()
    }
}

/// Accepts `host:port` or a `redis://` URL and yields `host:port`.
pub(crate) fn normalize_addr(addr: &str) -> Result<String> {
    if !addr.contains("://") {
        return Ok(addr.to_string());
    }
    let parsed = url::Url::parse(addr).map_err(|_| Error::protocol(format!("invalid address: {addr}")))?;
    if parsed.scheme() != "redis" {
        return Err(Error::protocol(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::protocol(format!("missing host in address: {addr}")))?;
    let port = parsed.port().unwrap_or(6379);
    Ok(format!("{host}:{port}"))
}
