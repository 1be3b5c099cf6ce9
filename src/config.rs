//! Runtime configuration.
//!
//! Two independent knobs feed the replicator: a [`PeerConfig`] per
//! endpoint (URL, credentials, timeouts, everything the HTTP store
//! needs) and one [`ReplicatorConfig`] for the replication machinery
//! itself (batch sizing, supervisor cadence). Peer settings resolve from
//! the environment through dotenvy, so a `.env` file works the same as
//! the process environment.

use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Smallest permitted `_changes` page; anything lower trades too much
/// per-request overhead for no memory benefit.
pub const MIN_BATCH_LIMIT: usize = 10;

/// Default `_changes` page size: a balance between per-request overhead
/// and peak in-flight memory (roughly `limit × largest document`).
pub const DEFAULT_BATCH_LIMIT: usize = 50;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid peer URL {url}: {message}")]
    #[diagnostic(code(weft::config::url))]
    InvalidUrl { url: String, message: String },

    #[error("could not build HTTP client: {message}")]
    #[diagnostic(code(weft::config::http_client))]
    HttpClient { message: String },

    #[error("batch limit {limit} is below the minimum of {MIN_BATCH_LIMIT}")]
    #[diagnostic(
        code(weft::config::batch_limit),
        help("The changes page size must be a positive integer of at least 10.")
    )]
    BatchLimitTooSmall { limit: usize },

    #[error("missing environment variable {key}")]
    #[diagnostic(code(weft::config::env))]
    MissingEnv { key: String },
}

/// One endpoint: base URL plus optional credentials, opaque to the core.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub url: String,
    /// Basic-auth credentials, passed through to the client untouched.
    pub basic: Option<(String, String)>,
    /// Per-request timeout, long polls included. Keep this comfortably
    /// above the peer's server-side long-poll timeout, or continuous
    /// sessions will abort on every quiet poll instead of pacing on it.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl PeerConfig {
    /// A peer at `url` with no credentials and default timeouts (120 s
    /// per request, 10 s to connect).
    ///
    /// # Examples
    ///
    /// ```
    /// use weft::config::PeerConfig;
    ///
    /// let peer = PeerConfig::new("http://localhost:5984/").with_basic_auth("admin", "secret");
    /// assert_eq!(peer.url, "http://localhost:5984/");
    /// assert!(peer.basic.is_some());
    /// ```
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            basic: None,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Resolve a peer from the environment (a `.env` file counts).
    ///
    /// # Parameters
    ///
    /// * `prefix` - Names the variables: `<prefix>_URL` is required,
    ///   and `<prefix>_USER` / `<prefix>_PASSWORD` enable basic auth
    ///   when both are set
    ///
    /// # Returns
    ///
    /// The resolved peer, or [`ConfigError::MissingEnv`] when the URL
    /// variable is absent.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use weft::config::PeerConfig;
    ///
    /// // Reads WEFT_SRC_URL, and WEFT_SRC_USER / WEFT_SRC_PASSWORD.
    /// let peer = PeerConfig::from_env("WEFT_SRC")?;
    /// # Ok::<(), weft::config::ConfigError>(())
    /// ```
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let key = format!("{prefix}_URL");
        let url = std::env::var(&key).map_err(|_| ConfigError::MissingEnv { key })?;
        let mut config = Self::new(url);
        if let (Ok(username), Ok(password)) = (
            std::env::var(format!("{prefix}_USER")),
            std::env::var(format!("{prefix}_PASSWORD")),
        ) {
            config = config.with_basic_auth(username, password);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic = Some((username.into(), password.into()));
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Knobs for the replication machinery itself.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    batch_limit: usize,
    monitor_period: Duration,
    reap_timeout: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            monitor_period: Duration::from_secs(15),
            reap_timeout: Duration::from_secs(2),
        }
    }
}

impl ReplicatorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the `_changes` page size.
    ///
    /// # Returns
    ///
    /// The updated configuration, or
    /// [`ConfigError::BatchLimitTooSmall`] for limits below
    /// [`MIN_BATCH_LIMIT`].
    ///
    /// # Examples
    ///
    /// ```
    /// use weft::config::ReplicatorConfig;
    ///
    /// let config = ReplicatorConfig::new().with_batch_limit(100)?;
    /// assert_eq!(config.batch_limit(), 100);
    /// assert!(ReplicatorConfig::new().with_batch_limit(9).is_err());
    /// # Ok::<(), weft::config::ConfigError>(())
    /// ```
    pub fn with_batch_limit(mut self, limit: usize) -> Result<Self, ConfigError> {
        if limit < MIN_BATCH_LIMIT {
            return Err(ConfigError::BatchLimitTooSmall { limit });
        }
        self.batch_limit = limit;
        Ok(self)
    }

    /// Override the supervisor's monitor cadence, measured start of
    /// iteration to start of iteration.
    #[must_use]
    pub fn with_monitor_period(mut self, period: Duration) -> Self {
        self.monitor_period = period;
        self
    }

    /// Override the bounded per-worker join deadline used when reaping.
    #[must_use]
    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    pub fn monitor_period(&self) -> Duration {
        self.monitor_period
    }

    pub fn reap_timeout(&self) -> Duration {
        self.reap_timeout
    }
}
