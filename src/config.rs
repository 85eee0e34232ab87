use crate::domain::entities::{Endpoint, SecurityMode};
use crate::domain::value_objects::FreshnessPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Default server port when the URL does not carry one.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct Config {
    // Server endpoints, in failover priority order
    pub urls: Vec<String>,
    pub token: Option<String>,
    pub tls_enabled: bool,
    pub query_timeout: Duration,
    pub connect_timeout: Duration,

    // Failover settings
    pub failover_cooldown: Duration,
    pub probe_interval: Duration,
    pub max_attempts: u32,
    pub timeout_threshold: u32,

    // Embedded replica settings
    pub replicas_dir: Option<PathBuf>,
    pub replication_url: Option<String>,
    pub replication_stream: String,
    pub replication_durable: Option<String>,
    pub fetch_batch_size: usize,
    pub fetch_wait: Duration,

    // Freshness tolerance for replica reads
    pub max_staleness: Option<Duration>,
    pub max_sequence_lag: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            urls: vec!["litesql://localhost:8080".to_string()],
            token: None,
            tls_enabled: false,
            query_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            failover_cooldown: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
            max_attempts: 3,
            timeout_threshold: 2,
            replicas_dir: None,
            replication_url: None,
            replication_stream: "ha".to_string(),
            replication_durable: None,
            fetch_batch_size: 10,
            fetch_wait: Duration::from_secs(5),
            max_staleness: None,
            max_sequence_lag: None,
        }
    }
}

impl Config {
    /// Create a configuration for a single server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Append a failover endpoint (lower priority than existing ones).
    pub fn fallback_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn failover_cooldown(mut self, cooldown: Duration) -> Self {
        self.failover_cooldown = cooldown;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Enable the replica read path.
    pub fn replicas(
        mut self,
        dir: impl Into<PathBuf>,
        replication_url: impl Into<String>,
        durable: impl Into<String>,
    ) -> Self {
        self.replicas_dir = Some(dir.into());
        self.replication_url = Some(replication_url.into());
        self.replication_durable = Some(durable.into());
        self
    }

    pub fn replication_stream(mut self, stream: impl Into<String>) -> Self {
        self.replication_stream = stream.into();
        self
    }

    pub fn max_staleness(mut self, staleness: Duration) -> Self {
        self.max_staleness = Some(staleness);
        self
    }

    pub fn max_sequence_lag(mut self, lag: u64) -> Self {
        self.max_sequence_lag = Some(lag);
        self
    }

    /// Freshness tolerance applied to replica reads.
    pub fn freshness(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            max_staleness: self.max_staleness,
            max_sequence_lag: self.max_sequence_lag,
        }
    }

    /// Whether the embedded replica read path is configured.
    pub fn replicas_enabled(&self) -> bool {
        self.replicas_dir.is_some()
            && self.replication_url.is_some()
            && self.replication_durable.is_some()
    }

    /// Parse the configured URLs into endpoints, in priority order.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        let security = if self.tls_enabled {
            SecurityMode::Tls
        } else {
            SecurityMode::Plain
        };

        self.urls
            .iter()
            .map(|url| parse_endpoint(url, security, self.token.clone()))
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.urls.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        self.endpoints()?;
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "query_timeout must be positive".to_string(),
            ));
        }
        if self.replicas_dir.is_some() && self.replication_durable.is_none() {
            return Err(ConfigError::MissingDurable);
        }
        Ok(())
    }
}

/// Parse `litesql://host:port/database` into an endpoint.
///
/// The database path is the replication id used for every call; the port
/// defaults to 8080 and the host to `localhost`.
pub fn parse_endpoint(
    url: &str,
    security: SecurityMode,
    token: Option<String>,
) -> Result<Endpoint, ConfigError> {
    let trimmed = url.trim();
    let normalized = match trimmed.strip_prefix("litesql://") {
        Some(rest) => format!("http://{}", rest),
        None => {
            return Err(ConfigError::InvalidUrl(trimmed.to_string()));
        }
    };

    let parsed = reqwest::Url::parse(&normalized)
        .map_err(|_| ConfigError::InvalidUrl(trimmed.to_string()))?;

    let host = parsed.host_str().unwrap_or("localhost");
    let port = parsed.port().unwrap_or(DEFAULT_PORT);
    let database = parsed.path().trim_start_matches('/').to_string();

    Ok(Endpoint::new(
        format!("{}:{}", host, port),
        database,
        security,
        token,
    ))
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one server url is required")]
    MissingUrl,
    #[error("invalid server url (expected litesql://host:port/db): {0}")]
    InvalidUrl(String),
    #[error("replicas_dir requires a durable consumer name")]
    MissingDurable,
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Load configuration from `LITESQL_HA_*` environment variables.
pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let urls = std::env::var("LITESQL_HA_URL")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| defaults.urls.clone());

    let token = std::env::var("LITESQL_HA_TOKEN").ok();
    let tls_enabled = env_flag("LITESQL_HA_SSL");

    let query_timeout = Duration::from_secs(env_parse("LITESQL_HA_TIMEOUT_SECS").unwrap_or(30));
    let connect_timeout =
        Duration::from_secs(env_parse("LITESQL_HA_LOGIN_TIMEOUT_SECS").unwrap_or(30));

    let failover_cooldown =
        Duration::from_secs(env_parse("LITESQL_HA_FAILOVER_COOLDOWN_SECS").unwrap_or(30));
    let probe_interval =
        Duration::from_secs(env_parse("LITESQL_HA_PROBE_INTERVAL_SECS").unwrap_or(10));
    let max_attempts = env_parse("LITESQL_HA_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts);

    // Embedded replica settings
    let replicas_dir = std::env::var("LITESQL_HA_REPLICAS_DIR").ok().map(PathBuf::from);
    let replication_url = std::env::var("LITESQL_HA_REPLICATION_URL").ok();
    let replication_stream = std::env::var("LITESQL_HA_REPLICATION_STREAM")
        .unwrap_or_else(|_| "ha".to_string());
    let replication_durable = std::env::var("LITESQL_HA_REPLICATION_DURABLE").ok();

    let max_staleness = env_parse::<u64>("LITESQL_HA_MAX_STALENESS_MS").map(Duration::from_millis);
    let max_sequence_lag = env_parse("LITESQL_HA_MAX_SEQUENCE_LAG");

    let config = Config {
        urls,
        token,
        tls_enabled,
        query_timeout,
        connect_timeout,
        failover_cooldown,
        probe_interval,
        max_attempts,
        replicas_dir,
        replication_url,
        replication_stream,
        replication_durable,
        max_staleness,
        max_sequence_lag,
        ..defaults
    };

    config.validate()?;
    Ok(config)
}
