//! Service configuration.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use webhooker_delivery::{client::ClientConfig, DeliveryConfig, RetrySchedule};

const CONFIG_FILE: &str = "webhooker.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`webhooker.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// The defaults reproduce the delivery policy exactly: three runners, a
/// 30 second callback timeout, ten executions with `n^5` second backoff
/// plus 30 s to 10 min of jitter, and ngrok as the only tunnel host.
///
/// # Example
///
/// ```no_run
/// use webhooker_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Inbound HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Job runners
    /// Number of concurrent job runners.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Maximum jobs claimed per poll.
    ///
    /// Environment variable: `WORKER_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "WORKER_BATCH_SIZE")]
    pub worker_batch_size: usize,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `WORKER_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "WORKER_POLL_INTERVAL_MS")]
    pub worker_poll_interval_ms: u64,
    /// How long a claimed job stays leased, in seconds.
    ///
    /// Environment variable: `JOB_LEASE_SECONDS`
    #[serde(default = "default_job_lease", alias = "JOB_LEASE_SECONDS")]
    pub job_lease_seconds: u64,
    /// Time allowed for runners to finish on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Retry
    /// Maximum executions per delivery, including the first.
    ///
    /// Environment variable: `MAX_DELIVERY_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: u32,
    /// Exponent of the polynomial backoff.
    ///
    /// Environment variable: `RETRY_EXPONENT`
    #[serde(default = "default_retry_exponent", alias = "RETRY_EXPONENT")]
    pub retry_exponent: u32,
    /// Lower bound of the retry jitter in seconds.
    ///
    /// Environment variable: `RETRY_JITTER_MIN_SECONDS`
    #[serde(default = "default_jitter_min", alias = "RETRY_JITTER_MIN_SECONDS")]
    pub retry_jitter_min_seconds: u64,
    /// Upper bound (exclusive) of the retry jitter in seconds.
    ///
    /// Environment variable: `RETRY_JITTER_MAX_SECONDS`
    #[serde(default = "default_jitter_max", alias = "RETRY_JITTER_MAX_SECONDS")]
    pub retry_jitter_max_seconds: u64,

    // Client
    /// Callback request timeout in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// `User-Agent` sent with every callback.
    ///
    /// Environment variable: `DELIVERY_USER_AGENT`
    #[serde(default = "default_user_agent", alias = "DELIVERY_USER_AGENT")]
    pub delivery_user_agent: String,
    /// Optional cap on stored response bodies, in bytes. Unset stores
    /// bodies in full.
    ///
    /// Environment variable: `MAX_RESPONSE_BODY_BYTES`
    #[serde(default, alias = "MAX_RESPONSE_BODY_BYTES")]
    pub max_response_body_bytes: Option<usize>,
    /// Host suffixes treated as ephemeral tunnels.
    ///
    /// Environment variable: `TUNNEL_HOST_SUFFIXES`, e.g.
    /// `[ngrok.io, ngrok-free.app]`
    #[serde(default = "default_tunnel_suffixes", alias = "TUNNEL_HOST_SUFFIXES")]
    pub tunnel_host_suffixes: Vec<String>,

    // Logging
    /// Log filter directive.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery engine's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_pool_size,
            batch_size: self.worker_batch_size,
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            job_lease: Duration::from_secs(self.job_lease_seconds),
            client_config: self.to_client_config(),
            retry_schedule: self.to_retry_schedule(),
            tunnel_suffixes: self.tunnel_host_suffixes.clone(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: self.delivery_user_agent.clone(),
            max_body_bytes: self.max_response_body_bytes,
            ..ClientConfig::default()
        }
    }

    /// Convert to the retry schedule.
    pub fn to_retry_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            max_attempts: self.max_delivery_attempts,
            exponent: self.retry_exponent,
            jitter_min: Duration::from_secs(self.retry_jitter_min_seconds),
            jitter_max: Duration::from_secs(self.retry_jitter_max_seconds),
        }
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        let url = &self.database_url;
        let Some(at_pos) = url.rfind('@') else {
            return url.clone();
        };
        let userinfo_start = url.find("://").map_or(0, |i| i + 3);

        match url.get(userinfo_start..at_pos).and_then(|userinfo| userinfo.find(':')) {
            Some(offset) => {
                let mut masked = url.clone();
                masked.replace_range(userinfo_start + offset + 1..at_pos, "***");
                masked
            },
            None => url.clone(),
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.max_delivery_attempts == 0 {
            anyhow::bail!("max_delivery_attempts must be greater than 0");
        }

        if self.retry_jitter_min_seconds > self.retry_jitter_max_seconds {
            anyhow::bail!("retry_jitter_min_seconds cannot exceed retry_jitter_max_seconds");
        }

        if self.tunnel_host_suffixes.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("tunnel_host_suffixes must name at least one host suffix");
        }

        self.to_delivery_config().validate().context("Invalid delivery configuration")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_pool_size: default_worker_count(),
            worker_batch_size: default_batch_size(),
            worker_poll_interval_ms: default_poll_interval_ms(),
            job_lease_seconds: default_job_lease(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            max_delivery_attempts: default_max_attempts(),
            retry_exponent: default_retry_exponent(),
            retry_jitter_min_seconds: default_jitter_min(),
            retry_jitter_max_seconds: default_jitter_max(),
            delivery_timeout_seconds: default_delivery_timeout(),
            delivery_user_agent: default_user_agent(),
            max_response_body_bytes: None,
            tunnel_host_suffixes: default_tunnel_suffixes(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/webhooker".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    webhooker_delivery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    webhooker_delivery::DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_lease() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_exponent() -> u32 {
    5
}

fn default_jitter_min() -> u64 {
    30
}

fn default_jitter_max() -> u64 {
    600
}

fn default_delivery_timeout() -> u64 {
    webhooker_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_user_agent() -> String {
    webhooker_delivery::DEFAULT_USER_AGENT.to_string()
}

fn default_tunnel_suffixes() -> Vec<String> {
    vec![webhooker_delivery::tunnel::NGROK_SUFFIX.to_string()]
}

fn default_log_level() -> String {
    "info,webhooker=debug,tower_http=debug".to_string()
}
