//! Agent configuration: a static value object assembled and validated at
//! startup, before any worker is constructed.
//!
//! The binary layers CLI flags and environment variables over these
//! defaults (see `main.rs`); everything past `AgentConfig::validate` can
//! assume the configuration is sane.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::RetryPolicy;

/// A configuration value that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required string setting is empty.
    #[error("config `{setting}` must not be empty")]
    Empty {
        /// Name of the offending setting.
        setting: &'static str,
    },

    /// A URL setting has an unsupported scheme.
    #[error("config `{setting}` must start with one of {expected}, got `{value}`")]
    BadScheme {
        /// Name of the offending setting.
        setting: &'static str,
        /// Accepted scheme list, for the error message.
        expected: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A numeric setting is out of its allowed range.
    #[error("config `{setting}` must be at least {minimum}")]
    TooSmall {
        /// Name of the offending setting.
        setting: &'static str,
        /// Smallest accepted value.
        minimum: u64,
    },
}

/// Identity of the audio-processing server this agent relays for.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// Unique server id, for example `dp-1`.
    pub server_id: String,
    /// Deployment region, for example `us-east-1`.
    pub region: String,
    /// Agent build version reported in enrichment and registration.
    pub version: String,
    /// Product capabilities advertised at registration.
    pub capabilities: Vec<String>,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            region: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec!["STT".to_string()],
        }
    }
}

/// Broker-side queue names.
///
/// The logical names (`usage`, `session_lifecycle`, `quota_refresh`,
/// `quota_response`, `dead_letter`) are fixed; only the broker-side list
/// names are configurable.
#[derive(Debug, Clone)]
pub struct QueueNames {
    /// Usage records from upstream servers.
    pub usage: String,
    /// Session lifecycle events.
    pub session_lifecycle: String,
    /// Quota refresh requests.
    pub quota_refresh: String,
    /// Quota grants pushed back for upstream servers.
    pub quota_response: String,
    /// Terminal failures.
    pub dead_letter: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            usage: "queue:usage_records".to_string(),
            session_lifecycle: "queue:session_lifecycle".to_string(),
            quota_refresh: "queue:quota_refresh".to_string(),
            quota_response: "queue:quota_response".to_string(),
            dead_letter: "queue:dead_letter".to_string(),
        }
    }
}

impl QueueNames {
    /// All queues as `(logical name, broker name)` pairs, consumed queues
    /// first.
    #[must_use]
    pub fn all(&self) -> [(&'static str, &str); 5] {
        [
            ("usage", &self.usage),
            ("session_lifecycle", &self.session_lifecycle),
            ("quota_refresh", &self.quota_refresh),
            ("quota_response", &self.quota_response),
            ("dead_letter", &self.dead_letter),
        ]
    }

    /// Resolves a logical queue name to its broker name.
    #[must_use]
    pub fn resolve(&self, logical: &str) -> Option<&str> {
        self.all()
            .into_iter()
            .find(|(name, _)| *name == logical)
            .map(|(_, broker)| broker)
    }
}

/// Message broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL. `redis://` or `rediss://` for Redis, `memory://` for
    /// the in-process backend used in development and tests.
    pub url: String,
    /// How long one blocking pop waits before returning empty. Bounds how
    /// quickly a worker observes the shutdown signal when its queue is
    /// idle.
    pub pop_timeout: Duration,
    /// First reconnect delay after a pop error.
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap.
    pub reconnect_max_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pop_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Control-plane HTTP settings.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Base URL, for example `https://control.example.com`.
    pub base_url: String,
    /// API key exchanged for a bearer token at startup and on 401.
    pub api_key: String,
    /// Per-request timeout. A timed-out request classifies as transient.
    pub request_timeout: Duration,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Command processor settings.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// How often to poll the control plane for pending commands.
    pub poll_interval: Duration,
    /// Capacity of the recently-executed cache. Bounds memory while
    /// keeping enough history to absorb at-least-once redelivery.
    pub seen_cache_capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            seen_cache_capacity: 1024,
        }
    }
}

/// Heartbeat worker settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between beats.
    pub interval: Duration,
    /// Consecutive failures before the connection tracker opens and beats
    /// are skipped until the backoff elapses.
    pub failure_threshold: u32,
    /// First backoff delay once the tracker opens.
    pub backoff_base_delay: Duration,
    /// Backoff delay cap.
    pub backoff_max_delay: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            failure_threshold: 3,
            backoff_base_delay: Duration::from_secs(1),
            backoff_max_delay: Duration::from_secs(60),
        }
    }
}

/// Bind addresses for the agent's own HTTP surfaces.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Health/readiness endpoints.
    pub health_addr: SocketAddr,
    /// Prometheus scrape endpoint.
    pub metrics_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            health_addr: ([0, 0, 0, 0], 8080).into(),
            metrics_addr: ([0, 0, 0, 0], 9090).into(),
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server identity used for enrichment and registration.
    pub identity: ServerIdentity,
    /// Broker-side queue names.
    pub queues: QueueNames,
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Control-plane HTTP settings.
    pub control_plane: ControlPlaneConfig,
    /// Command processor settings.
    pub commands: CommandConfig,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// HTTP bind addresses.
    pub http: HttpConfig,
    /// How long shutdown waits for in-flight messages before giving up.
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: ServerIdentity::default(),
            queues: QueueNames::default(),
            broker: BrokerConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            commands: CommandConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            http: HttpConfig::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Checks the configuration for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_setting("identity.server_id", &self.identity.server_id)?;
        require_setting("identity.region", &self.identity.region)?;
        require_setting("control_plane.api_key", &self.control_plane.api_key)?;

        let base_url = &self.control_plane.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::BadScheme {
                setting: "control_plane.base_url",
                expected: "http://, https://",
                value: base_url.clone(),
            });
        }

        let broker_url = &self.broker.url;
        if !broker_url.starts_with("redis://")
            && !broker_url.starts_with("rediss://")
            && !broker_url.starts_with("memory://")
        {
            return Err(ConfigError::BadScheme {
                setting: "broker.url",
                expected: "redis://, rediss://, memory://",
                value: broker_url.clone(),
            });
        }

        if self.control_plane.retry.max_attempts < 1 {
            return Err(ConfigError::TooSmall {
                setting: "control_plane.retry.max_attempts",
                minimum: 1,
            });
        }
        if self.broker.pop_timeout < Duration::from_millis(100) {
            return Err(ConfigError::TooSmall {
                setting: "broker.pop_timeout_ms",
                minimum: 100,
            });
        }
        if self.commands.seen_cache_capacity < 1 {
            return Err(ConfigError::TooSmall {
                setting: "commands.seen_cache_capacity",
                minimum: 1,
            });
        }
        Ok(())
    }
}

fn require_setting(setting: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { setting });
    }
    Ok(())
}
