//! Coordinator configuration.
//!
//! Loaded from `RUNCOORD_*` environment variables:
//! - `RUNCOORD_BIND_ADDR` - Listen address (default: 127.0.0.1:8787)
//! - `RUNCOORD_DATABASE_URL` - SQLite URL; unset keeps everything in memory
//! - `RUNCOORD_HOST_ID` - Host recorded on new sessions (default: `HOSTNAME` or localhost)
//! - `RUNCOORD_HEARTBEAT_TIMEOUT_SECS` - Runner liveness threshold (default: 30)
//! - `RUNCOORD_RETIRE_GRACE_SECS` - Grace for externally deregistered runners (default: 60)
//! - `RUNCOORD_STREAM_BUFFER` - Per-subscriber live event buffer (default: 256)
//! - `RUNCOORD_STREAM_DISCONNECT_ON_LAG` - Close lagging streams (default: false)
//! - `RUNCOORD_REAPER_POLICY` - `disabled`, `requeue` or `fail` (default: disabled)
//! - `RUNCOORD_REAP_AFTER_SECS` - Heartbeat age before a runner's runs are reaped (default: 120)
//! - `RUNCOORD_MAINTENANCE_INTERVAL_SECS` - Sweep period (default: 5)

use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use runcoord_core::broadcaster::DEFAULT_CAPACITY;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// What the maintenance sweep does with runs whose runner went silent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReaperPolicy {
    /// Leave orphaned runs where they are.
    #[default]
    Disabled,
    /// Put claimed runs back in the queue; fail running ones.
    Requeue,
    /// Fail claimed and running runs.
    Fail,
}

impl ReaperPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Requeue => "requeue",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for ReaperPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReaperPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "requeue" => Ok(Self::Requeue),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "invalid reaper policy '{other}', expected disabled/requeue/fail"
            )),
        }
    }
}

/// Validated coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub host_id: String,
    pub heartbeat_timeout: Duration,
    pub retire_grace: Duration,
    pub stream_buffer: usize,
    pub disconnect_on_lag: bool,
    pub reaper_policy: ReaperPolicy,
    pub reap_after: Duration,
    pub maintenance_interval: Duration,
}

impl CoordinatorConfig {
    #[must_use]
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Load and validate configuration from the process environment.
    ///
    /// # Errors
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        CoordinatorConfigBuilder::from_lookup(|key| env::var(key).ok())?.build()
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let b = CoordinatorConfigBuilder::default();
        Self {
            bind_addr: b.bind_addr,
            database_url: b.database_url,
            host_id: b.host_id,
            heartbeat_timeout: Duration::from_secs(b.heartbeat_timeout_secs),
            retire_grace: Duration::from_secs(b.retire_grace_secs),
            stream_buffer: b.stream_buffer,
            disconnect_on_lag: b.disconnect_on_lag,
            reaper_policy: b.reaper_policy,
            reap_after: Duration::from_secs(b.reap_after_secs),
            maintenance_interval: Duration::from_secs(b.maintenance_interval_secs),
        }
    }
}

/// Builder for `CoordinatorConfig`.
#[derive(Debug, Clone)]
pub struct CoordinatorConfigBuilder {
    bind_addr: SocketAddr,
    database_url: Option<String>,
    host_id: String,
    heartbeat_timeout_secs: u64,
    retire_grace_secs: u64,
    stream_buffer: usize,
    disconnect_on_lag: bool,
    reaper_policy: ReaperPolicy,
    reap_after_secs: u64,
    maintenance_interval_secs: u64,
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            database_url: None,
            host_id: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            heartbeat_timeout_secs: 30,
            retire_grace_secs: 60,
            stream_buffer: DEFAULT_CAPACITY,
            disconnect_on_lag: false,
            reaper_policy: ReaperPolicy::Disabled,
            reap_after_secs: 120,
            maintenance_interval_secs: 5,
        }
    }
}

impl CoordinatorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides through `lookup` (the environment, in production).
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidEnvVar` for unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(addr) = parse_var::<SocketAddr>(&lookup, "RUNCOORD_BIND_ADDR")? {
            builder = builder.bind_addr(addr);
        }
        if let Some(url) = lookup("RUNCOORD_DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            builder = builder.database_url(url);
        }
        if let Some(host) = lookup("RUNCOORD_HOST_ID").filter(|h| !h.trim().is_empty()) {
            builder = builder.host_id(host);
        }
        if let Some(secs) = parse_var(&lookup, "RUNCOORD_HEARTBEAT_TIMEOUT_SECS")? {
            builder = builder.heartbeat_timeout_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "RUNCOORD_RETIRE_GRACE_SECS")? {
            builder = builder.retire_grace_secs(secs);
        }
        if let Some(size) = parse_var(&lookup, "RUNCOORD_STREAM_BUFFER")? {
            builder = builder.stream_buffer(size);
        }
        if let Some(disconnect) = get_bool(&lookup, "RUNCOORD_STREAM_DISCONNECT_ON_LAG")? {
            builder = builder.disconnect_on_lag(disconnect);
        }
        if let Some(policy) = parse_var(&lookup, "RUNCOORD_REAPER_POLICY")? {
            builder = builder.reaper_policy(policy);
        }
        if let Some(secs) = parse_var(&lookup, "RUNCOORD_REAP_AFTER_SECS")? {
            builder = builder.reap_after_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "RUNCOORD_MAINTENANCE_INTERVAL_SECS")? {
            builder = builder.maintenance_interval_secs(secs);
        }

        Ok(builder)
    }

    #[must_use]
    pub const fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn host_id(mut self, host: impl Into<String>) -> Self {
        self.host_id = host.into();
        self
    }

    #[must_use]
    pub const fn heartbeat_timeout_secs(mut self, secs: u64) -> Self {
        self.heartbeat_timeout_secs = secs;
        self
    }

    #[must_use]
    pub const fn retire_grace_secs(mut self, secs: u64) -> Self {
        self.retire_grace_secs = secs;
        self
    }

    #[must_use]
    pub const fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }

    #[must_use]
    pub const fn disconnect_on_lag(mut self, disconnect: bool) -> Self {
        self.disconnect_on_lag = disconnect;
        self
    }

    #[must_use]
    pub const fn reaper_policy(mut self, policy: ReaperPolicy) -> Self {
        self.reaper_policy = policy;
        self
    }

    #[must_use]
    pub const fn reap_after_secs(mut self, secs: u64) -> Self {
        self.reap_after_secs = secs;
        self
    }

    #[must_use]
    pub const fn maintenance_interval_secs(mut self, secs: u64) -> Self {
        self.maintenance_interval_secs = secs;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` if the configuration is invalid.
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        self.validate()?;

        Ok(CoordinatorConfig {
            bind_addr: self.bind_addr,
            database_url: self.database_url,
            host_id: self.host_id,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            retire_grace: Duration::from_secs(self.retire_grace_secs),
            stream_buffer: self.stream_buffer,
            disconnect_on_lag: self.disconnect_on_lag,
            reaper_policy: self.reaper_policy,
            reap_after: Duration::from_secs(self.reap_after_secs),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
            ("retire_grace_secs", self.retire_grace_secs),
            ("reap_after_secs", self.reap_after_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::Validation(
                "stream_buffer must be greater than 0".to_string(),
            ));
        }
        if self.reap_after_secs < self.heartbeat_timeout_secs {
            return Err(ConfigError::Validation(
                "reap_after_secs must be >= heartbeat_timeout_secs".to_string(),
            ));
        }
        if self.host_id.trim().is_empty() {
            return Err(ConfigError::Validation("host_id cannot be empty".to_string()));
        }
        Ok(())
    }
}

// Environment variable helper functions

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key)
        .map(|val| {
            val.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid value '{val}': {e}"),
            })
        })
        .transpose()
}

fn get_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        Some(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        None => Ok(None),
    }
}
