use std::fmt;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// When to deregister the services of an exited container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeregisterPolicy {
    /// Deregister regardless of exit code.
    Always,
    /// Deregister only when the container exited with code 0.
    OnSuccess,
}

impl fmt::Display for DeregisterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeregisterPolicy::Always => f.write_str("always"),
            DeregisterPolicy::OnSuccess => f.write_str("on-success"),
        }
    }
}

/// InfluxDB v2 target for the telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// IP announced for ports mapped to the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Announce internal container ports instead of published ones.
    pub internal: bool,
    /// Only register containers carrying a `SERVICE_NAME`.
    pub explicit: bool,
    /// Label holding the IP to announce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_ip_from_label: Option<String>,
    /// Seconds between TTL refreshes.
    pub refresh_interval: u64,
    /// Registry TTL in seconds, 0 for no expiry.
    pub ttl: u64,
    #[serde(deserialize_with = "deserialize_tags")]
    pub tags: Vec<String>,
    /// Seconds between full resyncs, 0 to disable.
    pub resync_interval: u64,
    pub deregister: DeregisterPolicy,
    pub deregister_on_stop: bool,
    /// Connection attempts after the first one, -1 for unbounded.
    pub retry_attempts: i64,
    /// Milliseconds between connection attempts.
    pub retry_interval: i64,
    pub cleanup: bool,
    pub hostname: String,
    pub event_buffer: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub influx: Option<InfluxConfig>,
    pub registry_uri: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_ip: None,
            internal: false,
            explicit: false,
            use_ip_from_label: None,
            refresh_interval: 0,
            ttl: 0,
            tags: Vec::new(),
            resync_interval: 0,
            deregister: DeregisterPolicy::Always,
            deregister_on_stop: false,
            retry_attempts: 0,
            retry_interval: 2000,
            cleanup: false,
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            event_buffer: 128,
            influx: None,
            registry_uri: String::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("-ttl and -ttl-refresh must be specified together or not at all")]
    TtlWithoutRefresh,
    #[error("-ttl must be greater than -ttl-refresh")]
    TtlNotAboveRefresh,
    #[error("-retry-interval must be greater than 0")]
    NonPositiveRetryInterval,
    #[error("-retry-attempts must be -1 (infinite) or a non-negative count")]
    InvalidRetryAttempts,
    #[error("event buffer must hold at least one event")]
    EmptyEventBuffer,
    #[error("missing required argument for registry URI")]
    MissingRegistryUri,
    #[error("hostname is empty, export HOSTNAME or pass --hostname")]
    EmptyHostname,
}

/// How many times the connection supervisor may ping the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAttempts {
    Bounded(u32),
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: RetryAttempts,
    pub interval: Duration,
}

impl Config {
    /// Layers defaults, config files, `REGISTRAR_*` environment and the
    /// command line, then validates the result.
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("registrar.toml"))
            .merge(Json::file("registrar.json"))
            .merge(Env::prefixed("REGISTRAR_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.ttl == 0) != (self.refresh_interval == 0) {
            return Err(ConfigError::TtlWithoutRefresh);
        }
        if self.ttl > 0 && self.ttl <= self.refresh_interval {
            return Err(ConfigError::TtlNotAboveRefresh);
        }
        if self.retry_interval <= 0 {
            return Err(ConfigError::NonPositiveRetryInterval);
        }
        if self.retry_attempts < -1 {
            return Err(ConfigError::InvalidRetryAttempts);
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::EmptyEventBuffer);
        }
        if self.registry_uri.trim().is_empty() {
            return Err(ConfigError::MissingRegistryUri);
        }
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let attempts = match u32::try_from(self.retry_attempts) {
            Ok(n) => RetryAttempts::Bounded(n),
            Err(_) => RetryAttempts::Infinite,
        };
        RetryPolicy {
            attempts,
            interval: Duration::from_millis(self.retry_interval.max(1) as u64),
        }
    }

    pub fn ttl(&self) -> Option<u64> {
        (self.ttl > 0).then_some(self.ttl)
    }

    /// Refresh period, armed only when both TTL and interval are set.
    pub fn refresh_period(&self) -> Option<Duration> {
        (self.ttl > 0 && self.refresh_interval > 0)
            .then(|| Duration::from_secs(self.refresh_interval))
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_interval > 0).then(|| Duration::from_secs(self.resync_interval))
    }
}

/// Accepts tags either as a list or as one comma separated string.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tags {
        List(Vec<String>),
        Joined(String),
    }

    let tags = match Tags::deserialize(deserializer)? {
        Tags::List(list) => list,
        Tags::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

/// Command line surface. Unset flags leave lower layers untouched.
#[derive(Debug, Default, Parser, Serialize)]
#[command(name = "registrar")]
#[command(about = "Registers running Docker containers with a service registry", long_about = None)]
#[command(version)]
pub struct Cli {
    /// IP for ports mapped to the host
    #[arg(long = "ip")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    /// Use internal ports instead of published ones
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,

    /// Only register containers which have SERVICE_NAME label set
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit: Option<bool>,

    /// Use IP which is stored in a label assigned to the container
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_ip_from_label: Option<String>,

    /// Frequency (seconds) with which service TTLs are refreshed
    #[arg(long = "ttl-refresh")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,

    /// TTL (seconds) for services (default is no expiry)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Append tags for all registered services
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Frequency (seconds) with which services are resynchronized
    #[arg(long = "resync")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync_interval: Option<u64>,

    /// Deregister exited services "always" or "on-success"
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deregister: Option<DeregisterPolicy>,

    /// Deregister when container stopped versus once it dies
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deregister_on_stop: Option<bool>,

    /// Max retry attempts to establish a connection with the backend, -1 for infinite
    #[arg(long, allow_negative_numbers = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<i64>,

    /// Interval (milliseconds) between retry attempts
    #[arg(long, allow_negative_numbers = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i64>,

    /// Remove dangling services
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<bool>,

    /// Hostname used to build service identities
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Depth of the container event buffer
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_buffer: Option<usize>,

    /// Registry URI, e.g. consul://localhost:8500
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_uri: Option<String>,
}
