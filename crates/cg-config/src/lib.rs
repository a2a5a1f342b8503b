#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-config** – environment-variable configuration loader.
//!
//! Every tunable listed in the configuration table is optional with a
//! documented default, following the same `from_env()` idiom the rest of
//! the pipeline's components use for their own `*Config` structs
//! ([`cg_wal::WalConfig`], [`cg_retry::RetryConfig`],
//! [`cg_compactor::CompactorConfig`], [`cg_supervisor::SupervisorConfig`]).
//! This crate does not introduce a new configuration format; it reads
//! `WAL_*` / `CONSUMER_WAL_*` / `SUPERVISOR_*` variables and converts them
//! into those components' own config types.
//!
//! Lookup is factored through a `Lookup` closure rather than calling
//! `std::env::var` directly everywhere, so tests can exercise every
//! branch without mutating real process environment (which is both
//! racy across parallel tests and, on some platforms, unsound to do from
//! multiple threads).

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was present but could not be parsed as the expected type.
    #[error("{var} is set to {value:?}, which is not a valid {expected}")]
    InvalidValue {
        /// The variable name.
        var: String,
        /// The raw value read from the environment.
        value: String,
        /// A short description of the expected type, for the error message.
        expected: &'static str,
    },
    /// A value violates a cross-field or environment-profile constraint.
    #[error("{0}")]
    Invalid(String),
}

/// The deployment profile, gating production-only constraints (e.g. the
/// durable lease floor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Local development; no production constraints enforced.
    Development,
    /// Staging/integration; same constraints as production.
    Staging,
    /// Production; `WAL_LEASE_DURATION` and `CONSUMER_WAL_LEASE_DURATION`
    /// must be at least 30 seconds.
    Production,
}

impl Environment {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::InvalidValue {
                var: "APP_ENV".to_string(),
                value: other.to_string(),
                expected: "one of development|staging|production",
            }),
        }
    }
}

type Lookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

fn lookup_string(get: &Lookup<'_>, var: &str, default: &str) -> String {
    get(var).unwrap_or_else(|| default.to_string())
}

fn lookup_bool(get: &Lookup<'_>, var: &str, default: bool) -> Result<bool, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue { var: var.to_string(), value, expected: "a boolean" }),
        },
    }
}

fn lookup_u32(get: &Lookup<'_>, var: &str, default: u32) -> Result<u32, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var: var.to_string(), value, expected: "an unsigned integer" }),
    }
}

fn lookup_f64(get: &Lookup<'_>, var: &str, default: f64) -> Result<f64, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var: var.to_string(), value, expected: "a floating-point number" }),
    }
}

fn lookup_seconds(get: &Lookup<'_>, var: &str, default: StdDuration) -> Result<StdDuration, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map(StdDuration::from_secs)
            .map_err(|_| ConfigError::InvalidValue { var: var.to_string(), value, expected: "a whole number of seconds" }),
    }
}

/// One WAL's worth of tunables, read with a variable-name prefix so the
/// producer (`WAL_*`) and consumer (`CONSUMER_WAL_*`) sides share one
/// loader.
#[derive(Debug, Clone)]
pub struct WalSectionConfig {
    /// `{PREFIX}_ENABLED` — when `false`, the WAL is a no-op.
    pub enabled: bool,
    /// `{PREFIX}_PATH` — the KV directory.
    pub path: PathBuf,
    /// `{PREFIX}_SYNC_WRITES` — fsync on every write.
    pub sync_writes: bool,
    /// `{PREFIX}_RETRY_INTERVAL` — retry-loop tick, seconds.
    pub retry_interval: StdDuration,
    /// `{PREFIX}_MAX_RETRIES` — terminal attempt count.
    pub max_retries: u32,
    /// `{PREFIX}_RETRY_BACKOFF` — base backoff, seconds.
    pub retry_backoff: ChronoDuration,
    /// `{PREFIX}_COMPACT_INTERVAL` — compactor tick, seconds.
    pub compact_interval: StdDuration,
    /// `{PREFIX}_ENTRY_TTL` — pending-entry TTL, seconds.
    pub entry_ttl: ChronoDuration,
    /// `{PREFIX}_LEASE_DURATION` — durable lease duration, seconds.
    pub lease_duration: ChronoDuration,
    /// `{PREFIX}_CLOSE_TIMEOUT` — bounded-close limit, seconds.
    pub close_timeout: StdDuration,
}

impl WalSectionConfig {
    fn from_lookup(get: &Lookup<'_>, prefix: &str, default_path: &str) -> Result<Self, ConfigError> {
        let var = |suffix: &str| format!("{prefix}_{suffix}");
        Ok(Self {
            enabled: lookup_bool(get, &var("ENABLED"), true)?,
            path: PathBuf::from(lookup_string(get, &var("PATH"), default_path)),
            sync_writes: lookup_bool(get, &var("SYNC_WRITES"), true)?,
            retry_interval: lookup_seconds(get, &var("RETRY_INTERVAL"), StdDuration::from_secs(30))?,
            max_retries: lookup_u32(get, &var("MAX_RETRIES"), 100)?,
            retry_backoff: ChronoDuration::seconds(
                lookup_seconds(get, &var("RETRY_BACKOFF"), StdDuration::from_secs(5))?.as_secs() as i64,
            ),
            compact_interval: lookup_seconds(get, &var("COMPACT_INTERVAL"), StdDuration::from_secs(3600))?,
            entry_ttl: ChronoDuration::seconds(
                lookup_seconds(get, &var("ENTRY_TTL"), StdDuration::from_secs(168 * 3600))?.as_secs() as i64,
            ),
            lease_duration: ChronoDuration::seconds(
                lookup_seconds(get, &var("LEASE_DURATION"), StdDuration::from_secs(120))?.as_secs() as i64,
            ),
            close_timeout: lookup_seconds(get, &var("CLOSE_TIMEOUT"), StdDuration::from_secs(30))?,
        })
    }

    /// Convert to the WAL engine's own config type.
    pub fn to_wal_config(&self) -> cg_wal::WalConfig {
        cg_wal::WalConfig {
            sync_writes: self.sync_writes,
            ttl: self.entry_ttl,
            lease_duration: self.lease_duration,
            close_timeout: self.close_timeout,
        }
    }

    /// Convert to the retry loop's own config type.
    pub fn to_retry_config(&self, holder_id_prefix: impl Into<String>) -> cg_retry::RetryConfig {
        cg_retry::RetryConfig {
            retry_interval: self.retry_interval,
            base_backoff: self.retry_backoff,
            max_backoff: ChronoDuration::minutes(5),
            max_retries: self.max_retries,
            attempt_timeout: StdDuration::from_secs(10),
            holder_id_prefix: holder_id_prefix.into(),
        }
    }

    /// Convert to the compactor's own config type.
    pub fn to_compactor_config(&self) -> cg_compactor::CompactorConfig {
        cg_compactor::CompactorConfig {
            compact_interval: self.compact_interval,
            ttl: self.entry_ttl,
            batch_size: 100,
            max_gc_iterations: 1000,
        }
    }
}

/// Tuning for one supervisor layer, read with a variable-name prefix.
#[derive(Debug, Clone)]
pub struct SupervisorSectionConfig {
    /// `{PREFIX}_FAILURE_THRESHOLD`.
    pub failure_threshold: f64,
    /// `{PREFIX}_FAILURE_DECAY` seconds.
    pub failure_decay: StdDuration,
    /// `{PREFIX}_FAILURE_BACKOFF` seconds.
    pub failure_backoff: StdDuration,
    /// `{PREFIX}_SHUTDOWN_TIMEOUT` seconds.
    pub shutdown_timeout: StdDuration,
}

impl SupervisorSectionConfig {
    fn from_lookup(get: &Lookup<'_>, prefix: &str) -> Result<Self, ConfigError> {
        let var = |suffix: &str| format!("{prefix}_{suffix}");
        Ok(Self {
            failure_threshold: lookup_f64(get, &var("FAILURE_THRESHOLD"), 5.0)?,
            failure_decay: lookup_seconds(get, &var("FAILURE_DECAY"), StdDuration::from_secs(30))?,
            failure_backoff: lookup_seconds(get, &var("FAILURE_BACKOFF"), StdDuration::from_secs(15))?,
            shutdown_timeout: lookup_seconds(get, &var("SHUTDOWN_TIMEOUT"), StdDuration::from_secs(10))?,
        })
    }

    /// Convert to the supervisor's own config type.
    pub fn to_supervisor_config(&self) -> cg_supervisor::SupervisorConfig {
        cg_supervisor::SupervisorConfig {
            failure_threshold: self.failure_threshold,
            failure_decay: self.failure_decay,
            failure_backoff: self.failure_backoff,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

/// The HTTP surface's own small section (host/port for the API router).
#[derive(Debug, Clone)]
pub struct ServerSectionConfig {
    /// `SERVER_HOST`, default `0.0.0.0`.
    pub host: String,
    /// `SERVER_PORT`, default `8080`.
    pub port: u16,
}

impl ServerSectionConfig {
    fn from_lookup(get: &Lookup<'_>) -> Result<Self, ConfigError> {
        let port = match get("SERVER_PORT") {
            None => 8080,
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { var: "SERVER_PORT".to_string(), value, expected: "a port number" })?,
        };
        Ok(Self { host: lookup_string(get, "SERVER_HOST", "0.0.0.0"), port })
    }
}

/// Full process configuration: deployment profile plus every component
/// section, assembled from environment variables with documented
/// defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Deployment profile (`APP_ENV`, default `development`).
    pub environment: Environment,
    /// `WAL_*` — the producer WAL's section.
    pub producer_wal: WalSectionConfig,
    /// `CONSUMER_WAL_*` — the consumer WAL's section.
    pub consumer_wal: WalSectionConfig,
    /// `SUPERVISOR_*` — the root supervisor layer's section.
    pub supervisor: SupervisorSectionConfig,
    /// `SERVER_*` — the HTTP surface's section.
    pub server: ServerSectionConfig,
}

impl AppConfig {
    /// Load configuration from real process environment variables.
    ///
    /// Reads a `.env` file in the current directory first, if one
    /// exists, without overriding variables already set in the process
    /// environment (matching `dotenvy`'s default precedence).
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(error) = dotenvy::dotenv() {
            if !error.not_found() {
                tracing::warn!(%error, "failed to read .env file");
            }
        }
        let get = |name: &str| std::env::var(name).ok();
        Self::from_lookup(&get)
    }

    fn from_lookup(get: &Lookup<'_>) -> Result<Self, ConfigError> {
        let environment = match get("APP_ENV") {
            None => Environment::Development,
            Some(value) => Environment::parse(&value)?,
        };
        let config = Self {
            environment,
            producer_wal: WalSectionConfig::from_lookup(get, "WAL", "/data/wal")?,
            consumer_wal: WalSectionConfig::from_lookup(get, "CONSUMER_WAL", "/data/consumer-wal")?,
            supervisor: SupervisorSectionConfig::from_lookup(get, "SUPERVISOR")?,
            server: ServerSectionConfig::from_lookup(get)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field and environment-profile validation: the durable lease
    /// must be at least 30 s in production.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment == Environment::Production {
            for (name, section) in [("WAL", &self.producer_wal), ("CONSUMER_WAL", &self.consumer_wal)] {
                if section.lease_duration < ChronoDuration::seconds(30) {
                    return Err(ConfigError::Invalid(format!(
                        "{name}_LEASE_DURATION must be at least 30s in production, got {}s",
                        section.lease_duration.num_seconds()
                    )));
                }
            }
        }
        Ok(())
    }
}
