//! Typed configuration loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid config. Durations
//! are integer fields with accessor methods returning `Duration`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{CourierError, RetryPolicy};
use crate::impls::UnknownChannelPolicy;
use crate::typed::UnknownTypePolicy;

/// Overrides `store.database_url`.
pub const DATABASE_URL_ENV: &str = "COURIER_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for CourierError {
    fn from(err: ConfigError) -> Self {
        CourierError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub dispatch: DispatchConfig,
    pub reaper: ReaperConfig,
    pub retention: RetentionConfig,
    pub idempotency: IdempotencyConfig,
    pub logging: LoggingConfig,
}

impl CourierConfig {
    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV)
            && !url.is_empty()
        {
            self.store.database_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.worker.batch_size == 0 {
            return invalid("worker.batch_size must be > 0");
        }
        if self.worker.pool_size == 0 {
            return invalid("worker.pool_size must be > 0");
        }
        if self.dispatch.batch_size == 0 {
            return invalid("dispatch.batch_size must be > 0");
        }
        if self.dispatch.max_in_flight == 0 {
            return invalid("dispatch.max_in_flight must be > 0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1");
        }
        for (name, ttl, every) in [
            ("worker", self.worker.lease_ttl_secs, self.worker.lease_extend_secs),
            ("dispatch", self.dispatch.lease_ttl_secs, self.dispatch.lease_extend_secs),
            ("retention", self.retention.lease_ttl_secs, self.retention.lease_extend_secs),
        ] {
            if every == 0 || every >= ttl {
                return Err(ConfigError::Invalid(format!(
                    "{name}.lease_extend_secs must be > 0 and < {name}.lease_ttl_secs"
                )));
            }
        }
        if self.retention.batch_size == 0 {
            return invalid("retention.batch_size must be > 0");
        }

        // A live claim must never look stale to the reaper.
        let stale = self.queue.stale_claim_secs;
        if stale <= self.worker.heartbeat_secs {
            return invalid("queue.stale_claim_secs must be > worker.heartbeat_secs");
        }
        if stale <= self.worker.handler_timeout_secs {
            return invalid("queue.stale_claim_secs must be > worker.handler_timeout_secs");
        }
        let waves = self.dispatch.batch_size.div_ceil(self.dispatch.max_in_flight);
        let dispatch_secs = u64::try_from(waves)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.dispatch.delivery_timeout_secs);
        if stale <= dispatch_secs {
            return Err(ConfigError::Invalid(format!(
                "queue.stale_claim_secs must be > {dispatch_secs} \
                 (dispatch batch waves x dispatch.delivery_timeout_secs)"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// PostgreSQL URL. Absent means the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_max_retries: u32,
    /// Claims older than this are released by the reaper.
    pub stale_claim_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 5,
            stale_claim_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn stale_claim(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter: 0.2,
            seed: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Injected identity. The entrypoint generates one when absent.
    pub worker_id: Option<String>,
    pub batch_size: usize,
    /// Concurrent handler invocations per process.
    pub pool_size: usize,
    pub poll_interval_ms: u64,
    pub claim_timeout_ms: u64,
    pub handler_timeout_secs: u64,
    /// Pause after a store failure before the next poll cycle.
    pub store_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
    /// Run single-leader under this lease name.
    pub leader_lease: Option<String>,
    pub lease_ttl_secs: u64,
    pub lease_extend_secs: u64,
    /// How often in-flight claims are refreshed.
    pub heartbeat_secs: u64,
    pub unknown_type_policy: UnknownTypePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            batch_size: 10,
            pool_size: 8,
            poll_interval_ms: 500,
            claim_timeout_ms: 5_000,
            handler_timeout_secs: 60,
            store_backoff_ms: 2_000,
            shutdown_grace_secs: 30,
            leader_lease: None,
            lease_ttl_secs: 30,
            lease_extend_secs: 10,
            heartbeat_secs: 30,
            unknown_type_policy: UnknownTypePolicy::DeadLetter,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn store_backoff(&self) -> Duration {
        Duration::from_millis(self.store_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_extend_every(&self) -> Duration {
        Duration::from_secs(self.lease_extend_secs)
    }

    pub fn heartbeat_every(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Singleton role name held while dispatching.
    pub lease_name: String,
    pub batch_size: usize,
    /// Semaphore size: concurrent deliveries the receivers tolerate.
    pub max_in_flight: usize,
    pub poll_interval_ms: u64,
    pub delivery_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub lease_extend_secs: u64,
    /// Treat 4xx other than 409/422 as retryable instead of terminal.
    pub client_errors_are_transient: bool,
    /// event_type -> webhook URL.
    pub webhook_routes: BTreeMap<String, String>,
    pub unknown_channel_policy: UnknownChannelPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lease_name: "outbox-dispatcher".to_string(),
            batch_size: 50,
            max_in_flight: 16,
            poll_interval_ms: 500,
            delivery_timeout_secs: 10,
            lease_ttl_secs: 30,
            lease_extend_secs: 10,
            client_errors_are_transient: false,
            webhook_routes: BTreeMap::new(),
            unknown_channel_policy: UnknownChannelPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_extend_every(&self) -> Duration {
        Duration::from_secs(self.lease_extend_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Leadership role for the sweep, held across the fleet so sweeps never
    /// overlap. Separate from `dispatch.lease_name`: the sweep may run on a
    /// different node than the dispatcher.
    pub lease_name: String,
    pub interval_secs: u64,
    pub processed_retention_hours: u64,
    pub dead_letter_retention_days: u64,
    pub batch_size: usize,
    pub max_batches: usize,
    pub lease_ttl_secs: u64,
    pub lease_extend_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            lease_name: "retention-sweep".to_string(),
            interval_secs: 3_600,
            processed_retention_hours: 72,
            dead_letter_retention_days: 90,
            batch_size: 1_000,
            max_batches: 100,
            lease_ttl_secs: 300,
            lease_extend_secs: 60,
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn processed_retention(&self) -> Duration {
        Duration::from_secs(self.processed_retention_hours * 3_600)
    }

    pub fn dead_letter_retention(&self) -> Duration {
        Duration::from_secs(self.dead_letter_retention_days * 86_400)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_extend_every(&self) -> Duration {
        Duration::from_secs(self.lease_extend_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a crashed attempt blocks its key.
    pub in_flight_ttl_secs: u64,
    /// How long completed keys suppress duplicates.
    pub complete_retain_hours: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            in_flight_ttl_secs: 300,
            complete_retain_hours: 168,
        }
    }
}

impl IdempotencyConfig {
    pub fn in_flight_ttl(&self) -> Duration {
        Duration::from_secs(self.in_flight_ttl_secs)
    }

    pub fn complete_retain(&self) -> Duration {
        Duration::from_secs(self.complete_retain_hours * 3_600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
