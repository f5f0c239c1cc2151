//! # Pipeline Configuration
//!
//! Environment-sourced configuration, validated at startup. Every knob the
//! processor needs comes from `PLENUM__`-prefixed environment variables
//! (section and field joined with `__`), deserialized into typed sections so
//! there are no stringly-typed lookups scattered through the codebase.
//!
//! ```bash
//! PLENUM__QUEUE__NAME=summarize_tasks
//! PLENUM__RATE_LIMIT__TOKENS_PER_SECOND=2.0
//! PLENUM__BACKOFF__CAP_SECS=60
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Root configuration for the worker process
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

/// Queue transport identity and consumption settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue to consume task messages from
    pub name: String,
    /// Postgres connection string for the pgmq-backed transport
    pub database_url: Option<String>,
    /// Messages fetched per poll
    pub batch_size: i32,
    /// Invisibility window granted on receive, seconds
    pub visibility_secs: u32,
    /// Transport maximum publish delay, seconds
    pub max_delay_secs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "summarize_tasks".to_string(),
            database_url: None,
            batch_size: 5,
            visibility_secs: 300,
            max_delay_secs: 900,
        }
    }
}

/// Record store and blob store identity
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Single-table record store table name
    pub table_name: String,
    /// Filesystem root for the blob store
    pub blob_root: String,
    /// Upper bound per batch_put call
    pub max_batch: usize,
    /// Pause before re-queuing rejected batch rows, milliseconds
    pub batch_retry_pause_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_name: "plenum_records".to_string(),
            blob_root: "./blobs".to_string(),
            max_batch: 25,
            batch_retry_pause_ms: 250,
        }
    }
}

/// Outbound generation-call throttle
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_second: f64,
    pub burst_capacity: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 1.0,
            burst_capacity: 2.0,
        }
    }
}

/// Retry backoff shape
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 1,
            cap_secs: 60,
        }
    }
}

/// Per-task execution budgets
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempts after which the message is left to the transport's redrive
    pub max_attempts: u32,
    /// Budget for a single generation call, seconds
    pub call_timeout_secs: u64,
    /// Overall budget for one message, seconds; retries are not scheduled
    /// past this deadline
    pub overall_timeout_secs: u64,
    /// Fixed requeue delay for failed map tasks, seconds
    pub map_retry_delay_secs: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            call_timeout_secs: 120,
            overall_timeout_secs: 840,
            map_retry_delay_secs: 30,
        }
    }
}

/// Generation service endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// URL the worker POSTs generation requests to
    pub endpoint_url: String,
    /// Bearer token, if the service requires one
    pub api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:8080/v1/generate".to_string(),
            api_key: None,
        }
    }
}

/// Circuit breaker thresholds. Trip state is process-local and does not
/// persist across invocations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Failures within the sample before the circuit opens
    pub failure_threshold: u32,
    /// Calls observed before the failure threshold is meaningful
    pub minimum_sample: u32,
    /// Seconds the circuit stays open before probing
    pub cooldown_secs: u64,
    /// Successful probes required to close again
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_sample: 10,
            cooldown_secs: 30,
            half_open_probes: 2,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffConfig::default(),
            execution: ExecutionConfig::default(),
            generation: GenerationConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `PLENUM__*` environment variables, falling back
    /// to defaults for anything unset, then validate.
    pub fn from_env() -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PLENUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PipelineError::configuration("environment", e.to_string()))?;

        let mut cfg: PipelineConfig = loaded
            .try_deserialize()
            .map_err(|e| PipelineError::configuration("deserialize", e.to_string()))?;

        // DATABASE_URL without the prefix is the conventional spelling
        if cfg.queue.database_url.is_none() {
            cfg.queue.database_url = std::env::var("DATABASE_URL").ok();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot work before any queue is touched.
    pub fn validate(&self) -> Result<()> {
        if self.queue.name.is_empty() {
            return Err(PipelineError::configuration("queue.name", "must not be empty"));
        }
        if self.queue.batch_size <= 0 {
            return Err(PipelineError::configuration(
                "queue.batch_size",
                "must be positive",
            ));
        }
        if self.rate_limit.tokens_per_second <= 0.0 || !self.rate_limit.tokens_per_second.is_finite()
        {
            return Err(PipelineError::configuration(
                "rate_limit.tokens_per_second",
                "must be a positive finite number",
            ));
        }
        if self.rate_limit.burst_capacity < 1.0 {
            return Err(PipelineError::configuration(
                "rate_limit.burst_capacity",
                "must allow at least one token",
            ));
        }
        if self.backoff.base_secs == 0 || self.backoff.cap_secs < self.backoff.base_secs {
            return Err(PipelineError::configuration(
                "backoff",
                "base must be positive and cap >= base",
            ));
        }
        if self.execution.max_attempts == 0 {
            return Err(PipelineError::configuration(
                "execution.max_attempts",
                "must be at least 1",
            ));
        }
        if self.storage.max_batch == 0 {
            return Err(PipelineError::configuration(
                "storage.max_batch",
                "must be at least 1",
            ));
        }
        if self.generation.endpoint_url.is_empty() {
            return Err(PipelineError::configuration(
                "generation.endpoint_url",
                "must not be empty",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.half_open_probes == 0
        {
            return Err(PipelineError::configuration(
                "circuit_breaker",
                "thresholds must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.call_timeout_secs)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.overall_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queue.max_delay_secs, 900);
        assert_eq!(cfg.storage.max_batch, 25);
    }

    #[test]
    fn test_partial_env_override_keeps_section_defaults() {
        let vars = [
            ("PLENUM__QUEUE__NAME", "override_queue"),
            ("PLENUM__STORAGE__MAX_BATCH", "10"),
            ("PLENUM__RATE_LIMIT__BURST_CAPACITY", "4.0"),
            ("PLENUM__BACKOFF__CAP_SECS", "120"),
            ("PLENUM__EXECUTION__MAX_ATTEMPTS", "3"),
            ("PLENUM__GENERATION__ENDPOINT_URL", "http://gen.internal/v1"),
            ("PLENUM__CIRCUIT_BREAKER__COOLDOWN_SECS", "45"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }

        let cfg = PipelineConfig::from_env().unwrap();

        for (key, _) in vars {
            std::env::remove_var(key);
        }

        // One field per section overridden, the rest of each section defaults
        assert_eq!(cfg.queue.name, "override_queue");
        assert_eq!(cfg.queue.batch_size, 5);
        assert_eq!(cfg.storage.max_batch, 10);
        assert_eq!(cfg.storage.table_name, "plenum_records");
        assert_eq!(cfg.rate_limit.burst_capacity, 4.0);
        assert_eq!(cfg.rate_limit.tokens_per_second, 1.0);
        assert_eq!(cfg.backoff.cap_secs, 120);
        assert_eq!(cfg.backoff.base_secs, 1);
        assert_eq!(cfg.execution.max_attempts, 3);
        assert_eq!(cfg.execution.overall_timeout_secs, 840);
        assert_eq!(cfg.generation.endpoint_url, "http://gen.internal/v1");
        assert_eq!(cfg.circuit_breaker.cooldown_secs, 45);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_rejects_zero_rate() {
        let mut cfg = PipelineConfig::default();
        cfg.rate_limit.tokens_per_second = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(PipelineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_cap_below_base() {
        let mut cfg = PipelineConfig::default();
        cfg.backoff.base_secs = 10;
        cfg.backoff.cap_secs = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_queue_name() {
        let mut cfg = PipelineConfig::default();
        cfg.queue.name.clear();
        assert!(cfg.validate().is_err());
    }
}
