//! Application settings loaded from config.toml
//!
//! Every field has a default so an empty or partial file is valid. Intervals,
//! concurrency limits and circuit-breaker thresholds live here rather than in
//! code so operators can tune them per deployment.

use crate::core::failure::ErrorType;
use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Polling schedulers
    pub scheduler: SchedulerSettings,
    /// Reconciliation batching
    pub reconcile: ReconcileSettings,
    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerSettings,
    /// Streaming import
    pub import: ImportSettings,
    /// Memory backpressure
    pub memory: MemorySettings,
    /// Chart-of-accounts codes used by the ledger poster
    pub accounts: AccountMap,
}

/// Scheduler intervals and worker limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Poll interval for reconcile batches
    pub reconcile_interval_secs: u64,
    /// Poll interval for import batches (externally rate-limited work)
    pub import_interval_secs: u64,
    /// Maximum batches processed concurrently per scheduler
    pub max_concurrent_batches: usize,
    /// Per-batch deadline, `0` disables it
    pub batch_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            import_interval_secs: 120,
            max_concurrent_batches: 5,
            batch_timeout_secs: 0,
        }
    }
}

impl SchedulerSettings {
    /// Deadline applied to a single batch, if any.
    #[must_use]
    pub const fn batch_timeout(&self) -> Option<Duration> {
        if self.batch_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.batch_timeout_secs))
        }
    }
}

/// Reconciliation batching
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Items per sub-batch after grouping by store
    pub sub_batch_size: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self { sub_batch_size: 50 }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Halt once more than this many items failed
    pub max_allowed_failures: u64,
    /// Halt once `failed / (failed + successful)` exceeds this percentage
    pub failure_threshold_percent: f64,
    /// Attempts required before the percentage rule applies
    pub min_attempts_for_rate: u64,
    /// Error types that halt immediately
    pub critical_error_types: Vec<ErrorType>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_allowed_failures: 25,
            failure_threshold_percent: 50.0,
            min_attempts_for_rate: 10,
            critical_error_types: vec![ErrorType::DatabaseError],
        }
    }
}

/// Streaming import settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    /// Rows per committed chunk before memory scaling
    pub chunk_size: usize,
    /// Files imported concurrently
    pub max_concurrent_files: usize,
    /// Files larger than this are rejected before processing
    pub max_file_size_bytes: u64,
    /// Capacity of the priority scheduler's job queue
    pub queue_capacity: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_concurrent_files: 5,
            max_file_size_bytes: 100 * 1024 * 1024,
            queue_capacity: 100,
        }
    }
}

/// Memory backpressure settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Usage considered 100% pressure
    pub ceiling_bytes: u64,
    /// Background sampling interval
    pub sample_interval_ms: u64,
    /// Pressure at which imports pause
    pub high_pressure: f64,
    /// Longest pause before failing the chunk
    pub max_wait_secs: u64,
    /// Re-sample interval while paused
    pub pause_poll_ms: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            ceiling_bytes: 1024 * 1024 * 1024,
            sample_interval_ms: 1000,
            high_pressure: 0.9,
            max_wait_secs: 60,
            pause_poll_ms: 500,
        }
    }
}

/// Account codes the ledger poster writes to
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountMap {
    /// Bank account receiving withdrawals
    pub bank: String,
    /// Marketplace cash / clearing balance
    pub clearing: String,
    /// Ads wallet funded by top-ups
    pub wallet: String,
    /// Purchases paid to suppliers but not yet expensed
    pub pending_purchases: String,
    /// Refunds owed by suppliers
    pub supplier_refund_receivable: String,
    /// Sales revenue
    pub sales_revenue: String,
    /// Sales returns (contra revenue)
    pub sales_returns: String,
    /// Cost of goods sold
    pub cost_of_goods: String,
    /// Marketplace fees and charges
    pub marketplace_fees: String,
    /// Advertising expense
    pub advertising: String,
    /// Manual adjustments
    pub adjustment: String,
}

impl Default for AccountMap {
    fn default() -> Self {
        Self {
            bank: "1-1000".to_string(),
            clearing: "1-1100".to_string(),
            wallet: "1-1200".to_string(),
            pending_purchases: "1-1300".to_string(),
            supplier_refund_receivable: "1-1400".to_string(),
            sales_revenue: "4-1000".to_string(),
            sales_returns: "4-1100".to_string(),
            cost_of_goods: "5-1000".to_string(),
            marketplace_fees: "6-1000".to_string(),
            advertising: "6-2000".to_string(),
            adjustment: "6-9000".to_string(),
        }
    }
}

/// Loads settings from a TOML file
///
/// # Errors
/// Returns an error if the file cannot be read or the TOML is invalid
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path_ref = path.as_ref();
    tracing::debug!("Attempting to load configuration from: {:?}", path_ref);
    let contents = std::fs::read_to_string(path_ref).map_err(|e| Error::Config {
        message: format!("Failed to read config file {}: {e}", path_ref.display()),
    })?;

    parse_config(&contents)
}

/// Parses settings from TOML text
pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })?;
    config.validate()?;
    Ok(config)
}

/// Loads settings from `CONFIG_PATH` (default `./config.toml`), falling back to
/// defaults when the file does not exist.
pub fn load_default_config() -> Result<AppConfig> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    if Path::new(&path).exists() {
        load_config(&path)
    } else {
        tracing::warn!(path = %path, "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

impl AppConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::Config {
                message: message.to_string(),
            })
        };
        if self.reconcile.sub_batch_size == 0 {
            return invalid("reconcile.sub_batch_size must be positive");
        }
        if self.import.chunk_size == 0 {
            return invalid("import.chunk_size must be positive");
        }
        if self.scheduler.max_concurrent_batches == 0 || self.import.max_concurrent_files == 0 {
            return invalid("concurrency limits must be positive");
        }
        if self.import.queue_capacity == 0 {
            return invalid("import.queue_capacity must be positive");
        }
        if !(0.0..=1.0).contains(&self.memory.high_pressure) {
            return invalid("memory.high_pressure must be between 0 and 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.scheduler.reconcile_interval_secs, 60);
        assert_eq!(config.scheduler.import_interval_secs, 120);
        assert_eq!(config.scheduler.max_concurrent_batches, 5);
        assert_eq!(config.reconcile.sub_batch_size, 50);
        assert_eq!(config.import.chunk_size, 1000);
        assert_eq!(config.import.max_concurrent_files, 5);
        assert_eq!(config.memory.high_pressure, 0.9);
        assert_eq!(
            config.circuit_breaker.critical_error_types,
            vec![ErrorType::DatabaseError]
        );
        assert!(config.scheduler.batch_timeout().is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
            [scheduler]
            reconcile_interval_secs = 30
            batch_timeout_secs = 600

            [circuit_breaker]
            max_allowed_failures = 5
            failure_threshold_percent = 10.0
            critical_error_types = ["database_error", "authentication_error"]

            [accounts]
            clearing = "1-1150"
        "#;

        let config = parse_config(toml_str).unwrap();
        assert_eq!(config.scheduler.reconcile_interval_secs, 30);
        assert_eq!(config.scheduler.import_interval_secs, 120);
        assert_eq!(
            config.scheduler.batch_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.circuit_breaker.max_allowed_failures, 5);
        assert_eq!(config.circuit_breaker.failure_threshold_percent, 10.0);
        assert_eq!(config.circuit_breaker.critical_error_types.len(), 2);
        assert_eq!(config.accounts.clearing, "1-1150");
        assert_eq!(config.accounts.cost_of_goods, "5-1000");
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = parse_config("[import]\nchunk_size = 0\n");
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_unknown_error_type_rejected() {
        let result = parse_config("[circuit_breaker]\ncritical_error_types = [\"oops\"]\n");
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
