//! zoekt.toml configuration parser.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a parsed configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("watermark thresholds must satisfy 0 < overprovisioned <= ideal < low < high < critical <= 1 and a non-negative floor (got {0:?})")]
    Thresholds(WatermarkThresholds),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ZoektConfig {
    #[serde(default)]
    pub watermarks: WatermarkThresholds,
    #[serde(default)]
    pub batching: BatchLimits,
    #[serde(default)]
    pub replicas: ReplicaPolicy,
    #[serde(default)]
    pub rescheduling: ReschedulePolicy,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub tasks: TaskPolicy,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Storage-pressure fractions of `used / reserved`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatermarkThresholds {
    /// Below this ratio an index reserves far more than it needs.
    pub overprovisioned: f64,
    /// Target ratio used when recomputing reservations.
    pub ideal: f64,
    pub low: f64,
    pub high: f64,
    pub critical: f64,
    /// Reservation floor. Indices at or below it are never overprovisioned.
    pub min_reserved_bytes: i64,
}

impl Default for WatermarkThresholds {
    fn default() -> Self {
        Self {
            overprovisioned: 0.30,
            ideal: 0.40,
            low: 0.70,
            high: 0.85,
            critical: 0.95,
            min_reserved_bytes: 10 * 1024 * 1024,
        }
    }
}

impl WatermarkThresholds {
    pub fn is_ordered(&self) -> bool {
        self.overprovisioned > 0.0
            && self.overprovisioned <= self.ideal
            && self.ideal < self.low
            && self.low < self.high
            && self.high < self.critical
            && self.critical <= 1.0
            && self.min_reserved_bytes >= 0
    }
}

/// Page sizes that bound the work done by a single handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchLimits {
    pub batch_size: usize,
    /// Ceiling on concurrently in-flight reindex tasks.
    pub reindex_limit: usize,
    /// Namespaces onboarded per rollout invocation.
    pub rollout_buffer_size: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            batch_size: 500,
            reindex_limit: 1000,
            rollout_buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicaPolicy {
    /// Replica count for namespaces without an override.
    pub default_count: u32,
    /// Reservation given to a freshly placed index.
    pub initial_reserved_bytes: i64,
}

impl Default for ReplicaPolicy {
    fn default() -> Self {
        Self {
            default_count: 1,
            initial_reserved_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Which paging handlers re-publish themselves while work remains.
///
/// Handlers with the switch off drain one page and rely on the periodic
/// scheduler to trigger them again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReschedulePolicy {
    pub too_many_replicas: bool,
    pub saas_rollout: bool,
    pub repo_to_index: bool,
    pub repo_to_reindex: bool,
    pub missing_replicas: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            too_many_replicas: true,
            saas_rollout: true,
            repo_to_index: false,
            repo_to_reindex: false,
            missing_replicas: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Hosted offering. Subscription-driven rollout only runs when set.
    pub saas: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskPolicy {
    /// Attempts a task gets before it is marked failed.
    pub retries: u32,
    /// Tasks handed to a node per dispatch round.
    pub claim_limit: usize,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            claim_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub schedule_interval_secs: u64,
    /// Events processed per worker tick.
    pub drain_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            schedule_interval_secs: 60,
            drain_limit: 1000,
        }
    }
}

impl ZoektConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ZoektConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.watermarks.is_ordered() {
            return Err(ConfigError::Thresholds(self.watermarks));
        }
        let nonzero = [
            ("batching.batch_size", self.batching.batch_size),
            ("batching.rollout_buffer_size", self.batching.rollout_buffer_size),
            ("tasks.claim_limit", self.tasks.claim_limit),
            ("worker.drain_limit", self.worker.drain_limit),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.replicas.default_count == 0 {
            return Err(ConfigError::Zero {
                field: "replicas.default_count",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ZoektConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert!(config.rescheduling.too_many_replicas);
        assert!(!config.rescheduling.repo_to_reindex);
    }

    #[test]
    fn test_parse_minimal() {
        let config: ZoektConfig = toml::from_str("").unwrap();
        assert_eq!(config, ZoektConfig::default());
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml_str = r#"
[watermarks]
low = 0.8
high = 0.9

[deployment]
saas = true

[rescheduling]
repo_to_index = true
"#;
        let config: ZoektConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.watermarks.low, 0.8);
        assert_eq!(config.watermarks.critical, 0.95);
        assert!(config.deployment.saas);
        assert!(config.rescheduling.repo_to_index);
        // Untouched switches keep their defaults.
        assert!(config.rescheduling.saas_rollout);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut config = ZoektConfig::default();
        config.watermarks.high = 0.6;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Thresholds(_))
        ));
    }

    #[test]
    fn test_rejects_zero_batch() {
        let mut config = ZoektConfig::default();
        config.batching.batch_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "batching.batch_size"
            })
        );
    }

    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zoekt.toml");
        let mut config = ZoektConfig::default();
        config.batching.reindex_limit = 42;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = ZoektConfig::from_file(&path).unwrap();
        assert_eq!(loaded.batching.reindex_limit, 42);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zoekt.toml");
        std::fs::write(&path, "[watermarks]\ncritical = 1.5\n").unwrap();
        assert!(ZoektConfig::from_file(&path).is_err());
    }
}
