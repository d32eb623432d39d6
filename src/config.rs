// Engine configuration
// Layered defaults, optional TOML file and WORKFLOW__* environment overrides

//! # Configuration
//!
//! [`EngineConfig`] collects every tunable the engine reads at runtime. Values are
//! layered in this order, later sources winning:
//!
//! 1. Compiled-in defaults ([`EngineConfig::default`])
//! 2. An optional file (`workflow-engine.toml` unless another path is given)
//! 3. Environment variables prefixed with `WORKFLOW`, nested with `__`,
//!    e.g. `WORKFLOW__WEBHOOK__MAX_RETRIES=4`

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, WorkflowError};

/// Default configuration file name looked up when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "workflow-engine.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub expression: ExpressionConfig,
    pub webhook: WebhookConfig,
    pub reconcile: ReconcileConfig,
    pub integration: IntegrationConfig,
    pub event_bus: EventBusConfig,
}

/// Limits applied to every expression evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExpressionConfig {
    /// Wall-clock budget per evaluation
    pub timeout_ms: u64,
    /// Maximum operations per evaluation, 0 disables the limit
    pub cost_limit: u64,
    /// How many operations run between deadline checks
    pub interrupt_check_frequency: u64,
    /// Maximum nesting depth of expressions and calls
    pub recursion_limit: usize,
    /// Maximum expression source length in bytes
    pub size_limit: usize,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            cost_limit: 0,
            interrupt_check_frequency: 100,
            recursion_limit: 250,
            size_limit: 100_000,
        }
    }
}

/// Webhook delivery defaults, overridable per action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 2,
            base_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

/// Emit failure reconciliation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrationConfig {
    pub timeout_secs: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventBusConfig {
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = path.unwrap_or(DEFAULT_CONFIG_FILE);

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("WORKFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.expression.timeout_ms == 0 {
            return Err(WorkflowError::Internal(
                "expression.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.webhook.timeout_ms == 0 {
            return Err(WorkflowError::Internal(
                "webhook.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_bus.capacity == 0 {
            return Err(WorkflowError::Internal(
                "event_bus.capacity must be greater than zero".to_string(),
            ));
        }
        if self.reconcile.max_attempts == 0 {
            return Err(WorkflowError::Internal(
                "reconcile.max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression.timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    pub fn integration_timeout(&self) -> Duration {
        Duration::from_secs(self.integration.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.expression.timeout_ms, 100);
        assert_eq!(config.expression.cost_limit, 0);
        assert_eq!(config.expression.recursion_limit, 250);
        assert_eq!(config.webhook.max_retries, 2);
        assert_eq!(config.reconcile.max_attempts, 5);
        assert_eq!(config.event_bus.capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = EngineConfig::default();
        config.reconcile.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.event_bus.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.webhook.timeout_ms, 10_000);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(EngineConfig::load(Some("/nonexistent/workflow-engine")).is_err());
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({ "webhook": { "max_retries": 4 } })).unwrap();
        assert_eq!(config.webhook.max_retries, 4);
        assert_eq!(config.webhook.base_backoff_ms, 200);
        assert_eq!(config.expression.size_limit, 100_000);
    }
}
