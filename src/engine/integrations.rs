// Integration operators
// Asynchronous provider calls tracked as integration runs

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::storage::WorkflowStorage;
use crate::context::CallerContext;
use crate::models::{IntegrationRun, IntegrationRunStatus};
use crate::{Result, WorkflowError};

/// What an operator receives
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationCall {
    pub org_id: String,
    pub run_id: String,
    pub instance_id: String,
    pub action_key: String,
    pub provider: String,
    pub operation: String,
    pub config: Map<String, Value>,
}

/// One provider operation, such as creating a ticket
#[async_trait::async_trait]
pub trait IntegrationOperator: Send + Sync {
    async fn execute(&self, call: &IntegrationCall) -> Result<Value>;
}

/// Operators keyed by (provider, operation)
#[derive(Default, Clone)]
pub struct IntegrationRegistry {
    operators: HashMap<(String, String), Arc<dyn IntegrationOperator>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        provider: impl Into<String>,
        operation: impl Into<String>,
        operator: Arc<dyn IntegrationOperator>,
    ) {
        self.operators.insert((provider.into(), operation.into()), operator);
    }

    pub fn get(&self, provider: &str, operation: &str) -> Option<Arc<dyn IntegrationOperator>> {
        self.operators
            .get(&(provider.to_string(), operation.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Executes queued integration runs
pub struct IntegrationRunner {
    storage: Arc<dyn WorkflowStorage>,
    registry: IntegrationRegistry,
    default_timeout: Duration,
}

impl IntegrationRunner {
    pub fn new(storage: Arc<dyn WorkflowStorage>, registry: IntegrationRegistry, default_timeout: Duration) -> Self {
        Self {
            storage,
            registry,
            default_timeout,
        }
    }

    /// Run a queued integration to completion
    ///
    /// The run moves to Running, then to Succeeded or Failed. A run that is
    /// already terminal is returned unchanged so redelivered requests do not
    /// execute twice.
    pub async fn run(&self, caller: &CallerContext, run_id: &str, timeout: Option<Duration>) -> Result<IntegrationRun> {
        let org_id = caller.org_id()?;
        let mut run = self
            .storage
            .get_integration_run(org_id, run_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("integration run {}", run_id)))?;

        if run.status.is_terminal() {
            return Ok(run);
        }

        run.mark(IntegrationRunStatus::Running);
        self.storage.update_integration_run(&run).await?;

        let outcome = match self.registry.get(&run.provider, &run.operation) {
            Some(operator) => {
                let call = IntegrationCall {
                    org_id: run.org_id.clone(),
                    run_id: run.id.clone(),
                    instance_id: run.instance_id.clone(),
                    action_key: run.action_key.clone(),
                    provider: run.provider.clone(),
                    operation: run.operation.clone(),
                    config: run.config.clone(),
                };
                let limit = timeout.unwrap_or(self.default_timeout);
                match tokio::time::timeout(limit, operator.execute(&call)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkflowError::IntegrationFailed(format!(
                        "{}.{} timed out after {}s",
                        run.provider,
                        run.operation,
                        limit.as_secs()
                    ))),
                }
            }
            None => Err(WorkflowError::IntegrationFailed(format!(
                "no operator registered for {}.{}",
                run.provider, run.operation
            ))),
        };

        match outcome {
            Ok(result) => {
                run.result = Some(result);
                run.error = None;
                run.mark(IntegrationRunStatus::Succeeded);
                info!(run_id = %run.id, provider = %run.provider, operation = %run.operation, "integration succeeded");
            }
            Err(err) => {
                run.error = Some(err.to_string());
                run.mark(IntegrationRunStatus::Failed);
                warn!(run_id = %run.id, error = %err, "integration failed");
            }
        }
        self.storage.update_integration_run(&run).await?;
        Ok(run)
    }
}
