// Integration runs
// Queued asynchronous operations against external providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl IntegrationRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntegrationRunStatus::Succeeded | IntegrationRunStatus::Failed)
    }
}

/// One queued integration operation for a workflow action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationRun {
    pub id: String,
    pub org_id: String,
    pub instance_id: String,
    pub action_key: String,
    pub action_index: usize,
    pub provider: String,
    pub operation: String,
    pub config: Map<String, Value>,
    pub status: IntegrationRunStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRun {
    pub fn new(
        org_id: &str,
        instance_id: &str,
        action_key: &str,
        action_index: usize,
        provider: &str,
        operation: &str,
        config: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            instance_id: instance_id.to_string(),
            action_key: action_key.to_string(),
            action_index,
            provider: provider.to_string(),
            operation: operation.to_string(),
            config,
            status: IntegrationRunStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark(&mut self, status: IntegrationRunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
