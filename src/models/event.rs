// Workflow audit events
// Append-only records of every lifecycle transition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kinds of audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEventType {
    WorkflowTriggered,
    ActionStarted,
    ActionCompleted,
    ActionSkipped,
    AssignmentCreated,
    AssignmentCompleted,
    AssignmentInvalidated,
    InstancePaused,
    InstanceResumed,
    WorkflowCompleted,
    EmitFailed,
    EmitRecovered,
    EmitFailedTerminal,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventType::WorkflowTriggered => "WORKFLOW_TRIGGERED",
            WorkflowEventType::ActionStarted => "ACTION_STARTED",
            WorkflowEventType::ActionCompleted => "ACTION_COMPLETED",
            WorkflowEventType::ActionSkipped => "ACTION_SKIPPED",
            WorkflowEventType::AssignmentCreated => "ASSIGNMENT_CREATED",
            WorkflowEventType::AssignmentCompleted => "ASSIGNMENT_COMPLETED",
            WorkflowEventType::AssignmentInvalidated => "ASSIGNMENT_INVALIDATED",
            WorkflowEventType::InstancePaused => "INSTANCE_PAUSED",
            WorkflowEventType::InstanceResumed => "INSTANCE_RESUMED",
            WorkflowEventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
            WorkflowEventType::EmitFailed => "EMIT_FAILED",
            WorkflowEventType::EmitRecovered => "EMIT_RECOVERED",
            WorkflowEventType::EmitFailedTerminal => "EMIT_FAILED_TERMINAL",
        }
    }

    /// Event types that make up the emit delivery history of an instance
    pub fn emit_lifecycle() -> [WorkflowEventType; 3] {
        [
            WorkflowEventType::EmitFailed,
            WorkflowEventType::EmitRecovered,
            WorkflowEventType::EmitFailedTerminal,
        ]
    }
}

impl fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the audit log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEventRecord {
    pub id: String,
    pub org_id: String,
    pub instance_id: String,
    pub event_type: WorkflowEventType,
    #[serde(default)]
    pub action_key: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowEventRecord {
    pub fn new(
        org_id: &str,
        instance_id: &str,
        event_type: WorkflowEventType,
        action_key: Option<&str>,
        details: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            instance_id: instance_id.to_string(),
            event_type,
            action_key: action_key.map(str::to_string),
            details,
            created_at: Utc::now(),
        }
    }
}
