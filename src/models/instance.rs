// Workflow instances
// One execution of a definition against one object

//! # Workflow Instances
//!
//! An instance is created by the instance builder and then only moved forward by
//! the orchestrator. Its state machine is:
//!
//! ```text
//! Running ──(approval/review)──► Paused ──(quorum)──► Running
//!    │                              │
//!    └──────────► Completed | Failed ◄┘
//! ```
//!
//! Terminal states are sticky: every transition into them is a conditional update
//! that only succeeds when the instance is not already terminal.
//!
//! ## Execution State
//!
//! [`InstanceContext`] holds the triggering mutation and the small amount of
//! execution state the orchestrator needs between events. It is a typed record,
//! not a free-form map: parallel approval keys and fired notification keys are
//! explicit fields, stored inside the instance so they change atomically with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use super::workflow::DefinitionDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Paused,
    Completed,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Failed)
    }

    pub fn terminal() -> [InstanceState; 2] {
        [InstanceState::Completed, InstanceState::Failed]
    }

    pub fn active() -> [InstanceState; 2] {
        [InstanceState::Running, InstanceState::Paused]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "RUNNING",
            InstanceState::Paused => "PAUSED",
            InstanceState::Completed => "COMPLETED",
            InstanceState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triggering mutation plus orchestrator execution state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceContext {
    /// Incremented every time the instance is (re)triggered
    pub version: i64,
    pub event_type: String,
    pub changed_fields: Vec<String>,
    pub changed_edges: Vec<String>,
    pub added_ids: BTreeMap<String, Vec<String>>,
    pub removed_ids: BTreeMap<String, Vec<String>>,
    pub proposed_changes: Map<String, Value>,
    pub trigger_user_id: Option<String>,
    /// Approval/review actions started together at trigger time
    pub parallel_approval_keys: Vec<String>,
    /// Idempotency keys of notifications re-fired on assignment changes
    pub fired_notifications: BTreeSet<String>,
    /// Free-form data supplied by the caller
    pub data: Map<String, Value>,
}

/// One execution of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub org_id: String,
    pub definition_id: String,
    pub state: InstanceState,
    pub current_action_index: usize,
    pub definition_snapshot: DefinitionDocument,
    pub context: InstanceContext,
    #[serde(default)]
    pub proposal_id: Option<String>,
    pub object_id: String,
    pub object_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        org_id: &str,
        definition_id: &str,
        object_id: &str,
        object_type: &str,
        snapshot: DefinitionDocument,
        context: InstanceContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            definition_id: definition_id.to_string(),
            state: InstanceState::Running,
            current_action_index: 0,
            definition_snapshot: snapshot,
            context,
            proposal_id: None,
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Variables exposed to action-context expressions as `instance`
    pub fn to_expression_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "definition_id": self.definition_id,
            "state": self.state.as_str(),
            "current_action_index": self.current_action_index,
            "proposal_id": self.proposal_id,
            "object_id": self.object_id,
            "object_type": self.object_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(InstanceState::Completed.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Paused.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
    }

    #[test]
    fn test_context_roundtrips_fired_notifications() {
        let mut context = InstanceContext::default();
        context.fired_notifications.insert("notify_ping_2".into());
        let value = serde_json::to_value(&context).unwrap();
        assert_eq!(value["fired_notifications"], serde_json::json!(["notify_ping_2"]));

        let back: InstanceContext = serde_json::from_value(value).unwrap();
        assert!(back.fired_notifications.contains("notify_ping_2"));
    }

    #[test]
    fn test_new_instance_starts_running() {
        let instance = WorkflowInstance::new(
            "org",
            "def",
            "obj",
            "Policy",
            DefinitionDocument::default(),
            InstanceContext::default(),
        );
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.current_action_index, 0);
        assert_eq!(instance.to_expression_value()["state"], "RUNNING");
    }
}
