// Workflow assignments
// One approval or review task per resolved user

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::action::TargetType;

/// Assignment key prefix for the requester leg of a change request
pub const CHANGE_REQUEST_PREFIX: &str = "change_request_";

/// Role stored on assignments created for the requester of a change request
pub const REQUESTER_ROLE: &str = "REQUESTER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Pending,
    Approved,
    Rejected,
    ChangesRequested,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "PENDING",
            AssignmentStatus::Approved => "APPROVED",
            AssignmentStatus::Rejected => "REJECTED",
            AssignmentStatus::ChangesRequested => "CHANGES_REQUESTED",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quorum configuration and approval stamp carried by each assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalMetadata {
    pub action_key: String,
    pub required: bool,
    pub required_count: usize,
    pub label: Option<String>,
    /// Proposal hash at the time of approval
    pub proposed_hash: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
}

/// Why an approval was reset to pending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMetadata {
    pub reason: String,
    pub previous_status: AssignmentStatus,
    pub invalidated_at: DateTime<Utc>,
    #[serde(default)]
    pub invalidated_by: Option<String>,
    #[serde(default)]
    pub approved_hash: Option<String>,
    pub new_proposed_hash: String,
}

/// Decision details for rejections and change requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionMetadata {
    pub action_key: String,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
    #[serde(default)]
    pub rejected_by: Option<String>,
}

/// One approval or review unit, unique per (instance, assignment_key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAssignment {
    pub id: String,
    pub org_id: String,
    pub instance_id: String,
    pub assignment_key: String,
    pub role: String,
    #[serde(default)]
    pub label: Option<String>,
    pub required: bool,
    pub status: AssignmentStatus,
    pub approval: ApprovalMetadata,
    #[serde(default)]
    pub invalidation: Option<InvalidationMetadata>,
    #[serde(default)]
    pub rejection: Option<RejectionMetadata>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub actor_user_id: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowAssignment {
    pub fn new(org_id: &str, instance_id: &str, assignment_key: String, role: &str, approval: ApprovalMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            instance_id: instance_id.to_string(),
            assignment_key,
            role: role.to_string(),
            label: approval.label.clone(),
            required: approval.required,
            status: AssignmentStatus::Pending,
            approval,
            invalidation: None,
            rejection: None,
            metadata: Value::Null,
            actor_user_id: None,
            decided_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The requester leg of a change request never counts towards quorum
    pub fn is_change_request(&self) -> bool {
        self.assignment_key.starts_with(CHANGE_REQUEST_PREFIX) || self.role == REQUESTER_ROLE
    }
}

/// Build `{prefix}_{action_key}_{user_id}`
pub fn assignment_key(prefix: &str, action_key: &str, user_id: &str) -> String {
    format!("{}_{}_{}", prefix, action_key, user_id)
}

/// Which resolver output produced an assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentTarget {
    pub id: String,
    pub org_id: String,
    pub assignment_id: String,
    pub target_type: TargetType,
    pub target_user_id: String,
    #[serde(default)]
    pub target_group_id: Option<String>,
    #[serde(default)]
    pub resolver_key: Option<String>,
}

impl AssignmentTarget {
    pub fn new(org_id: &str, assignment_id: &str, target_type: TargetType, user_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            assignment_id: assignment_id.to_string(),
            target_type,
            target_user_id: user_id.to_string(),
            target_group_id: None,
            resolver_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_key_format() {
        assert_eq!(assignment_key("approval", "approve_status", "alice"), "approval_approve_status_alice");
    }

    #[test]
    fn test_change_request_detection() {
        let meta = ApprovalMetadata { action_key: "a".into(), required: true, ..Default::default() };
        let approval = WorkflowAssignment::new("org", "inst", assignment_key("approval", "a", "u"), "APPROVER", meta.clone());
        assert!(!approval.is_change_request());

        let by_key = WorkflowAssignment::new("org", "inst", "change_request_a_u".into(), "APPROVER", meta.clone());
        assert!(by_key.is_change_request());

        let by_role = WorkflowAssignment::new("org", "inst", "other".into(), REQUESTER_ROLE, meta);
        assert!(by_role.is_change_request());
    }

    #[test]
    fn test_new_assignment_copies_quorum_settings() {
        let meta = ApprovalMetadata {
            action_key: "a".into(),
            required: false,
            required_count: 1,
            label: Some("Legal".into()),
            ..Default::default()
        };
        let assignment = WorkflowAssignment::new("org", "inst", "approval_a_u".into(), "APPROVER", meta);
        assert_eq!(assignment.status, AssignmentStatus::Pending);
        assert!(!assignment.required);
        assert_eq!(assignment.label.as_deref(), Some("Legal"));
    }
}
