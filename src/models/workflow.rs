// Workflow definitions - declarative trigger/condition/action documents

//! # Workflow Definitions
//!
//! A `WorkflowDefinition` describes when a workflow runs and what it does:
//! - **Triggers**: which mutations (operation, fields, edges, selector, expression)
//!   start the workflow. Triggers are OR-ed together.
//! - **Conditions**: boolean expressions that must all hold. Conditions are AND-ed.
//! - **Actions**: an ordered, linear pipeline of steps with optional `when` guards.
//!
//! The engine never edits a definition. When an instance starts it copies the
//! definition's [`DefinitionDocument`] into the instance as a snapshot, so later
//! edits never change in-flight instances.
//!
//! ## Denormalized Prefilter
//!
//! `trigger_operations` and `trigger_fields` duplicate information from the
//! triggers so the storage layer can cheaply narrow candidates before any
//! expression is evaluated. [`WorkflowDefinition::derive_trigger_prefilter`]
//! recomputes them.
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates:
//! - `#[serde(default)]` for optional document sections
//! - Builder-style methods that take and return `self`
//! - Iterator chains with `flat_map`, `filter_map` and `collect`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::action::{ActionType, WorkflowAction};
use super::proposal::normalize_fields;

/// When approval gating happens relative to the mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalTiming {
    /// Gated fields are staged in a proposal until approval
    #[default]
    PreCommit,
    /// The mutation applies immediately and approvals become reviews
    PostCommit,
}

/// Whether a staged proposal starts the workflow on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionMode {
    /// The proposal stays a draft until someone submits it
    ManualSubmit,
    #[default]
    AutoSubmit,
}

/// Restricts a trigger to objects with certain tags, groups or types
///
/// Every non-empty category must match; inside a category any entry matching is enough.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSelector {
    pub tag_ids: Vec<String>,
    pub group_ids: Vec<String>,
    pub object_types: Vec<String>,
}

impl TriggerSelector {
    pub fn is_empty(&self) -> bool {
        self.tag_ids.is_empty() && self.group_ids.is_empty() && self.object_types.is_empty()
    }
}

/// One way a mutation can start the workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowTrigger {
    /// Mutation operation, e.g. `UPDATE`
    pub operation: String,
    pub object_type: Option<String>,
    pub fields: Vec<String>,
    pub edges: Vec<String>,
    pub selector: Option<TriggerSelector>,
    pub expression: Option<String>,
    pub description: Option<String>,
}

impl WorkflowTrigger {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_edges(mut self, edges: &[&str]) -> Self {
        self.edges = edges.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_selector(mut self, selector: TriggerSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }
}

/// A boolean expression that must hold for the workflow to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCondition {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WorkflowCondition {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            description: None,
        }
    }
}

/// The document part of a definition, snapshotted into every instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionDocument {
    pub triggers: Vec<WorkflowTrigger>,
    pub conditions: Vec<WorkflowCondition>,
    pub actions: Vec<WorkflowAction>,
    pub approval_timing: ApprovalTiming,
    pub approval_submission_mode: SubmissionMode,
}

impl DefinitionDocument {
    pub fn has_approval_action(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.action_type == ActionType::RequestApproval)
    }

    pub fn uses_post_commit(&self) -> bool {
        self.approval_timing == ApprovalTiming::PostCommit
    }

    /// Normalized field sets gated by approval actions, in action order
    pub fn approval_domains(&self) -> Vec<Vec<String>> {
        self.actions
            .iter()
            .filter(|a| a.action_type == ActionType::RequestApproval)
            .filter_map(|a| a.approval_params())
            .map(|p| normalize_fields(&p.fields))
            .filter(|fields| !fields.is_empty())
            .collect()
    }

    /// Union of every field gated by an approval action
    pub fn approval_fields(&self) -> BTreeSet<String> {
        self.approval_domains().into_iter().flatten().collect()
    }

    /// Index of the action with the given key
    pub fn action_index(&self, key: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.key == key)
    }

    /// Copy used for post-commit instances: approvals become non-blocking reviews
    pub fn with_approvals_as_reviews(&self) -> Self {
        let mut doc = self.clone();
        for action in doc.actions.iter_mut() {
            if action.action_type == ActionType::RequestApproval {
                action.action_type = ActionType::RequestReview;
            }
        }
        doc
    }

    /// The snapshot an instance should carry for this document
    pub fn snapshot(&self) -> Self {
        if self.uses_post_commit() {
            self.with_approvals_as_reviews()
        } else {
            self.clone()
        }
    }
}

/// A versioned workflow definition owned by an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Object type the workflow applies to, e.g. `Policy`
    pub schema_type: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub draft: bool,
    /// Minimum seconds between two instances for the same object
    #[serde(default)]
    pub cooldown_seconds: Option<i64>,
    #[serde(default)]
    pub trigger_operations: Vec<String>,
    #[serde(default)]
    pub trigger_fields: Vec<String>,
    #[serde(default)]
    pub document: DefinitionDocument,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl WorkflowDefinition {
    /// Create an empty, active definition
    pub fn new(org_id: impl Into<String>, name: impl Into<String>, schema_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            name: name.into(),
            description: None,
            schema_type: schema_type.into(),
            active: true,
            draft: false,
            cooldown_seconds: None,
            trigger_operations: Vec::new(),
            trigger_fields: Vec::new(),
            document: DefinitionDocument::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_trigger(mut self, trigger: WorkflowTrigger) -> Self {
        self.document.triggers.push(trigger);
        self.derive_trigger_prefilter();
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.document.conditions.push(WorkflowCondition::new(expression));
        self
    }

    pub fn with_action(mut self, action: WorkflowAction) -> Self {
        self.document.actions.push(action);
        self
    }

    pub fn with_timing(mut self, timing: ApprovalTiming) -> Self {
        self.document.approval_timing = timing;
        self
    }

    pub fn with_submission_mode(mut self, mode: SubmissionMode) -> Self {
        self.document.approval_submission_mode = mode;
        self
    }

    pub fn with_cooldown(mut self, seconds: i64) -> Self {
        self.cooldown_seconds = Some(seconds);
        self
    }

    /// Recompute `trigger_operations` / `trigger_fields` from the triggers
    ///
    /// A trigger without fields or edges matches any change, so a single such
    /// trigger empties `trigger_fields` for the whole definition.
    pub fn derive_trigger_prefilter(&mut self) {
        let operations: BTreeSet<String> = self
            .document
            .triggers
            .iter()
            .map(|t| t.operation.trim().to_uppercase())
            .filter(|op| !op.is_empty())
            .collect();

        let matches_anything = self
            .document
            .triggers
            .iter()
            .any(|t| t.fields.is_empty() && t.edges.is_empty());

        let fields: BTreeSet<String> = if matches_anything {
            BTreeSet::new()
        } else {
            self.document
                .triggers
                .iter()
                .flat_map(|t| t.fields.iter().chain(t.edges.iter()))
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect()
        };

        self.trigger_operations = operations.into_iter().collect();
        self.trigger_fields = fields.into_iter().collect();
        self.updated_at = Utc::now();
    }

    /// Cheap check mirroring the storage prefilter
    pub fn prefilter_matches(&self, operation: &str, changed: &[String]) -> bool {
        if !self.active || self.draft {
            return false;
        }
        let operation = operation.trim().to_uppercase();
        if !self.trigger_operations.iter().any(|op| *op == operation) {
            return false;
        }
        self.trigger_fields.is_empty() || changed.iter().any(|c| self.trigger_fields.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("org-1", "Policy approval", "Policy")
            .with_trigger(WorkflowTrigger::new("update").with_fields(&["status", "title"]))
            .with_action(WorkflowAction::new(
                "approve_status",
                ActionType::RequestApproval,
                json!({ "targets": [{ "type": "USER", "id": "alice" }], "fields": ["status", " title", "status"] }),
            ))
            .with_action(WorkflowAction::new("notify", ActionType::Notify, json!({})))
    }

    #[test]
    fn test_prefilter_derivation() {
        let def = create_test_definition();
        assert_eq!(def.trigger_operations, vec!["UPDATE".to_string()]);
        assert_eq!(def.trigger_fields, vec!["status".to_string(), "title".to_string()]);

        assert!(def.prefilter_matches("UPDATE", &["status".to_string()]));
        assert!(!def.prefilter_matches("UPDATE", &["owner".to_string()]));
        assert!(!def.prefilter_matches("DELETE", &["status".to_string()]));
    }

    #[test]
    fn test_trigger_without_fields_matches_anything() {
        let def = create_test_definition().with_trigger(WorkflowTrigger::new("UPDATE"));
        assert!(def.trigger_fields.is_empty());
        assert!(def.prefilter_matches("UPDATE", &["anything".to_string()]));
    }

    #[test]
    fn test_inactive_or_draft_never_match() {
        let mut def = create_test_definition();
        def.draft = true;
        assert!(!def.prefilter_matches("UPDATE", &["status".to_string()]));
        def.draft = false;
        def.active = false;
        assert!(!def.prefilter_matches("UPDATE", &["status".to_string()]));
    }

    #[test]
    fn test_approval_domains_are_normalized() {
        let def = create_test_definition();
        assert!(def.document.has_approval_action());
        assert_eq!(
            def.document.approval_domains(),
            vec![vec!["status".to_string(), "title".to_string()]]
        );
    }

    #[test]
    fn test_post_commit_snapshot_converts_approvals() {
        let def = create_test_definition().with_timing(ApprovalTiming::PostCommit);
        let snapshot = def.document.snapshot();
        assert_eq!(snapshot.actions[0].action_type, ActionType::RequestReview);
        assert_eq!(snapshot.actions[1].action_type, ActionType::Notify);
        assert_eq!(def.document.actions[0].action_type, ActionType::RequestApproval);
    }

    #[test]
    fn test_document_defaults() {
        let doc: DefinitionDocument = serde_json::from_value(json!({ "actions": [] })).unwrap();
        assert_eq!(doc.approval_timing, ApprovalTiming::PreCommit);
        assert_eq!(doc.approval_submission_mode, SubmissionMode::AutoSubmit);
    }
}
