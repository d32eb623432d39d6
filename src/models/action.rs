// Workflow actions
// A closed set of action kinds, each owning its parameter schema

//! # Workflow Actions
//!
//! An action is one step in a definition's linear pipeline. The raw JSON `params`
//! document is kept on the action so definitions round-trip unchanged, and
//! [`WorkflowAction::params`] parses it into the typed [`ActionParams`] variant that
//! matches the action's [`ActionType`].
//!
//! ## Rust Learning Notes:
//!
//! ### Closed Enums Instead of String Switches
//! Dispatching on `ActionParams` with `match` gives compile-time exhaustiveness:
//! adding a new action kind forces every dispatch site to handle it.
//!
//! ### `FromStr`
//! Implementing `FromStr` lets callers write `"WEBHOOK".parse::<ActionType>()`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::notification::Channel;
use crate::{Result, WorkflowError};

/// Kinds of action a workflow can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    RequestApproval,
    RequestReview,
    Notify,
    Webhook,
    UpdateField,
    Integration,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::RequestApproval => "REQUEST_APPROVAL",
            ActionType::RequestReview => "REQUEST_REVIEW",
            ActionType::Notify => "NOTIFY",
            ActionType::Webhook => "WEBHOOK",
            ActionType::UpdateField => "UPDATE_FIELD",
            ActionType::Integration => "INTEGRATION",
        }
    }

    /// Approval and review actions pause the instance until quorum resolves
    pub fn is_gated(&self) -> bool {
        matches!(self, ActionType::RequestApproval | ActionType::RequestReview)
    }

    /// Prefix used when building assignment keys
    pub fn assignment_prefix(&self) -> Option<&'static str> {
        match self {
            ActionType::RequestApproval => Some("approval"),
            ActionType::RequestReview => Some("review"),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REQUEST_APPROVAL" | "APPROVAL" => Ok(ActionType::RequestApproval),
            "REQUEST_REVIEW" | "REVIEW" => Ok(ActionType::RequestReview),
            "NOTIFY" | "NOTIFICATION" => Ok(ActionType::Notify),
            "WEBHOOK" => Ok(ActionType::Webhook),
            "UPDATE_FIELD" | "FIELD_UPDATE" => Ok(ActionType::UpdateField),
            "INTEGRATION" => Ok(ActionType::Integration),
            other => Err(WorkflowError::InvalidActionType(other.to_string())),
        }
    }
}

/// How a target descriptor is resolved to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    User,
    Group,
    Role,
    Resolver,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::User => "USER",
            TargetType::Group => "GROUP",
            TargetType::Role => "ROLE",
            TargetType::Resolver => "RESOLVER",
        }
    }
}

impl FromStr for TargetType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(TargetType::User),
            "GROUP" => Ok(TargetType::Group),
            "ROLE" => Ok(TargetType::Role),
            "RESOLVER" => Ok(TargetType::Resolver),
            other => Err(WorkflowError::InvalidTargetType(other.to_string())),
        }
    }
}

/// Abstract description of who should act
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// User id, group id or role name depending on `target_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_key: Option<String>,
}

impl TargetConfig {
    pub fn user(id: impl Into<String>) -> Self {
        Self { target_type: TargetType::User, id: Some(id.into()), resolver_key: None }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self { target_type: TargetType::Group, id: Some(id.into()), resolver_key: None }
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self { target_type: TargetType::Role, id: Some(role.into()), resolver_key: None }
    }

    pub fn resolver(key: impl Into<String>) -> Self {
        Self { target_type: TargetType::Resolver, id: None, resolver_key: Some(key.into()) }
    }

    /// Check that the descriptor carries what its type needs
    pub fn validate(&self) -> Result<()> {
        match self.target_type {
            TargetType::Resolver => {
                if self.resolver_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(WorkflowError::MissingRequiredField("resolver_key".to_string()));
                }
            }
            _ => {
                if self.id.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(WorkflowError::MissingRequiredField(format!(
                        "{} target id",
                        self.target_type.as_str().to_lowercase()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parameters of approval and review actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalParams {
    pub targets: Vec<TargetConfig>,
    pub required: Option<bool>,
    pub required_count: Option<i64>,
    pub label: Option<String>,
    /// Fields whose changes this approval gates
    pub fields: Vec<String>,
    pub edges: Vec<String>,
}

impl ApprovalParams {
    /// Blocking unless explicitly marked optional
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }

    /// Quorum size: an optional approval with no explicit count needs one approval
    pub fn quorum(&self) -> usize {
        let count = self.required_count.unwrap_or(0).max(0) as usize;
        if !self.is_required() && count == 0 {
            1
        } else {
            count
        }
    }
}

/// Parameters of notification actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyParams {
    pub targets: Vec<TargetConfig>,
    pub channels: Vec<Channel>,
    pub topic: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub template_id: Option<String>,
    pub template_key: Option<String>,
}

impl NotifyParams {
    pub fn effective_channels(&self) -> Vec<Channel> {
        if self.channels.is_empty() {
            vec![Channel::InApp]
        } else {
            self.channels.clone()
        }
    }
}

/// Parameters of webhook actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookParams {
    pub url: String,
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Template document whose `{{expr}}` tokens are rendered
    pub payload: Option<Value>,
    /// Expression producing a map merged into the payload
    pub payload_expr: Option<String>,
    pub timeout_ms: Option<u64>,
    pub secret: Option<String>,
    pub retries: Option<u32>,
    pub idempotency_key: Option<String>,
}

/// Parameters of field-update actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldUpdateParams {
    pub updates: Option<Map<String, Value>>,
}

/// Parameters of integration actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationParams {
    pub provider: String,
    pub operation: String,
    pub config: Map<String, Value>,
    pub timeout_secs: Option<u64>,
}

/// Typed parameters, one variant per action kind
#[derive(Debug, Clone, PartialEq)]
pub enum ActionParams {
    Approval(ApprovalParams),
    Review(ApprovalParams),
    Notify(NotifyParams),
    Webhook(WebhookParams),
    FieldUpdate(Map<String, Value>),
    Integration(IntegrationParams),
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub key: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Run the action only when this expression is true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl WorkflowAction {
    pub fn new(key: impl Into<String>, action_type: ActionType, params: Value) -> Self {
        Self {
            key: key.into(),
            action_type,
            description: None,
            when: None,
            params,
        }
    }

    pub fn with_when(mut self, expression: impl Into<String>) -> Self {
        self.when = Some(expression.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn raw_params(&self) -> Value {
        match &self.params {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        }
    }

    /// Parse the raw params into the variant matching this action's type
    pub fn params(&self) -> Result<ActionParams> {
        let raw = self.raw_params();
        let parsed = match self.action_type {
            ActionType::RequestApproval => ActionParams::Approval(serde_json::from_value(raw)?),
            ActionType::RequestReview => ActionParams::Review(serde_json::from_value(raw)?),
            ActionType::Notify => {
                let params: NotifyParams = serde_json::from_value(raw)?;
                if params.template_id.is_some() && params.template_key.is_some() {
                    return Err(WorkflowError::TemplateReferenceConflict);
                }
                ActionParams::Notify(params)
            }
            ActionType::Webhook => {
                let params: WebhookParams = serde_json::from_value(raw)?;
                if params.url.trim().is_empty() {
                    return Err(WorkflowError::WebhookUrlRequired);
                }
                ActionParams::Webhook(params)
            }
            ActionType::UpdateField => {
                let params: FieldUpdateParams = serde_json::from_value(raw)?;
                match params.updates {
                    Some(updates) if !updates.is_empty() => ActionParams::FieldUpdate(updates),
                    _ => return Err(WorkflowError::MissingRequiredField("updates".to_string())),
                }
            }
            ActionType::Integration => {
                let params: IntegrationParams = serde_json::from_value(raw)?;
                if params.provider.trim().is_empty() {
                    return Err(WorkflowError::MissingRequiredField("provider".to_string()));
                }
                if params.operation.trim().is_empty() {
                    return Err(WorkflowError::MissingRequiredField("operation".to_string()));
                }
                ActionParams::Integration(params)
            }
        };
        Ok(parsed)
    }

    /// Approval/review params, or `None` for other kinds
    pub fn approval_params(&self) -> Option<ApprovalParams> {
        match self.params() {
            Ok(ActionParams::Approval(p)) | Ok(ActionParams::Review(p)) => Some(p),
            _ => None,
        }
    }

    /// Targets declared by approval, review and notification actions
    pub fn targets(&self) -> Vec<TargetConfig> {
        match self.params() {
            Ok(ActionParams::Approval(p)) | Ok(ActionParams::Review(p)) => p.targets,
            Ok(ActionParams::Notify(p)) => p.targets,
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_type_parsing() {
        assert_eq!("webhook".parse::<ActionType>().unwrap(), ActionType::Webhook);
        assert_eq!("APPROVAL".parse::<ActionType>().unwrap(), ActionType::RequestApproval);
        assert!(matches!(
            "SEND_FAX".parse::<ActionType>(),
            Err(WorkflowError::InvalidActionType(_))
        ));
        assert!(matches!(
            "TEAM".parse::<TargetType>(),
            Err(WorkflowError::InvalidTargetType(_))
        ));
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let action: WorkflowAction = serde_json::from_value(json!({
            "key": "approve",
            "type": "REQUEST_APPROVAL",
            "params": { "targets": [{ "type": "USER", "id": "alice" }], "required_count": 2 }
        }))
        .unwrap();
        assert_eq!(action.action_type, ActionType::RequestApproval);
        let params = action.approval_params().unwrap();
        assert_eq!(params.targets, vec![TargetConfig::user("alice")]);
        assert_eq!(params.quorum(), 2);
    }

    #[test]
    fn test_quorum_defaults() {
        let required = ApprovalParams::default();
        assert!(required.is_required());
        assert_eq!(required.quorum(), 0);

        let optional = ApprovalParams { required: Some(false), ..Default::default() };
        assert_eq!(optional.quorum(), 1);

        let negative = ApprovalParams { required_count: Some(-3), ..Default::default() };
        assert_eq!(negative.quorum(), 0);
    }

    #[test]
    fn test_field_update_requires_updates() {
        let action = WorkflowAction::new("update", ActionType::UpdateField, json!({}));
        assert!(matches!(action.params(), Err(WorkflowError::MissingRequiredField(_))));

        let action = WorkflowAction::new(
            "update",
            ActionType::UpdateField,
            json!({ "updates": { "status": "closed" } }),
        );
        match action.params().unwrap() {
            ActionParams::FieldUpdate(updates) => assert_eq!(updates["status"], "closed"),
            other => panic!("unexpected params: {:?}", other),
        }
    }

    #[test]
    fn test_webhook_requires_url() {
        let action = WorkflowAction::new("hook", ActionType::Webhook, Value::Null);
        assert!(matches!(action.params(), Err(WorkflowError::WebhookUrlRequired)));
    }

    #[test]
    fn test_notify_template_conflict() {
        let action = WorkflowAction::new(
            "notify",
            ActionType::Notify,
            json!({ "template_id": "t1", "template_key": "welcome" }),
        );
        assert!(matches!(action.params(), Err(WorkflowError::TemplateReferenceConflict)));
    }

    #[test]
    fn test_notify_default_channel() {
        let params = NotifyParams::default();
        assert_eq!(params.effective_channels(), vec![Channel::InApp]);
    }

    #[test]
    fn test_target_validation() {
        assert!(TargetConfig::user("alice").validate().is_ok());
        assert!(TargetConfig::resolver("object_owner").validate().is_ok());
        let empty = TargetConfig { target_type: TargetType::Group, id: Some(" ".into()), resolver_key: None };
        assert!(empty.validate().is_err());
    }
}
