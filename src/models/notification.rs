// Notification records and templates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Delivery channel for a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    InApp,
    Email,
    Slack,
    Teams,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "IN_APP",
            Channel::Email => "EMAIL",
            Channel::Slack => "SLACK",
            Channel::Teams => "TEAMS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-app notification addressed to one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub blocks: Option<Value>,
    pub data: Value,
    pub object_type: String,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        object_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            user_id: user_id.into(),
            title: title.into(),
            body: body.into(),
            subject: None,
            blocks: None,
            data: Value::Null,
            object_type: object_type.into(),
            channels: vec![Channel::InApp],
            topic: None,
            template_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A stored notification template
///
/// Text fields may contain `{{expr}}` tokens rendered through the expression
/// evaluator. `json_schema`, when present, validates the action's `data` before
/// anything is rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationTemplate {
    pub id: String,
    pub org_id: String,
    pub key: String,
    #[serde(default)]
    pub title_template: Option<String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub subject_template: Option<String>,
    #[serde(default)]
    pub blocks_template: Option<Value>,
    #[serde(default)]
    pub json_schema: Option<Value>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NotificationTemplate {
    pub fn new(org_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            key: key.into(),
            title_template: None,
            body_template: None,
            subject_template: None,
            blocks_template: None,
            json_schema: None,
            channels: Vec::new(),
            active: true,
        }
    }

    pub fn with_title(mut self, template: impl Into<String>) -> Self {
        self.title_template = Some(template.into());
        self
    }

    pub fn with_body(mut self, template: impl Into<String>) -> Self {
        self.body_template = Some(template.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.json_schema = Some(schema);
        self
    }
}
