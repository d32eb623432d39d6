// Notification delivery
// In-app records plus pluggable senders for external channels

//! # Notification Dispatcher
//!
//! Notification actions resolve their targets elsewhere; this module turns the
//! resolved user ids into deliveries:
//!
//! - text comes from a stored [`NotificationTemplate`] or the action's own
//!   `title`/`body`, rendered through the expression evaluator
//! - template data is checked against the template's JSON schema first
//! - `IN_APP` writes one [`NotificationRecord`] per user
//! - every other channel goes through the [`ChannelSender`] registered for it,
//!   once per (channel, user)
//!
//! ## Rust Learning Notes:
//!
//! `ChannelSender` is an async trait object stored in a `HashMap<Channel, Arc<dyn ChannelSender>>`.
//! The map is the dispatch table; registering a sender is how a deployment adds Slack or email.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::expression::{ExpressionEvaluator, ExpressionVars};
use super::storage::WorkflowStorage;
use crate::context::CallerContext;
use crate::models::{Channel, NotificationRecord, NotificationTemplate, NotifyParams};
use crate::{Result, WorkflowError};

pub const NOTIFICATION_OBJECT_TYPE: &str = "workflow.notification";

/// A rendered message for one user on one external channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub org_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub subject: Option<String>,
    pub blocks: Option<Value>,
    pub topic: Option<String>,
    pub data: Value,
}

/// Delivery to an external channel such as Slack or email
#[async_trait::async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, message: &ChannelMessage) -> Result<()>;
}

/// Who is being notified about what
#[derive(Debug, Clone)]
pub struct NotificationRequest<'a> {
    pub instance_id: &'a str,
    pub action_key: &'a str,
    pub params: &'a NotifyParams,
    pub user_ids: &'a [String],
}

/// What a dispatch produced
#[derive(Debug, Clone, Default)]
pub struct NotificationOutcome {
    pub records: Vec<NotificationRecord>,
    pub dispatched: usize,
}

struct Rendered {
    title: String,
    body: String,
    subject: Option<String>,
    blocks: Option<Value>,
    data: Value,
    channels: Vec<Channel>,
    template_id: Option<String>,
}

pub struct NotificationDispatcher {
    storage: Arc<dyn WorkflowStorage>,
    evaluator: Arc<ExpressionEvaluator>,
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl NotificationDispatcher {
    pub fn new(storage: Arc<dyn WorkflowStorage>, evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self {
            storage,
            evaluator,
            senders: HashMap::new(),
        }
    }

    pub fn register_sender(&mut self, channel: Channel, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(channel, sender);
    }

    pub fn has_sender(&self, channel: Channel) -> bool {
        channel == Channel::InApp || self.senders.contains_key(&channel)
    }

    /// Render and deliver a notification to every resolved user
    pub async fn dispatch(
        &self,
        caller: &CallerContext,
        request: NotificationRequest<'_>,
        vars: &ExpressionVars,
    ) -> Result<NotificationOutcome> {
        if request.user_ids.is_empty() {
            debug!(action_key = request.action_key, "notification has no recipients");
            return Ok(NotificationOutcome::default());
        }

        let org_id = caller.org_id()?;
        let template = self.load_template(org_id, request.params).await?;
        let rendered = self.render(&request, template.as_ref(), vars)?;

        if let Some(missing) = rendered.channels.iter().find(|c| !self.has_sender(**c)) {
            return Err(WorkflowError::UnsupportedChannel(missing.to_string()));
        }

        let mut outcome = NotificationOutcome::default();
        for user_id in request.user_ids {
            for channel in &rendered.channels {
                if *channel == Channel::InApp {
                    let record = self.build_record(org_id, user_id, &request, &rendered);
                    self.storage.create_notification(record.clone()).await?;
                    outcome.records.push(record);
                    continue;
                }

                let sender = self
                    .senders
                    .get(channel)
                    .ok_or_else(|| WorkflowError::UnsupportedChannel(channel.to_string()))?;
                sender
                    .send(&ChannelMessage {
                        org_id: org_id.to_string(),
                        user_id: user_id.clone(),
                        channel: *channel,
                        title: rendered.title.clone(),
                        body: rendered.body.clone(),
                        subject: rendered.subject.clone(),
                        blocks: rendered.blocks.clone(),
                        topic: request.params.topic.clone(),
                        data: rendered.data.clone(),
                    })
                    .await?;
                outcome.dispatched += 1;
            }
        }

        info!(
            instance_id = request.instance_id,
            action_key = request.action_key,
            recipients = request.user_ids.len(),
            in_app = outcome.records.len(),
            dispatched = outcome.dispatched,
            "notification sent"
        );
        Ok(outcome)
    }

    async fn load_template(&self, org_id: &str, params: &NotifyParams) -> Result<Option<NotificationTemplate>> {
        match (&params.template_id, &params.template_key) {
            (Some(_), Some(_)) => Err(WorkflowError::TemplateReferenceConflict),
            (Some(id), None) => self
                .storage
                .get_template(org_id, id)
                .await?
                .map(Some)
                .ok_or_else(|| WorkflowError::NotFound(format!("notification template {}", id))),
            (None, Some(key)) => self
                .storage
                .find_template_by_key(org_id, key)
                .await?
                .map(Some)
                .ok_or_else(|| WorkflowError::NotFound(format!("notification template key {}", key))),
            (None, None) => Ok(None),
        }
    }

    fn render(
        &self,
        request: &NotificationRequest<'_>,
        template: Option<&NotificationTemplate>,
        vars: &ExpressionVars,
    ) -> Result<Rendered> {
        let params = request.params;
        let data = match &params.data {
            Some(data) => self.evaluator.render_value(&Value::Object(data.clone()), vars)?,
            None => Value::Object(Map::new()),
        };

        if let Some(schema) = template.and_then(|t| t.json_schema.as_ref()) {
            validate_template_data(schema, &data)?;
        }

        let mut scope = vars.clone();
        scope.set("data", data.clone());

        let title_source = template.and_then(|t| t.title_template.clone()).or_else(|| params.title.clone());
        let body_source = template.and_then(|t| t.body_template.clone()).or_else(|| params.body.clone());

        let title = match title_source.filter(|t| !t.trim().is_empty()) {
            Some(source) => self.evaluator.render_text(&source, &scope)?,
            None => format!("Workflow notification ({})", request.action_key),
        };
        let body = match body_source.filter(|b| !b.trim().is_empty()) {
            Some(source) => self.evaluator.render_text(&source, &scope)?,
            None => format!(
                "Workflow instance {} emitted a notification action ({}).",
                request.instance_id, request.action_key
            ),
        };
        let subject = template
            .and_then(|t| t.subject_template.as_deref())
            .map(|s| self.evaluator.render_text(s, &scope))
            .transpose()?;
        let blocks = template
            .and_then(|t| t.blocks_template.as_ref())
            .map(|b| self.evaluator.render_value(b, &scope))
            .transpose()?;

        let channels = match template {
            Some(t) if params.channels.is_empty() && !t.channels.is_empty() => t.channels.clone(),
            _ => params.effective_channels(),
        };

        Ok(Rendered {
            title,
            body,
            subject,
            blocks,
            data,
            channels,
            template_id: template.map(|t| t.id.clone()),
        })
    }

    fn build_record(
        &self,
        org_id: &str,
        user_id: &str,
        request: &NotificationRequest<'_>,
        rendered: &Rendered,
    ) -> NotificationRecord {
        let mut record = NotificationRecord::new(
            org_id,
            user_id,
            rendered.title.clone(),
            rendered.body.clone(),
            NOTIFICATION_OBJECT_TYPE,
        );
        record.subject = rendered.subject.clone();
        record.blocks = rendered.blocks.clone();
        record.channels = rendered.channels.clone();
        record.topic = request.params.topic.clone();
        record.template_id = rendered.template_id.clone();
        record.data = json!({
            "user_id": user_id,
            "instance_id": request.instance_id,
            "action_key": request.action_key,
            "data": rendered.data,
        });
        record
    }
}

/// Check rendered data against a template's JSON schema
pub fn validate_template_data(schema: &Value, data: &Value) -> Result<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|err| WorkflowError::TemplateDataInvalid(format!("invalid schema: {}", err)))?;
    let result = compiled.validate(data);
    if let Err(errors) = result {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(WorkflowError::TemplateDataInvalid(messages.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use std::sync::Mutex;

    struct RecordingSender {
        sent: Mutex<Vec<ChannelMessage>>,
    }

    #[async_trait::async_trait]
    impl ChannelSender for RecordingSender {
        async fn send(&self, message: &ChannelMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn create_test_dispatcher() -> (Arc<InMemoryStorage>, NotificationDispatcher) {
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = NotificationDispatcher::new(storage.clone(), Arc::new(ExpressionEvaluator::default()));
        (storage, dispatcher)
    }

    fn users(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_defaults_create_in_app_records() {
        let (storage, dispatcher) = create_test_dispatcher();
        let caller = CallerContext::system("org-1");
        let params = NotifyParams::default();
        let recipients = users(&["alice", "bob"]);

        let outcome = dispatcher
            .dispatch(
                &caller,
                NotificationRequest { instance_id: "inst-1", action_key: "ping", params: &params, user_ids: &recipients },
                &ExpressionVars::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        let stored = storage.list_notifications("org-1", Some("bob")).await.unwrap();
        assert_eq!(stored[0].title, "Workflow notification (ping)");
        assert_eq!(stored[0].body, "Workflow instance inst-1 emitted a notification action (ping).");
        assert_eq!(stored[0].object_type, NOTIFICATION_OBJECT_TYPE);
        assert_eq!(stored[0].data["user_id"], "bob");
    }

    #[tokio::test]
    async fn test_template_rendering_and_schema() {
        let (storage, dispatcher) = create_test_dispatcher();
        let template = NotificationTemplate::new("org-1", "policy-changed")
            .with_title("Policy {{object.name}} changed")
            .with_body("Reason: {{data.reason}}")
            .with_schema(json!({
                "type": "object",
                "required": ["reason"],
                "properties": { "reason": { "type": "string" } }
            }));
        storage.put_template(template).await.unwrap();

        let caller = CallerContext::system("org-1");
        let vars = ExpressionVars::new().with("object", json!({ "name": "Access" }));
        let recipients = users(&["alice"]);

        let good = NotifyParams {
            template_key: Some("policy-changed".into()),
            data: Some(json!({ "reason": "{{object.name}} expired" }).as_object().cloned().unwrap()),
            ..Default::default()
        };
        let outcome = dispatcher
            .dispatch(
                &caller,
                NotificationRequest { instance_id: "i", action_key: "n", params: &good, user_ids: &recipients },
                &vars,
            )
            .await
            .unwrap();
        assert_eq!(outcome.records[0].title, "Policy Access changed");
        assert_eq!(outcome.records[0].body, "Reason: Access expired");
        assert!(outcome.records[0].template_id.is_some());

        let bad = NotifyParams {
            template_key: Some("policy-changed".into()),
            data: Some(json!({ "reason": 7 }).as_object().cloned().unwrap()),
            ..Default::default()
        };
        let result = dispatcher
            .dispatch(
                &caller,
                NotificationRequest { instance_id: "i", action_key: "n", params: &bad, user_ids: &recipients },
                &vars,
            )
            .await;
        assert!(matches!(result, Err(WorkflowError::TemplateDataInvalid(_))));
    }

    #[tokio::test]
    async fn test_missing_template_and_channel() {
        let (_, dispatcher) = create_test_dispatcher();
        let caller = CallerContext::system("org-1");
        let recipients = users(&["alice"]);

        let missing = NotifyParams { template_id: Some("nope".into()), ..Default::default() };
        let result = dispatcher
            .dispatch(
                &caller,
                NotificationRequest { instance_id: "i", action_key: "n", params: &missing, user_ids: &recipients },
                &ExpressionVars::new(),
            )
            .await;
        assert!(matches!(result, Err(WorkflowError::NotFound(_))));

        let slack = NotifyParams { channels: vec![Channel::Slack], ..Default::default() };
        let result = dispatcher
            .dispatch(
                &caller,
                NotificationRequest { instance_id: "i", action_key: "n", params: &slack, user_ids: &recipients },
                &ExpressionVars::new(),
            )
            .await;
        assert!(matches!(result, Err(WorkflowError::UnsupportedChannel(_))));
    }

    #[tokio::test]
    async fn test_external_sender_per_channel_and_user() {
        let (storage, mut dispatcher) = create_test_dispatcher();
        let sender = Arc::new(RecordingSender { sent: Mutex::new(Vec::new()) });
        dispatcher.register_sender(Channel::Slack, sender.clone());

        let caller = CallerContext::system("org-1");
        let params = NotifyParams {
            channels: vec![Channel::Slack, Channel::InApp],
            topic: Some("policies".into()),
            ..Default::default()
        };
        let recipients = users(&["alice", "bob"]);
        let outcome = dispatcher
            .dispatch(
                &caller,
                NotificationRequest { instance_id: "i", action_key: "n", params: &params, user_ids: &recipients },
                &ExpressionVars::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.dispatched, 2);
        assert_eq!(outcome.records.len(), 2);
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[1].user_id, "bob");
        assert_eq!(sent[0].topic.as_deref(), Some("policies"));
        assert_eq!(storage.list_notifications("org-1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_recipients_is_noop() {
        let (storage, dispatcher) = create_test_dispatcher();
        let params = NotifyParams::default();
        let outcome = dispatcher
            .dispatch(
                &CallerContext::system("org-1"),
                NotificationRequest { instance_id: "i", action_key: "n", params: &params, user_ids: &[] },
                &ExpressionVars::new(),
            )
            .await
            .unwrap();
        assert!(outcome.records.is_empty());
        assert!(storage.list_notifications("org-1", None).await.unwrap().is_empty());
    }
}
