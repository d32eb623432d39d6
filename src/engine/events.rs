// Event system for driving workflow instances

//! # Event System
//!
//! Lifecycle events move instances forward. Each event is one variant of the
//! closed [`EngineEvent`] enum, so handlers are bound to a concrete payload type
//! and the compiler checks every topic is handled.
//!
//! Events travel inside an [`EventEnvelope`] that carries the organization and
//! acting user, which the handlers turn back into a caller context.
//!
//! Publishing goes through the [`EventPublisher`] trait. [`EventBus`] is the
//! in-process implementation on top of a tokio broadcast channel; tests wrap it
//! to inject delivery failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::context::CallerContext;
use crate::models::{ActionType, AssignmentStatus, InstanceState};
use crate::{Result, WorkflowError};

pub const TOPIC_TRIGGERED: &str = "workflow.triggered";
pub const TOPIC_ACTION_STARTED: &str = "workflow.action_started";
pub const TOPIC_ACTION_COMPLETED: &str = "workflow.action_completed";
pub const TOPIC_ASSIGNMENT_CREATED: &str = "workflow.assignment_created";
pub const TOPIC_ASSIGNMENT_COMPLETED: &str = "workflow.assignment_completed";
pub const TOPIC_INSTANCE_COMPLETED: &str = "workflow.instance_completed";
pub const TOPIC_INTEGRATION_REQUESTED: &str = "workflow.integration_requested";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredPayload {
    pub instance_id: String,
    pub definition_id: String,
    pub object_id: String,
    pub object_type: String,
    pub trigger_event_type: String,
    #[serde(default)]
    pub trigger_changed_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStartedPayload {
    pub instance_id: String,
    pub action_index: usize,
    pub action_type: ActionType,
    pub object_id: String,
    pub object_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCompletedPayload {
    pub instance_id: String,
    pub action_index: usize,
    pub action_type: ActionType,
    pub action_key: String,
    pub object_id: String,
    pub object_type: String,
    pub success: bool,
    pub skipped: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCreatedPayload {
    pub assignment_id: String,
    pub instance_id: String,
    pub target_user_id: String,
    pub action_type: ActionType,
    pub object_id: String,
    pub object_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCompletedPayload {
    pub assignment_id: String,
    pub instance_id: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub completed_by: Option<String>,
    pub object_id: String,
    pub object_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceCompletedPayload {
    pub instance_id: String,
    pub state: InstanceState,
    pub object_id: String,
    pub object_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRequestedPayload {
    pub run_id: String,
    pub instance_id: String,
    pub action_key: String,
    pub action_index: usize,
    pub provider: String,
    pub operation: String,
    pub object_id: String,
    pub object_type: String,
}

/// Every event the engine publishes, tagged by topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "workflow.triggered")]
    Triggered(TriggeredPayload),
    #[serde(rename = "workflow.action_started")]
    ActionStarted(ActionStartedPayload),
    #[serde(rename = "workflow.action_completed")]
    ActionCompleted(ActionCompletedPayload),
    #[serde(rename = "workflow.assignment_created")]
    AssignmentCreated(AssignmentCreatedPayload),
    #[serde(rename = "workflow.assignment_completed")]
    AssignmentCompleted(AssignmentCompletedPayload),
    #[serde(rename = "workflow.instance_completed")]
    InstanceCompleted(InstanceCompletedPayload),
    #[serde(rename = "workflow.integration_requested")]
    IntegrationRequested(IntegrationRequestedPayload),
}

impl EngineEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::Triggered(_) => TOPIC_TRIGGERED,
            EngineEvent::ActionStarted(_) => TOPIC_ACTION_STARTED,
            EngineEvent::ActionCompleted(_) => TOPIC_ACTION_COMPLETED,
            EngineEvent::AssignmentCreated(_) => TOPIC_ASSIGNMENT_CREATED,
            EngineEvent::AssignmentCompleted(_) => TOPIC_ASSIGNMENT_COMPLETED,
            EngineEvent::InstanceCompleted(_) => TOPIC_INSTANCE_COMPLETED,
            EngineEvent::IntegrationRequested(_) => TOPIC_INTEGRATION_REQUESTED,
        }
    }

    /// Instance the event belongs to
    pub fn instance_id(&self) -> &str {
        match self {
            EngineEvent::Triggered(p) => &p.instance_id,
            EngineEvent::ActionStarted(p) => &p.instance_id,
            EngineEvent::ActionCompleted(p) => &p.instance_id,
            EngineEvent::AssignmentCreated(p) => &p.instance_id,
            EngineEvent::AssignmentCompleted(p) => &p.instance_id,
            EngineEvent::InstanceCompleted(p) => &p.instance_id,
            EngineEvent::IntegrationRequested(p) => &p.instance_id,
        }
    }
}

/// An event plus the identity it was emitted under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub org_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub emitted_at: DateTime<Utc>,
    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn new(org_id: &str, user_id: Option<&str>, event: EngineEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            user_id: user_id.map(str::to_string),
            emitted_at: Utc::now(),
            event,
        }
    }

    /// Caller context handlers run under: the emitting user, with bypass set
    pub fn caller(&self) -> CallerContext {
        match &self.user_id {
            Some(user) => CallerContext::new(self.org_id.clone(), user.clone()).with_bypass(),
            None => CallerContext::system(self.org_id.clone()),
        }
    }
}

/// Anything that can deliver engine events
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;
}

/// In-process event bus backed by a broadcast channel
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait::async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let topic = envelope.event.topic();
        self.sender
            .send(envelope)
            .map(|_| ())
            .map_err(|_| WorkflowError::EmitFailed(format!("no subscribers for {}", topic)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_event() -> EngineEvent {
        EngineEvent::InstanceCompleted(InstanceCompletedPayload {
            instance_id: "inst-1".into(),
            state: InstanceState::Completed,
            object_id: "obj-1".into(),
            object_type: "Policy".into(),
        })
    }

    #[test]
    fn test_event_serializes_with_topic_tag() {
        let value = serde_json::to_value(create_test_event()).unwrap();
        assert_eq!(value["topic"], "workflow.instance_completed");
        assert_eq!(value["payload"]["state"], "COMPLETED");

        let back: EngineEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.topic(), TOPIC_INSTANCE_COMPLETED);
        assert_eq!(back.instance_id(), "inst-1");
    }

    #[test]
    fn test_envelope_caller() {
        let envelope = EventEnvelope::new("org-1", Some("alice"), create_test_event());
        let caller = envelope.caller();
        assert_eq!(caller.user_id().unwrap(), "alice");
        assert!(caller.is_bypass());

        let system = EventEnvelope::new("org-1", None, create_test_event()).caller();
        assert!(system.user_id_opt().is_none());
    }

    #[tokio::test]
    async fn test_bus_publish_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EventEnvelope::new("org-1", None, create_test_event())).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, create_test_event());
    }

    #[tokio::test]
    async fn test_bus_without_subscribers_fails() {
        let bus = EventBus::new(8);
        let result = bus.publish(EventEnvelope::new("org-1", None, create_test_event())).await;
        assert!(matches!(result, Err(WorkflowError::EmitFailed(_))));
    }

    #[test]
    fn test_payload_shape() {
        let event = EngineEvent::ActionCompleted(ActionCompletedPayload {
            instance_id: "i".into(),
            action_index: 1,
            action_type: ActionType::Webhook,
            action_key: "hook".into(),
            object_id: "o".into(),
            object_type: "Policy".into(),
            success: true,
            skipped: false,
            error_message: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["action_type"], json!("WEBHOOK"));
    }
}
