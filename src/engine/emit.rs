// Event emission with failure recording and reconciliation

//! # Emit and Reconcile
//!
//! Publishing an event never fails the caller. When the publisher returns an
//! error, the [`Emitter`] writes an `EMIT_FAILED` audit event that carries
//! everything needed to publish the event again: the topic, the serialized
//! event, the attempt count and the last error.
//!
//! The [`Reconciler`] later scans the emit history of each instance. Only the
//! newest emit record of an instance matters. When that record is `EMIT_FAILED`
//! the event is published again:
//!
//! - success records `EMIT_RECOVERED`
//! - failure records another `EMIT_FAILED` with the attempt count raised by one
//! - once the count would pass the configured maximum, `EMIT_FAILED_TERMINAL` is
//!   recorded and the instance is forced to `Failed`
//!
//! ## Rust Learning Notes:
//!
//! ### Typed Audit Details
//! `EmitFailureDetails` is serialized into the audit event's JSON `details` and
//! deserialized back by the reconciler, so both sides agree on the shape at
//! compile time.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::events::{EngineEvent, EventEnvelope, EventPublisher};
use super::storage::{InstanceUpdate, StateGuard, WorkflowStorage};
use crate::context::CallerContext;
use crate::models::{InstanceState, ProposalState, WorkflowEventRecord, WorkflowEventType};
use crate::Result;

/// What an `EMIT_FAILED` audit event records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitFailureDetails {
    pub topic: String,
    /// The serialized [`EngineEvent`]
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Publishes events and records failed deliveries
pub struct Emitter {
    publisher: Arc<dyn EventPublisher>,
    storage: Arc<dyn WorkflowStorage>,
}

impl Emitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, storage: Arc<dyn WorkflowStorage>) -> Self {
        Self { publisher, storage }
    }

    /// Publish an event; returns false when delivery failed and was recorded
    pub async fn emit(&self, caller: &CallerContext, event: EngineEvent) -> Result<bool> {
        let org_id = caller.org_id()?;
        let topic = event.topic();
        let instance_id = event.instance_id().to_string();
        let envelope = EventEnvelope::new(org_id, caller.user_id_opt(), event.clone());

        match self.publisher.publish(envelope).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(topic, instance_id = %instance_id, error = %err, "event emission failed");
                let details = EmitFailureDetails {
                    topic: topic.to_string(),
                    payload: serde_json::to_value(&event)?,
                    attempts: 1,
                    last_error: err.to_string(),
                    user_id: caller.user_id_opt().map(str::to_string),
                };
                self.storage
                    .record_event(WorkflowEventRecord::new(
                        org_id,
                        &instance_id,
                        WorkflowEventType::EmitFailed,
                        None,
                        serde_json::to_value(&details)?,
                    ))
                    .await?;
                Ok(false)
            }
        }
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Instances whose newest emit record was a failure
    pub scanned: usize,
    pub recovered: usize,
    /// Republished and failed again, still under the attempt limit
    pub retried: usize,
    pub terminal: usize,
}

/// Replays failed emissions with a bounded number of attempts
pub struct Reconciler {
    publisher: Arc<dyn EventPublisher>,
    storage: Arc<dyn WorkflowStorage>,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(publisher: Arc<dyn EventPublisher>, storage: Arc<dyn WorkflowStorage>, max_attempts: u32) -> Self {
        Self {
            publisher,
            storage,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One pass over every instance of the caller's organization
    pub async fn reconcile(&self, caller: &CallerContext) -> Result<ReconcileReport> {
        let org_id = caller.org_id()?;
        let history = self
            .storage
            .list_events(org_id, None, &WorkflowEventType::emit_lifecycle())
            .await?;

        // Newest record per instance, in first-seen instance order
        let mut order = Vec::new();
        let mut latest: HashMap<String, WorkflowEventRecord> = HashMap::new();
        for record in history {
            if !latest.contains_key(&record.instance_id) {
                order.push(record.instance_id.clone());
            }
            latest.insert(record.instance_id.clone(), record);
        }

        let mut report = ReconcileReport::default();
        for instance_id in order {
            let Some(record) = latest.remove(&instance_id) else {
                continue;
            };
            if record.event_type != WorkflowEventType::EmitFailed {
                continue;
            }
            report.scanned += 1;

            match self.retry(org_id, &record).await? {
                RetryOutcome::Recovered => report.recovered += 1,
                RetryOutcome::Retried => report.retried += 1,
                RetryOutcome::Terminal => report.terminal += 1,
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                recovered = report.recovered,
                retried = report.retried,
                terminal = report.terminal,
                "reconciliation pass finished"
            );
        }
        Ok(report)
    }

    async fn retry(&self, org_id: &str, record: &WorkflowEventRecord) -> Result<RetryOutcome> {
        let details: EmitFailureDetails = match serde_json::from_value(record.details.clone()) {
            Ok(details) => details,
            Err(err) => {
                error!(instance_id = %record.instance_id, error = %err, "unreadable emit failure record");
                let details = EmitFailureDetails {
                    topic: String::new(),
                    payload: record.details.clone(),
                    attempts: self.max_attempts,
                    last_error: format!("unreadable emit failure record: {}", err),
                    user_id: None,
                };
                self.mark_terminal(org_id, &record.instance_id, &details).await?;
                return Ok(RetryOutcome::Terminal);
            }
        };

        let publish_result = match serde_json::from_value::<EngineEvent>(details.payload.clone()) {
            Ok(event) => {
                let envelope = EventEnvelope::new(org_id, details.user_id.as_deref(), event);
                self.publisher.publish(envelope).await
            }
            Err(err) => Err(err.into()),
        };

        match publish_result {
            Ok(()) => {
                self.storage
                    .record_event(WorkflowEventRecord::new(
                        org_id,
                        &record.instance_id,
                        WorkflowEventType::EmitRecovered,
                        None,
                        json!({ "topic": details.topic, "attempts": details.attempts + 1 }),
                    ))
                    .await?;
                info!(instance_id = %record.instance_id, topic = %details.topic, "emission recovered");
                Ok(RetryOutcome::Recovered)
            }
            Err(err) => {
                let next = EmitFailureDetails {
                    attempts: details.attempts + 1,
                    last_error: err.to_string(),
                    ..details
                };
                if next.attempts > self.max_attempts {
                    self.mark_terminal(org_id, &record.instance_id, &next).await?;
                    return Ok(RetryOutcome::Terminal);
                }
                self.storage
                    .record_event(WorkflowEventRecord::new(
                        org_id,
                        &record.instance_id,
                        WorkflowEventType::EmitFailed,
                        None,
                        serde_json::to_value(&next)?,
                    ))
                    .await?;
                warn!(
                    instance_id = %record.instance_id,
                    attempts = next.attempts,
                    error = %next.last_error,
                    "emission retry failed"
                );
                Ok(RetryOutcome::Retried)
            }
        }
    }

    async fn mark_terminal(&self, org_id: &str, instance_id: &str, details: &EmitFailureDetails) -> Result<()> {
        self.storage
            .record_event(WorkflowEventRecord::new(
                org_id,
                instance_id,
                WorkflowEventType::EmitFailedTerminal,
                None,
                serde_json::to_value(details)?,
            ))
            .await?;
        let rows = self
            .storage
            .update_instance(
                org_id,
                instance_id,
                StateGuard::non_terminal(),
                InstanceUpdate::new().state(InstanceState::Failed),
            )
            .await?;
        error!(
            instance_id,
            topic = %details.topic,
            attempts = details.attempts,
            failed_instance = rows == 1,
            "emission failed permanently"
        );

        if rows == 1 {
            let proposal_id = self
                .storage
                .get_instance(org_id, instance_id)
                .await?
                .and_then(|instance| instance.proposal_id);
            if let Some(proposal_id) = proposal_id {
                self.storage
                    .transition_proposal(
                        org_id,
                        &proposal_id,
                        &ProposalState::non_terminal(),
                        ProposalState::Rejected,
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

enum RetryOutcome {
    Recovered,
    Retried,
    Terminal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::{EventBus, InstanceCompletedPayload};
    use crate::engine::storage::{InMemoryStorage, InstanceBundle};
    use crate::models::{DefinitionDocument, InstanceContext, ObjectRef, WorkflowInstance, WorkflowObject};
    use crate::WorkflowError;
    use serde_json::Map;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Publisher that fails while `failing` is set
    struct FlakyPublisher {
        bus: EventBus,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(WorkflowError::EmitFailed("sink unavailable".into()));
            }
            self.bus.publish(envelope).await
        }
    }

    async fn create_test_instance(storage: &InMemoryStorage) -> WorkflowInstance {
        let object = WorkflowObject::new("Policy", Map::new());
        let instance = WorkflowInstance::new(
            "org-1",
            "def-1",
            &object.id,
            &object.object_type,
            DefinitionDocument::default(),
            InstanceContext::default(),
        );
        let bundle = InstanceBundle {
            object_ref: ObjectRef::new("org-1", &instance.id, &object),
            instance,
            proposal: None,
        };
        storage.create_instance_bundle(bundle).await.unwrap().0
    }

    fn completed_event(instance_id: &str) -> EngineEvent {
        EngineEvent::InstanceCompleted(InstanceCompletedPayload {
            instance_id: instance_id.to_string(),
            state: InstanceState::Completed,
            object_id: "obj".into(),
            object_type: "Policy".into(),
        })
    }

    fn setup() -> (Arc<InMemoryStorage>, Arc<FlakyPublisher>, tokio::sync::broadcast::Receiver<EventEnvelope>) {
        let storage = Arc::new(InMemoryStorage::new());
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        let publisher = Arc::new(FlakyPublisher { bus, failing: AtomicBool::new(true) });
        (storage, publisher, rx)
    }

    #[tokio::test]
    async fn test_failed_emit_is_recorded_and_recovered() {
        let (storage, publisher, mut rx) = setup();
        let instance = create_test_instance(&storage).await;
        let emitter = Emitter::new(publisher.clone(), storage.clone());
        let caller = CallerContext::new("org-1", "alice");

        assert!(!emitter.emit(&caller, completed_event(&instance.id)).await.unwrap());

        let failed = storage
            .list_events("org-1", Some(&instance.id), &[WorkflowEventType::EmitFailed])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        let details: EmitFailureDetails = serde_json::from_value(failed[0].details.clone()).unwrap();
        assert_eq!(details.attempts, 1);
        assert_eq!(details.topic, "workflow.instance_completed");
        assert_eq!(details.user_id.as_deref(), Some("alice"));

        publisher.failing.store(false, Ordering::SeqCst);
        let reconciler = Reconciler::new(publisher.clone(), storage.clone(), 3);
        let report = reconciler.reconcile(&CallerContext::system("org-1")).await.unwrap();
        assert_eq!(report, ReconcileReport { scanned: 1, recovered: 1, retried: 0, terminal: 0 });

        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.event, completed_event(&instance.id));
        assert_eq!(replayed.user_id.as_deref(), Some("alice"));

        // Superseded by the recovery record, nothing left to do
        let report = reconciler.reconcile(&CallerContext::system("org-1")).await.unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_become_terminal() {
        let (storage, publisher, _rx) = setup();
        let instance = create_test_instance(&storage).await;
        let emitter = Emitter::new(publisher.clone(), storage.clone());
        let caller = CallerContext::system("org-1");
        emitter.emit(&caller, completed_event(&instance.id)).await.unwrap();

        let reconciler = Reconciler::new(publisher.clone(), storage.clone(), 3);
        for _ in 0..2 {
            let report = reconciler.reconcile(&caller).await.unwrap();
            assert_eq!(report.retried, 1);
        }
        let report = reconciler.reconcile(&caller).await.unwrap();
        assert_eq!(report.terminal, 1);

        let terminal = storage
            .list_events("org-1", Some(&instance.id), &[WorkflowEventType::EmitFailedTerminal])
            .await
            .unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].details["attempts"], 4);

        let stored = storage.get_instance("org-1", &instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Failed);

        let report = reconciler.reconcile(&caller).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_successful_emit_records_nothing() {
        let (storage, publisher, _rx) = setup();
        publisher.failing.store(false, Ordering::SeqCst);
        let emitter = Emitter::new(publisher, storage.clone());

        assert!(emitter.emit(&CallerContext::system("org-1"), completed_event("i-1")).await.unwrap());
        assert!(storage.list_events("org-1", None, &[]).await.unwrap().is_empty());
    }
}
