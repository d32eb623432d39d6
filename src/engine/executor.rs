// Action execution
// One dispatch point for every action kind

//! # Action Executor
//!
//! [`ActionExecutor::execute`] parses an action's params into the typed
//! [`ActionParams`] variant and matches on it. Each arm owns one kind of side
//! effect:
//!
//! - **Approval / Review**: one assignment per resolved user, created idempotently
//! - **Notify**: rendered notifications through the [`NotificationDispatcher`]
//! - **Webhook**: signed delivery through the [`WebhookDispatcher`]
//! - **Field update**: literal values written onto the live object
//! - **Integration**: a queued run plus an `IntegrationRequested` event
//!
//! Integrations finish later, so they return [`ActionOutcome::Queued`] and the
//! orchestrator waits for the integration handler to report completion.
//!
//! ## Rust Learning Notes:
//!
//! ### Exhaustive Dispatch
//! `match action.params()? { ... }` must cover every `ActionParams` variant.
//! Adding an action kind without an executor arm is a compile error.
//!
//! ### Idempotent Creates
//! Assignment creation treats `WorkflowError::UniqueViolation` as "already
//! exists" and loads the existing row, so a redelivered `ActionStarted` event
//! does not duplicate work.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::emit::Emitter;
use super::events::{AssignmentCreatedPayload, EngineEvent, IntegrationRequestedPayload};
use super::expression::{ExpressionEvaluator, ExpressionVars};
use super::notifications::{NotificationDispatcher, NotificationRequest};
use super::quorum::count_assignment_status;
use super::resolver::{ResolvedTarget, TargetResolver};
use super::storage::WorkflowStorage;
use super::webhook::{build_payload, WebhookDispatcher};
use crate::context::CallerContext;
use crate::models::{
    assignment_key, ActionParams, ActionType, ApprovalMetadata, ApprovalParams, AssignmentStatus,
    AssignmentTarget, DomainObject, IntegrationParams, IntegrationRun, NotifyParams,
    WebhookParams, WorkflowAction, WorkflowAssignment, WorkflowEventRecord, WorkflowEventType,
    WorkflowInstance, WorkflowObject,
};
use crate::{Result, WorkflowError};

/// How an action finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Done; the orchestrator may emit `ActionCompleted` now
    Completed,
    /// Finishes asynchronously; completion arrives as a separate event
    Queued,
}

/// Runs workflow actions against an instance
pub struct ActionExecutor {
    storage: Arc<dyn WorkflowStorage>,
    evaluator: Arc<ExpressionEvaluator>,
    resolver: Arc<TargetResolver>,
    notifications: Arc<NotificationDispatcher>,
    webhooks: WebhookDispatcher,
    emitter: Arc<Emitter>,
}

impl ActionExecutor {
    pub fn new(
        storage: Arc<dyn WorkflowStorage>,
        evaluator: Arc<ExpressionEvaluator>,
        resolver: Arc<TargetResolver>,
        notifications: Arc<NotificationDispatcher>,
        webhooks: WebhookDispatcher,
        emitter: Arc<Emitter>,
    ) -> Self {
        Self {
            storage,
            evaluator,
            resolver,
            notifications,
            webhooks,
            emitter,
        }
    }

    /// Execute the action at `index` of the instance snapshot
    pub async fn execute(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        index: usize,
        action: &WorkflowAction,
        object: &WorkflowObject,
    ) -> Result<ActionOutcome> {
        debug!(instance_id = %instance.id, action_key = %action.key, action_type = %action.action_type, "executing action");

        match action.params()? {
            ActionParams::Approval(params) => {
                self.create_assignments(caller, instance, action, ActionType::RequestApproval, &params, object)
                    .await?;
                Ok(ActionOutcome::Completed)
            }
            ActionParams::Review(params) => {
                self.create_assignments(caller, instance, action, ActionType::RequestReview, &params, object)
                    .await?;
                Ok(ActionOutcome::Completed)
            }
            ActionParams::Notify(params) => {
                let vars = self.action_vars(caller, instance, object).await?;
                self.notify(caller, instance, action, &params, object, &vars).await?;
                Ok(ActionOutcome::Completed)
            }
            ActionParams::Webhook(params) => {
                self.send_webhook(caller, instance, action, &params, object).await?;
                Ok(ActionOutcome::Completed)
            }
            ActionParams::FieldUpdate(updates) => {
                self.update_fields(caller, instance, action, updates).await?;
                Ok(ActionOutcome::Completed)
            }
            ActionParams::Integration(params) => {
                self.queue_integration(caller, instance, index, action, &params).await?;
                Ok(ActionOutcome::Queued)
            }
        }
    }

    /// Variables for expressions evaluated in the context of a running instance
    ///
    /// Adds `instance`, `initiator` and `assignments` (status counts keyed by
    /// action key) on top of the trigger-time scope.
    pub async fn action_vars(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        object: &WorkflowObject,
    ) -> Result<ExpressionVars> {
        let assignments = self.storage.list_assignments(caller.org_id()?, &instance.id).await?;

        let mut grouped: BTreeMap<String, Vec<WorkflowAssignment>> = BTreeMap::new();
        for assignment in assignments.into_iter().filter(|a| !a.is_change_request()) {
            grouped
                .entry(assignment.approval.action_key.clone())
                .or_default()
                .push(assignment);
        }
        let counts: Map<String, Value> = grouped
            .into_iter()
            .map(|(key, group)| {
                let c = count_assignment_status(&group);
                let value = json!({
                    "approved": c.approved,
                    "pending": c.pending,
                    "rejected": c.rejected,
                    "changes_requested": c.changes_requested,
                    "total": c.total(),
                });
                (key, value)
            })
            .collect();

        Ok(ExpressionVars::from_context(object.to_value(), &instance.context)
            .with("instance", instance.to_expression_value())
            .with(
                "initiator",
                instance
                    .context
                    .trigger_user_id
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            )
            .with("assignments", Value::Object(counts)))
    }

    async fn create_assignments(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        action: &WorkflowAction,
        action_type: ActionType,
        params: &ApprovalParams,
        object: &WorkflowObject,
    ) -> Result<Vec<WorkflowAssignment>> {
        let org_id = caller.org_id()?;
        let resolved = self.resolver.resolve(caller, &params.targets, object).await?;
        if resolved.is_empty() {
            return Err(match action_type {
                ActionType::RequestReview => WorkflowError::ReviewNoTargets(action.key.clone()),
                _ => WorkflowError::ApprovalNoTargets(action.key.clone()),
            });
        }

        let required_count = params.quorum();
        let quorum_unreachable = required_count > resolved.len();
        if quorum_unreachable {
            warn!(
                instance_id = %instance.id,
                action_key = %action.key,
                required_count,
                resolved = resolved.len(),
                "fewer approvers resolved than the quorum requires"
            );
        }

        let proposed_hash = match &instance.proposal_id {
            Some(id) => self.storage.get_proposal(org_id, id).await?.map(|p| p.proposed_hash),
            None => None,
        };
        let prefix = action_type.assignment_prefix().unwrap_or("approval");
        let role = match action_type {
            ActionType::RequestReview => "REVIEWER",
            _ => "APPROVER",
        };

        let mut assignments = Vec::with_capacity(resolved.len());
        for target in &resolved {
            let meta = ApprovalMetadata {
                action_key: action.key.clone(),
                required: params.is_required(),
                required_count,
                label: params.label.clone(),
                proposed_hash: proposed_hash.clone(),
                approved_at: None,
                approved_by: None,
            };
            let key = assignment_key(prefix, &action.key, &target.user_id);
            let candidate = WorkflowAssignment::new(org_id, &instance.id, key.clone(), role, meta);

            let (assignment, created) = match self.storage.create_assignment(candidate).await {
                Ok(assignment) => (assignment, true),
                Err(WorkflowError::UniqueViolation(_)) => {
                    let existing = self
                        .storage
                        .find_assignment_by_key(org_id, &instance.id, &key)
                        .await?
                        .ok_or_else(|| WorkflowError::NotFound(format!("workflow assignment {}", key)))?;
                    (existing, false)
                }
                Err(err) => return Err(err),
            };

            if created {
                self.link_target(org_id, &assignment, target).await?;
                self.emitter
                    .emit(
                        caller,
                        EngineEvent::AssignmentCreated(AssignmentCreatedPayload {
                            assignment_id: assignment.id.clone(),
                            instance_id: instance.id.clone(),
                            target_user_id: target.user_id.clone(),
                            action_type,
                            object_id: instance.object_id.clone(),
                            object_type: instance.object_type.clone(),
                        }),
                    )
                    .await?;
            }
            assignments.push(assignment);
        }

        self.storage
            .record_event(WorkflowEventRecord::new(
                org_id,
                &instance.id,
                WorkflowEventType::AssignmentCreated,
                Some(&action.key),
                json!({
                    "assignment_ids": assignments.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
                    "target_user_ids": resolved.iter().map(|t| t.user_id.clone()).collect::<Vec<_>>(),
                    "required_count": required_count,
                    "quorum_unreachable": quorum_unreachable,
                }),
            ))
            .await?;

        info!(
            instance_id = %instance.id,
            action_key = %action.key,
            assignments = assignments.len(),
            "assignments created"
        );
        Ok(assignments)
    }

    async fn link_target(&self, org_id: &str, assignment: &WorkflowAssignment, target: &ResolvedTarget) -> Result<()> {
        let mut row = AssignmentTarget::new(org_id, &assignment.id, target.target_type, &target.user_id);
        row.target_group_id = target.group_id.clone();
        row.resolver_key = target.resolver_key.clone();
        match self.storage.create_assignment_target(row).await {
            Ok(()) | Err(WorkflowError::UniqueViolation(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Resolve recipients and send a notification action
    pub async fn notify(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        action: &WorkflowAction,
        params: &NotifyParams,
        object: &WorkflowObject,
        vars: &ExpressionVars,
    ) -> Result<usize> {
        let user_ids = self.resolver.resolve_user_ids(caller, &params.targets, object).await?;
        let outcome = self
            .notifications
            .dispatch(
                caller,
                NotificationRequest {
                    instance_id: &instance.id,
                    action_key: &action.key,
                    params,
                    user_ids: &user_ids,
                },
                vars,
            )
            .await?;
        Ok(outcome.records.len() + outcome.dispatched)
    }

    async fn send_webhook(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        action: &WorkflowAction,
        params: &WebhookParams,
        object: &WorkflowObject,
    ) -> Result<()> {
        let org_id = caller.org_id()?;
        let approved_by: Vec<String> = self
            .storage
            .list_assignments(org_id, &instance.id)
            .await?
            .into_iter()
            .filter(|a| a.status == AssignmentStatus::Approved)
            .filter_map(|a| a.actor_user_id)
            .collect();

        let mut base = Map::new();
        base.insert("instance_id".into(), json!(instance.id));
        base.insert("definition_id".into(), json!(instance.definition_id));
        base.insert("object_id".into(), json!(instance.object_id));
        base.insert("object_type".into(), json!(instance.object_type));
        base.insert("action_key".into(), json!(action.key));
        base.insert("initiator".into(), json!(instance.context.trigger_user_id));
        base.insert("approved_by".into(), json!(approved_by));

        let vars = self.action_vars(caller, instance, object).await?;
        let body = build_payload(&self.evaluator, params, base, &vars)?;
        let request = self.webhooks.prepare(params, &instance.id, &action.key, &body)?;
        let delivery = self.webhooks.send(&request).await?;

        info!(
            instance_id = %instance.id,
            action_key = %action.key,
            status = delivery.status,
            attempts = delivery.attempts,
            "webhook delivered"
        );
        Ok(())
    }

    async fn update_fields(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        action: &WorkflowAction,
        updates: Map<String, Value>,
    ) -> Result<()> {
        let privileged = caller.with_bypass();
        let rendered = match render_placeholders(&Value::Object(updates), instance, &action.key) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.storage
            .update_object(privileged.org_id()?, &instance.object_type, &instance.object_id, &rendered)
            .await?;
        info!(
            instance_id = %instance.id,
            action_key = %action.key,
            fields = ?rendered.keys().collect::<Vec<_>>(),
            "fields updated"
        );
        Ok(())
    }

    async fn queue_integration(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        index: usize,
        action: &WorkflowAction,
        params: &IntegrationParams,
    ) -> Result<()> {
        let org_id = caller.org_id()?;
        let run = IntegrationRun::new(
            org_id,
            &instance.id,
            &action.key,
            index,
            &params.provider,
            &params.operation,
            params.config.clone(),
        );
        let run = self.storage.create_integration_run(run).await?;

        // A failed emit is recorded and replayed by reconciliation; the run stays pending
        self.emitter
            .emit(
                caller,
                EngineEvent::IntegrationRequested(IntegrationRequestedPayload {
                    run_id: run.id.clone(),
                    instance_id: instance.id.clone(),
                    action_key: action.key.clone(),
                    action_index: index,
                    provider: run.provider.clone(),
                    operation: run.operation.clone(),
                    object_id: instance.object_id.clone(),
                    object_type: instance.object_type.clone(),
                }),
            )
            .await?;
        info!(instance_id = %instance.id, run_id = %run.id, provider = %run.provider, "integration queued");
        Ok(())
    }
}

/// Replace `{{object_id}}`-style placeholders in every string of a document
pub fn render_placeholders(value: &Value, instance: &WorkflowInstance, action_key: &str) -> Value {
    match value {
        Value::String(text) => Value::String(
            text.replace("{{object_id}}", &instance.object_id)
                .replace("{{object_type}}", &instance.object_type)
                .replace("{{instance_id}}", &instance.id)
                .replace("{{definition_id}}", &instance.definition_id)
                .replace("{{action_key}}", action_key),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_placeholders(item, instance, action_key))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_placeholders(v, instance, action_key)))
                .collect(),
        ),
        other => other.clone(),
    }
}
