// Workflow orchestrator
// Event handlers that move instances through their action pipeline

//! # Workflow Listeners
//!
//! The orchestrator is a set of handlers, one per [`EngineEvent`] topic. Each
//! handler loads the current instance, decides what happens next and emits
//! the follow-up event. Handlers never call each other directly, so a
//! redelivered or reordered event can only repeat work that is idempotent.
//!
//! ```text
//! Triggered ─► ActionStarted(i) ─► ActionCompleted(i) ─┬─► ActionStarted(i+1)
//!                                                      ├─► Paused ─► AssignmentCompleted ─► resume
//!                                                      └─► InstanceCompleted
//! ```
//!
//! ## Concurrency
//!
//! Handlers may run concurrently for the same instance. Every state transition
//! goes through [`WorkflowStorage::update_instance`] with a [`StateGuard`]: a
//! handler that loses the race sees zero rows changed and stops. In particular
//! Paused → Running happens at most once per gate, and a terminal state is
//! written at most once.
//!
//! ## Rust Learning Notes:
//!
//! ### Tracing Spans
//! `handle` wraps each dispatch in an `info_span!` carrying the topic and
//! instance id, and `.instrument(span)` attaches it to the future so every
//! log line emitted inside the handler inherits those fields.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

use super::emit::Emitter;
use super::events::{
    ActionCompletedPayload, ActionStartedPayload, AssignmentCompletedPayload, AssignmentCreatedPayload,
    EngineEvent, EventEnvelope, InstanceCompletedPayload, IntegrationRequestedPayload, TriggeredPayload,
};
use super::executor::{ActionExecutor, ActionOutcome};
use super::expression::ExpressionEvaluator;
use super::integrations::IntegrationRunner;
use super::proposals::ProposalManager;
use super::quorum::{
    count_assignment_status, failure_message, required_approval_count, resolve_approval, ApprovalResolution,
    AssignmentStatusCounts,
};
use super::storage::{InstanceUpdate, StateGuard, WorkflowStorage};
use crate::context::CallerContext;
use crate::models::{
    ActionParams, ActionType, ApprovalMetadata, AssignmentStatus, AssignmentTarget, InstanceState, IntegrationRunStatus,
    ProposalState, RejectionMetadata, TargetType, WorkflowAction, WorkflowAssignment, WorkflowEventRecord,
    WorkflowEventType, WorkflowInstance, WorkflowObject, CHANGE_REQUEST_PREFIX, REQUESTER_ROLE,
};
use crate::{Result, WorkflowError};

/// Outcome of evaluating one approval group during resume
struct GroupResolution {
    action_key: String,
    counts: AssignmentStatusCounts,
    required_count: usize,
    resolution: ApprovalResolution,
}

/// Event handlers driving workflow instances
pub struct WorkflowListeners {
    storage: Arc<dyn WorkflowStorage>,
    evaluator: Arc<ExpressionEvaluator>,
    executor: Arc<ActionExecutor>,
    proposals: Arc<ProposalManager>,
    integrations: Arc<IntegrationRunner>,
    emitter: Arc<Emitter>,
}

impl WorkflowListeners {
    pub fn new(
        storage: Arc<dyn WorkflowStorage>,
        evaluator: Arc<ExpressionEvaluator>,
        executor: Arc<ActionExecutor>,
        proposals: Arc<ProposalManager>,
        integrations: Arc<IntegrationRunner>,
        emitter: Arc<Emitter>,
    ) -> Self {
        Self {
            storage,
            evaluator,
            executor,
            proposals,
            integrations,
            emitter,
        }
    }

    /// Dispatch one envelope to its handler
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        let caller = envelope.caller();
        let span = info_span!(
            "workflow_event",
            topic = envelope.event.topic(),
            instance_id = %envelope.event.instance_id(),
            event_id = %envelope.id
        );

        async {
            match &envelope.event {
                EngineEvent::Triggered(p) => self.on_triggered(&caller, p).await,
                EngineEvent::ActionStarted(p) => self.on_action_started(&caller, p).await,
                EngineEvent::ActionCompleted(p) => self.on_action_completed(&caller, p).await,
                EngineEvent::AssignmentCreated(p) => self.on_assignment_created(p).await,
                EngineEvent::AssignmentCompleted(p) => self.on_assignment_completed(&caller, p).await,
                EngineEvent::InstanceCompleted(p) => self.on_instance_completed(&caller, p).await,
                EngineEvent::IntegrationRequested(p) => self.on_integration_requested(&caller, p).await,
            }
        }
        .instrument(span)
        .await
    }

    // Shared helpers

    async fn load_instance(&self, caller: &CallerContext, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        let instance = self.storage.get_instance(caller.org_id()?, instance_id).await?;
        if instance.is_none() {
            debug!(reason = "instance_missing", "skipping event");
        }
        Ok(instance)
    }

    async fn load_object(&self, caller: &CallerContext, instance: &WorkflowInstance) -> Result<WorkflowObject> {
        self.storage
            .get_object(caller.org_id()?, &instance.object_type, &instance.object_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("{} {}", instance.object_type, instance.object_id)))
    }

    async fn record(
        &self,
        caller: &CallerContext,
        instance_id: &str,
        event_type: WorkflowEventType,
        action_key: Option<&str>,
        details: Value,
    ) -> Result<()> {
        self.storage
            .record_event(WorkflowEventRecord::new(caller.org_id()?, instance_id, event_type, action_key, details))
            .await
    }

    async fn emit_completed(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        state: InstanceState,
    ) -> Result<()> {
        self.emitter
            .emit(
                caller,
                EngineEvent::InstanceCompleted(InstanceCompletedPayload {
                    instance_id: instance.id.clone(),
                    state,
                    object_id: instance.object_id.clone(),
                    object_type: instance.object_type.clone(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn emit_started(&self, caller: &CallerContext, instance: &WorkflowInstance, index: usize) -> Result<()> {
        let action_type = instance
            .definition_snapshot
            .actions
            .get(index)
            .map(|a| a.action_type)
            .ok_or_else(|| {
                WorkflowError::InvalidState(format!("instance {} has no action at index {}", instance.id, index))
            })?;
        self.emitter
            .emit(
                caller,
                EngineEvent::ActionStarted(ActionStartedPayload {
                    instance_id: instance.id.clone(),
                    action_index: index,
                    action_type,
                    object_id: instance.object_id.clone(),
                    object_type: instance.object_type.clone(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn emit_action_completed(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        index: usize,
        action: &WorkflowAction,
        success: bool,
        skipped: bool,
        error_message: Option<String>,
    ) -> Result<()> {
        self.emitter
            .emit(
                caller,
                EngineEvent::ActionCompleted(ActionCompletedPayload {
                    instance_id: instance.id.clone(),
                    action_index: index,
                    action_type: action.action_type,
                    action_key: action.key.clone(),
                    object_id: instance.object_id.clone(),
                    object_type: instance.object_type.clone(),
                    success,
                    skipped,
                    error_message,
                }),
            )
            .await?;
        Ok(())
    }

    /// Start the action after `index`, or complete the instance when none remain
    async fn advance(&self, caller: &CallerContext, instance: &WorkflowInstance, next: usize) -> Result<()> {
        if next < instance.definition_snapshot.actions.len() {
            return self.emit_started(caller, instance, next).await;
        }
        if let Some(proposal_id) = &instance.proposal_id {
            self.proposals.apply(&caller.with_bypass(), proposal_id).await?;
        }
        self.emit_completed(caller, instance, InstanceState::Completed).await
    }

    /// Whether a notification action with a `when` expression may fire now
    async fn claim_notification(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        index: usize,
        action: &WorkflowAction,
    ) -> Result<bool> {
        let key = format!("notify_{}_{}", action.key, index);
        self.storage.record_fired_notification(caller.org_id()?, &instance.id, &key).await
    }

    // Triggered

    async fn on_triggered(&self, caller: &CallerContext, p: &TriggeredPayload) -> Result<()> {
        let Some(instance) = self.load_instance(caller, &p.instance_id).await? else {
            return Ok(());
        };
        if instance.state.is_terminal() {
            debug!(reason = "instance_terminal", "skipping trigger");
            return Ok(());
        }

        self.record(
            caller,
            &instance.id,
            WorkflowEventType::WorkflowTriggered,
            None,
            json!({
                "definition_id": p.definition_id,
                "trigger_event_type": p.trigger_event_type,
                "trigger_changed_fields": p.trigger_changed_fields,
                "version": instance.context.version,
            }),
        )
        .await?;

        let actions = &instance.definition_snapshot.actions;
        if actions.is_empty() {
            return self.emit_completed(caller, &instance, InstanceState::Completed).await;
        }

        let parallel = self.parallel_gates(caller, &instance).await?;
        if parallel.is_empty() {
            return self.emit_started(caller, &instance, 0).await;
        }

        let mut context = instance.context.clone();
        context.parallel_approval_keys = parallel.iter().map(|&i| actions[i].key.clone()).collect();
        let rows = self
            .storage
            .update_instance(caller.org_id()?, &instance.id, StateGuard::non_terminal(), InstanceUpdate::new().context(context))
            .await?;
        if rows == 0 {
            return Ok(());
        }
        info!(parallel = ?parallel, "starting approval gates in parallel");
        for index in parallel {
            self.emit_started(caller, &instance, index).await?;
        }
        Ok(())
    }

    /// Indices of gated actions whose `when` holds at trigger time
    async fn parallel_gates(&self, caller: &CallerContext, instance: &WorkflowInstance) -> Result<Vec<usize>> {
        let candidates: Vec<usize> = instance
            .definition_snapshot
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.action_type.is_gated() && a.when.is_some())
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let object = self.load_object(caller, instance).await?;
        let vars = self.executor.action_vars(caller, instance, &object).await?;
        let mut selected = Vec::new();
        for index in candidates {
            let action = &instance.definition_snapshot.actions[index];
            let expression = action.when.as_deref().unwrap_or("true");
            match self.evaluator.evaluate_bool(expression, &vars) {
                Ok(true) => selected.push(index),
                Ok(false) => {}
                Err(err) => warn!(action_key = %action.key, error = %err, "when expression failed, not starting in parallel"),
            }
        }
        Ok(selected)
    }

    // ActionStarted

    async fn on_action_started(&self, caller: &CallerContext, p: &ActionStartedPayload) -> Result<()> {
        let Some(instance) = self.load_instance(caller, &p.instance_id).await? else {
            return Ok(());
        };
        if instance.state.is_terminal() {
            debug!(reason = "instance_terminal", "skipping action start");
            return Ok(());
        }

        let Some(action) = instance.definition_snapshot.actions.get(p.action_index).cloned() else {
            warn!(action_index = p.action_index, "action index out of range");
            self.record(
                caller,
                &instance.id,
                WorkflowEventType::ActionCompleted,
                None,
                json!({ "action_index": p.action_index, "success": false, "error": "action index out of range" }),
            )
            .await?;
            return self.emit_completed(caller, &instance, InstanceState::Failed).await;
        };

        let rows = self
            .storage
            .update_instance(
                caller.org_id()?,
                &instance.id,
                StateGuard::non_terminal(),
                InstanceUpdate::new().action_index(p.action_index),
            )
            .await?;
        if rows == 0 {
            return Ok(());
        }
        self.record(
            caller,
            &instance.id,
            WorkflowEventType::ActionStarted,
            Some(&action.key),
            json!({ "action_index": p.action_index, "action_type": action.action_type }),
        )
        .await?;

        let object = self.load_object(caller, &instance).await?;
        if let Some(expression) = &action.when {
            let vars = self.executor.action_vars(caller, &instance, &object).await?;
            match self.evaluator.evaluate_bool(expression, &vars) {
                Ok(true) => {
                    if action.action_type == ActionType::Notify
                        && !self.claim_notification(caller, &instance, p.action_index, &action).await?
                    {
                        return self.skip(caller, &instance, p.action_index, &action, "already_fired").await;
                    }
                }
                Ok(false) => return self.skip(caller, &instance, p.action_index, &action, "when_false").await,
                Err(err) => {
                    warn!(action_key = %action.key, error = %err, "when expression failed");
                    return self
                        .emit_action_completed(caller, &instance, p.action_index, &action, false, false, Some(err.to_string()))
                        .await;
                }
            }
        }

        match self.executor.execute(caller, &instance, p.action_index, &action, &object).await {
            Ok(ActionOutcome::Completed) => {
                self.emit_action_completed(caller, &instance, p.action_index, &action, true, false, None)
                    .await
            }
            Ok(ActionOutcome::Queued) => {
                debug!(action_key = %action.key, "action queued");
                Ok(())
            }
            Err(err) if err.is_no_targets() => {
                warn!(action_key = %action.key, error = %err, "no targets resolved");
                self.storage
                    .remove_parallel_key(caller.org_id()?, &instance.id, &action.key)
                    .await?;
                self.skip(caller, &instance, p.action_index, &action, "no_targets").await
            }
            Err(err) => {
                warn!(action_key = %action.key, error = %err, "action failed");
                self.emit_action_completed(caller, &instance, p.action_index, &action, false, false, Some(err.to_string()))
                    .await
            }
        }
    }

    async fn skip(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        index: usize,
        action: &WorkflowAction,
        reason: &str,
    ) -> Result<()> {
        debug!(action_key = %action.key, reason, "skipping action");
        self.record(
            caller,
            &instance.id,
            WorkflowEventType::ActionSkipped,
            Some(&action.key),
            json!({ "action_index": index, "reason": reason }),
        )
        .await?;
        self.emit_action_completed(caller, instance, index, action, true, true, None).await
    }

    // ActionCompleted

    async fn on_action_completed(&self, caller: &CallerContext, p: &ActionCompletedPayload) -> Result<()> {
        let Some(instance) = self.load_instance(caller, &p.instance_id).await? else {
            return Ok(());
        };
        if instance.state.is_terminal() {
            debug!(reason = "instance_terminal", "skipping action completion");
            return Ok(());
        }
        let org_id = caller.org_id()?;

        if !p.success {
            self.record(
                caller,
                &instance.id,
                WorkflowEventType::ActionCompleted,
                Some(&p.action_key),
                json!({ "action_index": p.action_index, "success": false, "error": p.error_message }),
            )
            .await?;
            return self.emit_completed(caller, &instance, InstanceState::Failed).await;
        }

        if p.action_type.is_gated() && !p.skipped {
            let rows = self
                .storage
                .update_instance(
                    org_id,
                    &instance.id,
                    StateGuard::In(vec![InstanceState::Running]),
                    InstanceUpdate::new().state(InstanceState::Paused),
                )
                .await?;
            if rows == 1 {
                self.record(
                    caller,
                    &instance.id,
                    WorkflowEventType::InstancePaused,
                    Some(&p.action_key),
                    json!({ "action_index": p.action_index }),
                )
                .await?;
                info!(action_key = %p.action_key, "instance paused for approval");

                // Decisions that arrived before the pause were skipped; replay one
                let decided = self
                    .storage
                    .list_assignments(org_id, &instance.id)
                    .await?
                    .into_iter()
                    .find(|a| {
                        a.approval.action_key == p.action_key
                            && !a.is_change_request()
                            && matches!(a.status, AssignmentStatus::Approved | AssignmentStatus::Rejected)
                    });
                if let Some(a) = decided {
                    debug!(assignment_id = %a.id, "re-evaluating quorum after pause");
                    let replay = AssignmentCompletedPayload {
                        assignment_id: a.id.clone(),
                        instance_id: instance.id.clone(),
                        status: a.status,
                        completed_by: a.actor_user_id.clone(),
                        object_id: instance.object_id.clone(),
                        object_type: instance.object_type.clone(),
                    };
                    return self.on_assignment_completed(caller, &replay).await;
                }
            }
            return Ok(());
        }

        self.record(
            caller,
            &instance.id,
            WorkflowEventType::ActionCompleted,
            Some(&p.action_key),
            json!({ "action_index": p.action_index, "success": true, "skipped": p.skipped }),
        )
        .await?;

        if p.action_type.is_gated() {
            let others_pending = instance
                .context
                .parallel_approval_keys
                .iter()
                .any(|k| *k != p.action_key);
            if others_pending {
                debug!(reason = "parallel_gates_pending", "not advancing");
                return Ok(());
            }
        }

        self.advance(caller, &instance, p.action_index + 1).await
    }

    // AssignmentCreated

    async fn on_assignment_created(&self, p: &AssignmentCreatedPayload) -> Result<()> {
        debug!(assignment_id = %p.assignment_id, target_user_id = %p.target_user_id, "assignment created");
        Ok(())
    }

    // AssignmentCompleted

    async fn on_assignment_completed(&self, caller: &CallerContext, p: &AssignmentCompletedPayload) -> Result<()> {
        let org_id = caller.org_id()?;
        let Some(assignment) = self.storage.get_assignment(org_id, &p.assignment_id).await? else {
            debug!(reason = "assignment_missing", "skipping assignment completion");
            return Ok(());
        };
        if assignment.is_change_request() {
            debug!(reason = "change_request_assignment", "skipping assignment completion");
            return Ok(());
        }
        let Some(instance) = self.load_instance(caller, &p.instance_id).await? else {
            return Ok(());
        };

        if let Err(err) = self.refire_notifications(caller, &instance).await {
            warn!(error = %err, "re-evaluating notifications failed");
        }

        if instance.state != InstanceState::Paused {
            debug!(reason = "instance_not_paused", state = %instance.state, "skipping assignment completion");
            return Ok(());
        }

        let snapshot = &instance.definition_snapshot;
        let Some(action_index) = snapshot.action_index(&assignment.approval.action_key) else {
            warn!(action_key = %assignment.approval.action_key, "assignment does not belong to any action");
            return Ok(());
        };
        let action = snapshot.actions[action_index].clone();

        let mut expected: Vec<usize> = instance
            .context
            .parallel_approval_keys
            .iter()
            .filter_map(|key| snapshot.action_index(key))
            .collect();
        if !expected.contains(&action_index) {
            expected.push(action_index);
        }
        let max_index = expected
            .iter()
            .copied()
            .max()
            .unwrap_or(action_index)
            .max(instance.current_action_index);

        let mut groups: BTreeMap<String, Vec<WorkflowAssignment>> = BTreeMap::new();
        for a in self.storage.list_assignments(org_id, &instance.id).await? {
            if !a.is_change_request() {
                groups.entry(a.approval.action_key.clone()).or_default().push(a);
            }
        }

        let group = groups.get(&action.key).cloned().unwrap_or_default();
        let counts = count_assignment_status(&group);
        let required_count = required_approval_count(&action, &assignment.approval, assignment.required);
        let resolution = resolve_approval(required_count, &counts);
        debug!(
            action_key = %action.key,
            approved = counts.approved,
            pending = counts.pending,
            required_count,
            resolution = ?resolution,
            "quorum evaluated"
        );

        if p.status == AssignmentStatus::ChangesRequested {
            return self
                .request_changes(caller, &instance, &action, &assignment, &group, p.completed_by.as_deref())
                .await;
        }

        match resolution {
            ApprovalResolution::Pending => return Ok(()),
            ApprovalResolution::Failed => {
                let message = failure_message(&counts, required_count, counts.total());
                return self.fail_gate(caller, &instance, &action.key, &counts, required_count, message).await;
            }
            ApprovalResolution::Satisfied => {}
        }

        let mut resolved = Vec::with_capacity(expected.len());
        for &index in &expected {
            let gate = &snapshot.actions[index];
            let members = groups.get(&gate.key).cloned().unwrap_or_default();
            let Some(first) = members.first() else {
                debug!(action_key = %gate.key, reason = "gate_not_started", "waiting for parallel gate");
                return Ok(());
            };
            let gate_counts = count_assignment_status(&members);
            let gate_required = required_approval_count(gate, &first.approval, first.required);
            resolved.push(GroupResolution {
                action_key: gate.key.clone(),
                resolution: resolve_approval(gate_required, &gate_counts),
                counts: gate_counts,
                required_count: gate_required,
            });
        }

        if let Some(failed) = resolved.iter().find(|g| g.resolution == ApprovalResolution::Failed) {
            let message = failure_message(&failed.counts, failed.required_count, failed.counts.total());
            return self
                .fail_gate(caller, &instance, &failed.action_key, &failed.counts, failed.required_count, message)
                .await;
        }
        if resolved.iter().any(|g| g.resolution == ApprovalResolution::Pending) {
            debug!(reason = "parallel_gates_pending", "waiting for remaining gates");
            return Ok(());
        }

        if let Some(proposal_id) = &instance.proposal_id {
            if let Err(err) = self.proposals.apply(&caller.with_bypass(), proposal_id).await {
                warn!(proposal_id = %proposal_id, error = %err, "applying proposal failed");
                self.record(
                    caller,
                    &instance.id,
                    WorkflowEventType::ActionCompleted,
                    Some(&action.key),
                    json!({ "satisfied": true, "success": false, "error": err.to_string() }),
                )
                .await?;
                return self.emit_completed(caller, &instance, InstanceState::Failed).await;
            }
        }

        let next = max_index + 1;
        let rows = self
            .storage
            .update_instance(
                org_id,
                &instance.id,
                StateGuard::In(vec![InstanceState::Paused]),
                InstanceUpdate::new()
                    .state(InstanceState::Running)
                    .action_index(next)
                    .clear_parallel_keys(),
            )
            .await?;
        if rows == 0 {
            debug!(reason = "resume_lost_race", "instance already resumed");
            return Ok(());
        }

        for gate in &resolved {
            self.record(
                caller,
                &instance.id,
                WorkflowEventType::ActionCompleted,
                Some(&gate.action_key),
                json!({
                    "satisfied": true,
                    "approved": gate.counts.approved,
                    "pending": gate.counts.pending,
                    "rejected": gate.counts.rejected,
                    "required_count": gate.required_count,
                }),
            )
            .await?;
        }
        self.record(
            caller,
            &instance.id,
            WorkflowEventType::InstanceResumed,
            Some(&action.key),
            json!({ "next_action_index": next }),
        )
        .await?;
        info!(next_action_index = next, "approval quorum reached, resuming");

        self.advance(caller, &instance, next).await
    }

    /// Fail the instance for a lost quorum; only the handler that wins the CAS records it
    async fn fail_gate(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        action_key: &str,
        counts: &AssignmentStatusCounts,
        required_count: usize,
        message: String,
    ) -> Result<()> {
        let rows = self
            .storage
            .update_instance(
                caller.org_id()?,
                &instance.id,
                StateGuard::In(vec![InstanceState::Paused]),
                InstanceUpdate::new().state(InstanceState::Failed),
            )
            .await?;
        if rows == 0 {
            debug!(action_key, reason = "already_resolved", "skipping approval failure");
            return Ok(());
        }

        info!(action_key, message = %message, "approval failed");
        self.record(
            caller,
            &instance.id,
            WorkflowEventType::ActionCompleted,
            Some(action_key),
            json!({
                "satisfied": false,
                "approved": counts.approved,
                "pending": counts.pending,
                "rejected": counts.rejected,
                "changes_requested": counts.changes_requested,
                "required_count": required_count,
                "error": message,
            }),
        )
        .await?;
        self.finish(caller, &instance.id, InstanceState::Failed).await?;
        self.emit_completed(caller, instance, InstanceState::Failed).await
    }

    /// Route a "changes requested" decision back to the requester
    async fn request_changes(
        &self,
        caller: &CallerContext,
        instance: &WorkflowInstance,
        action: &WorkflowAction,
        source: &WorkflowAssignment,
        group: &[WorkflowAssignment],
        requested_by: Option<&str>,
    ) -> Result<()> {
        let org_id = caller.org_id()?;
        let mut change_request_id = None;

        match instance.context.trigger_user_id.as_deref() {
            Some(requester) => {
                let key = format!("{}{}_{}", CHANGE_REQUEST_PREFIX, action.key, requester);
                let meta = ApprovalMetadata {
                    action_key: action.key.clone(),
                    required: false,
                    required_count: 0,
                    label: Some("Changes requested".to_string()),
                    proposed_hash: source.approval.proposed_hash.clone(),
                    approved_at: None,
                    approved_by: None,
                };
                let fields = action.approval_params().map(|p| p.fields).unwrap_or_default();
                let mut candidate = WorkflowAssignment::new(org_id, &instance.id, key.clone(), REQUESTER_ROLE, meta);
                candidate.required = false;
                candidate.label = Some("Changes requested".to_string());
                candidate.notes = source.notes.clone();
                candidate.metadata = json!({
                    "fields": fields,
                    "requested_by": requested_by,
                    "source_assignment_id": source.id,
                });

                let (request, created) = match self.storage.create_assignment(candidate).await {
                    Ok(created) => (created, true),
                    Err(WorkflowError::UniqueViolation(_)) => {
                        let mut existing = self
                            .storage
                            .find_assignment_by_key(org_id, &instance.id, &key)
                            .await?
                            .ok_or_else(|| WorkflowError::NotFound(format!("workflow assignment {}", key)))?;
                        existing.status = AssignmentStatus::Pending;
                        existing.notes = source.notes.clone();
                        existing.actor_user_id = None;
                        existing.decided_at = None;
                        existing.updated_at = Utc::now();
                        self.storage.update_assignment(&existing, None).await?;
                        (existing, false)
                    }
                    Err(err) => return Err(err),
                };

                match self
                    .storage
                    .create_assignment_target(AssignmentTarget::new(org_id, &request.id, TargetType::User, requester))
                    .await
                {
                    Ok(()) | Err(WorkflowError::UniqueViolation(_)) => {}
                    Err(err) => return Err(err),
                }

                if created {
                    self.emitter
                        .emit(
                            caller,
                            EngineEvent::AssignmentCreated(AssignmentCreatedPayload {
                                assignment_id: request.id.clone(),
                                instance_id: instance.id.clone(),
                                target_user_id: requester.to_string(),
                                action_type: action.action_type,
                                object_id: instance.object_id.clone(),
                                object_type: instance.object_type.clone(),
                            }),
                        )
                        .await?;
                }
                change_request_id = Some(request.id);
            }
            None => warn!(action_key = %action.key, "no requester recorded, change request not assigned"),
        }

        let now = Utc::now();
        for other in group.iter().filter(|a| a.status == AssignmentStatus::Pending && a.id != source.id) {
            let mut closed = other.clone();
            closed.status = AssignmentStatus::Rejected;
            closed.decided_at = Some(now);
            closed.updated_at = now;
            closed.rejection = Some(RejectionMetadata {
                action_key: action.key.clone(),
                reason: "changes requested".to_string(),
                rejected_at: now,
                rejected_by: requested_by.map(str::to_string),
            });
            self.storage.update_assignment(&closed, Some(AssignmentStatus::Pending)).await?;
        }

        self.record(
            caller,
            &instance.id,
            WorkflowEventType::ActionCompleted,
            Some(&action.key),
            json!({
                "satisfied": false,
                "changes_requested": true,
                "requested_by": requested_by,
                "change_request_assignment_id": change_request_id,
            }),
        )
        .await?;
        info!(action_key = %action.key, "changes requested");
        Ok(())
    }

    /// Fire notification actions whose `when` became true since the last decision
    async fn refire_notifications(&self, caller: &CallerContext, instance: &WorkflowInstance) -> Result<usize> {
        let pending: Vec<(usize, &WorkflowAction)> = instance
            .definition_snapshot
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.action_type == ActionType::Notify && a.when.is_some())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let object = self.load_object(caller, instance).await?;
        let vars = self.executor.action_vars(caller, instance, &object).await?;
        let mut fired = 0;
        for (index, action) in pending {
            let expression = action.when.as_deref().unwrap_or("false");
            match self.evaluator.evaluate_bool(expression, &vars) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(action_key = %action.key, error = %err, "notification condition failed");
                    continue;
                }
            }
            if !self.claim_notification(caller, instance, index, action).await? {
                continue;
            }
            if let ActionParams::Notify(params) = action.params()? {
                self.executor.notify(caller, instance, action, &params, &object, &vars).await?;
                fired += 1;
            }
        }
        Ok(fired)
    }

    // InstanceCompleted

    async fn on_instance_completed(&self, caller: &CallerContext, p: &InstanceCompletedPayload) -> Result<()> {
        let org_id = caller.org_id()?;
        let rows = self
            .storage
            .update_instance(org_id, &p.instance_id, StateGuard::non_terminal(), InstanceUpdate::new().state(p.state))
            .await?;
        if rows == 0 {
            debug!(reason = "already_terminal", "skipping completion");
            return Ok(());
        }
        self.finish(caller, &p.instance_id, p.state).await
    }

    /// Close the proposal of a failed instance and record the terminal state
    async fn finish(&self, caller: &CallerContext, instance_id: &str, state: InstanceState) -> Result<()> {
        let org_id = caller.org_id()?;
        if state == InstanceState::Failed {
            if let Some(instance) = self.storage.get_instance(org_id, instance_id).await? {
                if let Some(proposal_id) = &instance.proposal_id {
                    self.storage
                        .transition_proposal(
                            org_id,
                            proposal_id,
                            &ProposalState::non_terminal(),
                            ProposalState::Rejected,
                            caller.user_id_opt(),
                        )
                        .await?;
                }
            }
        }

        self.record(
            caller,
            instance_id,
            WorkflowEventType::WorkflowCompleted,
            None,
            json!({ "state": state }),
        )
        .await?;
        info!(state = %state, "workflow instance finished");
        Ok(())
    }

    // IntegrationRequested

    async fn on_integration_requested(&self, caller: &CallerContext, p: &IntegrationRequestedPayload) -> Result<()> {
        let Some(instance) = self.load_instance(caller, &p.instance_id).await? else {
            return Ok(());
        };
        if instance.state.is_terminal() {
            debug!(reason = "instance_terminal", "skipping integration");
            return Ok(());
        }
        let Some(action) = instance.definition_snapshot.actions.get(p.action_index).cloned() else {
            return self.emit_completed(caller, &instance, InstanceState::Failed).await;
        };
        let timeout = match action.params() {
            Ok(ActionParams::Integration(params)) => params.timeout_secs.map(Duration::from_secs),
            _ => None,
        };

        let run = self.integrations.run(caller, &p.run_id, timeout).await?;
        let success = run.status == IntegrationRunStatus::Succeeded;
        self.emit_action_completed(caller, &instance, p.action_index, &action, success, false, run.error.clone())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{InMemoryStorage, InstanceBundle};
    use crate::models::{DefinitionDocument, InstanceContext, ObjectRef};

    #[tokio::test]
    async fn test_instance_completed_is_written_once() {
        let storage = Arc::new(InMemoryStorage::new());
        let object = WorkflowObject::new("Policy", serde_json::Map::new()).with_id("pol-1");
        let instance = WorkflowInstance::new(
            "org-1",
            "def-1",
            "pol-1",
            "Policy",
            DefinitionDocument::default(),
            InstanceContext::default(),
        );
        let (instance, _) = storage
            .create_instance_bundle(InstanceBundle {
                object_ref: ObjectRef::new("org-1", &instance.id, &object),
                instance,
                proposal: None,
            })
            .await
            .unwrap();

        let guard = StateGuard::non_terminal();
        let first = storage
            .update_instance("org-1", &instance.id, guard.clone(), InstanceUpdate::new().state(InstanceState::Completed))
            .await
            .unwrap();
        let second = storage
            .update_instance("org-1", &instance.id, guard, InstanceUpdate::new().state(InstanceState::Failed))
            .await
            .unwrap();
        assert_eq!((first, second), (1, 0));
        let stored = storage.get_instance("org-1", &instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Completed);
    }

    #[tokio::test]
    async fn test_emit_started_past_last_action_is_invalid_state() {
        let engine = crate::engine::WorkflowEngine::in_memory(crate::EngineConfig::default()).unwrap();
        let listeners = engine.listeners();
        let instance = WorkflowInstance::new(
            "org-1",
            "def-1",
            "pol-1",
            "Policy",
            DefinitionDocument::default(),
            InstanceContext::default(),
        );

        let err = listeners
            .emit_started(&CallerContext::system("org-1"), &instance, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));
    }
}
