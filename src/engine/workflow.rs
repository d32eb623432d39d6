// Workflow engine facade
// Entry points for mutations, decisions, proposals and maintenance

//! # Workflow Engine
//!
//! [`WorkflowEngine`] wires the components together and exposes the operations
//! a host application calls:
//!
//! - [`WorkflowEngine::process_mutation`]: stage gated changes, apply the rest,
//!   start every matching workflow
//! - [`WorkflowEngine::complete_assignment`]: record an approver's decision
//! - [`WorkflowEngine::submit_proposal`] / [`WorkflowEngine::update_proposal_changes`]
//! - [`WorkflowEngine::cancel_instance`] and [`WorkflowEngine::reconcile`]
//!
//! Events are dispatched either by a background task ([`WorkflowEngine::run`])
//! or deterministically with [`WorkflowEngine::process_pending`], which drains a
//! receiver and handles each envelope in order.
//!
//! ## Rust Learning Notes:
//!
//! ### Builder Pattern
//! [`WorkflowEngineBuilder`] collects optional collaborators (storage,
//! directory, resolvers, channel senders, integration operators, publisher)
//! and fills in in-memory defaults in `build()`.
//!
//! ### `Arc<Self>` Receivers
//! `run(self: Arc<Self>, ...)` lets the spawned dispatch loop own a reference
//! to the engine without borrowing from the caller.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::builder::InstanceBuilder;
use super::emit::{Emitter, ReconcileReport, Reconciler};
use super::events::{AssignmentCompletedPayload, EngineEvent, EventBus, EventEnvelope, EventPublisher, TriggeredPayload};
use super::executor::ActionExecutor;
use super::expression::{ExpressionEvaluator, ExpressionVars};
use super::integrations::{IntegrationOperator, IntegrationRegistry, IntegrationRunner};
use super::listeners::WorkflowListeners;
use super::matcher::{MutationInput, TriggerMatcher};
use super::notifications::{ChannelSender, NotificationDispatcher};
use super::proposals::{ProposalManager, ProposalUpdate};
use super::resolver::{Directory, InMemoryDirectory, ResolverFn, TargetResolver};
use super::storage::{InMemoryStorage, InstanceFilter, InstanceUpdate, StateGuard, WorkflowStorage};
use super::validation::validate_definition;
use super::webhook::WebhookDispatcher;
use crate::config::EngineConfig;
use crate::context::CallerContext;
use crate::models::{
    AssignmentStatus, Channel, DomainObject, InstanceState, RejectionMetadata, SubmissionMode,
    WorkflowAssignment, WorkflowDefinition, WorkflowEventRecord, WorkflowEventType, WorkflowInstance,
    WorkflowObject, WorkflowProposal,
};
use crate::{Result, WorkflowError};

/// What `process_mutation` did with a mutation
#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    /// Changes written to the live object
    pub applied: Map<String, Value>,
    /// Changes withheld until approval
    pub staged: Map<String, Value>,
    /// Instances started by the mutation
    pub instances: Vec<WorkflowInstance>,
    /// Active proposals that absorbed staged changes
    pub proposals: Vec<WorkflowProposal>,
}

/// Collects collaborators for a [`WorkflowEngine`]
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn WorkflowStorage>>,
    directory: Option<Arc<dyn Directory>>,
    resolvers: Vec<(String, ResolverFn)>,
    senders: Vec<(Channel, Arc<dyn ChannelSender>)>,
    integrations: IntegrationRegistry,
    bus: Option<EventBus>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl WorkflowEngineBuilder {
    pub fn storage(mut self, storage: Arc<dyn WorkflowStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn resolver(mut self, key: impl Into<String>, resolver: ResolverFn) -> Self {
        self.resolvers.push((key.into(), resolver));
        self
    }

    pub fn channel_sender(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.push((channel, sender));
        self
    }

    pub fn integration(
        mut self,
        provider: impl Into<String>,
        operation: impl Into<String>,
        operator: Arc<dyn IntegrationOperator>,
    ) -> Self {
        self.integrations.register(provider, operation, operator);
        self
    }

    /// Bus the engine subscribes to
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Publisher used for every emission; defaults to the event bus
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        let config = self.config;
        config.validate()?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()) as Arc<dyn WorkflowStorage>);
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()) as Arc<dyn Directory>);
        let bus = self.bus.unwrap_or_else(|| EventBus::new(config.event_bus.capacity));
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(bus.clone()) as Arc<dyn EventPublisher>);

        let evaluator = Arc::new(ExpressionEvaluator::new(config.expression.clone()));

        let mut resolver = TargetResolver::with_builtin_resolvers(directory);
        for (key, function) in self.resolvers {
            resolver.register_resolver(key, function);
        }

        let mut notifications = NotificationDispatcher::new(storage.clone(), evaluator.clone());
        for (channel, sender) in self.senders {
            notifications.register_sender(channel, sender);
        }

        let emitter = Arc::new(Emitter::new(publisher.clone(), storage.clone()));
        let executor = Arc::new(ActionExecutor::new(
            storage.clone(),
            evaluator.clone(),
            Arc::new(resolver),
            Arc::new(notifications),
            WebhookDispatcher::new(config.webhook.clone()),
            emitter.clone(),
        ));
        let proposals = Arc::new(ProposalManager::new(storage.clone()));
        let runner = Arc::new(IntegrationRunner::new(
            storage.clone(),
            self.integrations,
            config.integration_timeout(),
        ));
        let listeners = Arc::new(WorkflowListeners::new(
            storage.clone(),
            evaluator.clone(),
            executor,
            proposals.clone(),
            runner,
            emitter.clone(),
        ));
        let reconciler = Reconciler::new(publisher, storage.clone(), config.reconcile.max_attempts);

        Ok(WorkflowEngine {
            matcher: TriggerMatcher::new(storage.clone(), evaluator.clone()),
            builder: InstanceBuilder::new(storage.clone()),
            config,
            storage,
            evaluator,
            bus,
            emitter,
            proposals,
            listeners,
            reconciler,
        })
    }
}

/// The workflow engine
pub struct WorkflowEngine {
    config: EngineConfig,
    storage: Arc<dyn WorkflowStorage>,
    evaluator: Arc<ExpressionEvaluator>,
    bus: EventBus,
    emitter: Arc<Emitter>,
    matcher: TriggerMatcher,
    builder: InstanceBuilder,
    proposals: Arc<ProposalManager>,
    listeners: Arc<WorkflowListeners>,
    reconciler: Reconciler,
}

impl WorkflowEngine {
    pub fn builder(config: EngineConfig) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config,
            storage: None,
            directory: None,
            resolvers: Vec::new(),
            senders: Vec::new(),
            integrations: IntegrationRegistry::new(),
            bus: None,
            publisher: None,
        }
    }

    /// Engine backed entirely by in-memory collaborators
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn WorkflowStorage> {
        self.storage.clone()
    }

    pub fn evaluator(&self) -> Arc<ExpressionEvaluator> {
        self.evaluator.clone()
    }

    pub fn listeners(&self) -> Arc<WorkflowListeners> {
        self.listeners.clone()
    }

    /// New receiver for engine events; subscribe before emitting anything
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    /// Validate and store a definition for the caller's organization
    pub async fn create_definition(
        &self,
        caller: &CallerContext,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        definition.org_id = caller.org_id()?.to_string();
        validate_definition(&definition, &self.evaluator)?;
        definition.derive_trigger_prefilter();
        let definition = self.storage.create_definition(definition).await?;
        info!(definition_id = %definition.id, name = %definition.name, "workflow definition created");
        Ok(definition)
    }

    /// Handle a mutation on a domain object
    ///
    /// Fields gated by a matching pre-commit approval are staged on a proposal
    /// instead of being written. Everything else is applied immediately, then
    /// each matching definition is triggered. A definition blocked by an
    /// active instance or its cooldown is logged and skipped.
    pub async fn process_mutation(
        &self,
        caller: &CallerContext,
        object: WorkflowObject,
        mut input: MutationInput,
    ) -> Result<MutationOutcome> {
        let org_id = caller.org_id()?;
        if input.user_id.is_none() {
            input.user_id = caller.user_id_opt().map(str::to_string);
        }

        if self.storage.get_object(org_id, &object.object_type, &object.id).await?.is_none() {
            self.storage.put_object(org_id, object.clone()).await?;
        }

        let definitions = self.matcher.find_matching_definitions(caller, &object, &input).await?;
        let gated = self.gated_fields(caller, &definitions, &input);

        let mut outcome = MutationOutcome::default();
        for (field, value) in &input.proposed_changes {
            if gated.iter().any(|g| g == field) {
                outcome.staged.insert(field.clone(), value.clone());
            } else {
                outcome.applied.insert(field.clone(), value.clone());
            }
        }

        let live = if outcome.applied.is_empty() {
            object
        } else {
            self.storage
                .update_object(org_id, &object.object_type, &object.id, &outcome.applied)
                .await?
        };

        for definition in &definitions {
            match self.trigger_workflow(caller, definition, &live, &input).await {
                Ok(Some(instance)) => outcome.instances.push(instance),
                Ok(None) => {}
                Err(WorkflowError::WorkflowAlreadyActive(reason)) => {
                    warn!(definition_id = %definition.id, reason = %reason, "workflow not started");
                    if let Some(proposal) = self.merge_into_active_proposal(caller, definition, &live, &input).await? {
                        outcome.proposals.push(proposal);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        debug!(
            object_id = %live.id,
            applied = outcome.applied.len(),
            staged = outcome.staged.len(),
            instances = outcome.instances.len(),
            "mutation processed"
        );
        Ok(outcome)
    }

    /// Fold staged changes into the proposal already open for their domain
    ///
    /// Goes through [`ProposalManager::update_changes`] so approvals of the
    /// previous content are invalidated.
    async fn merge_into_active_proposal(
        &self,
        caller: &CallerContext,
        definition: &WorkflowDefinition,
        object: &WorkflowObject,
        input: &MutationInput,
    ) -> Result<Option<WorkflowProposal>> {
        if caller.is_bypass() {
            return Ok(None);
        }
        let Some(plan) = InstanceBuilder::plan_proposal(&definition.document, input) else {
            return Ok(None);
        };
        let org_id = caller.org_id()?;
        let Some(active) = self.storage.find_active_proposal(org_id, &object.id, &plan.domain_key).await? else {
            return Ok(None);
        };

        let mut merged = active.changes.clone();
        merged.extend(plan.changes);
        if merged == active.changes {
            debug!(proposal_id = %active.id, reason = "unchanged", "staged changes already proposed");
            return Ok(None);
        }

        let update = self.proposals.update_changes(caller, &active.id, merged).await?;
        info!(
            proposal_id = %update.proposal.id,
            domain_key = %plan.domain_key,
            invalidated = update.invalidated.len(),
            "staged changes merged into active proposal"
        );
        Ok(Some(update.proposal))
    }

    fn gated_fields(&self, caller: &CallerContext, definitions: &[WorkflowDefinition], input: &MutationInput) -> Vec<String> {
        if caller.is_bypass() {
            return Vec::new();
        }
        let mut gated = Vec::new();
        for definition in definitions {
            let document = &definition.document;
            if document.uses_post_commit() || !document.has_approval_action() {
                continue;
            }
            let fields = document.approval_fields();
            if fields.is_empty() {
                gated.extend(input.proposed_changes.keys().cloned());
            } else {
                gated.extend(fields);
            }
        }
        gated.sort();
        gated.dedup();
        gated
    }

    /// Start one definition against an object
    ///
    /// Returns `None` when the definition's conditions do not hold.
    pub async fn trigger_workflow(
        &self,
        caller: &CallerContext,
        definition: &WorkflowDefinition,
        object: &WorkflowObject,
        input: &MutationInput,
    ) -> Result<Option<WorkflowInstance>> {
        let org_id = caller.org_id()?;
        let mut context = input.to_context();
        if context.trigger_user_id.is_none() {
            context.trigger_user_id = caller.user_id_opt().map(str::to_string);
        }

        let vars = ExpressionVars::from_context(object.to_value(), &context);
        if !self.matcher.evaluate_conditions(&definition.document, &vars)? {
            debug!(definition_id = %definition.id, reason = "conditions_false", "workflow not started");
            return Ok(None);
        }

        let plan = InstanceBuilder::plan_proposal(&definition.document, input);

        let active = match &plan {
            Some(plan) => InstanceFilter {
                object_id: Some(object.id.clone()),
                domain_key: Some(plan.domain_key.clone()),
                states: InstanceState::active().to_vec(),
                ..Default::default()
            },
            None => InstanceFilter {
                object_id: Some(object.id.clone()),
                definition_id: Some(definition.id.clone()),
                states: InstanceState::active().to_vec(),
                ..Default::default()
            },
        };
        if !self.storage.list_instances(org_id, &active).await?.is_empty() {
            return Err(WorkflowError::WorkflowAlreadyActive(format!(
                "definition {} already has an active instance for {}",
                definition.id, object.id
            )));
        }

        if let Some(seconds) = definition.cooldown_seconds.filter(|s| *s > 0) {
            let recent = InstanceFilter {
                object_id: Some(object.id.clone()),
                definition_id: Some(definition.id.clone()),
                created_after: Some(Utc::now() - ChronoDuration::seconds(seconds)),
                ..Default::default()
            };
            if !self.storage.list_instances(org_id, &recent).await?.is_empty() {
                return Err(WorkflowError::WorkflowAlreadyActive(format!(
                    "definition {} is cooling down for {}",
                    definition.id, object.id
                )));
            }
        }

        let (instance, proposal) = self.builder.build(caller, definition, object, context, plan).await?;

        let manual = definition.document.approval_submission_mode == SubmissionMode::ManualSubmit;
        if manual && proposal.is_some() {
            info!(instance_id = %instance.id, "waiting for proposal submission");
        } else {
            self.emit_triggered(caller, &instance).await?;
        }
        Ok(Some(instance))
    }

    async fn emit_triggered(&self, caller: &CallerContext, instance: &WorkflowInstance) -> Result<bool> {
        self.emitter
            .emit(
                caller,
                EngineEvent::Triggered(TriggeredPayload {
                    instance_id: instance.id.clone(),
                    definition_id: instance.definition_id.clone(),
                    object_id: instance.object_id.clone(),
                    object_type: instance.object_type.clone(),
                    trigger_event_type: instance.context.event_type.clone(),
                    trigger_changed_fields: instance.context.changed_fields.clone(),
                }),
            )
            .await
    }

    /// Restart a non-terminal instance from its first action with a new context
    pub async fn trigger_existing_instance(
        &self,
        caller: &CallerContext,
        instance_id: &str,
        input: &MutationInput,
    ) -> Result<WorkflowInstance> {
        let org_id = caller.org_id()?;
        let instance = self.get_instance(caller, instance_id).await?;
        if instance.state.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "workflow instance {} is {}",
                instance.id, instance.state
            )));
        }

        let mut context = input.to_context();
        context.version = instance.context.version + 1;
        context.fired_notifications = instance.context.fired_notifications.clone();
        if context.trigger_user_id.is_none() {
            context.trigger_user_id = caller.user_id_opt().map(str::to_string);
        }

        let rows = self
            .storage
            .update_instance(
                org_id,
                &instance.id,
                StateGuard::non_terminal(),
                InstanceUpdate::new()
                    .state(InstanceState::Running)
                    .action_index(0)
                    .context(context)
                    .clear_parallel_keys(),
            )
            .await?;
        if rows == 0 {
            return Err(WorkflowError::InvalidState(format!(
                "workflow instance {} finished while restarting",
                instance.id
            )));
        }

        let instance = self.get_instance(caller, instance_id).await?;
        info!(instance_id = %instance.id, version = instance.context.version, "workflow instance re-triggered");
        self.emit_triggered(caller, &instance).await?;
        Ok(instance)
    }

    /// Record a decision on an assignment
    pub async fn complete_assignment(
        &self,
        caller: &CallerContext,
        assignment_id: &str,
        status: AssignmentStatus,
        reason: Option<String>,
    ) -> Result<WorkflowAssignment> {
        let org_id = caller.org_id()?;
        let user_id = caller.user_id()?.to_string();
        if status == AssignmentStatus::Pending {
            return Err(WorkflowError::InvalidState("an assignment cannot be completed as pending".to_string()));
        }

        let mut assignment = self
            .storage
            .get_assignment(org_id, assignment_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow assignment {}", assignment_id)))?;
        if assignment.status != AssignmentStatus::Pending {
            return Err(WorkflowError::InvalidState(format!(
                "workflow assignment {} is already {}",
                assignment.id,
                assignment.status.as_str()
            )));
        }
        let instance = self.get_instance(caller, &assignment.instance_id).await?;

        let now = Utc::now();
        match status {
            AssignmentStatus::Approved => {
                if let Some(proposal_id) = &instance.proposal_id {
                    if let Some(proposal) = self.storage.get_proposal(org_id, proposal_id).await? {
                        assignment.approval.proposed_hash = Some(proposal.proposed_hash);
                    }
                }
                assignment.approval.approved_at = Some(now);
                assignment.approval.approved_by = Some(user_id.clone());
            }
            AssignmentStatus::Rejected => {
                assignment.rejection = Some(RejectionMetadata {
                    action_key: assignment.approval.action_key.clone(),
                    reason: reason.clone().unwrap_or_else(|| "rejected".to_string()),
                    rejected_at: now,
                    rejected_by: Some(user_id.clone()),
                });
            }
            _ => {}
        }
        assignment.status = status;
        assignment.actor_user_id = Some(user_id.clone());
        assignment.decided_at = Some(now);
        assignment.updated_at = now;
        if reason.is_some() {
            assignment.notes = reason;
        }

        if self.storage.update_assignment(&assignment, Some(AssignmentStatus::Pending)).await? == 0 {
            return Err(WorkflowError::InvalidState(format!(
                "workflow assignment {} was decided concurrently",
                assignment.id
            )));
        }

        self.storage
            .record_event(WorkflowEventRecord::new(
                org_id,
                &instance.id,
                WorkflowEventType::AssignmentCompleted,
                Some(&assignment.approval.action_key),
                json!({
                    "assignment_id": assignment.id,
                    "status": assignment.status,
                    "actor_user_id": user_id,
                }),
            ))
            .await?;

        self.emitter
            .emit(
                caller,
                EngineEvent::AssignmentCompleted(AssignmentCompletedPayload {
                    assignment_id: assignment.id.clone(),
                    instance_id: instance.id.clone(),
                    status,
                    completed_by: Some(user_id),
                    object_id: instance.object_id.clone(),
                    object_type: instance.object_type.clone(),
                }),
            )
            .await?;
        Ok(assignment)
    }

    /// Submit a draft proposal and start the instances waiting on it
    pub async fn submit_proposal(&self, caller: &CallerContext, proposal_id: &str) -> Result<WorkflowProposal> {
        let org_id = caller.org_id()?;
        if !self.proposals.submit(caller, proposal_id).await? {
            return Err(WorkflowError::InvalidState(format!(
                "workflow proposal {} is not a draft",
                proposal_id
            )));
        }

        let waiting = InstanceFilter {
            proposal_id: Some(proposal_id.to_string()),
            states: vec![InstanceState::Running],
            ..Default::default()
        };
        for instance in self.storage.list_instances(org_id, &waiting).await? {
            self.emit_triggered(caller, &instance).await?;
        }
        info!(proposal_id, "proposal submitted");
        self.proposals.get(caller, proposal_id).await
    }

    /// Edit a proposal's changes, invalidating approvals of the old content
    pub async fn update_proposal_changes(
        &self,
        caller: &CallerContext,
        proposal_id: &str,
        changes: Map<String, Value>,
    ) -> Result<ProposalUpdate> {
        self.proposals.update_changes(caller, proposal_id, changes).await
    }

    /// Fail a running or paused instance and supersede its proposal
    pub async fn cancel_instance(&self, caller: &CallerContext, instance_id: &str) -> Result<bool> {
        let org_id = caller.org_id()?;
        let instance = self.get_instance(caller, instance_id).await?;
        let rows = self
            .storage
            .update_instance(
                org_id,
                &instance.id,
                StateGuard::non_terminal(),
                InstanceUpdate::new().state(InstanceState::Failed),
            )
            .await?;
        if rows == 0 {
            debug!(instance_id, reason = "already_terminal", "nothing to cancel");
            return Ok(false);
        }

        if let Some(proposal_id) = &instance.proposal_id {
            self.proposals.supersede(caller, proposal_id).await?;
        }
        self.storage
            .record_event(WorkflowEventRecord::new(
                org_id,
                &instance.id,
                WorkflowEventType::WorkflowCompleted,
                None,
                json!({ "state": InstanceState::Failed, "cancelled_by": caller.user_id_opt() }),
            ))
            .await?;
        info!(instance_id, "workflow instance cancelled");
        Ok(true)
    }

    /// Republish failed emissions
    pub async fn reconcile(&self, caller: &CallerContext) -> Result<ReconcileReport> {
        self.reconciler.reconcile(caller).await
    }

    pub async fn get_instance(&self, caller: &CallerContext, instance_id: &str) -> Result<WorkflowInstance> {
        self.storage
            .get_instance(caller.org_id()?, instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow instance {}", instance_id)))
    }

    /// Handle every event currently queued on `rx`, including follow-ups
    ///
    /// Handler errors are logged and do not stop the drain. Returns the number
    /// of envelopes handled.
    pub async fn process_pending(&self, rx: &mut broadcast::Receiver<EventEnvelope>) -> Result<usize> {
        let mut handled = 0;
        loop {
            match rx.try_recv() {
                Ok(envelope) => {
                    if let Err(err) = self.listeners.handle(&envelope).await {
                        warn!(topic = envelope.event.topic(), error = %err, "event handler failed");
                    }
                    handled += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(handled)
    }

    /// Spawn the dispatch loop; each envelope is handled on its own task
    pub fn run(self: Arc<Self>, mut rx: broadcast::Receiver<EventEnvelope>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        let listeners = self.listeners.clone();
                        tokio::spawn(async move {
                            if let Err(err) = listeners.handle(&envelope).await {
                                error!(topic = envelope.event.topic(), error = %err, "event handler failed");
                            }
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("event bus closed, stopping dispatch loop");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::integrations::IntegrationCall;
    use crate::engine::proposals::INVALIDATION_REASON;
    use crate::models::{
        ActionType, ApprovalTiming, ProposalState, WorkflowAction, WorkflowTrigger,
        REQUESTER_ROLE,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn changes(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn create_test_directory() -> Arc<InMemoryDirectory> {
        let directory = InMemoryDirectory::new();
        directory.add_group_member("org-1", "legal", "bob").unwrap();
        directory.add_group_member("org-1", "legal", "carol").unwrap();
        Arc::new(directory)
    }

    fn create_test_engine() -> (WorkflowEngine, broadcast::Receiver<EventEnvelope>) {
        let engine = WorkflowEngine::builder(EngineConfig::default())
            .directory(create_test_directory())
            .build()
            .unwrap();
        let rx = engine.subscribe();
        (engine, rx)
    }

    fn create_test_object() -> WorkflowObject {
        WorkflowObject::new("Policy", changes(json!({ "status": "draft", "name": "Access" }))).with_id("pol-1")
    }

    fn approval_definition(params: Value) -> WorkflowDefinition {
        WorkflowDefinition::new("org-1", "Status approval", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE").with_fields(&["status"]))
            .with_action(WorkflowAction::new("approve", ActionType::RequestApproval, params))
            .with_action(WorkflowAction::new(
                "stamp",
                ActionType::UpdateField,
                json!({ "updates": { "reviewed": true } }),
            ))
    }

    fn legal_approval(required_count: Option<i64>) -> Value {
        json!({
            "targets": [{ "type": "GROUP", "id": "legal" }],
            "fields": ["status"],
            "required_count": required_count,
        })
    }

    fn status_change(status: &str) -> MutationInput {
        MutationInput::new("UPDATE")
            .with_changes(changes(json!({ "status": status })))
            .with_user("alice")
    }

    async fn start(
        engine: &WorkflowEngine,
        rx: &mut broadcast::Receiver<EventEnvelope>,
        definition: WorkflowDefinition,
        input: MutationInput,
    ) -> WorkflowInstance {
        let alice = CallerContext::new("org-1", "alice");
        engine.create_definition(&alice, definition).await.unwrap();
        let outcome = engine.process_mutation(&alice, create_test_object(), input).await.unwrap();
        assert_eq!(outcome.instances.len(), 1);
        engine.process_pending(rx).await.unwrap();
        outcome.instances[0].clone()
    }

    async fn assignment_for(engine: &WorkflowEngine, instance: &WorkflowInstance, user: &str) -> WorkflowAssignment {
        let key = format!("approval_approve_{}", user);
        engine
            .storage()
            .find_assignment_by_key("org-1", &instance.id, &key)
            .await
            .unwrap()
            .unwrap()
    }

    async fn decide(engine: &WorkflowEngine, instance: &WorkflowInstance, user: &str, status: AssignmentStatus) {
        let assignment = assignment_for(engine, instance, user).await;
        engine
            .complete_assignment(&CallerContext::new("org-1", user), &assignment.id, status, None)
            .await
            .unwrap();
    }

    async fn events_of(engine: &WorkflowEngine, instance: &WorkflowInstance, kind: WorkflowEventType) -> Vec<WorkflowEventRecord> {
        engine.storage().list_events("org-1", Some(&instance.id), &[kind]).await.unwrap()
    }

    async fn reload(engine: &WorkflowEngine, instance: &WorkflowInstance) -> WorkflowInstance {
        engine
            .get_instance(&CallerContext::system("org-1"), &instance.id)
            .await
            .unwrap()
    }

    async fn live_object(engine: &WorkflowEngine) -> WorkflowObject {
        engine.storage().get_object("org-1", "Policy", "pol-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_pre_commit_stages_gated_fields() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;

        let instance = reload(&engine, &instance).await;
        assert_eq!(instance.state, InstanceState::Paused);
        assert_eq!(live_object(&engine).await.data["status"], "draft");

        let proposal = engine
            .storage()
            .get_proposal("org-1", instance.proposal_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(proposal.state, ProposalState::Submitted);
        assert_eq!(proposal.changes["status"], "approved");

        let assignment = assignment_for(&engine, &instance, "bob").await;
        assert_eq!(assignment.approval.proposed_hash.as_deref(), Some(proposal.proposed_hash.as_str()));
    }

    #[tokio::test]
    async fn test_post_commit_applies_and_reviews() {
        let (engine, mut rx) = create_test_engine();
        let definition = approval_definition(legal_approval(None)).with_timing(ApprovalTiming::PostCommit);
        let instance = start(&engine, &mut rx, definition, status_change("approved")).await;

        assert_eq!(live_object(&engine).await.data["status"], "approved");
        let instance = reload(&engine, &instance).await;
        assert!(instance.proposal_id.is_none());

        let review = engine
            .storage()
            .find_assignment_by_key("org-1", &instance.id, "review_approve_bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(review.role, "REVIEWER");
        assert!(review.approval.proposed_hash.is_none());
    }

    #[tokio::test]
    async fn test_quorum_of_two() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(Some(2))), status_change("approved")).await;
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        decide(&engine, &instance, "bob", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Paused);
        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Submitted);
        assert_eq!(live_object(&engine).await.data["status"], "draft");

        decide(&engine, &instance, "carol", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Completed);
        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Applied);
        assert_eq!(proposal.approved_hash, Some(proposal.proposed_hash.clone()));

        let object = live_object(&engine).await;
        assert_eq!(object.data["status"], "approved");
        assert_eq!(object.data["reviewed"], true);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::WorkflowCompleted).await.len(), 1);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::InstanceResumed).await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_completion_is_idempotent() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;
        let mut observer = engine.subscribe();

        decide(&engine, &instance, "bob", AssignmentStatus::Approved).await;
        decide(&engine, &instance, "carol", AssignmentStatus::Approved).await;

        // Both decisions are handled at the same time; each sees a satisfied quorum
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let listeners = engine.listeners();
        let results = futures::future::join_all(vec![listeners.handle(&first), listeners.handle(&second)]).await;
        assert!(results.iter().all(|r| r.is_ok()));
        engine.process_pending(&mut rx).await.unwrap();

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Completed);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::WorkflowCompleted).await.len(), 1);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::InstanceResumed).await.len(), 1);

        let mut completions = 0;
        while let Ok(envelope) = observer.try_recv() {
            if matches!(envelope.event, EngineEvent::InstanceCompleted(_)) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_late_approval_is_noop() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(Some(1))), status_change("approved")).await;

        decide(&engine, &instance, "bob", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Completed);

        // Someone edits the object after the workflow finished
        engine
            .storage()
            .update_object("org-1", "Policy", "pol-1", &changes(json!({ "status": "manual" })))
            .await
            .unwrap();

        decide(&engine, &instance, "carol", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();

        assert_eq!(live_object(&engine).await.data["status"], "manual");
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::WorkflowCompleted).await.len(), 1);
    }

    #[tokio::test]
    async fn test_required_rejection_fails_instance() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        decide(&engine, &instance, "bob", AssignmentStatus::Rejected).await;
        engine.process_pending(&mut rx).await.unwrap();

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Failed);
        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Rejected);
        assert_eq!(live_object(&engine).await.data["status"], "draft");

        let completed = events_of(&engine, &instance, WorkflowEventType::ActionCompleted).await;
        assert_eq!(completed[0].details["error"], "approval rejected by a required approver");
    }

    #[tokio::test]
    async fn test_simultaneous_rejections_fail_instance_once() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        decide(&engine, &instance, "bob", AssignmentStatus::Rejected).await;
        decide(&engine, &instance, "carol", AssignmentStatus::Rejected).await;
        engine.process_pending(&mut rx).await.unwrap();

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Failed);
        let completed = events_of(&engine, &instance, WorkflowEventType::ActionCompleted).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].details["satisfied"], false);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::WorkflowCompleted).await.len(), 1);

        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Rejected);
    }

    #[tokio::test]
    async fn test_proposal_edit_invalidates_approval() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(Some(2))), status_change("approved")).await;
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        decide(&engine, &instance, "bob", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();

        let update = engine
            .update_proposal_changes(
                &CallerContext::new("org-1", "alice"),
                &proposal_id,
                changes(json!({ "status": "retired" })),
            )
            .await
            .unwrap();
        assert_eq!(update.invalidated.len(), 1);

        let bob = assignment_for(&engine, &instance, "bob").await;
        assert_eq!(bob.status, AssignmentStatus::Pending);
        let invalidation = bob.invalidation.unwrap();
        assert_eq!(invalidation.reason, INVALIDATION_REASON);
        assert!(!invalidation.reason.is_empty());
        assert_eq!(invalidation.new_proposed_hash, update.proposal.proposed_hash);
    }

    #[tokio::test]
    async fn test_changes_requested_routes_to_requester() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;

        let bob = assignment_for(&engine, &instance, "bob").await;
        engine
            .complete_assignment(
                &CallerContext::new("org-1", "bob"),
                &bob.id,
                AssignmentStatus::ChangesRequested,
                Some("cite the control".to_string()),
            )
            .await
            .unwrap();
        engine.process_pending(&mut rx).await.unwrap();

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Paused);
        let request = engine
            .storage()
            .find_assignment_by_key("org-1", &instance.id, "change_request_approve_alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.role, REQUESTER_ROLE);
        assert_eq!(request.notes.as_deref(), Some("cite the control"));

        let carol = assignment_for(&engine, &instance, "carol").await;
        assert_eq!(carol.status, AssignmentStatus::Rejected);
        assert_eq!(carol.rejection.unwrap().reason, "changes requested");
    }

    #[tokio::test]
    async fn test_false_when_skips_gate() {
        let (engine, mut rx) = create_test_engine();
        let mut definition = approval_definition(legal_approval(None));
        definition.document.actions[0].when = Some("object.name == \"Never\"".to_string());
        let instance = start(&engine, &mut rx, definition, status_change("approved")).await;

        let instance = reload(&engine, &instance).await;
        assert_eq!(instance.state, InstanceState::Completed);
        assert!(events_of(&engine, &instance, WorkflowEventType::InstancePaused).await.is_empty());
        let skipped = events_of(&engine, &instance, WorkflowEventType::ActionSkipped).await;
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].details["reason"], "when_false");
        assert!(engine.storage().list_assignments("org-1", &instance.id).await.unwrap().is_empty());

        // The staged change lands once nothing gates it
        let object = live_object(&engine).await;
        assert_eq!(object.data["status"], "approved");
        assert_eq!(object.data["reviewed"], true);
    }

    #[tokio::test]
    async fn test_parallel_gates_resume_after_all_resolve() {
        let (engine, mut rx) = create_test_engine();
        let definition = WorkflowDefinition::new("org-1", "Dual approval", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE").with_fields(&["status"]))
            .with_action(
                WorkflowAction::new("approve", ActionType::RequestApproval, json!({ "targets": [{ "type": "USER", "id": "bob" }] }))
                    .with_when("true"),
            )
            .with_action(
                WorkflowAction::new("approve_risk", ActionType::RequestApproval, json!({ "targets": [{ "type": "USER", "id": "carol" }] }))
                    .with_when("true"),
            )
            .with_action(WorkflowAction::new("stamp", ActionType::UpdateField, json!({ "updates": { "reviewed": true } })));
        let instance = start(&engine, &mut rx, definition, status_change("approved")).await;

        let paused = reload(&engine, &instance).await;
        assert_eq!(paused.state, InstanceState::Paused);
        assert_eq!(paused.context.parallel_approval_keys, vec!["approve", "approve_risk"]);

        decide(&engine, &instance, "bob", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Paused);

        let carol = engine
            .storage()
            .find_assignment_by_key("org-1", &instance.id, "approval_approve_risk_carol")
            .await
            .unwrap()
            .unwrap();
        engine
            .complete_assignment(&CallerContext::new("org-1", "carol"), &carol.id, AssignmentStatus::Approved, None)
            .await
            .unwrap();
        engine.process_pending(&mut rx).await.unwrap();

        let done = reload(&engine, &instance).await;
        assert_eq!(done.state, InstanceState::Completed);
        assert!(done.context.parallel_approval_keys.is_empty());
        assert_eq!(live_object(&engine).await.data["reviewed"], true);
    }

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

    fn create_flaky_engine(max_attempts: u32) -> (WorkflowEngine, Arc<FlakyPublisher>, broadcast::Receiver<EventEnvelope>) {
        let mut config = EngineConfig::default();
        config.reconcile.max_attempts = max_attempts;
        let bus = EventBus::new(64);
        let flaky = Arc::new(FlakyPublisher { bus: bus.clone(), failing: AtomicBool::new(true) });
        let engine = WorkflowEngine::builder(config)
            .directory(create_test_directory())
            .event_bus(bus)
            .publisher(flaky.clone())
            .build()
            .unwrap();
        let rx = engine.subscribe();
        (engine, flaky, rx)
    }

    fn notify_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("org-1", "Status notice", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE").with_fields(&["status"]))
            .with_action(WorkflowAction::new(
                "tell",
                ActionType::Notify,
                json!({ "targets": [{ "type": "USER", "id": "bob" }], "title": "Status is {{object.status}}" }),
            ))
    }

    #[tokio::test]
    async fn test_emit_failure_recovers() {
        let (engine, flaky, mut rx) = create_flaky_engine(3);
        let alice = CallerContext::new("org-1", "alice");
        engine.create_definition(&alice, notify_definition()).await.unwrap();
        let outcome = engine
            .process_mutation(&alice, create_test_object(), status_change("approved"))
            .await
            .unwrap();
        let instance = outcome.instances[0].clone();

        let failed = events_of(&engine, &instance, WorkflowEventType::EmitFailed).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].details["attempts"], 1);
        assert_eq!(engine.process_pending(&mut rx).await.unwrap(), 0);

        flaky.failing.store(false, Ordering::SeqCst);
        let report = engine.reconcile(&alice).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::EmitRecovered).await.len(), 1);

        engine.process_pending(&mut rx).await.unwrap();
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Completed);
        let notices = engine.storage().list_notifications("org-1", Some("bob")).await.unwrap();
        assert_eq!(notices[0].title, "Status is approved");
    }

    #[tokio::test]
    async fn test_emit_failure_goes_terminal() {
        let (engine, _flaky, _rx) = create_flaky_engine(2);
        let alice = CallerContext::new("org-1", "alice");
        engine.create_definition(&alice, notify_definition()).await.unwrap();
        let outcome = engine
            .process_mutation(&alice, create_test_object(), status_change("approved"))
            .await
            .unwrap();
        let instance = outcome.instances[0].clone();

        assert_eq!(engine.reconcile(&alice).await.unwrap().retried, 1);
        assert_eq!(engine.reconcile(&alice).await.unwrap().terminal, 1);

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Failed);
        assert_eq!(events_of(&engine, &instance, WorkflowEventType::EmitFailedTerminal).await.len(), 1);
        assert_eq!(engine.reconcile(&alice).await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_terminal_emit_failure_rejects_proposal() {
        let (engine, _flaky, _rx) = create_flaky_engine(2);
        let alice = CallerContext::new("org-1", "alice");
        engine.create_definition(&alice, approval_definition(legal_approval(None))).await.unwrap();
        let outcome = engine
            .process_mutation(&alice, create_test_object(), status_change("approved"))
            .await
            .unwrap();
        let instance = outcome.instances[0].clone();
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        engine.reconcile(&alice).await.unwrap();
        assert_eq!(engine.reconcile(&alice).await.unwrap().terminal, 1);
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Failed);
        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Rejected);

        let retry = engine
            .process_mutation(&alice, create_test_object(), status_change("approved"))
            .await
            .unwrap();
        assert_eq!(retry.instances.len(), 1);
        assert!(retry.proposals.is_empty());
        let fresh = reload(&engine, &retry.instances[0]).await.proposal_id.unwrap();
        assert_ne!(fresh, proposal_id);
        assert_eq!(engine.storage().list_proposals("org-1", "pol-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_guards_block_second_instance() {
        let (engine, mut rx) = create_test_engine();
        start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;

        let alice = CallerContext::new("org-1", "alice");
        let outcome = engine
            .process_mutation(&alice, create_test_object(), status_change("retired"))
            .await
            .unwrap();
        assert!(outcome.instances.is_empty());
        assert_eq!(outcome.staged["status"], "retired");
        assert_eq!(outcome.proposals.len(), 1);
        assert_eq!(outcome.proposals[0].changes["status"], "retired");
    }

    #[tokio::test]
    async fn test_repeat_edit_merges_into_active_proposal() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(Some(2))), status_change("approved")).await;
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        decide(&engine, &instance, "bob", AssignmentStatus::Approved).await;
        engine.process_pending(&mut rx).await.unwrap();

        let alice = CallerContext::new("org-1", "alice");
        let outcome = engine
            .process_mutation(&alice, create_test_object(), status_change("retired"))
            .await
            .unwrap();
        assert!(outcome.instances.is_empty());
        assert_eq!(outcome.proposals[0].id, proposal_id);

        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.changes["status"], "retired");
        assert_eq!(proposal.state, ProposalState::Submitted);
        assert_eq!(engine.storage().list_proposals("org-1", "pol-1").await.unwrap().len(), 1);

        let bob = assignment_for(&engine, &instance, "bob").await;
        assert_eq!(bob.status, AssignmentStatus::Pending);
        assert_eq!(bob.invalidation.unwrap().new_proposed_hash, proposal.proposed_hash);
        assert_eq!(live_object(&engine).await.data["status"], "draft");

        let again = engine
            .process_mutation(&alice, create_test_object(), status_change("retired"))
            .await
            .unwrap();
        assert!(again.proposals.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_supersedes_proposal() {
        let (engine, mut rx) = create_test_engine();
        let instance = start(&engine, &mut rx, approval_definition(legal_approval(None)), status_change("approved")).await;
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        let alice = CallerContext::new("org-1", "alice");
        assert!(engine.cancel_instance(&alice, &instance.id).await.unwrap());
        assert!(!engine.cancel_instance(&alice, &instance.id).await.unwrap());

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Failed);
        let proposal = engine.storage().get_proposal("org-1", &proposal_id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Superseded);

        let err = engine
            .trigger_existing_instance(&alice, &instance.id, &status_change("approved"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_manual_submission_waits_for_submit() {
        let (engine, mut rx) = create_test_engine();
        let definition =
            approval_definition(legal_approval(None)).with_submission_mode(SubmissionMode::ManualSubmit);
        let instance = start(&engine, &mut rx, definition, status_change("approved")).await;

        assert!(engine.storage().list_assignments("org-1", &instance.id).await.unwrap().is_empty());
        let proposal_id = reload(&engine, &instance).await.proposal_id.unwrap();

        let proposal = engine
            .submit_proposal(&CallerContext::new("org-1", "alice"), &proposal_id)
            .await
            .unwrap();
        assert_eq!(proposal.state, ProposalState::Submitted);
        assert_eq!(proposal.submitted_by.as_deref(), Some("alice"));

        engine.process_pending(&mut rx).await.unwrap();
        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Paused);
        assert_eq!(engine.storage().list_assignments("org-1", &instance.id).await.unwrap().len(), 2);
    }

    struct TicketOperator;

    #[async_trait::async_trait]
    impl IntegrationOperator for TicketOperator {
        async fn execute(&self, call: &IntegrationCall) -> Result<Value> {
            Ok(json!({ "key": format!("GRC-{}", call.action_key) }))
        }
    }

    #[tokio::test]
    async fn test_integration_completes_through_handler() {
        let engine = WorkflowEngine::builder(EngineConfig::default())
            .integration("jira", "create_issue", Arc::new(TicketOperator))
            .build()
            .unwrap();
        let mut rx = engine.subscribe();
        let definition = WorkflowDefinition::new("org-1", "Ticket", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE"))
            .with_action(WorkflowAction::new(
                "ticket",
                ActionType::Integration,
                json!({ "provider": "jira", "operation": "create_issue" }),
            ));
        let instance = start(&engine, &mut rx, definition, status_change("approved")).await;

        assert_eq!(reload(&engine, &instance).await.state, InstanceState::Completed);
        assert_eq!(live_object(&engine).await.data["status"], "approved");
        let completed = events_of(&engine, &instance, WorkflowEventType::ActionCompleted).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].details["success"], true);
    }
}
