// Storage abstraction for the workflow engine
// Predicate reads, idempotent creates and conditional writes

//! # Storage Abstraction Layer
//!
//! The engine never embeds a query language. Everything it needs from persistence
//! is expressed by the [`WorkflowStorage`] trait:
//!
//! - **Predicate-filtered reads**: [`InstanceFilter`], trigger candidate prefiltering
//! - **Idempotent creates**: duplicate assignments surface as
//!   [`WorkflowError::UniqueViolation`] so callers can treat them as "already exists"
//! - **Conditional writes**: [`WorkflowStorage::update_instance`] only touches an
//!   instance whose state passes a [`StateGuard`] and reports how many rows changed.
//!   This compare-and-swap is the only concurrency primitive the orchestrator uses.
//! - **Transactions**: multi-row operations that must be atomic
//!   ([`WorkflowStorage::create_instance_bundle`], [`WorkflowStorage::apply_proposal`])
//!   are single trait methods, so every backend decides how to make them atomic.
//!
//! ## Thread Safety
//!
//! [`InMemoryStorage`] keeps every table behind one `RwLock`, so each trait method
//! is a single critical section. Lock poisoning is reported as an error instead of
//! panicking.
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates:
//! - Async traits with the async-trait crate
//! - `Send + Sync` bounds so the store can be shared as `Arc<dyn WorkflowStorage>`
//! - `Result<Option<T>>`: the read can fail, and if it succeeds the row may not exist
//! - Returning affected-row counts from conditional updates

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{
    compute_proposal_hash, AssignmentStatus, AssignmentTarget, DefinitionDocument, InstanceContext,
    InstanceState, IntegrationRun, NotificationRecord, NotificationTemplate, ObjectRef,
    ProposalState, WorkflowAssignment, WorkflowDefinition, WorkflowEventRecord, WorkflowEventType,
    WorkflowInstance, WorkflowObject, WorkflowProposal,
};
use crate::{Result, WorkflowError};

/// Precondition on an instance's state for conditional updates
#[derive(Debug, Clone, PartialEq)]
pub enum StateGuard {
    Any,
    In(Vec<InstanceState>),
    NotIn(Vec<InstanceState>),
}

impl StateGuard {
    pub fn allows(&self, state: InstanceState) -> bool {
        match self {
            StateGuard::Any => true,
            StateGuard::In(states) => states.contains(&state),
            StateGuard::NotIn(states) => !states.contains(&state),
        }
    }

    /// Only instances that have not reached Completed/Failed
    pub fn non_terminal() -> Self {
        StateGuard::NotIn(InstanceState::terminal().to_vec())
    }
}

/// Fields to change on an instance; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub state: Option<InstanceState>,
    pub current_action_index: Option<usize>,
    pub definition_snapshot: Option<DefinitionDocument>,
    pub context: Option<InstanceContext>,
    pub clear_parallel_keys: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: InstanceState) -> Self {
        if state.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.state = Some(state);
        self
    }

    pub fn action_index(mut self, index: usize) -> Self {
        self.current_action_index = Some(index);
        self
    }

    pub fn snapshot(mut self, snapshot: DefinitionDocument) -> Self {
        self.definition_snapshot = Some(snapshot);
        self
    }

    pub fn context(mut self, context: InstanceContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn clear_parallel_keys(mut self) -> Self {
        self.clear_parallel_keys = true;
        self
    }

    fn apply(self, instance: &mut WorkflowInstance) {
        if let Some(state) = self.state {
            instance.state = state;
        }
        if let Some(index) = self.current_action_index {
            instance.current_action_index = index;
        }
        if let Some(snapshot) = self.definition_snapshot {
            instance.definition_snapshot = snapshot;
        }
        if let Some(context) = self.context {
            instance.context = context;
        }
        if self.clear_parallel_keys {
            instance.context.parallel_approval_keys.clear();
        }
        if self.completed_at.is_some() {
            instance.completed_at = self.completed_at;
        }
        instance.updated_at = Utc::now();
    }
}

/// Predicate for listing instances; empty/`None` criteria match everything
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub object_id: Option<String>,
    pub definition_id: Option<String>,
    pub states: Vec<InstanceState>,
    pub created_after: Option<DateTime<Utc>>,
    pub proposal_id: Option<String>,
    /// Instances whose linked proposal covers this domain
    pub domain_key: Option<String>,
}

/// Proposal to create (or reuse) alongside a new instance
#[derive(Debug, Clone)]
pub struct ProposalPlan {
    pub domain_key: String,
    pub changes: Map<String, Value>,
    pub submit: bool,
    pub submitted_by: Option<String>,
}

/// Everything written atomically when an instance starts
#[derive(Debug, Clone)]
pub struct InstanceBundle {
    pub instance: WorkflowInstance,
    pub object_ref: ObjectRef,
    pub proposal: Option<ProposalPlan>,
}

/// Storage trait for workflow persistence
///
/// All methods are scoped by organization id; a row belonging to another
/// organization behaves exactly like a missing row.
#[async_trait::async_trait]
pub trait WorkflowStorage: Send + Sync {
    // Definitions

    async fn create_definition(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition>;

    async fn get_definition(&self, org_id: &str, id: &str) -> Result<Option<WorkflowDefinition>>;

    async fn list_definitions(&self, org_id: &str) -> Result<Vec<WorkflowDefinition>>;

    /// Active, non-draft definitions for `schema_type` whose denormalized trigger
    /// operations contain `operation` and whose trigger fields are empty or
    /// intersect `changed`
    async fn find_trigger_candidates(
        &self,
        org_id: &str,
        schema_type: &str,
        operation: &str,
        changed: &[String],
    ) -> Result<Vec<WorkflowDefinition>>;

    // Domain objects

    async fn put_object(&self, org_id: &str, object: WorkflowObject) -> Result<()>;

    async fn get_object(&self, org_id: &str, object_type: &str, id: &str) -> Result<Option<WorkflowObject>>;

    /// Write fields onto the live object
    async fn update_object(
        &self,
        org_id: &str,
        object_type: &str,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<WorkflowObject>;

    // Instances

    /// Create instance, object reference and proposal in one transaction
    ///
    /// A non-terminal proposal for the same (object, domain) is reused with the new
    /// changes merged in; otherwise a new one is created. Nothing is written if any
    /// step fails.
    async fn create_instance_bundle(
        &self,
        bundle: InstanceBundle,
    ) -> Result<(WorkflowInstance, Option<WorkflowProposal>)>;

    async fn get_instance(&self, org_id: &str, id: &str) -> Result<Option<WorkflowInstance>>;

    async fn list_instances(&self, org_id: &str, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>>;

    /// Conditional update; returns the number of rows changed (0 or 1)
    async fn update_instance(
        &self,
        org_id: &str,
        id: &str,
        guard: StateGuard,
        update: InstanceUpdate,
    ) -> Result<u64>;

    /// Insert a notification key into the instance context; false if it was already there
    async fn record_fired_notification(&self, org_id: &str, id: &str, key: &str) -> Result<bool>;

    async fn remove_parallel_key(&self, org_id: &str, id: &str, action_key: &str) -> Result<()>;

    async fn list_object_refs(&self, org_id: &str, object_id: &str) -> Result<Vec<ObjectRef>>;

    // Proposals

    async fn get_proposal(&self, org_id: &str, id: &str) -> Result<Option<WorkflowProposal>>;

    async fn find_active_proposal(
        &self,
        org_id: &str,
        object_id: &str,
        domain_key: &str,
    ) -> Result<Option<WorkflowProposal>>;

    async fn list_proposals(&self, org_id: &str, object_id: &str) -> Result<Vec<WorkflowProposal>>;

    /// Insert a proposal; a second non-terminal one for (object, domain) is a `UniqueViolation`
    async fn create_proposal(&self, proposal: WorkflowProposal) -> Result<WorkflowProposal>;

    /// Replace the changes of a proposal in one of `allowed` states, rehashing them
    async fn update_proposal_changes(
        &self,
        org_id: &str,
        id: &str,
        allowed: &[ProposalState],
        changes: Map<String, Value>,
    ) -> Result<Option<WorkflowProposal>>;

    /// Move a proposal from one of `from` to `to`; returns rows changed
    async fn transition_proposal(
        &self,
        org_id: &str,
        id: &str,
        from: &[ProposalState],
        to: ProposalState,
        actor: Option<&str>,
    ) -> Result<u64>;

    /// Write a non-terminal proposal's changes onto its object and mark it Applied
    ///
    /// Returns false without touching anything when the proposal is already terminal.
    async fn apply_proposal(&self, org_id: &str, id: &str) -> Result<bool>;

    // Assignments

    /// Insert an assignment; a duplicate (instance, key) is a `UniqueViolation`
    async fn create_assignment(&self, assignment: WorkflowAssignment) -> Result<WorkflowAssignment>;

    async fn get_assignment(&self, org_id: &str, id: &str) -> Result<Option<WorkflowAssignment>>;

    async fn find_assignment_by_key(
        &self,
        org_id: &str,
        instance_id: &str,
        assignment_key: &str,
    ) -> Result<Option<WorkflowAssignment>>;

    async fn list_assignments(&self, org_id: &str, instance_id: &str) -> Result<Vec<WorkflowAssignment>>;

    /// Replace an assignment, optionally only while it still has `expected` status
    async fn update_assignment(
        &self,
        assignment: &WorkflowAssignment,
        expected: Option<AssignmentStatus>,
    ) -> Result<u64>;

    /// Insert a target link; a duplicate (assignment, user) is a `UniqueViolation`
    async fn create_assignment_target(&self, target: AssignmentTarget) -> Result<()>;

    async fn list_assignment_targets(&self, org_id: &str, assignment_ids: &[String]) -> Result<Vec<AssignmentTarget>>;

    // Audit events

    async fn record_event(&self, event: WorkflowEventRecord) -> Result<()>;

    /// Events in insertion order; an empty `types` slice matches every type
    async fn list_events(
        &self,
        org_id: &str,
        instance_id: Option<&str>,
        types: &[WorkflowEventType],
    ) -> Result<Vec<WorkflowEventRecord>>;

    // Notifications

    async fn create_notification(&self, notification: NotificationRecord) -> Result<()>;

    async fn list_notifications(&self, org_id: &str, user_id: Option<&str>) -> Result<Vec<NotificationRecord>>;

    async fn put_template(&self, template: NotificationTemplate) -> Result<()>;

    async fn get_template(&self, org_id: &str, id: &str) -> Result<Option<NotificationTemplate>>;

    async fn find_template_by_key(&self, org_id: &str, key: &str) -> Result<Option<NotificationTemplate>>;

    // Integration runs

    async fn create_integration_run(&self, run: IntegrationRun) -> Result<IntegrationRun>;

    async fn get_integration_run(&self, org_id: &str, id: &str) -> Result<Option<IntegrationRun>>;

    async fn update_integration_run(&self, run: &IntegrationRun) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    definitions: HashMap<String, WorkflowDefinition>,
    objects: HashMap<(String, String, String), WorkflowObject>,
    instances: HashMap<String, WorkflowInstance>,
    object_refs: Vec<ObjectRef>,
    proposals: HashMap<String, WorkflowProposal>,
    assignments: Vec<WorkflowAssignment>,
    assignment_targets: Vec<AssignmentTarget>,
    events: Vec<WorkflowEventRecord>,
    notifications: Vec<NotificationRecord>,
    templates: HashMap<String, NotificationTemplate>,
    integration_runs: HashMap<String, IntegrationRun>,
}

impl Tables {
    fn active_proposal_mut(&mut self, org_id: &str, object_id: &str, domain_key: &str) -> Option<&mut WorkflowProposal> {
        self.proposals.values_mut().find(|p| {
            p.org_id == org_id && p.object_id == object_id && p.domain_key == domain_key && !p.state.is_terminal()
        })
    }

    fn instance_mut(&mut self, org_id: &str, id: &str) -> Result<&mut WorkflowInstance> {
        self.instances
            .get_mut(id)
            .filter(|i| i.org_id == org_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow instance {}", id)))
    }
}

/// In-memory storage implementation
///
/// Used by tests and by the reference server binary. All data is lost when the
/// process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| WorkflowError::Internal("storage lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| WorkflowError::Internal("storage lock poisoned".to_string()))
    }
}

fn object_key(org_id: &str, object_type: &str, id: &str) -> (String, String, String) {
    (org_id.to_string(), object_type.to_string(), id.to_string())
}

#[async_trait::async_trait]
impl WorkflowStorage for InMemoryStorage {
    async fn create_definition(&self, mut definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        definition.derive_trigger_prefilter();
        let mut tables = self.write()?;
        tables.definitions.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, org_id: &str, id: &str) -> Result<Option<WorkflowDefinition>> {
        let tables = self.read()?;
        Ok(tables.definitions.get(id).filter(|d| d.org_id == org_id).cloned())
    }

    async fn list_definitions(&self, org_id: &str) -> Result<Vec<WorkflowDefinition>> {
        let tables = self.read()?;
        let mut definitions: Vec<_> = tables
            .definitions
            .values()
            .filter(|d| d.org_id == org_id)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(definitions)
    }

    async fn find_trigger_candidates(
        &self,
        org_id: &str,
        schema_type: &str,
        operation: &str,
        changed: &[String],
    ) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self.list_definitions(org_id).await?;
        Ok(definitions
            .into_iter()
            .filter(|d| d.schema_type == schema_type && d.prefilter_matches(operation, changed))
            .collect())
    }

    async fn put_object(&self, org_id: &str, object: WorkflowObject) -> Result<()> {
        let mut tables = self.write()?;
        tables
            .objects
            .insert(object_key(org_id, &object.object_type, &object.id), object);
        Ok(())
    }

    async fn get_object(&self, org_id: &str, object_type: &str, id: &str) -> Result<Option<WorkflowObject>> {
        let tables = self.read()?;
        Ok(tables.objects.get(&object_key(org_id, object_type, id)).cloned())
    }

    async fn update_object(
        &self,
        org_id: &str,
        object_type: &str,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<WorkflowObject> {
        let mut tables = self.write()?;
        let object = tables
            .objects
            .get_mut(&object_key(org_id, object_type, id))
            .ok_or_else(|| WorkflowError::NotFound(format!("{} {}", object_type, id)))?;
        object.apply_changes(changes);
        Ok(object.clone())
    }

    async fn create_instance_bundle(
        &self,
        bundle: InstanceBundle,
    ) -> Result<(WorkflowInstance, Option<WorkflowProposal>)> {
        let InstanceBundle { mut instance, object_ref, proposal } = bundle;
        let mut tables = self.write()?;

        if tables.instances.contains_key(&instance.id) {
            return Err(WorkflowError::UniqueViolation(format!("workflow instance {}", instance.id)));
        }

        // Build the proposal row first so a failure leaves every table untouched
        let proposal = match proposal {
            Some(plan) => {
                let existing = tables
                    .active_proposal_mut(&instance.org_id, &instance.object_id, &plan.domain_key)
                    .map(|p| p.clone());
                let mut row = match existing {
                    Some(mut reused) => {
                        for (field, value) in plan.changes {
                            reused.changes.insert(field, value);
                        }
                        let hash = compute_proposal_hash(&reused.changes)?;
                        if hash != reused.proposed_hash {
                            reused.proposed_hash = hash;
                            reused.revision += 1;
                        }
                        reused
                    }
                    None => WorkflowProposal::new(
                        &instance.org_id,
                        &instance.object_id,
                        &instance.object_type,
                        &plan.domain_key,
                        plan.changes,
                    )?,
                };
                if plan.submit && row.state == ProposalState::Draft {
                    row.state = ProposalState::Submitted;
                    row.submitted_at = Some(Utc::now());
                    row.submitted_by = plan.submitted_by;
                }
                row.updated_at = Utc::now();
                Some(row)
            }
            None => None,
        };

        if let Some(row) = &proposal {
            instance.proposal_id = Some(row.id.clone());
            tables.proposals.insert(row.id.clone(), row.clone());
        }
        tables.object_refs.push(object_ref);
        tables.instances.insert(instance.id.clone(), instance.clone());

        Ok((instance, proposal))
    }

    async fn get_instance(&self, org_id: &str, id: &str) -> Result<Option<WorkflowInstance>> {
        let tables = self.read()?;
        Ok(tables.instances.get(id).filter(|i| i.org_id == org_id).cloned())
    }

    async fn list_instances(&self, org_id: &str, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        let tables = self.read()?;
        let mut instances: Vec<_> = tables
            .instances
            .values()
            .filter(|i| i.org_id == org_id)
            .filter(|i| filter.object_id.as_deref().map_or(true, |id| i.object_id == id))
            .filter(|i| filter.definition_id.as_deref().map_or(true, |id| i.definition_id == id))
            .filter(|i| filter.states.is_empty() || filter.states.contains(&i.state))
            .filter(|i| filter.created_after.map_or(true, |t| i.created_at >= t))
            .filter(|i| {
                filter
                    .proposal_id
                    .as_deref()
                    .map_or(true, |id| i.proposal_id.as_deref() == Some(id))
            })
            .filter(|i| {
                filter.domain_key.as_deref().map_or(true, |key| {
                    i.proposal_id
                        .as_ref()
                        .and_then(|pid| tables.proposals.get(pid))
                        .map_or(false, |p| p.domain_key == key)
                })
            })
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn update_instance(
        &self,
        org_id: &str,
        id: &str,
        guard: StateGuard,
        update: InstanceUpdate,
    ) -> Result<u64> {
        let mut tables = self.write()?;
        let instance = tables.instance_mut(org_id, id)?;
        if !guard.allows(instance.state) {
            return Ok(0);
        }
        update.apply(instance);
        Ok(1)
    }

    async fn record_fired_notification(&self, org_id: &str, id: &str, key: &str) -> Result<bool> {
        let mut tables = self.write()?;
        let instance = tables.instance_mut(org_id, id)?;
        let inserted = instance.context.fired_notifications.insert(key.to_string());
        if inserted {
            instance.updated_at = Utc::now();
        }
        Ok(inserted)
    }

    async fn remove_parallel_key(&self, org_id: &str, id: &str, action_key: &str) -> Result<()> {
        let mut tables = self.write()?;
        let instance = tables.instance_mut(org_id, id)?;
        instance.context.parallel_approval_keys.retain(|k| k != action_key);
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn list_object_refs(&self, org_id: &str, object_id: &str) -> Result<Vec<ObjectRef>> {
        let tables = self.read()?;
        Ok(tables
            .object_refs
            .iter()
            .filter(|r| r.org_id == org_id && r.object_id == object_id)
            .cloned()
            .collect())
    }

    async fn get_proposal(&self, org_id: &str, id: &str) -> Result<Option<WorkflowProposal>> {
        let tables = self.read()?;
        Ok(tables.proposals.get(id).filter(|p| p.org_id == org_id).cloned())
    }

    async fn find_active_proposal(
        &self,
        org_id: &str,
        object_id: &str,
        domain_key: &str,
    ) -> Result<Option<WorkflowProposal>> {
        let tables = self.read()?;
        Ok(tables
            .proposals
            .values()
            .find(|p| {
                p.org_id == org_id && p.object_id == object_id && p.domain_key == domain_key && !p.state.is_terminal()
            })
            .cloned())
    }

    async fn list_proposals(&self, org_id: &str, object_id: &str) -> Result<Vec<WorkflowProposal>> {
        let tables = self.read()?;
        let mut proposals: Vec<_> = tables
            .proposals
            .values()
            .filter(|p| p.org_id == org_id && p.object_id == object_id)
            .cloned()
            .collect();
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(proposals)
    }

    async fn create_proposal(&self, proposal: WorkflowProposal) -> Result<WorkflowProposal> {
        let mut tables = self.write()?;
        if tables
            .active_proposal_mut(&proposal.org_id, &proposal.object_id, &proposal.domain_key)
            .is_some()
        {
            return Err(WorkflowError::UniqueViolation(format!(
                "active proposal for {} [{}]",
                proposal.object_id, proposal.domain_key
            )));
        }
        tables.proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }

    async fn update_proposal_changes(
        &self,
        org_id: &str,
        id: &str,
        allowed: &[ProposalState],
        changes: Map<String, Value>,
    ) -> Result<Option<WorkflowProposal>> {
        let hash = compute_proposal_hash(&changes)?;
        let mut tables = self.write()?;
        let proposal = tables
            .proposals
            .get_mut(id)
            .filter(|p| p.org_id == org_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow proposal {}", id)))?;
        if !allowed.contains(&proposal.state) {
            return Ok(None);
        }
        proposal.changes = changes;
        if proposal.proposed_hash != hash {
            proposal.proposed_hash = hash;
            proposal.revision += 1;
        }
        proposal.updated_at = Utc::now();
        Ok(Some(proposal.clone()))
    }

    async fn transition_proposal(
        &self,
        org_id: &str,
        id: &str,
        from: &[ProposalState],
        to: ProposalState,
        actor: Option<&str>,
    ) -> Result<u64> {
        let mut tables = self.write()?;
        let proposal = tables
            .proposals
            .get_mut(id)
            .filter(|p| p.org_id == org_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow proposal {}", id)))?;
        if !from.contains(&proposal.state) {
            return Ok(0);
        }
        proposal.state = to;
        proposal.updated_at = Utc::now();
        if to == ProposalState::Submitted {
            proposal.submitted_at = Some(Utc::now());
            proposal.submitted_by = actor.map(str::to_string);
        }
        Ok(1)
    }

    async fn apply_proposal(&self, org_id: &str, id: &str) -> Result<bool> {
        let mut tables = self.write()?;
        let proposal = tables
            .proposals
            .get(id)
            .filter(|p| p.org_id == org_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow proposal {}", id)))?;
        if proposal.state.is_terminal() {
            return Ok(false);
        }

        let key = object_key(org_id, &proposal.object_type, &proposal.object_id);
        let object = tables
            .objects
            .get_mut(&key)
            .ok_or_else(|| WorkflowError::NotFound(format!("{} {}", proposal.object_type, proposal.object_id)))?;
        object.apply_changes(&proposal.changes);

        if let Some(row) = tables.proposals.get_mut(id) {
            row.state = ProposalState::Applied;
            row.approved_hash = Some(row.proposed_hash.clone());
            row.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn create_assignment(&self, assignment: WorkflowAssignment) -> Result<WorkflowAssignment> {
        let mut tables = self.write()?;
        let duplicate = tables.assignments.iter().any(|a| {
            a.org_id == assignment.org_id
                && a.instance_id == assignment.instance_id
                && a.assignment_key == assignment.assignment_key
        });
        if duplicate {
            return Err(WorkflowError::UniqueViolation(format!(
                "workflow assignment {}",
                assignment.assignment_key
            )));
        }
        tables.assignments.push(assignment.clone());
        Ok(assignment)
    }

    async fn get_assignment(&self, org_id: &str, id: &str) -> Result<Option<WorkflowAssignment>> {
        let tables = self.read()?;
        Ok(tables
            .assignments
            .iter()
            .find(|a| a.id == id && a.org_id == org_id)
            .cloned())
    }

    async fn find_assignment_by_key(
        &self,
        org_id: &str,
        instance_id: &str,
        assignment_key: &str,
    ) -> Result<Option<WorkflowAssignment>> {
        let tables = self.read()?;
        Ok(tables
            .assignments
            .iter()
            .find(|a| a.org_id == org_id && a.instance_id == instance_id && a.assignment_key == assignment_key)
            .cloned())
    }

    async fn list_assignments(&self, org_id: &str, instance_id: &str) -> Result<Vec<WorkflowAssignment>> {
        let tables = self.read()?;
        Ok(tables
            .assignments
            .iter()
            .filter(|a| a.org_id == org_id && a.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn update_assignment(
        &self,
        assignment: &WorkflowAssignment,
        expected: Option<AssignmentStatus>,
    ) -> Result<u64> {
        let mut tables = self.write()?;
        let row = tables
            .assignments
            .iter_mut()
            .find(|a| a.id == assignment.id && a.org_id == assignment.org_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow assignment {}", assignment.id)))?;
        if let Some(expected) = expected {
            if row.status != expected {
                return Ok(0);
            }
        }
        *row = assignment.clone();
        row.updated_at = Utc::now();
        Ok(1)
    }

    async fn create_assignment_target(&self, target: AssignmentTarget) -> Result<()> {
        let mut tables = self.write()?;
        let duplicate = tables.assignment_targets.iter().any(|t| {
            t.org_id == target.org_id
                && t.assignment_id == target.assignment_id
                && t.target_user_id == target.target_user_id
        });
        if duplicate {
            return Err(WorkflowError::UniqueViolation(format!(
                "assignment target {}:{}",
                target.assignment_id, target.target_user_id
            )));
        }
        tables.assignment_targets.push(target);
        Ok(())
    }

    async fn list_assignment_targets(&self, org_id: &str, assignment_ids: &[String]) -> Result<Vec<AssignmentTarget>> {
        let tables = self.read()?;
        Ok(tables
            .assignment_targets
            .iter()
            .filter(|t| t.org_id == org_id && assignment_ids.contains(&t.assignment_id))
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: WorkflowEventRecord) -> Result<()> {
        let mut tables = self.write()?;
        tables.events.push(event);
        Ok(())
    }

    async fn list_events(
        &self,
        org_id: &str,
        instance_id: Option<&str>,
        types: &[WorkflowEventType],
    ) -> Result<Vec<WorkflowEventRecord>> {
        let tables = self.read()?;
        Ok(tables
            .events
            .iter()
            .filter(|e| e.org_id == org_id)
            .filter(|e| instance_id.map_or(true, |id| e.instance_id == id))
            .filter(|e| types.is_empty() || types.contains(&e.event_type))
            .cloned()
            .collect())
    }

    async fn create_notification(&self, notification: NotificationRecord) -> Result<()> {
        let mut tables = self.write()?;
        tables.notifications.push(notification);
        Ok(())
    }

    async fn list_notifications(&self, org_id: &str, user_id: Option<&str>) -> Result<Vec<NotificationRecord>> {
        let tables = self.read()?;
        Ok(tables
            .notifications
            .iter()
            .filter(|n| n.org_id == org_id)
            .filter(|n| user_id.map_or(true, |u| n.user_id == u))
            .cloned()
            .collect())
    }

    async fn put_template(&self, template: NotificationTemplate) -> Result<()> {
        let mut tables = self.write()?;
        tables.templates.insert(template.id.clone(), template);
        Ok(())
    }

    async fn get_template(&self, org_id: &str, id: &str) -> Result<Option<NotificationTemplate>> {
        let tables = self.read()?;
        Ok(tables.templates.get(id).filter(|t| t.org_id == org_id).cloned())
    }

    async fn find_template_by_key(&self, org_id: &str, key: &str) -> Result<Option<NotificationTemplate>> {
        let tables = self.read()?;
        Ok(tables
            .templates
            .values()
            .find(|t| t.org_id == org_id && t.key == key && t.active)
            .cloned())
    }

    async fn create_integration_run(&self, run: IntegrationRun) -> Result<IntegrationRun> {
        let mut tables = self.write()?;
        tables.integration_runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_integration_run(&self, org_id: &str, id: &str) -> Result<Option<IntegrationRun>> {
        let tables = self.read()?;
        Ok(tables.integration_runs.get(id).filter(|r| r.org_id == org_id).cloned())
    }

    async fn update_integration_run(&self, run: &IntegrationRun) -> Result<()> {
        let mut tables = self.write()?;
        let row = tables
            .integration_runs
            .get_mut(&run.id)
            .filter(|r| r.org_id == run.org_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("integration run {}", run.id)))?;
        *row = run.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApprovalMetadata, DomainObject, ObjectRef, WorkflowTrigger};
    use serde_json::json;

    fn create_test_object() -> WorkflowObject {
        WorkflowObject::new("Policy", json!({ "status": "draft" }).as_object().cloned().unwrap()).with_id("pol-1")
    }

    fn create_test_bundle(object: &WorkflowObject, plan: Option<ProposalPlan>) -> InstanceBundle {
        let instance = WorkflowInstance::new(
            "org-1",
            "def-1",
            object.id(),
            object.object_type(),
            DefinitionDocument::default(),
            InstanceContext::default(),
        );
        let object_ref = ObjectRef::new("org-1", &instance.id, object);
        InstanceBundle { instance, object_ref, proposal: plan }
    }

    fn status_plan(value: &str) -> ProposalPlan {
        ProposalPlan {
            domain_key: "status".into(),
            changes: json!({ "status": value }).as_object().cloned().unwrap(),
            submit: true,
            submitted_by: Some("alice".into()),
        }
    }

    #[tokio::test]
    async fn test_conditional_update_only_once() {
        let storage = InMemoryStorage::new();
        let object = create_test_object();
        let (instance, _) = storage.create_instance_bundle(create_test_bundle(&object, None)).await.unwrap();

        let first = storage
            .update_instance("org-1", &instance.id, StateGuard::non_terminal(), InstanceUpdate::new().state(InstanceState::Completed))
            .await
            .unwrap();
        let second = storage
            .update_instance("org-1", &instance.id, StateGuard::non_terminal(), InstanceUpdate::new().state(InstanceState::Failed))
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        let stored = storage.get_instance("org-1", &instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_bundle_reuses_active_proposal_per_domain() {
        let storage = InMemoryStorage::new();
        let object = create_test_object();
        storage.put_object("org-1", object.clone()).await.unwrap();

        let (_, first) = storage
            .create_instance_bundle(create_test_bundle(&object, Some(status_plan("review"))))
            .await
            .unwrap();
        let (second_instance, second) = storage
            .create_instance_bundle(create_test_bundle(&object, Some(status_plan("approved"))))
            .await
            .unwrap();

        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.changes["status"], "approved");
        assert_eq!(second.revision, 2);
        assert_eq!(second.state, ProposalState::Submitted);
        assert_eq!(second_instance.proposal_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(storage.list_proposals("org-1", "pol-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_proposal_is_idempotent() {
        let storage = InMemoryStorage::new();
        let object = create_test_object();
        storage.put_object("org-1", object.clone()).await.unwrap();
        let (_, proposal) = storage
            .create_instance_bundle(create_test_bundle(&object, Some(status_plan("approved"))))
            .await
            .unwrap();
        let proposal = proposal.unwrap();

        assert!(storage.apply_proposal("org-1", &proposal.id).await.unwrap());
        assert!(!storage.apply_proposal("org-1", &proposal.id).await.unwrap());

        let applied = storage.get_proposal("org-1", &proposal.id).await.unwrap().unwrap();
        assert_eq!(applied.state, ProposalState::Applied);
        assert_eq!(applied.approved_hash.as_deref(), Some(applied.proposed_hash.as_str()));
        let live = storage.get_object("org-1", "Policy", "pol-1").await.unwrap().unwrap();
        assert_eq!(live.data["status"], "approved");
    }

    #[tokio::test]
    async fn test_duplicate_assignment_is_unique_violation() {
        let storage = InMemoryStorage::new();
        let meta = ApprovalMetadata { action_key: "approve".into(), required: true, ..Default::default() };
        let first = WorkflowAssignment::new("org-1", "inst-1", "approval_approve_alice".into(), "APPROVER", meta.clone());
        let dup = WorkflowAssignment::new("org-1", "inst-1", "approval_approve_alice".into(), "APPROVER", meta);

        storage.create_assignment(first).await.unwrap();
        assert!(matches!(
            storage.create_assignment(dup).await,
            Err(WorkflowError::UniqueViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_candidates_prefilter() {
        let storage = InMemoryStorage::new();
        let def = WorkflowDefinition::new("org-1", "status", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE").with_fields(&["status"]));
        storage.create_definition(def).await.unwrap();

        let hits = storage
            .find_trigger_candidates("org-1", "Policy", "UPDATE", &["status".to_string()])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = storage
            .find_trigger_candidates("org-1", "Control", "UPDATE", &["status".to_string()])
            .await
            .unwrap();
        assert!(misses.is_empty());
        let other_org = storage
            .find_trigger_candidates("org-2", "Policy", "UPDATE", &["status".to_string()])
            .await
            .unwrap();
        assert!(other_org.is_empty());
    }

    #[tokio::test]
    async fn test_fired_notification_tracking() {
        let storage = InMemoryStorage::new();
        let object = create_test_object();
        let (instance, _) = storage.create_instance_bundle(create_test_bundle(&object, None)).await.unwrap();

        assert!(storage.record_fired_notification("org-1", &instance.id, "notify_ping_1").await.unwrap());
        assert!(!storage.record_fired_notification("org-1", &instance.id, "notify_ping_1").await.unwrap());
    }

    #[test]
    fn test_state_guard() {
        assert!(StateGuard::Any.allows(InstanceState::Failed));
        assert!(StateGuard::In(vec![InstanceState::Paused]).allows(InstanceState::Paused));
        assert!(!StateGuard::In(vec![InstanceState::Paused]).allows(InstanceState::Running));
        assert!(!StateGuard::non_terminal().allows(InstanceState::Completed));
    }
}
