// Trigger and condition matching
// Decides which definitions a mutation should start

//! # Trigger Matcher
//!
//! Matching runs in two stages. Storage first returns cheap prefiltered
//! candidates using the denormalized trigger operations and fields of each
//! definition. Every trigger of a candidate is then checked in full:
//!
//! 1. the operation must match
//! 2. `object_type`, when set, must match the object
//! 3. a selector must match the object's tags, groups and type
//! 4. declared fields/edges must intersect what changed
//! 5. an expression, when present, must evaluate to true
//!
//! A definition matches when any of its triggers matches. Conditions are
//! evaluated separately, after matching, and all of them must hold.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::expression::{ExpressionEvaluator, ExpressionVars};
use super::storage::WorkflowStorage;
use crate::context::CallerContext;
use crate::models::{
    DefinitionDocument, DomainObject, InstanceContext, TriggerSelector, WorkflowDefinition, WorkflowTrigger,
};
use crate::Result;

/// One mutation on a domain object, as seen by the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationInput {
    /// Operation name such as `CREATE` or `UPDATE`
    pub event_type: String,
    pub changed_fields: Vec<String>,
    pub changed_edges: Vec<String>,
    pub added_ids: BTreeMap<String, Vec<String>>,
    pub removed_ids: BTreeMap<String, Vec<String>>,
    pub proposed_changes: Map<String, Value>,
    pub user_id: Option<String>,
    pub data: Map<String, Value>,
}

impl MutationInput {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    /// Set proposed changes; their keys become the changed fields
    pub fn with_changes(mut self, changes: Map<String, Value>) -> Self {
        for field in changes.keys() {
            if !self.changed_fields.contains(field) {
                self.changed_fields.push(field.clone());
            }
        }
        self.proposed_changes = changes;
        self
    }

    pub fn with_edges(mut self, edges: &[&str]) -> Self {
        self.changed_edges = edges.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Changed fields and edges together
    pub fn changed(&self) -> Vec<String> {
        self.changed_fields
            .iter()
            .chain(self.changed_edges.iter())
            .cloned()
            .collect()
    }

    /// Instance context recorded when this mutation starts a workflow
    pub fn to_context(&self) -> InstanceContext {
        InstanceContext {
            version: 1,
            event_type: self.event_type.to_ascii_uppercase(),
            changed_fields: self.changed_fields.clone(),
            changed_edges: self.changed_edges.clone(),
            added_ids: self.added_ids.clone(),
            removed_ids: self.removed_ids.clone(),
            proposed_changes: self.proposed_changes.clone(),
            trigger_user_id: self.user_id.clone(),
            data: self.data.clone(),
            ..Default::default()
        }
    }
}

/// Finds definitions that apply to a mutation
pub struct TriggerMatcher {
    storage: Arc<dyn WorkflowStorage>,
    evaluator: Arc<ExpressionEvaluator>,
}

impl TriggerMatcher {
    pub fn new(storage: Arc<dyn WorkflowStorage>, evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self { storage, evaluator }
    }

    /// Active definitions with at least one matching trigger
    pub async fn find_matching_definitions(
        &self,
        caller: &CallerContext,
        object: &dyn DomainObject,
        input: &MutationInput,
    ) -> Result<Vec<WorkflowDefinition>> {
        let org_id = caller.org_id()?;
        let operation = input.event_type.to_ascii_uppercase();
        let candidates = self
            .storage
            .find_trigger_candidates(org_id, object.object_type(), &operation, &input.changed())
            .await?;

        let vars = ExpressionVars::from_context(object.to_value(), &input.to_context());
        let matched: Vec<_> = candidates
            .into_iter()
            .filter(|definition| {
                definition.document.triggers.iter().any(|trigger| {
                    match self.trigger_matches(trigger, object, input, &vars) {
                        Ok(hit) => hit,
                        Err(err) => {
                            warn!(
                                definition_id = %definition.id,
                                error = %err,
                                "trigger expression failed, treating as no match"
                            );
                            false
                        }
                    }
                })
            })
            .collect();

        debug!(
            object_type = object.object_type(),
            operation = %operation,
            matched = matched.len(),
            "trigger matching finished"
        );
        Ok(matched)
    }

    /// Full check of one trigger against one mutation
    pub fn trigger_matches(
        &self,
        trigger: &WorkflowTrigger,
        object: &dyn DomainObject,
        input: &MutationInput,
        vars: &ExpressionVars,
    ) -> Result<bool> {
        if !trigger.operation.eq_ignore_ascii_case(input.event_type.trim()) {
            return Ok(false);
        }

        if let Some(object_type) = trigger.object_type.as_deref().filter(|t| !t.is_empty()) {
            if object_type != object.object_type() {
                return Ok(false);
            }
        }

        if let Some(selector) = &trigger.selector {
            if !selector_matches(selector, object) {
                return Ok(false);
            }
        }

        if !trigger.fields.is_empty() || !trigger.edges.is_empty() {
            let touched = trigger
                .fields
                .iter()
                .any(|f| input.changed_fields.contains(f))
                || trigger.edges.iter().any(|e| input.changed_edges.contains(e));
            if !touched {
                return Ok(false);
            }
        }

        match trigger.expression.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            Some(expression) => self.evaluator.evaluate_bool(expression, vars),
            None => Ok(true),
        }
    }

    /// All conditions must be true; an empty list is true
    pub fn evaluate_conditions(&self, document: &DefinitionDocument, vars: &ExpressionVars) -> Result<bool> {
        for condition in &document.conditions {
            if !self.evaluator.evaluate_bool(&condition.expression, vars)? {
                debug!(expression = %condition.expression, "condition not satisfied");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Every non-empty selector category must match
///
/// Tags and groups match when the object has any of the listed ids. An object
/// without the capability fails a category that lists ids.
pub fn selector_matches(selector: &TriggerSelector, object: &dyn DomainObject) -> bool {
    if !selector.tag_ids.is_empty() {
        let Some(tagged) = object.as_tagged() else {
            return false;
        };
        let tags = tagged.tag_ids();
        if !selector.tag_ids.iter().any(|t| tags.contains(t)) {
            return false;
        }
    }

    if !selector.group_ids.is_empty() {
        let Some(grouped) = object.as_grouped() else {
            return false;
        };
        let groups = grouped.group_ids();
        if !selector.group_ids.iter().any(|g| groups.contains(g)) {
            return false;
        }
    }

    if !selector.object_types.is_empty()
        && !selector.object_types.iter().any(|t| t == object.object_type())
    {
        return false;
    }

    true
}
