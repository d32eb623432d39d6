// Proposal lifecycle
// Staged changes that wait for approval before touching the live object

//! # Proposal Manager
//!
//! A proposal holds field changes for one approval domain of one object. The
//! manager creates proposals, submits them, applies them onto the live object once
//! quorum is met, and handles edits to a proposal that approvers already signed off.
//!
//! ## Edit Invalidation
//!
//! Approving an assignment stamps the proposal hash the approver saw. When the
//! changes of a submitted proposal are edited, every approved assignment whose
//! stamp no longer matches goes back to `Pending` with [`InvalidationMetadata`]
//! recording why. An approval of A can never count as an approval of B.
//!
//! ## Rust Learning Notes:
//!
//! - `Arc<dyn WorkflowStorage>` lets the manager share the store with the rest of the engine
//! - Returning `Result<bool>` from `apply` separates "failed" from "nothing to do"

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::{InstanceFilter, WorkflowStorage};
use crate::context::CallerContext;
use crate::models::{
    AssignmentStatus, InvalidationMetadata, NotificationRecord, ProposalState, WorkflowAssignment,
    WorkflowEventRecord, WorkflowEventType, WorkflowObject, WorkflowProposal,
};
use crate::{Result, WorkflowError};

pub const INVALIDATION_REASON: &str = "proposal changes edited after approval";
pub const INVALIDATION_NOTIFICATION_TYPE: &str = "workflow.approval_invalidated";
const INVALIDATION_TITLE: &str = "Approval Required: Changes Updated";
const INVALIDATION_BODY: &str =
    "The changes you previously approved have been modified. Please review and re-approve.";

/// Result of editing a proposal's changes
#[derive(Debug, Clone)]
pub struct ProposalUpdate {
    pub proposal: WorkflowProposal,
    /// Assignments reset from Approved to Pending by the edit
    pub invalidated: Vec<WorkflowAssignment>,
}

/// Creates, submits, applies and edits proposals
pub struct ProposalManager {
    storage: Arc<dyn WorkflowStorage>,
}

impl ProposalManager {
    pub fn new(storage: Arc<dyn WorkflowStorage>) -> Self {
        Self { storage }
    }

    /// Insert a draft proposal for one domain of an object
    pub async fn create(
        &self,
        caller: &CallerContext,
        object: &WorkflowObject,
        domain_key: &str,
        changes: Map<String, Value>,
    ) -> Result<WorkflowProposal> {
        let org_id = caller.org_id()?;
        let proposal = WorkflowProposal::new(org_id, &object.id, &object.object_type, domain_key, changes)?;
        let proposal = self.storage.create_proposal(proposal).await?;
        debug!(proposal_id = %proposal.id, domain_key, "created proposal");
        Ok(proposal)
    }

    pub async fn get(&self, caller: &CallerContext, proposal_id: &str) -> Result<WorkflowProposal> {
        self.storage
            .get_proposal(caller.org_id()?, proposal_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow proposal {}", proposal_id)))
    }

    /// Draft to Submitted; false when the proposal was not a draft
    pub async fn submit(&self, caller: &CallerContext, proposal_id: &str) -> Result<bool> {
        let rows = self
            .storage
            .transition_proposal(
                caller.org_id()?,
                proposal_id,
                &[ProposalState::Draft],
                ProposalState::Submitted,
                caller.user_id_opt(),
            )
            .await?;
        Ok(rows == 1)
    }

    /// Write the proposal's changes onto the live object
    ///
    /// Only a bypass caller may apply. Applying a terminal proposal is a no-op
    /// that returns false.
    pub async fn apply(&self, caller: &CallerContext, proposal_id: &str) -> Result<bool> {
        if !caller.is_bypass() {
            return Err(WorkflowError::InvalidState(
                "applying a proposal requires a privileged caller".to_string(),
            ));
        }
        let applied = self.storage.apply_proposal(caller.org_id()?, proposal_id).await?;
        if applied {
            info!(proposal_id, "applied proposal to live object");
        } else {
            debug!(proposal_id, "proposal already terminal, nothing applied");
        }
        Ok(applied)
    }

    /// Close a non-terminal proposal without applying it
    pub async fn supersede(&self, caller: &CallerContext, proposal_id: &str) -> Result<bool> {
        let rows = self
            .storage
            .transition_proposal(
                caller.org_id()?,
                proposal_id,
                &ProposalState::non_terminal(),
                ProposalState::Superseded,
                caller.user_id_opt(),
            )
            .await?;
        Ok(rows == 1)
    }

    /// Replace a proposal's changes and invalidate approvals of the old content
    pub async fn update_changes(
        &self,
        caller: &CallerContext,
        proposal_id: &str,
        changes: Map<String, Value>,
    ) -> Result<ProposalUpdate> {
        let org_id = caller.org_id()?;
        let proposal = self
            .storage
            .update_proposal_changes(org_id, proposal_id, &ProposalState::non_terminal(), changes)
            .await?
            .ok_or_else(|| {
                WorkflowError::InvalidState(format!("workflow proposal {} is no longer editable", proposal_id))
            })?;

        let invalidated = if proposal.state == ProposalState::Submitted {
            self.invalidate_stale_approvals(caller, &proposal).await?
        } else {
            Vec::new()
        };

        Ok(ProposalUpdate { proposal, invalidated })
    }

    async fn invalidate_stale_approvals(
        &self,
        caller: &CallerContext,
        proposal: &WorkflowProposal,
    ) -> Result<Vec<WorkflowAssignment>> {
        let org_id = caller.org_id()?;
        let filter = InstanceFilter {
            proposal_id: Some(proposal.id.clone()),
            ..Default::default()
        };
        let instances = self.storage.list_instances(org_id, &filter).await?;
        let mut invalidated = Vec::new();

        for instance in instances {
            let mut reset_here = Vec::new();
            for assignment in self.storage.list_assignments(org_id, &instance.id).await? {
                if assignment.status != AssignmentStatus::Approved || assignment.is_change_request() {
                    continue;
                }
                if assignment.approval.proposed_hash.as_deref() == Some(proposal.proposed_hash.as_str()) {
                    continue;
                }

                let mut reset = assignment.clone();
                reset.invalidation = Some(InvalidationMetadata {
                    reason: INVALIDATION_REASON.to_string(),
                    previous_status: assignment.status,
                    invalidated_at: Utc::now(),
                    invalidated_by: caller.user_id_opt().map(str::to_string),
                    approved_hash: assignment.approval.proposed_hash.clone(),
                    new_proposed_hash: proposal.proposed_hash.clone(),
                });
                reset.status = AssignmentStatus::Pending;
                reset.approval.approved_at = None;
                reset.approval.approved_by = None;
                reset.actor_user_id = None;
                reset.decided_at = None;

                // Lost the race against another decision on the same assignment
                if self.storage.update_assignment(&reset, Some(AssignmentStatus::Approved)).await? == 0 {
                    continue;
                }
                reset_here.push(reset);
            }

            if reset_here.is_empty() {
                continue;
            }

            self.storage
                .record_event(WorkflowEventRecord::new(
                    org_id,
                    &instance.id,
                    WorkflowEventType::AssignmentInvalidated,
                    None,
                    json!({
                        "proposal_id": proposal.id,
                        "domain_key": proposal.domain_key,
                        "invalidated_count": reset_here.len(),
                    }),
                ))
                .await?;

            let ids: Vec<String> = reset_here.iter().map(|a| a.id.clone()).collect();
            for target in self.storage.list_assignment_targets(org_id, &ids).await? {
                if let Some(assignment) = reset_here.iter().find(|a| a.id == target.assignment_id) {
                    self.notify_invalidated(org_id, &target.target_user_id, &instance.id, assignment, proposal)
                        .await;
                }
            }

            warn!(
                instance_id = %instance.id,
                proposal_id = %proposal.id,
                count = reset_here.len(),
                "approvals invalidated by proposal edit"
            );
            invalidated.extend(reset_here);
        }

        Ok(invalidated)
    }

    async fn notify_invalidated(
        &self,
        org_id: &str,
        user_id: &str,
        instance_id: &str,
        assignment: &WorkflowAssignment,
        proposal: &WorkflowProposal,
    ) {
        let mut record = NotificationRecord::new(
            org_id,
            user_id,
            INVALIDATION_TITLE,
            INVALIDATION_BODY,
            INVALIDATION_NOTIFICATION_TYPE,
        );
        record.data = json!({
            "user_id": user_id,
            "instance_id": instance_id,
            "assignment_id": assignment.id,
            "proposal_id": proposal.id,
            "domain_key": proposal.domain_key,
        });
        if let Err(err) = self.storage.create_notification(record).await {
            warn!(user_id, error = %err, "failed to send invalidation notice");
        }
    }
}
