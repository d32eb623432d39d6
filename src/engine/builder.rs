// Instance builder
// Creates an instance, its object reference and its proposal in one storage call

use std::sync::Arc;
use tracing::info;

use super::matcher::MutationInput;
use super::storage::{InstanceBundle, ProposalPlan, WorkflowStorage};
use crate::context::CallerContext;
use crate::models::{
    domain_changes_for_domains, DefinitionDocument, InstanceContext, ObjectRef, SubmissionMode,
    WorkflowDefinition, WorkflowInstance, WorkflowObject, WorkflowProposal,
};
use crate::Result;

/// Builds new workflow instances
pub struct InstanceBuilder {
    storage: Arc<dyn WorkflowStorage>,
}

impl InstanceBuilder {
    pub fn new(storage: Arc<dyn WorkflowStorage>) -> Self {
        Self { storage }
    }

    /// The proposal a new instance should stage, if any
    ///
    /// Only pre-commit documents with an approval action stage changes. The
    /// first approval domain touched by the mutation decides the domain key; a
    /// document whose approvals declare no fields gates every proposed change.
    pub fn plan_proposal(document: &DefinitionDocument, input: &MutationInput) -> Option<ProposalPlan> {
        if document.uses_post_commit() || !document.has_approval_action() {
            return None;
        }
        let domain = domain_changes_for_domains(&input.proposed_changes, &document.approval_domains())
            .into_iter()
            .next()?;
        Some(ProposalPlan {
            domain_key: domain.domain_key,
            changes: domain.changes,
            submit: document.approval_submission_mode == SubmissionMode::AutoSubmit,
            submitted_by: input.user_id.clone(),
        })
    }

    /// Create the instance together with its object reference and proposal
    ///
    /// An active proposal for the same object and domain is reused, so two
    /// instances gating the same fields share one proposal.
    pub async fn build(
        &self,
        caller: &CallerContext,
        definition: &WorkflowDefinition,
        object: &WorkflowObject,
        context: InstanceContext,
        plan: Option<ProposalPlan>,
    ) -> Result<(WorkflowInstance, Option<WorkflowProposal>)> {
        let org_id = caller.org_id()?;
        let instance = WorkflowInstance::new(
            org_id,
            &definition.id,
            &object.id,
            &object.object_type,
            definition.document.snapshot(),
            context,
        );
        let bundle = InstanceBundle {
            object_ref: ObjectRef::new(org_id, &instance.id, object),
            instance,
            proposal: plan,
        };

        let (instance, proposal) = self.storage.create_instance_bundle(bundle).await?;
        info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            object_id = %object.id,
            proposal_id = ?instance.proposal_id,
            "workflow instance created"
        );
        Ok((instance, proposal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{ActionType, ApprovalTiming, ProposalState, WorkflowAction, WorkflowTrigger};
    use serde_json::{json, Map, Value};

    fn create_test_definition(timing: ApprovalTiming) -> WorkflowDefinition {
        WorkflowDefinition::new("org-1", "Status approval", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE").with_fields(&["status"]))
            .with_action(WorkflowAction::new(
                "approve",
                ActionType::RequestApproval,
                json!({ "targets": [{ "type": "USER", "id": "bob" }], "fields": ["status"] }),
            ))
            .with_timing(timing)
    }

    fn changes(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_plan_scopes_changes_to_domain() {
        let definition = create_test_definition(ApprovalTiming::PreCommit);
        let input = MutationInput::new("UPDATE")
            .with_changes(changes(json!({ "status": "approved", "name": "Renamed" })))
            .with_user("alice");

        let plan = InstanceBuilder::plan_proposal(&definition.document, &input).unwrap();
        assert_eq!(plan.domain_key, "status");
        assert_eq!(plan.changes, changes(json!({ "status": "approved" })));
        assert!(plan.submit);
        assert_eq!(plan.submitted_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_no_plan_for_post_commit_or_untouched_domain() {
        let input = MutationInput::new("UPDATE").with_changes(changes(json!({ "status": "approved" })));
        let post = create_test_definition(ApprovalTiming::PostCommit);
        assert!(InstanceBuilder::plan_proposal(&post.document, &input).is_none());

        let pre = create_test_definition(ApprovalTiming::PreCommit);
        let other = MutationInput::new("UPDATE").with_changes(changes(json!({ "name": "x" })));
        assert!(InstanceBuilder::plan_proposal(&pre.document, &other).is_none());
    }

    #[tokio::test]
    async fn test_instances_share_active_proposal() {
        let storage = Arc::new(InMemoryStorage::new());
        let builder = InstanceBuilder::new(storage.clone());
        let caller = CallerContext::new("org-1", "alice");
        let definition = create_test_definition(ApprovalTiming::PreCommit);
        let object = WorkflowObject::new("Policy", changes(json!({ "status": "draft" }))).with_id("pol-1");

        let first_input = MutationInput::new("UPDATE").with_changes(changes(json!({ "status": "review" })));
        let plan = InstanceBuilder::plan_proposal(&definition.document, &first_input);
        let (first, proposal) = builder
            .build(&caller, &definition, &object, first_input.to_context(), plan)
            .await
            .unwrap();
        let proposal = proposal.unwrap();
        assert_eq!(proposal.state, ProposalState::Submitted);
        assert_eq!(first.proposal_id.as_deref(), Some(proposal.id.as_str()));

        let second_input = MutationInput::new("UPDATE").with_changes(changes(json!({ "status": "final" })));
        let plan = InstanceBuilder::plan_proposal(&definition.document, &second_input);
        let (second, reused) = builder
            .build(&caller, &definition, &object, second_input.to_context(), plan)
            .await
            .unwrap();
        let reused = reused.unwrap();
        assert_eq!(reused.id, proposal.id);
        assert_eq!(reused.changes["status"], "final");
        assert_ne!(reused.proposed_hash, proposal.proposed_hash);
        assert_eq!(second.proposal_id, first.proposal_id);

        let refs = storage.list_object_refs("org-1", "pol-1").await.unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[tokio::test]
    async fn test_post_commit_snapshot_uses_reviews() {
        let storage = Arc::new(InMemoryStorage::new());
        let builder = InstanceBuilder::new(storage);
        let definition = create_test_definition(ApprovalTiming::PostCommit);
        let object = WorkflowObject::new("Policy", Map::new()).with_id("pol-2");

        let (instance, proposal) = builder
            .build(&CallerContext::new("org-1", "alice"), &definition, &object, InstanceContext::default(), None)
            .await
            .unwrap();
        assert!(proposal.is_none());
        assert_eq!(instance.definition_snapshot.actions[0].action_type, ActionType::RequestReview);
    }
}
