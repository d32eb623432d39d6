// Approval quorum resolution

//! # Quorum Resolution
//!
//! Given the assignments of one approval (or review) action, decide whether the
//! action is still waiting, satisfied, or failed:
//!
//! 1. A rejection or change request from a **required** assignment fails it at once.
//! 2. With a quorum count `n > 0`, it is satisfied as soon as `n` approvals exist,
//!    even if others are still pending, and fails only when nothing is pending
//!    and fewer than `n` approved.
//! 3. With no count, it is satisfied once nothing is pending.
//!
//! The quorum count comes from the assignment metadata, falling back to the
//! action params; an optional approval with no count needs one approval.

use crate::models::{ApprovalMetadata, AssignmentStatus, WorkflowAction, WorkflowAssignment};

/// Outcome of evaluating one approval group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResolution {
    Pending,
    Satisfied,
    Failed,
}

/// Status tally for a group of assignments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssignmentStatusCounts {
    pub approved: usize,
    pub pending: usize,
    pub rejected: usize,
    pub changes_requested: usize,
    pub rejected_required: bool,
    pub changes_requested_required: bool,
}

impl AssignmentStatusCounts {
    pub fn total(&self) -> usize {
        self.approved + self.pending + self.rejected + self.changes_requested
    }
}

/// Tally assignment statuses, noting which negative decisions were blocking
pub fn count_assignment_status(assignments: &[WorkflowAssignment]) -> AssignmentStatusCounts {
    assignments
        .iter()
        .fold(AssignmentStatusCounts::default(), |mut counts, assignment| {
            match assignment.status {
                AssignmentStatus::Approved => counts.approved += 1,
                AssignmentStatus::Pending => counts.pending += 1,
                AssignmentStatus::Rejected => {
                    counts.rejected += 1;
                    counts.rejected_required |= assignment.required;
                }
                AssignmentStatus::ChangesRequested => {
                    counts.changes_requested += 1;
                    counts.changes_requested_required |= assignment.required;
                }
            }
            counts
        })
}

/// Resolve a group against its quorum count
pub fn resolve_approval(required_count: usize, counts: &AssignmentStatusCounts) -> ApprovalResolution {
    if counts.rejected_required || counts.changes_requested_required {
        return ApprovalResolution::Failed;
    }

    if required_count > 0 {
        if counts.approved >= required_count {
            return ApprovalResolution::Satisfied;
        }
        if counts.pending == 0 {
            return ApprovalResolution::Failed;
        }
        return ApprovalResolution::Pending;
    }

    if counts.pending > 0 {
        ApprovalResolution::Pending
    } else {
        ApprovalResolution::Satisfied
    }
}

/// Quorum count for an action, preferring the count stamped on the assignment
pub fn required_approval_count(action: &WorkflowAction, meta: &ApprovalMetadata, required: bool) -> usize {
    let mut count = meta.required_count;
    if count == 0 {
        count = action
            .approval_params()
            .and_then(|p| p.required_count)
            .filter(|c| *c > 0)
            .map(|c| c as usize)
            .unwrap_or(0);
    }
    if count == 0 && !required {
        count = 1;
    }
    count
}

/// Human readable reason a group failed
pub fn failure_message(counts: &AssignmentStatusCounts, required_count: usize, resolved_targets: usize) -> String {
    if counts.rejected_required {
        return "approval rejected by a required approver".to_string();
    }
    if counts.changes_requested_required {
        return "changes requested by a required approver".to_string();
    }
    if required_count > 0 && resolved_targets < required_count {
        return format!(
            "quorum unreachable: {} approvals required but only {} approvers resolved",
            required_count, resolved_targets
        );
    }
    if required_count > 0 && counts.approved < required_count {
        return format!(
            "quorum not met: {} of {} required approvals",
            counts.approved, required_count
        );
    }
    "approval failed".to_string()
}
