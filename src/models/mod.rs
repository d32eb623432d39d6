// Core domain models for the workflow engine
// Plain data structures with no I/O

//! # Domain Models Module
//!
//! This module contains the data the engine reads and writes. Nothing here talks
//! to storage or the event bus; behaviour lives in `engine/`.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization
//! This `mod.rs` file is the entry point for the `models` directory. Each
//! `pub mod` line includes the matching `.rs` file as a submodule.
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom let callers write
//! `use workflow_engine::models::WorkflowInstance` instead of the full path.

// Action kinds, targets and typed parameters
pub mod action;

// Assignments and their approval/invalidation metadata
pub mod assignment;

// Append-only audit events
pub mod event;

// Workflow instances and their execution context
pub mod instance;

// Integration run records
pub mod integration;

// Notification records and templates
pub mod notification;

// Domain objects, capability traits and object references
pub mod object;

// Proposals, approval domains and proposal hashing
pub mod proposal;

// Workflow definitions: triggers, conditions and actions
pub mod workflow;

/// Re-export action types
pub use action::{
    ActionParams, ActionType, ApprovalParams, FieldUpdateParams, IntegrationParams, NotifyParams,
    TargetConfig, TargetType, WebhookParams, WorkflowAction,
};

/// Re-export assignment types
pub use assignment::{
    assignment_key, ApprovalMetadata, AssignmentStatus, AssignmentTarget, InvalidationMetadata,
    RejectionMetadata, WorkflowAssignment, CHANGE_REQUEST_PREFIX, REQUESTER_ROLE,
};

/// Re-export audit event types
pub use event::{WorkflowEventRecord, WorkflowEventType};

/// Re-export instance types
pub use instance::{InstanceContext, InstanceState, WorkflowInstance};

/// Re-export integration run types
pub use integration::{IntegrationRun, IntegrationRunStatus};

/// Re-export notification types
pub use notification::{Channel, NotificationRecord, NotificationTemplate};

/// Re-export object types and capability traits
pub use object::{DomainObject, HasGroups, HasTags, ObjectRef, WorkflowObject};

/// Re-export proposal types and domain helpers
pub use proposal::{
    canonical_json, compute_proposal_hash, domain_changes_for_domains, domain_key,
    filter_changes_for_domain, normalize_fields, split_changes_by_domains, DomainChanges,
    ProposalState, WorkflowProposal,
};

/// Re-export definition types
pub use workflow::{
    ApprovalTiming, DefinitionDocument, SubmissionMode, TriggerSelector, WorkflowCondition,
    WorkflowDefinition, WorkflowTrigger,
};
