// Workflow Engine - Rust Edition
// Event-driven approval workflows that react to domain object mutations

//! # Workflow Engine Library
//!
//! This is the main library crate for the workflow engine. A mutation on a domain
//! object is matched against declarative workflow definitions; every matching
//! definition spins up a stateful instance that walks through an ordered list of
//! actions (approvals, reviews, notifications, webhooks, field updates and
//! integrations) until it completes or fails.
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`WorkflowDefinition`]: triggers, conditions and actions
//! - [`WorkflowInstance`]: one execution of a definition against one object
//! - [`WorkflowProposal`]: changes staged until approval quorum is reached
//! - [`WorkflowAssignment`]: one person's approval or review task
//! - [`WorkflowEventRecord`]: append-only audit trail
//!
//! ### Engine (`engine`)
//! - [`ExpressionEvaluator`]: sandboxed expressions with timeout and cost limits
//! - [`TriggerMatcher`]: finds definitions that apply to a mutation
//! - [`ActionExecutor`]: per-action side effects
//! - [`WorkflowListeners`]: the event-driven state machine
//! - [`Emitter`] / [`Reconciler`]: at-least-once event delivery
//! - [`WorkflowEngine`]: the facade tying everything together
//!
//! **Usage Example:**
//! ```rust,no_run
//! use workflow_engine::{CallerContext, EngineConfig, WorkflowEngine};
//!
//! # async fn demo() -> workflow_engine::Result<()> {
//! let engine = WorkflowEngine::in_memory(EngineConfig::default())?;
//! let caller = CallerContext::new("org-1", "user-1");
//! let report = engine.reconcile(&caller).await?;
//! println!("recovered {} emissions", report.recovered);
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Module System
//! Each `pub mod` pulls in either a `.rs` file or a directory with a `mod.rs`.
//!
//! ### Re-exports
//! `pub use` statements flatten the API so callers can write
//! `use workflow_engine::WorkflowEngine` instead of the full module path.
//!
//! ### Error Handling
//! All fallible operations return [`Result<T>`], an alias over [`WorkflowError`].
//! The `?` operator converts wrapped errors through the `#[from]` conversions.

// Layered runtime configuration
pub mod config;

// Caller identity and organization scoping
pub mod context;

// Core domain models (pure data)
pub mod models;

// Execution engine: storage, events, evaluation and orchestration
pub mod engine;

// Re-export core domain types for easy access
pub use config::EngineConfig;
pub use context::CallerContext;
pub use models::{
    ActionType, AssignmentStatus, DefinitionDocument, InstanceContext, InstanceState, ProposalState,
    TargetConfig, TargetType, WorkflowAction, WorkflowAssignment, WorkflowDefinition,
    WorkflowEventRecord, WorkflowEventType, WorkflowInstance, WorkflowObject, WorkflowProposal,
    WorkflowTrigger,
};

// Re-export engine types
pub use engine::{
    ActionExecutor, EmitFailureDetails, Emitter, EngineEvent, EventBus, EventEnvelope,
    EventPublisher, ExpressionEvaluator, InMemoryStorage, MutationInput, ReconcileReport,
    Reconciler, TriggerMatcher, WorkflowEngine, WorkflowListeners, WorkflowStorage,
};

/// Error types for the workflow engine
///
/// Variants are grouped the way failures are handled:
/// configuration errors fail fast, evaluation errors are reported to whoever asked
/// for the evaluation, execution errors fail the running action, and delivery
/// errors are recorded for reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // Configuration errors
    #[error("Invalid action type: {0}")]
    InvalidActionType(String),

    #[error("Invalid target type: {0}")]
    InvalidTargetType(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("Expression failed to compile: {0}")]
    ExpressionCompile(String),

    #[error("Webhook url is required")]
    WebhookUrlRequired,

    #[error("Only one of template_id or template_key may be set")]
    TemplateReferenceConflict,

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // Evaluation errors
    #[error("Expression evaluation failed: {0}")]
    ExpressionEvaluation(String),

    #[error("Expression evaluation timed out after {0}ms")]
    ExpressionTimeout(u64),

    #[error("Expression exceeded its cost limit of {0}")]
    ExpressionCostLimit(u64),

    #[error("Expression returned {actual}, expected {expected}")]
    ExpressionTypeMismatch { expected: String, actual: String },

    // Resolution errors
    #[error("Approval action {0} resolved no targets")]
    ApprovalNoTargets(String),

    #[error("Review action {0} resolved no targets")]
    ReviewNoTargets(String),

    #[error("Unsupported notification channel: {0}")]
    UnsupportedChannel(String),

    // Execution errors
    #[error("Webhook delivery failed: {0}")]
    WebhookFailed(String),

    #[error("Notification template data is invalid: {0}")]
    TemplateDataInvalid(String),

    #[error("Integration failed: {0}")]
    IntegrationFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Lifecycle and caller errors
    #[error("Workflow already active: {0}")]
    WorkflowAlreadyActive(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Organization is missing from the caller context")]
    MissingOrganization,

    #[error("User is missing from the caller context")]
    MissingUser,

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Event emission failed: {0}")]
    EmitFailed(String),

    // Wrapped errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(true)
            }
            WorkflowError::WebhookFailed(_)
            | WorkflowError::EmitFailed(_)
            | WorkflowError::Storage(_) => true,
            _ => false,
        }
    }

    /// True for the "no targets" outcomes that the orchestrator treats as a skip
    pub fn is_no_targets(&self) -> bool {
        matches!(
            self,
            WorkflowError::ApprovalNoTargets(_) | WorkflowError::ReviewNoTargets(_)
        )
    }
}

// Convert IO errors (reading definition files in the admin CLI)
impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::Internal(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, WorkflowError>;
