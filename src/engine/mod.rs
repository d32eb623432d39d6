// Workflow Engine
// Storage, event delivery, evaluation and orchestration

//! # Engine Module
//!
//! Everything that has behaviour lives here; `models/` only holds data.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: plain data (in `models/`)
//! - **Engine Layer**: this module
//! - **Binaries**: the event-loop server and the admin CLI (in `bin/`)
//!
//! ## Engine Components
//!
//! ### Storage (`storage` module)
//! - The [`WorkflowStorage`] trait with predicate reads and conditional writes
//! - [`InMemoryStorage`] for development and tests
//!
//! ### Events (`events`, `emit` modules)
//! - [`EngineEvent`] payloads wrapped in an [`EventEnvelope`]
//! - [`EventBus`] for in-process fan-out
//! - [`Emitter`] records failed deliveries and [`Reconciler`] replays them
//!
//! ### Evaluation (`expression`, `matcher`, `quorum` modules)
//! - Sandboxed Rhai expressions with a deadline and operation budget
//! - Trigger and condition matching for mutations
//! - Pure quorum resolution over assignment counts
//!
//! ### Actions (`executor`, `resolver`, `notifications`, `webhook`, `integrations`)
//! - Target resolution to user ids
//! - In-app and external notifications
//! - Signed webhook delivery with retries
//! - Provider integrations run off the event loop
//!
//! ### Orchestration (`listeners`, `builder`, `proposals`, `workflow` modules)
//! - The event-driven state machine in [`WorkflowListeners`]
//! - Proposal staging, application and invalidation
//! - The [`WorkflowEngine`] facade
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for API Design
//! The `pub use` statements flatten the hierarchy, so callers import
//! `workflow_engine::engine::WorkflowEngine` without knowing which file it is in.

// Instance creation alongside proposals and object references
pub mod builder;

// Emission with failure recording, and reconciliation
pub mod emit;

// Engine events, envelopes and the in-process bus
pub mod events;

// Per-action side effects
pub mod executor;

// Sandboxed expression evaluation and templating
pub mod expression;

// Provider integrations
pub mod integrations;

// Event handlers driving instances forward
pub mod listeners;

// Trigger and condition matching
pub mod matcher;

// In-app and external notifications
pub mod notifications;

// Proposal lifecycle and approval invalidation
pub mod proposals;

// Quorum resolution
pub mod quorum;

// Target resolution
pub mod resolver;

/// Storage abstraction layer
///
/// Contains:
/// - The storage trait with conditional instance updates
/// - In-memory implementation
pub mod storage;

// Definition validation
pub mod validation;

// Outbound webhooks
pub mod webhook;

// Engine facade
pub mod workflow;

pub use builder::InstanceBuilder;
pub use emit::{EmitFailureDetails, Emitter, ReconcileReport, Reconciler};
pub use events::{EngineEvent, EventBus, EventEnvelope, EventPublisher};
pub use executor::{ActionExecutor, ActionOutcome};
pub use expression::{ExpressionEvaluator, ExpressionVars};
pub use integrations::{IntegrationCall, IntegrationOperator, IntegrationRegistry, IntegrationRunner};
pub use listeners::WorkflowListeners;
pub use matcher::{MutationInput, TriggerMatcher};
pub use notifications::{ChannelMessage, ChannelSender, NotificationDispatcher};
pub use proposals::{ProposalManager, ProposalUpdate};
pub use quorum::{required_approval_count, resolve_approval, ApprovalResolution, AssignmentStatusCounts};
pub use resolver::{Directory, InMemoryDirectory, ResolverFn, TargetResolver};
pub use storage::{InMemoryStorage, InstanceFilter, InstanceUpdate, StateGuard, WorkflowStorage};
pub use validation::validate_definition;
pub use webhook::WebhookDispatcher;
pub use workflow::{MutationOutcome, WorkflowEngine, WorkflowEngineBuilder};
