//! Core orchestration logic.
//!
//! This module contains:
//! - Store: persistence contract + memory/sqlite backings
//! - Safety: the filter/gate admission pipeline
//! - Service: admission, claim, and completion operations
//! - Audit: append-only decision trail

pub mod audit;
pub mod safety;
pub mod service;
pub mod sqlite_store;
pub mod store;

// Re-export commonly used types
pub use audit::{AuditLog, AuditRecord};
pub use safety::{
    standard_pipeline, EvaluationError, FilterVerdict, GateOutcome, GateStage, Phase,
    PipelineContext, RiskLevel, SafetyAction, SafetyAssessment, SafetyDecision, SafetyPipeline,
    SafetySettings,
};
pub use service::{
    ClaimJobInput, ClaimJobOutcome, CommandCreationOutcome, CompleteJobInput, CompleteJobOutcome,
    CompletionStatus, OrchestratorService, OrgCapabilities, RegisterConnectorOutcome,
};
pub use sqlite_store::SqliteStore;
pub use store::{CommandPatch, CommandStore, MemoryStore, NewCommand, StoreError};
