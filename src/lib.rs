//! praetor - command/job orchestration core
//!
//! Commands issued against an org are gated through a safety-and-policy
//! pipeline, persisted as claimable jobs for typed workers
//! (director / safety / domain), and completed under the same pipeline.
//! Every request is checked against org-level access compliance and
//! per-scope rate limits before it reaches the orchestrator.
//!
//! # Architecture
//!
//! - Admission: validate payload -> pre-phase filters/gates -> enqueue
//! - Claim: atomic conditional pending -> processing in the store
//! - Completion: result validation -> post-phase filters/gates -> terminal
//!   status propagated from job to command
//!
//! # Modules
//!
//! - `access`: org access compliance gate (MFA, IP allowlist, consent, CoE)
//! - `core`: store, safety pipeline, orchestrator service, audit trail
//! - `domain`: commands, jobs, connectors, envelopes, payload schemas
//! - `http`: axum controller and rate limiting
//! - `cli`: command-line interface

pub mod access;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod http;

// Re-export main types at crate root for convenience
pub use access::{ensure_compliant, AccessContext, AccessPolicy, ComplianceError, RequestMeta};
pub use core::{
    ClaimJobInput, ClaimJobOutcome, CommandCreationOutcome, CommandStore, CompleteJobInput,
    CompleteJobOutcome, CompletionStatus, MemoryStore, OrchestratorService, SafetyAction,
    SafetyDecision, SafetyPipeline, SqliteStore, StoreError,
};
pub use domain::{
    Command, CommandEnvelope, CommandKind, CommandStatus, Job, JobStatus, OrgConnector, WorkerKind,
};
