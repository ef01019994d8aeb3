//! Domain types for the orchestration core.
//!
//! - Commands: units of intent issued against an org
//! - Jobs: the claimable units derived from commands
//! - Connectors: org-owned integration endpoints
//! - Envelopes: the command+job+connector bundle workers execute

pub mod command;
pub mod connector;
pub mod envelope;
pub mod job;
pub mod payload;

// Re-export commonly used types
pub use command::{Command, CommandReceipt, CommandStatus, CreateCommandInput, WorkerKind};
pub use connector::{OrgConnector, RegisterConnectorInput};
pub use envelope::CommandEnvelope;
pub use job::{Job, JobPatch, JobStatus};
pub use payload::{CommandKind, PayloadError};
