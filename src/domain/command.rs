//! Commands: units of intent issued against an org.
//!
//! A command is created only after it survives payload validation and the
//! pre-phase safety pipeline. Once stored it is never deleted; terminal
//! status is reached through job completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker categories that claim jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Planning worker (produces director plans)
    Director,

    /// Review worker (produces safety assessments)
    Safety,

    /// Execution worker (runs domain actions)
    Domain,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Director => "director",
            Self::Safety => "safety",
            Self::Domain => "domain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "director" => Some(Self::Director),
            "safety" => Some(Self::Safety),
            "domain" => Some(Self::Domain),
            _ => None,
        }
    }
}

/// Lifecycle status of a command.
///
/// Transitions are monotonic: queued -> dispatched -> {completed|failed}.
/// `Rejected` is terminal and only reachable pre-persistence; a command
/// blocked at admission is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Dispatched,
    Completed,
    Failed,
    Rejected,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "dispatched" => Some(Self::Dispatched),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Whether a transition to `next` is allowed.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Dispatched)
                | (Self::Queued, Self::Completed)
                | (Self::Queued, Self::Failed)
                | (Self::Dispatched, Self::Completed)
                | (Self::Dispatched, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

/// A stored command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,

    pub org_id: String,

    pub session_id: Option<String>,

    /// String tag identifying the command kind (see `CommandKind`)
    pub command_type: String,

    /// Structured payload; shape is kind-specific
    pub payload: serde_json::Value,

    /// Higher runs sooner
    pub priority: i32,

    pub scheduled_for: DateTime<Utc>,

    pub status: CommandStatus,

    /// Immutable after creation
    pub worker: WorkerKind,

    pub issued_by: String,

    /// Connectors this command depends on (never cascading-deleted)
    pub connector_dependencies: Vec<Uuid>,

    pub result: Option<serde_json::Value>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Input to command creation, before admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommandInput {
    pub org_id: String,

    #[serde(default)]
    pub session_id: Option<String>,

    pub command_type: String,

    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,

    #[serde(default)]
    pub worker: Option<WorkerKind>,

    pub issued_by: String,

    #[serde(default)]
    pub connector_dependencies: Vec<Uuid>,
}

fn default_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Receipt returned once a command and its initial job are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub command_id: Uuid,
    pub job_id: Uuid,
    pub session_id: Option<String>,
    pub status: CommandStatus,
    pub scheduled_for: DateTime<Utc>,
}
