//! Jobs: the dispatchable units derived from commands.
//!
//! A job is the claimable side of a command for one worker category. The
//! pending -> processing transition happens only through the store's atomic
//! claim primitive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::command::WorkerKind;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a transition to `next` is allowed.
    ///
    /// pending -> processing is excluded here on purpose: that edge belongs
    /// exclusively to the store's claim primitive.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Processing, Self::Completed) | (Self::Processing, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    pub org_id: String,

    pub command_id: Uuid,

    pub worker: WorkerKind,

    /// Specific domain agent, when the command pinned one
    pub domain_agent: Option<String>,

    pub status: JobStatus,

    /// Incremented exactly once per successful claim, never decremented
    pub attempts: u32,

    pub scheduled_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub failed_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Carries admission flags such as `hitl: true`
    pub metadata: serde_json::Value,
}

impl Job {
    /// Whether human-in-the-loop review was flagged at admission.
    pub fn needs_hitl(&self) -> bool {
        self.metadata
            .get("hitl")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Mutable fields written alongside a job status change.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
