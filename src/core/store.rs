//! Persistence contract for commands, jobs, and connectors.
//!
//! `claim_job` is the one correctness-critical primitive: an atomic
//! conditional transition pending -> processing. No other code path may
//! perform that transition. Everything else is append-mostly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    Command, CommandEnvelope, CommandReceipt, CommandStatus, Job, JobPatch, JobStatus,
    OrgConnector, RegisterConnectorInput, WorkerKind,
};

/// Store-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// A validated, admitted command ready to be stored with its initial job.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub org_id: String,
    pub session_id: Option<String>,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_for: chrono::DateTime<Utc>,
    pub worker: WorkerKind,
    pub issued_by: String,
    pub connector_dependencies: Vec<Uuid>,
    pub domain_agent: Option<String>,
    /// Seed metadata for the job row (e.g. `hitl: true`)
    pub job_metadata: serde_json::Value,
}

/// Mutable fields written alongside a command status change.
#[derive(Debug, Clone, Default)]
pub struct CommandPatch {
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

/// Durable, concurrency-safe persistence for the orchestration core.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a command and its initial job atomically.
    async fn enqueue_command(&self, input: NewCommand) -> Result<CommandReceipt, StoreError>;

    async fn command(&self, command_id: Uuid) -> Result<Option<Command>, StoreError>;

    async fn job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Join command + job + connector context for worker execution.
    async fn command_envelope(
        &self,
        command_id: Uuid,
    ) -> Result<Option<CommandEnvelope>, StoreError>;

    /// Pending jobs scoped to (org, worker), due now, ordered by priority
    /// desc then scheduled_at asc.
    async fn list_pending_jobs(
        &self,
        org_id: &str,
        worker: WorkerKind,
        limit: usize,
    ) -> Result<Vec<CommandEnvelope>, StoreError>;

    /// Atomic conditional transition pending -> processing. Returns false
    /// (no-op) if the job is not currently pending. Increments `attempts`
    /// and marks the parent command dispatched in the same operation.
    async fn claim_job(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Monotonic job status write (processing -> completed|failed only).
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<(), StoreError>;

    /// Monotonic command status write.
    async fn update_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        patch: CommandPatch,
    ) -> Result<(), StoreError>;

    async fn list_commands_for_session(
        &self,
        org_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError>;

    async fn list_org_connectors(&self, org_id: &str) -> Result<Vec<OrgConnector>, StoreError>;

    async fn connectors_by_ids(
        &self,
        org_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<OrgConnector>, StoreError>;

    async fn register_connector(
        &self,
        input: RegisterConnectorInput,
    ) -> Result<Uuid, StoreError>;
}

// ── In-memory backing ──────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    commands: HashMap<Uuid, Command>,
    jobs: HashMap<Uuid, Job>,
    connectors: HashMap<Uuid, OrgConnector>,
}

/// HashMap-backed store for tests and single-process deployments. All
/// state sits behind one async mutex, which makes `claim_job`'s
/// check-and-set atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row counts (commands, jobs) — used by admission tests to assert
    /// nothing was persisted on rejection.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.commands.len(), inner.jobs.len())
    }
}

fn build_envelope(inner: &MemoryInner, job: &Job) -> Option<CommandEnvelope> {
    let command = inner.commands.get(&job.command_id)?.clone();
    let connectors = command
        .connector_dependencies
        .iter()
        .filter_map(|id| inner.connectors.get(id))
        .cloned()
        .collect();
    Some(CommandEnvelope {
        command,
        job: job.clone(),
        connectors,
    })
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn enqueue_command(&self, input: NewCommand) -> Result<CommandReceipt, StoreError> {
        let now = Utc::now();
        let command_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let command = Command {
            id: command_id,
            org_id: input.org_id.clone(),
            session_id: input.session_id.clone(),
            command_type: input.command_type,
            payload: input.payload,
            priority: input.priority,
            scheduled_for: input.scheduled_for,
            status: CommandStatus::Queued,
            worker: input.worker,
            issued_by: input.issued_by,
            connector_dependencies: input.connector_dependencies,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let job = Job {
            id: job_id,
            org_id: input.org_id,
            command_id,
            worker: input.worker,
            domain_agent: input.domain_agent,
            status: JobStatus::Pending,
            attempts: 0,
            scheduled_at: input.scheduled_for,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            metadata: input.job_metadata,
        };

        let receipt = CommandReceipt {
            command_id,
            job_id,
            session_id: input.session_id,
            status: CommandStatus::Queued,
            scheduled_for: command.scheduled_for,
        };

        let mut inner = self.inner.lock().await;
        inner.commands.insert(command_id, command);
        inner.jobs.insert(job_id, job);
        Ok(receipt)
    }

    async fn command(&self, command_id: Uuid) -> Result<Option<Command>, StoreError> {
        Ok(self.inner.lock().await.commands.get(&command_id).cloned())
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn command_envelope(
        &self,
        command_id: Uuid,
    ) -> Result<Option<CommandEnvelope>, StoreError> {
        let inner = self.inner.lock().await;
        let job = inner.jobs.values().find(|j| j.command_id == command_id);
        Ok(job.and_then(|j| build_envelope(&inner, j)))
    }

    async fn list_pending_jobs(
        &self,
        org_id: &str,
        worker: WorkerKind,
        limit: usize,
    ) -> Result<Vec<CommandEnvelope>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;

        let mut envelopes: Vec<CommandEnvelope> = inner
            .jobs
            .values()
            .filter(|j| {
                j.org_id == org_id
                    && j.worker == worker
                    && j.status == JobStatus::Pending
                    && j.scheduled_at <= now
            })
            .filter_map(|j| build_envelope(&inner, j))
            .collect();

        envelopes.sort_by_key(|e| e.dispatch_key());
        envelopes.truncate(limit);
        Ok(envelopes)
    }

    async fn claim_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let command_id = match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.started_at = Some(now);
                job.command_id
            }
            _ => return Ok(false),
        };

        if let Some(command) = inner.commands.get_mut(&command_id) {
            if command.status == CommandStatus::Queued {
                command.status = CommandStatus::Dispatched;
                command.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;

        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "job",
                from: job.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        job.status = status;
        if patch.started_at.is_some() {
            job.started_at = patch.started_at;
        }
        if patch.completed_at.is_some() {
            job.completed_at = patch.completed_at;
        }
        if patch.failed_at.is_some() {
            job.failed_at = patch.failed_at;
        }
        if patch.last_error.is_some() {
            job.last_error = patch.last_error;
        }
        if let Some(metadata) = patch.metadata {
            job.metadata = metadata;
        }
        Ok(())
    }

    async fn update_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        patch: CommandPatch,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let command = inner
            .commands
            .get_mut(&command_id)
            .ok_or(StoreError::NotFound("command"))?;

        if !command.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "command",
                from: command.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        command.status = status;
        if patch.result.is_some() {
            command.result = patch.result;
        }
        if patch.last_error.is_some() {
            command.last_error = patch.last_error;
        }
        command.updated_at = Utc::now();
        Ok(())
    }

    async fn list_commands_for_session(
        &self,
        org_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let inner = self.inner.lock().await;
        let mut commands: Vec<Command> = inner
            .commands
            .values()
            .filter(|c| c.org_id == org_id && c.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        commands.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        commands.truncate(limit);
        Ok(commands)
    }

    async fn list_org_connectors(&self, org_id: &str) -> Result<Vec<OrgConnector>, StoreError> {
        let inner = self.inner.lock().await;
        let mut connectors: Vec<OrgConnector> = inner
            .connectors
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect();
        connectors.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(connectors)
    }

    async fn connectors_by_ids(
        &self,
        org_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<OrgConnector>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.connectors.get(id))
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn register_connector(
        &self,
        input: RegisterConnectorInput,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let connector = OrgConnector {
            id,
            org_id: input.org_id,
            connector_type: input.connector_type,
            name: input.name,
            status: input.status,
            config: input.config,
            metadata: input.metadata,
            created_by: input.created_by,
            created_at: Utc::now(),
        };
        self.inner.lock().await.connectors.insert(id, connector);
        Ok(id)
    }
}
