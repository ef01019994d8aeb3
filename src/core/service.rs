//! Orchestrator service: admission, claim, and completion as single
//! logical operations.
//!
//! This is the only component that calls the store with side effects.
//! Dependencies arrive through the constructor; there is no process-wide
//! state.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    CommandEnvelope, CommandKind, CommandReceipt, CommandStatus, CreateCommandInput, JobPatch,
    JobStatus, OrgConnector, RegisterConnectorInput, WorkerKind,
};

use super::audit::{AuditLog, AuditRecord};
use super::safety::{Phase, PipelineContext, SafetyAction, SafetyAssessment, SafetyPipeline};
use super::store::{CommandPatch, CommandStore, NewCommand, StoreError};

/// Default and maximum candidate fetch for a claim call.
const DEFAULT_CLAIM_LIMIT: usize = 10;
const MAX_CLAIM_LIMIT: usize = 50;

/// Outcome of command admission.
#[derive(Debug)]
pub enum CommandCreationOutcome {
    Accepted {
        receipt: CommandReceipt,
        needs_hitl: bool,
        mitigations: Vec<String>,
    },
    /// Pipeline block: nothing persisted.
    Rejected {
        reasons: Vec<String>,
        mitigations: Vec<String>,
    },
    /// Local schema failure: never reaches the pipeline.
    InvalidPayload { code: String, message: String },
}

/// Input to a claim call.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimJobInput {
    pub org_id: String,
    pub worker: WorkerKind,
    pub user_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Outcome of a claim call.
#[derive(Debug)]
pub enum ClaimJobOutcome {
    Claimed { envelope: CommandEnvelope },
    /// Nothing pending, or every claim attempt lost the race.
    NothingToClaim,
}

/// Terminal status a worker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Input to completion.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteJobInput {
    pub job_id: Uuid,
    pub status: CompletionStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub assessment: Option<SafetyAssessment>,
    pub user_id: String,
}

/// Outcome of completion.
#[derive(Debug)]
pub enum CompleteJobOutcome {
    Completed { status: JobStatus },
    JobNotFound,
    CommandNotFound,
    /// Structured result failed its schema; the job stays processing.
    InvalidResult { code: String, message: String },
}

/// Outcome of connector registration.
#[derive(Debug)]
pub enum RegisterConnectorOutcome {
    Registered { connector_id: Uuid },
    Invalid { code: String, message: String },
}

/// What an org can do: advertised workers, command kinds, connectors.
#[derive(Debug, Clone, Serialize)]
pub struct OrgCapabilities {
    pub org_id: String,
    pub workers: Vec<WorkerKind>,
    pub command_types: Vec<String>,
    pub connectors: Vec<OrgConnector>,
}

/// The orchestration core service.
pub struct OrchestratorService {
    store: Arc<dyn CommandStore>,
    pipeline: SafetyPipeline,
    audit: Arc<AuditLog>,
}

impl OrchestratorService {
    pub fn new(
        store: Arc<dyn CommandStore>,
        pipeline: SafetyPipeline,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            pipeline,
            audit,
        }
    }

    /// Admit a command: validate, run the pre-phase pipeline, enqueue.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, command_type = %input.command_type))]
    pub async fn create_command(
        &self,
        input: CreateCommandInput,
    ) -> Result<CommandCreationOutcome, StoreError> {
        let kind = CommandKind::from_tag(&input.command_type);

        if let Err(e) = kind.validate_payload(&input.payload) {
            return Ok(CommandCreationOutcome::InvalidPayload {
                code: e.code,
                message: e.message,
            });
        }

        let worker = input.worker.unwrap_or_else(|| kind.default_worker());
        let ctx = PipelineContext {
            phase: Phase::Pre,
            org_id: &input.org_id,
            session_id: input.session_id.as_deref(),
            command_type: &input.command_type,
            worker,
            payload: &input.payload,
            result: None,
            assessment: None,
        };
        let decision = self.pipeline.evaluate(&ctx);

        if decision.action == SafetyAction::Block {
            info!(reasons = ?decision.reasons, "command rejected at admission");
            self.audit
                .append(
                    AuditRecord::new(&input.org_id, &input.issued_by, "admission", "rejected")
                        .with_reasons(&decision.reasons),
                )
                .await;
            return Ok(CommandCreationOutcome::Rejected {
                reasons: decision.reasons,
                mitigations: decision.mitigations,
            });
        }

        let needs_hitl = decision.action == SafetyAction::NeedsHitl;
        let job_metadata = if needs_hitl {
            serde_json::json!({ "hitl": true })
        } else {
            serde_json::json!({})
        };
        let domain_agent = input
            .payload
            .get("domain_agent")
            .and_then(|v| v.as_str())
            .map(String::from);

        let receipt = self
            .store
            .enqueue_command(NewCommand {
                org_id: input.org_id.clone(),
                session_id: input.session_id,
                command_type: input.command_type,
                payload: input.payload,
                priority: input.priority,
                scheduled_for: input.scheduled_for.unwrap_or_else(Utc::now),
                worker,
                issued_by: input.issued_by.clone(),
                connector_dependencies: input.connector_dependencies,
                domain_agent,
                job_metadata,
            })
            .await?;

        info!(command_id = %receipt.command_id, job_id = %receipt.job_id, needs_hitl, "command admitted");
        self.audit
            .append(
                AuditRecord::new(
                    &input.org_id,
                    &input.issued_by,
                    "admission",
                    if needs_hitl { "needs_hitl" } else { "accepted" },
                )
                .with_reasons(&decision.reasons)
                .with_command(receipt.command_id)
                .with_job(receipt.job_id),
            )
            .await;

        Ok(CommandCreationOutcome::Accepted {
            receipt,
            needs_hitl,
            mitigations: decision.mitigations,
        })
    }

    /// Claim at most one pending job for (org, worker). Concurrency safety
    /// comes from the store's atomic claim primitive, not from locking here.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, worker = input.worker.as_str()))]
    pub async fn claim_job(&self, input: ClaimJobInput) -> Result<ClaimJobOutcome, StoreError> {
        let limit = input
            .limit
            .unwrap_or(DEFAULT_CLAIM_LIMIT)
            .clamp(1, MAX_CLAIM_LIMIT);

        let candidates = self
            .store
            .list_pending_jobs(&input.org_id, input.worker, limit)
            .await?;

        for candidate in candidates {
            if !self.store.claim_job(candidate.job.id).await? {
                // Lost the race; try the next candidate.
                continue;
            }

            // Re-read so the returned envelope reflects the claimed state.
            let envelope = self
                .store
                .command_envelope(candidate.command.id)
                .await?
                .ok_or(StoreError::NotFound("command"))?;

            info!(job_id = %envelope.job.id, attempts = envelope.job.attempts, "job claimed");
            self.audit
                .append(
                    AuditRecord::new(&input.org_id, &input.user_id, "claim", "claimed")
                        .with_command(envelope.command.id)
                        .with_job(envelope.job.id),
                )
                .await;
            return Ok(ClaimJobOutcome::Claimed { envelope });
        }

        Ok(ClaimJobOutcome::NothingToClaim)
    }

    /// Complete a processing job and propagate the terminal state to its
    /// command.
    #[instrument(skip(self, input), fields(job_id = %input.job_id))]
    pub async fn complete_job(
        &self,
        input: CompleteJobInput,
    ) -> Result<CompleteJobOutcome, StoreError> {
        let job = match self.store.job(input.job_id).await? {
            Some(job) => job,
            None => return Ok(CompleteJobOutcome::JobNotFound),
        };
        let command = match self.store.command(job.command_id).await? {
            Some(command) => command,
            None => return Ok(CompleteJobOutcome::CommandNotFound),
        };

        let kind = CommandKind::from_tag(&command.command_type);
        if input.status == CompletionStatus::Completed && kind.requires_result_validation() {
            let result = input.result.clone().unwrap_or(serde_json::Value::Null);
            if let Err(e) = kind.validate_result(&result) {
                // Deliberately no store mutation: the caller resubmits.
                return Ok(CompleteJobOutcome::InvalidResult {
                    code: e.code,
                    message: e.message,
                });
            }
        }

        // Post-phase pipeline, with the assessment attached.
        let mut hitl_flagged = false;
        if let Some(assessment) = &input.assessment {
            let ctx = PipelineContext {
                phase: Phase::Post,
                org_id: &command.org_id,
                session_id: command.session_id.as_deref(),
                command_type: &command.command_type,
                worker: command.worker,
                payload: &command.payload,
                result: input.result.as_ref(),
                assessment: Some(assessment),
            };
            let decision = self.pipeline.evaluate(&ctx);

            match decision.action {
                SafetyAction::Block => {
                    let reason_text = decision.reasons.join(", ");
                    let status = self
                        .persist_completion(
                            &job.id,
                            &command.id,
                            CompletionStatus::Failed,
                            None,
                            Some(reason_text),
                            None,
                        )
                        .await?;
                    self.audit
                        .append(
                            AuditRecord::new(
                                &command.org_id,
                                &input.user_id,
                                "completion",
                                "blocked",
                            )
                            .with_reasons(&decision.reasons)
                            .with_command(command.id)
                            .with_job(job.id),
                        )
                        .await;
                    return Ok(CompleteJobOutcome::Completed { status });
                }
                SafetyAction::NeedsHitl => {
                    hitl_flagged = true;
                }
                SafetyAction::Allow => {}
            }
        }

        let hitl_metadata = if hitl_flagged {
            let mut metadata = job.metadata.clone();
            if let serde_json::Value::Object(map) = &mut metadata {
                map.insert("hitl".to_string(), serde_json::Value::Bool(true));
            }
            Some(metadata)
        } else {
            None
        };

        let persisted = self
            .persist_completion(
                &job.id,
                &command.id,
                input.status,
                input.result.clone(),
                input.error.clone(),
                hitl_metadata,
            )
            .await;

        let status = match persisted {
            Ok(status) => status,
            Err(e) => {
                // A processing job must not be left without a recorded error.
                self.record_completion_failure(&job.id, &e).await;
                return Err(e);
            }
        };

        info!(status = status.as_str(), "job completed");
        self.audit
            .append(
                AuditRecord::new(&command.org_id, &input.user_id, "completion", status.as_str())
                    .with_command(command.id)
                    .with_job(job.id),
            )
            .await;
        Ok(CompleteJobOutcome::Completed { status })
    }

    async fn persist_completion(
        &self,
        job_id: &Uuid,
        command_id: &Uuid,
        status: CompletionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<JobStatus, StoreError> {
        let now = Utc::now();
        match status {
            CompletionStatus::Completed => {
                self.store
                    .update_job_status(
                        *job_id,
                        JobStatus::Completed,
                        JobPatch {
                            completed_at: Some(now),
                            metadata,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .update_command_status(
                        *command_id,
                        CommandStatus::Completed,
                        CommandPatch {
                            result,
                            last_error: None,
                        },
                    )
                    .await?;
                Ok(JobStatus::Completed)
            }
            CompletionStatus::Failed => {
                self.store
                    .update_job_status(
                        *job_id,
                        JobStatus::Failed,
                        JobPatch {
                            failed_at: Some(now),
                            last_error: error.clone(),
                            metadata,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .update_command_status(
                        *command_id,
                        CommandStatus::Failed,
                        CommandPatch {
                            result: None,
                            last_error: error,
                        },
                    )
                    .await?;
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Best-effort lastError write when completion persistence fails.
    async fn record_completion_failure(&self, job_id: &Uuid, error: &StoreError) {
        let patch = JobPatch {
            failed_at: Some(Utc::now()),
            last_error: Some(error.to_string()),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .update_job_status(*job_id, JobStatus::Failed, patch)
            .await
        {
            warn!(error = %e, job_id = %job_id, "could not record completion failure");
        }
    }

    /// Advertised workers, command kinds, and registered connectors.
    pub async fn get_capabilities(&self, org_id: &str) -> Result<OrgCapabilities, StoreError> {
        let connectors = self.store.list_org_connectors(org_id).await?;
        Ok(OrgCapabilities {
            org_id: org_id.to_string(),
            workers: vec![WorkerKind::Director, WorkerKind::Safety, WorkerKind::Domain],
            command_types: CommandKind::known_tags()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            connectors,
        })
    }

    /// Register an org connector.
    #[instrument(skip(self, input), fields(org_id = %input.org_id))]
    pub async fn register_connector(
        &self,
        input: RegisterConnectorInput,
    ) -> Result<RegisterConnectorOutcome, StoreError> {
        if input.connector_type.is_empty() || input.name.is_empty() {
            return Ok(RegisterConnectorOutcome::Invalid {
                code: "invalid_connector_registration".to_string(),
                message: "connector_type and name must not be empty".to_string(),
            });
        }
        let org_id = input.org_id.clone();
        let created_by = input.created_by.clone();
        let connector_id = self.store.register_connector(input).await?;

        self.audit
            .append(AuditRecord::new(&org_id, &created_by, "connector", "registered"))
            .await;
        Ok(RegisterConnectorOutcome::Registered { connector_id })
    }

    /// Commands for a session, newest first.
    pub async fn list_session_commands(
        &self,
        org_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<crate::domain::Command>, StoreError> {
        self.store
            .list_commands_for_session(org_id, session_id, limit)
            .await
    }
}
