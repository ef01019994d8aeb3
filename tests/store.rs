//! Store Backing Parity Tests
//!
//! The memory and sqlite backings must agree on lifecycle semantics:
//! enqueue, ordering, claim, monotonic updates, and completion
//! propagation through the service.

use std::sync::Arc;

use chrono::Utc;
use praetor::core::{
    standard_pipeline, AuditLog, ClaimJobInput, ClaimJobOutcome, CommandStore, CompleteJobInput,
    CompleteJobOutcome, CompletionStatus, MemoryStore, OrchestratorService, SafetySettings,
    SqliteStore, StoreError,
};
use praetor::domain::{
    CommandStatus, CreateCommandInput, JobPatch, JobStatus, RegisterConnectorInput, WorkerKind,
};
use praetor::CommandCreationOutcome;
use serde_json::json;
use tempfile::TempDir;

fn backings() -> Vec<(&'static str, Arc<dyn CommandStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn CommandStore>),
        (
            "sqlite",
            Arc::new(SqliteStore::open_in_memory().unwrap()) as Arc<dyn CommandStore>,
        ),
    ]
}

fn service(store: Arc<dyn CommandStore>) -> OrchestratorService {
    OrchestratorService::new(
        store,
        standard_pipeline(&SafetySettings::default()),
        Arc::new(AuditLog::disabled()),
    )
}

fn finance_input() -> CreateCommandInput {
    CreateCommandInput {
        org_id: "org-1".to_string(),
        session_id: Some("sess-1".to_string()),
        command_type: "finance_command".to_string(),
        payload: json!({
            "operation": "reconcile",
            "account_id": "acct-9",
            "period": "2026-07",
        }),
        priority: 0,
        scheduled_for: None,
        worker: None,
        issued_by: "user-1".to_string(),
        connector_dependencies: vec![],
    }
}

async fn admit(service: &OrchestratorService, input: CreateCommandInput) -> (uuid::Uuid, uuid::Uuid) {
    match service.create_command(input).await.unwrap() {
        CommandCreationOutcome::Accepted { receipt, .. } => (receipt.command_id, receipt.job_id),
        other => panic!("expected acceptance, got {:?}", other),
    }
}

async fn claim(service: &OrchestratorService) -> uuid::Uuid {
    match service
        .claim_job(ClaimJobInput {
            org_id: "org-1".to_string(),
            worker: WorkerKind::Domain,
            user_id: "worker-1".to_string(),
            limit: None,
        })
        .await
        .unwrap()
    {
        ClaimJobOutcome::Claimed { envelope } => envelope.job.id,
        ClaimJobOutcome::NothingToClaim => panic!("expected a claim"),
    }
}

#[tokio::test]
async fn test_full_lifecycle_all_backings() {
    for (name, store) in backings() {
        let service = service(store.clone());
        let (command_id, job_id) = admit(&service, finance_input()).await;

        assert_eq!(claim(&service).await, job_id, "backing {}", name);

        let outcome = service
            .complete_job(CompleteJobInput {
                job_id,
                status: CompletionStatus::Completed,
                result: Some(json!({
                    "summary": "reconciled 42 entries",
                    "entries": [{ "account": "acct-9", "amount": 10.0 }],
                })),
                error: None,
                assessment: None,
                user_id: "worker-1".to_string(),
            })
            .await
            .unwrap();
        assert!(
            matches!(outcome, CompleteJobOutcome::Completed { status: JobStatus::Completed }),
            "backing {}",
            name
        );

        let command = store.command(command_id).await.unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Completed, "backing {}", name);
        assert!(command.result.is_some());

        let job = store.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }
}

#[tokio::test]
async fn test_failed_completion_records_error() {
    for (name, store) in backings() {
        let service = service(store.clone());
        let (command_id, job_id) = admit(&service, finance_input()).await;
        claim(&service).await;

        let outcome = service
            .complete_job(CompleteJobInput {
                job_id,
                status: CompletionStatus::Failed,
                result: None,
                error: Some("erp unreachable".to_string()),
                assessment: None,
                user_id: "worker-1".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompleteJobOutcome::Completed { status: JobStatus::Failed }
        ));

        let job = store.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed, "backing {}", name);
        assert_eq!(job.last_error.as_deref(), Some("erp unreachable"));
        assert!(job.failed_at.is_some());

        let command = store.command(command_id).await.unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert_eq!(command.last_error.as_deref(), Some("erp unreachable"));
    }
}

#[tokio::test]
async fn test_completed_jobs_stay_terminal() {
    for (name, store) in backings() {
        let service = service(store.clone());
        let (_, job_id) = admit(&service, finance_input()).await;
        claim(&service).await;

        store
            .update_job_status(
                job_id,
                JobStatus::Completed,
                JobPatch {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // failed is not reachable from completed; neither is re-claiming.
        let err = store
            .update_job_status(job_id, JobStatus::Failed, JobPatch::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::InvalidTransition { .. }),
            "backing {}",
            name
        );
        assert!(!store.claim_job(job_id).await.unwrap());
    }
}

#[tokio::test]
async fn test_ordering_parity() {
    for (name, store) in backings() {
        let service = service(store.clone());

        let mut first = finance_input();
        first.priority = 2;
        let (_, expected_second) = admit(&service, first).await;

        let mut second = finance_input();
        second.priority = 8;
        let (_, expected_first) = admit(&service, second).await;

        let pending = store
            .list_pending_jobs("org-1", WorkerKind::Domain, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2, "backing {}", name);
        assert_eq!(pending[0].job.id, expected_first, "backing {}", name);
        assert_eq!(pending[1].job.id, expected_second, "backing {}", name);
    }
}

/// Wraps a real store but has forgotten every command row — the orphaned-job
/// state a backing could reach through partial restores.
struct AmnesiacStore(MemoryStore);

#[async_trait::async_trait]
impl CommandStore for AmnesiacStore {
    async fn enqueue_command(
        &self,
        input: praetor::core::NewCommand,
    ) -> Result<praetor::domain::CommandReceipt, StoreError> {
        self.0.enqueue_command(input).await
    }

    async fn command(
        &self,
        _command_id: uuid::Uuid,
    ) -> Result<Option<praetor::domain::Command>, StoreError> {
        Ok(None)
    }

    async fn job(&self, job_id: uuid::Uuid) -> Result<Option<praetor::domain::Job>, StoreError> {
        self.0.job(job_id).await
    }

    async fn command_envelope(
        &self,
        command_id: uuid::Uuid,
    ) -> Result<Option<praetor::domain::CommandEnvelope>, StoreError> {
        self.0.command_envelope(command_id).await
    }

    async fn list_pending_jobs(
        &self,
        org_id: &str,
        worker: WorkerKind,
        limit: usize,
    ) -> Result<Vec<praetor::domain::CommandEnvelope>, StoreError> {
        self.0.list_pending_jobs(org_id, worker, limit).await
    }

    async fn claim_job(&self, job_id: uuid::Uuid) -> Result<bool, StoreError> {
        self.0.claim_job(job_id).await
    }

    async fn update_job_status(
        &self,
        job_id: uuid::Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<(), StoreError> {
        self.0.update_job_status(job_id, status, patch).await
    }

    async fn update_command_status(
        &self,
        command_id: uuid::Uuid,
        status: CommandStatus,
        patch: praetor::core::CommandPatch,
    ) -> Result<(), StoreError> {
        self.0.update_command_status(command_id, status, patch).await
    }

    async fn list_commands_for_session(
        &self,
        org_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<praetor::domain::Command>, StoreError> {
        self.0
            .list_commands_for_session(org_id, session_id, limit)
            .await
    }

    async fn list_org_connectors(
        &self,
        org_id: &str,
    ) -> Result<Vec<praetor::domain::OrgConnector>, StoreError> {
        self.0.list_org_connectors(org_id).await
    }

    async fn connectors_by_ids(
        &self,
        org_id: &str,
        ids: &[uuid::Uuid],
    ) -> Result<Vec<praetor::domain::OrgConnector>, StoreError> {
        self.0.connectors_by_ids(org_id, ids).await
    }

    async fn register_connector(
        &self,
        input: RegisterConnectorInput,
    ) -> Result<uuid::Uuid, StoreError> {
        self.0.register_connector(input).await
    }
}

#[tokio::test]
async fn test_complete_with_missing_command_mutates_nothing() {
    let store = Arc::new(AmnesiacStore(MemoryStore::new()));
    let service = service(store.clone());
    let (_, job_id) = admit(&service, finance_input()).await;

    let outcome = service
        .complete_job(CompleteJobInput {
            job_id,
            status: CompletionStatus::Completed,
            result: None,
            error: None,
            assessment: None,
            user_id: "worker-1".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, CompleteJobOutcome::CommandNotFound));

    // The job is untouched by the failed lookup.
    let job = store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_complete_with_unknown_job_id() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);

    let outcome = service
        .complete_job(CompleteJobInput {
            job_id: uuid::Uuid::new_v4(),
            status: CompletionStatus::Completed,
            result: None,
            error: None,
            assessment: None,
            user_id: "worker-1".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, CompleteJobOutcome::JobNotFound));
}

#[tokio::test]
async fn test_sqlite_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("praetor.db");

    let (command_id, job_id) = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let service = service(store);
        admit(&service, finance_input()).await
    };

    let store = SqliteStore::open(&path).unwrap();
    let command = store.command(command_id).await.unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Queued);
    let job = store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_connector_registration_and_capabilities() {
    for (name, store) in backings() {
        let service = service(store.clone());

        let connector_id = store
            .register_connector(RegisterConnectorInput {
                org_id: "org-1".to_string(),
                connector_type: "erp".to_string(),
                name: "main ERP".to_string(),
                status: "active".to_string(),
                config: json!({ "base_url": "https://erp.example" }),
                metadata: json!({}),
                created_by: "admin".to_string(),
            })
            .await
            .unwrap();

        let caps = service.get_capabilities("org-1").await.unwrap();
        assert_eq!(caps.connectors.len(), 1, "backing {}", name);
        assert_eq!(caps.connectors[0].id, connector_id);

        // Command depending on the connector carries it in the envelope.
        let mut input = finance_input();
        input.connector_dependencies = vec![connector_id];
        let (command_id, _) = admit(&service, input).await;

        let envelope = store
            .command_envelope(command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.connectors.len(), 1, "backing {}", name);
    }
}

#[tokio::test]
async fn test_session_listing_scoped() {
    for (name, store) in backings() {
        let service = service(store.clone());
        admit(&service, finance_input()).await;

        let mut other_session = finance_input();
        other_session.session_id = Some("sess-2".to_string());
        admit(&service, other_session).await;

        let mut other_org = finance_input();
        other_org.org_id = "org-2".to_string();
        admit(&service, other_org).await;

        let commands = service
            .list_session_commands("org-1", "sess-1", 50)
            .await
            .unwrap();
        assert_eq!(commands.len(), 1, "backing {}", name);
        assert_eq!(commands[0].org_id, "org-1");
        assert_eq!(commands[0].session_id.as_deref(), Some("sess-1"));
    }
}
