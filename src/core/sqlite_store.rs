//! SQLite backing for the command/job store.
//!
//! Single connection behind an async mutex; the claim primitive is a
//! conditional `UPDATE ... WHERE status = 'pending'` judged by its
//! affected-row count, so it stays correct even for store deployments
//! that drop the process-local mutex.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    Command, CommandEnvelope, CommandReceipt, CommandStatus, Job, JobPatch, JobStatus,
    OrgConnector, RegisterConnectorInput, WorkerKind,
};

use super::store::{CommandPatch, CommandStore, NewCommand, StoreError};

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, ref msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// rusqlite-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS commands (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                session_id TEXT,
                command_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                scheduled_for TEXT NOT NULL,
                status TEXT NOT NULL,
                worker TEXT NOT NULL,
                issued_by TEXT NOT NULL,
                connector_dependencies TEXT NOT NULL,
                result TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                command_id TEXT NOT NULL REFERENCES commands(id),
                worker TEXT NOT NULL,
                domain_agent TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                scheduled_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                failed_at TEXT,
                last_error TEXT,
                metadata TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS connectors (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                connector_type TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_pending
                ON jobs(org_id, worker, status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_commands_session
                ON commands(org_id, session_id);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Row counts (commands, jobs) — used by admission tests to assert
    /// nothing was persisted on rejection.
    pub async fn counts(&self) -> Result<(usize, usize), StoreError> {
        let conn = self.conn.lock().await;
        let commands: i64 = conn.query_row("SELECT COUNT(*) FROM commands", [], |r| r.get(0))?;
        let jobs: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        Ok((commands as usize, jobs as usize))
    }
}

const COMMAND_COLS: &str = "id, org_id, session_id, command_type, payload, priority, \
     scheduled_for, status, worker, issued_by, connector_dependencies, result, last_error, \
     created_at, updated_at";

const JOB_COLS: &str = "id, org_id, command_id, worker, domain_agent, status, attempts, \
     scheduled_at, started_at, completed_at, failed_at, last_error, metadata";

struct CommandRow {
    id: String,
    org_id: String,
    session_id: Option<String>,
    command_type: String,
    payload: String,
    priority: i64,
    scheduled_for: String,
    status: String,
    worker: String,
    issued_by: String,
    connector_dependencies: String,
    result: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CommandRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            session_id: row.get(2)?,
            command_type: row.get(3)?,
            payload: row.get(4)?,
            priority: row.get(5)?,
            scheduled_for: row.get(6)?,
            status: row.get(7)?,
            worker: row.get(8)?,
            issued_by: row.get(9)?,
            connector_dependencies: row.get(10)?,
            result: row.get(11)?,
            last_error: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_command(self) -> Result<Command, StoreError> {
        Ok(Command {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            session_id: self.session_id,
            command_type: self.command_type,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority as i32,
            scheduled_for: parse_ts(&self.scheduled_for)?,
            status: CommandStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Backend(format!("bad command status {}", self.status)))?,
            worker: parse_worker(&self.worker)?,
            issued_by: self.issued_by,
            connector_dependencies: serde_json::from_str(&self.connector_dependencies)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct JobRow {
    id: String,
    org_id: String,
    command_id: String,
    worker: String,
    domain_agent: Option<String>,
    status: String,
    attempts: i64,
    scheduled_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    failed_at: Option<String>,
    last_error: Option<String>,
    metadata: String,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            command_id: row.get(2)?,
            worker: row.get(3)?,
            domain_agent: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            scheduled_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            failed_at: row.get(10)?,
            last_error: row.get(11)?,
            metadata: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            command_id: parse_uuid(&self.command_id)?,
            worker: parse_worker(&self.worker)?,
            domain_agent: self.domain_agent,
            status: JobStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Backend(format!("bad job status {}", self.status)))?,
            attempts: self.attempts as u32,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            failed_at: self.failed_at.as_deref().map(parse_ts).transpose()?,
            last_error: self.last_error,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn read_connector(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_connector(
    (id, org_id, connector_type, name, status, config, metadata, created_by, created_at): (
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        String,
    ),
) -> Result<OrgConnector, StoreError> {
    Ok(OrgConnector {
        id: parse_uuid(&id)?,
        org_id,
        connector_type,
        name,
        status,
        config: serde_json::from_str(&config)?,
        metadata: serde_json::from_str(&metadata)?,
        created_by,
        created_at: parse_ts(&created_at)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("bad uuid {}: {}", s, e)))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {}: {}", s, e)))
}

fn parse_worker(s: &str) -> Result<WorkerKind, StoreError> {
    WorkerKind::parse(s).ok_or_else(|| StoreError::Backend(format!("bad worker {}", s)))
}

fn connectors_for(
    conn: &Connection,
    org_id: &str,
    ids: &[Uuid],
) -> Result<Vec<OrgConnector>, StoreError> {
    let mut connectors = Vec::with_capacity(ids.len());
    let mut stmt = conn.prepare(
        "SELECT id, org_id, connector_type, name, status, config, metadata, created_by, \
         created_at FROM connectors WHERE id = ?1 AND org_id = ?2",
    )?;
    for id in ids {
        if let Some(raw) = stmt
            .query_row(params![id.to_string(), org_id], read_connector)
            .optional()?
        {
            connectors.push(into_connector(raw)?);
        }
    }
    Ok(connectors)
}

fn envelope_for_job(conn: &Connection, job: Job) -> Result<Option<CommandEnvelope>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM commands WHERE id = ?1", COMMAND_COLS),
            params![job.command_id.to_string()],
            CommandRow::read,
        )
        .optional()?;
    let command = match raw {
        Some(row) => row.into_command()?,
        None => return Ok(None),
    };
    let connectors = connectors_for(conn, &command.org_id, &command.connector_dependencies)?;
    Ok(Some(CommandEnvelope {
        command,
        job,
        connectors,
    }))
}

#[async_trait]
impl CommandStore for SqliteStore {
    async fn enqueue_command(&self, input: NewCommand) -> Result<CommandReceipt, StoreError> {
        let now = Utc::now();
        let command_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO commands (id, org_id, session_id, command_type, payload, priority, \
             scheduled_for, status, worker, issued_by, connector_dependencies, result, \
             last_error, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, NULL, ?12, ?12)",
            params![
                command_id.to_string(),
                input.org_id,
                input.session_id,
                input.command_type,
                serde_json::to_string(&input.payload)?,
                input.priority as i64,
                input.scheduled_for.to_rfc3339(),
                CommandStatus::Queued.as_str(),
                input.worker.as_str(),
                input.issued_by,
                serde_json::to_string(&input.connector_dependencies)?,
                now.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO jobs (id, org_id, command_id, worker, domain_agent, status, attempts, \
             scheduled_at, started_at, completed_at, failed_at, last_error, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, NULL, NULL, NULL, NULL, ?8)",
            params![
                job_id.to_string(),
                input.org_id,
                command_id.to_string(),
                input.worker.as_str(),
                input.domain_agent,
                JobStatus::Pending.as_str(),
                input.scheduled_for.to_rfc3339(),
                serde_json::to_string(&input.job_metadata)?,
            ],
        )?;
        tx.commit()?;

        Ok(CommandReceipt {
            command_id,
            job_id,
            session_id: input.session_id,
            status: CommandStatus::Queued,
            scheduled_for: input.scheduled_for,
        })
    }

    async fn command(&self, command_id: Uuid) -> Result<Option<Command>, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM commands WHERE id = ?1", COMMAND_COLS),
                params![command_id.to_string()],
                CommandRow::read,
            )
            .optional()?;
        raw.map(CommandRow::into_command).transpose()
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLS),
                params![job_id.to_string()],
                JobRow::read,
            )
            .optional()?;
        raw.map(JobRow::into_job).transpose()
    }

    async fn command_envelope(
        &self,
        command_id: Uuid,
    ) -> Result<Option<CommandEnvelope>, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE command_id = ?1", JOB_COLS),
                params![command_id.to_string()],
                JobRow::read,
            )
            .optional()?;
        match raw {
            Some(row) => envelope_for_job(&conn, row.into_job()?),
            None => Ok(None),
        }
    }

    async fn list_pending_jobs(
        &self,
        org_id: &str,
        worker: WorkerKind,
        limit: usize,
    ) -> Result<Vec<CommandEnvelope>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;

        let rows: Vec<JobRow> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE org_id = ?1 AND worker = ?2 \
                 AND status = 'pending' AND scheduled_at <= ?3 \
                 ORDER BY (SELECT c.priority FROM commands c WHERE c.id = jobs.command_id) DESC, \
                 scheduled_at ASC LIMIT ?4",
                JOB_COLS
            ))?;
            let mapped = stmt.query_map(
                params![org_id, worker.as_str(), now, limit as i64],
                JobRow::read,
            )?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(envelope) = envelope_for_job(&conn, row.into_job()?)? {
                envelopes.push(envelope);
            }
        }
        Ok(envelopes)
    }

    async fn claim_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        // The conditional update IS the claim: affected-row count decides.
        let claimed = tx.execute(
            "UPDATE jobs SET status = 'processing', attempts = attempts + 1, started_at = ?1 \
             WHERE id = ?2 AND status = 'pending'",
            params![now, job_id.to_string()],
        )?;
        if claimed == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE commands SET status = 'dispatched', updated_at = ?1 \
             WHERE status = 'queued' AND id = (SELECT command_id FROM jobs WHERE id = ?2)",
            params![now, job_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::NotFound("job"))?;
        let from = JobStatus::parse(&current)
            .ok_or_else(|| StoreError::Backend(format!("bad job status {}", current)))?;

        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "job",
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let metadata = patch
            .metadata
            .map(|m| serde_json::to_string(&m))
            .transpose()?;
        // Conditional on the status we just checked, so a concurrent writer
        // cannot sneak an illegal transition in between.
        let updated = conn.execute(
            "UPDATE jobs SET status = ?1, \
             started_at = COALESCE(?2, started_at), \
             completed_at = COALESCE(?3, completed_at), \
             failed_at = COALESCE(?4, failed_at), \
             last_error = COALESCE(?5, last_error), \
             metadata = COALESCE(?6, metadata) \
             WHERE id = ?7 AND status = ?8",
            params![
                status.as_str(),
                patch.started_at.map(|t| t.to_rfc3339()),
                patch.completed_at.map(|t| t.to_rfc3339()),
                patch.failed_at.map(|t| t.to_rfc3339()),
                patch.last_error,
                metadata,
                job_id.to_string(),
                from.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "job",
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn update_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        patch: CommandPatch,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM commands WHERE id = ?1",
                params![command_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::NotFound("command"))?;
        let from = CommandStatus::parse(&current)
            .ok_or_else(|| StoreError::Backend(format!("bad command status {}", current)))?;

        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "command",
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let result = patch
            .result
            .map(|r| serde_json::to_string(&r))
            .transpose()?;
        let updated = conn.execute(
            "UPDATE commands SET status = ?1, \
             result = COALESCE(?2, result), \
             last_error = COALESCE(?3, last_error), \
             updated_at = ?4 \
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                result,
                patch.last_error,
                Utc::now().to_rfc3339(),
                command_id.to_string(),
                from.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "command",
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn list_commands_for_session(
        &self,
        org_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let conn = self.conn.lock().await;
        let rows: Vec<CommandRow> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM commands WHERE org_id = ?1 AND session_id = ?2 \
                 ORDER BY created_at DESC LIMIT ?3",
                COMMAND_COLS
            ))?;
            let mapped = stmt.query_map(params![org_id, session_id, limit as i64], CommandRow::read)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(CommandRow::into_command).collect()
    }

    async fn list_org_connectors(&self, org_id: &str) -> Result<Vec<OrgConnector>, StoreError> {
        let conn = self.conn.lock().await;
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT id, org_id, connector_type, name, status, config, metadata, created_by, \
                 created_at FROM connectors WHERE org_id = ?1 ORDER BY created_at ASC",
            )?;
            let mapped = stmt.query_map(params![org_id], read_connector)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(into_connector).collect()
    }

    async fn connectors_by_ids(
        &self,
        org_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<OrgConnector>, StoreError> {
        let conn = self.conn.lock().await;
        connectors_for(&conn, org_id, ids)
    }

    async fn register_connector(
        &self,
        input: RegisterConnectorInput,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO connectors (id, org_id, connector_type, name, status, config, \
             metadata, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                input.org_id,
                input.connector_type,
                input.name,
                input.status,
                serde_json::to_string(&input.config)?,
                serde_json::to_string(&input.metadata)?,
                input.created_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_command(org: &str, priority: i32) -> NewCommand {
        NewCommand {
            org_id: org.to_string(),
            session_id: Some("sess-1".to_string()),
            command_type: "sync_connector".to_string(),
            payload: json!({ "connector_id": "erp-main" }),
            priority,
            scheduled_for: Utc::now(),
            worker: WorkerKind::Domain,
            issued_by: "user-1".to_string(),
            connector_dependencies: vec![],
            domain_agent: None,
            job_metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let receipt = store.enqueue_command(new_command("org-1", 3)).await.unwrap();

        let command = store.command(receipt.command_id).await.unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Queued);
        assert_eq!(command.priority, 3);
        assert_eq!(command.session_id.as_deref(), Some("sess-1"));

        let job = store.job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.command_id, receipt.command_id);
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let receipt = store.enqueue_command(new_command("org-1", 0)).await.unwrap();

        assert!(store.claim_job(receipt.job_id).await.unwrap());
        assert!(!store.claim_job(receipt.job_id).await.unwrap());

        let job = store.job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        let command = store.command(receipt.command_id).await.unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_claim_missing_job_is_noop() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.claim_job(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_ordering() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.enqueue_command(new_command("org-1", 1)).await.unwrap();
        let high = store.enqueue_command(new_command("org-1", 7)).await.unwrap();

        let pending = store
            .list_pending_jobs("org-1", WorkerKind::Domain, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].job.id, high.job_id);
    }

    #[tokio::test]
    async fn test_monotonic_guard() {
        let store = SqliteStore::open_in_memory().unwrap();
        let receipt = store.enqueue_command(new_command("org-1", 0)).await.unwrap();

        let err = store
            .update_job_status(receipt.job_id, JobStatus::Completed, JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.claim_job(receipt.job_id).await.unwrap();
        store
            .update_job_status(
                receipt.job_id,
                JobStatus::Failed,
                JobPatch {
                    failed_at: Some(Utc::now()),
                    last_error: Some("adapter exploded".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = store.job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("adapter exploded"));
    }

    #[tokio::test]
    async fn test_connector_round_trip_and_envelope() {
        let store = SqliteStore::open_in_memory().unwrap();
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

        let mut input = new_command("org-1", 0);
        input.connector_dependencies = vec![connector_id];
        let receipt = store.enqueue_command(input).await.unwrap();

        let envelope = store
            .command_envelope(receipt.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.connectors.len(), 1);
        assert_eq!(envelope.connectors[0].connector_type, "erp");

        let listed = store.list_org_connectors("org-1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
