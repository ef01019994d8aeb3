//! Append-only audit trail of admission, claim, and completion decisions.
//!
//! Records are newline-delimited JSON for easy inspection and replay.
//! Appending is best-effort: a failed write is logged and never fails the
//! request that produced it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// One audited decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,

    pub ts: DateTime<Utc>,

    pub org_id: String,

    /// Acting user (issuer or claiming worker identity)
    pub actor: String,

    /// "admission" | "claim" | "completion" | "connector"
    pub action: String,

    /// "accepted" | "rejected" | "claimed" | "completed" | "failed" | ...
    pub outcome: String,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reason_codes: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl AuditRecord {
    pub fn new(
        org_id: &str,
        actor: &str,
        action: &str,
        outcome: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            org_id: org_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            reason_codes: vec![],
            command_id: None,
            job_id: None,
        }
    }

    pub fn with_reasons(mut self, reasons: &[String]) -> Self {
        self.reason_codes = reasons.to_vec();
        self
    }

    pub fn with_command(mut self, command_id: Uuid) -> Self {
        self.command_id = Some(command_id);
        self
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// JSONL audit sink.
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Open (creating parent directories) an audit log at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Touch the file up front so permission problems surface at startup.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: Some(path.to_path_buf()),
        })
    }

    /// A sink that drops every record (tests, ephemeral deployments).
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one record. Best-effort: failures are logged, not returned.
    pub async fn append(&self, record: AuditRecord) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Err(e) = Self::write_line(path, &record).await {
            warn!(error = %e, action = %record.action, "audit append failed");
        }
    }

    async fn write_line(path: &Path, record: &AuditRecord) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let json = serde_json::to_string(record)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read back all records (inspection and tests).
    pub async fn replay(&self) -> anyhow::Result<Vec<AuditRecord>> {
        let Some(path) = self.path.as_ref() else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).await?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(&temp.path().join("audit.jsonl")).await.unwrap();

        let command_id = Uuid::new_v4();
        log.append(
            AuditRecord::new("org-1", "user-1", "admission", "accepted")
                .with_command(command_id),
        )
        .await;
        log.append(
            AuditRecord::new("org-1", "user-1", "admission", "rejected")
                .with_reasons(&["denylisted_content".to_string()]),
        )
        .await;

        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, "accepted");
        assert_eq!(records[0].command_id, Some(command_id));
        assert_eq!(records[1].reason_codes, vec!["denylisted_content"]);
    }

    #[tokio::test]
    async fn test_disabled_sink_swallows() {
        let log = AuditLog::disabled();
        log.append(AuditRecord::new("org-1", "user-1", "claim", "claimed"))
            .await;
        assert!(log.replay().await.unwrap().is_empty());
    }
}
