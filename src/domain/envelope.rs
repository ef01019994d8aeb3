//! Command envelopes: the bundled view a worker needs to execute.

use serde::{Deserialize, Serialize};

use super::command::Command;
use super::connector::OrgConnector;
use super::job::Job;

/// A command joined with its job and the connectors it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: Command,

    pub job: Job,

    /// Connectors named by the command's `connector_dependencies`
    pub connectors: Vec<OrgConnector>,
}

impl CommandEnvelope {
    /// Sort key for dispatch ordering: priority desc, then scheduled_at asc.
    pub fn dispatch_key(&self) -> (i32, i64) {
        (
            -self.command.priority,
            self.job.scheduled_at.timestamp_millis(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{CommandStatus, WorkerKind};
    use crate::domain::job::JobStatus;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn envelope(priority: i32, offset_secs: i64) -> CommandEnvelope {
        let now = Utc::now();
        let command_id = Uuid::new_v4();
        CommandEnvelope {
            command: Command {
                id: command_id,
                org_id: "org-1".to_string(),
                session_id: None,
                command_type: "sync_connector".to_string(),
                payload: serde_json::json!({}),
                priority,
                scheduled_for: now,
                status: CommandStatus::Queued,
                worker: WorkerKind::Domain,
                issued_by: "user-1".to_string(),
                connector_dependencies: vec![],
                result: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
            job: Job {
                id: Uuid::new_v4(),
                org_id: "org-1".to_string(),
                command_id,
                worker: WorkerKind::Domain,
                domain_agent: None,
                status: JobStatus::Pending,
                attempts: 0,
                scheduled_at: now + Duration::seconds(offset_secs),
                started_at: None,
                completed_at: None,
                failed_at: None,
                last_error: None,
                metadata: serde_json::json!({}),
            },
            connectors: vec![],
        }
    }

    #[test]
    fn test_dispatch_order() {
        let mut envelopes = vec![envelope(0, 0), envelope(5, 10), envelope(5, 5)];
        envelopes.sort_by_key(|e| e.dispatch_key());

        assert_eq!(envelopes[0].command.priority, 5);
        assert!(envelopes[0].job.scheduled_at <= envelopes[1].job.scheduled_at);
        assert_eq!(envelopes[2].command.priority, 0);
    }
}
