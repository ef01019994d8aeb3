//! Org connectors: registered integration endpoints (ERP links etc.)
//! that commands may depend on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered integration endpoint owned by an org.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgConnector {
    pub id: Uuid,

    pub org_id: String,

    /// e.g. "erp", "document_store"
    pub connector_type: String,

    pub name: String,

    /// Free-form status tag ("active", "degraded", ...)
    pub status: String,

    pub config: serde_json::Value,

    pub metadata: serde_json::Value,

    pub created_by: String,

    pub created_at: DateTime<Utc>,
}

/// Input to connector registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConnectorInput {
    pub org_id: String,

    pub connector_type: String,

    pub name: String,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default = "empty_object")]
    pub config: serde_json::Value,

    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,

    pub created_by: String,
}

fn default_status() -> String {
    "active".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
