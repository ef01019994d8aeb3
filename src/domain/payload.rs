//! Command kinds and their payload/result schemas.
//!
//! The envelope is a tagged union keyed by `command_type`: each kind owns
//! its payload schema (checked at admission) and, where applicable, its
//! result schema (checked at completion). Unknown kinds pass through
//! unvalidated; their admission is a pipeline concern, not a schema one.

use serde::Deserialize;
use thiserror::Error;

use super::command::WorkerKind;

/// Validation failure for a kind-specific payload or result.
///
/// `code` follows the `invalid_<type>_payload` / `invalid_<type>_result`
/// pattern and is surfaced verbatim to callers.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct PayloadError {
    pub code: String,
    pub message: String,
}

impl PayloadError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Known command kinds, keyed by the `command_type` string tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    FinanceCommand,
    SyncConnector,
    DirectorPlan,
    SafetyReview,
    Other(String),
}

impl CommandKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "finance_command" => Self::FinanceCommand,
            "sync_connector" => Self::SyncConnector,
            "director_plan" => Self::DirectorPlan,
            "safety_review" => Self::SafetyReview,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::FinanceCommand => "finance_command",
            Self::SyncConnector => "sync_connector",
            Self::DirectorPlan => "director_plan",
            Self::SafetyReview => "safety_review",
            Self::Other(tag) => tag,
        }
    }

    /// Tags advertised through capabilities.
    pub fn known_tags() -> &'static [&'static str] {
        &[
            "finance_command",
            "sync_connector",
            "director_plan",
            "safety_review",
        ]
    }

    /// Worker category a kind dispatches to when the caller does not pin one.
    pub fn default_worker(&self) -> WorkerKind {
        match self {
            Self::DirectorPlan => WorkerKind::Director,
            Self::SafetyReview => WorkerKind::Safety,
            Self::FinanceCommand | Self::SyncConnector | Self::Other(_) => WorkerKind::Domain,
        }
    }

    /// Validate an admission payload against the kind's schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), PayloadError> {
        match self {
            Self::FinanceCommand => {
                let parsed: FinancePayload = from_value(payload, self.payload_error_code())?;
                parsed.check(self.payload_error_code())
            }
            Self::SyncConnector => {
                let parsed: SyncConnectorPayload = from_value(payload, self.payload_error_code())?;
                parsed.check(self.payload_error_code())
            }
            Self::DirectorPlan => {
                let parsed: DirectorPlanPayload = from_value(payload, self.payload_error_code())?;
                parsed.check(self.payload_error_code())
            }
            Self::SafetyReview | Self::Other(_) => Ok(()),
        }
    }

    /// Validate a structured completion result, for kinds that require one.
    pub fn validate_result(&self, result: &serde_json::Value) -> Result<(), PayloadError> {
        match self {
            Self::FinanceCommand => {
                let parsed: FinanceResult = from_value(result, "invalid_finance_result")?;
                parsed.check()
            }
            _ => Ok(()),
        }
    }

    /// Whether completion must carry a schema-valid result.
    pub fn requires_result_validation(&self) -> bool {
        matches!(self, Self::FinanceCommand)
    }

    fn payload_error_code(&self) -> String {
        format!("invalid_{}_payload", self.tag())
    }
}

fn from_value<T: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
    code: impl Into<String>,
) -> Result<T, PayloadError> {
    serde_json::from_value(value.clone()).map_err(|e| PayloadError::new(code, e.to_string()))
}

#[derive(Debug, Deserialize)]
struct FinancePayload {
    operation: String,
    account_id: String,
    period: String,
}

impl FinancePayload {
    fn check(&self, code: String) -> Result<(), PayloadError> {
        match self.operation.as_str() {
            "reconcile" | "forecast" | "close_books" => {}
            other => {
                return Err(PayloadError::new(
                    code,
                    format!("unknown finance operation '{}'", other),
                ))
            }
        }
        if self.account_id.is_empty() {
            return Err(PayloadError::new(code, "account_id must not be empty"));
        }
        if !is_year_month(&self.period) {
            return Err(PayloadError::new(
                code,
                format!("period '{}' is not YYYY-MM", self.period),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SyncConnectorPayload {
    connector_id: String,
}

impl SyncConnectorPayload {
    fn check(&self, code: String) -> Result<(), PayloadError> {
        if self.connector_id.is_empty() {
            return Err(PayloadError::new(code, "connector_id must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DirectorPlanPayload {
    objective: String,
    #[serde(default)]
    steps: Vec<String>,
}

impl DirectorPlanPayload {
    fn check(&self, code: String) -> Result<(), PayloadError> {
        if self.objective.is_empty() {
            return Err(PayloadError::new(code, "objective must not be empty"));
        }
        if self.steps.iter().any(|s| s.is_empty()) {
            return Err(PayloadError::new(code, "plan steps must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FinanceResult {
    summary: String,
    entries: Vec<FinanceEntry>,
}

#[derive(Debug, Deserialize)]
struct FinanceEntry {
    account: String,
    #[allow(dead_code)]
    amount: f64,
}

impl FinanceResult {
    fn check(&self) -> Result<(), PayloadError> {
        if self.summary.is_empty() {
            return Err(PayloadError::new(
                "invalid_finance_result",
                "summary must not be empty",
            ));
        }
        if self.entries.iter().any(|e| e.account.is_empty()) {
            return Err(PayloadError::new(
                "invalid_finance_result",
                "entry account must not be empty",
            ));
        }
        Ok(())
    }
}

fn is_year_month(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 7
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
        && matches!(&s[5..], "01" | "02" | "03" | "04" | "05" | "06" | "07" | "08" | "09" | "10"
            | "11" | "12")
}
