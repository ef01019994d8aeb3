//! Org-level access compliance.
//!
//! Every request that reaches the orchestrator is checked against the org's
//! access policy: MFA strength, IP allowlisting, consent acknowledgement,
//! and Council of Europe disclosure acknowledgement. Checks run in a fixed
//! precedence order and the first failure short-circuits.
//!
//! The gate is a pure function over an `AccessContext` computed fresh per
//! request; contexts are never cached across requests because policy can
//! change between calls.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header carrying the authentication strength ("mfa" satisfies MFA policy).
pub const HEADER_AUTH_STRENGTH: &str = "x-auth-strength";
/// Header acknowledging a consent requirement version.
pub const HEADER_CONSENT_VERSION: &str = "x-consent-version";
/// Header acknowledging a Council of Europe disclosure version.
pub const HEADER_COE_DISCLOSURE_VERSION: &str = "x-coe-disclosure-version";

/// A versioned consent requirement in the org policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequirement {
    #[serde(rename = "type")]
    pub consent_type: String,
    pub version: String,
}

/// A versioned Council of Europe disclosure requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoeRequirement {
    pub version: String,
    pub document_url: String,
}

/// Org access policy flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub confidential_mode: bool,

    #[serde(default)]
    pub mfa_required: bool,

    #[serde(default)]
    pub ip_allowlist_enforced: bool,

    #[serde(default)]
    pub consent_requirement: Option<ConsentRequirement>,

    #[serde(default)]
    pub council_of_europe_requirement: Option<CoeRequirement>,

    #[serde(default)]
    pub residency_zone: Option<String>,
}

/// Caller-side acknowledgement state recorded for the org/user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsentState {
    #[serde(default)]
    pub latest_accepted_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoeState {
    #[serde(default)]
    pub acknowledged_version: Option<String>,
}

/// Per-request view of org policy + caller identity. Computed fresh each
/// request; never persisted or cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessContext {
    pub org_id: String,
    pub user_id: String,
    pub role: String,
    pub policy: AccessPolicy,
    #[serde(default)]
    pub ip_allowlist_cidrs: Vec<String>,
    #[serde(default)]
    pub consent: ConsentState,
    #[serde(default)]
    pub council_of_europe: CoeState,
}

/// The request-side inputs to the gate: source IP and a lowercase header map.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub ip: IpAddr,
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Typed compliance failures, in gate precedence order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComplianceError {
    #[error("multi-factor authentication required")]
    MfaRequired,

    #[error("IP allowlist is enforced but empty")]
    IpAllowlistEmpty,

    #[error("request IP {0} matches no allowlisted CIDR")]
    IpNotAllowed(IpAddr),

    #[error("consent version {required} not acknowledged")]
    ConsentRequired { required: String },

    #[error("Council of Europe disclosure version {required} not acknowledged")]
    CoeDisclosureRequired { required: String },
}

impl ComplianceError {
    /// Stable error code surfaced to callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MfaRequired => "mfa_required",
            Self::IpAllowlistEmpty => "ip_allowlist_empty",
            Self::IpNotAllowed(_) => "ip_not_allowed",
            Self::ConsentRequired { .. } => "consent_required",
            Self::CoeDisclosureRequired { .. } => "coe_disclosure_required",
        }
    }
}

/// Evaluate the gate. Checks run in fixed precedence (MFA, IP allowlist,
/// consent, CoE disclosure) and the first failure wins.
pub fn ensure_compliant(
    access: &AccessContext,
    request: &RequestMeta,
) -> Result<(), ComplianceError> {
    if access.policy.mfa_required {
        let strength = request.header(HEADER_AUTH_STRENGTH).unwrap_or("");
        if !strength.eq_ignore_ascii_case("mfa") {
            return Err(ComplianceError::MfaRequired);
        }
    }

    if access.policy.ip_allowlist_enforced {
        if access.ip_allowlist_cidrs.is_empty() {
            return Err(ComplianceError::IpAllowlistEmpty);
        }
        let allowed = access
            .ip_allowlist_cidrs
            .iter()
            .filter_map(|c| Cidr::parse(c))
            .any(|c| c.contains(request.ip));
        if !allowed {
            return Err(ComplianceError::IpNotAllowed(request.ip));
        }
    }

    if let Some(req) = &access.policy.consent_requirement {
        let accepted = access.consent.latest_accepted_version.as_deref() == Some(&req.version)
            || request.header(HEADER_CONSENT_VERSION) == Some(req.version.as_str());
        if !accepted {
            return Err(ComplianceError::ConsentRequired {
                required: req.version.clone(),
            });
        }
    }

    if let Some(req) = &access.policy.council_of_europe_requirement {
        let acknowledged = access.council_of_europe.acknowledged_version.as_deref()
            == Some(&req.version)
            || request.header(HEADER_COE_DISCLOSURE_VERSION) == Some(req.version.as_str());
        if !acknowledged {
            return Err(ComplianceError::CoeDisclosureRequired {
                required: req.version.clone(),
            });
        }
    }

    Ok(())
}

/// Supplies the fresh per-request access context for an org/user pair.
#[async_trait]
pub trait AccessContextProvider: Send + Sync {
    async fn access_context(&self, org_id: &str, user_id: &str, role: &str) -> AccessContext;
}

/// Provider backed by a static per-org policy table (config-driven
/// deployments and tests). Orgs without an entry get a default-open policy.
pub struct StaticAccessProvider {
    policies: HashMap<String, OrgAccessRecord>,
}

/// The stored per-org side of an access context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgAccessRecord {
    #[serde(default)]
    pub policy: AccessPolicy,
    #[serde(default)]
    pub ip_allowlist_cidrs: Vec<String>,
    #[serde(default)]
    pub consent: ConsentState,
    #[serde(default)]
    pub council_of_europe: CoeState,
}

impl StaticAccessProvider {
    pub fn new(policies: HashMap<String, OrgAccessRecord>) -> Self {
        Self { policies }
    }

    pub fn open() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }
}

#[async_trait]
impl AccessContextProvider for StaticAccessProvider {
    async fn access_context(&self, org_id: &str, user_id: &str, role: &str) -> AccessContext {
        let record = self.policies.get(org_id).cloned().unwrap_or_default();
        AccessContext {
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            role: role.to_string(),
            policy: record.policy,
            ip_allowlist_cidrs: record.ip_allowlist_cidrs,
            consent: record.consent,
            council_of_europe: record.council_of_europe,
        }
    }
}

/// A parsed CIDR block. Membership is a plain prefix test; any matching
/// block in the allowlist suffices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().ok()?),
            // Bare address: exact-match block
            None => (s, if s.contains(':') { 128 } else { 32 }),
        };
        let network: IpAddr = addr.parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return None;
        }
        Some(Self {
            network,
            prefix_len: prefix,
        })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len as u32)
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len as u32)
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}
