//! Safety & policy pipeline: ordered filters and stage-scoped gates that
//! decide whether a command may be admitted (pre) or its result accepted
//! (post).
//!
//! Filters run in registration order and the first decisive filter wins.
//! Gates run after the filters for the phase; any blocking gate aborts
//! regardless of filter outcome. A filter or gate that errors is treated as
//! a block with reason `policy_evaluation_error` (fail-closed).
//!
//! The pipeline is CPU-bound and pure: no I/O, no clock, no randomness.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::WorkerKind;

/// Reason attached when a filter or gate fails to evaluate.
pub const REASON_EVALUATION_ERROR: &str = "policy_evaluation_error";

/// Evaluation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Before admission (command not yet persisted)
    Pre,

    /// After a safety assessment is produced for a completed execution
    Post,
}

/// Risk grading carried by a safety-worker assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Assessment produced by a safety worker, attached to post-phase runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub risk: RiskLevel,

    pub summary: String,

    #[serde(default)]
    pub flags: Vec<String>,
}

/// Outcome action of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    Allow,
    Block,
    NeedsHitl,
}

/// A pipeline decision: the action plus its reasons and mitigations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub action: SafetyAction,

    pub reasons: Vec<String>,

    pub mitigations: Vec<String>,

    pub metadata: serde_json::Value,
}

impl SafetyDecision {
    pub fn allow() -> Self {
        Self {
            action: SafetyAction::Allow,
            reasons: vec![],
            mitigations: vec![],
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            action: SafetyAction::Block,
            reasons: vec![reason.into()],
            mitigations: vec![],
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn needs_hitl(reason: impl Into<String>) -> Self {
        Self {
            action: SafetyAction::NeedsHitl,
            reasons: vec![reason.into()],
            mitigations: vec![],
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_mitigation(mut self, mitigation: impl Into<String>) -> Self {
        self.mitigations.push(mitigation.into());
        self
    }

    fn with_source(mut self, source: &str) -> Self {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(
                "source".to_string(),
                serde_json::Value::String(source.to_string()),
            );
        }
        self
    }
}

/// What a single filter reports back: possibly a decision, possibly
/// mitigations even without one. Mitigations from every consulted filter
/// accumulate up to and including the decisive filter; reasons never merge
/// across filters.
#[derive(Debug, Clone, Default)]
pub struct FilterVerdict {
    pub decision: Option<SafetyDecision>,
    pub mitigations: Vec<String>,
}

impl FilterVerdict {
    /// No opinion.
    pub fn pass() -> Self {
        Self::default()
    }

    /// No opinion, but contribute mitigations.
    pub fn advise(mitigations: Vec<String>) -> Self {
        Self {
            decision: None,
            mitigations,
        }
    }

    /// Decisive.
    pub fn decide(decision: SafetyDecision) -> Self {
        Self {
            decision: Some(decision),
            mitigations: vec![],
        }
    }
}

/// Evaluation failure inside a filter or gate. Always treated as a block.
#[derive(Debug, Clone, Error)]
#[error("policy evaluation failed: {0}")]
pub struct EvaluationError(pub String);

/// The data filters and gates see. Built by the service for each phase.
#[derive(Debug, Clone)]
pub struct PipelineContext<'a> {
    pub phase: Phase,
    pub org_id: &'a str,
    pub session_id: Option<&'a str>,
    pub command_type: &'a str,
    pub worker: WorkerKind,
    pub payload: &'a serde_json::Value,
    pub result: Option<&'a serde_json::Value>,
    pub assessment: Option<&'a SafetyAssessment>,
}

/// Stage a gate is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    /// Planning admission: consulted when the command targets the director
    /// worker.
    DirectorPlan,

    /// Safety review: consulted when an assessment is attached.
    Safety,
}

impl GateStage {
    fn applies(&self, ctx: &PipelineContext<'_>) -> bool {
        match self {
            Self::DirectorPlan => ctx.worker == WorkerKind::Director,
            Self::Safety => ctx.assessment.is_some(),
        }
    }
}

/// Gate result: allow, or block with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Allow,
    Block { reason: String },
}

type FilterFn =
    Box<dyn Fn(&PipelineContext<'_>) -> Result<FilterVerdict, EvaluationError> + Send + Sync>;
type GateFn =
    Box<dyn Fn(&PipelineContext<'_>) -> Result<GateOutcome, EvaluationError> + Send + Sync>;

struct NamedFilter {
    name: String,
    func: FilterFn,
}

struct NamedGate {
    name: String,
    stage: GateStage,
    func: GateFn,
}

/// Ordered filter chain + stage-scoped gates.
#[derive(Default)]
pub struct SafetyPipeline {
    filters: Vec<NamedFilter>,
    gates: Vec<NamedGate>,
}

impl SafetyPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter. Evaluation order is registration order.
    pub fn register_filter<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&PipelineContext<'_>) -> Result<FilterVerdict, EvaluationError>
            + Send
            + Sync
            + 'static,
    {
        self.filters.push(NamedFilter {
            name: name.into(),
            func: Box::new(func),
        });
    }

    /// Register a gate for a stage. Gates run after filters.
    pub fn register_gate<F>(&mut self, name: impl Into<String>, stage: GateStage, func: F)
    where
        F: Fn(&PipelineContext<'_>) -> Result<GateOutcome, EvaluationError>
            + Send
            + Sync
            + 'static,
    {
        self.gates.push(NamedGate {
            name: name.into(),
            stage,
            func: Box::new(func),
        });
    }

    /// Evaluate the pipeline for a phase. Never fails: evaluation errors
    /// fold into a block decision.
    pub fn evaluate(&self, ctx: &PipelineContext<'_>) -> SafetyDecision {
        let mut mitigations: Vec<String> = Vec::new();

        let mut decision = None;
        for filter in &self.filters {
            match (filter.func)(ctx) {
                Err(_) => {
                    decision = Some(
                        SafetyDecision::block(REASON_EVALUATION_ERROR).with_source(&filter.name),
                    );
                    break;
                }
                Ok(verdict) => {
                    mitigations.extend(verdict.mitigations);
                    if let Some(d) = verdict.decision {
                        decision = Some(d.with_source(&filter.name));
                        break;
                    }
                }
            }
        }

        let mut decision = decision.unwrap_or_else(SafetyDecision::allow);
        let own = std::mem::take(&mut decision.mitigations);
        decision.mitigations = mitigations;
        decision.mitigations.extend(own);

        // A filter block already rejects; gates cannot soften it.
        if decision.action == SafetyAction::Block {
            return decision;
        }

        for gate in self.gates.iter().filter(|g| g.stage.applies(ctx)) {
            match (gate.func)(ctx) {
                Err(_) => {
                    let mut blocked =
                        SafetyDecision::block(REASON_EVALUATION_ERROR).with_source(&gate.name);
                    blocked.mitigations = decision.mitigations;
                    return blocked;
                }
                Ok(GateOutcome::Block { reason }) => {
                    let mut blocked = SafetyDecision::block(reason).with_source(&gate.name);
                    blocked.mitigations = decision.mitigations;
                    return blocked;
                }
                Ok(GateOutcome::Allow) => {}
            }
        }

        decision
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

// ── Built-in registrations ─────────────────────────────────────────────

/// Knobs for the built-in filter/gate set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySettings {
    /// Maximum serialized payload size admitted
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Glob patterns rejected anywhere in payload string values
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,

    /// Maximum steps a director plan may carry
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_max_plan_steps() -> usize {
    25
}

fn default_denylist() -> Vec<String> {
    vec![
        "*secret*".to_string(),
        "*credential*".to_string(),
        "*.pem".to_string(),
        "*.key".to_string(),
    ]
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            denylist_patterns: default_denylist(),
            max_plan_steps: default_max_plan_steps(),
        }
    }
}

/// Build the standard pipeline from settings.
pub fn standard_pipeline(settings: &SafetySettings) -> SafetyPipeline {
    let mut pipeline = SafetyPipeline::new();

    let max_bytes = settings.max_payload_bytes;
    pipeline.register_filter("payload_limits", move |ctx| {
        if ctx.phase != Phase::Pre {
            return Ok(FilterVerdict::pass());
        }
        let size = serde_json::to_string(ctx.payload)
            .map_err(|e| EvaluationError(e.to_string()))?
            .len();
        if size > max_bytes {
            Ok(FilterVerdict::decide(
                SafetyDecision::block("payload_too_large")
                    .with_mitigation(format!("reduce payload below {} bytes", max_bytes)),
            ))
        } else {
            Ok(FilterVerdict::pass())
        }
    });

    let patterns: Vec<Pattern> = settings
        .denylist_patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();
    pipeline.register_filter("payload_denylist", move |ctx| {
        if ctx.phase != Phase::Pre {
            return Ok(FilterVerdict::pass());
        }
        if payload_matches_denylist(ctx.payload, &patterns) {
            Ok(FilterVerdict::decide(
                SafetyDecision::block("denylisted_content")
                    .with_mitigation("remove denylisted material from the payload"),
            ))
        } else {
            Ok(FilterVerdict::pass())
        }
    });

    pipeline.register_filter("finance_close_review", |ctx| {
        if ctx.phase == Phase::Pre
            && ctx.command_type == "finance_command"
            && ctx.payload.get("operation").and_then(|v| v.as_str()) == Some("close_books")
        {
            Ok(FilterVerdict::decide(
                SafetyDecision::needs_hitl("finance_close_requires_review")
                    .with_mitigation("a reviewer must sign off before dispatch"),
            ))
        } else {
            Ok(FilterVerdict::pass())
        }
    });

    let max_steps = settings.max_plan_steps;
    pipeline.register_gate("plan_step_budget", GateStage::DirectorPlan, move |ctx| {
        let steps = ctx
            .payload
            .get("steps")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        if steps > max_steps {
            Ok(GateOutcome::Block {
                reason: "plan_step_budget_exceeded".to_string(),
            })
        } else {
            Ok(GateOutcome::Allow)
        }
    });

    pipeline.register_gate("assessment_risk", GateStage::Safety, |ctx| {
        match ctx.assessment {
            Some(assessment) if assessment.risk == RiskLevel::High => Ok(GateOutcome::Block {
                reason: "assessment_high_risk".to_string(),
            }),
            _ => Ok(GateOutcome::Allow),
        }
    });

    pipeline
}

/// Walk payload string values against compiled denylist patterns.
fn payload_matches_denylist(value: &serde_json::Value, patterns: &[Pattern]) -> bool {
    match value {
        serde_json::Value::String(s) => patterns.iter().any(|p| p.matches(s)),
        serde_json::Value::Array(items) => {
            items.iter().any(|v| payload_matches_denylist(v, patterns))
        }
        serde_json::Value::Object(map) => {
            map.values().any(|v| payload_matches_denylist(v, patterns))
        }
        _ => false,
    }
}
