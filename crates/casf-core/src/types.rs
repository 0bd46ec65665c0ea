//! Request, response, and audit record types.
//!
//! The wire shapes mirror the `/verify` JSON contract. `tool`, `mode`, and
//! `role` arrive as open strings: membership in their closed sets is a rules
//! decision that produces a violation tag and a 200 DENY, not a schema
//! failure. `request_id` is a hard schema requirement and parses as a UUID.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Timestamp format for every UTC instant the gateway renders: ISO-8601
/// with a fixed six-digit fractional part and a literal `Z`.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Returns the current UTC instant in the gateway's fixed textual form.
#[must_use]
pub fn utc_now_text() -> String {
    chrono::Utc::now().format(TS_FORMAT).to_string()
}

/// A tool invocation submitted for verification.
///
/// Immutable after parse; owned by the orchestrator for one request turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyRequest {
    /// Caller-supplied idempotency key, unique per logical invocation.
    pub request_id: Uuid,
    /// Tool identifier; validated against the registry downstream.
    pub tool: String,
    /// Operating mode; validated against the closed mode set downstream.
    pub mode: String,
    /// Caller role tag; validated against the closed role set downstream.
    pub role: String,
    /// Who the invocation acts on.
    pub subject: Subject,
    /// Tool arguments, opaque to the gateway.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Invocation context.
    pub context: Context,
}

impl VerifyRequest {
    /// The full request as a JSON value, as used in audit payloads.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Subject of the invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    /// Patient identifier; required non-empty by the rules layer.
    #[serde(default)]
    pub patient_id: String,
    /// Additional subject fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Invocation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Context {
    /// Tenant identifier; required non-empty by the rules layer.
    #[serde(default)]
    pub tenant_id: String,
    /// Caller-side timestamp, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Originating system, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Additional context fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Terminal decision for a verification turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// The caller may execute the tool.
    #[serde(rename = "ALLOW")]
    Allow,
    /// The caller must not execute the tool.
    #[serde(rename = "DENY")]
    Deny,
}

impl Decision {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode of the calling agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal operation.
    Allow,
    /// Elevated-scrutiny operation; the rules layer treats it like
    /// [`Mode::Allow`] and defers any extra constraint to the policy engine.
    StepUp,
    /// No side effects permitted.
    ReadOnly,
    /// Everything denied.
    KillSwitch,
}

impl Mode {
    /// Parses a wire mode string; `None` for anything outside the
    /// recognized set.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALLOW" => Some(Self::Allow),
            "STEP_UP" => Some(Self::StepUp),
            "READ_ONLY" => Some(Self::ReadOnly),
            "KILL_SWITCH" => Some(Self::KillSwitch),
            _ => None,
        }
    }
}

/// Caller role tags recognized by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Front-desk staff.
    Receptionist,
    /// Nursing staff.
    Nurse,
    /// Physicians.
    Doctor,
    /// Billing department.
    Billing,
    /// Records custodian.
    Custodian,
    /// Automated system actors.
    System,
}

impl Role {
    /// Parses a wire role string; `None` for anything outside the closed
    /// set.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "receptionist" => Some(Self::Receptionist),
            "nurse" => Some(Self::Nurse),
            "doctor" => Some(Self::Doctor),
            "billing" => Some(Self::Billing),
            "custodian" => Some(Self::Custodian),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Violation tags the gateway itself can assert.
///
/// These are stable wire identifiers; the policy engine may contribute
/// additional strings of its own which are merged verbatim at assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Violation {
    /// `context.tenant_id` missing or empty.
    MissingTenantId,
    /// `subject.patient_id` missing or empty.
    MissingPatientId,
    /// Role outside the closed role set.
    UnknownRole,
    /// Mode outside the recognized mode set.
    UnknownMode,
    /// Tool not present in the registry.
    UnknownTool,
    /// Session is in `KILL_SWITCH` mode.
    KillSwitch,
    /// Write tool requested in `READ_ONLY` mode.
    ReadOnlyNoWrite,
    /// Same `request_id` replayed with a different payload.
    ReplayPayloadMismatch,
    /// Same `request_id` is mid-flight in another pipeline.
    ReplayConcurrent,
    /// Anti-replay store unreachable on a write tool.
    ReplayCheckUnavailable,
    /// SMS-per-patient burst limit hit (or limiter unreachable on a write).
    NoSmsBurst,
    /// Policy engine unreachable on a write tool.
    OpaUnavailable,
    /// Policy engine exceeded its timeout budget on a write tool.
    OpaTimeout,
    /// Policy engine denied without naming violations.
    OpaDeny,
    /// Audit trail could not be appended.
    AuditUnavailable,
    /// Umbrella marker: an infrastructure failure forced the denial.
    FailClosed,
}

impl Violation {
    /// Stable wire tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingTenantId => "BadRequest_MissingTenantId",
            Self::MissingPatientId => "BadRequest_MissingPatientId",
            Self::UnknownRole => "BadRequest_UnknownRole",
            Self::UnknownMode => "BadRequest_UnknownMode",
            Self::UnknownTool => "Tool_Unknown",
            Self::KillSwitch => "Mode_KillSwitch",
            Self::ReadOnlyNoWrite => "Mode_ReadOnly_NoWrite",
            Self::ReplayPayloadMismatch => "Inv_ReplayPayloadMismatch",
            Self::ReplayConcurrent => "Inv_ReplayConcurrent",
            Self::ReplayCheckUnavailable => "Inv_ReplayCheckUnavailable",
            Self::NoSmsBurst => "Inv_NoSmsBurst",
            Self::OpaUnavailable => "OPA_Unavailable",
            Self::OpaTimeout => "OPA_Timeout",
            Self::OpaDeny => "OPA_Deny",
            Self::AuditUnavailable => "Audit_Unavailable",
            Self::FailClosed => "FAIL_CLOSED",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal decision returned to the caller.
///
/// Serialization is byte-stable for a given content: `violations` is kept
/// sorted and deduplicated so the replay cache can hand back the identical
/// body on idempotent retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyResponse {
    /// ALLOW or DENY.
    pub decision: Decision,
    /// Stable violation tags, lexicographically sorted.
    pub violations: Vec<String>,
    /// Human-readable concatenation of the violation tags.
    pub reason: String,
    /// The tool's static output channels on ALLOW; empty on DENY.
    pub allowed_outputs: Vec<String>,
}

impl VerifyResponse {
    /// An ALLOW carrying the tool's static output set.
    #[must_use]
    pub fn allow(allowed_outputs: Vec<String>) -> Self {
        Self {
            decision: Decision::Allow,
            violations: Vec::new(),
            reason: "OK".to_string(),
            allowed_outputs,
        }
    }

    /// A DENY built from gateway-asserted violation tags.
    #[must_use]
    pub fn deny(violations: impl IntoIterator<Item = Violation>) -> Self {
        Self::deny_tags(violations.into_iter().map(|v| v.as_str().to_string()))
    }

    /// A DENY built from raw tag strings (gateway tags plus any the policy
    /// engine contributed).
    #[must_use]
    pub fn deny_tags(tags: impl IntoIterator<Item = String>) -> Self {
        let set: BTreeSet<String> = tags.into_iter().collect();
        let violations: Vec<String> = set.into_iter().collect();
        let reason = violations.join(", ");
        Self {
            decision: Decision::Deny,
            violations,
            reason,
            allowed_outputs: Vec::new(),
        }
    }

    /// Whether the response carries the given gateway tag.
    #[must_use]
    pub fn has_violation(&self, violation: Violation) -> bool {
        self.violations.iter().any(|v| v == violation.as_str())
    }
}

/// What the orchestrator hands to the audit writer: everything except the
/// fields the writer itself assigns (`event_id`, `ts`, `prev_hash`, `hash`).
#[derive(Debug, Clone)]
pub struct AuditDraft {
    /// Originating request.
    pub request_id: Uuid,
    /// `role:<role>` of the caller.
    pub actor: String,
    /// The tool identifier, or a marker such as `REPLAY_DETECTED`.
    pub action: String,
    /// Terminal decision being recorded.
    pub decision: Decision,
    /// Canonicalizable request+response snapshot.
    pub payload: Value,
}

impl AuditDraft {
    /// Builds the standard draft for a request/response pair.
    #[must_use]
    pub fn for_turn(request: &VerifyRequest, response: &VerifyResponse) -> Self {
        Self {
            request_id: request.request_id,
            actor: format!("role:{}", request.role),
            action: request.tool.clone(),
            decision: response.decision,
            payload: serde_json::json!({
                "request": request.to_value(),
                "response": serde_json::to_value(response).unwrap_or(Value::Null),
            }),
        }
    }

    /// Same as [`AuditDraft::for_turn`] but with the action replaced, used
    /// for `REPLAY_DETECTED` records.
    #[must_use]
    pub fn for_turn_with_action(
        request: &VerifyRequest,
        response: &VerifyResponse,
        action: &str,
    ) -> Self {
        let mut draft = Self::for_turn(request, response);
        draft.action = action.to_string();
        draft
    }
}

/// A persisted, immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Originating request.
    pub request_id: Uuid,
    /// Append-time UTC instant in [`TS_FORMAT`].
    pub ts: String,
    /// `role:<role>` of the caller.
    pub actor: String,
    /// Tool identifier or marker action.
    pub action: String,
    /// Terminal decision recorded.
    pub decision: Decision,
    /// Canonicalized request+response snapshot.
    pub payload: Value,
    /// Hash of the predecessor event; empty string for genesis.
    pub prev_hash: String,
    /// Lowercase hex SHA-256 over this event's hash preimage.
    pub hash: String,
}
