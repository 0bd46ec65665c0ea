//! Typed client for the external policy engine.
//!
//! The engine is a black box consulted over HTTP: `POST /v1/data/casf` with
//! the invocation document, answering `{result: {allow, violations}}`.
//! Parsing is deny-by-default (a missing or malformed `allow` reads as
//! false) and every failure mode is classified so the orchestrator can
//! apply the write/read fail-closed asymmetry and the metrics layer can
//! count by kind.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use casf_core::types::VerifyRequest;

/// Total per-evaluation budget.
pub const POLICY_TIMEOUT: Duration = Duration::from_millis(350);

/// Budget for readiness probes.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// The document handed to the policy engine.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    /// Tool identifier.
    pub tool: String,
    /// Operating mode.
    pub mode: String,
    /// Caller role.
    pub role: String,
    /// Invocation subject.
    pub subject: Value,
    /// Tool arguments.
    pub args: Map<String, Value>,
    /// Invocation context.
    pub context: Value,
}

impl PolicyInput {
    /// Builds the engine input from a verification request.
    #[must_use]
    pub fn from_request(request: &VerifyRequest) -> Self {
        Self {
            tool: request.tool.clone(),
            mode: request.mode.clone(),
            role: request.role.clone(),
            subject: serde_json::to_value(&request.subject).unwrap_or(Value::Null),
            args: request.args.clone(),
            context: serde_json::to_value(&request.context).unwrap_or(Value::Null),
        }
    }
}

/// What the engine decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the engine allows the invocation.
    pub allow: bool,
    /// Violation strings the engine attached; merged verbatim into the
    /// response on deny.
    pub violations: Vec<String>,
}

/// Classified policy-engine failures.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The evaluation exceeded its time budget.
    #[error("policy engine timed out after {POLICY_TIMEOUT:?}")]
    Timeout,

    /// The engine was unreachable.
    #[error("policy engine unreachable: {0}")]
    Unavailable(String),

    /// The engine answered with a non-success status.
    #[error("policy engine returned status {0}")]
    BadStatus(u16),

    /// The engine answered 2xx but the body did not parse.
    #[error("policy engine response unparseable: {0}")]
    BadResponse(String),
}

/// Failure kind, used as the `opa_error_total` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyErrorKind {
    /// Over the time budget.
    Timeout,
    /// Connection-level failure.
    Unavailable,
    /// Non-2xx status.
    BadStatus,
    /// Unparseable body.
    BadResponse,
}

impl PolicyErrorKind {
    /// Metric label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::BadStatus => "bad_status",
            Self::BadResponse => "bad_response",
        }
    }
}

impl PolicyError {
    /// The classification of this failure.
    #[must_use]
    pub const fn kind(&self) -> PolicyErrorKind {
        match self {
            Self::Timeout => PolicyErrorKind::Timeout,
            Self::Unavailable(_) => PolicyErrorKind::Unavailable,
            Self::BadStatus(_) => PolicyErrorKind::BadStatus,
            Self::BadResponse(_) => PolicyErrorKind::BadResponse,
        }
    }

    /// Whether the failure was a timeout (selects `OPA_Timeout` over
    /// `OPA_Unavailable` in the denial).
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Seam for the external policy engine.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluates one invocation document.
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError>;

    /// Readiness probe: the engine must answer a policy query, not just be
    /// TCP-reachable.
    async fn ping(&self) -> Result<(), PolicyError>;
}

#[derive(Debug, Deserialize, Default)]
struct OpaEnvelope {
    #[serde(default)]
    result: OpaResult,
}

#[derive(Debug, Deserialize, Default)]
struct OpaResult {
    #[serde(default)]
    allow: bool,
    #[serde(default)]
    violations: Vec<String>,
}

/// HTTP client for an OPA-compatible policy engine.
pub struct OpaClient {
    base_url: String,
    http_client: reqwest::Client,
    health_client: reqwest::Client,
}

impl OpaClient {
    /// Creates a client for the engine at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Unavailable`] if the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: &str) -> Result<Self, PolicyError> {
        let http_client = reqwest::Client::builder()
            .timeout(POLICY_TIMEOUT)
            .build()
            .map_err(|err| PolicyError::Unavailable(err.to_string()))?;
        let health_client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|err| PolicyError::Unavailable(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            health_client,
        })
    }

    fn decision_url(&self) -> String {
        format!("{}/v1/data/casf", self.base_url)
    }

    async fn query(
        client: &reqwest::Client,
        url: &str,
        input: &Value,
    ) -> Result<PolicyDecision, PolicyError> {
        let response = client
            .post(url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::BadStatus(status.as_u16()));
        }

        let envelope: OpaEnvelope = response
            .json()
            .await
            .map_err(|err| PolicyError::BadResponse(err.to_string()))?;

        Ok(PolicyDecision {
            allow: envelope.result.allow,
            violations: envelope.result.violations,
        })
    }
}

fn classify_transport_error(err: reqwest::Error) -> PolicyError {
    if err.is_timeout() {
        PolicyError::Timeout
    } else {
        PolicyError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl PolicyEngine for OpaClient {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        let doc = serde_json::to_value(input)
            .map_err(|err| PolicyError::BadResponse(err.to_string()))?;
        Self::query(&self.http_client, &self.decision_url(), &doc).await
    }

    async fn ping(&self) -> Result<(), PolicyError> {
        let doc = serde_json::json!({ "tool": "healthcheck" });
        Self::query(&self.health_client, &self.decision_url(), &doc).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parsing_is_deny_by_default() {
        let envelope: OpaEnvelope = serde_json::from_str("{}").unwrap();
        assert!(!envelope.result.allow);
        assert!(envelope.result.violations.is_empty());

        let envelope: OpaEnvelope =
            serde_json::from_str(r#"{"result": {"violations": ["Role_Denied"]}}"#).unwrap();
        assert!(!envelope.result.allow);
        assert_eq!(envelope.result.violations, vec!["Role_Denied"]);

        let envelope: OpaEnvelope = serde_json::from_str(r#"{"result": {"allow": true}}"#).unwrap();
        assert!(envelope.result.allow);
    }

    #[test]
    fn error_kinds_map_to_metric_labels() {
        assert_eq!(PolicyError::Timeout.kind().as_str(), "timeout");
        assert_eq!(
            PolicyError::Unavailable("x".into()).kind().as_str(),
            "unavailable"
        );
        assert_eq!(PolicyError::BadStatus(500).kind().as_str(), "bad_status");
        assert_eq!(
            PolicyError::BadResponse("x".into()).kind().as_str(),
            "bad_response"
        );
    }

    #[test]
    fn input_document_mirrors_request_fields() {
        let request: VerifyRequest = serde_json::from_value(serde_json::json!({
            "request_id": "11111111-2222-4333-8444-555566667777",
            "tool": "twilio.send_sms",
            "mode": "ALLOW",
            "role": "nurse",
            "subject": {"patient_id": "p9"},
            "args": {"body": "hi"},
            "context": {"tenant_id": "t2"}
        }))
        .unwrap();
        let input = PolicyInput::from_request(&request);
        assert_eq!(input.tool, "twilio.send_sms");
        assert_eq!(input.subject["patient_id"], "p9");
        assert_eq!(input.args["body"], "hi");
        assert_eq!(input.context["tenant_id"], "t2");
    }
}
