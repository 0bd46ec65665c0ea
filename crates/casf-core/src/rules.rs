//! Deterministic hard invariants.
//!
//! These checks run in-process with no network dependency and accumulate
//! every applicable violation; the orchestrator short-circuits the pipeline
//! when the set is non-empty, but the scan itself never stops early so a
//! denial reports everything wrong with the request at once.
//!
//! The SMS burst limit is deliberately absent here: it needs the shared
//! counter store and runs as the orchestrator's rate-limit stage.

use std::collections::BTreeSet;

use crate::tools;
use crate::types::{Mode, Role, VerifyRequest, Violation};

/// Evaluates the hard invariants against a request.
#[must_use]
pub fn evaluate(request: &VerifyRequest) -> BTreeSet<Violation> {
    let mut violations = BTreeSet::new();

    if request.context.tenant_id.is_empty() {
        violations.insert(Violation::MissingTenantId);
    }
    if request.subject.patient_id.is_empty() {
        violations.insert(Violation::MissingPatientId);
    }

    let tool = tools::lookup(&request.tool);
    if tool.is_none() {
        violations.insert(Violation::UnknownTool);
    }
    if Role::parse(&request.role).is_none() {
        violations.insert(Violation::UnknownRole);
    }

    match Mode::parse(&request.mode) {
        None => {
            violations.insert(Violation::UnknownMode);
        },
        Some(Mode::KillSwitch) => {
            violations.insert(Violation::KillSwitch);
            // Subsumes the mode-specific write check, but a write tool in a
            // killed session still reports both tags.
            if tools::is_write_tool(&request.tool) {
                violations.insert(Violation::ReadOnlyNoWrite);
            }
        },
        Some(Mode::ReadOnly) => {
            if tools::is_write_tool(&request.tool) {
                violations.insert(Violation::ReadOnlyNoWrite);
            }
        },
        // STEP_UP carries no rules-layer constraint beyond ALLOW; any
        // tightening belongs to the policy engine.
        Some(Mode::Allow | Mode::StepUp) => {},
    }

    violations
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(tool: &str, mode: &str, role: &str, patient: &str, tenant: &str) -> VerifyRequest {
        serde_json::from_value(json!({
            "request_id": "11111111-2222-4333-8444-555566667777",
            "tool": tool,
            "mode": mode,
            "role": role,
            "subject": {"patient_id": patient},
            "args": {},
            "context": {"tenant_id": tenant}
        }))
        .unwrap()
    }

    #[test]
    fn clean_read_passes() {
        let req = request(
            "cliniccloud.list_appointments",
            "READ_ONLY",
            "receptionist",
            "p1",
            "t1",
        );
        assert!(evaluate(&req).is_empty());
    }

    #[test]
    fn clean_write_in_allow_mode_passes() {
        let req = request(
            "cliniccloud.create_appointment",
            "ALLOW",
            "receptionist",
            "p1",
            "t1",
        );
        assert!(evaluate(&req).is_empty());
    }

    #[test]
    fn empty_tenant_is_flagged() {
        let req = request(
            "cliniccloud.list_appointments",
            "ALLOW",
            "receptionist",
            "p1",
            "",
        );
        assert!(evaluate(&req).contains(&Violation::MissingTenantId));
    }

    #[test]
    fn empty_patient_is_flagged() {
        let req = request(
            "cliniccloud.list_appointments",
            "ALLOW",
            "receptionist",
            "",
            "t1",
        );
        assert!(evaluate(&req).contains(&Violation::MissingPatientId));
    }

    #[test]
    fn unknown_tool_is_flagged() {
        let req = request("shell.exec", "ALLOW", "receptionist", "p1", "t1");
        assert_eq!(
            evaluate(&req),
            BTreeSet::from([Violation::UnknownTool])
        );
    }

    #[test]
    fn unknown_role_is_flagged() {
        let req = request(
            "cliniccloud.list_appointments",
            "ALLOW",
            "intruder",
            "p1",
            "t1",
        );
        assert_eq!(evaluate(&req), BTreeSet::from([Violation::UnknownRole]));
    }

    #[test]
    fn unknown_mode_is_flagged_not_silently_denied() {
        let req = request(
            "cliniccloud.list_appointments",
            "MAINTENANCE",
            "receptionist",
            "p1",
            "t1",
        );
        assert_eq!(evaluate(&req), BTreeSet::from([Violation::UnknownMode]));
    }

    #[test]
    fn write_in_read_only_is_flagged() {
        let req = request(
            "cliniccloud.create_appointment",
            "READ_ONLY",
            "receptionist",
            "p1",
            "t1",
        );
        assert_eq!(
            evaluate(&req),
            BTreeSet::from([Violation::ReadOnlyNoWrite])
        );
    }

    #[test]
    fn read_in_read_only_is_clean() {
        let req = request(
            "cliniccloud.summary_history",
            "READ_ONLY",
            "doctor",
            "p1",
            "t1",
        );
        assert!(evaluate(&req).is_empty());
    }

    #[test]
    fn kill_switch_denies_reads_too() {
        let req = request(
            "cliniccloud.list_appointments",
            "KILL_SWITCH",
            "receptionist",
            "p1",
            "t1",
        );
        assert_eq!(evaluate(&req), BTreeSet::from([Violation::KillSwitch]));
    }

    #[test]
    fn kill_switch_on_write_reports_both_mode_tags() {
        let req = request("twilio.send_sms", "KILL_SWITCH", "nurse", "p1", "t1");
        let violations = evaluate(&req);
        assert!(violations.contains(&Violation::KillSwitch));
        assert!(violations.contains(&Violation::ReadOnlyNoWrite));
    }

    #[test]
    fn step_up_behaves_like_allow() {
        let req = request("twilio.send_sms", "STEP_UP", "nurse", "p1", "t1");
        assert!(evaluate(&req).is_empty());
    }

    #[test]
    fn violations_accumulate() {
        let req = request("shell.exec", "PANIC", "intruder", "", "");
        let violations = evaluate(&req);
        assert_eq!(
            violations,
            BTreeSet::from([
                Violation::MissingTenantId,
                Violation::MissingPatientId,
                Violation::UnknownTool,
                Violation::UnknownRole,
                Violation::UnknownMode,
            ])
        );
    }
}
