//! The closed tool registry.
//!
//! Every tool the gateway will ever rule on is declared here with its
//! side-effect class and the static output channels an ALLOW unlocks.
//! Anything not in this table denies with `Tool_Unknown`.

/// Whether executing a tool produces external side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    /// No side effects; eligible for the fail-open read path.
    Read,
    /// Side effects; always fail-closed under infrastructure failure.
    Write,
}

/// A registered tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    /// Wire identifier.
    pub name: &'static str,
    /// Side-effect classification.
    pub class: ToolClass,
    /// Output channels unlocked by an ALLOW.
    pub outputs: &'static [&'static str],
}

/// The SMS tool, the only rate-limited tool in v1.
pub const SEND_SMS: &str = "twilio.send_sms";

/// The registered tool set.
pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "cliniccloud.create_appointment",
        class: ToolClass::Write,
        outputs: &["confirmation"],
    },
    ToolSpec {
        name: "cliniccloud.cancel_appointment",
        class: ToolClass::Write,
        outputs: &["confirmation"],
    },
    ToolSpec {
        name: "cliniccloud.list_appointments",
        class: ToolClass::Read,
        outputs: &["slots_aggregated"],
    },
    ToolSpec {
        name: "cliniccloud.summary_history",
        class: ToolClass::Read,
        outputs: &["summary_text"],
    },
    ToolSpec {
        name: SEND_SMS,
        class: ToolClass::Write,
        outputs: &["delivery_status"],
    },
    ToolSpec {
        name: "stripe.generate_invoice",
        class: ToolClass::Write,
        outputs: &["invoice_pdf"],
    },
];

/// Looks up a tool by wire identifier.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|spec| spec.name == name)
}

/// Whether the named tool is a write tool.
///
/// Unknown tools report `false`; they already deny via `Tool_Unknown`
/// before any fail-open/fail-closed branch matters.
#[must_use]
pub fn is_write_tool(name: &str) -> bool {
    lookup(name).is_some_and(|spec| spec.class == ToolClass::Write)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_classifies_tools() {
        assert!(is_write_tool("twilio.send_sms"));
        assert!(is_write_tool("cliniccloud.create_appointment"));
        assert!(!is_write_tool("cliniccloud.list_appointments"));
        assert!(!is_write_tool("cliniccloud.summary_history"));
    }

    #[test]
    fn unknown_tools_are_not_writes() {
        assert!(lookup("evil.rm_rf").is_none());
        assert!(!is_write_tool("evil.rm_rf"));
    }

    #[test]
    fn outputs_are_static_per_tool() {
        let spec = lookup("cliniccloud.list_appointments").unwrap();
        assert_eq!(spec.outputs, &["slots_aggregated"]);
        let spec = lookup(SEND_SMS).unwrap();
        assert_eq!(spec.outputs, &["delivery_status"]);
    }

    #[test]
    fn names_are_unique() {
        for (i, a) in TOOLS.iter().enumerate() {
            for b in &TOOLS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}
