//! Canonical JSON serialization for hashing and fingerprinting.
//!
//! Logically equal values must produce byte-equal output wherever the
//! gateway takes a hash: audit event payloads, anti-replay fingerprints,
//! digest anchors. The rules:
//!
//! - Object keys sorted lexicographically (byte order)
//! - No insignificant whitespace
//! - Minimal string escaping: only `"`, `\`, and the C0 controls, with the
//!   short escapes (`\b`, `\f`, `\n`, `\r`, `\t`) where JSON defines them
//! - Numbers in their shortest exact decimal form (integers as-is, floats
//!   via the shortest round-trip representation)
//! - Arrays preserve element order
//!
//! Canonicalization is total over `serde_json::Value` and idempotent:
//! re-canonicalizing canonical output is the identity.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};

/// Produces the canonical byte-stable textual form of a JSON value.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut output = String::new();
    emit_value(value, &mut output);
    output
}

/// Canonical form as raw bytes, ready for hashing.
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => emit_array(arr, output),
        Value::Object(obj) => emit_object(obj, output),
    }
}

/// Emits a number in shortest exact decimal form.
///
/// `serde_json` renders integers through `itoa` and floats through `ryu`,
/// both of which already produce the shortest representation that
/// round-trips exactly, so the `Display` output is the canonical one.
fn emit_number(n: &Number, output: &mut String) {
    let _ = write!(output, "{n}");
}

/// Emits a string with minimal escaping per RFC 8785 section 3.2.2.2.
///
/// Only `"` (U+0022), `\` (U+005C), and the control characters U+0000
/// through U+001F are escaped. Everything else, including U+007F and
/// non-ASCII text, is emitted verbatim.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_array(arr: &[Value], output: &mut String) {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output);
    }
    output.push(']');
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}
