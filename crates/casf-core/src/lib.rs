//! # casf-core
//!
//! Core library for the CASF verification gateway, a zero-trust decision
//! point between an untrusted AI agent and side-effectful clinical tools.
//!
//! This crate holds everything that runs in-process with no I/O:
//!
//! - **Canonical JSON**: deterministic serialization used for hashing and
//!   request fingerprinting
//! - **Hash chain**: tamper-evident linkage of audit events
//! - **Types**: request/response/audit records with bounded enums for mode,
//!   role, decision, and violation tags
//! - **Tool registry**: the closed tool set with READ/WRITE classification
//! - **Rules**: deterministic hard invariants evaluated before any network
//!   collaborator is consulted
//!
//! The gateway daemon (`casf-verifier`) layers Redis, Postgres, and the
//! external policy engine on top of these primitives.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod chain;
pub mod rules;
pub mod tools;
pub mod types;

pub use canonical::{canonical_json, canonical_json_bytes};
pub use chain::{compute_hash, verify_chain, ChainVerification};
pub use tools::{is_write_tool, lookup, ToolClass, ToolSpec};
pub use types::{
    AuditDraft, AuditEvent, Context, Decision, Mode, Role, Subject, VerifyRequest, VerifyResponse,
    Violation,
};
