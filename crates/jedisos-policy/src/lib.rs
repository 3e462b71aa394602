//! Policy decision point and audit trail for tool-call and message admission.

pub mod audit;
pub mod pdp;

pub use audit::{AuditDecision, AuditRecord, AuditSink, JsonlAuditSink};
pub use pdp::{Decision, PdpRequest, Policy, PolicyDecisionPoint};
