//! Stateful guardrail subsystems.
//!
//! Every store is a thin struct around the shared pool: parameterized SQL
//! only, row→domain conversion that validates closed string sets, and
//! state-transition guards enforced in code rather than in triggers.
//! Sessions are referenced by opaque string id; nothing here holds a
//! pointer into the session table.

pub mod attempts;
pub mod audit;
pub mod documents;
pub mod failures;
pub mod file_reads;
pub mod fixes;
pub mod halt;
pub mod production;
pub mod projects;
pub mod rules;
pub mod types;
pub mod uncertainty;

pub use attempts::{AttemptStore, StrikeCheck, TaskAttempt};
pub use audit::{AuditEvent, AuditStore};
pub use documents::{Document, DocumentStore};
pub use failures::{Failure, FailureStore};
pub use file_reads::{FileRead, FileReadStore};
pub use fixes::{FixVerification, FixVerificationStore};
pub use halt::{
    check_halt_conditions, CurrentContext, HaltDecision, HaltEvent, HaltReason, HaltStore,
    ProposedChanges,
};
pub use production::{ProductionCodeRecord, ProductionCodeStore};
pub use projects::{Project, ProjectStore};
pub use rules::{NewRule, RulePatch, RuleStore, UpsertOutcome};
pub use types::{
    AttemptResolution, CodeType, FixType, HaltResolution, HaltSeverity, HaltType,
    UncertaintyLevel, VerificationStatus,
};
pub use uncertainty::{UncertaintyRecord, UncertaintyStore};
