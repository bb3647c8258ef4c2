//! Human-approval gate in front of every tool call.
//!
//! - [`rules`]: allow/deny patterns scoped to a tool or a connector.
//! - [`store`]: where rules and the enabled flag are persisted.
//! - [`engine`]: evaluation order, session memory, interactive batches and
//!   the audit log.

pub mod engine;
pub mod rules;
pub mod store;

pub use engine::{
    ApprovalDecision, ApprovalEngine, ApprovalRequest, ApprovalSettings, DecisionSource,
    PREFERENCES_KEY, PendingBatch, Verdict,
};
pub use rules::{ApprovalRule, RuleScope, RuleType, glob_match};
pub use store::{JsonFilePreferences, MemoryPreferences, PreferencesError, PreferencesStore};
