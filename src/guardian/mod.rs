//! Guardian policy: rules, verdicts and multi-party approvals

pub mod approval;
pub mod policy;
pub mod presets;
pub mod rules;
pub mod summary;
pub mod types;

// Re-exports
pub use approval::{ApprovalRequest, ApprovalStatus, ApprovalStore, Tally, Vote, VoteState};
pub use policy::{evaluate, ApprovalDraft, PolicyOutcome, Quorum};
pub use presets::Preset;
pub use rules::{EffectivePolicy, PolicyStore, Profile, RuleFile, RuleSet, RuleSource};
pub use summary::GuardianSummary;
pub use types::{
    ActionContext, Guardian, GuardianRule, RuleScope, Severity, Verdict, VerdictKind,
};
