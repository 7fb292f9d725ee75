//! Client-facing guardian summary (schema "1")
//!
//! Wallet clients render this payload without knowing engine internals.
//! Fields may be added; existing meanings do not change without bumping
//! `schema_version`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::guardian::approval::ApprovalRequest;
use crate::guardian::rules::Profile;
use crate::guardian::types::{Guardian, GuardianRole, GuardianStatus, Verdict, VerdictKind};

pub const SCHEMA_VERSION: &str = "1";

/// Guardian details safe to show in a UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianView {
    pub id: String,
    pub label: String,
    pub role: GuardianRole,
    pub contact: Option<String>,
    pub status: GuardianStatus,
}

impl From<&Guardian> for GuardianView {
    fn from(g: &Guardian) -> Self {
        Self {
            id: g.id.clone(),
            label: if g.label.is_empty() { g.id.clone() } else { g.label.clone() },
            role: g.role,
            contact: g.contact.clone(),
            status: g.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStatusView {
    pub total_required: u32,
    pub approved: u32,
    pub rejected: u32,
    pub pending: u32,
}

impl From<&ApprovalRequest> for ApprovalStatusView {
    fn from(request: &ApprovalRequest) -> Self {
        let tally = request.tally();
        Self {
            total_required: tally.required,
            approved: tally.approved,
            rejected: tally.rejected,
            pending: tally.required.saturating_sub(tally.approved + tally.rejected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianSummary {
    pub schema_version: String,

    // Outcome
    pub verdict: VerdictKind,
    pub needs_approval: bool,

    // Human-facing
    pub short_message: String,
    pub long_message: String,
    /// i18n key for the client UX layer
    pub ui_message_key: String,

    // Machine-facing; clients should prefer these over parsing messages
    pub codes: Vec<String>,
    pub next_actions: Vec<String>,
    pub reasons: Vec<String>,

    // Approval details
    pub approval_request_id: Option<String>,
    pub rule_id: Option<String>,
    pub rule_description: Option<String>,
    pub guardians: Vec<GuardianView>,
    pub status: Option<ApprovalStatusView>,

    /// Client must ask for PIN / biometric before continuing
    pub require_device_auth: bool,
    /// Operation must not proceed under any circumstance
    pub hard_block: bool,

    pub timestamp_ms: i64,
}

impl GuardianSummary {
    /// Build the payload for a verdict and its approval request, if any
    pub fn build(
        verdict: &Verdict,
        approval: Option<&ApprovalRequest>,
        profile: Option<&Profile>,
        now: DateTime<Utc>,
    ) -> Self {
        let (short, long, key, mut codes, next_actions) = match verdict.kind {
            VerdictKind::Allow => (
                "Action allowed",
                "Guardian policy allowed this action without extra approvals.",
                "guardian.ok",
                strs(&["ALLOW"]),
                strs(&["CONTINUE", "VIEW_DETAILS"]),
            ),
            VerdictKind::Warn => (
                "Confirm to continue",
                "Guardian noticed elevated risk. Confirm on this device to continue.",
                "guardian.require_auth",
                strs(&["WARN"]),
                strs(&["CONFIRM", "CANCEL", "VIEW_DETAILS"]),
            ),
            VerdictKind::RequireApproval => (
                "Approval required",
                "This action needs guardian approvals before it can continue.",
                "guardian.require_guardian",
                strs(&["REQUIRE_APPROVAL"]),
                strs(&["REQUEST_APPROVAL", "CANCEL", "VIEW_DETAILS"]),
            ),
            VerdictKind::Block => (
                "Action blocked",
                "Guardian policy blocked this action.",
                "guardian.blocked",
                strs(&["BLOCK"]),
                strs(&["CANCEL", "VIEW_DETAILS"]),
            ),
        };

        let rule_id = approval
            .and_then(|a| a.rule_id.clone())
            .or_else(|| verdict.rule_ids.first().cloned());
        let rule_description = rule_id.as_deref().and_then(|id| {
            profile
                .and_then(|p| p.rules.iter().find(|r| r.id == id))
                .and_then(|r| r.description.clone())
        });
        if rule_id.is_some() && verdict.kind > VerdictKind::Allow {
            codes.push("POLICY_RULE".to_string());
        }

        let guardian_ids: Vec<String> = match (approval, profile) {
            (Some(a), _) => a.guardians.clone(),
            (None, Some(p)) if verdict.kind == VerdictKind::RequireApproval => {
                p.eligible_guardians(None)
            }
            _ => Vec::new(),
        };
        let guardians = guardian_ids
            .iter()
            .map(|id| match profile.and_then(|p| p.roster.get(id)) {
                Some(g) => GuardianView::from(g),
                None => GuardianView {
                    id: id.clone(),
                    label: id.clone(),
                    role: GuardianRole::default(),
                    contact: None,
                    status: GuardianStatus::Active,
                },
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            verdict: verdict.kind,
            needs_approval: verdict.kind == VerdictKind::RequireApproval,
            short_message: short.to_string(),
            long_message: long.to_string(),
            ui_message_key: key.to_string(),
            codes,
            next_actions,
            reasons: verdict.reasons.clone(),
            approval_request_id: approval.map(|a| a.id.clone()),
            rule_id,
            rule_description,
            guardians,
            status: approval.map(ApprovalStatusView::from),
            require_device_auth: matches!(
                verdict.kind,
                VerdictKind::Warn | VerdictKind::RequireApproval
            ),
            hard_block: verdict.kind == VerdictKind::Block,
            timestamp_ms: now.timestamp_millis(),
        }
    }
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::approval::{ApprovalStore, Vote};
    use crate::guardian::policy::ApprovalDraft;
    use crate::guardian::rules::RuleSet;
    use crate::guardian::types::{ActionContext, GuardianRule};
    use crate::shield::types::ActionKind;

    #[test]
    fn test_allow_payload() {
        let summary = GuardianSummary::build(
            &Verdict::new(VerdictKind::Allow, "no_matching_rules"),
            None,
            None,
            Utc::now(),
        );
        assert_eq!(summary.schema_version, "1");
        assert_eq!(summary.codes, vec!["ALLOW".to_string()]);
        assert_eq!(summary.next_actions, vec!["CONTINUE".to_string(), "VIEW_DETAILS".to_string()]);
        assert!(!summary.needs_approval);
        assert!(!summary.hard_block);
        assert_eq!(summary.ui_message_key, "guardian.ok");
    }

    #[test]
    fn test_block_payload() {
        let mut verdict = Verdict::block("block_rule:no-burn");
        verdict.rule_ids.push("no-burn".into());
        let summary = GuardianSummary::build(&verdict, None, None, Utc::now());
        assert!(summary.hard_block);
        assert!(!summary.require_device_auth);
        assert_eq!(summary.next_actions, vec!["CANCEL".to_string(), "VIEW_DETAILS".to_string()]);
        assert_eq!(summary.codes, vec!["BLOCK".to_string(), "POLICY_RULE".to_string()]);
    }

    #[test]
    fn test_approval_payload() {
        let rule = GuardianRule::threshold("send-1000", ActionKind::Send, 1_000, 2, vec![])
            .with_description("Large sends need two guardians.");
        let guardians = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        let rules = RuleSet::from_rules("t", guardians.clone(), vec![rule]).unwrap();
        let profile = rules.profile_for("w1");

        let store = ApprovalStore::new();
        let now = Utc::now();
        let draft = ApprovalDraft {
            rule_id: Some("send-1000".into()),
            rule_ids: vec!["send-1000".into()],
            required: 2,
            guardians,
            ttl_secs: 60,
            quorums: vec![],
            risk_floors: vec![],
        };
        let request = store.create(&draft, &ActionContext::new("w1", ActionKind::Send, 1_500), None, now);
        let request = store.apply_vote(&request.id, "g1", Vote::Approve, None, now).unwrap();

        let mut verdict = Verdict::new(VerdictKind::RequireApproval, "threshold:send-1000");
        verdict.rule_ids.push("send-1000".into());
        let summary = GuardianSummary::build(&verdict, Some(&request), Some(profile), now);

        assert!(summary.needs_approval);
        assert!(summary.require_device_auth);
        assert_eq!(summary.approval_request_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(summary.rule_description.as_deref(), Some("Large sends need two guardians."));
        assert_eq!(summary.codes, vec!["REQUIRE_APPROVAL".to_string(), "POLICY_RULE".to_string()]);
        assert_eq!(summary.guardians.len(), 3);
        assert_eq!(
            summary.status,
            Some(ApprovalStatusView {
                total_required: 2,
                approved: 1,
                rejected: 0,
                pending: 1,
            })
        );

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["verdict"], "REQUIRE_APPROVAL");
    }
}
