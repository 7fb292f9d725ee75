//! Policy evaluation
//!
//! Maps a `RiskMap` and an `ActionContext` through one `RuleSet` snapshot to a
//! `Verdict`. Evaluation is a pure function: no I/O, no clock, no shared state.
//!
//! Every matched rule and every risk floor contributes a verdict kind; the
//! result is the maximum under `ALLOW < WARN < REQUIRE_APPROVAL < BLOCK`.

use serde::{Deserialize, Serialize};

use crate::guardian::rules::{Profile, RuleSet};
use crate::guardian::types::{
    ActionContext, GuardianRule, Severity, Verdict, VerdictKind,
};
use crate::shield::types::{RiskLevel, RiskMap};

/// Sign-off one rule asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    /// None when only a risk floor asked for approval
    pub rule_id: Option<String>,
    pub required: u32,
    /// Active guardians whose approval counts here, sorted
    pub guardians: Vec<String>,
}

impl Quorum {
    fn new(rule_id: Option<String>, required: u32, mut guardians: Vec<String>) -> Self {
        guardians.sort();
        guardians.dedup();
        Self {
            rule_id,
            required: required.max(1),
            guardians,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.guardians.len() as u32 >= self.required
    }
}

/// What an approval request must look like, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDraft {
    /// Rule with the largest approval requirement, if a rule triggered
    pub rule_id: Option<String>,
    /// All rules that asked for approval
    pub rule_ids: Vec<String>,
    pub required: u32,
    /// Guardians allowed to vote, sorted
    pub guardians: Vec<String>,
    pub ttl_secs: u64,
    /// One per triggering rule; all must be met
    #[serde(default)]
    pub quorums: Vec<Quorum>,
    /// Risk floors the guardians were asked to accept
    #[serde(default)]
    pub risk_floors: Vec<String>,
}

/// Result of one policy evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub verdict: Verdict,
    pub approval: Option<ApprovalDraft>,
    pub profile: String,
    pub rule_set_version: String,
    /// Verdict once every approval requirement has been met
    pub approved_kind: VerdictKind,
    /// Reasons from risk floors at REQUIRE_APPROVAL or above
    pub risk_floors: Vec<String>,
    /// Nothing answered and the amount is at or above the safe floor
    pub blind: bool,
}

/// One contribution to the verdict
struct Contribution<'a> {
    kind: VerdictKind,
    reason: String,
    rule: Option<&'a GuardianRule>,
}

/// Verdict contributed by a single matched rule
pub fn rule_contribution(rule: &GuardianRule, amount: u64) -> (VerdictKind, String) {
    if rule.is_block_rule() {
        return (VerdictKind::Block, format!("block_rule:{}", rule.id));
    }
    match rule.threshold_value {
        None => (VerdictKind::RequireApproval, format!("approval_rule:{}", rule.id)),
        Some(threshold) if amount < threshold => {
            (VerdictKind::Allow, format!("below_threshold:{}", rule.id))
        }
        Some(_) if rule.severity == Severity::Critical => {
            (VerdictKind::Block, format!("critical_block:{}", rule.id))
        }
        Some(_) if rule.min_approvals == 0 => {
            (VerdictKind::Warn, format!("advisory_threshold:{}", rule.id))
        }
        Some(_) => (VerdictKind::RequireApproval, format!("threshold:{}", rule.id)),
    }
}

/// Evaluate the policy for one action
pub fn evaluate(risk: &RiskMap, ctx: &ActionContext, rules: &RuleSet) -> PolicyOutcome {
    let profile = rules.profile_for(&ctx.wallet_id);
    let mut contributions = Vec::new();

    // Rule contributions
    let matched: Vec<&GuardianRule> = profile.matching_rules(ctx).collect();
    if matched.is_empty() {
        contributions.push(Contribution {
            kind: VerdictKind::Allow,
            reason: "no_matching_rules".to_string(),
            rule: None,
        });
    }
    for rule in matched {
        let (kind, reason) = rule_contribution(rule, rule.exposure(ctx));
        contributions.push(Contribution {
            kind,
            reason,
            rule: (kind > VerdictKind::Allow).then_some(rule),
        });
    }

    // Risk floors
    let floor = rules.safe_default_floor;
    let blind = risk.level == RiskLevel::Unknown && ctx.amount >= floor;
    let mut floor_contribution = |kind, reason: String| {
        contributions.push(Contribution {
            kind,
            reason,
            rule: None,
        })
    };
    match risk.level {
        RiskLevel::High => floor_contribution(VerdictKind::Warn, "risk_level:high".to_string()),
        RiskLevel::Critical => {
            floor_contribution(VerdictKind::RequireApproval, "risk_level:critical".to_string())
        }
        RiskLevel::Unknown if blind => {
            floor_contribution(rules.blind_verdict, "blind:no_layer_answered".to_string())
        }
        RiskLevel::Unknown => {
            floor_contribution(VerdictKind::Warn, "blind:below_safe_floor".to_string())
        }
        RiskLevel::Low | RiskLevel::Medium => {}
    }
    if risk.has_override() {
        floor_contribution(
            VerdictKind::RequireApproval,
            format!("override:{}", risk.overrides.join(",")),
        );
    }
    if risk.is_degraded && risk.level != RiskLevel::Unknown && ctx.amount >= floor {
        floor_contribution(
            VerdictKind::Warn,
            format!("degraded:{}", risk.impaired_layers().join(",")),
        );
    }

    let kind = contributions
        .iter()
        .map(|c| c.kind)
        .max()
        .unwrap_or(VerdictKind::Allow);

    let mut verdict = Verdict {
        kind,
        reasons: Vec::new(),
        rule_ids: Vec::new(),
    };
    for c in &contributions {
        if !verdict.reasons.contains(&c.reason) {
            verdict.reasons.push(c.reason.clone());
        }
        if let Some(rule) = c.rule {
            if !verdict.rule_ids.contains(&rule.id) {
                verdict.rule_ids.push(rule.id.clone());
            }
        }
    }

    let risk_floors: Vec<String> = contributions
        .iter()
        .filter(|c| c.rule.is_none() && c.kind >= VerdictKind::RequireApproval)
        .map(|c| c.reason.clone())
        .collect();
    let approved_kind = contributions
        .iter()
        .map(|c| c.kind)
        .filter(|k| *k < VerdictKind::RequireApproval)
        .max()
        .unwrap_or(VerdictKind::Allow);

    let mut approval = None;
    if kind == VerdictKind::RequireApproval {
        let draft = approval_draft(profile, &contributions, &risk_floors, rules.approval_ttl_secs);
        if draft.quorums.iter().all(Quorum::is_reachable) {
            approval = Some(draft);
        } else {
            // Each rule must reach its own quorum from its own guardians
            for quorum in draft.quorums.iter().filter(|q| !q.is_reachable()) {
                let reason = match &quorum.rule_id {
                    Some(id) => format!(
                        "insufficient_guardians:{}:{}/{}",
                        id,
                        quorum.guardians.len(),
                        quorum.required
                    ),
                    None => format!(
                        "insufficient_guardians:{}/{}",
                        quorum.guardians.len(),
                        quorum.required
                    ),
                };
                verdict.escalate(VerdictKind::Block, reason);
            }
        }
    }

    PolicyOutcome {
        verdict,
        approval,
        profile: profile.name.clone(),
        rule_set_version: rules.version.clone(),
        approved_kind,
        risk_floors,
        blind,
    }
}

fn approval_draft(
    profile: &Profile,
    contributions: &[Contribution<'_>],
    risk_floors: &[String],
    ttl_secs: u64,
) -> ApprovalDraft {
    let approval_rules: Vec<&GuardianRule> = contributions
        .iter()
        .filter(|c| c.kind == VerdictKind::RequireApproval)
        .filter_map(|c| c.rule)
        .collect();

    // Largest requirement wins; ties go to the smallest id
    let trigger = approval_rules.iter().copied().min_by(|a, b| {
        b.min_approvals
            .cmp(&a.min_approvals)
            .then_with(|| a.id.cmp(&b.id))
    });

    let required = trigger.map(|r| r.min_approvals).unwrap_or(1).max(1);

    let mut quorums: Vec<Quorum> = approval_rules
        .iter()
        .map(|r| Quorum::new(Some(r.id.clone()), r.min_approvals, profile.eligible_guardians(Some(r))))
        .collect();
    if quorums.is_empty() {
        quorums.push(Quorum::new(None, 1, profile.eligible_guardians(None)));
    }
    quorums.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
    quorums.dedup();

    let mut guardians: Vec<String> = quorums
        .iter()
        .flat_map(|q| q.guardians.iter().cloned())
        .collect();
    guardians.sort();
    guardians.dedup();

    let mut rule_ids: Vec<String> = approval_rules.iter().map(|r| r.id.clone()).collect();
    rule_ids.sort();
    rule_ids.dedup();

    ApprovalDraft {
        rule_id: trigger.map(|r| r.id.clone()),
        rule_ids,
        required,
        guardians,
        ttl_secs,
        quorums,
        risk_floors: risk_floors.to_vec(),
    }
}
