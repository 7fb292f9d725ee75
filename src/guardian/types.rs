//! Core types for guardian policy
//!
//! Defines rules, verdicts, guardians and the action context the policy
//! engine evaluates.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shield::types::{ActionKind, RiskPacket};

/// What a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Every wallet bound to the profile
    Global,
    /// One wallet, or every wallet when the rule names none
    #[default]
    #[serde(alias = "WALLET")]
    Wallet,
    /// One account of a wallet
    #[serde(alias = "ACCOUNT")]
    Account,
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Global => write!(f, "global"),
            RuleScope::Wallet => write!(f, "wallet"),
            RuleScope::Account => write!(f, "account"),
        }
    }
}

/// Rule severity; a crossed critical threshold blocks outright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Normal,
    Critical,
}

/// A single guardian rule
///
/// `threshold_value = None` with `min_approvals = 0` is a hard block rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianRule {
    pub id: String,
    #[serde(default)]
    pub scope: RuleScope,
    pub action: ActionKind,

    // Optional scoping fields
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,

    /// Threshold in atomic units; at or above it the rule triggers
    #[serde(default)]
    pub threshold_value: Option<u64>,
    /// Rolling spending window; when set the threshold applies to the amount
    /// plus what was already spent in the window
    #[serde(default)]
    pub window_secs: Option<u64>,

    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default)]
    pub guardian_ids: Vec<String>,

    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_min_approvals() -> u32 {
    1
}

impl GuardianRule {
    /// Threshold rule: below the threshold allows, at or above requires approvals
    pub fn threshold(
        id: impl Into<String>,
        action: ActionKind,
        threshold_value: u64,
        min_approvals: u32,
        guardian_ids: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            scope: RuleScope::Wallet,
            action,
            wallet_id: None,
            account_id: None,
            asset_id: None,
            threshold_value: Some(threshold_value),
            window_secs: None,
            min_approvals,
            guardian_ids,
            severity: Severity::Normal,
            description: None,
        }
    }

    /// Hard block rule for an action
    pub fn block(id: impl Into<String>, action: ActionKind) -> Self {
        Self {
            threshold_value: None,
            min_approvals: 0,
            ..Self::threshold(id, action, 0, 0, Vec::new())
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn for_wallet(mut self, wallet_id: impl Into<String>) -> Self {
        self.wallet_id = Some(wallet_id.into());
        self
    }

    pub fn for_account(mut self, account_id: impl Into<String>) -> Self {
        self.scope = RuleScope::Account;
        self.account_id = Some(account_id.into());
        self
    }

    pub fn for_asset(mut self, asset_id: impl Into<String>) -> Self {
        self.asset_id = Some(asset_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Turn the threshold into a rolling spending limit
    pub fn with_window(mut self, window_secs: u64) -> Self {
        self.window_secs = Some(window_secs);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_block_rule(&self) -> bool {
        self.threshold_value.is_none() && self.min_approvals == 0
    }

    /// Amount the threshold is compared against
    pub fn exposure(&self, ctx: &ActionContext) -> u64 {
        match self.window_secs {
            Some(_) => ctx.amount.saturating_add(ctx.recent_window_spent),
            None => ctx.amount,
        }
    }

    /// Whether the rule's action and scope cover the context
    pub fn matches(&self, ctx: &ActionContext) -> bool {
        if self.action != ctx.action {
            return false;
        }

        if let Some(asset) = &self.asset_id {
            if ctx.asset_id.as_deref() != Some(asset.as_str()) {
                return false;
            }
        }

        let wallet_matches = self
            .wallet_id
            .as_deref()
            .map(|w| w == ctx.wallet_id)
            .unwrap_or(true);

        match self.scope {
            RuleScope::Global => true,
            RuleScope::Wallet => wallet_matches,
            RuleScope::Account => {
                wallet_matches
                    && self.account_id.is_some()
                    && self.account_id.as_deref() == ctx.account_id.as_deref()
            }
        }
    }

    /// Structural checks; rule ids are validated again at rule-set level
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_rule_id(&self.id) {
            return Err(format!(
                "rule id '{}' must be non-empty and use only [A-Za-z0-9_.:-]",
                self.id
            ));
        }
        if self.scope == RuleScope::Account
            && self.account_id.as_deref().map(str::is_empty).unwrap_or(true)
        {
            return Err(format!("account-scoped rule '{}' has no account_id", self.id));
        }
        match (self.window_secs, self.threshold_value) {
            (Some(0), _) => {
                return Err(format!("rule '{}' has a zero-length spending window", self.id));
            }
            (Some(_), None) => {
                return Err(format!("rule '{}' has a spending window but no threshold", self.id));
            }
            _ => {}
        }
        if !self.guardian_ids.is_empty() && self.min_approvals as usize > self.guardian_ids.len() {
            return Err(format!(
                "rule '{}' needs {} approvals but lists only {} guardians",
                self.id,
                self.min_approvals,
                self.guardian_ids.len()
            ));
        }
        Ok(())
    }
}

/// Rule ids: non-empty, printable, no whitespace
pub fn is_valid_rule_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Policy outcome kind, totally ordered by restrictiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Allow,
    Warn,
    RequireApproval,
    Block,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictKind::Allow => "ALLOW",
            VerdictKind::Warn => "WARN",
            VerdictKind::RequireApproval => "REQUIRE_APPROVAL",
            VerdictKind::Block => "BLOCK",
        }
    }

    /// Whether the action may proceed without further sign-off
    pub fn proceeds(&self) -> bool {
        matches!(self, VerdictKind::Allow | VerdictKind::Warn)
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final policy verdict with its explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    /// Never empty
    pub reasons: Vec<String>,
    pub rule_ids: Vec<String>,
}

impl Verdict {
    pub fn new(kind: VerdictKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reasons: vec![reason.into()],
            rule_ids: Vec::new(),
        }
    }

    /// Fail-closed verdict used when evaluation cannot complete
    pub fn block(reason: impl Into<String>) -> Self {
        Self::new(VerdictKind::Block, reason)
    }

    /// Raise the verdict to at least `kind`, recording why
    pub fn escalate(&mut self, kind: VerdictKind, reason: impl Into<String>) {
        if kind > self.kind {
            self.kind = kind;
        }
        let reason = reason.into();
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }

    /// First reason, used as the short explanation
    pub fn primary_reason(&self) -> &str {
        self.reasons.first().map(String::as_str).unwrap_or("")
    }
}

/// The facts about one action the policy engine needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    pub wallet_id: String,
    pub account_id: Option<String>,
    pub action: ActionKind,
    pub amount: u64,
    pub asset_id: Option<String>,
    /// Already spent in the caller's rolling window, atomic units
    #[serde(default)]
    pub recent_window_spent: u64,
}

impl ActionContext {
    pub fn new(wallet_id: impl Into<String>, action: ActionKind, amount: u64) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            account_id: None,
            action,
            amount,
            asset_id: None,
            recent_window_spent: 0,
        }
    }

    pub fn from_packet(packet: &RiskPacket) -> Self {
        Self {
            wallet_id: packet.wallet_id.clone(),
            account_id: packet.account_id.clone(),
            action: packet.action,
            amount: packet.amount,
            asset_id: packet.asset_id.clone(),
            recent_window_spent: packet.recent_window_spent,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_asset(mut self, asset_id: impl Into<String>) -> Self {
        self.asset_id = Some(asset_id.into());
        self
    }

    pub fn with_window_spent(mut self, spent: u64) -> Self {
        self.recent_window_spent = spent;
        self
    }
}

/// Role of a guardian relative to the protected wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianRole {
    /// Trusted friend or family member
    #[default]
    Person,
    /// Second device the owner controls
    Device,
    /// Custody or institutional service
    Service,
}

/// Lifecycle status of a guardian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianStatus {
    #[default]
    Active,
    Suspended,
    Revoked,
}

/// A guardian entry from a profile roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub role: GuardianRole,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub status: GuardianStatus,
}

impl Guardian {
    pub fn is_active(&self) -> bool {
        self.status == GuardianStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ActionContext {
        ActionContext::new("w1", ActionKind::Send, 100).with_account("acc-1")
    }

    #[test]
    fn test_verdict_order() {
        assert!(VerdictKind::Allow < VerdictKind::Warn);
        assert!(VerdictKind::Warn < VerdictKind::RequireApproval);
        assert!(VerdictKind::RequireApproval < VerdictKind::Block);
        assert_eq!(
            serde_json::to_string(&VerdictKind::RequireApproval).unwrap(),
            "\"REQUIRE_APPROVAL\""
        );
    }

    #[test]
    fn test_escalate_never_lowers() {
        let mut verdict = Verdict::new(VerdictKind::Block, "rule:b");
        verdict.escalate(VerdictKind::Warn, "risk:high");
        assert_eq!(verdict.kind, VerdictKind::Block);
        assert_eq!(verdict.reasons.len(), 2);
    }

    #[test]
    fn test_wallet_scope_matching() {
        let rule = GuardianRule::threshold("r1", ActionKind::Send, 10, 1, vec![]);
        assert!(rule.matches(&ctx()));
        assert!(rule.clone().for_wallet("w1").matches(&ctx()));
        assert!(!rule.clone().for_wallet("w2").matches(&ctx()));
        let other_action = ActionContext::new("w1", ActionKind::DdMint, 100);
        assert!(!rule.matches(&other_action));
    }

    #[test]
    fn test_account_scope_matching() {
        let rule = GuardianRule::threshold("r1", ActionKind::Send, 10, 1, vec![]).for_account("acc-1");
        assert!(rule.matches(&ctx()));
        assert!(!rule.matches(&ActionContext::new("w1", ActionKind::Send, 100)));
        assert!(!rule.clone().for_wallet("w9").matches(&ctx()));
    }

    #[test]
    fn test_asset_filter() {
        let rule = GuardianRule::threshold("r1", ActionKind::Send, 10, 1, vec![]).for_asset("A1");
        assert!(!rule.matches(&ctx()));
        assert!(rule.matches(&ctx().with_asset("A1")));
    }

    #[test]
    fn test_block_rule() {
        let rule = GuardianRule::block("no-burn", ActionKind::AssetBurn);
        assert!(rule.is_block_rule());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rule_validation() {
        let rule = GuardianRule::threshold("bad id", ActionKind::Send, 1, 1, vec![]);
        assert!(rule.validate().is_err());
        let rule = GuardianRule::threshold("r", ActionKind::Send, 1, 3, vec!["g1".into()]);
        assert!(rule.validate().is_err());
        let rule = GuardianRule::threshold("r", ActionKind::Send, 1, 1, vec![]).with_scope(RuleScope::Account);
        assert!(rule.validate().is_err());
        let rule = GuardianRule::threshold("r", ActionKind::Send, 1, 1, vec![]).with_window(0);
        assert!(rule.validate().is_err());
        let mut rule = GuardianRule::threshold("r", ActionKind::Send, 1, 1, vec![]).with_window(3600);
        assert!(rule.validate().is_ok());
        rule.threshold_value = None;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_window_exposure() {
        let ctx = ActionContext::new("w1", ActionKind::Send, 300).with_window_spent(900);
        let plain = GuardianRule::threshold("r", ActionKind::Send, 1_000, 1, vec![]);
        assert_eq!(plain.exposure(&ctx), 300);
        assert_eq!(plain.with_window(86_400).exposure(&ctx), 1_200);

        let ctx = ActionContext::new("w1", ActionKind::Send, u64::MAX).with_window_spent(5);
        let windowed = GuardianRule::threshold("r", ActionKind::Send, 1_000, 1, vec![]).with_window(60);
        assert_eq!(windowed.exposure(&ctx), u64::MAX);
    }

    #[test]
    fn test_rule_deserialize_defaults() {
        let rule: GuardianRule =
            serde_json::from_str(r#"{"id":"r1","action":"send","threshold_value":500}"#).unwrap();
        assert_eq!(rule.min_approvals, 1);
        assert_eq!(rule.scope, RuleScope::Wallet);
        assert_eq!(rule.severity, Severity::Normal);
    }
}
