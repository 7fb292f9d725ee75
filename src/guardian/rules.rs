//! Versioned rule sets and the policy store
//!
//! A rule file is parsed into a `RuleFile`, validated and compiled into an
//! immutable `RuleSet`. The `PolicyStore` hands out `Arc` snapshots and swaps
//! whole sets on reload, so an evaluation never sees a half-applied change.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::guardian::presets::Preset;
use crate::guardian::types::{ActionContext, Guardian, GuardianRule, Severity, VerdictKind};
use crate::shield::heuristics::DGB_ATOMS;
use crate::shield::types::ActionKind;

/// One tier of a per-action threshold table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTier {
    pub threshold_value: u64,
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default)]
    pub severity: Severity,
    /// Rolling window the threshold limits spending over
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_min_approvals() -> u32 {
    1
}

/// Profile as written in the rule file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub name: String,
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub guardian_ids: Vec<String>,
    /// Optional roster; suspended or revoked guardians lose their vote
    #[serde(default)]
    pub guardians: Vec<Guardian>,
    /// Action kind -> ascending threshold tiers
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdTier>>,
    #[serde(default)]
    pub rules: Vec<GuardianRule>,
}

/// Wallet -> profile binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBinding {
    pub wallet_id: String,
    pub profile: String,
}

/// Rule file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    pub version: String,
    #[serde(default = "default_profile_name")]
    pub default_profile: String,
    /// Blind evaluations at or above this amount get `blind_verdict`
    #[serde(default = "default_safe_floor")]
    pub safe_default_floor: u64,
    #[serde(default = "default_blind_verdict")]
    pub blind_verdict: VerdictKind,
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,
    #[serde(default)]
    pub wallet_profiles: Vec<WalletBinding>,
    pub profiles: Vec<ProfileEntry>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_safe_floor() -> u64 {
    10 * DGB_ATOMS
}

fn default_blind_verdict() -> VerdictKind {
    VerdictKind::RequireApproval
}

fn default_approval_ttl_secs() -> u64 {
    24 * 3600
}

impl RuleFile {
    /// Read a TOML or JSON rule file (format chosen by extension)
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigInvalid(format!(
                "rule file {} not found",
                path.display()
            )));
        }
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Validate and compile into an immutable rule set
    pub fn compile(&self, source: RuleSource) -> Result<RuleSet> {
        let invalid = |msg: String| Error::ConfigInvalid(msg);

        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty".into()));
        }
        if !matches!(self.blind_verdict, VerdictKind::RequireApproval | VerdictKind::Block) {
            return Err(invalid(format!(
                "blind_verdict must be REQUIRE_APPROVAL or BLOCK, got {}",
                self.blind_verdict
            )));
        }
        if self.approval_ttl_secs == 0 {
            return Err(invalid("approval_ttl_secs must be positive".into()));
        }
        if self.profiles.is_empty() {
            return Err(invalid("at least one profile is required".into()));
        }

        let mut profiles = BTreeMap::new();
        for entry in &self.profiles {
            let profile = compile_profile(entry)?;
            if profiles.insert(profile.name.clone(), profile).is_some() {
                return Err(invalid(format!("duplicate profile '{}'", entry.name)));
            }
        }

        if !profiles.contains_key(&self.default_profile) {
            return Err(invalid(format!(
                "default profile '{}' is not defined",
                self.default_profile
            )));
        }

        let mut bindings = BTreeMap::new();
        for binding in &self.wallet_profiles {
            if binding.wallet_id.trim().is_empty() {
                return Err(invalid("wallet binding with empty wallet_id".into()));
            }
            if !profiles.contains_key(&binding.profile) {
                return Err(invalid(format!(
                    "wallet {} is bound to unknown profile '{}'",
                    binding.wallet_id, binding.profile
                )));
            }
            if bindings
                .insert(binding.wallet_id.clone(), binding.profile.clone())
                .is_some()
            {
                return Err(invalid(format!("wallet {} is bound twice", binding.wallet_id)));
            }
        }

        Ok(RuleSet {
            version: self.version.clone(),
            default_profile: self.default_profile.clone(),
            safe_default_floor: self.safe_default_floor,
            blind_verdict: self.blind_verdict,
            approval_ttl_secs: self.approval_ttl_secs,
            profiles,
            bindings,
            source,
            loaded_at: Utc::now(),
        })
    }
}

fn compile_profile(entry: &ProfileEntry) -> Result<Profile> {
    let invalid = |msg: String| Error::ConfigInvalid(msg);
    let name = entry.name.trim();
    if name.is_empty() {
        return Err(invalid("profile name must not be empty".into()));
    }

    let mut rules = Vec::new();

    if let Some(preset) = entry.preset {
        rules.extend(preset.rules(&entry.guardian_ids)?);
    }

    for (action, tiers) in &entry.thresholds {
        let action: ActionKind = action
            .parse()
            .map_err(|e: String| invalid(format!("profile '{}': {}", name, e)))?;
        for (index, tier) in tiers.iter().enumerate() {
            let mut rule = GuardianRule::threshold(
                format!("{}.{}.t{}", name, action, index + 1),
                action,
                tier.threshold_value,
                tier.min_approvals,
                Vec::new(),
            )
            .with_severity(tier.severity);
            rule.window_secs = tier.window_secs;
            rule.description = tier.description.clone();
            rules.push(rule);
        }
    }

    rules.extend(entry.rules.iter().cloned());

    let mut seen = BTreeSet::new();
    for rule in &rules {
        rule.validate()
            .map_err(|e| invalid(format!("profile '{}': {}", name, e)))?;
        if !seen.insert(rule.id.as_str()) {
            return Err(invalid(format!(
                "profile '{}': duplicate rule id '{}'",
                name, rule.id
            )));
        }
        if rule.guardian_ids.is_empty()
            && !entry.guardian_ids.is_empty()
            && rule.min_approvals as usize > entry.guardian_ids.len()
        {
            return Err(invalid(format!(
                "profile '{}': rule '{}' needs {} approvals but the profile lists {} guardians",
                name,
                rule.id,
                rule.min_approvals,
                entry.guardian_ids.len()
            )));
        }
    }

    let mut roster = BTreeMap::new();
    for guardian in &entry.guardians {
        if guardian.id.trim().is_empty() {
            return Err(invalid(format!("profile '{}': guardian with empty id", name)));
        }
        roster.insert(guardian.id.clone(), guardian.clone());
    }

    Ok(Profile {
        name: name.to_string(),
        preset: entry.preset,
        guardian_ids: entry.guardian_ids.clone(),
        roster,
        rules,
    })
}

/// Compiled profile
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub name: String,
    pub preset: Option<Preset>,
    pub guardian_ids: Vec<String>,
    pub roster: BTreeMap<String, Guardian>,
    /// Preset, threshold-table and explicit rules, in that order
    pub rules: Vec<GuardianRule>,
}

impl Profile {
    /// Rules covering an action context
    pub fn matching_rules<'a>(&'a self, ctx: &'a ActionContext) -> impl Iterator<Item = &'a GuardianRule> + 'a {
        self.rules.iter().filter(move |r| r.matches(ctx))
    }

    /// Guardians allowed to vote for a rule: its own list, else the profile's,
    /// minus roster entries that are not active
    pub fn eligible_guardians(&self, rule: Option<&GuardianRule>) -> Vec<String> {
        let base = match rule {
            Some(r) if !r.guardian_ids.is_empty() => &r.guardian_ids,
            _ => &self.guardian_ids,
        };
        base.iter()
            .filter(|id| self.roster.get(*id).map(Guardian::is_active).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Where a rule set came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum RuleSource {
    BuiltIn,
    Inline,
    File(PathBuf),
}

impl std::fmt::Display for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSource::BuiltIn => write!(f, "built-in"),
            RuleSource::Inline => write!(f, "inline"),
            RuleSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Immutable, validated rule set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    pub version: String,
    pub default_profile: String,
    pub safe_default_floor: u64,
    pub blind_verdict: VerdictKind,
    pub approval_ttl_secs: u64,
    profiles: BTreeMap<String, Profile>,
    bindings: BTreeMap<String, String>,
    pub source: RuleSource,
    pub loaded_at: DateTime<Utc>,
}

impl RuleSet {
    /// Built-in conservative rules used when no valid rule file is available
    ///
    /// No guardians are configured, so anything needing approval ends up blocked.
    pub fn builtin() -> Self {
        let rules = vec![
            GuardianRule::threshold("builtin.send.large", ActionKind::Send, 1_000 * DGB_ATOMS, 1, vec![]),
            GuardianRule::threshold("builtin.dd_mint.large", ActionKind::DdMint, 500 * DGB_ATOMS, 1, vec![]),
            GuardianRule::threshold("builtin.dd_redeem.large", ActionKind::DdRedeem, 500 * DGB_ATOMS, 1, vec![]),
            GuardianRule::threshold("builtin.asset_transfer.large", ActionKind::AssetTransfer, 1_000 * DGB_ATOMS, 1, vec![]),
            GuardianRule {
                threshold_value: None,
                ..GuardianRule::threshold("builtin.asset_burn", ActionKind::AssetBurn, 0, 1, vec![])
            },
            GuardianRule {
                threshold_value: None,
                ..GuardianRule::threshold("builtin.device_bind", ActionKind::DeviceBind, 0, 1, vec![])
            },
            GuardianRule {
                threshold_value: None,
                ..GuardianRule::threshold("builtin.settings_change", ActionKind::SettingsChange, 0, 1, vec![])
            },
        ];

        let profile = Profile {
            name: default_profile_name(),
            preset: None,
            guardian_ids: Vec::new(),
            roster: BTreeMap::new(),
            rules,
        };

        Self {
            version: "builtin-1".to_string(),
            default_profile: profile.name.clone(),
            safe_default_floor: default_safe_floor(),
            blind_verdict: default_blind_verdict(),
            approval_ttl_secs: default_approval_ttl_secs(),
            profiles: BTreeMap::from([(profile.name.clone(), profile)]),
            bindings: BTreeMap::new(),
            source: RuleSource::BuiltIn,
            loaded_at: Utc::now(),
        }
    }

    /// Single default profile holding the given rules
    pub fn from_rules(version: &str, guardian_ids: Vec<String>, rules: Vec<GuardianRule>) -> Result<Self> {
        RuleFile {
            version: version.to_string(),
            default_profile: default_profile_name(),
            safe_default_floor: default_safe_floor(),
            blind_verdict: default_blind_verdict(),
            approval_ttl_secs: default_approval_ttl_secs(),
            wallet_profiles: Vec::new(),
            profiles: vec![ProfileEntry {
                name: default_profile_name(),
                preset: None,
                guardian_ids,
                guardians: Vec::new(),
                thresholds: BTreeMap::new(),
                rules,
            }],
        }
        .compile(RuleSource::Inline)
    }

    pub fn with_safe_default_floor(mut self, floor: u64) -> Self {
        self.safe_default_floor = floor;
        self
    }

    /// Blind verdict; never lower than REQUIRE_APPROVAL
    pub fn with_blind_verdict(mut self, verdict: VerdictKind) -> Self {
        self.blind_verdict = verdict.max(VerdictKind::RequireApproval);
        self
    }

    /// Load and compile a rule file
    pub fn from_path(path: &Path) -> Result<Self> {
        RuleFile::load(path)?.compile(RuleSource::File(path.to_path_buf()))
    }

    /// Profile bound to a wallet, or the default profile
    pub fn profile_for(&self, wallet_id: &str) -> &Profile {
        self.bindings
            .get(wallet_id)
            .and_then(|name| self.profiles.get(name))
            .or_else(|| self.profiles.get(&self.default_profile))
            .or_else(|| self.profiles.values().next())
            .expect("rule set always holds its default profile")
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn bindings(&self) -> &BTreeMap<String, String> {
        &self.bindings
    }

    /// Merged view of the rules applying to a wallet (and optionally an account)
    pub fn effective_policy(&self, wallet_id: &str, account_id: Option<&str>) -> EffectivePolicy {
        let profile = self.profile_for(wallet_id);

        let mut actions: BTreeMap<ActionKind, Vec<RuleView>> = BTreeMap::new();
        for rule in &profile.rules {
            // Asset filters are reported, not applied
            let mut ctx = ActionContext::new(wallet_id, rule.action, 0);
            ctx.account_id = account_id.map(String::from);
            ctx.asset_id = rule.asset_id.clone();
            if !rule.matches(&ctx) {
                continue;
            }
            actions.entry(rule.action).or_default().push(RuleView {
                id: rule.id.clone(),
                scope: rule.scope.to_string(),
                asset_id: rule.asset_id.clone(),
                threshold_value: rule.threshold_value,
                window_secs: rule.window_secs,
                min_approvals: rule.min_approvals,
                severity: rule.severity,
                effect: rule_effect(rule).to_string(),
                guardian_ids: profile.eligible_guardians(Some(rule)),
                description: rule.description.clone(),
            });
        }
        for views in actions.values_mut() {
            views.sort_by(|a, b| {
                a.threshold_value
                    .cmp(&b.threshold_value)
                    .then(a.id.cmp(&b.id))
            });
        }

        EffectivePolicy {
            version: self.version.clone(),
            source: self.source.to_string(),
            profile: profile.name.clone(),
            wallet_id: wallet_id.to_string(),
            account_id: account_id.map(String::from),
            safe_default_floor: self.safe_default_floor,
            blind_verdict: self.blind_verdict,
            approval_ttl_secs: self.approval_ttl_secs,
            guardian_ids: profile.eligible_guardians(None),
            actions: actions
                .into_iter()
                .map(|(action, views)| (action.to_string(), views))
                .collect(),
        }
    }
}

/// Effect a rule has once it triggers
fn rule_effect(rule: &GuardianRule) -> VerdictKind {
    if rule.is_block_rule() {
        VerdictKind::Block
    } else if rule.threshold_value.is_some() && rule.severity == Severity::Critical {
        VerdictKind::Block
    } else if rule.min_approvals == 0 {
        VerdictKind::Warn
    } else {
        VerdictKind::RequireApproval
    }
}

/// One rule in the effective policy view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleView {
    pub id: String,
    pub scope: String,
    pub asset_id: Option<String>,
    pub threshold_value: Option<u64>,
    pub window_secs: Option<u64>,
    pub min_approvals: u32,
    pub severity: Severity,
    pub effect: String,
    pub guardian_ids: Vec<String>,
    pub description: Option<String>,
}

/// Merged policy for one wallet / account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub version: String,
    pub source: String,
    pub profile: String,
    pub wallet_id: String,
    pub account_id: Option<String>,
    pub safe_default_floor: u64,
    pub blind_verdict: VerdictKind,
    pub approval_ttl_secs: u64,
    pub guardian_ids: Vec<String>,
    pub actions: BTreeMap<String, Vec<RuleView>>,
}

/// Holder of the current rule set
pub struct PolicyStore {
    current: ArcSwap<RuleSet>,
    path: Option<PathBuf>,
    diagnostics: ArcSwap<Vec<String>>,
}

impl PolicyStore {
    pub fn new(rule_set: RuleSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(rule_set),
            path: None,
            diagnostics: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Load from a rule file, falling back to the built-in rules on any problem
    pub fn open(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("No rule file configured, using built-in conservative rules");
            return Self::new(RuleSet::builtin());
        };

        let store = Self {
            current: ArcSwap::from_pointee(RuleSet::builtin()),
            path: Some(path.to_path_buf()),
            diagnostics: ArcSwap::from_pointee(Vec::new()),
        };

        match RuleSet::from_path(path) {
            Ok(rule_set) => {
                info!(
                    path = %path.display(),
                    version = %rule_set.version,
                    "Rule set loaded"
                );
                store.current.store(Arc::new(rule_set));
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Invalid rule file, falling back to built-in conservative rules"
                );
                store.diagnostics.store(Arc::new(vec![e.to_string()]));
            }
        }

        store
    }

    /// Current rule set; one consistent snapshot for a whole evaluation
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Re-read the rule file and swap it in
    ///
    /// On failure the current set stays active and the error is kept in the
    /// diagnostics.
    pub fn reload(&self) -> Result<Arc<RuleSet>> {
        let Some(path) = &self.path else {
            return Err(Error::Config("no rule file configured".to_string()));
        };

        match RuleSet::from_path(path) {
            Ok(rule_set) => {
                let rule_set = Arc::new(rule_set);
                self.current.store(rule_set.clone());
                self.diagnostics.store(Arc::new(Vec::new()));
                info!(version = %rule_set.version, "Rule set reloaded");
                Ok(rule_set)
            }
            Err(e) => {
                warn!(error = %e, "Rule reload failed, keeping current rule set");
                self.diagnostics.store(Arc::new(vec![e.to_string()]));
                Err(e)
            }
        }
    }

    /// Swap in a rule set built elsewhere
    pub fn replace(&self, rule_set: RuleSet) {
        self.current.store(Arc::new(rule_set));
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Problems found during the last load or reload
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.load().as_ref().clone()
    }
}
