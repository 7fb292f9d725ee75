//! Local heuristics added on top of the weighted layer score
//!
//! Three independent families contribute additively: amount bucket,
//! counterparty trust and device posture. Each family is capped on its own
//! before the contributions are summed by the aggregator.

use serde::{Deserialize, Serialize};

/// How much the wallet knows about the counterparty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterpartyTrust {
    /// Explicitly trusted contact
    Trusted,
    /// Seen before, no explicit trust
    Known,
    /// Never seen
    Unknown,
    /// Flagged by the user or a shared list
    Flagged,
}

/// Runtime the request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Mobile,
    Desktop,
    Browser,
    Extension,
    Hardware,
    Service,
}

/// Device facts supplied by the wallet client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePosture {
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub new_device: bool,
    #[serde(default)]
    pub kind: DeviceKind,
}

/// Local facts the aggregator combines with the layer results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalContext {
    /// Amount in atomic units
    pub amount: u64,
    pub counterparty: Option<CounterpartyTrust>,
    pub device: Option<DevicePosture>,
}

/// One bucket of the amount table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountBucket {
    pub label: String,
    /// Lower bound (inclusive) in atomic units
    pub min_amount: u64,
    pub contribution: f64,
}

/// Tunables for local heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalHeuristicsConfig {
    #[serde(default = "default_amount_buckets")]
    pub amount_buckets: Vec<AmountBucket>,
    #[serde(default = "default_amount_cap")]
    pub amount_cap: f64,

    #[serde(default = "default_counterparty_known")]
    pub counterparty_known: f64,
    #[serde(default = "default_counterparty_unknown")]
    pub counterparty_unknown: f64,
    #[serde(default = "default_counterparty_flagged")]
    pub counterparty_flagged: f64,
    #[serde(default = "default_counterparty_cap")]
    pub counterparty_cap: f64,

    #[serde(default = "default_device_step")]
    pub device_untrusted: f64,
    #[serde(default = "default_device_step")]
    pub device_new: f64,
    #[serde(default = "default_device_step")]
    pub device_browser: f64,
    #[serde(default = "default_device_cap")]
    pub device_cap: f64,
}

/// 1 DGB in atomic units
pub const DGB_ATOMS: u64 = 100_000_000;

fn default_amount_buckets() -> Vec<AmountBucket> {
    vec![
        AmountBucket { label: "small".into(), min_amount: 0, contribution: 0.0 },
        AmountBucket { label: "medium".into(), min_amount: 100 * DGB_ATOMS, contribution: 0.03 },
        AmountBucket { label: "large".into(), min_amount: 1_000 * DGB_ATOMS, contribution: 0.08 },
        AmountBucket { label: "very_large".into(), min_amount: 10_000 * DGB_ATOMS, contribution: 0.15 },
    ]
}
fn default_amount_cap() -> f64 { 0.15 }
fn default_counterparty_known() -> f64 { 0.02 }
fn default_counterparty_unknown() -> f64 { 0.05 }
fn default_counterparty_flagged() -> f64 { 0.25 }
fn default_counterparty_cap() -> f64 { 0.25 }
fn default_device_step() -> f64 { 0.04 }
fn default_device_cap() -> f64 { 0.10 }

impl Default for LocalHeuristicsConfig {
    fn default() -> Self {
        Self {
            amount_buckets: default_amount_buckets(),
            amount_cap: default_amount_cap(),
            counterparty_known: default_counterparty_known(),
            counterparty_unknown: default_counterparty_unknown(),
            counterparty_flagged: default_counterparty_flagged(),
            counterparty_cap: default_counterparty_cap(),
            device_untrusted: default_device_step(),
            device_new: default_device_step(),
            device_browser: default_device_step(),
            device_cap: default_device_cap(),
        }
    }
}

impl LocalHeuristicsConfig {
    /// Reject negative or non-finite tunables
    pub fn validate(&self) -> Result<(), String> {
        let scalars = [
            ("amount_cap", self.amount_cap),
            ("counterparty_known", self.counterparty_known),
            ("counterparty_unknown", self.counterparty_unknown),
            ("counterparty_flagged", self.counterparty_flagged),
            ("counterparty_cap", self.counterparty_cap),
            ("device_untrusted", self.device_untrusted),
            ("device_new", self.device_new),
            ("device_browser", self.device_browser),
            ("device_cap", self.device_cap),
        ];
        for (name, value) in scalars {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        for bucket in &self.amount_buckets {
            if !bucket.contribution.is_finite() || !(0.0..=1.0).contains(&bucket.contribution) {
                return Err(format!(
                    "amount bucket '{}' contribution must be within [0, 1]",
                    bucket.label
                ));
            }
        }
        Ok(())
    }
}

/// A single capped contribution with its factor tag
#[derive(Debug, Clone, PartialEq)]
pub struct LocalContribution {
    pub tag: String,
    pub value: f64,
}

/// Evaluates local heuristics against a fixed configuration
#[derive(Debug, Clone, Default)]
pub struct LocalHeuristics {
    config: LocalHeuristicsConfig,
}

impl LocalHeuristics {
    pub fn new(config: LocalHeuristicsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalHeuristicsConfig {
        &self.config
    }

    /// All non-zero contributions for a context, each already capped
    pub fn contributions(&self, local: &LocalContext) -> Vec<LocalContribution> {
        let mut out = Vec::new();

        if let Some(c) = self.amount_contribution(local.amount) {
            out.push(c);
        }
        if let Some(c) = local.counterparty.and_then(|t| self.counterparty_contribution(t)) {
            out.push(c);
        }
        if let Some(c) = local.device.as_ref().and_then(|d| self.device_contribution(d)) {
            out.push(c);
        }

        out
    }

    /// Highest bucket at or below the amount; larger amounts never score lower
    fn amount_contribution(&self, amount: u64) -> Option<LocalContribution> {
        let best = self
            .config
            .amount_buckets
            .iter()
            .filter(|b| b.min_amount <= amount)
            .max_by(|a, b| {
                a.contribution
                    .total_cmp(&b.contribution)
                    .then(a.min_amount.cmp(&b.min_amount))
            })?;

        let value = capped(best.contribution, self.config.amount_cap);
        (value > 0.0).then(|| LocalContribution {
            tag: format!("amount_bucket:{}", best.label),
            value,
        })
    }

    fn counterparty_contribution(&self, trust: CounterpartyTrust) -> Option<LocalContribution> {
        let (label, raw) = match trust {
            CounterpartyTrust::Trusted => return None,
            CounterpartyTrust::Known => ("known", self.config.counterparty_known),
            CounterpartyTrust::Unknown => ("unknown", self.config.counterparty_unknown),
            CounterpartyTrust::Flagged => ("flagged", self.config.counterparty_flagged),
        };
        let value = capped(raw, self.config.counterparty_cap);
        (value > 0.0).then(|| LocalContribution {
            tag: format!("counterparty:{}", label),
            value,
        })
    }

    fn device_contribution(&self, device: &DevicePosture) -> Option<LocalContribution> {
        let mut raw = 0.0;
        let mut labels = Vec::new();

        if !device.trusted {
            raw += self.config.device_untrusted;
            labels.push("untrusted");
        }
        if device.new_device {
            raw += self.config.device_new;
            labels.push("new");
        }
        if matches!(device.kind, DeviceKind::Browser | DeviceKind::Extension) {
            raw += self.config.device_browser;
            labels.push("browser_runtime");
        }

        let value = capped(raw, self.config.device_cap);
        (value > 0.0).then(|| LocalContribution {
            tag: format!("device:{}", labels.join("+")),
            value,
        })
    }
}

fn capped(value: f64, cap: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, cap.max(0.0))
    } else {
        0.0
    }
}
