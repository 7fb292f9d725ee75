//! Shared data structures for the shield bridge
//!
//! These types travel between the packet builder, the signal clients and the
//! aggregator. `RiskPacket` is immutable once built and is shared as an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Weight table keyed by layer name
pub type WeightTable = BTreeMap<String, f64>;

/// Wallet operation being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Plain DGB send
    Send,
    /// DigiDollar mint (DGB -> DD)
    DdMint,
    /// DigiDollar redeem (DD -> DGB)
    DdRedeem,
    /// DigiAsset issuance (new asset or extra units)
    AssetIssue,
    /// DigiAsset transfer
    AssetTransfer,
    /// DigiAsset burn
    AssetBurn,
    /// Enigmatic message carrying value
    Message,
    /// Binding a new device to the wallet
    DeviceBind,
    /// Changing wallet security settings
    SettingsChange,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::Send,
        ActionKind::DdMint,
        ActionKind::DdRedeem,
        ActionKind::AssetIssue,
        ActionKind::AssetTransfer,
        ActionKind::AssetBurn,
        ActionKind::Message,
        ActionKind::DeviceBind,
        ActionKind::SettingsChange,
    ];

    /// Flow type reported to the shield layers
    pub fn flow_type(&self) -> FlowType {
        match self {
            ActionKind::Send | ActionKind::AssetTransfer => FlowType::Transfer,
            ActionKind::DdMint | ActionKind::AssetIssue => FlowType::Mint,
            ActionKind::DdRedeem => FlowType::Redeem,
            ActionKind::AssetBurn => FlowType::Burn,
            ActionKind::Message => FlowType::Message,
            ActionKind::DeviceBind | ActionKind::SettingsChange => FlowType::NodeOp,
        }
    }

    /// Whether the action moves value (and therefore must carry an amount)
    pub fn moves_value(&self) -> bool {
        !matches!(self, ActionKind::DeviceBind | ActionKind::SettingsChange)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Send => "send",
            ActionKind::DdMint => "dd_mint",
            ActionKind::DdRedeem => "dd_redeem",
            ActionKind::AssetIssue => "asset_issue",
            ActionKind::AssetTransfer => "asset_transfer",
            ActionKind::AssetBurn => "asset_burn",
            ActionKind::Message => "message",
            ActionKind::DeviceBind => "device_bind",
            ActionKind::SettingsChange => "settings_change",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "send" => Ok(ActionKind::Send),
            "dd_mint" | "mint_dd" => Ok(ActionKind::DdMint),
            "dd_redeem" | "redeem_dd" => Ok(ActionKind::DdRedeem),
            "asset_issue" | "mint_asset" => Ok(ActionKind::AssetIssue),
            "asset_transfer" | "transfer_asset" => Ok(ActionKind::AssetTransfer),
            "asset_burn" | "burn_asset" => Ok(ActionKind::AssetBurn),
            "message" | "enigmatic" => Ok(ActionKind::Message),
            "device_bind" => Ok(ActionKind::DeviceBind),
            "settings_change" => Ok(ActionKind::SettingsChange),
            other => Err(format!("unknown action kind '{}'", other)),
        }
    }
}

/// Coarse flow category sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    Transfer,
    Mint,
    Redeem,
    Burn,
    Message,
    NodeOp,
}

/// Client surface that originated the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Web,
    Ios,
    Android,
    #[default]
    Service,
}

/// One evaluable action, normalized for the shield layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPacket {
    pub packet_id: String,
    pub wallet_id: String,
    pub account_id: Option<String>,
    pub action: ActionKind,
    pub flow_type: FlowType,
    /// Amount in atomic units of the asset
    pub amount: u64,
    pub asset_id: Option<String>,
    pub client: ClientKind,
    pub metadata_size: u64,
    #[serde(default)]
    pub recent_window_spent: u64,
    pub created_at: DateTime<Utc>,
    /// Caller-supplied context, already redacted of secrets
    pub context: BTreeMap<String, serde_json::Value>,
    /// Optional layer-specific payloads, keyed by layer name
    pub layer_payloads: BTreeMap<String, serde_json::Value>,
}

impl RiskPacket {
    /// Payload destined for one layer (empty object when none was supplied)
    pub fn payload_for(&self, layer: &str) -> serde_json::Value {
        self.layer_payloads
            .get(layer)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// Status of one layer's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    #[default]
    Ok,
    Degraded,
    #[serde(alias = "error")]
    Unreachable,
}

impl fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerStatus::Ok => write!(f, "ok"),
            LayerStatus::Degraded => write!(f, "degraded"),
            LayerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Signals block of the provider envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerSignals {
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// Uniform response envelope returned by every signal provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEnvelope {
    pub layer: String,
    pub risk_score: f64,
    #[serde(default)]
    pub signals: LayerSignals,
    #[serde(default)]
    pub status: LayerStatus,
}

/// One provider's opinion about a packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerResult {
    pub layer: String,
    /// Risk in [0, 1]; only meaningful when `status` is ok
    pub score: f64,
    pub flags: Vec<String>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub status: LayerStatus,
    pub observed_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Why the layer is not ok, when it isn't
    pub detail: Option<String>,
}

impl LayerResult {
    /// Healthy answer with the given score
    pub fn ok(layer: impl Into<String>, score: f64) -> Self {
        Self {
            layer: layer.into(),
            score: sanitize_score(score),
            flags: Vec::new(),
            metrics: BTreeMap::new(),
            status: LayerStatus::Ok,
            observed_at: Utc::now(),
            latency_ms: 0,
            detail: None,
        }
    }

    /// Layer answered but flagged its own answer as partial
    pub fn degraded(layer: impl Into<String>, score: f64, reason: impl Into<String>) -> Self {
        Self {
            status: LayerStatus::Degraded,
            detail: Some(reason.into()),
            ..Self::ok(layer, score)
        }
    }

    /// Layer could not be consulted; score is forced to zero
    pub fn unreachable(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            score: 0.0,
            flags: Vec::new(),
            metrics: BTreeMap::new(),
            status: LayerStatus::Unreachable,
            observed_at: Utc::now(),
            latency_ms: 0,
            detail: Some(reason.into()),
        }
    }

    /// Convert a provider envelope, clamping the score
    pub fn from_envelope(envelope: LayerEnvelope) -> Self {
        let status = envelope.status;
        let score = match status {
            LayerStatus::Unreachable => 0.0,
            _ => sanitize_score(envelope.risk_score),
        };
        Self {
            layer: envelope.layer,
            score,
            flags: envelope.signals.flags,
            metrics: envelope.signals.metrics,
            status,
            observed_at: Utc::now(),
            latency_ms: 0,
            detail: None,
        }
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == LayerStatus::Ok
    }

    /// Whether the layer raised the given flag (case-insensitive)
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// Clamp into [0, 1]; non-finite values collapse to 0
fn sanitize_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Discrete risk band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    /// No signal layer could be consulted
    Unknown,
}

impl RiskLevel {
    /// Ordering rank among the scored bands; `Unknown` has none
    pub fn rank(&self) -> Option<u8> {
        match self {
            RiskLevel::Low => Some(0),
            RiskLevel::Medium => Some(1),
            RiskLevel::High => Some(2),
            RiskLevel::Critical => Some(3),
            RiskLevel::Unknown => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
            RiskLevel::Unknown => write!(f, "unknown"),
        }
    }
}

/// Aggregated, deterministic view of all layer results plus local heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMap {
    /// Per-layer results, sorted by layer name
    pub results: Vec<LayerResult>,
    /// Normalized weights actually applied (ok layers only)
    pub weights_used: BTreeMap<String, f64>,
    /// Weighted layer score before local heuristics
    pub base_score: f64,
    /// Sum of capped local-heuristic contributions
    pub local_score: f64,
    pub final_score: f64,
    pub level: RiskLevel,
    pub is_degraded: bool,
    /// Hard-override flags that raised the score floor
    pub overrides: Vec<String>,
    /// Contributing-factor tags, sorted
    pub factors: Vec<String>,
}

impl RiskMap {
    /// Score reported by a layer, if present
    pub fn score_by_layer(&self, layer: &str) -> Option<f64> {
        self.results
            .iter()
            .find(|r| r.layer == layer)
            .map(|r| r.score)
    }

    /// Layers whose status is not ok
    pub fn impaired_layers(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.layer.as_str())
            .collect()
    }

    pub fn has_override(&self) -> bool {
        !self.overrides.is_empty()
    }

    /// True when no layer answered and the level is unknown
    pub fn is_blind(&self) -> bool {
        self.level == RiskLevel::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_parse() {
        assert_eq!("send".parse::<ActionKind>().unwrap(), ActionKind::Send);
        assert_eq!("MINT_DD".parse::<ActionKind>().unwrap(), ActionKind::DdMint);
        assert_eq!(
            "asset-transfer".parse::<ActionKind>().unwrap(),
            ActionKind::AssetTransfer
        );
        assert!("teleport".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_flow_type_mapping() {
        assert_eq!(ActionKind::Send.flow_type(), FlowType::Transfer);
        assert_eq!(ActionKind::AssetBurn.flow_type(), FlowType::Burn);
        assert!(!ActionKind::SettingsChange.moves_value());
    }

    #[test]
    fn test_envelope_error_status_is_unreachable() {
        let json = r#"{"layer":"dqsn","risk_score":0.9,"status":"error"}"#;
        let envelope: LayerEnvelope = serde_json::from_str(json).unwrap();
        let result = LayerResult::from_envelope(envelope);
        assert_eq!(result.status, LayerStatus::Unreachable);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_envelope_score_clamped() {
        let json = r#"{"layer":"adn","risk_score":1.7,"signals":{"flags":["Lockdown"]}}"#;
        let envelope: LayerEnvelope = serde_json::from_str(json).unwrap();
        let result = LayerResult::from_envelope(envelope);
        assert_eq!(result.status, LayerStatus::Ok);
        assert_eq!(result.score, 1.0);
        assert!(result.has_flag("lockdown"));
    }

    #[test]
    fn test_non_finite_score_sanitized() {
        assert_eq!(LayerResult::ok("x", f64::NAN).score, 0.0);
        assert_eq!(LayerResult::ok("x", -3.0).score, 0.0);
    }

    #[test]
    fn test_level_rank() {
        assert!(RiskLevel::Low.rank() < RiskLevel::Critical.rank());
        assert_eq!(RiskLevel::Unknown.rank(), None);
    }
}
