//! Action requests and risk packet construction
//!
//! An `ActionRequest` is what a wallet client submits. It is validated and
//! normalized into an immutable `RiskPacket` before any layer sees it.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::shield::heuristics::{CounterpartyTrust, DevicePosture, LocalContext};
use crate::shield::types::{ActionKind, ClientKind, RiskPacket};

static SECRET_KEYS: OnceLock<Regex> = OnceLock::new();
static ADDRESS_LIKE: OnceLock<Regex> = OnceLock::new();

fn secret_keys() -> &'static Regex {
    SECRET_KEYS.get_or_init(|| {
        Regex::new(r"(?i)(seed|mnemonic|private|secret|passphrase|password|xprv|wif|api[_-]?key|token)")
            .expect("Invalid secret keys regex")
    })
}

fn address_like() -> &'static Regex {
    ADDRESS_LIKE.get_or_init(|| {
        // Base58 legacy / script addresses and bech32 dgb1 addresses
        Regex::new(r"^(?:[DS][1-9A-HJ-NP-Za-km-z]{25,40}|dgb1[02-9ac-hj-np-z]{20,90})$")
            .expect("Invalid address regex")
    })
}

/// Whether a context key names secret material that must never leave the process
pub fn is_secret_key(key: &str) -> bool {
    secret_keys().is_match(key)
}

/// Whether a string looks like a DigiByte address
pub fn looks_like_address(value: &str) -> bool {
    address_like().is_match(value.trim())
}

/// Short SHA-256 fingerprint used in place of identifying values in logs
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

/// A sensitive wallet operation submitted for evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub wallet_id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    /// Action kind as submitted; parsed during validation
    pub action: String,
    /// Amount in atomic units
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub client: ClientKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub counterparty: Option<CounterpartyTrust>,
    #[serde(default)]
    pub device: Option<DevicePosture>,
    #[serde(default)]
    pub metadata_size: u64,
    /// Amount already spent in the wallet's rolling window, atomic units
    #[serde(default)]
    pub recent_window_spent: u64,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub layer_payloads: BTreeMap<String, serde_json::Value>,
    /// Caller-chosen correlation id; generated when absent
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ActionRequest {
    /// Minimal request for an action, mostly useful in tests and the CLI
    pub fn new(wallet_id: impl Into<String>, action: ActionKind, amount: u64) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            account_id: None,
            action: action.to_string(),
            amount,
            asset_id: None,
            client: ClientKind::default(),
            description: None,
            counterparty: None,
            device: None,
            metadata_size: 0,
            recent_window_spent: 0,
            context: BTreeMap::new(),
            layer_payloads: BTreeMap::new(),
            correlation_id: None,
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

    /// Parse the action kind, rejecting unknown kinds
    pub fn action_kind(&self) -> Result<ActionKind> {
        self.action
            .parse()
            .map_err(Error::InvalidActionRequest)
    }

    /// Structural validation; returns the parsed action kind
    pub fn validate(&self) -> Result<ActionKind> {
        if self.wallet_id.trim().is_empty() {
            return Err(Error::MissingScope("wallet_id"));
        }
        if let Some(account) = &self.account_id {
            if account.trim().is_empty() {
                return Err(Error::MissingScope("account_id"));
            }
        }

        let action = self.action_kind()?;

        let needs_amount = matches!(
            action,
            ActionKind::Send
                | ActionKind::DdMint
                | ActionKind::DdRedeem
                | ActionKind::AssetTransfer
                | ActionKind::AssetBurn
        );
        if needs_amount && self.amount == 0 {
            return Err(Error::InvalidActionRequest(format!(
                "{} requires a non-zero amount",
                action
            )));
        }

        let needs_asset = matches!(action, ActionKind::AssetTransfer | ActionKind::AssetBurn);
        let has_asset = self
            .asset_id
            .as_deref()
            .map(|a| !a.trim().is_empty())
            .unwrap_or(false);
        if needs_asset && !has_asset {
            return Err(Error::InvalidActionRequest(format!(
                "{} requires an asset_id",
                action
            )));
        }

        Ok(action)
    }

    /// Local facts used by the aggregator heuristics
    pub fn local_context(&self) -> LocalContext {
        LocalContext {
            amount: self.amount,
            counterparty: self.counterparty,
            device: self.device.clone(),
        }
    }
}

/// Validate a request and build its immutable packet
pub fn build_packet(request: &ActionRequest) -> Result<RiskPacket> {
    let action = request.validate()?;

    let mut context = BTreeMap::new();
    for (key, value) in &request.context {
        if is_secret_key(key) {
            debug!(key = %key, "Dropping secret-looking context key");
            continue;
        }
        context.insert(key.clone(), value.clone());
    }
    if let Some(description) = &request.description {
        context
            .entry("description".to_string())
            .or_insert_with(|| serde_json::Value::String(description.clone()));
    }

    let asset_id = request
        .asset_id
        .as_ref()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());

    Ok(RiskPacket {
        packet_id: uuid::Uuid::new_v4().to_string(),
        wallet_id: request.wallet_id.trim().to_string(),
        account_id: request.account_id.as_ref().map(|a| a.trim().to_string()),
        action,
        flow_type: action.flow_type(),
        amount: request.amount,
        asset_id,
        client: request.client,
        metadata_size: request.metadata_size,
        recent_window_spent: request.recent_window_spent,
        created_at: Utc::now(),
        context,
        layer_payloads: request.layer_payloads.clone(),
    })
}

/// Copy of a JSON value with secrets dropped and addresses fingerprinted
pub fn redact_value(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) if looks_like_address(s) => Value::String(fingerprint(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_secret_key(k))
                .map(|(k, v)| (k.clone(), redact_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::types::ActionContext;
    use crate::shield::types::FlowType;
    use serde_json::json;

    #[test]
    fn test_build_packet_send() {
        let mut request = ActionRequest::new("w1", ActionKind::Send, 5_000);
        request.context.insert("memo".into(), json!("rent"));
        request.context.insert("seed_phrase".into(), json!("abandon abandon"));

        let packet = build_packet(&request).unwrap();
        assert_eq!(packet.flow_type, FlowType::Transfer);
        assert_eq!(packet.amount, 5_000);
        assert!(packet.context.contains_key("memo"));
        assert!(!packet.context.contains_key("seed_phrase"));
        assert!(uuid::Uuid::parse_str(&packet.packet_id).is_ok());
    }

    #[test]
    fn test_packet_ids_unique() {
        let request = ActionRequest::new("w1", ActionKind::Send, 1);
        let a = build_packet(&request).unwrap();
        let b = build_packet(&request).unwrap();
        assert_ne!(a.packet_id, b.packet_id);
    }

    #[test]
    fn test_empty_wallet_rejected() {
        let request = ActionRequest::new("  ", ActionKind::Send, 1);
        assert!(matches!(
            build_packet(&request),
            Err(Error::MissingScope("wallet_id"))
        ));
    }

    #[test]
    fn test_empty_account_rejected() {
        let request = ActionRequest::new("w1", ActionKind::Send, 1).with_account("");
        assert!(matches!(
            build_packet(&request),
            Err(Error::MissingScope("account_id"))
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let mut request = ActionRequest::new("w1", ActionKind::Send, 1);
        request.action = "teleport".into();
        let err = build_packet(&request).unwrap_err();
        assert_eq!(err.code(), "invalid_action_request");
    }

    #[test]
    fn test_asset_transfer_needs_asset() {
        let request = ActionRequest::new("w1", ActionKind::AssetTransfer, 10);
        assert!(build_packet(&request).is_err());
        let request = request.with_asset("La7hs1ft");
        assert_eq!(build_packet(&request).unwrap().asset_id.as_deref(), Some("La7hs1ft"));
    }

    #[test]
    fn test_settings_change_without_amount() {
        let request = ActionRequest::new("w1", ActionKind::SettingsChange, 0);
        assert!(build_packet(&request).is_ok());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: ActionRequest =
            serde_json::from_str(r#"{"wallet_id":"w1","action":"dd_mint","amount":42}"#).unwrap();
        assert_eq!(request.action_kind().unwrap(), ActionKind::DdMint);
        assert_eq!(request.client, ClientKind::Service);
        assert_eq!(request.recent_window_spent, 0);
        assert!(request.context.is_empty());
    }

    #[test]
    fn test_window_spend_reaches_context() {
        let request = ActionRequest::new("w1", ActionKind::Send, 100).with_window_spent(4_000);
        let packet = build_packet(&request).unwrap();
        assert_eq!(packet.recent_window_spent, 4_000);
        assert_eq!(ActionContext::from_packet(&packet).recent_window_spent, 4_000);
    }

    #[test]
    fn test_redact_value() {
        let value = json!({
            "to": "DBXu2kgc3xtvCUWFcxFE3r9hEYgmuaaCyD",
            "password": "hunter2",
            "nested": [{"note": "hi"}]
        });
        let redacted = redact_value(&value);
        assert!(redacted["to"].as_str().unwrap().starts_with("sha256:"));
        assert!(redacted.get("password").is_none());
        assert_eq!(redacted["nested"][0]["note"], "hi");
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), "sha256:".len() + 16);
    }
}
