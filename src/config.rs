//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

// Re-export aggregator config (bands, override floor, heuristics)
pub use crate::shield::aggregator::AggregatorConfig;

/// Layers consulted when no explicit layer table is configured
pub const DEFAULT_LAYERS: [&str; 5] = ["sentinel", "dqsn", "adn", "qac", "adaptive"];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address of the guardian API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Where pending approvals are snapshotted on shutdown (and restored on start)
    #[serde(default)]
    pub approvals_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            approvals_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    /// Global deadline for one evaluation fan-out
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Per-layer timeout when a layer does not set its own
    #[serde(default = "default_layer_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Layer table keyed by layer name
    #[serde(default = "default_layer_table")]
    pub layers: BTreeMap<String, LayerConfig>,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            default_timeout_ms: default_layer_timeout_ms(),
            layers: default_layer_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HTTP endpoint receiving the packet; none means the layer is unavailable
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token sent to the endpoint
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Fixed in-process score instead of a remote call
    #[serde(default)]
    pub static_score: Option<f64>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            token: None,
            weight: default_weight(),
            timeout_ms: None,
            static_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Rule file (TOML or JSON); built-in conservative rules when unset
    #[serde(default)]
    pub rules_path: Option<String>,
    /// Interval of the background expiry sweep
    #[serde(default = "default_expiry_sweep_secs")]
    pub expiry_sweep_secs: u64,
    /// Resolved approvals older than this are pruned by the sweep
    #[serde(default = "default_resolved_retention_secs")]
    pub resolved_retention_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            expiry_sweep_secs: default_expiry_sweep_secs(),
            resolved_retention_secs: default_resolved_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Capacity of the decision broadcast channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Append decision records as JSON lines to this file
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: default_channel_capacity(),
            jsonl_path: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_deadline_ms() -> u64 {
    2_500
}

fn default_layer_timeout_ms() -> u64 {
    crate::shield::client::DEFAULT_LAYER_TIMEOUT_MS
}

fn default_layer_table() -> BTreeMap<String, LayerConfig> {
    DEFAULT_LAYERS
        .iter()
        .map(|name| (name.to_string(), LayerConfig::default()))
        .collect()
}

fn default_weight() -> f64 {
    1.0
}

fn default_expiry_sweep_secs() -> u64 {
    30
}

fn default_resolved_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("server.bind", default_bind())?
            .set_default("signals.deadline_ms", default_deadline_ms() as i64)?
            .set_default("signals.default_timeout_ms", default_layer_timeout_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix GUARDIAN__)
            .add_source(
                config::Environment::with_prefix("GUARDIAN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;

        if self.signals.deadline_ms == 0 {
            anyhow::bail!("signals.deadline_ms must be positive");
        }
        if self.signals.default_timeout_ms == 0 {
            anyhow::bail!("signals.default_timeout_ms must be positive");
        }

        for (name, layer) in &self.signals.layers {
            if name.trim().is_empty() {
                anyhow::bail!("Layer names must not be empty");
            }
            if !layer.weight.is_finite() || layer.weight < 0.0 {
                anyhow::bail!("Layer {} weight must be a non-negative number", name);
            }
            if layer.timeout_ms == Some(0) {
                anyhow::bail!("Layer {} timeout_ms must be positive", name);
            }
            if let Some(score) = layer.static_score {
                if !score.is_finite() || !(0.0..=1.0).contains(&score) {
                    anyhow::bail!("Layer {} static_score must be within [0, 1]", name);
                }
            }
            if let Some(endpoint) = &layer.endpoint {
                let url = url::Url::parse(endpoint)
                    .with_context(|| format!("Invalid endpoint for layer {}", name))?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    anyhow::bail!(
                        "Layer {} endpoint must use http or https, got {}",
                        name,
                        url.scheme()
                    );
                }
            }
        }

        if self.signals.layers.values().all(|l| !l.enabled) {
            tracing::warn!("No signal layer is enabled - every evaluation will be blind");
        }

        self.aggregator
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid aggregator configuration: {}", e))?;

        if self.policy.expiry_sweep_secs == 0 {
            anyhow::bail!("policy.expiry_sweep_secs must be positive");
        }

        if self.audit.channel_capacity == 0 {
            anyhow::bail!("audit.channel_capacity must be positive");
        }

        Ok(())
    }

    /// Timeout for a layer, falling back to the signals default
    pub fn layer_timeout_ms(&self, layer: &LayerConfig) -> u64 {
        layer.timeout_ms.unwrap_or(self.signals.default_timeout_ms)
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let mut layers = String::new();
        for (name, layer) in &self.signals.layers {
            let source = match (&layer.static_score, &layer.endpoint) {
                (Some(score), _) => format!("static {:.2}", score),
                (None, Some(endpoint)) => mask_url(endpoint),
                (None, None) => "(no endpoint)".to_string(),
            };
            layers.push_str(&format!(
                "    {}: {} weight={} timeout={}ms token={} enabled={}\n",
                name,
                source,
                layer.weight,
                self.layer_timeout_ms(layer),
                if layer.token.as_deref().unwrap_or("").is_empty() {
                    "(not set)"
                } else {
                    "***"
                },
                layer.enabled,
            ));
        }

        format!(
            r#"Configuration:
  Server:
    bind: {}
    approvals_path: {}
  Signals:
    deadline: {}ms
    default_timeout: {}ms
  Layers:
{}  Aggregator:
    bands: medium>={} high>={} critical>={}
    override_floor: {}
    override_tags: {:?}
  Policy:
    rules_path: {}
    expiry_sweep: {}s
  Audit:
    enabled: {}
    channel_capacity: {}
    jsonl_path: {}
"#,
            self.server.bind,
            self.server.approvals_path.as_deref().unwrap_or("(not set)"),
            self.signals.deadline_ms,
            self.signals.default_timeout_ms,
            layers,
            self.aggregator.bands.medium,
            self.aggregator.bands.high,
            self.aggregator.bands.critical,
            self.aggregator.override_floor,
            self.aggregator.override_tags,
            self.policy.rules_path.as_deref().unwrap_or("(built-in conservative)"),
            self.policy.expiry_sweep_secs,
            self.audit.enabled,
            self.audit.channel_capacity,
            self.audit.jsonl_path.as_deref().unwrap_or("(not set)"),
        )
    }
}

/// Mask URL for display (hide credentials and query params)
pub fn mask_url(url: &str) -> String {
    let base = match url.find('?') {
        Some(idx) => format!("{}?***", &url[..idx]),
        None => url.to_string(),
    };
    match url::Url::parse(&base) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signals.deadline_ms, 2_500);
        assert_eq!(config.signals.layers.len(), 5);
        assert!(config.signals.layers.contains_key("qac"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
bind = "0.0.0.0:9000"

[signals]
deadline_ms = 1500

[signals.layers.sentinel]
endpoint = "https://sentinel.example/v1/score?key=abc"
token = "t0k"
weight = 2.0

[signals.layers.adaptive]
static_score = 0.1

[aggregator.bands]
medium = 0.2
high = 0.5
critical = 0.8
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.signals.deadline_ms, 1500);
        assert_eq!(config.signals.layers.len(), 2);
        assert_eq!(config.signals.layers["sentinel"].weight, 2.0);
        assert_eq!(config.signals.layers["adaptive"].static_score, Some(0.1));
        assert_eq!(config.aggregator.bands.high, 0.5);
        // Untouched sections keep their defaults
        assert_eq!(config.aggregator.override_floor, 0.75);

        let shown = config.masked_display();
        assert!(!shown.contains("t0k"));
        assert!(!shown.contains("key=abc"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/guardian.toml").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8787");
    }

    #[test]
    fn test_invalid_bands_rejected() {
        let mut config = Config::default();
        config.aggregator.bands.high = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut config = Config::default();
        config.signals.layers.insert(
            "sentinel".into(),
            LayerConfig {
                endpoint: Some("ftp://sentinel".into()),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(
            mask_url("https://api.example.com"),
            "https://api.example.com"
        );
        assert!(!mask_url("https://user:pw@api.example.com/x").contains("pw"));
    }
}
