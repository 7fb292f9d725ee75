//! Explicit registry of signal clients keyed by layer name

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SignalsConfig;
use crate::error::Result;
use crate::shield::client::{
    HttpSignalClient, SignalClient, StaticSignalClient, UnavailableSignalClient,
};
use crate::shield::types::WeightTable;

/// Registered layers, their clients and aggregation weights
#[derive(Clone, Default)]
pub struct SignalRegistry {
    clients: BTreeMap<String, Arc<dyn SignalClient>>,
    weights: WeightTable,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `signals` configuration section
    pub fn from_config(config: &SignalsConfig) -> Result<Self> {
        let mut registry = Self::new();

        for (name, layer) in &config.layers {
            if !layer.enabled {
                info!(layer = %name, "Layer disabled, not registered");
                continue;
            }

            let timeout = Duration::from_millis(layer.timeout_ms.unwrap_or(config.default_timeout_ms));
            let client: Arc<dyn SignalClient> = match (&layer.static_score, &layer.endpoint) {
                (Some(score), _) => {
                    Arc::new(StaticSignalClient::new(name.clone(), *score).with_timeout(timeout))
                }
                (None, Some(endpoint)) => Arc::new(HttpSignalClient::new(
                    name.clone(),
                    endpoint.clone(),
                    layer.token.clone(),
                    timeout,
                )?),
                (None, None) => {
                    warn!(layer = %name, "No endpoint configured, layer will report unreachable");
                    Arc::new(UnavailableSignalClient::new(name.clone()))
                }
            };

            registry.register(client, layer.weight);
        }

        info!(layers = ?registry.layers(), "Signal registry ready");
        Ok(registry)
    }

    /// Register a client, replacing any previous client for the same layer
    pub fn register(&mut self, client: Arc<dyn SignalClient>, weight: f64) -> Option<Arc<dyn SignalClient>> {
        let layer = client.layer().to_string();
        self.weights.insert(layer.clone(), weight);
        self.clients.insert(layer, client)
    }

    pub fn get(&self, layer: &str) -> Option<&Arc<dyn SignalClient>> {
        self.clients.get(layer)
    }

    /// Registered layer names, sorted
    pub fn layers(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<dyn SignalClient>> {
        self.clients.values()
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("layers", &self.layers())
            .field("weights", &self.weights)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerConfig;
    use crate::shield::packet::{build_packet, ActionRequest};
    use crate::shield::types::{ActionKind, LayerStatus};

    #[tokio::test]
    async fn test_from_config() {
        let mut config = SignalsConfig::default();
        config.layers.insert(
            "sentinel".into(),
            LayerConfig {
                static_score: Some(0.2),
                weight: 2.0,
                ..Default::default()
            },
        );
        config.layers.insert(
            "qac".into(),
            LayerConfig {
                enabled: false,
                ..Default::default()
            },
        );

        let registry = SignalRegistry::from_config(&config).unwrap();
        assert_eq!(registry.layers(), vec!["adaptive", "adn", "dqsn", "sentinel"]);
        assert_eq!(registry.weights()["sentinel"], 2.0);

        let packet = build_packet(&ActionRequest::new("w1", ActionKind::Send, 1)).unwrap();
        let sentinel = registry.get("sentinel").unwrap().fetch(&packet).await;
        assert_eq!(sentinel.score, 0.2);
        let dqsn = registry.get("dqsn").unwrap().fetch(&packet).await;
        assert_eq!(dqsn.status, LayerStatus::Unreachable);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = SignalRegistry::new();
        assert!(registry
            .register(Arc::new(StaticSignalClient::new("adn", 0.1)), 1.0)
            .is_none());
        assert!(registry
            .register(Arc::new(StaticSignalClient::new("adn", 0.5)), 3.0)
            .is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.weights()["adn"], 3.0);
    }
}
