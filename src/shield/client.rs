//! Signal clients for the shield layers
//!
//! Each layer (Sentinel, DQSN, ADN, QAC, Adaptive Core) is reached through a
//! `SignalClient`. The fallible `request` does the I/O; the provided `fetch`
//! wraps it with the per-layer timeout and envelope checks and never fails:
//! every problem becomes an unreachable `LayerResult` with a detail string.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::shield::types::{LayerEnvelope, LayerResult, LayerStatus, RiskPacket};

/// Default per-layer timeout
pub const DEFAULT_LAYER_TIMEOUT_MS: u64 = 800;

/// A source of risk signals for one layer
#[async_trait]
pub trait SignalClient: Send + Sync {
    /// Layer name, used as the registry key and in every result
    fn layer(&self) -> &str;

    /// Maximum time allowed for one request
    fn timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_LAYER_TIMEOUT_MS)
    }

    /// Perform the raw request
    async fn request(&self, packet: &RiskPacket) -> Result<LayerEnvelope>;

    /// Query the layer, folding every failure into an unreachable result
    async fn fetch(&self, packet: &RiskPacket) -> LayerResult {
        let layer = self.layer().to_string();
        let timeout = self.timeout();
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, self.request(packet)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => {
                let err = Error::LayerTimeout {
                    layer: layer.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                LayerResult::unreachable(&layer, err.to_string())
            }
            Ok(Err(e)) => LayerResult::unreachable(&layer, e.to_string()),
            Ok(Ok(envelope)) => match check_envelope(&layer, envelope) {
                Ok(result) => result,
                Err(e) => LayerResult::unreachable(&layer, e.to_string()),
            },
        };

        if result.status == LayerStatus::Unreachable {
            warn!(
                layer = %layer,
                packet_id = %packet.packet_id,
                latency_ms,
                detail = result.detail.as_deref().unwrap_or(""),
                "Layer unreachable"
            );
        } else {
            debug!(
                layer = %layer,
                packet_id = %packet.packet_id,
                latency_ms,
                score = result.score,
                status = %result.status,
                "Layer answered"
            );
        }

        result.with_latency_ms(latency_ms)
    }
}

/// Reject envelopes for the wrong layer or with an unusable score
fn check_envelope(layer: &str, envelope: LayerEnvelope) -> Result<LayerResult> {
    if !envelope.layer.trim().eq_ignore_ascii_case(layer) {
        return Err(Error::LayerMalformed {
            layer: layer.to_string(),
            reason: format!("envelope names layer '{}'", envelope.layer),
        });
    }
    let score_ok = envelope.risk_score.is_finite() && (0.0..=1.0).contains(&envelope.risk_score);
    if envelope.status != LayerStatus::Unreachable && !score_ok {
        return Err(Error::LayerMalformed {
            layer: layer.to_string(),
            reason: format!("risk_score {} outside [0, 1]", envelope.risk_score),
        });
    }

    let status = envelope.status;
    let mut result = LayerResult::from_envelope(envelope);
    result.layer = layer.to_string();
    if status == LayerStatus::Unreachable {
        result.detail = Some("layer reported unreachable".to_string());
    }
    Ok(result)
}

/// HTTP+JSON client for a remote layer
pub struct HttpSignalClient {
    layer: String,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
    client: Client,
}

impl HttpSignalClient {
    pub fn new(
        layer: impl Into<String>,
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            layer: layer.into(),
            endpoint: endpoint.into(),
            token: token.filter(|t| !t.is_empty()),
            timeout,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Body sent to the layer: the packet with only this layer's payload
    fn body(&self, packet: &RiskPacket) -> Result<serde_json::Value> {
        let mut body = serde_json::to_value(packet)?;
        if let Some(map) = body.as_object_mut() {
            map.remove("layer_payloads");
            map.insert("layer".to_string(), serde_json::Value::String(self.layer.clone()));
            map.insert("payload".to_string(), packet.payload_for(&self.layer));
        }
        Ok(body)
    }
}

#[async_trait]
impl SignalClient for HttpSignalClient {
    fn layer(&self) -> &str {
        &self.layer
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn request(&self, packet: &RiskPacket) -> Result<LayerEnvelope> {
        let body = self.body(packet)?;

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::LayerTimeout {
                    layer: self.layer.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                Error::LayerUnreachable {
                    layer: self.layer.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::LayerAuth {
                layer: self.layer.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(Error::LayerUnreachable {
                layer: self.layer.clone(),
                reason: format!("HTTP {}", status),
            });
        }

        response
            .json::<LayerEnvelope>()
            .await
            .map_err(|e| Error::LayerMalformed {
                layer: self.layer.clone(),
                reason: e.to_string(),
            })
    }
}

/// In-process client returning a fixed answer, optionally after a delay
pub struct StaticSignalClient {
    layer: String,
    response: std::result::Result<LayerEnvelope, String>,
    delay: Option<Duration>,
    timeout: Duration,
}

impl StaticSignalClient {
    /// Healthy layer reporting a fixed score
    pub fn new(layer: impl Into<String>, score: f64) -> Self {
        let layer = layer.into();
        let envelope = LayerEnvelope {
            layer: layer.clone(),
            risk_score: score,
            signals: Default::default(),
            status: LayerStatus::Ok,
        };
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: LayerEnvelope) -> Self {
        Self {
            layer: envelope.layer.clone(),
            response: Ok(envelope),
            delay: None,
            timeout: Duration::from_millis(DEFAULT_LAYER_TIMEOUT_MS),
        }
    }

    /// Layer whose every request fails with the given reason
    pub fn failing(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            response: Err(reason.into()),
            delay: None,
            timeout: Duration::from_millis(DEFAULT_LAYER_TIMEOUT_MS),
        }
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(envelope) = &mut self.response {
            envelope.signals.flags = flags.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn with_status(mut self, status: LayerStatus) -> Self {
        if let Ok(envelope) = &mut self.response {
            envelope.status = status;
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SignalClient for StaticSignalClient {
    fn layer(&self) -> &str {
        &self.layer
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn request(&self, _packet: &RiskPacket) -> Result<LayerEnvelope> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone().map_err(|reason| Error::LayerUnreachable {
            layer: self.layer.clone(),
            reason,
        })
    }
}

/// Placeholder for a layer declared without an endpoint
pub struct UnavailableSignalClient {
    layer: String,
}

impl UnavailableSignalClient {
    pub fn new(layer: impl Into<String>) -> Self {
        Self { layer: layer.into() }
    }
}

#[async_trait]
impl SignalClient for UnavailableSignalClient {
    fn layer(&self) -> &str {
        &self.layer
    }

    async fn request(&self, _packet: &RiskPacket) -> Result<LayerEnvelope> {
        Err(Error::LayerUnreachable {
            layer: self.layer.clone(),
            reason: "no endpoint configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shield::packet::{build_packet, ActionRequest};
    use crate::shield::types::ActionKind;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    fn packet() -> RiskPacket {
        let mut request = ActionRequest::new("w1", ActionKind::Send, 1_000);
        request
            .layer_payloads
            .insert("sentinel".into(), json!({"hint": "s"}));
        request.layer_payloads.insert("dqsn".into(), json!({"hint": "d"}));
        build_packet(&request).unwrap()
    }

    #[tokio::test]
    async fn test_static_ok() {
        let client = StaticSignalClient::new("sentinel", 0.3).with_flags(["watch"]);
        let result = client.fetch(&packet()).await;
        assert!(result.is_ok());
        assert_eq!(result.score, 0.3);
        assert!(result.has_flag("watch"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_unreachable() {
        let client = StaticSignalClient::new("dqsn", 0.9)
            .with_delay(Duration::from_millis(200))
            .with_timeout(Duration::from_millis(20));
        let result = client.fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Unreachable);
        assert_eq!(result.score, 0.0);
        assert!(result.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failure_becomes_unreachable() {
        let client = StaticSignalClient::failing("adn", "connection refused");
        let result = client.fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Unreachable);
        assert!(result.detail.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_out_of_range_score_rejected() {
        let client = StaticSignalClient::new("qac", 1.5);
        let result = client.fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Unreachable);
        assert_eq!(result.score, 0.0);

        let client = StaticSignalClient::new("qac", f64::NAN);
        assert_eq!(client.fetch(&packet()).await.status, LayerStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_layer_mismatch_rejected() {
        let envelope = LayerEnvelope {
            layer: "adaptive".into(),
            risk_score: 0.1,
            signals: Default::default(),
            status: LayerStatus::Ok,
        };
        let mut client = StaticSignalClient::from_envelope(envelope);
        client.layer = "sentinel".into();
        let result = client.fetch(&packet()).await;
        assert_eq!(result.layer, "sentinel");
        assert_eq!(result.status, LayerStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_unavailable_client() {
        let result = UnavailableSignalClient::new("qac").fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Unreachable);
        assert_eq!(result.layer, "qac");
    }

    #[tokio::test]
    async fn test_degraded_status_passes_through() {
        let client = StaticSignalClient::new("adaptive", 0.4).with_status(LayerStatus::Degraded);
        let result = client.fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Degraded);
        assert_eq!(result.score, 0.4);
    }

    async fn spawn_layer_server() -> String {
        async fn ok(headers: HeaderMap, Json(body): Json<Value>) -> (HttpStatus, Json<Value>) {
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == "Bearer s3cret")
                .unwrap_or(false);
            if !authorized {
                return (HttpStatus::UNAUTHORIZED, Json(json!({})));
            }
            // Only this layer's payload is forwarded
            let score = if body.get("layer_payloads").is_none() && body["payload"]["hint"] == "s" {
                0.2
            } else {
                0.99
            };
            (
                HttpStatus::OK,
                Json(json!({
                    "layer": "sentinel",
                    "risk_score": score,
                    "signals": {"flags": ["velocity"], "metrics": {"tx_1h": 3}},
                    "status": "ok"
                })),
            )
        }
        async fn garbage() -> &'static str {
            "not json"
        }
        async fn broken() -> HttpStatus {
            HttpStatus::INTERNAL_SERVER_ERROR
        }
        async fn slow() -> Json<Value> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Json(json!({"layer": "sentinel", "risk_score": 0.1}))
        }

        let app = Router::new()
            .route("/ok", post(ok))
            .route("/garbage", post(garbage))
            .route("/broken", post(broken))
            .route("/slow", post(slow));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn http(base: &str, path: &str, token: Option<&str>, timeout_ms: u64) -> HttpSignalClient {
        HttpSignalClient::new(
            "sentinel",
            format!("{}{}", base, path),
            token.map(String::from),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_ok_with_token() {
        let base = spawn_layer_server().await;
        let result = http(&base, "/ok", Some("s3cret"), 2_000).fetch(&packet()).await;
        assert!(result.is_ok(), "{:?}", result.detail);
        assert_eq!(result.score, 0.2);
        assert!(result.has_flag("velocity"));
        assert_eq!(result.metrics["tx_1h"], 3);
    }

    #[tokio::test]
    async fn test_http_auth_rejected() {
        let base = spawn_layer_server().await;
        let client = http(&base, "/ok", None, 2_000);
        let err = client.request(&packet()).await.unwrap_err();
        assert!(matches!(err, Error::LayerAuth { status: 401, .. }));
        assert_eq!(client.fetch(&packet()).await.status, LayerStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_http_malformed_and_server_error() {
        let base = spawn_layer_server().await;
        let garbage = http(&base, "/garbage", None, 2_000);
        assert!(matches!(
            garbage.request(&packet()).await,
            Err(Error::LayerMalformed { .. })
        ));
        let broken = http(&base, "/broken", None, 2_000).fetch(&packet()).await;
        assert_eq!(broken.status, LayerStatus::Unreachable);
        assert!(broken.detail.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_http_timeout() {
        let base = spawn_layer_server().await;
        let result = http(&base, "/slow", None, 50).fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Unreachable);
        assert!(result.latency_ms < 500);
    }

    #[tokio::test]
    async fn test_http_connection_refused() {
        let result = http("http://127.0.0.1:1", "/ok", None, 500).fetch(&packet()).await;
        assert_eq!(result.status, LayerStatus::Unreachable);
    }
}
