//! Decision audit log
//!
//! Every decision is published as a redacted `DecisionRecord` on a broadcast
//! channel and logged under the `guardian_shield::audit` target. Consumers
//! (the JSONL writer, tests, external exporters) subscribe to the channel.
//! Wallet and account ids are fingerprinted, secret context keys are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Phase;
use crate::error::Result;
use crate::guardian::types::VerdictKind;
use crate::shield::packet::{fingerprint, redact_value};
use crate::shield::types::{ActionKind, LayerStatus, RiskLevel, RiskPacket};

/// Per-layer line of an audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAudit {
    pub layer: String,
    pub status: LayerStatus,
    pub score: f64,
    pub latency_ms: u64,
    pub flags: Vec<String>,
    pub detail: Option<String>,
}

/// Redacted record of one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub correlation_id: String,
    pub packet_id: String,
    pub wallet: String,
    pub account: Option<String>,
    pub action: ActionKind,
    pub amount: u64,
    pub asset_id: Option<String>,
    pub verdict: VerdictKind,
    pub reasons: Vec<String>,
    pub rule_ids: Vec<String>,
    pub profile: String,
    pub rule_set_version: String,
    pub final_score: f64,
    pub level: RiskLevel,
    pub is_degraded: bool,
    pub layers: Vec<LayerAudit>,
    pub approval_id: Option<String>,
    pub context: serde_json::Value,
    pub elapsed_ms: u64,
}

impl DecisionRecord {
    /// Start a record from a packet, fingerprinting its identifiers
    pub fn for_packet(packet: &RiskPacket, phase: Phase, correlation_id: &str) -> Self {
        let context = serde_json::to_value(&packet.context)
            .map(|v| redact_value(&v))
            .unwrap_or(serde_json::Value::Null);

        Self {
            timestamp: Utc::now(),
            phase,
            correlation_id: correlation_id.to_string(),
            packet_id: packet.packet_id.clone(),
            wallet: fingerprint(&packet.wallet_id),
            account: packet.account_id.as_deref().map(fingerprint),
            action: packet.action,
            amount: packet.amount,
            asset_id: packet.asset_id.clone(),
            verdict: VerdictKind::Block,
            reasons: Vec::new(),
            rule_ids: Vec::new(),
            profile: String::new(),
            rule_set_version: String::new(),
            final_score: 0.0,
            level: RiskLevel::Unknown,
            is_degraded: false,
            layers: Vec::new(),
            approval_id: None,
            context,
            elapsed_ms: 0,
        }
    }
}

/// Outbound channel of decision records
#[derive(Clone)]
pub struct AuditSink {
    tx: broadcast::Sender<Arc<DecisionRecord>>,
    enabled: bool,
}

impl AuditSink {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, enabled }
    }

    /// Sink that drops everything
    pub fn disabled() -> Self {
        Self::new(1, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DecisionRecord>> {
        self.tx.subscribe()
    }

    /// Log and publish a record; never blocks the decision
    pub fn emit(&self, record: DecisionRecord) {
        if !self.enabled {
            return;
        }

        info!(
            target: "guardian_shield::audit",
            correlation_id = %record.correlation_id,
            packet_id = %record.packet_id,
            phase = ?record.phase,
            wallet = %record.wallet,
            action = %record.action,
            amount = record.amount,
            verdict = %record.verdict,
            level = %record.level,
            score = record.final_score,
            degraded = record.is_degraded,
            reasons = ?record.reasons,
            elapsed_ms = record.elapsed_ms,
            "Decision"
        );

        // No subscribers is fine
        let _ = self.tx.send(Arc::new(record));
    }

    /// Append every record to a JSONL file until the channel closes
    pub fn spawn_jsonl_writer(&self, path: impl Into<PathBuf>) -> JoinHandle<()> {
        let path = path.into();
        let mut rx = self.subscribe();

        tokio::spawn(async move {
            info!(path = %path.display(), "Audit JSONL writer started");
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        if let Err(e) = append_line(&path, &record).await {
                            warn!(path = %path.display(), error = %e, "Failed to write audit record");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Audit writer lagged, records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Audit channel closed");
                        break;
                    }
                }
            }
        })
    }
}

async fn append_line(path: &Path, record: &DecisionRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
