//! Decision orchestrator
//!
//! Runs the full pipeline for one action:
//! `ActionRequest -> RiskPacket -> concurrent SignalClients -> RiskMap ->
//! policy -> Verdict (+ ApprovalRequest)`, then emits an audit record.
//!
//! Signal clients run concurrently under a global deadline. Clients still
//! running at the deadline are aborted and recorded as unreachable, so a slow
//! layer can delay a decision by at most the deadline.

pub mod audit;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::guardian::approval::{ApprovalRequest, ApprovalStatus, ApprovalStore};
use crate::guardian::policy;
use crate::guardian::rules::PolicyStore;
use crate::guardian::summary::GuardianSummary;
use crate::guardian::types::{ActionContext, Verdict, VerdictKind};
use crate::shield::aggregator::{aggregate, AggregatorConfig};
use crate::shield::packet::{build_packet, ActionRequest};
use crate::shield::registry::SignalRegistry;
use crate::shield::types::{LayerResult, RiskMap, RiskPacket};

pub use audit::{AuditSink, DecisionRecord, LayerAudit};

/// Default global deadline for one fan-out
pub const DEFAULT_DEADLINE_MS: u64 = 2_500;

/// Which check produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Before the user confirms
    Preflight,
    /// Right before broadcast
    Postflight,
}

/// Everything known about one evaluated action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub correlation_id: String,
    pub packet_id: String,
    pub phase: Phase,
    pub risk_map: RiskMap,
    pub verdict: Verdict,
    pub approval: Option<ApprovalRequest>,
    pub profile: String,
    pub rule_set_version: String,
    pub summary: GuardianSummary,
    pub elapsed_ms: u64,
}

impl Decision {
    pub fn kind(&self) -> VerdictKind {
        self.verdict.kind
    }
}

/// Health snapshot for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub version: String,
    pub rule_set_version: String,
    pub rule_source: String,
    pub layers: Vec<String>,
    pub deadline_ms: u64,
    pub pending_approvals: usize,
    pub diagnostics: Vec<String>,
}

pub struct Orchestrator {
    registry: Arc<SignalRegistry>,
    aggregator: AggregatorConfig,
    policy: Arc<PolicyStore>,
    approvals: Arc<ApprovalStore>,
    audit: AuditSink,
    deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: SignalRegistry,
        policy: Arc<PolicyStore>,
        approvals: Arc<ApprovalStore>,
        audit: AuditSink,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            aggregator: AggregatorConfig::default(),
            policy,
            approvals,
            audit,
            deadline: Duration::from_millis(DEFAULT_DEADLINE_MS),
        }
    }

    /// Wire every component from configuration
    ///
    /// An invalid rule file does not fail startup; the built-in conservative
    /// rules are used and the problem is kept in the policy diagnostics.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = SignalRegistry::from_config(&config.signals)?;
        let policy = Arc::new(PolicyStore::open(
            config.policy.rules_path.as_deref().map(std::path::Path::new),
        ));

        let approvals = match &config.server.approvals_path {
            Some(path) => ApprovalStore::with_persistence(path),
            None => ApprovalStore::new(),
        };
        if let Err(e) = approvals.load().await {
            warn!(error = %e, "Could not restore approval requests, starting empty");
        }

        let audit = AuditSink::new(config.audit.channel_capacity, config.audit.enabled);

        Ok(Self::new(registry, policy, Arc::new(approvals), audit)
            .with_aggregator(config.aggregator.clone())
            .with_deadline(Duration::from_millis(config.signals.deadline_ms)))
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    pub fn approvals(&self) -> &Arc<ApprovalStore> {
        &self.approvals
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Preflight evaluation; creates an approval request when one is needed
    ///
    /// Only structural problems with the request are returned as errors.
    pub async fn evaluate(&self, request: &ActionRequest) -> Result<Decision> {
        let started = Instant::now();
        let (packet, correlation_id) = self.prepare(request)?;
        let (risk_map, ctx) = self.assess(request, &packet).await;

        let rules = self.policy.snapshot();
        let outcome = policy::evaluate(&risk_map, &ctx, &rules);

        let approval = outcome
            .approval
            .as_ref()
            .map(|draft| self.approvals.create(draft, &ctx, Some(correlation_id.clone()), Utc::now()));

        Ok(self.finish(
            Phase::Preflight,
            &packet,
            correlation_id,
            risk_map,
            outcome.verdict,
            approval,
            outcome.profile,
            outcome.rule_set_version,
            started,
        ))
    }

    /// Re-run the pipeline right before broadcast
    ///
    /// A REQUIRE_APPROVAL verdict is satisfied by a referenced APPROVED request
    /// covering the same wallet, account, asset and action for at least this
    /// amount, as long as no risk floor appeared after the guardians signed off
    /// and at least one layer answered. Rejected, expired, cancelled, unknown
    /// or mismatched references block. No new approval request is created here.
    pub async fn postflight(&self, request: &ActionRequest, approval_id: Option<&str>) -> Result<Decision> {
        let started = Instant::now();
        let (packet, correlation_id) = self.prepare(request)?;
        let (risk_map, ctx) = self.assess(request, &packet).await;

        let rules = self.policy.snapshot();
        let outcome = policy::evaluate(&risk_map, &ctx, &rules);
        let (verdict, approval) = self.settle_with_approval(&outcome, &ctx, approval_id);

        Ok(self.finish(
            Phase::Postflight,
            &packet,
            correlation_id,
            risk_map,
            verdict,
            approval,
            outcome.profile,
            outcome.rule_set_version,
            started,
        ))
    }

    /// Query every registered layer concurrently under the global deadline
    pub async fn collect_signals(&self, packet: Arc<RiskPacket>) -> Vec<LayerResult> {
        let mut tasks = JoinSet::new();
        let mut task_layers: HashMap<tokio::task::Id, String> = HashMap::new();
        for client in self.registry.clients() {
            let layer = client.layer().to_string();
            let client = client.clone();
            let packet = packet.clone();
            let handle = tasks.spawn(async move { client.fetch(&packet).await });
            task_layers.insert(handle.id(), layer);
        }

        let mut results = Vec::with_capacity(self.registry.len());
        let mut failed: Vec<String> = Vec::new();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(e)) => {
                        let layer = task_layers.get(&e.id()).cloned();
                        warn!(layer = ?layer, error = %e, "Signal task failed");
                        failed.extend(layer);
                    }
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        // Best effort; aborted tasks are not awaited
        tasks.abort_all();
        tasks.detach_all();

        for layer in self.registry.layers() {
            if results.iter().any(|r| r.layer == layer) {
                continue;
            }
            let reason = if failed.iter().any(|f| f == layer) {
                "task_failed"
            } else {
                "deadline_exceeded"
            };
            warn!(
                layer = %layer,
                packet_id = %packet.packet_id,
                deadline_ms = self.deadline.as_millis() as u64,
                reason,
                "No answer from layer"
            );
            results.push(LayerResult::unreachable(layer, reason));
        }

        results
    }

    /// Status for operators and the health endpoint
    pub fn health(&self) -> HealthReport {
        let rules = self.policy.snapshot();
        HealthReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            rule_set_version: rules.version.clone(),
            rule_source: rules.source.to_string(),
            layers: self.registry.layers().into_iter().map(String::from).collect(),
            deadline_ms: self.deadline.as_millis() as u64,
            pending_approvals: self.approvals.pending_count(),
            diagnostics: self.policy.diagnostics(),
        }
    }

    /// Background loop: expire overdue approvals, prune old resolved ones and
    /// snapshot the store, until shutdown
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        sweep: Duration,
        retention: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::days(7));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Utc::now();
                        let expired = engine.approvals.expire_due(now);
                        let pruned = engine.approvals.prune_resolved(now - retention);
                        if !expired.is_empty() || pruned > 0 {
                            if let Err(e) = engine.approvals.save().await {
                                warn!(error = %e, "Failed to snapshot approval requests");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Approval maintenance shutting down");
                        if let Err(e) = engine.approvals.save().await {
                            warn!(error = %e, "Failed to snapshot approval requests");
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Start the JSONL audit writer when a path is configured
    pub fn spawn_audit_writer(&self, path: Option<PathBuf>) -> Option<tokio::task::JoinHandle<()>> {
        path.filter(|_| self.audit.is_enabled())
            .map(|p| self.audit.spawn_jsonl_writer(p))
    }

    fn prepare(&self, request: &ActionRequest) -> Result<(Arc<RiskPacket>, String)> {
        let packet = match build_packet(request) {
            Ok(packet) => Arc::new(packet),
            Err(e) => {
                warn!(error = %e, "Rejected structurally invalid action request");
                return Err(e);
            }
        };
        let correlation_id = request
            .correlation_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| packet.packet_id.clone());
        Ok((packet, correlation_id))
    }

    async fn assess(&self, request: &ActionRequest, packet: &Arc<RiskPacket>) -> (RiskMap, ActionContext) {
        let results = self.collect_signals(packet.clone()).await;
        let risk_map = aggregate(
            &results,
            &request.local_context(),
            self.registry.weights(),
            &self.aggregator,
        );
        debug!(
            packet_id = %packet.packet_id,
            score = risk_map.final_score,
            level = %risk_map.level,
            degraded = risk_map.is_degraded,
            "Risk aggregated"
        );
        (risk_map, ActionContext::from_packet(packet))
    }

    fn settle_with_approval(
        &self,
        outcome: &policy::PolicyOutcome,
        ctx: &ActionContext,
        approval_id: Option<&str>,
    ) -> (Verdict, Option<ApprovalRequest>) {
        let mut verdict = outcome.verdict.clone();
        let Some(id) = approval_id.filter(|id| !id.trim().is_empty()) else {
            return (verdict, None);
        };
        let Some(request) = self.approvals.get(id) else {
            if verdict.kind == VerdictKind::RequireApproval {
                verdict.escalate(VerdictKind::Block, format!("approval_unknown:{}", id));
            }
            return (verdict, None);
        };
        if verdict.kind != VerdictKind::RequireApproval {
            return (verdict, Some(request));
        }

        let now = Utc::now();
        let status = if request.status == ApprovalStatus::Pending && now > request.expires_at {
            ApprovalStatus::Expired
        } else {
            request.status
        };

        if !request.covers(ctx) {
            verdict.escalate(VerdictKind::Block, format!("approval_mismatch:{}", id));
            return (verdict, Some(request));
        }

        match status {
            // An approval never stands in for the layers
            ApprovalStatus::Approved if outcome.blind => {
                verdict.reasons.push(format!("approval_blind:{}", id));
            }
            ApprovalStatus::Approved => {
                let unseen: Vec<&String> = outcome
                    .risk_floors
                    .iter()
                    .filter(|floor| !request.risk_floors.contains(floor))
                    .collect();
                if unseen.is_empty() {
                    verdict.kind = outcome.approved_kind;
                    verdict.reasons.push(format!("approval_satisfied:{}", id));
                } else {
                    warn!(
                        request_id = %id,
                        floors = ?unseen,
                        "Risk rose after approval, sign-off no longer covers the action"
                    );
                    verdict.reasons.push(format!("approval_outdated:{}", id));
                }
            }
            ApprovalStatus::Pending => {
                verdict.reasons.push(format!("approval_pending:{}", id));
            }
            other => {
                verdict.escalate(
                    VerdictKind::Block,
                    format!("approval_{}:{}", other.as_str().to_lowercase(), id),
                );
            }
        }

        (verdict, Some(request))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        phase: Phase,
        packet: &RiskPacket,
        correlation_id: String,
        risk_map: RiskMap,
        verdict: Verdict,
        approval: Option<ApprovalRequest>,
        profile: String,
        rule_set_version: String,
        started: Instant,
    ) -> Decision {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let rules = self.policy.snapshot();
        let summary = GuardianSummary::build(
            &verdict,
            approval.as_ref(),
            Some(rules.profile_for(&packet.wallet_id)),
            Utc::now(),
        );

        let mut record = DecisionRecord::for_packet(packet, phase, &correlation_id);
        record.verdict = verdict.kind;
        record.reasons = verdict.reasons.clone();
        record.rule_ids = verdict.rule_ids.clone();
        record.profile = profile.clone();
        record.rule_set_version = rule_set_version.clone();
        record.final_score = risk_map.final_score;
        record.level = risk_map.level;
        record.is_degraded = risk_map.is_degraded;
        record.layers = risk_map
            .results
            .iter()
            .map(|r| LayerAudit {
                layer: r.layer.clone(),
                status: r.status,
                score: r.score,
                latency_ms: r.latency_ms,
                flags: r.flags.clone(),
                detail: r.detail.clone(),
            })
            .collect();
        record.approval_id = approval.as_ref().map(|a| a.id.clone());
        record.elapsed_ms = elapsed_ms;
        self.audit.emit(record);

        Decision {
            correlation_id,
            packet_id: packet.packet_id.clone(),
            phase,
            risk_map,
            verdict,
            approval,
            profile,
            rule_set_version,
            summary,
            elapsed_ms,
        }
    }
}
