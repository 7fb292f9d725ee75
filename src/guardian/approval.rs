//! Multi-party approval workflow
//!
//! Requests live in a flat table keyed by id. Every state change goes through
//! the `DashMap` entry lock, so a vote's check-and-set is atomic per request
//! while votes on unrelated requests run in parallel.
//!
//! States: `PENDING -> APPROVED | REJECTED | EXPIRED | CANCELLED`. Terminal
//! states are final.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::guardian::policy::{ApprovalDraft, Quorum};
use crate::guardian::types::ActionContext;
use crate::shield::types::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    /// Withdrawn by the wallet before the guardians decided
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Expired => "EXPIRED",
            ApprovalStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guardian's decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    #[serde(alias = "APPROVE", alias = "approved", alias = "APPROVED")]
    Approve,
    #[serde(alias = "REJECT", alias = "rejected", alias = "REJECTED")]
    Reject,
}

impl FromStr for Vote {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(Vote::Approve),
            "reject" | "rejected" | "no" => Ok(Vote::Reject),
            other => Err(format!("Unknown vote '{}', expected approve or reject", other)),
        }
    }
}

/// Per-guardian vote state on one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteState {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl From<Vote> for VoteState {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Approve => VoteState::Approved,
            Vote::Reject => VoteState::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuardianVote {
    pub state: VoteState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub voted_at: Option<DateTime<Utc>>,
}

/// Vote counts for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approved: u32,
    pub rejected: u32,
    pub pending: u32,
    pub required: u32,
}

/// A pending or resolved request for guardian sign-off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    /// Rule that set the approval requirement
    pub rule_id: Option<String>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    pub action: ActionKind,
    pub wallet_id: String,
    pub account_id: Option<String>,
    pub asset_id: Option<String>,
    pub amount: u64,
    pub required: u32,
    /// Eligible guardians, sorted
    pub guardians: Vec<String>,
    /// Per-rule sign-off; every quorum must be met
    #[serde(default)]
    pub quorums: Vec<Quorum>,
    /// Risk floors in force when the request was created
    #[serde(default)]
    pub risk_floors: Vec<String>,
    pub votes: BTreeMap<String, GuardianVote>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

impl ApprovalRequest {
    /// Fresh pending request for a policy draft
    pub fn from_draft(
        draft: &ApprovalDraft,
        ctx: &ActionContext,
        correlation_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = i64::try_from(draft.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let votes = draft
            .guardians
            .iter()
            .map(|g| (g.clone(), GuardianVote::default()))
            .collect();

        Self {
            id: format!("apr_{}", Uuid::new_v4().simple()),
            rule_id: draft.rule_id.clone(),
            rule_ids: draft.rule_ids.clone(),
            action: ctx.action,
            wallet_id: ctx.wallet_id.clone(),
            account_id: ctx.account_id.clone(),
            asset_id: ctx.asset_id.clone(),
            amount: ctx.amount,
            required: draft.required,
            guardians: draft.guardians.clone(),
            quorums: draft.quorums.clone(),
            risk_floors: draft.risk_floors.clone(),
            votes,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at,
            resolved_at: None,
            correlation_id,
        }
    }

    pub fn tally(&self) -> Tally {
        let count = |state| self.votes.values().filter(|v| v.state == state).count() as u32;
        let approved = count(VoteState::Approved);
        let rejected = count(VoteState::Rejected);
        Tally {
            approved,
            rejected,
            pending: (self.guardians.len() as u32).saturating_sub(approved + rejected),
            required: self.required,
        }
    }

    /// Enough distinct approvals overall, and within every quorum
    pub fn quorums_met(&self) -> bool {
        let approved = |g: &String| {
            self.votes
                .get(g)
                .map(|v| v.state == VoteState::Approved)
                .unwrap_or(false)
        };
        self.tally().approved >= self.required
            && self
                .quorums
                .iter()
                .all(|q| q.guardians.iter().filter(|g| approved(g)).count() as u32 >= q.required)
    }

    pub fn is_eligible(&self, guardian_id: &str) -> bool {
        self.guardians.iter().any(|g| g == guardian_id)
    }

    /// Whether this request covers an action: same wallet, account, asset and
    /// action, approved for at least the given amount
    pub fn covers(&self, ctx: &ActionContext) -> bool {
        self.wallet_id == ctx.wallet_id
            && self.action == ctx.action
            && self.account_id == ctx.account_id
            && self.asset_id == ctx.asset_id
            && self.amount >= ctx.amount
    }

    fn resolve(&mut self, status: ApprovalStatus, now: DateTime<Utc>) {
        self.status = status;
        self.resolved_at = Some(now);
    }
}

/// Flat id-keyed table of approval requests
pub struct ApprovalStore {
    requests: DashMap<String, ApprovalRequest>,
    persistence_path: Option<PathBuf>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            persistence_path: None,
        }
    }

    /// Store that snapshots to a JSON file on `save`
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        Self {
            requests: DashMap::new(),
            persistence_path: Some(path.into()),
        }
    }

    /// Persist a new pending request for a draft
    pub fn create(
        &self,
        draft: &ApprovalDraft,
        ctx: &ActionContext,
        correlation_id: Option<String>,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        let request = ApprovalRequest::from_draft(draft, ctx, correlation_id, now);
        info!(
            request_id = %request.id,
            wallet_id = %request.wallet_id,
            action = %request.action,
            required = request.required,
            guardians = request.guardians.len(),
            expires_at = %request.expires_at,
            "Approval request created"
        );
        self.requests.insert(request.id.clone(), request.clone());
        request
    }

    pub fn insert(&self, request: ApprovalRequest) {
        self.requests.insert(request.id.clone(), request);
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.requests.get(id).map(|r| r.value().clone())
    }

    /// Apply one guardian vote
    ///
    /// A repeated identical vote changes nothing. Any rejection resolves the
    /// request as REJECTED; it is APPROVED once every quorum has enough
    /// distinct approvals.
    pub fn apply_vote(
        &self,
        id: &str,
        guardian_id: &str,
        vote: Vote,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| Error::UnknownApprovalRequest(id.to_string()))?;
        let request = entry.value_mut();

        if request.status.is_terminal() {
            return Err(Error::RequestAlreadyTerminal {
                id: id.to_string(),
                status: request.status,
            });
        }

        if now > request.expires_at {
            request.resolve(ApprovalStatus::Expired, now);
            info!(request_id = %id, "Approval request expired before vote");
            return Err(Error::RequestAlreadyTerminal {
                id: id.to_string(),
                status: ApprovalStatus::Expired,
            });
        }

        if !request.is_eligible(guardian_id) {
            warn!(request_id = %id, guardian_id = %guardian_id, "Vote from ineligible guardian");
            return Err(Error::GuardianNotEligible {
                request_id: id.to_string(),
                guardian_id: guardian_id.to_string(),
            });
        }

        let state = VoteState::from(vote);
        let slot = request.votes.entry(guardian_id.to_string()).or_default();
        if slot.state == state {
            debug!(request_id = %id, guardian_id = %guardian_id, "Duplicate vote ignored");
            return Ok(request.clone());
        }
        slot.state = state;
        slot.reason = reason;
        slot.voted_at = Some(now);

        match state {
            VoteState::Rejected => request.resolve(ApprovalStatus::Rejected, now),
            VoteState::Approved if request.quorums_met() => {
                request.resolve(ApprovalStatus::Approved, now)
            }
            _ => {}
        }

        let tally = request.tally();
        info!(
            request_id = %id,
            guardian_id = %guardian_id,
            vote = ?vote,
            approved = tally.approved,
            required = tally.required,
            status = %request.status,
            "Guardian vote applied"
        );

        Ok(request.clone())
    }

    /// Only an APPROVED request authorizes its action
    pub fn authorizes(&self, id: &str) -> bool {
        self.requests
            .get(id)
            .map(|r| r.status == ApprovalStatus::Approved)
            .unwrap_or(false)
    }

    /// Withdraw a pending request
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<ApprovalRequest> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| Error::UnknownApprovalRequest(id.to_string()))?;
        let request = entry.value_mut();
        if request.status.is_terminal() {
            return Err(Error::RequestAlreadyTerminal {
                id: id.to_string(),
                status: request.status,
            });
        }
        request.resolve(ApprovalStatus::Cancelled, now);
        info!(request_id = %id, "Approval request cancelled");
        Ok(request.clone())
    }

    /// Move overdue pending requests to EXPIRED, returning their ids
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for mut entry in self.requests.iter_mut() {
            let request = entry.value_mut();
            if request.status == ApprovalStatus::Pending && now > request.expires_at {
                request.resolve(ApprovalStatus::Expired, now);
                expired.push(request.id.clone());
            }
        }
        expired.sort();
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue approval requests");
        }
        expired
    }

    /// Drop requests resolved before `before`
    pub fn prune_resolved(&self, before: DateTime<Utc>) -> usize {
        let start = self.requests.len();
        self.requests.retain(|_, r| {
            !(r.status.is_terminal() && r.resolved_at.map(|t| t < before).unwrap_or(false))
        });
        let pruned = start.saturating_sub(self.requests.len());
        if pruned > 0 {
            debug!(pruned, "Pruned resolved approval requests");
        }
        pruned
    }

    /// Requests, oldest first, optionally filtered by status
    pub fn list(&self, status: Option<ApprovalStatus>) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .requests
            .iter()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requests
    }

    pub fn pending_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_path.as_deref()
    }

    /// Load requests from disk
    pub async fn load(&self) -> Result<usize> {
        let Some(path) = &self.persistence_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let data = tokio::fs::read_to_string(path).await?;
        let requests: Vec<ApprovalRequest> = serde_json::from_str(&data)?;
        let count = requests.len();
        for request in requests {
            self.insert(request);
        }

        info!("Loaded {} approval requests from {}", count, path.display());
        Ok(count)
    }

    /// Save requests to disk (write then rename)
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        let requests = self.list(None);
        let data = serde_json::to_string_pretty(&requests)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Saved {} approval requests to {}", requests.len(), path.display());
        Ok(())
    }
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn draft(required: u32, guardians: &[&str]) -> ApprovalDraft {
        ApprovalDraft {
            rule_id: Some("send-1000".into()),
            rule_ids: vec!["send-1000".into()],
            required,
            guardians: guardians.iter().map(|g| g.to_string()).collect(),
            ttl_secs: 600,
            quorums: vec![],
            risk_floors: vec![],
        }
    }

    fn ctx() -> ActionContext {
        ActionContext::new("w1", ActionKind::Send, 1_500)
    }

    #[test]
    fn test_two_approvals_resolve() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let request = store.create(&draft(2, &["g1", "g2", "g3"]), &ctx(), None, now);
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(request.tally().pending, 3);

        let after = store.apply_vote(&request.id, "g1", Vote::Approve, None, now).unwrap();
        assert_eq!(after.status, ApprovalStatus::Pending);
        assert!(!store.authorizes(&request.id));

        let after = store
            .apply_vote(&request.id, "g2", Vote::Approve, Some("looks fine".into()), now)
            .unwrap();
        assert_eq!(after.status, ApprovalStatus::Approved);
        assert_eq!(after.resolved_at, Some(now));
        assert!(store.authorizes(&request.id));

        let err = store
            .apply_vote(&request.id, "g3", Vote::Reject, None, now)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RequestAlreadyTerminal {
                status: ApprovalStatus::Approved,
                ..
            }
        ));
        assert_eq!(store.get(&request.id).unwrap().status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_every_quorum_must_be_met() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let mut split = draft(2, &["g1", "g2", "g3", "g4"]);
        split.quorums = vec![
            Quorum {
                rule_id: Some("household".into()),
                required: 2,
                guardians: vec!["g1".into(), "g2".into()],
            },
            Quorum {
                rule_id: Some("advisor".into()),
                required: 1,
                guardians: vec!["g3".into(), "g4".into()],
            },
        ];
        let request = store.create(&split, &ctx(), None, now);

        // Two approvals, but both from the advisor side
        store.apply_vote(&request.id, "g3", Vote::Approve, None, now).unwrap();
        let after = store.apply_vote(&request.id, "g4", Vote::Approve, None, now).unwrap();
        assert_eq!(after.tally().approved, 2);
        assert_eq!(after.status, ApprovalStatus::Pending);

        store.apply_vote(&request.id, "g1", Vote::Approve, None, now).unwrap();
        assert!(!store.authorizes(&request.id));
        let after = store.apply_vote(&request.id, "g2", Vote::Approve, None, now).unwrap();
        assert_eq!(after.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_single_rejection_wins() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let request = store.create(&draft(2, &["g1", "g2", "g3"]), &ctx(), None, now);
        store.apply_vote(&request.id, "g1", Vote::Approve, None, now).unwrap();

        let after = store
            .apply_vote(&request.id, "g2", Vote::Reject, Some("not me".into()), now)
            .unwrap();
        assert_eq!(after.status, ApprovalStatus::Rejected);
        assert_eq!(after.votes["g2"].reason.as_deref(), Some("not me"));
        assert!(!store.authorizes(&request.id));
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let request = store.create(&draft(2, &["g1", "g2"]), &ctx(), None, now);

        let first = store.apply_vote(&request.id, "g1", Vote::Approve, None, now).unwrap();
        let later = now + Duration::seconds(5);
        let second = store.apply_vote(&request.id, "g1", Vote::Approve, None, later).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.tally().approved, 1);
        assert_eq!(second.status, ApprovalStatus::Pending);
    }

    #[test]
    fn test_vote_after_expiry() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let request = store.create(&draft(1, &["g1"]), &ctx(), None, now);

        let late = request.expires_at + Duration::seconds(1);
        let err = store.apply_vote(&request.id, "g1", Vote::Approve, None, late).unwrap_err();
        assert!(matches!(
            err,
            Error::RequestAlreadyTerminal {
                status: ApprovalStatus::Expired,
                ..
            }
        ));
        let stored = store.get(&request.id).unwrap();
        assert_eq!(stored.status, ApprovalStatus::Expired);
        assert!(!store.authorizes(&request.id));
    }

    #[test]
    fn test_vote_at_exact_expiry_counts() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let request = store.create(&draft(1, &["g1"]), &ctx(), None, now);
        let after = store
            .apply_vote(&request.id, "g1", Vote::Approve, None, request.expires_at)
            .unwrap();
        assert_eq!(after.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_unknown_and_ineligible() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        assert!(matches!(
            store.apply_vote("apr_missing", "g1", Vote::Approve, None, now),
            Err(Error::UnknownApprovalRequest(_))
        ));

        let request = store.create(&draft(1, &["g1"]), &ctx(), None, now);
        assert!(matches!(
            store.apply_vote(&request.id, "mallory", Vote::Approve, None, now),
            Err(Error::GuardianNotEligible { .. })
        ));
        assert_eq!(store.get(&request.id).unwrap().tally().approved, 0);
        assert!(!store.authorizes("apr_missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes() {
        let store = Arc::new(ApprovalStore::new());
        let guardians = ["g1", "g2", "g3", "g4", "g5"];
        let now = Utc::now();
        let request = store.create(&draft(3, &guardians), &ctx(), None, now);

        let mut handles = Vec::new();
        for guardian in guardians {
            for _ in 0..4 {
                let store = store.clone();
                let id = request.id.clone();
                handles.push(tokio::spawn(async move {
                    store.apply_vote(&id, guardian, Vote::Approve, None, now)
                }));
            }
        }

        let mut terminal = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => {}
                Err(Error::RequestAlreadyTerminal { .. }) => terminal += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let stored = store.get(&request.id).unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        // Resolution happens exactly when the third distinct approval lands
        assert_eq!(stored.tally().approved, 3);
        assert!(terminal > 0);
    }

    #[test]
    fn test_cancel() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let request = store.create(&draft(1, &["g1"]), &ctx(), None, now);
        let cancelled = assert_ok!(store.cancel(&request.id, now));
        assert_eq!(cancelled.status, ApprovalStatus::Cancelled);
        assert_err!(store.cancel(&request.id, now));
        assert_err!(store.apply_vote(&request.id, "g1", Vote::Approve, None, now));
    }

    #[test]
    fn test_expire_and_prune() {
        let store = ApprovalStore::new();
        let now = Utc::now();
        let old = store.create(&draft(1, &["g1"]), &ctx(), None, now - Duration::hours(2));
        let fresh = store.create(&draft(1, &["g1"]), &ctx(), None, now);

        let expired = store.expire_due(now);
        assert_eq!(expired, vec![old.id.clone()]);
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.list(Some(ApprovalStatus::Expired)).len(), 1);

        assert_eq!(store.prune_resolved(now), 0);
        assert_eq!(store.prune_resolved(now + Duration::seconds(1)), 1);
        assert!(store.get(&old.id).is_none());
        assert!(store.get(&fresh.id).is_some());
    }

    #[test]
    fn test_covers() {
        let request = ApprovalRequest::from_draft(&draft(1, &["g1"]), &ctx(), None, Utc::now());
        assert!(request.covers(&ActionContext::new("w1", ActionKind::Send, 1_000)));
        assert!(!request.covers(&ActionContext::new("w1", ActionKind::Send, 2_000)));
        assert!(!request.covers(&ActionContext::new("w2", ActionKind::Send, 1_000)));
        assert!(!request.covers(&ActionContext::new("w1", ActionKind::DdMint, 1_000)));
    }

    #[test]
    fn test_vote_parse() {
        assert_eq!("Approve".parse::<Vote>().unwrap(), Vote::Approve);
        assert_eq!("rejected".parse::<Vote>().unwrap(), Vote::Reject);
        assert!("maybe".parse::<Vote>().is_err());
        let vote: Vote = serde_json::from_str("\"APPROVED\"").unwrap();
        assert_eq!(vote, Vote::Approve);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.json");
        let now = Utc::now();

        let store = ApprovalStore::with_persistence(&path);
        let request = store.create(&draft(2, &["g1", "g2"]), &ctx(), Some("corr-1".into()), now);
        store.apply_vote(&request.id, "g1", Vote::Approve, None, now).unwrap();
        store.save().await.unwrap();

        let restored = ApprovalStore::with_persistence(&path);
        assert_eq!(restored.load().await.unwrap(), 1);
        let loaded = restored.get(&request.id).unwrap();
        assert_eq!(loaded.tally().approved, 1);
        assert_eq!(loaded.correlation_id.as_deref(), Some("corr-1"));

        let empty = ApprovalStore::with_persistence(dir.path().join("missing.json"));
        assert_eq!(empty.load().await.unwrap(), 0);
    }
}
