//! Risk aggregation
//!
//! Combines the per-layer results with local heuristics into one `RiskMap`.
//! Aggregation is pure and synchronous: the same multiset of results always
//! yields the same map, whatever order the results arrived in.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::shield::heuristics::{LocalContext, LocalHeuristics, LocalHeuristicsConfig};
use crate::shield::types::{LayerResult, LayerStatus, RiskLevel, RiskMap, WeightTable};

/// Lower bounds of the medium, high and critical bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandThresholds {
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_critical")]
    pub critical: f64,
}

fn default_medium() -> f64 { 0.15 }
fn default_high() -> f64 { 0.40 }
fn default_critical() -> f64 { 0.75 }

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            medium: default_medium(),
            high: default_high(),
            critical: default_critical(),
        }
    }
}

impl BandThresholds {
    /// Band for a final score in [0, 1]
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let ordered = 0.0 < self.medium
            && self.medium < self.high
            && self.high < self.critical
            && self.critical <= 1.0;
        if !ordered {
            return Err(format!(
                "risk bands must satisfy 0 < medium < high < critical <= 1 (got {} / {} / {})",
                self.medium, self.high, self.critical
            ));
        }
        Ok(())
    }
}

/// Aggregator tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub bands: BandThresholds,

    /// Minimum final score when any override flag is present
    #[serde(default = "default_override_floor")]
    pub override_floor: f64,

    /// Flags that force the override floor (matched case-insensitively)
    #[serde(default = "default_override_tags")]
    pub override_tags: Vec<String>,

    #[serde(default)]
    pub heuristics: LocalHeuristicsConfig,
}

fn default_override_floor() -> f64 { 0.75 }

fn default_override_tags() -> Vec<String> {
    vec!["lockdown".to_string(), "critical".to_string()]
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bands: BandThresholds::default(),
            override_floor: default_override_floor(),
            override_tags: default_override_tags(),
            heuristics: LocalHeuristicsConfig::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.bands.validate()?;
        if !self.override_floor.is_finite() || !(0.0..=1.0).contains(&self.override_floor) {
            return Err(format!(
                "override_floor must be within [0, 1], got {}",
                self.override_floor
            ));
        }
        if self.override_tags.iter().any(|t| t.trim().is_empty()) {
            return Err("override_tags must not contain empty tags".to_string());
        }
        self.heuristics.validate()
    }

    fn is_override_tag(&self, flag: &str) -> bool {
        self.override_tags
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(flag.trim()))
    }
}

/// Aggregate layer results and local context into a risk map
pub fn aggregate(
    results: &[LayerResult],
    local: &LocalContext,
    weights: &WeightTable,
    config: &AggregatorConfig,
) -> RiskMap {
    let results = canonicalize(results);

    // Normalized weights over ok layers
    let ok_layers: Vec<&LayerResult> = results.iter().filter(|r| r.is_ok()).collect();
    let raw: Vec<(String, f64)> = ok_layers
        .iter()
        .map(|r| {
            let w = weights.get(&r.layer).copied().unwrap_or(1.0);
            let w = if w.is_finite() && w > 0.0 { w } else { 0.0 };
            (r.layer.clone(), w)
        })
        .collect();
    let total: f64 = raw.iter().map(|(_, w)| w).sum();

    let mut weights_used = BTreeMap::new();
    for (layer, w) in raw {
        let normalized = if total > 0.0 {
            w / total
        } else {
            1.0 / ok_layers.len() as f64
        };
        weights_used.insert(layer, normalized);
    }

    let mut base_score = 0.0;
    for r in &ok_layers {
        base_score += weights_used.get(&r.layer).copied().unwrap_or(0.0) * r.score;
    }
    let base_score = clamp_unit(base_score);

    // Local heuristics, in tag order
    let mut contributions = LocalHeuristics::new(config.heuristics.clone()).contributions(local);
    contributions.sort_by(|a, b| a.tag.cmp(&b.tag));
    let local_score: f64 = contributions.iter().map(|c| c.value).sum();

    let mut final_score = clamp_unit(base_score + local_score);

    // Override flags from any layer that answered
    let mut overrides: Vec<String> = results
        .iter()
        .filter(|r| r.status != LayerStatus::Unreachable)
        .flat_map(|r| {
            r.flags
                .iter()
                .filter(|f| config.is_override_tag(f))
                .map(move |f| format!("{}:{}", r.layer, f.trim().to_lowercase()))
        })
        .collect();
    overrides.sort();
    overrides.dedup();

    if !overrides.is_empty() {
        final_score = final_score.max(clamp_unit(config.override_floor));
    }

    let any_ok = !ok_layers.is_empty();
    let is_degraded = !any_ok || results.iter().any(|r| !r.is_ok());
    let level = if any_ok {
        config.bands.level_for(final_score)
    } else {
        RiskLevel::Unknown
    };

    let mut factors = Vec::new();
    for r in &results {
        match r.status {
            LayerStatus::Ok if r.score > 0.0 => factors.push(format!("layer:{}", r.layer)),
            LayerStatus::Ok => {}
            status => factors.push(format!("layer:{}:{}", r.layer, status)),
        }
        if r.status != LayerStatus::Unreachable {
            for flag in &r.flags {
                factors.push(format!("flag:{}:{}", r.layer, flag.trim().to_lowercase()));
            }
        }
    }
    factors.extend(contributions.into_iter().map(|c| c.tag));
    factors.extend(overrides.iter().map(|o| format!("override:{}", o)));
    if !any_ok {
        factors.push("blind".to_string());
    }
    factors.sort();
    factors.dedup();

    RiskMap {
        results,
        weights_used,
        base_score,
        local_score,
        final_score,
        level,
        is_degraded,
        overrides,
        factors,
    }
}

/// Collapse duplicates to the most conservative result per layer and sort by layer
fn canonicalize(results: &[LayerResult]) -> Vec<LayerResult> {
    let mut by_layer: BTreeMap<&str, Vec<&LayerResult>> = BTreeMap::new();
    for r in results {
        by_layer.entry(r.layer.as_str()).or_default().push(r);
    }

    by_layer
        .into_values()
        .filter_map(|group| {
            let mut chosen = group.iter().copied().max_by(|a, b| conservative_cmp(a, b))?.clone();
            if group.len() > 1 {
                let mut flags: Vec<String> = group
                    .iter()
                    .filter(|r| r.status != LayerStatus::Unreachable)
                    .flat_map(|r| r.flags.iter().cloned())
                    .collect();
                flags.sort();
                flags.dedup();
                chosen.flags = flags;
            }
            Some(chosen)
        })
        .collect()
}

/// Higher score first, then the less healthy status, then stable tie-breaks
fn conservative_cmp(a: &LayerResult, b: &LayerResult) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then(a.status.cmp(&b.status))
        .then(a.detail.cmp(&b.detail))
        .then(a.latency_ms.cmp(&b.latency_ms))
        .then(a.observed_at.cmp(&b.observed_at))
        .then(a.flags.cmp(&b.flags))
        .then_with(|| metrics_key(a).cmp(&metrics_key(b)))
}

fn metrics_key(result: &LayerResult) -> String {
    serde_json::to_string(&result.metrics).unwrap_or_default()
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
