//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::api;
use crate::config::Config;
use crate::engine::{Decision, Orchestrator};
use crate::guardian::approval::Vote;
use crate::guardian::presets::Preset;
use crate::guardian::rules::RuleSet;
use crate::shield::packet::ActionRequest;

/// Run the guardian API until Ctrl-C
pub async fn serve(config: &Config) -> Result<()> {
    let bind: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid server.bind address: {}", config.server.bind))?;

    let engine = Arc::new(Orchestrator::from_config(config).await?);
    let health = engine.health();
    info!(
        rule_set = %health.rule_set_version,
        source = %health.rule_source,
        layers = ?health.layers,
        deadline_ms = health.deadline_ms,
        "Guardian engine ready"
    );
    for diagnostic in &health.diagnostics {
        warn!(diagnostic = %diagnostic, "Policy diagnostic");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let maintenance = engine.spawn_maintenance(
        Duration::from_secs(config.policy.expiry_sweep_secs),
        Duration::from_secs(config.policy.resolved_retention_secs),
        shutdown_tx.subscribe(),
    );
    let _audit_writer = engine.spawn_audit_writer(config.audit.jsonl_path.as_ref().map(PathBuf::from));

    let mut server_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(api::serve(engine.clone(), bind, async move {
        let _ = server_shutdown.recv().await;
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server stopped with an error"),
        Err(e) => error!(error = %e, "API server task failed"),
    }
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task failed");
    }

    info!("Guardian stopped");
    Ok(())
}

/// Evaluate an action request read from a JSON file
pub async fn evaluate(
    config: &Config,
    file: &Path,
    postflight: bool,
    approval_id: Option<&str>,
    json: bool,
) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Cannot read {}", file.display()))?;
    let request: ActionRequest = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid action request", file.display()))?;

    let engine = Orchestrator::from_config(config).await?;
    let decision = if postflight {
        engine.postflight(&request, approval_id).await?
    } else {
        engine.evaluate(&request).await?
    };

    // Keep the approval request around for a later postflight
    if decision.approval.is_some() {
        if let Err(e) = engine.approvals().save().await {
            warn!(error = %e, "Failed to snapshot approval requests");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        print_decision(&decision);
    }
    Ok(())
}

fn print_decision(decision: &Decision) {
    let risk = &decision.risk_map;

    println!("\n=== GUARDIAN DECISION ===\n");
    println!("Verdict: {}", decision.verdict.kind);
    println!("Message: {}", decision.summary.short_message);
    println!("Reasons: {}", decision.verdict.reasons.join(", "));
    if !decision.verdict.rule_ids.is_empty() {
        println!("Rules:   {}", decision.verdict.rule_ids.join(", "));
    }
    println!(
        "Risk:    {:.3} ({}){}",
        risk.final_score,
        risk.level,
        if risk.is_degraded { " DEGRADED" } else { "" }
    );
    println!("Profile: {} (rules {})", decision.profile, decision.rule_set_version);
    println!("Correlation: {}", decision.correlation_id);

    println!("\n=== LAYERS ===\n");
    for result in &risk.results {
        println!(
            "  {:<10} {:<12} score={:.3} {}ms {}",
            result.layer,
            result.status.to_string(),
            result.score,
            result.latency_ms,
            result.flags.join(",")
        );
    }

    if let Some(approval) = &decision.approval {
        let tally = approval.tally();
        println!("\n=== APPROVAL ===\n");
        println!("Request:   {}", approval.id);
        println!("Status:    {}", approval.status);
        println!("Approvals: {}/{}", tally.approved, tally.required);
        println!("Guardians: {}", approval.guardians.join(", "));
        println!("Expires:   {}", approval.expires_at.to_rfc3339());
    }
    println!();
}

/// Show the effective policy for a wallet
pub fn policy(config: &Config, wallet: &str, account: Option<&str>) -> Result<()> {
    let store = crate::guardian::rules::PolicyStore::open(
        config.policy.rules_path.as_deref().map(Path::new),
    );
    for diagnostic in store.diagnostics() {
        warn!(diagnostic = %diagnostic, "Policy diagnostic");
    }
    let view = store.snapshot().effective_policy(wallet, account);
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Validate a rule file without loading it into a running engine
pub fn rules_check(file: &Path) -> Result<()> {
    match RuleSet::from_path(file) {
        Ok(rules) => {
            println!("Rule file OK: {}", file.display());
            println!("  version: {}", rules.version);
            println!("  default profile: {}", rules.default_profile);
            for profile in rules.profiles() {
                println!(
                    "  profile {}: {} rules, {} guardians",
                    profile.name,
                    profile.rules.len(),
                    profile.eligible_guardians(None).len()
                );
            }
            println!("  wallet bindings: {}", rules.bindings().len());
            Ok(())
        }
        Err(e) => {
            error!(path = %file.display(), error = %e, "Rule file rejected");
            anyhow::bail!("Rule file {} is invalid: {}", file.display(), e);
        }
    }
}

/// List the policy presets
pub fn presets() -> Result<()> {
    println!("\n=== POLICY PRESETS ===\n");
    let sample = vec!["guardian-1".to_string(), "guardian-2".to_string()];
    for preset in Preset::ALL {
        println!("{} - {}", preset, preset.description());
        for rule in preset.rules(&sample)? {
            let threshold = rule
                .threshold_value
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<32} {:<16} threshold={} approvals={}",
                rule.id, rule.action, threshold, rule.min_approvals
            );
        }
        println!();
    }
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check engine health, locally or against a running server
pub async fn health(config: &Config, server: Option<&str>) -> Result<()> {
    println!("\n=== GUARDIAN HEALTH CHECK ===\n");

    if let Some(server) = server {
        let url = endpoint(server, "/health")?;
        print!("Guardian API {}... ", url);
        let client = http_client()?;
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                let body: serde_json::Value = response.json().await?;
                println!("OK");
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            Ok(response) => {
                println!("FAILED: HTTP {}", response.status());
                anyhow::bail!("Guardian API is unhealthy");
            }
            Err(e) => {
                println!("FAILED: {}", e);
                anyhow::bail!("Guardian API is unreachable");
            }
        }
        return Ok(());
    }

    let engine = Orchestrator::from_config(config).await?;
    let report = engine.health();
    println!("Version:   {}", report.version);
    println!("Rules:     {} ({})", report.rule_set_version, report.rule_source);
    println!("Layers:    {}", report.layers.join(", "));
    println!("Deadline:  {}ms", report.deadline_ms);
    println!("Pending approvals: {}", report.pending_approvals);

    println!();
    if report.diagnostics.is_empty() {
        println!("Policy healthy!");
    } else {
        for diagnostic in &report.diagnostics {
            println!("WARNING: {}", diagnostic);
        }
        println!("Policy fell back or was partially rejected. Check the warnings above.");
    }
    Ok(())
}

/// Cast a guardian vote on a running server
pub async fn vote(
    config: &Config,
    server: Option<&str>,
    request_id: &str,
    guardian_id: &str,
    vote: Vote,
    reason: Option<String>,
    force: bool,
) -> Result<()> {
    let server = server
        .map(String::from)
        .unwrap_or_else(|| format!("http://{}", config.server.bind));

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "{} request {} as guardian {}? Votes cannot be changed.",
                match vote {
                    Vote::Approve => "Approve",
                    Vote::Reject => "Reject",
                },
                request_id,
                guardian_id
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Vote cancelled by user");
            return Ok(());
        }
    }

    let url = endpoint(&server, &format!("/v0/approvals/{}/vote", request_id))?;
    let body = api::VoteBody {
        guardian_id: guardian_id.to_string(),
        vote,
        reason,
    };
    let response = http_client()?.post(url).json(&body).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() {
        let message = body["error"]["message"].as_str().unwrap_or("unknown error");
        anyhow::bail!("Vote rejected (HTTP {}): {}", status, message);
    }

    println!("\n=== VOTE RECORDED ===\n");
    println!("Request:   {}", request_id);
    println!("Status:    {}", body["request"]["status"].as_str().unwrap_or("?"));
    println!(
        "Approvals: {}/{}",
        body["tally"]["approved"], body["tally"]["required"]
    );
    println!("Authorized: {}", body["authorized"]);
    Ok(())
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")
}

fn endpoint(server: &str, path: &str) -> Result<url::Url> {
    let base = url::Url::parse(server).with_context(|| format!("Invalid server URL: {}", server))?;
    base.join(path)
        .with_context(|| format!("Invalid endpoint path: {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let url = endpoint("http://127.0.0.1:8787", "/v0/approvals/apr_1/vote").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8787/v0/approvals/apr_1/vote");
        assert!(endpoint("not a url", "/health").is_err());
    }

    #[test]
    fn test_rules_check_rejects_missing_file() {
        assert!(rules_check(Path::new("/nonexistent/rules.toml")).is_err());
    }

    #[test]
    fn test_rules_check_accepts_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            r#"
version = "2026-10-01"

[[profiles]]
name = "default"
preset = "balanced"
guardian_ids = ["g1", "g2"]
"#,
        )
        .unwrap();
        rules_check(&path).unwrap();
    }

    #[test]
    fn test_shipped_examples_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        rules_check(&root.join("rules.example.toml")).unwrap();

        let config = Config::load(root.join("guardian.example.toml")).unwrap();
        assert_eq!(config.signals.layers.len(), 5);
        assert_eq!(config.signals.layers["qac"].weight, 0.5);
    }
}
