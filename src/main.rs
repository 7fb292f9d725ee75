//! Guardian Shield - risk-decision engine for wallet actions
//!
//! Every sensitive wallet action is scored by the shield layers and checked
//! against guardian policy before it may proceed.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Use the library crate
use guardian_shield::cli::commands;
use guardian_shield::config::Config;
use guardian_shield::guardian::Vote;

/// Guardian Shield - risk decisions and guardian approvals
#[derive(Parser)]
#[command(name = "guardian")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "guardian.toml", env = "GUARDIAN_CONFIG")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the guardian API server
    Serve,

    /// Evaluate an action request from a JSON file
    Evaluate {
        /// Path to the action request JSON
        file: PathBuf,

        /// Run the postflight check instead of preflight
        #[arg(long)]
        postflight: bool,

        /// Approval request to present during postflight
        #[arg(long, requires = "postflight")]
        approval_id: Option<String>,

        /// Print the full decision as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective policy for a wallet
    Policy {
        /// Wallet id
        #[arg(long)]
        wallet: String,

        /// Account id within the wallet
        #[arg(long)]
        account: Option<String>,
    },

    /// Rule file commands
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// List policy presets
    Presets,

    /// Show current configuration (secrets masked)
    Config,

    /// Check engine health
    Health {
        /// Query a running server instead of the local configuration
        #[arg(long)]
        server: Option<String>,
    },

    /// Vote on a pending approval request
    Vote {
        /// Approval request id
        request_id: String,

        /// Voting guardian id
        #[arg(long)]
        guardian: String,

        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,

        #[arg(long)]
        reject: bool,

        /// Reason recorded with the vote
        #[arg(long)]
        reason: Option<String>,

        /// Guardian API base URL (default: http://<server.bind>)
        #[arg(long)]
        server: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Validate a rule file
    Check {
        /// Rule file (TOML or JSON)
        file: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("guardian_shield=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(config = %cli.config, "Configuration loaded");

    // Execute command
    let result = match cli.command {
        Commands::Serve => commands::serve(&config).await,
        Commands::Evaluate {
            file,
            postflight,
            approval_id,
            json,
        } => commands::evaluate(&config, &file, postflight, approval_id.as_deref(), json).await,
        Commands::Policy { wallet, account } => {
            commands::policy(&config, &wallet, account.as_deref())
        }
        Commands::Rules { action } => match action {
            RulesAction::Check { file } => commands::rules_check(&file),
        },
        Commands::Presets => commands::presets(),
        Commands::Config => commands::show_config(&config),
        Commands::Health { server } => commands::health(&config, server.as_deref()).await,
        Commands::Vote {
            request_id,
            guardian,
            approve,
            reject: _,
            reason,
            server,
            force,
        } => {
            let vote = if approve { Vote::Approve } else { Vote::Reject };
            commands::vote(&config, server.as_deref(), &request_id, &guardian, vote, reason, force).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
