//! Guardian Shield Library
//!
//! Risk-decision engine for wallet actions: concurrent shield-layer signals,
//! guardian policy verdicts and multi-party approvals.

pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod guardian;
pub mod shield;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Decision, Orchestrator};
pub use error::{Error, Result};
pub use guardian::{Verdict, VerdictKind};
pub use shield::{ActionKind, ActionRequest, RiskLevel, RiskMap};
