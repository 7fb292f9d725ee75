//! Shield bridge: packets, signal layers and risk aggregation
//!
//! An action request becomes a `RiskPacket`, every registered layer is asked
//! about it through a `SignalClient`, and the answers are folded into a
//! deterministic `RiskMap` together with local heuristics.

pub mod aggregator;
pub mod client;
pub mod heuristics;
pub mod packet;
pub mod registry;
pub mod types;

// Re-exports
pub use aggregator::{aggregate, AggregatorConfig, BandThresholds};
pub use client::{HttpSignalClient, SignalClient, StaticSignalClient, UnavailableSignalClient};
pub use heuristics::{CounterpartyTrust, DeviceKind, DevicePosture, LocalContext, LocalHeuristics};
pub use packet::{build_packet, ActionRequest};
pub use registry::SignalRegistry;
pub use types::{
    ActionKind, ClientKind, FlowType, LayerEnvelope, LayerResult, LayerStatus, RiskLevel, RiskMap,
    RiskPacket, WeightTable,
};
