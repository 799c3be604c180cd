//! SFCFlow - NFV control plane for email-security service function chains
//!
//! The orchestrator decides at runtime how many instances of each virtual
//! network function (VNF) to run, how traffic flows between them, and when to
//! scale instances up or down so that chained requests meet latency and
//! acceptance objectives under changing load.
//!
//! The decision loop is built from four subsystems:
//! - VNF lifecycle and scaling ([`driver`], [`scaling`])
//! - SFC allocation and flow steering ([`chain`], [`flow`])
//! - Seasonal ARIMA load forecasting ([`forecast`])
//! - A dueling DQN learning agent with prioritized replay ([`agent`])

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod agent;
pub mod chain;
pub mod config;
pub mod driver;
pub mod flow;
pub mod forecast;
pub mod metrics;
pub mod orchestrator;
pub mod scaling;
pub mod scenarios;
pub mod vnf;

use uuid::Uuid;

/// Stable identifier of a running VNF instance.
pub type InstanceId = Uuid;
/// Identifier of an installed flow-steering rule.
pub type FlowId = Uuid;
/// Identifier of a realized service function chain.
pub type ChainId = Uuid;
/// Identifier of an incoming chain request.
pub type RequestId = Uuid;

pub use config::OrchestratorConfig;
pub use orchestrator::Orchestrator;
pub use vnf::{HealthState, Instance, MetricKind, VnfType};
