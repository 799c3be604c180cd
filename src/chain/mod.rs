//! Service function chains
//!
//! Chain requests name an ordered list of VNF types; the allocator binds
//! them to concrete instances and flow rules. The catalogue of
//! email-security chain categories and the synthetic demand source used by
//! the test subcommands live here too.

pub mod allocator;
pub mod catalog;
pub mod demand;

pub use allocator::{AllocationError, SfcAllocator};
pub use catalog::ChainCategory;
pub use demand::DemandGenerator;

use crate::vnf::VnfType;
use crate::{ChainId, FlowId, InstanceId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key overriding the reverse chain order of a bidirectional
/// request: a comma-separated list of VNF type tags.
pub const REVERSE_ORDER_KEY: &str = "reverse_order";

/// An immutable chain request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRequest {
    /// Request identifier
    pub request_id: RequestId,
    /// Ordered VNF types the traffic must traverse
    pub chain: Vec<VnfType>,
    /// Priority 1-10, higher is more urgent
    pub priority: u8,
    /// Whether a complementary reverse chain must be allocated too
    pub bidirectional: bool,
    /// Free-form metadata; see [`REVERSE_ORDER_KEY`]
    pub metadata: HashMap<String, String>,
}

impl ChainRequest {
    /// A unidirectional request over `chain`.
    pub fn new(chain: Vec<VnfType>, priority: u8) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4(),
            chain,
            priority: priority.clamp(1, 10),
            bidirectional: false,
            metadata: HashMap::new(),
        }
    }

    /// Mark the request bidirectional.
    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    /// The reverse traversal order: the metadata override when present and
    /// parseable, otherwise the chain reversed.
    pub fn reverse_order(&self) -> Vec<VnfType> {
        if let Some(raw) = self.metadata.get(REVERSE_ORDER_KEY) {
            let parsed: Result<Vec<VnfType>, _> =
                raw.split(',').map(|tag| tag.trim().parse()).collect();
            if let Ok(order) = parsed {
                if !order.is_empty() {
                    return order;
                }
            }
        }
        self.chain.iter().rev().copied().collect()
    }
}

/// Lifecycle status of a realized chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Serving traffic
    Active,
    /// Allocation failed
    Failed,
    /// Explicitly torn down
    TornDown,
}

/// A realized chain bound to instances and flow rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInstance {
    /// Chain identifier
    pub chain_id: ChainId,
    /// The originating request
    pub request: ChainRequest,
    /// Forward hop bindings, in traversal order
    pub forward_path: Vec<(VnfType, InstanceId)>,
    /// Reverse hop bindings for bidirectional chains
    pub reverse_path: Option<Vec<(VnfType, InstanceId)>>,
    /// Installed flow rules
    pub flow_rules: Vec<FlowId>,
    /// Current status
    pub status: ChainStatus,
    /// Activation timestamp
    pub started_at: DateTime<Utc>,
    /// Teardown timestamp
    pub stopped_at: Option<DateTime<Utc>>,
    /// Observed end-to-end latency samples, milliseconds
    pub latency_samples: Vec<f64>,
}

impl ChainInstance {
    /// Every instance id the chain references, duplicates preserved.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> =
            self.forward_path.iter().map(|(_, id)| *id).collect();
        if let Some(reverse) = &self.reverse_path {
            ids.extend(reverse.iter().map(|(_, id)| *id));
        }
        ids
    }
}
