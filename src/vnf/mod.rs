//! VNF catalogue and instance data model
//!
//! The set of VNF types is closed for a given run; the `vnf_types`
//! configuration key selects which members of the catalogue are enabled.

pub mod instance;
pub mod pool;

pub use instance::{HealthState, Instance, InstanceMetrics};
pub use pool::{InstancePool, PoolError, PoolLimits};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Virtual network functions in the email-security catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VnfType {
    /// Perimeter packet filtering
    #[serde(rename = "firewall")]
    Firewall,
    /// TLS/SMIME encryption gateway
    #[serde(rename = "encryption")]
    Encryption,
    /// Spam classification
    #[serde(rename = "spamfilter")]
    SpamFilter,
    /// Attachment and body content inspection
    #[serde(rename = "content-filter")]
    ContentFilter,
    /// Final mail delivery agent
    #[serde(rename = "mail")]
    Mail,
}

impl VnfType {
    /// Every catalogued type, in canonical chain order.
    pub const ALL: [VnfType; 5] = [
        VnfType::Firewall,
        VnfType::Encryption,
        VnfType::SpamFilter,
        VnfType::ContentFilter,
        VnfType::Mail,
    ];

    /// Stable lowercase tag used in metrics labels and HTTP paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            VnfType::Firewall => "firewall",
            VnfType::Encryption => "encryption",
            VnfType::SpamFilter => "spamfilter",
            VnfType::ContentFilter => "content-filter",
            VnfType::Mail => "mail",
        }
    }

    /// Container image for this function.
    pub fn image(&self) -> &'static str {
        match self {
            VnfType::Firewall => "sfcflow/vnf-firewall:latest",
            VnfType::Encryption => "sfcflow/vnf-encryption:latest",
            VnfType::SpamFilter => "sfcflow/vnf-spamfilter:latest",
            VnfType::ContentFilter => "sfcflow/vnf-content-filter:latest",
            VnfType::Mail => "sfcflow/vnf-mail:latest",
        }
    }
}

impl fmt::Display for VnfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VnfType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firewall" => Ok(VnfType::Firewall),
            "encryption" => Ok(VnfType::Encryption),
            "spamfilter" => Ok(VnfType::SpamFilter),
            "content-filter" => Ok(VnfType::ContentFilter),
            "mail" => Ok(VnfType::Mail),
            other => Err(format!("unknown vnf type: {other}")),
        }
    }
}

/// Metrics tracked per VNF type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// CPU utilization, percent
    Cpu,
    /// Memory utilization, percent
    Memory,
    /// Processing latency, milliseconds
    Latency,
    /// Request throughput, requests per second
    Throughput,
}

impl MetricKind {
    /// Every tracked metric.
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Latency,
        MetricKind::Throughput,
    ];

    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Latency => "latency",
            MetricKind::Throughput => "throughput",
        }
    }

    /// Whether per-instance values aggregate by sum (throughput) or mean.
    pub fn aggregates_by_sum(&self) -> bool {
        matches!(self, MetricKind::Throughput)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vnf_type_round_trips_through_str() {
        for vnf in VnfType::ALL {
            assert_eq!(vnf.as_str().parse::<VnfType>().unwrap(), vnf);
        }
    }

    #[test]
    fn serde_uses_kebab_tags() {
        let json = serde_json::to_string(&VnfType::ContentFilter).unwrap();
        assert_eq!(json, "\"content-filter\"");
    }
}
