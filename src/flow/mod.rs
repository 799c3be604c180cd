//! Flow-steering rules and load balancing
//!
//! Owns the flow-rule table and one round-robin cursor per VNF type.
//! Rolling updates must add the new instance's rule before removing the old
//! one, so the table never goes empty for a type that is serving chains;
//! [`FlowController::remove_rule`] enforces the receiving half of that
//! discipline.

pub mod http;

use crate::vnf::{HealthState, Instance, InstancePool, VnfType};
use crate::{ChainId, FlowId, InstanceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Flow rule status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Installed and steering traffic
    Active,
    /// Uninstalled
    Removed,
}

/// A flow-steering rule directing traffic of one type to one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRule {
    /// Rule identifier
    pub flow_id: FlowId,
    /// Traffic class
    pub vnf_type: VnfType,
    /// Target instance
    pub instance_id: InstanceId,
    /// Priority, higher wins among rules of equal specificity
    pub priority: u16,
    /// Rule status
    pub status: FlowStatus,
    /// Installation timestamp
    pub created_at: DateTime<Utc>,
    /// Owning chain, absent for rules installed by scaling
    pub chain_id: Option<ChainId>,
}

/// Flow controller errors.
#[derive(Debug, Error)]
pub enum FlowError {
    /// An active rule for this (instance, priority) already exists
    #[error("conflicting rule for instance {instance_id} at priority {priority}")]
    Conflict {
        /// Target instance
        instance_id: InstanceId,
        /// Requested priority
        priority: u16,
    },

    /// Unknown rule id
    #[error("flow rule not found: {flow_id}")]
    NotFound {
        /// Offending id
        flow_id: FlowId,
    },

    /// Refusing to remove the last rule of a type that chains reference
    #[error("{vnf_type}: refusing to remove the last rule while chains reference the type")]
    LastRule {
        /// Affected type
        vnf_type: VnfType,
    },

    /// The target instance does not exist or cannot take new traffic
    #[error("instance {instance_id} is not active")]
    InstanceNotActive {
        /// Target instance
        instance_id: InstanceId,
    },

    /// No active instance available for the type
    #[error("{vnf_type}: no healthy instance")]
    NoHealthyInstance {
        /// Affected type
        vnf_type: VnfType,
    },
}

#[derive(Default)]
struct FlowInner {
    rules: HashMap<FlowId, FlowRule>,
    cursors: HashMap<VnfType, usize>,
}

/// Flow-rule table plus round-robin selection.
pub struct FlowController {
    pool: Arc<InstancePool>,
    inner: RwLock<FlowInner>,
}

impl FlowController {
    /// Create a controller over the given pool.
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self {
            pool,
            inner: RwLock::new(FlowInner::default()),
        }
    }

    /// Install a rule steering `vnf_type` traffic to `instance_id`.
    pub fn add_rule(
        &self,
        vnf_type: VnfType,
        instance_id: InstanceId,
        priority: u16,
        chain_id: Option<ChainId>,
    ) -> Result<FlowRule, FlowError> {
        let instance = self
            .pool
            .get(instance_id)
            .ok_or(FlowError::InstanceNotActive { instance_id })?;
        if instance.state != HealthState::Active || instance.vnf_type != vnf_type {
            return Err(FlowError::InstanceNotActive { instance_id });
        }
        let mut inner = self.inner.write();
        let conflict = inner.rules.values().any(|r| {
            r.status == FlowStatus::Active
                && r.instance_id == instance_id
                && r.priority == priority
        });
        if conflict {
            return Err(FlowError::Conflict {
                instance_id,
                priority,
            });
        }
        let rule = FlowRule {
            flow_id: uuid::Uuid::new_v4(),
            vnf_type,
            instance_id,
            priority,
            status: FlowStatus::Active,
            created_at: Utc::now(),
            chain_id,
        };
        inner.rules.insert(rule.flow_id, rule.clone());
        debug!(flow = %rule.flow_id, %vnf_type, instance = %instance_id, "flow rule installed");
        Ok(rule)
    }

    /// Uninstall one rule. Refuses to remove the last rule of a type that
    /// chains still reference.
    pub fn remove_rule(&self, flow_id: FlowId) -> Result<FlowRule, FlowError> {
        let mut inner = self.inner.write();
        let rule = inner
            .rules
            .get(&flow_id)
            .cloned()
            .ok_or(FlowError::NotFound { flow_id })?;
        let remaining = inner
            .rules
            .values()
            .filter(|r| {
                r.status == FlowStatus::Active
                    && r.vnf_type == rule.vnf_type
                    && r.flow_id != flow_id
            })
            .count();
        if remaining == 0 && self.pool.chains_reference_type(rule.vnf_type) {
            return Err(FlowError::LastRule {
                vnf_type: rule.vnf_type,
            });
        }
        inner.rules.remove(&flow_id);
        let mut removed = rule;
        removed.status = FlowStatus::Removed;
        debug!(flow = %flow_id, "flow rule removed");
        Ok(removed)
    }

    /// Uninstall every rule on one instance, used when draining it.
    /// Checked up front so the call removes all of them or none.
    pub fn remove_rules_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<FlowRule>, FlowError> {
        let mut inner = self.inner.write();
        let doomed: Vec<FlowRule> = inner
            .rules
            .values()
            .filter(|r| r.status == FlowStatus::Active && r.instance_id == instance_id)
            .cloned()
            .collect();
        if let Some(rule) = doomed.first() {
            let survivors = inner
                .rules
                .values()
                .filter(|r| {
                    r.status == FlowStatus::Active
                        && r.vnf_type == rule.vnf_type
                        && r.instance_id != instance_id
                })
                .count();
            if survivors == 0 && self.pool.chains_reference_type(rule.vnf_type) {
                return Err(FlowError::LastRule {
                    vnf_type: rule.vnf_type,
                });
            }
        }
        let mut removed = Vec::with_capacity(doomed.len());
        for mut rule in doomed {
            inner.rules.remove(&rule.flow_id);
            rule.status = FlowStatus::Removed;
            removed.push(rule);
        }
        if !removed.is_empty() {
            info!(instance = %instance_id, count = removed.len(), "instance rules removed");
        }
        Ok(removed)
    }

    /// Active rules, optionally restricted to one type, oldest first.
    pub fn list_rules(&self, vnf_type: Option<VnfType>) -> Vec<FlowRule> {
        let inner = self.inner.read();
        let mut rules: Vec<FlowRule> = inner
            .rules
            .values()
            .filter(|r| {
                r.status == FlowStatus::Active
                    && vnf_type.map(|t| r.vnf_type == t).unwrap_or(true)
            })
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.created_at);
        rules
    }

    /// Active rules installed for one chain.
    pub fn rules_for_chain(&self, chain_id: ChainId) -> Vec<FlowRule> {
        self.inner
            .read()
            .rules
            .values()
            .filter(|r| r.status == FlowStatus::Active && r.chain_id == Some(chain_id))
            .cloned()
            .collect()
    }

    /// Whether an instance holds at least one active rule.
    pub fn instance_has_rules(&self, instance_id: InstanceId) -> bool {
        self.inner
            .read()
            .rules
            .values()
            .any(|r| r.status == FlowStatus::Active && r.instance_id == instance_id)
    }

    /// Round-robin choice of the next active instance for one type,
    /// skipping starting and draining instances.
    ///
    /// Once any rule is installed for the type, only instances wired into
    /// the data plane (holding an active rule) are candidates; before the
    /// first rule exists the allocator may target any active instance.
    pub fn next_instance(&self, vnf_type: VnfType) -> Option<Instance> {
        let instances = self.pool.list(vnf_type);
        let mut inner = self.inner.write();
        let has_rules = inner
            .rules
            .values()
            .any(|r| r.status == FlowStatus::Active && r.vnf_type == vnf_type);
        let candidates: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.state == HealthState::Active)
            .filter(|i| {
                !has_rules
                    || inner.rules.values().any(|r| {
                        r.status == FlowStatus::Active && r.instance_id == i.id
                    })
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let cursor = inner.cursors.entry(vnf_type).or_insert(0);
        let chosen = candidates[*cursor % candidates.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnf::{Instance, PoolLimits};
    use uuid::Uuid;

    fn fixture() -> (Arc<InstancePool>, FlowController) {
        let pool = Arc::new(InstancePool::new(PoolLimits { min: 1, max: 8 }, 8));
        let flow = FlowController::new(Arc::clone(&pool));
        (pool, flow)
    }

    fn active_instance(pool: &InstancePool, vnf_type: VnfType) -> InstanceId {
        let id = Uuid::new_v4();
        pool.insert(Instance::launched(id, vnf_type, format!("ctr-{id}")))
            .unwrap();
        pool.transition(id, HealthState::Active).unwrap();
        id
    }

    #[test]
    fn duplicate_priority_conflicts() {
        let (pool, flow) = fixture();
        let id = active_instance(&pool, VnfType::Firewall);
        flow.add_rule(VnfType::Firewall, id, 5, None).unwrap();
        assert!(matches!(
            flow.add_rule(VnfType::Firewall, id, 5, None),
            Err(FlowError::Conflict { .. })
        ));
        // A different priority on the same instance is fine.
        flow.add_rule(VnfType::Firewall, id, 6, None).unwrap();
    }

    #[test]
    fn last_rule_protected_while_chains_reference() {
        let (pool, flow) = fixture();
        let id = active_instance(&pool, VnfType::SpamFilter);
        let rule = flow.add_rule(VnfType::SpamFilter, id, 5, None).unwrap();
        let chain = Uuid::new_v4();
        pool.link_chain(chain, &[id]);
        assert!(matches!(
            flow.remove_rule(rule.flow_id),
            Err(FlowError::LastRule { .. })
        ));
        pool.unlink_chain(chain, &[id]);
        flow.remove_rule(rule.flow_id).unwrap();
        assert!(flow.list_rules(None).is_empty());
    }

    #[test]
    fn round_robin_skips_draining() {
        let (pool, flow) = fixture();
        let a = active_instance(&pool, VnfType::Mail);
        let b = active_instance(&pool, VnfType::Mail);
        let picks: Vec<InstanceId> = (0..4)
            .map(|_| flow.next_instance(VnfType::Mail).unwrap().id)
            .collect();
        assert!(picks.contains(&a) && picks.contains(&b));
        pool.transition(a, HealthState::Draining).unwrap();
        for _ in 0..4 {
            assert_eq!(flow.next_instance(VnfType::Mail).unwrap().id, b);
        }
    }

    #[test]
    fn balancer_prefers_ruled_instances() {
        let (pool, flow) = fixture();
        let old = active_instance(&pool, VnfType::Firewall);
        flow.add_rule(VnfType::Firewall, old, 5, None).unwrap();
        let new = active_instance(&pool, VnfType::Firewall);
        // New instance is active but not yet wired in.
        for _ in 0..3 {
            assert_eq!(flow.next_instance(VnfType::Firewall).unwrap().id, old);
        }
        flow.add_rule(VnfType::Firewall, new, 5, None).unwrap();
        let picks: Vec<InstanceId> = (0..4)
            .map(|_| flow.next_instance(VnfType::Firewall).unwrap().id)
            .collect();
        assert!(picks.contains(&new));
    }

    #[test]
    fn rules_on_starting_instances_rejected() {
        let (pool, flow) = fixture();
        let id = Uuid::new_v4();
        pool.insert(Instance::launched(id, VnfType::Mail, "ctr".into()))
            .unwrap();
        assert!(matches!(
            flow.add_rule(VnfType::Mail, id, 5, None),
            Err(FlowError::InstanceNotActive { .. })
        ));
    }
}
