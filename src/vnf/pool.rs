//! Per-type instance pool
//!
//! The pool is the authoritative table of instances. It owns the pool-bound
//! invariants, per-instance reservation counters, the back-index from
//! instance to referencing chains, and the per-type scale cooldown stamps.
//! Cooldown checks take the same lock as the instance table so two control
//! ticks cannot both begin a scale action for one type.

use crate::vnf::{HealthState, Instance, InstanceMetrics, VnfType};
use crate::{ChainId, InstanceId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Pool operation errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Unknown instance id
    #[error("instance not found: {id}")]
    NotFound {
        /// Offending id
        id: InstanceId,
    },

    /// Illegal lifecycle transition
    #[error("instance {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Offending id
        id: InstanceId,
        /// Current state
        from: HealthState,
        /// Requested state
        to: HealthState,
    },

    /// Adding an instance would exceed max_instances
    #[error("{vnf_type}: pool already at max_instances ({max})")]
    MaxInstances {
        /// Affected type
        vnf_type: VnfType,
        /// Configured bound
        max: u32,
    },

    /// Draining an instance would drop the pool below min_instances
    #[error("{vnf_type}: pool would fall below min_instances ({min})")]
    MinInstances {
        /// Affected type
        vnf_type: VnfType,
        /// Configured bound
        min: u32,
    },

    /// Removing a draining instance while no active instance exists
    #[error("{vnf_type}: cannot remove draining instance with no active instance left")]
    NoActiveRemaining {
        /// Affected type
        vnf_type: VnfType,
    },

    /// Reservation would exceed the per-instance concurrency cap
    #[error("instance {id}: reservation cap ({cap}) reached")]
    ReservationCap {
        /// Offending id
        id: InstanceId,
        /// Configured cap
        cap: u32,
    },

    /// A scale operation for this type is already in flight
    #[error("{vnf_type}: scale operation already in flight")]
    ScaleInFlight {
        /// Affected type
        vnf_type: VnfType,
    },

    /// Cooldown since the last scale action has not elapsed
    #[error("{vnf_type}: cooldown active for another {remaining:?}")]
    Cooldown {
        /// Affected type
        vnf_type: VnfType,
        /// Time until the cooldown expires
        remaining: Duration,
    },
}

/// Instance-count bounds applied per VNF type.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Lower bound on |active ∪ starting|
    pub min: u32,
    /// Upper bound on |active ∪ starting|
    pub max: u32,
}

#[derive(Default)]
struct PoolInner {
    instances: HashMap<InstanceId, Instance>,
    reservations: HashMap<InstanceId, u32>,
    chain_index: HashMap<InstanceId, HashSet<ChainId>>,
    last_scale: HashMap<VnfType, Instant>,
    scaling_in_flight: HashSet<VnfType>,
}

impl PoolInner {
    fn serving_count(&self, vnf_type: VnfType) -> u32 {
        self.instances
            .values()
            .filter(|i| {
                i.vnf_type == vnf_type
                    && matches!(i.state, HealthState::Starting | HealthState::Active)
            })
            .count() as u32
    }

    fn active_count(&self, vnf_type: VnfType) -> u32 {
        self.instances
            .values()
            .filter(|i| i.vnf_type == vnf_type && i.state == HealthState::Active)
            .count() as u32
    }
}

/// Authoritative, lock-guarded instance table.
pub struct InstancePool {
    limits: PoolLimits,
    concurrency_cap: u32,
    inner: RwLock<PoolInner>,
}

impl InstancePool {
    /// Create an empty pool.
    pub fn new(limits: PoolLimits, concurrency_cap: u32) -> Self {
        Self {
            limits,
            concurrency_cap,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Configured bounds.
    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Register a freshly launched instance.
    pub fn insert(&self, instance: Instance) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        if inner.serving_count(instance.vnf_type) >= self.limits.max {
            return Err(PoolError::MaxInstances {
                vnf_type: instance.vnf_type,
                max: self.limits.max,
            });
        }
        inner.instances.insert(instance.id, instance);
        Ok(())
    }

    /// Apply a lifecycle transition, enforcing pool-bound invariants.
    pub fn transition(&self, id: InstanceId, to: HealthState) -> Result<Instance, PoolError> {
        let mut inner = self.inner.write();
        let (vnf_type, from) = {
            let instance = inner
                .instances
                .get(&id)
                .ok_or(PoolError::NotFound { id })?;
            (instance.vnf_type, instance.state)
        };
        if !from.can_transition(to) {
            return Err(PoolError::InvalidTransition { id, from, to });
        }
        match to {
            HealthState::Draining => {
                // Draining stops counting toward min; refuse if that empties
                // the serving set below the floor.
                if inner.serving_count(vnf_type) <= self.limits.min {
                    return Err(PoolError::MinInstances {
                        vnf_type,
                        min: self.limits.min,
                    });
                }
            }
            HealthState::Removed if from == HealthState::Draining => {
                if inner.active_count(vnf_type) == 0 {
                    return Err(PoolError::NoActiveRemaining { vnf_type });
                }
            }
            _ => {}
        }
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(PoolError::NotFound { id })?;
        instance.state = to;
        Ok(instance.clone())
    }

    /// Drop a removed instance from the table entirely.
    pub fn purge(&self, id: InstanceId) -> Option<Instance> {
        let mut inner = self.inner.write();
        let gone = inner.instances.remove(&id);
        inner.reservations.remove(&id);
        inner.chain_index.remove(&id);
        gone
    }

    /// Look up one instance.
    pub fn get(&self, id: InstanceId) -> Option<Instance> {
        self.inner.read().instances.get(&id).cloned()
    }

    /// Snapshot of every instance of one type.
    pub fn list(&self, vnf_type: VnfType) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| i.vnf_type == vnf_type)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    /// Snapshot of the whole table.
    pub fn snapshot(&self) -> Vec<Instance> {
        self.inner.read().instances.values().cloned().collect()
    }

    /// |active ∪ starting| for one type.
    pub fn serving_count(&self, vnf_type: VnfType) -> u32 {
        self.inner.read().serving_count(vnf_type)
    }

    /// Number of active instances for one type.
    pub fn active_count(&self, vnf_type: VnfType) -> u32 {
        self.inner.read().active_count(vnf_type)
    }

    /// Store the latest scrape sample and clear the failure streak.
    pub fn record_sample(&self, id: InstanceId, metrics: InstanceMetrics) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(PoolError::NotFound { id })?;
        instance.metrics = Some(metrics);
        instance.probe_failures = 0;
        Ok(())
    }

    /// Count one failed probe; returns the new streak length.
    pub fn record_probe_failure(&self, id: InstanceId) -> Result<u32, PoolError> {
        let mut inner = self.inner.write();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(PoolError::NotFound { id })?;
        instance.probe_failures += 1;
        Ok(instance.probe_failures)
    }

    /// Atomically reserve a slot on each listed instance, or none of them.
    pub fn try_reserve(&self, ids: &[InstanceId]) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        for id in ids {
            if !inner.instances.contains_key(id) {
                return Err(PoolError::NotFound { id: *id });
            }
            // Reserving the same instance at multiple chain hops counts
            // each hop against the cap.
            let pending = ids.iter().filter(|other| *other == id).count() as u32;
            let current = inner.reservations.get(id).copied().unwrap_or(0);
            if current + pending > self.concurrency_cap {
                return Err(PoolError::ReservationCap {
                    id: *id,
                    cap: self.concurrency_cap,
                });
            }
        }
        for id in ids {
            *inner.reservations.entry(*id).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Release previously held reservations.
    pub fn release(&self, ids: &[InstanceId]) {
        let mut inner = self.inner.write();
        for id in ids {
            if let Some(count) = inner.reservations.get_mut(id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.reservations.remove(id);
                }
            }
        }
    }

    /// Current reservation count on one instance.
    pub fn reservation_count(&self, id: InstanceId) -> u32 {
        self.inner.read().reservations.get(&id).copied().unwrap_or(0)
    }

    /// Record that a chain references these instances.
    pub fn link_chain(&self, chain_id: ChainId, ids: &[InstanceId]) {
        let mut inner = self.inner.write();
        for id in ids {
            inner.chain_index.entry(*id).or_default().insert(chain_id);
        }
    }

    /// Drop a chain from the back-index.
    pub fn unlink_chain(&self, chain_id: ChainId, ids: &[InstanceId]) {
        let mut inner = self.inner.write();
        for id in ids {
            if let Some(chains) = inner.chain_index.get_mut(id) {
                chains.remove(&chain_id);
                if chains.is_empty() {
                    inner.chain_index.remove(id);
                }
            }
        }
    }

    /// Whether any active chain references an instance of this type.
    pub fn chains_reference_type(&self, vnf_type: VnfType) -> bool {
        let inner = self.inner.read();
        inner.instances.values().any(|i| {
            i.vnf_type == vnf_type
                && inner
                    .chain_index
                    .get(&i.id)
                    .map(|chains| !chains.is_empty())
                    .unwrap_or(false)
        })
    }

    /// Number of chains referencing one instance.
    pub fn chains_on_instance(&self, id: InstanceId) -> usize {
        self.inner
            .read()
            .chain_index
            .get(&id)
            .map(|chains| chains.len())
            .unwrap_or(0)
    }

    /// Claim the scale slot for a type: fails if another scale operation is
    /// in flight or the cooldown since the last action has not elapsed.
    pub fn try_begin_scale(&self, vnf_type: VnfType, cooldown: Duration) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        if inner.scaling_in_flight.contains(&vnf_type) {
            return Err(PoolError::ScaleInFlight { vnf_type });
        }
        if let Some(last) = inner.last_scale.get(&vnf_type) {
            let elapsed = last.elapsed();
            if elapsed < cooldown {
                return Err(PoolError::Cooldown {
                    vnf_type,
                    remaining: cooldown - elapsed,
                });
            }
        }
        inner.scaling_in_flight.insert(vnf_type);
        Ok(())
    }

    /// Release the scale slot; `acted` stamps the cooldown clock.
    pub fn finish_scale(&self, vnf_type: VnfType, acted: bool) {
        let mut inner = self.inner.write();
        inner.scaling_in_flight.remove(&vnf_type);
        if acted {
            inner.last_scale.insert(vnf_type, Instant::now());
        }
    }

    /// Remaining cooldown for a type, if any.
    pub fn cooldown_remaining(&self, vnf_type: VnfType, cooldown: Duration) -> Option<Duration> {
        let inner = self.inner.read();
        inner.last_scale.get(&vnf_type).and_then(|last| {
            let elapsed = last.elapsed();
            (elapsed < cooldown).then(|| cooldown - elapsed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pool() -> InstancePool {
        InstancePool::new(PoolLimits { min: 1, max: 3 }, 2)
    }

    fn launch(pool: &InstancePool, vnf_type: VnfType) -> InstanceId {
        let id = Uuid::new_v4();
        pool.insert(Instance::launched(id, vnf_type, format!("ctr-{id}")))
            .unwrap();
        id
    }

    fn activate(pool: &InstancePool, id: InstanceId) {
        pool.transition(id, HealthState::Active).unwrap();
    }

    #[test]
    fn max_bound_enforced() {
        let pool = pool();
        for _ in 0..3 {
            launch(&pool, VnfType::Firewall);
        }
        let overflow = Instance::launched(Uuid::new_v4(), VnfType::Firewall, "ctr".into());
        assert!(matches!(
            pool.insert(overflow),
            Err(PoolError::MaxInstances { .. })
        ));
        // Other types are unaffected.
        launch(&pool, VnfType::Mail);
    }

    #[test]
    fn min_bound_blocks_drain() {
        let pool = pool();
        let id = launch(&pool, VnfType::SpamFilter);
        activate(&pool, id);
        assert!(matches!(
            pool.transition(id, HealthState::Draining),
            Err(PoolError::MinInstances { .. })
        ));
    }

    #[test]
    fn drain_allowed_above_min() {
        let pool = pool();
        let a = launch(&pool, VnfType::SpamFilter);
        let b = launch(&pool, VnfType::SpamFilter);
        activate(&pool, a);
        activate(&pool, b);
        pool.transition(a, HealthState::Draining).unwrap();
        // One active instance remains, so removal is legal.
        pool.transition(a, HealthState::Removed).unwrap();
    }

    #[test]
    fn illegal_transitions_rejected() {
        let pool = pool();
        let id = launch(&pool, VnfType::Firewall);
        assert!(matches!(
            pool.transition(id, HealthState::Draining),
            Err(PoolError::InvalidTransition { .. })
        ));
        activate(&pool, id);
        assert!(matches!(
            pool.transition(id, HealthState::Active),
            Err(PoolError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reservations_are_all_or_nothing() {
        let pool = pool();
        let a = launch(&pool, VnfType::Firewall);
        let b = launch(&pool, VnfType::Mail);
        pool.try_reserve(&[a, b]).unwrap();
        pool.try_reserve(&[a, b]).unwrap();
        // Cap is 2, so a third reservation fails and must not bump b.
        assert!(matches!(
            pool.try_reserve(&[a, b]),
            Err(PoolError::ReservationCap { .. })
        ));
        assert_eq!(pool.reservation_count(a), 2);
        assert_eq!(pool.reservation_count(b), 2);
        pool.release(&[a, b]);
        assert_eq!(pool.reservation_count(a), 1);
    }

    #[test]
    fn duplicate_hops_count_against_cap() {
        let pool = pool();
        let a = launch(&pool, VnfType::Firewall);
        assert!(pool.try_reserve(&[a, a, a]).is_err());
        assert_eq!(pool.reservation_count(a), 0);
    }

    #[test]
    fn scale_slot_serializes_and_cools_down() {
        let pool = pool();
        let cooldown = Duration::from_secs(60);
        pool.try_begin_scale(VnfType::Firewall, cooldown).unwrap();
        assert!(matches!(
            pool.try_begin_scale(VnfType::Firewall, cooldown),
            Err(PoolError::ScaleInFlight { .. })
        ));
        // Cross-type scaling proceeds concurrently.
        pool.try_begin_scale(VnfType::Mail, cooldown).unwrap();
        pool.finish_scale(VnfType::Firewall, true);
        assert!(matches!(
            pool.try_begin_scale(VnfType::Firewall, cooldown),
            Err(PoolError::Cooldown { .. })
        ));
        assert!(pool.cooldown_remaining(VnfType::Firewall, cooldown).is_some());
    }

    #[test]
    fn chain_back_index_tracks_references() {
        let pool = pool();
        let a = launch(&pool, VnfType::Firewall);
        let chain = Uuid::new_v4();
        assert!(!pool.chains_reference_type(VnfType::Firewall));
        pool.link_chain(chain, &[a]);
        assert!(pool.chains_reference_type(VnfType::Firewall));
        assert_eq!(pool.chains_on_instance(a), 1);
        pool.unlink_chain(chain, &[a]);
        assert!(!pool.chains_reference_type(VnfType::Firewall));
    }
}
