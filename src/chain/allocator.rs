//! SFC allocator
//!
//! Maps a chain request to one instance per hop, reserves the instances
//! atomically, installs flow rules in chain order, and tracks the resulting
//! chain. Every failure path rolls installed rules and reservations back
//! before returning, so a failed allocation leaves no trace.

use crate::chain::{ChainInstance, ChainRequest, ChainStatus};
use crate::flow::FlowController;
use crate::metrics::registry::Instruments;
use crate::metrics::series::MetricHistory;
use crate::vnf::{HealthState, InstancePool, MetricKind, VnfType};
use crate::{ChainId, InstanceId};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Allocation failures, all surfaced with a structured reason.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// A hop had no healthy instance, a reservation cap was hit, or a
    /// flow install failed
    #[error("no capacity: {reason}")]
    NoCapacity {
        /// Which step failed
        reason: String,
    },

    /// Chain admission is suspended
    #[error("orchestrator is in safe mode, chain admission suspended")]
    SafeMode,

    /// Unknown chain id
    #[error("chain not found: {chain_id}")]
    NotFound {
        /// Offending id
        chain_id: ChainId,
    },
}

/// Delta of chain outcomes since the last control tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcomes {
    /// Requests satisfied
    pub satisfied: u64,
    /// Requests dropped
    pub dropped: u64,
}

/// The allocator: chain table plus admission bookkeeping.
pub struct SfcAllocator {
    pool: Arc<InstancePool>,
    flow: Arc<FlowController>,
    instruments: Instruments,
    chains: RwLock<HashMap<ChainId, ChainInstance>>,
    safe_mode: AtomicBool,
    satisfied: AtomicU64,
    dropped: AtomicU64,
    last_satisfied: AtomicU64,
    last_dropped: AtomicU64,
    arrivals: Mutex<[usize; 10]>,
    rule_seq: AtomicU32,
}

impl SfcAllocator {
    /// Build an allocator over the shared pool and flow controller.
    pub fn new(
        pool: Arc<InstancePool>,
        flow: Arc<FlowController>,
        instruments: Instruments,
    ) -> Self {
        Self {
            pool,
            flow,
            instruments,
            chains: RwLock::new(HashMap::new()),
            safe_mode: AtomicBool::new(false),
            satisfied: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_satisfied: AtomicU64::new(0),
            last_dropped: AtomicU64::new(0),
            arrivals: Mutex::new([0; 10]),
            rule_seq: AtomicU32::new(0),
        }
    }

    /// Rule priority for one hop: the request priority selects a band of
    /// one thousand slots and a running sequence keeps concurrent chains
    /// from colliding on the same (instance, priority) pair.
    fn derive_priority(&self, request_priority: u8) -> u16 {
        let seq = self.rule_seq.fetch_add(1, Ordering::Relaxed) % 1000;
        u16::from(request_priority.clamp(1, 10)) * 1000 + seq as u16
    }

    /// Whether chain admission is currently suspended.
    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    /// Suspend chain admission, preserving existing chains.
    pub fn enter_safe_mode(&self, reason: &str) {
        if !self.safe_mode.swap(true, Ordering::SeqCst) {
            error!(reason, "entering safe mode: no new chain allocations");
            self.instruments.safe_mode.with_label_values(&[]).set(1.0);
        }
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .sfc_requests_total
            .with_label_values(&["dropped"])
            .inc();
    }

    /// Allocate a chain for `request`.
    pub fn allocate(&self, request: ChainRequest) -> Result<ChainId, AllocationError> {
        {
            let mut arrivals = self.arrivals.lock();
            arrivals[usize::from(request.priority.clamp(1, 10)) - 1] += 1;
        }
        if self.in_safe_mode() {
            self.record_drop();
            return Err(AllocationError::SafeMode);
        }

        // Pick a target for every hop before touching any shared state.
        let mut forward_path = Vec::with_capacity(request.chain.len());
        for vnf_type in &request.chain {
            match self.flow.next_instance(*vnf_type) {
                Some(instance) => forward_path.push((*vnf_type, instance.id)),
                None => {
                    self.record_drop();
                    return Err(AllocationError::NoCapacity {
                        reason: format!("no healthy {vnf_type} instance"),
                    });
                }
            }
        }
        let reverse_path: Option<Vec<(VnfType, InstanceId)>> = if request.bidirectional {
            let mut hops = Vec::new();
            for vnf_type in request.reverse_order() {
                match self.flow.next_instance(vnf_type) {
                    Some(instance) => hops.push((vnf_type, instance.id)),
                    None => {
                        self.record_drop();
                        return Err(AllocationError::NoCapacity {
                            reason: format!("no healthy {vnf_type} instance for reverse chain"),
                        });
                    }
                }
            }
            Some(hops)
        } else {
            None
        };

        // Reserve every hop atomically, counting duplicate hops twice.
        let mut all_ids: Vec<InstanceId> =
            forward_path.iter().map(|(_, id)| *id).collect();
        if let Some(reverse) = &reverse_path {
            all_ids.extend(reverse.iter().map(|(_, id)| *id));
        }
        if let Err(err) = self.pool.try_reserve(&all_ids) {
            self.record_drop();
            return Err(AllocationError::NoCapacity {
                reason: err.to_string(),
            });
        }

        // Install rules along the chain; any failure unwinds completely.
        let chain_id = uuid::Uuid::new_v4();
        let mut installed = Vec::with_capacity(all_ids.len());
        let hops = forward_path
            .iter()
            .chain(reverse_path.iter().flatten());
        for (vnf_type, instance_id) in hops {
            let priority = self.derive_priority(request.priority);
            match self
                .flow
                .add_rule(*vnf_type, *instance_id, priority, Some(chain_id))
            {
                Ok(rule) => installed.push(rule.flow_id),
                Err(err) => {
                    warn!(%chain_id, %err, "flow install failed, rolling back");
                    for flow_id in installed {
                        if let Err(remove_err) = self.flow.remove_rule(flow_id) {
                            error!(%flow_id, %remove_err, "rollback rule removal failed");
                        }
                    }
                    self.pool.release(&all_ids);
                    self.record_drop();
                    return Err(AllocationError::NoCapacity {
                        reason: err.to_string(),
                    });
                }
            }
        }

        // Activation requires every referenced instance to still be active.
        let stale = all_ids.iter().find(|id| {
            self.pool
                .get(**id)
                .map(|i| i.state != HealthState::Active)
                .unwrap_or(true)
        });
        if let Some(instance_id) = stale {
            warn!(%chain_id, %instance_id, "instance left active state during allocation");
            for flow_id in installed {
                let _ = self.flow.remove_rule(flow_id);
            }
            self.pool.release(&all_ids);
            self.record_drop();
            return Err(AllocationError::NoCapacity {
                reason: format!("instance {instance_id} not active"),
            });
        }

        self.pool.link_chain(chain_id, &all_ids);
        let chain = ChainInstance {
            chain_id,
            request,
            forward_path,
            reverse_path,
            flow_rules: installed,
            status: ChainStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            latency_samples: Vec::new(),
        };
        self.chains.write().insert(chain_id, chain);
        self.satisfied.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .sfc_requests_total
            .with_label_values(&["satisfied"])
            .inc();
        info!(%chain_id, "chain active");
        Ok(chain_id)
    }

    /// Tear a chain down: rules out, reservations released, back-index
    /// unlinked.
    pub fn teardown(&self, chain_id: ChainId) -> Result<(), AllocationError> {
        let mut chains = self.chains.write();
        let chain = chains
            .get_mut(&chain_id)
            .ok_or(AllocationError::NotFound { chain_id })?;
        if chain.status != ChainStatus::Active {
            return Ok(());
        }
        let ids = chain.instance_ids();
        // Unlink first so the last-rule guard does not see this chain.
        self.pool.unlink_chain(chain_id, &ids);
        for flow_id in &chain.flow_rules {
            if let Err(err) = self.flow.remove_rule(*flow_id) {
                warn!(%flow_id, %err, "teardown rule removal failed");
            }
        }
        self.pool.release(&ids);
        chain.status = ChainStatus::TornDown;
        chain.stopped_at = Some(Utc::now());
        info!(%chain_id, "chain torn down");
        Ok(())
    }

    /// Record an end-to-end latency observation for one chain.
    pub fn record_latency(&self, chain_id: ChainId, latency_ms: f64) {
        if let Some(chain) = self.chains.write().get_mut(&chain_id) {
            chain.latency_samples.push(latency_ms);
        }
    }

    /// Sample end-to-end latency for every active chain as the sum of its
    /// hops' latest aggregated latencies.
    pub fn observe_latencies(&self, history: &MetricHistory) {
        let mut chains = self.chains.write();
        for chain in chains.values_mut() {
            if chain.status != ChainStatus::Active {
                continue;
            }
            let mut total = 0.0;
            let mut complete = true;
            for (vnf_type, _) in &chain.forward_path {
                match history.latest(*vnf_type, MetricKind::Latency) {
                    Some((_, latency)) => total += latency,
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                chain.latency_samples.push(total);
            }
        }
    }

    /// Snapshot of one chain.
    pub fn get(&self, chain_id: ChainId) -> Option<ChainInstance> {
        self.chains.read().get(&chain_id).cloned()
    }

    /// Number of active chains.
    pub fn active_count(&self) -> usize {
        self.chains
            .read()
            .values()
            .filter(|c| c.status == ChainStatus::Active)
            .count()
    }

    /// Snapshot of every tracked chain.
    pub fn snapshot(&self) -> Vec<ChainInstance> {
        self.chains.read().values().cloned().collect()
    }

    /// Outcome deltas since the previous call, for the reward signal.
    pub fn take_tick_outcomes(&self) -> TickOutcomes {
        let satisfied = self.satisfied.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        let outcomes = TickOutcomes {
            satisfied: satisfied - self.last_satisfied.swap(satisfied, Ordering::Relaxed),
            dropped: dropped - self.last_dropped.swap(dropped, Ordering::Relaxed),
        };
        outcomes
    }

    /// Arrival counts by priority since the previous call, feeding the
    /// agent's pending-demand state features.
    pub fn take_arrivals(&self) -> [usize; 10] {
        std::mem::take(&mut *self.arrivals.lock())
    }

    /// Cross-check the chain table against the pool and flow table; any
    /// inconsistency trips safe mode.
    pub fn verify_integrity(&self) {
        let chains = self.chains.read();
        for chain in chains.values() {
            if chain.status != ChainStatus::Active {
                continue;
            }
            for id in chain.instance_ids() {
                match self.pool.get(id) {
                    Some(instance)
                        if matches!(
                            instance.state,
                            HealthState::Active | HealthState::Draining
                        ) => {}
                    _ => {
                        drop(chains);
                        self.enter_safe_mode("active chain references a removed instance");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::MetricsRegistry;
    use crate::vnf::{Instance, PoolLimits};
    use uuid::Uuid;

    fn fixture() -> (Arc<InstancePool>, Arc<FlowController>, SfcAllocator) {
        let pool = Arc::new(InstancePool::new(PoolLimits { min: 1, max: 8 }, 2));
        let flow = Arc::new(FlowController::new(Arc::clone(&pool)));
        let registry = MetricsRegistry::new().unwrap();
        let instruments = Instruments::register(&registry).unwrap();
        let allocator = SfcAllocator::new(Arc::clone(&pool), Arc::clone(&flow), instruments);
        (pool, flow, allocator)
    }

    fn active_instance(pool: &InstancePool, vnf_type: VnfType) -> InstanceId {
        let id = Uuid::new_v4();
        pool.insert(Instance::launched(id, vnf_type, format!("ctr-{id}")))
            .unwrap();
        pool.transition(id, HealthState::Active).unwrap();
        id
    }

    #[test]
    fn allocates_and_tracks_a_chain() {
        let (pool, flow, allocator) = fixture();
        for vnf_type in [VnfType::Firewall, VnfType::Encryption, VnfType::SpamFilter] {
            active_instance(&pool, vnf_type);
        }
        let request = ChainRequest::new(
            vec![VnfType::Firewall, VnfType::Encryption, VnfType::SpamFilter],
            5,
        );
        let chain_id = allocator.allocate(request).unwrap();
        let chain = allocator.get(chain_id).unwrap();
        assert_eq!(chain.status, ChainStatus::Active);
        assert_eq!(chain.flow_rules.len(), 3);
        assert_eq!(flow.rules_for_chain(chain_id).len(), 3);
        for (_, id) in &chain.forward_path {
            assert_eq!(pool.reservation_count(*id), 1);
            assert_eq!(pool.chains_on_instance(*id), 1);
        }
    }

    #[test]
    fn missing_type_fails_fast() {
        let (pool, _, allocator) = fixture();
        active_instance(&pool, VnfType::Firewall);
        let request = ChainRequest::new(vec![VnfType::Firewall, VnfType::Mail], 5);
        let err = allocator.allocate(request).unwrap_err();
        assert!(matches!(err, AllocationError::NoCapacity { .. }));
        // Nothing was reserved.
        for instance in pool.snapshot() {
            assert_eq!(pool.reservation_count(instance.id), 0);
        }
    }

    #[test]
    fn reservation_cap_reverts_cleanly() {
        let (pool, _, allocator) = fixture();
        let fw = active_instance(&pool, VnfType::Firewall);
        active_instance(&pool, VnfType::Mail);
        // Concurrency cap is 2: two chains fit, the third must bounce.
        for _ in 0..2 {
            allocator
                .allocate(ChainRequest::new(vec![VnfType::Firewall, VnfType::Mail], 5))
                .unwrap();
        }
        let before = pool.reservation_count(fw);
        let err = allocator
            .allocate(ChainRequest::new(vec![VnfType::Firewall, VnfType::Mail], 5))
            .unwrap_err();
        assert!(matches!(err, AllocationError::NoCapacity { .. }));
        assert_eq!(pool.reservation_count(fw), before);
    }

    #[test]
    fn bidirectional_doubles_the_rules() {
        let (pool, flow, allocator) = fixture();
        for vnf_type in [VnfType::Firewall, VnfType::SpamFilter, VnfType::Mail] {
            active_instance(&pool, vnf_type);
        }
        let request = ChainRequest::new(
            vec![VnfType::Firewall, VnfType::SpamFilter, VnfType::Mail],
            4,
        )
        .bidirectional();
        let chain_id = allocator.allocate(request).unwrap();
        let chain = allocator.get(chain_id).unwrap();
        assert_eq!(chain.status, ChainStatus::Active);
        assert_eq!(chain.flow_rules.len(), 6);
        assert_eq!(flow.rules_for_chain(chain_id).len(), 6);
        assert_eq!(
            chain.reverse_path.as_ref().unwrap()[0].0,
            VnfType::Mail
        );
        // Each hop of each direction holds its own reservation.
        for (_, id) in &chain.forward_path {
            assert_eq!(pool.reservation_count(*id), 2);
        }
    }

    #[test]
    fn teardown_releases_everything() {
        let (pool, flow, allocator) = fixture();
        let fw = active_instance(&pool, VnfType::Firewall);
        let mail = active_instance(&pool, VnfType::Mail);
        let chain_id = allocator
            .allocate(ChainRequest::new(vec![VnfType::Firewall, VnfType::Mail], 5))
            .unwrap();
        allocator.teardown(chain_id).unwrap();
        assert_eq!(flow.rules_for_chain(chain_id).len(), 0);
        assert_eq!(pool.reservation_count(fw), 0);
        assert_eq!(pool.reservation_count(mail), 0);
        assert!(!pool.chains_reference_type(VnfType::Firewall));
        assert_eq!(
            allocator.get(chain_id).unwrap().status,
            ChainStatus::TornDown
        );
    }

    #[test]
    fn safe_mode_blocks_admission() {
        let (pool, _, allocator) = fixture();
        active_instance(&pool, VnfType::Firewall);
        allocator.enter_safe_mode("test");
        let err = allocator
            .allocate(ChainRequest::new(vec![VnfType::Firewall], 5))
            .unwrap_err();
        assert!(matches!(err, AllocationError::SafeMode));
    }

    #[test]
    fn integrity_check_trips_safe_mode() {
        let (pool, _, allocator) = fixture();
        let fw = active_instance(&pool, VnfType::Firewall);
        active_instance(&pool, VnfType::Firewall);
        allocator
            .allocate(ChainRequest::new(vec![VnfType::Firewall], 5))
            .unwrap();
        // Corrupt the pool behind the allocator's back.
        pool.purge(fw);
        allocator.verify_integrity();
        // Either the purged instance was the chain's target (safe mode) or
        // the survivor was; only the former corrupts.
        let chain = allocator.snapshot().pop().unwrap();
        let target_removed = pool.get(chain.forward_path[0].1).is_none();
        assert_eq!(allocator.in_safe_mode(), target_removed);
    }
}
