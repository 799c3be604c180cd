//! Synthetic chain-request source
//!
//! Drives the allocator in the test subcommands the way an external mail
//! front end would: Poisson arrivals per tick, category mix weighted toward
//! inbound mail, priorities drawn from a skewed distribution.

use crate::chain::catalog::ChainCategory;
use crate::chain::ChainRequest;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use tracing::debug;

/// Seeded synthetic demand generator.
pub struct DemandGenerator {
    rng: StdRng,
    arrival_rate: f64,
}

impl DemandGenerator {
    /// Generator producing on average `arrival_rate` requests per batch.
    pub fn new(arrival_rate: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            arrival_rate: arrival_rate.max(0.0),
        }
    }

    fn pick_category(&mut self) -> ChainCategory {
        // Inbound mail dominates real email traffic.
        let roll: f64 = self.rng.gen();
        if roll < 0.6 {
            ChainCategory::InboundMail
        } else if roll < 0.9 {
            ChainCategory::OutboundMail
        } else {
            ChainCategory::FullInspection
        }
    }

    fn pick_priority(&mut self) -> u8 {
        // Mostly routine traffic with an occasional urgent request.
        let roll: f64 = self.rng.gen();
        if roll < 0.7 {
            self.rng.gen_range(3..=5)
        } else if roll < 0.95 {
            self.rng.gen_range(6..=8)
        } else {
            self.rng.gen_range(9..=10)
        }
    }

    /// One batch of arrivals.
    pub fn next_batch(&mut self) -> Vec<ChainRequest> {
        if self.arrival_rate <= 0.0 {
            return Vec::new();
        }
        let count = match Poisson::new(self.arrival_rate) {
            Ok(poisson) => poisson.sample(&mut self.rng) as usize,
            Err(_) => 0,
        };
        let batch: Vec<ChainRequest> = (0..count)
            .map(|_| {
                let category = self.pick_category();
                let priority = self.pick_priority();
                category.request(priority)
            })
            .collect();
        debug!(count = batch.len(), "demand batch generated");
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_reproducible_per_seed() {
        let mut a = DemandGenerator::new(3.0, 42);
        let mut b = DemandGenerator::new(3.0, 42);
        for _ in 0..5 {
            let batch_a = a.next_batch();
            let batch_b = b.next_batch();
            assert_eq!(batch_a.len(), batch_b.len());
            for (x, y) in batch_a.iter().zip(&batch_b) {
                assert_eq!(x.chain, y.chain);
                assert_eq!(x.priority, y.priority);
            }
        }
    }

    #[test]
    fn priorities_stay_in_range() {
        let mut generator = DemandGenerator::new(8.0, 7);
        for _ in 0..20 {
            for request in generator.next_batch() {
                assert!((1..=10).contains(&request.priority));
            }
        }
    }
}
