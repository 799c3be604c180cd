//! Prioritized experience replay
//!
//! Experiences are sampled with probability proportional to their stored
//! priority |td|^alpha, with importance-sampling weights correcting the
//! induced bias. The buffer is a fixed-capacity ring; new experiences enter
//! at the running maximum priority so they are seen at least once soon.

use rand::Rng;
use serde::{Deserialize, Serialize};

const PRIORITY_FLOOR: f64 = 1e-6;

/// One (s, a, r, s', terminal) transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    /// State vector
    pub state: Vec<f64>,
    /// Chosen action index
    pub action: usize,
    /// Observed reward
    pub reward: f64,
    /// Successor state vector
    pub next_state: Vec<f64>,
    /// Whether the episode ended here
    pub terminal: bool,
}

/// A sampled minibatch with importance-sampling weights.
#[derive(Debug, Clone)]
pub struct SampledBatch {
    /// Buffer slots the batch came from, for priority updates
    pub indices: Vec<usize>,
    /// The sampled transitions
    pub experiences: Vec<Experience>,
    /// Normalized importance-sampling weights, max 1
    pub weights: Vec<f64>,
}

/// Fixed-capacity prioritized ring buffer.
pub struct PrioritizedReplay {
    capacity: usize,
    alpha: f64,
    buffer: Vec<Experience>,
    priorities: Vec<f64>,
    cursor: usize,
    max_priority: f64,
}

impl PrioritizedReplay {
    /// Create a buffer holding at most `capacity` experiences.
    pub fn new(capacity: usize, alpha: f64) -> Self {
        Self {
            capacity,
            alpha,
            buffer: Vec::with_capacity(capacity),
            priorities: Vec::with_capacity(capacity),
            cursor: 0,
            max_priority: 1.0,
        }
    }

    /// Number of stored experiences.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds nothing yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Store one experience at the current maximum priority.
    pub fn push(&mut self, experience: Experience) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(experience);
            self.priorities.push(self.max_priority);
        } else {
            self.buffer[self.cursor] = experience;
            self.priorities[self.cursor] = self.max_priority;
            self.cursor = (self.cursor + 1) % self.capacity;
        }
    }

    /// Sampling probability of one slot, for inspection and tests.
    pub fn probability(&self, index: usize) -> f64 {
        let total: f64 = self.priorities.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.priorities.get(index).copied().unwrap_or(0.0) / total
    }

    /// Draw `batch` experiences with probability proportional to priority.
    pub fn sample<R: Rng>(&self, batch: usize, beta: f64, rng: &mut R) -> SampledBatch {
        let n = self.buffer.len();
        let batch = batch.min(n);
        let total: f64 = self.priorities.iter().sum();
        let mut indices = Vec::with_capacity(batch);
        for _ in 0..batch {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, priority) in self.priorities.iter().enumerate() {
                target -= priority;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            indices.push(chosen);
        }
        let mut weights: Vec<f64> = indices
            .iter()
            .map(|&i| {
                let p = self.priorities[i] / total;
                (n as f64 * p).powf(-beta)
            })
            .collect();
        let max_weight = weights.iter().copied().fold(f64::MIN, f64::max).max(1e-12);
        for w in &mut weights {
            *w /= max_weight;
        }
        SampledBatch {
            experiences: indices.iter().map(|&i| self.buffer[i].clone()).collect(),
            indices,
            weights,
        }
    }

    /// Re-prioritize sampled slots from their fresh TD errors.
    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f64]) {
        for (&index, &td) in indices.iter().zip(td_errors) {
            if let Some(slot) = self.priorities.get_mut(index) {
                let priority = td.abs().powf(self.alpha).max(PRIORITY_FLOOR);
                *slot = priority;
                self.max_priority = self.max_priority.max(priority);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn experience(reward: f64) -> Experience {
        Experience {
            state: vec![0.0; 4],
            action: 0,
            reward,
            next_state: vec![0.0; 4],
            terminal: false,
        }
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut replay = PrioritizedReplay::new(3, 0.6);
        for i in 0..5 {
            replay.push(experience(i as f64));
        }
        assert_eq!(replay.len(), 3);
        let rewards: Vec<f64> = replay.buffer.iter().map(|e| e.reward).collect();
        assert!(rewards.contains(&4.0));
        assert!(!rewards.contains(&0.0));
    }

    #[test]
    fn sampling_probability_tracks_priority() {
        let alpha = 0.6;
        let mut replay = PrioritizedReplay::new(8, alpha);
        for _ in 0..4 {
            replay.push(experience(0.0));
        }
        replay.update_priorities(&[0, 1, 2, 3], &[2.0, 1.0, 1.0, 1.0]);
        let expected = 2.0f64.powf(alpha) / (2.0f64.powf(alpha) + 3.0);
        assert!((replay.probability(0) - expected).abs() < 1e-9);

        // Empirically, slot 0 is drawn more often than the uniform share.
        let mut rng = StdRng::seed_from_u64(42);
        let mut hits = 0usize;
        let draws = 4000;
        for _ in 0..draws {
            let batch = replay.sample(1, 0.4, &mut rng);
            if batch.indices[0] == 0 {
                hits += 1;
            }
        }
        let frequency = hits as f64 / draws as f64;
        assert!((frequency - expected).abs() < 0.03);
    }

    #[test]
    fn weights_are_normalized() {
        let mut replay = PrioritizedReplay::new(8, 0.6);
        for _ in 0..6 {
            replay.push(experience(0.0));
        }
        replay.update_priorities(&[0, 1], &[5.0, 0.1]);
        let mut rng = StdRng::seed_from_u64(7);
        let batch = replay.sample(6, 1.0, &mut rng);
        assert!(batch.weights.iter().all(|w| *w > 0.0 && *w <= 1.0 + 1e-12));
    }
}
