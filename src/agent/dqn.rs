//! Double dueling DQN with prioritized replay

use crate::agent::network::{Adam, NetConfig, QNetwork};
use crate::agent::replay::{Experience, PrioritizedReplay};
use crate::agent::{Action, ActionSpace};
use crate::config::DrlConfig;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Agent construction and persistence errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The action space has no types
    #[error("action space is empty")]
    EmptyActionSpace,

    /// Checkpoint I/O failure
    #[error("checkpoint i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint encoding failure
    #[error("checkpoint codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    net_config: NetConfig,
    online: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    epsilon: f64,
    train_steps: u64,
    episodes: u64,
}

/// The learning agent: online and target networks, replay, exploration.
pub struct DqnAgent {
    config: DrlConfig,
    space: ActionSpace,
    fallback: Action,
    online: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    replay: PrioritizedReplay,
    rng: StdRng,
    epsilon: f64,
    train_steps: u64,
    episodes: u64,
}

impl DqnAgent {
    /// Build an agent, loading the checkpoint at `model_path` when one with
    /// a matching shape exists; otherwise starting from random weights.
    pub fn new(
        config: DrlConfig,
        space: ActionSpace,
        state_dim: usize,
    ) -> Result<Self, AgentError> {
        let first = *space.types().first().ok_or(AgentError::EmptyActionSpace)?;
        let fallback = Action::NoOp(first);
        let net_config = NetConfig::new(state_dim, space.len());
        let mut rng = StdRng::seed_from_u64(config.seed);
        let online = QNetwork::new(net_config, &mut rng);
        let target = online.clone();
        let optimizer = Adam::new(config.learning_rate, 1.0, &online.params);
        let replay = PrioritizedReplay::new(config.memory_size, config.priority_alpha);
        let epsilon = config.epsilon_start;

        let mut agent = Self {
            config,
            space,
            fallback,
            online,
            target,
            optimizer,
            replay,
            rng,
            epsilon,
            train_steps: 0,
            episodes: 0,
        };
        agent.try_restore(net_config);
        Ok(agent)
    }

    fn try_restore(&mut self, net_config: NetConfig) {
        let path = self.config.model_path.clone();
        if !path.exists() {
            return;
        }
        match Self::read_checkpoint(&path) {
            Ok(ckpt) => {
                if ckpt.net_config.state_dim != net_config.state_dim
                    || ckpt.net_config.actions != net_config.actions
                {
                    warn!(
                        path = %path.display(),
                        "checkpoint shape does not match, starting fresh"
                    );
                    return;
                }
                info!(
                    path = %path.display(),
                    train_steps = ckpt.train_steps,
                    episodes = ckpt.episodes,
                    "restored agent checkpoint"
                );
                self.online = ckpt.online;
                self.target = ckpt.target;
                self.optimizer = ckpt.optimizer;
                self.epsilon = ckpt.epsilon;
                self.train_steps = ckpt.train_steps;
                self.episodes = ckpt.episodes;
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "unreadable checkpoint, starting fresh");
            }
        }
    }

    fn read_checkpoint(path: &Path) -> Result<Checkpoint, AgentError> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Persist weights and optimizer state to the configured artifact.
    pub fn checkpoint(&self) -> Result<(), AgentError> {
        let ckpt = Checkpoint {
            net_config: self.online.config,
            online: self.online.clone(),
            target: self.target.clone(),
            optimizer: self.optimizer.clone(),
            epsilon: self.epsilon,
            train_steps: self.train_steps,
            episodes: self.episodes,
        };
        let bytes = bincode::serialize(&ckpt)?;
        std::fs::write(&self.config.model_path, bytes)?;
        debug!(path = %self.config.model_path.display(), "checkpoint written");
        Ok(())
    }

    /// Current exploration rate.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Completed train steps.
    pub fn train_steps(&self) -> u64 {
        self.train_steps
    }

    /// Stored experiences.
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// The agent's action space.
    pub fn space(&self) -> &ActionSpace {
        &self.space
    }

    fn greedy_index(&self, state: &[f64]) -> usize {
        let q = self.online.forward(state);
        let mut best = 0;
        let mut best_q = f64::NEG_INFINITY;
        for (index, value) in q.iter().enumerate() {
            if *value > best_q {
                best_q = *value;
                best = index;
            }
        }
        best
    }

    /// Greedy action: a pure function of state given frozen weights.
    pub fn select_greedy(&self, state: &[f64]) -> Action {
        self.space
            .action(self.greedy_index(state))
            .unwrap_or(self.fallback)
    }

    /// Epsilon-greedy action. Deterministic for a fixed seed because the
    /// internal RNG is the only randomness source.
    pub fn select_action(&mut self, state: &[f64]) -> Action {
        let index = if self.rng.gen::<f64>() < self.epsilon {
            self.rng.gen_range(0..self.space.len())
        } else {
            self.greedy_index(state)
        };
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
        self.space.action(index).unwrap_or(self.fallback)
    }

    /// Store one transition. Non-blocking: just a buffer insert.
    pub fn observe(
        &mut self,
        state: Vec<f64>,
        action: Action,
        reward: f64,
        next_state: Vec<f64>,
        terminal: bool,
    ) {
        let Some(action) = self.space.index(action) else {
            return;
        };
        self.replay.push(Experience {
            state,
            action,
            reward,
            next_state,
            terminal,
        });
    }

    fn beta(&self) -> f64 {
        let progress = self.train_steps as f64 / self.config.beta_anneal_steps.max(1) as f64;
        (self.config.beta_start + (1.0 - self.config.beta_start) * progress).min(1.0)
    }

    /// One opportunistic training step; `None` while the buffer is smaller
    /// than a batch. Returns the weighted TD loss.
    pub fn train_step(&mut self) -> Option<f64> {
        let batch_size = self.config.batch_size;
        if self.replay.len() < batch_size {
            return None;
        }
        let beta = self.beta();
        let batch = self.replay.sample(batch_size, beta, &mut self.rng);

        let actions = self.space.len();
        let mut grads = None;
        let mut td_errors = Vec::with_capacity(batch.experiences.len());
        let mut loss = 0.0;
        let scale = 1.0 / batch.experiences.len() as f64;

        for (experience, weight) in batch.experiences.iter().zip(&batch.weights) {
            // Double DQN: online picks the successor action, target scores it.
            let next_online = self.online.forward(&experience.next_state);
            let mut a_star = 0;
            let mut best = f64::NEG_INFINITY;
            for (index, value) in next_online.iter().enumerate() {
                if *value > best {
                    best = *value;
                    a_star = index;
                }
            }
            let next_target = self.target.forward(&experience.next_state);
            let not_terminal = if experience.terminal { 0.0 } else { 1.0 };
            let y = experience.reward
                + self.config.gamma * next_target[(0, a_star)] * not_terminal;

            let (q, cache) = self.online.forward_cached(&experience.state);
            let td = q[(0, experience.action)] - y;
            td_errors.push(td);
            loss += weight * td * td * scale;

            let mut dq = Array2::zeros((1, actions));
            dq[(0, experience.action)] = 2.0 * weight * td * scale;
            let sample_grads = self.online.backward(&cache, &dq);
            match grads.as_mut() {
                None => grads = Some(sample_grads),
                Some(total) => total.add_scaled(&sample_grads, 1.0),
            }
        }

        if let Some(mut grads) = grads {
            self.optimizer.step(&mut self.online.params, &mut grads);
        }
        self.replay.update_priorities(&batch.indices, &td_errors);
        self.train_steps += 1;
        if self.train_steps % self.config.target_update_freq == 0 {
            self.target
                .params
                .blend_from(&self.online.params, self.config.tau);
            debug!(step = self.train_steps, "target network synced");
        }
        Some(loss)
    }

    /// Close out an episode; returns true when a checkpoint is due.
    pub fn end_episode(&mut self) -> bool {
        self.episodes += 1;
        self.config.checkpoint_every > 0
            && self.episodes % u64::from(self.config.checkpoint_every) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnf::VnfType;

    fn agent_with(config: DrlConfig) -> DqnAgent {
        let space = ActionSpace::new(vec![VnfType::Firewall, VnfType::Mail]);
        DqnAgent::new(config, space, 16).unwrap()
    }

    fn small_config() -> DrlConfig {
        DrlConfig {
            batch_size: 4,
            memory_size: 64,
            model_path: std::path::PathBuf::from("/nonexistent/never.ckpt"),
            ..DrlConfig::default()
        }
    }

    #[test]
    fn same_seed_same_actions() {
        let mut a = agent_with(small_config());
        let mut b = agent_with(small_config());
        let state = vec![0.5; 16];
        for _ in 0..20 {
            assert_eq!(a.select_action(&state), b.select_action(&state));
        }
    }

    #[test]
    fn greedy_is_pure() {
        let agent = agent_with(small_config());
        let state = vec![0.3; 16];
        let first = agent.select_greedy(&state);
        for _ in 0..5 {
            assert_eq!(agent.select_greedy(&state), first);
        }
    }

    #[test]
    fn epsilon_decays_to_floor() {
        let mut config = small_config();
        config.epsilon_decay = 0.5;
        config.epsilon_min = 0.1;
        let mut agent = agent_with(config);
        let state = vec![0.0; 16];
        for _ in 0..20 {
            agent.select_action(&state);
        }
        assert!((agent.epsilon() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn training_reduces_td_error_on_fixed_transition() {
        let mut agent = agent_with(small_config());
        let state = vec![0.2; 16];
        let next = vec![0.4; 16];
        let action = Action::AllocateNew(VnfType::Firewall);
        for _ in 0..8 {
            agent.observe(state.clone(), action, 1.0, next.clone(), true);
        }
        let first = agent.train_step().unwrap();
        let mut last = first;
        for _ in 0..60 {
            if let Some(loss) = agent.train_step() {
                last = loss;
            }
        }
        assert!(last < first, "loss {last} did not fall below {first}");
    }

    #[test]
    fn checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.model_path = dir.path().join("agent.ckpt");
        let mut first = agent_with(config.clone());
        let state = vec![0.1; 16];
        for _ in 0..10 {
            first.observe(
                state.clone(),
                Action::NoOp(VnfType::Firewall),
                0.5,
                state.clone(),
                false,
            );
            first.train_step();
        }
        first.checkpoint().unwrap();

        let restored = agent_with(config);
        assert_eq!(restored.train_steps(), first.train_steps());
        let probe = vec![0.7; 16];
        assert_eq!(restored.select_greedy(&probe), first.select_greedy(&probe));
    }
}
