//! Learning agent
//!
//! A dueling deep Q-network with a multi-head attention block over the
//! state vector and a prioritized replay buffer. The agent suggests one
//! scaling action per control tick; the scaling controller filters the
//! suggestion through its safety rails before acting.

pub mod dqn;
pub mod network;
pub mod replay;
pub mod state;

pub use dqn::DqnAgent;
pub use replay::{Experience, PrioritizedReplay};
pub use state::StateBuilder;

use crate::vnf::VnfType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scaling action over one VNF type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Launch one new instance
    AllocateNew(VnfType),
    /// Drain one active instance
    DrainOne(VnfType),
    /// Leave the type alone this tick
    NoOp(VnfType),
}

impl Action {
    /// The type this action touches.
    pub fn vnf_type(&self) -> VnfType {
        match self {
            Action::AllocateNew(t) | Action::DrainOne(t) | Action::NoOp(t) => *t,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::AllocateNew(t) => write!(f, "allocate_new({t})"),
            Action::DrainOne(t) => write!(f, "drain_one({t})"),
            Action::NoOp(t) => write!(f, "no_op({t})"),
        }
    }
}

/// Bijection between [`Action`] values and Q-network output indices:
/// three actions per configured type, 3K outputs in total.
#[derive(Debug, Clone)]
pub struct ActionSpace {
    types: Vec<VnfType>,
}

impl ActionSpace {
    /// Action space over the configured types.
    pub fn new(types: Vec<VnfType>) -> Self {
        Self { types }
    }

    /// Number of discrete actions (3K).
    pub fn len(&self) -> usize {
        self.types.len() * 3
    }

    /// Whether the space is empty.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The configured types, in index order.
    pub fn types(&self) -> &[VnfType] {
        &self.types
    }

    /// Action for a network output index.
    pub fn action(&self, index: usize) -> Option<Action> {
        let vnf_type = *self.types.get(index / 3)?;
        Some(match index % 3 {
            0 => Action::AllocateNew(vnf_type),
            1 => Action::DrainOne(vnf_type),
            _ => Action::NoOp(vnf_type),
        })
    }

    /// Network output index for an action.
    pub fn index(&self, action: Action) -> Option<usize> {
        let position = self
            .types
            .iter()
            .position(|t| *t == action.vnf_type())?;
        let offset = match action {
            Action::AllocateNew(_) => 0,
            Action::DrainOne(_) => 1,
            Action::NoOp(_) => 2,
        };
        Some(position * 3 + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_index_round_trips() {
        let space = ActionSpace::new(vec![VnfType::Firewall, VnfType::Mail]);
        assert_eq!(space.len(), 6);
        for index in 0..space.len() {
            let action = space.action(index).unwrap();
            assert_eq!(space.index(action), Some(index));
        }
        assert_eq!(space.action(6), None);
        assert_eq!(space.index(Action::NoOp(VnfType::SpamFilter)), None);
    }
}
