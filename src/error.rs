use thiserror::Error;

use crate::topology::WorkerId;

pub type NodeId = u32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot estimate access frequency: {0}")]
    Estimation(String),

    #[error("transfer to worker {worker} from worker {owner} failed: {reason}")]
    Transfer {
        worker: WorkerId,
        owner: WorkerId,
        reason: String,
    },

    #[error("node {node} out of range (num_nodes = {num_nodes})")]
    NodeOutOfRange { node: NodeId, num_nodes: usize },

    #[error("invalid placement: {0}")]
    InvalidPlacement(String),
}

impl CacheError {
    pub fn config(msg: impl Into<String>) -> Self {
        CacheError::Config(msg.into())
    }

    pub fn invalid_placement(msg: impl Into<String>) -> Self {
        CacheError::InvalidPlacement(msg.into())
    }

    /// Whether the error only affects the current step.
    pub fn is_step_local(&self) -> bool {
        matches!(self, CacheError::Transfer { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
