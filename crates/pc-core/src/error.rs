use thiserror::Error;

use crate::chain::ChainId;

/// Construction-time configuration failures. These are the only errors
/// the core surfaces loudly; everything at runtime degrades instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("coupling |gamma| must be < 1, got {gamma}")]
    CouplingOutOfRange { gamma: f64 },

    #[error("tachyonic configuration: {field} mass-squared must be > 0, got {value}")]
    TachyonicMass { field: &'static str, value: f64 },

    #[error("unstable mass matrix: eigenvalues ({lambda_minus}, {lambda_plus}) must both be > 0")]
    NonPositiveEigenvalue { lambda_minus: f64, lambda_plus: f64 },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("event cap must be 1 (one action per cycle), got {0}")]
    UnsupportedEventCap(usize),
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("unknown reasoning chain {0}")]
    UnknownChain(ChainId),

    #[error("reasoning chain {0} is not open")]
    NotOpen(ChainId),

    #[error("reasoning chain {requested} is not the innermost open chain ({innermost})")]
    NotInnermost {
        requested: ChainId,
        innermost: ChainId,
    },

    #[error("reasoning chain nesting limit {limit} reached")]
    DepthExceeded { limit: usize },
}

/// Error returned by an event handler. Caught by the bus, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
