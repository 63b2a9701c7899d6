use thiserror::Error;

use crate::Features;

/// Why a feature transition ended in the `Failed` state.
///
/// Delivered exactly once to whoever requested the activation; the core never
/// retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("object disposed")]
    Disposed,

    #[error("features not supported by this object: {0:?}")]
    Unsupported(Features),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("activation step failed: {0}")]
    StepFailed(String),

    #[error("unknown object")]
    UnknownObject,
}

/// Error type shared by every Conduit crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConduitError {
    /// The transport reported something that contradicts the registry state
    /// (duplicate id, event for an unknown object).
    #[error("protocol inconsistency on {id}: {details}")]
    ProtocolInconsistency { id: u32, details: String },

    #[error("invalid constraint: {0}")]
    ConstraintInvalid(String),

    #[error("activation failed: {0}")]
    Activation(#[from] ActivationError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),
}
