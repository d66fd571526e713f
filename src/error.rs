//! Culling pipeline error types
//!
//! The frame path has no recoverable errors. These variants exist for
//! initialization, configuration, backend plumbing, and for the reference
//! executor to report invariant violations as values tests can inspect.

use thiserror::Error;

/// Result alias used across the crate
pub type CullResult<T> = Result<T, CullError>;

#[derive(Debug, Error)]
pub enum CullError {
    #[error("invalid cull limits: {reason}")]
    InvalidLimits { reason: String },

    #[error("capacity exceeded for {resource}: requested {requested}, capacity {capacity}")]
    CapacityExceeded {
        resource: String,
        requested: u64,
        capacity: u64,
    },

    #[error("synchronization hazard at op {op_index} ({label}): {detail}")]
    Hazard {
        op_index: usize,
        label: String,
        detail: String,
    },

    #[error("batch slot {slot} still in flight (generation {generation})")]
    BatchSlotInFlight { slot: u32, generation: u32 },

    #[error("stale or unknown {kind} handle {index}:{generation}")]
    StaleHandle {
        kind: &'static str,
        index: u32,
        generation: u32,
    },

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPU operation '{operation}' failed: {error}")]
    GpuOperationFailed { operation: String, error: String },

    #[error("failed to map GPU buffer: {buffer}")]
    BufferMapping { buffer: String },
}

impl CullError {
    pub fn hazard(op_index: usize, label: &str, detail: impl Into<String>) -> Self {
        CullError::Hazard {
            op_index,
            label: label.to_string(),
            detail: detail.into(),
        }
    }
}
