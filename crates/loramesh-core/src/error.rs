//! Error taxonomy for the mesh engine.
//!
//! Recoverable per-packet conditions (duplicates, full buffers, expired TTLs)
//! stay inside the node as drop counters and never cross the public API as
//! errors. `MeshError` names them for the internal paths that need a reason
//! code; `ConfigError` is the only error surfaced at construction.

use thiserror::Error;

/// Reasons a packet is refused for relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("forward buffer full")]
    ForwardBufferFull,

    #[error("duplicate packet")]
    DuplicatePacket,

    #[error("ttl expired")]
    TtlExpired,
}

/// Result alias for engine-internal operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Invalid configuration detected at node construction.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {field}: {reason}")]
pub struct ConfigError {
    /// Offending parameter.
    pub field: &'static str,
    /// What was wrong with it.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError { field, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::ForwardBufferFull;
        assert!(err.to_string().contains("buffer full"));

        let cfg = ConfigError::new("duty_cycle", "must be in (0, 1]");
        assert!(cfg.to_string().contains("duty_cycle"));
    }
}
