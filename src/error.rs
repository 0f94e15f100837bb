//! Engine-wide error types using thiserror
//!
//! Every failure mode of the computation core is a variant of `EngineError`.
//! Record-local errors (binding, ordering, missing fields) reject a single
//! record without touching any other instrument's state; `ReplayInconsistency`
//! and `UnboundedGrowth` are fatal for the affected instrument.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Decoder binding does not match the record being decoded.
    /// Never coerced, never masked by a default value.
    #[error("binding mismatch: expected {expected}, record declares {found}")]
    BindingMismatch { expected: String, found: String },

    /// time_mark regressed for an instrument. The ingestion layer broke its
    /// ordering contract; the core does not reorder.
    #[error("out-of-order record for {instrument}: time_mark {got} < last boundary {last}")]
    OutOfOrderRecord {
        instrument: String,
        last: i64,
        got: i64,
    },

    /// A required field is absent (or has the wrong type) on an otherwise
    /// well-identified record. Trust or reject, never guess.
    #[error("missing dependency field '{field}' on {source_kind} record")]
    MissingDependencyField { field: String, source_kind: String },

    /// Reconciliation-phase mismatch between live state and the
    /// independently reloaded persisted state.
    #[error(
        "replay inconsistency at cycle {cycle}, field '{field}': live={live}, persisted={persisted} (tolerance abs={abs_tol}, rel={rel_tol})"
    )]
    ReplayInconsistency {
        cycle: u64,
        field: String,
        live: String,
        persisted: String,
        abs_tol: f64,
        rel_tol: f64,
    },

    /// An accumulator exceeded its fixed capacity. This is a programming
    /// error or a corrupted checkpoint, not a recoverable condition.
    #[error("unbounded growth: {what} holds {len} entries, capacity {capacity}")]
    UnboundedGrowth {
        what: String,
        len: usize,
        capacity: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the affected instrument may keep processing after this error.
    ///
    /// Record-local errors reject one record; fatal errors mean continuing
    /// would deliver results known to be wrong.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ReplayInconsistency { .. } | EngineError::UnboundedGrowth { .. }
        )
    }
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_inconsistency_message_has_full_context() {
        let err = EngineError::ReplayInconsistency {
            cycle: 42,
            field: "ema_fast".to_string(),
            live: "101.818".to_string(),
            persisted: "101.819".to_string(),
            abs_tol: 1e-3,
            rel_tol: 1e-4,
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle 42"));
        assert!(msg.contains("ema_fast"));
        assert!(msg.contains("101.818"));
        assert!(msg.contains("101.819"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::UnboundedGrowth {
            what: "extrema ring".to_string(),
            len: 21,
            capacity: 20,
        }
        .is_fatal());

        assert!(!EngineError::OutOfOrderRecord {
            instrument: "DCE:i<00>".to_string(),
            last: 100,
            got: 90,
        }
        .is_fatal());
    }
}
