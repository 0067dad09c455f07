//! Typed errors for the two subsystems with retry semantics of their own.
//!
//! Everything else in the orchestrator propagates `anyhow::Error` and is
//! folded into a structured `RunReport`; these enums exist where a caller
//! matches on the failure mode.

use thiserror::Error;

/// Errors from a single investigation attempt.
#[derive(Debug, Error)]
pub enum InvestigationError {
    /// The backend call failed twice in the same turn (one retry allowed).
    #[error("Reasoning backend failed after retry on turn {turn}: {message}")]
    BackendFailed { turn: u32, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the coordination lock store.
///
/// These are always handled fail-open: a worker that cannot reach the
/// store proceeds as if it were first.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Lock store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("Lock record {lock_id} could not be retired: {message}")]
    RetireFailed { lock_id: u64, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn investigation_error_backend_failed_carries_turn() {
        let err = InvestigationError::BackendFailed {
            turn: 3,
            message: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("turn 3"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn coordination_error_variants_are_matchable() {
        let err = CoordinationError::StoreUnreachable("503".to_string());
        assert!(matches!(err, CoordinationError::StoreUnreachable(_)));
        let err = CoordinationError::RetireFailed {
            lock_id: 42,
            message: "gone".to_string(),
        };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&InvestigationError::BackendFailed {
            turn: 1,
            message: "x".into(),
        });
        assert_std_error(&CoordinationError::StoreUnreachable("x".into()));
    }
}
