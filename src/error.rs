//! Error taxonomy shared across the sandbox core.
//!
//! The identifiers in [`ErrorKind`] are part of the report contract: they are
//! serialized verbatim into `errorKind` fields and must stay stable across
//! releases. Pipeline-local failures are recorded on the owning `VmResult`
//! and never propagate to the orchestrator, with `Internal` as the single
//! exception (it signals an invariant violation, not an analysis outcome).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure identifiers carried in `VmResult::error_kind` and in API
/// error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Submission rejected: the work queue is at capacity.
    #[error("QueueFull")]
    QueueFull,
    /// Upload failed validation (size, emptiness, type).
    #[error("InvalidSample")]
    InvalidSample,
    /// A requested VM is not present in the configuration.
    #[error("VMUnknown")]
    #[serde(rename = "VMUnknown")]
    VmUnknown,
    /// Snapshot restore, VM start, or guest readiness failed.
    #[error("EnvironmentFailed")]
    EnvironmentFailed,
    /// Copying the sample into the guest failed.
    #[error("TransferFailed")]
    TransferFailed,
    /// Guest credentials were rejected.
    #[error("AuthFailed")]
    AuthFailed,
    /// Sample execution could not be initiated (and the agent did not
    /// consume the file first).
    #[error("DetonationFailed")]
    DetonationFailed,
    /// The collector could not produce a structured result.
    #[error("CollectionFailed")]
    CollectionFailed,
    /// The collector reached its target but the in-guest tool is not
    /// responding.
    #[error("AgentUnavailable")]
    AgentUnavailable,
    /// The VM could not be returned to a powered-off state; it is flagged
    /// needs-attention in the pool.
    #[error("CleanupFailed")]
    CleanupFailed,
    /// Task cancelled by API request or deadline.
    #[error("Cancelled")]
    Cancelled,
    /// Invariant violation; a programming error, never an analysis outcome.
    #[error("Internal")]
    Internal,
}

/// A failure with its stable identifier plus human-readable detail.
///
/// Collaborators below the orchestrator (`VmController`, guest layer,
/// collectors, pool) return this type so the pipeline can record both the
/// taxonomy kind and the operator-facing detail string without re-mapping.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct SandboxError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl SandboxError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display_matches_stable_identifiers() {
        assert_eq!(ErrorKind::QueueFull.to_string(), "QueueFull");
        assert_eq!(ErrorKind::VmUnknown.to_string(), "VMUnknown");
        assert_eq!(ErrorKind::EnvironmentFailed.to_string(), "EnvironmentFailed");
        assert_eq!(ErrorKind::CleanupFailed.to_string(), "CleanupFailed");
        assert_eq!(ErrorKind::Internal.to_string(), "Internal");
    }

    #[test]
    fn error_kind_serializes_as_bare_identifier() {
        let json = serde_json::to_string(&ErrorKind::AgentUnavailable).unwrap();
        assert_eq!(json, "\"AgentUnavailable\"");

        let back: ErrorKind = serde_json::from_str("\"TransferFailed\"").unwrap();
        assert_eq!(back, ErrorKind::TransferFailed);
    }

    #[test]
    fn sandbox_error_display_includes_kind_and_detail() {
        let e = SandboxError::new(ErrorKind::AuthFailed, "credentials rejected for vboxuser");
        assert_eq!(e.to_string(), "AuthFailed: credentials rejected for vboxuser");
    }
}
