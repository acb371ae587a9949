//! Error taxonomy for the bifurcation coordinator.
//!
//! All failures that cross the coordinator/branch boundary are normalized
//! into a single [`BifurcationError`], tagged with an [`ErrorKind`] so that
//! sibling branches (and callers) can distinguish *why* the fanout failed
//! without downcasting through an inheritance hierarchy.

use std::fmt;
use std::sync::Arc;

/// The kind of failure that triggered a [`BifurcationError`].
///
/// This is deliberately a flat enum rather than a hierarchy of error types:
/// every branch observing a failure sees the same `kind`, and can choose to
/// inspect [`BifurcationError::source`] for the original cause.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
pub enum ErrorKind {
    /// A `SourceConfig` or `BranchConfig` value failed validation before any
    /// task was spawned (zero branches, bad watermarks, bad quota, bad
    /// minimum buffer size).
    #[error("invalid configuration")]
    InvalidConfig,
    /// The source's `peek`/`close_err` call returned an error.
    #[error("source read failed")]
    SourceFailure,
    /// A branch's consumer closure returned an error or panicked.
    #[error("consumer failed")]
    ConsumerFailure,
    /// The `CancellationToken` passed in `SourceConfig` fired.
    #[error("cancelled")]
    Cancelled,
}

/// The error type returned by [`crate::bifurcate`] and surfaced to every
/// sibling branch's reader when the fanout fails.
///
/// This is a tagged sum `{ kind, source }` rather than a type hierarchy, per
/// the crate's error-handling design: peers inspect `kind` and unwrap
/// `source` rather than matching on concrete error types. `source` is
/// reference-counted rather than boxed so the single value built at the
/// point a fault is first detected can be handed, unchanged, to every
/// branch's buffer *and* returned to the caller — see
/// [`BifurcationError::new`].
#[derive(Debug, Clone)]
pub struct BifurcationError {
    kind: ErrorKind,
    source: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl BifurcationError {
    /// Wrap an arbitrary error as the given kind.
    pub fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            source: Arc::new(source),
        }
    }

    /// Build an `InvalidConfig` error from a message.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, InvalidConfigError(msg.into()))
    }

    /// Build a `Cancelled` error.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, CancelledError)
    }

    /// Build a `ConsumerFailure` error from a joined task's panic payload.
    pub fn consumer_panicked(join_err: tokio::task::JoinError) -> Self {
        Self::new(ErrorKind::ConsumerFailure, ConsumerPanicked(join_err))
    }

    /// The kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The original error that triggered this failure.
    pub fn source_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

impl fmt::Display for BifurcationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bifurcation failed ({}): {}", self.kind, self.source)
    }
}

impl std::error::Error for BifurcationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidConfigError(String);

#[derive(Debug, thiserror::Error)]
#[error("cancellation token fired")]
struct CancelledError;

#[derive(Debug, thiserror::Error)]
#[error("consumer task panicked: {0}")]
struct ConsumerPanicked(#[from] tokio::task::JoinError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_source() {
        let err = BifurcationError::invalid_config("no branches given");
        let text = err.to_string();
        assert!(text.contains("invalid configuration"));
        assert!(text.contains("no branches given"));
    }

    #[test]
    fn source_error_is_preserved() {
        let err = BifurcationError::cancelled();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.source_error().to_string(), "cancellation token fired");
    }
}
