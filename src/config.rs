//! Configuration types for the bifurcation coordinator.
//!
//! Uses an inherent-builder style: construct a default with [`SourceConfig::new`]
//! or [`BranchConfig::new`] and override fields through `with_*` methods that
//! consume and return `self`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::BifurcationError;

/// Boxed, `'static` future returned by a branch consumer closure.
pub type ConsumerFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

/// Default high watermark (bytes) at which a branch's producer suspends.
pub const DEFAULT_BLOCK_AFTER: usize = 32_768;
/// Default low watermark (bytes) at which a suspended producer resumes.
pub const DEFAULT_RESUME_AFTER: usize = 16_384;
/// Default minimum read-buffer size used for coalescing tiny source reads.
pub const DEFAULT_MIN_READ_BUFFER_SIZE: usize = 4_096;

/// Configuration shared by the whole bifurcation call (one source, many
/// branches).
#[derive(Clone)]
pub struct SourceConfig {
    pub(crate) min_read_buffer_size: Option<usize>,
    pub(crate) bubble_exceptions: bool,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) leave_open: bool,
}

impl SourceConfig {
    /// Create a config with the canonical defaults: `min_read_buffer_size =
    /// Some(4096)`, `bubble_exceptions = true`, `leave_open = false`, and a
    /// fresh cancellation token that the caller may clone and fire
    /// independently.
    pub fn new() -> Self {
        Self {
            min_read_buffer_size: Some(DEFAULT_MIN_READ_BUFFER_SIZE),
            bubble_exceptions: true,
            cancel_token: CancellationToken::new(),
            leave_open: false,
        }
    }

    /// Set the minimum read-buffer size used for coalescing. `None` disables
    /// coalescing entirely; `Some(0)` is rejected at validation time.
    pub fn with_min_read_buffer_size(mut self, size: Option<usize>) -> Self {
        self.min_read_buffer_size = size;
        self
    }

    /// Set whether `bifurcate` returns `Err` (true) or partial `Ok` results
    /// (false) on failure.
    pub fn with_bubble_exceptions(mut self, bubble: bool) -> Self {
        self.bubble_exceptions = bubble;
        self
    }

    /// Use an externally-owned cancellation token instead of a fresh one, so
    /// the caller can fire cancellation from elsewhere.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Control whether [`crate::bifurcate`]'s internal [`crate::AsyncReadSource`]
    /// leaves the wrapped stream open on teardown (`true`) or shuts it down
    /// (`false`, the default — see [`tokio::io::AsyncWriteExt::shutdown`] for
    /// sources that are also `AsyncWrite`). Only meaningful for
    /// [`crate::bifurcate`]/[`crate::bifurcate_unit`]; a source constructed by
    /// hand and passed to [`crate::bifurcate_with_source`] has its own
    /// `leave_open` baked in at construction.
    pub fn with_leave_open(mut self, leave_open: bool) -> Self {
        self.leave_open = leave_open;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BifurcationError> {
        if self.min_read_buffer_size == Some(0) {
            return Err(BifurcationError::invalid_config(
                "min_read_buffer_size must be positive or None, got Some(0)",
            ));
        }
        Ok(())
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-branch configuration: the consumer closure, watermarks, quota, and
/// an optional error observer.
pub struct BranchConfig<R> {
    pub(crate) consumer: Box<
        dyn FnOnce(crate::buffer::BranchReader, CancellationToken) -> ConsumerFuture<R> + Send,
    >,
    pub(crate) on_error: Option<Arc<dyn Fn(&BifurcationError) + Send + Sync>>,
    pub(crate) block_after: usize,
    pub(crate) resume_after: usize,
    pub(crate) max_total_bytes: Option<u64>,
}

impl<R> BranchConfig<R> {
    /// Create a branch whose consumer is `consumer`, with the canonical
    /// default watermarks (`block_after = 32768`, `resume_after = 16384`)
    /// and no quota.
    pub fn new<F, Fut>(consumer: F) -> Self
    where
        F: FnOnce(crate::buffer::BranchReader, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            consumer: Box::new(move |reader, cancel| Box::pin(consumer(reader, cancel))),
            on_error: None,
            block_after: DEFAULT_BLOCK_AFTER,
            resume_after: DEFAULT_RESUME_AFTER,
            max_total_bytes: None,
        }
    }

    /// Set the high watermark at which the producer suspends writes to this
    /// branch.
    pub fn with_block_after(mut self, block_after: usize) -> Self {
        self.block_after = block_after;
        self
    }

    /// Set the low watermark at which a suspended producer resumes writes to
    /// this branch.
    pub fn with_resume_after(mut self, resume_after: usize) -> Self {
        self.resume_after = resume_after;
        self
    }

    /// Cap the number of bytes this branch will ever receive. `None` means
    /// unlimited; reaching the cap completes the branch normally.
    pub fn with_max_total_bytes(mut self, max_total_bytes: Option<u64>) -> Self {
        self.max_total_bytes = max_total_bytes;
        self
    }

    /// Register a callback invoked (at most once) with the wrapped failure
    /// if the overall bifurcation fails globally, whether or not this
    /// particular branch was the one that failed.
    pub fn with_on_error(
        mut self,
        on_error: impl Fn(&BifurcationError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BifurcationError> {
        if self.block_after == 0 {
            return Err(BifurcationError::invalid_config(
                "block_after must be > 0",
            ));
        }
        if self.resume_after > self.block_after {
            return Err(BifurcationError::invalid_config(format!(
                "resume_after ({}) must be <= block_after ({})",
                self.resume_after, self.block_after
            )));
        }
        if self.max_total_bytes == Some(0) {
            return Err(BifurcationError::invalid_config(
                "max_total_bytes must be positive or None, got Some(0)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_source_config_matches_canonical_defaults() {
        let cfg = SourceConfig::new();
        assert_eq!(cfg.min_read_buffer_size, Some(DEFAULT_MIN_READ_BUFFER_SIZE));
        assert!(cfg.bubble_exceptions);
        assert!(!cfg.leave_open);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_min_read_buffer_size_is_invalid() {
        let cfg = SourceConfig::new().with_min_read_buffer_size(Some(0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn branch_defaults_match_canonical_defaults() {
        let branch = BranchConfig::new(|_reader, _cancel| async { () });
        assert_eq!(branch.block_after, DEFAULT_BLOCK_AFTER);
        assert_eq!(branch.resume_after, DEFAULT_RESUME_AFTER);
        assert_eq!(branch.max_total_bytes, None);
        assert!(branch.validate().is_ok());
    }

    #[test]
    fn resume_after_above_block_after_is_invalid() {
        let branch = BranchConfig::new(|_reader, _cancel| async { () })
            .with_block_after(10)
            .with_resume_after(20);
        assert!(branch.validate().is_err());
    }

    #[test]
    fn zero_block_after_is_invalid() {
        let branch = BranchConfig::new(|_reader, _cancel| async { () }).with_block_after(0);
        assert!(branch.validate().is_err());
    }

    #[test]
    fn zero_max_total_bytes_is_invalid() {
        let branch = BranchConfig::new(|_reader, _cancel| async { () })
            .with_max_total_bytes(Some(0));
        assert!(branch.validate().is_err());
    }
}
