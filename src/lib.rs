//! Fan a single byte stream out to many independent, backpressured
//! consumers.
//!
//! [`bifurcate`] reads from one upstream [`Source`] exactly once and
//! concurrently delivers the identical byte sequence to every branch in
//! `branch_configs`. Each branch runs its own consumer task, has its own
//! bounded buffer with high/low watermarks, and may stop reading early
//! (voluntarily or by hitting its `max_total_bytes` quota) without
//! stalling its siblings. If any branch's consumer fails, the failure is
//! fanned out to every other branch's reader so they can observe and react
//! to it, rather than simply being cancelled.
//!
//! # Example
//!
//! ```
//! use bifurcate::{bifurcate, BranchConfig, SourceConfig};
//!
//! # async fn run() -> Result<(), bifurcate::BifurcationError> {
//! let source: &[u8] = b"Test Value";
//! let outcome = bifurcate(
//!     source,
//!     SourceConfig::new(),
//!     vec![
//!         BranchConfig::new(|mut reader, _cancel| async move {
//!             reader.read_to_end().await.unwrap()
//!         }),
//!         BranchConfig::new(|mut reader, _cancel| async move {
//!             reader.read_to_end().await.unwrap()
//!         }),
//!     ],
//! )
//! .await?;
//! assert_eq!(outcome.results[0].as_deref(), Some(b"Test Value".as_slice()));
//! assert_eq!(outcome.results[1].as_deref(), Some(b"Test Value".as_slice()));
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`Source`] / [`AsyncReadSource`] / [`PipeReaderSource`]: the upstream
//!   byte provider, accessed through a peek-and-advance contract so the
//!   coordinator never copies more than it has to. `AsyncReadSource` adapts
//!   any [`tokio::io::AsyncRead`] through an accumulation buffer;
//!   `PipeReaderSource` adapts a native [`tokio::io::AsyncBufRead`] handle
//!   directly, without one.
//! - [`BranchBuffer`][buffer]/[`BranchReader`]: the per-branch bounded
//!   queue and its consumer-facing read handle.
//! - [`BranchConfig`] / [`SourceConfig`]: construction-time configuration,
//!   built with the inherent-builder style (`with_*` methods).
//! - [`BifurcationError`]: the single error type fanned out to every
//!   branch when the run fails; inspect [`BifurcationError::kind`] to find
//!   out why.
//!
//! # Failure fanout
//!
//! A failure in one branch (or in the source itself) does not simply
//! cancel its siblings. It is wrapped in a [`BifurcationError`] and handed
//! to every other branch's [`BranchReader::read`] as the terminal error on
//! their next read, giving still-running consumers a chance to observe and
//! react to it before `bifurcate` returns. With
//! [`SourceConfig::with_bubble_exceptions`]`(false)`, the call itself
//! returns `Ok` with the partial [`BifurcateOutcome::results`] and the
//! failure attached as [`BifurcateOutcome::error`] instead of propagating
//! as `Err`.
//!
//! # `no_std`
//!
//! Unlike the buffer this crate borrows its storage discipline from, this
//! crate is not `no_std`: it depends on `tokio` for task spawning,
//! synchronization, and cancellation.

#![forbid(unsafe_code)]

mod branch;
mod buffer;
mod config;
mod coordinator;
mod error;
mod source;

pub use branch::BranchId;
pub use buffer::BranchReader;
pub use config::{BranchConfig, ConsumerFuture, SourceConfig};
pub use coordinator::BifurcateOutcome;
pub use error::{BifurcationError, ErrorKind};
pub use source::{AsyncReadSource, PipeReaderSource, Source};

use branch::BranchState;

/// Fan `source`'s bytes out to every branch in `branch_configs`, returning
/// the aligned result vector (wrapped, along with the failure if any, in
/// [`BifurcateOutcome`]) or the first [`BifurcationError`] encountered.
///
/// `source` may be anything implementing [`tokio::io::AsyncRead`] — it is
/// wrapped in an [`AsyncReadSource::new`], whose `leave_open` is taken from
/// [`SourceConfig::with_leave_open`] (default `false`). Since this function
/// only knows `S: AsyncRead`, it never attempts a write-shutdown handshake
/// even when `leave_open` is `false` and `S` happens to also implement
/// [`tokio::io::AsyncWrite`] — use [`bifurcate_bidirectional`] for a source
/// that should be shut down on teardown, or [`bifurcate_with_source`] with
/// an [`AsyncReadSource::new_bidirectional`]/[`PipeReaderSource`] you
/// construct yourself for full control.
///
/// # Errors
///
/// Returns `Err(BifurcationError)` with `kind() == ErrorKind::InvalidConfig`
/// synchronously, before any task is spawned, if `branch_configs` is empty
/// or any config fails validation (bad watermarks, a zero quota, or a zero
/// minimum read-buffer size). All other failures are reported according to
/// `source_config.bubble_exceptions` — see the [crate-level
/// docs](crate#failure-fanout).
#[tracing::instrument(skip_all, fields(branches = branch_configs.len()))]
pub async fn bifurcate<S, R>(
    source: S,
    source_config: SourceConfig,
    branch_configs: Vec<BranchConfig<R>>,
) -> Result<BifurcateOutcome<R>, BifurcationError>
where
    S: tokio::io::AsyncRead + Unpin + Send + 'static,
    R: Send + 'static,
{
    let source = AsyncReadSource::new(source, source_config.leave_open);
    bifurcate_with_source(source, source_config, branch_configs).await
}

/// Like [`bifurcate`], but for a bidirectional `source` (anything
/// implementing both [`tokio::io::AsyncRead`] and [`tokio::io::AsyncWrite`],
/// e.g. a socket or a `tokio::io::DuplexStream` half). Wraps `source` in an
/// [`AsyncReadSource::new_bidirectional`], so unless
/// [`SourceConfig::with_leave_open`]`(true)` is set, `close_ok`/`close_err`
/// actually invoke [`tokio::io::AsyncWriteExt::shutdown`] on it once the run
/// ends.
#[tracing::instrument(skip_all, fields(branches = branch_configs.len()))]
pub async fn bifurcate_bidirectional<S, R>(
    source: S,
    source_config: SourceConfig,
    branch_configs: Vec<BranchConfig<R>>,
) -> Result<BifurcateOutcome<R>, BifurcationError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    R: Send + 'static,
{
    let source = AsyncReadSource::new_bidirectional(source, source_config.leave_open);
    bifurcate_with_source(source, source_config, branch_configs).await
}

/// Like [`bifurcate`], but for a source that already implements the
/// [`Source`] peek-and-advance contract directly (a native handle, or an
/// [`AsyncReadSource`] constructed with an explicit `leave_open`).
#[tracing::instrument(skip_all, fields(branches = branch_configs.len()))]
pub async fn bifurcate_with_source<S, R>(
    source: S,
    source_config: SourceConfig,
    branch_configs: Vec<BranchConfig<R>>,
) -> Result<BifurcateOutcome<R>, BifurcationError>
where
    S: Source,
    R: Send + 'static,
{
    source_config.validate()?;
    if branch_configs.is_empty() {
        return Err(BifurcationError::invalid_config(
            "bifurcate requires at least one branch",
        ));
    }
    for config in &branch_configs {
        config.validate()?;
    }

    let cancel = source_config.cancel_token.clone();
    let branches: Vec<BranchState<R>> = branch_configs
        .into_iter()
        .enumerate()
        .map(|(i, config)| BranchState::spawn(BranchId(i), config, cancel.clone()))
        .collect();

    tracing::debug!(count = branches.len(), "branches spawned, entering read loop");
    coordinator::run(source, source_config, branches).await
}

/// Convenience entry point for branches that don't produce a value: every
/// [`BranchConfig`] in `branch_configs` has result type `()`, so
/// [`BifurcateOutcome::results`] is a `Vec<Option<()>>` whose `Some`/`None`
/// pattern alone tells you which branches finished before failure, if any.
pub async fn bifurcate_unit<S>(
    source: S,
    source_config: SourceConfig,
    branch_configs: Vec<BranchConfig<()>>,
) -> Result<BifurcateOutcome<()>, BifurcationError>
where
    S: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    bifurcate(source, source_config, branch_configs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn single_branch_happy_path() {
        let source: &[u8] = b"Test Value";
        let outcome = bifurcate(
            source,
            SourceConfig::new(),
            vec![BranchConfig::new(|mut reader, _cancel| async move {
                reader.read_to_end().await.unwrap()
            })],
        )
        .await
        .unwrap();
        assert_eq!(outcome.results[0].as_deref(), Some(b"Test Value".as_slice()));
    }

    #[tokio::test]
    async fn multi_branch_happy_path() {
        let source: &[u8] = b"Test Value";
        let outcome = bifurcate(
            source,
            SourceConfig::new(),
            vec![
                BranchConfig::new(|mut reader, _cancel| async move {
                    reader.read_to_end().await.unwrap()
                }),
                BranchConfig::new(|mut reader, _cancel| async move {
                    reader.read_to_end().await.unwrap()
                }),
            ],
        )
        .await
        .unwrap();
        assert_eq!(outcome.results.len(), 2);
        for result in &outcome.results {
            assert_eq!(result.as_deref(), Some(b"Test Value".as_slice()));
        }
    }

    #[tokio::test]
    async fn per_branch_quota_clips_independently() {
        let source: &[u8] = b"Test Value";
        let outcome = bifurcate(
            source,
            SourceConfig::new(),
            vec![
                BranchConfig::new(|mut reader, _cancel| async move {
                    reader.read_to_end().await.unwrap()
                })
                .with_max_total_bytes(Some(4)),
                BranchConfig::new(|mut reader, _cancel| async move {
                    reader.read_to_end().await.unwrap()
                }),
            ],
        )
        .await
        .unwrap();
        assert_eq!(outcome.results[0].as_deref(), Some(b"Test".as_slice()));
        assert_eq!(outcome.results[1].as_deref(), Some(b"Test Value".as_slice()));
    }

    #[tokio::test]
    async fn no_branches_is_invalid_config() {
        let source: &[u8] = b"";
        let err = bifurcate::<_, ()>(source, SourceConfig::new(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn failure_fanout_without_bubbling_reaches_sibling_reader() {
        let source: &[u8] = b"Test Value";
        let on_error_calls = Arc::new(AtomicUsize::new(0));
        let on_error_calls_clone = on_error_calls.clone();
        let outcome = bifurcate(
            source,
            SourceConfig::new().with_bubble_exceptions(false),
            vec![
                BranchConfig::new(|mut reader, _cancel| async move {
                    let mut first = [0u8; 1];
                    let _ = reader.read(&mut first).await;
                    panic!("TargetException")
                }),
                BranchConfig::new(move |mut reader, _cancel| {
                    let on_error_calls = on_error_calls_clone.clone();
                    async move {
                        let result = reader.read_to_end().await;
                        (result, on_error_calls)
                    }
                })
                .with_on_error(move |_err| {
                    on_error_calls.fetch_add(1, Ordering::SeqCst);
                }),
            ],
        )
        .await
        .unwrap();
        assert!(outcome.error.is_some());
        assert_eq!(
            outcome.error.as_ref().unwrap().kind(),
            ErrorKind::ConsumerFailure
        );
        let (b_result, on_error_calls) = outcome.results[1].clone().unwrap();
        assert!(b_result.is_err());
        assert_eq!(on_error_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bifurcate_bidirectional_shuts_down_source_by_default() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"hi").await.unwrap();
        drop(writer);

        bifurcate_bidirectional(
            reader,
            SourceConfig::new(),
            vec![BranchConfig::new(|mut reader, _cancel| async move {
                reader.read_to_end().await.unwrap()
            })],
        )
        .await
        .unwrap();
        // `reader` (the `DuplexStream` half) was moved into the call and
        // shut down on teardown since `leave_open` defaults to `false`;
        // there is nothing further to assert on it directly, but this
        // exercises `AsyncReadSource::new_bidirectional`'s shutdown path
        // end to end without panicking or hanging.
    }

    #[tokio::test]
    async fn bifurcate_leaves_source_open_when_configured() {
        let source: &[u8] = b"Test Value";
        let outcome = bifurcate(
            source,
            SourceConfig::new().with_leave_open(true),
            vec![BranchConfig::new(|mut reader, _cancel| async move {
                reader.read_to_end().await.unwrap()
            })],
        )
        .await
        .unwrap();
        assert_eq!(outcome.results[0].as_deref(), Some(b"Test Value".as_slice()));
    }
}
