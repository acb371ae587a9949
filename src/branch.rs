//! Branch lifecycle management (C3).
//!
//! A [`BranchState`] owns one branch's buffer, its spawned consumer task,
//! its remaining byte quota, and whatever result the consumer eventually
//! produces. The coordinator (C4) is the only caller of these methods.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::BranchBuffer;
use crate::config::BranchConfig;
use crate::error::BifurcationError;

/// Positional identifier of a branch, used only for diagnostics.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BranchId(pub usize);

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "branch[{}]", self.0)
    }
}

/// Outcome of a single [`BranchState::write`] call.
pub(crate) enum WriteOutcome {
    /// The branch accepted the bytes and can keep receiving more.
    Continue,
    /// The branch is done (quota exhausted or consumer finished normally).
    /// The coordinator should call [`BranchState::complete_ok`].
    Stop,
    /// The branch's consumer task failed. The coordinator should start the
    /// global failure-fanout path.
    Fault(BifurcationError),
}

pub(crate) struct BranchState<R> {
    id: BranchId,
    buffer: BranchBuffer,
    consumer_task: JoinHandle<R>,
    on_error: Option<Arc<dyn Fn(&BifurcationError) + Send + Sync>>,
    remaining_quota: Option<u64>,
    /// Set once `write` has returned `Stop` or `Fault`: no more bytes will
    /// be sent to this branch.
    stopped: bool,
    /// Set once `complete_ok`/`complete_err` has run: further calls are
    /// no-ops, per the crate's idempotence law.
    closed: bool,
    /// Set once `on_error` has been invoked for this branch. Tracked
    /// separately from `closed`: a self-induced fault can be discovered
    /// inside `complete_ok` (write end already closed ok) and must still
    /// fire exactly once, just like a sibling-induced fault discovered
    /// later through `complete_err`.
    on_error_fired: bool,
    result: Option<R>,
}

impl<R: Send + 'static> BranchState<R> {
    /// Validate `config`, create its buffer, and spawn its consumer task
    /// immediately (so it is ready to receive bytes as soon as the
    /// coordinator's read loop produces the first view).
    pub(crate) fn spawn(
        id: BranchId,
        config: BranchConfig<R>,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = BranchBuffer::new(config.block_after, config.resume_after);
        let reader = buffer.reader();
        let fut = (config.consumer)(reader, cancel);
        let consumer_task = tokio::spawn(fut);
        tracing::debug!(branch = %id, "spawned consumer task");
        Self {
            id,
            buffer,
            consumer_task,
            on_error: config.on_error,
            remaining_quota: config.max_total_bytes,
            stopped: false,
            closed: false,
            on_error_fired: false,
            result: None,
        }
    }

    pub(crate) fn id(&self) -> BranchId {
        self.id
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// The coordinator's producer-side call: forward `data` (already the
    /// full, un-clipped view for this pass) to this branch, clipping it to
    /// the branch's remaining quota first.
    pub(crate) async fn write(&mut self, data: &[u8]) -> WriteOutcome {
        if self.stopped {
            return WriteOutcome::Stop;
        }

        if self.consumer_task.is_finished() {
            return match (&mut self.consumer_task).await {
                Ok(value) => {
                    self.result = Some(value);
                    self.stopped = true;
                    WriteOutcome::Stop
                }
                Err(join_err) => {
                    self.stopped = true;
                    WriteOutcome::Fault(BifurcationError::consumer_panicked(join_err))
                }
            };
        }

        let clip_len = match self.remaining_quota {
            Some(quota) => (data.len() as u64).min(quota) as usize,
            None => data.len(),
        };
        let clipped = &data[..clip_len];

        let consumer_closed = self.buffer.write(clipped).await;

        if let Some(quota) = self.remaining_quota.as_mut() {
            *quota -= clip_len as u64;
        }
        let quota_exhausted = self.remaining_quota == Some(0);

        if quota_exhausted || consumer_closed {
            self.stopped = true;
            tracing::debug!(
                branch = %self.id,
                quota_exhausted,
                consumer_closed,
                "branch reached completion"
            );
            WriteOutcome::Stop
        } else {
            WriteOutcome::Continue
        }
    }

    /// Close the branch's write end with success, await its consumer task,
    /// and harvest the result. Idempotent: a second call returns
    /// `Ok(None)` without touching the buffer or task again.
    ///
    /// A consumer fault discovered here (the task finishes normally from
    /// the coordinator's point of view, but turns out to have panicked) is
    /// self-induced: per this crate's error-handling design, `on_error`
    /// fires for it just as it would if a sibling branch had caused the
    /// failure, so it is fired here rather than left for a later
    /// [`BranchState::complete_err`] call that will never see this branch
    /// again (its write end is already closed ok).
    pub(crate) async fn complete_ok(&mut self) -> Result<Option<R>, BifurcationError> {
        self.stopped = true;
        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        self.buffer.close_ok();
        match (&mut self.consumer_task).await {
            Ok(value) => {
                self.result = Some(value);
                Ok(self.result.take())
            }
            Err(join_err) => {
                let err = BifurcationError::consumer_panicked(join_err);
                self.fire_on_error(&err);
                Err(err)
            }
        }
    }

    /// Close the branch's write end with `err`, await its consumer task
    /// swallowing any failure, and fire `on_error` if configured and not
    /// already fired for this branch. Never returns an error itself.
    /// Idempotent.
    pub(crate) async fn complete_err(&mut self, err: BifurcationError) -> Option<R> {
        self.stopped = true;
        if !self.closed {
            self.closed = true;
            self.buffer.close_err(err.clone());
            self.result = match (&mut self.consumer_task).await {
                Ok(value) => Some(value),
                Err(join_err) => {
                    tracing::debug!(branch = %self.id, %join_err, "consumer also failed during fanout");
                    None
                }
            };
        }
        self.fire_on_error(&err);
        self.result.take()
    }

    /// Invoke `on_error` with `err`, swallowing any panic from the
    /// callback. No-op if already fired for this branch (either from a
    /// prior call, or from a self-induced fault surfaced through
    /// [`BranchState::complete_ok`]).
    fn fire_on_error(&mut self, err: &BifurcationError) {
        if self.on_error_fired {
            return;
        }
        self.on_error_fired = true;
        if let Some(on_error) = self.on_error.clone() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| on_error(err))).is_err() {
                tracing::debug!(branch = %self.id, "on_error callback panicked; ignoring");
            }
        }
    }
}
