//! The per-branch bounded byte buffer (C2).
//!
//! The underlying byte storage is a growable `Vec<u8>` with a read cursor
//! and a write cursor, compacted down to offset zero whenever the
//! unconsumed region needs more room before it grows the backing
//! allocation. Asynchronous backpressure and end-of-stream signaling sit on
//! top of that storage, since here the producer and consumer run as
//! independent `tokio` tasks rather than sharing a single-threaded driver
//! loop.
//!
//! [`BranchBuffer`] is the producer-facing handle (owned exclusively by the
//! coordinator's [`crate::branch::BranchState`]); [`BranchReader`] is the
//! consumer-facing handle (owned exclusively by the spawned consumer task).
//! Both wrap the same `Arc<Shared>`, splitting a single buffer into two
//! role-restricted references.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;

use crate::error::BifurcationError;

enum EndState {
    Open,
    Closed,
    Failed(BifurcationError),
}

struct Inner {
    data: Vec<u8>,
    rd: usize,
    wr: usize,
    produced: u64,
    consumed: u64,
    end: EndState,
    consumer_closed: bool,
}

impl Inner {
    /// Append `bytes` to the buffer, compacting the unconsumed region down
    /// to offset zero first if that's needed to make room, and growing the
    /// backing `Vec` only as a last resort. Callers always have the whole
    /// chunk in hand already, so there's no separate "reserve space, then
    /// write into it" step.
    fn append(&mut self, bytes: &[u8]) {
        if self.rd == self.wr {
            self.rd = 0;
            self.wr = 0;
        }
        let needed = self.wr + bytes.len();
        if needed > self.data.len() {
            if self.rd > 0 {
                self.data.copy_within(self.rd..self.wr, 0);
                self.wr -= self.rd;
                self.rd = 0;
            }
            let needed = self.wr + bytes.len();
            if needed > self.data.len() {
                let new_cap = needed.max(self.data.len() * 2).max(bytes.len());
                self.data.resize(new_cap, 0);
            }
        }
        self.data[self.wr..self.wr + bytes.len()].copy_from_slice(bytes);
        self.wr += bytes.len();
        self.produced += bytes.len() as u64;
    }

    fn backlog(&self) -> usize {
        self.wr - self.rd
    }
}

/// The shared byte queue backing one branch. Not exposed directly; see
/// [`BranchBuffer`] (producer role) and [`BranchReader`] (consumer role).
struct Shared {
    block_after: usize,
    resume_after: usize,
    inner: Mutex<Inner>,
    /// Notified by the consumer whenever it reads enough data (or closes)
    /// to potentially unblock a suspended producer.
    space_freed: Notify,
    /// Notified by the producer whenever it writes data or closes the
    /// stream, to wake a consumer blocked waiting for more bytes.
    data_ready: Notify,
}

/// Producer-facing handle over a branch's byte buffer.
///
/// Owned exclusively by the coordinator (via [`crate::branch::BranchState`]).
pub(crate) struct BranchBuffer {
    shared: Arc<Shared>,
}

impl BranchBuffer {
    /// Create a fresh, empty branch buffer with the given watermarks,
    /// returning the producer handle. Call [`BranchBuffer::reader`] to
    /// obtain the matching consumer handle before spawning the consumer
    /// task.
    pub(crate) fn new(block_after: usize, resume_after: usize) -> Self {
        debug_assert!(block_after > 0);
        debug_assert!(resume_after <= block_after);
        let shared = Arc::new(Shared {
            block_after,
            resume_after,
            inner: Mutex::new(Inner {
                data: Vec::new(),
                rd: 0,
                wr: 0,
                produced: 0,
                consumed: 0,
                end: EndState::Open,
                consumer_closed: false,
            }),
            space_freed: Notify::new(),
            data_ready: Notify::new(),
        });
        Self { shared }
    }

    /// Obtain the consumer-facing reader for this buffer. Intended to be
    /// called exactly once, before the consumer task is spawned.
    pub(crate) fn reader(&self) -> BranchReader {
        BranchReader {
            shared: self.shared.clone(),
            pending: None,
        }
    }

    /// Append `data` to the buffer. If the backlog crosses `block_after`,
    /// suspends until the consumer drains it back down to `resume_after` or
    /// closes its end. Returns `true` if the consumer end has closed and
    /// the producer must stop writing to this branch.
    pub(crate) async fn write(&self, data: &[u8]) -> bool {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.consumer_closed {
                return true;
            }
            inner.append(data);
        }
        self.shared.data_ready.notify_waiters();

        let mut suspended = false;
        loop {
            // Enroll with `Notify` *before* inspecting shared state: if the
            // consumer drains the buffer and calls `notify_waiters` between
            // our check and our wait, a `notified()` created only after the
            // check would miss that wakeup entirely (`notify_waiters` does
            // not leave a permit behind for later waiters) and we'd suspend
            // forever. Enrolling first means any notification racing with
            // our check is either captured by this `Notified` or already
            // reflected in the state we read under the lock.
            let notified = self.shared.space_freed.notified();
            let (backlog, closed) = {
                let inner = self.shared.inner.lock().unwrap();
                (inner.backlog(), inner.consumer_closed)
            };
            if closed {
                return true;
            }
            let threshold = if suspended {
                self.shared.resume_after
            } else {
                self.shared.block_after
            };
            if backlog <= threshold {
                if suspended {
                    tracing::trace!(backlog, resume_after = self.shared.resume_after, "producer resumed");
                }
                return false;
            }
            if !suspended {
                tracing::trace!(backlog, block_after = self.shared.block_after, "producer suspended");
            }
            suspended = true;
            notified.await;
        }
    }

    /// Signal a clean end-of-stream to the consumer. Idempotent: calling
    /// this after the stream is already closed or failed has no effect.
    pub(crate) fn close_ok(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if matches!(inner.end, EndState::Open) {
            inner.end = EndState::Closed;
        }
        drop(inner);
        self.shared.data_ready.notify_waiters();
    }

    /// Signal an end-of-stream carrying `err` to the consumer. Subsequent
    /// reads past the already-buffered bytes surface `err`. Idempotent.
    pub(crate) fn close_err(&self, err: BifurcationError) {
        let mut inner = self.shared.inner.lock().unwrap();
        if matches!(inner.end, EndState::Open) {
            inner.end = EndState::Failed(err);
        }
        drop(inner);
        self.shared.data_ready.notify_waiters();
    }

    /// Current number of bytes written but not yet consumed. Used by tests
    /// to check the bounded-memory invariant.
    #[cfg(test)]
    pub(crate) fn backlog(&self) -> usize {
        self.shared.inner.lock().unwrap().backlog()
    }
}

/// Consumer-facing handle over a branch's byte buffer, handed to the
/// user-supplied consumer closure.
pub struct BranchReader {
    shared: Arc<Shared>,
    /// Backs the [`AsyncRead`] impl: a suspended `wait_for_data` call that
    /// `poll_read` is re-polling to register its waker with `data_ready`.
    /// `None` whenever no such wait is in flight.
    pending: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl BranchReader {
    /// Read up to `buf.len()` bytes into `buf`.
    ///
    /// Returns `Ok(0)` on a clean end-of-stream, `Ok(n > 0)` when data is
    /// available, and `Err` once a failure has been fanned out to this
    /// branch (including, most commonly, a sibling branch's failure).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BifurcationError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // See the matching comment in `BranchBuffer::write`: enroll
            // before checking, or a write landing between our check and our
            // wait would be silently dropped by `notify_waiters`.
            let notified = self.shared.data_ready.notified();
            {
                let mut inner = self.shared.inner.lock().unwrap();
                let avail = inner.backlog();
                if avail > 0 {
                    let n = avail.min(buf.len());
                    buf[..n].copy_from_slice(&inner.data[inner.rd..inner.rd + n]);
                    inner.rd += n;
                    inner.consumed += n as u64;
                    let notify_space = inner.backlog() <= self.shared.resume_after;
                    drop(inner);
                    if notify_space {
                        self.shared.space_freed.notify_waiters();
                    }
                    return Ok(n);
                }
                match &inner.end {
                    EndState::Open => {}
                    EndState::Closed => return Ok(0),
                    EndState::Failed(e) => return Err(e.clone()),
                }
            }
            notified.await;
        }
    }

    /// Read all remaining bytes into a freshly allocated `Vec<u8>`. A
    /// convenience wrapper over [`BranchReader::read`] for consumers that
    /// just want the whole branch's share of the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, BifurcationError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Borrow the current contiguous unread region without copying it.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream once every byte has been
    /// consumed via the returned [`ReadChunk`]s, and `Err` once a failure
    /// has been fanned out to this branch. Unlike [`BranchReader::read`],
    /// this never blocks waiting for more bytes to arrive: call it again
    /// after awaiting readiness some other way (e.g. via the
    /// [`tokio::io::AsyncRead`] impl) if it returns an empty chunk on an
    /// open stream.
    pub fn read_chunk(&mut self) -> Result<Option<ReadChunk<'_>>, BifurcationError> {
        let inner = self.shared.inner.lock().unwrap();
        if inner.backlog() == 0 {
            if let EndState::Closed = &inner.end {
                return Ok(None);
            }
            if let EndState::Failed(e) = &inner.end {
                return Err(e.clone());
            }
        }
        Ok(Some(ReadChunk {
            inner,
            shared: &self.shared,
        }))
    }

    /// Voluntarily stop reading. The producer observes this on its next
    /// `write` call and stops sending bytes to this branch. Equivalent to
    /// dropping the reader, spelled out for clarity at call sites.
    pub fn finish(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.consumer_closed = true;
        drop(inner);
        self.shared.space_freed.notify_waiters();
    }
}

/// A zero-copy view of a [`BranchReader`]'s currently buffered, unconsumed
/// bytes, returned by [`BranchReader::read_chunk`]. Holds the buffer's lock
/// for its lifetime; consume it promptly.
pub struct ReadChunk<'a> {
    inner: MutexGuard<'a, Inner>,
    shared: &'a Shared,
}

impl<'a> ReadChunk<'a> {
    /// The currently available unconsumed bytes. Empty iff the stream is
    /// open but has no data buffered right now.
    pub fn bytes(&self) -> &[u8] {
        &self.inner.data[self.inner.rd..self.inner.wr]
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Mark the first `n` bytes of [`ReadChunk::bytes`] as consumed,
    /// releasing the lock and waking a suspended producer if this drains
    /// the backlog down to the resume watermark.
    pub fn consume(mut self, n: usize) {
        debug_assert!(n <= self.bytes().len());
        self.inner.rd += n;
        self.inner.consumed += n as u64;
        let notify_space = self.inner.backlog() <= self.shared.resume_after;
        let shared = self.shared;
        drop(self.inner);
        if notify_space {
            shared.space_freed.notify_waiters();
        }
    }
}

/// Bridges a [`BifurcationError`] into [`std::io::Error`]'s source chain for
/// [`BranchReader`]'s [`AsyncRead`] impl. Not built with `thiserror`'s
/// `#[source]` because that attribute requires the field to itself
/// implement `std::error::Error`, and forwarding through a second
/// `BifurcationError`-shaped wrapper here would repeat exactly the
/// chain-breaking mistake this crate's failure-fanout path had to fix
/// elsewhere: `source()` must return the *original* cause, not this
/// wrapper's own `Display`.
#[derive(Debug)]
struct ReadFault(BifurcationError);

impl std::fmt::Display for ReadFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ReadFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl AsyncRead for BranchReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Same enroll-before-check discipline as `BranchReader::read`,
            // adapted to polling: a `Notify::notified()` future only starts
            // guarding against missed wakeups from the moment it is first
            // polled (that's when it actually registers with `data_ready`),
            // not from the moment the `Pin<Box<dyn Future>>` wrapping it is
            // constructed. So `pending` is polled once *before* the state
            // check below, every time it's freshly created, to make sure
            // the registration has happened first; a write landing after
            // this poll either shows up in the state we read next or wakes
            // the waker this poll just registered.
            if this.pending.is_none() {
                let shared = this.shared.clone();
                this.pending = Some(Box::pin(async move {
                    shared.data_ready.notified().await;
                }));
            }
            let wait = this.pending.as_mut().expect("just ensured Some above");
            let wait_fired = wait.as_mut().poll(cx).is_ready();
            if wait_fired {
                this.pending = None;
            }

            {
                let mut inner = this.shared.inner.lock().unwrap();
                let avail = inner.backlog();
                if avail > 0 {
                    let n = avail.min(buf.remaining());
                    buf.put_slice(&inner.data[inner.rd..inner.rd + n]);
                    inner.rd += n;
                    inner.consumed += n as u64;
                    let notify_space = inner.backlog() <= this.shared.resume_after;
                    drop(inner);
                    if notify_space {
                        this.shared.space_freed.notify_waiters();
                    }
                    this.pending = None;
                    return Poll::Ready(Ok(()));
                }
                match &inner.end {
                    EndState::Open => {}
                    EndState::Closed => {
                        this.pending = None;
                        return Poll::Ready(Ok(()));
                    }
                    EndState::Failed(e) => {
                        let e = e.clone();
                        drop(inner);
                        this.pending = None;
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            ReadFault(e),
                        )));
                    }
                }
            }

            if !wait_fired {
                return Poll::Pending;
            }
            // The notification we were enrolled for already fired; loop
            // back to enroll a fresh one and re-check state under its
            // protection rather than returning Pending with no waker armed.
        }
    }
}

impl Drop for BranchReader {
    fn drop(&mut self) {
        self.finish();
    }
}
