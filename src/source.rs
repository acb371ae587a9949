//! The source abstraction (C1): peek-and-advance access to the upstream
//! byte stream.
//!
//! A peek must not copy past what is already buffered; the caller then
//! tells the source how much of what it saw was actually consumed
//! (`advance_consumed`) versus merely examined (`advance_examined`, used by
//! the coordinator's minimum-buffer coalescing rule to retain a prefix
//! across re-peeks without losing it).

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BifurcationError, ErrorKind};

/// A source the coordinator can pull bytes from exactly once.
///
/// Implement this directly for a "native" peek-and-advance handle (for
/// example a process pipe reader that already exposes zero-copy peeks).
/// For anything that only offers `tokio::io::AsyncRead`, use
/// [`AsyncReadSource`] instead; for a native `tokio::io::AsyncBufRead`
/// handle, use [`PipeReaderSource`].
pub trait Source: Send {
    /// Return the currently available unconsumed bytes and whether the
    /// source has reached its end. Must not copy past what is already
    /// buffered internally.
    async fn peek(&mut self) -> Result<(&[u8], bool), BifurcationError>;

    /// Mark the first `n` bytes returned by the last `peek` as fully
    /// consumed; they will not be returned by a future `peek`.
    fn advance_consumed(&mut self, n: usize);

    /// Mark the first `n` bytes returned by the last `peek` as examined but
    /// not consumed: the next `peek` must return at least that same prefix,
    /// plus any newly arrived bytes. Used by the minimum-buffer coalescing
    /// rule.
    fn advance_examined(&mut self, n: usize);

    /// Called once the coordinator finishes successfully.
    async fn close_ok(&mut self);

    /// Called once the coordinator fails. `err` is the same
    /// [`BifurcationError`] that gets fanned out to every branch.
    async fn close_err(&mut self, err: &BifurcationError);
}

/// Object-safe bridge between "a concrete reader type `S`" and "read, and
/// maybe shut down on teardown", so [`AsyncReadSource`] can hold one without
/// itself staying generic over `S`.
///
/// The obvious alternative — keep `AsyncReadSource<S>` generic and pick
/// shutdown behavior by whether `S: AsyncWrite` — doesn't work: that choice
/// would have to be made *inside* `peek`/`close_ok`, which are only generic
/// over `S: AsyncRead`, and Rust's method resolution for a generic function
/// body only sees bounds provable at that point, not what `S` happens to be
/// monomorphized to. So the choice is made once, at construction, by
/// picking which of the two wrapper types below to box up.
trait Readable: Send {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

    fn shutdown<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

struct NoShutdown<S>(S);

impl<S: AsyncRead + Unpin + Send> Readable for NoShutdown<S> {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move { self.0.read(buf).await })
    }

    fn shutdown<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {})
    }
}

struct WithShutdown<S>(S);

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Readable for WithShutdown<S> {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move { self.0.read(buf).await })
    }

    fn shutdown<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.0.shutdown().await {
                tracing::debug!(%e, "source shutdown failed; ignoring");
            }
        })
    }
}

/// Adapts any [`tokio::io::AsyncRead`] into the peek-and-advance contract.
///
/// The internal accumulation buffer is a growable `Vec<u8>` with read and
/// write cursors, compacted down to offset zero whenever the unconsumed
/// region needs more room. This is what lets `advance_examined` retain a
/// small prefix across re-peeks (for coalescing) without copying on every
/// call — compaction only happens when genuinely needed to make room for
/// the next underlying read.
pub struct AsyncReadSource {
    inner: Box<dyn Readable>,
    data: Vec<u8>,
    /// Start of the unconsumed-and-possibly-examined region.
    rd: usize,
    /// End of valid data.
    wr: usize,
    eof: bool,
    leave_open: bool,
}

const READ_CHUNK: usize = 64 * 1024;

impl AsyncReadSource {
    /// Wrap a read-only (or read-mostly) source. The underlying reader is
    /// left open on teardown iff `leave_open` is `true`; otherwise
    /// `close_ok`/`close_err` are no-ops beyond that, since a plain
    /// `AsyncRead` has no shutdown handshake to run.
    pub fn new<S>(inner: S, leave_open: bool) -> Self
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        Self::from_readable(Box::new(NoShutdown(inner)), leave_open)
    }

    /// Wrap a bidirectional stream (e.g. a socket). The underlying stream is
    /// left open on teardown iff `leave_open` is `true`; otherwise
    /// `close_ok`/`close_err` call [`tokio::io::AsyncWriteExt::shutdown`] on
    /// it, swallowing any error from the shutdown handshake itself.
    pub fn new_bidirectional<S>(inner: S, leave_open: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_readable(Box::new(WithShutdown(inner)), leave_open)
    }

    fn from_readable(inner: Box<dyn Readable>, leave_open: bool) -> Self {
        Self {
            inner,
            data: Vec::new(),
            rd: 0,
            wr: 0,
            eof: false,
            leave_open,
        }
    }

    fn make_room(&mut self, reserve: usize) {
        if self.rd == self.wr {
            self.rd = 0;
            self.wr = 0;
        }
        let needed = self.wr + reserve;
        if needed > self.data.len() {
            // Compact the unread prefix down to offset zero before growing,
            // exactly as the teacher's `PBufWr::make_space_aux` does.
            if self.rd > 0 {
                self.data.copy_within(self.rd..self.wr, 0);
                self.wr -= self.rd;
                self.rd = 0;
            }
            let needed = self.wr + reserve;
            if needed > self.data.len() {
                let new_cap = needed.max(self.data.len() * 2).max(reserve * 2);
                self.data.resize(new_cap, 0);
            }
        }
    }
}

impl Source for AsyncReadSource {
    async fn peek(&mut self) -> Result<(&[u8], bool), BifurcationError> {
        // A peek always tries to pull in one more underlying read when the
        // source hasn't hit EOF yet, not only when the buffer is empty.
        // The coalescing rule re-peeks after `advance_examined` without
        // consuming anything, leaving `rd < wr`; that re-peek must still
        // grow the retained prefix with newly arrived bytes, or coalescing
        // would spin forever re-returning the same short view.
        if !self.eof {
            self.make_room(READ_CHUNK);
            let n = self
                .inner
                .read(&mut self.data[self.wr..self.wr + READ_CHUNK])
                .await
                .map_err(|e| BifurcationError::new(ErrorKind::SourceFailure, e))?;
            if n == 0 {
                self.eof = true;
            } else {
                self.wr += n;
            }
        }
        // `completed` reports that the *upstream* source is exhausted, not
        // that this view has been drained — the coordinator still needs to
        // see the final, possibly sub-minimum, view once EOF is reached so
        // it can forward it instead of coalescing forever.
        Ok((&self.data[self.rd..self.wr], self.eof))
    }

    fn advance_consumed(&mut self, n: usize) {
        self.rd += n;
        debug_assert!(self.rd <= self.wr);
    }

    fn advance_examined(&mut self, _n: usize) {
        // The examined prefix is already retained between `self.rd` and
        // `self.wr`; the next `peek` will read more data in behind it. No
        // bookkeeping is needed beyond what `peek` already does, since this
        // adapter never discards examined data until it's explicitly
        // consumed.
    }

    async fn close_ok(&mut self) {
        if !self.leave_open {
            self.inner.shutdown().await;
        }
    }

    async fn close_err(&mut self, _err: &BifurcationError) {
        if !self.leave_open {
            self.inner.shutdown().await;
        }
    }
}

/// Object-safe bridge between a concrete `AsyncBufRead` type and "peek its
/// buffer, consume from it, maybe shut down" — the `PipeReaderSource`
/// analogue of [`Readable`], for the same reason: the shutdown choice has
/// to be made once at construction, not inside a function generic only
/// over `AsyncBufRead`.
trait BufReadable: Send {
    fn fill_buf<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = io::Result<&'a [u8]>> + Send + 'a>>;

    fn consume(&mut self, amt: usize);

    fn shutdown<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

struct NoShutdownBuf<S>(S);

impl<S: AsyncBufRead + Unpin + Send> BufReadable for NoShutdownBuf<S> {
    fn fill_buf<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = io::Result<&'a [u8]>> + Send + 'a>> {
        Box::pin(async move { AsyncBufReadExt::fill_buf(&mut self.0).await })
    }

    fn consume(&mut self, amt: usize) {
        AsyncBufReadExt::consume(&mut self.0, amt);
    }

    fn shutdown<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {})
    }
}

struct WithShutdownBuf<S>(S);

impl<S: AsyncBufRead + AsyncWrite + Unpin + Send> BufReadable for WithShutdownBuf<S> {
    fn fill_buf<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = io::Result<&'a [u8]>> + Send + 'a>> {
        Box::pin(async move { AsyncBufReadExt::fill_buf(&mut self.0).await })
    }

    fn consume(&mut self, amt: usize) {
        AsyncBufReadExt::consume(&mut self.0, amt);
    }

    fn shutdown<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.0.shutdown().await {
                tracing::debug!(%e, "source shutdown failed; ignoring");
            }
        })
    }
}

/// Adapts a native [`tokio::io::AsyncBufRead`] handle (for example a
/// buffered pipe or file reader) directly into the peek-and-advance
/// contract, without the intermediate accumulation buffer
/// [`AsyncReadSource`] needs: `peek` is just `fill_buf`, `advance_consumed`
/// is just `consume`.
///
/// This directness has a real limitation: [`tokio::io::AsyncBufRead`]'s
/// contract only attempts a new underlying read when the buffer is fully
/// drained, so `advance_examined` cannot make a re-peek return a *larger*
/// view the way `AsyncReadSource`'s own accumulator can — there is nothing
/// to compact into. `advance_examined` is therefore a documented no-op
/// here. Callers that need the minimum-buffer coalescing rule
/// (`SourceConfig::with_min_read_buffer_size`) should use [`AsyncReadSource`]
/// instead; using it with `PipeReaderSource` will re-peek the same
/// short view until the handle's own internal buffer happens to fill past
/// the minimum on its own, which may never happen.
pub struct PipeReaderSource {
    inner: Box<dyn BufReadable>,
    leave_open: bool,
}

impl PipeReaderSource {
    /// Wrap a read-only buffered handle. The underlying reader is left open
    /// on teardown iff `leave_open` is `true`.
    pub fn new<S>(inner: S, leave_open: bool) -> Self
    where
        S: AsyncBufRead + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(NoShutdownBuf(inner)),
            leave_open,
        }
    }

    /// Wrap a bidirectional buffered stream. The underlying stream is left
    /// open on teardown iff `leave_open` is `true`; otherwise
    /// `close_ok`/`close_err` call [`tokio::io::AsyncWriteExt::shutdown`] on
    /// it.
    pub fn new_bidirectional<S>(inner: S, leave_open: bool) -> Self
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(WithShutdownBuf(inner)),
            leave_open,
        }
    }
}

impl Source for PipeReaderSource {
    async fn peek(&mut self) -> Result<(&[u8], bool), BifurcationError> {
        let view = self
            .inner
            .fill_buf()
            .await
            .map_err(|e| BifurcationError::new(ErrorKind::SourceFailure, e))?;
        let completed = view.is_empty();
        Ok((view, completed))
    }

    fn advance_consumed(&mut self, n: usize) {
        self.inner.consume(n);
    }

    fn advance_examined(&mut self, _n: usize) {
        // See the type's doc comment: `AsyncBufRead` only reads more once
        // the buffer is drained, so there's nothing this adapter can do to
        // grow a re-peeked view without consuming it first.
    }

    async fn close_ok(&mut self) {
        if !self.leave_open {
            self.inner.shutdown().await;
        }
    }

    async fn close_err(&mut self, _err: &BifurcationError) {
        if !self.leave_open {
            self.inner.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peeks_full_buffer_then_reports_eof() {
        let data: &[u8] = b"Test Value";
        let mut source = AsyncReadSource::new(data, false);
        let (view, completed) = source.peek().await.unwrap();
        assert_eq!(view, b"Test Value");
        assert!(!completed);
        let len = view.len();
        source.advance_consumed(len);
        let (view, completed) = source.peek().await.unwrap();
        assert!(view.is_empty());
        assert!(completed);
    }

    #[tokio::test]
    async fn advance_examined_retains_prefix_across_repeeks() {
        // A reader that yields two bytes at a time, five times, then EOF.
        struct Chunky {
            remaining: Vec<&'static [u8]>,
        }
        impl AsyncRead for Chunky {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if let Some(chunk) = self.remaining.pop() {
                    buf.put_slice(chunk);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }
        let mut source = AsyncReadSource::new(
            Chunky {
                remaining: vec![b"EF", b"CD", b"AB"],
            },
            false,
        );
        let (view, _completed) = source.peek().await.unwrap();
        assert_eq!(view, b"AB");
        let len = view.len();
        source.advance_examined(len);
        let (view, _completed) = source.peek().await.unwrap();
        assert_eq!(view, b"ABCD");
        let len = view.len();
        source.advance_consumed(len);
    }

    #[tokio::test]
    async fn bidirectional_source_shuts_down_on_close_unless_left_open() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut source = AsyncReadSource::new_bidirectional(client, false);
        source.close_ok().await;
        // The peer observes EOF once the shutdown handshake has run.
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn pipe_reader_source_peeks_and_consumes_without_accumulator() {
        let data: &[u8] = b"Test Value";
        let mut source = PipeReaderSource::new(data, false);
        let (view, completed) = source.peek().await.unwrap();
        assert_eq!(view, b"Test Value");
        assert!(!completed);
        let len = view.len();
        source.advance_consumed(len);
        let (view, completed) = source.peek().await.unwrap();
        assert!(view.is_empty());
        assert!(completed);
    }
}
