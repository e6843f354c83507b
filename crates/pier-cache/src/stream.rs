use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Chunk size for stream copies through the cache.
const CHUNK_BYTES: usize = 64 * 1024;

/// Default pipe depth: enough to decouple producer and consumer bursts
/// without buffering whole objects in memory.
pub const DEFAULT_PIPE_CAPACITY: usize = 8;

pub(crate) fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "request cancelled")
}

/// A bounded in-memory byte pipe with explicit error close.
///
/// Dropping the writer signals clean EOF; `close_with_error` makes the
/// reader observe the producer's failure instead of a truncated stream.
pub fn byte_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            pending: Bytes::new(),
        },
    )
}

#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl PipeWriter {
    /// Send one chunk. Returns false once the reader is gone (or the writer
    /// was already closed); the producer should stop feeding this side.
    pub async fn send(&mut self, chunk: Bytes) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(chunk)).await.is_ok(),
            None => false,
        }
    }

    /// Close the pipe so the reader observes `err` after the bytes already
    /// queued.
    pub async fn close_with_error(&mut self, err: io::Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err)).await;
        }
    }

    /// Close the pipe with a clean EOF.
    pub fn finish(&mut self) {
        self.tx = None;
    }
}

#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.pending = bytes;
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Copy `src` into a mandatory primary consumer and an optional secondary
/// one.
///
/// This is the cache's tee: one producer task, two bounded channels. The
/// secondary (cache-fill or cache-write) side is detachable: if its reader
/// goes away the copy keeps feeding the primary. A primary failure or a
/// source failure closes both sides with the observed error. Cancellation
/// closes both sides with an interrupted error.
///
/// Returns the number of bytes drained from `src`.
pub async fn tee(
    mut src: impl AsyncRead + Unpin,
    mut primary: PipeWriter,
    mut secondary: Option<PipeWriter>,
    cancel: &CancellationToken,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(CHUNK_BYTES);

    loop {
        let read = tokio::select! {
            // Cancellation wins over a ready read.
            biased;
            _ = cancel.cancelled() => {
                let err = cancelled_error();
                primary.close_with_error(cancelled_error()).await;
                if let Some(mut writer) = secondary.take() {
                    writer.close_with_error(cancelled_error()).await;
                }
                return Err(err);
            }
            read = src.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                primary.finish();
                if let Some(mut writer) = secondary.take() {
                    writer.finish();
                }
                return Ok(total);
            }
            Ok(n) => {
                total += n as u64;
                let chunk = buf.split().freeze();

                if !primary.send(chunk.clone()).await {
                    // The primary consumer is gone; nothing left to serve.
                    let err = io::Error::new(io::ErrorKind::BrokenPipe, "consumer went away");
                    if let Some(mut writer) = secondary.take() {
                        writer
                            .close_with_error(io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                "primary consumer went away",
                            ))
                            .await;
                    }
                    return Err(err);
                }

                if let Some(writer) = secondary.as_mut() {
                    if !writer.send(chunk).await {
                        // Cache-side failure must not affect the primary.
                        secondary = None;
                    }
                }

                buf.reserve(CHUNK_BYTES);
            }
            Err(err) => {
                primary
                    .close_with_error(io::Error::new(err.kind(), err.to_string()))
                    .await;
                if let Some(mut writer) = secondary.take() {
                    writer
                        .close_with_error(io::Error::new(err.kind(), err.to_string()))
                        .await;
                }
                return Err(err);
            }
        }
    }
}

/// An `AsyncRead` adapter that folds everything it yields into a SHA-256.
///
/// Used by write-back PUTs: the cache must record a content fingerprint as
/// the provisional etag before any backend has seen the object.
pub struct HashingReader<R> {
    inner: R,
    hasher: std::sync::Arc<parking_lot::Mutex<sha2::Sha256>>,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        let hasher = std::sync::Arc::new(parking_lot::Mutex::new(<sha2::Sha256 as sha2::Digest>::new()));
        (
            Self {
                inner,
                hasher: hasher.clone(),
            },
            DigestHandle { hasher },
        )
    }
}

/// Handle to read the running digest once the stream has been consumed.
#[derive(Clone)]
pub struct DigestHandle {
    hasher: std::sync::Arc<parking_lot::Mutex<sha2::Sha256>>,
}

impl DigestHandle {
    /// Hex digest of the bytes hashed so far.
    pub fn hex(&self) -> String {
        use sha2::Digest;
        hex::encode(self.hasher.lock().clone().finalize())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        use sha2::Digest;

        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let new_bytes = &buf.filled()[before..];
            if !new_bytes.is_empty() {
                self.hasher.lock().update(new_bytes);
            }
        }
        result
    }
}
