//! Stream utilities.

use std::future::Future;
use std::marker::Unpin;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use digest::{Digest, Output as DigestOutput};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::OnceCell;
use tokio::time::{sleep_until, Instant, Sleep};

/// Stream filter that hashes the bytes that have been read.
///
/// The hash is finalized when EOF is reached.
pub struct StreamHasher<R: AsyncRead + Unpin, D: Digest + Unpin> {
    inner: R,
    digest: Option<D>,
    bytes_read: u64,
    finalized: Arc<OnceCell<(DigestOutput<D>, u64)>>,
}

/// Stream filter that limits the rate at which bytes are read.
///
/// A token bucket with a capacity of one second's worth of the configured
/// rate gates the inner reader. Bursts up to the bucket capacity pass
/// through immediately; beyond that the reader yields until enough tokens
/// have accumulated.
pub struct RateLimitedReader<R: AsyncRead + Unpin> {
    inner: R,
    /// Bytes per second. Zero disables limiting.
    rate: u64,
    tokens: f64,
    last_refill: Instant,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<R: AsyncRead + Unpin, D: Digest + Unpin> StreamHasher<R, D> {
    pub fn new(inner: R, digest: D) -> (Self, Arc<OnceCell<(DigestOutput<D>, u64)>>) {
        let finalized = Arc::new(OnceCell::new());

        (
            Self {
                inner,
                digest: Some(digest),
                bytes_read: 0,
                finalized: finalized.clone(),
            },
            finalized,
        )
    }
}

impl<R: AsyncRead + Unpin, D: Digest + Unpin> AsyncRead for StreamHasher<R, D> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        let old_filled = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read_len = buf.filled().len() - old_filled;

        match r {
            Poll::Ready(Ok(())) => {
                if read_len == 0 {
                    // EOF
                    if let Some(digest) = self.digest.take() {
                        let bytes_read = self.bytes_read;
                        self.finalized
                            .set((digest.finalize(), bytes_read))
                            .expect("Hash has already been finalized");
                    }
                } else {
                    // Read something
                    let digest = self.digest.as_mut().expect("Stream has data after EOF");

                    let filled = buf.filled();
                    digest.update(&filled[filled.len() - read_len..]);
                    self.bytes_read += read_len as u64;
                }
            }
            Poll::Ready(Err(_)) => {
                assert!(read_len == 0);
            }
            Poll::Pending => {}
        }

        r
    }
}

impl<R: AsyncRead + Unpin> RateLimitedReader<R> {
    pub fn new(inner: R, rate: u64) -> Self {
        Self {
            inner,
            rate,
            tokens: rate as f64,
            last_refill: Instant::now(),
            sleep: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.last_refill = now;
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        if self.rate == 0 {
            return Pin::new(&mut self.inner).poll_read(cx, buf);
        }

        if let Some(sleep) = self.sleep.as_mut() {
            match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.sleep = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        self.refill();

        if self.tokens < 1.0 {
            let deficit = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate as f64);
            let mut sleep = Box::pin(sleep_until(Instant::now() + wait));

            // Register the timer before parking
            match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {}
                Poll::Pending => {
                    self.sleep = Some(sleep);
                    return Poll::Pending;
                }
            }
        }

        let old_filled = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &r {
            let read_len = buf.filled().len() - old_filled;
            self.tokens -= read_len as f64;
        }

        r
    }
}

/// Greedily reads from a stream to fill a buffer.
pub async fn read_chunk_async<S: AsyncRead + Unpin + Send>(
    stream: &mut S,
    mut chunk: BytesMut,
) -> std::io::Result<Bytes> {
    while chunk.len() < chunk.capacity() {
        let read = stream.read_buf(&mut chunk).await?;

        if read == 0 {
            break;
        }
    }

    Ok(chunk.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio_test::block_on;

    #[test]
    fn test_stream_hasher() {
        let expected = b"hello world";
        let expected_sha256 =
            hex::decode("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
                .unwrap();

        let (mut read, finalized) = StreamHasher::new(expected.as_slice(), sha2::Sha256::new());
        assert!(finalized.get().is_none());

        // force multiple reads
        let mut buf = vec![0u8; 100];
        let mut bytes_read = 0;
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();
        bytes_read += block_on(read.read(&mut buf[bytes_read..bytes_read + 5])).unwrap();

        assert_eq!(expected.len(), bytes_read);
        assert_eq!(expected, &buf[..bytes_read]);

        let (hash, count) = finalized.get().expect("Hash wasn't finalized");

        assert_eq!(expected_sha256.as_slice(), hash.as_slice());
        assert_eq!(expected.len() as u64, *count);
    }

    #[test]
    fn test_read_chunk_async() {
        let data = b"some bytes";
        let chunk = block_on(read_chunk_async(
            &mut data.as_slice(),
            BytesMut::with_capacity(4),
        ))
        .unwrap();
        assert_eq!(b"some", &*chunk);
    }

    #[test]
    fn test_rate_limited_reader_passthrough() {
        // rate = 0 means unlimited
        let data = vec![42u8; 4096];
        let mut reader = RateLimitedReader::new(data.as_slice(), 0);
        let mut out = Vec::new();
        block_on(reader.read_to_end(&mut out)).unwrap();
        assert_eq!(data, out);
    }

    #[test]
    fn test_rate_limited_reader_burst() {
        // a burst within the bucket capacity completes without waiting
        let data = vec![42u8; 1024];
        let mut reader = RateLimitedReader::new(data.as_slice(), 1024 * 1024);
        let mut out = Vec::new();
        block_on(reader.read_to_end(&mut out)).unwrap();
        assert_eq!(data, out);
    }
}
