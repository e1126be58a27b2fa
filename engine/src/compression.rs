//! Streaming compression and decompression.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

/// Compression applied to an artifact.
///
/// Recorded in the backup document so a reader selects the inverse
/// transform without guessing from key suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionType {
    /// No compression.
    #[serde(rename = "none")]
    None,

    /// Gzip.
    #[default]
    #[serde(rename = "gzip")]
    Gzip,

    /// ZSTD.
    #[serde(rename = "zstd")]
    Zstd,
}

/// A streaming multi-codec compressor.
#[pin_project(project = CompProj)]
pub enum Compressor<S: AsyncBufRead> {
    /// Passthrough.
    None(#[pin] S),
    /// Gzip compression.
    Gzip(#[pin] GzipEncoder<S>),
    /// Zstd compression.
    Zstd(#[pin] ZstdEncoder<S>),
}

/// A streaming multi-codec decompressor.
#[pin_project(project = DecompProj)]
pub enum Decompressor<S: AsyncBufRead> {
    /// Passthrough.
    None(#[pin] S),
    /// Gzip decompression.
    Gzip(#[pin] GzipDecoder<S>),
    /// Zstd decompression.
    Zstd(#[pin] ZstdDecoder<S>),
}

impl<S: AsyncBufRead> Compressor<S> {
    /// Creates a new streaming compressor from a buffered stream.
    pub fn new(inner: S, kind: CompressionType) -> Self {
        match kind {
            CompressionType::None => Self::None(inner),
            CompressionType::Gzip => Self::Gzip(GzipEncoder::new(inner)),
            CompressionType::Zstd => Self::Zstd(ZstdEncoder::new(inner)),
        }
    }
}

impl<U: AsyncRead> Compressor<BufReader<U>> {
    /// Creates a new streaming compressor from an unbuffered stream.
    pub fn new_unbuffered(inner: U, kind: CompressionType) -> Self {
        Self::new(BufReader::new(inner), kind)
    }
}

impl<S: AsyncBufRead> Decompressor<S> {
    /// Creates a new streaming decompressor from a buffered stream.
    pub fn new(inner: S, kind: CompressionType) -> Self {
        match kind {
            CompressionType::None => Self::None(inner),
            CompressionType::Gzip => Self::Gzip(GzipDecoder::new(inner)),
            CompressionType::Zstd => Self::Zstd(ZstdDecoder::new(inner)),
        }
    }
}

impl<U: AsyncRead> Decompressor<BufReader<U>> {
    /// Creates a new streaming decompressor from an unbuffered stream.
    pub fn new_unbuffered(inner: U, kind: CompressionType) -> Self {
        Self::new(BufReader::new(inner), kind)
    }
}

impl<S: AsyncBufRead> AsyncRead for Compressor<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            CompProj::None(i) => i.poll_read(cx, buf),
            CompProj::Gzip(i) => i.poll_read(cx, buf),
            CompProj::Zstd(i) => i.poll_read(cx, buf),
        }
    }
}

impl<S: AsyncBufRead> AsyncRead for Decompressor<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            DecompProj::None(i) => i.poll_read(cx, buf),
            DecompProj::Gzip(i) => i.poll_read(cx, buf),
            DecompProj::Zstd(i) => i.poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio_test::block_on;

    #[test]
    fn test_round_trip() {
        for kind in [
            CompressionType::None,
            CompressionType::Gzip,
            CompressionType::Zstd,
        ] {
            let payload: Vec<u8> = (0..100_000u32).map(|n| (n % 251) as u8).collect();

            let mut compressed = Vec::new();
            let mut compressor = Compressor::new_unbuffered(payload.as_slice(), kind);
            block_on(compressor.read_to_end(&mut compressed)).unwrap();

            let mut decompressed = Vec::new();
            let mut decompressor = Decompressor::new_unbuffered(compressed.as_slice(), kind);
            block_on(decompressor.read_to_end(&mut decompressed)).unwrap();

            assert_eq!(payload, decompressed, "{:?}", kind);
        }
    }
}
