//! Streaming encryption of artifacts.
//!
//! Artifacts are enciphered as a sequence of AES-256-GCM envelopes:
//! `[u32-le ciphertext length][12-byte nonce][ciphertext]`. Every chunk
//! is independently authenticated, so decryption fails on any corrupted
//! or truncated chunk instead of producing garbage.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{EngineError, EngineResult};

/// Plaintext bytes per envelope.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Length prefix plus nonce.
const HEADER_SIZE: usize = 4 + 12;

/// AES-GCM authentication tag length.
const TAG_SIZE: usize = 16;

/// An encryption key parsed from the configuration.
#[derive(Clone)]
pub struct EncryptionKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Parses a hex-encoded 256-bit key.
    pub fn from_hex(hex_key: &str) -> EngineResult<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| EngineError::ConfigError(format!("invalid encryption key: {}", e)))?;

        if bytes.len() != 32 {
            return Err(EngineError::ConfigError(format!(
                "encryption key must be 32 bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)),
        })
    }
}

/// Stream filter that enciphers the bytes read from the inner stream.
pub struct EncryptingReader<R: AsyncRead + Unpin> {
    inner: R,
    key: EncryptionKey,
    input: BytesMut,
    output: Bytes,
    scratch: Box<[u8]>,
    inner_eof: bool,
    done: bool,
}

/// Stream filter that deciphers envelopes produced by [`EncryptingReader`].
pub struct DecryptingReader<R: AsyncRead + Unpin> {
    inner: R,
    key: EncryptionKey,
    buffer: BytesMut,
    output: Bytes,
    scratch: Box<[u8]>,
    inner_eof: bool,
}

impl<R: AsyncRead + Unpin> EncryptingReader<R> {
    pub fn new(inner: R, key: EncryptionKey) -> Self {
        Self {
            inner,
            key,
            input: BytesMut::with_capacity(CHUNK_SIZE),
            output: Bytes::new(),
            scratch: vec![0u8; 64 * 1024].into_boxed_slice(),
            inner_eof: false,
            done: false,
        }
    }

    fn seal_chunk(&mut self) -> io::Result<()> {
        let plaintext = self.input.split().freeze();
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .key
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "AEAD encryption failed"))?;

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + ciphertext.len());
        frame.put_u32_le(ciphertext.len() as u32);
        frame.put_slice(&nonce);
        frame.put_slice(&ciphertext);
        self.output = frame.freeze();

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if !this.output.is_empty() {
                let n = this.output.len().min(buf.remaining());
                buf.put_slice(&this.output[..n]);
                this.output.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.done {
                return Poll::Ready(Ok(()));
            }

            if this.inner_eof {
                this.done = true;
                if !this.input.is_empty() {
                    this.seal_chunk()?;
                }
                continue;
            }

            let want = (CHUNK_SIZE - this.input.len()).min(this.scratch.len());
            let mut read_buf = ReadBuf::new(&mut this.scratch[..want]);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        this.inner_eof = true;
                    } else {
                        this.input.extend_from_slice(filled);
                        if this.input.len() == CHUNK_SIZE {
                            this.seal_chunk()?;
                        }
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<R: AsyncRead + Unpin> DecryptingReader<R> {
    pub fn new(inner: R, key: EncryptionKey) -> Self {
        Self {
            inner,
            key,
            buffer: BytesMut::new(),
            output: Bytes::new(),
            scratch: vec![0u8; 64 * 1024].into_boxed_slice(),
            inner_eof: false,
        }
    }

    /// Attempts to decipher one complete envelope from the buffer.
    fn open_chunk(&mut self) -> io::Result<bool> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(false);
        }

        let length = u32::from_le_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
        if length < TAG_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "encrypted chunk is shorter than the authentication tag",
            ));
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(false);
        }

        let mut frame = self.buffer.split_to(HEADER_SIZE + length);
        frame.advance(4);
        let nonce_bytes = frame.split_to(12);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = self
            .key
            .cipher
            .decrypt(nonce, frame.as_ref())
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "AEAD decryption failed (wrong key or corrupted data)",
                )
            })?;

        self.output = Bytes::from(plaintext);
        Ok(true)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if !this.output.is_empty() {
                let n = this.output.len().min(buf.remaining());
                buf.put_slice(&this.output[..n]);
                this.output.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.open_chunk()? {
                continue;
            }

            if this.inner_eof {
                if this.buffer.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "encrypted stream is truncated mid-envelope",
                )));
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        this.inner_eof = true;
                    } else {
                        this.buffer.extend_from_slice(filled);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio_test::block_on;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_key_parsing() {
        EncryptionKey::from_hex(KEY).unwrap();
        EncryptionKey::from_hex("deadbeef").unwrap_err();
        EncryptionKey::from_hex("not hex").unwrap_err();
    }

    #[test]
    fn test_round_trip() {
        let key = EncryptionKey::from_hex(KEY).unwrap();
        // larger than one chunk to exercise the envelope boundary
        let payload: Vec<u8> = (0..(CHUNK_SIZE * 2 + 1234))
            .map(|n| (n % 251) as u8)
            .collect();

        let mut encrypted = Vec::new();
        let mut encryptor = EncryptingReader::new(payload.as_slice(), key.clone());
        block_on(encryptor.read_to_end(&mut encrypted)).unwrap();

        assert_ne!(payload, encrypted);
        assert!(encrypted.len() > payload.len());

        let mut decrypted = Vec::new();
        let mut decryptor = DecryptingReader::new(encrypted.as_slice(), key);
        block_on(decryptor.read_to_end(&mut decrypted)).unwrap();

        assert_eq!(payload, decrypted);
    }

    #[test]
    fn test_corruption_is_detected() {
        let key = EncryptionKey::from_hex(KEY).unwrap();

        let mut encrypted = Vec::new();
        let mut encryptor = EncryptingReader::new(&b"sensitive bytes"[..], key.clone());
        block_on(encryptor.read_to_end(&mut encrypted)).unwrap();

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;

        let mut decryptor = DecryptingReader::new(encrypted.as_slice(), key);
        let mut out = Vec::new();
        block_on(decryptor.read_to_end(&mut out)).unwrap_err();
    }

    #[test]
    fn test_truncation_is_detected() {
        let key = EncryptionKey::from_hex(KEY).unwrap();

        let mut encrypted = Vec::new();
        let mut encryptor = EncryptingReader::new(&b"sensitive bytes"[..], key.clone());
        block_on(encryptor.read_to_end(&mut encrypted)).unwrap();

        encrypted.truncate(encrypted.len() - 4);

        let mut decryptor = DecryptingReader::new(encrypted.as_slice(), key);
        let mut out = Vec::new();
        block_on(decryptor.read_to_end(&mut out)).unwrap_err();
    }

    #[test]
    fn test_empty_stream() {
        let key = EncryptionKey::from_hex(KEY).unwrap();

        let mut encrypted = Vec::new();
        let mut encryptor = EncryptingReader::new(&b""[..], key.clone());
        block_on(encryptor.read_to_end(&mut encrypted)).unwrap();
        assert!(encrypted.is_empty());

        let mut decryptor = DecryptingReader::new(encrypted.as_slice(), key);
        let mut out = Vec::new();
        block_on(decryptor.read_to_end(&mut out)).unwrap();
        assert!(out.is_empty());
    }
}
