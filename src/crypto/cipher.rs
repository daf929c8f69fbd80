//! Secure Attachments - Attachment Cipher
//!
//! Streaming AES-256-CTR + HMAC-SHA256 for attachment files.
//!
//! File format:
//! ```text
//! [IV 16B][random]
//! [CIPHERTEXT variable][AES-256-CTR of plaintext || zero padding]
//! [HMAC 32B][HMAC-SHA256 over IV || CIPHERTEXT]
//! ```
//!
//! The ciphertext digest is SHA-256 over the whole file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::keys::{generate_iv, AttachmentKey, IV_LEN};
use crate::error::{AttachmentError, AttachmentResult};

/// HMAC-SHA256 tag length
pub const MAC_LEN: usize = 32;

/// Bytes of framing around the ciphertext body
pub const FRAMING_LEN: u64 = (IV_LEN + MAC_LEN) as u64;

/// Read/write granularity for streamed crypto
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Smallest padded plaintext size
const MIN_PADDED_SIZE: u64 = 541;

/// Padding bucket growth factor
const PADDING_BUCKET_BASE: f64 = 1.05;

/// AES-256-CTR with big-endian 128-bit counter
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

type HmacSha256 = Hmac<Sha256>;

/// Result of encrypting one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionMetadata {
    /// Key the ciphertext is bound to
    pub key: AttachmentKey,
    /// SHA-256 over the whole encrypted file
    pub digest: [u8; 32],
    /// Encrypted file length including framing
    pub ciphertext_length: u64,
    /// Unpadded plaintext length
    pub plaintext_length: u64,
}

/// Padded size for a plaintext of `unpadded` bytes.
///
/// Sizes are rounded up to the next power of 1.05 so the exact length of
/// transmitted content is obscured.
pub fn padded_size(unpadded: u64) -> u64 {
    if unpadded <= 1 {
        return MIN_PADDED_SIZE;
    }
    let exponent = ((unpadded as f64).ln() / PADDING_BUCKET_BASE.ln()).ceil();
    let bucket = PADDING_BUCKET_BASE.powf(exponent).floor() as u64;
    bucket.max(unpadded).max(MIN_PADDED_SIZE)
}

// ═══════════════════════════════════════════════════════════════════════════
// ENCRYPTION
// ═══════════════════════════════════════════════════════════════════════════

/// Writer that encrypts everything written to it
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: Aes256Ctr,
    mac: HmacSha256,
    digest: Sha256,
    key: AttachmentKey,
    plaintext_length: u64,
    ciphertext_length: u64,
    buffer: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    /// Start a new encrypted stream, writing the IV immediately
    pub fn new(mut inner: W, key: &AttachmentKey) -> AttachmentResult<Self> {
        let iv = generate_iv();

        let cipher = Aes256Ctr::new_from_slices(key.aes_key(), &iv)
            .map_err(|e| AttachmentError::EncryptionFailed(e.to_string()))?;
        let mut mac = HmacSha256::new_from_slice(key.hmac_key())
            .map_err(|e| AttachmentError::EncryptionFailed(e.to_string()))?;
        mac.update(&iv);

        let mut digest = Sha256::new();
        digest.update(iv);

        inner.write_all(&iv)?;

        Ok(Self {
            inner,
            cipher,
            mac,
            digest,
            key: key.clone(),
            plaintext_length: 0,
            ciphertext_length: IV_LEN as u64,
            buffer: Vec::new(),
        })
    }

    fn write_ciphertext(&mut self, plaintext: &[u8]) -> io::Result<()> {
        self.buffer.clear();
        self.buffer.extend_from_slice(plaintext);
        self.cipher.apply_keystream(&mut self.buffer);
        self.mac.update(&self.buffer);
        self.digest.update(&self.buffer);
        self.inner.write_all(&self.buffer)?;
        self.ciphertext_length += self.buffer.len() as u64;
        Ok(())
    }

    /// Finish the stream: optional padding, then the MAC.
    pub fn finish(mut self, apply_padding: bool) -> AttachmentResult<(W, EncryptionMetadata)> {
        if apply_padding {
            let mut remaining = padded_size(self.plaintext_length) - self.plaintext_length;
            let zeros = vec![0u8; CHUNK_SIZE.min(remaining as usize)];
            while remaining > 0 {
                let n = (remaining as usize).min(zeros.len());
                self.write_ciphertext(&zeros[..n])?;
                remaining -= n as u64;
            }
        }

        let EncryptingWriter {
            mut inner,
            mac,
            mut digest,
            key,
            plaintext_length,
            ciphertext_length,
            ..
        } = self;

        let tag = mac.finalize().into_bytes();
        inner.write_all(&tag)?;
        inner.flush()?;
        digest.update(tag);

        Ok((
            inner,
            EncryptionMetadata {
                key,
                digest: digest.finalize().into(),
                ciphertext_length: ciphertext_length + MAC_LEN as u64,
                plaintext_length,
            },
        ))
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(CHUNK_SIZE);
        self.write_ciphertext(&buf[..n])?;
        self.plaintext_length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Encrypt a reader into a writer
pub fn encrypt_stream<R: Read, W: Write>(
    key: &AttachmentKey,
    mut reader: R,
    writer: W,
    apply_padding: bool,
) -> AttachmentResult<(W, EncryptionMetadata)> {
    let mut encryptor = EncryptingWriter::new(writer, key)?;
    io::copy(&mut reader, &mut encryptor)?;
    encryptor.finish(apply_padding)
}

/// Encrypt an in-memory buffer
pub fn encrypt_bytes(
    key: &AttachmentKey,
    plaintext: &[u8],
    apply_padding: bool,
) -> AttachmentResult<(Vec<u8>, EncryptionMetadata)> {
    let output = Vec::with_capacity(plaintext.len() + FRAMING_LEN as usize);
    encrypt_stream(key, plaintext, output, apply_padding)
}

// ═══════════════════════════════════════════════════════════════════════════
// DECRYPTION
// ═══════════════════════════════════════════════════════════════════════════

/// Reader yielding exactly `plaintext_length` decrypted bytes.
///
/// The MAC is verified over the whole file before the first byte is served.
/// Seeking repositions the CTR keystream, so plaintext is never staged.
pub struct DecryptingReader<R: Read + Seek> {
    inner: R,
    cipher: Aes256Ctr,
    position: u64,
    plaintext_length: u64,
}

impl<R: Read + Seek> DecryptingReader<R> {
    /// Authenticate the ciphertext and position the reader at the body.
    ///
    /// Without a declared length the whole body is served, padding included.
    pub fn new(
        mut inner: R,
        key: &AttachmentKey,
        plaintext_length: Option<u64>,
    ) -> AttachmentResult<Self> {
        let total = inner.seek(SeekFrom::End(0))?;
        if total < FRAMING_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ciphertext too short: {} bytes", total),
            )
            .into());
        }

        let body_length = total - FRAMING_LEN;
        let plaintext_length = plaintext_length.unwrap_or(body_length);
        if plaintext_length > body_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "declared plaintext length {} exceeds ciphertext body of {} bytes",
                    plaintext_length, body_length
                ),
            )
            .into());
        }

        inner.seek(SeekFrom::Start(0))?;
        let mut iv = [0u8; IV_LEN];
        inner.read_exact(&mut iv)?;

        let mut mac = HmacSha256::new_from_slice(key.hmac_key())
            .map_err(|e| AttachmentError::DecryptionFailed(e.to_string()))?;
        mac.update(&iv);

        let mut buffer = vec![0u8; CHUNK_SIZE.min(body_length as usize).max(1)];
        let mut left = body_length;
        while left > 0 {
            let n = (left as usize).min(buffer.len());
            inner.read_exact(&mut buffer[..n])?;
            mac.update(&buffer[..n]);
            left -= n as u64;
        }

        let mut tag = [0u8; MAC_LEN];
        inner.read_exact(&mut tag)?;
        mac.verify_slice(&tag)
            .map_err(|_| AttachmentError::HmacVerificationFailed)?;

        inner.seek(SeekFrom::Start(IV_LEN as u64))?;
        let cipher = Aes256Ctr::new_from_slices(key.aes_key(), &iv)
            .map_err(|e| AttachmentError::DecryptionFailed(e.to_string()))?;

        Ok(Self {
            inner,
            cipher,
            position: 0,
            plaintext_length,
        })
    }

    /// Number of plaintext bytes this reader yields in total
    pub fn plaintext_length(&self) -> u64 {
        self.plaintext_length
    }
}

impl<R: Read + Seek> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.plaintext_length.saturating_sub(self.position);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let cap = (buf.len() as u64).min(remaining) as usize;
        let n = self.inner.read(&mut buf[..cap])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "ciphertext ended before declared plaintext length",
            ));
        }

        self.cipher.apply_keystream(&mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for DecryptingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.plaintext_length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of plaintext")
        })?;

        // Past the end reads yield nothing, so only the in-range part moves
        let effective = target.min(self.plaintext_length);
        self.inner.seek(SeekFrom::Start(IV_LEN as u64 + effective))?;
        self.cipher
            .try_seek(effective)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        self.position = target;
        Ok(target)
    }
}

/// Open an encrypted file for decryption
pub fn open_encrypted_file(
    path: &Path,
    key: &AttachmentKey,
    plaintext_length: Option<u64>,
) -> AttachmentResult<DecryptingReader<File>> {
    let file = File::open(path)?;
    DecryptingReader::new(file, key, plaintext_length)
}

/// Decrypt an in-memory encrypted buffer
pub fn decrypt_bytes(
    key: &AttachmentKey,
    data: &[u8],
    plaintext_length: Option<u64>,
) -> AttachmentResult<Vec<u8>> {
    let mut reader = DecryptingReader::new(io::Cursor::new(data), key, plaintext_length)?;
    let mut plaintext = Vec::with_capacity(reader.plaintext_length() as usize);
    reader.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}

/// SHA-256 over a whole file, read in fixed chunks
pub fn sha256_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_without_padding() {
        let key = AttachmentKey::generate();
        let plaintext = b"attachment payload bytes";

        let (ciphertext, meta) = encrypt_bytes(&key, plaintext, false).unwrap();
        assert_eq!(meta.plaintext_length, plaintext.len() as u64);
        assert_eq!(meta.ciphertext_length, ciphertext.len() as u64);
        assert_eq!(ciphertext.len() as u64, plaintext.len() as u64 + FRAMING_LEN);

        let decrypted = decrypt_bytes(&key, &ciphertext, Some(meta.plaintext_length)).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_padding_hides_length_but_roundtrips() {
        let key = AttachmentKey::generate();
        let plaintext = vec![7u8; 1000];

        let (ciphertext, meta) = encrypt_bytes(&key, &plaintext, true).unwrap();
        assert_eq!(meta.plaintext_length, 1000);
        assert_eq!(ciphertext.len() as u64, padded_size(1000) + FRAMING_LEN);

        let decrypted = decrypt_bytes(&key, &ciphertext, Some(1000)).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_digest_matches_file_contents() {
        let key = AttachmentKey::generate();
        let (ciphertext, meta) = encrypt_bytes(&key, b"digest me", false).unwrap();

        let expected: [u8; 32] = Sha256::digest(&ciphertext).into();
        assert_eq!(meta.digest, expected);

        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.enc");
        std::fs::write(&path, &ciphertext).unwrap();
        assert_eq!(sha256_file(&path).unwrap(), expected);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let (ciphertext, _) = encrypt_bytes(&AttachmentKey::generate(), b"secret", false).unwrap();
        let result = decrypt_bytes(&AttachmentKey::generate(), &ciphertext, None);
        assert!(matches!(result, Err(AttachmentError::HmacVerificationFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = AttachmentKey::generate();
        let (mut ciphertext, _) = encrypt_bytes(&key, b"tamper target", false).unwrap();
        ciphertext[IV_LEN + 2] ^= 0xFF;

        assert!(decrypt_bytes(&key, &ciphertext, None).is_err());
    }

    #[test]
    fn test_declared_length_beyond_body_is_io_failure() {
        let key = AttachmentKey::generate();
        let (ciphertext, _) = encrypt_bytes(&key, b"short", false).unwrap();

        let err = decrypt_bytes(&key, &ciphertext, Some(500)).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_multi_chunk_stream() {
        let key = AttachmentKey::generate();
        let plaintext: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();

        let (ciphertext, meta) = encrypt_bytes(&key, &plaintext, false).unwrap();
        let decrypted = decrypt_bytes(&key, &ciphertext, Some(meta.plaintext_length)).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_seek_repositions_keystream() {
        let key = AttachmentKey::generate();
        let plaintext: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let (ciphertext, _) = encrypt_bytes(&key, &plaintext, true).unwrap();

        let mut reader =
            DecryptingReader::new(io::Cursor::new(&ciphertext), &key, Some(5000)).unwrap();
        let mut chunk = [0u8; 16];

        reader.seek(SeekFrom::Start(1234)).unwrap();
        reader.read_exact(&mut chunk).unwrap();
        assert_eq!(&chunk[..], &plaintext[1234..1250]);

        reader.seek(SeekFrom::Current(-100)).unwrap();
        reader.read_exact(&mut chunk).unwrap();
        assert_eq!(&chunk[..], &plaintext[1150..1166]);

        assert_eq!(reader.seek(SeekFrom::End(-16)).unwrap(), 4984);
        reader.read_exact(&mut chunk).unwrap();
        assert_eq!(&chunk[..], &plaintext[4984..]);

        reader.seek(SeekFrom::End(10)).unwrap();
        assert_eq!(reader.read(&mut chunk).unwrap(), 0);
        assert!(reader.seek(SeekFrom::Current(-6000)).is_err());
    }

    #[test]
    fn test_padded_size_buckets() {
        assert_eq!(padded_size(0), 541);
        assert_eq!(padded_size(100), 541);
        assert!(padded_size(10_000) >= 10_000);
        assert!(padded_size(10_000) < 10_600);
        assert!(padded_size(1_000_000) >= padded_size(999_999));
    }
}
