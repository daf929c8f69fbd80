//! Secure Attachments - Digest Engine
//!
//! Canonical SHA-256 of plaintext, whatever the physical representation.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

use crate::crypto::CHUNK_SIZE;
use crate::error::AttachmentResult;
use crate::input::{AttachmentSource, ContentHash};

/// Compute the plaintext content hash of a source.
///
/// Encrypted files are decrypted on the fly in 1 MiB chunks until the
/// declared plaintext length is exhausted.
pub fn content_hash(source: &AttachmentSource) -> AttachmentResult<ContentHash> {
    match source {
        AttachmentSource::InMemory(bytes) => Ok(ContentHash(Sha256::digest(bytes).into())),
        AttachmentSource::UnencryptedFile(_) => hash_reader(source.open_plaintext()?, None),
        AttachmentSource::EncryptedFile(encrypted) => {
            hash_reader(source.open_plaintext()?, Some(encrypted.plaintext_length))
        }
    }
}

/// Content hash of an in-memory buffer
pub fn content_hash_of_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash(Sha256::digest(bytes).into())
}

fn hash_reader<R: Read>(
    mut reader: R,
    expected_length: Option<u64>,
) -> AttachmentResult<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    if let Some(expected) = expected_length {
        if total != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("read {} plaintext bytes, expected {}", total, expected),
            )
            .into());
        }
    }

    Ok(ContentHash(hasher.finalize().into()))
}
