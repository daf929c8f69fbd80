//! Secure Attachments - Pipeline Inputs
//!
//! The physical representations an attachment payload can arrive in.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::crypto::{open_encrypted_file, AttachmentKey};
use crate::error::AttachmentResult;

/// SHA-256 of plaintext content, the dedup key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Cryptographic proof that downloaded or restored ciphertext is the
/// expected content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// SHA-256 over the whole encrypted file
    Digest([u8; 32]),
    /// SHA-256 over the decrypted plaintext
    PlaintextHash([u8; 32]),
}

/// An already-encrypted file and what is needed to read it back
#[derive(Debug, Clone)]
pub struct EncryptedFileSource {
    pub path: PathBuf,
    pub key: AttachmentKey,
    pub plaintext_length: u64,
    /// Ciphertext digest, when the caller already knows it
    pub digest: Option<[u8; 32]>,
}

/// Where the plaintext of a payload lives
#[derive(Debug, Clone)]
pub enum AttachmentSource {
    InMemory(Vec<u8>),
    UnencryptedFile(PathBuf),
    EncryptedFile(EncryptedFileSource),
}

impl AttachmentSource {
    /// Plaintext byte count
    pub fn plaintext_length(&self) -> io::Result<u64> {
        match self {
            AttachmentSource::InMemory(bytes) => Ok(bytes.len() as u64),
            AttachmentSource::UnencryptedFile(path) => Ok(fs::metadata(path)?.len()),
            AttachmentSource::EncryptedFile(source) => Ok(source.plaintext_length),
        }
    }

    /// Open a reader over the plaintext
    pub fn open_plaintext(&self) -> AttachmentResult<Box<dyn Read + '_>> {
        match self {
            AttachmentSource::InMemory(bytes) => Ok(Box::new(bytes.as_slice())),
            AttachmentSource::UnencryptedFile(path) => Ok(Box::new(File::open(path)?)),
            AttachmentSource::EncryptedFile(source) => Ok(Box::new(open_encrypted_file(
                &source.path,
                &source.key,
                Some(source.plaintext_length),
            )?)),
        }
    }

    /// Read the whole plaintext into memory
    pub fn read_plaintext(&self) -> AttachmentResult<Vec<u8>> {
        match self {
            AttachmentSource::InMemory(bytes) => Ok(bytes.clone()),
            AttachmentSource::UnencryptedFile(path) => Ok(fs::read(path)?),
            AttachmentSource::EncryptedFile(_) => {
                let mut plaintext = Vec::with_capacity(self.plaintext_length()? as usize);
                self.open_plaintext()?.read_to_end(&mut plaintext)?;
                Ok(plaintext)
            }
        }
    }
}

/// A source plus its plaintext content hash, computed once by the caller
#[derive(Debug, Clone)]
pub struct AttachmentInput {
    pub source: AttachmentSource,
    pub content_hash: ContentHash,
}

impl AttachmentInput {
    /// Hash the source and pair it with the result
    pub fn new(source: AttachmentSource) -> AttachmentResult<Self> {
        let content_hash = crate::digest::content_hash(&source)?;
        Ok(Self {
            source,
            content_hash,
        })
    }
}
