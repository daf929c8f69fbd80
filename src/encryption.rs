//! Secure Attachments - Encryption Engine
//!
//! Produces encrypted scratch files for a primary payload and its derived
//! artifacts under one resolved key.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::{Builder, NamedTempFile, TempPath};

use crate::crypto::{
    encrypt_stream, open_encrypted_file, sha256_file, AttachmentKey, EncryptionMetadata,
};
use crate::error::AttachmentResult;
use crate::input::AttachmentSource;

/// Name prefix of every scratch file this crate creates
pub const SCRATCH_PREFIX: &str = ".attachment-scratch-";

/// Create a uniquely-named scratch file in `dir`, creating `dir` if needed
pub fn scratch_file(dir: &Path) -> io::Result<NamedTempFile> {
    fs::create_dir_all(dir)?;
    Builder::new().prefix(SCRATCH_PREFIX).tempfile_in(dir)
}

/// Copy `source` next to `destination`, then rename it over.
///
/// Readers of `destination` see either nothing or the complete file.
fn copy_into_place(source: &Path, destination: &Path) -> io::Result<()> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let mut sibling = scratch_file(parent)?;
    io::copy(&mut File::open(source)?, sibling.as_file_mut())?;
    sibling.as_file().sync_all()?;
    sibling.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

/// An encrypted file waiting to be moved into permanent storage
#[derive(Debug)]
pub enum StagedFile {
    /// Uniquely-named scratch file, deleted if dropped before being moved
    Scratch(TempPath),
    /// Caller-provided ciphertext reused as-is
    Existing(PathBuf),
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        match self {
            StagedFile::Scratch(path) => &**path,
            StagedFile::Existing(path) => path.as_path(),
        }
    }

    /// Move to `destination`, copying when a rename is not possible
    pub fn persist(self, destination: &Path) -> AttachmentResult<()> {
        match self {
            StagedFile::Scratch(path) => match path.persist(destination) {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!("Rename failed ({}), copying scratch file", e.error);
                    copy_into_place(&e.path, destination)?;
                    Ok(())
                }
            },
            StagedFile::Existing(path) => {
                if let Err(e) = fs::rename(&path, destination) {
                    debug!("Rename failed ({}), copying {}", e, path.display());
                    copy_into_place(&path, destination)?;
                    fs::remove_file(&path)?;
                }
                Ok(())
            }
        }
    }
}

/// Encrypted file plus what is needed to describe it
#[derive(Debug)]
pub struct EncryptedFile {
    pub file: StagedFile,
    pub metadata: EncryptionMetadata,
}

fn encrypt_to_scratch<R: std::io::Read>(
    key: &AttachmentKey,
    reader: R,
    apply_padding: bool,
    scratch_dir: &Path,
) -> AttachmentResult<EncryptedFile> {
    let scratch = scratch_file(scratch_dir)?;
    let (writer, metadata) = encrypt_stream(key, reader, BufWriter::new(scratch), apply_padding)?;
    let scratch = writer.into_inner().map_err(|e| e.into_error())?;
    scratch.as_file().sync_all()?;

    Ok(EncryptedFile {
        file: StagedFile::Scratch(scratch.into_temp_path()),
        metadata,
    })
}

/// Encrypt the primary payload under `key`.
///
/// Padding applies only to plaintext sources headed for transmission;
/// re-encryption of existing ciphertext never pads.
pub fn encrypt_primary(
    source: &AttachmentSource,
    key: &AttachmentKey,
    apply_padding: bool,
    scratch_dir: &Path,
) -> AttachmentResult<EncryptedFile> {
    match source {
        AttachmentSource::InMemory(bytes) => {
            encrypt_to_scratch(key, bytes.as_slice(), apply_padding, scratch_dir)
        }
        AttachmentSource::UnencryptedFile(path) => {
            let reader = BufReader::new(fs::File::open(path)?);
            encrypt_to_scratch(key, reader, apply_padding, scratch_dir)
        }
        AttachmentSource::EncryptedFile(encrypted) if encrypted.key == *key => {
            let digest = match encrypted.digest {
                Some(digest) => digest,
                None => sha256_file(&encrypted.path)?,
            };
            debug!("Reusing existing ciphertext at {}", encrypted.path.display());

            Ok(EncryptedFile {
                metadata: EncryptionMetadata {
                    key: key.clone(),
                    digest,
                    ciphertext_length: fs::metadata(&encrypted.path)?.len(),
                    plaintext_length: encrypted.plaintext_length,
                },
                file: StagedFile::Existing(encrypted.path.clone()),
            })
        }
        AttachmentSource::EncryptedFile(encrypted) => {
            debug!("Re-encrypting {} under a new key", encrypted.path.display());
            let reader = open_encrypted_file(
                &encrypted.path,
                &encrypted.key,
                Some(encrypted.plaintext_length),
            )?;
            encrypt_to_scratch(key, BufReader::new(reader), false, scratch_dir)
        }
    }
}

/// Encrypt a derived artifact with the primary's key, unpadded
pub fn encrypt_artifact(
    bytes: &[u8],
    key: &AttachmentKey,
    scratch_dir: &Path,
) -> AttachmentResult<EncryptedFile> {
    encrypt_to_scratch(key, bytes, false, scratch_dir)
}

/// Decrypt one layer of ciphertext into a scratch file
pub fn decrypt_to_scratch(
    path: &Path,
    key: &AttachmentKey,
    plaintext_length: Option<u64>,
    scratch_dir: &Path,
) -> AttachmentResult<TempPath> {
    let mut reader = open_encrypted_file(path, key, plaintext_length)?;
    let mut writer = BufWriter::new(scratch_file(scratch_dir)?);
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    let scratch = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(scratch.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt_bytes, padded_size, FRAMING_LEN};
    use crate::input::EncryptedFileSource;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_with_padding() {
        let dir = tempdir().unwrap();
        let key = AttachmentKey::generate();
        let plaintext = vec![3u8; 2000];

        let source = AttachmentSource::InMemory(plaintext.clone());
        let encrypted = encrypt_primary(&source, &key, true, dir.path()).unwrap();

        let ciphertext = fs::read(encrypted.file.path()).unwrap();
        assert_eq!(ciphertext.len() as u64, padded_size(2000) + FRAMING_LEN);
        assert_eq!(encrypted.metadata.ciphertext_length, ciphertext.len() as u64);
        assert_eq!(encrypted.metadata.plaintext_length, 2000);
        assert_eq!(decrypt_bytes(&key, &ciphertext, Some(2000)).unwrap(), plaintext);
    }

    #[test]
    fn test_unencrypted_file_streams() {
        let dir = tempdir().unwrap();
        let key = AttachmentKey::generate();
        let path = dir.path().join("plain.bin");
        fs::write(&path, b"file contents").unwrap();

        let source = AttachmentSource::UnencryptedFile(path);
        let encrypted = encrypt_primary(&source, &key, false, dir.path()).unwrap();
        let ciphertext = fs::read(encrypted.file.path()).unwrap();
        assert_eq!(decrypt_bytes(&key, &ciphertext, None).unwrap(), b"file contents");
    }

    #[test]
    fn test_same_key_reuses_file() {
        let dir = tempdir().unwrap();
        let key = AttachmentKey::generate();
        let (ciphertext, meta) =
            crate::crypto::encrypt_bytes(&key, b"already encrypted", true).unwrap();
        let path = dir.path().join("blob.enc");
        fs::write(&path, &ciphertext).unwrap();

        let source = AttachmentSource::EncryptedFile(EncryptedFileSource {
            path: path.clone(),
            key: key.clone(),
            plaintext_length: meta.plaintext_length,
            digest: None,
        });
        let encrypted = encrypt_primary(&source, &key, true, dir.path()).unwrap();

        assert!(matches!(&encrypted.file, StagedFile::Existing(p) if *p == path));
        assert_eq!(encrypted.metadata.digest, meta.digest);
        assert_eq!(encrypted.metadata.ciphertext_length, meta.ciphertext_length);
    }

    #[test]
    fn test_different_key_reencrypts_without_padding() {
        let dir = tempdir().unwrap();
        let old_key = AttachmentKey::generate();
        let new_key = AttachmentKey::generate();
        let plaintext = b"rotate me".to_vec();
        let (ciphertext, meta) = crate::crypto::encrypt_bytes(&old_key, &plaintext, true).unwrap();
        let path = dir.path().join("blob.enc");
        fs::write(&path, &ciphertext).unwrap();

        let source = AttachmentSource::EncryptedFile(EncryptedFileSource {
            path,
            key: old_key,
            plaintext_length: meta.plaintext_length,
            digest: Some(meta.digest),
        });
        let encrypted = encrypt_primary(&source, &new_key, true, dir.path()).unwrap();

        let reencrypted = fs::read(encrypted.file.path()).unwrap();
        assert_eq!(reencrypted.len() as u64, plaintext.len() as u64 + FRAMING_LEN);
        assert_eq!(decrypt_bytes(&new_key, &reencrypted, None).unwrap(), plaintext);
    }

    #[test]
    fn test_dropped_scratch_file_is_removed() {
        let dir = tempdir().unwrap();
        let encrypted = encrypt_artifact(b"frame", &AttachmentKey::generate(), dir.path()).unwrap();
        let path = encrypted.file.path().to_path_buf();
        assert!(path.exists());

        drop(encrypted);
        assert!(!path.exists());
    }

    #[test]
    fn test_decrypt_to_scratch() {
        let dir = tempdir().unwrap();
        let key = AttachmentKey::generate();
        let (ciphertext, meta) = crate::crypto::encrypt_bytes(&key, b"outer layer", true).unwrap();
        let path = dir.path().join("outer.enc");
        fs::write(&path, &ciphertext).unwrap();

        let scratch =
            decrypt_to_scratch(&path, &key, Some(meta.plaintext_length), dir.path()).unwrap();
        assert_eq!(fs::read(&scratch).unwrap(), b"outer layer");
    }

    #[test]
    fn test_persist_moves_scratch_file() {
        let dir = tempdir().unwrap();
        let encrypted = encrypt_artifact(b"frame", &AttachmentKey::generate(), dir.path()).unwrap();
        let scratch = encrypted.file.path().to_path_buf();
        let destination = dir.path().join("final.bin");

        encrypted.file.persist(&destination).unwrap();
        assert!(destination.exists());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_scratch_files_carry_prefix() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("not").join("yet");
        let scratch = scratch_file(&nested).unwrap();

        let name = scratch.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(SCRATCH_PREFIX));
        assert_eq!(scratch.path().parent().unwrap(), nested);
    }

    #[test]
    fn test_copy_into_place_leaves_no_partial_files() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, vec![9u8; 70_000]).unwrap();
        let target_dir = dir.path().join("target");
        fs::create_dir_all(&target_dir).unwrap();
        let destination = target_dir.join("final.bin");
        fs::write(&destination, b"stale").unwrap();

        copy_into_place(&source, &destination).unwrap();

        assert_eq!(fs::read(&destination).unwrap(), vec![9u8; 70_000]);
        let names: Vec<_> = fs::read_dir(&target_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("final.bin")]);
        assert!(source.exists());
    }
}
