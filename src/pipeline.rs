//! Secure Attachments - Pipeline
//!
//! Entry points that take a payload from raw bytes or ciphertext to a
//! validated, encrypted, materialized `PendingAttachment`.
//!
//! Per call: key resolution → validation → encryption → ledger commit →
//! materialization. Nothing reaches a permanent path before the ledger row
//! naming it is committed.

use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::attachment::{
    OrphanedAttachmentRecord, PendingAttachment, RenderingFlag, RevalidatedAttachment,
};
use crate::config::PipelineConfig;
use crate::content_type::{ContentType, MIME_OVERSIZE_TEXT};
use crate::crypto::{open_encrypted_file, sha256_file, AttachmentKey, CHUNK_SIZE};
use crate::encryption::{decrypt_to_scratch, encrypt_artifact, encrypt_primary, EncryptedFile};
use crate::error::{AttachmentError, AttachmentResult};
use crate::input::{
    AttachmentInput, AttachmentSource, ContentHash, EncryptedFileSource, IntegrityCheck,
};
use crate::media::{FfmpegAssetReader, MediaAssetReader, PcmWaveformService, WaveformService};
use crate::store::{AttachmentStore, OrphanLedger};
use crate::storage::{AttachmentStorage, FileMover};
use crate::text::{truncate_body, MessageBody, PreparedText};
use crate::thumbnail::ThumbnailEngine;
use crate::validate::{validate, ArtifactKind, ValidatedContent, ValidatedKind, ValidationContext};

/// MIME type of quoted-reply thumbnails
const MIME_JPEG: &str = "image/jpeg";

/// A downloaded ciphertext and the value proving it is the expected content
#[derive(Debug, Clone)]
pub struct DownloadedAttachment {
    pub path: PathBuf,
    pub key: AttachmentKey,
    /// `None` when unknown; the whole body is then treated as plaintext
    pub plaintext_length: Option<u64>,
    pub integrity_check: IntegrityCheck,
}

/// Outer layer of a backup object
#[derive(Debug, Clone)]
pub struct EncryptedLayer {
    pub path: PathBuf,
    pub key: AttachmentKey,
    /// `None` when unknown; the whole body is then treated as plaintext
    pub plaintext_length: Option<u64>,
    pub integrity_check: Option<IntegrityCheck>,
}

/// Inner layer of a backup object, found inside the decrypted outer layer
#[derive(Debug, Clone)]
pub struct InnerLayer {
    pub key: AttachmentKey,
    pub plaintext_length: Option<u64>,
    pub integrity_check: IntegrityCheck,
}

/// Ciphertext checked against its integrity value
struct VerifiedCiphertext {
    plaintext_length: u64,
    content_hash: ContentHash,
    digest: [u8; 32],
}

/// Attachment Pipeline
pub struct AttachmentPipeline {
    config: PipelineConfig,
    scratch_dir: PathBuf,
    storage: AttachmentStorage,
    store: Arc<dyn AttachmentStore>,
    ledger: Arc<dyn OrphanLedger>,
    mover: Arc<dyn FileMover>,
    asset_reader: Arc<dyn MediaAssetReader>,
    waveform_service: Arc<dyn WaveformService>,
}

impl AttachmentPipeline {
    /// Create a pipeline with the default ffmpeg asset reader, PCM waveform
    /// service and filesystem mover
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn AttachmentStore>,
        ledger: Arc<dyn OrphanLedger>,
    ) -> AttachmentResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_root)?;
        let scratch_dir = config.scratch_dir();
        std::fs::create_dir_all(&scratch_dir)?;

        let storage = AttachmentStorage::new(&config.storage_root);
        let asset_reader =
            FfmpegAssetReader::new(config.ffprobe_path.clone(), config.ffmpeg_path.clone());

        Ok(Self {
            mover: Arc::new(storage.clone()),
            storage,
            store,
            ledger,
            asset_reader: Arc::new(asset_reader),
            waveform_service: Arc::new(PcmWaveformService::default()),
            config,
            scratch_dir,
        })
    }

    pub fn with_asset_reader(mut self, asset_reader: Arc<dyn MediaAssetReader>) -> Self {
        self.asset_reader = asset_reader;
        self
    }

    pub fn with_waveform_service(mut self, waveform_service: Arc<dyn WaveformService>) -> Self {
        self.waveform_service = waveform_service;
        self
    }

    pub fn with_file_mover(mut self, mover: Arc<dyn FileMover>) -> Self {
        self.mover = mover;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> &AttachmentStorage {
        &self.storage
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn validation_context(&self) -> ValidationContext<'_> {
        ValidationContext {
            config: &self.config,
            asset_reader: self.asset_reader.as_ref(),
            waveform_service: self.waveform_service.as_ref(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENTRY POINTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate and encrypt local plaintext (bytes or an unencrypted file)
    pub fn validate_local(
        &self,
        input: AttachmentInput,
        mime_type: &str,
        rendering_flag: RenderingFlag,
        source_filename: Option<&str>,
    ) -> AttachmentResult<PendingAttachment> {
        if let AttachmentSource::EncryptedFile(_) = input.source {
            return Err(AttachmentError::UnsupportedSource {
                operation: "validate_local",
                reason: "local imports take plaintext".into(),
            });
        }

        let pending = self.ingest(&input, None, true, mime_type, rendering_flag, source_filename)?;
        info!(
            "Imported {} as {} ({} bytes)",
            pending.content_hash,
            pending.content_type.name(),
            pending.unencrypted_byte_count
        );
        Ok(pending)
    }

    /// Validate a downloaded ciphertext after checking its integrity.
    ///
    /// The file is consumed: when its key is kept it becomes the permanent
    /// primary file.
    pub fn validate_downloaded(
        &self,
        download: DownloadedAttachment,
        mime_type: &str,
        rendering_flag: RenderingFlag,
        source_filename: Option<&str>,
    ) -> AttachmentResult<PendingAttachment> {
        let verified = verify_ciphertext(
            &download.path,
            &download.key,
            download.plaintext_length,
            Some(download.integrity_check),
        )?;

        let input = AttachmentInput {
            source: AttachmentSource::EncryptedFile(EncryptedFileSource {
                path: download.path,
                key: download.key.clone(),
                plaintext_length: verified.plaintext_length,
                digest: Some(verified.digest),
            }),
            content_hash: verified.content_hash,
        };

        let pending = self.ingest(
            &input,
            Some(download.key),
            false,
            mime_type,
            rendering_flag,
            source_filename,
        )?;
        info!("Validated download {} as {}", pending.content_hash, pending.content_type.name());
        Ok(pending)
    }

    /// Recompute the content type of ciphertext already in permanent
    /// storage. Only new derived artifacts are written.
    pub fn revalidate_encrypted(
        &self,
        path: PathBuf,
        key: AttachmentKey,
        plaintext_length: u64,
        mime_type: &str,
    ) -> AttachmentResult<RevalidatedAttachment> {
        let source = AttachmentSource::EncryptedFile(EncryptedFileSource {
            path,
            key: key.clone(),
            plaintext_length,
            digest: None,
        });

        let validated = validate(&source, mime_type, None, &self.validation_context())?;

        let artifact = match validated.artifact() {
            Some((kind, bytes)) => Some((kind, encrypt_artifact(bytes, &key, &self.scratch_dir)?)),
            None => None,
        };

        let (content_type, orphan_record_id) = match artifact {
            Some((kind, encrypted)) => {
                let relative_path = self.storage.reserve_relative_path();
                let mut record = OrphanedAttachmentRecord {
                    is_pending: true,
                    ..Default::default()
                };
                match kind {
                    ArtifactKind::StillFrame => {
                        record.still_frame_relative_path = Some(relative_path.clone())
                    }
                    ArtifactKind::Waveform => {
                        record.waveform_relative_path = Some(relative_path.clone())
                    }
                }

                let orphan_record_id = self.ledger.commit_pending(&record)?;
                self.mover.move_into_place(encrypted.file, &relative_path)?;
                (validated.to_content_type(Some(relative_path)), Some(orphan_record_id))
            }
            None => (validated.to_content_type(None), None),
        };

        info!("Revalidated ciphertext as {}", content_type.name());
        Ok(RevalidatedAttachment {
            content_type,
            mime_type: validated.mime_type,
            blurhash: validated.blurhash,
            orphan_record_id,
        })
    }

    /// Validate a two-layer backup object: the outer layer is decrypted to
    /// scratch, the inner layer is then handled like a download and
    /// re-keyed under `final_key` unless the content is already stored.
    pub fn validate_backup(
        &self,
        outer: EncryptedLayer,
        inner: InnerLayer,
        final_key: AttachmentKey,
        mime_type: &str,
        rendering_flag: RenderingFlag,
        source_filename: Option<&str>,
    ) -> AttachmentResult<PendingAttachment> {
        if let Some(check) = outer.integrity_check {
            verify_ciphertext(&outer.path, &outer.key, outer.plaintext_length, Some(check))?;
        }

        let inner_path = decrypt_to_scratch(
            &outer.path,
            &outer.key,
            outer.plaintext_length,
            &self.scratch_dir,
        )?;

        let verified = verify_ciphertext(
            &inner_path,
            &inner.key,
            inner.plaintext_length,
            Some(inner.integrity_check),
        )?;

        let input = AttachmentInput {
            source: AttachmentSource::EncryptedFile(EncryptedFileSource {
                path: inner_path.to_path_buf(),
                key: inner.key,
                plaintext_length: verified.plaintext_length,
                digest: Some(verified.digest),
            }),
            content_hash: verified.content_hash,
        };

        let pending = self.ingest(
            &input,
            Some(final_key),
            false,
            mime_type,
            rendering_flag,
            source_filename,
        )?;
        drop(inner_path);

        info!("Restored backup media {} as {}", pending.content_hash, pending.content_type.name());
        Ok(pending)
    }

    /// Keep short bodies inline; otherwise truncate the inline body and
    /// attach the full text
    pub fn prepare_oversize_text(&self, body: MessageBody) -> AttachmentResult<PreparedText> {
        let truncated = match truncate_body(&body, self.config.oversize_text_threshold) {
            Some(truncated) => truncated,
            None => return Ok(PreparedText::Inline(body)),
        };

        let input = AttachmentInput::new(AttachmentSource::InMemory(body.text.into_bytes()))?;
        let attachment = self.ingest(
            &input,
            None,
            true,
            MIME_OVERSIZE_TEXT,
            RenderingFlag::Default,
            None,
        )?;

        info!(
            "Oversize text of {} bytes moved to attachment {}",
            attachment.unencrypted_byte_count, attachment.content_hash
        );
        Ok(PreparedText::Oversize {
            truncated,
            attachment,
        })
    }

    /// Small JPEG preview of an image or video attachment for a quoted
    /// reply. `None` when the attachment has nothing to show.
    pub fn prepare_quoted_reply_thumbnail(
        &self,
        original: &PendingAttachment,
    ) -> AttachmentResult<Option<PendingAttachment>> {
        let image = match self.load_visual(original)? {
            Some(image) => image,
            None => return Ok(None),
        };

        let engine = ThumbnailEngine::new(
            self.config.quoted_thumbnail_max_dimension,
            self.config.quoted_thumbnail_quality,
        );
        let jpeg = engine.render(&image)?;

        let rendering_flag = match original.rendering_flag {
            RenderingFlag::Borderless => RenderingFlag::Borderless,
            _ => RenderingFlag::Default,
        };

        let input = AttachmentInput::new(AttachmentSource::InMemory(jpeg))?;
        let thumbnail = self.ingest(&input, None, true, MIME_JPEG, rendering_flag, None)?;
        debug!("Quoted thumbnail {} for {}", thumbnail.content_hash, original.content_hash);
        Ok(Some(thumbnail))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    /// Stored key for identical content, else the caller's, else a new one
    fn resolve_key(
        &self,
        content_hash: &ContentHash,
        caller_key: Option<AttachmentKey>,
    ) -> AttachmentResult<AttachmentKey> {
        if let Some(existing) = self.store.encryption_key_for_content_hash(content_hash)? {
            debug!("Reusing stored key for {}", content_hash);
            return Ok(existing);
        }
        Ok(caller_key.unwrap_or_else(AttachmentKey::generate))
    }

    fn ingest(
        &self,
        input: &AttachmentInput,
        caller_key: Option<AttachmentKey>,
        apply_padding: bool,
        mime_type: &str,
        rendering_flag: RenderingFlag,
        source_filename: Option<&str>,
    ) -> AttachmentResult<PendingAttachment> {
        let key = self.resolve_key(&input.content_hash, caller_key)?;

        let ctx = self.validation_context();
        let validated = validate(&input.source, mime_type, source_filename, &ctx)?;
        if validated.kind == ValidatedKind::Invalid {
            warn!("Payload {} declared as {} is invalid", input.content_hash, mime_type);
        }

        let primary = encrypt_primary(&input.source, &key, apply_padding, &self.scratch_dir)?;
        let artifact = match validated.artifact() {
            Some((kind, bytes)) => Some((kind, encrypt_artifact(bytes, &key, &self.scratch_dir)?)),
            None => None,
        };

        self.materialize(
            input.content_hash,
            key,
            validated,
            primary,
            artifact,
            rendering_flag,
            source_filename,
        )
    }

    /// Commit the ledger row, then move every staged file into place
    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &self,
        content_hash: ContentHash,
        key: AttachmentKey,
        validated: ValidatedContent,
        primary: EncryptedFile,
        artifact: Option<(ArtifactKind, EncryptedFile)>,
        rendering_flag: RenderingFlag,
        source_filename: Option<&str>,
    ) -> AttachmentResult<PendingAttachment> {
        let primary_path = self.storage.reserve_relative_path();
        let artifact_path = artifact.as_ref().map(|_| self.storage.reserve_relative_path());

        let mut record = OrphanedAttachmentRecord {
            local_relative_file_path: Some(primary_path.clone()),
            is_pending: true,
            ..Default::default()
        };
        match (&artifact, &artifact_path) {
            (Some((ArtifactKind::StillFrame, _)), Some(path)) => {
                record.still_frame_relative_path = Some(path.clone())
            }
            (Some((ArtifactKind::Waveform, _)), Some(path)) => {
                record.waveform_relative_path = Some(path.clone())
            }
            _ => {}
        }

        let orphan_record_id = self.ledger.commit_pending(&record)?;

        let EncryptedFile { file, metadata } = primary;
        self.mover.move_into_place(file, &primary_path)?;
        if let (Some((_, encrypted)), Some(path)) = (artifact, &artifact_path) {
            self.mover.move_into_place(encrypted.file, path)?;
        }

        Ok(PendingAttachment {
            content_hash,
            encrypted_byte_count: metadata.ciphertext_length,
            unencrypted_byte_count: metadata.plaintext_length,
            content_type: validated.to_content_type(artifact_path),
            mime_type: validated.mime_type,
            encryption_key: key,
            digest: metadata.digest,
            local_relative_file_path: primary_path,
            rendering_flag,
            source_filename: source_filename.map(str::to_string),
            blurhash: validated.blurhash,
            orphan_record_id,
        })
    }

    /// Decode the image, or the video still frame, behind an attachment
    fn load_visual(
        &self,
        attachment: &PendingAttachment,
    ) -> AttachmentResult<Option<DynamicImage>> {
        if !attachment.content_type.is_visual_media() {
            return Ok(None);
        }

        let (relative_path, plaintext_length) = match &attachment.content_type {
            ContentType::Video {
                still_frame_relative_path,
                ..
            } => match still_frame_relative_path {
                Some(path) => (path.as_str(), None),
                None => return Ok(None),
            },
            _ => (
                attachment.local_relative_file_path.as_str(),
                Some(attachment.unencrypted_byte_count),
            ),
        };

        let path = self.storage.absolute_path(relative_path)?;
        let mut encoded = Vec::new();
        open_encrypted_file(&path, &attachment.encryption_key, plaintext_length)?
            .read_to_end(&mut encoded)?;

        match image::load_from_memory(&encoded) {
            Ok(image) => Ok(Some(image)),
            Err(e) => {
                warn!("Cannot decode {} for a quoted thumbnail: {}", attachment.content_hash, e);
                Ok(None)
            }
        }
    }
}

/// Fully decrypt ciphertext, hashing the plaintext and checking the
/// supplied integrity value
fn verify_ciphertext(
    path: &Path,
    key: &AttachmentKey,
    plaintext_length: Option<u64>,
    integrity_check: Option<IntegrityCheck>,
) -> AttachmentResult<VerifiedCiphertext> {
    if plaintext_length.is_none() {
        warn!("Plaintext length unknown for {}, using whole body", path.display());
    }

    let digest = sha256_file(path)?;
    if let Some(IntegrityCheck::Digest(expected)) = integrity_check {
        if digest != expected {
            return Err(AttachmentError::IntegrityCheckFailed("ciphertext digest mismatch".into()));
        }
    }

    let reader = open_encrypted_file(path, key, plaintext_length)?;
    let plaintext_length = reader.plaintext_length();

    let mut reader = BufReader::with_capacity(CHUNK_SIZE, reader);
    let mut hasher = Sha256::new();
    let copied = io::copy(&mut reader, &mut hasher)?;
    if copied != plaintext_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decrypted {} bytes, expected {}", copied, plaintext_length),
        )
        .into());
    }
    let content_hash = ContentHash(hasher.finalize().into());

    if let Some(IntegrityCheck::PlaintextHash(expected)) = integrity_check {
        if *content_hash.as_bytes() != expected {
            return Err(AttachmentError::IntegrityCheckFailed("plaintext hash mismatch".into()));
        }
    }

    Ok(VerifiedCiphertext {
        plaintext_length,
        content_hash,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;

    use image::{GenericImageView, ImageFormat};
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};
    use walkdir::WalkDir;

    use crate::content_type::PixelSize;
    use crate::crypto::{derive_backup_media_key, encrypt_bytes, padded_size, FRAMING_LEN};
    use crate::digest::content_hash_of_bytes;
    use crate::encryption::StagedFile;
    use crate::media::mp4::minimal_mp4;
    use crate::media::wav::pcm_wav;
    use crate::media::AudioWaveform;
    use crate::storage::OrphanReclaimer;
    use crate::store::SqliteAttachmentStore;
    use crate::validate::fakes::{FakeAssetReader, FakeWaveformService};

    struct Harness {
        dir: TempDir,
        store: Arc<SqliteAttachmentStore>,
        pipeline: AttachmentPipeline,
    }

    impl Harness {
        fn new(reader: FakeAssetReader, waveform_ok: bool) -> Self {
            let dir = tempdir().unwrap();
            let config = PipelineConfig {
                storage_root: dir.path().join("attachments"),
                scratch_dir: Some(dir.path().join("scratch")),
                database_path: dir.path().join("attachments.db"),
                ..Default::default()
            };
            let store = Arc::new(SqliteAttachmentStore::open_in_memory().unwrap());
            let pipeline = AttachmentPipeline::new(config, store.clone(), store.clone())
                .unwrap()
                .with_asset_reader(Arc::new(reader))
                .with_waveform_service(Arc::new(FakeWaveformService { succeed: waveform_ok }));

            Self {
                dir,
                store,
                pipeline,
            }
        }

        fn images() -> Self {
            Self::new(FakeAssetReader::unreadable(), true)
        }

        fn import(&self, bytes: Vec<u8>, mime_type: &str) -> PendingAttachment {
            let input = AttachmentInput::new(AttachmentSource::InMemory(bytes)).unwrap();
            self.pipeline
                .validate_local(input, mime_type, RenderingFlag::Default, None)
                .unwrap()
        }

        fn decrypt(
            &self,
            relative_path: &str,
            key: &AttachmentKey,
            length: Option<u64>,
        ) -> Vec<u8> {
            let path = self.pipeline.storage().absolute_path(relative_path).unwrap();
            let mut plaintext = Vec::new();
            open_encrypted_file(&path, key, length)
                .unwrap()
                .read_to_end(&mut plaintext)
                .unwrap();
            plaintext
        }

        fn decrypt_primary(&self, pending: &PendingAttachment) -> Vec<u8> {
            self.decrypt(
                &pending.local_relative_file_path,
                &pending.encryption_key,
                Some(pending.unencrypted_byte_count),
            )
        }

        fn scratch_is_empty(&self) -> bool {
            fs::read_dir(self.pipeline.scratch_dir()).unwrap().count() == 0
        }

        fn stored_file_count(&self) -> usize {
            WalkDir::new(&self.pipeline.config().storage_root)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .count()
        }
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        crate::validate::encode_test_image(width, height, ImageFormat::Jpeg)
    }

    fn sha256(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOCAL IMPORTS
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_small_jpeg_roundtrip() {
        let h = Harness::images();
        let bytes = jpeg(50, 50);
        let pending = h.import(bytes.clone(), "image/jpeg");

        assert_eq!(
            pending.content_type,
            ContentType::Image {
                pixel_size: PixelSize::new(50, 50)
            }
        );
        assert!(pending.blurhash.is_some());
        assert_eq!(pending.relative_paths().len(), 1);
        assert_eq!(pending.content_hash, content_hash_of_bytes(&bytes));
        assert_eq!(pending.unencrypted_byte_count, bytes.len() as u64);
        assert_eq!(
            pending.encrypted_byte_count,
            padded_size(bytes.len() as u64) + FRAMING_LEN
        );

        assert_eq!(h.decrypt_primary(&pending), bytes);
        let stored = h
            .pipeline
            .storage()
            .absolute_path(&pending.local_relative_file_path)
            .unwrap();
        assert_eq!(sha256_file(&stored).unwrap(), pending.digest);

        let entry = h.store.orphan(pending.orphan_record_id).unwrap().unwrap();
        assert!(entry.record.is_pending);
        assert_eq!(
            entry.record.local_relative_file_path.as_deref(),
            Some(pending.local_relative_file_path.as_str())
        );
        assert!(h.scratch_is_empty());
    }

    #[test]
    fn test_truncated_mp4_is_stored_as_invalid() {
        let h = Harness::new(FakeAssetReader::video(2.0, 640, 480), true);
        let mut mp4 = minimal_mp4(600, 1200);
        mp4.truncate(mp4.len() - 40);

        let pending = h.import(mp4.clone(), "video/mp4");
        assert_eq!(pending.content_type, ContentType::Invalid);
        assert!(pending.content_type.derived_relative_paths().is_empty());
        assert_eq!(h.decrypt_primary(&pending), mp4);
    }

    #[test]
    fn test_video_still_frame_is_encrypted_alongside() {
        let h = Harness::new(FakeAssetReader::video(2.0, 640, 480), true);
        let pending = h.import(minimal_mp4(600, 1200), "video/mp4");

        let still_frame_path = match &pending.content_type {
            ContentType::Video {
                duration,
                pixel_size,
                still_frame_relative_path: Some(path),
            } => {
                assert_eq!(*duration, 2.0);
                assert_eq!(*pixel_size, PixelSize::new(640, 480));
                path.clone()
            }
            other => panic!("unexpected content type {:?}", other),
        };
        assert!(pending.blurhash.is_some());

        let frame = h.decrypt(&still_frame_path, &pending.encryption_key, None);
        let decoded = image::load_from_memory_with_format(&frame, ImageFormat::Png).unwrap();
        assert_eq!(decoded.dimensions(), (640, 480));

        let entry = h.store.orphan(pending.orphan_record_id).unwrap().unwrap();
        assert_eq!(entry.record.still_frame_relative_path, Some(still_frame_path));
    }

    #[test]
    fn test_silent_wav_with_waveform() {
        let h = Harness::new(FakeAssetReader::unreadable(), true);
        let pending = h.import(pcm_wav(8000, 1, &vec![0i16; 8000]), "audio/wav");

        match &pending.content_type {
            ContentType::Audio {
                duration,
                waveform_relative_path: Some(path),
            } => {
                assert!((duration - 1.0).abs() < 1e-6);
                let waveform = h.decrypt(path, &pending.encryption_key, None);
                assert_eq!(AudioWaveform::from_bytes(&waveform).unwrap().samples.len(), 100);
            }
            other => panic!("unexpected content type {:?}", other),
        }
    }

    #[test]
    fn test_silent_wav_without_waveform() {
        let h = Harness::new(FakeAssetReader::unreadable(), false);
        let pending = h.import(pcm_wav(8000, 1, &vec![0i16; 8000]), "audio/wav");

        match pending.content_type {
            ContentType::Audio {
                duration,
                waveform_relative_path: None,
            } => assert!((duration - 1.0).abs() < 1e-6),
            other => panic!("unexpected content type {:?}", other),
        }
        assert_eq!(h.stored_file_count(), 1);
    }

    #[test]
    fn test_unencrypted_file_import() {
        let h = Harness::images();
        let path = h.dir.path().join("notes.pdf");
        fs::write(&path, b"%PDF-1.4 not really").unwrap();

        let input = AttachmentInput::new(AttachmentSource::UnencryptedFile(path.clone())).unwrap();
        let pending = h
            .pipeline
            .validate_local(input, "application/pdf", RenderingFlag::Default, Some("notes.pdf"))
            .unwrap();

        assert_eq!(pending.content_type, ContentType::File);
        assert_eq!(pending.source_filename.as_deref(), Some("notes.pdf"));
        assert_eq!(h.decrypt_primary(&pending), b"%PDF-1.4 not really");
        // Caller's plaintext is left alone
        assert!(path.exists());
    }

    #[test]
    fn test_local_import_rejects_ciphertext() {
        let h = Harness::images();
        let key = AttachmentKey::generate();
        let input = AttachmentInput {
            source: AttachmentSource::EncryptedFile(EncryptedFileSource {
                path: h.dir.path().join("x.enc"),
                key,
                plaintext_length: 1,
                digest: None,
            }),
            content_hash: ContentHash([0; 32]),
        };

        let err = h
            .pipeline
            .validate_local(input, "image/jpeg", RenderingFlag::Default, None)
            .unwrap_err();
        assert!(matches!(err, AttachmentError::UnsupportedSource { .. }));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // KEY REUSE
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_dedup_reuses_stored_key() {
        let h = Harness::images();
        let bytes = jpeg(30, 20);

        let first = h.import(bytes.clone(), "image/jpeg");
        h.store.commit_attachment(&first).unwrap();

        let second = h.import(bytes, "image/jpeg");
        assert_eq!(second.encryption_key, first.encryption_key);
        assert_ne!(second.local_relative_file_path, first.local_relative_file_path);

        let unrelated = h.import(jpeg(31, 20), "image/jpeg");
        assert_ne!(unrelated.encryption_key, first.encryption_key);
    }

    #[test]
    fn test_uncommitted_content_gets_fresh_keys() {
        let h = Harness::images();
        let bytes = jpeg(30, 20);

        let first = h.import(bytes.clone(), "image/jpeg");
        let second = h.import(bytes, "image/jpeg");
        assert_ne!(first.encryption_key, second.encryption_key);
        assert_eq!(first.content_hash, second.content_hash);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DOWNLOADS, REVALIDATION, BACKUPS
    // ═══════════════════════════════════════════════════════════════════════

    fn write_ciphertext(
        dir: &Path,
        name: &str,
        key: &AttachmentKey,
        plaintext: &[u8],
    ) -> (PathBuf, crate::crypto::EncryptionMetadata) {
        let (ciphertext, meta) = encrypt_bytes(key, plaintext, true).unwrap();
        let path = dir.join(name);
        fs::write(&path, ciphertext).unwrap();
        (path, meta)
    }

    #[test]
    fn test_download_keeps_its_ciphertext() {
        let h = Harness::images();
        let key = AttachmentKey::generate();
        let bytes = jpeg(40, 40);
        let (path, meta) = write_ciphertext(h.dir.path(), "download.enc", &key, &bytes);

        let pending = h
            .pipeline
            .validate_downloaded(
                DownloadedAttachment {
                    path: path.clone(),
                    key: key.clone(),
                    plaintext_length: Some(meta.plaintext_length),
                    integrity_check: IntegrityCheck::Digest(meta.digest),
                },
                "image/jpeg",
                RenderingFlag::Default,
                None,
            )
            .unwrap();

        assert_eq!(pending.encryption_key, key);
        assert_eq!(pending.digest, meta.digest);
        assert_eq!(pending.content_hash, content_hash_of_bytes(&bytes));
        assert_eq!(pending.encrypted_byte_count, meta.ciphertext_length);
        assert!(!path.exists());
        assert_eq!(h.decrypt_primary(&pending), bytes);
    }

    #[test]
    fn test_download_of_stored_content_is_rekeyed() {
        let h = Harness::images();
        let bytes = jpeg(40, 40);
        let stored = h.import(bytes.clone(), "image/jpeg");
        h.store.commit_attachment(&stored).unwrap();

        let download_key = AttachmentKey::generate();
        let (path, meta) = write_ciphertext(h.dir.path(), "download.enc", &download_key, &bytes);

        let pending = h
            .pipeline
            .validate_downloaded(
                DownloadedAttachment {
                    path,
                    key: download_key,
                    plaintext_length: Some(meta.plaintext_length),
                    integrity_check: IntegrityCheck::PlaintextHash(sha256(&bytes)),
                },
                "image/jpeg",
                RenderingFlag::Default,
                None,
            )
            .unwrap();

        assert_eq!(pending.encryption_key, stored.encryption_key);
        assert_eq!(h.decrypt_primary(&pending), bytes);
    }

    #[test]
    fn test_download_integrity_failures_abort_early() {
        let h = Harness::images();
        let key = AttachmentKey::generate();
        let bytes = jpeg(10, 10);
        let (path, meta) = write_ciphertext(h.dir.path(), "download.enc", &key, &bytes);

        let attempt = |key: AttachmentKey, check: IntegrityCheck| {
            h.pipeline.validate_downloaded(
                DownloadedAttachment {
                    path: path.clone(),
                    key,
                    plaintext_length: Some(meta.plaintext_length),
                    integrity_check: check,
                },
                "image/jpeg",
                RenderingFlag::Default,
                None,
            )
        };

        let err = attempt(key.clone(), IntegrityCheck::Digest([0; 32])).unwrap_err();
        assert!(matches!(err, AttachmentError::IntegrityCheckFailed(_)));

        let err = attempt(key.clone(), IntegrityCheck::PlaintextHash([0; 32])).unwrap_err();
        assert!(err.is_integrity_failure());

        let err = attempt(AttachmentKey::generate(), IntegrityCheck::Digest(meta.digest))
            .unwrap_err();
        assert!(err.is_integrity_failure());

        assert!(path.exists());
        assert!(h.store.ledger_entries().unwrap().is_empty());
        assert_eq!(h.stored_file_count(), 0);
    }

    #[test]
    fn test_revalidate_writes_only_new_artifacts() {
        let h = Harness::new(FakeAssetReader::unreadable(), true);
        let key = AttachmentKey::generate();
        let wav = pcm_wav(8000, 1, &vec![0i16; 4000]);
        let (path, meta) = write_ciphertext(h.dir.path(), "voice.enc", &key, &wav);

        let revalidated = h
            .pipeline
            .revalidate_encrypted(path.clone(), key.clone(), meta.plaintext_length, "audio/wav")
            .unwrap();

        let waveform_path = match &revalidated.content_type {
            ContentType::Audio {
                waveform_relative_path: Some(path),
                ..
            } => path.clone(),
            other => panic!("unexpected content type {:?}", other),
        };
        let orphan_id = revalidated.orphan_record_id.unwrap();
        let entry = h.store.orphan(orphan_id).unwrap().unwrap();
        assert_eq!(entry.record.relative_paths(), vec![waveform_path.as_str()]);
        assert!(path.exists());
        assert_eq!(h.stored_file_count(), 1);

        let (image_path, image_meta) =
            write_ciphertext(h.dir.path(), "photo.enc", &key, &jpeg(12, 12));
        let revalidated = h
            .pipeline
            .revalidate_encrypted(image_path, key, image_meta.plaintext_length, "image/jpeg")
            .unwrap();
        assert!(revalidated.orphan_record_id.is_none());
        assert!(revalidated.blurhash.is_some());
    }

    #[test]
    fn test_backup_restore_rekeys_inner_layer() {
        let h = Harness::images();
        let bytes = jpeg(24, 24);

        let inner_key = AttachmentKey::generate();
        let (inner_ciphertext, inner_meta) = encrypt_bytes(&inner_key, &bytes, true).unwrap();

        let outer_key = derive_backup_media_key(&[7u8; 32], b"media-id-1").unwrap();
        let (outer_path, outer_meta) =
            write_ciphertext(h.dir.path(), "backup.enc", &outer_key, &inner_ciphertext);

        let final_key = AttachmentKey::generate();
        let pending = h
            .pipeline
            .validate_backup(
                EncryptedLayer {
                    path: outer_path,
                    key: outer_key,
                    plaintext_length: Some(outer_meta.plaintext_length),
                    integrity_check: Some(IntegrityCheck::Digest(outer_meta.digest)),
                },
                InnerLayer {
                    key: inner_key,
                    plaintext_length: Some(inner_meta.plaintext_length),
                    integrity_check: IntegrityCheck::PlaintextHash(sha256(&bytes)),
                },
                final_key.clone(),
                "image/jpeg",
                RenderingFlag::Default,
                None,
            )
            .unwrap();

        assert_eq!(pending.encryption_key, final_key);
        assert_eq!(pending.content_hash, content_hash_of_bytes(&bytes));
        assert_eq!(h.decrypt_primary(&pending), bytes);
        assert!(h.scratch_is_empty());
    }

    #[test]
    fn test_backup_inner_integrity_failure() {
        let h = Harness::images();
        let inner_key = AttachmentKey::generate();
        let (inner_ciphertext, inner_meta) = encrypt_bytes(&inner_key, b"inner", true).unwrap();
        let outer_key = AttachmentKey::generate();
        let (outer_path, outer_meta) =
            write_ciphertext(h.dir.path(), "backup.enc", &outer_key, &inner_ciphertext);

        let err = h
            .pipeline
            .validate_backup(
                EncryptedLayer {
                    path: outer_path,
                    key: outer_key,
                    plaintext_length: Some(outer_meta.plaintext_length),
                    integrity_check: None,
                },
                InnerLayer {
                    key: inner_key,
                    plaintext_length: Some(inner_meta.plaintext_length),
                    integrity_check: IntegrityCheck::Digest([1; 32]),
                },
                AttachmentKey::generate(),
                "application/octet-stream",
                RenderingFlag::Default,
                None,
            )
            .unwrap_err();

        assert!(err.is_integrity_failure());
        assert!(h.scratch_is_empty());
        assert!(h.store.ledger_entries().unwrap().is_empty());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TEXT & THUMBNAILS
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_oversize_text() {
        let h = Harness::images();
        let text: String = "All work and no play. ".repeat(200 * 1024 / 22 + 1);
        assert!(text.len() >= 200 * 1024);

        let prepared = h.pipeline.prepare_oversize_text(MessageBody::new(text.clone())).unwrap();
        match prepared {
            PreparedText::Oversize {
                truncated,
                attachment,
            } => {
                assert!(truncated.text.len() <= 8 * 1024);
                assert!(text.starts_with(&truncated.text));
                assert_eq!(attachment.content_hash, content_hash_of_bytes(text.as_bytes()));
                assert_eq!(attachment.mime_type, MIME_OVERSIZE_TEXT);
                assert_eq!(attachment.content_type, ContentType::File);
                assert_eq!(h.decrypt_primary(&attachment), text.as_bytes());
            }
            PreparedText::Inline(_) => panic!("expected oversize text"),
        }
    }

    #[test]
    fn test_short_text_stays_inline() {
        let h = Harness::images();
        let prepared = h.pipeline.prepare_oversize_text(MessageBody::new("hello")).unwrap();

        assert!(matches!(&prepared, PreparedText::Inline(body) if body.text == "hello"));
        assert_eq!(prepared.inline_body().text, "hello");
        assert!(h.store.ledger_entries().unwrap().is_empty());
    }

    #[test]
    fn test_quoted_thumbnail_keeps_borderless() {
        let h = Harness::images();
        let mut png = Vec::new();
        image::DynamicImage::new_rgb8(1200, 800)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let input = AttachmentInput::new(AttachmentSource::InMemory(png)).unwrap();
        let original = h
            .pipeline
            .validate_local(input, "image/png", RenderingFlag::Borderless, None)
            .unwrap();

        let thumbnail = h.pipeline.prepare_quoted_reply_thumbnail(&original).unwrap().unwrap();
        assert_eq!(thumbnail.mime_type, "image/jpeg");
        assert_eq!(thumbnail.rendering_flag, RenderingFlag::Borderless);
        match thumbnail.content_type {
            ContentType::Image { pixel_size } => assert_eq!(pixel_size.max_dimension(), 512),
            other => panic!("unexpected content type {:?}", other),
        }

        let plain = original.without_rendering_flag();
        let thumbnail = h.pipeline.prepare_quoted_reply_thumbnail(&plain).unwrap().unwrap();
        assert_eq!(thumbnail.rendering_flag, RenderingFlag::Default);
    }

    #[test]
    fn test_quoted_thumbnail_from_video_still_frame() {
        let h = Harness::new(FakeAssetReader::video(1.0, 320, 240), true);
        let video = h.import(minimal_mp4(1000, 1000), "video/mp4");

        let thumbnail = h.pipeline.prepare_quoted_reply_thumbnail(&video).unwrap().unwrap();
        assert_eq!(
            thumbnail.content_type,
            ContentType::Image {
                pixel_size: PixelSize::new(320, 240)
            }
        );
    }

    #[test]
    fn test_no_thumbnail_for_files() {
        let h = Harness::images();
        let file = h.import(b"plain bytes".to_vec(), "application/zip");
        assert!(h.pipeline.prepare_quoted_reply_thumbnail(&file).unwrap().is_none());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CRASH SAFETY
    // ═══════════════════════════════════════════════════════════════════════

    struct RecordingLedger {
        inner: Arc<SqliteAttachmentStore>,
        events: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl OrphanLedger for RecordingLedger {
        fn commit_pending(&self, record: &OrphanedAttachmentRecord) -> AttachmentResult<i64> {
            if self.fail {
                return Err(AttachmentError::DatabaseError("database is locked".into()));
            }
            let id = self.inner.commit_pending(record)?;
            self.events.lock().push("commit".into());
            Ok(id)
        }
    }

    struct RecordingMover {
        inner: AttachmentStorage,
        events: Arc<Mutex<Vec<String>>>,
        crash: bool,
    }

    impl FileMover for RecordingMover {
        fn move_into_place(&self, staged: StagedFile, relative_path: &str) -> AttachmentResult<()> {
            if self.crash {
                return Err(io::Error::new(io::ErrorKind::Other, "simulated crash").into());
            }
            self.events.lock().push(format!("move {}", relative_path));
            self.inner.move_into_place(staged, relative_path)
        }
    }

    fn recording_harness(
        fail_commit: bool,
        crash_on_move: bool,
    ) -> (Harness, Arc<Mutex<Vec<String>>>) {
        let mut h = Harness::new(FakeAssetReader::video(2.0, 64, 48), true);
        let events = Arc::new(Mutex::new(Vec::new()));

        let ledger = Arc::new(RecordingLedger {
            inner: h.store.clone(),
            events: events.clone(),
            fail: fail_commit,
        });
        let mover = Arc::new(RecordingMover {
            inner: h.pipeline.storage().clone(),
            events: events.clone(),
            crash: crash_on_move,
        });

        h.pipeline = AttachmentPipeline::new(h.pipeline.config().clone(), h.store.clone(), ledger)
            .unwrap()
            .with_asset_reader(Arc::new(FakeAssetReader::video(2.0, 64, 48)))
            .with_waveform_service(Arc::new(FakeWaveformService { succeed: true }))
            .with_file_mover(mover);
        (h, events)
    }

    #[test]
    fn test_commit_precedes_every_move() {
        let (h, events) = recording_harness(false, false);
        let pending = h.import(minimal_mp4(600, 1200), "video/mp4");

        let events = events.lock().clone();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], "commit");
        for path in pending.relative_paths() {
            assert!(events[1..].contains(&format!("move {}", path)));
        }
    }

    #[test]
    fn test_crash_between_commit_and_move_is_reclaimable() {
        let (h, events) = recording_harness(false, true);
        let input =
            AttachmentInput::new(AttachmentSource::InMemory(minimal_mp4(600, 1200))).unwrap();

        let err = h
            .pipeline
            .validate_local(input, "video/mp4", RenderingFlag::Default, None)
            .unwrap_err();
        assert!(err.is_io());
        assert_eq!(*events.lock(), vec!["commit".to_string()]);

        // The ledger names files that never reached storage
        let pending = h.store.pending_orphans().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].relative_paths().len(), 2);
        for path in pending[0].relative_paths() {
            assert!(!h.pipeline.storage().exists(path));
        }
        assert_eq!(h.stored_file_count(), 0);
        assert!(h.scratch_is_empty());

        let report = OrphanReclaimer::new(&h.store, h.pipeline.storage(), 0).reclaim().unwrap();
        assert_eq!(report.rows_cleared, 1);
        assert!(h.store.ledger_entries().unwrap().is_empty());
    }

    #[test]
    fn test_failed_commit_leaves_nothing_behind() {
        let (h, events) = recording_harness(true, false);
        let input = AttachmentInput::new(AttachmentSource::InMemory(jpeg(20, 20))).unwrap();

        let err = h
            .pipeline
            .validate_local(input, "image/jpeg", RenderingFlag::Default, None)
            .unwrap_err();
        assert!(matches!(err, AttachmentError::DatabaseError(_)));
        assert!(events.lock().is_empty());
        assert_eq!(h.stored_file_count(), 0);
        assert!(h.scratch_is_empty());
    }
}
