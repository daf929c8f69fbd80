//! Secure Attachments - Type Validators
//!
//! Deep inspection of a payload for its content bucket, producing the
//! resolved content type and any derived artifact bytes (plaintext, not yet
//! encrypted).

mod audio;
mod image;
mod video;

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

use crate::config::PipelineConfig;
use crate::content_type::{classify, ContentBucket, ContentType, PixelSize};
use crate::crypto::{open_encrypted_file, DecryptingReader};
use crate::encryption::scratch_file;
use crate::error::AttachmentResult;
use crate::input::{AttachmentSource, EncryptedFileSource};
use crate::media::{AssetInput, MediaAssetReader, MediaStream, WaveformService};

pub use self::audio::validate_audio;
pub use self::image::validate_image;
pub use self::video::validate_video;

#[cfg(test)]
pub(crate) use self::image::encode_test_image;

/// Collaborators and limits shared by all validators
pub struct ValidationContext<'a> {
    pub config: &'a PipelineConfig,
    pub asset_reader: &'a dyn MediaAssetReader,
    pub waveform_service: &'a dyn WaveformService,
}

/// Derived artifact produced alongside the primary payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    StillFrame,
    Waveform,
}

/// Outcome of deep validation
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedKind {
    Invalid,
    File,
    Image(PixelSize),
    AnimatedImage(PixelSize),
    Video {
        duration: f64,
        pixel_size: PixelSize,
        /// PNG-encoded frame
        still_frame: Option<Vec<u8>>,
    },
    Audio {
        duration: f64,
        /// Serialized `AudioWaveform`
        waveform: Option<Vec<u8>>,
    },
}

/// Validated payload: kind, effective MIME type and blur placeholder
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedContent {
    pub kind: ValidatedKind,
    pub mime_type: String,
    pub blurhash: Option<String>,
}

impl ValidatedContent {
    pub fn invalid(mime_type: &str) -> Self {
        Self {
            kind: ValidatedKind::Invalid,
            mime_type: mime_type.to_string(),
            blurhash: None,
        }
    }

    pub fn file(mime_type: &str) -> Self {
        Self {
            kind: ValidatedKind::File,
            mime_type: mime_type.to_string(),
            blurhash: None,
        }
    }

    /// Derived artifact bytes, if validation produced one
    pub fn artifact(&self) -> Option<(ArtifactKind, &[u8])> {
        match &self.kind {
            ValidatedKind::Video {
                still_frame: Some(frame),
                ..
            } => Some((ArtifactKind::StillFrame, frame)),
            ValidatedKind::Audio {
                waveform: Some(waveform),
                ..
            } => Some((ArtifactKind::Waveform, waveform)),
            _ => None,
        }
    }

    /// Resolve into a `ContentType`, naming where the artifact will live.
    ///
    /// `artifact_relative_path` is ignored for kinds that carry no artifact.
    pub fn to_content_type(&self, artifact_relative_path: Option<String>) -> ContentType {
        match &self.kind {
            ValidatedKind::Invalid => ContentType::Invalid,
            ValidatedKind::File => ContentType::File,
            ValidatedKind::Image(pixel_size) => ContentType::Image {
                pixel_size: *pixel_size,
            },
            ValidatedKind::AnimatedImage(pixel_size) => ContentType::AnimatedImage {
                pixel_size: *pixel_size,
            },
            ValidatedKind::Video {
                duration,
                pixel_size,
                still_frame,
            } => ContentType::Video {
                duration: *duration,
                pixel_size: *pixel_size,
                still_frame_relative_path: still_frame.as_ref().and(artifact_relative_path),
            },
            ValidatedKind::Audio { duration, waveform } => ContentType::Audio {
                duration: *duration,
                waveform_relative_path: waveform.as_ref().and(artifact_relative_path),
            },
        }
    }
}

/// Classify by MIME type and run the matching validator
pub fn validate(
    source: &AttachmentSource,
    mime_type: &str,
    source_filename: Option<&str>,
    ctx: &ValidationContext<'_>,
) -> AttachmentResult<ValidatedContent> {
    let bucket = classify(mime_type);
    debug!("Validating {} payload as {:?}", mime_type, bucket);

    match bucket {
        ContentBucket::Image | ContentBucket::AnimatedImage => {
            validate_image(source, mime_type, bucket, source_filename, ctx.config)
        }
        ContentBucket::Video => validate_video(source, mime_type, ctx),
        ContentBucket::Audio => validate_audio(source, mime_type, ctx),
        ContentBucket::File => Ok(ValidatedContent::file(mime_type)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PLAINTEXT ACCESS
// ═══════════════════════════════════════════════════════════════════════════

/// Seekable plaintext of a payload under validation.
///
/// Encrypted files are decrypted on the fly and never staged. Only in-memory
/// payloads go to a scratch file, since media tools read from disk or stdin.
pub(crate) enum PlaintextMedia<'a> {
    Unencrypted(&'a Path),
    Scratch(NamedTempFile),
    Encrypted(&'a EncryptedFileSource),
}

impl<'a> PlaintextMedia<'a> {
    pub(crate) fn prepare(
        source: &'a AttachmentSource,
        scratch_dir: &Path,
    ) -> AttachmentResult<Self> {
        match source {
            AttachmentSource::UnencryptedFile(path) => Ok(PlaintextMedia::Unencrypted(path)),
            AttachmentSource::EncryptedFile(encrypted) => Ok(PlaintextMedia::Encrypted(encrypted)),
            AttachmentSource::InMemory(bytes) => {
                let mut scratch = scratch_file(scratch_dir)?;
                scratch.write_all(bytes)?;
                scratch.flush()?;
                Ok(PlaintextMedia::Scratch(scratch))
            }
        }
    }

    /// Fresh stream positioned at the first plaintext byte
    pub(crate) fn open(&self) -> AttachmentResult<Box<dyn MediaStream>> {
        let stream: Box<dyn MediaStream> = match self {
            PlaintextMedia::Unencrypted(path) => Box::new(BufReader::new(File::open(path)?)),
            PlaintextMedia::Scratch(file) => Box::new(BufReader::new(file.reopen()?)),
            PlaintextMedia::Encrypted(source) => Box::new(BufReader::new(open_encrypted(source)?)),
        };
        Ok(stream)
    }

    /// Hand the plaintext to a media tool
    pub(crate) fn asset_input(&self) -> AttachmentResult<AssetInput<'_>> {
        match self {
            PlaintextMedia::Unencrypted(path) => Ok(AssetInput::File(path)),
            PlaintextMedia::Scratch(file) => Ok(AssetInput::File(file.path())),
            PlaintextMedia::Encrypted(source) => {
                Ok(AssetInput::Stream(Box::new(open_encrypted(source)?)))
            }
        }
    }
}

fn open_encrypted(source: &EncryptedFileSource) -> AttachmentResult<DecryptingReader<File>> {
    open_encrypted_file(&source.path, &source.key, Some(source.plaintext_length))
}
