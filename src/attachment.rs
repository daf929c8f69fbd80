//! Secure Attachments - Pipeline Results

use serde::{Deserialize, Serialize};

use crate::content_type::ContentType;
use crate::crypto::AttachmentKey;
use crate::input::ContentHash;

/// How a client should render an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderingFlag {
    #[default]
    Default,
    VoiceMessage,
    Borderless,
    ShouldLoop,
}

/// Validated and encrypted payload, staged for the caller to commit.
///
/// Until the caller commits it, its files are owned by the orphan ledger
/// row `orphan_record_id`.
#[derive(Debug, Clone)]
pub struct PendingAttachment {
    pub content_hash: ContentHash,
    /// Encrypted file length including framing
    pub encrypted_byte_count: u64,
    pub unencrypted_byte_count: u64,
    /// Declared MIME type, corrected when sniffing disagreed
    pub mime_type: String,
    pub encryption_key: AttachmentKey,
    /// SHA-256 over the encrypted file
    pub digest: [u8; 32],
    /// Primary file, relative to the storage root
    pub local_relative_file_path: String,
    pub rendering_flag: RenderingFlag,
    pub source_filename: Option<String>,
    pub content_type: ContentType,
    pub blurhash: Option<String>,
    pub orphan_record_id: i64,
}

impl PendingAttachment {
    /// Same attachment rendered with the default flag
    pub fn without_rendering_flag(self) -> Self {
        Self {
            rendering_flag: RenderingFlag::Default,
            ..self
        }
    }

    /// Primary path followed by any derived artifact paths
    pub fn relative_paths(&self) -> Vec<&str> {
        let mut paths = vec![self.local_relative_file_path.as_str()];
        paths.extend(self.content_type.derived_relative_paths());
        paths
    }
}

/// Fresh content-type for ciphertext that already has a permanent file
#[derive(Debug, Clone, PartialEq)]
pub struct RevalidatedAttachment {
    pub content_type: ContentType,
    pub mime_type: String,
    pub blurhash: Option<String>,
    /// Ledger row owning newly written artifacts, if any were written
    pub orphan_record_id: Option<i64>,
}

/// Staging ledger row naming files about to enter permanent storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedAttachmentRecord {
    /// Row id, `None` until committed
    pub id: Option<i64>,
    pub local_relative_file_path: Option<String>,
    pub waveform_relative_path: Option<String>,
    pub still_frame_relative_path: Option<String>,
    pub is_pending: bool,
}

impl OrphanedAttachmentRecord {
    /// Every path the row names
    pub fn relative_paths(&self) -> Vec<&str> {
        [
            &self.local_relative_file_path,
            &self.waveform_relative_path,
            &self.still_frame_relative_path,
        ]
        .into_iter()
        .filter_map(|path| path.as_deref())
        .collect()
    }
}
