//! Secure Attachments - Configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AttachmentError, AttachmentResult};

/// Scratch directory name under the storage root
pub const DEFAULT_SCRATCH_DIR_NAME: &str = ".scratch";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of permanent attachment storage
    pub storage_root: PathBuf,
    /// Directory for uniquely-named scratch files. Defaults to a private
    /// directory under `storage_root`, on the same filesystem so scratch
    /// files can be renamed into place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    /// Attachment database
    pub database_path: PathBuf,
    /// Byte ceiling for still images
    pub max_image_bytes: u64,
    /// Byte ceiling for animated images
    pub max_animated_image_bytes: u64,
    /// Byte ceiling for videos
    pub max_video_bytes: u64,
    /// Longest side of an extracted video still frame
    pub still_frame_max_dimension: u32,
    /// Longest inline message body, in bytes
    pub oversize_text_threshold: usize,
    /// Longest side of a quoted-reply thumbnail
    pub quoted_thumbnail_max_dimension: u32,
    /// JPEG quality of quoted-reply thumbnails
    pub quoted_thumbnail_quality: u8,
    /// ffprobe executable
    pub ffprobe_path: String,
    /// ffmpeg executable
    pub ffmpeg_path: String,
    /// Age after which a pending ledger row is reclaimable
    pub orphan_grace_period_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./attachments"),
            scratch_dir: None,
            database_path: PathBuf::from("./attachments.db"),
            max_image_bytes: 8 * 1024 * 1024,
            max_animated_image_bytes: 25 * 1024 * 1024,
            max_video_bytes: 95 * 1024 * 1024,
            still_frame_max_dimension: 1024,
            oversize_text_threshold: 8 * 1024,
            quoted_thumbnail_max_dimension: 512,
            quoted_thumbnail_quality: 80,
            ffprobe_path: "ffprobe".into(),
            ffmpeg_path: "ffmpeg".into(),
            orphan_grace_period_secs: 24 * 60 * 60,
        }
    }
}

impl PipelineConfig {
    /// Effective scratch directory
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.storage_root.join(DEFAULT_SCRATCH_DIR_NAME))
    }

    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> AttachmentResult<Self> {
        let data = std::fs::read(path)?;
        let config: PipelineConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> AttachmentResult<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot work with
    pub fn validate(&self) -> AttachmentResult<()> {
        if self.still_frame_max_dimension == 0 || self.quoted_thumbnail_max_dimension == 0 {
            return Err(AttachmentError::ConfigError(
                "thumbnail dimensions must be non-zero".into(),
            ));
        }
        if self.quoted_thumbnail_quality == 0 || self.quoted_thumbnail_quality > 100 {
            return Err(AttachmentError::ConfigError(format!(
                "JPEG quality must be within 1..=100, got {}",
                self.quoted_thumbnail_quality
            )));
        }
        if self.oversize_text_threshold == 0 {
            return Err(AttachmentError::ConfigError(
                "oversize text threshold must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
