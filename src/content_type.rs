//! Secure Attachments - Content Types & Classification
//!
//! Maps a declared MIME type to a validator bucket and describes the
//! outcome of validation.

use serde::{Deserialize, Serialize};

/// MIME type of long-text attachments
pub const MIME_OVERSIZE_TEXT: &str = "text/x-signal-plain";

const VIDEO_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/x-m4v",
    "video/3gpp",
    "video/3gpp2",
];

const AUDIO_MIME_TYPES: &[&str] = &[
    "audio/aac",
    "audio/aiff",
    "audio/amr",
    "audio/flac",
    "audio/mp3",
    "audio/mp4",
    "audio/mpeg",
    "audio/ogg",
    "audio/wav",
    "audio/wave",
    "audio/x-aiff",
    "audio/x-flac",
    "audio/x-m4a",
    "audio/x-wav",
];

const DEFINITELY_ANIMATED_MIME_TYPES: &[&str] = &["image/gif"];

const IMAGE_MIME_TYPES: &[&str] = &[
    "image/bmp",
    "image/heic",
    "image/heif",
    "image/jpeg",
    "image/jpg",
    "image/tiff",
    "image/x-icon",
    "image/x-ms-bmp",
];

const MAYBE_ANIMATED_MIME_TYPES: &[&str] = &[
    "image/apng",
    "image/png",
    "image/vnd.mozilla.apng",
    "image/webp",
];

/// Pixel dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// Resolved content type of a validated payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentType {
    Invalid,
    File,
    Image {
        pixel_size: PixelSize,
    },
    AnimatedImage {
        pixel_size: PixelSize,
    },
    Video {
        /// Seconds
        duration: f64,
        /// Size of the still frame, not the native resolution
        pixel_size: PixelSize,
        still_frame_relative_path: Option<String>,
    },
    Audio {
        /// Seconds
        duration: f64,
        waveform_relative_path: Option<String>,
    },
}

impl ContentType {
    /// Short variant name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            ContentType::Invalid => "invalid",
            ContentType::File => "file",
            ContentType::Image { .. } => "image",
            ContentType::AnimatedImage { .. } => "animated_image",
            ContentType::Video { .. } => "video",
            ContentType::Audio { .. } => "audio",
        }
    }

    /// Relative paths of derived artifacts owned by this content type
    pub fn derived_relative_paths(&self) -> Vec<&str> {
        match self {
            ContentType::Video {
                still_frame_relative_path: Some(path),
                ..
            } => vec![path.as_str()],
            ContentType::Audio {
                waveform_relative_path: Some(path),
                ..
            } => vec![path.as_str()],
            _ => Vec::new(),
        }
    }

    /// Images, animated images and videos
    pub fn is_visual_media(&self) -> bool {
        matches!(
            self,
            ContentType::Image { .. }
                | ContentType::AnimatedImage { .. }
                | ContentType::Video { .. }
        )
    }
}

/// Validator a MIME type dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentBucket {
    Image,
    AnimatedImage,
    Video,
    Audio,
    File,
}

/// Lowercase a MIME type and strip any parameters
pub fn normalize_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Select exactly one bucket for a MIME type. Rules are ordered and
/// mutually exclusive.
pub fn classify(mime_type: &str) -> ContentBucket {
    let mime = normalize_mime(mime_type);
    let mime = mime.as_str();

    if VIDEO_MIME_TYPES.contains(&mime) {
        ContentBucket::Video
    } else if AUDIO_MIME_TYPES.contains(&mime) {
        ContentBucket::Audio
    } else if DEFINITELY_ANIMATED_MIME_TYPES.contains(&mime) {
        ContentBucket::AnimatedImage
    } else if IMAGE_MIME_TYPES.contains(&mime) {
        ContentBucket::Image
    } else if MAYBE_ANIMATED_MIME_TYPES.contains(&mime) {
        ContentBucket::AnimatedImage
    } else {
        ContentBucket::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_rules() {
        assert_eq!(classify("video/mp4"), ContentBucket::Video);
        assert_eq!(classify("audio/x-wav"), ContentBucket::Audio);
        assert_eq!(classify("image/gif"), ContentBucket::AnimatedImage);
        assert_eq!(classify("image/jpeg"), ContentBucket::Image);
        assert_eq!(classify("image/webp"), ContentBucket::AnimatedImage);
        assert_eq!(classify("image/png"), ContentBucket::AnimatedImage);
        assert_eq!(classify("application/pdf"), ContentBucket::File);
        assert_eq!(classify(""), ContentBucket::File);
    }

    #[test]
    fn test_classification_normalizes_mime() {
        assert_eq!(classify("Image/JPEG"), ContentBucket::Image);
        assert_eq!(classify("audio/mpeg; codecs=mp3"), ContentBucket::Audio);
    }

    #[test]
    fn test_classification_is_idempotent() {
        for mime in ["video/quicktime", "image/heic", "text/plain", "image/apng"] {
            assert_eq!(classify(mime), classify(mime));
        }
    }

    #[test]
    fn test_derived_paths() {
        let video = ContentType::Video {
            duration: 3.0,
            pixel_size: PixelSize::new(640, 360),
            still_frame_relative_path: Some("ab/frame".into()),
        };
        assert_eq!(video.derived_relative_paths(), vec!["ab/frame"]);
        assert!(video.is_visual_media());

        let audio = ContentType::Audio {
            duration: 1.0,
            waveform_relative_path: None,
        };
        assert!(audio.derived_relative_paths().is_empty());
        assert!(!audio.is_visual_media());
    }

    #[test]
    fn test_content_type_json_shape() {
        let image = ContentType::Image {
            pixel_size: PixelSize::new(50, 50),
        };
        let json = serde_json::to_string(&image).unwrap();
        assert!(json.contains("\"kind\":\"image\""));

        let decoded: ContentType = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, image);
    }
}
