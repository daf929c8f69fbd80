//! Secure Attachments - Quoted Reply Thumbnails
//!
//! Small JPEG previews of visual media for quoted replies.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};

use crate::error::AttachmentResult;

/// Thumbnail Engine
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEngine {
    /// Longest side of the output
    max_dimension: u32,
    /// JPEG quality, 1..=100
    quality: u8,
}

impl ThumbnailEngine {
    pub fn new(max_dimension: u32, quality: u8) -> Self {
        Self {
            max_dimension,
            quality: quality.clamp(1, 100),
        }
    }

    /// Shrink to fit `max_dimension` (never enlarging) and encode as JPEG
    pub fn render(&self, image: &DynamicImage) -> AttachmentResult<Vec<u8>> {
        let (width, height) = image.dimensions();

        let resized = if width.max(height) > self.max_dimension {
            image.thumbnail(self.max_dimension, self.max_dimension)
        } else {
            image.clone()
        };

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

        let mut output = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut output), self.quality);
        rgb.write_with_encoder(encoder)?;
        Ok(output)
    }
}
