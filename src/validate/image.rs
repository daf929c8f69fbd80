//! Image and animated-image validation by content sniffing.

use std::io::Cursor;
use std::path::Path;

use ::image::{ImageFormat, ImageReader};
use log::{debug, warn};

use super::{ValidatedContent, ValidatedKind};
use crate::config::PipelineConfig;
use crate::content_type::{normalize_mime, ContentBucket, PixelSize};
use crate::error::AttachmentResult;
use crate::input::AttachmentSource;
use crate::media::blurhash;

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// VP8X flag bit announcing an animated WebP
const WEBP_ANIMATION_FLAG: u8 = 0x02;

/// Sniffed facts about a well-formed image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageMetadata {
    format: ImageFormat,
    pixel_size: PixelSize,
    is_animated: bool,
}

/// What the bytes say compared to what the caller declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageSniff {
    Valid(ImageMetadata),
    Invalid,
    MimeTypeMismatch(ImageMetadata),
    FileExtensionMismatch(ImageMetadata),
}

/// Collapse aliases so declared and sniffed MIME types compare equal
fn canonical_image_mime(mime_type: &str) -> String {
    let mime = normalize_mime(mime_type);
    match mime.as_str() {
        "image/jpg" => "image/jpeg".into(),
        "image/apng" | "image/vnd.mozilla.apng" => "image/png".into(),
        "image/x-ms-bmp" => "image/bmp".into(),
        "image/vnd.microsoft.icon" => "image/x-icon".into(),
        _ => mime,
    }
}

/// APNG files carry an `acTL` chunk ahead of the first `IDAT`
fn is_apng(bytes: &[u8]) -> bool {
    if !bytes.starts_with(PNG_SIGNATURE) {
        return false;
    }

    let mut offset = PNG_SIGNATURE.len();
    while offset + 8 <= bytes.len() {
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[offset..offset + 4]);
        let length = u32::from_be_bytes(length) as usize;
        match &bytes[offset + 4..offset + 8] {
            b"acTL" => return true,
            b"IDAT" | b"IEND" => return false,
            _ => {}
        }
        // length + type + data + crc
        offset = match offset.checked_add(12 + length) {
            Some(next) => next,
            None => return false,
        };
    }
    false
}

fn is_animated_webp(bytes: &[u8]) -> bool {
    bytes.len() > 20
        && &bytes[0..4] == b"RIFF"
        && &bytes[8..12] == b"WEBP"
        && &bytes[12..16] == b"VP8X"
        && bytes[20] & WEBP_ANIMATION_FLAG != 0
}

fn sniff(bytes: &[u8], declared_mime: &str, source_filename: Option<&str>) -> ImageSniff {
    let format = match ::image::guess_format(bytes) {
        Ok(format) => format,
        Err(e) => {
            debug!("Unrecognised image header: {}", e);
            return ImageSniff::Invalid;
        }
    };

    let reader = ImageReader::with_format(Cursor::new(bytes), format);
    let (width, height) = match reader.into_dimensions() {
        Ok(dimensions) => dimensions,
        Err(e) => {
            debug!("Unreadable {:?} geometry: {}", format, e);
            return ImageSniff::Invalid;
        }
    };
    let pixel_size = PixelSize::new(width, height);
    if pixel_size.is_empty() {
        return ImageSniff::Invalid;
    }

    let is_animated = match format {
        ImageFormat::Gif => true,
        ImageFormat::Png => is_apng(bytes),
        ImageFormat::WebP => is_animated_webp(bytes),
        _ => false,
    };

    let metadata = ImageMetadata {
        format,
        pixel_size,
        is_animated,
    };

    if canonical_image_mime(declared_mime) != format.to_mime_type() {
        return ImageSniff::MimeTypeMismatch(metadata);
    }

    let extension_format = source_filename
        .and_then(|name| Path::new(name).extension())
        .and_then(ImageFormat::from_extension);
    if matches!(extension_format, Some(expected) if expected != format) {
        return ImageSniff::FileExtensionMismatch(metadata);
    }

    ImageSniff::Valid(metadata)
}

/// Validate an image payload.
///
/// # Panics
///
/// If the payload exceeds the configured ceiling for its bucket. Callers
/// enforce size limits before handing content to the pipeline.
pub fn validate_image(
    source: &AttachmentSource,
    mime_type: &str,
    bucket: ContentBucket,
    source_filename: Option<&str>,
    config: &PipelineConfig,
) -> AttachmentResult<ValidatedContent> {
    let ceiling = if bucket == ContentBucket::AnimatedImage {
        config.max_animated_image_bytes
    } else {
        config.max_image_bytes
    };
    let length = source.plaintext_length()?;
    assert!(
        length <= ceiling,
        "image payload of {} bytes exceeds the {} byte ceiling",
        length,
        ceiling
    );

    let bytes = source.read_plaintext()?;

    let (metadata, mime_type) = match sniff(&bytes, mime_type, source_filename) {
        ImageSniff::Invalid => {
            warn!("Image declared as {} is malformed", mime_type);
            return Ok(ValidatedContent::invalid(mime_type));
        }
        ImageSniff::Valid(metadata) => (metadata, normalize_mime(mime_type)),
        ImageSniff::MimeTypeMismatch(metadata) => {
            let sniffed = metadata.format.to_mime_type();
            warn!("Image declared as {} sniffs as {}, correcting", mime_type, sniffed);
            (metadata, sniffed.to_string())
        }
        ImageSniff::FileExtensionMismatch(metadata) => {
            warn!(
                "Filename {:?} disagrees with sniffed {:?}",
                source_filename.unwrap_or_default(),
                metadata.format
            );
            (metadata, normalize_mime(mime_type))
        }
    };

    let blurhash = match ::image::load_from_memory_with_format(&bytes, metadata.format) {
        Ok(decoded) => blurhash::encode_image(&decoded),
        Err(e) => {
            debug!("No blur placeholder for {:?}: {}", metadata.format, e);
            None
        }
    };

    let kind = if metadata.is_animated {
        ValidatedKind::AnimatedImage(metadata.pixel_size)
    } else {
        ValidatedKind::Image(metadata.pixel_size)
    };

    Ok(ValidatedContent {
        kind,
        mime_type,
        blurhash,
    })
}

#[cfg(test)]
pub(crate) fn encode_test_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    use ::image::{DynamicImage, Rgba, RgbaImage};

    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 5 % 256) as u8, (y * 5 % 256) as u8, 120, 255])
    });
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8()),
        _ => DynamicImage::ImageRgba8(image),
    };

    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}
