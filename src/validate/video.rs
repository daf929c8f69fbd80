//! Video validation: container checks, probing and still-frame extraction.

use std::io::Cursor;

use ::image::{GenericImageView, ImageFormat};
use log::{debug, warn};

use super::{PlaintextMedia, ValidatedContent, ValidatedKind, ValidationContext};
use crate::content_type::PixelSize;
use crate::error::{AttachmentError, AttachmentResult};
use crate::input::AttachmentSource;
use crate::media::blurhash;
use crate::media::mp4::{self, Mp4Error};

/// Validate a video payload.
///
/// # Panics
///
/// If the payload exceeds the configured video ceiling.
pub fn validate_video(
    source: &AttachmentSource,
    mime_type: &str,
    ctx: &ValidationContext<'_>,
) -> AttachmentResult<ValidatedContent> {
    let ceiling = ctx.config.max_video_bytes;
    let length = source.plaintext_length()?;
    assert!(
        length <= ceiling,
        "video payload of {} bytes exceeds the {} byte ceiling",
        length,
        ceiling
    );

    let plaintext = PlaintextMedia::prepare(source, &ctx.config.scratch_dir())?;

    if mp4::is_iso_bmff(mime_type) {
        match mp4::inspect(plaintext.open()?) {
            Ok(summary) => debug!("Container duration {:?}", summary.duration),
            Err(Mp4Error::Io(e)) if e.kind() != std::io::ErrorKind::UnexpectedEof => {
                return Err(e.into())
            }
            Err(e) => {
                warn!("Video container rejected: {}", e);
                return Ok(ValidatedContent::invalid(mime_type));
            }
        }
    }

    let info = match ctx.asset_reader.probe(plaintext.asset_input()?) {
        Ok(info) => info,
        Err(e) if e.is_soft() => {
            warn!("Video asset unreadable: {}", e);
            return Ok(ValidatedContent::invalid(mime_type));
        }
        Err(e) => return Err(AttachmentError::Asset(e)),
    };

    if !info.is_playable_video() {
        warn!("Video asset failed validity checks: {:?}", info);
        return Ok(ValidatedContent::invalid(mime_type));
    }

    let max_dimension = ctx.config.still_frame_max_dimension;
    let mut frame = match ctx.asset_reader.still_frame(plaintext.asset_input()?, max_dimension) {
        Ok(frame) => frame,
        Err(e) if e.is_soft() => {
            warn!("No still frame could be decoded: {}", e);
            return Ok(ValidatedContent::invalid(mime_type));
        }
        Err(e) => return Err(AttachmentError::Asset(e)),
    };

    let (width, height) = frame.dimensions();
    if width.max(height) > max_dimension {
        frame = frame.thumbnail(max_dimension, max_dimension);
    }
    let (width, height) = frame.dimensions();

    let mut still_frame = Vec::new();
    frame.write_to(&mut Cursor::new(&mut still_frame), ImageFormat::Png)?;

    Ok(ValidatedContent {
        kind: ValidatedKind::Video {
            duration: info.duration,
            pixel_size: PixelSize::new(width, height),
            still_frame: Some(still_frame),
        },
        mime_type: mime_type.to_string(),
        blurhash: blurhash::encode_image(&frame),
    })
}
