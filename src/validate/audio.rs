//! Audio validation: duration and an opportunistic waveform.

use std::io::Read;

use log::{debug, warn};

use super::{PlaintextMedia, ValidatedContent, ValidatedKind, ValidationContext};
use crate::error::{AttachmentError, AttachmentResult};
use crate::input::AttachmentSource;
use crate::media::wav::{self, WavError};

/// Duration in seconds, or `None` when the payload is not playable audio
fn read_duration(
    plaintext: &PlaintextMedia<'_>,
    ctx: &ValidationContext<'_>,
) -> AttachmentResult<Option<f64>> {
    let mut header = Vec::with_capacity(12);
    plaintext.open()?.take(12).read_to_end(&mut header)?;

    if wav::is_wav(&header) {
        return match wav::parse(plaintext.open()?) {
            Ok(info) => Ok(Some(info.duration())),
            Err(WavError::Io(e)) => Err(e.into()),
            Err(e) => {
                warn!("Audio rejected: {}", e);
                Ok(None)
            }
        };
    }

    match ctx.asset_reader.probe(plaintext.asset_input()?) {
        Ok(info) if info.has_audio && info.duration.is_finite() && info.duration >= 0.0 => {
            Ok(Some(info.duration))
        }
        Ok(info) => {
            warn!("Asset has no playable audio: {:?}", info);
            Ok(None)
        }
        Err(e) if e.is_soft() => {
            warn!("Audio asset unreadable: {}", e);
            Ok(None)
        }
        Err(e) => Err(AttachmentError::Asset(e)),
    }
}

/// Validate an audio payload.
///
/// Waveform failures never fail validation; the waveform is simply absent.
pub fn validate_audio(
    source: &AttachmentSource,
    mime_type: &str,
    ctx: &ValidationContext<'_>,
) -> AttachmentResult<ValidatedContent> {
    let plaintext = PlaintextMedia::prepare(source, &ctx.config.scratch_dir())?;

    let duration = match read_duration(&plaintext, ctx)? {
        Some(duration) => duration,
        None => return Ok(ValidatedContent::invalid(mime_type)),
    };

    let waveform = match ctx.waveform_service.compute(&mut *plaintext.open()?, mime_type) {
        Ok(waveform) => match waveform.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Waveform not serializable: {}", e);
                None
            }
        },
        Err(e) => {
            debug!("No waveform for {}: {}", mime_type, e);
            None
        }
    };

    Ok(ValidatedContent {
        kind: ValidatedKind::Audio { duration, waveform },
        mime_type: mime_type.to_string(),
        blurhash: None,
    })
}
