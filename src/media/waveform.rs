//! Audio waveforms: a compact amplitude-over-time summary.

use std::io::{self, Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::asset::MediaStream;
use super::wav::{self, WavError};
use crate::error::AttachmentResult;

/// Default number of amplitude buckets
pub const DEFAULT_BUCKET_COUNT: usize = 100;

#[derive(Error, Debug)]
pub enum WaveformError {
    #[error("Unsupported audio for waveform: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Peak amplitudes normalized to `0.0..=1.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioWaveform {
    pub samples: Vec<f32>,
}

impl AudioWaveform {
    pub fn to_bytes(&self) -> AttachmentResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> AttachmentResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Computes waveforms from seekable plaintext audio
pub trait WaveformService: Send + Sync {
    fn compute(
        &self,
        audio: &mut dyn MediaStream,
        mime_type: &str,
    ) -> Result<AudioWaveform, WaveformError>;
}

/// Waveforms for 8/16-bit integer PCM WAV files
#[derive(Debug, Clone)]
pub struct PcmWaveformService {
    bucket_count: usize,
}

impl PcmWaveformService {
    pub fn new(bucket_count: usize) -> Self {
        Self {
            bucket_count: bucket_count.max(1),
        }
    }
}

impl Default for PcmWaveformService {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}

impl WaveformService for PcmWaveformService {
    fn compute(
        &self,
        audio: &mut dyn MediaStream,
        mime_type: &str,
    ) -> Result<AudioWaveform, WaveformError> {
        let info = wav::parse(&mut *audio).map_err(|e| match e {
            WavError::Io(e) => WaveformError::Io(e),
            other => WaveformError::UnsupportedFormat(format!("{}: {}", mime_type, other)),
        })?;

        if !info.is_integer_pcm() || !matches!(info.bits_per_sample, 8 | 16) {
            return Err(WaveformError::UnsupportedFormat(format!(
                "{} ({}-bit, format {:#06x})",
                mime_type, info.bits_per_sample, info.format_tag
            )));
        }

        let frames = info.frame_count();
        if frames == 0 {
            return Err(WaveformError::UnsupportedFormat("no samples".into()));
        }

        let buckets = (self.bucket_count as u64).min(frames);
        let frames_per_bucket = frames.div_ceil(buckets);
        let bytes_per_sample = usize::from(info.bytes_per_sample());
        let channels = usize::from(info.channels);
        if usize::from(info.block_align) < channels * bytes_per_sample {
            return Err(WaveformError::UnsupportedFormat(format!(
                "{} (block align {} for {} channels)",
                mime_type, info.block_align, info.channels
            )));
        }

        audio.seek(SeekFrom::Start(info.data_offset))?;
        let mut frame = vec![0u8; usize::from(info.block_align)];
        let mut samples = Vec::with_capacity(buckets as usize);
        let mut peak = 0f32;

        for index in 0..frames {
            audio.read_exact(&mut frame)?;

            for channel in 0..channels {
                let at = channel * bytes_per_sample;
                let amplitude = if bytes_per_sample == 2 {
                    f32::from(i16::from_le_bytes([frame[at], frame[at + 1]])).abs() / 32768.0
                } else {
                    (f32::from(frame[at]) - 128.0).abs() / 128.0
                };
                peak = peak.max(amplitude);
            }

            if (index + 1) % frames_per_bucket == 0 || index + 1 == frames {
                samples.push(peak.min(1.0));
                peak = 0.0;
            }
        }

        Ok(AudioWaveform { samples })
    }
}
