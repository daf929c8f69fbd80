//! RIFF/WAVE header parsing.

use std::io::{self, Read, Seek, SeekFrom};

use thiserror::Error;

/// WAVE format tag for integer PCM
pub const FORMAT_PCM: u16 = 1;

/// WAVE format tag for extensible formats
pub const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("Not a RIFF/WAVE file")]
    NotWav,

    #[error("Malformed WAVE file: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed `fmt ` and `data` chunk summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavInfo {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Absolute offset of the first sample byte
    pub data_offset: u64,
    /// Sample bytes actually present
    pub data_length: u64,
}

impl WavInfo {
    /// Seconds of audio
    pub fn duration(&self) -> f64 {
        self.data_length as f64 / self.byte_rate as f64
    }

    /// Number of sample frames
    pub fn frame_count(&self) -> u64 {
        self.data_length / u64::from(self.block_align.max(1))
    }

    pub fn is_integer_pcm(&self) -> bool {
        self.format_tag == FORMAT_PCM || self.format_tag == FORMAT_EXTENSIBLE
    }

    /// Bytes one sample of one channel occupies
    pub fn bytes_per_sample(&self) -> u16 {
        self.bits_per_sample.div_ceil(8)
    }
}

/// Cheap magic check on the first 12 bytes
pub fn is_wav(header: &[u8]) -> bool {
    header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE"
}

fn truncated(e: io::Error) -> WavError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WavError::Malformed("truncated chunk".into())
    } else {
        WavError::Io(e)
    }
}

/// Walk the RIFF chunks until both `fmt ` and `data` are found
pub fn parse<R: Read + Seek>(mut reader: R) -> Result<WavInfo, WavError> {
    let file_length = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 12];
    reader.read_exact(&mut header).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WavError::NotWav
        } else {
            WavError::Io(e)
        }
    })?;
    if !is_wav(&header) {
        return Err(WavError::NotWav);
    }

    let mut format: Option<(u16, u16, u32, u32, u16, u16)> = None;

    loop {
        let mut chunk_header = [0u8; 8];
        reader.read_exact(&mut chunk_header).map_err(truncated)?;
        let chunk_id = &chunk_header[0..4];
        let chunk_size = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as u64;

        match chunk_id {
            b"fmt " => {
                if chunk_size < 16 {
                    return Err(WavError::Malformed(format!(
                        "fmt chunk of {} bytes",
                        chunk_size
                    )));
                }
                let position = reader.stream_position()?;
                if position + chunk_size > file_length {
                    return Err(WavError::Malformed("fmt chunk extends past end of file".into()));
                }
                let mut fmt = vec![0u8; chunk_size as usize];
                reader.read_exact(&mut fmt).map_err(truncated)?;
                format = Some((
                    u16::from_le_bytes([fmt[0], fmt[1]]),
                    u16::from_le_bytes([fmt[2], fmt[3]]),
                    u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]),
                    u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]),
                    u16::from_le_bytes([fmt[12], fmt[13]]),
                    u16::from_le_bytes([fmt[14], fmt[15]]),
                ));
                if chunk_size % 2 == 1 {
                    reader.seek(SeekFrom::Current(1))?;
                }
            }
            b"data" => {
                let (format_tag, channels, sample_rate, byte_rate, block_align, bits_per_sample) =
                    format.ok_or_else(|| {
                        WavError::Malformed("data chunk before fmt chunk".into())
                    })?;

                if channels == 0 || sample_rate == 0 || byte_rate == 0 || block_align == 0 {
                    return Err(WavError::Malformed("zero-valued format field".into()));
                }
                let frame_bytes = u32::from(channels) * u32::from(bits_per_sample.div_ceil(8));
                if u32::from(block_align) < frame_bytes {
                    return Err(WavError::Malformed(format!(
                        "block align {} is smaller than a {}-channel {}-bit frame",
                        block_align, channels, bits_per_sample
                    )));
                }

                let data_offset = reader.stream_position()?;
                // Streamed WAVs declare 0 or u32::MAX here
                let available = file_length.saturating_sub(data_offset);
                let data_length = if chunk_size == 0 {
                    available
                } else {
                    chunk_size.min(available)
                };

                return Ok(WavInfo {
                    format_tag,
                    channels,
                    sample_rate,
                    byte_rate,
                    block_align,
                    bits_per_sample,
                    data_offset,
                    data_length,
                });
            }
            _ => {
                let skip = chunk_size + chunk_size % 2;
                let position = reader.stream_position()?;
                if position + skip > file_length {
                    return Err(WavError::Malformed("chunk extends past end of file".into()));
                }
                reader.seek(SeekFrom::Current(skip as i64))?;
            }
        }
    }
}

/// Build a 16-bit PCM WAV in memory
#[cfg(test)]
pub(crate) fn pcm_wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    pcm_wav_with_block_align(sample_rate, channels, channels * 2, samples)
}

/// Build a 16-bit PCM WAV whose header declares `block_align`
#[cfg(test)]
pub(crate) fn pcm_wav_with_block_align(
    sample_rate: u32,
    channels: u16,
    block_align: u16,
    samples: &[i16],
) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
