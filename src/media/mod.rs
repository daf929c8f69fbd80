//! Secure Attachments - Media Inspection
//!
//! Container parsing, asset probing, waveforms and blur placeholders.

pub mod asset;
pub mod blurhash;
pub mod mp4;
pub mod wav;
pub mod waveform;

pub use asset::{
    AssetError, AssetInfo, AssetInput, FfmpegAssetReader, MediaAssetReader, MediaStream,
};
pub use waveform::{AudioWaveform, PcmWaveformService, WaveformError, WaveformService};
