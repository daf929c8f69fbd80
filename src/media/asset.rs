//! Seekable media assets: probing duration and geometry, extracting still
//! frames. The default reader shells out to ffprobe / ffmpeg.

use std::io::{self, Read, Seek};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;

use image::DynamicImage;
use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::content_type::PixelSize;

/// ffprobe / ffmpeg stderr fragments that mean the input itself is bad
const SOFT_FAILURE_MARKERS: &[&str] = &[
    "Invalid data found when processing input",
    "moov atom not found",
    "could not find codec parameters",
    "Invalid argument",
    "End of file",
];

/// Failures reading a media asset
#[derive(Error, Debug)]
pub enum AssetError {
    /// The asset cannot be read as media
    #[error("Asset is unreadable: {0}")]
    Unreadable(String),

    /// The decoder rejected the file as malformed
    #[error("Invalid media file: {0}")]
    InvalidMediaFile(String),

    #[error("Media tool failed: {0}")]
    ToolFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssetError {
    /// Soft failures classify the payload as invalid instead of failing the call
    pub fn is_soft(&self) -> bool {
        matches!(self, AssetError::Unreadable(_) | AssetError::InvalidMediaFile(_))
    }
}

/// What a probe learns about an asset
#[derive(Debug, Clone, PartialEq)]
pub struct AssetInfo {
    /// Seconds
    pub duration: f64,
    /// Native size of the first video track
    pub natural_size: Option<PixelSize>,
    pub has_video: bool,
    pub has_audio: bool,
}

impl AssetInfo {
    /// Minimal checks for a playable video
    pub fn is_playable_video(&self) -> bool {
        self.has_video
            && self.duration.is_finite()
            && self.duration > 0.0
            && self.natural_size.map_or(false, |size| !size.is_empty())
    }
}

/// Seekable plaintext media
pub trait MediaStream: Read + Seek {}

impl<T: Read + Seek + ?Sized> MediaStream for T {}

/// Where a media tool reads an asset from
pub enum AssetInput<'a> {
    /// Plaintext already on disk
    File(&'a Path),
    /// Plaintext produced on demand, never written to disk
    Stream(Box<dyn Read + Send + 'a>),
}

/// Loads media assets
pub trait MediaAssetReader: Send + Sync {
    /// Read duration and track layout
    fn probe(&self, input: AssetInput<'_>) -> Result<AssetInfo, AssetError>;

    /// Decode one representative frame, no larger than `max_dimension` on
    /// its longest side
    fn still_frame(
        &self,
        input: AssetInput<'_>,
        max_dimension: u32,
    ) -> Result<DynamicImage, AssetError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

/// ffprobe / ffmpeg backed asset reader
#[derive(Debug, Clone)]
pub struct FfmpegAssetReader {
    ffprobe_path: String,
    ffmpeg_path: String,
}

impl FfmpegAssetReader {
    pub fn new(ffprobe_path: impl Into<String>, ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn check_status(tool: &str, output: &Output) -> Result<(), AssetError> {
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if SOFT_FAILURE_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            debug!("{} rejected input: {}", tool, stderr);
            return Err(AssetError::InvalidMediaFile(stderr));
        }

        warn!("{} failed: {}", tool, stderr);
        Err(AssetError::ToolFailed(format!("{}: {}", tool, stderr)))
    }

    /// Run a tool on `input`. Streams are fed to stdin from a scoped thread
    /// while the tool runs.
    fn run(
        program: &str,
        leading: &[&str],
        input: AssetInput<'_>,
        trailing: &[&str],
    ) -> Result<Output, AssetError> {
        let mut command = Command::new(program);
        command.args(leading);

        let mut reader = match input {
            AssetInput::File(path) => return Ok(command.arg(path).args(trailing).output()?),
            AssetInput::Stream(reader) => reader,
        };

        let mut child = command
            .arg("pipe:0")
            .args(trailing)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AssetError::ToolFailed(format!("{}: no stdin", program)))?;

        thread::scope(|scope| -> Result<Output, AssetError> {
            let feeder = scope.spawn(move || io::copy(&mut reader, &mut stdin).map(|_| ()));
            let output = child.wait_with_output()?;

            match feeder.join() {
                Ok(Ok(())) => {}
                // The tool may stop reading once it has seen enough
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(AssetError::Io(e)),
                Err(_) => {
                    let reason = format!("{}: stdin feeder panicked", program);
                    return Err(AssetError::ToolFailed(reason));
                }
            }
            Ok(output)
        })
    }
}

impl Default for FfmpegAssetReader {
    fn default() -> Self {
        Self::new("ffprobe", "ffmpeg")
    }
}

impl MediaAssetReader for FfmpegAssetReader {
    fn probe(&self, input: AssetInput<'_>) -> Result<AssetInfo, AssetError> {
        let output = Self::run(
            &self.ffprobe_path,
            &["-v", "error", "-show_format", "-show_streams", "-of", "json"],
            input,
            &[],
        )?;
        Self::check_status("ffprobe", &output)?;

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| AssetError::Unreadable(format!("unparseable ffprobe output: {}", e)))?;

        let streams = parsed.streams.unwrap_or_default();
        let video = streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"));
        let has_audio = streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio"));

        let duration = parsed
            .format
            .and_then(|f| f.duration)
            .or_else(|| streams.iter().find_map(|s| s.duration.clone()))
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| AssetError::Unreadable("asset has no timeline".into()))?;

        let natural_size = video.and_then(|s| match (s.width, s.height) {
            (Some(width), Some(height)) => Some(PixelSize::new(width, height)),
            _ => None,
        });

        Ok(AssetInfo {
            duration,
            natural_size,
            has_video: video.is_some(),
            has_audio,
        })
    }

    fn still_frame(
        &self,
        input: AssetInput<'_>,
        max_dimension: u32,
    ) -> Result<DynamicImage, AssetError> {
        let scale = format!(
            "scale=w='min({max},iw)':h='min({max},ih)':force_original_aspect_ratio=decrease",
            max = max_dimension
        );

        let output = Self::run(
            &self.ffmpeg_path,
            &["-v", "error", "-i"],
            input,
            &["-frames:v", "1", "-vf", &scale, "-f", "image2pipe", "-vcodec", "png", "-"],
        )?;
        Self::check_status("ffmpeg", &output)?;

        if output.stdout.is_empty() {
            return Err(AssetError::Unreadable("no frame decoded".into()));
        }

        image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png)
            .map_err(|e| AssetError::Unreadable(format!("undecodable frame: {}", e)))
    }
}
