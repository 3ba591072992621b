//! Encoder capability and the FFmpeg-backed implementation
//!
//! The conversion job replays raw BGR24 frames into an [`EncodeSession`]
//! and asks it, once finished, how many frames actually landed in the
//! output. [`FfmpegEncoder`] pipes frames into an `ffmpeg` subprocess and
//! counts the result with `ffprobe`.

use crate::capture::{RawError, StreamFormat};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use thiserror::Error;

/// Encoding errors
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Frame validation failed: {output} of {input} frames (need {required})")]
    Validation { output: u64, input: u64, required: u64 },

    #[error("Raw recording error: {0}")]
    Raw(#[from] RawError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding cancelled")]
    Cancelled,
}

/// An open encode into one output file
pub trait EncodeSession: Send {
    /// Append one BGR24 frame
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), EncodeError>;

    /// Flush and close, returning the number of frames in the output
    fn finish(self: Box<Self>) -> Result<u64, EncodeError>;

    /// Stop immediately; the output is left for the caller to delete
    fn abort(self: Box<Self>);
}

/// Something that can turn raw frames into a playback file
pub trait Encoder: Send + Sync {
    /// Name recorded in sidecars, e.g. `libx264`
    fn name(&self) -> &str;

    fn begin(&self, output: &Path, format: StreamFormat) -> Result<Box<dyn EncodeSession>, EncodeError>;
}

/// Minimum share of input frames an output must contain
///
/// Kept in basis points so the comparison is exact integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    min_ratio_bp: u32,
}

impl ValidationPolicy {
    pub fn from_ratio(ratio: f64) -> Self {
        let clamped = ratio.clamp(0.0, 1.0);
        Self {
            min_ratio_bp: (clamped * 10_000.0).round() as u32,
        }
    }

    /// Smallest passing output frame count
    pub fn required(&self, input_frames: u64) -> u64 {
        let scaled = input_frames as u128 * self.min_ratio_bp as u128;
        scaled.div_ceil(10_000) as u64
    }

    /// An empty input has nothing to lose, so any output passes
    pub fn passes(&self, output_frames: u64, input_frames: u64) -> bool {
        input_frames == 0 || output_frames >= self.required(input_frames)
    }

    pub fn check(&self, output_frames: u64, input_frames: u64) -> Result<(), EncodeError> {
        if self.passes(output_frames, input_frames) {
            Ok(())
        } else {
            Err(EncodeError::Validation {
                output: output_frames,
                input: input_frames,
                required: self.required(input_frames),
            })
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::from_ratio(0.95)
    }
}

/// FFmpeg encoder for one video codec
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    codec: String,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(codec: impl Into<String>, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            codec: codec.into(),
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Codec options for the known encoders
    fn codec_args(&self) -> Vec<String> {
        let tuning: &[&str] = match self.codec.as_str() {
            "h264_nvenc" => &["-preset", "p4", "-cq", "23"],
            "libx264" => &["-preset", "fast", "-crf", "23"],
            _ => &[],
        };
        let mut args = vec!["-c:v".to_string(), self.codec.clone()];
        args.extend(tuning.iter().map(|s| s.to_string()));
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
        args
    }
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.codec
    }

    fn begin(&self, output: &Path, format: StreamFormat) -> Result<Box<dyn EncodeSession>, EncodeError> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "bgr24".to_string(),
            "-s".to_string(),
            format!("{}x{}", format.width, format.height),
            "-r".to_string(),
            format.fps.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ];
        args.extend(self.codec_args());
        args.extend([
            "-movflags".to_string(),
            "+faststart".to_string(),
            // The temp name has no recognisable extension
            "-f".to_string(),
            "mp4".to_string(),
            output.to_string_lossy().to_string(),
        ]);

        tracing::info!("Starting FFmpeg encoder ({}): {:?}", self.codec, args);

        let mut process = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncodeError::Ffmpeg(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| EncodeError::Ffmpeg("Failed to capture FFmpeg stdin".to_string()))?;

        Ok(Box::new(FfmpegSession {
            process,
            stdin: Some(BufWriter::with_capacity(format.frame_size() * 2, stdin)),
            output: output.to_path_buf(),
            ffprobe: self.ffprobe.clone(),
            frames_in: 0,
        }))
    }
}

struct FfmpegSession {
    process: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    output: PathBuf,
    ffprobe: PathBuf,
    frames_in: u64,
}

impl FfmpegSession {
    fn stderr_tail(&mut self) -> String {
        let mut stderr = String::new();
        if let Some(mut pipe) = self.process.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let start = stderr.len().saturating_sub(500);
        let start = (start..stderr.len())
            .find(|i| stderr.is_char_boundary(*i))
            .unwrap_or(stderr.len());
        stderr[start..].to_string()
    }
}

impl EncodeSession for FfmpegSession {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), EncodeError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncodeError::Ffmpeg("Encoder already closed".to_string()))?;
        stdin
            .write_all(frame)
            .map_err(|e| EncodeError::Ffmpeg(format!("Failed to write frame: {}", e)))?;
        self.frames_in += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64, EncodeError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }

        let stderr = self.stderr_tail();
        let status = self
            .process
            .wait()
            .map_err(|e| EncodeError::Ffmpeg(format!("Failed to wait for FFmpeg: {}", e)))?;
        if !status.success() {
            return Err(EncodeError::Ffmpeg(format!("FFmpeg exited with {}: {}", status, stderr)));
        }

        let frames = count_output_frames(&self.ffprobe, &self.output)?;
        tracing::info!(
            "FFmpeg finished {:?}: {} frames in, {} frames out",
            self.output,
            self.frames_in,
            frames
        );
        Ok(frames)
    }

    fn abort(mut self: Box<Self>) {
        self.stdin = None;
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// Count video packets of an output file with ffprobe
pub fn count_output_frames(ffprobe: &Path, path: &Path) -> Result<u64, EncodeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map_err(|e| EncodeError::Ffmpeg(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncodeError::Ffmpeg(format!("ffprobe failed: {}", stderr)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .trim()
        .trim_end_matches(',')
        .parse()
        .map_err(|_| EncodeError::Ffmpeg(format!("Unexpected ffprobe output: {}", stdout)))
}
