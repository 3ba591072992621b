//! Raw per-device recording format
//!
//! A raw recording is a 24 byte header followed by tightly packed BGR24
//! frames. Conversion and processing jobs replay these files at full speed.
//!
//! ```text
//! 0..8    magic  "DUORAW01"
//! 8..12   width  (u32 LE)
//! 12..16  height (u32 LE)
//! 16..20  fps    (u32 LE)
//! 20..24  reserved
//! 24..    width * height * 3 bytes per frame
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"DUORAW01";
const HEADER_LEN: u64 = 24;

/// Raw recording errors
#[derive(Error, Debug)]
pub enum RawError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a raw recording (bad magic)")]
    BadMagic,

    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("Frame size mismatch: got {got} bytes, expected {expected}")]
    FrameSize { got: usize, expected: usize },
}

/// Geometry and rate of a video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamFormat {
    /// Bytes per BGR24 frame
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn validate(&self) -> Result<(), RawError> {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(RawError::InvalidFormat(format!(
                "{}x{} @ {}fps",
                self.width, self.height, self.fps
            )));
        }
        Ok(())
    }
}

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Zero-based position in the recording
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// BGR24 pixel data
    pub data: Vec<u8>,
}

/// Anything that can replay frames in order
pub trait FrameSource: Send {
    /// Stream geometry
    fn format(&self) -> StreamFormat;

    /// Number of complete frames the source holds
    fn frame_count(&self) -> u64;

    /// Next frame, `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<Frame>, RawError>;
}

/// Appends frames to a raw recording
pub struct RawWriter {
    writer: BufWriter<File>,
    format: StreamFormat,
    frames: u64,
}

impl RawWriter {
    /// Create (or truncate) a raw recording at `path`
    pub fn create(path: &Path, format: StreamFormat) -> Result<Self, RawError> {
        format.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::with_capacity(format.frame_size() * 2, File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&format.width.to_le_bytes())?;
        writer.write_all(&format.height.to_le_bytes())?;
        writer.write_all(&format.fps.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;

        Ok(Self {
            writer,
            format,
            frames: 0,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Append one BGR24 frame
    pub fn write_frame(&mut self, data: &[u8]) -> Result<(), RawError> {
        let expected = self.format.frame_size();
        if data.len() != expected {
            return Err(RawError::FrameSize {
                got: data.len(),
                expected,
            });
        }
        self.writer.write_all(data)?;
        self.frames += 1;
        Ok(())
    }

    /// Frames written so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Flush everything to disk and return the frame count
    pub fn finish(mut self) -> Result<u64, RawError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.frames)
    }
}

/// Reads frames back from a raw recording
pub struct RawReader {
    reader: BufReader<File>,
    format: StreamFormat,
    total_frames: u64,
    next_index: u64,
}

impl RawReader {
    /// Open a raw recording for sequential replay
    pub fn open(path: &Path) -> Result<Self, RawError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let format = read_header(&mut file)?;

        let total_frames = len.saturating_sub(HEADER_LEN) / format.frame_size() as u64;

        tracing::debug!(
            "Opened raw recording {:?}: {}x{} @ {}fps, {} frames",
            path,
            format.width,
            format.height,
            format.fps,
            total_frames
        );

        Ok(Self {
            reader: BufReader::with_capacity(format.frame_size() * 2, file),
            format,
            total_frames,
            next_index: 0,
        })
    }
}

impl FrameSource for RawReader {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn frame_count(&self) -> u64 {
        self.total_frames
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, RawError> {
        // A trailing partial frame (crash mid-write) is not part of the stream
        if self.next_index >= self.total_frames {
            return Ok(None);
        }

        let mut data = vec![0u8; self.format.frame_size()];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {
                let frame = Frame {
                    index: self.next_index,
                    width: self.format.width,
                    height: self.format.height,
                    data,
                };
                self.next_index += 1;
                Ok(Some(frame))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Count the complete frames in a raw recording without decoding them
pub fn count_frames(path: &Path) -> Result<u64, RawError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let format = read_header(&mut file)?;
    Ok(len.saturating_sub(HEADER_LEN) / format.frame_size() as u64)
}

fn read_header<R: Read>(reader: &mut R) -> Result<StreamFormat, RawError> {
    let mut header = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RawError::BadMagic
        } else {
            RawError::Io(e)
        }
    })?;

    if &header[0..8] != MAGIC {
        return Err(RawError::BadMagic);
    }

    let field = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let format = StreamFormat {
        width: field(8),
        height: field(12),
        fps: field(16),
    };
    format.validate()?;
    Ok(format)
}
