//! Pose analyzer backed by a helper process
//!
//! One helper is started per device share and kept alive for the whole
//! replay. Requests and replies are JSON lines on stdin/stdout:
//!
//! ```text
//! -> {"frame":0,"width":640,"height":480,"length":921600}\n<921600 BGR24 bytes>
//! <- {"keypoints":{"nose":{"x":..,"y":..},...}}\n   or {"keypoints":null}\n
//! <- {"error":"..."}\n
//! ```

use super::analysis::{AnalysisError, Keypoints, PoseAnalyzer, PoseSession};
use crate::capture::Frame;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

#[derive(Serialize)]
struct FrameRequest {
    frame: u64,
    width: u32,
    height: u32,
    length: usize,
}

#[derive(Deserialize)]
struct FrameReply {
    #[serde(default)]
    keypoints: Option<Keypoints>,
    #[serde(default)]
    error: Option<String>,
}

/// Analyzer that delegates pose estimation to an external program
#[derive(Debug, Clone)]
pub struct SubprocessAnalyzer {
    name: String,
    command: PathBuf,
    args: Vec<String>,
}

impl SubprocessAnalyzer {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let command = command.into();
        let name = command
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "subprocess".to_string());
        Self { name, command, args }
    }

    /// Engine name recorded in reports
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn spawn(&self) -> anyhow::Result<HelperSession> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start analyzer {:?}", self.command))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("analyzer stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("analyzer stdout unavailable"))?;

        tracing::info!("Started analyzer {:?} (pid {})", self.command, child.id());
        Ok(HelperSession {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }
}

impl PoseAnalyzer for SubprocessAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<Box<dyn PoseSession>, AnalysisError> {
        self.spawn()
            .map(|session| Box::new(session) as Box<dyn PoseSession>)
            .map_err(|e| AnalysisError::Analyzer(format!("{e:#}")))
    }
}

struct HelperSession {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl HelperSession {
    fn exchange(&mut self, frame: &Frame) -> anyhow::Result<Option<Keypoints>> {
        let request = FrameRequest {
            frame: frame.index,
            width: frame.width,
            height: frame.height,
            length: frame.data.len(),
        };
        serde_json::to_writer(&mut self.stdin, &request)?;
        self.stdin.write_all(b"\n")?;
        self.stdin.write_all(&frame.data)?;
        self.stdin.flush().context("analyzer closed its input")?;

        self.line.clear();
        let read = self.stdout.read_line(&mut self.line)?;
        if read == 0 {
            bail!("analyzer exited before answering frame {}", frame.index);
        }

        let reply: FrameReply = serde_json::from_str(self.line.trim_end())
            .with_context(|| format!("malformed analyzer reply for frame {}", frame.index))?;
        if let Some(error) = reply.error {
            bail!("frame {}: {}", frame.index, error);
        }
        Ok(reply.keypoints)
    }
}

impl PoseSession for HelperSession {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Keypoints>, AnalysisError> {
        self.exchange(frame)
            .map_err(|e| AnalysisError::Analyzer(format!("{e:#}")))
    }
}

impl Drop for HelperSession {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
