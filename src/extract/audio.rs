//! Audio transcription plumbing: ffmpeg audio extraction and the Whisper CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;

/// Minimum WAV size to count as real audio; anything smaller is a silent or
/// broken extraction.
const MIN_WAV_BYTES: u64 = 1000;

/// Whisper invocation resolved once per run.
///
/// The binary is any whisper.cpp-compatible CLI; the model path is optional
/// because some wrappers bundle a default model.
#[derive(Debug, Clone)]
pub struct WhisperEngine {
    bin: String,
    model: Option<PathBuf>,
}

impl WhisperEngine {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            bin: config.whisper_path.clone(),
            model: config.whisper_model.clone(),
        }
    }

    /// Transcribe a 16 kHz mono WAV file.
    ///
    /// # Errors
    ///
    /// Fails if the CLI cannot be spawned or exits non-zero.
    pub async fn transcribe(&self, wav: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.bin);
        if let Some(model) = &self.model {
            cmd.arg("-m").arg(model);
        }
        cmd.arg("-f")
            .arg(wav)
            .arg("--no-timestamps")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} failed: {}", self.bin, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Extract a video's audio track to a temp 16 kHz mono 16-bit PCM WAV.
///
/// Returns `None` when the video has no usable audio (ffmpeg failure,
/// timeout, or an output too small to be real). The temp file is cleaned up
/// by drop on every path.
pub async fn extract_audio(config: &Config, video: &Path) -> Option<NamedTempFile> {
    let wav = match tempfile::Builder::new().suffix(".wav").tempfile() {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "Failed to create temp WAV file");
            return None;
        }
    };

    let mut cmd = Command::new(&config.ffmpeg_path);
    cmd.arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-vn")
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg("-ar")
        .arg("16000")
        .arg("-ac")
        .arg("1")
        .arg(wav.path())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let result = tokio::time::timeout(
        Duration::from_secs(config.ffmpeg_timeout_secs),
        cmd.output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {}
        Ok(Ok(output)) => {
            debug!(
                video = %video.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ffmpeg audio extraction failed"
            );
            return None;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to spawn ffmpeg");
            return None;
        }
        Err(_) => {
            warn!(video = %video.display(), "ffmpeg audio extraction timed out");
            return None;
        }
    }

    match std::fs::metadata(wav.path()) {
        Ok(meta) if meta.len() >= MIN_WAV_BYTES => Some(wav),
        _ => {
            debug!(video = %video.display(), "Extracted audio too small, treating as none");
            None
        }
    }
}

/// Video duration in seconds via ffprobe; `None` when unreadable.
pub async fn video_duration(config: &Config, video: &Path) -> Option<f64> {
    let output = Command::new(&config.ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(video)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}
