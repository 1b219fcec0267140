//! On-screen text extraction: frame sampling, tesseract TSV parsing, and
//! cross-media deduplication.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::{FRAME_INTERVAL_SECS, MIN_OCR_CONFIDENCE, MIN_TEXT_LENGTH};

/// One recognized text line with its confidence in [0, 1].
#[derive(Debug, Clone)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f64,
}

impl OcrLine {
    #[must_use]
    pub fn new(text: &str, confidence: f64) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

/// Frames sampled from a video. Dropping this removes the frame files.
#[derive(Debug)]
pub struct SampledFrames {
    _dir: TempDir,
    pub frames: Vec<PathBuf>,
}

/// Sample one frame every [`FRAME_INTERVAL_SECS`] from a video.
///
/// Failures come back as an empty sample, not an error: a video OCR pass is
/// best-effort per media item.
pub async fn extract_frames(config: &Config, video: &Path) -> Option<SampledFrames> {
    let dir = match TempDir::new() {
        Ok(dir) => dir,
        Err(e) => {
            warn!(error = %e, "Failed to create frame temp dir");
            return None;
        }
    };

    let pattern = dir.path().join("frame_%04d.jpg");
    let mut cmd = Command::new(&config.ffmpeg_path);
    cmd.arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-vf")
        .arg(format!("fps=1/{FRAME_INTERVAL_SECS}"))
        .arg(&pattern)
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
                "ffmpeg frame sampling failed"
            );
            return None;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to spawn ffmpeg for frames");
            return None;
        }
        Err(_) => {
            warn!(video = %video.display(), "ffmpeg frame sampling timed out");
            return None;
        }
    }

    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
                .collect()
        })
        .unwrap_or_default();
    frames.sort();

    Some(SampledFrames { _dir: dir, frames })
}

/// Run the system OCR engine on one image.
///
/// Uses tesseract's TSV output, which carries per-word confidence; words are
/// grouped back into lines and the confidences averaged. Failures come back
/// as an empty list with a warning.
pub async fn ocr_image(config: &Config, image: &Path) -> Vec<OcrLine> {
    let output = Command::new(&config.tesseract_path)
        .arg(image)
        .arg("stdout")
        .arg("tsv")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!(
                image = %image.display(),
                status = %output.status,
                "OCR failed"
            );
            return Vec::new();
        }
        Err(e) => {
            warn!(image = %image.display(), error = %e, "Failed to spawn OCR");
            return Vec::new();
        }
    };

    parse_tsv(&String::from_utf8_lossy(&output.stdout))
}

/// Parse tesseract TSV into per-line text and averaged confidence.
fn parse_tsv(tsv: &str) -> Vec<OcrLine> {
    // (block, par, line) -> (words, confidence sum)
    let mut current_key: Option<(u32, u32, u32)> = None;
    let mut words: Vec<String> = Vec::new();
    let mut conf_sum = 0.0f64;
    let mut lines = Vec::new();

    let mut flush = |words: &mut Vec<String>, conf_sum: &mut f64| {
        if !words.is_empty() {
            let confidence = *conf_sum / words.len() as f64 / 100.0;
            lines.push(OcrLine {
                text: words.join(" "),
                confidence,
            });
            words.clear();
            *conf_sum = 0.0;
        }
    };

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        // Word rows are level 5; structural rows carry conf -1.
        if cols[0] != "5" {
            continue;
        }
        let Ok(conf) = cols[10].parse::<f64>() else {
            continue;
        };
        if conf < 0.0 {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }

        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        if current_key != Some(key) {
            flush(&mut words, &mut conf_sum);
            current_key = Some(key);
        }
        words.push(text.to_string());
        conf_sum += conf;
    }
    flush(&mut words, &mut conf_sum);

    lines
}

/// Filter and deduplicate OCR results across a whole post.
///
/// Video frames repeat the same overlay text across many samples; this keeps
/// one surface form per case-insensitive, whitespace-trimmed text, preferring
/// the highest-confidence occurrence, and returns the survivors sorted by
/// confidence descending.
#[must_use]
pub fn deduplicate_texts(raw: &[OcrLine]) -> Vec<String> {
    use std::collections::HashMap;

    // normalized -> (surface form, confidence)
    let mut seen: HashMap<String, (String, f64)> = HashMap::new();

    for line in raw {
        let trimmed = line.text.trim();
        if line.confidence < MIN_OCR_CONFIDENCE || trimmed.chars().count() < MIN_TEXT_LENGTH {
            continue;
        }
        let normalized = trimmed.to_lowercase();
        match seen.get(&normalized) {
            Some((_, best)) if *best >= line.confidence => {}
            _ => {
                seen.insert(normalized, (trimmed.to_string(), line.confidence));
            }
        }
    }

    let mut survivors: Vec<(String, f64)> = seen.into_values().collect();
    survivors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    survivors.into_iter().map(|(text, _)| text).collect()
}
