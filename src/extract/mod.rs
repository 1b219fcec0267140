//! Text extraction from downloaded media.
//!
//! Transcribes video audio through the Whisper CLI and mines on-screen text
//! from video frames and still images with the system OCR engine. Each
//! processed record gets an `extracted_text` field; records that already
//! carry one are skipped, which is the whole resumability story: killing the
//! process costs at most the unpatched tail of the current batch.

pub mod audio;
pub mod ocr;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{in_collection, media_entries, now_iso, ExtractedText, MediaItem};
use crate::store::{JsonMap, JsonStore};
use audio::WhisperEngine;
use ocr::OcrLine;

/// Knobs for one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Substring filter on collection names.
    pub collection: Option<String>,
    pub limit: Option<usize>,
    /// Patch the archive every N posts.
    pub save_every: usize,
    pub skip_whisper: bool,
    pub skip_ocr: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            collection: None,
            limit: None,
            save_every: 10,
            skip_whisper: false,
            skip_ocr: false,
        }
    }
}

pub struct Extractor {
    config: Config,
    store: JsonStore,
}

impl Extractor {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = JsonStore::with_default_key(config.saved_posts_path());
        Self { config, store }
    }

    /// Run extraction over every candidate record.
    ///
    /// # Errors
    ///
    /// Fails on store errors. Subprocess failures are per-media warnings and
    /// never stop the run.
    pub async fn run(&self, opts: &ExtractOptions) -> Result<()> {
        let candidates = self
            .candidates(opts.collection.as_deref(), opts.limit)
            .await?;
        if candidates.is_empty() {
            info!("No posts need text extraction");
            return Ok(());
        }

        let n_videos = count_local_media(&candidates, "video");
        let n_images = count_local_media(&candidates, "image");
        info!(
            posts = candidates.len(),
            videos = n_videos,
            images = n_images,
            collection = opts.collection.as_deref().unwrap_or(""),
            "Starting extraction"
        );

        let whisper = if !opts.skip_whisper && n_videos > 0 {
            Some(WhisperEngine::new(&self.config))
        } else {
            if opts.skip_whisper {
                info!("Skipping audio transcription");
            }
            None
        };
        if opts.skip_ocr {
            info!("Skipping OCR");
        }

        let mut patches: BTreeMap<String, JsonMap> = BTreeMap::new();
        let mut processed = 0usize;
        let mut videos_transcribed = 0usize;
        let mut images_ocrd = 0usize;
        let mut total_audio_secs = 0.0f64;

        for (ci, candidate) in candidates.iter().enumerate() {
            let Some(post_id) = candidate.get("id").and_then(Value::as_str) else {
                continue;
            };

            let mut extraction = ExtractedText {
                audio_transcripts: Vec::new(),
                ocr_texts: Vec::new(),
                extracted_at: now_iso(),
                extraction_status: "complete".to_string(),
            };
            let mut post_ocr: Vec<OcrLine> = Vec::new();
            let mut had_video = false;

            for media in media_entries(candidate) {
                let Some(local) = existing_local_path(&media) else {
                    continue;
                };

                if media.media_type == "video" {
                    had_video = true;
                    let (transcript, duration, ocr) = self
                        .process_video(&local, whisper.as_ref(), opts.skip_ocr)
                        .await;
                    if let Some(text) = transcript {
                        extraction.audio_transcripts.push(text);
                        videos_transcribed += 1;
                        total_audio_secs += duration.unwrap_or(0.0);
                    }
                    post_ocr.extend(ocr);
                } else if media.media_type == "image" && !opts.skip_ocr {
                    post_ocr.extend(ocr::ocr_image(&self.config, &local).await);
                    images_ocrd += 1;
                }
            }

            extraction.ocr_texts = ocr::deduplicate_texts(&post_ocr);

            if opts.skip_whisper && had_video {
                extraction.extraction_status = "partial:no_audio".to_string();
            }
            if opts.skip_ocr {
                extraction.extraction_status = "partial:no_ocr".to_string();
            }

            let mut patch = JsonMap::new();
            patch.insert(
                "extracted_text".to_string(),
                serde_json::to_value(&extraction).unwrap_or(Value::Null),
            );
            patches.insert(post_id.to_string(), patch);
            processed += 1;

            if processed % opts.save_every == 0 || ci == candidates.len() - 1 {
                self.patch_records(std::mem::take(&mut patches)).await?;
                info!(
                    processed = ci + 1,
                    total = candidates.len(),
                    transcribed = videos_transcribed,
                    ocr_images = images_ocrd,
                    "Saved batch"
                );
            }
        }

        info!(
            posts = processed,
            transcribed = videos_transcribed,
            audio_secs = total_audio_secs as u64,
            ocr_images = images_ocrd,
            "Extraction finished"
        );
        Ok(())
    }

    /// Process one video: transcribe audio, OCR sampled frames.
    ///
    /// Returns `(transcript, duration_secs, ocr_lines)`. Every phase is
    /// best-effort; a failed phase contributes nothing.
    async fn process_video(
        &self,
        video: &Path,
        whisper: Option<&WhisperEngine>,
        skip_ocr: bool,
    ) -> (Option<String>, Option<f64>, Vec<OcrLine>) {
        let duration = audio::video_duration(&self.config, video).await;

        let mut transcript = None;
        if let Some(engine) = whisper {
            // NamedTempFile cleans the WAV up on drop, failure paths included.
            if let Some(wav) = audio::extract_audio(&self.config, video).await {
                match engine.transcribe(wav.path()).await {
                    Ok(text) if !text.is_empty() => transcript = Some(text),
                    Ok(_) => debug!(video = %video.display(), "Empty transcription"),
                    Err(e) => warn!(video = %video.display(), error = %e, "Whisper failed"),
                }
            }
        }

        let mut ocr_lines = Vec::new();
        if !skip_ocr {
            if let Some(sample) = ocr::extract_frames(&self.config, video).await {
                for frame in &sample.frames {
                    ocr_lines.extend(ocr::ocr_image(&self.config, frame).await);
                }
            }
        }

        (transcript, duration, ocr_lines)
    }

    /// Records with local media but no extraction yet, in file order.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn candidates(
        &self,
        collection: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<JsonMap>> {
        let records = self.read_records().await?;
        let mut candidates = Vec::new();

        for record in records {
            if record.get("extracted_text").is_some_and(|v| !v.is_null()) {
                continue;
            }
            let has_local = media_entries(&record)
                .iter()
                .any(|m| existing_local_path(m).is_some());
            if !has_local {
                continue;
            }
            if let Some(filter) = collection {
                if !in_collection(&record, filter) {
                    continue;
                }
            }
            candidates.push(record);
            if limit.is_some_and(|n| candidates.len() >= n) {
                break;
            }
        }
        Ok(candidates)
    }

    /// Extraction status report.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn stats(&self) -> Result<String> {
        let records = self.read_records().await?;

        let extraction_of = |record: &JsonMap| -> Option<ExtractedText> {
            record
                .get("extracted_text")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
        };

        let total = records.len();
        let with_extraction = records.iter().filter(|r| extraction_of(r).is_some()).count();
        let with_audio = records
            .iter()
            .filter(|r| extraction_of(r).is_some_and(|e| !e.audio_transcripts.is_empty()))
            .count();
        let with_ocr = records
            .iter()
            .filter(|r| extraction_of(r).is_some_and(|e| !e.ocr_texts.is_empty()))
            .count();
        let with_local_media = records
            .iter()
            .filter(|r| media_entries(r).iter().any(|m| !m.local_path.is_empty()))
            .count();
        let pending = with_local_media.saturating_sub(with_extraction);

        let mut report = format!(
            "Total posts:           {total}\n\
             With local media:      {with_local_media}\n\
             Extracted:             {with_extraction}\n\
             \x20 With audio:          {with_audio}\n\
             \x20 With OCR text:       {with_ocr}\n\
             Pending extraction:    {pending}"
        );

        // Per-collection breakdown, busiest first.
        let mut collections: BTreeMap<String, (usize, usize, usize)> = BTreeMap::new();
        for record in &records {
            let Some(names) = record.get("collections").and_then(Value::as_array) else {
                continue;
            };
            for name in names.iter().filter_map(Value::as_str) {
                let entry = collections.entry(name.to_string()).or_default();
                entry.0 += 1;
                if extraction_of(record).is_some() {
                    entry.1 += 1;
                } else if media_entries(record).iter().any(|m| !m.local_path.is_empty()) {
                    entry.2 += 1;
                }
            }
        }
        if !collections.is_empty() {
            let mut rows: Vec<_> = collections.into_iter().collect();
            rows.sort_by(|a, b| b.1 .2.cmp(&a.1 .2));
            report.push_str("\n\nBy collection (top 15):");
            for (name, (total, extracted, pending)) in rows.into_iter().take(15) {
                report.push_str(&format!(
                    "\n  {name}: {extracted}/{total} extracted, {pending} pending"
                ));
            }
        }
        Ok(report)
    }

    /// Pretty-print one extracted record, by id or first match.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn sample(
        &self,
        post_id: Option<&str>,
        collection: Option<&str>,
    ) -> Result<String> {
        let records = self.read_records().await?;

        let extracted = |record: &&JsonMap| {
            record
                .get("extracted_text")
                .is_some_and(|v| !v.is_null())
        };
        let matches_collection = |record: &&JsonMap| match collection {
            Some(filter) => in_collection(record, filter),
            None => true,
        };

        let target = match post_id {
            Some(id) => records
                .iter()
                .find(|r| r.get("id").and_then(Value::as_str) == Some(id)),
            None => records
                .iter()
                .filter(extracted)
                .filter(matches_collection)
                .find(|r| {
                    // Prefer a record with both audio and OCR.
                    let et = r.get("extracted_text");
                    let has = |key: &str| {
                        et.and_then(|v| v.get(key))
                            .and_then(Value::as_array)
                            .is_some_and(|a| !a.is_empty())
                    };
                    has("audio_transcripts") && has("ocr_texts")
                })
                .or_else(|| {
                    records
                        .iter()
                        .filter(extracted)
                        .find(matches_collection)
                }),
        };

        let Some(record) = target else {
            return Ok("No extracted posts found.".to_string());
        };

        let str_field = |key: &str| {
            record
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string()
        };
        let username = record
            .get("author")
            .and_then(|a| a.get("username"))
            .and_then(Value::as_str)
            .unwrap_or("?");

        let mut out = format!(
            "Post: {} by @{username}\nURL: {}\n",
            str_field("id"),
            str_field("post_url")
        );

        let caption = str_field("text");
        out.push_str(&format!("\n--- Caption ---\n{}\n", truncate_chars(&caption, 500)));

        if let Some(et) = record
            .get("extracted_text")
            .cloned()
            .and_then(|v| serde_json::from_value::<ExtractedText>(v).ok())
        {
            for (i, transcript) in et.audio_transcripts.iter().enumerate() {
                out.push_str(&format!(
                    "\n--- Audio Transcript {} ---\n{}\n",
                    i + 1,
                    truncate_chars(transcript, 500)
                ));
            }
            if !et.ocr_texts.is_empty() {
                out.push_str(&format!(
                    "\n--- OCR Texts ({} unique) ---\n",
                    et.ocr_texts.len()
                ));
                for text in et.ocr_texts.iter().take(20) {
                    out.push_str(&format!("  {text}\n"));
                }
            }
            out.push_str(&format!(
                "\nExtracted at: {}\nStatus: {}",
                et.extracted_at, et.extraction_status
            ));
        } else {
            out.push_str("\n(no extraction on this post)");
        }
        Ok(out)
    }

    async fn read_records(&self) -> Result<Vec<JsonMap>> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.read())
            .await
            .context("store read task failed")??)
    }

    async fn patch_records(&self, patches: BTreeMap<String, JsonMap>) -> Result<usize> {
        if patches.is_empty() {
            return Ok(0);
        }
        let store = self.store.clone();
        Ok(
            tokio::task::spawn_blocking(move || store.patch_items(&patches))
                .await
                .context("store patch task failed")??,
        )
    }
}

/// First `max` characters of a string, never splitting a code point.
fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Local path of a media item when the file exists and is non-empty.
/// Empty files are truncated downloads and count as absent.
fn existing_local_path(media: &MediaItem) -> Option<std::path::PathBuf> {
    if media.local_path.is_empty() {
        return None;
    }
    let path = std::path::PathBuf::from(&media.local_path);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.len() > 0 => Some(path),
        _ => None,
    }
}

fn count_local_media(candidates: &[JsonMap], media_type: &str) -> usize {
    candidates
        .iter()
        .flat_map(media_entries)
        .filter(|m| m.media_type == media_type && existing_local_path(m).is_some())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_local_path_rules() {
        let dir = tempfile::tempdir().unwrap();

        let missing = MediaItem {
            local_path: dir.path().join("missing.jpg").display().to_string(),
            ..MediaItem::default()
        };
        assert!(existing_local_path(&missing).is_none());

        let empty_path = dir.path().join("empty.jpg");
        std::fs::write(&empty_path, b"").unwrap();
        let empty = MediaItem {
            local_path: empty_path.display().to_string(),
            ..MediaItem::default()
        };
        assert!(existing_local_path(&empty).is_none());

        let real_path = dir.path().join("real.jpg");
        std::fs::write(&real_path, b"bytes").unwrap();
        let real = MediaItem {
            local_path: real_path.display().to_string(),
            ..MediaItem::default()
        };
        assert_eq!(existing_local_path(&real), Some(real_path));

        let unset = MediaItem::default();
        assert!(existing_local_path(&unset).is_none());
    }
}
