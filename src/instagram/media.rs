//! Media byte downloads.
//!
//! CDN URLs are presigned and short-lived, so downloads use a bare client
//! with a browser user agent and no cookies. Files land under
//! `<media_root>/instagram/<username>/<shortcode>_<urlhash><ext>`; an
//! existing non-empty file is never re-fetched, which is what makes
//! interrupted runs cheap to resume.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::api::{MediaCandidate, MediaKind};
use crate::constants::MEDIA_USER_AGENT;
use crate::models::MediaItem;

const KNOWN_EXTENSIONS: [&str; 8] = [
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".mp4", ".mov", ".webm",
];

/// Downloads post media into the archive's media tree.
#[derive(Debug, Clone)]
pub struct MediaDownloader {
    client: reqwest::Client,
    base_dir: PathBuf,
}

impl MediaDownloader {
    /// Build a downloader rooted at `<media_root>/instagram`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(media_root: &Path, timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(MEDIA_USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_dir: media_root.join("instagram"),
        })
    }

    /// Download every asset of one post.
    ///
    /// Returns the archive-shaped media list with `local_path` filled in for
    /// each successful download. A failed item keeps an empty `local_path`
    /// and is logged, never fatal.
    pub async fn download_post_media(
        &self,
        shortcode: &str,
        username: &str,
        media: &[MediaCandidate],
    ) -> Vec<MediaItem> {
        let target_dir = self.base_dir.join(sanitize_username(username));

        let mut out = Vec::with_capacity(media.len());
        for candidate in media {
            let mut item = MediaItem {
                url: candidate.url.clone(),
                media_type: candidate.kind.as_str().to_string(),
                local_path: String::new(),
                alt_text: String::new(),
                width: candidate.width,
                height: candidate.height,
            };

            if candidate.url.is_empty() {
                out.push(item);
                continue;
            }

            let filename = format!(
                "{shortcode}_{}{}",
                url_hash(&candidate.url),
                guess_ext(&candidate.url, candidate.kind)
            );
            let filepath = target_dir.join(filename);

            match self.fetch_to_file(&candidate.url, &target_dir, &filepath).await {
                Ok(()) => item.local_path = filepath.display().to_string(),
                Err(e) => {
                    warn!(shortcode, error = %e, "Failed to download media");
                }
            }
            out.push(item);
        }
        out
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        target_dir: &Path,
        filepath: &Path,
    ) -> anyhow::Result<()> {
        // An empty file is a truncated previous attempt; redo it.
        if let Ok(meta) = tokio::fs::metadata(filepath).await {
            if meta.len() > 0 {
                debug!(path = %filepath.display(), "Media already downloaded, skipping");
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(target_dir).await?;

        let resp = self.client.get(url).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(filepath, &bytes).await?;
        Ok(())
    }
}

/// Archive-shaped media list for candidates that have not been downloaded.
#[must_use]
pub fn to_media_items(media: &[MediaCandidate]) -> Vec<MediaItem> {
    media
        .iter()
        .map(|candidate| MediaItem {
            url: candidate.url.clone(),
            media_type: candidate.kind.as_str().to_string(),
            local_path: String::new(),
            alt_text: String::new(),
            width: candidate.width,
            height: candidate.height,
        })
        .collect()
}

/// Strip a username down to filesystem-safe characters.
#[must_use]
pub fn sanitize_username(username: &str) -> String {
    let safe: String = username
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if safe.is_empty() {
        "unknown".to_string()
    } else {
        safe
    }
}

/// Short hash of a URL for unique filenames.
#[must_use]
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// File extension from the URL path, falling back per media kind.
#[must_use]
pub fn guess_ext(url: &str, kind: MediaKind) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split('?').next().unwrap_or("").to_string());

    if let Some(dot) = path.rfind('.') {
        let ext = path[dot..].to_ascii_lowercase();
        if KNOWN_EXTENSIONS.contains(&ext.as_str()) {
            return ext;
        }
    }

    match kind {
        MediaKind::Video => ".mp4".to_string(),
        MediaKind::Image => ".jpg".to_string(),
    }
}
