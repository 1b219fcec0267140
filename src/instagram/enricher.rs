//! Autonomous enrichment of archived stub records.
//!
//! Walks records that are still `source == "archive"`, fetches their metadata
//! through the authenticated session, downloads media through a small worker
//! pool, and folds everything back into the archive with field-level patches.
//! Designed to run for hours and to be killed at any point: progress is
//! whatever the last patch wrote, and the next run picks up the rest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::{FetchOutcome, FetchedPost};
use super::media::{to_media_items, MediaDownloader};
use super::session::{ApiSession, CookieBundle};
use crate::config::Config;
use crate::constants::{
    COOLDOWN_EVERY, COOLDOWN_SECS, DOWNLOAD_DRAIN_TIMEOUT_SECS, MAX_CONSECUTIVE_FAILURES,
    MEDIA_POOL_SIZE, RATE_LIMIT_PAUSE_SECS, TEST_SHORTCODE,
};
use crate::models::{
    in_collection, media_entries, Author, MediaItem, NO_CAPTION, POST_UNAVAILABLE, SOURCE_ARCHIVE,
    SOURCE_DELETED, SOURCE_ENRICHED,
};
use crate::store::{JsonMap, JsonStore, SyncTracker};

/// Knobs for one enrichment run.
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub limit: Option<usize>,
    /// Seconds between API requests.
    pub delay: f64,
    /// Patch the archive every N posts.
    pub save_every: usize,
    pub download_media: bool,
    /// Substring filter on collection names.
    pub collection: Option<String>,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            limit: None,
            delay: 3.0,
            save_every: 25,
            download_media: true,
            collection: None,
        }
    }
}

/// Per-batch apply counts.
#[derive(Debug, Default)]
pub struct ApplyCounts {
    pub enriched: usize,
    pub deleted: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// One fetched record waiting for its patch, plus any finished download.
struct EnrichResult {
    shortcode: String,
    outcome: FetchOutcome,
    downloaded: Option<Vec<MediaItem>>,
}

type DownloadHandle = (JoinHandle<Vec<MediaItem>>, usize);

pub struct Enricher {
    config: Config,
    store: JsonStore,
    tracker: SyncTracker,
    downloader: MediaDownloader,
}

impl Enricher {
    /// # Errors
    ///
    /// Fails if the media download client cannot be constructed.
    pub fn new(config: Config) -> Result<Self> {
        let store = JsonStore::with_default_key(config.saved_posts_path());
        let tracker = SyncTracker::new(config.sync_state_path());
        let downloader = MediaDownloader::new(&config.media_dir(), config.media_timeout_secs)
            .context("failed to build media download client")?;
        Ok(Self {
            config,
            store,
            tracker,
            downloader,
        })
    }

    /// Run the enrichment loop over all pending records.
    ///
    /// # Errors
    ///
    /// Fails fast on missing cookies or a broken auth self-test; everything
    /// per-record is contained and counted instead.
    pub async fn run(&self, opts: &EnrichOptions) -> Result<()> {
        let mut session = self.build_session().await?;
        info!(user_id = session.user_id(), "Authenticated");

        let test = session.fetch_post(TEST_SHORTCODE).await;
        if let FetchOutcome::Failed(failure) = &test {
            anyhow::bail!(
                "auth self-test failed ({failure}); make sure the browser session is logged in"
            );
        }
        let api_mode = if session.graphql_available() {
            "GraphQL"
        } else {
            "REST (GraphQL checkpointed)"
        };
        info!(api_mode, "Auth self-test passed");

        let pending = self.pending_shortcodes(opts.limit, opts.collection.as_deref()).await?;
        if pending.is_empty() {
            info!("No posts need enrichment");
            return Ok(());
        }
        info!(
            pending = pending.len(),
            delay_secs = opts.delay,
            download_media = opts.download_media,
            collection = opts.collection.as_deref().unwrap_or(""),
            "Starting enrichment"
        );

        let semaphore = Arc::new(Semaphore::new(MEDIA_POOL_SIZE));
        let mut batch: Vec<EnrichResult> = Vec::new();
        let mut downloads: Vec<DownloadHandle> = Vec::new();

        let mut enriched_total = 0usize;
        let mut deleted_total = 0usize;
        let mut failed_total = 0usize;
        let mut fetches = 0usize;
        let mut consecutive_failures = 0usize;
        let mut run_error: Option<String> = None;

        for (i, shortcode) in pending.iter().enumerate() {
            let outcome = session.fetch_post(shortcode).await;
            fetches += 1;
            let mut rate_limited = false;

            match &outcome {
                FetchOutcome::Ok(post) => {
                    enriched_total += 1;
                    consecutive_failures = 0;
                    if opts.download_media && !post.media.is_empty() {
                        downloads.push((
                            self.spawn_download(&semaphore, shortcode, post),
                            batch.len(),
                        ));
                    }
                }
                FetchOutcome::NotFound => {
                    deleted_total += 1;
                    consecutive_failures = 0;
                }
                FetchOutcome::RateLimited => {
                    rate_limited = true;
                    consecutive_failures += 1;
                }
                FetchOutcome::Failed(failure) => {
                    warn!(shortcode = %shortcode, error = %failure, "Fetch failed");
                    failed_total += 1;
                    consecutive_failures += 1;
                }
            }

            batch.push(EnrichResult {
                shortcode: shortcode.clone(),
                outcome,
                downloaded: None,
            });

            let needs_cooldown = fetches % COOLDOWN_EVERY == 0
                || consecutive_failures >= MAX_CONSECUTIVE_FAILURES;
            let at_end = i == pending.len() - 1;

            if batch.len() >= opts.save_every || at_end || rate_limited || needs_cooldown {
                drain_downloads(&mut downloads, &mut batch).await;
                let counts = self.apply_results(std::mem::take(&mut batch)).await?;
                info!(
                    processed = i + 1,
                    total = pending.len(),
                    enriched = counts.enriched,
                    deleted = counts.deleted,
                    failed = counts.failed,
                    remaining = counts.remaining,
                    "Saved batch"
                );
            }

            if rate_limited {
                warn!(
                    pause_secs = RATE_LIMIT_PAUSE_SECS,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(Duration::from_secs(RATE_LIMIT_PAUSE_SECS)).await;
                match self.build_session().await {
                    Ok(fresh) => {
                        session = fresh;
                        consecutive_failures = 0;
                        info!("Resumed after rate limit pause");
                    }
                    Err(e) => {
                        run_error = Some(format!("cookie refresh failed: {e}"));
                        break;
                    }
                }
            } else if needs_cooldown {
                let reason = if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    format!("{consecutive_failures} consecutive failures")
                } else {
                    format!("proactive cooldown at {fetches} fetches")
                };
                info!(reason = %reason, pause_secs = COOLDOWN_SECS, "Cooling down");
                tokio::time::sleep(Duration::from_secs(COOLDOWN_SECS)).await;
                match self.build_session().await {
                    Ok(fresh) => {
                        session = fresh;
                        consecutive_failures = 0;
                        info!("Resumed after cooldown");
                    }
                    Err(e) => {
                        run_error = Some(format!("cookie refresh failed: {e}"));
                        break;
                    }
                }
            } else if !at_end {
                tokio::time::sleep(Duration::from_secs_f64(opts.delay)).await;
            }
        }

        // A break above can leave work in flight.
        if !downloads.is_empty() || !batch.is_empty() {
            drain_downloads(&mut downloads, &mut batch).await;
            self.apply_results(std::mem::take(&mut batch)).await?;
        }

        let total = self.count_records().await?;
        let mut cursor = self.tracker.get("instagram", "saved")?;
        if let Some(error) = &run_error {
            cursor.mark_partial(total as u64, error);
        } else if failed_total > 0 {
            cursor.mark_partial(
                total as u64,
                &format!("{failed_total} posts failed enrichment"),
            );
        } else {
            cursor.mark_success(total as u64, None, None);
        }
        self.tracker.save(&cursor)?;

        info!(
            enriched = enriched_total,
            deleted = deleted_total,
            failed = failed_total,
            "Enrichment finished"
        );
        if let Some(error) = run_error {
            anyhow::bail!("enrichment stopped early: {error}");
        }
        Ok(())
    }

    /// Re-download media for enriched records whose files never landed.
    ///
    /// Saved CDN URLs expire, so each record gets one fresh fetch before its
    /// downloads. Paced at ~2.5 s per post.
    ///
    /// # Errors
    ///
    /// Fails fast on missing cookies; per-record failures are counted.
    pub async fn run_media_download(&self, limit: Option<usize>) -> Result<()> {
        let mut session = self.build_session().await?;
        info!(user_id = session.user_id(), "Authenticated");

        let records = self.read_records().await?;
        let mut needs_media: Vec<String> = records
            .iter()
            .filter(|record| {
                record.get("source").and_then(Value::as_str) == Some(SOURCE_ENRICHED)
                    && media_entries(record).iter().any(|m| {
                        !m.url.is_empty() && m.local_path.is_empty()
                    })
            })
            .filter_map(|record| record.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if let Some(limit) = limit {
            needs_media.truncate(limit);
        }

        if needs_media.is_empty() {
            info!("No posts need media downloads");
            return Ok(());
        }
        info!(posts = needs_media.len(), "Re-downloading media with fresh URLs");

        let mut patches: BTreeMap<String, JsonMap> = BTreeMap::new();
        let mut downloaded = 0usize;
        let mut failed = 0usize;

        for (i, shortcode) in needs_media.iter().enumerate() {
            match session.fetch_post(shortcode).await {
                FetchOutcome::Ok(post) if !post.media.is_empty() => {
                    let media = self
                        .downloader
                        .download_post_media(shortcode, &post.username, &post.media)
                        .await;
                    downloaded += media.iter().filter(|m| !m.local_path.is_empty()).count();

                    let mut patch = JsonMap::new();
                    patch.insert("media".to_string(), media_to_value(&media));
                    patches.insert(shortcode.clone(), patch);
                }
                other => {
                    debug!(shortcode = %shortcode, outcome = ?other, "Skipping post without fresh media");
                    failed += 1;
                }
            }

            if patches.len() >= 25 || i == needs_media.len() - 1 {
                self.patch_records(std::mem::take(&mut patches)).await?;
                info!(processed = i + 1, total = needs_media.len(), downloaded, "Saved batch");
            }

            tokio::time::sleep(Duration::from_millis(2500)).await;
        }

        info!(downloaded, failed, "Media re-download finished");
        Ok(())
    }

    /// Shortcodes of records still waiting for enrichment, in file order.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn pending_shortcodes(
        &self,
        limit: Option<usize>,
        collection: Option<&str>,
    ) -> Result<Vec<String>> {
        let records = self.read_records().await?;
        let mut pending = Vec::new();
        for record in &records {
            if record.get("source").and_then(Value::as_str) != Some(SOURCE_ARCHIVE) {
                continue;
            }
            if record
                .get("text")
                .and_then(Value::as_str)
                .is_some_and(|t| !t.is_empty())
            {
                continue;
            }
            if let Some(filter) = collection {
                if !in_collection(record, filter) {
                    continue;
                }
            }
            if let Some(id) = record.get("id").and_then(Value::as_str) {
                pending.push(id.to_string());
            }
            if limit.is_some_and(|n| pending.len() >= n) {
                break;
            }
        }
        Ok(pending)
    }

    /// Enrichment status report.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn stats(&self) -> Result<String> {
        let records = self.read_records().await?;
        let total = records.len();
        let source_of = |record: &JsonMap| {
            record
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        let enriched = records.iter().filter(|r| source_of(r) == SOURCE_ENRICHED).count();
        let deleted = records.iter().filter(|r| source_of(r) == SOURCE_DELETED).count();
        let pending = records
            .iter()
            .filter(|r| {
                source_of(r) == SOURCE_ARCHIVE
                    && !r.get("text").and_then(Value::as_str).is_some_and(|t| !t.is_empty())
            })
            .count();

        let with_local = records
            .iter()
            .filter(|r| media_entries(r).iter().any(|m| !m.local_path.is_empty()))
            .count();
        let missing_local = records
            .iter()
            .filter(|r| {
                source_of(r) == SOURCE_ENRICHED && {
                    let media = media_entries(r);
                    !media.is_empty() && media.iter().all(|m| m.local_path.is_empty())
                }
            })
            .count();

        let (file_count, file_bytes) = scan_media_files(&self.config.media_dir().join("instagram"));
        let mb = file_bytes as f64 / (1024.0 * 1024.0);

        Ok(format!(
            "Total:     {total}\n\
             Enriched:  {enriched}\n\
             Pending:   {pending}\n\
             Deleted:   {deleted}\n\
             \n\
             Media:     {file_count} files ({mb:.1} MB)\n\
             \x20 With local files:    {with_local}\n\
             \x20 Missing local files: {missing_local}"
        ))
    }

    /// Exercise the cookie bundle, both endpoints, and a media download.
    ///
    /// # Errors
    ///
    /// Fails on missing cookies or when both endpoints fail.
    pub async fn self_test(&self) -> Result<String> {
        let session = self.build_session().await?;
        let mut report = format!("Authenticated as user {}\n", session.user_id());

        let gql = session.fetch_post_graphql(TEST_SHORTCODE).await;
        report.push_str(&match &gql {
            FetchOutcome::Ok(post) => format!("GraphQL: OK (@{})\n", post.username),
            other => format!("GraphQL: {other:?}\n"),
        });

        let rest = session.fetch_post_rest(TEST_SHORTCODE).await;
        report.push_str(&match &rest {
            FetchOutcome::Ok(post) => format!("REST: OK (@{})\n", post.username),
            other => format!("REST: {other:?}\n"),
        });

        let post = match (gql, rest) {
            (FetchOutcome::Ok(post), _) | (_, FetchOutcome::Ok(post)) => post,
            _ => anyhow::bail!("both endpoints failed the self-test"),
        };

        if !post.media.is_empty() {
            let media = self
                .downloader
                .download_post_media(&post.shortcode, &post.username, &post.media)
                .await;
            for item in media {
                if item.local_path.is_empty() {
                    report.push_str(&format!("Download failed: {} media\n", item.media_type));
                } else {
                    report.push_str(&format!("Downloaded: {}\n", item.local_path));
                }
            }
        }
        Ok(report)
    }

    async fn build_session(&self) -> Result<ApiSession> {
        let cookies_file = self.config.cookies_file.clone();
        let cookies = tokio::task::spawn_blocking(move || CookieBundle::load(&cookies_file))
            .await
            .context("cookie load task failed")??;
        let session = ApiSession::with_base_url(
            &cookies,
            Duration::from_secs(self.config.http_timeout_secs),
            &self.config.api_base_url,
        )
        .context("failed to build API session")?;
        Ok(session)
    }

    fn spawn_download(
        &self,
        semaphore: &Arc<Semaphore>,
        shortcode: &str,
        post: &FetchedPost,
    ) -> JoinHandle<Vec<MediaItem>> {
        let semaphore = Arc::clone(semaphore);
        let downloader = self.downloader.clone();
        let shortcode = shortcode.to_string();
        let username = post.username.clone();
        let media = post.media.clone();

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("Semaphore closed unexpectedly");
            downloader
                .download_post_media(&shortcode, &username, &media)
                .await
        })
    }

    /// Patch a batch of fetch results into the archive and bump the
    /// per-batch enrichment cursor.
    async fn apply_results(&self, batch: Vec<EnrichResult>) -> Result<ApplyCounts> {
        let mut counts = ApplyCounts::default();
        let mut patches: BTreeMap<String, JsonMap> = BTreeMap::new();

        for result in batch {
            match result.outcome {
                FetchOutcome::Ok(post) => {
                    patches.insert(
                        result.shortcode,
                        enrichment_patch(&post, result.downloaded),
                    );
                    counts.enriched += 1;
                }
                FetchOutcome::NotFound => {
                    let mut patch = JsonMap::new();
                    patch.insert("source".to_string(), json!(SOURCE_DELETED));
                    patch.insert("text".to_string(), json!(POST_UNAVAILABLE));
                    patches.insert(result.shortcode, patch);
                    counts.deleted += 1;
                }
                FetchOutcome::RateLimited | FetchOutcome::Failed(_) => {
                    counts.failed += 1;
                }
            }
        }

        self.patch_records(patches).await?;

        let records = self.read_records().await?;
        counts.remaining = records
            .iter()
            .filter(|r| {
                r.get("source").and_then(Value::as_str) == Some(SOURCE_ARCHIVE)
                    && !r.get("text").and_then(Value::as_str).is_some_and(|t| !t.is_empty())
            })
            .count();

        let mut cursor = self.tracker.get("instagram", "enrichment")?;
        cursor.mark_success(counts.enriched as u64, None, None);
        self.tracker.save(&cursor)?;

        Ok(counts)
    }

    async fn read_records(&self) -> Result<Vec<JsonMap>> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.read())
            .await
            .context("store read task failed")??)
    }

    async fn count_records(&self) -> Result<usize> {
        Ok(self.read_records().await?.len())
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

/// Wait out all in-flight downloads and fold results into the batch.
///
/// Each task gets a bounded wait; a task that overruns is abandoned and its
/// record keeps URL-only media.
async fn drain_downloads(downloads: &mut Vec<DownloadHandle>, batch: &mut [EnrichResult]) {
    for (handle, idx) in downloads.drain(..) {
        match tokio::time::timeout(
            Duration::from_secs(DOWNLOAD_DRAIN_TIMEOUT_SECS),
            handle,
        )
        .await
        {
            Ok(Ok(media)) => {
                if let Some(result) = batch.get_mut(idx) {
                    result.downloaded = Some(media);
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Media download task failed"),
            Err(_) => warn!("Media download timed out at drain, abandoning task"),
        }
    }
}

/// Build the field patch for a successfully fetched post.
fn enrichment_patch(post: &FetchedPost, downloaded: Option<Vec<MediaItem>>) -> JsonMap {
    let mut patch = JsonMap::new();

    let caption = if post.caption.is_empty() {
        NO_CAPTION.to_string()
    } else {
        post.caption.clone()
    };
    patch.insert("text".to_string(), json!(caption));

    let author = Author {
        username: post.username.clone(),
        display_name: post.full_name.clone(),
        profile_url: if post.username.is_empty() {
            String::new()
        } else {
            format!("https://www.instagram.com/{}/", post.username)
        },
        headline: String::new(),
    };
    patch.insert(
        "author".to_string(),
        serde_json::to_value(&author).unwrap_or(Value::Null),
    );
    patch.insert("source".to_string(), json!(SOURCE_ENRICHED));

    if !post.media.is_empty() {
        let media = downloaded.unwrap_or_else(|| to_media_items(&post.media));
        patch.insert("media".to_string(), media_to_value(&media));
    }
    if post.like_count > 0 {
        patch.insert("like_count".to_string(), json!(post.like_count));
    }
    if post.comment_count > 0 {
        patch.insert("reply_count".to_string(), json!(post.comment_count));
    }
    if post.taken_at > 0 {
        patch.insert(
            "created_at".to_string(),
            json!(crate::models::unix_to_iso(post.taken_at)),
        );
    }
    if !post.pk.is_empty() {
        patch.insert("media_pk".to_string(), json!(post.pk));
    }

    patch
}

fn media_to_value(media: &[MediaItem]) -> Value {
    serde_json::to_value(media).unwrap_or_else(|_| Value::Array(Vec::new()))
}

/// Count media files under a directory tree, returning (files, bytes).
fn scan_media_files(root: &std::path::Path) -> (usize, u64) {
    let mut count = 0usize;
    let mut bytes = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                count += 1;
                bytes += meta.len();
            }
        }
    }
    (count, bytes)
}
