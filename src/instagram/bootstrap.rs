//! One-shot ingest of everything currently saved.
//!
//! Walks the saved feed through the same session the Enricher uses and
//! appends records that arrive pre-enriched (captions, media URLs, author,
//! timestamps), so they skip straight to extraction.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::api::{value_to_string, RawMediaItem};
use super::media::{to_media_items, MediaDownloader};
use super::session::{ApiSession, CookieBundle};
use crate::config::Config;
use crate::constants::{DOWNLOAD_DRAIN_TIMEOUT_SECS, MEDIA_POOL_SIZE};
use crate::models::{now_iso, unix_to_iso, Author, MediaItem, Post, NO_CAPTION, SOURCE_ENRICHED};
use crate::store::{JsonMap, JsonStore, SyncTracker};

/// Knobs for one bootstrap sync.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub limit: Option<usize>,
    /// Seconds between feed page requests.
    pub delay: f64,
    pub download_media: bool,
    /// Substring filter on collection names.
    pub collection: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            limit: None,
            delay: 2.0,
            download_media: true,
            collection: None,
        }
    }
}

pub struct Bootstrap {
    config: Config,
    store: JsonStore,
    tracker: SyncTracker,
    downloader: MediaDownloader,
}

impl Bootstrap {
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

    /// Sync saved posts from the API into the archive.
    ///
    /// # Errors
    ///
    /// Fails on missing cookies, an empty collections listing, or a store
    /// failure. Per-post media failures are warnings.
    pub async fn run_sync(&self, opts: &SyncOptions) -> Result<()> {
        let session = self.build_session().await?;
        info!(user_id = session.user_id(), "Authenticated");

        let collections = session
            .fetch_collections()
            .await
            .context("failed to list collections")?;
        if collections.is_empty() {
            anyhow::bail!("no collections found; is the browser session logged in?");
        }
        let collection_map: HashMap<String, String> = collections
            .iter()
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect();
        info!(
            collections = collections.len(),
            total_saved = collections.iter().map(|c| c.count).sum::<u64>(),
            "Fetched collections"
        );

        let existing_ids = self.existing_ids().await?;
        info!(existing = existing_ids.len(), "Loaded current archive");

        let fetched = self
            .fetch_saved_posts(&session, &collection_map, opts)
            .await?;
        let mut new_posts: Vec<Post> = fetched
            .into_iter()
            .filter(|post| !existing_ids.contains(&post.id))
            .collect();
        if new_posts.is_empty() {
            info!("All fetched posts already in the archive, nothing to do");
            return Ok(());
        }
        info!(new = new_posts.len(), "Fetched saved feed");

        if opts.download_media {
            self.download_new_media(&mut new_posts).await;
        }

        let added = self.append_posts(&new_posts).await?;
        let total = self.store_count().await?;
        info!(added, total, "Appended new posts");

        let mut cursor = self.tracker.get("instagram", "saved")?;
        cursor.mark_success(total as u64, None, None);
        self.tracker.save(&cursor)?;

        Ok(())
    }

    /// Report: collections listing, sorted by size.
    ///
    /// # Errors
    ///
    /// Fails on missing cookies or a failed listing.
    pub async fn collections_report(&self) -> Result<String> {
        let session = self.build_session().await?;
        let mut collections = session.fetch_collections().await?;
        if collections.is_empty() {
            return Ok("No collections found.".to_string());
        }

        collections.sort_by(|a, b| b.count.cmp(&a.count));
        let total: u64 = collections.iter().map(|c| c.count).sum();
        let mut lines = vec![format!(
            "Found {} collections ({total} total posts):",
            collections.len()
        )];
        for c in &collections {
            lines.push(format!("  {}: {} posts (id={})", c.name, c.count, c.id));
        }
        Ok(lines.join("\n"))
    }

    /// Report: per-collection API counts versus what the archive holds.
    ///
    /// # Errors
    ///
    /// Fails on missing cookies, a failed listing, or a store failure.
    pub async fn stats(&self) -> Result<String> {
        let session = self.build_session().await?;
        let mut collections = session.fetch_collections().await?;
        collections.sort_by(|a, b| b.count.cmp(&a.count));

        let records = self.read_records().await?;
        let mut local_counter: HashMap<String, u64> = HashMap::new();
        for record in &records {
            if let Some(cols) = record.get("collections").and_then(Value::as_array) {
                for name in cols.iter().filter_map(Value::as_str) {
                    *local_counter.entry(name.to_string()).or_default() += 1;
                }
            }
        }

        let mut lines = vec![
            format!("{:<35} {:>6} {:>6} {:>6}", "Collection", "API", "Local", "Delta"),
            "-".repeat(60),
        ];
        let mut api_total = 0u64;
        let mut local_total = 0u64;
        for c in &collections {
            let local = local_counter.get(&c.name).copied().unwrap_or(0);
            api_total += c.count;
            local_total += local;
            lines.push(format!(
                "  {:<33} {:>6} {:>6} {:>+6}",
                c.name,
                c.count,
                local,
                c.count as i64 - local as i64
            ));
        }
        lines.push("-".repeat(60));
        lines.push(format!(
            "  {:<33} {:>6} {:>6} {:>+6}",
            "TOTAL",
            api_total,
            local_total,
            api_total as i64 - local_total as i64
        ));
        lines.push(format!(
            "\n  Local posts not in any collection: {}",
            records.len() as u64 - local_total.min(records.len() as u64)
        ));
        Ok(lines.join("\n"))
    }

    async fn fetch_saved_posts(
        &self,
        session: &ApiSession,
        collection_map: &HashMap<String, String>,
        opts: &SyncOptions,
    ) -> Result<Vec<Post>> {
        let mut posts = Vec::new();
        let mut max_id: Option<String> = None;
        let mut page = 0usize;

        'pages: loop {
            let feed = session
                .fetch_saved_page(max_id.as_deref())
                .await
                .context("failed to fetch saved feed page")?;
            page += 1;

            for item in feed.items {
                let Some(post) = saved_item_to_post(item, collection_map) else {
                    continue;
                };

                if let Some(filter) = &opts.collection {
                    let needle = filter.to_lowercase();
                    if !post
                        .collections
                        .iter()
                        .any(|name| name.to_lowercase().contains(&needle))
                    {
                        continue;
                    }
                }

                posts.push(post);
                if opts.limit.is_some_and(|n| posts.len() >= n) {
                    break 'pages;
                }
            }

            info!(fetched = posts.len(), page, "Fetching saved posts");

            if !feed.more_available {
                break;
            }
            match feed.next_max_id {
                Some(next) => max_id = Some(next),
                None => break,
            }
            tokio::time::sleep(Duration::from_secs_f64(opts.delay)).await;
        }

        Ok(posts)
    }

    async fn download_new_media(&self, posts: &mut [Post]) {
        let semaphore = Arc::new(Semaphore::new(MEDIA_POOL_SIZE));
        let mut handles: Vec<(JoinHandle<Vec<MediaItem>>, usize)> = Vec::new();

        for (idx, post) in posts.iter().enumerate() {
            let candidates: Vec<_> = post
                .media
                .iter()
                .filter(|m| !m.url.is_empty())
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let downloader = self.downloader.clone();
            let shortcode = post.id.clone();
            let username = post.author.username.clone();

            handles.push((
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("Semaphore closed unexpectedly");
                    let candidates = media_items_to_candidates(&candidates);
                    downloader
                        .download_post_media(&shortcode, &username, &candidates)
                        .await
                }),
                idx,
            ));
        }

        let mut downloaded = 0usize;
        for (handle, idx) in handles {
            match tokio::time::timeout(
                Duration::from_secs(DOWNLOAD_DRAIN_TIMEOUT_SECS),
                handle,
            )
            .await
            {
                Ok(Ok(media)) => {
                    downloaded += media.iter().filter(|m| !m.local_path.is_empty()).count();
                    posts[idx].media = media;
                }
                Ok(Err(e)) => warn!(error = %e, "Media download task failed"),
                Err(_) => warn!("Media download timed out, abandoning task"),
            }
        }
        info!(files = downloaded, "Downloaded media for new posts");
    }

    async fn build_session(&self) -> Result<ApiSession> {
        let cookies_file = self.config.cookies_file.clone();
        let cookies = tokio::task::spawn_blocking(move || CookieBundle::load(&cookies_file))
            .await
            .context("cookie load task failed")??;
        Ok(ApiSession::with_base_url(
            &cookies,
            Duration::from_secs(self.config.http_timeout_secs),
            &self.config.api_base_url,
        )
        .context("failed to build API session")?)
    }

    async fn existing_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .read_records()
            .await?
            .iter()
            .filter_map(|record| record.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn read_records(&self) -> Result<Vec<JsonMap>> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.read())
            .await
            .context("store read task failed")??)
    }

    async fn store_count(&self) -> Result<usize> {
        Ok(self.read_records().await?.len())
    }

    async fn append_posts(&self, posts: &[Post]) -> Result<usize> {
        let items: Vec<JsonMap> = posts
            .iter()
            .filter_map(|post| match serde_json::to_value(post) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .collect();
        let store = self.store.clone();
        Ok(
            tokio::task::spawn_blocking(move || store.append(&items, None))
                .await
                .context("store append task failed")??,
        )
    }
}

/// Convert a saved-feed item into a full archive record.
///
/// Returns `None` for items with no shortcode, which the feed does produce
/// around ads and suggested content.
fn saved_item_to_post(
    item: RawMediaItem,
    collection_map: &HashMap<String, String>,
) -> Option<Post> {
    if item.code.is_empty() {
        return None;
    }
    let shortcode = item.code.clone();

    let content_type = if item.media_type == 2 {
        "reel"
    } else {
        "saved_post"
    };
    let post_url = if content_type == "reel" {
        format!("https://www.instagram.com/reel/{shortcode}/")
    } else {
        format!("https://www.instagram.com/p/{shortcode}/")
    };

    let collections: Vec<String> = item
        .saved_collection_ids
        .iter()
        .filter_map(|id| collection_map.get(&value_to_string(id)))
        .cloned()
        .collect();

    let fetched = item.into_fetched(&shortcode);
    let now = now_iso();

    Some(Post {
        id: shortcode,
        platform: "instagram".to_string(),
        content_type: content_type.to_string(),
        text: if fetched.caption.is_empty() {
            NO_CAPTION.to_string()
        } else {
            fetched.caption.clone()
        },
        author: Author {
            username: fetched.username.clone(),
            display_name: fetched.full_name.clone(),
            profile_url: if fetched.username.is_empty() {
                String::new()
            } else {
                format!("https://www.instagram.com/{}/", fetched.username)
            },
            headline: String::new(),
        },
        media: to_media_items(&fetched.media),
        post_url,
        created_at: unix_to_iso(fetched.taken_at),
        saved_at: now.clone(),
        harvested_at: now,
        like_count: fetched.like_count,
        reply_count: fetched.comment_count,
        repost_count: 0,
        // Already enriched from the API; skips straight to extraction.
        source: SOURCE_ENRICHED.to_string(),
        collections,
        media_pk: fetched.pk,
        extracted_text: None,
    })
}

/// Rebuild download candidates from archive-shaped media entries.
fn media_items_to_candidates(
    media: &[MediaItem],
) -> Vec<super::api::MediaCandidate> {
    use super::api::{MediaCandidate, MediaKind};
    media
        .iter()
        .map(|m| MediaCandidate {
            kind: if m.media_type == "video" {
                MediaKind::Video
            } else {
                MediaKind::Image
            },
            url: m.url.clone(),
            width: m.width,
            height: m.height,
        })
        .collect()
}
