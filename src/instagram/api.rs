//! Post fetching against the platform's two private endpoints.
//!
//! GraphQL is primary. When it starts answering with HTML checkpoint pages
//! (the body stops parsing as JSON), the session downgrades to the REST
//! endpoint for the rest of its life; REST rides a different rate-limiting
//! path server-side.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::session::{shortcode_to_pk, ApiSession};
use crate::constants::{GRAPHQL_DOC_ID, GRAPHQL_PATH};
use crate::retry::RetryPolicy;

/// One media asset on a post, normalized from either endpoint.
#[derive(Debug, Clone)]
pub struct MediaCandidate {
    pub kind: MediaKind,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// A post as returned by the API, normalized to the fields the archive keeps.
#[derive(Debug, Clone, Default)]
pub struct FetchedPost {
    pub shortcode: String,
    pub pk: String,
    pub username: String,
    pub full_name: String,
    pub caption: String,
    pub like_count: u64,
    pub comment_count: u64,
    /// Unix seconds; zero when the API omitted it.
    pub taken_at: i64,
    /// Raw media_type: 1 = image, 2 = video/reel, 8 = carousel.
    pub media_type: u8,
    pub media: Vec<MediaCandidate>,
}

/// Result of fetching one post.
#[derive(Debug)]
pub enum FetchOutcome {
    Ok(Box<FetchedPost>),
    /// The platform says the post is gone. Terminal for the record.
    NotFound,
    /// HTTP 429; the pipeline backs off and refreshes cookies.
    RateLimited,
    /// Anything else. The record stays pending.
    Failed(FetchFailure),
}

#[derive(Debug)]
pub enum FetchFailure {
    /// Non-success status other than 404/429, after 5xx retries.
    Status(u16),
    /// Connection-level failure, after retries.
    Transport(String),
    /// Body was not JSON: the canonical checkpoint signal on GraphQL.
    InvalidPayload,
    /// The endpoint answered with an explicit error message.
    Api(String),
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "http {code}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::InvalidPayload => write!(f, "invalid json"),
            Self::Api(msg) => write!(f, "api: {msg}"),
        }
    }
}

/// A saved collection, from the paginated collections listing.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub count: u64,
}

/// One page of the saved feed.
#[derive(Debug, Default)]
pub struct SavedFeedPage {
    pub items: Vec<RawMediaItem>,
    pub more_available: bool,
    pub next_max_id: Option<String>,
}

/// Retriable failure of a single HTTP attempt: transport errors and 5xx.
#[derive(Debug)]
enum AttemptError {
    Transport(String),
    Server(u16),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Server(code) => write!(f, "server error {code}"),
        }
    }
}

impl AttemptError {
    fn into_failure(self) -> FetchFailure {
        match self {
            Self::Transport(msg) => FetchFailure::Transport(msg),
            Self::Server(code) => FetchFailure::Status(code),
        }
    }
}

fn fetch_retry_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(30))
}

impl ApiSession {
    /// Fetch a single post, trying GraphQL first with REST fallback.
    ///
    /// On a GraphQL checkpoint the session flips to REST-only and the same
    /// call is answered via REST, so the caller never sees the downgrade.
    pub async fn fetch_post(&mut self, shortcode: &str) -> FetchOutcome {
        if self.graphql_available {
            match self.fetch_post_graphql(shortcode).await {
                FetchOutcome::Failed(FetchFailure::InvalidPayload) => {
                    info!("GraphQL checkpointed, switching to REST API");
                    self.graphql_available = false;
                }
                outcome => return outcome,
            }
        }
        self.fetch_post_rest(shortcode).await
    }

    /// Fetch a post via the GraphQL endpoint.
    pub async fn fetch_post_graphql(&self, shortcode: &str) -> FetchOutcome {
        let result = fetch_retry_policy()
            .run_async(
                "GraphQL post fetch",
                || self.graphql_attempt(shortcode),
                |_| true,
            )
            .await;
        match result {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Failed(e.into_failure()),
        }
    }

    async fn graphql_attempt(&self, shortcode: &str) -> Result<FetchOutcome, AttemptError> {
        let url = format!("{}{}", self.base_url, GRAPHQL_PATH);
        let variables = json!({ "shortcode": shortcode }).to_string();
        let form = [("doc_id", GRAPHQL_DOC_ID), ("variables", variables.as_str())];

        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Ok(FetchOutcome::RateLimited);
        }
        if status.is_server_error() {
            return Err(AttemptError::Server(status.as_u16()));
        }
        if !status.is_success() {
            return Ok(FetchOutcome::Failed(FetchFailure::Status(status.as_u16())));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;
        let Ok(body) = serde_json::from_str::<GraphqlResponse>(&text) else {
            return Ok(FetchOutcome::Failed(FetchFailure::InvalidPayload));
        };

        let items = body.data.and_then(|d| d.web_info).map(|w| w.items);
        match items.and_then(|mut items| {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        }) {
            Some(item) => Ok(FetchOutcome::Ok(Box::new(item.into_fetched(shortcode)))),
            None => {
                if let Some(err) = body.errors.into_iter().next() {
                    return Ok(FetchOutcome::Failed(FetchFailure::Api(err.message)));
                }
                Ok(FetchOutcome::NotFound)
            }
        }
    }

    /// Fetch a post via the REST endpoint (`/api/v1/media/{pk}/info/`).
    pub async fn fetch_post_rest(&self, shortcode: &str) -> FetchOutcome {
        let pk = match shortcode_to_pk(shortcode) {
            Ok(pk) => pk,
            Err(e) => return FetchOutcome::Failed(FetchFailure::Api(e.to_string())),
        };

        let result = fetch_retry_policy()
            .run_async("REST post fetch", || self.rest_attempt(shortcode, pk), |_| true)
            .await;
        match result {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Failed(e.into_failure()),
        }
    }

    async fn rest_attempt(&self, shortcode: &str, pk: u128) -> Result<FetchOutcome, AttemptError> {
        let url = format!("{}/api/v1/media/{pk}/info/", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(FetchOutcome::NotFound);
        }
        if status.as_u16() == 429 {
            return Ok(FetchOutcome::RateLimited);
        }
        if status.is_server_error() {
            return Err(AttemptError::Server(status.as_u16()));
        }
        if !status.is_success() {
            return Ok(FetchOutcome::Failed(FetchFailure::Status(status.as_u16())));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;
        let Ok(body) = serde_json::from_str::<RestResponse>(&text) else {
            return Ok(FetchOutcome::Failed(FetchFailure::InvalidPayload));
        };

        match body.items.into_iter().next() {
            Some(item) => Ok(FetchOutcome::Ok(Box::new(item.into_fetched(shortcode)))),
            None => Ok(FetchOutcome::NotFound),
        }
    }

    /// Fetch all saved collections, following pagination.
    ///
    /// # Errors
    ///
    /// Fails on a non-success status or an undecodable body.
    pub async fn fetch_collections(&self) -> Result<Vec<Collection>> {
        let mut collections = Vec::new();
        let mut max_id: Option<String> = None;

        loop {
            let mut url = format!("{}/api/v1/collections/list/", self.base_url);
            if let Some(cursor) = &max_id {
                url = format!("{url}?max_id={cursor}");
            }

            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("collections list request failed")?;
            if !resp.status().is_success() {
                anyhow::bail!("collections list failed with status {}", resp.status());
            }

            let page: CollectionsResponse = resp
                .json()
                .await
                .context("collections list returned an undecodable body")?;

            for item in page.items {
                collections.push(Collection {
                    id: value_to_string(&item.collection_id),
                    name: item.collection_name,
                    count: item.collection_media_count,
                });
            }

            if !page.more_available {
                break;
            }
            match page.next_max_id {
                Some(next) => max_id = Some(next),
                None => break,
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Ok(collections)
    }

    /// Fetch one page of the saved posts feed.
    ///
    /// # Errors
    ///
    /// Fails on a non-success status or an undecodable body.
    pub async fn fetch_saved_page(&self, max_id: Option<&str>) -> Result<SavedFeedPage> {
        let mut url = format!("{}/api/v1/feed/saved/posts/", self.base_url);
        if let Some(cursor) = max_id {
            url = format!("{url}?max_id={cursor}");
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("saved feed request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("saved feed failed with status {}", resp.status());
        }

        let page: SavedFeedResponse = resp
            .json()
            .await
            .context("saved feed returned an undecodable body")?;

        let items = page
            .items
            .into_iter()
            .filter_map(|wrapper| {
                if wrapper.media.is_none() {
                    warn!("Saved feed item without media payload, skipping");
                }
                wrapper.media
            })
            .collect();

        Ok(SavedFeedPage {
            items,
            more_available: page.more_available,
            next_max_id: page.next_max_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire formats. Everything defaults: the API omits fields freely.

#[derive(Debug, Default, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Default, Deserialize)]
struct GraphqlData {
    #[serde(rename = "xdt_api__v1__media__shortcode__web_info", default)]
    web_info: Option<RestResponse>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct RestResponse {
    #[serde(default)]
    items: Vec<RawMediaItem>,
}

#[derive(Debug, Default, Deserialize)]
struct CollectionsResponse {
    #[serde(default)]
    items: Vec<RawCollection>,
    #[serde(default)]
    more_available: bool,
    #[serde(default)]
    next_max_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCollection {
    #[serde(default)]
    collection_id: Value,
    #[serde(default)]
    collection_name: String,
    #[serde(default)]
    collection_media_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct SavedFeedResponse {
    #[serde(default)]
    items: Vec<SavedFeedItem>,
    #[serde(default)]
    more_available: bool,
    #[serde(default)]
    next_max_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SavedFeedItem {
    #[serde(default)]
    media: Option<RawMediaItem>,
}

/// A media item as both endpoints (and the saved feed) describe it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMediaItem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub pk: Value,
    #[serde(default)]
    pub user: RawUser,
    #[serde(default)]
    pub caption: Option<RawCaption>,
    #[serde(default)]
    pub media_type: u8,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub taken_at: i64,
    #[serde(default)]
    pub image_versions2: Option<RawImageVersions>,
    #[serde(default)]
    pub video_versions: Vec<RawVersion>,
    #[serde(default)]
    pub carousel_media: Vec<RawMediaItem>,
    #[serde(default)]
    pub saved_collection_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCaption {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawImageVersions {
    #[serde(default)]
    pub candidates: Vec<RawVersion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVersion {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl RawMediaItem {
    /// Normalize to one entry per asset: a top-level image and/or video
    /// first, carousel children after, order preserved.
    #[must_use]
    pub fn media_candidates(&self) -> Vec<MediaCandidate> {
        let mut media = Vec::new();
        push_own_candidates(self, &mut media);
        for child in &self.carousel_media {
            push_own_candidates(child, &mut media);
        }
        media
    }

    /// Convert to the normalized post shape shared by the Enricher and
    /// Bootstrap.
    #[must_use]
    pub fn into_fetched(self, shortcode: &str) -> FetchedPost {
        let caption = self
            .caption
            .as_ref()
            .map(|c| c.text.clone())
            .unwrap_or_default();
        let media = self.media_candidates();

        FetchedPost {
            shortcode: shortcode.to_string(),
            pk: value_to_string(&self.pk),
            username: self.user.username,
            full_name: self.user.full_name,
            caption,
            like_count: self.like_count,
            comment_count: self.comment_count,
            taken_at: self.taken_at,
            media_type: self.media_type,
            media,
        }
    }
}

fn push_own_candidates(item: &RawMediaItem, media: &mut Vec<MediaCandidate>) {
    if let Some(img) = item
        .image_versions2
        .as_ref()
        .and_then(|v| v.candidates.first())
    {
        media.push(MediaCandidate {
            kind: MediaKind::Image,
            url: img.url.clone(),
            width: img.width,
            height: img.height,
        });
    }
    if let Some(vid) = item.video_versions.first() {
        media.push(MediaCandidate {
            kind: MediaKind::Video,
            url: vid.url.clone(),
            width: vid.width,
            height: vid.height,
        });
    }
}

/// Ids arrive as either JSON numbers or strings; normalize to a string.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
