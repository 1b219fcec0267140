//! Archive record types.
//!
//! Records live on disk as a pretty-printed JSON array. The store layer works
//! on raw JSON objects so field-level patches survive unknown fields; these
//! structs are the typed view used when constructing or inspecting records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Caption sentinel for posts the API returned without caption text.
pub const NO_CAPTION: &str = "[No caption]";

/// Caption sentinel for posts the platform reports as gone.
pub const POST_UNAVAILABLE: &str = "[Post no longer available]";

/// `source` value of a record that has not been enriched yet.
pub const SOURCE_ARCHIVE: &str = "archive";

/// `source` value after successful API enrichment.
pub const SOURCE_ENRICHED: &str = "archive+api";

/// `source` value after the platform returned not-found.
pub const SOURCE_DELETED: &str = "archive:deleted";

/// A saved post, keyed by its shortcode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    /// Shortcode, the primary key. Immutable once created.
    pub id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    #[serde(default)]
    pub post_url: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub saved_at: String,
    #[serde(default)]
    pub harvested_at: String,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub repost_count: u64,
    /// Enrichment state: `archive`, `archive+api`, or `archive:deleted`.
    /// Only ever advances forward.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub collections: Vec<String>,
    /// Numeric platform id as a string.
    #[serde(default)]
    pub media_pk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<ExtractedText>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub profile_url: String,
    #[serde(default)]
    pub headline: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaItem {
    /// CDN URL. Short TTL; re-fetch for fresh URLs before downloading late.
    #[serde(default)]
    pub url: String,
    /// `image` or `video`.
    #[serde(default)]
    pub media_type: String,
    /// Local file path once downloaded; empty until then.
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub alt_text: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Text mined from downloaded media.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedText {
    #[serde(default)]
    pub audio_transcripts: Vec<String>,
    /// Deduplicated across the whole post, highest confidence first.
    #[serde(default)]
    pub ocr_texts: Vec<String>,
    #[serde(default)]
    pub extracted_at: String,
    /// `complete`, `partial:no_audio`, or `partial:no_ocr`.
    #[serde(default)]
    pub extraction_status: String,
}

/// Sync progress for one platform + content-type combination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    pub platform: String,
    pub content_type: String,
    #[serde(default)]
    pub last_id: String,
    #[serde(default)]
    pub last_timestamp: String,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub last_sync_at: String,
    /// `success`, `partial`, or `error`.
    #[serde(default)]
    pub last_sync_status: String,
    #[serde(default)]
    pub error_message: String,
}

impl SyncCursor {
    #[must_use]
    pub fn new(platform: &str, content_type: &str) -> Self {
        Self {
            platform: platform.to_string(),
            content_type: content_type.to_string(),
            ..Self::default()
        }
    }

    /// Store key: `<platform>:<content_type>`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.platform, self.content_type)
    }

    pub fn mark_success(&mut self, total_items: u64, last_id: Option<&str>, last_timestamp: Option<&str>) {
        self.last_sync_at = now_iso();
        self.last_sync_status = "success".to_string();
        self.total_items = total_items;
        self.error_message.clear();
        if let Some(id) = last_id {
            self.last_id = id.to_string();
        }
        if let Some(ts) = last_timestamp {
            self.last_timestamp = ts.to_string();
        }
    }

    pub fn mark_error(&mut self, error: &str) {
        self.last_sync_at = now_iso();
        self.last_sync_status = "error".to_string();
        self.error_message = error.to_string();
    }

    pub fn mark_partial(&mut self, total_items: u64, error: &str) {
        self.last_sync_at = now_iso();
        self.last_sync_status = "partial".to_string();
        self.total_items = total_items;
        self.error_message = error.to_string();
    }
}

/// Typed view of a raw record's media array; malformed entries are dropped.
#[must_use]
pub fn media_entries(record: &serde_json::Map<String, serde_json::Value>) -> Vec<MediaItem> {
    record
        .get("media")
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Case-insensitive substring match against a raw record's collection names.
#[must_use]
pub fn in_collection(record: &serde_json::Map<String, serde_json::Value>, filter: &str) -> bool {
    let needle = filter.to_lowercase();
    record
        .get("collections")
        .and_then(serde_json::Value::as_array)
        .is_some_and(|cols| {
            cols.iter()
                .filter_map(serde_json::Value::as_str)
                .any(|name| name.to_lowercase().contains(&needle))
        })
}

/// Current UTC time as an ISO-8601 string, the archive's timestamp format.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Unix seconds to the archive's ISO-8601 format. Returns an empty string for
/// zero (the API's "no timestamp" value).
#[must_use]
pub fn unix_to_iso(secs: i64) -> String {
    if secs == 0 {
        return String::new();
    }
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
