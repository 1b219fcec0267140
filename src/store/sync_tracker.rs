//! Sync cursor persistence across platforms and content types.

use std::path::PathBuf;

use serde_json::{json, Value};

use super::{JsonMap, JsonStore, StoreError};
use crate::models::SyncCursor;

/// Manages sync cursors for all platform + content-type combinations.
///
/// The cursor store is a JSON array keyed by `"<platform>:<content_type>"`.
/// This is the only durable state outside the archive itself.
#[derive(Debug, Clone)]
pub struct SyncTracker {
    store: JsonStore,
}

impl SyncTracker {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path, "key"),
        }
    }

    /// Get the cursor for a platform + content type, blank if absent.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub fn get(&self, platform: &str, content_type: &str) -> Result<SyncCursor, StoreError> {
        let key = format!("{platform}:{content_type}");
        let mut filters = JsonMap::new();
        filters.insert("key".to_string(), json!(key));

        let items = self.store.find(&filters)?;
        if let Some(item) = items.into_iter().next() {
            if let Ok(cursor) = serde_json::from_value(Value::Object(item)) {
                return Ok(cursor);
            }
        }
        Ok(SyncCursor::new(platform, content_type))
    }

    /// Save a cursor, creating or updating by key.
    ///
    /// # Errors
    ///
    /// Propagates store read/write failures.
    pub fn save(&self, cursor: &SyncCursor) -> Result<(), StoreError> {
        let mut items = self.store.read()?;
        let key = cursor.key();

        let mut record = match serde_json::to_value(cursor) {
            Ok(Value::Object(map)) => map,
            _ => JsonMap::new(),
        };
        record.insert("key".to_string(), json!(key));

        match items
            .iter()
            .position(|item| item.get("key").and_then(Value::as_str) == Some(key.as_str()))
        {
            Some(idx) => items[idx] = record,
            None => items.push(record),
        }

        self.store.write(&items)
    }

    /// All cursors in the store.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub fn get_all(&self) -> Result<Vec<SyncCursor>, StoreError> {
        Ok(self
            .store
            .read()?
            .into_iter()
            .filter_map(|item| serde_json::from_value(Value::Object(item)).ok())
            .collect())
    }

    /// Human-readable sync status table.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub fn summary(&self) -> Result<String, StoreError> {
        let mut cursors = self.get_all()?;
        if cursors.is_empty() {
            return Ok("No sync history found.".to_string());
        }
        cursors.sort_by_key(SyncCursor::key);

        let mut lines = vec![
            "Platform         | Content    | Items | Last Sync            | Status".to_string(),
            "-".repeat(75),
        ];
        for c in cursors {
            let last_sync = if c.last_sync_at.is_empty() {
                "never"
            } else {
                &c.last_sync_at[..c.last_sync_at.len().min(19)]
            };
            lines.push(format!(
                "{:<16} | {:<10} | {:>5} | {:<20} | {}",
                c.platform, c.content_type, c.total_items, last_sync, c.last_sync_status
            ));
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_get_missing_is_blank() {
        let dir = TempDir::new().unwrap();
        let tracker = SyncTracker::new(dir.path().join("sync_state.json"));

        let cursor = tracker.get("instagram", "saved").unwrap();
        assert_eq!(cursor.platform, "instagram");
        assert_eq!(cursor.content_type, "saved");
        assert!(cursor.last_sync_status.is_empty());
    }

    #[test]
    fn test_save_roundtrip_and_upsert() {
        let dir = TempDir::new().unwrap();
        let tracker = SyncTracker::new(dir.path().join("sync_state.json"));

        let mut cursor = tracker.get("instagram", "saved").unwrap();
        cursor.mark_success(7, Some("XYZ"), None);
        tracker.save(&cursor).unwrap();

        let loaded = tracker.get("instagram", "saved").unwrap();
        assert_eq!(loaded.total_items, 7);
        assert_eq!(loaded.last_id, "XYZ");
        assert_eq!(loaded.last_sync_status, "success");

        // Saving again updates in place rather than duplicating.
        cursor.mark_error("boom");
        tracker.save(&cursor).unwrap();
        assert_eq!(tracker.get_all().unwrap().len(), 1);
        assert_eq!(
            tracker.get("instagram", "saved").unwrap().last_sync_status,
            "error"
        );
    }

    #[test]
    fn test_summary_lists_cursors() {
        let dir = TempDir::new().unwrap();
        let tracker = SyncTracker::new(dir.path().join("sync_state.json"));

        let mut a = tracker.get("instagram", "saved").unwrap();
        a.mark_success(3, None, None);
        tracker.save(&a).unwrap();
        let mut b = tracker.get("instagram", "enrichment").unwrap();
        b.mark_partial(1, "stopped early");
        tracker.save(&b).unwrap();

        let summary = tracker.summary().unwrap();
        assert!(summary.contains("saved"));
        assert!(summary.contains("enrichment"));
        assert!(summary.contains("success"));
        assert!(summary.contains("partial"));
    }

    #[test]
    fn test_summary_empty() {
        let dir = TempDir::new().unwrap();
        let tracker = SyncTracker::new(dir.path().join("sync_state.json"));
        assert_eq!(tracker.summary().unwrap(), "No sync history found.");
    }
}
