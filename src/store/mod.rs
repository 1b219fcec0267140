//! Atomic JSON file storage with deduplication.
//!
//! Each store file holds a JSON array of objects, deduplicated on a
//! configurable key field. Writes go through a sibling temp file and a rename
//! so readers never observe a partially-written array.
//!
//! Concurrent writers are supported through [`JsonStore::patch_items`], which
//! re-reads the file under an exclusive advisory lock and merges only the
//! given fields. Two pipelines updating disjoint fields of the same records
//! can therefore run against one file without losing updates.

mod sync_tracker;

pub use sync_tracker::SyncTracker;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;
use thiserror::Error;

/// A raw archive record: one JSON object from the array.
pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is not a valid JSON array: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Merge function for [`JsonStore::append`]: `(existing, incoming) -> merged`.
pub type MergeFn<'a> = &'a dyn Fn(&JsonMap, &JsonMap) -> JsonMap;

/// Manages a JSON array file with atomic writes and key-based deduplication.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    key_field: String,
}

impl JsonStore {
    /// Create a store over `path`, deduplicating on `key_field`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, key_field: &str) -> Self {
        Self {
            path: path.into(),
            key_field: key_field.to_string(),
        }
    }

    /// Store over `path` keyed by `id`.
    #[must_use]
    pub fn with_default_key(path: impl Into<PathBuf>) -> Self {
        Self::new(path, "id")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all items. An absent or blank file reads as empty; invalid UTF-8
    /// bytes are replaced rather than failing the read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] if the file holds something other than
    /// a JSON array of objects.
    pub fn read(&self) -> Result<Vec<JsonMap>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let text = String::from_utf8_lossy(&bytes);
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&text).map_err(|e| StoreError::Decode {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Atomically overwrite the store with new items.
    ///
    /// The array is written pretty-printed to a sibling temp file and renamed
    /// over the target, so a concurrent reader sees either the old or the new
    /// contents, never a prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on any filesystem failure; the temp file is
    /// removed before the error surfaces.
    pub fn write(&self, items: &[JsonMap]) -> Result<(), StoreError> {
        let parent = self.parent_dir();
        std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".json_store_")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| self.io_err(e))?;

        serde_json::to_writer_pretty(&mut tmp, items).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e.into(),
        })?;
        tmp.write_all(b"\n").map_err(|e| self.io_err(e))?;
        tmp.flush().map_err(|e| self.io_err(e))?;

        // Rename over the target; NamedTempFile cleans itself up on failure.
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }

    /// Append items, skipping or merging those whose key already exists.
    ///
    /// With a `merge_fn`, an existing record is replaced by
    /// `merge_fn(existing, incoming)`; without one, duplicates are silently
    /// skipped. Returns the number of genuinely new items added.
    ///
    /// Not safe against concurrent [`patch_items`](Self::patch_items) calls;
    /// reserved for single-writer entry points.
    ///
    /// # Errors
    ///
    /// Propagates read and write failures.
    pub fn append(
        &self,
        new_items: &[JsonMap],
        merge_fn: Option<MergeFn<'_>>,
    ) -> Result<usize, StoreError> {
        let mut existing = self.read()?;
        let mut key_to_idx: BTreeMap<String, usize> = BTreeMap::new();
        for (i, item) in existing.iter().enumerate() {
            if let Some(key) = self.key_of(item) {
                key_to_idx.insert(key, i);
            }
        }

        let mut added = 0;
        for item in new_items {
            match self.key_of(item).and_then(|k| key_to_idx.get(&k).copied()) {
                Some(idx) => {
                    if let Some(merge) = merge_fn {
                        existing[idx] = merge(&existing[idx], item);
                    }
                }
                None => {
                    if let Some(key) = self.key_of(item) {
                        key_to_idx.insert(key, existing.len());
                    }
                    existing.push(item.clone());
                    added += 1;
                }
            }
        }

        self.write(&existing)?;
        Ok(added)
    }

    /// Atomically apply field-level updates to specific items.
    ///
    /// Takes an exclusive advisory lock on a sibling `.lock` file, re-reads
    /// the array, shallow-merges each patch into the record whose key
    /// matches, and writes the result back. Keys with no matching record are
    /// ignored. This is the only mutation path that is safe for concurrent
    /// writers updating disjoint fields.
    ///
    /// Returns the number of records actually patched.
    ///
    /// # Errors
    ///
    /// Propagates lock, read, and write failures.
    pub fn patch_items(
        &self,
        patches: &BTreeMap<String, JsonMap>,
    ) -> Result<usize, StoreError> {
        if patches.is_empty() {
            return Ok(0);
        }

        let parent = self.parent_dir();
        std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;

        let lock_path = self.path.with_extension("lock");
        let lock_file = File::create(&lock_path).map_err(|e| StoreError::Io {
            path: lock_path.clone(),
            source: e,
        })?;
        lock_file.lock_exclusive().map_err(|e| StoreError::Io {
            path: lock_path.clone(),
            source: e,
        })?;

        let result = self.patch_locked(patches);

        // Unlock before surfacing any error so a failed write never wedges
        // the other pipeline.
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn patch_locked(&self, patches: &BTreeMap<String, JsonMap>) -> Result<usize, StoreError> {
        let mut items = self.read()?;
        let mut key_to_idx: BTreeMap<String, usize> = BTreeMap::new();
        for (i, item) in items.iter().enumerate() {
            if let Some(key) = self.key_of(item) {
                key_to_idx.insert(key, i);
            }
        }

        let mut patched = 0;
        for (key, updates) in patches {
            if let Some(&idx) = key_to_idx.get(key) {
                for (field, value) in updates {
                    items[idx].insert(field.clone(), value.clone());
                }
                patched += 1;
            }
        }

        self.write(&items)?;
        Ok(patched)
    }

    /// Find items whose fields all equal the given values.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn find(&self, filters: &JsonMap) -> Result<Vec<JsonMap>, StoreError> {
        let items = self.read()?;
        Ok(items
            .into_iter()
            .filter(|item| {
                filters
                    .iter()
                    .all(|(k, v)| item.get(k).is_some_and(|actual| actual == v))
            })
            .collect())
    }

    /// Number of items in the store.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }

    /// Delete the item with the given key. Returns whether anything was
    /// removed.
    ///
    /// # Errors
    ///
    /// Propagates read and write failures.
    pub fn delete(&self, key_value: &str) -> Result<bool, StoreError> {
        let items = self.read()?;
        let filtered: Vec<JsonMap> = items
            .iter()
            .filter(|item| self.key_of(item).as_deref() != Some(key_value))
            .cloned()
            .collect();

        if filtered.len() < items.len() {
            self.write(&filtered)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn key_of(&self, item: &JsonMap) -> Option<String> {
        item.get(&self.key_field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn parent_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn record(id: &str, extra: &[(&str, Value)]) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("id".to_string(), json!(id));
        for (k, v) in extra {
            map.insert((*k).to_string(), v.clone());
        }
        map
    }

    fn store_in(dir: &TempDir) -> JsonStore {
        JsonStore::with_default_key(dir.path().join("items.json"))
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_read_blank_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "  \n").unwrap();
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_write_is_pretty_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.write(&[record("A", &[])]).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("  \"id\": \"A\""));
    }

    #[test]
    fn test_read_invalid_utf8_is_lossy() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        // "t\xffxt" inside a JSON string: invalid UTF-8 byte mid-value.
        std::fs::write(store.path(), b"[{\"id\": \"t\xffxt\"}]").unwrap();

        let items = store.read().unwrap();
        assert_eq!(items[0]["id"].as_str().unwrap(), "t\u{fffd}xt");
    }

    #[test]
    fn test_append_dedups_on_key() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let added = store
            .append(&[record("A", &[]), record("B", &[])], None)
            .unwrap();
        assert_eq!(added, 2);

        // Same key again: skipped, count unchanged.
        let added = store.append(&[record("A", &[])], None).unwrap();
        assert_eq!(added, 0);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_append_merge_fn_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .append(&[record("A", &[("n", json!(1))])], None)
            .unwrap();

        let merge: MergeFn<'_> = &|_existing, incoming| incoming.clone();
        let added = store
            .append(&[record("A", &[("n", json!(2))])], Some(merge))
            .unwrap();
        assert_eq!(added, 0);

        let items = store.read().unwrap();
        assert_eq!(items[0]["n"], json!(2));
    }

    #[test]
    fn test_patch_merges_fields_and_ignores_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .append(&[record("A", &[("text", json!("")), ("n", json!(1))])], None)
            .unwrap();

        let mut patches = BTreeMap::new();
        let mut patch = JsonMap::new();
        patch.insert("text".to_string(), json!("hello"));
        patches.insert("A".to_string(), patch);
        patches.insert("MISSING".to_string(), JsonMap::new());

        let patched = store.patch_items(&patches).unwrap();
        assert_eq!(patched, 1);

        let items = store.read().unwrap();
        assert_eq!(items[0]["text"], json!("hello"));
        // Untouched fields survive the patch.
        assert_eq!(items[0]["n"], json!(1));
    }

    #[test]
    fn test_patch_empty_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.patch_items(&BTreeMap::new()).unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_find_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .append(
                &[
                    record("A", &[("kind", json!("x"))]),
                    record("B", &[("kind", json!("y"))]),
                ],
                None,
            )
            .unwrap();

        let mut filters = JsonMap::new();
        filters.insert("kind".to_string(), json!("y"));
        let found = store.find(&filters).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!("B"));

        assert!(store.delete("A").unwrap());
        assert!(!store.delete("A").unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }
}
