//! Scan history management and persistence
//!
//! The history is a bounded, most-recent-first list of [`HistoryItem`]s stored as
//! a single JSON document under one key of a [`KeyValueStore`]. Every mutation
//! writes the full list back before the in-memory copy is updated, while holding
//! the store's lock, so concurrent callers never interleave their
//! read-modify-write cycles and memory never runs ahead of storage.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content::ContentType;
use crate::storage::{KeyValueStore, StorageError};

/// Storage key holding the serialized history
pub const HISTORY_STORAGE_KEY: &str = "qrScanHistory";

/// Maximum number of items kept; older items are dropped on insert
pub const HISTORY_LIMIT: usize = 50;

/// History errors
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Backend failed to persist the list
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// List could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored list parsed but violates an invariant
    #[error("Invalid history data: {0}")]
    Invalid(String),
}

/// One recorded scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    /// Unique identifier
    pub id: String,
    /// Decoded payload
    pub data: String,
    /// Classification computed when the item was created
    pub content_type: ContentType,
    /// Creation time, epoch milliseconds
    pub timestamp: i64,
    /// Recorded while verification mode was active
    #[serde(default)]
    pub flagged: bool,
}

impl HistoryItem {
    fn new(data: String, content_type: ContentType, flagged: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data,
            content_type,
            timestamp: Utc::now().timestamp_millis(),
            flagged,
        }
    }

    fn matches(&self, needle_lower: &str) -> bool {
        self.data.to_lowercase().contains(needle_lower)
    }
}

/// Bounded, persisted scan history
pub struct HistoryStore {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    items: Mutex<Vec<HistoryItem>>,
}

impl HistoryStore {
    /// Load the history from the default key
    ///
    /// Never fails: unreadable or corrupted data yields an empty history, and a
    /// corrupted document is removed from storage.
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        Self::load_with_key(storage, HISTORY_STORAGE_KEY)
    }

    /// Load the history stored under a custom key
    pub fn load_with_key(storage: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let items = read_persisted(storage.as_ref(), &key);
        info!(
            backend = storage.name(),
            count = items.len(),
            "Loaded scan history"
        );

        Self {
            storage,
            key,
            items: Mutex::new(items),
        }
    }

    /// Re-read the persisted list, discarding the in-memory copy
    pub async fn reload(&self) {
        let mut items = self.items.lock().await;
        *items = read_persisted(self.storage.as_ref(), &self.key);
    }

    /// Record a new scan and return the created item
    pub async fn add(
        &self,
        data: impl Into<String>,
        content_type: ContentType,
        flagged: bool,
    ) -> Result<HistoryItem, HistoryError> {
        let item = HistoryItem::new(data.into(), content_type, flagged);
        let mut items = self.items.lock().await;

        let mut next = Vec::with_capacity(HISTORY_LIMIT);
        next.push(item.clone());
        next.extend(items.iter().take(HISTORY_LIMIT - 1).cloned());

        self.commit(&mut items, next)?;
        debug!(id = %item.id, content_type = %item.content_type, "Added scan to history");
        Ok(item)
    }

    /// Remove the item with `id`; returns whether an item was removed
    pub async fn delete(&self, id: &str) -> Result<bool, HistoryError> {
        let mut items = self.items.lock().await;
        let next: Vec<HistoryItem> = items.iter().filter(|item| item.id != id).cloned().collect();
        let removed = next.len() != items.len();

        self.commit(&mut items, next)?;
        if removed {
            debug!(id, "Deleted history item");
        }
        Ok(removed)
    }

    /// Remove every item
    pub async fn clear(&self) -> Result<(), HistoryError> {
        let mut items = self.items.lock().await;
        self.commit(&mut items, Vec::new())?;
        info!("Cleared scan history");
        Ok(())
    }

    /// Items whose payload contains `term`, ignoring case, in history order
    pub async fn search(&self, term: &str) -> Vec<HistoryItem> {
        let needle = term.to_lowercase();
        self.items
            .lock()
            .await
            .iter()
            .filter(|item| item.matches(&needle))
            .cloned()
            .collect()
    }

    /// Snapshot of the full history, most recent first
    pub async fn items(&self) -> Vec<HistoryItem> {
        self.items.lock().await.clone()
    }

    /// Look up a single item
    pub async fn get(&self, id: &str) -> Option<HistoryItem> {
        self.items
            .lock()
            .await
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Persist `next`, then make it the in-memory list
    fn commit(
        &self,
        items: &mut Vec<HistoryItem>,
        next: Vec<HistoryItem>,
    ) -> Result<(), HistoryError> {
        let serialized = serde_json::to_string(&next)?;
        self.storage.set(&self.key, &serialized)?;
        *items = next;
        Ok(())
    }
}

fn read_persisted(storage: &dyn KeyValueStore, key: &str) -> Vec<HistoryItem> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!("Failed to read scan history, starting empty: {}", e);
            return Vec::new();
        }
    };

    match decode_history(&raw) {
        Ok(items) => items,
        Err(e) => {
            warn!("Discarding corrupted scan history: {}", e);
            if let Err(e) = storage.remove(key) {
                warn!("Failed to remove corrupted scan history: {}", e);
            }
            Vec::new()
        }
    }
}

fn decode_history(raw: &str) -> Result<Vec<HistoryItem>, HistoryError> {
    let mut items: Vec<HistoryItem> = serde_json::from_str(raw)?;

    let mut seen = HashSet::with_capacity(items.len());
    for item in &items {
        if !seen.insert(item.id.as_str()) {
            return Err(HistoryError::Invalid(format!("duplicate id {}", item.id)));
        }
    }

    items.truncate(HISTORY_LIMIT);
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn memory() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new())
    }

    /// Store whose writes can be switched off
    struct FailingStore {
        inner: MemoryStore,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl KeyValueStore for FailingStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Backend("disk full".to_string()));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_add_prepends_and_persists() {
        let storage = memory();
        let history = HistoryStore::load(storage.clone());

        let first = history.add("first", ContentType::Text, false).await.unwrap();
        let second = history
            .add("https://example.com", ContentType::Url, true)
            .await
            .unwrap();

        let items = history.items().await;
        assert_eq!(items, vec![second.clone(), first.clone()]);
        assert!(second.flagged);
        assert_ne!(first.id, second.id);

        let persisted: Vec<HistoryItem> =
            serde_json::from_str(&storage.get(HISTORY_STORAGE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted, items);
    }

    #[tokio::test]
    async fn test_cap_drops_oldest() {
        let history = HistoryStore::load(memory());
        for i in 0..(HISTORY_LIMIT + 5) {
            history
                .add(format!("item {}", i), ContentType::Text, false)
                .await
                .unwrap();
        }

        let items = history.items().await;
        assert_eq!(items.len(), HISTORY_LIMIT);
        assert_eq!(items[0].data, format!("item {}", HISTORY_LIMIT + 4));
        assert_eq!(items[HISTORY_LIMIT - 1].data, "item 5");
    }

    #[tokio::test]
    async fn test_delete_missing_id_is_noop() {
        let history = HistoryStore::load(memory());
        history.add("keep me", ContentType::Text, false).await.unwrap();
        let before = history.items().await;

        let removed = history.delete("no-such-id").await.unwrap();
        assert!(!removed);
        assert_eq!(history.items().await, before);
    }

    #[tokio::test]
    async fn test_delete_removes_item() {
        let storage = memory();
        let history = HistoryStore::load(storage.clone());
        let a = history.add("a", ContentType::Text, false).await.unwrap();
        let b = history.add("b", ContentType::Text, false).await.unwrap();

        assert!(history.delete(&a.id).await.unwrap());
        assert_eq!(history.items().await, vec![b.clone()]);
        assert_eq!(history.get(&a.id).await, None);

        let reloaded = HistoryStore::load(storage);
        assert_eq!(reloaded.items().await, vec![b]);
    }

    #[tokio::test]
    async fn test_clear_then_reload_is_empty() {
        let storage = memory();
        let history = HistoryStore::load(storage.clone());
        history.add("one", ContentType::Text, false).await.unwrap();
        history.add("two", ContentType::Text, false).await.unwrap();

        history.clear().await.unwrap();
        assert!(history.is_empty().await);

        let reloaded = HistoryStore::load(storage.clone());
        assert!(reloaded.is_empty().await);
        assert_eq!(storage.get(HISTORY_STORAGE_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_reload_picks_up_external_changes() {
        let storage = memory();
        let history = HistoryStore::load(storage.clone());
        history.add("mine", ContentType::Text, false).await.unwrap();

        let other = HistoryStore::load(storage.clone());
        other.clear().await.unwrap();
        let theirs = other.add("tel:555", ContentType::Tel, false).await.unwrap();

        assert_eq!(history.len().await, 1);
        history.reload().await;
        assert_eq!(history.items().await, vec![theirs]);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_ordered() {
        let history = HistoryStore::load(memory());
        let a = history.add("Hello World", ContentType::Text, false).await.unwrap();
        history.add("goodbye", ContentType::Text, false).await.unwrap();
        let c = history.add("https://WORLD.example", ContentType::Url, false).await.unwrap();

        let results = history.search("world").await;
        assert_eq!(results, vec![c, a]);

        assert_eq!(history.search("").await, history.items().await);
        assert!(history.search("absent").await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_data_is_discarded() {
        let storage = memory();
        storage.set(HISTORY_STORAGE_KEY, "{not json").unwrap();

        let history = HistoryStore::load(storage.clone());
        assert!(history.is_empty().await);
        assert_eq!(storage.get(HISTORY_STORAGE_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_treated_as_corruption() {
        let storage = memory();
        let raw = r#"[
            {"id":"x","data":"a","contentType":"text","timestamp":1,"flagged":false},
            {"id":"x","data":"b","contentType":"text","timestamp":2,"flagged":false}
        ]"#;
        storage.set(HISTORY_STORAGE_KEY, raw).unwrap();

        let history = HistoryStore::load(storage.clone());
        assert!(history.is_empty().await);
        assert_eq!(storage.get(HISTORY_STORAGE_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_loads_items_without_flag_and_unknown_types() {
        let storage = memory();
        let raw = r#"[{"id":"x","data":"cert","contentType":"certificate","timestamp":1}]"#;
        storage.set(HISTORY_STORAGE_KEY, raw).unwrap();

        let history = HistoryStore::load(storage);
        let items = history.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content_type, ContentType::Unknown);
        assert!(!items[0].flagged);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let storage = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        });
        let history = HistoryStore::load(storage.clone());
        let kept = history.add("kept", ContentType::Text, false).await.unwrap();

        storage
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            history.add("lost", ContentType::Text, false).await,
            Err(HistoryError::Storage(_))
        ));
        assert!(history.clear().await.is_err());

        assert_eq!(history.items().await, vec![kept]);
    }

    #[tokio::test]
    async fn test_concurrent_adds_respect_cap() {
        let history = Arc::new(HistoryStore::load(memory()));
        let mut handles = Vec::new();
        for i in 0..80 {
            let history = Arc::clone(&history);
            handles.push(tokio::spawn(async move {
                history
                    .add(format!("burst {}", i), ContentType::Text, false)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let items = history.items().await;
        assert_eq!(items.len(), HISTORY_LIMIT);
        let unique: HashSet<_> = items.iter().map(|item| item.id.clone()).collect();
        assert_eq!(unique.len(), HISTORY_LIMIT);
    }

    proptest! {
        #[test]
        fn prop_length_bounded_and_most_recent_first(payloads in prop::collection::vec("[a-z]{0,8}", 0..120)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let history = HistoryStore::load(memory());
                for payload in &payloads {
                    history.add(payload.clone(), ContentType::Text, false).await.unwrap();
                }

                let items = history.items().await;
                let expected: Vec<&String> = payloads.iter().rev().take(HISTORY_LIMIT).collect();
                let actual: Vec<&String> = items.iter().map(|item| &item.data).collect();

                prop_assert!(items.len() <= HISTORY_LIMIT);
                prop_assert_eq!(actual, expected);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
