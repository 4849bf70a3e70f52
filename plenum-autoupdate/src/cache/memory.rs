//! In-memory cache provider for single-process deployments.
//!
//! All state lives behind one `tokio::sync::RwLock`, so batch atomicity is
//! trivially satisfied: `apply_batch` holds the write lock for the whole
//! batch, and readers hold the read lock for the whole query. The change log
//! is a `BTreeMap` keyed by change id, pruned to a configurable number of
//! entries; pruning advances the retention floor.

use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use async_trait::async_trait;

use super::element::{CacheChange, Element, ElementId, FullData};
use super::provider::{CacheError, CacheProvider, SinceOutcome};

/// Memory provider configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum retained change log entries. Older entries are pruned and the
    /// retention floor advances past them.
    pub max_log_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_log_entries: 10_000,
        }
    }
}

impl MemoryConfig {
    /// Config for testing (tiny log so pruning paths are easy to hit).
    pub fn for_testing() -> Self {
        Self { max_log_entries: 4 }
    }
}

/// One change log entry: the element ids touched by a committed batch.
#[derive(Debug, Clone, Default)]
struct ChangeLogEntry {
    touched: Vec<ElementId>,
}

#[derive(Debug, Default)]
struct MemoryState {
    full: HashMap<ElementId, FullData>,
    log: BTreeMap<u64, ChangeLogEntry>,
    /// Next change id to allocate minus one (the last allocated id).
    current_change_id: u64,
    /// Highest pruned change id. Queries strictly below this are `TooOld`.
    lowest_change_id: u64,
    init_marker: bool,
}

/// In-memory [`CacheProvider`].
pub struct MemoryCacheProvider {
    config: MemoryConfig,
    state: RwLock<MemoryState>,
}

impl MemoryCacheProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl CacheProvider for MemoryCacheProvider {
    async fn get_full_data(&self, id: &ElementId) -> Result<Option<FullData>, CacheError> {
        let state = self.state.read().await;
        Ok(state.full.get(id).cloned())
    }

    async fn get_all_data(&self) -> Result<Vec<Element>, CacheError> {
        let state = self.state.read().await;
        let mut elements: Vec<Element> = state
            .full
            .iter()
            .map(|(id, data)| Element::new(id.clone(), data.clone()))
            .collect();
        // Stable order keeps full fetches deterministic for clients and tests.
        elements.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(elements)
    }

    async fn apply_batch(&self, batch: &CacheChange) -> Result<u64, CacheError> {
        let mut state = self.state.write().await;

        state.current_change_id += 1;
        let change_id = state.current_change_id;

        let mut touched = Vec::with_capacity(batch.changed.len() + batch.deleted.len());
        for element in &batch.changed {
            state
                .full
                .insert(element.id.clone(), element.data.clone());
            touched.push(element.id.clone());
        }
        for id in &batch.deleted {
            state.full.remove(id);
            touched.push(id.clone());
        }

        state.log.insert(change_id, ChangeLogEntry { touched });

        // Prune oldest entries past the retention limit.
        while state.log.len() > self.config.max_log_entries {
            if let Some((&oldest, _)) = state.log.iter().next() {
                state.log.remove(&oldest);
                state.lowest_change_id = oldest;
            }
        }

        Ok(change_id)
    }

    async fn data_since(&self, from: u64, to: Option<u64>) -> Result<SinceOutcome, CacheError> {
        let state = self.state.read().await;

        if from < state.lowest_change_id {
            return Ok(SinceOutcome::TooOld);
        }

        let upper = to
            .unwrap_or(state.current_change_id)
            .min(state.current_change_id);

        if upper <= from {
            // At or beyond the current change id: nothing to report.
            return Ok(SinceOutcome::Diff {
                changed: Vec::new(),
                deleted: Vec::new(),
                to_change_id: from,
            });
        }

        // Union of touched ids in (from, upper], classified by current
        // presence: still present -> changed, gone -> deleted.
        let mut seen: Vec<ElementId> = Vec::new();
        for (_, entry) in state.log.range(from + 1..=upper) {
            for id in &entry.touched {
                if !seen.contains(id) {
                    seen.push(id.clone());
                }
            }
        }

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for id in seen {
            match state.full.get(&id) {
                Some(data) => changed.push(Element::new(id, data.clone())),
                None => deleted.push(id),
            }
        }

        Ok(SinceOutcome::Diff {
            changed,
            deleted,
            to_change_id: upper,
        })
    }

    async fn current_change_id(&self) -> Result<u64, CacheError> {
        Ok(self.state.read().await.current_change_id)
    }

    async fn lowest_change_id(&self) -> Result<u64, CacheError> {
        Ok(self.state.read().await.lowest_change_id)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        state.full.clear();
        state.log.clear();
        // Counter survives so change ids are never reused; the floor moves
        // up so stale readers fall back to a full resync.
        state.lowest_change_id = state.current_change_id;
        state.init_marker = false;
        Ok(())
    }

    async fn try_init_marker(&self) -> Result<bool, CacheError> {
        let mut state = self.state.write().await;
        if state.init_marker {
            Ok(false)
        } else {
            state.init_marker = true;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn element(collection: &str, id: u64, name: &str) -> Element {
        Element::from_value(collection, id, json!({ "id": id, "name": name }))
    }

    fn diff(outcome: SinceOutcome) -> (Vec<Element>, Vec<ElementId>, u64) {
        match outcome {
            SinceOutcome::Diff {
                changed,
                deleted,
                to_change_id,
            } => (changed, deleted, to_change_id),
            SinceOutcome::TooOld => panic!("expected Diff, got TooOld"),
        }
    }

    #[tokio::test]
    async fn test_apply_and_read_back() {
        let provider = MemoryCacheProvider::with_defaults();
        let batch = CacheChange::with_changed(vec![element("agenda/item", 1, "a")]);

        let change_id = provider.apply_batch(&batch).await.unwrap();
        assert_eq!(change_id, 1);

        let data = provider
            .get_full_data(&ElementId::new("agenda/item", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.get("name").unwrap(), "a");
    }

    #[tokio::test]
    async fn test_change_ids_strictly_increasing() {
        let provider = MemoryCacheProvider::with_defaults();
        let mut last = 0;
        for i in 0..10 {
            let batch = CacheChange::with_changed(vec![element("a/b", i, "x")]);
            let id = provider.apply_batch(&batch).await.unwrap();
            assert!(id > last, "ids must strictly increase");
            assert_eq!(id, last + 1, "no gaps between allocated ids");
            last = id;
        }
        assert_eq!(provider.current_change_id().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_batch_visible_as_one() {
        let provider = MemoryCacheProvider::with_defaults();
        let batch = CacheChange::with_changed(vec![
            element("a/b", 1, "one"),
            element("a/b", 2, "two"),
        ]);
        let id = provider.apply_batch(&batch).await.unwrap();

        let (changed, deleted, to) = diff(provider.data_since(0, None).await.unwrap());
        assert_eq!(changed.len(), 2);
        assert!(deleted.is_empty());
        assert_eq!(to, id);
    }

    #[tokio::test]
    async fn test_data_since_at_current_is_empty() {
        let provider = MemoryCacheProvider::with_defaults();
        let batch = CacheChange::with_changed(vec![element("a/b", 1, "x")]);
        let id = provider.apply_batch(&batch).await.unwrap();

        let (changed, deleted, to) = diff(provider.data_since(id, None).await.unwrap());
        assert!(changed.is_empty());
        assert!(deleted.is_empty());
        assert_eq!(to, id);
    }

    #[tokio::test]
    async fn test_deleted_element_reported() {
        let provider = MemoryCacheProvider::with_defaults();
        provider
            .apply_batch(&CacheChange::with_changed(vec![element("a/b", 1, "x")]))
            .await
            .unwrap();
        let baseline = provider.current_change_id().await.unwrap();

        provider
            .apply_batch(&CacheChange::with_deleted(vec![ElementId::new("a/b", 1)]))
            .await
            .unwrap();

        let (changed, deleted, _) = diff(provider.data_since(baseline, None).await.unwrap());
        assert!(changed.is_empty());
        assert_eq!(deleted, vec![ElementId::new("a/b", 1)]);
    }

    #[tokio::test]
    async fn test_change_then_delete_in_window_is_deleted() {
        let provider = MemoryCacheProvider::with_defaults();
        provider
            .apply_batch(&CacheChange::with_changed(vec![element("a/b", 1, "x")]))
            .await
            .unwrap();
        provider
            .apply_batch(&CacheChange::with_deleted(vec![ElementId::new("a/b", 1)]))
            .await
            .unwrap();

        // From change id 0 the element was both changed and deleted; only
        // the delete may surface.
        let (changed, deleted, _) = diff(provider.data_since(0, None).await.unwrap());
        assert!(changed.is_empty());
        assert_eq!(deleted, vec![ElementId::new("a/b", 1)]);
    }

    #[tokio::test]
    async fn test_too_old_after_pruning() {
        let provider = MemoryCacheProvider::new(MemoryConfig::for_testing());
        for i in 0..10 {
            provider
                .apply_batch(&CacheChange::with_changed(vec![element("a/b", i, "x")]))
                .await
                .unwrap();
        }

        // max_log_entries = 4, so entries 1..=6 were pruned.
        assert_eq!(provider.lowest_change_id().await.unwrap(), 6);
        assert_eq!(provider.data_since(2, None).await.unwrap(), SinceOutcome::TooOld);

        // Exactly at the floor is still answerable.
        let (changed, _, _) = diff(provider.data_since(6, None).await.unwrap());
        assert_eq!(changed.len(), 4);
    }

    #[tokio::test]
    async fn test_bounded_window() {
        let provider = MemoryCacheProvider::with_defaults();
        for i in 1..=5 {
            provider
                .apply_batch(&CacheChange::with_changed(vec![element("a/b", i, "x")]))
                .await
                .unwrap();
        }

        let (changed, _, to) = diff(provider.data_since(1, Some(3)).await.unwrap());
        assert_eq!(to, 3);
        let ids: Vec<u64> = changed.iter().map(|e| e.id.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_diff_roundtrip_reproduces_snapshot() {
        let provider = MemoryCacheProvider::with_defaults();

        provider
            .apply_batch(&CacheChange::with_changed(vec![
                element("a/b", 1, "one"),
                element("a/b", 2, "two"),
            ]))
            .await
            .unwrap();
        let baseline = provider.current_change_id().await.unwrap();
        let mut local: HashMap<ElementId, FullData> = provider
            .get_all_data()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.id, e.data))
            .collect();

        // Mutate: update 1, delete 2, add 3.
        provider
            .apply_batch(&CacheChange {
                changed: vec![element("a/b", 1, "uno")],
                deleted: vec![ElementId::new("a/b", 2)],
            })
            .await
            .unwrap();
        provider
            .apply_batch(&CacheChange::with_changed(vec![element("a/b", 3, "three")]))
            .await
            .unwrap();

        // Apply the diff to the local snapshot.
        let (changed, deleted, _) = diff(provider.data_since(baseline, None).await.unwrap());
        for e in changed {
            local.insert(e.id, e.data);
        }
        for id in deleted {
            local.remove(&id);
        }

        let current: HashMap<ElementId, FullData> = provider
            .get_all_data()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.id, e.data))
            .collect();
        assert_eq!(local, current);
    }

    #[tokio::test]
    async fn test_clear_keeps_counter_and_moves_floor() {
        let provider = MemoryCacheProvider::with_defaults();
        for i in 0..3 {
            provider
                .apply_batch(&CacheChange::with_changed(vec![element("a/b", i, "x")]))
                .await
                .unwrap();
        }

        provider.clear().await.unwrap();
        assert!(provider.get_all_data().await.unwrap().is_empty());
        assert_eq!(provider.current_change_id().await.unwrap(), 3);
        assert_eq!(provider.lowest_change_id().await.unwrap(), 3);

        // Pre-clear baselines are no longer answerable.
        assert_eq!(provider.data_since(1, None).await.unwrap(), SinceOutcome::TooOld);

        // Ids continue, never reused.
        let id = provider
            .apply_batch(&CacheChange::with_changed(vec![element("a/b", 9, "x")]))
            .await
            .unwrap();
        assert_eq!(id, 4);
    }

    #[tokio::test]
    async fn test_init_marker_single_winner() {
        let provider = MemoryCacheProvider::with_defaults();
        assert!(provider.try_init_marker().await.unwrap());
        assert!(!provider.try_init_marker().await.unwrap());

        // clear() resets the marker for a fresh rebuild.
        provider.clear().await.unwrap();
        assert!(provider.try_init_marker().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_batches() {
        let provider = Arc::new(MemoryCacheProvider::with_defaults());

        let p1 = provider.clone();
        let t1 = tokio::spawn(async move {
            p1.apply_batch(&CacheChange::with_changed(vec![element("a/b", 1, "one")]))
                .await
                .unwrap()
        });
        let p2 = provider.clone();
        let t2 = tokio::spawn(async move {
            p2.apply_batch(&CacheChange::with_changed(vec![element("c/d", 2, "two")]))
                .await
                .unwrap()
        });

        let id1 = t1.await.unwrap();
        let id2 = t2.await.unwrap();
        assert_ne!(id1, id2, "concurrent batches get distinct change ids");

        let (changed, _, _) = diff(provider.data_since(0, None).await.unwrap());
        assert_eq!(changed.len(), 2, "a third reader sees both batches");
    }
}
