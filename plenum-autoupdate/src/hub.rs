//! Write-side entry point: domain save/delete hooks feed the cache here.
//!
//! `inform_changed_data` / `inform_deleted_data` commit a batch through the
//! element cache (allocating one change id) and then notify every worker via
//! the fan-out. Writes succeed even when the cross-process notice cannot be
//! published; workers self-heal on the next notice, so a flaky redis only
//! delays pushes instead of failing domain saves.

use std::sync::Arc;

use crate::cache::element::{CacheChange, Element, ElementId};
use crate::cache::element_cache::ElementCache;
use crate::cache::provider::CacheError;
use crate::fanout::{FanoutBus, RedisFanout};

/// Shared handle bundling the cache and the fan-out.
pub struct AutoupdateHub {
    cache: Arc<ElementCache>,
    bus: Arc<FanoutBus>,
    redis_fanout: Option<Arc<RedisFanout>>,
}

impl AutoupdateHub {
    pub fn new(cache: Arc<ElementCache>, bus: Arc<FanoutBus>) -> Self {
        Self {
            cache,
            bus,
            redis_fanout: None,
        }
    }

    /// Enable cross-process notification for multi-worker deployments.
    pub fn with_redis_fanout(mut self, fanout: Arc<RedisFanout>) -> Self {
        self.redis_fanout = Some(fanout);
        self
    }

    pub fn cache(&self) -> &Arc<ElementCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    /// Called by domain model save hooks with changed/created instances.
    pub async fn inform_changed_data(&self, elements: Vec<Element>) -> Result<u64, CacheError> {
        self.inform_changes(CacheChange::with_changed(elements)).await
    }

    /// Called by domain model delete hooks.
    pub async fn inform_deleted_data(&self, ids: Vec<ElementId>) -> Result<u64, CacheError> {
        self.inform_changes(CacheChange::with_deleted(ids)).await
    }

    /// Commit a mixed batch and notify all workers.
    pub async fn inform_changes(&self, batch: CacheChange) -> Result<u64, CacheError> {
        let change_id = self.cache.change_elements(batch).await?;
        self.bus.publish(change_id);

        if let Some(fanout) = &self.redis_fanout {
            if let Err(e) = fanout.publish(change_id).await {
                // The write is committed; remote workers catch up on the
                // next successful notice.
                log::warn!("Cross-process notice for change id {change_id} failed: {e}");
            }
        }

        Ok(change_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheProvider;
    use crate::registry::{CollectionProvider, CollectionRegistry, UserContext};
    use serde_json::json;

    struct Items;

    impl CollectionProvider for Items {
        fn collection(&self) -> &str {
            "agenda/item"
        }
        fn get_elements(&self) -> Vec<Element> {
            vec![Element::from_value("agenda/item", 1, json!({ "id": 1 }))]
        }
        fn check_permissions(&self, _user: &UserContext) -> bool {
            true
        }
    }

    fn test_hub() -> AutoupdateHub {
        let mut registry = CollectionRegistry::new();
        registry.register(Box::new(Items)).unwrap();
        let cache = Arc::new(ElementCache::new(
            Box::new(MemoryCacheProvider::with_defaults()),
            Arc::new(registry),
        ));
        AutoupdateHub::new(cache, Arc::new(FanoutBus::new(16)))
    }

    #[tokio::test]
    async fn test_inform_changed_publishes_notice() {
        let hub = test_hub();
        hub.cache().ensure_cache(false).await.unwrap();
        let mut rx = hub.bus().subscribe();

        let id = hub
            .inform_changed_data(vec![Element::from_value(
                "agenda/item",
                2,
                json!({ "id": 2 }),
            )])
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().change_id, id);
    }

    #[tokio::test]
    async fn test_inform_deleted_publishes_notice() {
        let hub = test_hub();
        hub.cache().ensure_cache(false).await.unwrap();
        let mut rx = hub.bus().subscribe();

        let id = hub
            .inform_deleted_data(vec![ElementId::new("agenda/item", 1)])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().change_id, id);

        let data = hub.cache().get_all_data().await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_empty_inform_publishes_nothing() {
        let hub = test_hub();
        hub.cache().ensure_cache(false).await.unwrap();
        // Consume the rebuild's change id so the bus has seen it.
        hub.bus()
            .publish(hub.cache().get_current_change_id().await.unwrap());
        let before = hub.bus().stats().notices_published;

        hub.inform_changes(CacheChange::default()).await.unwrap();
        assert_eq!(hub.bus().stats().notices_published, before);
    }
}
