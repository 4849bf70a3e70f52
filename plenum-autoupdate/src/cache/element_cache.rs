//! Element cache: change id allocation, bootstrap and the restriction pass.
//!
//! The cache is the only component that assigns change ids (delegated to the
//! provider's atomic batch apply) and the primary read path for both full and
//! restricted data. Restriction applies the per-collection adapters from the
//! [`CollectionRegistry`]; an element the user may not see is either moved to
//! `deleted` (if the client might already hold it) or dropped entirely (if it
//! was never visible). The caller states which case applies via the explicit
//! `previously_visible` flag.
//!
//! [`CollectionRegistry`]: crate::registry::CollectionRegistry

use std::sync::Arc;
use std::time::Duration;

use crate::registry::{AdapterError, CollectionRegistry, UserContext};

use super::element::{CacheChange, Element, ElementId, FullData};
use super::provider::{CacheError, CacheProvider, SinceOutcome};

/// Errors surfaced by cache reads that cross the restriction pass.
#[derive(Debug, Clone)]
pub enum AutoupdateError {
    Cache(CacheError),
    Adapter(AdapterError),
}

impl std::fmt::Display for AutoupdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoupdateError::Cache(e) => write!(f, "{e}"),
            AutoupdateError::Adapter(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AutoupdateError {}

impl From<CacheError> for AutoupdateError {
    fn from(e: CacheError) -> Self {
        AutoupdateError::Cache(e)
    }
}

impl From<AdapterError> for AutoupdateError {
    fn from(e: AdapterError) -> Self {
        AutoupdateError::Adapter(e)
    }
}

/// Outcome of an incremental restricted read.
#[derive(Debug, Clone, PartialEq)]
pub enum RestrictedOutcome {
    Diff {
        changed: Vec<Element>,
        deleted: Vec<ElementId>,
        to_change_id: u64,
    },
    /// The requested baseline is below the retention floor; the caller must
    /// fall back to [`ElementCache::get_all_restricted_data`].
    TooOld,
}

/// The element cache.
///
/// Cheap to share: hold it in an `Arc` and clone the handle per connection.
pub struct ElementCache {
    provider: Box<dyn CacheProvider>,
    registry: Arc<CollectionRegistry>,
}

impl ElementCache {
    pub fn new(provider: Box<dyn CacheProvider>, registry: Arc<CollectionRegistry>) -> Self {
        Self { provider, registry }
    }

    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    /// Idempotent bootstrap: rebuild the cache from the registered
    /// collections if nobody has done so yet.
    ///
    /// Safe to call concurrently from multiple workers; the provider's init
    /// marker elects exactly one winner. Losers wait (bounded) until the
    /// winner's rebuild batch is visible, then proceed.
    pub async fn ensure_cache(&self, reset: bool) -> Result<(), CacheError> {
        if reset {
            self.provider.clear().await?;
        }

        if self.provider.try_init_marker().await? {
            let elements = self.registry.startup_elements();
            if elements.is_empty() {
                log::warn!("Cache rebuild found no startup elements");
                return Ok(());
            }
            let count = elements.len();
            let batch = CacheChange::with_changed(elements);
            let change_id = self.provider.apply_batch(&batch).await?;
            log::info!("Cache rebuilt: {count} elements at change id {change_id}");
            return Ok(());
        }

        // Lost the startup race: wait until the winner's batch is visible.
        for _ in 0..200 {
            let current = self.provider.current_change_id().await?;
            let lowest = self.provider.lowest_change_id().await?;
            if current > lowest {
                log::debug!("Cache already populated at change id {current}, skipping rebuild");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!("Cache rebuild by another worker did not become visible in time");
        Ok(())
    }

    /// The sole write path: commit a mutation batch under one new change id.
    ///
    /// Empty batches allocate nothing and return the current change id.
    pub async fn change_elements(&self, batch: CacheChange) -> Result<u64, CacheError> {
        if batch.is_empty() {
            log::debug!("Ignoring empty element batch");
            return self.provider.current_change_id().await;
        }
        let change_id = self.provider.apply_batch(&batch).await?;
        log::debug!(
            "Committed change id {change_id}: {} changed, {} deleted",
            batch.changed.len(),
            batch.deleted.len()
        );
        Ok(change_id)
    }

    pub async fn get_current_change_id(&self) -> Result<u64, CacheError> {
        self.provider.current_change_id().await
    }

    /// The unrestricted full snapshot.
    pub async fn get_all_data(&self) -> Result<Vec<Element>, CacheError> {
        self.provider.get_all_data().await
    }

    /// Unrestricted single-element lookup.
    pub async fn get_full_data(&self, id: &ElementId) -> Result<Option<FullData>, CacheError> {
        self.provider.get_full_data(id).await
    }

    /// Unrestricted diff since `from`, bounded by `to` when given.
    pub async fn get_data_since(
        &self,
        from: u64,
        to: Option<u64>,
    ) -> Result<SinceOutcome, CacheError> {
        self.provider.data_since(from, to).await
    }

    /// Full rebuild of what a user may currently see.
    ///
    /// Elements the user may not see are dropped (not reported as deleted):
    /// the client holds no prior state for them.
    pub async fn get_all_restricted_data(
        &self,
        user: &UserContext,
    ) -> Result<Vec<Element>, AutoupdateError> {
        let all = self.provider.get_all_data().await?;
        let (changed, _) = self.restrict(all, Vec::new(), user, false)?;
        Ok(changed)
    }

    /// Incremental restricted diff for one user.
    ///
    /// Elements the user may not see are reported as deleted: the client may
    /// hold them from before a permission change and needs an explicit
    /// removal signal.
    pub async fn get_restricted_data(
        &self,
        user: &UserContext,
        from: u64,
        to: Option<u64>,
    ) -> Result<RestrictedOutcome, AutoupdateError> {
        match self.provider.data_since(from, to).await? {
            SinceOutcome::TooOld => Ok(RestrictedOutcome::TooOld),
            SinceOutcome::Diff {
                changed,
                deleted,
                to_change_id,
            } => {
                let (changed, deleted) = self.restrict(changed, deleted, user, true)?;
                Ok(RestrictedOutcome::Diff {
                    changed,
                    deleted,
                    to_change_id,
                })
            }
        }
    }

    /// Apply the per-collection restriction adapters to a diff.
    ///
    /// `previously_visible` states whether the client might already hold the
    /// changed elements: if so, elements it may not see move to `deleted`;
    /// if not, they are silently dropped. Adapter failures fail the whole
    /// pass; partially restricted data is never returned.
    ///
    /// Restriction adapters identify rows by their `id` field; a returned
    /// row without one is dropped (and logged loudly, since that is an
    /// adapter bug).
    pub fn restrict(
        &self,
        changed: Vec<Element>,
        deleted: Vec<ElementId>,
        user: &UserContext,
        previously_visible: bool,
    ) -> Result<(Vec<Element>, Vec<ElementId>), AdapterError> {
        let mut visible: Vec<Element> = Vec::with_capacity(changed.len());
        let mut removed: Vec<ElementId> = deleted;

        // Group per collection so each adapter runs once per pass.
        let mut groups: Vec<(String, Vec<Element>)> = Vec::new();
        for element in changed {
            match groups.iter_mut().find(|(c, _)| *c == element.id.collection) {
                Some((_, group)) => group.push(element),
                None => groups.push((element.id.collection.clone(), vec![element])),
            }
        }

        for (collection, elements) in groups {
            let provider = match self.registry.get(&collection) {
                Some(p) => p,
                None => {
                    // Fail closed: data for unregistered collections is
                    // never forwarded.
                    log::warn!("No provider registered for collection '{collection}', dropping");
                    if previously_visible {
                        removed.extend(elements.into_iter().map(|e| e.id));
                    }
                    continue;
                }
            };

            if !provider.check_permissions(user) {
                if previously_visible {
                    removed.extend(elements.into_iter().map(|e| e.id));
                }
                continue;
            }

            let full_data: Vec<FullData> = elements.iter().map(|e| e.data.clone()).collect();
            let restricted = provider.restrict_elements(user, &full_data)?;

            let mut allowed_ids: Vec<u64> = Vec::with_capacity(restricted.len());
            let mut restricted_by_id: Vec<(u64, FullData)> = Vec::with_capacity(restricted.len());
            for row in restricted {
                match row.get("id").and_then(|v| v.as_u64()) {
                    Some(id) => {
                        allowed_ids.push(id);
                        restricted_by_id.push((id, row));
                    }
                    None => {
                        log::error!(
                            "Adapter for '{collection}' returned a row without an 'id' field"
                        );
                    }
                }
            }

            for element in elements {
                if let Some(pos) = restricted_by_id.iter().position(|(id, _)| *id == element.id.id)
                {
                    let (_, row) = restricted_by_id.swap_remove(pos);
                    visible.push(Element::new(element.id, row));
                } else if previously_visible {
                    removed.push(element.id);
                }
            }
        }

        Ok((visible, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{MemoryCacheProvider, MemoryConfig};
    use crate::registry::CollectionProvider;
    use serde_json::json;

    /// Collection visible to everyone.
    struct OpenCollection {
        elements: Vec<Element>,
    }

    impl CollectionProvider for OpenCollection {
        fn collection(&self) -> &str {
            "agenda/item"
        }
        fn get_elements(&self) -> Vec<Element> {
            self.elements.clone()
        }
        fn check_permissions(&self, _user: &UserContext) -> bool {
            true
        }
    }

    /// Collection visible only to user 1; user 1 additionally loses the
    /// `secret` field on every row.
    struct GuardedCollection {
        elements: Vec<Element>,
    }

    impl CollectionProvider for GuardedCollection {
        fn collection(&self) -> &str {
            "motions/motion"
        }
        fn get_elements(&self) -> Vec<Element> {
            self.elements.clone()
        }
        fn check_permissions(&self, user: &UserContext) -> bool {
            user.user_id == 1
        }
        fn restrict_elements(
            &self,
            _user: &UserContext,
            elements: &[FullData],
        ) -> Result<Vec<FullData>, AdapterError> {
            Ok(elements
                .iter()
                .map(|row| {
                    let mut row = row.clone();
                    row.remove("secret");
                    row
                })
                .collect())
        }
    }

    /// Adapter that always fails.
    struct BrokenCollection;

    impl CollectionProvider for BrokenCollection {
        fn collection(&self) -> &str {
            "broken/thing"
        }
        fn get_elements(&self) -> Vec<Element> {
            vec![Element::from_value("broken/thing", 1, json!({ "id": 1 }))]
        }
        fn check_permissions(&self, _user: &UserContext) -> bool {
            true
        }
        fn restrict_elements(
            &self,
            _user: &UserContext,
            _elements: &[FullData],
        ) -> Result<Vec<FullData>, AdapterError> {
            Err(AdapterError {
                collection: "broken/thing".to_string(),
                message: "permission lookup failed".to_string(),
            })
        }
    }

    fn element(collection: &str, id: u64) -> Element {
        Element::from_value(
            collection,
            id,
            json!({ "id": id, "name": format!("e{id}"), "secret": "hidden" }),
        )
    }

    fn test_cache() -> ElementCache {
        let mut registry = CollectionRegistry::new();
        registry
            .register(Box::new(OpenCollection {
                elements: vec![element("agenda/item", 1), element("agenda/item", 2)],
            }))
            .unwrap();
        registry
            .register(Box::new(GuardedCollection {
                elements: vec![element("motions/motion", 10)],
            }))
            .unwrap();
        ElementCache::new(
            Box::new(MemoryCacheProvider::new(MemoryConfig::default())),
            Arc::new(registry),
        )
    }

    #[tokio::test]
    async fn test_ensure_cache_builds_from_registry() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();

        let all = cache.get_all_data().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(cache.get_current_change_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ensure_cache_idempotent() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();
        let id_after_first = cache.get_current_change_id().await.unwrap();
        let data_after_first = cache.get_all_data().await.unwrap();

        cache.ensure_cache(false).await.unwrap();
        assert_eq!(cache.get_current_change_id().await.unwrap(), id_after_first);
        assert_eq!(cache.get_all_data().await.unwrap(), data_after_first);
    }

    #[tokio::test]
    async fn test_ensure_cache_reset_rebuilds() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();
        cache
            .change_elements(CacheChange::with_changed(vec![element("agenda/item", 99)]))
            .await
            .unwrap();

        cache.ensure_cache(true).await.unwrap();
        let all = cache.get_all_data().await.unwrap();
        // Back to the registry's three elements; the stray 99 is gone.
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|e| e.id.id != 99));
        // Change ids moved forward, never back.
        assert_eq!(cache.get_current_change_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_cache_single_rebuild() {
        let cache = Arc::new(test_cache());

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (r1, r2) = tokio::join!(c1.ensure_cache(false), c2.ensure_cache(false));
        r1.unwrap();
        r2.unwrap();

        // Exactly one rebuild happened.
        assert_eq!(cache.get_current_change_id().await.unwrap(), 1);
        assert_eq!(cache.get_all_data().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_full_permission_equals_unrestricted() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();

        // User 1 passes every gate; only the field filter applies.
        let user = UserContext::authenticated(1);
        let restricted = cache.get_all_restricted_data(&user).await.unwrap();
        let all = cache.get_all_data().await.unwrap();

        assert_eq!(restricted.len(), all.len());
        let ids: Vec<&ElementId> = restricted.iter().map(|e| &e.id).collect();
        for e in &all {
            assert!(ids.contains(&&e.id));
        }
    }

    #[tokio::test]
    async fn test_restriction_drops_never_visible_on_full_fetch() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();

        // User 2 fails the motions gate: full fetch simply omits them.
        let user = UserContext::authenticated(2);
        let restricted = cache.get_all_restricted_data(&user).await.unwrap();
        assert_eq!(restricted.len(), 2);
        assert!(restricted.iter().all(|e| e.id.collection == "agenda/item"));
    }

    #[tokio::test]
    async fn test_revoked_visibility_surfaces_as_deleted() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();
        let baseline = cache.get_current_change_id().await.unwrap();

        // The motion changes; user 2 may not see motions. On the
        // incremental path the element must appear in `deleted` so a client
        // that held it before a permission change removes it.
        cache
            .change_elements(CacheChange::with_changed(vec![element(
                "motions/motion",
                10,
            )]))
            .await
            .unwrap();

        let user = UserContext::authenticated(2);
        match cache
            .get_restricted_data(&user, baseline, None)
            .await
            .unwrap()
        {
            RestrictedOutcome::Diff {
                changed, deleted, ..
            } => {
                assert!(changed.is_empty());
                assert_eq!(deleted, vec![ElementId::new("motions/motion", 10)]);
            }
            RestrictedOutcome::TooOld => panic!("baseline is retained"),
        }
    }

    #[tokio::test]
    async fn test_field_filtering_applies() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();

        let user = UserContext::authenticated(1);
        let restricted = cache.get_all_restricted_data(&user).await.unwrap();
        let motion = restricted
            .iter()
            .find(|e| e.id.collection == "motions/motion")
            .unwrap();
        assert!(motion.data.get("secret").is_none(), "field must be stripped");
        assert!(motion.data.get("id").is_some());
    }

    #[tokio::test]
    async fn test_adapter_failure_fails_whole_pass() {
        let mut registry = CollectionRegistry::new();
        registry.register(Box::new(BrokenCollection)).unwrap();
        let cache = ElementCache::new(
            Box::new(MemoryCacheProvider::with_defaults()),
            Arc::new(registry),
        );
        cache.ensure_cache(false).await.unwrap();

        let user = UserContext::authenticated(1);
        let err = cache.get_all_restricted_data(&user).await.unwrap_err();
        match err {
            AutoupdateError::Adapter(e) => assert_eq!(e.collection, "broken/thing"),
            other => panic!("expected adapter error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_collection_fails_closed() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();
        let baseline = cache.get_current_change_id().await.unwrap();

        cache
            .change_elements(CacheChange::with_changed(vec![element("rogue/thing", 1)]))
            .await
            .unwrap();

        let user = UserContext::authenticated(1);
        match cache
            .get_restricted_data(&user, baseline, None)
            .await
            .unwrap()
        {
            RestrictedOutcome::Diff {
                changed, deleted, ..
            } => {
                assert!(changed.is_empty());
                // Incremental path: explicit removal signal.
                assert_eq!(deleted, vec![ElementId::new("rogue/thing", 1)]);
            }
            RestrictedOutcome::TooOld => panic!("baseline is retained"),
        }

        // Full fetch: silently dropped.
        let all = cache.get_all_restricted_data(&user).await.unwrap();
        assert!(all.iter().all(|e| e.id.collection != "rogue/thing"));
    }

    #[tokio::test]
    async fn test_too_old_propagates() {
        let mut registry = CollectionRegistry::new();
        registry
            .register(Box::new(OpenCollection {
                elements: vec![element("agenda/item", 1)],
            }))
            .unwrap();
        let cache = ElementCache::new(
            Box::new(MemoryCacheProvider::new(MemoryConfig::for_testing())),
            Arc::new(registry),
        );
        cache.ensure_cache(false).await.unwrap();

        for i in 0..10 {
            cache
                .change_elements(CacheChange::with_changed(vec![element("agenda/item", i)]))
                .await
                .unwrap();
        }

        let user = UserContext::authenticated(1);
        let outcome = cache.get_restricted_data(&user, 1, None).await.unwrap();
        assert_eq!(outcome, RestrictedOutcome::TooOld);
    }

    #[tokio::test]
    async fn test_get_full_data_single_lookup() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();

        let full = cache
            .get_full_data(&ElementId::new("agenda/item", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full["id"], json!(1));

        let missing = cache
            .get_full_data(&ElementId::new("agenda/item", 99))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_allocates_nothing() {
        let cache = test_cache();
        cache.ensure_cache(false).await.unwrap();
        let before = cache.get_current_change_id().await.unwrap();
        let id = cache.change_elements(CacheChange::default()).await.unwrap();
        assert_eq!(id, before);
        assert_eq!(cache.get_current_change_id().await.unwrap(), before);
    }
}
