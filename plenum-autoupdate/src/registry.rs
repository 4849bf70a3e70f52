//! Collection registry: the seam between the cache core and domain apps.
//!
//! Each domain collection registers a [`CollectionProvider`] before the
//! server accepts any connection. The core calls these adapters for two
//! things: enumerating current elements at cache rebuild, and filtering full
//! data down to what a given user may see. Adapters must be side-effect-free
//! and must not call back into the element cache.

use std::collections::BTreeMap;

use crate::cache::element::{Element, FullData};

/// A user as seen by restriction adapters.
///
/// Held by id only; consumers re-resolve permissions on every restriction
/// call, since permissions can change between messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: u64,
    pub anonymous: bool,
}

impl UserContext {
    pub fn authenticated(user_id: u64) -> Self {
        Self {
            user_id,
            anonymous: false,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: 0,
            anonymous: true,
        }
    }
}

/// Failure of one restriction adapter.
///
/// Partially restricted data is a security defect, so a failing adapter
/// fails the whole restriction pass for that user.
#[derive(Debug, Clone)]
pub struct AdapterError {
    pub collection: String,
    pub message: String,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Restriction adapter for '{}' failed: {}",
            self.collection, self.message
        )
    }
}

impl std::error::Error for AdapterError {}

/// Contract implemented by every domain collection.
///
/// `restrict_elements` defaults to the identity: collections whose
/// visibility is all-or-nothing only implement `check_permissions`.
pub trait CollectionProvider: Send + Sync {
    /// The namespaced collection string, e.g. `"agenda/item"`.
    fn collection(&self) -> &str;

    /// All current elements of this collection, used for cache rebuild.
    fn get_elements(&self) -> Vec<Element>;

    /// Coarse gate: may this user see this collection at all?
    fn check_permissions(&self, user: &UserContext) -> bool;

    /// Fine-grained row/field filtering. Receives full data of elements that
    /// passed the coarse gate; returns the subset (possibly with fields
    /// removed) the user may see. Dropped rows are invisible to the user.
    fn restrict_elements(
        &self,
        _user: &UserContext,
        elements: &[FullData],
    ) -> Result<Vec<FullData>, AdapterError> {
        Ok(elements.to_vec())
    }
}

/// Registry mapping collection strings to their providers.
///
/// Populated once at process startup; a `BTreeMap` keeps iteration order
/// stable so cache rebuilds are deterministic.
#[derive(Default)]
pub struct CollectionRegistry {
    providers: BTreeMap<String, Box<dyn CollectionProvider>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Registering the same collection twice is a
    /// startup wiring bug and is rejected.
    pub fn register(&mut self, provider: Box<dyn CollectionProvider>) -> Result<(), AdapterError> {
        let collection = provider.collection().to_string();
        if self.providers.contains_key(&collection) {
            return Err(AdapterError {
                collection,
                message: "collection registered twice".to_string(),
            });
        }
        self.providers.insert(collection, provider);
        Ok(())
    }

    pub fn get(&self, collection: &str) -> Option<&dyn CollectionProvider> {
        self.providers.get(collection).map(|b| b.as_ref())
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// All elements of all collections, in registration (collection) order.
    /// This is the cache rebuild source.
    pub fn startup_elements(&self) -> Vec<Element> {
        let mut elements = Vec::new();
        for provider in self.providers.values() {
            elements.extend(provider.get_elements());
        }
        elements
    }
}
