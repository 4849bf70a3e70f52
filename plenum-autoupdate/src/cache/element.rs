//! Element identity and full-data representation.
//!
//! Every domain object the cache tracks is addressed by an [`ElementId`]:
//! a namespaced collection string plus a numeric id, rendered as
//! `"agenda/item/42"` in cache-key form. The serialized object itself is a
//! [`FullData`] map of field name to JSON value, unfiltered by permissions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Full serialized representation of one element, unfiltered by permissions.
pub type FullData = serde_json::Map<String, Value>;

/// Identity of a cached element: collection string + numeric id.
///
/// Collection strings are namespaced type tags such as `"agenda/item"` or
/// `"motions/motion"`. The numeric id is the domain object's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    pub collection: String,
    pub id: u64,
}

impl ElementId {
    pub fn new(collection: impl Into<String>, id: u64) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }

    /// Cache-key form: `"collection/id"`.
    ///
    /// Collection strings may themselves contain slashes, so parsing splits
    /// on the *last* slash.
    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }

    /// Parse the cache-key form produced by [`cache_key`](Self::cache_key).
    pub fn parse_cache_key(key: &str) -> Option<Self> {
        let (collection, id) = key.rsplit_once('/')?;
        if collection.is_empty() {
            return None;
        }
        let id = id.parse().ok()?;
        Some(Self::new(collection, id))
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// One element: identity plus full data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub data: FullData,
}

impl Element {
    pub fn new(id: ElementId, data: FullData) -> Self {
        Self { id, data }
    }

    /// Build an element from a collection string, id and a JSON object.
    ///
    /// Non-object values are wrapped under a `"value"` key so callers can
    /// hand in any JSON without the cache panicking on shape.
    pub fn from_value(collection: impl Into<String>, id: u64, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = FullData::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(ElementId::new(collection, id), data)
    }
}

/// A batch of element mutations committed under one change id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheChange {
    pub changed: Vec<Element>,
    pub deleted: Vec<ElementId>,
}

impl CacheChange {
    pub fn with_changed(changed: Vec<Element>) -> Self {
        Self {
            changed,
            deleted: Vec::new(),
        }
    }

    pub fn with_deleted(deleted: Vec<ElementId>) -> Self {
        Self {
            changed: Vec::new(),
            deleted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// The payload of a server `autoupdate` message.
///
/// Changed elements are grouped per collection (the shape clients apply to
/// their local stores); deleted elements are id lists per collection.
/// `all_data: true` tells the client to discard its local state and replace
/// it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoupdatePayload {
    pub changed: BTreeMap<String, Vec<FullData>>,
    pub deleted: BTreeMap<String, Vec<u64>>,
    pub from_change_id: u64,
    pub to_change_id: u64,
    pub all_data: bool,
}

impl AutoupdatePayload {
    /// Group a flat diff into the per-collection wire shape.
    pub fn from_diff(
        changed: Vec<Element>,
        deleted: Vec<ElementId>,
        from_change_id: u64,
        to_change_id: u64,
        all_data: bool,
    ) -> Self {
        let mut changed_map: BTreeMap<String, Vec<FullData>> = BTreeMap::new();
        for element in changed {
            changed_map
                .entry(element.id.collection)
                .or_default()
                .push(element.data);
        }

        let mut deleted_map: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for id in deleted {
            deleted_map.entry(id.collection).or_default().push(id.id);
        }

        Self {
            changed: changed_map,
            deleted: deleted_map,
            from_change_id,
            to_change_id,
            all_data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}
