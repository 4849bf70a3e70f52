//! Cache provider abstraction: shared storage for full data and the change log.
//!
//! A provider stores three things:
//! - the full-data snapshot, keyed by `collection/id`
//! - an append-only change log keyed by change id
//! - the current and lowest known change id markers
//!
//! Two backends implement this seam: [`MemoryCacheProvider`] for a single
//! process and [`RedisCacheProvider`] for multi-worker deployments. Readers
//! must never observe a partially applied batch: all elements committed under
//! one change id become visible together.
//!
//! [`MemoryCacheProvider`]: super::memory::MemoryCacheProvider
//! [`RedisCacheProvider`]: super::redis::RedisCacheProvider

use async_trait::async_trait;

use super::element::{CacheChange, Element, ElementId, FullData};

/// Provider errors. Backend I/O failures are propagated, never swallowed.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Backend I/O error (redis connection, script failure, ...)
    Backend(String),
    /// Stored value could not be serialized or deserialized
    Serialization(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Backend(e) => write!(f, "Cache backend error: {e}"),
            CacheError::Serialization(e) => write!(f, "Cache serialization error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Outcome of a `data_since` query.
///
/// "Change id below the retention floor" is an expected, frequent condition
/// (a client reconnecting after a long gap), so it is a variant rather than
/// an error: callers fall back to a full snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SinceOutcome {
    /// The diff between `from` and `to_change_id`. Elements touched in the
    /// window carry their *current* full data; elements no longer present
    /// appear in `deleted`.
    Diff {
        changed: Vec<Element>,
        deleted: Vec<ElementId>,
        to_change_id: u64,
    },
    /// `from` is older than retained history; only a full fetch is valid.
    TooOld,
}

/// Shared storage seam for the element cache.
///
/// Implementations must guarantee batch atomicity: a reader either sees all
/// elements of a change id or none of them. Change ids are allocated inside
/// `apply_batch` so the counter and the log move under one serialization
/// point (one write lock, or one Lua script, depending on the backend).
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Current full data for one element, `None` if absent.
    async fn get_full_data(&self, id: &ElementId) -> Result<Option<FullData>, CacheError>;

    /// The entire full-data snapshot.
    async fn get_all_data(&self) -> Result<Vec<Element>, CacheError>;

    /// Atomically apply a mutation batch under a freshly allocated change id.
    ///
    /// Returns the assigned change id. Ids are strictly increasing and never
    /// reused, even across `clear()`.
    async fn apply_batch(&self, batch: &CacheChange) -> Result<u64, CacheError>;

    /// Everything that changed after `from`, bounded by `to` when given.
    ///
    /// `from` at or above the current change id yields an empty diff.
    async fn data_since(&self, from: u64, to: Option<u64>) -> Result<SinceOutcome, CacheError>;

    /// The highest committed change id (0 when nothing was ever committed).
    async fn current_change_id(&self) -> Result<u64, CacheError>;

    /// The retention floor: queries strictly below this yield `TooOld`.
    async fn lowest_change_id(&self) -> Result<u64, CacheError>;

    /// Wipe full data, the change log and the init marker.
    ///
    /// The change id counter survives so ids are never reused; the retention
    /// floor moves up to the counter so stale readers resync in full.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Startup-race guard: returns `true` for exactly one caller per cache
    /// lifetime. The winner performs the rebuild; losers skip it.
    async fn try_init_marker(&self) -> Result<bool, CacheError>;
}
