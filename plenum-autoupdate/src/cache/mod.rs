//! Element cache: the canonical full-data snapshot and change log.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   change_elements   ┌───────────────┐
//! │ Domain apps  │ ──────────────────► │ ElementCache  │
//! │ (save hooks) │                     │ (orchestrator)│
//! └──────────────┘                     └──────┬────────┘
//!                                             │ CacheProvider seam
//!                                 ┌───────────┴───────────┐
//!                                 ▼                       ▼
//!                        ┌───────────────┐       ┌───────────────┐
//!                        │ Memory        │       │ Redis         │
//!                        │ (one process) │       │ (many workers)│
//!                        └───────────────┘       └───────────────┘
//! ```
//!
//! The cache owns the only write path that allocates change ids. Reads come
//! in two flavors: unrestricted (`get_all_data`, `get_data_since`) for
//! internal use, and restricted (`get_all_restricted_data`,
//! `get_restricted_data`) which run the per-collection permission adapters.

pub mod element;
pub mod element_cache;
pub mod memory;
pub mod provider;
pub mod redis;

pub use element::{AutoupdatePayload, CacheChange, Element, ElementId, FullData};
pub use element_cache::{AutoupdateError, ElementCache, RestrictedOutcome};
pub use memory::{MemoryCacheProvider, MemoryConfig};
pub use provider::{CacheError, CacheProvider, SinceOutcome};
pub use redis::{RedisCacheProvider, RedisConfig};
