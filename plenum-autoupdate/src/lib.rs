//! # plenum-autoupdate — Real-time element cache and push server
//!
//! Keeps every connected client's view of the assembly data current: a
//! write-through element cache with a monotonic change-id log, per-user
//! restricted views, cross-worker fan-out and a websocket push protocol
//! with resumable catch-up.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  inform_changed_data  ┌──────────────┐
//! │ Domain apps  │ ─────────────────────►│ AutoupdateHub│
//! │ (save hooks) │                       └──────┬───────┘
//! └──────────────┘                              │
//!                          ┌────────────────────┼─────────────────┐
//!                          ▼                    ▼                 ▼
//!                  ┌──────────────┐     ┌──────────────┐  ┌──────────────┐
//!                  │ ElementCache │     │ FanoutBus    │  │ RedisFanout  │
//!                  │ (change log) │     │ (this worker)│  │ (all workers)│
//!                  └──────┬───────┘     └──────┬───────┘  └──────────────┘
//!                         │ restricted reads   │ notices
//!                         ▼                    ▼
//!                  ┌──────────────────────────────────┐
//!                  │ AutoupdateServer ── Consumer per  │
//!                  │ websocket connection              │
//!                  └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cache`] — Element cache, change log and pluggable providers
//! - [`registry`] — Per-collection data sources and permission adapters
//! - [`protocol`] — JSON wire protocol (envelope-framed messages)
//! - [`fanout`] — Change-notice broadcast, notify relay, redis bridge
//! - [`consumer`] — Per-connection session state machine
//! - [`hub`] — Write-side entry point for domain save/delete hooks
//! - [`server`] — WebSocket autoupdate server

pub mod cache;
pub mod registry;
pub mod protocol;
pub mod fanout;
pub mod consumer;
pub mod hub;
pub mod server;

// Re-exports for convenience
pub use cache::{
    AutoupdateError, AutoupdatePayload, CacheChange, CacheError, CacheProvider, Element,
    ElementCache, ElementId, FullData, MemoryCacheProvider, MemoryConfig, RedisCacheProvider,
    RedisConfig, RestrictedOutcome, SinceOutcome,
};
pub use consumer::{Consumer, ConsumerState, SessionAuth, TokenAuth, PROJECTOR_COLLECTION};
pub use fanout::{ChangeNotice, FanoutBus, FanoutStats, NotifyEnvelope, NotifyRelay, RedisFanout};
pub use hub::AutoupdateHub;
pub use protocol::{
    ClientEnvelope, ClientRequest, ProtocolError, ServerEnvelope, ServerMessage,
    ERROR_CHANGE_ID_TOO_HIGH, ERROR_INTERNAL, ERROR_NOT_AUTHORIZED, ERROR_WRONG_FORMAT,
};
pub use registry::{AdapterError, CollectionProvider, CollectionRegistry, UserContext};
pub use server::{AutoupdateServer, ServerConfig, ServerStats};
