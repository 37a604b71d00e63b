//! Hybrid online/offline query resolution.
//!
//! - Answers a query from the live remote when reachable
//! - Falls back once to the local replica on any online failure
//! - Short-circuits both paths with a fresh cached result, per-type TTL
//! - Cache state is an injected storage instance, never a global

mod keys;
mod layer;
mod storage;
mod traits;

pub use keys::LifecycleQueryKey;
pub use layer::{HybridQuery, HybridResolver, OfflineSource, OnlineSource};
pub use storage::{CacheStorage, CachedEntry, MemoryStorage, NoopStorage};
pub use traits::{DataSource, DataType, HybridResult, QueryKey, StalenessPolicy};
