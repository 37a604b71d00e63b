//! Resolver that orchestrates caching with online and offline sources.

use chrono::Utc;
use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedEntry};
use super::traits::{DataSource, DataType, HybridResult, QueryKey, StalenessPolicy};
use crate::error::LifecycleError;
use crate::network::Reachability;

/// Fetch against the live authoritative store.
pub struct OnlineSource<'a, T> {
  fetch: Box<dyn FnOnce() -> BoxFuture<'a, Result<T, LifecycleError>> + Send + 'a>,
}

impl<'a, T> OnlineSource<'a, T> {
  pub fn new<F, Fut>(fetch: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'a,
    Fut: Future<Output = Result<T, LifecycleError>> + Send + 'a,
  {
    Self {
      fetch: Box::new(move || fetch().boxed()),
    }
  }
}

/// Query against the device-local replica.
pub struct OfflineSource<'a, T> {
  query: Box<dyn FnOnce() -> Result<T> + Send + 'a>,
}

impl<'a, T> OfflineSource<'a, T> {
  pub fn new<F>(query: F) -> Self
  where
    F: FnOnce() -> Result<T> + Send + 'a,
  {
    Self {
      query: Box::new(query),
    }
  }
}

/// A query descriptor: the key plus whichever sources are enabled.
///
/// A missing source is a disabled path.
pub struct HybridQuery<'a, K, T> {
  key: K,
  online: Option<OnlineSource<'a, T>>,
  offline: Option<OfflineSource<'a, T>>,
}

impl<'a, K: QueryKey, T> HybridQuery<'a, K, T> {
  pub fn new(key: K) -> Self {
    Self {
      key,
      online: None,
      offline: None,
    }
  }

  pub fn online<F, Fut>(mut self, fetch: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'a,
    Fut: Future<Output = Result<T, LifecycleError>> + Send + 'a,
  {
    self.online = Some(OnlineSource::new(fetch));
    self
  }

  pub fn offline<F>(mut self, query: F) -> Self
  where
    F: FnOnce() -> Result<T> + Send + 'a,
  {
    self.offline = Some(OfflineSource::new(query));
    self
  }
}

/// Hybrid resolver with a keyed, TTL-bounded cache.
///
/// 1. Fresh cache entry: return it, no source is touched
/// 2. Reachable and online enabled: fetch once
/// 3. Online failure or unreachable: query the local replica
/// 4. Offline failure is returned to the caller
#[derive(Clone)]
pub struct HybridResolver {
  storage: Arc<dyn CacheStorage>,
  reachability: Arc<dyn Reachability>,
  policy: StalenessPolicy,
}

impl HybridResolver {
  pub fn new(storage: Arc<dyn CacheStorage>, reachability: Arc<dyn Reachability>) -> Self {
    Self {
      storage,
      reachability,
      policy: StalenessPolicy::default(),
    }
  }

  pub fn with_policy(mut self, policy: StalenessPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn policy(&self) -> &StalenessPolicy {
    &self.policy
  }

  pub async fn resolve<K, T>(&self, query: HybridQuery<'_, K, T>) -> Result<HybridResult<T>>
  where
    K: QueryKey,
    T: Serialize + DeserializeOwned,
  {
    let HybridQuery {
      key,
      online,
      offline,
    } = query;
    let data_type = key.data_type();
    let hash = key.cache_hash();

    if let Some(hit) = self.fresh_entry::<T>(&hash, data_type) {
      debug!(query = %key.description(), source = hit.source.as_str(), "Serving cached result");
      return Ok(hit);
    }

    if let Some(online) = online {
      if self.reachability.is_online().await {
        match (online.fetch)().await {
          Ok(data) => {
            self.store(&hash, data_type, DataSource::Cloud, &data);
            return Ok(HybridResult::from_cloud(data));
          }
          Err(e) if offline.is_some() => {
            warn!(query = %key.description(), error = %e, "Online fetch failed, falling back to local");
          }
          Err(e) => return Err(e.into()),
        }
      } else if offline.is_none() {
        return Err(LifecycleError::Network("remote unreachable and offline path disabled".to_string()).into());
      }
    }

    let Some(offline) = offline else {
      return Err(LifecycleError::Network("no enabled source for query".to_string()).into());
    };

    match (offline.query)() {
      Ok(data) => {
        self.store(&hash, data_type, DataSource::Local, &data);
        Ok(HybridResult::from_local(data))
      }
      Err(e) => Err(LifecycleError::OfflineQuery(format!("{:#}", e)).into()),
    }
  }

  /// Drop the cached result of one query.
  pub fn invalidate(&self, key: &dyn QueryKey) -> Result<()> {
    self.storage.invalidate(&key.cache_hash())
  }

  /// Drop every cached result of a data type.
  pub fn invalidate_data_type(&self, data_type: DataType) -> Result<()> {
    self.storage.invalidate_data_type(data_type)
  }

  pub fn reset(&self) -> Result<()> {
    self.storage.reset()
  }

  fn fresh_entry<T: DeserializeOwned>(&self, hash: &str, data_type: DataType) -> Option<HybridResult<T>> {
    let entry = match self.storage.get(hash) {
      Ok(entry) => entry?,
      Err(e) => {
        warn!(error = %e, "Cache read failed");
        return None;
      }
    };

    if !self.policy.is_fresh(data_type, entry.cached_at) {
      return None;
    }

    match serde_json::from_value(entry.value) {
      Ok(data) => Some(HybridResult::from_cache(data, entry.source, entry.cached_at)),
      Err(e) => {
        // Shape changed since caching, treat as a miss
        debug!(error = %e, "Discarding undecodable cache entry");
        None
      }
    }
  }

  fn store<T: Serialize>(&self, hash: &str, data_type: DataType, source: DataSource, data: &T) {
    let value = match serde_json::to_value(data) {
      Ok(value) => value,
      Err(e) => {
        warn!(error = %e, "Failed to serialize result for cache");
        return;
      }
    };

    let entry = CachedEntry {
      value,
      source,
      data_type,
      cached_at: Utc::now(),
    };
    if let Err(e) = self.storage.put(hash, entry) {
      warn!(error = %e, "Cache write failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::keys::LifecycleQueryKey;
  use crate::cache::storage::{MemoryStorage, NoopStorage};
  use crate::network::StaticReachability;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn resolver(online: bool) -> HybridResolver {
    HybridResolver::new(
      Arc::new(MemoryStorage::new()),
      Arc::new(StaticReachability::new(online)),
    )
  }

  fn key(name: &str) -> LifecycleQueryKey {
    LifecycleQueryKey::custom(DataType::ProjectList, name)
  }

  #[tokio::test]
  async fn test_online_result_is_tagged_cloud() {
    let resolver = resolver(true);
    let result = resolver
      .resolve(
        HybridQuery::new(key("a"))
          .online(|| async { Ok(vec![1, 2]) })
          .offline(|| Ok(vec![9])),
      )
      .await
      .unwrap();
    assert_eq!(result.data, vec![1, 2]);
    assert_eq!(result.source, DataSource::Cloud);
    assert!(!result.is_cached());
  }

  #[tokio::test]
  async fn test_online_failure_falls_back_exactly_once() {
    let resolver = resolver(true);
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let result = resolver
      .resolve(
        HybridQuery::new(key("a"))
          .online(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Vec<i32>, _>(LifecycleError::Network("timeout".into()))
          })
          .offline(|| Ok(vec![9])),
      )
      .await
      .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(result.data, vec![9]);
    assert_eq!(result.source, DataSource::Local);
  }

  #[tokio::test]
  async fn test_unreachable_skips_online() {
    let resolver = resolver(false);
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let result = resolver
      .resolve(
        HybridQuery::new(key("a"))
          .online(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
          })
          .offline(|| Ok(3)),
      )
      .await
      .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert_eq!(result.data, 3);
    assert_eq!(result.source, DataSource::Local);
  }

  #[tokio::test]
  async fn test_offline_failure_is_fatal() {
    let resolver = resolver(false);
    let err = resolver
      .resolve(HybridQuery::<_, i32>::new(key("a")).offline(|| Err(eyre!("no such table"))))
      .await
      .unwrap_err();
    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::OfflineQuery(_))
    ));
  }

  #[tokio::test]
  async fn test_online_failure_without_offline_path_is_network_error() {
    let resolver = resolver(true);
    let err = resolver
      .resolve(
        HybridQuery::<_, i32>::new(key("a"))
          .online(|| async { Err(LifecycleError::Network("502".into())) }),
      )
      .await
      .unwrap_err();
    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::Network(_))
    ));
  }

  #[tokio::test]
  async fn test_fresh_cache_short_circuits_both_paths() {
    let resolver = resolver(true);
    resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(1) }))
      .await
      .unwrap();

    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let cached = resolver
      .resolve(
        HybridQuery::new(key("a"))
          .online(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(2)
          })
          .offline(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(3)
          }),
      )
      .await
      .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert_eq!(cached.data, 1);
    assert!(cached.is_cached());
    assert_eq!(cached.source, DataSource::Cloud);
  }

  #[tokio::test]
  async fn test_stale_entry_is_refetched() {
    let policy = StalenessPolicy::default().with_window(DataType::ProjectList, Duration::ZERO);
    let resolver = resolver(true).with_policy(policy);
    resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(1) }))
      .await
      .unwrap();

    let result = resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(2) }))
      .await
      .unwrap();
    assert_eq!(result.data, 2);
    assert!(!result.is_cached());
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let resolver = resolver(true);
    resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(1) }))
      .await
      .unwrap();
    resolver.invalidate(&key("a")).unwrap();

    let result = resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(2) }))
      .await
      .unwrap();
    assert_eq!(result.data, 2);
  }

  #[tokio::test]
  async fn test_noop_storage_never_caches() {
    let resolver = HybridResolver::new(Arc::new(NoopStorage), Arc::new(StaticReachability::new(true)));
    resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(1) }))
      .await
      .unwrap();
    let result = resolver
      .resolve(HybridQuery::new(key("a")).online(|| async { Ok(2) }))
      .await
      .unwrap();
    assert_eq!(result.data, 2);
  }
}
