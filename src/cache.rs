//! # Analysis Cache
//!
//! Memoizing key-value interface consumed from the cache collaborator.
//! Keys are a stable content identity of the item (scope), the computation
//! name (sub key), and a version that invalidates stale entries when an
//! analysis implementation changes.

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

/// Persistent backends implement raw get/put; the engine layers
/// [`memoized`] on top.
#[async_trait]
pub trait AnalysisCache: Send + Sync {
    async fn get(&self, scope: &str, sub: &str, version: u32) -> Option<serde_json::Value>;
    async fn put(&self, scope: &str, sub: &str, version: u32, value: serde_json::Value);
}

/// Look up `(scope, sub, version)` and fall back to `compute`, storing the
/// result. Cache (de)serialization failures are treated as misses rather
/// than surfaced: the cache is an optimization, not a source of truth.
pub async fn memoized<T, F, Fut>(
    cache: &dyn AnalysisCache,
    scope: &str,
    sub: &str,
    version: u32,
    compute: F,
) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if let Some(value) = cache.get(scope, sub, version).await {
        if let Ok(decoded) = serde_json::from_value(value) {
            return Ok(decoded);
        }
    }
    let computed = compute().await?;
    if let Ok(value) = serde_json::to_value(&computed) {
        cache.put(scope, sub, version, value).await;
    }
    Ok(computed)
}

/// In-memory cache, also the default when no persistent collaborator is
/// wired in.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, String, u32), serde_json::Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl AnalysisCache for MemoryCache {
    async fn get(&self, scope: &str, sub: &str, version: u32) -> Option<serde_json::Value> {
        self.entries
            .lock()
            .get(&(scope.to_string(), sub.to_string(), version))
            .cloned()
    }

    async fn put(&self, scope: &str, sub: &str, version: u32, value: serde_json::Value) {
        self.entries
            .lock()
            .insert((scope.to_string(), sub.to_string(), version), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn memoized_computes_once_per_key() {
        let cache = MemoryCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u32 = memoized(&cache, "digest-1", "phash", 1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A version bump invalidates the entry.
        let _: u32 = memoized(&cache, "digest-1", "phash", 2, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(8)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
