//! Lazily-loaded cache-backed value with explicit `save()`.
//!
//! Intended for hot per-relay state (mask tables, worker counters): the
//! holder keeps the working copy under its own lock and writes it back after
//! each mutation.

use super::{Cache, CacheError};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub struct CacheDict<T> {
    cache: Cache,
    key: String,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> CacheDict<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(cache: Cache, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Load the stored value, falling back to `T::default()` on a miss. A
    /// corrupt stored value is replaced by the default and logged.
    pub async fn load(&self) -> T {
        match self.cache.get::<T>(&self.key).await {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Cache value unreadable, using default");
                T::default()
            }
        }
    }

    /// Persist the working copy.
    pub async fn save(&self, value: &T) -> Result<(), CacheError> {
        self.cache.set(&self.key, value, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBacking;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn roundtrip_and_default() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let dict: CacheDict<HashMap<String, u32>> = CacheDict::new(cache.clone(), "t.dict");

        assert!(dict.load().await.is_empty());

        let mut value = HashMap::new();
        value.insert("a".to_string(), 1);
        dict.save(&value).await.unwrap();

        let reloaded = dict.load().await;
        assert_eq!(reloaded.get("a"), Some(&1));
    }
}
