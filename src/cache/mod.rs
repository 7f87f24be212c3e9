//! Process-wide key/value cache with pluggable backing.
//!
//! When `[redis]` is configured the backing is the external store and state
//! survives restarts; otherwise an in-process substitute with identical
//! semantics is used and loss on restart is accepted. Keys are namespaced
//! `group.{token}.{purpose}` for relay-local state and `system.{purpose}`
//! for process-wide state.

mod dict;
mod queue;

pub use dict::CacheDict;
pub use queue::{CacheQueue, Durable};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("backing error: {0}")]
    Backing(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Raw byte-oriented key/value backing.
#[async_trait]
pub trait CacheBacking: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process substitute backing. Same semantics as the external store, but
/// contents are lost on restart.
#[derive(Default)]
pub struct MemoryBacking {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBacking for MemoryBacking {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let deadline = ttl.map(|t| Instant::now() + t);
        self.entries.lock().insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// External store backing.
pub struct RedisBacking {
    conn: redis::aio::ConnectionManager,
}

impl RedisBacking {
    pub async fn connect(
        host: &str,
        port: u16,
        db: i64,
        password: Option<&str>,
    ) -> Result<Self, CacheError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db,
                username: None,
                password: password.map(str::to_string),
                protocol: redis::ProtocolVersion::RESP2,
            },
        };
        let client =
            redis::Client::open(info).map_err(|e| CacheError::Backing(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backing(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBacking for RedisBacking {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| CacheError::Backing(e.to_string()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backing(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backing(e.to_string()))
    }
}

/// Namespaced handle over a shared backing. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    backing: Arc<dyn CacheBacking>,
    base: Option<String>,
}

impl Cache {
    pub fn new(backing: Arc<dyn CacheBacking>) -> Self {
        Self {
            backing,
            base: None,
        }
    }

    /// A handle whose keys are prefixed with `base.`.
    pub fn scoped(&self, base: &str) -> Cache {
        let base = match &self.base {
            Some(existing) => format!("{existing}.{base}"),
            None => base.to_string(),
        };
        Cache {
            backing: Arc::clone(&self.backing),
            base: Some(base),
        }
    }

    fn path(&self, key: &str) -> String {
        match &self.base {
            Some(base) if key.is_empty() => base.clone(),
            Some(base) => format!("{base}.{key}"),
            None => key.to_string(),
        }
    }

    /// Typed read. A stored value that fails to decode as `T` is an error;
    /// use [`Self::get_raw`] to read stored bytes as-is.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.backing.get(&self.path(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw read: stored bytes as-is.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.backing.get(&self.path(key)).await
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.backing.set(&self.path(key), bytes, ttl).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.backing.remove(&self.path(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_keys_nest() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let scoped = cache.scoped("group.tok").scoped("invite");
        scoped.set("code", &42u32, None).await.unwrap();

        // The flat path is visible from the root handle.
        let flat: Option<u32> = cache.get("group.tok.invite.code").await.unwrap();
        assert_eq!(flat, Some(42));
    }

    #[tokio::test]
    async fn memory_backing_honors_ttl() {
        let backing = MemoryBacking::new();
        backing
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(backing.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backing.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn typed_mismatch_is_an_error_but_raw_reads_pass() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        cache.set("k", &"text", None).await.unwrap();
        assert!(cache.get::<u64>("k").await.is_err());
        assert!(cache.get_raw("k").await.unwrap().is_some());
    }
}
