use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use crate::core::io::Storage;

/// Content-addressed store of parsed service answers, keyed by the exact
/// request. Failures are logged and otherwise ignored: a broken cache only
/// costs extra calls.
#[derive(Clone)]
pub struct ResponseCache {
    dir: String,
    storage: Arc<dyn Storage>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(dir: impl Into<String>, storage: Arc<dyn Storage>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            storage,
            enabled,
        }
    }

    pub fn disabled(storage: Arc<dyn Storage>) -> Self {
        Self::new(String::new(), storage, false)
    }

    pub fn key(namespace: &str, system: &str, user: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [namespace, system, user] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn path(&self, key: &str) -> String {
        Path::new(&self.dir)
            .join(format!("{}.json", key))
            .to_string_lossy()
            .to_string()
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        let path = self.path(key);
        match self.storage.exists(&path).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", path, e);
                return None;
            }
        }
        let bytes = match self.storage.read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache read failed for {}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!("Cache hit {}", key);
                Some(value)
            }
            Err(e) => {
                warn!("Dropping corrupt cache entry {}: {}", path, e);
                if let Err(e) = self.storage.delete(&path).await {
                    warn!("Failed to remove {}: {}", path, e);
                }
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: &serde_json::Value) {
        if !self.enabled {
            return;
        }
        let path = self.path(key);
        let content = match serde_json::to_vec_pretty(value) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cache encode failed for {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.storage.write(&path, &content).await {
            warn!("Cache write failed for {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use anyhow::Result;
    use serde_json::json;

    #[test]
    fn test_key_depends_on_every_part() {
        let base = ResponseCache::key("m", "sys", "user");
        assert_eq!(base, ResponseCache::key("m", "sys", "user"));
        assert_ne!(base, ResponseCache::key("m2", "sys", "user"));
        assert_ne!(base, ResponseCache::key("m", "sys2", "user"));
        assert_ne!(ResponseCache::key("ab", "c", ""), ResponseCache::key("a", "bc", ""));
        assert_eq!(base.len(), 64);
    }

    #[tokio::test]
    async fn test_round_trip_and_corrupt_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache_dir = dir.path().join("cache").to_string_lossy().to_string();
        let cache = ResponseCache::new(cache_dir.clone(), Arc::new(NativeStorage::new()), true);

        assert!(cache.get("k").await.is_none());
        cache.put("k", &json!({"summary": "ok"})).await;
        assert_eq!(cache.get("k").await, Some(json!({"summary": "ok"})));

        std::fs::write(Path::new(&cache_dir).join("bad.json"), "{not json")?;
        assert!(cache.get("bad").await.is_none());
        assert!(!Path::new(&cache_dir).join("bad.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() -> Result<()> {
        let cache = ResponseCache::disabled(Arc::new(NativeStorage::new()));
        cache.put("k", &json!({})).await;
        assert!(cache.get("k").await.is_none());
        Ok(())
    }
}
