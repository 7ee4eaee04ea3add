//! Read-through cache in front of derived views.
//!
//! Failures here are never fatal: undecodable entries are dropped and read as
//! misses, and values that fail to encode are simply not stored.

pub mod memory;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;

pub use memory::MemoryCache;

/// Tag carried by every listing entry.
pub const NOVEL_LIST_TAG: &str = "novel-list";

/// Tag carried by recommendation results.
pub const RECOMMEND_TAG: &str = "recommend";

pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;
    fn set(&self, key: &str, value: Bytes, ttl: Duration, tags: &[String]);
    fn remove(&self, key: &str);
    /// Remove every entry carrying `tag`, returning how many were removed.
    fn invalidate_tag(&self, tag: &str) -> usize;
    fn purge_expired(&self) -> usize;
    fn len(&self) -> usize;
}

pub fn novel_tag(novel_id: i64) -> String {
    format!("novel:{}", novel_id)
}

pub fn novel_info_key(novel_id: i64) -> String {
    format!("novel:info:{}", novel_id)
}

pub fn novel_list_key(fingerprint: &str) -> String {
    format!("novel:list:{}", fingerprint)
}

pub fn rankings_key(kind: &str, category_id: Option<i64>, limit: u32) -> String {
    match category_id {
        Some(category) => format!("novel:rankings:{}:{}:{}", kind, category, limit),
        None => format!("novel:rankings:{}:all:{}", kind, limit),
    }
}

pub fn hot_keywords_key(limit: u32) -> String {
    format!("search:hot:{}", limit)
}

pub fn novel_chapters_key(novel_id: i64) -> String {
    format!("novel:chapters:{}", novel_id)
}

pub fn chapter_key(chapter_id: i64) -> String {
    format!("chapter:{}", chapter_id)
}

pub fn novel_content_key(novel_id: i64) -> String {
    format!("novel:content:{}", novel_id)
}

/// Stable short hash over already-normalized query parameters.
pub fn fingerprint(parts: &[(&str, String)]) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in parts {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    hex::encode(&hasher.finalize()[..12])
}

/// Typed facade over a [`CacheBackend`].
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn memory(max_entries: usize) -> Self {
        Self::new(Arc::new(MemoryCache::new(max_entries)))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.backend.get(key)?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(key, error = %e, "dropping undecodable cache entry");
                self.backend.remove(key);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, tags: &[String]) {
        match serde_json::to_vec(value) {
            Ok(raw) => self.backend.set(key, Bytes::from(raw), ttl, tags),
            Err(e) => tracing::debug!(key, error = %e, "value not cached"),
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<Bytes> {
        self.backend.get(key)
    }

    pub fn set_bytes(&self, key: &str, value: Bytes, ttl: Duration, tags: &[String]) {
        self.backend.set(key, value, ttl, tags);
    }

    /// Return the cached value for `key`, or run `load`, cache its result and
    /// return it. Load errors are returned and nothing is cached.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[String],
        load: F,
    ) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if let Some(hit) = self.get_json(key) {
            return Ok(hit);
        }
        let value = load().await?;
        self.set_json(key, &value, ttl, tags);
        Ok(value)
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.backend.invalidate_tag(tag)
    }

    /// Invalidate everything derived from one novel, listings included.
    pub fn invalidate_novel(&self, novel_id: i64) {
        let removed =
            self.backend.invalidate_tag(&novel_tag(novel_id)) + self.backend.invalidate_tag(NOVEL_LIST_TAG);
        tracing::debug!(novel_id, removed, "invalidated novel cache");
    }

    pub fn invalidate_novels(&self, novel_ids: &[i64]) {
        for id in novel_ids {
            self.backend.invalidate_tag(&novel_tag(*id));
        }
        self.backend.invalidate_tag(NOVEL_LIST_TAG);
    }

    pub fn purge_expired(&self) -> usize {
        self.backend.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
