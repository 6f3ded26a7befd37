//! In-process response cache for generated text.
//!
//! Keys are SHA-256 digests of the fully-constructed prompt, so identical
//! requests map to the same entry. Each entry remembers which backend and
//! model produced the text. Entries expire after their TTL; expired entries are invisible to `get` and
//! are dropped by `purge_expired`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::article::Prompt;
use crate::models::Backend;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A generated text and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub text: String,
    pub backend: Backend,
    pub model: String,
}

struct CacheEntry {
    value: CachedResponse,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// TTL applied by `insert`.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: &str, value: CachedResponse, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), entry);
    }

    /// `set` with the cache's default TTL.
    pub fn insert(&self, key: &str, value: CachedResponse) {
        self.set(key, value, self.ttl);
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Cache key for a prompt: whitespace-normalized system and user text, hashed.
pub fn cache_key(prompt: &Prompt) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(&prompt.system).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(&prompt.user).as_bytes());
    format!("gen:{:x}", hasher.finalize())
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str) -> CachedResponse {
        CachedResponse {
            text: text.to_string(),
            backend: Backend::Local,
            model: "llama3".to_string(),
        }
    }

    fn prompt(user: &str) -> Prompt {
        Prompt {
            system: "You are a professional content creator.".to_string(),
            user: user.to_string(),
        }
    }

    #[test]
    fn key_is_deterministic_and_ignores_layout_whitespace() {
        let a = cache_key(&prompt("Topic: Coffee\n\n  Write in English."));
        let b = cache_key(&prompt("Topic: Coffee Write in English."));
        let c = cache_key(&prompt("Topic: Tea Write in English."));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("gen:"));
        assert_eq!(a.len(), "gen:".len() + 64);
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let cache = ResponseCache::default();
        cache.insert("fresh", response("kept"));
        cache.set("stale", response("gone"), Duration::ZERO);

        assert_eq!(cache.get("fresh"), Some(response("kept")));
        assert_eq!(cache.get("stale"), None);
        assert_eq!(cache.get("missing"), None);

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn last_writer_wins() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.insert("k", response("first"));
        cache.insert("k", response("second"));
        assert_eq!(cache.get("k").map(|r| r.text).as_deref(), Some("second"));
        assert_eq!(cache.ttl(), Duration::from_secs(60));
    }
}
