//! # Durable key/value storage and its string codec.
//!
//! Both are opaque to the engine: the container uses them for override
//! tokens only.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Small durable key/value storage (cookie-like).
pub trait Store: Send + Sync + 'static {
    /// Returns the value under `key`, if present and not expired.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`; `ttl = None` keeps it for the session.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    /// Removes `key`.
    fn remove(&self, key: &str);
}

/// Opaque string codec applied to values placed in storage.
pub trait Codec: Send + Sync + 'static {
    /// Encodes a value for storage.
    fn compress(&self, input: &str) -> String;

    /// Decodes a stored value; `None` if it is not valid codec output.
    fn decompress(&self, input: &str) -> Option<String>;
}

/// Codec that stores values unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn compress(&self, input: &str) -> String {
        input.to_string()
    }

    fn decompress(&self, input: &str) -> Option<String> {
        Some(input.to_string())
    }
}

/// In-process store with TTL support.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), expires));
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires_entries() {
        let store = MemoryStore::new();
        store.set("a", "1", Some(Duration::from_millis(50)));
        store.set("b", "2", None);
        assert_eq!(store.get("a").as_deref(), Some("1"));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b").as_deref(), Some("2"));

        store.remove("b");
        assert_eq!(store.get("b"), None);
    }
}
