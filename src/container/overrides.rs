//! Override token: disabled tags that may run anyway.
//!
//! Stored under [`ContainerConfig::override_key`](crate::ContainerConfig) as
//! `codec.compress(json array of tag names)`.

use std::collections::HashSet;
use std::time::Duration;

use tracing::warn;

use crate::host::{Codec, Store};

/// Reads the override set. A missing or unreadable token yields an empty set.
pub(crate) fn read(store: &dyn Store, codec: &dyn Codec, key: &str) -> HashSet<String> {
    let Some(raw) = store.get(key) else {
        return HashSet::new();
    };
    let Some(json) = codec.decompress(&raw) else {
        warn!(key, "override token does not decode");
        return HashSet::new();
    };
    match serde_json::from_str::<Vec<String>>(&json) {
        Ok(names) => names.into_iter().collect(),
        Err(err) => {
            warn!(key, error = %err, "override token is not a list of names");
            HashSet::new()
        }
    }
}

/// Writes the override set. An empty list removes the token.
pub(crate) fn write(
    store: &dyn Store,
    codec: &dyn Codec,
    key: &str,
    names: &[String],
    ttl: Option<Duration>,
) -> Result<(), serde_json::Error> {
    if names.is_empty() {
        store.remove(key);
        return Ok(());
    }
    let json = serde_json::to_string(names)?;
    store.set(key, &codec.compress(&json), ttl);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{IdentityCodec, MemoryStore};

    #[test]
    fn test_garbage_token_reads_empty() {
        let store = MemoryStore::new();
        store.set("k", "not json", None);
        assert!(read(&store, &IdentityCodec, "k").is_empty());
        assert!(read(&store, &IdentityCodec, "missing").is_empty());
    }

    #[test]
    fn test_empty_write_removes_token() {
        let store = MemoryStore::new();
        write(&store, &IdentityCodec, "k", &["a".to_string()], None).unwrap();
        assert_eq!(store.get("k").as_deref(), Some(r#"["a"]"#));
        write(&store, &IdentityCodec, "k", &[], None).unwrap();
        assert_eq!(store.get("k"), None);
    }
}
