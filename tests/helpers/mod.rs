#![allow(dead_code)]

use convostore::config::{CacheConfig, PoolConfig};
use convostore::repository::CacheRepository;
use convostore::{Store, StoreOptions};
use tempfile::TempDir;

/// Open a fresh on-disk store with the full schema applied.
///
/// The `TempDir` must outlive the store; dropping it deletes the database.
pub fn test_store() -> (TempDir, Store) {
    test_store_with(PoolConfig {
        min_connections: 1,
        max_connections: 4,
        ..PoolConfig::default()
    })
}

pub fn test_store_with(pool: PoolConfig) -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let options = StoreOptions {
        pool,
        ..StoreOptions::default()
    };
    let store = Store::open(tmp.path().join("convostore.db"), options).unwrap();
    (tmp, store)
}

/// Store plus a context cache repository capped at `max_entries`.
pub fn test_cache(max_entries: usize) -> (TempDir, Store, CacheRepository) {
    let (tmp, store) = test_store();
    let config = CacheConfig {
        max_entries,
        ..CacheConfig::default()
    };
    let cache = CacheRepository::new(store.clone(), config);
    (tmp, store, cache)
}

/// Insert a conversation row directly.
pub async fn seed_conversation(store: &Store, id: &str) {
    let id = id.to_string();
    store
        .transaction(move |tx| {
            tx.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?1, 0, 0)",
                [&id],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

/// Overwrite a cache row's timestamps (epoch ms) so tests control ordering and expiry.
pub async fn set_cache_times(store: &Store, key: &str, accessed_at: i64, expires_at: Option<i64>) {
    let key = key.to_string();
    store
        .transaction(move |tx| {
            tx.execute(
                "UPDATE context_cache SET accessed_at = ?2, expires_at = ?3 WHERE cache_key = ?1",
                rusqlite::params![key, accessed_at, expires_at],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}
