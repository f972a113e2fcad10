//! CLI `cache` commands for the persistent context cache.

use anyhow::Result;

use convostore::config::AppConfig;
use convostore::repository::CacheRepository;
use convostore::{Store, StoreOptions};

fn open(config: &AppConfig) -> Result<(Store, CacheRepository)> {
    let store = Store::open(config.resolved_db_path(), StoreOptions::from_config(config))?;
    let cache = CacheRepository::new(store.clone(), config.cache.clone());
    Ok((store, cache))
}

/// Delete expired entries and evict down to `cache.max_entries`.
pub async fn cleanup(config: &AppConfig) -> Result<()> {
    let (store, cache) = open(config)?;
    let result = cache.cleanup().await?;

    println!("Expired entries removed:   {}", result.expired);
    println!("Entries evicted (LRU):     {}", result.evicted);

    store.shutdown();
    Ok(())
}

/// Delete entries whose key matches a SQL `LIKE` pattern.
pub async fn invalidate(config: &AppConfig, pattern: &str) -> Result<()> {
    let (store, cache) = open(config)?;
    let removed = cache.invalidate(pattern).await?;

    println!("Removed {removed} entries matching {pattern:?}.");

    store.shutdown();
    Ok(())
}
