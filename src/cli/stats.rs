use anyhow::Result;

use convostore::config::AppConfig;
use convostore::repository::CacheRepository;
use convostore::{Store, StoreOptions};

use super::format_bytes;

/// Display storage statistics in the terminal.
pub async fn stats(config: &AppConfig) -> Result<()> {
    let store = Store::open(config.resolved_db_path(), StoreOptions::from_config(config))?;
    let cache = CacheRepository::new(store.clone(), config.cache.clone());

    let stats = store.stats().await?;
    let context = cache.stats().await?;

    println!("Storage Statistics");
    println!("{}", "=".repeat(40));
    println!("  Database:            {}", stats.path.display());
    println!("  Size:                {}", format_bytes(stats.db_size_bytes));
    println!("  Schema version:      {}", stats.schema_version);
    println!();

    println!("Connection pool:");
    println!("  Connections:         {}", stats.pool.total_connections);
    println!("  Idle:                {}", stats.pool.idle_connections);
    println!("  Max:                 {}", config.pool.max_connections);
    println!();

    println!("Context cache:");
    println!("  Entries:             {}", context.entries);
    println!("  Expired (pending):   {}", context.expired_entries);
    println!("  Total tokens:        {}", context.total_tokens);
    println!("  Total accesses:      {}", context.total_accesses);
    if let Some(oldest) = context.oldest_access {
        println!("  Oldest access:       {}", oldest.to_rfc3339());
    }

    store.shutdown();
    Ok(())
}
