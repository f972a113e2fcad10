mod helpers;

use chrono::Utc;
use convostore::query::QueryOptions;
use convostore::repository::cache::estimate_tokens;
use convostore::repository::{CachePayload, CacheRepository, Repository};

fn payload(ids: &[&str], context: &str) -> CachePayload {
    CachePayload::new(ids.iter().map(|s| s.to_string()).collect(), context)
}

#[tokio::test]
async fn set_then_get_round_trips_and_counts_access() {
    let (_tmp, _store, cache) = helpers::test_cache(100);

    let stored = cache
        .set("summary:conv1:brief", payload(&["s1", "s2"], "assembled context text"), None)
        .await
        .unwrap();
    assert_eq!(stored.access_count, 0);
    assert_eq!(stored.token_count, estimate_tokens("assembled context text"));
    assert!(stored.expires_at.is_some());

    let hit = cache.get("summary:conv1:brief").await.unwrap().unwrap();
    assert_eq!(hit.id, stored.id);
    assert_eq!(hit.summary_ids, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(hit.assembled_context, "assembled context text");
    assert_eq!(hit.access_count, 1);

    let again = cache.get("summary:conv1:brief").await.unwrap().unwrap();
    assert_eq!(again.access_count, 2);

    assert!(cache.get("summary:missing").await.unwrap().is_none());
}

#[tokio::test]
async fn set_replaces_existing_key() {
    let (_tmp, _store, cache) = helpers::test_cache(100);

    let first = cache.set("k", payload(&["a"], "old"), None).await.unwrap();
    cache.get("k").await.unwrap();

    let mut replacement = payload(&["b"], "new");
    replacement.token_count = Some(42);
    let second = cache.set("k", replacement, Some(1.0)).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.assembled_context, "new");
    assert_eq!(second.summary_ids, vec!["b".to_string()]);
    assert_eq!(second.token_count, 42);
    assert_eq!(second.access_count, 0);
    assert_eq!(cache.stats().await.unwrap().entries, 1);
}

#[tokio::test]
async fn expired_entries_are_invisible() {
    let (_tmp, store, cache) = helpers::test_cache(100);
    cache.set("k", payload(&["s1"], "ctx"), None).await.unwrap();

    let now = Utc::now().timestamp_millis();
    helpers::set_cache_times(&store, "k", now, Some(now - 1)).await;

    assert!(cache.get("k").await.unwrap().is_none());
    assert!(!cache.exists("k").await.unwrap());
    assert!(cache.find_by_summary_id("s1").await.unwrap().is_empty());

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.expired_entries, 1);
}

#[tokio::test]
async fn zero_ttl_never_expires() {
    let (_tmp, _store, cache) = helpers::test_cache(100);
    let entry = cache.set("forever", payload(&[], "ctx"), Some(0.0)).await.unwrap();
    assert!(entry.expires_at.is_none());

    let result = cache.cleanup().await.unwrap();
    assert_eq!(result.expired, 0);
    assert!(cache.exists("forever").await.unwrap());
}

#[tokio::test]
async fn invalidate_matches_like_pattern_exactly() {
    let (_tmp, _store, cache) = helpers::test_cache(100);
    for key in [
        "summary:conv1:brief",
        "summary:conv1:detailed",
        "summary:conv10:brief",
        "summary:conv2:brief",
    ] {
        cache.set(key, payload(&[], "ctx"), None).await.unwrap();
    }

    let removed = cache.invalidate("summary:conv1:%").await.unwrap();
    assert_eq!(removed, 2);

    assert!(!cache.exists("summary:conv1:brief").await.unwrap());
    assert!(cache.exists("summary:conv10:brief").await.unwrap());
    assert!(cache.exists("summary:conv2:brief").await.unwrap());
}

#[tokio::test]
async fn cleanup_removes_expired_then_evicts_least_recent() {
    let (_tmp, store, cache) = helpers::test_cache(2);
    let now = Utc::now().timestamp_millis();

    for key in ["a", "b", "c", "d", "e"] {
        cache.set(key, payload(&[], key), None).await.unwrap();
    }
    // "e" is expired; of the rest "a" and "c" were accessed longest ago.
    helpers::set_cache_times(&store, "a", now - 50_000, Some(now + 3_600_000)).await;
    helpers::set_cache_times(&store, "b", now - 1_000, Some(now + 3_600_000)).await;
    helpers::set_cache_times(&store, "c", now - 40_000, Some(now + 3_600_000)).await;
    helpers::set_cache_times(&store, "d", now - 2_000, Some(now + 3_600_000)).await;
    helpers::set_cache_times(&store, "e", now, Some(now - 10)).await;

    let result = cache.cleanup().await.unwrap();
    assert_eq!(result.expired, 1);
    assert_eq!(result.evicted, 2);

    assert!(cache.exists("b").await.unwrap());
    assert!(cache.exists("d").await.unwrap());
    for gone in ["a", "c", "e"] {
        assert!(!cache.exists(gone).await.unwrap(), "{gone} should be gone");
    }

    let again = cache.cleanup().await.unwrap();
    assert_eq!((again.expired, again.evicted), (0, 0));
}

#[tokio::test]
async fn find_by_summary_id_uses_json_membership() {
    let (_tmp, _store, cache) = helpers::test_cache(100);
    cache.set("k1", payload(&["s1", "s2"], "one"), None).await.unwrap();
    cache.set("k2", payload(&["s2"], "two"), None).await.unwrap();
    cache.set("k3", payload(&["s10"], "three"), None).await.unwrap();

    let mut keys: Vec<String> = cache
        .find_by_summary_id("s2")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.cache_key)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);

    let only_s1 = cache.find_by_summary_id("s1").await.unwrap();
    assert_eq!(only_s1.len(), 1);
    assert_eq!(only_s1[0].cache_key, "k1");
}

#[tokio::test]
async fn recently_accessed_orders_newest_first() {
    let (_tmp, store, cache) = helpers::test_cache(100);
    let now = Utc::now().timestamp_millis();
    for (key, age) in [("old", 30_000), ("newest", 0), ("middle", 10_000)] {
        cache.set(key, payload(&[], key), None).await.unwrap();
        helpers::set_cache_times(&store, key, now - age, Some(now + 3_600_000)).await;
    }

    let recent: Vec<String> = cache
        .find_recently_accessed(2)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.cache_key)
        .collect();
    assert_eq!(recent, vec!["newest".to_string(), "middle".to_string()]);
}

#[tokio::test]
async fn update_access_and_delete() {
    let (_tmp, _store, cache) = helpers::test_cache(100);
    let entry = cache.set("k", payload(&[], "ctx"), None).await.unwrap();

    assert!(cache.update_access(&entry.id).await.unwrap());
    assert!(!cache.update_access("no-such-id").await.unwrap());
    assert_eq!(cache.stats().await.unwrap().total_accesses, 1);

    assert!(cache.delete("k").await.unwrap());
    assert!(!cache.delete("k").await.unwrap());
    assert!(!cache.exists("k").await.unwrap());
}

#[tokio::test]
async fn stats_sum_tokens_and_accesses() {
    let (_tmp, _store, cache) = helpers::test_cache(100);
    let mut p = payload(&[], "x");
    p.token_count = Some(10);
    cache.set("a", p.clone(), None).await.unwrap();
    cache.set("b", p, None).await.unwrap();
    cache.get("a").await.unwrap();
    cache.get("a").await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.total_tokens, 20);
    assert_eq!(stats.total_accesses, 2);
    assert!(stats.oldest_access.is_some());
}

#[tokio::test]
async fn repository_helpers_target_the_cache_table() {
    let (_tmp, store, cache) = helpers::test_cache(100);
    let entry = cache.set("k", payload(&["s1"], "ctx"), None).await.unwrap();

    let id = entry.id.clone();
    let (count, found) = store
        .with_connection(move |conn| {
            Ok((CacheRepository::count(conn)?, CacheRepository::find_by_id(conn, &id)?))
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(found.unwrap().cache_key, "k");

    let id = entry.id.clone();
    let deleted = store
        .transaction(move |tx| CacheRepository::delete_by_id(tx, &id))
        .await
        .unwrap();
    assert!(deleted);
    assert!(!cache.exists("k").await.unwrap());
}

#[tokio::test]
async fn enormous_ttl_is_stored_as_far_future() {
    let (_tmp, _store, cache) = helpers::test_cache(100);
    let entry = cache.set("k", payload(&[], "ctx"), Some(1e18)).await.unwrap();

    let expires_at = entry.expires_at.unwrap();
    assert!(expires_at > Utc::now() + chrono::Duration::days(365 * 1000));
    assert!(cache.get("k").await.unwrap().is_some());
    assert_eq!(cache.cleanup().await.unwrap().expired, 0);
}

#[tokio::test]
async fn context_cache_miss_leaves_query_cache_alone() {
    let (_tmp, store, cache) = helpers::test_cache(100);
    let _: Vec<serde_json::Value> = store
        .execute_optimized("SELECT 1 AS one", vec![], QueryOptions::default())
        .await
        .unwrap();

    assert!(cache.get("missing").await.unwrap().is_none());
    assert!(!cache.update_access("no-such-id").await.unwrap());
    assert_eq!(store.stats().await.unwrap().query_cache.entries, 1);

    cache.set("k", payload(&[], "ctx"), None).await.unwrap();
    assert_eq!(store.stats().await.unwrap().query_cache.entries, 0);
}
