//! Integration tests for the ccLoad storage core
//!
//! End-to-end flows over file-backed SQLite stores: topology queries
//! through the cache, the cooldown backoff ladder, health-rate
//! filtering, and hybrid replication over a primary/replica pair.

use ccload_core::cache::ChannelCache;
use ccload_core::db::{SqlStore, Store};
use ccload_core::hybrid::HybridStore;
use ccload_core::types::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Open a migrated SQLite store under `dir`
async fn open_store(dir: &TempDir, name: &str) -> SqlStore {
    let store = SqlStore::open_sqlite(&dir.path().join(name), "WAL")
        .await
        .expect("open sqlite store");
    store.migrate().await.expect("migrate");
    store
}

fn channel_req(name: &str, priority: i64, models: &[ModelEntry]) -> ChannelRequest {
    ChannelRequest {
        name: name.to_string(),
        url: "https://api.example.com".to_string(),
        priority,
        channel_type: String::new(),
        enabled: true,
        daily_cost_limit: 0.0,
        model_entries: models.to_vec(),
    }
}

fn log_row(channel_id: i64, time: i64, status: i64) -> LogEntry {
    LogEntry {
        time,
        channel_id,
        status_code: status,
        model: "m-1".to_string(),
        ..LogEntry::default()
    }
}

// ============================================
// S1: topology query and cache isolation
// ============================================

#[tokio::test]
async fn test_topology_query_with_redirect_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(open_store(&dir, "s1.db").await);
    let cache = ChannelCache::new(store.clone());

    store
        .create_channel(&channel_req(
            "A",
            10,
            &[
                ModelEntry::plain("m-1"),
                ModelEntry::plain("m-2"),
                ModelEntry::redirect("alias-1", "m-1"),
            ],
        ))
        .await
        .unwrap();

    let mut channels = cache.get_enabled_channels_by_model("m-1").await.unwrap();
    assert_eq!(channels.len(), 1);
    let entries = &channels[0].model_entries;
    assert!(entries.contains(&ModelEntry::plain("m-1")));
    assert!(entries.contains(&ModelEntry::plain("m-2")));
    assert!(entries.contains(&ModelEntry::redirect("alias-1", "m-1")));

    // The alias resolves through the same channel
    let via_alias = cache.get_enabled_channels_by_model("alias-1").await.unwrap();
    assert_eq!(via_alias.len(), 1);
    assert_eq!(via_alias[0].id, channels[0].id);

    // Mutating the returned value must not pollute the cache
    channels[0]
        .model_entries
        .push(ModelEntry::plain("POLLUTED"));
    let again = cache.get_enabled_channels_by_model("m-1").await.unwrap();
    assert!(again[0].model_entries.iter().all(|e| e.model != "POLLUTED"));
    assert_eq!(again[0].model_entries.len(), 3);
}

// ============================================
// S2/S3: cooldown backoff ladder
// ============================================

#[tokio::test]
async fn test_auth_backoff_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "s2.db").await;
    let channel = store.create_channel(&channel_req("auth", 0, &[])).await.unwrap();

    let t0 = 1_750_000_000;
    // First 401: five minutes
    assert_eq!(
        store.bump_channel_cooldown(channel.id, t0, 401).await.unwrap(),
        5 * 60 * 1_000
    );
    // One minute later, still cooling: ten minutes, deadline moves with now
    assert_eq!(
        store
            .bump_channel_cooldown(channel.id, t0 + 60, 401)
            .await
            .unwrap(),
        10 * 60 * 1_000
    );
    let state = store.get_channel(channel.id).await.unwrap();
    assert_eq!(state.cooldown_until, t0 + 60 + 10 * 60);

    // Hammering never exceeds the thirty-minute cap
    let mut last = 0;
    for _ in 0..20 {
        last = store
            .bump_channel_cooldown(channel.id, t0 + 61, 401)
            .await
            .unwrap();
        assert!(last <= 30 * 60 * 1_000);
    }
    assert_eq!(last, 30 * 60 * 1_000);
}

#[tokio::test]
async fn test_backoff_restarts_after_window() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "s3.db").await;
    let channel = store.create_channel(&channel_req("window", 0, &[])).await.unwrap();

    let t0 = 1_750_000_000;
    assert_eq!(
        store.bump_channel_cooldown(channel.id, t0, 429).await.unwrap(),
        1_000
    );
    // The one-second window elapsed long before the next failure
    assert_eq!(
        store
            .bump_channel_cooldown(channel.id, t0 + 10, 429)
            .await
            .unwrap(),
        1_000
    );
}

#[tokio::test]
async fn test_concurrent_bumps_compose() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open_store(&dir, "concurrent.db").await);
    let channel = store.create_channel(&channel_req("race", 0, &[])).await.unwrap();

    let t0 = 1_750_000_000;
    store.bump_channel_cooldown(channel.id, t0, 429).await.unwrap();

    // Two concurrent bumps inside the window: the transactional RMW makes
    // them read each other's committed state, so the result equals two
    // sequential bumps (1s -> 2s -> 4s).
    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.bump_channel_cooldown(channel.id, t0, 429).await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.bump_channel_cooldown(channel.id, t0, 429).await })
    };
    let mut results = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    results.sort();
    assert_eq!(results, vec![2_000, 4_000]);

    let state = store.get_channel(channel.id).await.unwrap();
    assert_eq!(state.cooldown_duration_ms, 4_000);
}

// ============================================
// S4: health-rate eligibility
// ============================================

#[tokio::test]
async fn test_success_rate_excludes_client_noise() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "s4.db").await;
    let channel = store.create_channel(&channel_req("C", 0, &[])).await.unwrap();

    let t0 = now_millis() - 1_000;
    let statuses = [200, 204, 502, 597, 404, 499];
    let entries: Vec<LogEntry> = statuses
        .iter()
        .enumerate()
        .map(|(i, status)| log_row(channel.id, t0 + i as i64, *status))
        .collect();
    store.batch_add_logs(&entries).await.unwrap();

    let rates = store.get_channel_success_rates(t0 - 1).await.unwrap();
    // 2 successes over 4 eligible; 404 and 499 sit outside the metric
    assert!((rates[&channel.id] - 0.5).abs() < f64::EPSILON);
}

// ============================================
// S5: hybrid log replication
// ============================================

#[tokio::test]
async fn test_hybrid_replication_and_enqueue_safety() {
    let dir = tempfile::tempdir().unwrap();
    let primary = Arc::new(open_store(&dir, "primary.db").await);
    let replica = Arc::new(open_store(&dir, "replica.db").await);
    let store = HybridStore::new(primary, replica);

    let mut entry = LogEntry {
        model: "m-1".to_string(),
        status_code: 200,
        message: "hello".to_string(),
        ..LogEntry::default()
    };
    store.add_log(&entry).await.unwrap();

    // Replica sees it immediately
    let replica_rows = store.list_logs(0, 10, 0, &LogFilter::default()).await.unwrap();
    assert_eq!(replica_rows.len(), 1);
    assert_eq!(replica_rows[0].message, "hello");

    // Caller keeps mutating its copy; the enqueue cloned the entry
    entry.message = "POLLUTED".to_string();

    // Primary catches up within two seconds
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let primary_rows = loop {
        let rows = store
            .primary()
            .list_logs(0, 10, 0, &LogFilter::default())
            .await
            .unwrap();
        if !rows.is_empty() {
            break rows;
        }
        if std::time::Instant::now() > deadline {
            panic!("primary never caught up");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(primary_rows[0].message, "hello");

    store.shutdown().await;
}

// ============================================
// S6: wildcard deep copy
// ============================================

#[tokio::test]
async fn test_wildcard_snapshot_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(open_store(&dir, "s6.db").await);
    let cache = ChannelCache::new(store.clone());

    for name in ["A", "B", "C"] {
        store
            .create_channel(&channel_req(name, 0, &[ModelEntry::plain("m")]))
            .await
            .unwrap();
    }

    let mut all = cache.get_enabled_channels_by_model("*").await.unwrap();
    assert_eq!(all.len(), 3);
    for channel in &mut all {
        channel.name = "POLLUTED".to_string();
        channel.model_entries.push(ModelEntry::plain("POLLUTED"));
    }

    let again = cache.get_enabled_channels_by_model("*").await.unwrap();
    assert_eq!(again.len(), 3);
    for channel in &again {
        assert_ne!(channel.name, "POLLUTED");
        assert!(channel.model_entries.iter().all(|e| e.model != "POLLUTED"));
    }
}

// ============================================
// Full request-path flow
// ============================================

#[tokio::test]
async fn test_request_path_flow() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(open_store(&dir, "flow.db").await);
    let cache = ChannelCache::with_ttl(
        store.clone(),
        Duration::from_secs(60),
        Duration::from_secs(30),
    );

    // Admin sets up a channel with two keys
    let channel = store
        .create_channel(&channel_req("flow", 5, &[ModelEntry::plain("m-1")]))
        .await
        .unwrap();
    store
        .create_api_keys_batch(
            channel.id,
            &["sk-flow-aaaa".to_string(), "sk-flow-bbbb".to_string()],
            KeyStrategy::Sequential,
        )
        .await
        .unwrap();
    cache.invalidate_cache().await;

    // Router picks the channel and its first key
    let candidates = cache.get_enabled_channels_by_model("m-1").await.unwrap();
    assert_eq!(candidates.len(), 1);
    let keys = cache.get_api_keys(channel.id).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].key_index, 0);

    // Upstream rejects the key; the key cools down but the channel stays
    let now = now_secs();
    store
        .bump_key_cooldown(channel.id, 0, now, 401)
        .await
        .unwrap();
    cache.invalidate_cooldown_cache().await;
    let key_cooldowns = cache.get_all_key_cooldowns().await.unwrap();
    assert!(key_cooldowns[&channel.id].contains_key(&0));
    assert_eq!(
        cache.get_enabled_channels_by_model("m-1").await.unwrap().len(),
        1
    );

    // The outcome is recorded and visible in stats
    store
        .add_log(&LogEntry {
            channel_id: channel.id,
            model: "m-1".to_string(),
            status_code: 429,
            api_key_used: "sk-flow-aaaa".to_string(),
            ..LogEntry::default()
        })
        .await
        .unwrap();
    let rows = store.list_logs(0, 10, 0, &LogFilter::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].channel_name.as_deref(), Some("flow"));
    assert_eq!(rows[0].api_key_used, "sk-f****aaaa");

    // Channel failure cools the whole channel and routing reacts
    store
        .bump_channel_cooldown(channel.id, now, 401)
        .await
        .unwrap();
    cache.invalidate_cooldown_cache().await;
    assert!(cache
        .get_enabled_channels_by_model("m-1")
        .await
        .unwrap()
        .is_empty());
}

// ============================================
// Key lifecycle through the trait object
// ============================================

#[tokio::test]
async fn test_key_delete_compact_round_robin() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(open_store(&dir, "lifecycle.db").await);

    let channel = store.create_channel(&channel_req("rr", 0, &[])).await.unwrap();
    let keys: Vec<String> = (0..4).map(|i| format!("sk-rr-{i}")).collect();
    store
        .create_api_keys_batch(channel.id, &keys, KeyStrategy::RoundRobin)
        .await
        .unwrap();

    store.delete_api_key(channel.id, 0).await.unwrap();
    store.compact_key_indices(channel.id, 0).await.unwrap();

    // Round-robin pointers rely on a contiguous 0..n-1 range
    let remaining = store.get_api_keys(channel.id).await.unwrap();
    let indices: Vec<i64> = remaining.iter().map(|k| k.key_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(remaining[0].api_key, "sk-rr-1");
    assert!(remaining
        .iter()
        .all(|k| k.key_strategy == KeyStrategy::RoundRobin));
}
