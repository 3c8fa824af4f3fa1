//! Hybrid primary/replica store
//!
//! Composes a MySQL primary and a local SQLite replica behind the
//! [`Store`] contract. Config reads hit the replica; config writes go to
//! the primary first and are mirrored to the replica best-effort (the
//! primary is the source of truth, a replica mirror failure is logged and
//! never surfaced). Log writes land on the replica synchronously for read
//! latency and are copied to the primary by a single background worker
//! fed from a bounded queue; on overflow the task is dropped with a
//! warning, logs are observations rather than records of truth.

use crate::db::{SqlStore, Store};
use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Bounded queue size for pending primary log writes
const REPLICATION_QUEUE_CAP: usize = 10_000;
/// Per-task deadline for one primary write
const REPLICATION_TASK_TIMEOUT: Duration = Duration::from_secs(5);
/// Shutdown drain ceiling
const DRAIN_DEADLINE_MAX_SECS: u64 = 30;

/// One unit of work for the replication worker. Entries are normalised
/// clones taken at enqueue time, so callers may keep mutating their own
/// copies after `add_log` returns.
enum ReplicationTask {
    One(LogEntry),
    Batch(Vec<LogEntry>),
}

impl ReplicationTask {
    fn len(&self) -> usize {
        match self {
            ReplicationTask::One(_) => 1,
            ReplicationTask::Batch(entries) => entries.len(),
        }
    }
}

/// Primary/replica façade implementing [`Store`].
pub struct HybridStore {
    primary: Arc<SqlStore>,
    replica: Arc<SqlStore>,
    sender: std::sync::Mutex<Option<mpsc::Sender<ReplicationTask>>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl HybridStore {
    /// Build the façade and start the replication worker.
    ///
    /// Both stores must already be migrated; in hybrid startup the sync
    /// manager has also restored the replica by this point.
    pub fn new(primary: Arc<SqlStore>, replica: Arc<SqlStore>) -> Self {
        let (tx, rx) = mpsc::channel(REPLICATION_QUEUE_CAP);
        let worker = tokio::spawn(Self::run_worker(primary.clone(), rx));
        Self {
            primary,
            replica,
            sender: std::sync::Mutex::new(Some(tx)),
            worker: std::sync::Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn primary(&self) -> &SqlStore {
        self.primary.as_ref()
    }

    pub fn replica(&self) -> &SqlStore {
        self.replica.as_ref()
    }

    /// Log tasks dropped on queue overflow since startup
    pub fn dropped_log_tasks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn run_worker(primary: Arc<SqlStore>, mut rx: mpsc::Receiver<ReplicationTask>) {
        while let Some(task) = rx.recv().await {
            let count = task.len();
            let apply = async {
                match &task {
                    ReplicationTask::One(entry) => primary.add_log_impl(entry).await,
                    ReplicationTask::Batch(entries) => primary.batch_add_logs_impl(entries).await,
                }
            };
            // No retry: the replica is the reader, the primary tolerates
            // short gaps.
            match tokio::time::timeout(REPLICATION_TASK_TIMEOUT, apply).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(count, error = %e, "Primary log replication failed");
                }
                Err(_) => {
                    tracing::warn!(count, "Primary log replication timed out");
                }
            }
        }
        tracing::debug!("Log replication worker drained and stopped");
    }

    fn enqueue(&self, task: ReplicationTask) {
        let sender = {
            let guard = self.sender.lock().unwrap();
            guard.clone()
        };
        let Some(sender) = sender else {
            tracing::warn!("Log replication queue closed; dropping task");
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(task)) = sender.try_send(task) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                count = task.len(),
                dropped_total = dropped,
                "Log replication queue full; dropping task"
            );
        }
    }

    /// Stop accepting log tasks and drain the queue.
    ///
    /// The drain deadline scales with the backlog (`5 + len/100` seconds,
    /// capped at 30) so shutdown stays bounded even with a full queue.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();
        let queued = sender
            .as_ref()
            .map(|s| REPLICATION_QUEUE_CAP - s.capacity())
            .unwrap_or(0);
        drop(sender);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline =
                Duration::from_secs((5 + queued as u64 / 100).min(DRAIN_DEADLINE_MAX_SECS));
            match tokio::time::timeout(deadline, handle).await {
                Ok(_) => tracing::info!(queued, "Log replication drained"),
                Err(_) => tracing::warn!(queued, "Log replication drain timed out"),
            }
        }
    }

    /// Run a best-effort replica mirror; failures are logged, never
    /// surfaced, because the primary already committed.
    fn mirror(op: &'static str, result: Result<impl Sized>) {
        if let Err(e) = result {
            tracing::warn!(op, error = %e, "Replica mirror write failed");
        }
    }
}

#[async_trait]
impl Store for HybridStore {
    // ----- channels: read replica, write primary then mirror -----

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.replica.list_channels_impl().await
    }

    async fn get_channel(&self, id: i64) -> Result<Channel> {
        self.replica.get_channel_impl(id).await
    }

    async fn create_channel(&self, req: &ChannelRequest) -> Result<Channel> {
        let channel = self.primary.create_channel_impl(req).await?;
        Self::mirror("create_channel", self.replica.apply_channel_snapshot(&channel).await);
        Ok(channel)
    }

    async fn update_channel(&self, id: i64, patch: &ChannelPatch) -> Result<Channel> {
        let channel = self.primary.update_channel_impl(id, patch).await?;
        Self::mirror("update_channel", self.replica.apply_channel_snapshot(&channel).await);
        Ok(channel)
    }

    async fn replace_channel(&self, req: &ChannelRequest) -> Result<Channel> {
        let channel = self.primary.replace_channel_impl(req).await?;
        Self::mirror("replace_channel", self.replica.apply_channel_snapshot(&channel).await);
        Ok(channel)
    }

    async fn delete_channel(&self, id: i64) -> Result<()> {
        self.primary.delete_channel_impl(id).await?;
        match self.replica.delete_channel_impl(id).await {
            Err(e) if !e.is_not_found() => {
                tracing::warn!(channel_id = id, error = %e, "Replica mirror delete failed")
            }
            _ => {}
        }
        Ok(())
    }

    async fn get_enabled_channels_by_model(&self, model: &str) -> Result<Vec<Channel>> {
        self.replica.get_enabled_channels_by_model_impl(model).await
    }

    async fn get_enabled_channels_by_type(&self, channel_type: &str) -> Result<Vec<Channel>> {
        self.replica
            .get_enabled_channels_by_type_impl(channel_type)
            .await
    }

    // ----- api keys -----

    async fn get_api_keys(&self, channel_id: i64) -> Result<Vec<ApiKey>> {
        self.replica.get_api_keys_impl(channel_id).await
    }

    async fn get_api_key(&self, channel_id: i64, key_index: i64) -> Result<ApiKey> {
        self.replica.get_api_key_impl(channel_id, key_index).await
    }

    async fn create_api_keys_batch(
        &self,
        channel_id: i64,
        keys: &[String],
        strategy: KeyStrategy,
    ) -> Result<()> {
        self.primary
            .create_api_keys_batch_impl(channel_id, keys, strategy)
            .await?;
        Self::mirror(
            "create_api_keys_batch",
            self.replica
                .create_api_keys_batch_impl(channel_id, keys, strategy)
                .await,
        );
        Ok(())
    }

    async fn delete_api_key(&self, channel_id: i64, key_index: i64) -> Result<()> {
        self.primary.delete_api_key_impl(channel_id, key_index).await?;
        match self.replica.delete_api_key_impl(channel_id, key_index).await {
            Err(e) if !e.is_not_found() => {
                tracing::warn!(channel_id, key_index, error = %e, "Replica mirror delete failed")
            }
            _ => {}
        }
        Ok(())
    }

    async fn compact_key_indices(&self, channel_id: i64, removed_index: i64) -> Result<()> {
        self.primary
            .compact_key_indices_impl(channel_id, removed_index)
            .await?;
        Self::mirror(
            "compact_key_indices",
            self.replica
                .compact_key_indices_impl(channel_id, removed_index)
                .await,
        );
        Ok(())
    }

    async fn delete_all_api_keys(&self, channel_id: i64) -> Result<()> {
        self.primary.delete_all_api_keys_impl(channel_id).await?;
        Self::mirror(
            "delete_all_api_keys",
            self.replica.delete_all_api_keys_impl(channel_id).await,
        );
        Ok(())
    }

    async fn update_api_keys_strategy(&self, channel_id: i64, strategy: KeyStrategy) -> Result<()> {
        self.primary
            .update_api_keys_strategy_impl(channel_id, strategy)
            .await?;
        Self::mirror(
            "update_api_keys_strategy",
            self.replica
                .update_api_keys_strategy_impl(channel_id, strategy)
                .await,
        );
        Ok(())
    }

    async fn get_all_api_keys(&self) -> Result<HashMap<i64, Vec<ApiKey>>> {
        self.replica.get_all_api_keys_impl().await
    }

    // ----- cooldowns: bump on primary, copy committed state over -----

    async fn bump_channel_cooldown(&self, id: i64, now_secs: i64, status: i64) -> Result<i64> {
        let duration_ms = self
            .primary
            .bump_channel_cooldown_impl(id, now_secs, status)
            .await?;
        Self::mirror(
            "bump_channel_cooldown",
            self.replica
                .set_channel_cooldown_state(id, now_secs + duration_ms / 1_000, duration_ms)
                .await,
        );
        Ok(duration_ms)
    }

    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        now_secs: i64,
        status: i64,
    ) -> Result<i64> {
        let duration_ms = self
            .primary
            .bump_key_cooldown_impl(channel_id, key_index, now_secs, status)
            .await?;
        Self::mirror(
            "bump_key_cooldown",
            self.replica
                .set_key_cooldown_state(
                    channel_id,
                    key_index,
                    now_secs + duration_ms / 1_000,
                    duration_ms,
                )
                .await,
        );
        Ok(duration_ms)
    }

    async fn reset_channel_cooldown(&self, id: i64) -> Result<()> {
        self.primary.reset_channel_cooldown_impl(id).await?;
        Self::mirror(
            "reset_channel_cooldown",
            self.replica.reset_channel_cooldown_impl(id).await,
        );
        Ok(())
    }

    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<()> {
        self.primary
            .reset_key_cooldown_impl(channel_id, key_index)
            .await?;
        Self::mirror(
            "reset_key_cooldown",
            self.replica.reset_key_cooldown_impl(channel_id, key_index).await,
        );
        Ok(())
    }

    async fn set_channel_cooldown(&self, id: i64, until_secs: i64) -> Result<()> {
        self.primary.set_channel_cooldown_impl(id, until_secs).await?;
        Self::mirror(
            "set_channel_cooldown",
            self.replica.set_channel_cooldown_impl(id, until_secs).await,
        );
        Ok(())
    }

    async fn set_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        until_secs: i64,
    ) -> Result<()> {
        self.primary
            .set_key_cooldown_impl(channel_id, key_index, until_secs)
            .await?;
        Self::mirror(
            "set_key_cooldown",
            self.replica
                .set_key_cooldown_impl(channel_id, key_index, until_secs)
                .await,
        );
        Ok(())
    }

    async fn get_all_channel_cooldowns(&self, now_secs: i64) -> Result<HashMap<i64, i64>> {
        self.replica.get_all_channel_cooldowns_impl(now_secs).await
    }

    async fn get_all_key_cooldowns(
        &self,
        now_secs: i64,
    ) -> Result<HashMap<i64, HashMap<i64, i64>>> {
        self.replica.get_all_key_cooldowns_impl(now_secs).await
    }

    // ----- logs: replica synchronously, primary through the queue -----

    async fn add_log(&self, entry: &LogEntry) -> Result<()> {
        let mut prepared = entry.clone();
        prepared.normalize();

        if let Err(e) = self.replica.add_log_impl(&prepared).await {
            tracing::warn!(error = %e, "Replica log write failed");
        }
        self.enqueue(ReplicationTask::One(prepared));
        Ok(())
    }

    async fn batch_add_logs(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let prepared: Vec<LogEntry> = entries
            .iter()
            .map(|e| {
                let mut e = e.clone();
                e.normalize();
                e
            })
            .collect();

        if let Err(e) = self.replica.batch_add_logs_impl(&prepared).await {
            tracing::warn!(count = prepared.len(), error = %e, "Replica log batch write failed");
        }
        self.enqueue(ReplicationTask::Batch(prepared));
        Ok(())
    }

    async fn list_logs(
        &self,
        since_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        self.replica
            .list_logs_impl(since_ms, limit, offset, filter)
            .await
    }

    async fn list_logs_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        self.replica
            .list_logs_range_impl(since_ms, until_ms, limit, offset, filter)
            .await
    }

    async fn delete_logs_before(&self, cutoff_ms: i64) -> Result<u64> {
        let removed = self.replica.delete_logs_before_impl(cutoff_ms).await?;
        Self::mirror(
            "delete_logs_before",
            self.primary.delete_logs_before_impl(cutoff_ms).await,
        );
        Ok(removed)
    }

    // ----- aggregations: replica for read latency -----

    async fn aggregate_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: &LogFilter,
    ) -> Result<Vec<BucketPoint>> {
        self.replica
            .aggregate_range_impl(since_ms, until_ms, bucket_secs, filter)
            .await
    }

    async fn get_stats(&self, since_ms: i64, until_ms: i64) -> Result<Vec<StatsEntry>> {
        self.replica.get_stats_impl(since_ms, until_ms).await
    }

    async fn get_stats_lite(&self, since_ms: i64, until_ms: i64) -> Result<Vec<StatsLiteEntry>> {
        self.replica.get_stats_lite_impl(since_ms, until_ms).await
    }

    async fn get_rpm_stats(&self, since_minute: i64) -> Result<Vec<RpmPoint>> {
        self.replica.get_rpm_stats_impl(since_minute).await
    }

    async fn get_channel_success_rates(&self, since_ms: i64) -> Result<HashMap<i64, f64>> {
        self.replica.get_channel_success_rates_impl(since_ms).await
    }

    // ----- auth tokens -----

    async fn list_auth_tokens(&self) -> Result<Vec<AuthToken>> {
        self.replica.list_auth_tokens_impl().await
    }

    async fn get_auth_token(&self, id: i64) -> Result<AuthToken> {
        self.replica.get_auth_token_impl(id).await
    }

    async fn get_auth_token_by_hash(&self, hash: &str) -> Result<Option<AuthToken>> {
        self.replica.get_auth_token_by_hash_impl(hash).await
    }

    async fn create_auth_token(&self, token: &AuthToken) -> Result<AuthToken> {
        let created = self.primary.create_auth_token_impl(token).await?;
        Self::mirror(
            "create_auth_token",
            self.replica.apply_auth_token_snapshot(&created).await,
        );
        Ok(created)
    }

    async fn update_auth_token(&self, id: i64, patch: &AuthTokenPatch) -> Result<AuthToken> {
        let updated = self.primary.update_auth_token_impl(id, patch).await?;
        Self::mirror(
            "update_auth_token",
            self.replica.apply_auth_token_snapshot(&updated).await,
        );
        Ok(updated)
    }

    async fn delete_auth_token(&self, id: i64) -> Result<()> {
        self.primary.delete_auth_token_impl(id).await?;
        match self.replica.delete_auth_token_impl(id).await {
            Err(e) if !e.is_not_found() => {
                tracing::warn!(token_id = id, error = %e, "Replica mirror delete failed")
            }
            _ => {}
        }
        Ok(())
    }

    async fn record_auth_token_usage(&self, id: i64, usage: &TokenUsage) -> Result<()> {
        self.primary.record_auth_token_usage_impl(id, usage).await?;
        Self::mirror(
            "record_auth_token_usage",
            self.replica.record_auth_token_usage_impl(id, usage).await,
        );
        Ok(())
    }

    async fn reset_auth_token_stats(&self, id: i64) -> Result<()> {
        self.primary.reset_auth_token_stats_impl(id).await?;
        Self::mirror(
            "reset_auth_token_stats",
            self.replica.reset_auth_token_stats_impl(id).await,
        );
        Ok(())
    }

    // ----- settings -----

    async fn list_settings(&self) -> Result<Vec<SystemSetting>> {
        self.replica.list_settings_impl().await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<SystemSetting>> {
        self.replica.get_setting_impl(key).await
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.primary.upsert_setting_impl(key, value).await?;
        Self::mirror(
            "upsert_setting",
            self.replica.upsert_setting_impl(key, value).await,
        );
        Ok(())
    }

    async fn batch_update_settings(&self, values: &HashMap<String, String>) -> Result<()> {
        self.primary.batch_update_settings_impl(values).await?;
        Self::mirror(
            "batch_update_settings",
            self.replica.batch_update_settings_impl(values).await,
        );
        Ok(())
    }

    // ----- admin sessions: replica-local only -----

    async fn create_admin_session(&self, token_hash: &str, expires_at: i64) -> Result<()> {
        self.replica
            .create_admin_session_impl(token_hash, expires_at)
            .await
    }

    async fn get_admin_session(&self, token_hash: &str) -> Result<Option<AdminSession>> {
        self.replica.get_admin_session_impl(token_hash).await
    }

    async fn delete_admin_session(&self, token_hash: &str) -> Result<()> {
        self.replica.delete_admin_session_impl(token_hash).await
    }

    async fn purge_expired_admin_sessions(&self, now_secs: i64) -> Result<u64> {
        self.replica.purge_expired_admin_sessions_impl(now_secs).await
    }

    // ----- import -----

    async fn import_channel_batch(&self, items: &[ChannelImport]) -> Result<(u64, u64)> {
        let counts = self.primary.import_channel_batch_impl(items).await?;
        Self::mirror(
            "import_channel_batch",
            self.replica.import_channel_batch_impl(items).await,
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::sqlite_store;

    async fn hybrid(dir: &tempfile::TempDir) -> HybridStore {
        let primary = Arc::new(sqlite_store(dir, "primary.db").await);
        let replica = Arc::new(sqlite_store(dir, "replica.db").await);
        HybridStore::new(primary, replica)
    }

    fn req(name: &str) -> ChannelRequest {
        ChannelRequest {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            priority: 1,
            channel_type: String::new(),
            enabled: true,
            daily_cost_limit: 0.0,
            model_entries: vec![ModelEntry::plain("m-1")],
        }
    }

    async fn wait_for_primary_log(store: &HybridStore, expected: usize) -> Vec<LogEntry> {
        for _ in 0..40 {
            let rows = store
                .primary()
                .list_logs_impl(0, 100, 0, &LogFilter::default())
                .await
                .unwrap();
            if rows.len() >= expected {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("primary never received {expected} log rows");
    }

    #[tokio::test]
    async fn test_config_writes_land_on_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let store = hybrid(&dir).await;

        let channel = store.create_channel(&req("both")).await.unwrap();

        let on_primary = store.primary().get_channel_impl(channel.id).await.unwrap();
        let on_replica = store.replica().get_channel_impl(channel.id).await.unwrap();
        assert_eq!(on_primary.name, "both");
        assert_eq!(on_replica.name, "both");
        assert_eq!(on_replica.model_entries, channel.model_entries);

        // Reads are served by the replica
        let listed = store.list_channels().await.unwrap();
        assert_eq!(listed.len(), 1);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_log_replication_reaches_primary() {
        let dir = tempfile::tempdir().unwrap();
        let store = hybrid(&dir).await;

        let mut entry = LogEntry {
            model: "m-1".to_string(),
            status_code: 200,
            message: "ok".to_string(),
            ..LogEntry::default()
        };
        store.add_log(&entry).await.unwrap();

        // Replica sees the row immediately
        let replica_rows = store
            .replica()
            .list_logs_impl(0, 10, 0, &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(replica_rows.len(), 1);

        // Mutating the caller's entry after the fact must not leak into
        // either copy
        entry.message = "POLLUTED".to_string();

        let primary_rows = wait_for_primary_log(&store, 1).await;
        assert_eq!(primary_rows[0].message, "ok");
        assert_eq!(replica_rows[0].message, "ok");
        // Both sides agree on the stamped timestamp
        assert_eq!(primary_rows[0].time, replica_rows[0].time);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_log_replication_and_shutdown_drain() {
        let dir = tempfile::tempdir().unwrap();
        let store = hybrid(&dir).await;

        let entries: Vec<LogEntry> = (0..25)
            .map(|i| LogEntry {
                time: 1_700_000_000_000 + i,
                model: "m-1".to_string(),
                status_code: 200,
                ..LogEntry::default()
            })
            .collect();
        store.batch_add_logs(&entries).await.unwrap();

        // Shutdown drains whatever is still queued
        store.shutdown().await;
        let primary_rows = store
            .primary()
            .list_logs_impl(0, 100, 0, &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(primary_rows.len(), 25);
        assert_eq!(store.dropped_log_tasks(), 0);
    }

    #[tokio::test]
    async fn test_cooldown_bump_mirrors_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = hybrid(&dir).await;
        let channel = store.create_channel(&req("cool")).await.unwrap();

        let t0 = 1_700_000_000;
        let duration = store
            .bump_channel_cooldown(channel.id, t0, 401)
            .await
            .unwrap();
        assert_eq!(duration, 300_000);

        let on_primary = store.primary().get_channel_impl(channel.id).await.unwrap();
        let on_replica = store.replica().get_channel_impl(channel.id).await.unwrap();
        assert_eq!(on_primary.cooldown_until, t0 + 300);
        assert_eq!(on_replica.cooldown_until, t0 + 300);
        assert_eq!(on_replica.cooldown_duration_ms, 300_000);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_sessions_stay_local() {
        let dir = tempfile::tempdir().unwrap();
        let store = hybrid(&dir).await;

        let hash = sha256_hex("cookie");
        store
            .create_admin_session(&hash, now_secs() + 3600)
            .await
            .unwrap();

        assert!(store.get_admin_session(&hash).await.unwrap().is_some());
        // The primary never sees the session
        assert!(store
            .primary()
            .get_admin_session_impl(&hash)
            .await
            .unwrap()
            .is_none());

        store.shutdown().await;
    }
}
