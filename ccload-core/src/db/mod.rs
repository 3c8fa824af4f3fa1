//! Database layer for ccload-core
//!
//! This module provides the storage layer:
//! - Dialect-aware schema and idempotent migrations
//! - [`SqlStore`], one concrete store serving SQLite and MySQL
//! - The [`Store`] trait shared by [`SqlStore`] and the hybrid façade

pub mod admin;
pub mod logs;
pub mod schema;
pub mod store;

pub use schema::{run_migrations, Dialect};
pub use store::SqlStore;

use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;

/// Persistence contract of the gateway core.
///
/// Implemented by [`SqlStore`] for a single database and by
/// [`crate::hybrid::HybridStore`] for the primary/replica deployment. All
/// timestamps follow the conventions documented on [`crate::types`].
#[async_trait]
pub trait Store: Send + Sync {
    // ----- channels -----

    /// All channels with `key_count` and model entries hydrated
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    /// Single channel by id; reads the database directly (no cache)
    async fn get_channel(&self, id: i64) -> Result<Channel>;
    async fn create_channel(&self, req: &ChannelRequest) -> Result<Channel>;
    async fn update_channel(&self, id: i64, patch: &ChannelPatch) -> Result<Channel>;
    /// Upsert by unique name
    async fn replace_channel(&self, req: &ChannelRequest) -> Result<Channel>;
    async fn delete_channel(&self, id: i64) -> Result<()>;
    /// Enabled, non-cooling channels serving `model` (`"*"` = all),
    /// ordered by `(priority DESC, id ASC)`
    async fn get_enabled_channels_by_model(&self, model: &str) -> Result<Vec<Channel>>;
    /// Same as by-model with a channel-type predicate
    async fn get_enabled_channels_by_type(&self, channel_type: &str) -> Result<Vec<Channel>>;

    // ----- api keys -----

    /// Keys of one channel ordered by `key_index`
    async fn get_api_keys(&self, channel_id: i64) -> Result<Vec<ApiKey>>;
    async fn get_api_key(&self, channel_id: i64, key_index: i64) -> Result<ApiKey>;
    /// Append keys at the end of the channel's index range
    async fn create_api_keys_batch(
        &self,
        channel_id: i64,
        keys: &[String],
        strategy: KeyStrategy,
    ) -> Result<()>;
    async fn delete_api_key(&self, channel_id: i64, key_index: i64) -> Result<()>;
    /// Close the index gap left by deleting `removed_index`
    async fn compact_key_indices(&self, channel_id: i64, removed_index: i64) -> Result<()>;
    async fn delete_all_api_keys(&self, channel_id: i64) -> Result<()>;
    async fn update_api_keys_strategy(&self, channel_id: i64, strategy: KeyStrategy) -> Result<()>;
    /// All keys grouped by channel, for the cache prefill
    async fn get_all_api_keys(&self) -> Result<HashMap<i64, Vec<ApiKey>>>;

    // ----- cooldowns -----

    /// Exponential-backoff bump; returns the new duration in ms
    async fn bump_channel_cooldown(&self, id: i64, now_secs: i64, status: i64) -> Result<i64>;
    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        now_secs: i64,
        status: i64,
    ) -> Result<i64>;
    async fn reset_channel_cooldown(&self, id: i64) -> Result<()>;
    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<()>;
    /// Explicit deadline (unix seconds); duration is recomputed from the gap
    async fn set_channel_cooldown(&self, id: i64, until_secs: i64) -> Result<()>;
    async fn set_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        until_secs: i64,
    ) -> Result<()>;
    /// `channel_id -> cooldown_until` for channels still cooling at `now_secs`
    async fn get_all_channel_cooldowns(&self, now_secs: i64) -> Result<HashMap<i64, i64>>;
    /// `channel_id -> key_index -> cooldown_until` for keys still cooling
    async fn get_all_key_cooldowns(&self, now_secs: i64)
        -> Result<HashMap<i64, HashMap<i64, i64>>>;

    // ----- logs -----

    async fn add_log(&self, entry: &LogEntry) -> Result<()>;
    async fn batch_add_logs(&self, entries: &[LogEntry]) -> Result<()>;
    async fn list_logs(
        &self,
        since_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>>;
    async fn list_logs_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>>;
    /// Retention pruning; returns rows removed
    async fn delete_logs_before(&self, cutoff_ms: i64) -> Result<u64>;

    // ----- aggregations -----

    async fn aggregate_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: &LogFilter,
    ) -> Result<Vec<BucketPoint>>;
    async fn get_stats(&self, since_ms: i64, until_ms: i64) -> Result<Vec<StatsEntry>>;
    async fn get_stats_lite(&self, since_ms: i64, until_ms: i64) -> Result<Vec<StatsLiteEntry>>;
    async fn get_rpm_stats(&self, since_minute: i64) -> Result<Vec<RpmPoint>>;
    /// Success rate per channel over eligible samples only
    async fn get_channel_success_rates(&self, since_ms: i64) -> Result<HashMap<i64, f64>>;

    // ----- auth tokens -----

    async fn list_auth_tokens(&self) -> Result<Vec<AuthToken>>;
    async fn get_auth_token(&self, id: i64) -> Result<AuthToken>;
    /// Hot-path lookup by SHA-256 hex digest
    async fn get_auth_token_by_hash(&self, hash: &str) -> Result<Option<AuthToken>>;
    async fn create_auth_token(&self, token: &AuthToken) -> Result<AuthToken>;
    async fn update_auth_token(&self, id: i64, patch: &AuthTokenPatch) -> Result<AuthToken>;
    async fn delete_auth_token(&self, id: i64) -> Result<()>;
    /// Fold one request into the token's rolling counters
    async fn record_auth_token_usage(&self, id: i64, usage: &TokenUsage) -> Result<()>;
    /// Admin reset of all counters and averages
    async fn reset_auth_token_stats(&self, id: i64) -> Result<()>;

    // ----- settings -----

    async fn list_settings(&self) -> Result<Vec<SystemSetting>>;
    async fn get_setting(&self, key: &str) -> Result<Option<SystemSetting>>;
    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()>;
    /// All-or-nothing update; fails when any key is unknown
    async fn batch_update_settings(&self, values: &HashMap<String, String>) -> Result<()>;

    // ----- admin sessions -----

    async fn create_admin_session(&self, token_hash: &str, expires_at: i64) -> Result<()>;
    /// `None` for unknown or expired sessions
    async fn get_admin_session(&self, token_hash: &str) -> Result<Option<AdminSession>>;
    async fn delete_admin_session(&self, token_hash: &str) -> Result<()>;
    /// Returns sessions removed
    async fn purge_expired_admin_sessions(&self, now_secs: i64) -> Result<u64>;

    // ----- import -----

    /// One-transaction channel+key import; returns `(created, updated)`
    async fn import_channel_batch(&self, items: &[ChannelImport]) -> Result<(u64, u64)>;
}

#[async_trait]
impl Store for SqlStore {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.list_channels_impl().await
    }

    async fn get_channel(&self, id: i64) -> Result<Channel> {
        self.get_channel_impl(id).await
    }

    async fn create_channel(&self, req: &ChannelRequest) -> Result<Channel> {
        self.create_channel_impl(req).await
    }

    async fn update_channel(&self, id: i64, patch: &ChannelPatch) -> Result<Channel> {
        self.update_channel_impl(id, patch).await
    }

    async fn replace_channel(&self, req: &ChannelRequest) -> Result<Channel> {
        self.replace_channel_impl(req).await
    }

    async fn delete_channel(&self, id: i64) -> Result<()> {
        self.delete_channel_impl(id).await
    }

    async fn get_enabled_channels_by_model(&self, model: &str) -> Result<Vec<Channel>> {
        self.get_enabled_channels_by_model_impl(model).await
    }

    async fn get_enabled_channels_by_type(&self, channel_type: &str) -> Result<Vec<Channel>> {
        self.get_enabled_channels_by_type_impl(channel_type).await
    }

    async fn get_api_keys(&self, channel_id: i64) -> Result<Vec<ApiKey>> {
        self.get_api_keys_impl(channel_id).await
    }

    async fn get_api_key(&self, channel_id: i64, key_index: i64) -> Result<ApiKey> {
        self.get_api_key_impl(channel_id, key_index).await
    }

    async fn create_api_keys_batch(
        &self,
        channel_id: i64,
        keys: &[String],
        strategy: KeyStrategy,
    ) -> Result<()> {
        self.create_api_keys_batch_impl(channel_id, keys, strategy)
            .await
    }

    async fn delete_api_key(&self, channel_id: i64, key_index: i64) -> Result<()> {
        self.delete_api_key_impl(channel_id, key_index).await
    }

    async fn compact_key_indices(&self, channel_id: i64, removed_index: i64) -> Result<()> {
        self.compact_key_indices_impl(channel_id, removed_index)
            .await
    }

    async fn delete_all_api_keys(&self, channel_id: i64) -> Result<()> {
        self.delete_all_api_keys_impl(channel_id).await
    }

    async fn update_api_keys_strategy(&self, channel_id: i64, strategy: KeyStrategy) -> Result<()> {
        self.update_api_keys_strategy_impl(channel_id, strategy)
            .await
    }

    async fn get_all_api_keys(&self) -> Result<HashMap<i64, Vec<ApiKey>>> {
        self.get_all_api_keys_impl().await
    }

    async fn bump_channel_cooldown(&self, id: i64, now_secs: i64, status: i64) -> Result<i64> {
        self.bump_channel_cooldown_impl(id, now_secs, status).await
    }

    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        now_secs: i64,
        status: i64,
    ) -> Result<i64> {
        self.bump_key_cooldown_impl(channel_id, key_index, now_secs, status)
            .await
    }

    async fn reset_channel_cooldown(&self, id: i64) -> Result<()> {
        self.reset_channel_cooldown_impl(id).await
    }

    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<()> {
        self.reset_key_cooldown_impl(channel_id, key_index).await
    }

    async fn set_channel_cooldown(&self, id: i64, until_secs: i64) -> Result<()> {
        self.set_channel_cooldown_impl(id, until_secs).await
    }

    async fn set_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        until_secs: i64,
    ) -> Result<()> {
        self.set_key_cooldown_impl(channel_id, key_index, until_secs)
            .await
    }

    async fn get_all_channel_cooldowns(&self, now_secs: i64) -> Result<HashMap<i64, i64>> {
        self.get_all_channel_cooldowns_impl(now_secs).await
    }

    async fn get_all_key_cooldowns(
        &self,
        now_secs: i64,
    ) -> Result<HashMap<i64, HashMap<i64, i64>>> {
        self.get_all_key_cooldowns_impl(now_secs).await
    }

    async fn add_log(&self, entry: &LogEntry) -> Result<()> {
        self.add_log_impl(entry).await
    }

    async fn batch_add_logs(&self, entries: &[LogEntry]) -> Result<()> {
        self.batch_add_logs_impl(entries).await
    }

    async fn list_logs(
        &self,
        since_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        self.list_logs_impl(since_ms, limit, offset, filter).await
    }

    async fn list_logs_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        self.list_logs_range_impl(since_ms, until_ms, limit, offset, filter)
            .await
    }

    async fn delete_logs_before(&self, cutoff_ms: i64) -> Result<u64> {
        self.delete_logs_before_impl(cutoff_ms).await
    }

    async fn aggregate_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: &LogFilter,
    ) -> Result<Vec<BucketPoint>> {
        self.aggregate_range_impl(since_ms, until_ms, bucket_secs, filter)
            .await
    }

    async fn get_stats(&self, since_ms: i64, until_ms: i64) -> Result<Vec<StatsEntry>> {
        self.get_stats_impl(since_ms, until_ms).await
    }

    async fn get_stats_lite(&self, since_ms: i64, until_ms: i64) -> Result<Vec<StatsLiteEntry>> {
        self.get_stats_lite_impl(since_ms, until_ms).await
    }

    async fn get_rpm_stats(&self, since_minute: i64) -> Result<Vec<RpmPoint>> {
        self.get_rpm_stats_impl(since_minute).await
    }

    async fn get_channel_success_rates(&self, since_ms: i64) -> Result<HashMap<i64, f64>> {
        self.get_channel_success_rates_impl(since_ms).await
    }

    async fn list_auth_tokens(&self) -> Result<Vec<AuthToken>> {
        self.list_auth_tokens_impl().await
    }

    async fn get_auth_token(&self, id: i64) -> Result<AuthToken> {
        self.get_auth_token_impl(id).await
    }

    async fn get_auth_token_by_hash(&self, hash: &str) -> Result<Option<AuthToken>> {
        self.get_auth_token_by_hash_impl(hash).await
    }

    async fn create_auth_token(&self, token: &AuthToken) -> Result<AuthToken> {
        self.create_auth_token_impl(token).await
    }

    async fn update_auth_token(&self, id: i64, patch: &AuthTokenPatch) -> Result<AuthToken> {
        self.update_auth_token_impl(id, patch).await
    }

    async fn delete_auth_token(&self, id: i64) -> Result<()> {
        self.delete_auth_token_impl(id).await
    }

    async fn record_auth_token_usage(&self, id: i64, usage: &TokenUsage) -> Result<()> {
        self.record_auth_token_usage_impl(id, usage).await
    }

    async fn reset_auth_token_stats(&self, id: i64) -> Result<()> {
        self.reset_auth_token_stats_impl(id).await
    }

    async fn list_settings(&self) -> Result<Vec<SystemSetting>> {
        self.list_settings_impl().await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<SystemSetting>> {
        self.get_setting_impl(key).await
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.upsert_setting_impl(key, value).await
    }

    async fn batch_update_settings(&self, values: &HashMap<String, String>) -> Result<()> {
        self.batch_update_settings_impl(values).await
    }

    async fn create_admin_session(&self, token_hash: &str, expires_at: i64) -> Result<()> {
        self.create_admin_session_impl(token_hash, expires_at).await
    }

    async fn get_admin_session(&self, token_hash: &str) -> Result<Option<AdminSession>> {
        self.get_admin_session_impl(token_hash).await
    }

    async fn delete_admin_session(&self, token_hash: &str) -> Result<()> {
        self.delete_admin_session_impl(token_hash).await
    }

    async fn purge_expired_admin_sessions(&self, now_secs: i64) -> Result<u64> {
        self.purge_expired_admin_sessions_impl(now_secs).await
    }

    async fn import_channel_batch(&self, items: &[ChannelImport]) -> Result<(u64, u64)> {
        self.import_channel_batch_impl(items).await
    }
}
