//! SQL store: channels, API keys, and the cooldown engine
//!
//! One concrete implementation serves both dialects through
//! `sqlx::AnyPool`; statement text is the only thing that varies. Log and
//! aggregation operations live in [`super::logs`], admin entities in
//! [`super::admin`].

use crate::error::{Error, Result};
use crate::types::*;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::schema::Dialect;

/// Base backoff for ordinary failures
pub(crate) const COOLDOWN_BASE_MS: i64 = 1_000;
/// Base backoff for authentication failures (401/403)
pub(crate) const COOLDOWN_AUTH_BASE_MS: i64 = 5 * 60 * 1_000;
/// Backoff ceiling
pub(crate) const COOLDOWN_MAX_MS: i64 = 30 * 60 * 1_000;

/// SQLite is pinned to one connection so write transactions serialise
const SQLITE_MAX_CONNS: u32 = 1;
/// MySQL runs a regular pool
const MYSQL_MAX_CONNS: u32 = 8;

const SQLITE_BUSY_TIMEOUT_MS: u32 = 5_000;

/// Statuses whose failures indicate a dead credential rather than a
/// transient upstream problem. 407 is hop auth, not upstream auth.
fn is_auth_status(status: i64) -> bool {
    matches!(status, 401 | 403)
}

/// Next backoff duration in ms for one more failure observed at
/// `now_secs`. Doubles while the previous cooldown is still running,
/// otherwise restarts from the status-dependent base; always capped.
pub(crate) fn next_backoff(
    prev_until_secs: i64,
    prev_duration_ms: i64,
    now_secs: i64,
    status: i64,
) -> i64 {
    if prev_until_secs > now_secs && prev_duration_ms > 0 {
        (prev_duration_ms * 2).min(COOLDOWN_MAX_MS)
    } else if is_auth_status(status) {
        COOLDOWN_AUTH_BASE_MS
    } else {
        COOLDOWN_BASE_MS
    }
}

/// Concrete persistence over one database.
#[derive(Debug)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlStore {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// Open a SQLite store with the connection-scoped PRAGMAs applied on
    /// every pooled connection. Single connection by design.
    pub async fn open_sqlite(path: &Path, journal_mode: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let journal = journal_mode.to_string();
        let pool = AnyPoolOptions::new()
            .max_connections(SQLITE_MAX_CONNS)
            .after_connect(move |conn, _meta| {
                let journal = journal.clone();
                Box::pin(async move {
                    sqlx::query(&format!("PRAGMA busy_timeout = {SQLITE_BUSY_TIMEOUT_MS}"))
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("PRAGMA journal_mode = {journal}"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await?;

        Ok(Self::new(pool, Dialect::Sqlite))
    }

    /// Open a MySQL store from a DSN
    pub async fn open_mysql(dsn: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(MYSQL_MAX_CONNS)
            .min_connections(MYSQL_MAX_CONNS / 2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await?;

        Ok(Self::new(pool, Dialect::MySql))
    }

    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub(crate) fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Run migrations on this database
    pub async fn migrate(&self) -> Result<()> {
        super::schema::run_migrations(&self.pool, self.dialect).await
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============================================
    // Row mapping
    // ============================================

    pub(crate) fn row_to_channel(row: &AnyRow) -> Result<Channel> {
        Ok(Channel {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            priority: row.try_get("priority")?,
            channel_type: row.try_get("channel_type")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            cooldown_until: row.try_get("cooldown_until")?,
            cooldown_duration_ms: row.try_get("cooldown_duration_ms")?,
            daily_cost_limit: row.try_get("daily_cost_limit")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            model_entries: Vec::new(),
            key_count: row.try_get("key_count").unwrap_or(0),
        })
    }

    fn row_to_api_key(row: &AnyRow) -> Result<ApiKey> {
        let strategy: String = row.try_get("key_strategy")?;
        Ok(ApiKey {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            key_index: row.try_get("key_index")?,
            api_key: row.try_get("api_key")?,
            key_strategy: KeyStrategy::parse(&strategy),
            cooldown_until: row.try_get("cooldown_until")?,
            cooldown_duration_ms: row.try_get("cooldown_duration_ms")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    // ============================================
    // Channel queries
    // ============================================

    pub(crate) async fn list_channels_impl(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT c.*, COUNT(k.id) AS key_count FROM channels c \
             LEFT JOIN api_keys k ON k.channel_id = c.id \
             GROUP BY c.id ORDER BY c.priority DESC, c.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut channels = rows
            .iter()
            .map(Self::row_to_channel)
            .collect::<Result<Vec<_>>>()?;
        self.attach_model_entries(&mut channels).await?;
        Ok(channels)
    }

    pub(crate) async fn get_channel_impl(&self, id: i64) -> Result<Channel> {
        let row = sqlx::query(
            "SELECT c.*, COUNT(k.id) AS key_count FROM channels c \
             LEFT JOIN api_keys k ON k.channel_id = c.id \
             WHERE c.id = ? GROUP BY c.id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| Error::not_found("channel", id))?;
        let mut channel = Self::row_to_channel(&row)?;
        self.attach_model_entries(std::slice::from_mut(&mut channel))
            .await?;
        Ok(channel)
    }

    /// Hydrate `model_entries` for a channel set with one batch query
    async fn attach_model_entries(&self, channels: &mut [Channel]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; channels.len()].join(", ");
        let sql = format!(
            "SELECT channel_id, model, redirect_model FROM channel_models \
             WHERE channel_id IN ({placeholders}) ORDER BY channel_id, model"
        );
        let mut query = sqlx::query(&sql);
        for channel in channels.iter() {
            query = query.bind(channel.id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_channel: HashMap<i64, Vec<ModelEntry>> = HashMap::new();
        for row in rows {
            let channel_id: i64 = row.try_get("channel_id")?;
            by_channel.entry(channel_id).or_default().push(ModelEntry {
                model: row.try_get("model")?,
                redirect_model: row.try_get("redirect_model")?,
            });
        }
        for channel in channels.iter_mut() {
            channel.model_entries = by_channel.remove(&channel.id).unwrap_or_default();
        }
        Ok(())
    }

    pub(crate) async fn get_enabled_channels_by_model_impl(
        &self,
        model: &str,
    ) -> Result<Vec<Channel>> {
        let now = now_secs();
        let rows = if model == "*" {
            sqlx::query(
                "SELECT c.*, COUNT(k.id) AS key_count FROM channels c \
                 LEFT JOIN api_keys k ON k.channel_id = c.id \
                 WHERE c.enabled = 1 AND (c.cooldown_until = 0 OR c.cooldown_until <= ?) \
                 GROUP BY c.id ORDER BY c.priority DESC, c.id ASC",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT c.*, COUNT(DISTINCT k.id) AS key_count FROM channels c \
                 INNER JOIN channel_models cm ON cm.channel_id = c.id AND cm.model = ? \
                 LEFT JOIN api_keys k ON k.channel_id = c.id \
                 WHERE c.enabled = 1 AND (c.cooldown_until = 0 OR c.cooldown_until <= ?) \
                 GROUP BY c.id ORDER BY c.priority DESC, c.id ASC",
            )
            .bind(model)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
        };

        let mut channels = rows
            .iter()
            .map(Self::row_to_channel)
            .collect::<Result<Vec<_>>>()?;
        self.attach_model_entries(&mut channels).await?;
        Ok(channels)
    }

    pub(crate) async fn get_enabled_channels_by_type_impl(
        &self,
        channel_type: &str,
    ) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT c.*, COUNT(k.id) AS key_count FROM channels c \
             LEFT JOIN api_keys k ON k.channel_id = c.id \
             WHERE c.enabled = 1 AND c.channel_type = ? \
               AND (c.cooldown_until = 0 OR c.cooldown_until <= ?) \
             GROUP BY c.id ORDER BY c.priority DESC, c.id ASC",
        )
        .bind(channel_type)
        .bind(now_secs())
        .fetch_all(&self.pool)
        .await?;

        let mut channels = rows
            .iter()
            .map(Self::row_to_channel)
            .collect::<Result<Vec<_>>>()?;
        self.attach_model_entries(&mut channels).await?;
        Ok(channels)
    }

    // ============================================
    // Channel writes
    // ============================================

    pub(crate) async fn create_channel_impl(&self, req: &ChannelRequest) -> Result<Channel> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO channels \
             (name, url, priority, channel_type, enabled, daily_cost_limit, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&req.name)
        .bind(&req.url)
        .bind(req.priority)
        .bind(req.channel_type_or_default())
        .bind(req.enabled as i64)
        .bind(req.daily_cost_limit)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::from_db(e, "channel name"))?;

        let id: i64 = sqlx::query("SELECT id FROM channels WHERE name = ?")
            .bind(&req.name)
            .fetch_one(&mut *tx)
            .await?
            .try_get("id")?;

        Self::write_model_entries(&mut tx, id, &req.model_entries, now).await?;
        tx.commit().await?;

        tracing::debug!(channel_id = id, name = %req.name, "Created channel");
        self.get_channel_impl(id).await
    }

    pub(crate) async fn update_channel_impl(
        &self,
        id: i64,
        patch: &ChannelPatch,
    ) -> Result<Channel> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let exists: i64 = sqlx::query("SELECT COUNT(*) AS n FROM channels WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
        if exists == 0 {
            return Err(Error::not_found("channel", id));
        }

        let mut sets: Vec<String> = Vec::new();
        let mut text_binds: Vec<String> = Vec::new();
        let mut int_binds: Vec<i64> = Vec::new();
        let mut float_binds: Vec<f64> = Vec::new();

        // Built per field so the UPDATE touches only what the patch sets
        if let Some(name) = &patch.name {
            sets.push("name = ?".into());
            text_binds.push(name.clone());
        }
        if let Some(url) = &patch.url {
            sets.push("url = ?".into());
            text_binds.push(url.clone());
        }
        if let Some(channel_type) = &patch.channel_type {
            sets.push("channel_type = ?".into());
            text_binds.push(channel_type.clone());
        }
        if let Some(priority) = patch.priority {
            sets.push("priority = ?".into());
            int_binds.push(priority);
        }
        if let Some(enabled) = patch.enabled {
            sets.push("enabled = ?".into());
            int_binds.push(enabled as i64);
        }
        if let Some(limit) = patch.daily_cost_limit {
            sets.push("daily_cost_limit = ?".into());
            float_binds.push(limit);
        }

        if !sets.is_empty() {
            sets.push("updated_at = ?".into());
            let sql = format!("UPDATE channels SET {} WHERE id = ?", sets.join(", "));
            let mut query = sqlx::query(&sql);
            for text in &text_binds {
                query = query.bind(text);
            }
            for value in &int_binds {
                query = query.bind(value);
            }
            for value in &float_binds {
                query = query.bind(value);
            }
            query = query.bind(now).bind(id);
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::from_db(e, "channel name"))?;
        }

        if let Some(entries) = &patch.model_entries {
            sqlx::query("DELETE FROM channel_models WHERE channel_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Self::write_model_entries(&mut tx, id, entries, now).await?;
        }

        tx.commit().await?;
        self.get_channel_impl(id).await
    }

    pub(crate) async fn replace_channel_impl(&self, req: &ChannelRequest) -> Result<Channel> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;
        let id = Self::upsert_channel_by_name(&mut tx, self.dialect, req, now).await?;

        sqlx::query("DELETE FROM channel_models WHERE channel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        Self::write_model_entries(&mut tx, id, &req.model_entries, now).await?;

        tx.commit().await?;
        self.get_channel_impl(id).await
    }

    /// Upsert a channel by unique name inside `tx`, returning its id
    async fn upsert_channel_by_name(
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        dialect: Dialect,
        req: &ChannelRequest,
        now: i64,
    ) -> Result<i64> {
        let sql = match dialect {
            Dialect::Sqlite => {
                "INSERT INTO channels \
                 (name, url, priority, channel_type, enabled, daily_cost_limit, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(name) DO UPDATE SET \
                   url = excluded.url, priority = excluded.priority, \
                   channel_type = excluded.channel_type, enabled = excluded.enabled, \
                   daily_cost_limit = excluded.daily_cost_limit, updated_at = excluded.updated_at"
            }
            Dialect::MySql => {
                "INSERT INTO channels \
                 (name, url, priority, channel_type, enabled, daily_cost_limit, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                   url = VALUES(url), priority = VALUES(priority), \
                   channel_type = VALUES(channel_type), enabled = VALUES(enabled), \
                   daily_cost_limit = VALUES(daily_cost_limit), updated_at = VALUES(updated_at)"
            }
        };
        sqlx::query(sql)
            .bind(&req.name)
            .bind(&req.url)
            .bind(req.priority)
            .bind(req.channel_type_or_default())
            .bind(req.enabled as i64)
            .bind(req.daily_cost_limit)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;

        let id: i64 = sqlx::query("SELECT id FROM channels WHERE name = ?")
            .bind(&req.name)
            .fetch_one(&mut **tx)
            .await?
            .try_get("id")?;
        Ok(id)
    }

    async fn write_model_entries(
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        channel_id: i64,
        entries: &[ModelEntry],
        now: i64,
    ) -> Result<()> {
        for entry in entries {
            sqlx::query(
                "INSERT INTO channel_models (channel_id, model, redirect_model, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(channel_id)
            .bind(&entry.model)
            .bind(&entry.redirect_model)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::from_db(e, "channel model"))?;
        }
        Ok(())
    }

    pub(crate) async fn delete_channel_impl(&self, id: i64) -> Result<()> {
        // Children removed explicitly; the FK cascade also covers callers
        // hitting the database without foreign_keys enabled.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM channel_models WHERE channel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM api_keys WHERE channel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("channel", id));
        }
        tracing::debug!(channel_id = id, "Deleted channel");
        Ok(())
    }

    /// Write a channel row with an explicit id, overwriting any existing
    /// state. Used by the hybrid replica mirror and the startup restore;
    /// regular creates go through auto-increment.
    pub(crate) async fn apply_channel_snapshot(&self, channel: &Channel) -> Result<()> {
        let sql = match self.dialect {
            Dialect::Sqlite => {
                "INSERT INTO channels \
                 (id, name, url, priority, channel_type, enabled, cooldown_until, \
                  cooldown_duration_ms, daily_cost_limit, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                   name = excluded.name, url = excluded.url, priority = excluded.priority, \
                   channel_type = excluded.channel_type, enabled = excluded.enabled, \
                   cooldown_until = excluded.cooldown_until, \
                   cooldown_duration_ms = excluded.cooldown_duration_ms, \
                   daily_cost_limit = excluded.daily_cost_limit, \
                   created_at = excluded.created_at, updated_at = excluded.updated_at"
            }
            Dialect::MySql => {
                "INSERT INTO channels \
                 (id, name, url, priority, channel_type, enabled, cooldown_until, \
                  cooldown_duration_ms, daily_cost_limit, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                   name = VALUES(name), url = VALUES(url), priority = VALUES(priority), \
                   channel_type = VALUES(channel_type), enabled = VALUES(enabled), \
                   cooldown_until = VALUES(cooldown_until), \
                   cooldown_duration_ms = VALUES(cooldown_duration_ms), \
                   daily_cost_limit = VALUES(daily_cost_limit), \
                   created_at = VALUES(created_at), updated_at = VALUES(updated_at)"
            }
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(sql)
            .bind(channel.id)
            .bind(&channel.name)
            .bind(&channel.url)
            .bind(channel.priority)
            .bind(&channel.channel_type)
            .bind(channel.enabled as i64)
            .bind(channel.cooldown_until)
            .bind(channel.cooldown_duration_ms)
            .bind(channel.daily_cost_limit)
            .bind(channel.created_at)
            .bind(channel.updated_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM channel_models WHERE channel_id = ?")
            .bind(channel.id)
            .execute(&mut *tx)
            .await?;
        Self::write_model_entries(&mut tx, channel.id, &channel.model_entries, channel.updated_at)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============================================
    // API keys
    // ============================================

    pub(crate) async fn get_api_keys_impl(&self, channel_id: i64) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE channel_id = ? ORDER BY key_index")
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_api_key).collect()
    }

    pub(crate) async fn get_api_key_impl(&self, channel_id: i64, key_index: i64) -> Result<ApiKey> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE channel_id = ? AND key_index = ?")
            .bind(channel_id)
            .bind(key_index)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| {
            Error::not_found("api key", format!("{channel_id}/{key_index}"))
        })?;
        Self::row_to_api_key(&row)
    }

    pub(crate) async fn create_api_keys_batch_impl(
        &self,
        channel_id: i64,
        keys: &[String],
        strategy: KeyStrategy,
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let next_index: i64 = sqlx::query(
            "SELECT COALESCE(MAX(key_index), -1) + 1 AS next_index \
             FROM api_keys WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("next_index")?;

        for (offset, key) in keys.iter().enumerate() {
            sqlx::query(
                "INSERT INTO api_keys \
                 (channel_id, key_index, api_key, key_strategy, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(channel_id)
            .bind(next_index + offset as i64)
            .bind(key)
            .bind(strategy.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::from_db(e, "api key index"))?;
        }

        tx.commit().await?;
        tracing::debug!(channel_id, added = keys.len(), "Created API keys");
        Ok(())
    }

    pub(crate) async fn delete_api_key_impl(&self, channel_id: i64, key_index: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE channel_id = ? AND key_index = ?")
            .bind(channel_id)
            .bind(key_index)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                "api key",
                format!("{channel_id}/{key_index}"),
            ));
        }
        Ok(())
    }

    /// Shift indices above the removed slot down by one, keeping the
    /// per-channel range contiguous. Rows are updated in ascending order
    /// so the unique `(channel_id, key_index)` constraint never sees a
    /// transient collision.
    pub(crate) async fn compact_key_indices_impl(
        &self,
        channel_id: i64,
        removed_index: i64,
    ) -> Result<()> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id FROM api_keys WHERE channel_id = ? AND key_index > ? \
             ORDER BY key_index ASC",
        )
        .bind(channel_id)
        .bind(removed_index)
        .fetch_all(&mut *tx)
        .await?;

        for row in rows {
            let id: i64 = row.try_get("id")?;
            sqlx::query(
                "UPDATE api_keys SET key_index = key_index - 1, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn delete_all_api_keys_impl(&self, channel_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM api_keys WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn update_api_keys_strategy_impl(
        &self,
        channel_id: i64,
        strategy: KeyStrategy,
    ) -> Result<()> {
        sqlx::query("UPDATE api_keys SET key_strategy = ?, updated_at = ? WHERE channel_id = ?")
            .bind(strategy.as_str())
            .bind(now_secs())
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn get_all_api_keys_impl(&self) -> Result<HashMap<i64, Vec<ApiKey>>> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY channel_id, key_index")
            .fetch_all(&self.pool)
            .await?;

        let mut by_channel: HashMap<i64, Vec<ApiKey>> = HashMap::new();
        for row in &rows {
            let key = Self::row_to_api_key(row)?;
            by_channel.entry(key.channel_id).or_default().push(key);
        }
        Ok(by_channel)
    }

    // ============================================
    // Cooldown engine
    // ============================================

    pub(crate) async fn bump_channel_cooldown_impl(
        &self,
        id: i64,
        now_secs: i64,
        status: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT cooldown_until, cooldown_duration_ms FROM channels WHERE id = ?{}",
            self.dialect.row_lock()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("channel", id))?;

        let prev_until: i64 = row.try_get("cooldown_until")?;
        let prev_duration: i64 = row.try_get("cooldown_duration_ms")?;
        let next = next_backoff(prev_until, prev_duration, now_secs, status);

        sqlx::query(
            "UPDATE channels SET cooldown_until = ?, cooldown_duration_ms = ? WHERE id = ?",
        )
        .bind(now_secs + next / 1_000)
        .bind(next)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(channel_id = id, status, duration_ms = next, "Channel cooldown bumped");
        Ok(next)
    }

    pub(crate) async fn bump_key_cooldown_impl(
        &self,
        channel_id: i64,
        key_index: i64,
        now_secs: i64,
        status: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT cooldown_until, cooldown_duration_ms FROM api_keys \
             WHERE channel_id = ? AND key_index = ?{}",
            self.dialect.row_lock()
        );
        let row = sqlx::query(&sql)
            .bind(channel_id)
            .bind(key_index)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                Error::not_found("api key", format!("{channel_id}/{key_index}"))
            })?;

        let prev_until: i64 = row.try_get("cooldown_until")?;
        let prev_duration: i64 = row.try_get("cooldown_duration_ms")?;
        let next = next_backoff(prev_until, prev_duration, now_secs, status);

        sqlx::query(
            "UPDATE api_keys SET cooldown_until = ?, cooldown_duration_ms = ? \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(now_secs + next / 1_000)
        .bind(next)
        .bind(channel_id)
        .bind(key_index)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(channel_id, key_index, status, duration_ms = next, "Key cooldown bumped");
        Ok(next)
    }

    pub(crate) async fn reset_channel_cooldown_impl(&self, id: i64) -> Result<()> {
        self.set_channel_cooldown_state(id, 0, 0).await
    }

    pub(crate) async fn reset_key_cooldown_impl(
        &self,
        channel_id: i64,
        key_index: i64,
    ) -> Result<()> {
        self.set_key_cooldown_state(channel_id, key_index, 0, 0).await
    }

    pub(crate) async fn set_channel_cooldown_impl(&self, id: i64, until_secs: i64) -> Result<()> {
        let duration_ms = ((until_secs - now_secs()) * 1_000).max(0);
        self.set_channel_cooldown_state(id, until_secs.max(0), duration_ms)
            .await
    }

    pub(crate) async fn set_key_cooldown_impl(
        &self,
        channel_id: i64,
        key_index: i64,
        until_secs: i64,
    ) -> Result<()> {
        let duration_ms = ((until_secs - now_secs()) * 1_000).max(0);
        self.set_key_cooldown_state(channel_id, key_index, until_secs.max(0), duration_ms)
            .await
    }

    /// Direct cooldown state write, also used to mirror a primary's
    /// committed bump onto the replica.
    pub(crate) async fn set_channel_cooldown_state(
        &self,
        id: i64,
        until_secs: i64,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE channels SET cooldown_until = ?, cooldown_duration_ms = ? WHERE id = ?",
        )
        .bind(until_secs)
        .bind(duration_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn set_key_cooldown_state(
        &self,
        channel_id: i64,
        key_index: i64,
        until_secs: i64,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys SET cooldown_until = ?, cooldown_duration_ms = ? \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(until_secs)
        .bind(duration_ms)
        .bind(channel_id)
        .bind(key_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn get_all_channel_cooldowns_impl(
        &self,
        now_secs: i64,
    ) -> Result<HashMap<i64, i64>> {
        let rows = sqlx::query("SELECT id, cooldown_until FROM channels WHERE cooldown_until > ?")
            .bind(now_secs)
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.try_get::<i64, _>("id")?,
                row.try_get::<i64, _>("cooldown_until")?,
            );
        }
        Ok(map)
    }

    pub(crate) async fn get_all_key_cooldowns_impl(
        &self,
        now_secs: i64,
    ) -> Result<HashMap<i64, HashMap<i64, i64>>> {
        let rows = sqlx::query(
            "SELECT channel_id, key_index, cooldown_until FROM api_keys \
             WHERE cooldown_until > ?",
        )
        .bind(now_secs)
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<i64, HashMap<i64, i64>> = HashMap::new();
        for row in rows {
            let channel_id: i64 = row.try_get("channel_id")?;
            let key_index: i64 = row.try_get("key_index")?;
            let until: i64 = row.try_get("cooldown_until")?;
            map.entry(channel_id).or_default().insert(key_index, until);
        }
        Ok(map)
    }

    // ============================================
    // Import
    // ============================================

    pub(crate) async fn import_channel_batch_impl(
        &self,
        items: &[ChannelImport],
    ) -> Result<(u64, u64)> {
        let now = now_secs();
        let mut tx = self.pool.begin().await?;
        let mut created = 0u64;
        let mut updated = 0u64;

        for item in items {
            let existing: i64 = sqlx::query("SELECT COUNT(*) AS n FROM channels WHERE name = ?")
                .bind(&item.channel.name)
                .fetch_one(&mut *tx)
                .await?
                .try_get("n")?;

            let id = Self::upsert_channel_by_name(&mut tx, self.dialect, &item.channel, now).await?;
            if existing > 0 {
                updated += 1;
            } else {
                created += 1;
            }

            sqlx::query("DELETE FROM channel_models WHERE channel_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Self::write_model_entries(&mut tx, id, &item.channel.model_entries, now).await?;

            sqlx::query("DELETE FROM api_keys WHERE channel_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            for (index, key) in item.api_keys.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO api_keys \
                     (channel_id, key_index, api_key, key_strategy, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(index as i64)
                .bind(key)
                .bind(item.key_strategy.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        tracing::info!(created, updated, "Imported channel batch");
        Ok((created, updated))
    }
}
