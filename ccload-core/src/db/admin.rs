//! Auth tokens, system settings, and admin sessions

use crate::error::{Error, Result};
use crate::types::*;
use sqlx::Row;
use std::collections::HashMap;

use super::schema::Dialect;
use super::store::SqlStore;

fn row_to_auth_token(row: &sqlx::any::AnyRow) -> Result<AuthToken> {
    let allowed: Option<String> = row.try_get("allowed_models")?;
    Ok(AuthToken {
        id: row.try_get("id")?,
        token: row.try_get("token")?,
        description: row.try_get("description")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        stream_avg_ttfb_ms: row.try_get("stream_avg_ttfb_ms")?,
        non_stream_avg_rt_ms: row.try_get("non_stream_avg_rt_ms")?,
        total_input_tokens: row.try_get("total_input_tokens")?,
        total_output_tokens: row.try_get("total_output_tokens")?,
        cost_used_microusd: row.try_get("cost_used_microusd")?,
        cost_limit_microusd: row.try_get("cost_limit_microusd")?,
        allowed_models: AuthToken::parse_allowed_models(allowed.as_deref().unwrap_or("")),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_setting(row: &sqlx::any::AnyRow) -> Result<SystemSetting> {
    let value_type: String = row.try_get("value_type")?;
    Ok(SystemSetting {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        value_type: SettingType::parse(&value_type),
        description: row.try_get("description")?,
        default_value: row.try_get("default_value")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl SqlStore {
    // ============================================
    // Auth tokens
    // ============================================

    pub(crate) async fn list_auth_tokens_impl(&self) -> Result<Vec<AuthToken>> {
        let rows = sqlx::query("SELECT * FROM auth_tokens ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_auth_token).collect()
    }

    pub(crate) async fn get_auth_token_impl(&self, id: i64) -> Result<AuthToken> {
        let row = sqlx::query("SELECT * FROM auth_tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        let row = row.ok_or_else(|| Error::not_found("auth token", id))?;
        row_to_auth_token(&row)
    }

    pub(crate) async fn get_auth_token_by_hash_impl(&self, hash: &str) -> Result<Option<AuthToken>> {
        let row = sqlx::query("SELECT * FROM auth_tokens WHERE token = ?")
            .bind(hash)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_auth_token).transpose()
    }

    pub(crate) async fn create_auth_token_impl(&self, token: &AuthToken) -> Result<AuthToken> {
        let now = now_secs();
        sqlx::query(
            "INSERT INTO auth_tokens \
             (token, description, is_active, expires_at, last_used_at, success_count, \
              failure_count, stream_avg_ttfb_ms, non_stream_avg_rt_ms, total_input_tokens, \
              total_output_tokens, cost_used_microusd, cost_limit_microusd, allowed_models, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, 0, 0, 0, 0, 0, 0, 0, 0, ?, ?, ?, ?)",
        )
        .bind(&token.token)
        .bind(&token.description)
        .bind(token.is_active as i64)
        .bind(token.expires_at)
        .bind(token.cost_limit_microusd)
        .bind(token.allowed_models_column())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| Error::from_db(e, "auth token hash"))?;

        let id: i64 = sqlx::query("SELECT id FROM auth_tokens WHERE token = ?")
            .bind(&token.token)
            .fetch_one(self.pool())
            .await?
            .try_get("id")?;
        self.get_auth_token_impl(id).await
    }

    pub(crate) async fn update_auth_token_impl(
        &self,
        id: i64,
        patch: &AuthTokenPatch,
    ) -> Result<AuthToken> {
        let mut sets: Vec<&str> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let mut ints: Vec<i64> = Vec::new();

        if let Some(description) = &patch.description {
            sets.push("description = ?");
            texts.push(description.clone());
        }
        if let Some(allowed) = &patch.allowed_models {
            sets.push("allowed_models = ?");
            texts.push(allowed.join(","));
        }
        if let Some(is_active) = patch.is_active {
            sets.push("is_active = ?");
            ints.push(is_active as i64);
        }
        if let Some(expires_at) = patch.expires_at {
            sets.push("expires_at = ?");
            ints.push(expires_at);
        }
        if let Some(limit) = patch.cost_limit_microusd {
            sets.push("cost_limit_microusd = ?");
            ints.push(limit);
        }

        if !sets.is_empty() {
            sets.push("updated_at = ?");
            let sql = format!("UPDATE auth_tokens SET {} WHERE id = ?", sets.join(", "));
            let mut query = sqlx::query(&sql);
            for text in &texts {
                query = query.bind(text);
            }
            for value in &ints {
                query = query.bind(*value);
            }
            let result = query.bind(now_secs()).bind(id).execute(self.pool()).await?;
            if result.rows_affected() == 0 && !self.auth_token_exists(id).await? {
                return Err(Error::not_found("auth token", id));
            }
        }
        self.get_auth_token_impl(id).await
    }

    async fn auth_token_exists(&self, id: i64) -> Result<bool> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM auth_tokens WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await?
            .try_get("n")?;
        Ok(count > 0)
    }

    pub(crate) async fn delete_auth_token_impl(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("auth token", id));
        }
        Ok(())
    }

    /// Fold one request into the token's rolling counters.
    ///
    /// Averages move by `(sample - avg) / n` with `n` counted over
    /// successes, so a burst of failures cannot drag the latency signal.
    pub(crate) async fn record_auth_token_usage_impl(
        &self,
        id: i64,
        usage: &TokenUsage,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let sql = format!(
            "SELECT success_count, stream_avg_ttfb_ms, non_stream_avg_rt_ms \
             FROM auth_tokens WHERE id = ?{}",
            self.dialect().row_lock()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("auth token", id))?;

        let success_count: i64 = row.try_get("success_count")?;
        let mut stream_avg: f64 = row.try_get("stream_avg_ttfb_ms")?;
        let mut rt_avg: f64 = row.try_get("non_stream_avg_rt_ms")?;

        if usage.success {
            let n = (success_count + 1) as f64;
            if usage.is_streaming {
                if let Some(ttfb) = usage.first_byte_ms {
                    stream_avg += (ttfb - stream_avg) / n;
                }
            } else if let Some(rt) = usage.round_trip_ms {
                rt_avg += (rt - rt_avg) / n;
            }
        }

        sqlx::query(
            "UPDATE auth_tokens SET \
               success_count = success_count + ?, failure_count = failure_count + ?, \
               stream_avg_ttfb_ms = ?, non_stream_avg_rt_ms = ?, \
               total_input_tokens = total_input_tokens + ?, \
               total_output_tokens = total_output_tokens + ?, \
               cost_used_microusd = cost_used_microusd + ?, \
               last_used_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(usage.success as i64)
        .bind(!usage.success as i64)
        .bind(stream_avg)
        .bind(rt_avg)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cost_microusd)
        .bind(now_secs())
        .bind(now_secs())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn reset_auth_token_stats_impl(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE auth_tokens SET \
               success_count = 0, failure_count = 0, stream_avg_ttfb_ms = 0, \
               non_stream_avg_rt_ms = 0, total_input_tokens = 0, total_output_tokens = 0, \
               cost_used_microusd = 0, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now_secs())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 && !self.auth_token_exists(id).await? {
            return Err(Error::not_found("auth token", id));
        }
        Ok(())
    }

    /// Full-row token write with explicit id, for the replica mirror
    pub(crate) async fn apply_auth_token_snapshot(&self, token: &AuthToken) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Sqlite => {
                "INSERT INTO auth_tokens \
                 (id, token, description, is_active, expires_at, last_used_at, success_count, \
                  failure_count, stream_avg_ttfb_ms, non_stream_avg_rt_ms, total_input_tokens, \
                  total_output_tokens, cost_used_microusd, cost_limit_microusd, allowed_models, \
                  created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                   token = excluded.token, description = excluded.description, \
                   is_active = excluded.is_active, expires_at = excluded.expires_at, \
                   last_used_at = excluded.last_used_at, success_count = excluded.success_count, \
                   failure_count = excluded.failure_count, \
                   stream_avg_ttfb_ms = excluded.stream_avg_ttfb_ms, \
                   non_stream_avg_rt_ms = excluded.non_stream_avg_rt_ms, \
                   total_input_tokens = excluded.total_input_tokens, \
                   total_output_tokens = excluded.total_output_tokens, \
                   cost_used_microusd = excluded.cost_used_microusd, \
                   cost_limit_microusd = excluded.cost_limit_microusd, \
                   allowed_models = excluded.allowed_models, \
                   created_at = excluded.created_at, updated_at = excluded.updated_at"
            }
            Dialect::MySql => {
                "INSERT INTO auth_tokens \
                 (id, token, description, is_active, expires_at, last_used_at, success_count, \
                  failure_count, stream_avg_ttfb_ms, non_stream_avg_rt_ms, total_input_tokens, \
                  total_output_tokens, cost_used_microusd, cost_limit_microusd, allowed_models, \
                  created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                   token = VALUES(token), description = VALUES(description), \
                   is_active = VALUES(is_active), expires_at = VALUES(expires_at), \
                   last_used_at = VALUES(last_used_at), success_count = VALUES(success_count), \
                   failure_count = VALUES(failure_count), \
                   stream_avg_ttfb_ms = VALUES(stream_avg_ttfb_ms), \
                   non_stream_avg_rt_ms = VALUES(non_stream_avg_rt_ms), \
                   total_input_tokens = VALUES(total_input_tokens), \
                   total_output_tokens = VALUES(total_output_tokens), \
                   cost_used_microusd = VALUES(cost_used_microusd), \
                   cost_limit_microusd = VALUES(cost_limit_microusd), \
                   allowed_models = VALUES(allowed_models), \
                   created_at = VALUES(created_at), updated_at = VALUES(updated_at)"
            }
        };
        sqlx::query(sql)
            .bind(token.id)
            .bind(&token.token)
            .bind(&token.description)
            .bind(token.is_active as i64)
            .bind(token.expires_at)
            .bind(token.last_used_at)
            .bind(token.success_count)
            .bind(token.failure_count)
            .bind(token.stream_avg_ttfb_ms)
            .bind(token.non_stream_avg_rt_ms)
            .bind(token.total_input_tokens)
            .bind(token.total_output_tokens)
            .bind(token.cost_used_microusd)
            .bind(token.cost_limit_microusd)
            .bind(token.allowed_models_column())
            .bind(token.created_at)
            .bind(token.updated_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ============================================
    // Settings
    // ============================================

    pub(crate) async fn list_settings_impl(&self) -> Result<Vec<SystemSetting>> {
        let rows = sqlx::query("SELECT * FROM system_settings ORDER BY `key`")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_setting).collect()
    }

    pub(crate) async fn get_setting_impl(&self, key: &str) -> Result<Option<SystemSetting>> {
        let row = sqlx::query("SELECT * FROM system_settings WHERE `key` = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_setting).transpose()
    }

    pub(crate) async fn upsert_setting_impl(&self, key: &str, value: &str) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Sqlite => {
                "INSERT INTO system_settings (`key`, value, value_type, description, default_value, updated_at) \
                 VALUES (?, ?, 'string', '', ?, ?) \
                 ON CONFLICT(`key`) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"
            }
            Dialect::MySql => {
                "INSERT INTO system_settings (`key`, value, value_type, description, default_value, updated_at) \
                 VALUES (?, ?, 'string', '', ?, ?) \
                 ON DUPLICATE KEY UPDATE value = VALUES(value), updated_at = VALUES(updated_at)"
            }
        };
        sqlx::query(sql)
            .bind(key)
            .bind(value)
            .bind(value)
            .bind(now_secs())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All-or-nothing settings update. Unknown keys fail the whole batch
    /// before anything is written.
    pub(crate) async fn batch_update_settings_impl(
        &self,
        values: &HashMap<String, String>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;

        for key in values.keys() {
            let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM system_settings WHERE `key` = ?")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?
                .try_get("n")?;
            if count == 0 {
                return Err(Error::not_found("setting", key.clone()));
            }
        }

        let now = now_secs();
        for (key, value) in values {
            sqlx::query("UPDATE system_settings SET value = ?, updated_at = ? WHERE `key` = ?")
                .bind(value)
                .bind(now)
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ============================================
    // Admin sessions
    // ============================================

    pub(crate) async fn create_admin_session_impl(
        &self,
        token_hash: &str,
        expires_at: i64,
    ) -> Result<()> {
        sqlx::query("INSERT INTO admin_sessions (token, expires_at, created_at) VALUES (?, ?, ?)")
            .bind(token_hash)
            .bind(expires_at)
            .bind(now_secs())
            .execute(self.pool())
            .await
            .map_err(|e| Error::from_db(e, "admin session token"))?;
        Ok(())
    }

    pub(crate) async fn get_admin_session_impl(
        &self,
        token_hash: &str,
    ) -> Result<Option<AdminSession>> {
        let row = sqlx::query(
            "SELECT token, expires_at, created_at FROM admin_sessions \
             WHERE token = ? AND expires_at > ?",
        )
        .bind(token_hash)
        .bind(now_secs())
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(AdminSession {
                token: row.try_get("token")?,
                expires_at: row.try_get("expires_at")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub(crate) async fn delete_admin_session_impl(&self, token_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM admin_sessions WHERE token = ?")
            .bind(token_hash)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn purge_expired_admin_sessions_impl(&self, now_secs: i64) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM admin_sessions WHERE expires_at <= ?")
            .bind(now_secs)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(removed)
    }
}
