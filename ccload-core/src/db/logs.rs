//! Log persistence and aggregations
//!
//! Log rows are append-only. Listings resolve channel-name filters to ids
//! before touching `logs` (the two tables may live in different databases
//! in hybrid mode) and fetch display names in one batch after the scan.

use crate::error::Result;
use crate::types::*;
use sqlx::{Any, Row};
use std::collections::{HashMap, HashSet};

use super::store::SqlStore;

const LOG_COLUMNS: &str = "time, minute_bucket, model, actual_model, channel_id, status_code, \
     message, duration, is_streaming, first_byte_time, api_key_used, api_key_hash, \
     auth_token_id, client_ip, input_tokens, output_tokens, cache_read_input_tokens, \
     cache_creation_input_tokens, cache_5m_input_tokens, cache_1h_input_tokens, cost";

const LOG_PLACEHOLDERS: &str = "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?";

/// Deferred bind value for dynamically assembled WHERE clauses
enum Bind {
    Int(i64),
    Text(String),
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Int(v) => query.bind(*v),
            Bind::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

fn bind_log<'q>(
    query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
    e: &'q LogEntry,
) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(e.time)
        .bind(e.minute_bucket)
        .bind(&e.model)
        .bind(&e.actual_model)
        .bind(e.channel_id)
        .bind(e.status_code)
        .bind(&e.message)
        .bind(e.duration)
        .bind(e.is_streaming as i64)
        .bind(e.first_byte_time)
        .bind(&e.api_key_used)
        .bind(&e.api_key_hash)
        .bind(e.auth_token_id)
        .bind(&e.client_ip)
        .bind(e.input_tokens)
        .bind(e.output_tokens)
        .bind(e.cache_read_input_tokens)
        .bind(e.cache_creation_input_tokens)
        .bind(e.cache_5m_input_tokens)
        .bind(e.cache_1h_input_tokens)
        .bind(e.cost)
}

fn row_to_log(row: &sqlx::any::AnyRow) -> Result<LogEntry> {
    Ok(LogEntry {
        id: row.try_get("id")?,
        time: row.try_get("time")?,
        minute_bucket: row.try_get("minute_bucket")?,
        model: row.try_get("model")?,
        actual_model: row.try_get("actual_model")?,
        channel_id: row.try_get("channel_id")?,
        channel_name: None,
        status_code: row.try_get("status_code")?,
        message: row.try_get("message")?,
        duration: row.try_get("duration")?,
        is_streaming: row.try_get::<i64, _>("is_streaming")? != 0,
        first_byte_time: row.try_get("first_byte_time")?,
        api_key_used: row.try_get("api_key_used")?,
        api_key_hash: row.try_get("api_key_hash")?,
        auth_token_id: row.try_get("auth_token_id")?,
        client_ip: row.try_get("client_ip")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        cache_read_input_tokens: row.try_get("cache_read_input_tokens")?,
        cache_creation_input_tokens: row.try_get("cache_creation_input_tokens")?,
        cache_5m_input_tokens: row.try_get("cache_5m_input_tokens")?,
        cache_1h_input_tokens: row.try_get("cache_1h_input_tokens")?,
        cost: row.try_get("cost")?,
    })
}

impl SqlStore {
    pub(crate) async fn add_log_impl(&self, entry: &LogEntry) -> Result<()> {
        let mut prepared = entry.clone();
        prepared.normalize();

        let sql = format!("INSERT INTO logs ({LOG_COLUMNS}) VALUES ({LOG_PLACEHOLDERS})");
        bind_log(sqlx::query(&sql), &prepared)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn batch_add_logs_impl(&self, entries: &[LogEntry]) -> Result<()> {
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

        let sql = format!("INSERT INTO logs ({LOG_COLUMNS}) VALUES ({LOG_PLACEHOLDERS})");
        let mut tx = self.pool().begin().await?;
        for entry in &prepared {
            bind_log(sqlx::query(&sql), entry).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn list_logs_impl(
        &self,
        since_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        self.list_logs_range_impl(since_ms, i64::MAX, limit, offset, filter)
            .await
    }

    pub(crate) async fn list_logs_range_impl(
        &self,
        since_ms: i64,
        until_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        let mut wheres = vec!["time >= ?".to_string(), "time < ?".to_string()];
        let mut binds = vec![Bind::Int(since_ms), Bind::Int(until_ms)];
        if !self
            .push_filter(filter, &mut wheres, &mut binds)
            .await?
        {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM logs WHERE {} ORDER BY time DESC, id DESC LIMIT ? OFFSET ?",
            wheres.join(" AND ")
        );
        binds.push(Bind::Int(limit));
        binds.push(Bind::Int(offset));

        let rows = bind_all(sqlx::query(&sql), &binds)
            .fetch_all(self.pool())
            .await?;
        let mut entries = rows.iter().map(row_to_log).collect::<Result<Vec<_>>>()?;
        self.attach_channel_names(&mut entries).await?;
        Ok(entries)
    }

    /// Translate a [`LogFilter`] into WHERE fragments. Returns false when
    /// a channel-name predicate matches no channel, i.e. the whole query
    /// has an empty result.
    async fn push_filter(
        &self,
        filter: &LogFilter,
        wheres: &mut Vec<String>,
        binds: &mut Vec<Bind>,
    ) -> Result<bool> {
        if let Some(model) = &filter.model {
            wheres.push("model = ?".to_string());
            binds.push(Bind::Text(model.clone()));
        }
        if let Some(name) = &filter.channel_name {
            let ids = self.resolve_channel_ids(name, filter.channel_name_like).await?;
            if ids.is_empty() {
                return Ok(false);
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            wheres.push(format!("channel_id IN ({placeholders})"));
            binds.extend(ids.into_iter().map(Bind::Int));
        }
        if let Some(class) = filter.status_class {
            let (lo, hi) = class.range();
            wheres.push("status_code >= ? AND status_code < ?".to_string());
            binds.push(Bind::Int(lo));
            binds.push(Bind::Int(hi));
        }
        if filter.streaming_only {
            wheres.push("is_streaming = 1".to_string());
        }
        if let Some(token_id) = filter.auth_token_id {
            wheres.push("auth_token_id = ?".to_string());
            binds.push(Bind::Int(token_id));
        }
        Ok(true)
    }

    /// Channel-name filters run against `channels` first; logs and
    /// channels may live in separate databases in some deployments, so
    /// the log query itself only ever sees ids.
    async fn resolve_channel_ids(&self, name: &str, like: bool) -> Result<Vec<i64>> {
        let rows = if like {
            sqlx::query("SELECT id FROM channels WHERE name LIKE ?")
                .bind(format!("%{name}%"))
                .fetch_all(self.pool())
                .await?
        } else {
            sqlx::query("SELECT id FROM channels WHERE name = ?")
                .bind(name)
                .fetch_all(self.pool())
                .await?
        };
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    /// One batch name lookup for the scanned rows; avoids a per-row query
    async fn attach_channel_names(&self, entries: &mut [LogEntry]) -> Result<()> {
        let ids: HashSet<i64> = entries
            .iter()
            .map(|e| e.channel_id)
            .filter(|id| *id > 0)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = ids.into_iter().collect();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, name FROM channels WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(self.pool()).await?;

        let mut names: HashMap<i64, String> = HashMap::with_capacity(rows.len());
        for row in rows {
            names.insert(row.try_get("id")?, row.try_get("name")?);
        }
        for entry in entries.iter_mut() {
            entry.channel_name = names.get(&entry.channel_id).cloned();
        }
        Ok(())
    }

    pub(crate) async fn delete_logs_before_impl(&self, cutoff_ms: i64) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM logs WHERE time < ?")
            .bind(cutoff_ms)
            .execute(self.pool())
            .await?
            .rows_affected();
        if removed > 0 {
            tracing::info!(removed, cutoff_ms, "Pruned request logs");
        }
        Ok(removed)
    }

    // ============================================
    // Aggregations
    // ============================================

    pub(crate) async fn aggregate_range_impl(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: &LogFilter,
    ) -> Result<Vec<BucketPoint>> {
        let bucket_secs = bucket_secs.max(1);
        let mut wheres = vec!["time >= ?".to_string(), "time < ?".to_string()];
        let mut binds = vec![Bind::Int(since_ms), Bind::Int(until_ms)];
        if !self
            .push_filter(filter, &mut wheres, &mut binds)
            .await?
        {
            return Ok(Vec::new());
        }

        let success = self
            .dialect()
            .sum_int("CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END");
        let error = self
            .dialect()
            .sum_int("CASE WHEN status_code < 200 OR status_code >= 300 THEN 1 ELSE 0 END");
        let sql = format!(
            "SELECT (time / 1000) / {bucket_secs} AS bucket, channel_id, \
               {success} AS success, {error} AS error \
             FROM logs WHERE {} \
             GROUP BY bucket, channel_id ORDER BY bucket, channel_id",
            wheres.join(" AND ")
        );

        let rows = bind_all(sqlx::query(&sql), &binds)
            .fetch_all(self.pool())
            .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            let bucket: i64 = row.try_get("bucket")?;
            points.push(BucketPoint {
                bucket_start: bucket * bucket_secs,
                channel_id: row.try_get("channel_id")?,
                channel_name: String::new(),
                success: row.try_get("success")?,
                error: row.try_get("error")?,
            });
        }
        self.attach_bucket_channel_names(&mut points).await?;
        Ok(points)
    }

    async fn attach_bucket_channel_names(&self, points: &mut [BucketPoint]) -> Result<()> {
        let ids: HashSet<i64> = points
            .iter()
            .map(|p| p.channel_id)
            .filter(|id| *id > 0)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = ids.into_iter().collect();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, name FROM channels WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(self.pool()).await?;

        let mut names: HashMap<i64, String> = HashMap::with_capacity(rows.len());
        for row in rows {
            names.insert(row.try_get("id")?, row.try_get("name")?);
        }
        for point in points.iter_mut() {
            if let Some(name) = names.get(&point.channel_id) {
                point.channel_name = name.clone();
            }
        }
        Ok(())
    }

    pub(crate) async fn get_stats_impl(
        &self,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<StatsEntry>> {
        let success = self
            .dialect()
            .sum_int("CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END");
        let error = self
            .dialect()
            .sum_int("CASE WHEN status_code < 200 OR status_code >= 300 THEN 1 ELSE 0 END");
        let input = self.dialect().sum_int("input_tokens");
        let output = self.dialect().sum_int("output_tokens");
        let cache_read = self.dialect().sum_int("cache_read_input_tokens");
        let cache_creation = self.dialect().sum_int("cache_creation_input_tokens");

        let sql = format!(
            "SELECT channel_id, model, COUNT(*) AS total, \
               {success} AS success, {error} AS error, \
               {input} AS input_tokens, {output} AS output_tokens, \
               {cache_read} AS cache_read_input_tokens, \
               {cache_creation} AS cache_creation_input_tokens, \
               COALESCE(SUM(cost), 0) AS cost \
             FROM logs WHERE time >= ? AND time < ? \
             GROUP BY channel_id, model ORDER BY channel_id, model"
        );
        let rows = sqlx::query(&sql)
            .bind(since_ms)
            .bind(until_ms)
            .fetch_all(self.pool())
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(StatsEntry {
                channel_id: row.try_get("channel_id")?,
                channel_name: String::new(),
                model: row.try_get("model")?,
                total: row.try_get("total")?,
                success: row.try_get("success")?,
                error: row.try_get("error")?,
                input_tokens: row.try_get("input_tokens")?,
                output_tokens: row.try_get("output_tokens")?,
                cache_read_input_tokens: row.try_get("cache_read_input_tokens")?,
                cache_creation_input_tokens: row.try_get("cache_creation_input_tokens")?,
                cost: row.try_get("cost")?,
            });
        }

        // Batch name hydration, same as listings
        let ids: HashSet<i64> = entries
            .iter()
            .map(|e| e.channel_id)
            .filter(|id| *id > 0)
            .collect();
        if !ids.is_empty() {
            let ids: Vec<i64> = ids.into_iter().collect();
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!("SELECT id, name FROM channels WHERE id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(*id);
            }
            let rows = query.fetch_all(self.pool()).await?;
            let mut names: HashMap<i64, String> = HashMap::with_capacity(rows.len());
            for row in rows {
                names.insert(row.try_get("id")?, row.try_get("name")?);
            }
            for entry in entries.iter_mut() {
                if let Some(name) = names.get(&entry.channel_id) {
                    entry.channel_name = name.clone();
                }
            }
        }
        Ok(entries)
    }

    pub(crate) async fn get_stats_lite_impl(
        &self,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<StatsLiteEntry>> {
        let success = self
            .dialect()
            .sum_int("CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END");
        let error = self
            .dialect()
            .sum_int("CASE WHEN status_code < 200 OR status_code >= 300 THEN 1 ELSE 0 END");
        let sql = format!(
            "SELECT channel_id, model, COUNT(*) AS total, {success} AS success, {error} AS error \
             FROM logs WHERE time >= ? AND time < ? \
             GROUP BY channel_id, model ORDER BY channel_id, model"
        );
        let rows = sqlx::query(&sql)
            .bind(since_ms)
            .bind(until_ms)
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| {
                Ok(StatsLiteEntry {
                    channel_id: row.try_get("channel_id")?,
                    model: row.try_get("model")?,
                    total: row.try_get("total")?,
                    success: row.try_get("success")?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }

    pub(crate) async fn get_rpm_stats_impl(&self, since_minute: i64) -> Result<Vec<RpmPoint>> {
        let input = self.dialect().sum_int("input_tokens");
        let output = self.dialect().sum_int("output_tokens");
        let sql = format!(
            "SELECT minute_bucket, COUNT(*) AS requests, \
               {input} AS input_tokens, {output} AS output_tokens \
             FROM logs WHERE minute_bucket >= ? \
             GROUP BY minute_bucket ORDER BY minute_bucket"
        );
        let rows = sqlx::query(&sql)
            .bind(since_minute)
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| {
                Ok(RpmPoint {
                    minute_bucket: row.try_get("minute_bucket")?,
                    requests: row.try_get("requests")?,
                    input_tokens: row.try_get("input_tokens")?,
                    output_tokens: row.try_get("output_tokens")?,
                })
            })
            .collect()
    }

    /// Success rate per channel over eligible samples.
    ///
    /// Client-side noise does not say anything about provider health:
    /// 4xx other than 408/429, plus 499, stay out of both the numerator
    /// and the denominator. Channels without eligible samples are absent
    /// from the result.
    pub(crate) async fn get_channel_success_rates_impl(
        &self,
        since_ms: i64,
    ) -> Result<HashMap<i64, f64>> {
        let success = self
            .dialect()
            .sum_int("CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END");
        let failure = self.dialect().sum_int(
            "CASE WHEN status_code IN (408, 429) OR status_code >= 500 THEN 1 ELSE 0 END",
        );
        let sql = format!(
            "SELECT channel_id, {success} AS success, {failure} AS failure \
             FROM logs WHERE time >= ? GROUP BY channel_id"
        );
        let rows = sqlx::query(&sql)
            .bind(since_ms)
            .fetch_all(self.pool())
            .await?;

        let mut rates = HashMap::new();
        for row in &rows {
            let channel_id: i64 = row.try_get("channel_id")?;
            let success: i64 = row.try_get("success")?;
            let failure: i64 = row.try_get("failure")?;
            let eligible = success + failure;
            if eligible > 0 {
                rates.insert(channel_id, success as f64 / eligible as f64);
            }
        }
        Ok(rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::sqlite_store;
    use crate::db::Store;

    fn log(channel_id: i64, time: i64, status: i64) -> LogEntry {
        LogEntry {
            time,
            channel_id,
            status_code: status,
            model: "m-1".to_string(),
            ..LogEntry::default()
        }
    }

    #[tokio::test]
    async fn test_add_log_masks_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "logs.db").await;

        store
            .add_log(&LogEntry {
                model: "m-1".to_string(),
                status_code: 200,
                api_key_used: "sk-ant-1234567890abcd".to_string(),
                cache_5m_input_tokens: 10,
                cache_1h_input_tokens: 5,
                ..LogEntry::default()
            })
            .await
            .unwrap();

        let rows = store
            .list_logs(0, 10, 0, &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.time > 0);
        assert_eq!(row.minute_bucket, row.time / 60_000);
        assert_eq!(row.api_key_used, "sk-a****abcd");
        assert!(!row.api_key_used.contains("1234567890"));
        assert_eq!(row.cache_creation_input_tokens, 15);
    }

    #[tokio::test]
    async fn test_list_logs_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "filters.db").await;

        let ch = store
            .create_channel(&ChannelRequest {
                name: "filter-me".to_string(),
                url: String::new(),
                priority: 0,
                channel_type: String::new(),
                enabled: true,
                daily_cost_limit: 0.0,
                model_entries: vec![],
            })
            .await
            .unwrap();

        let t0 = 1_700_000_000_000;
        store
            .batch_add_logs(&[
                log(ch.id, t0, 200),
                log(ch.id, t0 + 1, 500),
                log(999, t0 + 2, 200),
            ])
            .await
            .unwrap();

        // Status-class filter
        let errors = store
            .list_logs(
                0,
                10,
                0,
                &LogFilter {
                    status_class: Some(StatusClass::ServerError),
                    ..LogFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status_code, 500);

        // Channel-name filter resolves through the channels table
        let by_name = store
            .list_logs(
                0,
                10,
                0,
                &LogFilter {
                    channel_name: Some("filter-me".to_string()),
                    ..LogFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_name.len(), 2);
        assert!(by_name
            .iter()
            .all(|e| e.channel_name.as_deref() == Some("filter-me")));

        // Unknown channel name short-circuits to empty
        let none = store
            .list_logs(
                0,
                10,
                0,
                &LogFilter {
                    channel_name: Some("no-such".to_string()),
                    ..LogFilter::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());

        // Deleted channels leave names unresolved
        let orphan = store
            .list_logs(0, 10, 0, &LogFilter::default())
            .await
            .unwrap();
        assert!(orphan
            .iter()
            .any(|e| e.channel_id == 999 && e.channel_name.is_none()));
    }

    #[tokio::test]
    async fn test_success_rates_ignore_client_noise() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "rates.db").await;

        let t0 = 1_700_000_000_000;
        store
            .batch_add_logs(&[
                log(7, t0, 200),
                log(7, t0 + 1, 204),
                log(7, t0 + 2, 502),
                log(7, t0 + 3, 597),
                log(7, t0 + 4, 404),
                log(7, t0 + 5, 499),
            ])
            .await
            .unwrap();

        let rates = store.get_channel_success_rates(0).await.unwrap();
        assert_eq!(rates.len(), 1);
        // 2 successes over 4 eligible samples; 404 and 499 are excluded
        assert!((rates[&7] - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_success_rates_skip_channels_without_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "norate.db").await;

        let t0 = 1_700_000_000_000;
        // Only excluded statuses: no rate may be reported
        store
            .batch_add_logs(&[log(3, t0, 404), log(3, t0 + 1, 499), log(3, t0 + 2, 301)])
            .await
            .unwrap();

        let rates = store.get_channel_success_rates(0).await.unwrap();
        assert!(rates.is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_range_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "buckets.db").await;

        let t0 = 1_700_000_000_000;
        store
            .batch_add_logs(&[
                log(1, t0, 200),
                log(1, t0 + 30_000, 502),
                log(1, t0 + 60_000, 200),
            ])
            .await
            .unwrap();

        let points = store
            .aggregate_range(t0, t0 + 120_000, 60, &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].success, 1);
        assert_eq!(points[0].error, 1);
        assert_eq!(points[1].success, 1);
        assert_eq!(points[1].bucket_start - points[0].bucket_start, 60);
    }

    #[tokio::test]
    async fn test_stats_and_rpm() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "stats.db").await;

        let t0 = 1_700_000_000_000;
        let mut success = log(1, t0, 200);
        success.input_tokens = 100;
        success.output_tokens = 40;
        success.cost = 0.25;
        let failure = log(1, t0 + 61_000, 503);
        store.batch_add_logs(&[success, failure]).await.unwrap();

        let stats = store.get_stats(0, i64::MAX).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 2);
        assert_eq!(stats[0].success, 1);
        assert_eq!(stats[0].error, 1);
        assert_eq!(stats[0].input_tokens, 100);
        assert!((stats[0].cost - 0.25).abs() < 1e-9);

        let lite = store.get_stats_lite(0, i64::MAX).await.unwrap();
        assert_eq!(lite.len(), 1);
        assert_eq!(lite[0].total, 2);

        let rpm = store.get_rpm_stats(0).await.unwrap();
        assert_eq!(rpm.len(), 2);
        assert!(rpm.iter().all(|p| p.requests == 1));
    }

    #[tokio::test]
    async fn test_delete_logs_before() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir, "prune.db").await;

        let t0 = 1_700_000_000_000;
        store
            .batch_add_logs(&[log(1, t0, 200), log(1, t0 + 10, 200)])
            .await
            .unwrap();

        let removed = store.delete_logs_before(t0 + 5).await.unwrap();
        assert_eq!(removed, 1);
        let left = store
            .list_logs(0, 10, 0, &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].time, t0 + 10);
    }
}
