//! Startup replica restore
//!
//! In hybrid mode, after both databases are migrated, the replica is
//! rebuilt from the primary: config tables wholesale, logs as a bounded
//! window. Copies go through the column intersection of the declared
//! schema and both live tables, so a side that still carries a deprecated
//! column (or is missing a brand-new one) cannot break the restore.

use crate::db::schema::{self, has_column, quote_ident, TableDef, ValueKind};
use crate::db::SqlStore;
use crate::error::{Error, Result};
use crate::types::now_millis;
use sqlx::Row;
use std::sync::Arc;

/// Config tables are small; anything bigger than this is a sign the DSN
/// points at the wrong database
const MAX_CONFIG_ROWS: i64 = 10_000;
/// Log rows copied per page
const LOG_PAGE: i64 = 5_000;

/// One-shot primary-to-replica restore.
pub struct SyncManager {
    primary: Arc<SqlStore>,
    replica: Arc<SqlStore>,
    /// Days of log history to copy; 0 = skip logs, negative = everything
    log_days: i64,
}

impl SyncManager {
    pub fn new(primary: Arc<SqlStore>, replica: Arc<SqlStore>, log_days: i64) -> Self {
        Self {
            primary,
            replica,
            log_days,
        }
    }

    /// Restore the replica. Config-table failure is fatal; the log window
    /// is best-effort and only logs its failure.
    pub async fn restore(&self) -> Result<()> {
        for table in schema::CONFIG_SYNC_TABLES {
            self.restore_config_table(table)
                .await
                .map_err(|e| Error::Restore(format!("table {}: {e}", table.name)))?;
        }

        if self.log_days == 0 {
            tracing::info!("Log restore disabled; replica starts without history");
            return Ok(());
        }
        if let Err(e) = self.restore_logs().await {
            tracing::warn!(error = %e, "Log restore failed; starting with incomplete history");
        }
        Ok(())
    }

    async fn restore_config_table(&self, table: &TableDef) -> Result<()> {
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table.name))
            .fetch_one(self.primary.pool())
            .await?
            .try_get("n")?;
        if count > MAX_CONFIG_ROWS {
            return Err(Error::Restore(format!(
                "{} rows on the primary exceed the {} sanity limit",
                count, MAX_CONFIG_ROWS
            )));
        }

        let columns = self.shared_columns(table).await?;
        let column_list: Vec<String> = columns.iter().map(|(name, _)| quote_ident(name)).collect();
        let select = format!(
            "SELECT {} FROM {}",
            column_list.join(", "),
            table.name
        );
        let rows = sqlx::query(&select).fetch_all(self.primary.pool()).await?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            table.name,
            column_list.join(", ")
        );

        let mut tx = self.replica.pool().begin().await?;
        sqlx::query(&format!("DELETE FROM {}", table.name))
            .execute(&mut *tx)
            .await?;
        for row in &rows {
            let mut query = sqlx::query(&insert);
            for (name, kind) in &columns {
                query = match kind {
                    ValueKind::Int => query.bind(row.try_get::<Option<i64>, _>(name.as_str())?),
                    ValueKind::Float => query.bind(row.try_get::<Option<f64>, _>(name.as_str())?),
                    ValueKind::Text => query.bind(row.try_get::<Option<String>, _>(name.as_str())?),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::info!(table = table.name, rows = rows.len(), "Restored config table");
        Ok(())
    }

    /// Declared columns present in both live tables, with their decode
    /// family
    async fn shared_columns(&self, table: &TableDef) -> Result<Vec<(String, ValueKind)>> {
        let mut shared = Vec::with_capacity(table.columns.len());
        for column in table.columns {
            let on_primary = has_column(
                self.primary.pool(),
                self.primary.dialect(),
                table.name,
                column.name,
            )
            .await?;
            let on_replica = has_column(
                self.replica.pool(),
                self.replica.dialect(),
                table.name,
                column.name,
            )
            .await?;
            if on_primary && on_replica {
                shared.push((column.name.to_string(), column.kind.value_kind()));
            } else {
                tracing::debug!(
                    table = table.name,
                    column = column.name,
                    "Skipping column absent on one side"
                );
            }
        }
        if shared.is_empty() {
            return Err(Error::Restore("no shared columns".into()));
        }
        Ok(shared)
    }

    async fn restore_logs(&self) -> Result<()> {
        let table = schema::LOGS_TABLE;
        let cutoff = if self.log_days < 0 {
            0
        } else {
            now_millis() - self.log_days * 24 * 60 * 60 * 1_000
        };

        let columns = self.shared_columns(table).await?;
        let column_list: Vec<String> = columns.iter().map(|(name, _)| quote_ident(name)).collect();
        let select = format!(
            "SELECT {} FROM logs WHERE time >= ? ORDER BY id LIMIT ? OFFSET ?",
            column_list.join(", ")
        );
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO logs ({}) VALUES ({placeholders})",
            column_list.join(", ")
        );

        sqlx::query("DELETE FROM logs")
            .execute(self.replica.pool())
            .await?;

        let mut offset = 0i64;
        let mut total = 0usize;
        loop {
            let rows = sqlx::query(&select)
                .bind(cutoff)
                .bind(LOG_PAGE)
                .bind(offset)
                .fetch_all(self.primary.pool())
                .await?;
            if rows.is_empty() {
                break;
            }

            let mut tx = self.replica.pool().begin().await?;
            for row in &rows {
                let mut query = sqlx::query(&insert);
                for (name, kind) in &columns {
                    query = match kind {
                        ValueKind::Int => query.bind(row.try_get::<Option<i64>, _>(name.as_str())?),
                        ValueKind::Float => {
                            query.bind(row.try_get::<Option<f64>, _>(name.as_str())?)
                        }
                        ValueKind::Text => {
                            query.bind(row.try_get::<Option<String>, _>(name.as_str())?)
                        }
                    };
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;

            total += rows.len();
            if (rows.len() as i64) < LOG_PAGE {
                break;
            }
            offset += LOG_PAGE;
        }

        tracing::info!(rows = total, log_days = self.log_days, "Restored log window");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::sqlite_store;
    use crate::db::Store;
    use crate::types::*;

    fn req(name: &str) -> ChannelRequest {
        ChannelRequest {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            priority: 5,
            channel_type: String::new(),
            enabled: true,
            daily_cost_limit: 1.5,
            model_entries: vec![ModelEntry::redirect("alias", "m-1")],
        }
    }

    #[tokio::test]
    async fn test_restore_config_tables() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(sqlite_store(&dir, "primary.db").await);
        let replica = Arc::new(sqlite_store(&dir, "replica.db").await);

        let created = primary.create_channel(&req("restored")).await.unwrap();
        primary
            .create_api_keys_batch(created.id, &["sk-1".to_string()], KeyStrategy::RoundRobin)
            .await
            .unwrap();
        primary
            .upsert_setting("channel_stats_range", "7d")
            .await
            .unwrap();

        // Stale replica state that must be wiped
        replica.create_channel(&req("stale")).await.unwrap();

        SyncManager::new(primary.clone(), replica.clone(), 0)
            .restore()
            .await
            .unwrap();

        let channels = replica.list_channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        let channel = &channels[0];
        assert_eq!(channel.id, created.id);
        assert_eq!(channel.name, "restored");
        assert!((channel.daily_cost_limit - 1.5).abs() < 1e-9);
        assert_eq!(channel.model_entries, vec![ModelEntry::redirect("alias", "m-1")]);

        let keys = replica.get_api_keys(created.id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_strategy, KeyStrategy::RoundRobin);

        let setting = replica
            .get_setting("channel_stats_range")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(setting.value, "7d");
    }

    #[tokio::test]
    async fn test_restore_log_window() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(sqlite_store(&dir, "primary.db").await);
        let replica = Arc::new(sqlite_store(&dir, "replica.db").await);

        let now = now_millis();
        let recent = LogEntry {
            time: now - 60_000,
            model: "m-1".to_string(),
            status_code: 200,
            ..LogEntry::default()
        };
        let ancient = LogEntry {
            time: now - 30 * 24 * 60 * 60 * 1_000,
            model: "m-1".to_string(),
            status_code: 200,
            ..LogEntry::default()
        };
        primary
            .batch_add_logs(&[recent.clone(), ancient])
            .await
            .unwrap();

        SyncManager::new(primary.clone(), replica.clone(), 7)
            .restore()
            .await
            .unwrap();

        let rows = replica
            .list_logs(0, 100, 0, &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, recent.time);
    }

    #[tokio::test]
    async fn test_restore_logs_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(sqlite_store(&dir, "primary.db").await);
        let replica = Arc::new(sqlite_store(&dir, "replica.db").await);

        primary
            .add_log(&LogEntry {
                model: "m-1".to_string(),
                status_code: 200,
                ..LogEntry::default()
            })
            .await
            .unwrap();

        SyncManager::new(primary.clone(), replica.clone(), 0)
            .restore()
            .await
            .unwrap();
        assert!(replica
            .list_logs(0, 10, 0, &LogFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_restore_refuses_oversized_config_table() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(sqlite_store(&dir, "primary.db").await);
        let replica = Arc::new(sqlite_store(&dir, "replica.db").await);

        // 10 001 settings rows trip the sanity guard
        let mut tx = primary.pool().begin().await.unwrap();
        for i in 0..10_001 {
            sqlx::query(
                "INSERT OR IGNORE INTO system_settings \
                 (`key`, value, value_type, description, default_value, updated_at) \
                 VALUES (?, '', 'string', '', '', 0)",
            )
            .bind(format!("bulk_{i}"))
            .execute(&mut *tx)
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let err = SyncManager::new(primary, replica, 0)
            .restore()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Restore(_)));
    }
}
