//! Store construction
//!
//! Reads the [`StoreConfig`] mode and builds the matching store:
//! SQLite-only, MySQL-only, or the hybrid pair. Every startup stage runs
//! under its own deadline and closes whatever it opened on the way out.

use crate::config::{StoreConfig, StoreMode};
use crate::db::{run_migrations, SqlStore, Store};
use crate::error::{Error, Result};
use crate::hybrid::HybridStore;
use crate::sync::SyncManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const MIGRATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Overall deadline for the hybrid replica restore
const RESTORE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

async fn with_deadline<T, F>(
    deadline: Duration,
    label: &str,
    err: impl FnOnce(String) -> Error,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(err(format!(
            "{label} exceeded {}s deadline",
            deadline.as_secs()
        ))),
    }
}

/// Build the store selected by the environment-derived configuration.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.mode() {
        StoreMode::SqliteOnly => {
            tracing::info!("Storage mode: SQLite only");
            let store = open_sqlite(config).await?;
            Ok(Arc::new(store))
        }
        StoreMode::MySqlOnly => {
            tracing::info!("Storage mode: MySQL only");
            let store = open_mysql(config).await?;
            Ok(Arc::new(store))
        }
        StoreMode::Hybrid => {
            tracing::info!("Storage mode: hybrid (MySQL primary, SQLite replica)");
            let primary = Arc::new(open_mysql(config).await?);

            let replica = match open_sqlite(config).await {
                Ok(replica) => Arc::new(replica),
                Err(e) => {
                    primary.close().await;
                    return Err(e);
                }
            };

            let sync = SyncManager::new(primary.clone(), replica.clone(), config.log_days);
            let restored = with_deadline(RESTORE_TIMEOUT, "replica restore", Error::Restore, async {
                sync.restore().await
            })
            .await;
            if let Err(e) = restored {
                primary.close().await;
                replica.close().await;
                return Err(e);
            }

            Ok(Arc::new(HybridStore::new(primary, replica)))
        }
    }
}

async fn open_sqlite(config: &StoreConfig) -> Result<SqlStore> {
    let path = config.resolve_sqlite_path();
    tracing::info!(path = %path.display(), journal_mode = %config.journal_mode, "Opening SQLite database");

    let store = SqlStore::open_sqlite(&path, &config.journal_mode).await?;
    if let Err(e) = with_deadline(MIGRATION_TIMEOUT, "sqlite migration", Error::Migration, async {
        run_migrations(store.pool(), store.dialect()).await
    })
    .await
    {
        store.close().await;
        return Err(e);
    }
    Ok(store)
}

async fn open_mysql(config: &StoreConfig) -> Result<SqlStore> {
    let dsn = config
        .mysql_dsn
        .as_deref()
        .ok_or_else(|| Error::Config("MySQL mode selected without a DSN".into()))?;

    let store = with_deadline(PING_TIMEOUT, "mysql connect", Error::Config, async {
        SqlStore::open_mysql(dsn).await
    })
    .await?;

    let pinged = with_deadline(PING_TIMEOUT, "mysql ping", Error::Config, async {
        sqlx::query("SELECT 1").execute(store.pool()).await?;
        Ok(())
    })
    .await;
    if let Err(e) = pinged {
        store.close().await;
        return Err(e);
    }

    if let Err(e) = with_deadline(MIGRATION_TIMEOUT, "mysql migration", Error::Migration, async {
        run_migrations(store.pool(), store.dialect()).await
    })
    .await
    {
        store.close().await;
        return Err(e);
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelRequest, ModelEntry};

    #[tokio::test]
    async fn test_sqlite_only_store_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join("factory.db"),
            ..StoreConfig::default()
        };

        let store = connect_store(&config).await.unwrap();
        let channel = store
            .create_channel(&ChannelRequest {
                name: "factory-made".to_string(),
                url: "https://api.example.com".to_string(),
                priority: 1,
                channel_type: String::new(),
                enabled: true,
                daily_cost_limit: 0.0,
                model_entries: vec![ModelEntry::plain("m-1")],
            })
            .await
            .unwrap();
        assert!(channel.id > 0);

        // Migrations seeded the defaults
        let setting = store.get_setting("max_key_retries").await.unwrap().unwrap();
        assert_eq!(setting.as_i64(), Some(3));
    }

    #[tokio::test]
    async fn test_mysql_mode_without_dsn_is_config_error() {
        let config = StoreConfig::default();
        let err = open_mysql(&config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
