//! Database schema and migrations
//!
//! Tables are declared once as [`TableDef`] values and rendered for both
//! dialects; the migrator is idempotent and keeps a ledger of one-shot
//! migrations in `schema_migrations`. Any DDL failure aborts startup,
//! while "already exists" conditions are treated as no-ops.

use crate::error::{Error, Result};
use crate::types::{now_secs, SettingType};
use sqlx::{AnyPool, Row};

// ============================================
// Dialects
// ============================================

/// SQL dialect the store is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    /// Prefix for "insert unless the row exists" statements
    pub fn insert_ignore(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INSERT OR IGNORE",
            Dialect::MySql => "INSERT IGNORE",
        }
    }

    /// Row-lock suffix for SELECTs inside read-modify-write transactions.
    ///
    /// SQLite has no row locks (and rejects the syntax); its single
    /// connection serialises writers instead.
    pub(crate) fn row_lock(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "",
            Dialect::MySql => " FOR UPDATE",
        }
    }

    /// Integer aggregate that decodes as BIGINT on both dialects.
    ///
    /// MySQL returns DECIMAL from SUM over integer columns, which the Any
    /// driver cannot decode into i64 without the cast.
    pub(crate) fn sum_int(&self, expr: &str) -> String {
        match self {
            Dialect::Sqlite => format!("COALESCE(SUM({expr}), 0)"),
            Dialect::MySql => format!("CAST(COALESCE(SUM({expr}), 0) AS SIGNED)"),
        }
    }
}

// ============================================
// Table declarations
// ============================================

/// Abstract column type, rendered per dialect.
///
/// SQLite collapses all integer widths to `INTEGER`; MySQL keeps the
/// explicit widths external tooling depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColKind {
    /// Auto-increment primary key
    AutoId,
    BigInt,
    Int,
    TinyInt,
    Double,
    VarChar(u16),
    Text,
}

impl ColKind {
    fn render(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (ColKind::AutoId, Dialect::Sqlite) => "INTEGER PRIMARY KEY AUTOINCREMENT".into(),
            (ColKind::AutoId, Dialect::MySql) => "BIGINT NOT NULL AUTO_INCREMENT".into(),
            (ColKind::BigInt | ColKind::Int | ColKind::TinyInt, Dialect::Sqlite) => {
                "INTEGER".into()
            }
            (ColKind::BigInt, Dialect::MySql) => "BIGINT".into(),
            (ColKind::Int, Dialect::MySql) => "INT".into(),
            (ColKind::TinyInt, Dialect::MySql) => "TINYINT".into(),
            (ColKind::Double, Dialect::Sqlite) => "REAL".into(),
            (ColKind::Double, Dialect::MySql) => "DOUBLE".into(),
            (ColKind::VarChar(_), Dialect::Sqlite) => "TEXT".into(),
            (ColKind::VarChar(n), Dialect::MySql) => format!("VARCHAR({n})"),
            (ColKind::Text, _) => "TEXT".into(),
        }
    }

    /// How row values of this kind are decoded and re-bound (bulk copy)
    pub(crate) fn value_kind(&self) -> ValueKind {
        match self {
            ColKind::AutoId | ColKind::BigInt | ColKind::Int | ColKind::TinyInt => ValueKind::Int,
            ColKind::Double => ValueKind::Float,
            ColKind::VarChar(_) | ColKind::Text => ValueKind::Text,
        }
    }
}

/// Runtime value family for generic row copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Int,
    Float,
    Text,
}

/// One declared column.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnDef {
    pub name: &'static str,
    pub kind: ColKind,
    pub not_null: bool,
    pub default: Option<&'static str>,
}

/// Shorthand constructor used by the table declarations below
const fn col(name: &'static str, kind: ColKind) -> ColumnDef {
    ColumnDef {
        name,
        kind,
        not_null: false,
        default: None,
    }
}

impl ColumnDef {
    const fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    const fn default_to(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    fn render(&self, dialect: Dialect) -> String {
        let mut sql = format!("{} {}", quote_ident(self.name), self.kind.render(dialect));
        if self.kind != ColKind::AutoId {
            if self.not_null {
                sql.push_str(" NOT NULL");
            }
            if let Some(default) = self.default {
                sql.push_str(" DEFAULT ");
                sql.push_str(default);
            }
        }
        sql
    }
}

/// One declared secondary index.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexDef {
    pub name: &'static str,
    /// Raw column list, e.g. `"time, channel_id, model"`
    pub columns: &'static str,
}

/// One declared table: columns, table constraints, and indexes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    /// Rendered verbatim into the CREATE TABLE body for both dialects
    pub constraints: &'static [&'static str],
    pub indexes: &'static [IndexDef],
}

impl TableDef {
    pub(crate) fn create_sql(&self, dialect: Dialect) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(|c| c.render(dialect)).collect();
        if dialect == Dialect::MySql && self.columns.iter().any(|c| c.kind == ColKind::AutoId) {
            parts.push("PRIMARY KEY (id)".to_string());
        }
        parts.extend(self.constraints.iter().map(|c| c.to_string()));

        let options = match dialect {
            Dialect::Sqlite => "",
            Dialect::MySql => " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n){}",
            self.name,
            parts.join(",\n  "),
            options
        )
    }

    pub(crate) fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Backtick-quote an identifier; needed for reserved words (`key`) and
/// accepted by both dialects.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{name}`")
}

// ============================================
// Schema
// ============================================

const CHANNELS: TableDef = TableDef {
    name: "channels",
    columns: &[
        col("id", ColKind::AutoId),
        col("name", ColKind::VarChar(191)).not_null(),
        col("url", ColKind::VarChar(191)).not_null().default_to("''"),
        col("priority", ColKind::Int).not_null().default_to("0"),
        col("channel_type", ColKind::VarChar(64))
            .not_null()
            .default_to("'anthropic'"),
        col("enabled", ColKind::TinyInt).not_null().default_to("1"),
        col("cooldown_until", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cooldown_duration_ms", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("daily_cost_limit", ColKind::Double)
            .not_null()
            .default_to("0"),
        col("created_at", ColKind::BigInt).not_null().default_to("0"),
        col("updated_at", ColKind::BigInt).not_null().default_to("0"),
    ],
    constraints: &["UNIQUE (name)"],
    indexes: &[
        IndexDef {
            name: "idx_channels_enabled",
            columns: "enabled",
        },
        IndexDef {
            name: "idx_channels_priority",
            columns: "priority DESC",
        },
        IndexDef {
            name: "idx_channels_type_enabled",
            columns: "channel_type, enabled",
        },
        IndexDef {
            name: "idx_channels_cooldown",
            columns: "cooldown_until",
        },
    ],
};

const API_KEYS: TableDef = TableDef {
    name: "api_keys",
    columns: &[
        col("id", ColKind::AutoId),
        col("channel_id", ColKind::BigInt).not_null(),
        col("key_index", ColKind::Int).not_null(),
        col("api_key", ColKind::VarChar(512)).not_null(),
        col("key_strategy", ColKind::VarChar(32))
            .not_null()
            .default_to("'sequential'"),
        col("cooldown_until", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cooldown_duration_ms", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("created_at", ColKind::BigInt).not_null().default_to("0"),
        col("updated_at", ColKind::BigInt).not_null().default_to("0"),
    ],
    constraints: &[
        "UNIQUE (channel_id, key_index)",
        "FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE",
    ],
    indexes: &[],
};

const CHANNEL_MODELS: TableDef = TableDef {
    name: "channel_models",
    columns: &[
        col("channel_id", ColKind::BigInt).not_null(),
        col("model", ColKind::VarChar(191)).not_null(),
        col("redirect_model", ColKind::VarChar(191))
            .not_null()
            .default_to("''"),
        col("created_at", ColKind::BigInt).not_null().default_to("0"),
    ],
    constraints: &[
        "PRIMARY KEY (channel_id, model)",
        "FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE",
    ],
    indexes: &[IndexDef {
        name: "idx_channel_models_model",
        columns: "model",
    }],
};

const AUTH_TOKENS: TableDef = TableDef {
    name: "auth_tokens",
    columns: &[
        col("id", ColKind::AutoId),
        col("token", ColKind::VarChar(64)).not_null(),
        col("description", ColKind::VarChar(191))
            .not_null()
            .default_to("''"),
        col("is_active", ColKind::TinyInt).not_null().default_to("1"),
        col("expires_at", ColKind::BigInt).not_null().default_to("0"),
        col("last_used_at", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("success_count", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("failure_count", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("stream_avg_ttfb_ms", ColKind::Double)
            .not_null()
            .default_to("0"),
        col("non_stream_avg_rt_ms", ColKind::Double)
            .not_null()
            .default_to("0"),
        col("total_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("total_output_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cost_used_microusd", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cost_limit_microusd", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("allowed_models", ColKind::Text),
        col("created_at", ColKind::BigInt).not_null().default_to("0"),
        col("updated_at", ColKind::BigInt).not_null().default_to("0"),
    ],
    constraints: &["UNIQUE (token)"],
    indexes: &[],
};

const SYSTEM_SETTINGS: TableDef = TableDef {
    name: "system_settings",
    columns: &[
        col("key", ColKind::VarChar(128)).not_null(),
        col("value", ColKind::Text).not_null(),
        col("value_type", ColKind::VarChar(32))
            .not_null()
            .default_to("'string'"),
        col("description", ColKind::Text).not_null(),
        col("default_value", ColKind::Text).not_null(),
        col("updated_at", ColKind::BigInt).not_null().default_to("0"),
    ],
    constraints: &["PRIMARY KEY (`key`)"],
    indexes: &[],
};

const ADMIN_SESSIONS: TableDef = TableDef {
    name: "admin_sessions",
    columns: &[
        col("token", ColKind::VarChar(64)).not_null(),
        col("expires_at", ColKind::BigInt).not_null(),
        col("created_at", ColKind::BigInt).not_null(),
    ],
    constraints: &["PRIMARY KEY (token)"],
    indexes: &[],
};

const SCHEMA_MIGRATIONS: TableDef = TableDef {
    name: "schema_migrations",
    columns: &[
        col("version", ColKind::VarChar(64)).not_null(),
        col("applied_at", ColKind::BigInt).not_null(),
    ],
    constraints: &["PRIMARY KEY (version)"],
    indexes: &[],
};

const LOGS: TableDef = TableDef {
    name: "logs",
    columns: &[
        col("id", ColKind::AutoId),
        col("time", ColKind::BigInt).not_null(),
        col("minute_bucket", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("model", ColKind::VarChar(191)).not_null().default_to("''"),
        col("actual_model", ColKind::VarChar(191))
            .not_null()
            .default_to("''"),
        col("channel_id", ColKind::BigInt).not_null().default_to("0"),
        col("status_code", ColKind::Int).not_null().default_to("0"),
        col("message", ColKind::Text).not_null(),
        col("duration", ColKind::Double).not_null().default_to("0"),
        col("is_streaming", ColKind::TinyInt)
            .not_null()
            .default_to("0"),
        col("first_byte_time", ColKind::Double)
            .not_null()
            .default_to("0"),
        col("api_key_used", ColKind::VarChar(64))
            .not_null()
            .default_to("''"),
        col("api_key_hash", ColKind::VarChar(64))
            .not_null()
            .default_to("''"),
        col("auth_token_id", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("client_ip", ColKind::VarChar(64))
            .not_null()
            .default_to("''"),
        col("input_tokens", ColKind::BigInt).not_null().default_to("0"),
        col("output_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cache_read_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cache_creation_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cache_5m_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cache_1h_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
        col("cost", ColKind::Double).not_null().default_to("0"),
    ],
    constraints: &[],
    indexes: &[
        IndexDef {
            name: "idx_logs_time_model",
            columns: "time, model",
        },
        IndexDef {
            name: "idx_logs_time_status",
            columns: "time, status_code",
        },
        IndexDef {
            name: "idx_logs_time_channel_model",
            columns: "time, channel_id, model",
        },
        IndexDef {
            name: "idx_logs_minute_channel_model",
            columns: "minute_bucket, channel_id, model",
        },
        IndexDef {
            name: "idx_logs_time_token",
            columns: "time, auth_token_id",
        },
        IndexDef {
            name: "idx_logs_time_actual_model",
            columns: "time, actual_model",
        },
    ],
};

/// Creation order: ledger first, then FK parents before children.
const ALL_TABLES: &[&TableDef] = &[
    &SCHEMA_MIGRATIONS,
    &CHANNELS,
    &API_KEYS,
    &CHANNEL_MODELS,
    &AUTH_TOKENS,
    &SYSTEM_SETTINGS,
    &ADMIN_SESSIONS,
    &LOGS,
];

/// Config tables the hybrid sync restores, in restore order (FK parents
/// first; deleting `channels` cascades into its children before they are
/// re-filled).
pub(crate) const CONFIG_SYNC_TABLES: &[&TableDef] = &[
    &SYSTEM_SETTINGS,
    &CHANNELS,
    &CHANNEL_MODELS,
    &API_KEYS,
    &AUTH_TOKENS,
];

/// The log table declaration, for the sync log copy
pub(crate) const LOGS_TABLE: &TableDef = &LOGS;

/// Columns added after the tables first shipped. Each add is guarded by a
/// live-schema check, so re-running is a no-op and fresh databases (whose
/// CREATE TABLE already carries the column) skip straight through.
const INCREMENTAL_COLUMNS: &[(&str, ColumnDef)] = &[
    (
        "channels",
        col("daily_cost_limit", ColKind::Double)
            .not_null()
            .default_to("0"),
    ),
    (
        "api_keys",
        col("key_strategy", ColKind::VarChar(32))
            .not_null()
            .default_to("'sequential'"),
    ),
    (
        "auth_tokens",
        col("cost_limit_microusd", ColKind::BigInt)
            .not_null()
            .default_to("0"),
    ),
    ("auth_tokens", col("allowed_models", ColKind::Text)),
    (
        "logs",
        col("cache_5m_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
    ),
    (
        "logs",
        col("cache_1h_input_tokens", ColKind::BigInt)
            .not_null()
            .default_to("0"),
    ),
];

/// Settings seeded on first boot: key, value, type, description.
const DEFAULT_SETTINGS: &[(&str, &str, SettingType, &str)] = &[
    (
        "log_retention_days",
        "7",
        SettingType::Int,
        "Days of request logs to keep",
    ),
    (
        "max_key_retries",
        "3",
        SettingType::Int,
        "Key attempts per channel before failing over",
    ),
    (
        "upstream_first_byte_timeout",
        "0",
        SettingType::Duration,
        "Streaming first-byte timeout in seconds; 0 disables",
    ),
    (
        "non_stream_timeout",
        "120",
        SettingType::Duration,
        "Non-streaming request timeout in seconds",
    ),
    (
        "channel_test_content",
        "sonnet 4.0的发布日期是什么",
        SettingType::String,
        "Prompt sent by the channel connectivity test",
    ),
    (
        "channel_stats_range",
        "today",
        SettingType::String,
        "Default dashboard stats range",
    ),
    (
        "enable_health_score",
        "false",
        SettingType::Bool,
        "Weight routing by recent channel health",
    ),
    (
        "success_rate_penalty_weight",
        "100",
        SettingType::Int,
        "Priority penalty applied per point of failure rate",
    ),
    (
        "health_score_window_minutes",
        "30",
        SettingType::Int,
        "Window for success-rate sampling",
    ),
    (
        "health_score_update_interval",
        "30",
        SettingType::Int,
        "Seconds between health score refreshes",
    ),
    (
        "health_min_confident_sample",
        "20",
        SettingType::Int,
        "Minimum eligible samples before a rate is trusted",
    ),
    (
        "cooldown_fallback_enabled",
        "true",
        SettingType::Bool,
        "Route to cooling channels when none are healthy",
    ),
    (
        "model_fuzzy_match",
        "false",
        SettingType::Bool,
        "Match models by prefix instead of exact name",
    ),
];

/// Ledger key for the JSON model-list split
const MIGRATION_CHANNEL_MODELS: &str = "channel_models_from_json";
/// Ledger key for the minute-bucket backfill
const MIGRATION_MINUTE_BUCKET: &str = "logs_minute_bucket_backfill";

/// Rows per backfill batch
const BACKFILL_BATCH: i64 = 5_000;

// ============================================
// Migrator
// ============================================

/// Run all pending migrations.
///
/// Safe to run on every startup and on both sides of a hybrid
/// deployment; every step is idempotent or ledger-guarded.
pub async fn run_migrations(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    tracing::info!(?dialect, "Checking database migrations");

    for table in ALL_TABLES {
        sqlx::query(&table.create_sql(dialect))
            .execute(pool)
            .await
            .map_err(|e| Error::Migration(format!("create table {}: {e}", table.name)))?;
    }

    for (table, column) in INCREMENTAL_COLUMNS {
        add_column_if_missing(pool, dialect, table, column).await?;
    }

    for table in ALL_TABLES {
        for index in table.indexes {
            create_index(pool, dialect, table.name, index).await?;
        }
    }

    migrate_channel_models_from_json(pool, dialect).await?;
    seed_default_settings(pool, dialect).await?;
    backfill_minute_buckets(pool, dialect).await?;

    tracing::info!(?dialect, "Migrations complete");
    Ok(())
}

/// True if the live table already has `column`
pub(crate) async fn has_column(
    pool: &AnyPool,
    dialect: Dialect,
    table: &str,
    column: &str,
) -> Result<bool> {
    let count: i64 = match dialect {
        Dialect::Sqlite => {
            sqlx::query(&format!(
                "SELECT COUNT(*) AS n FROM pragma_table_info('{table}') WHERE name = ?"
            ))
            .bind(column)
            .fetch_one(pool)
            .await?
            .try_get("n")?
        }
        Dialect::MySql => sqlx::query(
            "SELECT COUNT(*) AS n FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = ?",
        )
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await?
        .try_get("n")?,
    };
    Ok(count > 0)
}

async fn add_column_if_missing(
    pool: &AnyPool,
    dialect: Dialect,
    table: &str,
    column: &ColumnDef,
) -> Result<()> {
    if has_column(pool, dialect, table, column.name).await? {
        return Ok(());
    }

    tracing::info!(table, column = column.name, "Adding column");
    let sql = format!("ALTER TABLE {table} ADD COLUMN {}", column.render(dialect));
    sqlx::query(&sql)
        .execute(pool)
        .await
        .map_err(|e| Error::Migration(format!("add column {table}.{}: {e}", column.name)))?;
    Ok(())
}

async fn create_index(
    pool: &AnyPool,
    dialect: Dialect,
    table: &str,
    index: &IndexDef,
) -> Result<()> {
    match dialect {
        Dialect::Sqlite => {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {table} ({})",
                index.name, index.columns
            );
            sqlx::query(&sql)
                .execute(pool)
                .await
                .map_err(|e| Error::Migration(format!("create index {}: {e}", index.name)))?;
        }
        Dialect::MySql => {
            // No IF NOT EXISTS on older MySQL; swallow "Duplicate key name"
            let sql = format!(
                "CREATE INDEX {} ON {table} ({})",
                index.name, index.columns
            );
            if let Err(e) = sqlx::query(&sql).execute(pool).await {
                if !is_duplicate_index(&e) {
                    return Err(Error::Migration(format!(
                        "create index {}: {e}",
                        index.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn is_duplicate_index(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(dbe) => {
            dbe.code().as_deref() == Some("1061") || dbe.message().contains("Duplicate key name")
        }
        _ => false,
    }
}

/// True once `version` is recorded in the ledger
async fn migration_applied(pool: &AnyPool, version: &str) -> Result<bool> {
    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM schema_migrations WHERE version = ?")
        .bind(version)
        .fetch_one(pool)
        .await?
        .try_get("n")?;
    Ok(count > 0)
}

/// Move legacy JSON model lists on `channels.models` into `channel_models`
/// rows. Ledger-guarded: a partial earlier run re-applies cleanly because
/// the row inserts are insert-ignore.
async fn migrate_channel_models_from_json(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    if migration_applied(pool, MIGRATION_CHANNEL_MODELS).await? {
        return Ok(());
    }

    if has_column(pool, dialect, "channels", "models").await? {
        let rows = sqlx::query(
            "SELECT id, models FROM channels WHERE models IS NOT NULL AND models != ''",
        )
        .fetch_all(pool)
        .await?;

        let mut tx = pool.begin().await?;
        let insert = format!(
            "{} INTO channel_models (channel_id, model, redirect_model, created_at) \
             VALUES (?, ?, ?, ?)",
            dialect.insert_ignore()
        );
        let now = now_secs();
        let mut migrated = 0usize;

        for row in &rows {
            let channel_id: i64 = row.try_get("id")?;
            let raw: String = row.try_get("models")?;
            for entry in parse_legacy_models(&raw) {
                sqlx::query(&insert)
                    .bind(channel_id)
                    .bind(&entry.0)
                    .bind(&entry.1)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                migrated += 1;
            }
        }

        stamp_migration(&mut tx, dialect, MIGRATION_CHANNEL_MODELS).await?;
        tx.commit().await?;
        tracing::info!(channels = rows.len(), rows = migrated, "Migrated model lists to channel_models");
    } else {
        let mut tx = pool.begin().await?;
        stamp_migration(&mut tx, dialect, MIGRATION_CHANNEL_MODELS).await?;
        tx.commit().await?;
    }
    Ok(())
}

/// Decode a legacy `models` JSON value: either `["m1", "m2"]` or
/// `[{"model": "alias", "redirect_model": "m1"}, ...]`.
fn parse_legacy_models(raw: &str) -> Vec<(String, String)> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(model) if !model.is_empty() => {
                Some((model.clone(), String::new()))
            }
            serde_json::Value::Object(map) => {
                let model = map.get("model")?.as_str()?.to_string();
                let redirect = map
                    .get("redirect_model")
                    .and_then(|r| r.as_str())
                    .unwrap_or("")
                    .to_string();
                (!model.is_empty()).then_some((model, redirect))
            }
            _ => None,
        })
        .collect()
}

async fn stamp_migration(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    dialect: Dialect,
    version: &str,
) -> Result<()> {
    let sql = format!(
        "{} INTO schema_migrations (version, applied_at) VALUES (?, ?)",
        dialect.insert_ignore()
    );
    sqlx::query(&sql)
        .bind(version)
        .bind(now_secs())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn seed_default_settings(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    let sql = format!(
        "{} INTO system_settings (`key`, value, value_type, description, default_value, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        dialect.insert_ignore()
    );
    let now = now_secs();
    for (key, value, value_type, description) in DEFAULT_SETTINGS {
        sqlx::query(&sql)
            .bind(*key)
            .bind(*value)
            .bind(value_type.as_str())
            .bind(*description)
            .bind(*value)
            .bind(now)
            .execute(pool)
            .await
            .map_err(|e| Error::Migration(format!("seed setting {key}: {e}")))?;
    }
    Ok(())
}

/// Backfill `minute_bucket` on pre-existing log rows in bounded batches.
///
/// The inner derived table keeps the statement legal on MySQL, which
/// refuses a subquery on the update target. Rows below one minute of unix
/// time cannot be distinguished from already-backfilled rows and are left
/// alone.
async fn backfill_minute_buckets(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    if migration_applied(pool, MIGRATION_MINUTE_BUCKET).await? {
        return Ok(());
    }

    let sql = format!(
        "UPDATE logs SET minute_bucket = time / 60000 \
         WHERE id IN (SELECT id FROM (SELECT id FROM logs \
           WHERE minute_bucket = 0 AND time >= 60000 LIMIT {BACKFILL_BATCH}) AS batch)"
    );

    let mut total = 0u64;
    loop {
        let affected = sqlx::query(&sql).execute(pool).await?.rows_affected();
        total += affected;
        if affected == 0 {
            break;
        }
    }
    if total > 0 {
        tracing::info!(rows = total, "Backfilled log minute buckets");
    }

    let mut tx = pool.begin().await?;
    stamp_migration(&mut tx, dialect, MIGRATION_MINUTE_BUCKET).await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::AnyPoolOptions;

    async fn sqlite_pool(dir: &tempfile::TempDir) -> AnyPool {
        sqlx::any::install_default_drivers();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        AnyPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;

        run_migrations(&pool, Dialect::Sqlite).await.unwrap();
        run_migrations(&pool, Dialect::Sqlite).await.unwrap();

        let tables = [
            "channels",
            "api_keys",
            "channel_models",
            "auth_tokens",
            "system_settings",
            "admin_sessions",
            "schema_migrations",
            "logs",
        ];
        for table in tables {
            let count: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
            assert_eq!(count, 1, "table {table} should exist");
        }
    }

    #[tokio::test]
    async fn test_default_settings_seeded_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        run_migrations(&pool, Dialect::Sqlite).await.unwrap();

        // Overwrite one setting, re-run, and check the edit survives
        sqlx::query("UPDATE system_settings SET value = '30' WHERE `key` = 'log_retention_days'")
            .execute(&pool)
            .await
            .unwrap();
        run_migrations(&pool, Dialect::Sqlite).await.unwrap();

        let value: String =
            sqlx::query("SELECT value FROM system_settings WHERE `key` = 'log_retention_days'")
                .fetch_one(&pool)
                .await
                .unwrap()
                .try_get("value")
                .unwrap();
        assert_eq!(value, "30");

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM system_settings")
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count as usize, super::DEFAULT_SETTINGS.len());
    }

    #[tokio::test]
    async fn test_legacy_model_json_split() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;

        // Simulate an old database: channels with a JSON models column and
        // no ledger entry yet.
        sqlx::query(
            "CREATE TABLE channels (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, \
             url TEXT NOT NULL DEFAULT '', priority INTEGER NOT NULL DEFAULT 0, \
             channel_type TEXT NOT NULL DEFAULT 'anthropic', enabled INTEGER NOT NULL DEFAULT 1, \
             cooldown_until INTEGER NOT NULL DEFAULT 0, cooldown_duration_ms INTEGER NOT NULL DEFAULT 0, \
             created_at INTEGER NOT NULL DEFAULT 0, updated_at INTEGER NOT NULL DEFAULT 0, \
             models TEXT, UNIQUE (name))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO channels (name, models) VALUES ('legacy', ?)")
            .bind(r#"["m-1", {"model": "alias-1", "redirect_model": "m-1"}]"#)
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool, Dialect::Sqlite).await.unwrap();

        let rows = sqlx::query(
            "SELECT model, redirect_model FROM channel_models ORDER BY model",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        let first: String = rows[0].try_get("model").unwrap();
        let first_redirect: String = rows[0].try_get("redirect_model").unwrap();
        assert_eq!(first, "alias-1");
        assert_eq!(first_redirect, "m-1");
    }

    #[tokio::test]
    async fn test_minute_bucket_backfill() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        run_migrations(&pool, Dialect::Sqlite).await.unwrap();

        // Old rows written before the column existed have bucket 0; wipe
        // the ledger entry and re-run to exercise the backfill.
        sqlx::query("INSERT INTO logs (time, minute_bucket, message) VALUES (180000, 0, '')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
            .bind(super::MIGRATION_MINUTE_BUCKET)
            .execute(&pool)
            .await
            .unwrap();
        run_migrations(&pool, Dialect::Sqlite).await.unwrap();

        let bucket: i64 = sqlx::query("SELECT minute_bucket FROM logs WHERE time = 180000")
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("minute_bucket")
            .unwrap();
        assert_eq!(bucket, 3);
    }

    #[test]
    fn test_create_sql_dialects() {
        let sqlite = CHANNELS.create_sql(Dialect::Sqlite);
        assert!(sqlite.contains("INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!sqlite.contains("VARCHAR"));

        let mysql = CHANNELS.create_sql(Dialect::MySql);
        assert!(mysql.contains("BIGINT NOT NULL AUTO_INCREMENT"));
        assert!(mysql.contains("VARCHAR(191)"));
        assert!(mysql.contains("PRIMARY KEY (id)"));
        assert!(mysql.contains("ENGINE=InnoDB"));
    }

    #[test]
    fn test_parse_legacy_models() {
        assert!(parse_legacy_models("not json").is_empty());
        assert!(parse_legacy_models("{}").is_empty());
        let entries = parse_legacy_models(r#"["a", {"model": "b", "redirect_model": "c"}, ""]"#);
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), String::new()),
                ("b".to_string(), "c".to_string())
            ]
        );
    }
}
