//! Core domain types for ccload-core
//!
//! These types are the canonical data model shared by the SQL store, the
//! channel cache, and the hybrid replication layer.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Channel** | One upstream LLM endpoint with a priority and a pool of API keys |
//! | **ApiKey** | One credential under a Channel, addressed by `(channel_id, key_index)` |
//! | **ModelEntry** | "Channel supports model X", optionally rewritten to another upstream name |
//! | **AuthToken** | Client-side bearer token (stored as a SHA-256 hex digest) |
//! | **LogEntry** | One forwarded request outcome, append-only |
//! | **Cooldown** | Timestamped prohibition on a Channel or ApiKey, grown exponentially on failure |
//!
//! Timestamps follow the wire conventions of the gateway: `cooldown_until`
//! and session/token expiries are unix **seconds**, log `time` is unix
//! **milliseconds**, and cooldown durations are **milliseconds**. A zero
//! value always means "unset".

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================
// Time helpers
// ============================================

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Minute bucket for a millisecond timestamp (`floor(ms / 60000)`)
pub fn minute_bucket(time_ms: i64) -> i64 {
    time_ms / 60_000
}

// ============================================
// Hashing and masking
// ============================================

/// SHA-256 hex digest of a plaintext token or key
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mask an API key for display and log storage.
///
/// Short keys collapse entirely; longer keys keep the first and last four
/// characters. The raw secret must never reach a log row.
pub fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &key[..4], &key[key.len() - 4..])
}

// ============================================
// Channel
// ============================================

/// One upstream LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Database id
    pub id: i64,
    /// Unique display name
    pub name: String,
    /// Upstream base URL
    pub url: String,
    /// Routing priority; higher is preferred
    pub priority: i64,
    /// Upstream protocol family ("anthropic", "openai", ...)
    pub channel_type: String,
    /// Disabled channels are never routed to
    pub enabled: bool,
    /// Unix seconds until which the channel is cooling; 0 = not cooling
    pub cooldown_until: i64,
    /// Current backoff length in milliseconds
    pub cooldown_duration_ms: i64,
    /// Daily USD budget; 0 = unlimited
    pub daily_cost_limit: f64,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
    /// Models this channel serves (read-side projection of `channel_models`)
    pub model_entries: Vec<ModelEntry>,
    /// Number of API keys under this channel (computed on listings)
    pub key_count: i64,
}

/// "Channel supports `model`, sent upstream as `redirect_model` when set."
///
/// `model` is what the client requests; an empty `redirect_model` means no
/// rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Client-facing model name
    pub model: String,
    /// Upstream model name actually sent; empty = same as `model`
    #[serde(default)]
    pub redirect_model: String,
}

impl ModelEntry {
    /// Entry with no rewrite
    pub fn plain(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            redirect_model: String::new(),
        }
    }

    /// Entry rewriting `model` to `redirect`
    pub fn redirect(model: impl Into<String>, redirect: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            redirect_model: redirect.into(),
        }
    }
}

/// Input for channel create/replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Unique display name
    pub name: String,
    /// Upstream base URL
    pub url: String,
    /// Routing priority
    #[serde(default)]
    pub priority: i64,
    /// Upstream protocol family; empty defaults to "anthropic"
    #[serde(default)]
    pub channel_type: String,
    /// Whether the channel participates in routing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Daily USD budget; 0 = unlimited
    #[serde(default)]
    pub daily_cost_limit: f64,
    /// Full model set for the channel; writes replace all rows
    #[serde(default)]
    pub model_entries: Vec<ModelEntry>,
}

fn default_true() -> bool {
    true
}

impl ChannelRequest {
    /// Channel type with the default applied
    pub fn channel_type_or_default(&self) -> &str {
        if self.channel_type.is_empty() {
            "anthropic"
        } else {
            &self.channel_type
        }
    }
}

/// Partial channel update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub priority: Option<i64>,
    pub channel_type: Option<String>,
    pub enabled: Option<bool>,
    pub daily_cost_limit: Option<f64>,
    /// When set, the channel's model rows are rewritten to this set
    pub model_entries: Option<Vec<ModelEntry>>,
}

/// One channel plus its keys, as consumed by the batch importer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelImport {
    /// Channel fields (matched to existing channels by name)
    pub channel: ChannelRequest,
    /// Plaintext API keys in key-index order
    pub api_keys: Vec<String>,
    /// Strategy applied to all imported keys
    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

// ============================================
// API keys
// ============================================

/// How the gateway picks a key within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// First healthy key wins
    #[default]
    Sequential,
    /// Rotate across healthy keys
    RoundRobin,
}

impl KeyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Sequential => "sequential",
            KeyStrategy::RoundRobin => "round_robin",
        }
    }

    /// Parse a stored strategy; unknown values fall back to sequential
    pub fn parse(s: &str) -> Self {
        match s {
            "round_robin" => KeyStrategy::RoundRobin,
            _ => KeyStrategy::Sequential,
        }
    }
}

/// One credential under a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Database id
    pub id: i64,
    /// Owning channel
    pub channel_id: i64,
    /// Per-channel ordinal starting at 0; contiguous after compaction
    pub key_index: i64,
    /// The secret credential
    pub api_key: String,
    /// Selection strategy recorded per key row
    pub key_strategy: KeyStrategy,
    /// Unix seconds until which the key is cooling; 0 = not cooling
    pub cooldown_until: i64,
    /// Current backoff length in milliseconds
    pub cooldown_duration_ms: i64,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
}

// ============================================
// Auth tokens
// ============================================

/// Client-side bearer token with rolling usage counters.
///
/// `token` holds the SHA-256 hex of the plaintext; the plaintext is shown
/// once at creation and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    /// SHA-256 hex digest, unique
    pub token: String,
    pub description: String,
    pub is_active: bool,
    /// Unix seconds; 0 = never expires
    pub expires_at: i64,
    /// Unix seconds; 0 = never used
    pub last_used_at: i64,
    pub success_count: i64,
    pub failure_count: i64,
    /// Rolling average time-to-first-byte for streaming requests, ms
    pub stream_avg_ttfb_ms: f64,
    /// Rolling average round-trip for non-streaming requests, ms
    pub non_stream_avg_rt_ms: f64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    /// Accumulated spend in micro-USD
    pub cost_used_microusd: i64,
    /// Spend ceiling in micro-USD; 0 = unlimited
    pub cost_limit_microusd: i64,
    /// Models this token may request; empty = all
    pub allowed_models: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AuthToken {
    /// Encode `allowed_models` the way the column stores it
    pub fn allowed_models_column(&self) -> String {
        self.allowed_models.join(",")
    }

    /// Decode the comma-list column form
    pub fn parse_allowed_models(column: &str) -> Vec<String> {
        column
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Partial auth-token update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthTokenPatch {
    pub description: Option<String>,
    pub is_active: Option<bool>,
    /// 0 clears the expiry
    pub expires_at: Option<i64>,
    /// 0 removes the limit
    pub cost_limit_microusd: Option<i64>,
    /// Empty list allows all models
    pub allowed_models: Option<Vec<String>>,
}

/// One request's contribution to a token's rolling counters.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub success: bool,
    pub is_streaming: bool,
    /// Time to first byte in ms, streaming requests only
    pub first_byte_ms: Option<f64>,
    /// Full round-trip in ms, non-streaming requests only
    pub round_trip_ms: Option<f64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_microusd: i64,
}

// ============================================
// Log entries
// ============================================

/// One forwarded request outcome.
///
/// Rows are append-only and pruned by retention. `api_key_used` is always
/// the masked form; [`LogEntry::normalize`] enforces that together with the
/// `time`/`minute_bucket` stamping before any insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    /// Unix milliseconds; 0 is stamped at insert
    pub time: i64,
    /// `time / 60000`, denormalised so per-minute aggregations hit an index
    pub minute_bucket: i64,
    /// Client-requested model
    pub model: String,
    /// Upstream model after redirect; empty if not redirected
    pub actual_model: String,
    pub channel_id: i64,
    /// Channel display name; hydrated on listings, never persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    pub status_code: i64,
    pub message: String,
    /// Request duration in seconds
    pub duration: f64,
    pub is_streaming: bool,
    /// Time to first byte in seconds; 0 for non-streaming
    pub first_byte_time: f64,
    /// Masked key the request went out with
    pub api_key_used: String,
    /// SHA-256 hex of the raw key, for correlation without the secret
    pub api_key_hash: String,
    /// 0 = unauthenticated/admin traffic
    pub auth_token_id: i64,
    pub client_ip: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    /// Compat column: always `cache_5m + cache_1h`
    pub cache_creation_input_tokens: i64,
    pub cache_5m_input_tokens: i64,
    pub cache_1h_input_tokens: i64,
    /// USD
    pub cost: f64,
}

impl LogEntry {
    /// Stamp and sanitise an entry for insert.
    ///
    /// Fills `time` when zero, derives `minute_bucket`, masks
    /// `api_key_used` when it still looks raw, and derives the compat
    /// cache column from the split counters.
    pub fn normalize(&mut self) {
        if self.time == 0 {
            self.time = now_millis();
        }
        self.minute_bucket = minute_bucket(self.time);
        if !self.api_key_used.is_empty() && !self.api_key_used.contains("****") {
            if self.api_key_hash.is_empty() {
                self.api_key_hash = sha256_hex(&self.api_key_used);
            }
            self.api_key_used = mask_api_key(&self.api_key_used);
        }
        if self.cache_5m_input_tokens != 0 || self.cache_1h_input_tokens != 0 {
            self.cache_creation_input_tokens =
                self.cache_5m_input_tokens + self.cache_1h_input_tokens;
        }
    }
}

/// HTTP status class selector for log filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Success,
    Redirect,
    ClientError,
    ServerError,
}

impl StatusClass {
    /// Half-open status range `[lo, hi)` for this class
    pub fn range(&self) -> (i64, i64) {
        match self {
            StatusClass::Success => (200, 300),
            StatusClass::Redirect => (300, 400),
            StatusClass::ClientError => (400, 500),
            StatusClass::ServerError => (500, 600),
        }
    }
}

/// Filter applied to log listings and range aggregations.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Exact match on the client-requested model
    pub model: Option<String>,
    /// Channel display name; resolved to ids before the log query
    pub channel_name: Option<String>,
    /// Treat `channel_name` as a substring (LIKE) match
    pub channel_name_like: bool,
    pub status_class: Option<StatusClass>,
    pub streaming_only: bool,
    pub auth_token_id: Option<i64>,
}

impl LogFilter {
    /// True when no predicate is set
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.channel_name.is_none()
            && self.status_class.is_none()
            && !self.streaming_only
            && self.auth_token_id.is_none()
    }
}

// ============================================
// Aggregation rows
// ============================================

/// Per-bucket success/error counts for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketPoint {
    /// Bucket start, unix seconds
    pub bucket_start: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub success: i64,
    pub error: i64,
}

/// Aggregated counters for one `(channel, model)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEntry {
    pub channel_id: i64,
    pub channel_name: String,
    pub model: String,
    pub total: i64,
    pub success: i64,
    pub error: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cost: f64,
}

/// Count-only variant of [`StatsEntry`] for dashboards that poll often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsLiteEntry {
    pub channel_id: i64,
    pub model: String,
    pub total: i64,
    pub success: i64,
    pub error: i64,
}

/// Requests and token volume for one minute bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpmPoint {
    pub minute_bucket: i64,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

// ============================================
// Settings
// ============================================

/// Declared type of a system setting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    Int,
    Bool,
    Duration,
    String,
    Float,
}

impl SettingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingType::Int => "int",
            SettingType::Bool => "bool",
            SettingType::Duration => "duration",
            SettingType::String => "string",
            SettingType::Float => "float",
        }
    }

    /// Parse a stored type name; unknown values read as string
    pub fn parse(s: &str) -> Self {
        match s {
            "int" => SettingType::Int,
            "bool" => SettingType::Bool,
            "duration" => SettingType::Duration,
            "float" => SettingType::Float,
            _ => SettingType::String,
        }
    }
}

/// Typed key/value configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSetting {
    pub key: String,
    pub value: String,
    pub value_type: SettingType,
    pub description: String,
    pub default_value: String,
    pub updated_at: i64,
}

impl SystemSetting {
    /// Integer view; falls back to the declared default on parse failure
    pub fn as_i64(&self) -> Option<i64> {
        self.value
            .parse()
            .ok()
            .or_else(|| self.default_value.parse().ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        fn parse(s: &str) -> Option<bool> {
            match s {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            }
        }
        parse(&self.value).or_else(|| parse(&self.default_value))
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value
            .parse()
            .ok()
            .or_else(|| self.default_value.parse().ok())
    }

    /// Duration view; the column stores whole seconds
    pub fn as_duration(&self) -> Option<std::time::Duration> {
        self.as_i64()
            .filter(|s| *s >= 0)
            .map(|s| std::time::Duration::from_secs(s as u64))
    }
}

// ============================================
// Admin sessions
// ============================================

/// Admin login session; `token` is the SHA-256 hex of the cookie value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSession {
    pub token: String,
    /// Unix seconds
    pub expires_at: i64,
    /// Unix seconds
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("short"), "****");
        assert_eq!(mask_api_key("sk-ant-1234567890abcd"), "sk-a****abcd");
        // Masked output never contains the middle of the secret
        assert!(!mask_api_key("sk-ant-1234567890abcd").contains("567890"));
    }

    #[test]
    fn test_sha256_hex() {
        // Stable digest, lowercase hex, 64 chars
        let digest = sha256_hex("hello");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_minute_bucket() {
        assert_eq!(minute_bucket(0), 0);
        assert_eq!(minute_bucket(59_999), 0);
        assert_eq!(minute_bucket(60_000), 1);
        assert_eq!(minute_bucket(1_700_000_123_456), 28_333_335);
    }

    #[test]
    fn test_key_strategy_round_trip() {
        assert_eq!(KeyStrategy::parse("round_robin"), KeyStrategy::RoundRobin);
        assert_eq!(KeyStrategy::parse("sequential"), KeyStrategy::Sequential);
        assert_eq!(KeyStrategy::parse("garbage"), KeyStrategy::Sequential);
        assert_eq!(KeyStrategy::RoundRobin.as_str(), "round_robin");
    }

    #[test]
    fn test_log_entry_normalize_stamps_time() {
        let mut entry = LogEntry {
            api_key_used: "sk-ant-1234567890abcd".to_string(),
            ..Default::default()
        };
        entry.normalize();

        assert!(entry.time > 0);
        assert_eq!(entry.minute_bucket, entry.time / 60_000);
        assert_eq!(entry.api_key_used, "sk-a****abcd");
        assert_eq!(entry.api_key_hash, sha256_hex("sk-ant-1234567890abcd"));
    }

    #[test]
    fn test_log_entry_normalize_keeps_masked_key() {
        let mut entry = LogEntry {
            time: 120_000,
            api_key_used: "sk-a****abcd".to_string(),
            api_key_hash: "precomputed".to_string(),
            ..Default::default()
        };
        entry.normalize();

        assert_eq!(entry.time, 120_000);
        assert_eq!(entry.minute_bucket, 2);
        assert_eq!(entry.api_key_used, "sk-a****abcd");
        assert_eq!(entry.api_key_hash, "precomputed");
    }

    #[test]
    fn test_log_entry_cache_compat_column() {
        let mut entry = LogEntry {
            time: 1,
            cache_5m_input_tokens: 100,
            cache_1h_input_tokens: 25,
            ..Default::default()
        };
        entry.normalize();
        assert_eq!(entry.cache_creation_input_tokens, 125);
    }

    #[test]
    fn test_allowed_models_column_round_trip() {
        let models = AuthToken::parse_allowed_models("claude-3, claude-4,,");
        assert_eq!(models, vec!["claude-3", "claude-4"]);
        assert!(AuthToken::parse_allowed_models("").is_empty());
    }

    #[test]
    fn test_setting_typed_views() {
        let setting = SystemSetting {
            key: "non_stream_timeout".into(),
            value: "120".into(),
            value_type: SettingType::Duration,
            description: String::new(),
            default_value: "120".into(),
            updated_at: 0,
        };
        assert_eq!(
            setting.as_duration(),
            Some(std::time::Duration::from_secs(120))
        );

        let broken = SystemSetting {
            value: "not-a-number".into(),
            default_value: "7".into(),
            ..setting
        };
        assert_eq!(broken.as_i64(), Some(7));
    }

    #[test]
    fn test_status_class_ranges() {
        assert_eq!(StatusClass::Success.range(), (200, 300));
        assert_eq!(StatusClass::ServerError.range(), (500, 600));
    }
}
