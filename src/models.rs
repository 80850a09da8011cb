//! Core data model: accounts, transient per-request records, and usage records.
//!
//! `Account` is the only durable, mutable entity in the system; everything
//! else here is either produced fresh per request or persisted write-only
//! through the async writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Selection weight. Fixed to three values so the balancer's virtual-queue
/// math stays simple integer division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Tier {
    One,
    Five,
    Twenty,
}

impl Tier {
    pub fn weight(self) -> i64 {
        match self {
            Tier::One => 1,
            Tier::Five => 5,
            Tier::Twenty => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTier(pub i64);

impl std::fmt::Display for InvalidTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid tier: {} (expected 1, 5, or 20)", self.0)
    }
}

impl std::error::Error for InvalidTier {}

impl TryFrom<i64> for Tier {
    type Error = InvalidTier;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::One),
            5 => Ok(Tier::Five),
            20 => Ok(Tier::Twenty),
            other => Err(InvalidTier(other)),
        }
    }
}

impl From<Tier> for i64 {
    fn from(tier: Tier) -> i64 {
        tier.weight()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    OAuth,
    ApiKey,
}

/// A rate-limit override an operator can set manually via the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub limit: i64,
    pub window_minutes: i64,
}

/// One authenticated principal against the upstream.
///
/// `access_token`/`api_key` are never both populated; `expires_at` is
/// `Some` iff `auth_type == OAuth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub tier: Tier,
    pub auth_type_raw: String,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub paused: bool,
    pub rate_limit_status: Option<String>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_override_limit: Option<i64>,
    pub rate_limit_override_window_minutes: Option<i64>,
    pub session_start: Option<DateTime<Utc>>,
    pub session_request_count: i64,
    pub request_count: i64,
    pub total_requests: i64,
}

/// Hand-written rather than `#[derive(FromRow)]`: SQLite has no native UUID
/// type, so `id` is stored as its canonical hyphenated text form (see
/// `migrations/0001_init.sql`) — but sqlx's `Uuid: Decode<Sqlite>` impl
/// (via the `uuid` feature) expects a 16-byte BLOB, not that text. Parsing
/// the column as a `String` and converting it ourselves is what actually
/// round-trips; `tier`/`auth_type` still decode as plain columns the way
/// `#[derive(FromRow)]` would have done for them.
impl<'r> FromRow<'r, SqliteRow> for Account {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let id_text: String = row.try_get("id")?;
        let id = Uuid::parse_str(&id_text).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".to_string(),
            source: Box::new(e),
        })?;
        let tier_raw: i64 = row.try_get("tier")?;
        let tier = Tier::try_from(tier_raw).map_err(|e| sqlx::Error::ColumnDecode {
            index: "tier".to_string(),
            source: Box::new(e),
        })?;

        Ok(Account {
            id,
            name: row.try_get("name")?,
            provider: row.try_get("provider")?,
            tier,
            auth_type_raw: row.try_get("auth_type")?,
            refresh_token: row.try_get("refresh_token")?,
            access_token: row.try_get("access_token")?,
            expires_at: row.try_get("expires_at")?,
            api_key: row.try_get("api_key")?,
            base_url: row.try_get("base_url")?,
            paused: row.try_get("paused")?,
            rate_limit_status: row.try_get("rate_limit_status")?,
            rate_limit_reset_at: row.try_get("rate_limit_reset_at")?,
            rate_limit_remaining: row.try_get("rate_limit_remaining")?,
            rate_limit_override_limit: row.try_get("rate_limit_override_limit")?,
            rate_limit_override_window_minutes: row
                .try_get("rate_limit_override_window_minutes")?,
            session_start: row.try_get("session_start")?,
            session_request_count: row.try_get("session_request_count")?,
            request_count: row.try_get("request_count")?,
            total_requests: row.try_get("total_requests")?,
        })
    }
}

impl Account {
    pub fn auth_type(&self) -> AuthType {
        if self.auth_type_raw == "oauth" {
            AuthType::OAuth
        } else {
            AuthType::ApiKey
        }
    }

    pub fn rate_limit_override(&self) -> Option<RateLimitOverride> {
        match (
            self.rate_limit_override_limit,
            self.rate_limit_override_window_minutes,
        ) {
            (Some(limit), Some(window_minutes)) => Some(RateLimitOverride {
                limit,
                window_minutes,
            }),
            _ => None,
        }
    }

    /// Redacted view suitable for `GET /api/accounts`.
    pub fn to_redacted(&self) -> RedactedAccount {
        RedactedAccount {
            id: self.id,
            name: self.name.clone(),
            provider: self.provider.clone(),
            tier: self.tier,
            auth_type: self.auth_type(),
            base_url: self.base_url.clone(),
            paused: self.paused,
            rate_limit_status: self.rate_limit_status.clone(),
            rate_limit_reset_at: self.rate_limit_reset_at,
            rate_limit_remaining: self.rate_limit_remaining,
            rate_limit_override: self.rate_limit_override(),
            session_request_count: self.session_request_count,
            request_count: self.request_count,
            total_requests: self.total_requests,
            has_valid_credentials: match self.auth_type() {
                AuthType::ApiKey => self.api_key.is_some(),
                AuthType::OAuth => {
                    self.access_token.is_some() || self.refresh_token.is_some()
                }
            },
        }
    }
}

/// What `GET /api/accounts` actually returns — no token material.
#[derive(Debug, Clone, Serialize)]
pub struct RedactedAccount {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub tier: Tier,
    pub auth_type: AuthType,
    pub base_url: Option<String>,
    pub paused: bool,
    pub rate_limit_status: Option<String>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_override: Option<RateLimitOverride>,
    pub session_request_count: i64,
    pub request_count: i64,
    pub total_requests: i64,
    pub has_valid_credentials: bool,
}

/// Parsed rate-limit signal from a single upstream response.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSignal {
    pub is_rate_limited: bool,
    pub reset_at: Option<DateTime<Utc>>,
    pub remaining: Option<i64>,
    pub status_tag: Option<String>,
}

/// Per-request metadata generated at the start of the pipeline.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub agent_hint: Option<String>,
}

impl RequestMeta {
    pub fn new(method: String, path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            method,
            path,
            agent_hint: None,
        }
    }
}

/// Why an attempt failed over, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    RateLimit,
    NonSuccess,
    Auth,
    TransientAuth,
}

/// One attempt at forwarding a request to one account.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub account_id: Option<Uuid>,
    pub status: Option<u16>,
    pub began_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failover_reason: Option<FailoverReason>,
}

/// A persisted record of one completed (or abandoned) request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub account_id: Option<Uuid>,
    pub path: String,
    pub method: String,
    pub status: i64,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_estimate: Option<f64>,
    pub agent: Option<String>,
    pub attempts: i64,
    pub truncated: bool,
}

/// Same rationale as `Account`'s manual impl above: `request_id`/
/// `account_id` are stored as text UUIDs, which sqlx's blob-oriented
/// `Uuid: Decode<Sqlite>` can't parse directly.
impl<'r> FromRow<'r, SqliteRow> for UsageRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let request_id_text: String = row.try_get("request_id")?;
        let request_id =
            Uuid::parse_str(&request_id_text).map_err(|e| sqlx::Error::ColumnDecode {
                index: "request_id".to_string(),
                source: Box::new(e),
            })?;
        let account_id_text: Option<String> = row.try_get("account_id")?;
        let account_id = account_id_text
            .map(|text| {
                Uuid::parse_str(&text).map_err(|e| sqlx::Error::ColumnDecode {
                    index: "account_id".to_string(),
                    source: Box::new(e),
                })
            })
            .transpose()?;

        Ok(UsageRecord {
            request_id,
            account_id,
            path: row.try_get("path")?,
            method: row.try_get("method")?,
            status: row.try_get("status")?,
            timestamp: row.try_get("timestamp")?,
            duration_ms: row.try_get("duration_ms")?,
            input_tokens: row.try_get("input_tokens")?,
            output_tokens: row.try_get("output_tokens")?,
            cost_estimate: row.try_get("cost_estimate")?,
            agent: row.try_get("agent")?,
            attempts: row.try_get("attempts")?,
            truncated: row.try_get("truncated")?,
        })
    }
}

/// Pagination parameters for `GET /api/requests`.
#[derive(Debug, Clone, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageParams {
    pub fn limit_or_default(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    pub fn offset_or_default(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
