//! Rotation state data model
//!
//! The persisted shape shared with the rotation store: which key is active, and every
//! known key with its status, usage snapshot and health-check bookkeeping.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

lazy_static! {
    /// Known token prefix conventions, e.g. `sk-ant-oat01-` or `sk-ant-api03-`
    static ref TOKEN_PREFIX: Regex = Regex::new(r"^sk-ant-[a-z]+\d*-").unwrap();
}

/// Length of a derived key identifier (hex chars)
pub const KEY_ID_LEN: usize = 16;

/// Length of the identifier prefix that is safe to log
pub const SHORT_ID_LEN: usize = 8;

/// Derive the stable key identifier for an access token
///
/// Prefix conventions are stripped first so the same credential always maps to the
/// same identifier however it was prefixed.
pub fn derive_key_id(token: &str) -> String {
    let token = token.trim();
    let stripped = TOKEN_PREFIX
        .find(token)
        .map(|m| &token[m.end()..])
        .or_else(|| token.strip_prefix("sk-ant-"))
        .unwrap_or(token);

    let digest = Sha256::digest(stripped.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(KEY_ID_LEN);
    id
}

/// Truncated identifier for log lines
pub fn short_id(key_id: &str) -> &str {
    key_id.get(..SHORT_ID_LEN).unwrap_or(key_id)
}

/// Lifecycle status of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Exhausted,
    Expired,
    Invalid,
    /// Retained dead marker: the token must never be used again
    Tombstone,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Exhausted => "exhausted",
            KeyStatus::Expired => "expired",
            KeyStatus::Invalid => "invalid",
            KeyStatus::Tombstone => "tombstone",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage utilisation snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct UsageSnapshot {
    pub five_hour: f64,
    pub seven_day: f64,
    pub seven_day_sonnet: f64,
    /// Epoch milliseconds the snapshot was taken
    pub checked_at: i64,
}

impl UsageSnapshot {
    /// 100% across every bucket, stamped at `now_ms`
    pub fn saturated(now_ms: i64) -> Self {
        Self {
            five_hour: 100.0,
            seven_day: 100.0,
            seven_day_sonnet: 100.0,
            checked_at: now_ms,
        }
    }

    /// Highest utilisation across the buckets
    pub fn peak(&self) -> f64 {
        self.five_hour.max(self.seven_day).max(self.seven_day_sonnet)
    }

    pub fn is_saturated(&self) -> bool {
        self.peak() >= 100.0
    }
}

/// One credential known to the rotation store
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KeyEntry {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_tier: Option<String>,
    #[serde(default)]
    pub status: KeyStatus,
    /// Access token expiry, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<UsageSnapshot>,
    /// Last live verification, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<i64>,
    /// Fields written by other tools; kept as-is on every write
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl KeyEntry {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: KeyStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_token(&self) -> bool {
        !self.access_token.trim().is_empty()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.map(|at| at <= now_ms).unwrap_or(false)
    }

    /// An active key without a refresh token cannot be renewed
    pub fn is_misconfigured(&self) -> bool {
        self.status == KeyStatus::Active
            && self
                .refresh_token
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
    }

    /// Whether this entry may be handed to the upstream
    pub fn is_usable(&self, now_ms: i64) -> bool {
        self.status == KeyStatus::Active && self.has_token() && !self.is_expired(now_ms)
    }

    /// Mark exhausted with an authoritative 100% usage stamp
    pub fn mark_exhausted(&mut self, now_ms: i64) {
        self.status = KeyStatus::Exhausted;
        self.last_usage = Some(UsageSnapshot::saturated(now_ms));
        self.last_health_check = Some(now_ms);
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("account_email", &self.account_email)
            .field("rate_limit_tier", &self.rate_limit_tier)
            .field("status", &self.status)
            .field("expires_at", &self.expires_at)
            .field("last_usage", &self.last_usage)
            .field("last_health_check", &self.last_health_check)
            .field("extra_fields", &self.extra.len())
            .finish()
    }
}

/// Full rotation state as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RotationState {
    #[serde(default)]
    pub active_key_id: Option<String>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RotationState {
    pub fn active_entry(&self) -> Option<(&str, &KeyEntry)> {
        let id = self.active_key_id.as_deref()?;
        self.keys.get(id).map(|entry| (id, entry))
    }

    /// Insert an entry under the id derived from its token, returning the id
    pub fn insert_key(&mut self, entry: KeyEntry) -> String {
        let id = derive_key_id(&entry.access_token);
        self.keys.insert(id.clone(), entry);
        id
    }
}
