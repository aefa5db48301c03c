//! Rotation store backends
//!
//! The proxy consumes rotation state through the [`RotationStore`] trait. Two backends
//! ship with the crate: [`JsonFileStore`] (the on-disk state file shared with the rest
//! of the tooling) and [`MemoryStore`] (in-process, used for embedding and tests).

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::now_ms;
use super::state::{derive_key_id, short_id, KeyEntry, RotationState, UsageSnapshot};

/// Errors raised by a rotation store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Rotation state not found at {0}")]
    NotFound(String),

    #[error("Failed to read rotation state: {0}")]
    Read(String),

    #[error("Failed to write rotation state: {0}")]
    Write(String),

    #[error("Rotation state is corrupt: {0}")]
    Corrupt(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Credential propagation failed: {0}")]
    Propagation(String),
}

/// Result of one live verification against the upstream
#[derive(Debug, Clone, PartialEq)]
pub enum HealthOutcome {
    /// Key works; carries the utilisation it reported
    Healthy(UsageSnapshot),
    /// Upstream refused the credential outright
    Revoked,
    /// Check could not be completed (network, unexpected status)
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub key_id: String,
    /// When the sample was taken, epoch milliseconds
    pub sampled_at: i64,
    pub outcome: HealthOutcome,
}

/// Contract between the proxy and whatever persists rotation state
#[async_trait::async_trait]
pub trait RotationStore: Send + Sync {
    /// Load the full rotation state
    async fn read_state(&self) -> Result<RotationState, StoreError>;

    /// Persist the full rotation state
    async fn write_state(&self, state: &RotationState) -> Result<(), StoreError>;

    /// Pick the next candidate key, if any
    fn select_active_key(&self, state: &RotationState) -> Option<String>;

    fn derive_key_id(&self, token: &str) -> String {
        derive_key_id(token)
    }

    /// Verify one key against the real upstream
    async fn check_key_health(&self, key_id: &str) -> Result<HealthReport, StoreError>;

    /// Hand the newly active credential to local consumers outside the proxy
    async fn propagate_active_credential(
        &self,
        key_id: &str,
        entry: &KeyEntry,
    ) -> Result<(), StoreError>;

    /// Build the entry for a previously unseen credential
    async fn register_new_key(&self, token: &str) -> Result<KeyEntry, StoreError>;
}

pub type SharedRotationStore = Arc<dyn RotationStore>;

/// Default selection policy
///
/// Among usable keys (active, token present, not expired) pick the one with the lowest
/// peak utilisation. Keys with no usage sample count as idle. Ties go to the smallest id.
pub fn select_least_used(state: &RotationState, now_ms: i64) -> Option<String> {
    state
        .keys
        .iter()
        .filter(|(_, entry)| entry.is_usable(now_ms))
        .map(|(id, entry)| {
            let peak = entry.last_usage.map(|u| u.peak()).unwrap_or(0.0);
            (id, peak)
        })
        .min_by(|(a_id, a_peak), (b_id, b_peak)| {
            a_peak.total_cmp(b_peak).then_with(|| a_id.cmp(b_id))
        })
        .map(|(id, _)| id.clone())
}

fn new_entry(token: &str) -> KeyEntry {
    let mut entry = KeyEntry::new(token.trim());
    entry.added_at = Some(now_ms());
    entry
}

/// Usage endpoint payload: one optional bucket per window
#[derive(Debug, Deserialize)]
struct UsageResponse {
    five_hour: Option<UsageBucket>,
    seven_day: Option<UsageBucket>,
    seven_day_sonnet: Option<UsageBucket>,
}

#[derive(Debug, Deserialize)]
struct UsageBucket {
    utilization: Option<f64>,
}

impl UsageResponse {
    fn into_snapshot(self, checked_at: i64) -> UsageSnapshot {
        let pct = |bucket: Option<UsageBucket>| {
            bucket.and_then(|b| b.utilization).unwrap_or(0.0)
        };
        UsageSnapshot {
            five_hour: pct(self.five_hour),
            seven_day: pct(self.seven_day),
            seven_day_sonnet: pct(self.seven_day_sonnet),
            checked_at,
        }
    }
}

/// Rotation state kept in a JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    credentials_path: Option<PathBuf>,
    usage_endpoint: String,
    http_client: reqwest::Client,
}

impl JsonFileStore {
    /// Open an existing state file
    ///
    /// Fails when the file is absent or does not parse: the proxy never bootstraps state.
    pub async fn open(
        path: impl Into<PathBuf>,
        usage_endpoint: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?
        {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| StoreError::HealthCheck(e.to_string()))?;

        let store = Self {
            path,
            credentials_path: None,
            usage_endpoint: usage_endpoint.into(),
            http_client,
        };

        let state = store.read_state().await?;
        info!(
            path = %store.path.display(),
            keys = state.keys.len(),
            "Opened rotation state"
        );

        Ok(store)
    }

    /// Propagate the active credential to this file on every rotation
    pub fn with_credentials_path(mut self, path: Option<PathBuf>) -> Self {
        self.credentials_path = path;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `content` next to `path` and rename it into place
async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));

    tokio::fs::write(&temp_path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&temp_path, path).await
}

#[async_trait::async_trait]
impl RotationStore for JsonFileStore {
    async fn read_state(&self) -> Result<RotationState, StoreError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(self.path.display().to_string())
            } else {
                StoreError::Read(e.to_string())
            }
        })?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn write_state(&self, state: &RotationState) -> Result<(), StoreError> {
        let content =
            serde_json::to_vec_pretty(state).map_err(|e| StoreError::Write(e.to_string()))?;
        write_atomic(&self.path, &content)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))
    }

    fn select_active_key(&self, state: &RotationState) -> Option<String> {
        select_least_used(state, now_ms())
    }

    async fn check_key_health(&self, key_id: &str) -> Result<HealthReport, StoreError> {
        let state = self.read_state().await?;
        let entry = state
            .keys
            .get(key_id)
            .ok_or_else(|| StoreError::UnknownKey(short_id(key_id).to_string()))?;

        let sampled_at = now_ms();
        let response = self
            .http_client
            .get(&self.usage_endpoint)
            .bearer_auth(&entry.access_token)
            .header("anthropic-beta", "oauth-2025-04-20")
            .send()
            .await;

        let outcome = match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match status {
                    200..=299 => match resp.json::<UsageResponse>().await {
                        Ok(usage) => HealthOutcome::Healthy(usage.into_snapshot(sampled_at)),
                        Err(e) => HealthOutcome::Failed(format!("unreadable usage payload: {}", e)),
                    },
                    401 | 403 => HealthOutcome::Revoked,
                    other => HealthOutcome::Failed(format!("usage endpoint returned {}", other)),
                }
            }
            Err(e) => HealthOutcome::Failed(e.to_string()),
        };

        debug!(
            key_id = %short_id(key_id),
            outcome = ?outcome,
            "Key health checked"
        );

        Ok(HealthReport {
            key_id: key_id.to_string(),
            sampled_at,
            outcome,
        })
    }

    async fn propagate_active_credential(
        &self,
        key_id: &str,
        entry: &KeyEntry,
    ) -> Result<(), StoreError> {
        let Some(path) = &self.credentials_path else {
            return Ok(());
        };

        // Other tools keep their own fields in this file; only the OAuth block is ours
        let mut document = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<serde_json::Value>(&raw)
                .ok()
                .filter(serde_json::Value::is_object)
                .unwrap_or_else(|| json!({})),
            Err(_) => json!({}),
        };
        if !document["claudeAiOauth"].is_object() {
            document["claudeAiOauth"] = json!({});
        }
        let oauth = &mut document["claudeAiOauth"];
        oauth["accessToken"] = json!(entry.access_token);
        oauth["refreshToken"] = json!(entry.refresh_token);
        oauth["expiresAt"] = json!(entry.expires_at);
        oauth["rateLimitTier"] = json!(entry.rate_limit_tier);
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::Propagation(e.to_string()))?;
        write_atomic(path, &content)
            .await
            .map_err(|e| StoreError::Propagation(e.to_string()))?;

        info!(
            key_id = %short_id(key_id),
            path = %path.display(),
            "Propagated active credential"
        );
        Ok(())
    }

    async fn register_new_key(&self, token: &str) -> Result<KeyEntry, StoreError> {
        Ok(new_entry(token))
    }
}

type Selector = Box<dyn Fn(&RotationState) -> Option<String> + Send + Sync>;

/// In-process rotation store
///
/// Health outcomes are scripted per key; propagations are recorded for inspection.
pub struct MemoryStore {
    state: RwLock<RotationState>,
    selector: Option<Selector>,
    health: Mutex<HashMap<String, HealthOutcome>>,
    propagated: Mutex<Vec<String>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(state: RotationState) -> Self {
        Self {
            state: RwLock::new(state),
            selector: None,
            health: Mutex::new(HashMap::new()),
            propagated: Mutex::new(Vec::new()),
            writes: Mutex::new(0),
        }
    }

    /// Replace the default selection policy
    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&RotationState) -> Option<String> + Send + Sync + 'static,
    {
        self.selector = Some(Box::new(selector));
        self
    }

    /// Script the outcome `check_key_health` reports for `key_id`
    pub fn set_health(&self, key_id: &str, outcome: HealthOutcome) {
        if let Ok(mut health) = self.health.lock() {
            health.insert(key_id.to_string(), outcome);
        }
    }

    /// Key ids propagated so far, oldest first
    pub fn propagated(&self) -> Vec<String> {
        self.propagated.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Number of `write_state` calls
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }

    pub async fn snapshot(&self) -> RotationState {
        self.state.read().await.clone()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("custom_selector", &self.selector.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl RotationStore for MemoryStore {
    async fn read_state(&self) -> Result<RotationState, StoreError> {
        Ok(self.state.read().await.clone())
    }

    async fn write_state(&self, state: &RotationState) -> Result<(), StoreError> {
        *self.state.write().await = state.clone();
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }

    fn select_active_key(&self, state: &RotationState) -> Option<String> {
        match &self.selector {
            Some(selector) => selector(state),
            None => select_least_used(state, now_ms()),
        }
    }

    async fn check_key_health(&self, key_id: &str) -> Result<HealthReport, StoreError> {
        let sampled_at = now_ms();
        let outcome = self
            .health
            .lock()
            .ok()
            .and_then(|health| health.get(key_id).cloned())
            .unwrap_or_else(|| HealthOutcome::Healthy(UsageSnapshot {
                checked_at: sampled_at,
                ..Default::default()
            }));

        Ok(HealthReport {
            key_id: key_id.to_string(),
            sampled_at,
            outcome,
        })
    }

    async fn propagate_active_credential(
        &self,
        key_id: &str,
        _entry: &KeyEntry,
    ) -> Result<(), StoreError> {
        match self.propagated.lock() {
            Ok(mut propagated) => {
                propagated.push(key_id.to_string());
                Ok(())
            }
            Err(e) => {
                warn!("Propagation record poisoned: {}", e);
                Err(StoreError::Propagation(e.to_string()))
            }
        }
    }

    async fn register_new_key(&self, token: &str) -> Result<KeyEntry, StoreError> {
        Ok(new_entry(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::state::KeyStatus;

    fn usage(peak: f64) -> Option<UsageSnapshot> {
        Some(UsageSnapshot {
            five_hour: peak,
            seven_day: 0.0,
            seven_day_sonnet: 0.0,
            checked_at: 0,
        })
    }

    #[test]
    fn test_select_least_used_skips_unusable_keys() {
        let mut state = RotationState::default();
        state.keys.insert(
            "a".into(),
            KeyEntry::new("ta").with_status(KeyStatus::Exhausted),
        );
        state.keys.insert(
            "b".into(),
            KeyEntry::new("tb").with_status(KeyStatus::Tombstone),
        );
        let mut expired = KeyEntry::new("tc");
        expired.expires_at = Some(10);
        state.keys.insert("c".into(), expired);
        state.keys.insert("d".into(), KeyEntry::new(""));

        assert_eq!(select_least_used(&state, 100), None);

        let mut fresh = KeyEntry::new("te");
        fresh.last_usage = usage(40.0);
        state.keys.insert("e".into(), fresh);
        assert_eq!(select_least_used(&state, 100).as_deref(), Some("e"));
    }

    #[test]
    fn test_select_least_used_prefers_lowest_peak_then_id() {
        let mut state = RotationState::default();
        let mut busy = KeyEntry::new("t1");
        busy.last_usage = usage(80.0);
        let mut idle = KeyEntry::new("t2");
        idle.last_usage = usage(10.0);
        state.keys.insert("busy".into(), busy);
        state.keys.insert("idle".into(), idle);
        assert_eq!(select_least_used(&state, 0).as_deref(), Some("idle"));

        let mut state = RotationState::default();
        state.keys.insert("zz".into(), KeyEntry::new("t1"));
        state.keys.insert("aa".into(), KeyEntry::new("t2"));
        assert_eq!(select_least_used(&state, 0).as_deref(), Some("aa"));
    }

    #[tokio::test]
    async fn test_json_store_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonFileStore::open(dir.path().join("missing.json"), "http://127.0.0.1:9")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        let err = JsonFileStore::open(&corrupt, "http://127.0.0.1:9")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_json_store_write_is_atomic_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{}").unwrap();

        let store = JsonFileStore::open(&path, "http://127.0.0.1:9").await.unwrap();
        let mut state = RotationState::default();
        let id = state.insert_key(KeyEntry::new("sk-ant-oat01-abc"));
        state.active_key_id = Some(id.clone());
        store.write_state(&state).await.unwrap();

        let reread = store.read_state().await.unwrap();
        assert_eq!(reread, state);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_json_store_propagates_to_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let creds = dir.path().join("creds/.credentials.json");
        std::fs::write(&path, "{}").unwrap();

        let store = JsonFileStore::open(&path, "http://127.0.0.1:9")
            .await
            .unwrap()
            .with_credentials_path(Some(creds.clone()));

        let mut entry = KeyEntry::new("tok-123");
        entry.refresh_token = Some("ref-456".into());
        store.propagate_active_credential("abcdef0123456789", &entry).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&creds).unwrap()).unwrap();
        assert_eq!(written["claudeAiOauth"]["accessToken"], "tok-123");
        assert_eq!(written["claudeAiOauth"]["refreshToken"], "ref-456");
    }

    #[tokio::test]
    async fn test_json_store_keeps_fields_it_does_not_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{
                "version": 1,
                "active_key_id": "k1",
                "keys": {
                    "k1": {"access_token": "tok-1", "status": "active", "last_used_at": 123},
                    "k2": {"access_token": "tok-2", "status": "active"}
                },
                "rotation_log": [{"from": "k0", "to": "k1", "at": 1700000000000}]
            }"#,
        )
        .unwrap();

        let store = JsonFileStore::open(&path, "http://127.0.0.1:9/usage").await.unwrap();
        let mut state = store.read_state().await.unwrap();
        state.keys.get_mut("k1").unwrap().mark_exhausted(42);
        state.active_key_id = Some("k2".into());
        store.write_state(&state).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["version"], 1);
        assert_eq!(written["rotation_log"][0]["to"], "k1");
        assert_eq!(written["keys"]["k1"]["last_used_at"], 123);
        assert_eq!(written["keys"]["k1"]["status"], "exhausted");
        assert_eq!(written["active_key_id"], "k2");
    }

    #[tokio::test]
    async fn test_propagation_keeps_other_credential_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let creds = dir.path().join(".credentials.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::write(
            &creds,
            r#"{"mcpOAuth": {"server": "x"}, "claudeAiOauth": {"accessToken": "old", "scopes": ["user:inference"]}}"#,
        )
        .unwrap();

        let store = JsonFileStore::open(&path, "http://127.0.0.1:9")
            .await
            .unwrap()
            .with_credentials_path(Some(creds.clone()));
        store
            .propagate_active_credential("abcdef0123456789", &KeyEntry::new("tok-new"))
            .await
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&creds).unwrap()).unwrap();
        assert_eq!(written["mcpOAuth"]["server"], "x");
        assert_eq!(written["claudeAiOauth"]["accessToken"], "tok-new");
        assert_eq!(written["claudeAiOauth"]["scopes"][0], "user:inference");
    }

    #[tokio::test]
    async fn test_memory_store_scripted_health_and_registration() {
        let store = MemoryStore::new(RotationState::default());
        store.set_health("k1", HealthOutcome::Revoked);

        let report = store.check_key_health("k1").await.unwrap();
        assert_eq!(report.outcome, HealthOutcome::Revoked);

        let report = store.check_key_health("k2").await.unwrap();
        assert!(matches!(report.outcome, HealthOutcome::Healthy(_)));

        let entry = store.register_new_key(" tok \n").await.unwrap();
        assert_eq!(entry.access_token, "tok");
        assert_eq!(entry.status, KeyStatus::Active);
        assert!(entry.added_at.is_some());
        assert_eq!(store.derive_key_id("sk-ant-oat01-x"), derive_key_id("x"));
    }

    #[test]
    fn test_usage_payload_parsing() {
        let payload = r#"{
            "five_hour": {"utilization": 12.5, "resets_at": "2025-01-01T00:00:00Z"},
            "seven_day": {"utilization": 40.0},
            "seven_day_sonnet": null
        }"#;
        let usage: UsageResponse = serde_json::from_str(payload).unwrap();
        let snapshot = usage.into_snapshot(7);
        assert_eq!(snapshot.five_hour, 12.5);
        assert_eq!(snapshot.seven_day, 40.0);
        assert_eq!(snapshot.seven_day_sonnet, 0.0);
        assert_eq!(snapshot.checked_at, 7);
    }
}
