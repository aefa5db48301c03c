//! Credential rotation driver
//!
//! Wraps a [`RotationStore`] with the operations the request path needs: resolve the
//! active credential, fail over on exhaustion, register unseen credentials and apply
//! background health samples. Every read-modify-write of rotation state runs under one
//! async mutex, so concurrent exhaustion events never select replacements independently.

use secrecy::SecretString;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::now_ms;
use super::state::{short_id, KeyStatus, RotationState};
use super::store::{HealthOutcome, HealthReport, SharedRotationStore, StoreError};
use crate::logger::SharedAuditLog;

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("No active key is configured")]
    NoActiveKey,

    #[error("Active key {0} is not present in rotation state")]
    ActiveKeyMissing(String),

    #[error("Active key {0} has no usable access token")]
    UnusableActiveKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Credential to present upstream
#[derive(Debug, Clone)]
pub struct ActiveCredential {
    pub key_id: String,
    pub token: SecretString,
}

fn resolve_active(state: &RotationState) -> Result<ActiveCredential, RotationError> {
    let key_id = state
        .active_key_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(RotationError::NoActiveKey)?;
    let entry = state
        .keys
        .get(key_id)
        .ok_or_else(|| RotationError::ActiveKeyMissing(short_id(key_id).to_string()))?;
    if !entry.has_token() {
        return Err(RotationError::UnusableActiveKey(short_id(key_id).to_string()));
    }

    Ok(ActiveCredential {
        key_id: key_id.to_string(),
        token: SecretString::new(entry.access_token.clone()),
    })
}

pub struct RotationDriver {
    store: SharedRotationStore,
    audit: SharedAuditLog,
    write_lock: Mutex<()>,
    rotations: AtomicU64,
}

impl std::fmt::Debug for RotationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationDriver")
            .field("rotations", &self.rotation_count())
            .finish()
    }
}

impl RotationDriver {
    pub fn new(store: SharedRotationStore, audit: SharedAuditLog) -> Self {
        Self {
            store,
            audit,
            write_lock: Mutex::new(()),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &SharedRotationStore {
        &self.store
    }

    pub fn audit(&self) -> &SharedAuditLog {
        &self.audit
    }

    /// Successful failovers since start
    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Resolve the credential currently presented upstream
    pub async fn active_credential(&self) -> Result<ActiveCredential, RotationError> {
        let state = self.store.read_state().await?;
        resolve_active(&state)
    }

    /// Active key id, or `None` if state cannot be read
    pub async fn active_key_id(&self) -> Option<String> {
        match self.store.read_state().await {
            Ok(state) => state.active_key_id,
            Err(e) => {
                debug!("Rotation state unreadable: {}", e);
                None
            }
        }
    }

    /// Status of a key, `None` when the id is not registered
    pub async fn key_status(&self, key_id: &str) -> Result<Option<KeyStatus>, RotationError> {
        let state = self.store.read_state().await?;
        Ok(state.keys.get(key_id).map(|entry| entry.status))
    }

    pub fn derive_key_id(&self, token: &str) -> String {
        self.store.derive_key_id(token)
    }

    /// Ids of active keys that cannot be refreshed
    pub async fn misconfigured_keys(&self) -> Result<Vec<String>, RotationError> {
        let state = self.store.read_state().await?;
        Ok(state
            .keys
            .iter()
            .filter(|(_, entry)| entry.is_misconfigured())
            .map(|(id, _)| id.clone())
            .collect())
    }

    /// Retire `exhausted_key_id` and fail over to the next candidate
    ///
    /// The exhausted entry is stamped (status `exhausted`, 100% usage, fresh check
    /// times) and persisted before and regardless of selection. Returns `None` when no
    /// replacement exists or the store selected the exhausted key again.
    pub async fn rotate_on_exhaustion(
        &self,
        exhausted_key_id: &str,
    ) -> Result<Option<ActiveCredential>, RotationError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.store.read_state().await?;
        let now = now_ms();

        match state.keys.get_mut(exhausted_key_id) {
            Some(entry) if entry.status != KeyStatus::Tombstone => entry.mark_exhausted(now),
            Some(_) => {}
            None => warn!(
                key_id = %short_id(exhausted_key_id),
                "Exhausted key is not registered in rotation state"
            ),
        }

        // Another connection may already have failed over while we waited for the lock
        if let Some(current) = state.active_key_id.as_deref() {
            let usable = state
                .keys
                .get(current)
                .map(|entry| entry.is_usable(now))
                .unwrap_or(false);
            if current != exhausted_key_id && usable {
                self.store.write_state(&state).await?;
                debug!(
                    exhausted = %short_id(exhausted_key_id),
                    active = %short_id(current),
                    "Active key already rotated"
                );
                return resolve_active(&state).map(Some);
            }
        }

        let candidate = self.store.select_active_key(&state);
        let next_id = match candidate {
            Some(id) if id != exhausted_key_id => id,
            other => {
                self.store.write_state(&state).await?;
                let event = if other.is_some() {
                    "self_rotation_blocked"
                } else {
                    "all_keys_exhausted"
                };
                warn!(
                    key_id = %short_id(exhausted_key_id),
                    event = event,
                    "No replacement key available"
                );
                self.audit
                    .record(event, json!({ "key_id": short_id(exhausted_key_id) }))
                    .await;
                return Ok(None);
            }
        };

        state.active_key_id = Some(next_id.clone());
        let credential = match resolve_active(&state) {
            Ok(credential) => credential,
            Err(e) => {
                // Selected entry is unusable: keep the exhaustion, not the switch
                state.active_key_id = Some(exhausted_key_id.to_string());
                self.store.write_state(&state).await?;
                warn!(
                    candidate = %short_id(&next_id),
                    "Selected key is unusable: {}",
                    e
                );
                return Ok(None);
            }
        };
        self.store.write_state(&state).await?;

        if let Some(entry) = state.keys.get(&next_id) {
            if let Err(e) = self.store.propagate_active_credential(&next_id, entry).await {
                warn!(key_id = %short_id(&next_id), "Credential propagation failed: {}", e);
            }
        }

        self.rotations.fetch_add(1, Ordering::Relaxed);
        info!(
            from = %short_id(exhausted_key_id),
            to = %short_id(&next_id),
            "Rotated active key"
        );
        self.audit
            .record(
                "key_rotated",
                json!({
                    "from": short_id(exhausted_key_id),
                    "to": short_id(&next_id),
                    "reason": "rate_limited",
                }),
            )
            .await;

        Ok(Some(credential))
    }

    /// Add a previously unseen credential to rotation state
    ///
    /// Returns the derived key id. Already-registered tokens are left untouched.
    pub async fn register_new_key(&self, token: &str) -> Result<String, RotationError> {
        let key_id = self.store.derive_key_id(token);
        let entry = self.store.register_new_key(token).await?;

        let _guard = self.write_lock.lock().await;
        let mut state = self.store.read_state().await?;
        if state.keys.contains_key(&key_id) {
            debug!(key_id = %short_id(&key_id), "Key already registered");
            return Ok(key_id);
        }
        state.keys.insert(key_id.clone(), entry);
        self.store.write_state(&state).await?;

        info!(key_id = %short_id(&key_id), "Registered new key");
        self.audit
            .record("key_registered", json!({ "key_id": short_id(&key_id) }))
            .await;
        Ok(key_id)
    }

    /// Run a live health check and fold the result into rotation state
    ///
    /// The check runs outside the writer lock. Its result is discarded when the entry
    /// was stamped at or after the sample time, so a slow checker never overrides a
    /// fresher exhaustion stamp. Tombstones are never modified.
    pub async fn refresh_health(&self, key_id: &str) -> Result<HealthReport, RotationError> {
        let report = self.store.check_key_health(key_id).await?;

        let _guard = self.write_lock.lock().await;
        let mut state = self.store.read_state().await?;
        let Some(entry) = state.keys.get_mut(key_id) else {
            return Ok(report);
        };
        if entry.status == KeyStatus::Tombstone {
            return Ok(report);
        }

        let last_stamp = entry
            .last_usage
            .map(|u| u.checked_at)
            .into_iter()
            .chain(entry.last_health_check)
            .max();
        if last_stamp.map(|stamp| stamp >= report.sampled_at).unwrap_or(false) {
            debug!(key_id = %short_id(key_id), "Discarding stale health sample");
            return Ok(report);
        }

        match &report.outcome {
            HealthOutcome::Healthy(usage) => {
                entry.last_usage = Some(*usage);
                entry.last_health_check = Some(report.sampled_at);
                match entry.status {
                    KeyStatus::Exhausted if !usage.is_saturated() => {
                        entry.status = KeyStatus::Active;
                        info!(key_id = %short_id(key_id), "Key recovered from exhaustion");
                    }
                    KeyStatus::Active if usage.is_saturated() => {
                        entry.status = KeyStatus::Exhausted;
                    }
                    _ => {}
                }
            }
            HealthOutcome::Revoked => {
                entry.status = KeyStatus::Invalid;
                entry.last_health_check = Some(report.sampled_at);
                warn!(key_id = %short_id(key_id), "Key revoked upstream");
                self.audit
                    .record("key_revoked", json!({ "key_id": short_id(key_id) }))
                    .await;
            }
            HealthOutcome::Failed(reason) => {
                warn!(key_id = %short_id(key_id), "Health check inconclusive: {}", reason);
                return Ok(report);
            }
        }

        self.store.write_state(&state).await?;
        Ok(report)
    }
}

pub type SharedRotationDriver = Arc<RotationDriver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::AuditLog;
    use crate::rotation::state::{KeyEntry, UsageSnapshot};
    use crate::rotation::store::{MemoryStore, RotationStore};
    use secrecy::ExposeSecret;

    fn two_key_state() -> RotationState {
        let mut state = RotationState::default();
        state.keys.insert("key-a".into(), KeyEntry::new("token-a"));
        state.keys.insert("key-b".into(), KeyEntry::new("token-b"));
        state.active_key_id = Some("key-a".into());
        state
    }

    fn driver_with(store: Arc<MemoryStore>) -> (RotationDriver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log"), 1 << 20));
        (RotationDriver::new(store, audit), dir)
    }

    #[tokio::test]
    async fn test_active_credential_errors() {
        let (driver, _dir) = driver_with(Arc::new(MemoryStore::new(RotationState::default())));
        assert!(matches!(
            driver.active_credential().await,
            Err(RotationError::NoActiveKey)
        ));

        let mut state = RotationState::default();
        state.active_key_id = Some("ghost".into());
        let (driver, _dir) = driver_with(Arc::new(MemoryStore::new(state)));
        assert!(matches!(
            driver.active_credential().await,
            Err(RotationError::ActiveKeyMissing(_))
        ));

        let mut state = RotationState::default();
        state.keys.insert("empty".into(), KeyEntry::new(""));
        state.active_key_id = Some("empty".into());
        let (driver, _dir) = driver_with(Arc::new(MemoryStore::new(state)));
        assert!(matches!(
            driver.active_credential().await,
            Err(RotationError::UnusableActiveKey(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_switches_to_next_key() {
        let store = Arc::new(MemoryStore::new(two_key_state()));
        let (driver, dir) = driver_with(store.clone());

        let next = driver.rotate_on_exhaustion("key-a").await.unwrap().unwrap();
        assert_eq!(next.key_id, "key-b");
        assert_eq!(next.token.expose_secret(), "token-b");

        let state = store.snapshot().await;
        assert_eq!(state.active_key_id.as_deref(), Some("key-b"));
        let exhausted = &state.keys["key-a"];
        assert_eq!(exhausted.status, KeyStatus::Exhausted);
        assert!(exhausted.last_usage.unwrap().is_saturated());
        assert_eq!(store.propagated(), vec!["key-b".to_string()]);
        assert_eq!(driver.rotation_count(), 1);

        let audit = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(audit.contains("key_rotated"));
        assert!(!audit.contains("token-a"));
    }

    #[tokio::test]
    async fn test_no_candidate_still_persists_exhaustion() {
        let mut state = RotationState::default();
        state.keys.insert("solo".into(), KeyEntry::new("token"));
        state.active_key_id = Some("solo".into());
        let store = Arc::new(MemoryStore::new(state));
        let (driver, _dir) = driver_with(store.clone());

        assert!(driver.rotate_on_exhaustion("solo").await.unwrap().is_none());

        let state = store.snapshot().await;
        assert_eq!(state.keys["solo"].status, KeyStatus::Exhausted);
        assert!(state.keys["solo"].last_usage.unwrap().is_saturated());
        assert_eq!(store.write_count(), 1);
        assert!(store.propagated().is_empty());
    }

    #[tokio::test]
    async fn test_self_selection_is_refused() {
        let store = Arc::new(
            MemoryStore::new(two_key_state()).with_selector(|_| Some("key-a".to_string())),
        );
        let (driver, dir) = driver_with(store.clone());

        assert!(driver.rotate_on_exhaustion("key-a").await.unwrap().is_none());

        let state = store.snapshot().await;
        assert_eq!(state.active_key_id.as_deref(), Some("key-a"));
        assert_eq!(state.keys["key-a"].status, KeyStatus::Exhausted);
        assert_eq!(store.write_count(), 1);

        let audit = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(audit.contains("self_rotation_blocked"));
    }

    #[tokio::test]
    async fn test_concurrent_exhaustion_rotates_once() {
        let mut state = two_key_state();
        state.keys.insert("key-c".into(), KeyEntry::new("token-c"));
        let store = Arc::new(MemoryStore::new(state));
        let (driver, _dir) = driver_with(store.clone());
        let driver = Arc::new(driver);

        let (first, second) = tokio::join!(
            driver.rotate_on_exhaustion("key-a"),
            driver.rotate_on_exhaustion("key-a")
        );
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        assert_eq!(first.key_id, second.key_id);
        assert_eq!(driver.rotation_count(), 1);
        assert_eq!(store.propagated().len(), 1);
    }

    #[tokio::test]
    async fn test_register_new_key_is_idempotent() {
        let store = Arc::new(MemoryStore::new(two_key_state()));
        let (driver, _dir) = driver_with(store.clone());

        let id = driver.register_new_key("sk-ant-oat01-fresh").await.unwrap();
        assert_eq!(id, store.derive_key_id("fresh"));
        let again = driver.register_new_key("sk-ant-oat01-fresh").await.unwrap();
        assert_eq!(id, again);

        assert_eq!(store.write_count(), 1);
        assert_eq!(
            driver.key_status(&id).await.unwrap(),
            Some(KeyStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_stale_health_sample_cannot_revive_exhausted_key() {
        let store = Arc::new(MemoryStore::new(two_key_state()));
        let (driver, _dir) = driver_with(store.clone());
        driver.rotate_on_exhaustion("key-a").await.unwrap();

        // Stamp far in the future stands in for a check that started before exhaustion
        let mut state = store.snapshot().await;
        if let Some(entry) = state.keys.get_mut("key-a") {
            entry.last_health_check = Some(i64::MAX);
        }
        store.write_state(&state).await.unwrap();

        store.set_health(
            "key-a",
            HealthOutcome::Healthy(UsageSnapshot::default()),
        );
        driver.refresh_health("key-a").await.unwrap();

        assert_eq!(
            store.snapshot().await.keys["key-a"].status,
            KeyStatus::Exhausted
        );
    }

    #[tokio::test]
    async fn test_fresh_health_sample_revives_and_revokes() {
        let mut state = two_key_state();
        state.keys.insert(
            "tired".into(),
            KeyEntry::new("token-t").with_status(KeyStatus::Exhausted),
        );
        state.keys.insert(
            "dead".into(),
            KeyEntry::new("token-d").with_status(KeyStatus::Tombstone),
        );
        let store = Arc::new(MemoryStore::new(state));
        let (driver, _dir) = driver_with(store.clone());

        store.set_health("tired", HealthOutcome::Healthy(UsageSnapshot::default()));
        store.set_health("key-b", HealthOutcome::Revoked);
        store.set_health("dead", HealthOutcome::Healthy(UsageSnapshot::default()));

        driver.refresh_health("tired").await.unwrap();
        driver.refresh_health("key-b").await.unwrap();
        driver.refresh_health("dead").await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.keys["tired"].status, KeyStatus::Active);
        assert_eq!(state.keys["key-b"].status, KeyStatus::Invalid);
        assert_eq!(state.keys["dead"].status, KeyStatus::Tombstone);
    }

    #[tokio::test]
    async fn test_misconfigured_keys_reported() {
        let mut state = two_key_state();
        if let Some(entry) = state.keys.get_mut("key-b") {
            entry.refresh_token = Some("refresh".into());
        }
        let (driver, _dir) = driver_with(Arc::new(MemoryStore::new(state)));
        assert_eq!(driver.misconfigured_keys().await.unwrap(), vec!["key-a".to_string()]);
    }
}
