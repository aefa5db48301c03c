//! Credential rotation
//!
//! - `state`: persisted rotation data model and key id derivation
//! - `store`: the store contract plus JSON-file and in-memory backends
//! - `driver`: failover, registration and health folding under a single writer
//! - `health_check`: opt-in periodic key verification

pub mod driver;
pub mod health_check;
pub mod state;
pub mod store;

pub use driver::{ActiveCredential, RotationDriver, RotationError, SharedRotationDriver};
pub use health_check::spawn_health_checker;
pub use state::{derive_key_id, short_id, KeyEntry, KeyStatus, RotationState, UsageSnapshot};
pub use store::{
    HealthOutcome, HealthReport, JsonFileStore, MemoryStore, RotationStore, SharedRotationStore,
    StoreError,
};

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
