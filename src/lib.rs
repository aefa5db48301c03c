//! Keyrelay - credential-rotating localhost forward proxy
//!
//! Keyrelay accepts `CONNECT` tunnels on loopback. Tunnels to the configured API hosts
//! are decrypted with a locally trusted certificate so that every request can be
//! re-signed with the currently active credential; everything else is piped through
//! untouched.
//!
//! ## Features
//!
//! - **Selective interception**: only hosts in `INTERCEPT_DOMAINS` are decrypted
//! - **Failover on 429**: an exhausted key is retired and the request is replayed
//!   with the next one
//! - **Token hygiene**: stale and unknown bearer tokens are recognised and handled
//! - **Streaming**: event streams are relayed as they arrive
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keyrelay::{lifecycle, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = lifecycle::startup(&config).await?;
//!     runtime.run(lifecycle::shutdown_signal()).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` - loopback listener and connection routing
//! - `mitm` - tunnel interception and TLS configuration
//! - `forwarder` - per-request credential rewrite and retry loop
//! - `rotation` - rotation state, store contract and failover driver
//! - `http_client` - upstream connections and HTTP/1.1 framing
//! - `logger` - audit trail

// Core proxy modules
pub mod config;
pub mod forwarder;
pub mod http_client;
pub mod server;

// Credential rotation
pub mod rotation;

// MITM
pub mod mitm;
pub mod tls;

// Operations
pub mod health;
pub mod lifecycle;
pub mod logger;

// Re-export commonly used types
pub use config::Config;
pub use forwarder::{Forwarder, ForwarderSettings};
pub use health::{ProxyStats, HEALTH_PATH};
pub use lifecycle::{startup, Runtime, StartupError};
pub use logger::AuditLog;
pub use rotation::{
    derive_key_id, JsonFileStore, KeyEntry, KeyStatus, MemoryStore, RotationDriver,
    RotationState, RotationStore,
};
pub use server::ProxyServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
