//! TLS interception for CONNECT tunnels
//!
//! - `interceptor`: decides per tunnel between local TLS termination and a blind pipe
//! - `tls_config`: client-facing acceptor and upstream connector configuration
//! - `http_parser`: request head parsing and credential rewriting
//! - `rewind`: replays bytes read ahead of the client's TLS handshake

pub mod error;
pub mod http_parser;
pub mod interceptor;
pub mod rewind;
pub mod tls_config;

// Re-export main types
pub use error::MitmError;
pub use http_parser::{
    find_header_end, parse_request, rebuild_request, strip_header, HeaderLine, ParsedRequest,
};
pub use interceptor::{InterceptionError, MitmInterceptor, TunnelOutcome};
pub use rewind::ReplayStream;
pub use tls_config::{ClientTlsConfig, SniUtils, TlsConfigError, UpstreamTlsConfig};
