//! # tproxy core
//!
//! Forward and transparent HTTP(S) proxy engine with optional TLS
//! interception, upstream proxy chaining and per-connection byte injection.
//!
//! ## Features
//!
//! - Plain HTTP forwarding and CONNECT tunnelling
//! - Chaining through an upstream HTTP(S) proxy, statically or per request
//! - Proxy-Authorization (Basic) challenges with a pluggable verifier
//! - TLS man-in-the-middle with SNI-driven key selection
//! - Request/response observation and rewriting hooks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Host application / tproxy CLI              │
//! ├─────────────────────────────────────────────────────────┤
//! │              api::proxy_api (process-wide)              │
//! ├─────────────────────────────────────────────────────────┤
//! │  ┌─────────┐  ┌────────────┐  ┌────────┐  ┌──────────┐  │
//! │  │  Proxy  │  │ Connection │  │ Codec  │  │  Inject  │  │
//! │  │ Server  │──│  (session) │──│ Target │──│ Pipeline │  │
//! │  └─────────┘  └────────────┘  └────────┘  └──────────┘  │
//! │                     │                                   │
//! │               ┌───────────┐   ┌───────────────┐         │
//! │               │    TLS    │───│  CertManager  │         │
//! │               │Interceptor│   │  (KeySource)  │         │
//! │               └───────────┘   └───────────────┘         │
//! └─────────────────────────────────────────────────────────┘
//! ```

// Public modules
pub mod api;
pub mod models;
pub mod proxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
