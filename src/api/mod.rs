//! Embedding API
//!
//! Process-wide controls for hosts that run the proxy in-process.

pub mod proxy_api;
