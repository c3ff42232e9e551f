//! Forward/transparent HTTP(S) proxy engine
//!
//! This module contains the per-connection state machine and everything it
//! composes: codec, target resolution, authentication, TLS interception and
//! the injection pipeline.

pub mod auth;
pub mod cert_manager;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod inject;
pub mod registry;
pub mod server;
pub mod session;
pub mod target;
pub mod tls;
pub mod transport;

pub use config::{OutgoingAddress, ProxyOptions, ProxySettings, Upstream};
pub use connection::{serve_connection, ProxyContext};
pub use error::ProxyError;
pub use registry::ConnectionRegistry;
pub use server::*;
pub use session::{Session, SessionPhase, SessionSnapshot};
