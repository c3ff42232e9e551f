//! Data models for the proxy engine
//!
//! Plain values shared by the codec, the session state and the public API.

pub mod message;
pub mod tunnel;

pub use message::*;
pub use tunnel::*;
