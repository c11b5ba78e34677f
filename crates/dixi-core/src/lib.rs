//! Dixi Core - Types, wire protocol, configuration, and the shared in-memory primitives

pub mod cache;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod protocol;
pub mod types;

pub use cache::{CacheStats, ExpiringCache};
pub use config::DixiConfig;
pub use cooldown::CooldownGate;
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
