//! Veil - Anonymizing egress-proxy orchestration
//!
//! Routes outbound HTTP calls through a pool of egress paths without leaking
//! the caller's identity.
//!
//! ## Features
//!
//! - Egress pool over an anonymity network, VPN and HTTP proxies, and direct
//! - Periodic health probing with automatic fallback to direct
//! - Random selection preferring high anonymity, with periodic rotation
//! - Rate-limited identity rotation over the anonymity network control port
//! - Header scrubbing and domain-only audit records for mediated calls

pub mod anonymity;
pub mod api;
pub mod config;
pub mod error;
pub mod mediator;
pub mod models;
pub mod pool;

pub use config::Config;
pub use error::{Result, VeilError};
