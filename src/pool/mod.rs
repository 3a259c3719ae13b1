//! Egress path pool
//!
//! Holds the configured egress paths, keeps their health current with a
//! supervised background loop, and implements selection and rotation.

pub mod health;
pub mod manager;
pub mod probe;
mod selection;

pub use health::{HealthChecker, HealthCheckerHandle};
pub use manager::{HealthSummary, ProxyPoolManager};
pub use probe::{ConnectivityProbe, HttpProbe, ProbeOutcome};
