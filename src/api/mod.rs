//! API server implementation
//!
//! HTTP surface over the pool, the anonymity controller and the mediator.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
