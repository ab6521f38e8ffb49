//! # tandem-server
//!
//! HTTP and WebSocket front end of the Tandem signaling relay.
//!
//! - `/ws/direct` carries presence and addressed signaling between contacts.
//! - `/ws/random` pairs anonymous participants and relays between partners.
//! - `/health` reports liveness and relay counters.

pub mod auth;
pub mod call_log;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{router, run_server, serve, AppState};
