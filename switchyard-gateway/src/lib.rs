//! # Switchyard Gateway
//!
//! The HTTP face of the Switchyard inference gateway: an OpenAI-compatible
//! chat-completions API in front of the routing and failover engine in
//! `switchyard-core`. This crate owns everything transport-shaped:
//! configuration loading, the axum server and middleware, SSE encoding, and
//! the mapping from engine errors to outward HTTP statuses.

pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use gateway_error::GatewayError;
pub use server::{create_server, AppState};
