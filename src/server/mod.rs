//! HTTP server module
//!
//! Accepts API requests, enforces bearer-token authorization per route and
//! hands authorized requests to the route handler.

use thiserror::Error;

pub mod gateway;

pub use gateway::{handle_request, GatewayServer, GatewayState};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}
