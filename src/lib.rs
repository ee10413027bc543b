//! Komainu Library
//!
//! Bearer-token authorization gateway for HTTP APIs.
//!
//! # Features
//!
//! - **Token Verification**: signature, issuer, audience and expiry checks on
//!   JWT access tokens
//! - **Key Resolution**: cached JWKS with coalesced refresh and rotation
//! - **Permission Gating**: per-route permission requirements
//! - **Client Sessions**: redirect login with PKCE and a route guard
//!
//! # Example
//!
//! ```no_run
//! use komainu::{config::Config, server::GatewayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = GatewayServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod authz;
pub mod config;
pub mod metrics;
pub mod router;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use auth::{AuthError, TokenVerifier, ValidatedClaims};
pub use authz::{authorize, Decision, PermissionRequirement};
pub use config::Config;
pub use server::GatewayServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
