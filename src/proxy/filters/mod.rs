//! Built-in filters

mod auth;

pub use auth::{AuthenticatedTunnel, BasicAuthFilter};
