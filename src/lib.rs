//! Tamper - interception core for a man-in-the-middle HTTP proxy
//!
//! ## Features
//!
//! - Request and response filter chains with short-circuit responses
//! - Request heads recorded off the client socket and replayed to the origin line for line
//! - Header values carried as raw bytes
//! - Hop-by-hop header sanitizing
//! - CONNECT tunnels and WebSocket relays
//! - Direct, HTTP CONNECT or SOCKS5 egress dialing

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{Result, TamperError};
pub use proxy::{ProxyContext, ProxyRequest, ProxyResponse, ProxyServer};
