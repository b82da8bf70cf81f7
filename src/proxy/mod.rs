//! Interception core
//!
//! Every proxied request becomes a [`ProxyContext`] that flows through the request
//! filters, the transport and the response filters before the surviving response is
//! streamed back. CONNECT and WebSocket upgrades leave that path for raw byte relays.

pub mod body;
pub mod context;
pub mod egress;
pub mod filter;
pub mod filters;
pub mod handler;
pub mod headers;
pub mod message;
mod recorder;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use body::{Body, BodySource, BoxError, ProxyBody, RequestBody};
pub use context::{ProxyContext, SessionLog};
pub use egress::{Dialer, EgressDialer};
pub use filter::{FnRequestFilter, FnResponseFilter, RequestFilter, ResponseFilter};
pub use filters::{AuthenticatedTunnel, BasicAuthFilter};
pub use handler::{text_response, FallbackHandler, NonProxyHandler};
pub use headers::HeaderList;
pub use message::{ProxyRequest, ProxyResponse};
pub use server::{ProxyServer, ProxyServerBuilder, DEFAULT_MAX_REQUEST_BODY};
pub use tls::{CertStore, MemoryCertStore};
pub use transport::{ManualTransport, OriginConnector, RoundTripper};
pub use tunnel::{BlindTunnel, ConnectHandler, TunnelRequest, UpgradeHandler, WebSocketRelay};
