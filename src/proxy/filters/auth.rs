//! Proxy authentication
//!
//! Basic credentials carried in `Proxy-Authorization`, checked on plain proxied
//! requests by [`BasicAuthFilter`] and on CONNECT by [`AuthenticatedTunnel`].

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::{HeaderValue, PROXY_AUTHENTICATE};
use http::{Response, StatusCode};
use tracing::{debug, warn};

use crate::error::{Result, TamperError};
use crate::proxy::body::ProxyBody;
use crate::proxy::context::ProxyContext;
use crate::proxy::egress::Dialer;
use crate::proxy::filter::RequestFilter;
use crate::proxy::handler::text_response;
use crate::proxy::headers::HeaderList;
use crate::proxy::message::ProxyResponse;
use crate::proxy::tunnel::{ConnectHandler, TunnelRequest};

const CHALLENGE: &str = "Basic realm=\"Proxy\"";
const CHALLENGE_MESSAGE: &str = "Proxy authentication required";

/// Request filter answering `407` unless the client presents the expected credentials
#[derive(Clone)]
pub struct BasicAuthFilter {
    username: String,
    password: String,
}

impl BasicAuthFilter {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Validate the Proxy-Authorization header
    pub fn validate(&self, headers: &HeaderList) -> Result<()> {
        let auth_str = headers
            .get("Proxy-Authorization")
            .ok_or(TamperError::AuthenticationFailed)?;

        let Some(encoded) = auth_str.strip_prefix("Basic ") else {
            warn!("Invalid auth scheme, expected Basic");
            return Err(TamperError::AuthenticationFailed);
        };

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| TamperError::AuthenticationFailed)?;
        let credentials = String::from_utf8(decoded).map_err(|_| TamperError::AuthenticationFailed)?;

        let (user, pass) = credentials
            .split_once(':')
            .ok_or(TamperError::AuthenticationFailed)?;

        if user == self.username && pass == self.password {
            debug!("Proxy authentication successful for user: {}", user);
            Ok(())
        } else {
            warn!("Proxy authentication failed for user: {}", user);
            Err(TamperError::AuthenticationFailed)
        }
    }

    /// `407` asking the client to authenticate
    pub fn challenge_response(&self) -> ProxyResponse {
        let mut resp = ProxyResponse::text(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "text/plain; charset=utf-8",
            format!("{}\n", CHALLENGE_MESSAGE),
        );
        resp.headers.set("Proxy-Authenticate", CHALLENGE);
        resp
    }
}

#[async_trait]
impl RequestFilter for BasicAuthFilter {
    async fn filter_request(&self, ctx: &mut ProxyContext<'_>) -> Option<ProxyResponse> {
        match self.validate(&ctx.req.headers) {
            Ok(()) => {
                // The credentials are for this proxy, never for the origin.
                ctx.req.headers.remove("Proxy-Authorization");
                None
            }
            Err(_) => {
                ctx.log_warn(format_args!("Rejected unauthenticated request to {}", ctx.req.authority()));
                Some(self.challenge_response())
            }
        }
    }
}

/// CONNECT handler that checks credentials before handing over to `inner`
pub struct AuthenticatedTunnel<H> {
    auth: BasicAuthFilter,
    inner: H,
}

impl<H: ConnectHandler> AuthenticatedTunnel<H> {
    pub fn new(auth: BasicAuthFilter, inner: H) -> Self {
        Self { auth, inner }
    }
}

#[async_trait]
impl<H: ConnectHandler> ConnectHandler for AuthenticatedTunnel<H> {
    async fn handle_connect(&self, tunnel: TunnelRequest, dialer: Arc<dyn Dialer>) -> Response<ProxyBody> {
        if self.auth.validate(&tunnel.headers).is_err() {
            let mut resp = text_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, CHALLENGE_MESSAGE);
            resp.headers_mut()
                .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
            return resp;
        }
        self.inner.handle_connect(tunnel, dialer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::egress::EgressDialer;
    use crate::proxy::message::ProxyRequest;
    use crate::proxy::server::ProxyServer;
    use crate::proxy::tunnel::BlindTunnel;
    use bytes::Bytes;
    use http::Method;
    use tokio_test::{assert_err, assert_ok};

    fn headers_with_auth(auth: Option<&str>) -> HeaderList {
        let mut headers = HeaderList::new();
        if let Some(value) = auth {
            headers.append("Proxy-Authorization", value);
        }
        headers
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", BASE64.encode(credentials))
    }

    #[test]
    fn test_auth_missing_header() {
        let auth = BasicAuthFilter::new("user", "pass");
        assert!(matches!(
            auth.validate(&headers_with_auth(None)),
            Err(TamperError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_auth_valid_credentials() {
        let auth = BasicAuthFilter::new("user", "pass");
        assert_ok!(auth.validate(&headers_with_auth(Some(&basic("user:pass")))));
    }

    #[test]
    fn test_auth_password_may_contain_colon() {
        let auth = BasicAuthFilter::new("user", "p:ss");
        assert_ok!(auth.validate(&headers_with_auth(Some(&basic("user:p:ss")))));
    }

    #[test]
    fn test_auth_invalid_credentials() {
        let auth = BasicAuthFilter::new("user", "pass");
        assert!(matches!(
            auth.validate(&headers_with_auth(Some(&basic("wrong:wrong")))),
            Err(TamperError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_auth_invalid_scheme() {
        let auth = BasicAuthFilter::new("user", "pass");
        assert!(matches!(
            auth.validate(&headers_with_auth(Some("Bearer token123"))),
            Err(TamperError::AuthenticationFailed)
        ));
        assert_err!(auth.validate(&headers_with_auth(Some("Basic !!!"))));
    }

    #[tokio::test]
    async fn test_filter_challenges_then_lets_through() {
        let server = ProxyServer::builder().build().unwrap();
        let auth = BasicAuthFilter::new("user", "pass");

        let req = ProxyRequest::new(
            Method::GET,
            "http://example.test/".parse().unwrap(),
            HeaderList::new(),
            Bytes::new(),
        );
        let mut ctx = ProxyContext::new(&server, req, 1);
        let challenge = auth.filter_request(&mut ctx).await.unwrap();
        assert_eq!(challenge.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(challenge.headers.get("proxy-authenticate"), Some(CHALLENGE));

        ctx.req.headers.append("Proxy-Authorization", basic("user:pass"));
        assert!(auth.filter_request(&mut ctx).await.is_none());
        assert!(!ctx.req.headers.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_authenticated_tunnel_rejects_before_dialing() {
        let tunnel = AuthenticatedTunnel::new(BasicAuthFilter::new("user", "pass"), BlindTunnel);
        let request = TunnelRequest {
            authority: "example.test:443".to_string(),
            headers: HeaderList::new(),
            on_upgrade: hyper::upgrade::on(http::Request::new(())),
        };

        let resp = tunnel
            .handle_connect(request, Arc::new(EgressDialer::direct()))
            .await;
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(resp.headers().get(PROXY_AUTHENTICATE).unwrap(), CHALLENGE);
    }
}
