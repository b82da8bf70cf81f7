//! Per-request context
//!
//! One [`ProxyContext`] is created for every proxied request and dropped when that request
//! completes. It borrows the owning server and exclusively owns the request and response
//! slots the filters work on.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{info, warn};

use crate::error::Result;
use crate::proxy::message::{ProxyRequest, ProxyResponse};
use crate::proxy::server::ProxyServer;
use crate::proxy::tls::CertStore;
use crate::proxy::transport::RoundTripper;

/// `[sid] LEVEL: message`, where `sid` is the low byte of the session id
pub fn format_log_line(session: u64, level: &str, message: &dyn fmt::Display) -> String {
    format!("[{:03}] {}: {}", session & 0xFF, level, message)
}

/// Session-tagged logging that outlives the context
///
/// INFO lines are emitted only when the server is verbose; WARN lines always are.
#[derive(Debug, Clone, Copy)]
pub struct SessionLog {
    session: u64,
    verbose: bool,
}

impl SessionLog {
    pub fn new(session: u64, verbose: bool) -> Self {
        Self { session, verbose }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn info(&self, message: impl fmt::Display) {
        if self.verbose {
            info!("{}", format_log_line(self.session, "INFO", &message));
        }
    }

    pub fn warn(&self, message: impl fmt::Display) {
        warn!("{}", format_log_line(self.session, "WARN", &message));
    }
}

fn charset_finder() -> &'static Regex {
    static CHARSET_RE: OnceLock<Regex> = OnceLock::new();
    CHARSET_RE.get_or_init(|| Regex::new(r"charset=([^ ;]*)").expect("static charset pattern"))
}

/// State carried through both filter chains for a single request
pub struct ProxyContext<'a> {
    /// The request being proxied; filters may edit or replace it
    pub req: ProxyRequest,
    /// The current response, `None` until one exists
    pub resp: Option<ProxyResponse>,
    /// Overrides how this request is sent to the origin
    pub round_tripper: Option<Arc<dyn RoundTripper>>,
    /// Most recent transport or parse failure
    pub error: Option<crate::error::TamperError>,
    /// Free slot for handing data from one filter to another
    pub user_data: Option<Box<dyn Any + Send + Sync>>,
    session: u64,
    server: &'a ProxyServer,
}

impl<'a> ProxyContext<'a> {
    pub(crate) fn new(server: &'a ProxyServer, req: ProxyRequest, session: u64) -> Self {
        Self {
            req,
            resp: None,
            round_tripper: None,
            error: None,
            user_data: None,
            session,
            server,
        }
    }

    /// Unique, increasing id of this request
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn server(&self) -> &'a ProxyServer {
        self.server
    }

    /// Certificate capability configured on the server, if any
    pub fn cert_store(&self) -> Option<&'a Arc<dyn CertStore>> {
        self.server.cert_store()
    }

    pub fn log(&self) -> SessionLog {
        SessionLog::new(self.session, self.server.verbose())
    }

    /// Log a message, only when the server is verbose
    pub fn log_info(&self, message: impl fmt::Display) {
        self.log().info(message)
    }

    /// Log a message regardless of verbosity
    pub fn log_warn(&self, message: impl fmt::Display) {
        self.log().warn(message)
    }

    /// Character set named by the current response's `Content-Type`.
    ///
    /// Empty when there is no response yet or no `charset=` parameter.
    pub fn charset(&self) -> &str {
        self.resp
            .as_ref()
            .and_then(|resp| resp.content_type())
            .and_then(|value| charset_finder().captures(value))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .unwrap_or("")
    }

    /// Send the current request to its origin.
    ///
    /// Uses the context's own transport when set, otherwise the server's.
    pub async fn round_trip(&mut self) -> Result<ProxyResponse> {
        let transport = self
            .round_tripper
            .clone()
            .unwrap_or_else(|| self.server.transport().clone());
        let log = self.log();
        transport.round_trip(&mut self.req, log).await
    }
}

impl fmt::Debug for ProxyContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyContext")
            .field("session", &self.session)
            .field("req", &self.req)
            .field("resp", &self.resp)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::body::Body;
    use crate::proxy::headers::HeaderList;
    use bytes::Bytes;
    use http::{Method, StatusCode};

    fn request() -> ProxyRequest {
        ProxyRequest::new(
            Method::GET,
            "http://example.test/".parse().unwrap(),
            HeaderList::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn test_log_line_format() {
        assert_eq!(format_log_line(7, "INFO", &"hello"), "[007] INFO: hello");
        assert_eq!(format_log_line(256 + 42, "WARN", &"x"), "[042] WARN: x");
        assert_eq!(
            format_log_line(255, "INFO", &format_args!("got {} {}", "GET", 1)),
            "[255] INFO: got GET 1"
        );
    }

    #[test]
    fn test_charset_detection() {
        let server = ProxyServer::builder().build().unwrap();
        let mut ctx = ProxyContext::new(&server, request(), 1);
        assert_eq!(ctx.charset(), "");

        let mut resp = ProxyResponse::new(StatusCode::OK, Body::empty());
        resp.headers.set("Content-Type", "text/html; charset=ISO-8859-1");
        ctx.resp = Some(resp);
        assert_eq!(ctx.charset(), "ISO-8859-1");

        ctx.resp = Some(ProxyResponse::new(StatusCode::OK, Body::empty()));
        assert_eq!(ctx.charset(), "");

        let mut resp = ProxyResponse::new(StatusCode::OK, Body::empty());
        resp.headers.set("Content-Type", "text/html;;charset");
        ctx.resp = Some(resp);
        assert_eq!(ctx.charset(), "");
    }

    #[test]
    fn test_context_accessors() {
        let server = ProxyServer::builder().verbose(true).build().unwrap();
        let mut ctx = ProxyContext::new(&server, request(), 300);
        assert_eq!(ctx.session(), 300);
        assert!(ctx.cert_store().is_none());
        assert!(ctx.server().verbose());

        ctx.user_data = Some(Box::new(41_u32));
        let value = ctx
            .user_data
            .as_ref()
            .and_then(|d| d.downcast_ref::<u32>())
            .copied();
        assert_eq!(value, Some(41));
    }
}
