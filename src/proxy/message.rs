//! Request and response values threaded through the filter chains

use bytes::Bytes;
use http::{request, Method, StatusCode, Uri, Version};
use hyper::upgrade::OnUpgrade;

use crate::proxy::body::Body;
use crate::proxy::headers::HeaderList;

/// An inbound request addressed at the proxy
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Absolute target URI
    pub uri: Uri,
    pub version: Version,
    /// Header lines in arrival order
    pub headers: HeaderList,
    pub body: Bytes,
    /// The request-target exactly as received; cleared before forwarding
    pub request_uri: Option<String>,
    /// Close the origin connection after the response
    pub close: bool,
    upgrade: Option<OnUpgrade>,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderList, body: impl Into<Bytes>) -> Self {
        let close = headers.has_token("Connection", "close");
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers,
            body: body.into(),
            request_uri: None,
            close,
            upgrade: None,
        }
    }

    /// Build from a parsed inbound request whose body has already been read.
    ///
    /// `headers` are the lines as the client wrote them; without them the list is taken
    /// from `parts`, in `HeaderMap` order.
    pub(crate) fn from_parts(
        parts: request::Parts,
        headers: Option<HeaderList>,
        body: Bytes,
        upgrade: Option<OnUpgrade>,
    ) -> Self {
        let headers = headers.unwrap_or_else(|| HeaderList::from_header_map(&parts.headers));
        let mut req = Self::new(parts.method, parts.uri, headers, body);
        req.version = parts.version;
        req.request_uri = Some(req.uri.to_string());
        req.upgrade = upgrade;
        req
    }

    /// Whether the request-target was an absolute URL, i.e. it came through proxy semantics
    pub fn is_absolute(&self) -> bool {
        is_absolute(&self.uri)
    }

    /// `host[:port]` of the target, empty when missing
    pub fn authority(&self) -> &str {
        self.uri.authority().map(|a| a.as_str()).unwrap_or("")
    }

    /// The pending client-side connection upgrade, if the client asked for one
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }
}

pub(crate) fn is_absolute(uri: &Uri) -> bool {
    uri.scheme().is_some() && uri.authority().is_some()
}

/// A response from the origin or one manufactured by a filter
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub version: Version,
    /// Reason phrase sent by the origin
    pub reason: Option<String>,
    pub headers: HeaderList,
    pub body: Body,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            reason: None,
            headers: HeaderList::new(),
            body: body.into(),
        }
    }

    /// A canned response with the given content type
    pub fn text(status: StatusCode, content_type: &str, body: impl Into<String>) -> Self {
        let mut resp = Self::new(status, body.into());
        resp.headers.set("Content-Type", content_type);
        resp
    }

    /// Status line without the protocol, e.g. `404 Not Found`
    pub fn status_line(&self) -> String {
        let reason = self
            .reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("");
        format!("{} {}", self.status.as_u16(), reason).trim_end().to_string()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }
}
