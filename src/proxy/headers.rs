//! Ordered header model and hop-by-hop sanitizing
//!
//! Headers are kept as an ordered sequence of `(name, value)` pairs from parse time to
//! serialization so the manual sender can write them back exactly as they arrived.
//! Values are raw bytes; nothing is re-encoded on the way through.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::proxy::context::SessionLog;
use crate::proxy::message::ProxyRequest;

/// Headers addressed to this proxy rather than the origin
const PROXY_HOP_HEADERS: &[&str] = &["Proxy-Connection", "Proxy-Authenticate", "Proxy-Authorization"];

/// An ordered, case-preserving list of header lines.
///
/// Lookups are case-insensitive; nothing is ever reordered or renamed. A multi-valued
/// header is simply several entries with the same name. Values are stored as the bytes
/// that were received, so obs-text survives a round trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, Bytes)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over every header line in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }

    /// First value for `name`, if it is valid UTF-8
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_bytes(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// First value for `name` as received
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Every UTF-8 value for `name`, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_bytes(name).is_some()
    }

    /// Add a line at the end, keeping any existing values
    pub fn append(&mut self, name: impl Into<String>, value: impl AsRef<[u8]>) {
        self.entries
            .push((name.into(), Bytes::copy_from_slice(value.as_ref())));
    }

    /// Replace every value of `name` with a single one.
    ///
    /// The replacement takes the position of the first existing line so the wire order
    /// is unchanged; it is appended when the header was absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl AsRef<[u8]>) {
        let name = name.into();
        let value = Bytes::copy_from_slice(value.as_ref());
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove every line named `name`, returning how many were dropped
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether any comma-separated token of `name` equals `token` (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }

    /// Header lines of a head parsed with `httparse`, spelled as they were received
    pub(crate) fn from_parsed(headers: &[httparse::Header<'_>]) -> Self {
        headers.iter().map(|h| (h.name, h.value)).collect()
    }

    /// Capture a header map in its iteration order.
    ///
    /// A `HeaderMap` has already lowercased names and grouped repeated ones, so this is
    /// only for requests that never went through the connection recorder.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        map.iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
            .collect()
    }
}

impl<N: Into<String>, V: AsRef<[u8]>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), Bytes::copy_from_slice(v.as_ref())))
                .collect(),
        }
    }
}

/// Copy origin headers onto the client-facing header map.
///
/// With `keep_destination_headers` unset the destination is emptied first so the client
/// sees exactly the origin's header set; otherwise values are appended next to whatever
/// was already there. Lines that are not valid HTTP are skipped with a warning.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderList, keep_destination_headers: bool) {
    if !keep_destination_headers {
        dst.clear();
    }
    for (name, value) in src.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            (Ok(name), Ok(value)) => {
                dst.append(name, value);
            }
            _ => warn!(header = %name, "Dropping header that is not valid HTTP"),
        }
    }
}

/// Strip headers that must not reach the origin.
///
/// The raw request-target is cleared so the sender derives it from the parsed URI.
/// `Connection: close` is left on the wire but the close-after-response flag is turned
/// off, otherwise the sender would inject a second `Connection: close` line.
pub fn remove_proxy_headers(req: &mut ProxyRequest, log: SessionLog) {
    req.request_uri = None;
    log.info(format_args!("Sending request {} {}", req.method, req.uri));
    req.headers.remove("Accept-Encoding");
    remove_proxy_hop_headers(&mut req.headers);
    if req.headers.get("Connection") == Some("close") {
        req.close = false;
    }
}

/// Drop the `Proxy-*` lines a client addresses to this proxy, credentials included
pub fn remove_proxy_hop_headers(headers: &mut HeaderList) {
    for name in PROXY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Whether the request asks to be upgraded to a WebSocket
pub fn is_websocket_request(headers: &HeaderList) -> bool {
    headers.has_token("Connection", "upgrade") && headers.has_token("Upgrade", "websocket")
}
