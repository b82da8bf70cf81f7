//! Manual HTTP/1.1 sender
//!
//! Requests are serialized by hand so the origin sees header lines in exactly the order
//! and spelling they have on the [`ProxyRequest`]. Every round trip opens a fresh
//! connection; nothing is pooled. The connection is handed to the response body, which
//! shuts it down once the body has been streamed, or drops it with the body.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::uri::{Authority, PathAndQuery};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Result, TamperError};
use crate::proxy::body::{Body, BodySource};
use crate::proxy::context::SessionLog;
use crate::proxy::egress::Dialer;
use crate::proxy::headers::HeaderList;
use crate::proxy::message::{ProxyRequest, ProxyResponse};
use crate::proxy::tls::server_name;

/// Largest response head accepted from an origin
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

/// Longest chunk-size or trailer line accepted from an origin
const MAX_LINE: usize = 8 * 1024;

/// Sends a request to its origin and returns the parsed response
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: &mut ProxyRequest, log: SessionLog) -> Result<ProxyResponse>;
}

/// A plain or TLS-wrapped stream to an origin
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

pub(crate) type OriginReader = BufReader<Box<dyn Connection>>;

/// Where a request is going once its URI has been normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    pub https: bool,
    /// Hostname without IPv6 brackets
    pub host: String,
    pub port: u16,
}

/// Give the request URI an explicit port and set `Host` from its hostname.
///
/// `https` and `wss` default to 443, everything else to 80.
pub fn prepare_target(req: &mut ProxyRequest) -> Result<OriginTarget> {
    let https = matches!(req.uri.scheme_str(), Some("https") | Some("wss"));
    let host = req
        .uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TamperError::InvalidRequest(format!("missing host in '{}'", req.uri)))?
        .to_string();

    let port = match req.uri.port_u16() {
        Some(port) => port,
        None => {
            let port = if https { 443 } else { 80 };
            req.uri = with_port(&req.uri, &host, port)?;
            port
        }
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&host)
        .to_string();
    req.headers.set("Host", host.clone());

    Ok(OriginTarget { https, host, port })
}

fn with_port(uri: &Uri, host: &str, port: u16) -> Result<Uri> {
    let authority: Authority = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| TamperError::InvalidRequest(format!("invalid authority for '{}': {}", uri, e)))?;

    let mut parts = uri.clone().into_parts();
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|e| TamperError::InvalidRequest(e.to_string()))
}

/// Origin-form request-target, `/` when the URI has no path
fn request_target(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("/")
}

/// Serialize the request line, every header line in order, then the body.
///
/// `Connection: close` is added only when the close flag is still set and the request
/// carries no `Connection` header of its own. A chunked request body, already decoded by
/// the inbound server, is written back as a single chunk.
pub fn encode_request(req: &ProxyRequest) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + req.body.len());
    out.put_slice(format!("{} {} HTTP/1.1\r\n", req.method, request_target(&req.uri)).as_bytes());
    for (name, value) in req.headers.iter() {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }
    if req.close && !req.headers.contains("Connection") {
        out.put_slice(b"Connection: close\r\n");
    }
    out.put_slice(b"\r\n");

    if req.headers.has_token("Transfer-Encoding", "chunked") {
        if !req.body.is_empty() {
            out.put_slice(format!("{:x}\r\n", req.body.len()).as_bytes());
            out.put_slice(&req.body);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"0\r\n\r\n");
    } else {
        out.put_slice(&req.body);
    }
    out.freeze()
}

/// Dials origins and wraps `https` targets in TLS
#[derive(Clone)]
pub struct OriginConnector {
    dialer: Arc<dyn Dialer>,
    tls: TlsConnector,
}

impl OriginConnector {
    pub fn new(dialer: Arc<dyn Dialer>, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            dialer,
            tls: TlsConnector::from(tls_config),
        }
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    pub async fn connect(&self, target: &OriginTarget) -> Result<Box<dyn Connection>> {
        let stream = self.dialer.dial(&target.host, target.port).await?;
        if !target.https {
            return Ok(Box::new(stream));
        }

        let name = server_name(&target.host)?;
        let stream = self.tls.connect(name, stream).await.map_err(|e| {
            TamperError::Tls(format!("handshake with {}:{} failed: {}", target.host, target.port, e))
        })?;
        Ok(Box::new(stream))
    }
}

/// The built-in transport: one fresh connection per request, headers written verbatim
#[derive(Clone)]
pub struct ManualTransport {
    connector: OriginConnector,
}

impl ManualTransport {
    pub fn new(connector: OriginConnector) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl RoundTripper for ManualTransport {
    async fn round_trip(&self, req: &mut ProxyRequest, log: SessionLog) -> Result<ProxyResponse> {
        let target = prepare_target(req)?;
        debug!(session = log.session(), url = %req.uri, "Request URL");

        let conn = self.connector.connect(&target).await?;
        let mut reader = BufReader::new(conn);
        write_request(&mut reader, req).await?;

        let head = read_response_head(&mut reader).await.map_err(|e| {
            debug!(session = log.session(), error = %e, "Error reading response");
            e
        })?;
        debug!(session = log.session(), status = %head.status, "Response Status");

        into_response(head, reader, &req.method)
    }
}

pub(crate) async fn write_request(reader: &mut OriginReader, req: &ProxyRequest) -> Result<()> {
    let conn = reader.get_mut();
    conn.write_all(&encode_request(req)).await?;
    conn.flush().await?;
    Ok(())
}

/// Status line and headers of an origin response
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub reason: Option<String>,
    pub headers: HeaderList,
}

/// Read the final response head, skipping interim 1xx responses other than `101`
pub(crate) async fn read_response_head(reader: &mut OriginReader) -> Result<ResponseHead> {
    loop {
        let raw = read_head(reader).await?;
        let head = parse_response_head(&raw)?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        return Ok(head);
    }
}

/// Attach a lazily read body to `head`; the body takes ownership of the connection
pub(crate) fn into_response(head: ResponseHead, reader: OriginReader, method: &Method) -> Result<ProxyResponse> {
    let state = match body_framing(method, &head)? {
        Framing::Empty => BodyState::Done,
        Framing::Length(len) => BodyState::Length(len),
        Framing::Chunked => BodyState::ChunkSize,
        Framing::UntilClose => BodyState::UntilClose,
    };

    Ok(ProxyResponse {
        status: head.status,
        version: head.version,
        reason: head.reason,
        headers: head.headers,
        body: Body::from_source(OriginBody { reader, state }),
    })
}

/// Read up to the blank line ending a head, never buffering more than `MAX_HEAD_SIZE`
async fn read_head(reader: &mut OriginReader) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    loop {
        let start = head.len();
        if start >= MAX_HEAD_SIZE {
            return Err(TamperError::MalformedResponse("response head too large".to_string()));
        }
        let budget = (MAX_HEAD_SIZE - start) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(TamperError::PrematureClose);
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                // Stray blank line before the status line.
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    if parsed.parse(raw)?.is_partial() {
        return Err(TamperError::MalformedResponse("incomplete response head".to_string()));
    }

    let code = parsed
        .code
        .ok_or_else(|| TamperError::MalformedResponse("missing status code".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| TamperError::MalformedResponse(format!("invalid status code {}", code)))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    Ok(ResponseHead {
        status,
        version,
        reason: parsed
            .reason
            .filter(|r| !r.is_empty())
            .map(str::to_string),
        headers: HeaderList::from_parsed(parsed.headers),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

fn body_framing(method: &Method, head: &ResponseHead) -> Result<Framing> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }

    if head.headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(Framing::Chunked);
    }
    if head.headers.contains("Transfer-Encoding") {
        return Ok(Framing::UntilClose);
    }
    if let Some(value) = head.headers.get("Content-Length") {
        let len: u64 = value.trim().parse().map_err(|_| {
            TamperError::MalformedResponse(format!("invalid Content-Length '{}'", value))
        })?;
        return Ok(if len == 0 {
            Framing::Empty
        } else {
            Framing::Length(len)
        });
    }

    Ok(Framing::UntilClose)
}

#[derive(Debug, Clone, Copy)]
enum BodyState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    UntilClose,
    Done,
}

/// Response body read straight off the origin connection
struct OriginBody {
    reader: OriginReader,
    state: BodyState,
}

impl OriginBody {
    /// Up to `limit` bytes of whatever is already buffered or next to arrive
    async fn read_some(&mut self, limit: u64) -> io::Result<Bytes> {
        let buf = self.reader.fill_buf().await?;
        let n = buf.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        self.reader.consume(n);
        Ok(chunk)
    }

    /// One line without its terminator, at most `MAX_LINE` bytes long
    async fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if line.last() != Some(&b'\n') {
            return Err(if n == MAX_LINE {
                invalid(format!("line longer than {} bytes in chunked body", MAX_LINE))
            } else {
                truncated()
            });
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "origin closed the connection mid-body")
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[async_trait]
impl BodySource for OriginBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.state {
                BodyState::Done => return Ok(None),
                BodyState::Length(0) => self.state = BodyState::Done,
                BodyState::Length(remaining) => {
                    let chunk = self.read_some(remaining).await?;
                    if chunk.is_empty() {
                        return Err(truncated());
                    }
                    self.state = BodyState::Length(remaining - chunk.len() as u64);
                    return Ok(Some(chunk));
                }
                BodyState::ChunkSize => {
                    let line = self.read_line().await?;
                    let size = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size, 16)
                        .map_err(|_| invalid(format!("invalid chunk size '{}'", line)))?;
                    self.state = if size == 0 {
                        BodyState::Trailers
                    } else {
                        BodyState::ChunkData(size)
                    };
                }
                BodyState::ChunkData(remaining) => {
                    let chunk = self.read_some(remaining).await?;
                    if chunk.is_empty() {
                        return Err(truncated());
                    }
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        BodyState::ChunkEnd
                    } else {
                        BodyState::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::ChunkEnd => {
                    if !self.read_line().await?.is_empty() {
                        return Err(invalid("missing CRLF after chunk data".to_string()));
                    }
                    self.state = BodyState::ChunkSize;
                }
                BodyState::Trailers => {
                    if self.read_line().await?.is_empty() {
                        self.state = BodyState::Done;
                    }
                }
                BodyState::UntilClose => {
                    let chunk = match self.read_some(u64::MAX).await {
                        Ok(chunk) => chunk,
                        // TLS peers often skip close_notify
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Bytes::new(),
                        Err(e) => return Err(e),
                    };
                    if chunk.is_empty() {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                    return Ok(Some(chunk));
                }
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.state = BodyState::Done;
        match self.reader.get_mut().shutdown().await {
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotConnected
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(())
            }
            other => other,
        }
    }
}
