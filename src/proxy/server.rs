//! Proxy server: shared state, builder and the accept loop
//!
//! Everything the dispatcher needs is fixed when [`ProxyServerBuilder::build`] returns,
//! so a running server can be shared across connections without locking.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{Result, TamperError};
use crate::proxy::context::ProxyContext;
use crate::proxy::egress::{Dialer, EgressDialer};
use crate::proxy::filter::{FnRequestFilter, FnResponseFilter, RequestFilter, ResponseFilter};
use crate::proxy::filters::{AuthenticatedTunnel, BasicAuthFilter};
use crate::proxy::handler::{FallbackHandler, NonProxyHandler};
use crate::proxy::headers::HeaderList;
use crate::proxy::message::ProxyResponse;
use crate::proxy::recorder::RecordingStream;
use crate::proxy::tls::{default_client_config, CertStore};
use crate::proxy::transport::{ManualTransport, OriginConnector, RoundTripper};
use crate::proxy::tunnel::{BlindTunnel, ConnectHandler, UpgradeHandler, WebSocketRelay};

/// Request bodies larger than this are refused unless the builder says otherwise
pub const DEFAULT_MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Proxy server
pub struct ProxyServer {
    session: AtomicU64,
    verbose: bool,
    keep_header: bool,
    keep_destination_headers: bool,
    request_timeout: Option<Duration>,
    max_request_body: usize,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
    client_headers: HeaderList,
    dialer: Arc<dyn Dialer>,
    connector: OriginConnector,
    transport: Arc<dyn RoundTripper>,
    fallback: Arc<dyn FallbackHandler>,
    connect_handler: Arc<dyn ConnectHandler>,
    upgrade_handler: Arc<dyn UpgradeHandler>,
    cert_store: Option<Arc<dyn CertStore>>,
}

impl ProxyServer {
    pub fn builder() -> ProxyServerBuilder {
        ProxyServerBuilder::default()
    }

    /// Server configured from the environment-derived settings
    pub fn from_config(config: &ProxyServerConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .verbose(config.verbose)
            .keep_header(config.keep_header)
            .keep_destination_headers(config.keep_destination_headers)
            .max_request_body(config.max_request_body)
            .dialer(Arc::new(EgressDialer::new(config.egress_proxy.clone())));

        if let Some(timeout) = config.request_timeout {
            builder = builder.request_timeout(timeout);
        }

        if config.auth_enabled {
            if config.auth_username.is_empty() {
                return Err(TamperError::InvalidConfig(
                    "PROXY_AUTH_USERNAME is required when authentication is enabled".into(),
                ));
            }
            let auth = BasicAuthFilter::new(config.auth_username.clone(), config.auth_password.clone());
            builder = builder
                .on_request(auth.clone())
                .connect_handler(AuthenticatedTunnel::new(auth, BlindTunnel));
        }

        builder.build()
    }

    /// Next session id; the first request gets 1
    pub(crate) fn next_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn keep_header(&self) -> bool {
        self.keep_header
    }

    pub fn keep_destination_headers(&self) -> bool {
        self.keep_destination_headers
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Largest request body buffered for the filters, in bytes
    pub fn max_request_body(&self) -> usize {
        self.max_request_body
    }

    pub fn request_filters(&self) -> &[Arc<dyn RequestFilter>] {
        &self.request_filters
    }

    pub fn response_filters(&self) -> &[Arc<dyn ResponseFilter>] {
        &self.response_filters
    }

    /// Default headers every proxied response starts from
    pub fn client_headers(&self) -> &HeaderList {
        &self.client_headers
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    /// Dials and secures origin connections
    pub fn connector(&self) -> &OriginConnector {
        &self.connector
    }

    pub fn transport(&self) -> &Arc<dyn RoundTripper> {
        &self.transport
    }

    pub fn fallback(&self) -> &Arc<dyn FallbackHandler> {
        &self.fallback
    }

    pub fn connect_handler(&self) -> &Arc<dyn ConnectHandler> {
        &self.connect_handler
    }

    pub fn upgrade_handler(&self) -> &Arc<dyn UpgradeHandler> {
        &self.upgrade_handler
    }

    pub fn cert_store(&self) -> Option<&Arc<dyn CertStore>> {
        self.cert_store.as_ref()
    }

    /// Bind `addr` and serve until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` flips to true
    #[instrument(skip_all)]
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(server, stream, client_addr).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(server: Arc<Self>, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        debug!(client = %client_addr, "Accepted connection");
        let (stream, heads) = RecordingStream::new(stream);
        let io = TokioIo::new(stream);

        let service = service_fn(move |mut req: Request<Incoming>| {
            let server = server.clone();
            req.extensions_mut().insert(heads.clone());
            async move { Ok::<_, Infallible>(server.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| TamperError::Http(e.to_string()))?;

        Ok(())
    }
}

/// Builder for creating a proxy server
#[derive(Default)]
pub struct ProxyServerBuilder {
    verbose: bool,
    keep_header: bool,
    keep_destination_headers: bool,
    request_timeout: Option<Duration>,
    max_request_body: Option<usize>,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
    client_headers: HeaderList,
    dialer: Option<Arc<dyn Dialer>>,
    transport: Option<Arc<dyn RoundTripper>>,
    tls_config: Option<Arc<ClientConfig>>,
    fallback: Option<Arc<dyn FallbackHandler>>,
    connect_handler: Option<Arc<dyn ConnectHandler>>,
    upgrade_handler: Option<Arc<dyn UpgradeHandler>>,
    cert_store: Option<Arc<dyn CertStore>>,
}

impl ProxyServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the per-session INFO lines
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Forward proxy-only request headers instead of stripping them
    pub fn keep_header(mut self, keep: bool) -> Self {
        self.keep_header = keep;
        self
    }

    /// Append origin headers to the client defaults instead of replacing them
    pub fn keep_destination_headers(mut self, keep: bool) -> Self {
        self.keep_destination_headers = keep;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Refuse proxied request bodies above `limit` bytes with a 413
    pub fn max_request_body(mut self, limit: usize) -> Self {
        self.max_request_body = Some(limit);
        self
    }

    /// How origin and CONNECT targets are dialed
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Replace the manual sender as the default transport
    pub fn transport(mut self, transport: Arc<dyn RoundTripper>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// TLS settings for https origins
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn fallback(mut self, handler: impl FallbackHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn connect_handler(mut self, handler: impl ConnectHandler + 'static) -> Self {
        self.connect_handler = Some(Arc::new(handler));
        self
    }

    pub fn upgrade_handler(mut self, handler: impl UpgradeHandler + 'static) -> Self {
        self.upgrade_handler = Some(Arc::new(handler));
        self
    }

    pub fn cert_store(mut self, store: Arc<dyn CertStore>) -> Self {
        self.cert_store = Some(store);
        self
    }

    /// Add a header every proxied response starts with
    pub fn client_header(mut self, name: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.client_headers.append(name, value);
        self
    }

    pub fn on_request(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.request_filters.push(Arc::new(filter));
        self
    }

    pub fn on_response(mut self, filter: impl ResponseFilter + 'static) -> Self {
        self.response_filters.push(Arc::new(filter));
        self
    }

    pub fn on_request_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut ProxyContext<'_>) -> Option<ProxyResponse> + Send + Sync + 'static,
    {
        self.on_request(FnRequestFilter::new(f))
    }

    pub fn on_response_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut ProxyContext<'_>) + Send + Sync + 'static,
    {
        self.on_response(FnResponseFilter::new(f))
    }

    pub fn build(self) -> Result<ProxyServer> {
        let dialer = self
            .dialer
            .unwrap_or_else(|| Arc::new(EgressDialer::direct()));
        let tls_config = match self.tls_config {
            Some(config) => config,
            None => default_client_config()?,
        };
        let connector = OriginConnector::new(dialer.clone(), tls_config);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ManualTransport::new(connector.clone())));

        Ok(ProxyServer {
            session: AtomicU64::new(0),
            verbose: self.verbose,
            keep_header: self.keep_header,
            keep_destination_headers: self.keep_destination_headers,
            request_timeout: self.request_timeout,
            max_request_body: self.max_request_body.unwrap_or(DEFAULT_MAX_REQUEST_BODY),
            request_filters: self.request_filters,
            response_filters: self.response_filters,
            client_headers: self.client_headers,
            dialer,
            connector,
            transport,
            fallback: self.fallback.unwrap_or_else(|| Arc::new(NonProxyHandler)),
            connect_handler: self.connect_handler.unwrap_or_else(|| Arc::new(BlindTunnel)),
            upgrade_handler: self.upgrade_handler.unwrap_or_else(|| Arc::new(WebSocketRelay)),
            cert_store: self.cert_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EgressProxyConfig, EgressProxyProtocol};
    use crate::proxy::tls::MemoryCertStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config() -> ProxyServerConfig {
        ProxyServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            verbose: false,
            keep_header: false,
            keep_destination_headers: false,
            request_timeout: None,
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            auth_enabled: false,
            auth_username: String::new(),
            auth_password: String::new(),
            egress_proxy: None,
        }
    }

    /// Write `request` to `addr` and read until the peer closes
    async fn exchange_bytes(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn exchange(addr: SocketAddr, request: String) -> String {
        String::from_utf8(exchange_bytes(addr, request.as_bytes()).await).unwrap()
    }

    async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        head
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    fn auth_config() -> ProxyServerConfig {
        let mut config = config();
        config.auth_enabled = true;
        config.auth_username = "user".to_string();
        config.auth_password = "pass".to_string();
        config
    }

    async fn spawn_proxy(server: ProxyServer) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::new(server).serve(listener, shutdown_rx));
        (addr, shutdown_tx, task)
    }

    #[test]
    fn test_builder_defaults() {
        let server = ProxyServer::builder().build().unwrap();
        assert!(!server.verbose());
        assert!(!server.keep_header());
        assert!(!server.keep_destination_headers());
        assert!(server.request_timeout().is_none());
        assert_eq!(server.max_request_body(), DEFAULT_MAX_REQUEST_BODY);
        assert!(server.request_filters().is_empty());
        assert!(server.response_filters().is_empty());
        assert!(server.client_headers().is_empty());
        assert!(server.cert_store().is_none());
    }

    #[test]
    fn test_builder_settings() {
        let server = ProxyServer::builder()
            .verbose(true)
            .keep_header(true)
            .keep_destination_headers(true)
            .request_timeout(Duration::from_secs(3))
            .max_request_body(512)
            .client_header("X-Proxy", "tamper")
            .cert_store(Arc::new(MemoryCertStore::new()))
            .on_request_fn(|_: &mut ProxyContext<'_>| None)
            .on_response_fn(|_: &mut ProxyContext<'_>| {})
            .build()
            .unwrap();

        assert!(server.verbose());
        assert!(server.keep_header());
        assert!(server.keep_destination_headers());
        assert_eq!(server.request_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(server.max_request_body(), 512);
        assert_eq!(server.client_headers().get("x-proxy"), Some("tamper"));
        assert!(server.cert_store().is_some());
        assert_eq!(server.request_filters().len(), 1);
        assert_eq!(server.response_filters().len(), 1);
    }

    #[test]
    fn test_sessions_start_at_one() {
        let server = ProxyServer::builder().build().unwrap();
        assert_eq!(server.next_session(), 1);
        assert_eq!(server.next_session(), 2);
    }

    #[test]
    fn test_from_config() {
        let mut config = config();
        config.verbose = true;
        config.request_timeout = Some(Duration::from_secs(5));
        config.egress_proxy = Some(EgressProxyConfig {
            protocol: EgressProxyProtocol::Socks5,
            host: "127.0.0.1".to_string(),
            port: 1080,
            username: None,
            password: None,
        });

        let server = ProxyServer::from_config(&config).unwrap();
        assert!(server.verbose());
        assert_eq!(server.request_timeout(), Some(Duration::from_secs(5)));
        assert!(server.request_filters().is_empty());

        config.auth_enabled = true;
        config.auth_username = "user".to_string();
        config.auth_password = "pass".to_string();
        let server = ProxyServer::from_config(&config).unwrap();
        assert_eq!(server.request_filters().len(), 1);
    }

    #[test]
    fn test_from_config_rejects_auth_without_username() {
        let mut config = config();
        config.auth_enabled = true;
        assert!(matches!(
            ProxyServer::from_config(&config),
            Err(TamperError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_proxies_over_a_socket() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nX-Origin: yes\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let server = ProxyServer::builder()
            .on_response_fn(|ctx: &mut ProxyContext<'_>| {
                if let Some(resp) = ctx.resp.as_mut() {
                    resp.headers.append("X-Filtered", "1");
                }
            })
            .build()
            .unwrap();
        let (addr, shutdown_tx, task) = spawn_proxy(server).await;

        let reply = exchange(
            addr,
            format!(
                "GET http://{}/greeting HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                origin_addr, origin_addr
            ),
        )
        .await;

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("X-Origin: yes\r\n"));
        assert!(reply.contains("X-Filtered: 1\r\n"));
        assert!(reply.ends_with("\r\n\r\nhello"));

        shutdown_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_forwards_header_lines_as_written() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            head
        });

        let (addr, shutdown_tx, _task) = spawn_proxy(ProxyServer::builder().build().unwrap()).await;
        let reply = exchange(
            addr,
            format!(
                "GET http://{}/path HTTP/1.1\r\nHost: {}\r\nUser-Agent: UA\r\nX-A: 1\r\nX-B: 2\r\n\
                 X-A: 3\r\nConnection: close\r\n\r\n",
                origin_addr, origin_addr
            ),
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 204 No Content\r\n"));

        let head = String::from_utf8(seen.await.unwrap()).unwrap();
        assert_eq!(
            head,
            "GET /path HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             User-Agent: UA\r\n\
             X-A: 1\r\n\
             X-B: 2\r\n\
             X-A: 3\r\n\
             Connection: close\r\n\
             \r\n"
        );

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_serve_passes_non_utf8_values_through() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nX-Name: caf\xe9\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            head
        });

        let (addr, shutdown_tx, _task) = spawn_proxy(ProxyServer::builder().build().unwrap()).await;
        let mut request = format!("GET http://{}/ HTTP/1.1\r\nHost: {}\r\n", origin_addr, origin_addr).into_bytes();
        request.extend_from_slice(b"X-Name: caf\xe9\r\nConnection: close\r\n\r\n");
        let reply = exchange_bytes(addr, &request).await;

        assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(contains(&reply, b"X-Name: caf\xe9\r\n"));
        assert!(reply.ends_with(b"\r\n\r\nok"));
        assert!(contains(&seen.await.unwrap(), b"\r\nX-Name: caf\xe9\r\n"));

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_serve_keeps_proxy_credentials_from_websocket_origin() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });

        let (addr, shutdown_tx, _task) = spawn_proxy(ProxyServer::from_config(&auth_config()).unwrap()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET http://{}/socket HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
             Proxy-Authorization: Basic {}\r\nProxy-Connection: keep-alive\r\n\r\n",
            origin_addr,
            origin_addr,
            BASE64.encode("user:pass")
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let reply = String::from_utf8(read_head(&mut stream).await).unwrap();
        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));

        let head = seen.await.unwrap();
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-"));

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_serve_requires_proxy_auth_when_configured() {
        let (addr, shutdown_tx, _task) = spawn_proxy(ProxyServer::from_config(&auth_config()).unwrap()).await;

        let reply = exchange(
            addr,
            "GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(reply.contains("Proxy-Authenticate: Basic realm=\"Proxy\"\r\n"));

        let reply = exchange(
            addr,
            "CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_serve_tunnels_connect() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let (addr, shutdown_tx, _task) = spawn_proxy(ProxyServer::from_config(&auth_config()).unwrap()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: Basic {}\r\n\r\n",
            target_addr,
            target_addr,
            BASE64.encode("user:pass")
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(String::from_utf8(head).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        shutdown_tx.send(true).unwrap();
    }
}
