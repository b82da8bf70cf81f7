//! Outbound dialing, directly or through an upstream HTTP/SOCKS5 proxy

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::config::{EgressProxyConfig, EgressProxyProtocol};
use crate::error::{Result, TamperError};

/// Opens the raw TCP stream for every origin and tunnel connection
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream>;
}

/// Default dialer, honouring the configured egress proxy
#[derive(Debug, Clone, Default)]
pub struct EgressDialer {
    egress: Option<EgressProxyConfig>,
}

impl EgressDialer {
    pub fn new(egress: Option<EgressProxyConfig>) -> Self {
        Self { egress }
    }

    /// Dial every host directly
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn egress(&self) -> Option<&EgressProxyConfig> {
        self.egress.as_ref()
    }
}

#[async_trait]
impl Dialer for EgressDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        connect_to_host_port(self.egress.as_ref(), host, port).await
    }
}

async fn connect_to_host_port(
    egress_proxy: Option<&EgressProxyConfig>,
    host: &str,
    port: u16,
) -> Result<TcpStream> {
    let direct_addr = format_tcp_addr(host, port);

    let Some(egress_proxy) = egress_proxy else {
        debug!(addr = %direct_addr, "Dialing origin");
        return TcpStream::connect(&direct_addr)
            .await
            .map_err(|e| TamperError::ConnectionFailed(format!("TCP connect to {} failed: {}", direct_addr, e)));
    };

    let proxy_addr = format_tcp_addr(&egress_proxy.host, egress_proxy.port);
    debug!(addr = %direct_addr, via = %proxy_addr, "Dialing origin through egress proxy");

    match egress_proxy.protocol {
        EgressProxyProtocol::Http => connect_via_http_proxy(egress_proxy, &proxy_addr, host, port)
            .await
            .map_err(|e| {
                TamperError::ConnectionFailed(format!(
                    "Egress HTTP proxy connect failed ({} -> {}): {}",
                    proxy_addr, direct_addr, e
                ))
            }),
        EgressProxyProtocol::Socks5 => {
            connect_via_socks5_proxy(egress_proxy, &proxy_addr, host, port)
                .await
                .map_err(|e| {
                    TamperError::ConnectionFailed(format!(
                        "Egress SOCKS5 proxy connect failed ({} -> {}): {}",
                        proxy_addr, direct_addr, e
                    ))
                })
        }
    }
}

async fn connect_via_http_proxy(
    proxy: &EgressProxyConfig,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    let authority = format_tcp_addr(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(username) = &proxy.username {
        let password = proxy.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read byte by byte so nothing past the CONNECT reply is swallowed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            anyhow::bail!("connection closed during CONNECT response");
        }
        head.push(byte[0]);
        if head.len() > 8 * 1024 {
            anyhow::bail!("CONNECT response head too large");
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        anyhow::bail!("CONNECT failed: {}", status_line);
    }

    Ok(stream)
}

async fn connect_via_socks5_proxy(
    proxy: &EgressProxyConfig,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy_addr).await?;

    let stream = match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                (target_host, target_port),
                username,
                password,
            )
            .await?
        }
        _ => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?,
    };

    Ok(stream.into_inner())
}

/// Split a `host:port` authority, falling back to `default_port` when none is given.
///
/// Bracketed IPv6 literals come back without their brackets.
pub(crate) fn parse_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    let url = url::Url::parse(&format!("http://{}", addr)).map_err(|e| {
        TamperError::InvalidRequest(format!("Invalid address '{}': {}", addr, e))
    })?;

    let host = url.host_str().ok_or_else(|| {
        TamperError::InvalidRequest(format!("Invalid address '{}': missing host", addr))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    // Url drops the port when it equals the scheme default, so look at the input too.
    let port = match url.port() {
        Some(port) => port,
        None if addr.ends_with(":80") => 80,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

/// `host:port`, bracketing bare IPv6 literals
pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
