//! Raw byte relays for CONNECT and WebSocket upgrades
//!
//! Both paths leave the filter chains behind: once the client connection is upgraded the
//! proxy only copies bytes in both directions.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TamperError};
use crate::proxy::body::{full, Body, ProxyBody};
use crate::proxy::context::ProxyContext;
use crate::proxy::egress::{parse_host_port, Dialer};
use crate::proxy::handler::text_response;
use crate::proxy::headers::{remove_proxy_hop_headers, HeaderList};
use crate::proxy::message::ProxyResponse;
use crate::proxy::transport::{into_response, prepare_target, read_response_head, write_request};

/// A CONNECT request, detached from the inbound connection
pub struct TunnelRequest {
    /// `host[:port]` the client asked for
    pub authority: String,
    pub headers: HeaderList,
    /// Resolves to the raw client stream once the `200` has been written
    pub on_upgrade: OnUpgrade,
}

/// Answers CONNECT requests
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn handle_connect(&self, tunnel: TunnelRequest, dialer: Arc<dyn Dialer>) -> Response<ProxyBody>;
}

/// Answers WebSocket upgrade requests that no request filter intercepted
#[async_trait]
pub trait UpgradeHandler: Send + Sync {
    /// Produce the response to write back; relaying, if any, happens in the background
    async fn handle_upgrade(&self, ctx: &mut ProxyContext<'_>) -> Result<ProxyResponse>;
}

/// Default CONNECT handling: dial the target and splice the two streams together
#[derive(Debug, Clone, Copy, Default)]
pub struct BlindTunnel;

#[async_trait]
impl ConnectHandler for BlindTunnel {
    #[instrument(skip(self, tunnel, dialer), fields(target = %tunnel.authority))]
    async fn handle_connect(&self, tunnel: TunnelRequest, dialer: Arc<dyn Dialer>) -> Response<ProxyBody> {
        let (host, port) = match parse_host_port(&tunnel.authority, 443) {
            Ok(target) => target,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        // Don't answer 200 until the target is reachable.
        let server = match dialer.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "CONNECT dial failed");
                return text_response(e.status_code(), &format!("Failed to establish tunnel: {}", e));
            }
        };
        info!("CONNECT tunnel established to {}:{}", host, port);

        let on_upgrade = tunnel.on_upgrade;
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let _ = copy_bidirectional(TokioIo::new(upgraded), server).await;
                }
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        Response::new(full(bytes::Bytes::new()))
    }
}

/// Default WebSocket handling: replay the handshake to the origin and, once it agrees
/// to switch protocols, relay frames untouched in both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketRelay;

#[async_trait]
impl UpgradeHandler for WebSocketRelay {
    async fn handle_upgrade(&self, ctx: &mut ProxyContext<'_>) -> Result<ProxyResponse> {
        let on_upgrade = ctx
            .req
            .take_upgrade()
            .ok_or_else(|| TamperError::TunnelError("client connection cannot be upgraded".to_string()))?;

        if !ctx.server().keep_header() {
            remove_proxy_hop_headers(&mut ctx.req.headers);
        }
        let target = prepare_target(&mut ctx.req)?;
        let conn = ctx.server().connector().connect(&target).await?;
        let mut reader = BufReader::new(conn);
        write_request(&mut reader, &ctx.req).await?;

        let head = read_response_head(&mut reader).await?;
        if head.status != StatusCode::SWITCHING_PROTOCOLS {
            ctx.log_info(format_args!("Origin refused websocket upgrade: {}", head.status));
            return into_response(head, reader, &ctx.req.method);
        }

        let log = ctx.log();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Ok((sent, received)) = copy_bidirectional(TokioIo::new(upgraded), reader).await {
                        log.info(format_args!(
                            "Websocket closed, {} bytes sent, {} bytes received",
                            sent, received
                        ));
                    }
                }
                Err(e) => log.warn(format_args!("Websocket upgrade failed: {}", e)),
            }
        });

        Ok(ProxyResponse {
            status: head.status,
            version: head.version,
            reason: head.reason,
            headers: head.headers,
            body: Body::empty(),
        })
    }
}

/// Copy data bidirectionally between two streams
#[instrument(skip(client, server))]
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (client_to_server_result, server_to_client_result) =
        tokio::join!(client_to_server, server_to_client);

    let bytes_sent = client_to_server_result.unwrap_or_else(|e| {
        debug!("Client to server copy ended: {}", e);
        0
    });

    let bytes_received = server_to_client_result.unwrap_or_else(|e| {
        debug!("Server to client copy ended: {}", e);
        0
    });

    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "Tunnel closed"
    );

    Ok((bytes_sent, bytes_received))
}
