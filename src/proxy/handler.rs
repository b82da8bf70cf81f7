//! Per-request dispatch
//!
//! Routes CONNECT to the tunnel handler and non-proxy requests to the fallback, then runs
//! everything else through request filters, the transport, response filters, and finally
//! streams the surviving response back to the client.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{Method, Request, Response, StatusCode};

use crate::error::{Result, TamperError};
use crate::proxy::body::{client_body, full, BodyCloser, BoxError, ProxyBody, RequestBody};
use crate::proxy::context::{ProxyContext, SessionLog};
use crate::proxy::filter::{filter_request, filter_response};
use crate::proxy::headers::{copy_headers, is_websocket_request, remove_proxy_headers, HeaderList};
use crate::proxy::message::{is_absolute, ProxyRequest, ProxyResponse};
use crate::proxy::recorder::RecordedHeads;
use crate::proxy::server::ProxyServer;
use crate::proxy::tunnel::TunnelRequest;

const NON_PROXY_MESSAGE: &str = "This is a proxy server. Does not respond to non-proxy requests.";

/// Serves requests that were not addressed through proxy semantics.
///
/// The body arrives unread; the handler decides whether it is worth consuming.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, req: Request<RequestBody>) -> Response<ProxyBody>;
}

/// Default fallback: refuse with a 500
#[derive(Debug, Clone, Copy, Default)]
pub struct NonProxyHandler;

#[async_trait]
impl FallbackHandler for NonProxyHandler {
    async fn handle(&self, _req: Request<RequestBody>) -> Response<ProxyBody> {
        text_response(StatusCode::INTERNAL_SERVER_ERROR, NON_PROXY_MESSAGE)
    }
}

/// Plain-text error response, newline terminated
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(format!("{}\n", message)));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    resp
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("text/event-stream"))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn body_too_large(limit: usize, log: SessionLog) -> Response<ProxyBody> {
    log.warn(format_args!("Request body exceeds {} bytes", limit));
    text_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        &format!("request body exceeds {} bytes", limit),
    )
}

impl ProxyServer {
    /// Handle one inbound request end to end.
    ///
    /// Requests that came through [`ProxyServer::serve`] carry the head exactly as the
    /// client wrote it; anything else falls back to the order of its `HeaderMap`.
    pub async fn handle<B>(&self, mut req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let recorded = req.extensions_mut().remove::<RecordedHeads>();
        let raw = recorded
            .as_ref()
            .and_then(|heads| heads.take(req.method(), req.uri()));
        let may_switch = raw.as_ref().is_some_and(|head| head.upgrade);
        let raw_headers = raw.map(|head| head.headers);

        let connect = req.method() == Method::CONNECT;
        let resp = if connect {
            self.dispatch_connect(req, raw_headers).await
        } else {
            self.dispatch(req, raw_headers).await
        };

        if let Some(heads) = recorded.filter(|_| may_switch) {
            let switched = if connect {
                resp.status().is_success()
            } else {
                resp.status() == StatusCode::SWITCHING_PROTOCOLS
            };
            if !switched {
                heads.resume();
            }
        }
        resp
    }

    async fn dispatch<B>(&self, mut req: Request<B>, raw_headers: Option<HeaderList>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let session = self.next_session();
        let log = SessionLog::new(session, self.verbose());
        let host = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        log.info(format_args!(
            "Got request {} {} {} {}",
            req.uri().path(),
            host,
            req.method(),
            req.uri()
        ));

        if !is_absolute(req.uri()) {
            let (parts, body) = req.into_parts();
            let body = body.map_err(|e| -> BoxError { e.into() }).boxed_unsync();
            return self.fallback().handle(Request::from_parts(parts, body)).await;
        }

        let limit = self.max_request_body();
        if declared_length(req.headers()).is_some_and(|len| len > limit as u64) {
            return body_too_large(limit, log);
        }

        let upgrade = wants_upgrade(req.headers()).then(|| hyper::upgrade::on(&mut req));
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return body_too_large(limit, log),
            Err(e) => {
                log.warn(format_args!("Can't read request body {}", e));
                return text_response(StatusCode::BAD_REQUEST, &format!("failed to read request body: {}", e));
            }
        };

        let req = ProxyRequest::from_parts(parts, raw_headers, body, upgrade);
        let mut ctx = ProxyContext::new(self, req, session);

        if let Some(canned) = filter_request(self.request_filters(), &mut ctx).await {
            ctx.resp = Some(canned);
        } else {
            if is_websocket_request(&ctx.req.headers) {
                ctx.log_info("Request looks like websocket upgrade.");
                return self.serve_websocket(&mut ctx).await;
            }

            if !self.keep_header() {
                remove_proxy_headers(&mut ctx.req, log);
            }
            match self.send(&mut ctx).await {
                Ok(resp) => {
                    log.info(format_args!("Received response {}", resp.status_line()));
                    ctx.resp = Some(resp);
                }
                Err(e) => ctx.error = Some(e),
            }
        }

        let original = ctx
            .resp
            .as_mut()
            .map(|resp| (resp.body.id(), resp.body.closer()));
        filter_response(self.response_filters(), &mut ctx).await;

        let Some(mut resp) = ctx.resp.take() else {
            if let Some((_, closer)) = original {
                if let Err(e) = closer.close().await {
                    log.warn(format_args!("Can't close response body {}", e));
                }
            }
            let host = ctx.req.authority().to_string();
            return match &ctx.error {
                Some(e) => {
                    log.info(format_args!("error read response {} : {}", host, e));
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
                }
                None => {
                    let message = format!("error reading response {}", host);
                    log.info(&message);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
                }
            };
        };

        log.info(format_args!(
            "Copying response to client {} [{}]",
            resp.status_line(),
            resp.status.as_u16()
        ));
        let kept_body = original.as_ref().is_some_and(|(id, _)| *id == resp.body.id());
        // A substituted body has its own length; let hyper work it out.
        if !kept_body {
            resp.headers.remove("Content-Length");
        }
        let replaced = original.filter(|_| !kept_body).map(|(_, closer)| closer);
        self.client_response(resp, replaced, log)
    }

    async fn send(&self, ctx: &mut ProxyContext<'_>) -> Result<ProxyResponse> {
        match self.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, ctx.round_trip())
                .await
                .map_err(|_| TamperError::Timeout)?,
            None => ctx.round_trip().await,
        }
    }

    async fn dispatch_connect<B>(&self, mut req: Request<B>, raw_headers: Option<HeaderList>) -> Response<ProxyBody> {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let tunnel = TunnelRequest {
            authority,
            headers: raw_headers.unwrap_or_else(|| HeaderList::from_header_map(req.headers())),
            on_upgrade,
        };
        self.connect_handler()
            .handle_connect(tunnel, self.dialer().clone())
            .await
    }

    async fn serve_websocket(&self, ctx: &mut ProxyContext<'_>) -> Response<ProxyBody> {
        let log = ctx.log();
        match self.upgrade_handler().handle_upgrade(ctx).await {
            Ok(resp) => self.client_response(resp, None, log),
            Err(e) => {
                log.warn(format_args!("Websocket upgrade failed {}", e));
                text_response(e.status_code(), &e.to_string())
            }
        }
    }

    fn client_response(
        &self,
        resp: ProxyResponse,
        replaced: Option<BodyCloser>,
        log: SessionLog,
    ) -> Response<ProxyBody> {
        let mut headers = HeaderMap::new();
        copy_headers(&mut headers, self.client_headers(), true);
        copy_headers(&mut headers, &resp.headers, self.keep_destination_headers());

        let flush_each_chunk = is_event_stream(&headers);
        let mut out = Response::new(client_body(resp.body, replaced, flush_each_chunk, log));
        *out.status_mut() = resp.status;
        *out.headers_mut() = headers;
        out
    }
}
