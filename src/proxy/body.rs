//! Message bodies
//!
//! A [`Body`] is a pull-based source of byte chunks with a stable identity, so the
//! dispatcher can tell whether a response filter swapped the origin's body for its own.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::Mutex;

use crate::proxy::context::SessionLog;

/// Body type written back to the client
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An inbound request body nobody has read yet
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Bytes gathered per frame when the response is not an event stream
const COPY_BUFFER_SIZE: usize = 32 * 1024;

static NEXT_BODY_ID: AtomicU64 = AtomicU64::new(1);

/// Something that yields body chunks until exhausted.
#[async_trait]
pub trait BodySource: Send + Sync {
    /// Next chunk, or `None` once the body is complete
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;

    /// Release whatever the source holds open
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A streaming message body
pub struct Body {
    id: u64,
    source: Box<dyn BodySource>,
}

impl Body {
    pub fn empty() -> Self {
        Self::from_source(FullSource(None))
    }

    pub fn from_source<S: BodySource + 'static>(source: S) -> Self {
        Self {
            id: NEXT_BODY_ID.fetch_add(1, Ordering::Relaxed),
            source: Box::new(source),
        }
    }

    /// Identity of this body; two bodies never share one
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.source.next_chunk().await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.source.close().await
    }

    /// A handle that can still close this body's source after the body itself has been
    /// replaced or dropped
    pub(crate) fn closer(&mut self) -> BodyCloser {
        let source = std::mem::replace(&mut self.source, Box::new(FullSource(None)));
        let shared = Arc::new(Mutex::new(source));
        self.source = Box::new(SharedSource(shared.clone()));
        BodyCloser(shared)
    }

    /// Read the whole body into memory and close it
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        self.close().await?;
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::from_source(FullSource(Some(bytes)))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

struct FullSource(Option<Bytes>);

/// A source reachable from both its body and a [`BodyCloser`]
struct SharedSource(Arc<Mutex<Box<dyn BodySource>>>);

#[async_trait]
impl BodySource for SharedSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.0.lock().await.next_chunk().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.lock().await.close().await
    }
}

#[derive(Clone)]
pub(crate) struct BodyCloser(Arc<Mutex<Box<dyn BodySource>>>);

impl BodyCloser {
    pub(crate) async fn close(&self) -> io::Result<()> {
        self.0.lock().await.close().await
    }
}

#[async_trait]
impl BodySource for FullSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.0.take().filter(|b| !b.is_empty()))
    }
}

/// A complete in-memory client body
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

struct ClientCopy {
    body: Body,
    /// Body the response started with, when a filter swapped it out
    replaced: Option<BodyCloser>,
    flush_each_chunk: bool,
    log: SessionLog,
    copied: u64,
    exhausted: bool,
    finished: bool,
}

impl ClientCopy {
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        if self.flush_each_chunk {
            loop {
                match self.body.next_chunk().await? {
                    Some(chunk) if chunk.is_empty() => continue,
                    Some(chunk) => {
                        self.copied += chunk.len() as u64;
                        return Ok(Some(chunk));
                    }
                    None => return Ok(None),
                }
            }
        }

        if self.exhausted {
            return Ok(None);
        }
        let mut buf = BytesMut::new();
        while buf.len() < COPY_BUFFER_SIZE {
            match self.body.next_chunk().await? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        if buf.is_empty() {
            return Ok(None);
        }
        self.copied += buf.len() as u64;
        Ok(Some(buf.freeze()))
    }

    async fn finish(&mut self, err: Option<&io::Error>) {
        self.finished = true;
        if let Err(close_err) = self.body.close().await {
            self.log
                .warn(format_args!("Can't close response body {}", close_err));
        }
        if let Some(replaced) = self.replaced.take() {
            if let Err(close_err) = replaced.close().await {
                self.log
                    .warn(format_args!("Can't close original response body {}", close_err));
            }
        }
        self.log.info(format_args!(
            "Copied {} bytes to client error={:?}",
            self.copied,
            err.map(|e| e.to_string())
        ));
    }
}

/// Stream `body` to the client, closing it once it is drained or fails.
///
/// With `flush_each_chunk` every chunk read from the source becomes its own frame, which
/// hyper writes out as soon as it is produced. Otherwise chunks are gathered into
/// frames of up to 32 KiB. `replaced` is closed right after `body`.
pub(crate) fn client_body(
    body: Body,
    replaced: Option<BodyCloser>,
    flush_each_chunk: bool,
    log: SessionLog,
) -> ProxyBody {
    let state = ClientCopy {
        body,
        replaced,
        flush_each_chunk,
        log,
        copied: 0,
        exhausted: false,
        finished: false,
    };

    let frames = stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        match state.next_frame().await {
            Ok(Some(data)) => Some((Ok(Frame::data(data)), state)),
            Ok(None) => {
                state.finish(None).await;
                None
            }
            Err(err) => {
                state.finish(Some(&err)).await;
                Some((Err(err), state))
            }
        }
    });

    StreamBody::new(frames).boxed_unsync()
}
