//! Request heads recorded straight off the client connection
//!
//! hyper hands the dispatcher a `HeaderMap`, which lowercases names and groups repeated
//! ones. [`RecordingStream`] sits between the socket and hyper and parses every request
//! head with `httparse` as the bytes go by, so the dispatcher can rebuild the header list
//! exactly as the client wrote it. Request bodies are skipped according to their framing.
//! After a CONNECT or upgrade head nothing is recorded until the dispatcher says the
//! connection is still speaking HTTP.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Method, Uri};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::proxy::headers::HeaderList;

/// Same ceiling the manual sender applies to origin heads
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

/// Longest chunk-size or trailer line followed
const MAX_LINE: usize = 8 * 1024;

/// One request head as the client sent it
#[derive(Debug, Clone)]
pub(crate) struct RawRequestHead {
    pub method: String,
    pub target: String,
    pub headers: HeaderList,
    /// The connection may stop speaking HTTP after this request
    pub upgrade: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Head,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    /// Waiting to learn whether a CONNECT or upgrade switched protocols
    Paused,
    /// Lost track of the stream; nothing more is recorded
    Failed,
}

enum Step {
    Need,
    Advance(usize, State),
    Head(usize, RawRequestHead, State),
    Fail,
}

#[derive(Debug, Default)]
struct Recorder {
    state: State,
    buf: Vec<u8>,
    heads: VecDeque<RawRequestHead>,
}

impl Recorder {
    fn feed(&mut self, data: &[u8]) {
        if self.stopped() {
            return;
        }
        self.buf.extend_from_slice(data);

        let mut pos = 0;
        while pos < self.buf.len() && !self.stopped() {
            match step(self.state, &self.buf[pos..]) {
                Step::Need => break,
                Step::Advance(consumed, next) => {
                    pos += consumed;
                    self.state = next;
                }
                Step::Head(consumed, head, next) => {
                    pos += consumed;
                    self.heads.push_back(head);
                    self.state = next;
                }
                Step::Fail => self.state = State::Failed,
            }
        }

        if self.stopped() {
            self.buf.clear();
            return;
        }
        self.buf.drain(..pos);

        let limit = if self.state == State::Head { MAX_HEAD_SIZE } else { MAX_LINE };
        if self.buf.len() > limit {
            self.fail();
        }
    }

    fn stopped(&self) -> bool {
        matches!(self.state, State::Paused | State::Failed)
    }

    fn fail(&mut self) {
        debug!("Stopped recording request heads on this connection");
        self.state = State::Failed;
        self.buf.clear();
        self.heads.clear();
    }
}

fn step(state: State, input: &[u8]) -> Step {
    match state {
        State::Head => parse_head(input),
        State::Length(remaining) => {
            let (consumed, left) = skip(input, remaining);
            Step::Advance(consumed, if left == 0 { State::Head } else { State::Length(left) })
        }
        State::ChunkSize => match line(input) {
            None => Step::Need,
            Some((consumed, line)) => match chunk_size(line) {
                Some(0) => Step::Advance(consumed, State::Trailers),
                Some(size) => Step::Advance(consumed, State::ChunkData(size)),
                None => Step::Fail,
            },
        },
        State::ChunkData(remaining) => {
            let (consumed, left) = skip(input, remaining);
            Step::Advance(consumed, if left == 0 { State::ChunkEnd } else { State::ChunkData(left) })
        }
        State::ChunkEnd => match line(input) {
            None => Step::Need,
            Some((consumed, line)) if line.is_empty() => Step::Advance(consumed, State::ChunkSize),
            Some(_) => Step::Fail,
        },
        State::Trailers => match line(input) {
            None => Step::Need,
            Some((consumed, line)) => {
                Step::Advance(consumed, if line.is_empty() { State::Head } else { State::Trailers })
            }
        },
        State::Paused | State::Failed => Step::Need,
    }
}

fn parse_head(input: &[u8]) -> Step {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut storage);
    let consumed = match req.parse(input) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Step::Need,
        Err(_) => return Step::Fail,
    };
    let (Some(method), Some(target)) = (req.method, req.path) else {
        return Step::Fail;
    };

    let headers = HeaderList::from_parsed(req.headers);
    let upgrade = method.eq_ignore_ascii_case("CONNECT") || headers.has_token("Connection", "upgrade");
    let next = if upgrade {
        State::Paused
    } else {
        match body_state(&headers) {
            Some(next) => next,
            None => return Step::Fail,
        }
    };

    Step::Head(
        consumed,
        RawRequestHead {
            method: method.to_string(),
            target: target.to_string(),
            headers,
            upgrade,
        },
        next,
    )
}

/// Where the request body ends, `None` when hyper would refuse the framing
fn body_state(headers: &HeaderList) -> Option<State> {
    if headers.has_token("Transfer-Encoding", "chunked") {
        return Some(State::ChunkSize);
    }
    if headers.contains("Transfer-Encoding") {
        return None;
    }
    match headers.get("Content-Length") {
        None => Some(State::Head),
        Some(value) => match value.trim().parse::<u64>().ok()? {
            0 => Some(State::Head),
            len => Some(State::Length(len)),
        },
    }
}

fn skip(input: &[u8], remaining: u64) -> (usize, u64) {
    let consumed = input.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    (consumed, remaining - consumed as u64)
}

/// Bytes up to and including the first `\n`, and the line without its terminator
fn line(input: &[u8]) -> Option<(usize, &[u8])> {
    let end = input.iter().position(|&b| b == b'\n')?;
    let line = &input[..end];
    Some((end + 1, line.strip_suffix(b"\r").unwrap_or(line)))
}

fn chunk_size(line: &[u8]) -> Option<u64> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size).ok()?;
    u64::from_str_radix(size.trim(), 16).ok()
}

/// Heads recorded on one client connection, oldest first
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordedHeads {
    inner: Arc<Mutex<Recorder>>,
}

impl RecordedHeads {
    fn feed(&self, data: &[u8]) {
        self.inner.lock().feed(data);
    }

    /// The oldest recorded head, provided it is the one hyper parsed as `method` `uri`.
    ///
    /// A mismatch means the recorder lost its place; it stops for the rest of the
    /// connection and callers fall back to hyper's header map.
    pub fn take(&self, method: &Method, uri: &Uri) -> Option<RawRequestHead> {
        let mut recorder = self.inner.lock();
        let head = recorder.heads.pop_front()?;
        let same_target = head.target.parse::<Uri>().is_ok_and(|target| target == *uri);
        if head.method == method.as_str() && same_target {
            return Some(head);
        }
        debug!(method = %method, uri = %uri, "Recorded request head out of step");
        recorder.fail();
        None
    }

    /// Pick up recording again after a CONNECT or upgrade that did not switch protocols
    pub fn resume(&self) {
        let mut recorder = self.inner.lock();
        if recorder.state == State::Paused {
            recorder.state = State::Head;
        }
    }
}

/// Client stream that records request heads as hyper reads them
pub(crate) struct RecordingStream<S> {
    inner: S,
    heads: RecordedHeads,
}

impl<S> RecordingStream<S> {
    pub fn new(inner: S) -> (Self, RecordedHeads) {
        let heads = RecordedHeads::default();
        (
            Self {
                inner,
                heads: heads.clone(),
            },
            heads,
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordingStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                this.heads.feed(read);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordingStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
