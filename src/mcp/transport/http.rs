//! Streaming HTTP transport.
//!
//! One fixed endpoint, static headers attached once when the client is built.
//! `connect()` opens the persistent server stream (`GET`, `text/event-stream`);
//! every outbound frame is a `POST` whose reply is either a JSON body (one
//! frame) or an event stream (one frame per event). Replies from both paths
//! are merged into a single inbound [`FrameStream`].
//!
//! Providers that mint their session on `initialize` refuse a session-less
//! `GET` with `400`/`404`. The server stream is then opened after the first
//! `POST` reply that carries an `mcp-session-id`. A `405` means the provider
//! has no server stream at all and every reply arrives on a `POST` response.
//!
//! There is no reconnect. If the persistent stream drops, an
//! [`TransportError::StreamDropped`] is delivered and the stream is terminal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{DEFAULT_MAX_FRAME_BYTES, FrameStream, Transport};
use crate::error::TransportError;
use crate::relock;

const SESSION_HEADER: &str = "mcp-session-id";
const EVENT_STREAM: &str = "text/event-stream";
const FRAME_CHANNEL_CAPACITY: usize = 64;

type FrameSender = mpsc::Sender<Result<String, TransportError>>;

/// Endpoint and static headers for a remote provider.
#[derive(Debug, Clone)]
pub struct StreamingHttpConfig {
    /// Label used in logs (normally the connector id).
    pub label: String,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub max_frame_bytes: usize,
}

impl StreamingHttpConfig {
    pub fn new(label: impl Into<String>, url: Url) -> Self {
        Self {
            label: label.into(),
            url,
            headers: HashMap::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    #[must_use]
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }
}

#[derive(Debug)]
struct Live {
    http: reqwest::Client,
    inbound: FrameSender,
    shutdown: CancellationToken,
}

/// Whether the persistent server stream is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerStream {
    Open,
    /// Waiting for a session id before retrying the `GET`.
    AwaitingSession,
    Unavailable,
}

#[derive(Debug)]
enum FrameSlot {
    Idle,
    Ready(mpsc::Receiver<Result<String, TransportError>>),
    Taken,
}

/// Transport over a long-lived HTTP connection.
#[derive(Debug)]
pub struct StreamingHttpTransport {
    config: StreamingHttpConfig,
    default_headers: HeaderMap,
    live: Mutex<Option<Live>>,
    frames: Mutex<FrameSlot>,
    session_id: Arc<Mutex<Option<String>>>,
    server_stream: Mutex<ServerStream>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamingHttpTransport {
    /// Validate the static headers up front so a bad config never reaches
    /// the network.
    pub fn new(config: StreamingHttpConfig) -> Result<Self, TransportError> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidConfig(format!("header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidConfig(format!("header `{name}`: {e}")))?;
            default_headers.insert(name, value);
        }

        Ok(Self {
            config,
            default_headers,
            live: Mutex::new(None),
            frames: Mutex::new(FrameSlot::Idle),
            session_id: Arc::new(Mutex::new(None)),
            server_stream: Mutex::new(ServerStream::Unavailable),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Session id assigned by the provider, if any.
    pub fn session_id(&self) -> Option<String> {
        relock(self.session_id.lock()).clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = relock(self.tasks.lock());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn classify_status(&self, status: StatusCode) -> Result<(), TransportError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized {
                url: self.config.url.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: self.config.url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Issue the `GET` for the server stream and start forwarding its frames.
    async fn open_server_stream(
        &self,
        http: &reqwest::Client,
        tx: &FrameSender,
        shutdown: &CancellationToken,
    ) -> Result<ServerStream, TransportError> {
        let session = self.session_id();
        let mut req = http
            .get(self.config.url.clone())
            .header(ACCEPT, EVENT_STREAM);
        if let Some(session) = &session {
            req = req.header(SESSION_HEADER, session);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            debug!(
                connector = %self.config.label,
                "Provider offers no server stream; replies arrive on POST responses"
            );
            return Ok(ServerStream::Unavailable);
        }
        let needs_session = status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND;
        if session.is_none() && needs_session {
            debug!(
                connector = %self.config.label,
                status = status.as_u16(),
                "Server stream needs a session; retrying after initialize"
            );
            return Ok(ServerStream::AwaitingSession);
        }
        self.classify_status(status)?;
        remember_session(&self.session_id, resp.headers());

        let framing = Framing::for_stream(resp.headers());
        let frames = body_frames(resp, framing, self.config.max_frame_bytes);
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        let label = self.config.label.clone();
        self.track(tokio::spawn(async move {
            let ended = forward(frames, &tx, &shutdown).await;
            if ended && !shutdown.is_cancelled() {
                warn!(connector = %label, "Provider stream dropped");
                let _ = tx
                    .send(Err(TransportError::StreamDropped(
                        "server stream ended".into(),
                    )))
                    .await;
            }
        }));
        Ok(ServerStream::Open)
    }

    /// Claim the deferred `GET` once a session id is known.
    fn take_deferred_stream(&self) -> bool {
        let mut mode = relock(self.server_stream.lock());
        if *mode == ServerStream::AwaitingSession && self.session_id().is_some() {
            *mode = ServerStream::Unavailable;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Transport for StreamingHttpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if relock(self.live.lock()).is_some() {
            return Ok(());
        }

        let http = reqwest::Client::builder()
            .default_headers(self.default_headers.clone())
            .build()?;

        info!(
            name: "transport.http.connect",
            connector = %self.config.label,
            url = %self.config.url,
            "Opening provider stream"
        );

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        *relock(self.session_id.lock()) = None;
        let mode = self.open_server_stream(&http, &tx, &shutdown).await?;
        *relock(self.server_stream.lock()) = mode;

        *relock(self.frames.lock()) = FrameSlot::Ready(rx);
        *relock(self.live.lock()) = Some(Live {
            http,
            inbound: tx,
            shutdown,
        });
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let (http, inbound, shutdown) = {
            let guard = relock(self.live.lock());
            let live = guard.as_ref().ok_or(TransportError::Closed)?;
            (live.http.clone(), live.inbound.clone(), live.shutdown.clone())
        };

        let mut req = http
            .post(self.config.url.clone())
            .header(ACCEPT, format!("application/json, {EVENT_STREAM}"))
            .header(CONTENT_TYPE, "application/json")
            .body(frame);
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req.send().await?;
        remember_session(&self.session_id, resp.headers());

        if resp.status() == StatusCode::ACCEPTED {
            return Ok(());
        }
        self.classify_status(resp.status())?;

        let framing = Framing::for_reply(resp.headers());
        let frames = body_frames(resp, framing, self.config.max_frame_bytes);
        match framing {
            Framing::Whole => {
                // A JSON reply is exactly one frame; deliver it before returning.
                forward(frames, &inbound, &shutdown).await;
            }
            Framing::Events | Framing::Lines => {
                let inbound = inbound.clone();
                let shutdown = shutdown.clone();
                self.track(tokio::spawn(async move {
                    forward(frames, &inbound, &shutdown).await;
                }));
            }
        }

        if self.take_deferred_stream() {
            match self.open_server_stream(&http, &inbound, &shutdown).await {
                Ok(mode) => *relock(self.server_stream.lock()) = mode,
                Err(e) => {
                    warn!(connector = %self.config.label, error = %e, "Server stream unavailable; using POST responses only");
                }
            }
        }
        Ok(())
    }

    fn receive(&self) -> Result<FrameStream, TransportError> {
        let mut slot = relock(self.frames.lock());
        match std::mem::replace(&mut *slot, FrameSlot::Taken) {
            FrameSlot::Ready(rx) => Ok(ReceiverStream::new(rx).boxed()),
            FrameSlot::Taken => Err(TransportError::StreamTaken),
            FrameSlot::Idle => {
                *slot = FrameSlot::Idle;
                Err(TransportError::Closed)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(live) = relock(self.live.lock()).take() else {
            return Ok(());
        };
        live.shutdown.cancel();
        for task in relock(self.tasks.lock()).drain(..) {
            task.abort();
        }
        info!(connector = %self.config.label, "Closed provider stream");
        Ok(())
    }
}

fn remember_session(slot: &Mutex<Option<String>>, headers: &HeaderMap) {
    if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        *relock(slot.lock()) = Some(id.to_string());
    }
}

/// How a response body is cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// `text/event-stream`: one frame per event's `data`.
    Events,
    /// Chunked body, one JSON document per line.
    Lines,
    /// Entire body is one JSON document.
    Whole,
}

impl Framing {
    fn is_event_stream(headers: &HeaderMap) -> bool {
        headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(EVENT_STREAM))
    }

    fn for_stream(headers: &HeaderMap) -> Self {
        if Self::is_event_stream(headers) {
            Self::Events
        } else {
            Self::Lines
        }
    }

    fn for_reply(headers: &HeaderMap) -> Self {
        if Self::is_event_stream(headers) {
            Self::Events
        } else {
            Self::Whole
        }
    }
}

/// Push frames into `tx` until the body ends, an error is delivered, the
/// receiver goes away, or `shutdown` fires. Returns `true` only when the body
/// ended on its own.
async fn forward<S>(frames: S, tx: &FrameSender, shutdown: &CancellationToken) -> bool
where
    S: Stream<Item = Result<String, TransportError>>,
{
    futures::pin_mut!(frames);
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return false,
            next = frames.next() => next,
        };
        match next {
            Some(item) => {
                let terminal = item.is_err();
                if tx.send(item).await.is_err() || terminal {
                    return false;
                }
            }
            None => return true,
        }
    }
}

fn body_frames(
    resp: reqwest::Response,
    framing: Framing,
    limit: usize,
) -> impl Stream<Item = Result<String, TransportError>> + Send + 'static {
    let bytes = resp.bytes_stream();
    async_stream::try_stream! {
        let mut decoder = FrameDecoder::new(framing, limit);
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| TransportError::StreamDropped(e.to_string()))?;
            for frame in decoder.push(&chunk)? {
                yield frame;
            }
        }
        if let Some(frame) = decoder.finish() {
            yield frame;
        }
    }
}

/// Incremental body decoder for the three framings.
#[derive(Debug)]
struct FrameDecoder {
    framing: Framing,
    buf: Vec<u8>,
    limit: usize,
}

impl FrameDecoder {
    fn new(framing: Framing, limit: usize) -> Self {
        Self {
            framing,
            buf: Vec::new(),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, TransportError> {
        // JSON never carries a raw CR, so dropping them normalises CRLF.
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut out = Vec::new();
        match self.framing {
            Framing::Whole => {}
            Framing::Lines => {
                while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.buf.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim();
                    if !text.is_empty() {
                        out.push(text.to_string());
                    }
                }
            }
            Framing::Events => {
                while let Some(pos) = find_double_newline(&self.buf) {
                    let event: Vec<u8> = self.buf.drain(..pos + 2).collect();
                    if let Some(data) = event_data(&String::from_utf8_lossy(&event)) {
                        out.push(data);
                    }
                }
            }
        }

        if self.buf.len() > self.limit {
            return Err(TransportError::FrameTooLarge { limit: self.limit });
        }
        Ok(out)
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        match self.framing {
            Framing::Whole | Framing::Lines => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            Framing::Events => event_data(&text),
        }
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Joined `data:` lines of one event, or `None` for data-less events.
fn event_data(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");
    (!data.trim().is_empty()).then_some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frames_split_across_chunks() {
        let mut dec = FrameDecoder::new(Framing::Events, 1024);
        assert!(dec.push(b"event: message\ndata: {\"id\"").unwrap().is_empty());
        let frames = dec.push(b":1}\n\ndata: {\"id\":2}\r\n\r\n").unwrap();
        assert_eq!(frames, vec!["{\"id\":1}".to_string(), "{\"id\":2}".to_string()]);
    }

    #[test]
    fn test_event_without_data_is_skipped() {
        let mut dec = FrameDecoder::new(Framing::Events, 1024);
        let frames = dec.push(b": keepalive\n\nid: 7\n\n").unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_multiline_data_is_joined() {
        assert_eq!(
            event_data("data: {\"a\":\ndata: 1}\n"),
            Some("{\"a\":\n1}".to_string())
        );
    }

    #[test]
    fn test_line_frames_and_trailing_partial() {
        let mut dec = FrameDecoder::new(Framing::Lines, 1024);
        let frames = dec.push(b"{\"a\":1}\n\n{\"b\":").unwrap();
        assert_eq!(frames, vec!["{\"a\":1}".to_string()]);
        assert!(dec.push(b"2}").unwrap().is_empty());
        assert_eq!(dec.finish(), Some("{\"b\":2}".to_string()));
    }

    #[test]
    fn test_whole_body_is_one_frame() {
        let mut dec = FrameDecoder::new(Framing::Whole, 1024);
        assert!(dec.push(b"{\n  \"result\": ").unwrap().is_empty());
        assert!(dec.push(b"1\n}").unwrap().is_empty());
        assert_eq!(dec.finish(), Some("{\n  \"result\": 1\n}".to_string()));
    }

    #[test]
    fn test_oversized_pending_frame_is_rejected() {
        let mut dec = FrameDecoder::new(Framing::Events, 8);
        let err = dec.push(b"data: 0123456789").unwrap_err();
        assert_eq!(err, TransportError::FrameTooLarge { limit: 8 });
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let cfg = StreamingHttpConfig::new("remote", Url::parse("http://127.0.0.1:1/mcp").unwrap())
            .headers(headers);
        let err = StreamingHttpTransport::new(cfg).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }
}
