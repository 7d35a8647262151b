//! Resumable message stream reader.
//!
//! [`MessageStream`] drives repeated HTTP requests against the streaming
//! endpoint negotiated by the session controller:
//!
//! ```text
//! loop {
//!     GET endpoint?at=<cursor>        (long-lived, chunk-framed body)
//!       ├── next{at}     -> update cursor immediately
//!       ├── segment{uri} -> GET uri, decode records, forward each one
//!       └── backward/previous -> advisory, ignored
//! }
//! ```
//!
//! Each response body is fed incrementally into a fresh
//! [`ChunkDecoder`]; decoded entries arrive in byte-stream order. The
//! cursor is updated the moment a `next` entry is decoded, so a request
//! that fails afterwards still resumes from the latest known-good
//! position. Transient failures are invisible to consumers: the loop
//! silently re-requests with the last cursor, delayed per [`RetryPolicy`].
//!
//! Cancellation aborts the in-flight request and stops the loop; records
//! already forwarded are not undone.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::framing::ChunkDecoder;
use crate::protocol::{ChunkedRecord, FrameCodec, JsonCodec, StreamEntry};

/// Default capacity of the record channel handed to the consumer.
const RECORD_CHANNEL_CAPACITY: usize = 256;

/// Retry backoff defaults, matching the reconnect policy used elsewhere in
/// the crate's transports.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Position to resume the polling stream from.
///
/// The cursor only moves when a `next` entry is decoded. If a request fails
/// before its first `next` entry, the previous cursor is reused; the server
/// decides what that window replays, so entries between the last `next` and
/// the failure point may be missed. This mirrors the upstream protocol,
/// which offers no stronger guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCursor {
    /// Start from the live edge.
    Now,
    /// Opaque server-issued token from a `next` entry.
    At(String),
}

impl fmt::Display for StreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => write!(f, "now"),
            Self::At(token) => write!(f, "{token}"),
        }
    }
}

/// Delay policy applied between poll attempts after a failure.
///
/// Successful requests are always followed immediately by the next poll;
/// the policy only gates retries after an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Re-request immediately. Reproduces the upstream client's tight loop;
    /// risks request storms against a dead endpoint.
    None,
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff, doubling from `initial` up to `max`, with up to
    /// one second of jitter. Resets after the next successful request.
    Backoff {
        /// Delay after the first failure.
        initial: Duration,
        /// Upper bound on the delay.
        max: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Backoff { initial: INITIAL_BACKOFF, max: MAX_BACKOFF }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failures` (1-based consecutive failures).
    fn delay(&self, failures: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Backoff { initial, max } => {
                let exp = failures.saturating_sub(1).min(16);
                let backoff = initial.saturating_mul(1u32 << exp).min(*max);
                let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
                backoff + jitter
            }
        }
    }
}

/// Errors from one iteration of the polling loop.
#[derive(Debug)]
pub enum StreamError {
    /// Network failure, non-success HTTP status, or body read error.
    Transport(String),
    /// A frame header or body failed to decode. Aborts the current request;
    /// the next iteration retries from the last cursor.
    Decode(String),
    /// The consumer dropped its receiver; the loop stops.
    Closed,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Closed => write!(f, "record receiver closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Resumable polling reader for one streaming endpoint.
///
/// Owns its cursor and the frame decoders for its requests; nothing is
/// shared. Consumed by [`MessageStream::spawn`], which runs the loop on a
/// background task and hands back the record channel.
pub struct MessageStream {
    http: reqwest::Client,
    endpoint: String,
    cursor: StreamCursor,
    retry: RetryPolicy,
    capacity: usize,
    entry_codec: Box<dyn FrameCodec<Frame = StreamEntry>>,
    record_codec: Box<dyn FrameCodec<Frame = ChunkedRecord>>,
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream")
            .field("endpoint", &self.endpoint)
            .field("cursor", &self.cursor)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MessageStream {
    /// Create a reader for `endpoint`, starting from the live edge, with the
    /// default retry policy and the bundled JSON codecs.
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            cursor: StreamCursor::Now,
            retry: RetryPolicy::default(),
            capacity: RECORD_CHANNEL_CAPACITY,
            entry_codec: Box::new(JsonCodec::new()),
            record_codec: Box::new(JsonCodec::new()),
        }
    }

    /// Resume from a previously observed cursor instead of the live edge.
    #[must_use]
    pub fn with_cursor(mut self, cursor: StreamCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Set the retry policy applied after failed requests.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the record channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Replace the entry-stream codec.
    #[must_use]
    pub fn with_entry_codec(
        mut self,
        codec: Box<dyn FrameCodec<Frame = StreamEntry>>,
    ) -> Self {
        self.entry_codec = codec;
        self
    }

    /// Replace the segment-stream codec.
    #[must_use]
    pub fn with_record_codec(
        mut self,
        codec: Box<dyn FrameCodec<Frame = ChunkedRecord>>,
    ) -> Self {
        self.record_codec = codec;
        self
    }

    /// Start the polling loop on a background task.
    ///
    /// Returns the record channel and the task handle. The loop runs until
    /// `cancel` fires or the receiver is dropped.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<ChunkedRecord>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let task = tokio::spawn(self.run(cancel, tx));
        (rx, task)
    }

    /// Run the polling loop until canceled or the receiver is dropped.
    pub async fn run(mut self, cancel: CancellationToken, tx: mpsc::Sender<ChunkedRecord>) {
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            match self.poll_once(&cancel, &tx).await {
                Ok(()) => {
                    // Server ended the response; continue from the cursor.
                    failures = 0;
                }
                Err(StreamError::Closed) => {
                    log::debug!("record receiver dropped, stopping poll loop");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    log::debug!(
                        "poll request failed ({} consecutive), resuming at '{}': {}",
                        failures,
                        self.cursor,
                        e
                    );

                    let delay = self.retry.delay(failures);
                    if !delay.is_zero() {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = cancel.cancelled() => break,
                        }
                    }
                }
            }
        }

        log::info!("message stream for {} stopped", self.endpoint);
    }

    /// Issue one poll request and process its body to completion.
    async fn poll_once(
        &mut self,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ChunkedRecord>,
    ) -> Result<(), StreamError> {
        let url = format!("{}?at={}", self.endpoint, self.cursor);
        log::debug!("polling {url}");

        let request = self.http.get(&url).header("Priority", "u=1, i").send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            response = request => response.map_err(|e| StreamError::Transport(e.to_string()))?,
        };
        let response = response
            .error_for_status()
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let mut body = response.bytes_stream();
        let mut decoder = ChunkDecoder::new();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    decoder.push(&bytes);
                    let frames = decoder
                        .read()
                        .map_err(|e| StreamError::Decode(e.to_string()))?;
                    for frame in frames {
                        let entry = self
                            .entry_codec
                            .decode(&frame)
                            .map_err(|e| StreamError::Decode(e.to_string()))?;
                        self.handle_entry(entry, cancel, tx).await?;
                    }
                }
                Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                None => return Ok(()),
            }
        }
    }

    /// Dispatch one decoded entry.
    async fn handle_entry(
        &mut self,
        entry: StreamEntry,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ChunkedRecord>,
    ) -> Result<(), StreamError> {
        match entry {
            StreamEntry::Next(next) => {
                log::trace!("cursor advanced to {}", next.at);
                self.cursor = StreamCursor::At(next.at);
            }
            StreamEntry::Segment(segment) => {
                self.fetch_segment(&segment.uri, cancel, tx).await?;
            }
            StreamEntry::Backward(_) | StreamEntry::Previous(_) => {
                // Advisory entries; upstream semantics undocumented.
                log::trace!("ignoring advisory stream entry");
            }
            StreamEntry::Unknown(value) => {
                log::trace!("ignoring unknown stream entry: {value}");
            }
        }
        Ok(())
    }

    /// Fetch a segment sub-stream and forward its records as they decode.
    async fn fetch_segment(
        &self,
        uri: &str,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ChunkedRecord>,
    ) -> Result<(), StreamError> {
        log::debug!("fetching segment {uri}");

        let request = self.http.get(uri).send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            response = request => response.map_err(|e| StreamError::Transport(e.to_string()))?,
        };
        let response = response
            .error_for_status()
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let mut body = response.bytes_stream();
        let mut decoder = ChunkDecoder::new();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    decoder.push(&bytes);
                    let frames = decoder
                        .read()
                        .map_err(|e| StreamError::Decode(e.to_string()))?;
                    for frame in frames {
                        let record = self
                            .record_codec
                            .decode(&frame)
                            .map_err(|e| StreamError::Decode(e.to_string()))?;
                        // The channel may be full; cancellation wins over a
                        // stalled consumer.
                        let sent = tokio::select! {
                            () = cancel.cancelled() => return Ok(()),
                            sent = tx.send(record) => sent,
                        };
                        sent.map_err(|_| StreamError::Closed)?;
                    }
                }
                Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                None => return Ok(()),
            }
        }
    }
}
