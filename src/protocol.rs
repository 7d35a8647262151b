//! Wire data model for the streaming endpoints.
//!
//! Two chunk-framed streams exist:
//!
//! - the **entry stream** (`GET endpoint?at=<cursor>`) carries
//!   [`StreamEntry`] frames steering the polling protocol, and
//! - **segment streams** (`GET <segment uri>`) carry [`ChunkedRecord`]
//!   frames with the application payloads that get routed to subscribers.
//!
//! Frame bodies are opaque to the transport; decoding goes through the
//! [`FrameCodec`] seam. The platform's native codec is a binary schema that
//! is out of scope here; [`JsonCodec`] is the bundled implementation and
//! the one the bundled types derive their shape from.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Decodes one frame body into a typed record.
///
/// The chunk-framing layer never interprets bodies; everything
/// schema-specific lives behind this trait so an embedder can swap in the
/// platform's native codec without touching the transport.
pub trait FrameCodec: Send + Sync {
    /// Decoded frame type.
    type Frame;

    /// Decode a complete frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not parse as `Self::Frame`. The
    /// polling reader treats this as a failed request and retries from the
    /// last cursor.
    fn decode(&self, body: &[u8]) -> anyhow::Result<Self::Frame>;
}

/// JSON-backed [`FrameCodec`] for any deserializable frame type.
pub struct JsonCodec<T> {
    _frame: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create the codec.
    pub fn new() -> Self {
        Self { _frame: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<T: DeserializeOwned> FrameCodec for JsonCodec<T> {
    type Frame = T;

    fn decode(&self, body: &[u8]) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// One frame of the entry stream. Exactly one variant per frame.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum StreamEntry {
    /// Pointer to data older than the live edge. Advisory; upstream
    /// semantics are undocumented and the entry is ignored.
    Backward(BackwardSegment),
    /// Sub-stream of application records to fetch and decode.
    Segment(MessageSegment),
    /// Segment already delivered on an earlier connection. Advisory.
    Previous(MessageSegment),
    /// Cursor to resume the next poll request from.
    Next(ReadyForNext),
    /// Entry kind this client does not know. Ignored, so upstream protocol
    /// additions do not wedge the polling loop in a decode-fail-retry cycle.
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// Backward reference carried by [`StreamEntry::Backward`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackwardSegment {
    /// Segment holding the older records, if the server offers one.
    #[serde(default)]
    pub segment: Option<MessageSegment>,
}

/// Reference to a chunk-framed sub-stream of application records.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSegment {
    /// Absolute URI of the sub-stream.
    pub uri: String,
}

/// Resumption token carried by [`StreamEntry::Next`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyForNext {
    /// Opaque server-issued cursor for the next poll request.
    pub at: String,
}

/// One frame of a segment stream: optional metadata envelope plus a
/// classified payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedRecord {
    /// Sequence/trace metadata attached to every routed publication.
    #[serde(default)]
    pub meta: Option<RecordMeta>,
    /// Payload classification used for routing.
    pub payload: RecordPayload,
}

/// Metadata envelope attached to a record.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Server-assigned record id.
    #[serde(default)]
    pub id: Option<String>,
    /// Server-side timestamp of the record.
    #[serde(default)]
    pub at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Top-level payload classification of a [`ChunkedRecord`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RecordPayload {
    /// Viewer-facing message (chat, gift, notification, ...).
    Message(LiveMessage),
    /// Broadcast state change (statistics, program status, ...).
    State(LiveState),
    /// Payload kind this client does not know. Dropped after the generic
    /// routing step; keeps the client forward-compatible.
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// Kind-specific body of a message payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum LiveMessage {
    /// Viewer comment.
    Chat(Chat),
    /// Monetized gift.
    Gift(Gift),
    /// Server-generated notice shown in the comment feed.
    SimpleNotification(Notification),
    /// Message kind this client does not know. Routed only on the generic
    /// message channel.
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// A viewer comment.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Comment text.
    pub content: String,
    /// Display name, absent for anonymous comments.
    #[serde(default)]
    pub name: Option<String>,
    /// Playback position of the comment in centiseconds from the stream's
    /// vpos base time.
    #[serde(default)]
    pub vpos: Option<i64>,
    /// Commenting account id, absent for anonymous comments.
    #[serde(default)]
    pub account_id: Option<String>,
}

/// A monetized gift event.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gift {
    /// Gift item identifier.
    pub item_id: String,
    /// Display name of the gift item.
    #[serde(default)]
    pub item_name: Option<String>,
    /// Name of the gifting viewer.
    #[serde(default)]
    pub advertiser_name: Option<String>,
    /// Point value of the gift.
    #[serde(default)]
    pub point: Option<i64>,
    /// Optional message attached to the gift.
    #[serde(default)]
    pub message: Option<String>,
}

/// A server-generated notification message.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification text.
    pub message: String,
}

/// Broadcast state change. The upstream schema is broad and evolves; the
/// body is kept structurally open.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LiveState(pub serde_json::Value);
