//! livecomet - real-time comment and event delivery client.
//!
//! Connects to a live broadcast and delivers its comment/event feed as
//! typed, subscribable streams.
//!
//! # Architecture
//!
//! Delivery happens over two cooperating transports:
//!
//! - **Control session** - a WebSocket state machine that declares
//!   capabilities, keeps the seat alive with heartbeats, and learns the
//!   streaming endpoint from the server
//! - **Message stream** - a resumable HTTP polling reader that follows the
//!   negotiated endpoint's chunk-framed entry stream, fetching record
//!   segments and tracking a resumption cursor
//!
//! Decoded records fan out through a publish/subscribe router, so any
//! number of consumers can follow chats, gifts, notifications, or state
//! changes independently. [`client::LiveClient`] wires all of this
//! together.
//!
//! # Modules
//!
//! - [`framing`] - varint chunk-frame decoder for the streaming bodies
//! - [`protocol`] - wire data model and the [`protocol::FrameCodec`] seam
//! - [`stream`] - cursor-driven polling reader with retry policy
//! - [`session`] - control-socket state machine and heartbeat
//! - [`page`] - watch-page endpoint discovery
//! - [`router`] - typed pub/sub fan-out of decoded records
//! - [`client`] - top-level client tying the transports together
//! - [`config`] - client configuration

pub mod client;
pub mod config;
pub mod framing;
pub mod page;
pub mod protocol;
pub mod router;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use client::{LiveClient, LiveClientBuilder};
pub use config::ClientConfig;
pub use protocol::{Chat, ChunkedRecord, Gift, LiveMessage, LiveState, Notification};
pub use router::{EventRouter, Published};
pub use session::{SessionEvent, SessionState};
pub use stream::{MessageStream, RetryPolicy, StreamCursor};
