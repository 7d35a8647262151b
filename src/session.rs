//! Control-session state machine.
//!
//! [`SessionController`] owns the platform's control socket for one viewing
//! session:
//!
//! ```text
//! connect()
//!   ├── GET watch page, extract socket URL (EndpointExtractor)
//!   ├── open WebSocket                         Disconnected -> Connecting
//!   ├── send startWatching                     Connecting -> Negotiating
//!   └── spawn control loop
//!         ├── seat{keepIntervalSec} -> arm keepSeat heartbeat
//!         ├── messageServer{viewUri} -> SessionEvent::EndpointNegotiated
//!         │                                     Negotiating -> Active
//!         ├── ping -> pong (immediately, before the next message)
//!         └── error/close -> SessionEvent::Closed      * -> Closed
//! ```
//!
//! A socket error is fatal to the session: the heartbeat stops, the owner
//! is notified, and a fresh `connect()` is required. The streaming side
//! (`MessageStream`) is independent and keeps running on its negotiated
//! endpoint.
//!
//! Socket I/O sits behind the [`ControlSocket`] trait; the control loop is
//! exercised in tests against a channel-backed mock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::{RoomPreferences, StreamPreferences};
use crate::page::{EndpointExtractor, NegotiationError};

/// Capacity of the session event channel.
const SESSION_EVENT_CAPACITY: usize = 16;

/// Errors from establishing or running a control session.
#[derive(Debug)]
pub enum SessionError {
    /// The watch page did not yield a control-socket endpoint.
    Negotiation(NegotiationError),
    /// Network or socket failure.
    Transport(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiation(e) => write!(f, "{e}"),
            Self::Transport(msg) => write!(f, "session transport error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<NegotiationError> for SessionError {
    fn from(e: NegotiationError) -> Self {
        Self::Negotiation(e)
    }
}

/// Lifecycle state of a control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    Disconnected,
    /// Fetching the watch page / opening the socket.
    Connecting,
    /// Socket open, capabilities declared, waiting for the server.
    Negotiating,
    /// Streaming endpoint negotiated.
    Active {
        /// Negotiated streaming endpoint URI.
        view_uri: String,
        /// Heartbeat interval dictated by the server's seat message, if one
        /// has arrived.
        keep_interval_sec: Option<u64>,
    },
    /// Session ended by a socket error or server close. Terminal until the
    /// next `connect()`.
    Closed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Session state observable from outside the controller.
///
/// Written only by the control loop; everyone else reads.
#[derive(Debug, Default)]
pub struct SharedSessionState {
    state: RwLock<SessionState>,
}

impl SharedSessionState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub async fn get(&self) -> SessionState {
        self.state.read().await.clone()
    }

    async fn set(&self, new_state: SessionState) {
        *self.state.write().await = new_state;
    }

    /// Check whether the session has a negotiated endpoint.
    pub async fn is_active(&self) -> bool {
        matches!(*self.state.read().await, SessionState::Active { .. })
    }
}

/// Notifications surfaced to the session owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The server announced the streaming endpoint.
    EndpointNegotiated(MessageServerInfo),
    /// The session ended. A new `connect()` is required to resume.
    Closed {
        /// Human-readable close reason.
        reason: String,
    },
}

/// Streaming endpoint announcement from the `messageServer` control message.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageServerInfo {
    /// Streaming endpoint URI for the polling reader.
    pub view_uri: String,
    /// Base time that comment `vpos` offsets are relative to.
    #[serde(default)]
    pub vpos_base_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Server-to-client control messages. Unrecognized kinds decode to
/// `Unknown` and are ignored, keeping the client forward-compatible.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ControlMessage {
    Seat { data: SeatData },
    MessageServer { data: MessageServerInfo },
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SeatData {
    keep_interval_sec: u64,
}

/// Client-to-server control messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientControlMessage {
    StartWatching { data: StartWatchingData },
    KeepSeat,
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartWatchingData {
    pub(crate) stream: StreamPreferences,
    pub(crate) room: RoomPreferences,
    pub(crate) reconnect: bool,
}

impl ClientControlMessage {
    fn to_json(&self) -> String {
        serde_json::to_string(self).expect("control message serializable")
    }
}

/// Text-frame transport carrying the control protocol.
///
/// The production implementation wraps a WebSocket; tests drive the control
/// loop through a channel-backed mock.
#[async_trait]
pub(crate) trait ControlSocket: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), SessionError>;

    /// Receive the next text frame. `None` means the peer closed the socket.
    async fn recv(&mut self) -> Option<Result<String, SessionError>>;

    /// Close the socket.
    async fn close(&mut self);
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// WebSocket-backed [`ControlSocket`].
struct WsControlSocket {
    ws: WsStream,
}

#[async_trait]
impl ControlSocket for WsControlSocket {
    async fn send(&mut self, text: String) -> Result<(), SessionError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Transport(format!("send failed: {e}")))
    }

    async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Ping(data))) => {
                    // Socket-level keepalive, distinct from the protocol's
                    // JSON ping.
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(SessionError::Transport(format!(
                            "pong failed: {e}"
                        ))));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(SessionError::Transport(format!("read failed: {e}"))))
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Owns the control-socket lifecycle for one viewing session.
pub struct SessionController {
    http: reqwest::Client,
    extractor: Arc<dyn EndpointExtractor>,
    stream_prefs: StreamPreferences,
    room_prefs: RoomPreferences,
    state: Arc<SharedSessionState>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("connected", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a controller and the event channel its owner listens on.
    pub fn new(
        http: reqwest::Client,
        extractor: Arc<dyn EndpointExtractor>,
        stream_prefs: StreamPreferences,
        room_prefs: RoomPreferences,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let controller = Self {
            http,
            extractor,
            stream_prefs,
            room_prefs,
            state: SharedSessionState::new(),
            events_tx,
            cancel: None,
            task: None,
        };
        (controller, events_rx)
    }

    /// Observable session state.
    #[must_use]
    pub fn state_handle(&self) -> Arc<SharedSessionState> {
        Arc::clone(&self.state)
    }

    /// Establish a control session for the given live watch-page URL.
    ///
    /// Tears down any existing session first. Fetches the watch page,
    /// extracts the control-socket URL, opens the socket, declares
    /// capabilities, and runs the control loop in the background. Endpoint
    /// negotiation results arrive on the event channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Negotiation`] if the page carries no socket
    /// endpoint, or [`SessionError::Transport`] if the page fetch or socket
    /// handshake fails. The session is `Closed` on error.
    pub async fn connect(&mut self, watch_url: &str) -> Result<(), SessionError> {
        self.disconnect().await;
        self.state.set(SessionState::Connecting).await;

        match self.open_socket(watch_url).await {
            Ok(socket) => {
                let cancel = CancellationToken::new();
                let task = tokio::spawn(run_control_loop(
                    socket,
                    Arc::clone(&self.state),
                    self.events_tx.clone(),
                    cancel.clone(),
                    StartWatchingData {
                        stream: self.stream_prefs.clone(),
                        room: self.room_prefs.clone(),
                        reconnect: false,
                    },
                ));
                self.cancel = Some(cancel);
                self.task = Some(task);
                Ok(())
            }
            Err(e) => {
                self.state.set(SessionState::Closed).await;
                Err(e)
            }
        }
    }

    /// Stop the heartbeat, close the socket, and return to `Disconnected`.
    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state.set(SessionState::Disconnected).await;
    }

    async fn open_socket(&self, watch_url: &str) -> Result<WsControlSocket, SessionError> {
        log::info!("fetching watch page {watch_url}");
        let html = self
            .http
            .get(watch_url)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("watch page fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| SessionError::Transport(format!("watch page fetch failed: {e}")))?
            .text()
            .await
            .map_err(|e| SessionError::Transport(format!("watch page read failed: {e}")))?;

        let socket_url = self.extractor.extract_socket_url(&html)?;
        log::info!("opening control socket {socket_url}");

        let (ws, _response) = tokio_tungstenite::connect_async(socket_url.as_str())
            .await
            .map_err(|e| SessionError::Transport(format!("socket connect failed: {e}")))?;

        Ok(WsControlSocket { ws })
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Run the control loop until the socket fails or `cancel` fires.
///
/// Single writer for the session state and the heartbeat timer; each
/// incoming message is fully handled (including its reply) before the next
/// one is read.
pub(crate) async fn run_control_loop<S: ControlSocket>(
    mut socket: S,
    state: Arc<SharedSessionState>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    start_watching: StartWatchingData,
) {
    let close = |reason: String| {
        let state = Arc::clone(&state);
        let events_tx = events_tx.clone();
        async move {
            log::warn!("control session closed: {reason}");
            state.set(SessionState::Closed).await;
            let _ = events_tx.send(SessionEvent::Closed { reason }).await;
        }
    };

    // Socket is open: declare stream/room capabilities.
    let start = ClientControlMessage::StartWatching { data: start_watching };
    if let Err(e) = socket.send(start.to_json()).await {
        close(format!("failed to declare capabilities: {e}")).await;
        return;
    }
    state.set(SessionState::Negotiating).await;

    let mut keep_seat: Option<Interval> = None;
    let mut keep_interval_sec: Option<u64> = None;
    let mut view_uri: Option<String> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                socket.close().await;
                state.set(SessionState::Disconnected).await;
                return;
            }

            // Heartbeat, armed once a seat message dictates the interval.
            _ = async { keep_seat.as_mut().expect("armed when guard holds").tick().await },
                if keep_seat.is_some() =>
            {
                log::trace!("sending keepSeat");
                if let Err(e) = socket.send(ClientControlMessage::KeepSeat.to_json()).await {
                    close(format!("heartbeat send failed: {e}")).await;
                    return;
                }
            }

            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => {
                        close(e.to_string()).await;
                        return;
                    }
                    None => {
                        close("socket closed by server".to_string()).await;
                        return;
                    }
                };

                let message = match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("unparseable control message ignored: {e}");
                        continue;
                    }
                };

                match message {
                    ControlMessage::Seat { data } => {
                        log::info!("seat granted, heartbeat every {}s", data.keep_interval_sec);
                        keep_interval_sec = Some(data.keep_interval_sec);
                        let period = Duration::from_secs(data.keep_interval_sec.max(1));
                        let mut interval = interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        keep_seat = Some(interval);

                        if let Some(uri) = &view_uri {
                            state
                                .set(SessionState::Active {
                                    view_uri: uri.clone(),
                                    keep_interval_sec,
                                })
                                .await;
                        }
                    }

                    ControlMessage::MessageServer { data } => {
                        log::info!("streaming endpoint negotiated: {}", data.view_uri);
                        view_uri = Some(data.view_uri.clone());
                        state
                            .set(SessionState::Active {
                                view_uri: data.view_uri.clone(),
                                keep_interval_sec,
                            })
                            .await;
                        let _ = events_tx
                            .send(SessionEvent::EndpointNegotiated(data))
                            .await;
                    }

                    ControlMessage::Ping => {
                        if let Err(e) = socket.send(ClientControlMessage::Pong.to_json()).await {
                            close(format!("pong send failed: {e}")).await;
                            return;
                        }
                    }

                    ControlMessage::Unknown => {
                        log::debug!("unknown control message kind ignored");
                    }
                }
            }
        }
    }
}
