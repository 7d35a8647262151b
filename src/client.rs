//! Top-level live client.
//!
//! [`LiveClient`] ties the pieces together for one live broadcast:
//!
//! ```text
//! LiveClient
//!   ├── SessionController (control socket, negotiation, heartbeat)
//!   ├── supervisor task: SessionEvent -> start/restart MessageStream
//!   ├── MessageStream (cursor-driven polling of the negotiated endpoint)
//!   └── EventRouter (typed pub/sub fan-out of decoded records)
//! ```
//!
//! The session and the message stream run concurrently and independently:
//! a control-socket failure is surfaced on the session event channel while
//! the stream keeps polling its endpoint, and stream retries never touch
//! the session. `disconnect()` tears both down.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::page::{EmbeddedDataExtractor, EndpointExtractor};
use crate::protocol::{Chat, Gift, LiveMessage, LiveState, Notification};
use crate::router::{EventRouter, Published};
use crate::session::{SessionController, SessionError, SessionEvent, SessionState};
use crate::stream::{MessageStream, RetryPolicy};

/// Builder for [`LiveClient`].
#[derive(Default)]
pub struct LiveClientBuilder {
    config: ClientConfig,
    extractor: Option<Arc<dyn EndpointExtractor>>,
}

impl std::fmt::Debug for LiveClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClientBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LiveClientBuilder {
    /// Set the client configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the watch-page endpoint extractor.
    #[must_use]
    pub fn extractor(mut self, extractor: Arc<dyn EndpointExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn build(self) -> anyhow::Result<LiveClient> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .build()?;
        let router = EventRouter::new(self.config.event_capacity);
        let (session_events_tx, _) = broadcast::channel(16);

        Ok(LiveClient {
            extractor: self
                .extractor
                .unwrap_or_else(|| Arc::new(EmbeddedDataExtractor)),
            config: self.config,
            http,
            router,
            session_events_tx,
            session: None,
            cancel: None,
            supervisor: None,
        })
    }
}

/// Client for one live broadcast: connects the control session, consumes
/// the negotiated message stream, and fans decoded events out to
/// subscribers.
pub struct LiveClient {
    config: ClientConfig,
    http: reqwest::Client,
    extractor: Arc<dyn EndpointExtractor>,
    router: EventRouter,
    session_events_tx: broadcast::Sender<SessionEvent>,
    session: Option<SessionController>,
    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("config", &self.config)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl LiveClient {
    /// Create a client builder.
    #[must_use]
    pub fn builder() -> LiveClientBuilder {
        LiveClientBuilder::default()
    }

    /// Create a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        Self::builder().config(config).build()
    }

    /// Connect to the live broadcast at `watch_url`.
    ///
    /// Tears down any existing connection first. Returns once the control
    /// session is established; endpoint negotiation and record delivery
    /// proceed in the background, observable via the subscription methods.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the watch page, endpoint extraction, or
    /// socket handshake fails.
    pub async fn connect(&mut self, watch_url: &str) -> Result<(), SessionError> {
        self.disconnect().await;

        let (mut session, session_events) = SessionController::new(
            self.http.clone(),
            Arc::clone(&self.extractor),
            self.config.stream.clone(),
            self.config.room.clone(),
        );
        session.connect(watch_url).await?;

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            session_events,
            self.http.clone(),
            self.config.retry.clone(),
            self.router.clone(),
            self.session_events_tx.clone(),
            cancel.clone(),
        ));

        self.session = Some(session);
        self.cancel = Some(cancel);
        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// Disconnect from the control session and stop the message stream.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.supervisor.take() {
            let _ = task.await;
        }
    }

    /// Current control-session state.
    pub async fn session_state(&self) -> SessionState {
        match &self.session {
            Some(session) => session.state_handle().get().await,
            None => SessionState::Disconnected,
        }
    }

    /// The event router, for subscription kinds without a convenience
    /// method.
    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Subscribe to session lifecycle notifications.
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events_tx.subscribe()
    }

    /// Subscribe to every message payload.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Published<LiveMessage>> {
        self.router.subscribe_messages()
    }

    /// Subscribe to viewer comments.
    pub fn subscribe_chats(&self) -> broadcast::Receiver<Published<Chat>> {
        self.router.subscribe_chats()
    }

    /// Subscribe to gift events.
    pub fn subscribe_gifts(&self) -> broadcast::Receiver<Published<Gift>> {
        self.router.subscribe_gifts()
    }

    /// Subscribe to server notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Published<Notification>> {
        self.router.subscribe_notifications()
    }

    /// Subscribe to broadcast state changes.
    pub fn subscribe_states(&self) -> broadcast::Receiver<Published<LiveState>> {
        self.router.subscribe_states()
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}

/// Background task reacting to session events.
///
/// Starts a [`MessageStream`] when an endpoint is negotiated and restarts
/// it if the endpoint is renegotiated on a later session. A session close
/// does not stop a running stream; the two fail independently.
async fn supervise(
    mut session_events: mpsc::Receiver<SessionEvent>,
    http: reqwest::Client,
    retry: RetryPolicy,
    router: EventRouter,
    observers: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut stream_cancel: Option<CancellationToken> = None;

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = session_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let _ = observers.send(event.clone());

        match event {
            SessionEvent::EndpointNegotiated(info) => {
                if let Some(previous) = stream_cancel.take() {
                    log::info!("endpoint renegotiated, restarting message stream");
                    previous.cancel();
                }
                let child = cancel.child_token();
                stream_cancel = Some(child.clone());

                let stream = MessageStream::new(http.clone(), info.view_uri)
                    .with_retry_policy(retry.clone());
                let (mut records, _poll_task) = stream.spawn(child);

                let router = router.clone();
                tokio::spawn(async move {
                    while let Some(record) = records.recv().await {
                        router.dispatch(record);
                    }
                });
            }
            SessionEvent::Closed { reason } => {
                log::warn!("control session closed ({reason}); message stream unaffected");
            }
        }
    }

    if let Some(active) = stream_cancel {
        active.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_client_state() {
        let client = LiveClient::new(ClientConfig::default()).unwrap();
        assert_eq!(client.session_state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_supervisor_starts_stream_on_negotiation() {
        use crate::session::MessageServerInfo;

        let server = wiremock_stub().await;
        let (events_tx, events_rx) = mpsc::channel(4);
        let router = EventRouter::new(8);
        let (observers, mut observed) = broadcast::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise(
            events_rx,
            reqwest::Client::new(),
            RetryPolicy::Fixed(std::time::Duration::from_millis(10)),
            router.clone(),
            observers,
            cancel.clone(),
        ));

        let mut chats = router.subscribe_chats();
        events_tx
            .send(SessionEvent::EndpointNegotiated(MessageServerInfo {
                view_uri: format!("{}/view", server.uri()),
                vpos_base_time: None,
            }))
            .await
            .unwrap();

        // The event is republished to observers and the stream delivers the
        // chat served by the stub.
        assert!(matches!(
            observed.recv().await.unwrap(),
            SessionEvent::EndpointNegotiated(_)
        ));
        let chat = chats.recv().await.unwrap();
        assert_eq!(chat.body.content, "from stub");

        cancel.cancel();
        task.await.unwrap();
    }

    /// Stub message server: one segment with one chat record, then an
    /// endless empty tail the poll loop idles on.
    async fn wiremock_stub() -> wiremock::MockServer {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use crate::framing::encode_chunk;

        let server = MockServer::start().await;

        let segment_record =
            br#"{"payload":{"message":{"chat":{"content":"from stub"}}}}"#;
        Mock::given(method("GET"))
            .and(path("/segment/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encode_chunk(segment_record)))
            .mount(&server)
            .await;

        let mut entries = Vec::new();
        entries.extend_from_slice(&encode_chunk(
            format!(r#"{{"segment":{{"uri":"{}/segment/1"}}}}"#, server.uri()).as_bytes(),
        ));
        entries.extend_from_slice(&encode_chunk(br#"{"next":{"at":"42"}}"#));
        Mock::given(method("GET"))
            .and(path("/view"))
            .and(query_param("at", "now"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(entries))
            .mount(&server)
            .await;

        // Subsequent polls resume from the cursor and stay empty.
        Mock::given(method("GET"))
            .and(path("/view"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(Vec::new())
                    .set_delay(std::time::Duration::from_secs(60)),
            )
            .mount(&server)
            .await;

        server
    }
}
