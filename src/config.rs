//! Client configuration.
//!
//! [`ClientConfig`] collects everything negotiable about a client: the
//! stream/room capabilities declared during control-session negotiation,
//! the polling retry policy, and transport tuning. Defaults match the
//! platform's reference client; `LIVECOMET_*` environment variables can
//! override individual fields for ad-hoc testing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::RetryPolicy;

/// Stream capabilities declared in the `startWatching` control message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamPreferences {
    /// Requested video quality.
    pub quality: String,
    /// Requested delivery protocol.
    pub protocol: String,
    /// Requested latency mode.
    pub latency: String,
    /// Whether to request chase playback.
    pub chase_play: bool,
}

impl Default for StreamPreferences {
    fn default() -> Self {
        Self {
            quality: "high".to_string(),
            protocol: "hls".to_string(),
            latency: "low".to_string(),
            chase_play: false,
        }
    }
}

/// Room capabilities declared in the `startWatching` control message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPreferences {
    /// Comment-room protocol.
    pub protocol: String,
    /// Whether this client intends to post comments.
    pub commentable: bool,
}

impl Default for RoomPreferences {
    fn default() -> Self {
        Self {
            protocol: "webSocket".to_string(),
            commentable: false,
        }
    }
}

/// Configuration for a [`crate::client::LiveClient`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Stream capabilities for negotiation.
    pub stream: StreamPreferences,
    /// Room capabilities for negotiation.
    pub room: RoomPreferences,
    /// Delay policy between failed poll requests.
    #[serde(skip)]
    pub retry: RetryPolicy,
    /// Connect timeout for HTTP requests (watch page, polling, segments).
    pub connect_timeout: Duration,
    /// Capacity of the broadcast channels behind each router event kind.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream: StreamPreferences::default(),
            room: RoomPreferences::default(),
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load defaults with environment overrides applied.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `LIVECOMET_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(quality) = std::env::var("LIVECOMET_QUALITY") {
            self.stream.quality = quality;
        }

        if let Ok(latency) = std::env::var("LIVECOMET_LATENCY") {
            self.stream.latency = latency;
        }

        if let Ok(delay_ms) = std::env::var("LIVECOMET_RETRY_DELAY_MS") {
            if let Ok(ms) = delay_ms.parse::<u64>() {
                self.retry = if ms == 0 {
                    RetryPolicy::None
                } else {
                    RetryPolicy::Fixed(Duration::from_millis(ms))
                };
            }
        }

        if let Ok(timeout) = std::env::var("LIVECOMET_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.connect_timeout = Duration::from_secs(secs);
            }
        }
    }
}
