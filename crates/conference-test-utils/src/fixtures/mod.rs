//! Pre-configured test data.
//!
//! Provides:
//! - Participants and room settings
//! - Local media tracks
//! - Server configuration and fast negotiation timings
//! - A signaling socket registered with a registry

use common::secret::SecretString;
use common::types::ParticipantId;
use conference_server::actors::{Participant, RoomRegistryHandle, RoomSettings};
use conference_server::config::{Config, NegotiationTimings};
use conference_server::media::{MediaKind, MediaTrack};
use conference_server::signaling::{Message, Signaler};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Engine token used by [`test_config`].
pub const TEST_ENGINE_TOKEN: &str = "test-engine-token";

/// A participant with a fresh id.
#[must_use]
pub fn participant(name: &str) -> Participant {
    Participant {
        id: ParticipantId::new(),
        name: name.to_string(),
    }
}

/// Room settings builder.
#[derive(Debug, Clone)]
pub struct TestRoom {
    name: String,
    password: Option<String>,
    max_members: Option<usize>,
    max_empty_minutes: Option<u64>,
}

impl TestRoom {
    /// A public, unlimited room.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            max_members: None,
            max_empty_minutes: None,
        }
    }

    /// Make the room private.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_max_members(mut self, max: usize) -> Self {
        self.max_members = Some(max);
        self
    }

    #[must_use]
    pub fn with_max_empty_minutes(mut self, minutes: u64) -> Self {
        self.max_empty_minutes = Some(minutes);
        self
    }

    #[must_use]
    pub fn build(self) -> RoomSettings {
        RoomSettings {
            name: self.name,
            password: self.password.map(SecretString::from),
            max_members: self.max_members,
            max_empty_minutes: self.max_empty_minutes,
        }
    }
}

#[must_use]
pub fn audio_track(id: &str) -> MediaTrack {
    MediaTrack::new(id, MediaKind::Audio)
}

/// A camera track tagged with its owner.
#[must_use]
pub fn video_track(id: &str, owner: &str) -> MediaTrack {
    MediaTrack::new(id, MediaKind::Video).with_meta(json!({ "owner": owner }))
}

/// Short recovery window so jammed-offer tests finish quickly.
#[must_use]
pub fn fast_timings() -> NegotiationTimings {
    NegotiationTimings {
        timeout: Duration::from_millis(200),
        jitter: Duration::from_millis(50),
    }
}

/// Configuration with test defaults.
#[must_use]
pub fn test_config() -> Config {
    let vars: HashMap<String, String> = [
        ("CONF_ENGINE_TOKEN", TEST_ENGINE_TOKEN),
        ("CONF_SERVER_ID", "conf-test"),
        ("CONF_BIND_ADDRESS", "127.0.0.1:0"),
        ("CONF_HEALTH_BIND_ADDRESS", "127.0.0.1:0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    Config::from_vars(&vars).unwrap()
}

/// Open a signaling socket for `participant` and register it.
///
/// The receiver yields what the server sends to the participant.
pub async fn connect_socket(
    registry: &RoomRegistryHandle,
    participant: &Participant,
) -> (Signaler, mpsc::UnboundedReceiver<Message>) {
    let (signaler, _task) = Signaler::spawn(participant.name.as_str());
    let (tx, rx) = mpsc::unbounded_channel();
    signaler.open(tx).unwrap();
    registry
        .register_socket(participant.clone(), signaler.clone())
        .await
        .unwrap();
    (signaler, rx)
}
