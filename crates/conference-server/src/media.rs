//! Media units and selectors.
//!
//! The server never touches media samples. A [`MediaTrack`] is the handle a
//! transport uses to attach one local capture to a peer link, and a
//! [`RemoteTrack`] describes a leg received from the peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Kind filter for [`MediaSelector::Kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFilter {
    Audio,
    Video,
    Any,
}

impl KindFilter {
    #[must_use]
    pub fn accepts(self, kind: MediaKind) -> bool {
        matches!(
            (self, kind),
            (KindFilter::Any, _)
                | (KindFilter::Audio, MediaKind::Audio)
                | (KindFilter::Video, MediaKind::Video)
        )
    }
}

/// Selects which local tracks an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaSelector {
    /// One track, by id.
    Track(String),
    /// Every track of a kind.
    Kind(KindFilter),
}

impl MediaSelector {
    /// Every track.
    pub const ALL: MediaSelector = MediaSelector::Kind(KindFilter::Any);

    #[must_use]
    pub fn matches(&self, track: &MediaTrack) -> bool {
        match self {
            MediaSelector::Track(id) => track.id == *id,
            MediaSelector::Kind(filter) => filter.accepts(track.kind),
        }
    }
}

/// A local capture published to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    /// Provenance tag announced to the peer once the sending leg is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            meta: None,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A leg received from the remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    /// Transceiver mid the leg arrived on.
    pub mid: String,
    /// Stream ids the peer grouped the track into.
    #[serde(default)]
    pub streams: Vec<String>,
    /// Provenance tag from `track:meta`, once known.
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Payload of a `track:meta` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMeta {
    pub mid: String,
    pub meta: Value,
}
