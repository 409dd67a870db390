//! Peer transport abstraction.
//!
//! [`PeerTransport`] is the seam between the negotiation logic and a real
//! WebRTC stack (or a scripted mock in tests). The negotiation state is
//! tracked by the connection itself; the transport only performs effects and
//! reports asynchronous happenings as [`TransportEvent`]s.

use crate::errors::ConferenceError;
use crate::media::{MediaTrack, RemoteTrack};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as carried by an `sdp` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as carried by an `ice` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Something the transport observed on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local changes (tracks, ICE restart) need a new offer/answer round.
    NegotiationNeeded,
    /// A local candidate was gathered and should be sent to the peer.
    LocalCandidate(IceCandidate),
    IceConnectionStateChanged(IceConnectionState),
    /// The peer started sending a leg.
    TrackAdded(RemoteTrack),
    /// A received leg ended on the transport level.
    TrackEnded { mid: String },
}

/// Errors reported by a transport implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The stack refused the operation (malformed SDP, bad candidate, ...).
    #[error("operation rejected: {0}")]
    Rejected(String),

    /// The operation is not valid in the transport's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The transport is closed.
    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for ConferenceError {
    fn from(err: TransportError) -> Self {
        ConferenceError::Negotiation(err.to_string())
    }
}

/// Effects a connection needs from the underlying peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    /// Discard a pending local offer.
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Ask for fresh ICE credentials on the next offer.
    async fn restart_ice(&self) -> Result<(), TransportError>;

    /// Start sending a local track.
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Stop sending a local track. Returns the mid of the deactivated leg when
    /// it was already bound to a transceiver.
    async fn remove_track(&self, track_id: &str) -> Result<Option<String>, TransportError>;

    /// Swap what a sending leg carries; `None` keeps the leg but sends nothing.
    async fn replace_track(
        &self,
        track_id: &str,
        replacement: Option<&MediaTrack>,
    ) -> Result<(), TransportError>;

    /// Mid of the transceiver that carries a local track, once negotiated.
    async fn mid_of(&self, track_id: &str) -> Option<String>;

    async fn close(&self);
}

/// A freshly created transport and the stream of events it reports.
pub type TransportParts = (
    Box<dyn PeerTransport>,
    mpsc::UnboundedReceiver<TransportEvent>,
);

/// Creates one transport per peer link.
pub trait TransportFactory: Send + Sync {
    /// `local` is the own display name, `peer` the remote address.
    fn create(&self, local: &str, peer: &str) -> Result<TransportParts, TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_description_wire_shape() {
        let offer = SessionDescription::offer("v=0");
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            json!({"type": "offer", "sdp": "v=0"})
        );
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();

        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_transport_error_becomes_negotiation_fault() {
        let err: ConferenceError = TransportError::Rejected("bad sdp".to_string()).into();
        assert!(matches!(err, ConferenceError::Negotiation(_)));
        assert!(!err.is_user_facing());
    }
}
