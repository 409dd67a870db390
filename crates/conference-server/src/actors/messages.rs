//! Message types for actor communication.
//!
//! Requests travel over bounded `tokio::sync::mpsc` mailboxes; request-reply
//! uses `tokio::sync::oneshot`. Events observed by other components are
//! closed enums delivered over `tokio::sync::broadcast`.

use crate::architecture::{Architecture, Switch};
use crate::engine::EngineKind;
use crate::errors::ConferenceError;
use crate::media::{MediaSelector, MediaTrack, RemoteTrack};
use crate::negotiation::NegotiationState;
use crate::signaling::{Message, Signaler};

use super::connection::ConnectionHandle;
use super::room::RoomHandle;

use chrono::{DateTime, Utc};
use common::secret::SecretString;
use common::types::{ConnectionId, ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Start sending local tracks to the peer.
    AddMedia {
        tracks: Vec<MediaTrack>,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Stop sending the selected local tracks.
    RemoveMedia {
        selector: MediaSelector,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Mute or unmute the selected local tracks without renegotiating.
    MuteMedia {
        selector: MediaSelector,
        muted: bool,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Run a negotiation round now (or once back in `stable`).
    Negotiate {
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<ConnectionSnapshot>,
    },

    /// Local close: tell the peer, then tear down.
    Close { respond_to: oneshot::Sender<()> },
}

/// Event emitted by a connection. Every variant names the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        peer: String,
        state: NegotiationState,
    },
    TrackAdded {
        peer: String,
        track: RemoteTrack,
    },
    /// A received leg got its provenance tag.
    TrackUpdated {
        peer: String,
        track: RemoteTrack,
    },
    TrackRemoved {
        peer: String,
        track: RemoteTrack,
    },
    Closed {
        peer: String,
        id: ConnectionId,
    },
}

impl ConnectionEvent {
    #[must_use]
    pub fn peer(&self) -> &str {
        match self {
            ConnectionEvent::StateChanged { peer, .. }
            | ConnectionEvent::TrackAdded { peer, .. }
            | ConnectionEvent::TrackUpdated { peer, .. }
            | ConnectionEvent::TrackRemoved { peer, .. }
            | ConnectionEvent::Closed { peer, .. } => peer,
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer: String,
    pub name: String,
    pub state: NegotiationState,
    pub is_yielding: bool,
    pub offering: bool,
    pub ignored_offer: bool,
    /// Ids of the local tracks being sent.
    pub added_tracks: Vec<String>,
    pub muted_tracks: Vec<String>,
    pub received_tracks: Vec<RemoteTrack>,
    pub received_streams: Vec<String>,
    /// Candidates waiting for the remote description.
    pub pending_candidates: usize,
}

// ----------------------------------------------------------------------------
// Connection manager
// ----------------------------------------------------------------------------

/// Messages sent to a `ConnectionManagerActor`.
#[derive(Debug)]
pub enum ManagerMessage {
    AddMedia {
        tracks: Vec<MediaTrack>,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    RemoveMedia {
        selector: MediaSelector,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    MuteMedia {
        selector: MediaSelector,
        muted: bool,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Create a connection outside the roster flow (or return the existing one).
    Connect {
        peer: String,
        respond_to: oneshot::Sender<Result<ConnectionHandle, ConferenceError>>,
    },

    Get {
        peer: String,
        respond_to: oneshot::Sender<Option<ConnectionHandle>>,
    },

    Users {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Close every connection, optionally forgetting them.
    CloseAll {
        remove: bool,
        respond_to: oneshot::Sender<()>,
    },
}

/// Event emitted by a connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    UserConnected { peer: String },
    UserDisconnected { peer: String },
    /// Forwarded from one of the managed connections.
    Connection(ConnectionEvent),
}

// ----------------------------------------------------------------------------
// Conference (participant side)
// ----------------------------------------------------------------------------

/// Messages sent to a `ConferenceActor`.
#[derive(Debug)]
pub enum ConferenceMessage {
    AddMedia {
        tracks: Vec<MediaTrack>,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    RemoveMedia {
        selector: MediaSelector,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    MuteMedia {
        selector: MediaSelector,
        muted: bool,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Ask the server to switch; `None` means the next architecture.
    SwitchArchitecture {
        target: Option<Architecture>,
        respond_to: oneshot::Sender<Result<Architecture, ConferenceError>>,
    },

    GetArchitecture {
        respond_to: oneshot::Sender<Architecture>,
    },

    Close { respond_to: oneshot::Sender<()> },
}

/// Event emitted by a conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConferenceEvent {
    /// Local media moved to the new architecture's handler.
    ArchitectureSwitched(Switch),
}

// ----------------------------------------------------------------------------
// Room
// ----------------------------------------------------------------------------

/// A signed-in user as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
}

/// Who produced a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Member(ParticipantId),
    Engine(EngineKind),
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Validate a join without committing it.
    CheckAdmission {
        participant: Participant,
        password: Option<SecretString>,
        signaler: Option<Signaler>,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    Join {
        participant: Participant,
        password: Option<SecretString>,
        signaler: Option<Signaler>,
        respond_to: oneshot::Sender<Result<RoomInfo, ConferenceError>>,
    },

    /// Responds whether the participant was a member.
    Leave {
        participant: ParticipantId,
        respond_to: oneshot::Sender<bool>,
    },

    /// A message read from a member's or engine's channel. Fire-and-forget.
    Relay {
        origin: Origin,
        message: Message,
        received_at: Instant,
    },

    SwitchArchitecture {
        target: Architecture,
        respond_to: oneshot::Sender<Option<Switch>>,
    },

    GetInfo {
        respond_to: oneshot::Sender<RoomInfo>,
    },

    /// Password check for private rooms.
    CheckPassword {
        password: Option<SecretString>,
        respond_to: oneshot::Sender<bool>,
    },

    /// A member reconnected on a new channel.
    Rebind {
        participant: ParticipantId,
        signaler: Signaler,
        respond_to: oneshot::Sender<bool>,
    },

    Close { respond_to: oneshot::Sender<()> },
}

/// Event emitted by a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Joined(Participant),
    Left(Participant),
    ArchitectureSwitched(Switch),
    Closed,
}

/// Creator as shown in room info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorInfo {
    pub id: ParticipantId,
    pub name: String,
}

/// Public description of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub creator: CreatorInfo,
    pub public: bool,
    pub architecture: Architecture,
    /// Remaining capacity is above zero.
    pub joinable: bool,
    /// `None` means unlimited.
    pub max_members: Option<usize>,
    pub members: Vec<String>,
    pub created: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Creation request for a room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomSettings {
    pub name: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub max_members: Option<usize>,
    #[serde(default)]
    pub max_empty_minutes: Option<u64>,
}

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    Create {
        creator: Participant,
        settings: RoomSettings,
        respond_to: oneshot::Sender<Result<RoomInfo, ConferenceError>>,
    },

    FindById {
        id: RoomId,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    FindByName {
        name: String,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    ListPublic {
        respond_to: oneshot::Sender<Vec<RoomInfo>>,
    },

    /// Info lookup; private rooms need the password.
    Info {
        id: RoomId,
        password: Option<SecretString>,
        respond_to: oneshot::Sender<Result<RoomInfo, ConferenceError>>,
    },

    Join {
        id: RoomId,
        participant: Participant,
        password: Option<SecretString>,
        respond_to: oneshot::Sender<Result<RoomInfo, ConferenceError>>,
    },

    Leave {
        id: RoomId,
        participant: ParticipantId,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Creator-only close.
    Close {
        id: RoomId,
        requester: ParticipantId,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// Unconditional removal.
    Remove {
        id: RoomId,
        respond_to: oneshot::Sender<Result<(), ConferenceError>>,
    },

    /// A participant opened a signaling socket.
    RegisterSocket {
        participant: Participant,
        signaler: Signaler,
        respond_to: oneshot::Sender<()>,
    },

    /// A participant's socket went away. Ignored unless `signaler_id` is
    /// still the registered one.
    Disconnect {
        participant: ParticipantId,
        signaler_id: Uuid,
        respond_to: oneshot::Sender<()>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Status of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    /// Participants that are members of some room.
    pub member_count: usize,
    pub socket_count: usize,
    pub mailbox_depth: usize,
}
