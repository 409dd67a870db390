//! Relay protocol.
//!
//! Decides where a message inside a room goes. Routing is a pure function of
//! the message and the current member names; the room actor executes the
//! returned deliveries. The sender field is always rewritten by the server so
//! members cannot impersonate each other or an engine.

use crate::architecture::Architecture;
use crate::engine::EngineKind;
use crate::signaling::{Address, Message, MessageType};

use common::types::RoomId;
use serde_json::{json, Value};

/// Where one delivery goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A member, by display name.
    Member(String),
    Engine(EngineKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub target: Target,
    pub message: Message,
}

/// Requests addressed to `@server` that change room state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    SwitchArchitecture(Architecture),
}

/// Route taken by a message, for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Broadcast,
    Member,
    Engine,
    Server,
    /// Target absent; the sender was told it disconnected.
    Bounce,
    /// Nothing to do (unknown server request, malformed data).
    Dropped,
}

impl Route {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Route::Broadcast => "broadcast",
            Route::Member => "member",
            Route::Engine => "engine",
            Route::Server => "server",
            Route::Bounce => "bounce",
            Route::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub route: Route,
    pub deliveries: Vec<Delivery>,
    pub command: Option<ServerCommand>,
}

impl RelayOutcome {
    fn deliver(route: Route, deliveries: Vec<Delivery>) -> Self {
        Self {
            route,
            deliveries,
            command: None,
        }
    }

    fn dropped() -> Self {
        Self::deliver(Route::Dropped, Vec::new())
    }
}

fn to_every_member(members: &[String], message: &Message) -> Vec<Delivery> {
    members
        .iter()
        .map(|name| Delivery {
            target: Target::Member(name.clone()),
            message: message.clone(),
        })
        .collect()
}

/// Route a message sent by the member `sender`.
#[must_use]
pub fn from_member(sender: &str, mut message: Message, members: &[String]) -> RelayOutcome {
    message.sender = Address::peer(sender);

    match message.receiver.clone() {
        Address::Broadcast => RelayOutcome::deliver(Route::Broadcast, to_every_member(members, &message)),
        Address::Server => match message.kind {
            MessageType::UserList => {
                let others: Vec<String> = members.iter().filter(|m| *m != sender).cloned().collect();
                RelayOutcome::deliver(
                    Route::Server,
                    vec![Delivery {
                        target: Target::Member(sender.to_string()),
                        message: user_list(&others).to(Address::peer(sender)),
                    }],
                )
            }
            MessageType::ArchitectureSwitch => match message
                .data_str()
                .and_then(|raw| raw.parse::<Architecture>().ok())
            {
                Some(target) => RelayOutcome {
                    route: Route::Server,
                    deliveries: Vec::new(),
                    command: Some(ServerCommand::SwitchArchitecture(target)),
                },
                None => RelayOutcome::dropped(),
            },
            _ => RelayOutcome::dropped(),
        },
        Address::Sfu | Address::Mcu => {
            let Some(kind) = EngineKind::from_address(&message.receiver) else {
                return RelayOutcome::dropped();
            };
            RelayOutcome::deliver(
                Route::Engine,
                vec![Delivery {
                    target: Target::Engine(kind),
                    message,
                }],
            )
        }
        Address::Peer(name) => {
            if members.iter().any(|m| *m == name) {
                RelayOutcome::deliver(
                    Route::Member,
                    vec![Delivery {
                        target: Target::Member(name),
                        message,
                    }],
                )
            } else {
                RelayOutcome::deliver(
                    Route::Bounce,
                    vec![Delivery {
                        target: Target::Member(sender.to_string()),
                        message: user_disconnected(&name).to(Address::peer(sender)),
                    }],
                )
            }
        }
    }
}

/// Route a message produced by a room's engine.
#[must_use]
pub fn from_engine(kind: EngineKind, mut message: Message, members: &[String]) -> RelayOutcome {
    message.sender = kind.address();

    match message.receiver.clone() {
        Address::Broadcast => RelayOutcome::deliver(Route::Broadcast, to_every_member(members, &message)),
        Address::Peer(name) if members.iter().any(|m| *m == name) => RelayOutcome::deliver(
            Route::Member,
            vec![Delivery {
                target: Target::Member(name),
                message,
            }],
        ),
        other => RelayOutcome::deliver(
            Route::Bounce,
            vec![Delivery {
                target: Target::Engine(kind),
                message: user_disconnected(other.as_str()).to(kind.address()),
            }],
        ),
    }
}

// ============================================================================
// Server notices
// ============================================================================

/// `user:list` with the given names.
#[must_use]
pub fn user_list(names: &[String]) -> Message {
    Message::from_server(MessageType::UserList, json!(names))
}

#[must_use]
pub fn user_connected(name: &str) -> Message {
    Message::from_server(MessageType::UserConnected, name)
}

#[must_use]
pub fn user_disconnected(name: &str) -> Message {
    Message::from_server(MessageType::UserDisconnected, name)
}

#[must_use]
pub fn architecture_switch(architecture: Architecture) -> Message {
    Message::from_server(MessageType::ArchitectureSwitch, architecture.as_str())
}

/// `engine:activate` / `engine:deactivate` for one engine.
#[must_use]
pub fn engine_control(kind: EngineKind, activate: bool, members: usize) -> Message {
    let message_type = if activate {
        MessageType::EngineActivate
    } else {
        MessageType::EngineDeactivate
    };
    Message::from_server(message_type, json!({ "members": members })).to(kind.address())
}

/// `room:added` / `room:removed` directory notice.
#[must_use]
pub fn room_directory(added: bool, id: RoomId, name: &str) -> Message {
    let message_type = if added {
        MessageType::RoomAdded
    } else {
        MessageType::RoomRemoved
    };
    Message::from_server(message_type, json!({ "name": name, "id": id }))
}

/// Names in a `user:list` payload. Non-string entries are skipped.
#[must_use]
pub fn names_in(data: &Value) -> Vec<String> {
    data.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
