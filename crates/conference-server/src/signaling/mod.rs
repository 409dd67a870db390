//! Wire-level signaling types.
//!
//! Every message exchanged between participants, the server and the media
//! engines is a JSON object `{type, data, sender, receiver}`. Addresses are a
//! participant display name or one of the reserved endpoints `*`, `@server`,
//! `@sfu` and `@mcu`. A missing (or `null`) address means broadcast.

mod signaler;

pub use signaler::{Signaler, SignalerEvent};

use crate::errors::ConferenceError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Wire spelling of the broadcast address.
pub const BROADCAST: &str = "*";
/// Wire spelling of the server endpoint.
pub const SERVER: &str = "@server";
/// Wire spelling of the forwarding engine.
pub const SFU: &str = "@sfu";
/// Wire spelling of the mixing engine.
pub const MCU: &str = "@mcu";

/// Sender or receiver of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Address {
    /// Every member of the room.
    #[default]
    Broadcast,
    /// The conference server itself.
    Server,
    /// The selective forwarding engine of the room.
    Sfu,
    /// The mixing engine of the room.
    Mcu,
    /// A participant, by display name.
    Peer(String),
}

impl Address {
    /// Address of a participant.
    #[must_use]
    pub fn peer(name: impl Into<String>) -> Self {
        Address::Peer(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Address::Broadcast => BROADCAST,
            Address::Server => SERVER,
            Address::Sfu => SFU,
            Address::Mcu => MCU,
            Address::Peer(name) => name,
        }
    }

    /// Whether the address names a participant with the given display name.
    #[must_use]
    pub fn is_peer(&self, name: &str) -> bool {
        matches!(self, Address::Peer(n) if n == name)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        match value {
            "" | BROADCAST => Address::Broadcast,
            SERVER => Address::Server,
            SFU => Address::Sfu,
            MCU => Address::Mcu,
            name => Address::Peer(name.to_string()),
        }
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        match Address::from(value.as_str()) {
            Address::Peer(_) => Address::Peer(value),
            reserved => reserved,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.map_or(Address::Broadcast, Address::from))
    }
}

/// Message type tag.
///
/// Unknown tags are preserved as [`MessageType::Custom`] so application
/// messages (chat, reactions, ...) relay untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Session description (offer or answer).
    Sdp,
    /// ICE candidate.
    Ice,
    /// Explicit teardown of one peer link.
    ConnectionClose,
    /// Stop one receiving leg; data is the mid.
    ReceiverStop,
    /// Provenance tag for a media leg; data is `{mid, meta}`.
    TrackMeta,
    UserConnected,
    UserDisconnected,
    UserList,
    ArchitectureSwitch,
    RoomAdded,
    RoomRemoved,
    EngineActivate,
    EngineDeactivate,
    Custom(String),
}

impl MessageType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Sdp => "sdp",
            MessageType::Ice => "ice",
            MessageType::ConnectionClose => "connection:close",
            MessageType::ReceiverStop => "receiver:stop",
            MessageType::TrackMeta => "track:meta",
            MessageType::UserConnected => "user:connected",
            MessageType::UserDisconnected => "user:disconnected",
            MessageType::UserList => "user:list",
            MessageType::ArchitectureSwitch => "architecture:switch",
            MessageType::RoomAdded => "room:added",
            MessageType::RoomRemoved => "room:removed",
            MessageType::EngineActivate => "engine:activate",
            MessageType::EngineDeactivate => "engine:deactivate",
            MessageType::Custom(tag) => tag,
        }
    }

    /// Bounded label for metrics; custom tags collapse into one bucket.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            MessageType::Sdp => "sdp",
            MessageType::Ice => "ice",
            MessageType::ConnectionClose => "connection_close",
            MessageType::ReceiverStop => "receiver_stop",
            MessageType::TrackMeta => "track_meta",
            MessageType::UserConnected => "user_connected",
            MessageType::UserDisconnected => "user_disconnected",
            MessageType::UserList => "user_list",
            MessageType::ArchitectureSwitch => "architecture_switch",
            MessageType::RoomAdded => "room_added",
            MessageType::RoomRemoved => "room_removed",
            MessageType::EngineActivate => "engine_activate",
            MessageType::EngineDeactivate => "engine_deactivate",
            MessageType::Custom(_) => "custom",
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        match value {
            "sdp" => MessageType::Sdp,
            "ice" => MessageType::Ice,
            "connection:close" => MessageType::ConnectionClose,
            "receiver:stop" => MessageType::ReceiverStop,
            "track:meta" => MessageType::TrackMeta,
            "user:connected" => MessageType::UserConnected,
            "user:disconnected" => MessageType::UserDisconnected,
            "user:list" => MessageType::UserList,
            "architecture:switch" => MessageType::ArchitectureSwitch,
            "room:added" => MessageType::RoomAdded,
            "room:removed" => MessageType::RoomRemoved,
            "engine:activate" => MessageType::EngineActivate,
            "engine:deactivate" => MessageType::EngineDeactivate,
            other => MessageType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::from(raw.as_str()))
    }
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sender: Address,
    #[serde(default)]
    pub receiver: Address,
}

impl Message {
    /// Create a broadcast message with no sender set.
    pub fn new(kind: MessageType, data: impl Into<Value>) -> Self {
        Self {
            kind,
            data: data.into(),
            sender: Address::Broadcast,
            receiver: Address::Broadcast,
        }
    }

    /// Set the receiver.
    #[must_use]
    pub fn to(mut self, receiver: Address) -> Self {
        self.receiver = receiver;
        self
    }

    /// Set the sender.
    #[must_use]
    pub fn sent_by(mut self, sender: Address) -> Self {
        self.sender = sender;
        self
    }

    /// A server notice (`sender = @server`).
    pub fn from_server(kind: MessageType, data: impl Into<Value>) -> Self {
        Self::new(kind, data).sent_by(Address::Server)
    }

    /// Parse a message from its JSON text form.
    pub fn decode(text: &str) -> Result<Self, ConferenceError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the message as JSON text.
    pub fn encode(&self) -> Result<String, ConferenceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The data payload as a string, if it is one.
    #[must_use]
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_and_null_receiver_mean_broadcast() {
        let msg = Message::decode(r#"{"type":"chat","data":"hi"}"#).unwrap();
        assert_eq!(msg.receiver, Address::Broadcast);
        assert_eq!(msg.sender, Address::Broadcast);

        let msg = Message::decode(r#"{"type":"chat","receiver":null}"#).unwrap();
        assert_eq!(msg.receiver, Address::Broadcast);
        assert_eq!(msg.data, Value::Null);
    }

    #[test]
    fn test_reserved_addresses_parse() {
        let msg =
            Message::decode(r#"{"type":"sdp","sender":"alice","receiver":"@sfu"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Sdp);
        assert_eq!(msg.sender, Address::peer("alice"));
        assert_eq!(msg.receiver, Address::Sfu);

        assert_eq!(Address::from("@server"), Address::Server);
        assert_eq!(Address::from("@mcu"), Address::Mcu);
        assert_eq!(Address::from("*"), Address::Broadcast);
    }

    #[test]
    fn test_unknown_type_is_kept_verbatim() {
        let msg = Message::decode(r#"{"type":"chat:message","data":{"text":"yo"}}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Custom("chat:message".to_string()));
        assert_eq!(msg.kind.metric_label(), "custom");

        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(encoded["type"], "chat:message");
        assert_eq!(encoded["data"]["text"], "yo");
    }

    #[test]
    fn test_encode_uses_wire_field_names() {
        let msg = Message::from_server(MessageType::UserConnected, "bob").to(Address::Broadcast);
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({"type": "user:connected", "data": "bob", "sender": "@server", "receiver": "*"})
        );
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = Message::decode("not json").unwrap_err();
        assert!(matches!(err, ConferenceError::Serialization(_)));
    }
}
