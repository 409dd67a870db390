//! Media engines.
//!
//! Every room owns one forwarding (`@sfu`) and one mixing (`@mcu`) engine leg.
//! The server only sees an engine as a message endpoint: a [`Signaler`] handed
//! out by an [`EngineProvisioner`]. [`EngineHub`] is the production
//! provisioner: it creates pending signalers that queue until the engine
//! process attaches over its WebSocket with the shared engine token.

use crate::errors::ConferenceError;
use crate::signaling::{Address, Signaler};

use async_trait::async_trait;
use common::secret::{secret_matches, SecretString};
use common::types::RoomId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Sfu,
    Mcu,
}

impl EngineKind {
    /// Release order on room close.
    pub const ALL: [EngineKind; 2] = [EngineKind::Sfu, EngineKind::Mcu];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sfu => "sfu",
            EngineKind::Mcu => "mcu",
        }
    }

    /// The signaling address of this engine (`@sfu` / `@mcu`).
    #[must_use]
    pub fn address(self) -> Address {
        match self {
            EngineKind::Sfu => Address::Sfu,
            EngineKind::Mcu => Address::Mcu,
        }
    }

    #[must_use]
    pub fn from_address(address: &Address) -> Option<Self> {
        match address {
            Address::Sfu => Some(EngineKind::Sfu),
            Address::Mcu => Some(EngineKind::Mcu),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ConferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sfu" => Ok(EngineKind::Sfu),
            "mcu" => Ok(EngineKind::Mcu),
            other => Err(ConferenceError::NotFound(format!("engine kind '{other}'"))),
        }
    }
}

/// Hands out and reclaims the engine legs of a room.
#[async_trait]
pub trait EngineProvisioner: Send + Sync {
    /// Create the channel to a room's engine.
    async fn provision(&self, room: RoomId, kind: EngineKind) -> Result<Signaler, ConferenceError>;

    /// Tear the engine down. Callers tolerate failures.
    async fn release(&self, room: RoomId, kind: EngineKind) -> Result<(), ConferenceError>;
}

struct EngineLeg {
    signaler: Signaler,
    attached: bool,
}

/// Engine legs waiting for (or bound to) an engine process.
pub struct EngineHub {
    token: SecretString,
    legs: RwLock<HashMap<(RoomId, EngineKind), EngineLeg>>,
}

impl EngineHub {
    #[must_use]
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            legs: RwLock::new(HashMap::new()),
        }
    }

    /// Bind an engine process to a provisioned leg.
    ///
    /// Returns the leg's signaler for the socket adapter to open. A leg can be
    /// attached once; a closed leg is gone.
    pub async fn attach(
        &self,
        room: RoomId,
        kind: EngineKind,
        presented_token: &str,
    ) -> Result<Signaler, ConferenceError> {
        if !secret_matches(&self.token, presented_token) {
            warn!(target: "conf.engine", room_id = %room, engine = %kind, "Engine presented an invalid token");
            return Err(ConferenceError::NotAllowed(
                "Invalid engine token".to_string(),
            ));
        }

        let mut legs = self.legs.write().await;
        let leg = legs
            .get_mut(&(room, kind))
            .filter(|leg| !leg.signaler.is_closed())
            .ok_or_else(|| ConferenceError::NotFound(format!("{kind} engine of room {room}")))?;

        if leg.attached {
            return Err(ConferenceError::NotAllowed(
                "Engine already attached".to_string(),
            ));
        }
        leg.attached = true;

        info!(target: "conf.engine", room_id = %room, engine = %kind, "Engine attached");
        Ok(leg.signaler.clone())
    }

    /// Number of provisioned legs.
    pub async fn len(&self) -> usize {
        self.legs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.legs.read().await.is_empty()
    }
}

#[async_trait]
impl EngineProvisioner for EngineHub {
    async fn provision(&self, room: RoomId, kind: EngineKind) -> Result<Signaler, ConferenceError> {
        let (signaler, _task) = Signaler::spawn(kind.address().as_str());

        let previous = self.legs.write().await.insert(
            (room, kind),
            EngineLeg {
                signaler: signaler.clone(),
                attached: false,
            },
        );
        if let Some(previous) = previous {
            previous.signaler.close();
        }

        debug!(target: "conf.engine", room_id = %room, engine = %kind, "Engine leg provisioned");
        Ok(signaler)
    }

    async fn release(&self, room: RoomId, kind: EngineKind) -> Result<(), ConferenceError> {
        let leg = self
            .legs
            .write()
            .await
            .remove(&(room, kind))
            .ok_or_else(|| ConferenceError::Engine(format!("{kind} engine of room {room} not provisioned")))?;

        leg.signaler.close();
        debug!(target: "conf.engine", room_id = %room, engine = %kind, "Engine leg released");
        Ok(())
    }
}
