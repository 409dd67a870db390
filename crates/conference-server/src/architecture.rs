//! Transport architectures and the switch rule.

use crate::engine::EngineKind;
use crate::errors::ConferenceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How media flows inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Every participant connects to every other participant.
    #[default]
    Mesh,
    /// Participants send once to the forwarding engine.
    Sfu,
    /// Participants send once to the mixing engine and receive one mix.
    Mcu,
}

impl Architecture {
    /// The cyclic order used by `next` and `previous`.
    pub const ORDER: [Architecture; 3] = [Architecture::Mesh, Architecture::Sfu, Architecture::Mcu];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Architecture::Mesh => "mesh",
            Architecture::Sfu => "sfu",
            Architecture::Mcu => "mcu",
        }
    }

    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Architecture::Mesh => Architecture::Sfu,
            Architecture::Sfu => Architecture::Mcu,
            Architecture::Mcu => Architecture::Mesh,
        }
    }

    #[must_use]
    pub const fn previous(self) -> Self {
        match self {
            Architecture::Mesh => Architecture::Mcu,
            Architecture::Sfu => Architecture::Mesh,
            Architecture::Mcu => Architecture::Sfu,
        }
    }

    /// The media engine that carries this architecture, if any.
    #[must_use]
    pub const fn engine(self) -> Option<EngineKind> {
        match self {
            Architecture::Mesh => None,
            Architecture::Sfu => Some(EngineKind::Sfu),
            Architecture::Mcu => Some(EngineKind::Mcu),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ConferenceError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mesh" => Ok(Architecture::Mesh),
            "sfu" => Ok(Architecture::Sfu),
            "mcu" => Ok(Architecture::Mcu),
            other => Err(ConferenceError::BadRequest(format!(
                "unknown architecture '{other}'"
            ))),
        }
    }
}

/// An architecture change that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub current: Architecture,
    pub previous: Architecture,
}

/// Holds the active architecture and reports real transitions only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchitectureState {
    current: Architecture,
}

impl ArchitectureState {
    #[must_use]
    pub fn new(current: Architecture) -> Self {
        Self { current }
    }

    #[must_use]
    pub fn current(&self) -> Architecture {
        self.current
    }

    /// Set the architecture. Returns the switch when it differs from the
    /// current one, `None` for a no-op.
    pub fn set(&mut self, target: Architecture) -> Option<Switch> {
        if target == self.current {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, target);
        Some(Switch {
            current: target,
            previous,
        })
    }

    pub fn advance(&mut self) -> Option<Switch> {
        self.set(self.current.next())
    }

    pub fn retreat(&mut self) -> Option<Switch> {
        self.set(self.current.previous())
    }
}
