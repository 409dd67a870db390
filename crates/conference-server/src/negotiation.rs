//! Perfect-negotiation state machine.
//!
//! Pure functions only: the connection actor feeds its current state in and
//! performs whatever the returned decision asks for. Keeping the rules here
//! makes the glare handling testable without a transport.
//!
//! | from               | transition   | to                 |
//! |--------------------|--------------|--------------------|
//! | `stable`           | local offer  | `have-local-offer` |
//! | `stable`           | remote offer | `have-remote-offer`|
//! | `have-local-offer` | remote answer| `stable`           |
//! | `have-remote-offer`| local answer | `stable`           |
//! | `have-*-offer`     | rollback     | `stable`           |
//! | any but `closed`   | close        | `closed`           |

use crate::transport::SdpKind;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    /// Terminal.
    Closed,
}

impl NegotiationState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Stable => "stable",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Closed => "closed",
        }
    }

    /// Apply a transition, or report why it is not allowed from here.
    pub fn apply(self, transition: Transition) -> Result<Self, InvalidTransition> {
        use NegotiationState::{Closed, HaveLocalOffer, HaveRemoteOffer, Stable};

        let next = match (self, transition) {
            (Closed, _) => None,
            (_, Transition::Close) => Some(Closed),
            (Stable, Transition::LocalOffer) => Some(HaveLocalOffer),
            (Stable, Transition::RemoteOffer) => Some(HaveRemoteOffer),
            (HaveLocalOffer, Transition::RemoteAnswer)
            | (HaveRemoteOffer, Transition::LocalAnswer)
            | (HaveLocalOffer | HaveRemoteOffer, Transition::Rollback) => Some(Stable),
            _ => None,
        };

        next.ok_or(InvalidTransition {
            from: self,
            transition,
        })
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    LocalOffer,
    RemoteOffer,
    LocalAnswer,
    RemoteAnswer,
    Rollback,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transition {transition:?} is not valid in state {from}")]
pub struct InvalidTransition {
    pub from: NegotiationState,
    pub transition: Transition,
}

/// What to do when the local side needs (re)negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDecision {
    /// Create and send an offer now.
    Offer,
    /// A round is in flight; run again once back in `stable`.
    Defer,
    /// The connection is closed.
    Drop,
}

#[must_use]
pub fn on_negotiation_needed(state: NegotiationState, offering: bool) -> LocalDecision {
    match state {
        NegotiationState::Closed => LocalDecision::Drop,
        NegotiationState::Stable if !offering => LocalDecision::Offer,
        _ => LocalDecision::Defer,
    }
}

/// What to do with a remote session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDecision {
    /// Apply it (and answer, for an offer).
    Accept,
    /// Glare on the polite side: discard the local offer, then accept.
    RollbackAndAccept,
    /// Glare on the impolite side: drop the offer and remember that we did.
    Ignore,
    /// Not applicable in this state (stray answer, closed connection).
    Reject,
}

/// Decide how to treat a remote description.
///
/// A collision exists when an offer arrives while we are not `stable` or are
/// in the middle of producing our own offer.
#[must_use]
pub fn on_remote_description(
    state: NegotiationState,
    offering: bool,
    is_yielding: bool,
    kind: SdpKind,
) -> RemoteDecision {
    if state == NegotiationState::Closed {
        return RemoteDecision::Reject;
    }

    match kind {
        SdpKind::Answer => {
            if state == NegotiationState::HaveLocalOffer {
                RemoteDecision::Accept
            } else {
                RemoteDecision::Reject
            }
        }
        SdpKind::Offer => {
            let collision = offering || state != NegotiationState::Stable;
            if !collision {
                RemoteDecision::Accept
            } else if !is_yielding {
                RemoteDecision::Ignore
            } else {
                match state {
                    NegotiationState::HaveLocalOffer => RemoteDecision::RollbackAndAccept,
                    NegotiationState::Stable => RemoteDecision::Accept,
                    NegotiationState::HaveRemoteOffer | NegotiationState::Closed => {
                        RemoteDecision::Reject
                    }
                }
            }
        }
    }
}

/// Default role on a link between two named participants.
///
/// Identities are ordered byte-wise; the side whose own name sorts *after* the
/// peer's is impolite, so `own < peer` yields. Equal names never yield, which
/// cannot happen inside one room because display names are unique there.
#[must_use]
pub fn yields_to(own: &str, peer: &str) -> bool {
    own.as_bytes() < peer.as_bytes()
}

/// How a connection manager assigns the yielding role to its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPolicy {
    /// Tie-break on names with [`yields_to`].
    ByName,
    /// Always polite (media-engine side).
    Always,
    /// Never polite (participant side towards an engine).
    Never,
}

impl YieldPolicy {
    #[must_use]
    pub fn is_yielding(self, own: &str, peer: &str) -> bool {
        match self {
            YieldPolicy::ByName => yields_to(own, peer),
            YieldPolicy::Always => true,
            YieldPolicy::Never => false,
        }
    }
}
