//! Conference Server Library
//!
//! Signaling and orchestration for multi-party audio/video conferences:
//!
//! - Room management: creation, admission, membership, auto-close
//! - Message relay between members and the room's media engines
//! - Switching a room between mesh, SFU and MCU delivery
//! - Perfect negotiation between two peers over any signaling channel
//!
//! # Architecture
//!
//! The server uses an actor model hierarchy:
//!
//! ```text
//! RoomRegistryActor (singleton per server)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room)
//!         ├── member signalers (one per participant socket)
//!         └── engine signalers (@sfu, @mcu)
//! ```
//!
//! The participant side (`ConferenceActor`, `ConnectionManagerActor`,
//! `ConnectionActor`) runs the same negotiation over a [`transport::PeerTransport`]
//! supplied by the embedding application.
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`signaling`] - Wire messages, addresses and the `Signaler` channel
//! - [`negotiation`] - Perfect-negotiation state machine and decisions
//! - [`relay`] - Routing of room messages
//! - [`architecture`] - Mesh / SFU / MCU switch rule
//! - [`engine`] - Media engine provisioning and attachment
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with appropriate error codes

pub mod actors;
pub mod architecture;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod media;
pub mod middleware;
pub mod negotiation;
pub mod observability;
pub mod relay;
pub mod routes;
pub mod signaling;
pub mod transport;
