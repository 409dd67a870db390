//! Actor model implementation for the conference server.
//!
//! Server side:
//!
//! ```text
//! RoomRegistryActor (singleton per server)
//! ├── indexes rooms by id and name, tracks sockets and membership
//! └── supervises N RoomActors
//!     └── RoomActor (one per room)
//!         ├── owns membership and the active architecture
//!         ├── relays member <-> member and member <-> engine messages
//!         └── holds the @sfu and @mcu engine legs
//! ```
//!
//! Participant side (one per joined conference):
//!
//! ```text
//! ConferenceActor
//! ├── ConnectionManagerActor (mesh)
//! │   └── ConnectionActor (one per remote peer)
//! ├── ConnectionActor (@sfu)
//! └── ConnectionActor (@mcu)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc`
//!   mailboxes; events go out on `tokio::sync::broadcast`
//! - **CancellationToken propagation**: Parents hand children child tokens
//! - **Mailbox monitoring**: Depth thresholds with metrics per actor type
//! - **No upward calls**: Rooms report closure to the registry on a channel
//!   rather than calling back into it
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that owns rooms
//! - [`room`] - `RoomActor` per room
//! - [`conference`] - `ConferenceActor` routing local media by architecture
//! - [`manager`] - `ConnectionManagerActor` for the mesh roster
//! - [`connection`] - `ConnectionActor` per peer connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod conference;
pub mod connection;
pub mod manager;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

// Re-export primary types
pub use conference::{ConferenceActor, ConferenceHandle};
pub use connection::{ConnectionActor, ConnectionConfig, ConnectionHandle};
pub use manager::{ConnectionManagerActor, ConnectionManagerHandle, ManagerConfig};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RegistryConfig, RoomRegistryHandle};
pub use room::{EngineLegs, RoomActor, RoomHandle, RoomSpec};
