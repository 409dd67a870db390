//! HTTP and WebSocket handlers for the conference server.

pub mod rooms;
pub mod sockets;

pub use rooms::{close_room, create_room, get_room, join_room, leave_room, list_rooms};
pub use sockets::{engine_socket, participant_socket};
