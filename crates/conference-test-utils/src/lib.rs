//! # Conference Test Utilities
//!
//! Mocks and fixtures for exercising the conference server without browsers
//! or media engines.
//!
//! ## Modules
//!
//! - `mock_transport` - Scripted peer transport and factory
//! - `mock_engine` - Engine provisioner that hands out pending legs
//! - `switchboard` - In-memory relay between client-side signalers
//! - `fixtures` - Participants, room settings, tracks and configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use conference_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let board = Switchboard::new();
//!     let factory = MockTransportFactory::new();
//!
//!     let alice = board.join("alice");
//!     let bob = board.join("bob");
//!
//!     // Spawn conferences on `alice`/`bob` with `Arc::new(factory.clone())`,
//!     // then announce the roster:
//!     board.notify("alice", user_list(&["bob".to_string()]));
//! }
//! ```

pub mod fixtures;
pub mod mock_engine;
pub mod mock_transport;
pub mod switchboard;

pub use fixtures::*;
pub use mock_engine::*;
pub use mock_transport::*;
pub use switchboard::*;
