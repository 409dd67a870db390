//! HTTP middleware for the conference server.

pub mod participant;

pub use participant::{require_participant, PARTICIPANT_ID_HEADER, PARTICIPANT_NAME_HEADER};
