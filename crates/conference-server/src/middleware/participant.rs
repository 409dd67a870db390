//! Participant identification middleware.
//!
//! Authentication lives in front of this server. Requests arrive with the
//! caller's identity in two headers:
//!
//! - `x-participant-id` - the participant's UUID
//! - `x-participant-name` - the display name used as signaling address
//!
//! [`require_participant`] parses both and stores a [`Participant`] in the
//! request extensions for downstream handlers.

use crate::actors::Participant;
use crate::errors::ConferenceError;
use crate::signaling::Address;
use axum::{extract::Request, middleware::Next, response::IntoResponse};
use common::types::ParticipantId;
use tracing::instrument;

pub const PARTICIPANT_ID_HEADER: &str = "x-participant-id";
pub const PARTICIPANT_NAME_HEADER: &str = "x-participant-name";

fn header<'a>(req: &'a Request, name: &str) -> Result<&'a str, ConferenceError> {
    req.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            tracing::debug!(target: "conf.http", header = name, "Missing identity header");
            ConferenceError::BadRequest(format!("Missing {name} header"))
        })
}

/// Read the caller's identity from the request headers.
///
/// Display names may not collide with the reserved signaling addresses.
pub fn participant_from_request(req: &Request) -> Result<Participant, ConferenceError> {
    let id = header(req, PARTICIPANT_ID_HEADER)?
        .parse::<ParticipantId>()
        .map_err(|_| ConferenceError::BadRequest(format!("Invalid {PARTICIPANT_ID_HEADER} header")))?;
    let name = header(req, PARTICIPANT_NAME_HEADER)?;

    if !matches!(Address::from(name), Address::Peer(_)) {
        return Err(ConferenceError::BadRequest(format!(
            "'{name}' is a reserved name"
        )));
    }

    Ok(Participant {
        id,
        name: name.to_string(),
    })
}

/// Reject requests without a valid identity; otherwise inject [`Participant`].
#[instrument(skip_all, name = "conf.middleware.participant")]
pub async fn require_participant(
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, ConferenceError> {
    let participant = participant_from_request(&req)?;
    req.extensions_mut().insert(participant);
    Ok(next.run(req).await)
}
