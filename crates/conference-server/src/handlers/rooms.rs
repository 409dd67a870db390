//! Room handlers.
//!
//! Implements the room endpoints:
//!
//! - `GET /rooms` - Public room list
//! - `POST /rooms` - Create a room
//! - `GET /rooms/{id}?password=` - Room info (private rooms need the password)
//! - `POST /rooms/{id}/members` - Join over the caller's signaling socket
//! - `DELETE /rooms/{id}/members` - Leave
//! - `DELETE /rooms/{id}` - Close (creator only)
//!
//! Every endpoint sits behind `require_participant`.

use crate::actors::{Participant, RoomInfo, RoomSettings};
use crate::errors::ConferenceError;
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use common::secret::SecretString;
use common::types::RoomId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

/// Body of `POST /rooms/{id}/members`.
#[derive(Debug, Default, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub password: Option<SecretString>,
}

/// Query of `GET /rooms/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct PasswordQuery {
    #[serde(default)]
    pub password: Option<SecretString>,
}

/// Parse a JSON body ourselves to answer 400 rather than axum's 422.
/// An empty body is the type's default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ConferenceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "conf.http", error = %e, "Invalid request body");
        ConferenceError::BadRequest("Invalid request body".to_string())
    })
}

// ============================================================================
// Handler: GET /rooms
// ============================================================================

#[instrument(skip_all, name = "conf.http.rooms.list")]
pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RoomInfo>>, ConferenceError> {
    Ok(Json(state.registry.list_public().await?))
}

// ============================================================================
// Handler: POST /rooms
// ============================================================================

/// # Response
///
/// - 201 Created: room info
/// - 400 Bad Request: invalid body, blank name, zero member cap
/// - 403 Forbidden: registry at capacity
/// - 409 Conflict: name already in use
#[instrument(skip_all, name = "conf.http.rooms.create", fields(participant_id = %participant.id))]
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    Extension(participant): Extension<Participant>,
    body: Bytes,
) -> Result<(StatusCode, Json<RoomInfo>), ConferenceError> {
    let settings: RoomSettings = parse_body(&body)?;
    let room = state.registry.create(participant, settings).await?;

    info!(target: "conf.http", room_id = %room.id, room = %room.name, "Room created via HTTP");
    Ok((StatusCode::CREATED, Json(room)))
}

// ============================================================================
// Handler: GET /rooms/{id}
// ============================================================================

#[instrument(skip_all, name = "conf.http.rooms.get", fields(room_id = %id))]
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RoomId>,
    Query(query): Query<PasswordQuery>,
) -> Result<Json<RoomInfo>, ConferenceError> {
    Ok(Json(state.registry.info(id, query.password).await?))
}

// ============================================================================
// Handler: POST /rooms/{id}/members
// ============================================================================

/// # Response
///
/// - 200 OK: room info after joining
/// - 401 Unauthorized: wrong password
/// - 404 Not Found: no such room
/// - 409 Conflict: room full, already a member, display name taken
/// - 412 Precondition Failed: no open signaling socket
#[instrument(skip_all, name = "conf.http.rooms.join", fields(room_id = %id, participant_id = %participant.id))]
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Extension(participant): Extension<Participant>,
    Path(id): Path<RoomId>,
    body: Bytes,
) -> Result<Json<RoomInfo>, ConferenceError> {
    let request: JoinRequest = parse_body(&body)?;
    Ok(Json(
        state.registry.join(id, participant, request.password).await?,
    ))
}

// ============================================================================
// Handler: DELETE /rooms/{id}/members
// ============================================================================

#[instrument(skip_all, name = "conf.http.rooms.leave", fields(room_id = %id, participant_id = %participant.id))]
pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    Extension(participant): Extension<Participant>,
    Path(id): Path<RoomId>,
) -> Result<StatusCode, ConferenceError> {
    state.registry.leave(id, participant.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Handler: DELETE /rooms/{id}
// ============================================================================

#[instrument(skip_all, name = "conf.http.rooms.close", fields(room_id = %id, participant_id = %participant.id))]
pub async fn close_room(
    State(state): State<Arc<AppState>>,
    Extension(participant): Extension<Participant>,
    Path(id): Path<RoomId>,
) -> Result<StatusCode, ConferenceError> {
    state.registry.close(id, participant.id).await?;
    info!(target: "conf.http", room_id = %id, "Room closed via HTTP");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_empty_body_is_default() {
        let request: JoinRequest = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(request.password.is_none());
    }

    #[test]
    fn test_malformed_body_is_bad_request() {
        let err = parse_body::<RoomSettings>(&Bytes::from_static(b"{name:")).unwrap_err();
        assert!(matches!(err, ConferenceError::BadRequest(_)));
    }

    #[test]
    fn test_create_body_fields() {
        let settings: RoomSettings = parse_body(&Bytes::from_static(
            br#"{"name":"standup","password":"pw","max_members":4}"#,
        ))
        .unwrap();
        assert_eq!(settings.name, "standup");
        assert_eq!(settings.password.unwrap().expose_secret(), "pw");
        assert_eq!(settings.max_members, Some(4));
        assert_eq!(settings.max_empty_minutes, None);
    }
}
