//! Conference server error types.
//!
//! Expected, user-facing conditions (full room, wrong password, ...) are
//! returned to the caller and never logged as faults. Internal faults carry
//! details for server-side logs; `client_message()` never exposes them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Conference server error type.
///
/// Numeric codes returned by [`ConferenceError::error_code`]:
/// - `WrongPassword`: `UNAUTHORIZED` (2)
/// - `NotAllowed`: `FORBIDDEN` (3)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `AlreadyMember`, `NameInUse`: `CONFLICT` (5)
/// - Negotiation, Transport, Engine, Serialization, Config, Internal: `INTERNAL_ERROR` (6)
/// - `RoomFull`: `CAPACITY_EXCEEDED` (7)
/// - `NoTransport`, `ChannelClosed`: `UNAVAILABLE` (8)
#[derive(Debug, Error)]
pub enum ConferenceError {
    /// The room has reached its member limit.
    #[error("Room is full")]
    RoomFull,

    /// The room requires a password and the supplied one did not match.
    #[error("Wrong password")]
    WrongPassword,

    /// The participant is already a member of the room.
    #[error("Already a member of the room")]
    AlreadyMember,

    /// The participant has no open signaling channel.
    #[error("No usable signaling channel")]
    NoTransport,

    /// A room with the requested name already exists.
    #[error("Room name already in use: {0}")]
    NameInUse(String),

    /// A room or peer lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to perform this operation.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// The request itself is malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Offer/answer or ICE application failed.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// The underlying socket or peer transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A signaling channel is closed and cannot deliver.
    #[error("Channel closed")]
    ChannelClosed,

    /// A media engine could not be provisioned or released.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// A wire message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor gone, response dropped, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConferenceError {
    /// Returns the numeric error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            ConferenceError::WrongPassword => 2, // UNAUTHORIZED
            ConferenceError::NotAllowed(_) => 3, // FORBIDDEN
            ConferenceError::NotFound(_) => 4,   // NOT_FOUND
            ConferenceError::AlreadyMember | ConferenceError::NameInUse(_) => 5, // CONFLICT
            ConferenceError::BadRequest(_)
            | ConferenceError::Negotiation(_)
            | ConferenceError::Transport(_)
            | ConferenceError::Engine(_)
            | ConferenceError::Serialization(_)
            | ConferenceError::Config(_)
            | ConferenceError::Internal(_) => 6, // INTERNAL_ERROR
            ConferenceError::RoomFull => 7,      // CAPACITY_EXCEEDED
            ConferenceError::NoTransport | ConferenceError::ChannelClosed => 8, // UNAVAILABLE
        }
    }

    /// Whether this is an expected condition caused by the caller's request
    /// rather than a fault of the server.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ConferenceError::RoomFull
                | ConferenceError::WrongPassword
                | ConferenceError::AlreadyMember
                | ConferenceError::NoTransport
                | ConferenceError::NameInUse(_)
                | ConferenceError::NotFound(_)
                | ConferenceError::NotAllowed(_)
                | ConferenceError::BadRequest(_)
        )
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ConferenceError::RoomFull => "Room is full".to_string(),
            ConferenceError::WrongPassword => "Wrong password".to_string(),
            ConferenceError::AlreadyMember => "Already a member of this room".to_string(),
            ConferenceError::NoTransport => {
                "Open a signaling connection before joining".to_string()
            }
            ConferenceError::NameInUse(_) => "Room name already in use".to_string(),
            ConferenceError::NotFound(_) => "Not found".to_string(),
            ConferenceError::NotAllowed(msg) | ConferenceError::BadRequest(msg) => msg.clone(),
            ConferenceError::ChannelClosed => "Signaling channel closed".to_string(),
            ConferenceError::Negotiation(_)
            | ConferenceError::Transport(_)
            | ConferenceError::Engine(_)
            | ConferenceError::Serialization(_)
            | ConferenceError::Config(_)
            | ConferenceError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ConferenceError::RoomFull => (StatusCode::CONFLICT, "ROOM_FULL"),
            ConferenceError::WrongPassword => (StatusCode::UNAUTHORIZED, "WRONG_PASSWORD"),
            ConferenceError::AlreadyMember => (StatusCode::CONFLICT, "ALREADY_MEMBER"),
            ConferenceError::NoTransport => (StatusCode::PRECONDITION_FAILED, "NO_TRANSPORT"),
            ConferenceError::NameInUse(_) => (StatusCode::CONFLICT, "NAME_IN_USE"),
            ConferenceError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ConferenceError::NotAllowed(_) => (StatusCode::FORBIDDEN, "NOT_ALLOWED"),
            ConferenceError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ConferenceError::ChannelClosed => (StatusCode::SERVICE_UNAVAILABLE, "CHANNEL_CLOSED"),
            ConferenceError::Negotiation(_)
            | ConferenceError::Transport(_)
            | ConferenceError::Engine(_)
            | ConferenceError::Serialization(_)
            | ConferenceError::Config(_)
            | ConferenceError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl From<serde_json::Error> for ConferenceError {
    fn from(err: serde_json::Error) -> Self {
        ConferenceError::Serialization(err.to_string())
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ConferenceError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if self.is_user_facing() {
            tracing::debug!(target: "conf.http", code, error = %self, "Request rejected");
        } else {
            tracing::error!(target: "conf.http", code, error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn read_body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ConferenceError::WrongPassword.error_code(), 2);
        assert_eq!(
            ConferenceError::NotAllowed("not creator".to_string()).error_code(),
            3
        );
        assert_eq!(
            ConferenceError::NotFound("room".to_string()).error_code(),
            4
        );
        assert_eq!(ConferenceError::AlreadyMember.error_code(), 5);
        assert_eq!(
            ConferenceError::NameInUse("lobby".to_string()).error_code(),
            5
        );
        assert_eq!(
            ConferenceError::Negotiation("bad sdp".to_string()).error_code(),
            6
        );
        assert_eq!(ConferenceError::RoomFull.error_code(), 7);
        assert_eq!(ConferenceError::NoTransport.error_code(), 8);
        assert_eq!(ConferenceError::ChannelClosed.error_code(), 8);
    }

    #[test]
    fn test_user_facing_classification() {
        assert!(ConferenceError::RoomFull.is_user_facing());
        assert!(ConferenceError::WrongPassword.is_user_facing());
        assert!(ConferenceError::AlreadyMember.is_user_facing());
        assert!(ConferenceError::NoTransport.is_user_facing());
        assert!(ConferenceError::NameInUse("x".to_string()).is_user_facing());
        assert!(ConferenceError::NotFound("x".to_string()).is_user_facing());

        assert!(!ConferenceError::Negotiation("x".to_string()).is_user_facing());
        assert!(!ConferenceError::Engine("x".to_string()).is_user_facing());
        assert!(!ConferenceError::ChannelClosed.is_user_facing());
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = ConferenceError::Engine("sfu at 10.0.0.7:9000 refused".to_string());
        assert!(!err.client_message().contains("10.0.0.7"));
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = ConferenceError::NameInUse("secret-board-meeting".to_string());
        assert!(!err.client_message().contains("secret-board-meeting"));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(format!("{}", ConferenceError::RoomFull), "Room is full");
        assert_eq!(
            format!("{}", ConferenceError::NameInUse("lobby".to_string())),
            "Room name already in use: lobby"
        );
    }

    #[tokio::test]
    async fn test_into_response_room_full() {
        let response = ConferenceError::RoomFull.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "ROOM_FULL");
        assert_eq!(body["error"]["message"], "Room is full");
    }

    #[tokio::test]
    async fn test_into_response_internal_is_generic() {
        let response =
            ConferenceError::Internal("mailbox for room 42 dropped".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn test_into_response_wrong_password() {
        let response = ConferenceError::WrongPassword.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
