//! WebSocket adapters.
//!
//! - `GET /ws` - a participant's signaling socket (identity from headers)
//! - `GET /engines/{id}/{kind}?token=` - a media engine attaching to a room
//!
//! Both bridge one WebSocket to one [`Signaler`]: text frames are decoded
//! and delivered inbound, outbound messages are encoded as text frames. When
//! either side ends the other is torn down.

use crate::actors::Participant;
use crate::engine::EngineKind;
use crate::errors::ConferenceError;
use crate::routes::AppState;
use crate::signaling::{Message, Signaler};
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Extension;
use common::secret::{ExposeSecret, SecretString};
use common::types::RoomId;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Query of the engine socket.
#[derive(Debug, Deserialize)]
pub struct EngineQuery {
    pub token: SecretString,
}

#[instrument(skip_all, name = "conf.http.ws.participant", fields(participant_id = %participant.id))]
pub async fn participant_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(participant): Extension<Participant>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_participant_socket(socket, participant, state))
}

async fn handle_participant_socket(socket: WebSocket, participant: Participant, state: Arc<AppState>) {
    let (signaler, _task) = Signaler::spawn(participant.name.clone());
    let signaler_id = signaler.id();

    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = signaler.open(tx) {
        warn!(target: "conf.http", participant_id = %participant.id, error = %e, "Signaler gone before socket opened");
        return;
    }
    if let Err(e) = state
        .registry
        .register_socket(participant.clone(), signaler.clone())
        .await
    {
        warn!(target: "conf.http", participant_id = %participant.id, error = %e, "Socket registration failed");
        signaler.close();
        return;
    }

    info!(target: "conf.http", participant_id = %participant.id, participant = %participant.name, "Participant socket opened");
    bridge(socket, &signaler, rx).await;

    if let Err(e) = state.registry.disconnect(participant.id, signaler_id).await {
        debug!(target: "conf.http", participant_id = %participant.id, error = %e, "Disconnect not recorded");
    }
    info!(target: "conf.http", participant_id = %participant.id, "Participant socket closed");
}

/// Attaches before upgrading so a bad token or unknown room is a plain HTTP
/// error.
#[instrument(skip_all, name = "conf.http.ws.engine", fields(room_id = %room, engine = %kind))]
pub async fn engine_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((room, kind)): Path<(RoomId, String)>,
    Query(query): Query<EngineQuery>,
) -> Result<impl IntoResponse, ConferenceError> {
    let kind: EngineKind = kind.parse()?;
    let signaler = state
        .engines
        .attach(room, kind, query.token.expose_secret())
        .await?;

    Ok(ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::unbounded_channel();
        if signaler.open(tx).is_err() {
            warn!(target: "conf.engine", room_id = %room, engine = %kind, "Engine leg closed before socket opened");
            return;
        }
        info!(target: "conf.engine", room_id = %room, engine = %kind, "Engine socket opened");
        bridge(socket, &signaler, rx).await;
        info!(target: "conf.engine", room_id = %room, engine = %kind, "Engine socket closed");
    }))
}

/// Pump frames between a socket and a signaler until either side ends.
async fn bridge(socket: WebSocket, signaler: &Signaler, mut outbound: mpsc::UnboundedReceiver<Message>) {
    let (mut sink, mut stream) = socket.split();
    let label = signaler.label().to_string();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "conf.http", error = %e, "Dropping unencodable message");
                    continue;
                }
            };
            if sink.send(ws::Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = signaler.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                ws::Message::Text(text) => match Message::decode(&text) {
                    Ok(message) => {
                        if inbound.deliver(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(target: "conf.http", label = %label, error = %e, "Invalid signaling frame");
                    }
                },
                ws::Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    signaler.transport_closed();
}
