//! `ConferenceActor` - participant-side orchestrator.
//!
//! Holds one handler per architecture: a mesh [`ConnectionManagerHandle`]
//! and one connection each to `@sfu` and `@mcu`. The published local media
//! lives on the handler of the active architecture only. When the server
//! announces `architecture:switch`, media is added to the new handler before
//! it is removed from the previous one, so the participant never goes silent.

use crate::architecture::{Architecture, ArchitectureState};
use crate::config::NegotiationTimings;
use crate::engine::EngineKind;
use crate::errors::ConferenceError;
use crate::media::{MediaSelector, MediaTrack};
use crate::negotiation::YieldPolicy;
use crate::signaling::{Address, Message, MessageType, Signaler, SignalerEvent};
use crate::transport::TransportFactory;

use super::connection::{ConnectionActor, ConnectionConfig, ConnectionHandle};
use super::manager::{ConnectionManagerActor, ConnectionManagerHandle, ManagerConfig};
use super::messages::{ConferenceEvent, ConferenceMessage};
use super::metrics::ActorMetrics;

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CONFERENCE_CHANNEL_BUFFER: usize = 100;

const CONFERENCE_EVENT_CAPACITY: usize = 16;

/// Handle to a `ConferenceActor`.
#[derive(Clone, Debug)]
pub struct ConferenceHandle {
    sender: mpsc::Sender<ConferenceMessage>,
    events: broadcast::Sender<ConferenceEvent>,
    cancel_token: CancellationToken,
    mesh: ConnectionManagerHandle,
    sfu: ConnectionHandle,
    mcu: ConnectionHandle,
}

impl ConferenceHandle {
    /// The mesh connection manager.
    #[must_use]
    pub fn mesh(&self) -> &ConnectionManagerHandle {
        &self.mesh
    }

    /// The connection to a media engine.
    #[must_use]
    pub fn engine(&self, kind: EngineKind) -> &ConnectionHandle {
        match kind {
            EngineKind::Sfu => &self.sfu,
            EngineKind::Mcu => &self.mcu,
        }
    }

    /// Publish tracks on the active architecture.
    pub async fn add_media(&self, tracks: Vec<MediaTrack>) -> Result<(), ConferenceError> {
        self.request(|respond_to| ConferenceMessage::AddMedia { tracks, respond_to })
            .await?
    }

    pub async fn remove_media(&self, selector: MediaSelector) -> Result<(), ConferenceError> {
        self.request(|respond_to| ConferenceMessage::RemoveMedia {
            selector,
            respond_to,
        })
        .await?
    }

    pub async fn mute_media(
        &self,
        selector: MediaSelector,
        muted: bool,
    ) -> Result<(), ConferenceError> {
        self.request(|respond_to| ConferenceMessage::MuteMedia {
            selector,
            muted,
            respond_to,
        })
        .await?
    }

    /// Ask the server for a switch. `None` requests the next architecture.
    /// Returns the requested target; the switch itself happens when the
    /// server announces it.
    pub async fn switch_architecture(
        &self,
        target: Option<Architecture>,
    ) -> Result<Architecture, ConferenceError> {
        self.request(|respond_to| ConferenceMessage::SwitchArchitecture { target, respond_to })
            .await?
    }

    pub async fn architecture(&self) -> Result<Architecture, ConferenceError> {
        self.request(|respond_to| ConferenceMessage::GetArchitecture { respond_to })
            .await
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConferenceEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Close every handler.
    pub async fn close(&self) -> Result<(), ConferenceError> {
        self.request(|respond_to| ConferenceMessage::Close { respond_to })
            .await
    }

    async fn request<T, F>(&self, build: F) -> Result<T, ConferenceError>
    where
        F: FnOnce(oneshot::Sender<T>) -> ConferenceMessage,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| ConferenceError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| ConferenceError::Internal(format!("response receive failed: {e}")))
    }
}

/// The `ConferenceActor` implementation.
pub struct ConferenceActor {
    name: String,
    signaler: Signaler,
    inbound: mpsc::UnboundedReceiver<SignalerEvent>,
    receiver: mpsc::Receiver<ConferenceMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<ConferenceEvent>,
    mesh: ConnectionManagerHandle,
    sfu: ConnectionHandle,
    mcu: ConnectionHandle,
    architecture: ArchitectureState,
    published: Vec<MediaTrack>,
    muted: BTreeSet<String>,
}

impl ConferenceActor {
    /// Spawn a conference for participant `name` on its signaling channel.
    pub fn spawn(
        name: impl Into<String>,
        signaler: Signaler,
        factory: Arc<dyn TransportFactory>,
        timings: NegotiationTimings,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> Result<(ConferenceHandle, JoinHandle<()>), ConferenceError> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(CONFERENCE_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(CONFERENCE_EVENT_CAPACITY);

        let (mesh, _mesh_task) = ConnectionManagerActor::spawn(
            ManagerConfig {
                name: name.clone(),
                policy: YieldPolicy::ByName,
                timings,
            },
            signaler.clone(),
            Arc::clone(&factory),
            cancel_token.child_token(),
            metrics,
        );

        let engine_link = |kind: EngineKind| -> Result<ConnectionHandle, ConferenceError> {
            let peer = kind.address().as_str().to_string();
            let parts = factory.create(&name, &peer)?;
            let (handle, _task) = ConnectionActor::spawn(
                ConnectionConfig {
                    name: name.clone(),
                    peer,
                    is_yielding: false,
                    timings,
                },
                signaler.clone(),
                parts,
                None,
                cancel_token.child_token(),
            );
            Ok(handle)
        };
        let sfu = engine_link(EngineKind::Sfu)?;
        let mcu = engine_link(EngineKind::Mcu)?;

        let handle = ConferenceHandle {
            sender,
            events: events.clone(),
            cancel_token: cancel_token.clone(),
            mesh: mesh.clone(),
            sfu: sfu.clone(),
            mcu: mcu.clone(),
        };

        let actor = Self {
            inbound: signaler.subscribe(),
            name,
            signaler,
            receiver,
            cancel_token,
            events,
            mesh,
            sfu,
            mcu,
            architecture: ArchitectureState::default(),
            published: Vec::new(),
            muted: BTreeSet::new(),
        };

        let task = tokio::spawn(actor.run());
        Ok((handle, task))
    }

    #[instrument(skip_all, name = "conf.actor.conference", fields(name = %self.name))]
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,

                message = self.receiver.recv() => {
                    match message {
                        Some(ConferenceMessage::Close { respond_to }) => {
                            self.close().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }

                event = self.inbound.recv() => {
                    match event {
                        Some(SignalerEvent::Message(message)) => self.handle_signal(message).await,
                        Some(SignalerEvent::Closed) | None => break,
                    }
                }
            }
        }

        self.cancel_token.cancel();
        info!(target: "conf.actor.conference", name = %self.name, "Conference stopped");
    }

    async fn handle_message(&mut self, message: ConferenceMessage) {
        match message {
            ConferenceMessage::AddMedia { tracks, respond_to } => {
                let fresh: Vec<MediaTrack> = tracks
                    .into_iter()
                    .filter(|t| !self.published.iter().any(|p| p.id == t.id))
                    .collect();
                self.published.extend(fresh.iter().cloned());
                let result = self.add_to(self.architecture.current(), fresh).await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::RemoveMedia {
                selector,
                respond_to,
            } => {
                self.published.retain(|t| !selector.matches(t));
                let result = self
                    .remove_from(self.architecture.current(), selector)
                    .await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::MuteMedia {
                selector,
                muted,
                respond_to,
            } => {
                for track in self.published.iter().filter(|t| selector.matches(t)) {
                    if muted {
                        self.muted.insert(track.id.clone());
                    } else {
                        self.muted.remove(&track.id);
                    }
                }
                let result = self
                    .mute_on(self.architecture.current(), selector, muted)
                    .await;
                let _ = respond_to.send(result);
            }
            ConferenceMessage::SwitchArchitecture { target, respond_to } => {
                let target = target.unwrap_or_else(|| self.architecture.current().next());
                let request = Message::new(MessageType::ArchitectureSwitch, target.as_str())
                    .to(Address::Server)
                    .sent_by(Address::peer(self.name.clone()));
                let result = self.signaler.send(request).map(|()| target);
                let _ = respond_to.send(result);
            }
            ConferenceMessage::GetArchitecture { respond_to } => {
                let _ = respond_to.send(self.architecture.current());
            }
            ConferenceMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_signal(&mut self, message: Message) {
        if message.sender != Address::Server || message.kind != MessageType::ArchitectureSwitch {
            return;
        }
        let Some(target) = message.data_str().and_then(|s| s.parse::<Architecture>().ok()) else {
            debug!(target: "conf.actor.conference", name = %self.name, "Unparseable architecture switch ignored");
            return;
        };
        let Some(switch) = self.architecture.set(target) else {
            return;
        };

        if let Err(e) = self.add_to(switch.current, self.published.clone()).await {
            warn!(target: "conf.actor.conference", name = %self.name, error = %e, "Publishing on new architecture failed");
        }
        for track_id in self.muted.clone() {
            if let Err(e) = self
                .mute_on(switch.current, MediaSelector::Track(track_id), true)
                .await
            {
                warn!(target: "conf.actor.conference", name = %self.name, error = %e, "Restoring mute failed");
            }
        }
        if let Err(e) = self.remove_from(switch.previous, MediaSelector::ALL).await {
            warn!(target: "conf.actor.conference", name = %self.name, error = %e, "Unpublishing from old architecture failed");
        }

        info!(
            target: "conf.actor.conference",
            name = %self.name,
            current = %switch.current,
            previous = %switch.previous,
            "Architecture switched"
        );
        let _ = self.events.send(ConferenceEvent::ArchitectureSwitched(switch));
    }

    async fn add_to(
        &self,
        architecture: Architecture,
        tracks: Vec<MediaTrack>,
    ) -> Result<(), ConferenceError> {
        if tracks.is_empty() {
            return Ok(());
        }
        match architecture.engine() {
            None => self.mesh.add_media(tracks).await,
            Some(kind) => self.engine_link(kind).add_media(tracks).await,
        }
    }

    async fn remove_from(
        &self,
        architecture: Architecture,
        selector: MediaSelector,
    ) -> Result<(), ConferenceError> {
        match architecture.engine() {
            None => self.mesh.remove_media(selector).await,
            Some(kind) => self.engine_link(kind).remove_media(selector).await,
        }
    }

    async fn mute_on(
        &self,
        architecture: Architecture,
        selector: MediaSelector,
        muted: bool,
    ) -> Result<(), ConferenceError> {
        match architecture.engine() {
            None => self.mesh.mute_media(selector, muted).await,
            Some(kind) => self.engine_link(kind).mute_media(selector, muted).await,
        }
    }

    fn engine_link(&self, kind: EngineKind) -> &ConnectionHandle {
        match kind {
            EngineKind::Sfu => &self.sfu,
            EngineKind::Mcu => &self.mcu,
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.mesh.close_all(true).await {
            debug!(target: "conf.actor.conference", name = %self.name, error = %e, "Mesh already gone");
        }
        self.sfu.close().await;
        self.mcu.close().await;
        self.mesh.cancel();
    }
}
