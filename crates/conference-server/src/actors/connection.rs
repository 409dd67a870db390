//! `ConnectionActor` - one negotiated link to one remote peer.
//!
//! Each `ConnectionActor`:
//! - Runs the perfect-negotiation state machine against a [`PeerTransport`]
//! - Exchanges `sdp`, `ice`, `receiver:stop`, `track:meta` and
//!   `connection:close` with the peer over the owner's [`Signaler`]
//! - Tracks the local legs it sends and the remote legs it receives
//!
//! # Lifecycle
//!
//! 1. Spawned when the peer becomes known (roster message or explicit connect)
//! 2. Runs until closed locally, closed by the peer, ICE disconnects, or the
//!    signaling channel closes
//! 3. Emits [`ConnectionEvent::Closed`] exactly once and is never resurrected

use crate::config::NegotiationTimings;
use crate::errors::ConferenceError;
use crate::media::{MediaSelector, MediaTrack, RemoteTrack, TrackMeta};
use crate::negotiation::{
    on_negotiation_needed, on_remote_description, LocalDecision, NegotiationState,
    RemoteDecision, Transition,
};
use crate::observability::metrics::{self as prom, negotiation_event};
use crate::signaling::{Address, Message, MessageType, Signaler, SignalerEvent};
use crate::transport::{
    IceCandidate, IceConnectionState, PeerTransport, SdpKind, SessionDescription, TransportEvent,
    TransportParts,
};

use super::messages::{ConnectionEvent, ConnectionMessage, ConnectionSnapshot};
use super::metrics::{ActorType, MailboxMonitor};

use common::types::ConnectionId;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Capacity of the event bus. Slow subscribers observe `Lagged`.
const CONNECTION_EVENT_CAPACITY: usize = 64;

/// Fixed parameters of one link.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Own display name (or engine address).
    pub name: String,
    /// Remote display name (or engine address).
    pub peer: String,
    /// Polite side of the link. Fixed for the connection's lifetime.
    pub is_yielding: bool,
    pub timings: NegotiationTimings,
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel_token: CancellationToken,
    id: ConnectionId,
    peer: String,
}

impl ConnectionHandle {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Start sending local tracks. Tracks already sent are skipped.
    pub async fn add_media(&self, tracks: Vec<MediaTrack>) -> Result<(), ConferenceError> {
        self.mutate(|respond_to| ConnectionMessage::AddMedia { tracks, respond_to })
            .await
    }

    /// Stop sending the selected tracks and ask the peer to stop receiving them.
    pub async fn remove_media(&self, selector: MediaSelector) -> Result<(), ConferenceError> {
        self.mutate(|respond_to| ConnectionMessage::RemoveMedia {
            selector,
            respond_to,
        })
        .await
    }

    pub async fn mute_media(
        &self,
        selector: MediaSelector,
        muted: bool,
    ) -> Result<(), ConferenceError> {
        self.mutate(|respond_to| ConnectionMessage::MuteMedia {
            selector,
            muted,
            respond_to,
        })
        .await
    }

    /// Trigger a negotiation round.
    pub async fn negotiate(&self) -> Result<(), ConferenceError> {
        self.mutate(|respond_to| ConnectionMessage::Negotiate { respond_to })
            .await
    }

    /// Fails with `ChannelClosed` once the connection is gone.
    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, ConferenceError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|_| ConferenceError::ChannelClosed)?;

        rx.await.map_err(|_| ConferenceError::ChannelClosed)
    }

    /// Close the link, telling the peer. A no-op on a closed connection.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConnectionMessage::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Tear the link down without telling the peer.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // Operations on a closed connection succeed without effect.
    async fn mutate<F>(&self, build: F) -> Result<(), ConferenceError>
    where
        F: FnOnce(oneshot::Sender<Result<(), ConferenceError>>) -> ConnectionMessage,
    {
        if self.is_closed() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.sender.send(build(tx)).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

/// A local track and how it is wired into the transport.
#[derive(Debug)]
struct LocalLeg {
    track: MediaTrack,
    /// Bound transceiver, once negotiated.
    mid: Option<String>,
    muted: bool,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    id: ConnectionId,
    config: ConnectionConfig,
    peer_address: Address,
    own_address: Address,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    signaler: Signaler,
    inbound: mpsc::UnboundedReceiver<SignalerEvent>,
    transport: Box<dyn PeerTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_events_open: bool,
    events: broadcast::Sender<ConnectionEvent>,
    forward: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    mailbox: MailboxMonitor,

    state: NegotiationState,
    offering: bool,
    ignored_offer: bool,
    /// A negotiation was requested while a round was in flight.
    negotiation_pending: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    jam_deadline: Option<Instant>,

    added_tracks: Vec<LocalLeg>,
    received_tracks: Vec<RemoteTrack>,
    received_streams: BTreeSet<String>,
    /// `track:meta` for legs that have not arrived yet, by mid.
    pending_meta: HashMap<String, Value>,
}

impl ConnectionActor {
    /// Spawn a connection actor.
    ///
    /// Events are published on the handle's bus and, when `forward` is given,
    /// also pushed to the owner.
    pub fn spawn(
        config: ConnectionConfig,
        signaler: Signaler,
        parts: TransportParts,
        forward: Option<mpsc::UnboundedSender<ConnectionEvent>>,
        cancel_token: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        let (transport, transport_events) = parts;
        let id = ConnectionId::new();

        let handle = ConnectionHandle {
            sender,
            events: events.clone(),
            cancel_token: cancel_token.clone(),
            id,
            peer: config.peer.clone(),
        };

        let actor = Self {
            id,
            peer_address: Address::from(config.peer.as_str()),
            own_address: Address::from(config.name.as_str()),
            mailbox: MailboxMonitor::new(
                ActorType::Connection,
                format!("{}->{}", config.name, config.peer),
            ),
            config,
            receiver,
            cancel_token,
            inbound: signaler.subscribe(),
            signaler,
            transport,
            transport_events,
            transport_events_open: true,
            events,
            forward,
            state: NegotiationState::Stable,
            offering: false,
            ignored_offer: false,
            negotiation_pending: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            jam_deadline: None,
            added_tracks: Vec::new(),
            received_tracks: Vec::new(),
            received_streams: BTreeSet::new(),
            pending_meta: HashMap::new(),
        };

        prom::connection_opened();
        let task = tokio::spawn(actor.run());

        (handle, task)
    }

    #[instrument(
        skip_all,
        name = "conf.actor.connection",
        fields(connection_id = %self.id, name = %self.config.name, peer = %self.config.peer)
    )]
    async fn run(mut self) {
        debug!(
            target: "conf.actor.connection",
            name = %self.config.name,
            peer = %self.config.peer,
            is_yielding = self.config.is_yielding,
            "Connection actor started"
        );

        loop {
            let jam_deadline = self.jam_deadline;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "conf.actor.connection", peer = %self.config.peer, "Connection cancelled");
                    self.shutdown(false).await;
                }

                message = self.receiver.recv() => {
                    match message {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                        }
                        None => self.shutdown(false).await,
                    }
                }

                event = self.inbound.recv() => {
                    match event {
                        Some(SignalerEvent::Message(message)) => {
                            if message.sender == self.peer_address {
                                self.handle_signal(message).await;
                            }
                        }
                        Some(SignalerEvent::Closed) | None => {
                            debug!(target: "conf.actor.connection", peer = %self.config.peer, "Signaling channel closed");
                            self.shutdown(false).await;
                        }
                    }
                }

                event = self.transport_events.recv(), if self.transport_events_open => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => self.transport_events_open = false,
                    }
                }

                () = jam_timer(jam_deadline) => {
                    self.on_jammed().await;
                }
            }

            if self.state == NegotiationState::Closed {
                break;
            }
        }

        info!(
            target: "conf.actor.connection",
            peer = %self.config.peer,
            messages_processed = self.mailbox.messages_processed(),
            "Connection actor stopped"
        );
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::AddMedia { tracks, respond_to } => {
                let result = self.add_media(tracks).await;
                let _ = respond_to.send(result);
            }
            ConnectionMessage::RemoveMedia {
                selector,
                respond_to,
            } => {
                let result = self.remove_media(&selector).await;
                let _ = respond_to.send(result);
            }
            ConnectionMessage::MuteMedia {
                selector,
                muted,
                respond_to,
            } => {
                let result = self.mute_media(&selector, muted).await;
                let _ = respond_to.send(result);
            }
            ConnectionMessage::Negotiate { respond_to } => {
                self.on_negotiation_needed().await;
                let _ = respond_to.send(Ok(()));
            }
            ConnectionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            ConnectionMessage::Close { respond_to } => {
                self.shutdown(true).await;
                let _ = respond_to.send(());
            }
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            peer: self.config.peer.clone(),
            name: self.config.name.clone(),
            state: self.state,
            is_yielding: self.config.is_yielding,
            offering: self.offering,
            ignored_offer: self.ignored_offer,
            added_tracks: self
                .added_tracks
                .iter()
                .map(|leg| leg.track.id.clone())
                .collect(),
            muted_tracks: self
                .added_tracks
                .iter()
                .filter(|leg| leg.muted)
                .map(|leg| leg.track.id.clone())
                .collect(),
            received_tracks: self.received_tracks.clone(),
            received_streams: self.received_streams.iter().cloned().collect(),
            pending_candidates: self.pending_candidates.len(),
        }
    }

    // ------------------------------------------------------------------------
    // Local media
    // ------------------------------------------------------------------------

    async fn add_media(&mut self, tracks: Vec<MediaTrack>) -> Result<(), ConferenceError> {
        for track in tracks {
            if self.added_tracks.iter().any(|leg| leg.track.id == track.id) {
                continue;
            }
            self.transport.add_track(&track).await?;
            debug!(target: "conf.actor.connection", peer = %self.config.peer, track_id = %track.id, "Track added");
            self.added_tracks.push(LocalLeg {
                track,
                mid: None,
                muted: false,
            });
        }
        Ok(())
    }

    async fn remove_media(&mut self, selector: &MediaSelector) -> Result<(), ConferenceError> {
        let (removed, kept): (Vec<LocalLeg>, Vec<LocalLeg>) = std::mem::take(&mut self.added_tracks)
            .into_iter()
            .partition(|leg| selector.matches(&leg.track));
        self.added_tracks = kept;

        for leg in removed {
            let mid = self.transport.remove_track(&leg.track.id).await?;
            if let Some(mid) = mid.or(leg.mid) {
                self.send(MessageType::ReceiverStop, Value::String(mid))?;
            }
            debug!(target: "conf.actor.connection", peer = %self.config.peer, track_id = %leg.track.id, "Track removed");
        }
        Ok(())
    }

    async fn mute_media(
        &mut self,
        selector: &MediaSelector,
        muted: bool,
    ) -> Result<(), ConferenceError> {
        for leg in self
            .added_tracks
            .iter_mut()
            .filter(|leg| selector.matches(&leg.track) && leg.muted != muted)
        {
            let replacement = if muted { None } else { Some(&leg.track) };
            self.transport
                .replace_track(&leg.track.id, replacement)
                .await?;
            leg.muted = muted;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    fn transition(&mut self, transition: Transition) -> Result<(), ConferenceError> {
        let next = self
            .state
            .apply(transition)
            .map_err(|e| ConferenceError::Negotiation(e.to_string()))?;
        if next == self.state {
            return Ok(());
        }
        self.state = next;

        self.jam_deadline = if next == NegotiationState::HaveLocalOffer {
            Some(Instant::now() + jam_window(self.config.timings))
        } else {
            None
        };

        trace!(target: "conf.actor.connection", peer = %self.config.peer, state = %next, "Negotiation state changed");
        self.emit(ConnectionEvent::StateChanged {
            peer: self.config.peer.clone(),
            state: next,
        });
        Ok(())
    }

    async fn on_negotiation_needed(&mut self) {
        match on_negotiation_needed(self.state, self.offering) {
            LocalDecision::Offer => self.make_offer().await,
            LocalDecision::Defer => self.negotiation_pending = true,
            LocalDecision::Drop => {}
        }
    }

    async fn make_offer(&mut self) {
        self.negotiation_pending = false;
        self.offering = true;
        let result = self.try_offer().await;
        self.offering = false;

        match result {
            Ok(()) => prom::record_negotiation_event(negotiation_event::OFFER),
            Err(e) => {
                prom::record_negotiation_event(negotiation_event::FAILURE);
                warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Offer attempt abandoned");
            }
        }
    }

    async fn try_offer(&mut self) -> Result<(), ConferenceError> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        self.transition(Transition::LocalOffer)?;
        self.send(MessageType::Sdp, serde_json::to_value(&offer)?)
    }

    async fn handle_remote_description(&mut self, description: SessionDescription) {
        let decision = on_remote_description(
            self.state,
            self.offering,
            self.config.is_yielding,
            description.kind,
        );
        self.ignored_offer = decision == RemoteDecision::Ignore;

        let result = match decision {
            RemoteDecision::Ignore => {
                prom::record_negotiation_event(negotiation_event::GLARE_IGNORED);
                debug!(target: "conf.actor.connection", peer = %self.config.peer, "Colliding offer ignored");
                return;
            }
            RemoteDecision::Reject => {
                debug!(
                    target: "conf.actor.connection",
                    peer = %self.config.peer,
                    state = %self.state,
                    kind = ?description.kind,
                    "Session description not applicable, dropped"
                );
                return;
            }
            RemoteDecision::RollbackAndAccept => {
                prom::record_negotiation_event(negotiation_event::GLARE_ROLLBACK);
                debug!(target: "conf.actor.connection", peer = %self.config.peer, "Colliding offer accepted after rollback");
                match self.rollback().await {
                    Ok(()) => {
                        self.negotiation_pending = true;
                        self.accept(description).await
                    }
                    Err(e) => Err(e),
                }
            }
            RemoteDecision::Accept => self.accept(description).await,
        };

        if let Err(e) = result {
            prom::record_negotiation_event(negotiation_event::FAILURE);
            warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Remote description abandoned");
            return;
        }

        if self.state == NegotiationState::Stable {
            self.on_stable().await;
        }
    }

    async fn rollback(&mut self) -> Result<(), ConferenceError> {
        self.transport.rollback().await?;
        self.transition(Transition::Rollback)
    }

    async fn accept(&mut self, description: SessionDescription) -> Result<(), ConferenceError> {
        self.transport.set_remote_description(&description).await?;
        self.remote_description_set = true;

        match description.kind {
            SdpKind::Offer => self.transition(Transition::RemoteOffer)?,
            SdpKind::Answer => self.transition(Transition::RemoteAnswer)?,
        }

        self.flush_candidates().await;

        if description.kind == SdpKind::Offer {
            let answer = self.transport.create_answer().await?;
            self.transport.set_local_description(&answer).await?;
            self.transition(Transition::LocalAnswer)?;
            self.send(MessageType::Sdp, serde_json::to_value(&answer)?)?;
            prom::record_negotiation_event(negotiation_event::ANSWER);
        }
        Ok(())
    }

    /// Back in `stable`: announce newly bound legs, then run a deferred round.
    async fn on_stable(&mut self) {
        let mut announcements = Vec::new();
        for leg in self.added_tracks.iter_mut().filter(|leg| leg.mid.is_none()) {
            if let Some(mid) = self.transport.mid_of(&leg.track.id).await {
                if let Some(meta) = &leg.track.meta {
                    announcements.push(TrackMeta {
                        mid: mid.clone(),
                        meta: meta.clone(),
                    });
                }
                leg.mid = Some(mid);
            }
        }
        for meta in announcements {
            let sent = serde_json::to_value(&meta)
                .map_err(ConferenceError::from)
                .and_then(|data| self.send(MessageType::TrackMeta, data));
            if let Err(e) = sent {
                debug!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "track:meta not sent");
            }
        }

        if self.negotiation_pending {
            self.make_offer().await;
        }
    }

    async fn on_jammed(&mut self) {
        self.jam_deadline = None;
        if self.state != NegotiationState::HaveLocalOffer {
            return;
        }

        prom::record_negotiation_event(negotiation_event::JAMMED_RESTART);
        warn!(target: "conf.actor.connection", peer = %self.config.peer, "Negotiation jammed, restarting");

        if let Err(e) = self.rollback().await {
            warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Rollback of jammed offer failed");
            return;
        }
        if let Err(e) = self.transport.restart_ice().await {
            warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "ICE restart failed");
        }
        self.negotiation_pending = true;
        self.on_stable().await;
    }

    // ------------------------------------------------------------------------
    // ICE
    // ------------------------------------------------------------------------

    /// Candidates are always attempted; while an offer is being ignored,
    /// failures belong to that offer and are expected.
    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
            if self.ignored_offer {
                trace!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Candidate of ignored offer rejected");
            } else {
                warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "ICE candidate rejected");
            }
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Buffered ICE candidate rejected");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_signal(&mut self, message: Message) {
        match message.kind {
            MessageType::Sdp => match serde_json::from_value::<SessionDescription>(message.data) {
                Ok(description) => self.handle_remote_description(description).await,
                Err(e) => {
                    debug!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Malformed sdp payload");
                }
            },
            MessageType::Ice => match serde_json::from_value::<IceCandidate>(message.data) {
                Ok(candidate) => self.handle_candidate(candidate).await,
                Err(e) => {
                    debug!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Malformed ice payload");
                }
            },
            MessageType::ReceiverStop => {
                if let Some(mid) = message.data.as_str() {
                    self.stop_received(mid);
                }
            }
            MessageType::TrackMeta => match serde_json::from_value::<TrackMeta>(message.data) {
                Ok(meta) => self.apply_meta(meta),
                Err(e) => {
                    debug!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Malformed track:meta payload");
                }
            },
            MessageType::ConnectionClose => {
                debug!(target: "conf.actor.connection", peer = %self.config.peer, "Peer closed the connection");
                for track in std::mem::take(&mut self.received_tracks) {
                    self.emit(ConnectionEvent::TrackRemoved {
                        peer: self.config.peer.clone(),
                        track,
                    });
                }
                self.shutdown(false).await;
            }
            _ => {}
        }
    }

    fn stop_received(&mut self, mid: &str) {
        let Some(index) = self.received_tracks.iter().position(|t| t.mid == mid) else {
            return;
        };
        let track = self.received_tracks.remove(index);
        self.emit(ConnectionEvent::TrackRemoved {
            peer: self.config.peer.clone(),
            track,
        });
    }

    fn apply_meta(&mut self, meta: TrackMeta) {
        match self.received_tracks.iter_mut().find(|t| t.mid == meta.mid) {
            Some(track) => {
                track.meta = Some(meta.meta);
                let track = track.clone();
                self.emit(ConnectionEvent::TrackUpdated {
                    peer: self.config.peer.clone(),
                    track,
                });
            }
            None => {
                self.pending_meta.insert(meta.mid, meta.meta);
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::NegotiationNeeded => self.on_negotiation_needed().await,
            TransportEvent::LocalCandidate(candidate) => match serde_json::to_value(&candidate) {
                Ok(data) => {
                    if let Err(e) = self.send(MessageType::Ice, data) {
                        debug!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Candidate not sent");
                    }
                }
                Err(e) => {
                    warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "Candidate not encodable");
                }
            },
            TransportEvent::IceConnectionStateChanged(IceConnectionState::Disconnected) => {
                debug!(target: "conf.actor.connection", peer = %self.config.peer, "ICE disconnected");
                self.shutdown(false).await;
            }
            TransportEvent::IceConnectionStateChanged(IceConnectionState::Failed) => {
                prom::record_negotiation_event(negotiation_event::ICE_RESTART);
                warn!(target: "conf.actor.connection", peer = %self.config.peer, "ICE failed, restarting");
                if let Err(e) = self.transport.restart_ice().await {
                    warn!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "ICE restart failed");
                }
                self.on_negotiation_needed().await;
            }
            TransportEvent::IceConnectionStateChanged(state) => {
                trace!(target: "conf.actor.connection", peer = %self.config.peer, ice_state = ?state, "ICE state");
            }
            TransportEvent::TrackAdded(mut track) => {
                if let Some(meta) = self.pending_meta.remove(&track.mid) {
                    track.meta = Some(meta);
                }
                self.received_streams.extend(track.streams.iter().cloned());
                self.received_tracks.push(track.clone());
                self.emit(ConnectionEvent::TrackAdded {
                    peer: self.config.peer.clone(),
                    track,
                });
            }
            TransportEvent::TrackEnded { mid } => self.stop_received(&mid),
        }
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    fn send(&self, kind: MessageType, data: Value) -> Result<(), ConferenceError> {
        self.signaler.send(
            Message::new(kind, data)
                .to(self.peer_address.clone())
                .sent_by(self.own_address.clone()),
        )
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(forward) = &self.forward {
            let _ = forward.send(event.clone());
        }
        let _ = self.events.send(event);
    }

    /// Enter `closed`. Runs once; later calls are no-ops.
    async fn shutdown(&mut self, notify_peer: bool) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if notify_peer {
            if let Err(e) = self.send(MessageType::ConnectionClose, json!("immediately")) {
                debug!(target: "conf.actor.connection", peer = %self.config.peer, error = %e, "connection:close not delivered");
            }
        }
        if let Err(e) = self.transition(Transition::Close) {
            debug!(target: "conf.actor.connection", error = %e, "Close transition refused");
        }
        self.state = NegotiationState::Closed;
        self.jam_deadline = None;
        self.pending_candidates.clear();
        self.transport.close().await;

        self.emit(ConnectionEvent::Closed {
            peer: self.config.peer.clone(),
            id: self.id,
        });
        prom::connection_closed();
        self.cancel_token.cancel();

        debug!(target: "conf.actor.connection", peer = %self.config.peer, "Connection closed");
    }
}

/// Randomized jammed-negotiation window.
fn jam_window(timings: NegotiationTimings) -> Duration {
    let jitter_ms = u64::try_from(timings.jitter.as_millis()).unwrap_or(u64::MAX);
    let extra = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    timings.timeout + Duration::from_millis(extra)
}

async fn jam_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
