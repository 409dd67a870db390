//! `ConnectionManagerActor` - the set of connections of one endpoint.
//!
//! A manager owns at most one [`ConnectionHandle`] per known peer and the
//! media published to all of them. It follows the roster notices the server
//! sends (`user:connected`, `user:disconnected`, `user:list`) and fans every
//! local media change out to each managed connection.
//!
//! Participants run a manager with [`YieldPolicy::ByName`]; a media engine
//! runs one named `@sfu`/`@mcu` with [`YieldPolicy::Always`].

use crate::config::NegotiationTimings;
use crate::errors::ConferenceError;
use crate::media::{MediaSelector, MediaTrack};
use crate::negotiation::YieldPolicy;
use crate::relay::names_in;
use crate::signaling::{Address, Message, MessageType, Signaler, SignalerEvent};
use crate::transport::TransportFactory;

use super::connection::{ConnectionActor, ConnectionConfig, ConnectionHandle};
use super::messages::{ConnectionEvent, ManagerEvent, ManagerMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the manager mailbox.
const MANAGER_CHANNEL_BUFFER: usize = 200;

const MANAGER_EVENT_CAPACITY: usize = 128;

/// How long a removed connection gets to finish before its task is abandoned.
const CONNECTION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed parameters of a manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Own display name, or the engine address.
    pub name: String,
    pub policy: YieldPolicy,
    pub timings: NegotiationTimings,
}

/// Handle to a `ConnectionManagerActor`.
#[derive(Clone, Debug)]
pub struct ConnectionManagerHandle {
    sender: mpsc::Sender<ManagerMessage>,
    events: broadcast::Sender<ManagerEvent>,
    cancel_token: CancellationToken,
    name: String,
}

impl ConnectionManagerHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish tracks to every current and future connection.
    pub async fn add_media(&self, tracks: Vec<MediaTrack>) -> Result<(), ConferenceError> {
        self.request(|respond_to| ManagerMessage::AddMedia { tracks, respond_to })
            .await?
    }

    /// Unpublish the selected tracks everywhere.
    pub async fn remove_media(&self, selector: MediaSelector) -> Result<(), ConferenceError> {
        self.request(|respond_to| ManagerMessage::RemoveMedia {
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
        self.request(|respond_to| ManagerMessage::MuteMedia {
            selector,
            muted,
            respond_to,
        })
        .await?
    }

    /// Create a connection to `peer` without waiting for a roster notice.
    /// Returns the existing connection when there is one.
    pub async fn connect(&self, peer: impl Into<String>) -> Result<ConnectionHandle, ConferenceError> {
        let peer = peer.into();
        self.request(|respond_to| ManagerMessage::Connect { peer, respond_to })
            .await?
    }

    pub async fn get(&self, peer: impl Into<String>) -> Result<Option<ConnectionHandle>, ConferenceError> {
        let peer = peer.into();
        self.request(|respond_to| ManagerMessage::Get { peer, respond_to })
            .await
    }

    /// Peers with a live connection, sorted.
    pub async fn users(&self) -> Result<Vec<String>, ConferenceError> {
        self.request(|respond_to| ManagerMessage::Users { respond_to })
            .await
    }

    /// Close every connection; `remove` also forgets them right away.
    pub async fn close_all(&self, remove: bool) -> Result<(), ConferenceError> {
        self.request(|respond_to| ManagerMessage::CloseAll { remove, respond_to })
            .await
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T, F>(&self, build: F) -> Result<T, ConferenceError>
    where
        F: FnOnce(oneshot::Sender<T>) -> ManagerMessage,
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

struct ManagedConnection {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
}

/// The `ConnectionManagerActor` implementation.
pub struct ConnectionManagerActor {
    config: ManagerConfig,
    signaler: Signaler,
    inbound: mpsc::UnboundedReceiver<SignalerEvent>,
    factory: Arc<dyn TransportFactory>,
    receiver: mpsc::Receiver<ManagerMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<ManagerEvent>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    connections: HashMap<String, ManagedConnection>,
    published: Vec<MediaTrack>,
    muted: BTreeSet<String>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionManagerActor {
    /// Spawn a manager reading roster notices from `signaler`.
    pub fn spawn(
        config: ManagerConfig,
        signaler: Signaler,
        factory: Arc<dyn TransportFactory>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionManagerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MANAGER_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(MANAGER_EVENT_CAPACITY);
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();

        let handle = ConnectionManagerHandle {
            sender,
            events: events.clone(),
            cancel_token: cancel_token.clone(),
            name: config.name.clone(),
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Manager, config.name.clone()),
            config,
            inbound: signaler.subscribe(),
            signaler,
            factory,
            receiver,
            cancel_token,
            events,
            connection_tx,
            connection_rx,
            connections: HashMap::new(),
            published: Vec::new(),
            muted: BTreeSet::new(),
            metrics,
        };

        let task = tokio::spawn(actor.run());
        (handle, task)
    }

    #[instrument(skip_all, name = "conf.actor.manager", fields(name = %self.config.name))]
    async fn run(mut self) {
        debug!(target: "conf.actor.manager", name = %self.config.name, "Connection manager started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "conf.actor.manager", name = %self.config.name, "Connection manager cancelled");
                    break;
                }

                message = self.receiver.recv() => {
                    match message {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                        }
                        None => break,
                    }
                }

                event = self.inbound.recv() => {
                    match event {
                        Some(SignalerEvent::Message(message)) => self.handle_signal(message).await,
                        Some(SignalerEvent::Closed) | None => {
                            debug!(target: "conf.actor.manager", name = %self.config.name, "Signaling channel closed");
                            break;
                        }
                    }
                }

                Some(event) = self.connection_rx.recv() => {
                    self.handle_connection_event(event);
                }
            }
        }

        for (_, managed) in self.connections.drain() {
            managed.handle.cancel();
        }

        info!(
            target: "conf.actor.manager",
            name = %self.config.name,
            messages_processed = self.mailbox.messages_processed(),
            "Connection manager stopped"
        );
    }

    async fn handle_message(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::AddMedia { tracks, respond_to } => {
                let result = self.add_media(tracks).await;
                let _ = respond_to.send(result);
            }
            ManagerMessage::RemoveMedia {
                selector,
                respond_to,
            } => {
                let result = self.remove_media(&selector).await;
                let _ = respond_to.send(result);
            }
            ManagerMessage::MuteMedia {
                selector,
                muted,
                respond_to,
            } => {
                let result = self.mute_media(&selector, muted).await;
                let _ = respond_to.send(result);
            }
            ManagerMessage::Connect { peer, respond_to } => {
                let result = self.ensure_connection(&peer).await.map(|(handle, _)| handle);
                let _ = respond_to.send(result);
            }
            ManagerMessage::Get { peer, respond_to } => {
                let handle = self.connections.get(&peer).map(|m| m.handle.clone());
                let _ = respond_to.send(handle);
            }
            ManagerMessage::Users { respond_to } => {
                let mut users: Vec<String> = self.connections.keys().cloned().collect();
                users.sort();
                let _ = respond_to.send(users);
            }
            ManagerMessage::CloseAll { remove, respond_to } => {
                self.close_all(remove).await;
                let _ = respond_to.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Roster
    // ------------------------------------------------------------------------

    async fn handle_signal(&mut self, message: Message) {
        if message.sender != Address::Server {
            return;
        }

        match message.kind {
            MessageType::UserConnected => {
                if let Some(peer) = message.data_str() {
                    self.peer_connected(peer).await;
                }
            }
            MessageType::UserList => {
                for peer in names_in(&message.data) {
                    self.peer_connected(&peer).await;
                }
            }
            MessageType::UserDisconnected => {
                if let Some(peer) = message.data_str() {
                    self.peer_disconnected(peer);
                }
            }
            _ => {}
        }
    }

    async fn peer_connected(&mut self, peer: &str) {
        match self.ensure_connection(peer).await {
            Ok((_, true)) => {
                let _ = self.events.send(ManagerEvent::UserConnected {
                    peer: peer.to_string(),
                });
            }
            Ok((_, false)) => {}
            Err(e) => {
                warn!(target: "conf.actor.manager", name = %self.config.name, peer = %peer, error = %e, "Could not connect to peer");
            }
        }
    }

    fn peer_disconnected(&mut self, peer: &str) {
        let Some(managed) = self.connections.remove(peer) else {
            return;
        };
        managed.handle.cancel();
        self.watch_cleanup(peer.to_string(), managed.task);

        debug!(target: "conf.actor.manager", name = %self.config.name, peer = %peer, "Peer disconnected");
        let _ = self.events.send(ManagerEvent::UserDisconnected {
            peer: peer.to_string(),
        });
    }

    /// Returns the connection to `peer` and whether it was created now.
    async fn ensure_connection(
        &mut self,
        peer: &str,
    ) -> Result<(ConnectionHandle, bool), ConferenceError> {
        if peer == self.config.name || peer.is_empty() {
            return Err(ConferenceError::BadRequest(format!(
                "cannot connect '{}' to '{peer}'",
                self.config.name
            )));
        }
        if let Some(managed) = self.connections.get(peer) {
            return Ok((managed.handle.clone(), false));
        }

        let parts = self.factory.create(&self.config.name, peer)?;
        let (handle, task) = ConnectionActor::spawn(
            ConnectionConfig {
                name: self.config.name.clone(),
                peer: peer.to_string(),
                is_yielding: self.config.policy.is_yielding(&self.config.name, peer),
                timings: self.config.timings,
            },
            self.signaler.clone(),
            parts,
            Some(self.connection_tx.clone()),
            self.cancel_token.child_token(),
        );

        self.connections.insert(
            peer.to_string(),
            ManagedConnection {
                handle: handle.clone(),
                task,
            },
        );
        debug!(
            target: "conf.actor.manager",
            name = %self.config.name,
            peer = %peer,
            connections = self.connections.len(),
            "Connection created"
        );

        if !self.published.is_empty() {
            handle.add_media(self.published.clone()).await?;
        }
        for track_id in &self.muted {
            handle
                .mute_media(MediaSelector::Track(track_id.clone()), true)
                .await?;
        }

        Ok((handle, true))
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if let ConnectionEvent::Closed { peer, id } = &event {
            if self
                .connections
                .get(peer)
                .is_some_and(|managed| managed.handle.id() == *id)
            {
                if let Some(managed) = self.connections.remove(peer) {
                    self.watch_cleanup(peer.clone(), managed.task);
                }
            }
        }
        let _ = self.events.send(ManagerEvent::Connection(event));
    }

    // Wait for a removed connection in the background so the loop never blocks.
    fn watch_cleanup(&self, peer: String, task: JoinHandle<()>) {
        let metrics = Arc::clone(&self.metrics);
        let name = self.config.name.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(CONNECTION_CLEANUP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => metrics.record_panic(ActorType::Connection),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(target: "conf.actor.manager", name = %name, peer = %peer, "Connection task cleanup timed out");
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Media fan-out
    // ------------------------------------------------------------------------

    async fn add_media(&mut self, tracks: Vec<MediaTrack>) -> Result<(), ConferenceError> {
        let fresh: Vec<MediaTrack> = tracks
            .into_iter()
            .filter(|track| !self.published.iter().any(|p| p.id == track.id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.published.extend(fresh.iter().cloned());

        let mut outcome = Ok(());
        for (peer, managed) in &self.connections {
            if let Err(e) = managed.handle.add_media(fresh.clone()).await {
                warn!(target: "conf.actor.manager", name = %self.config.name, peer = %peer, error = %e, "add_media failed");
                outcome = outcome.and(Err(e));
            }
        }
        outcome
    }

    async fn remove_media(&mut self, selector: &MediaSelector) -> Result<(), ConferenceError> {
        let muted = &mut self.muted;
        self.published.retain(|track| {
            let keep = !selector.matches(track);
            if !keep {
                muted.remove(&track.id);
            }
            keep
        });

        let mut outcome = Ok(());
        for (peer, managed) in &self.connections {
            if let Err(e) = managed.handle.remove_media(selector.clone()).await {
                warn!(target: "conf.actor.manager", name = %self.config.name, peer = %peer, error = %e, "remove_media failed");
                outcome = outcome.and(Err(e));
            }
        }
        outcome
    }

    async fn mute_media(
        &mut self,
        selector: &MediaSelector,
        muted: bool,
    ) -> Result<(), ConferenceError> {
        for track in self.published.iter().filter(|t| selector.matches(t)) {
            if muted {
                self.muted.insert(track.id.clone());
            } else {
                self.muted.remove(&track.id);
            }
        }

        let mut outcome = Ok(());
        for (peer, managed) in &self.connections {
            if let Err(e) = managed.handle.mute_media(selector.clone(), muted).await {
                warn!(target: "conf.actor.manager", name = %self.config.name, peer = %peer, error = %e, "mute_media failed");
                outcome = outcome.and(Err(e));
            }
        }
        outcome
    }

    async fn close_all(&mut self, remove: bool) {
        for managed in self.connections.values() {
            managed.handle.close().await;
        }
        if remove {
            let drained: Vec<(String, ManagedConnection)> = self.connections.drain().collect();
            for (peer, managed) in drained {
                self.watch_cleanup(peer, managed.task);
            }
        }
    }
}
