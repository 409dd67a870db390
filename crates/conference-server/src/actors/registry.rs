//! `RoomRegistryActor` - singleton owner of every room.
//!
//! The registry is the top-level actor of the server:
//!
//! - Creates rooms (unique names, capacity cap, engine provisioning)
//! - Indexes rooms by id and by name
//! - Tracks which room each participant is in and the participant's
//!   signaling socket
//! - Removes rooms, whether closed by their creator, by an operator or by
//!   their own empty-room timer
//! - Announces public rooms to every connected socket
//!
//! # Graceful Shutdown
//!
//! On cancellation every room is closed and its task awaited (bounded).

use crate::config::{Config, MAX_EMPTY_MINUTES_LIMIT};
use crate::engine::{EngineKind, EngineProvisioner};
use crate::errors::ConferenceError;
use crate::relay;
use crate::signaling::{Message, Signaler};

use super::messages::{Participant, RegistryMessage, RegistryStatus, RoomInfo, RoomSettings};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{EngineLegs, RoomActor, RoomHandle, RoomSpec};

use common::secret::SecretString;
use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a removed room's task gets to finish before we stop waiting.
const ROOM_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry limits and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub max_rooms: usize,
    pub default_max_members: Option<usize>,
    pub default_max_empty_minutes: u64,
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_rooms: config.max_rooms,
            default_max_members: config.default_max_members,
            default_max_empty_minutes: config.default_max_empty_minutes,
        }
    }
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry and return a handle to it.
    #[must_use]
    pub fn new(
        config: RegistryConfig,
        provisioner: Arc<dyn EngineProvisioner>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let actor = RoomRegistryActor {
            config,
            receiver,
            closed_tx,
            closed_rx,
            cancel_token: cancel_token.clone(),
            provisioner,
            rooms: HashMap::new(),
            names: HashMap::new(),
            membership: HashMap::new(),
            sockets: HashMap::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Create a room owned by `creator`.
    pub async fn create(
        &self,
        creator: Participant,
        settings: RoomSettings,
    ) -> Result<RoomInfo, ConferenceError> {
        self.request(|respond_to| RegistryMessage::Create {
            creator,
            settings,
            respond_to,
        })
        .await?
    }

    pub async fn find_by_id(&self, id: RoomId) -> Result<Option<RoomHandle>, ConferenceError> {
        self.request(|respond_to| RegistryMessage::FindById { id, respond_to })
            .await
    }

    pub async fn find_by_name(
        &self,
        name: impl Into<String>,
    ) -> Result<Option<RoomHandle>, ConferenceError> {
        let name = name.into();
        self.request(|respond_to| RegistryMessage::FindByName { name, respond_to })
            .await
    }

    /// Info of every public room.
    pub async fn list_public(&self) -> Result<Vec<RoomInfo>, ConferenceError> {
        self.request(|respond_to| RegistryMessage::ListPublic { respond_to })
            .await
    }

    /// Info of one room. Private rooms require the password.
    pub async fn info(
        &self,
        id: RoomId,
        password: Option<SecretString>,
    ) -> Result<RoomInfo, ConferenceError> {
        self.request(|respond_to| RegistryMessage::Info {
            id,
            password,
            respond_to,
        })
        .await?
    }

    /// Join a room over the participant's registered socket.
    pub async fn join(
        &self,
        id: RoomId,
        participant: Participant,
        password: Option<SecretString>,
    ) -> Result<RoomInfo, ConferenceError> {
        self.request(|respond_to| RegistryMessage::Join {
            id,
            participant,
            password,
            respond_to,
        })
        .await?
    }

    pub async fn leave(&self, id: RoomId, participant: ParticipantId) -> Result<(), ConferenceError> {
        self.request(|respond_to| RegistryMessage::Leave {
            id,
            participant,
            respond_to,
        })
        .await?
    }

    /// Close a room. Only its creator may do this.
    pub async fn close(&self, id: RoomId, requester: ParticipantId) -> Result<(), ConferenceError> {
        self.request(|respond_to| RegistryMessage::Close {
            id,
            requester,
            respond_to,
        })
        .await?
    }

    /// Close and forget a room regardless of who asks.
    pub async fn remove(&self, id: RoomId) -> Result<(), ConferenceError> {
        self.request(|respond_to| RegistryMessage::Remove { id, respond_to })
            .await?
    }

    /// Record the signaling socket of a participant, replacing any older one.
    pub async fn register_socket(
        &self,
        participant: Participant,
        signaler: Signaler,
    ) -> Result<(), ConferenceError> {
        self.request(|respond_to| RegistryMessage::RegisterSocket {
            participant,
            signaler,
            respond_to,
        })
        .await
    }

    /// A socket went away. The participant leaves their room unless a newer
    /// socket has replaced this one.
    pub async fn disconnect(
        &self,
        participant: ParticipantId,
        signaler_id: Uuid,
    ) -> Result<(), ConferenceError> {
        self.request(|respond_to| RegistryMessage::Disconnect {
            participant,
            signaler_id,
            respond_to,
        })
        .await
    }

    pub async fn status(&self) -> Result<RegistryStatus, ConferenceError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Close every room and stop the registry.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T, F>(&self, build: F) -> Result<T, ConferenceError>
    where
        F: FnOnce(oneshot::Sender<T>) -> RegistryMessage,
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

/// A room owned by the registry.
struct ManagedRoom {
    handle: RoomHandle,
    task: JoinHandle<()>,
    creator: ParticipantId,
}

/// The `RoomRegistryActor` implementation.
struct RoomRegistryActor {
    config: RegistryConfig,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to rooms so they can report their own closure.
    closed_tx: mpsc::UnboundedSender<RoomId>,
    closed_rx: mpsc::UnboundedReceiver<RoomId>,
    cancel_token: CancellationToken,
    provisioner: Arc<dyn EngineProvisioner>,
    rooms: HashMap<RoomId, ManagedRoom>,
    names: HashMap<String, RoomId>,
    membership: HashMap<ParticipantId, RoomId>,
    sockets: HashMap<ParticipantId, Signaler>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "conf.actor.registry")]
    async fn run(mut self) {
        info!(target: "conf.actor.registry", max_rooms = self.config.max_rooms, "Room registry started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "conf.actor.registry", "Room registry received cancellation signal");
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                        }
                        None => {
                            info!(target: "conf.actor.registry", "Room registry channel closed, exiting");
                            break;
                        }
                    }
                }

                Some(id) = self.closed_rx.recv() => {
                    if self.rooms.contains_key(&id) {
                        debug!(target: "conf.actor.registry", room_id = %id, "Room closed itself");
                        self.forget(id).await;
                    }
                }
            }
        }

        info!(
            target: "conf.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "Room registry stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Create {
                creator,
                settings,
                respond_to,
            } => {
                let result = self.create(creator, settings).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::FindById { id, respond_to } => {
                let handle = self
                    .rooms
                    .get(&id)
                    .filter(|r| !r.handle.is_closed())
                    .map(|r| r.handle.clone());
                let _ = respond_to.send(handle);
            }
            RegistryMessage::FindByName { name, respond_to } => {
                let handle = self
                    .names
                    .get(&name)
                    .and_then(|id| self.rooms.get(id))
                    .filter(|r| !r.handle.is_closed())
                    .map(|r| r.handle.clone());
                let _ = respond_to.send(handle);
            }
            RegistryMessage::ListPublic { respond_to } => {
                let _ = respond_to.send(self.list_public().await);
            }
            RegistryMessage::Info {
                id,
                password,
                respond_to,
            } => {
                let result = self.info(id, password).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::Join {
                id,
                participant,
                password,
                respond_to,
            } => {
                let result = self.join(id, participant, password).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::Leave {
                id,
                participant,
                respond_to,
            } => {
                let result = self.leave(id, participant).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::Close {
                id,
                requester,
                respond_to,
            } => {
                let result = match self.rooms.get(&id) {
                    None => Err(ConferenceError::NotFound(format!("room {id}"))),
                    Some(room) if room.creator != requester => Err(ConferenceError::NotAllowed(
                        "Only the room creator can close the room".to_string(),
                    )),
                    Some(_) => {
                        self.forget(id).await;
                        Ok(())
                    }
                };
                let _ = respond_to.send(result);
            }
            RegistryMessage::Remove { id, respond_to } => {
                let result = if self.rooms.contains_key(&id) {
                    self.forget(id).await;
                    Ok(())
                } else {
                    Err(ConferenceError::NotFound(format!("room {id}")))
                };
                let _ = respond_to.send(result);
            }
            RegistryMessage::RegisterSocket {
                participant,
                signaler,
                respond_to,
            } => {
                self.register_socket(participant, signaler).await;
                let _ = respond_to.send(());
            }
            RegistryMessage::Disconnect {
                participant,
                signaler_id,
                respond_to,
            } => {
                self.disconnect(participant, signaler_id).await;
                let _ = respond_to.send(());
            }
            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    member_count: self.membership.len(),
                    socket_count: self.sockets.len(),
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------------

    async fn create(
        &mut self,
        creator: Participant,
        settings: RoomSettings,
    ) -> Result<RoomInfo, ConferenceError> {
        let name = settings.name.trim().to_string();
        if name.is_empty() {
            return Err(ConferenceError::BadRequest("Room name is required".to_string()));
        }
        if settings.max_members == Some(0) {
            return Err(ConferenceError::BadRequest(
                "max_members must be at least 1".to_string(),
            ));
        }
        if settings
            .max_empty_minutes
            .is_some_and(|minutes| minutes > MAX_EMPTY_MINUTES_LIMIT)
        {
            return Err(ConferenceError::BadRequest(format!(
                "max_empty_minutes must be at most {MAX_EMPTY_MINUTES_LIMIT}"
            )));
        }
        if self.names.contains_key(&name) {
            return Err(ConferenceError::NameInUse(name));
        }
        if self.rooms.len() >= self.config.max_rooms {
            warn!(target: "conf.actor.registry", max_rooms = self.config.max_rooms, "Room capacity reached");
            return Err(ConferenceError::NotAllowed(
                "Room capacity reached".to_string(),
            ));
        }

        let id = RoomId::new();
        let engines = self.provision(id).await?;

        let spec = RoomSpec {
            id,
            name: name.clone(),
            creator: creator.clone(),
            password: settings
                .password
                .unwrap_or_else(|| SecretString::from("")),
            max_members: settings.max_members.or(self.config.default_max_members),
            max_empty_minutes: settings
                .max_empty_minutes
                .unwrap_or(self.config.default_max_empty_minutes),
        };

        let (handle, task) = RoomActor::spawn(
            spec,
            engines,
            Arc::clone(&self.provisioner),
            self.closed_tx.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        let info = handle.info().await?;
        let public = handle.is_public();

        self.names.insert(name.clone(), id);
        self.rooms.insert(
            id,
            ManagedRoom {
                handle,
                task,
                creator: creator.id,
            },
        );
        self.metrics.room_opened();

        if public {
            self.announce(&relay::room_directory(true, id, &name));
        }

        info!(
            target: "conf.actor.registry",
            room_id = %id,
            room = %name,
            creator = %creator.id,
            public,
            total_rooms = self.rooms.len(),
            "Room created"
        );
        Ok(info)
    }

    /// Provision both engine legs; the SFU leg is released if the MCU fails.
    async fn provision(&self, id: RoomId) -> Result<EngineLegs, ConferenceError> {
        let sfu = self.provisioner.provision(id, EngineKind::Sfu).await?;
        match self.provisioner.provision(id, EngineKind::Mcu).await {
            Ok(mcu) => Ok(EngineLegs { sfu, mcu }),
            Err(e) => {
                if let Err(release_err) = self.provisioner.release(id, EngineKind::Sfu).await {
                    warn!(target: "conf.actor.registry", room_id = %id, error = %release_err, "SFU release after failed provisioning failed");
                }
                Err(ConferenceError::Engine(format!(
                    "MCU provisioning failed: {e}"
                )))
            }
        }
    }

    async fn list_public(&self) -> Vec<RoomInfo> {
        let mut rooms = Vec::new();
        for managed in self.rooms.values().filter(|r| r.handle.is_public()) {
            match managed.handle.info().await {
                Ok(info) => rooms.push(info),
                Err(e) => {
                    debug!(target: "conf.actor.registry", room_id = %managed.handle.id(), error = %e, "Skipping room in listing");
                }
            }
        }
        rooms.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        rooms
    }

    async fn info(
        &self,
        id: RoomId,
        password: Option<SecretString>,
    ) -> Result<RoomInfo, ConferenceError> {
        let room = self.room(id)?;
        if !room.is_public() && !room.check_password(password).await? {
            return Err(ConferenceError::WrongPassword);
        }
        room.info().await
    }

    fn room(&self, id: RoomId) -> Result<&RoomHandle, ConferenceError> {
        self.rooms
            .get(&id)
            .map(|r| &r.handle)
            .ok_or_else(|| ConferenceError::NotFound(format!("room {id}")))
    }

    /// Close a room and drop every index entry that points at it.
    async fn forget(&mut self, id: RoomId) {
        let Some(managed) = self.rooms.remove(&id) else {
            return;
        };
        let name = managed.handle.name().to_string();
        self.names.remove(&name);
        self.membership.retain(|_, room| *room != id);
        self.metrics.room_closed();

        if managed.handle.is_public() {
            self.announce(&relay::room_directory(false, id, &name));
        }

        managed.handle.close().await;

        // Don't block the mailbox on the room task.
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_CLEANUP_TIMEOUT, managed.task).await {
                Ok(Ok(())) => {
                    debug!(target: "conf.actor.registry", room_id = %id, "Room task completed cleanly");
                }
                Ok(Err(e)) => {
                    warn!(target: "conf.actor.registry", room_id = %id, error = ?e, "Room task panicked during removal");
                    if e.is_panic() {
                        metrics.record_panic(ActorType::Room);
                    }
                }
                Err(_) => {
                    warn!(target: "conf.actor.registry", room_id = %id, "Room task cleanup timed out");
                }
            }
        });

        info!(
            target: "conf.actor.registry",
            room_id = %id,
            room = %name,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    /// Send a server notice to every registered socket.
    fn announce(&self, notice: &Message) {
        for (participant, socket) in &self.sockets {
            if let Err(e) = socket.send(notice.clone()) {
                debug!(target: "conf.actor.registry", participant_id = %participant, error = %e, "Directory notice not delivered");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    async fn join(
        &mut self,
        id: RoomId,
        participant: Participant,
        password: Option<SecretString>,
    ) -> Result<RoomInfo, ConferenceError> {
        let room = self.room(id)?.clone();
        let signaler = self.sockets.get(&participant.id).cloned();

        room.check_admission(participant.clone(), password.clone(), signaler.clone())
            .await?;

        if let Some(current) = self.membership.get(&participant.id).copied() {
            if current != id {
                if let Ok(previous) = self.room(current) {
                    let _ = previous.leave(participant.id).await;
                }
                self.membership.remove(&participant.id);
            }
        }

        let participant_id = participant.id;
        let info = room.join(participant, password, signaler).await?;
        self.membership.insert(participant_id, id);

        debug!(target: "conf.actor.registry", room_id = %id, participant_id = %participant_id, "Participant joined room");
        Ok(info)
    }

    async fn leave(&mut self, id: RoomId, participant: ParticipantId) -> Result<(), ConferenceError> {
        let room = self.room(id)?;
        if !room.leave(participant).await? {
            return Err(ConferenceError::NotFound(format!(
                "participant {participant} in room {id}"
            )));
        }
        if self.membership.get(&participant) == Some(&id) {
            self.membership.remove(&participant);
        }
        Ok(())
    }

    async fn register_socket(&mut self, participant: Participant, signaler: Signaler) {
        let id = participant.id;
        if let Some(previous) = self.sockets.insert(id, signaler.clone()) {
            if previous.id() != signaler.id() {
                debug!(target: "conf.actor.registry", participant_id = %id, "Replacing older socket");
                previous.close();
            }
        }

        if let Some(room_id) = self.membership.get(&id).copied() {
            if let Ok(room) = self.room(room_id) {
                match room.rebind(id, signaler).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        self.membership.remove(&id);
                    }
                }
            }
        }

        info!(
            target: "conf.actor.registry",
            participant_id = %id,
            participant = %participant.name,
            sockets = self.sockets.len(),
            "Socket registered"
        );
    }

    async fn disconnect(&mut self, participant: ParticipantId, signaler_id: Uuid) {
        let current = self.sockets.get(&participant).map(Signaler::id);
        if current != Some(signaler_id) {
            return;
        }
        self.sockets.remove(&participant);

        if let Some(room_id) = self.membership.remove(&participant) {
            if let Ok(room) = self.room(room_id) {
                let _ = room.leave(participant).await;
            }
        }

        info!(target: "conf.actor.registry", participant_id = %participant, sockets = self.sockets.len(), "Socket disconnected");
    }

    async fn graceful_shutdown(&mut self) {
        info!(target: "conf.actor.registry", room_count = self.rooms.len(), "Performing graceful shutdown");

        for (id, managed) in self.rooms.drain() {
            managed.handle.close().await;
            self.metrics.room_closed();
            match tokio::time::timeout(ROOM_CLEANUP_TIMEOUT, managed.task).await {
                Ok(Ok(())) => {
                    debug!(target: "conf.actor.registry", room_id = %id, "Room completed cleanly");
                }
                Ok(Err(e)) => {
                    warn!(target: "conf.actor.registry", room_id = %id, error = ?e, "Room task panicked during shutdown");
                }
                Err(_) => {
                    warn!(target: "conf.actor.registry", room_id = %id, "Room shutdown timed out");
                }
            }
        }
        self.names.clear();
        self.membership.clear();
        for socket in self.sockets.values() {
            socket.close();
        }
        self.sockets.clear();

        info!(target: "conf.actor.registry", "Graceful shutdown complete");
    }
}
