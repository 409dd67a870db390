//! `RoomActor` - one conference room.
//!
//! Each `RoomActor`:
//! - Owns membership, the active architecture and the two engine legs
//! - Relays every message read from a member's or engine's channel
//! - Sends the roster and architecture notices that drive the clients
//! - Closes itself once it stayed empty for `max_empty_minutes`
//!
//! # Lifecycle
//!
//! 1. Spawned by the registry with freshly provisioned engine legs
//! 2. Runs until closed by the registry, cancelled, or the empty window expires
//! 3. On close: members are dropped, the registry is notified, then the SFU
//!    leg and the MCU leg are released (failures tolerated)
//!
//! The room never waits on the registry; it reports its own closure on an
//! unbounded channel.

use crate::architecture::{Architecture, ArchitectureState, Switch};
use crate::engine::{EngineKind, EngineProvisioner};
use crate::errors::ConferenceError;
use crate::observability::metrics as prom;
use crate::relay::{self, Delivery, ServerCommand, Target};
use crate::signaling::{Address, Message, Signaler, SignalerEvent};

use super::messages::{
    CreatorInfo, Origin, Participant, RoomEvent, RoomInfo, RoomMessage,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::{DateTime, Utc};
use common::secret::{is_blank, secret_matches, ExposeSecret, SecretString};
use common::types::{ParticipantId, RoomId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

const ROOM_EVENT_CAPACITY: usize = 64;

/// Fixed parameters of a room.
#[derive(Debug, Clone)]
pub struct RoomSpec {
    pub id: RoomId,
    pub name: String,
    pub creator: Participant,
    /// Blank means public.
    pub password: SecretString,
    /// `None` means unlimited.
    pub max_members: Option<usize>,
    pub max_empty_minutes: u64,
}

/// The two engine legs of a room.
#[derive(Debug, Clone)]
pub struct EngineLegs {
    pub sfu: Signaler,
    pub mcu: Signaler,
}

impl EngineLegs {
    fn get(&self, kind: EngineKind) -> &Signaler {
        match kind {
            EngineKind::Sfu => &self.sfu,
            EngineKind::Mcu => &self.mcu,
        }
    }
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    events: broadcast::Sender<RoomEvent>,
    cancel_token: CancellationToken,
    id: RoomId,
    name: Arc<str>,
    public: bool,
}

impl RoomHandle {
    #[must_use]
    pub fn id(&self) -> RoomId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_public(&self) -> bool {
        self.public
    }

    /// Run the join checks without committing.
    ///
    /// Errors in order: `RoomFull`, `WrongPassword`, `NoTransport`,
    /// `AlreadyMember`, `NameInUse`.
    pub async fn check_admission(
        &self,
        participant: Participant,
        password: Option<SecretString>,
        signaler: Option<Signaler>,
    ) -> Result<(), ConferenceError> {
        self.request(|respond_to| RoomMessage::CheckAdmission {
            participant,
            password,
            signaler,
            respond_to,
        })
        .await?
    }

    /// Join the room. Leaving other rooms is the registry's job.
    pub async fn join(
        &self,
        participant: Participant,
        password: Option<SecretString>,
        signaler: Option<Signaler>,
    ) -> Result<RoomInfo, ConferenceError> {
        self.request(|respond_to| RoomMessage::Join {
            participant,
            password,
            signaler,
            respond_to,
        })
        .await?
    }

    /// Returns whether the participant was a member.
    pub async fn leave(&self, participant: ParticipantId) -> Result<bool, ConferenceError> {
        self.request(|respond_to| RoomMessage::Leave {
            participant,
            respond_to,
        })
        .await
    }

    /// Returns the switch, or `None` when `target` is already active.
    pub async fn switch_architecture(
        &self,
        target: Architecture,
    ) -> Result<Option<Switch>, ConferenceError> {
        self.request(|respond_to| RoomMessage::SwitchArchitecture { target, respond_to })
            .await
    }

    pub async fn info(&self) -> Result<RoomInfo, ConferenceError> {
        self.request(|respond_to| RoomMessage::GetInfo { respond_to })
            .await
    }

    pub async fn check_password(
        &self,
        password: Option<SecretString>,
    ) -> Result<bool, ConferenceError> {
        self.request(|respond_to| RoomMessage::CheckPassword {
            password,
            respond_to,
        })
        .await
    }

    /// Move a member onto a new signaling channel.
    pub async fn rebind(
        &self,
        participant: ParticipantId,
        signaler: Signaler,
    ) -> Result<bool, ConferenceError> {
        self.request(|respond_to| RoomMessage::Rebind {
            participant,
            signaler,
            respond_to,
        })
        .await
    }

    /// Close the room. A no-op on a closed room.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RoomMessage::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    // A closed room behaves like a missing one.
    async fn request<T, F>(&self, build: F) -> Result<T, ConferenceError>
    where
        F: FnOnce(oneshot::Sender<T>) -> RoomMessage,
    {
        let gone = || ConferenceError::NotFound(format!("room {}", self.id));
        if self.is_closed() {
            return Err(gone());
        }
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }
}

struct Member {
    participant: Participant,
    signaler: Signaler,
    forwarder: CancellationToken,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    spec: RoomSpec,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Given to forwarders.
    self_sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<RoomEvent>,
    members: Vec<Member>,
    architecture: ArchitectureState,
    engines: EngineLegs,
    provisioner: Arc<dyn EngineProvisioner>,
    closed_tx: mpsc::UnboundedSender<RoomId>,
    closing_deadline: Option<Instant>,
    created: DateTime<Utc>,
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    pub fn spawn(
        spec: RoomSpec,
        engines: EngineLegs,
        provisioner: Arc<dyn EngineProvisioner>,
        closed_tx: mpsc::UnboundedSender<RoomId>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(ROOM_EVENT_CAPACITY);

        let handle = RoomHandle {
            sender: sender.clone(),
            events: events.clone(),
            cancel_token: cancel_token.clone(),
            id: spec.id,
            name: Arc::from(spec.name.as_str()),
            public: is_blank(&spec.password),
        };

        for kind in EngineKind::ALL {
            spawn_forwarder(
                engines.get(kind),
                Origin::Engine(kind),
                sender.clone(),
                cancel_token.child_token(),
            );
        }

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Room, spec.id.to_string()),
            spec,
            receiver,
            self_sender: sender,
            cancel_token,
            events,
            members: Vec::new(),
            architecture: ArchitectureState::default(),
            engines,
            provisioner,
            closed_tx,
            closing_deadline: None,
            created: Utc::now(),
            closed: false,
            metrics,
        };

        let task = tokio::spawn(actor.run());
        (handle, task)
    }

    #[instrument(skip_all, name = "conf.actor.room", fields(room_id = %self.spec.id, room = %self.spec.name))]
    async fn run(mut self) {
        info!(target: "conf.actor.room", room_id = %self.spec.id, room = %self.spec.name, "Room opened");

        loop {
            let deadline = self.closing_deadline;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.close().await;
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

                () = closing_timer(deadline) => {
                    self.closing_deadline = None;
                    if self.members.is_empty() {
                        info!(target: "conf.actor.room", room_id = %self.spec.id, "Room stayed empty, closing");
                        self.close().await;
                    }
                }
            }

            if self.closed {
                break;
            }
        }

        info!(
            target: "conf.actor.room",
            room_id = %self.spec.id,
            messages_processed = self.mailbox.messages_processed(),
            "Room stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::CheckAdmission {
                participant,
                password,
                signaler,
                respond_to,
            } => {
                let result = self.admission(&participant, password.as_ref(), signaler.as_ref());
                let _ = respond_to.send(result);
            }
            RoomMessage::Join {
                participant,
                password,
                signaler,
                respond_to,
            } => {
                let result = self.join(participant, password.as_ref(), signaler);
                let _ = respond_to.send(result);
            }
            RoomMessage::Leave {
                participant,
                respond_to,
            } => {
                let was_member = self.leave(participant);
                let _ = respond_to.send(was_member);
            }
            RoomMessage::Relay {
                origin,
                message,
                received_at,
            } => self.relay(origin, message, received_at),
            RoomMessage::SwitchArchitecture { target, respond_to } => {
                let switch = self.switch(target);
                let _ = respond_to.send(switch);
            }
            RoomMessage::GetInfo { respond_to } => {
                let _ = respond_to.send(self.info());
            }
            RoomMessage::CheckPassword {
                password,
                respond_to,
            } => {
                let _ = respond_to.send(self.password_matches(password.as_ref()));
            }
            RoomMessage::Rebind {
                participant,
                signaler,
                respond_to,
            } => {
                let _ = respond_to.send(self.rebind(participant, signaler));
            }
            RoomMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    fn remaining_capacity(&self) -> Option<usize> {
        self.spec
            .max_members
            .map(|max| max.saturating_sub(self.members.len()))
    }

    fn joinable(&self) -> bool {
        self.remaining_capacity() != Some(0)
    }

    fn password_matches(&self, password: Option<&SecretString>) -> bool {
        if is_blank(&self.spec.password) {
            return true;
        }
        let candidate = password.map_or("", |p| p.expose_secret());
        secret_matches(&self.spec.password, candidate)
    }

    fn admission(
        &self,
        participant: &Participant,
        password: Option<&SecretString>,
        signaler: Option<&Signaler>,
    ) -> Result<(), ConferenceError> {
        if !self.joinable() {
            return Err(ConferenceError::RoomFull);
        }
        if !self.password_matches(password) {
            return Err(ConferenceError::WrongPassword);
        }
        if signaler.map_or(true, Signaler::is_closed) {
            return Err(ConferenceError::NoTransport);
        }
        if self.members.iter().any(|m| m.participant.id == participant.id) {
            return Err(ConferenceError::AlreadyMember);
        }
        if self.members.iter().any(|m| m.participant.name == participant.name) {
            return Err(ConferenceError::NameInUse(participant.name.clone()));
        }
        Ok(())
    }

    fn join(
        &mut self,
        participant: Participant,
        password: Option<&SecretString>,
        signaler: Option<Signaler>,
    ) -> Result<RoomInfo, ConferenceError> {
        self.admission(&participant, password, signaler.as_ref())?;
        let Some(signaler) = signaler else {
            return Err(ConferenceError::NoTransport);
        };

        self.closing_deadline = None;

        let forwarder = self.cancel_token.child_token();
        spawn_forwarder(
            &signaler,
            Origin::Member(participant.id),
            self.self_sender.clone(),
            forwarder.clone(),
        );

        let others = self.member_names();
        self.members.push(Member {
            participant: participant.clone(),
            signaler,
            forwarder,
        });
        self.metrics.participant_joined();

        self.deliver_to_member(
            &participant.name,
            relay::user_list(&others).to(Address::peer(participant.name.clone())),
        );
        for other in &others {
            self.deliver_to_member(
                other,
                relay::user_connected(&participant.name).to(Address::peer(other.clone())),
            );
        }
        for kind in EngineKind::ALL {
            self.deliver_to_engine(kind, relay::user_connected(&participant.name).to(kind.address()));
        }

        info!(
            target: "conf.actor.room",
            room_id = %self.spec.id,
            participant_id = %participant.id,
            members = self.members.len(),
            "Participant joined"
        );
        let _ = self.events.send(RoomEvent::Joined(participant));

        Ok(self.info())
    }

    fn leave(&mut self, participant: ParticipantId) -> bool {
        let index = self
            .members
            .iter()
            .position(|m| m.participant.id == participant);

        let was_member = match index {
            Some(index) => {
                let member = self.members.remove(index);
                member.forwarder.cancel();
                self.metrics.participants_left(1);

                let name = member.participant.name.clone();
                for other in self.member_names() {
                    let notice = relay::user_disconnected(&name).to(Address::peer(other.clone()));
                    self.deliver_to_member(&other, notice);
                }
                for kind in EngineKind::ALL {
                    self.deliver_to_engine(kind, relay::user_disconnected(&name).to(kind.address()));
                }

                info!(
                    target: "conf.actor.room",
                    room_id = %self.spec.id,
                    participant_id = %participant,
                    members = self.members.len(),
                    "Participant left"
                );
                let _ = self.events.send(RoomEvent::Left(member.participant));
                true
            }
            None => false,
        };

        if self.members.is_empty() && self.closing_deadline.is_none() {
            let window = Duration::from_secs(self.spec.max_empty_minutes.saturating_mul(60));
            self.closing_deadline = Instant::now().checked_add(window);
            debug!(
                target: "conf.actor.room",
                room_id = %self.spec.id,
                minutes = self.spec.max_empty_minutes,
                "Room empty, closing timer started"
            );
        }

        was_member
    }

    fn rebind(&mut self, participant: ParticipantId, signaler: Signaler) -> bool {
        let Some(member) = self
            .members
            .iter_mut()
            .find(|m| m.participant.id == participant)
        else {
            return false;
        };

        member.forwarder.cancel();
        let forwarder = self.cancel_token.child_token();
        spawn_forwarder(
            &signaler,
            Origin::Member(participant),
            self.self_sender.clone(),
            forwarder.clone(),
        );
        member.signaler = signaler;
        member.forwarder = forwarder;

        debug!(target: "conf.actor.room", room_id = %self.spec.id, participant_id = %participant, "Member rebound to new channel");
        true
    }

    fn member_names(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|m| m.participant.name.clone())
            .collect()
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.spec.id,
            name: self.spec.name.clone(),
            creator: CreatorInfo {
                id: self.spec.creator.id,
                name: self.spec.creator.name.clone(),
            },
            public: is_blank(&self.spec.password),
            architecture: self.architecture.current(),
            joinable: self.joinable(),
            max_members: self.spec.max_members,
            members: self.member_names(),
            created: self.created,
        }
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    fn relay(&mut self, origin: Origin, message: Message, received_at: Instant) {
        let label = message.kind.metric_label();
        let names = self.member_names();

        let outcome = match origin {
            Origin::Member(participant) => {
                let Some(sender) = self
                    .members
                    .iter()
                    .find(|m| m.participant.id == participant)
                    .map(|m| m.participant.name.clone())
                else {
                    return;
                };
                relay::from_member(&sender, message, &names)
            }
            Origin::Engine(kind) => relay::from_engine(kind, message, &names),
        };

        prom::record_relay_message(outcome.route.as_str());
        for delivery in outcome.deliveries {
            self.deliver(delivery);
        }
        if let Some(ServerCommand::SwitchArchitecture(target)) = outcome.command {
            self.switch(target);
        }
        prom::record_message_latency(label, received_at.elapsed());
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery.target {
            Target::Member(name) => self.deliver_to_member(&name, delivery.message),
            Target::Engine(kind) => self.deliver_to_engine(kind, delivery.message),
        }
    }

    fn deliver_to_member(&self, name: &str, message: Message) {
        let Some(member) = self.members.iter().find(|m| m.participant.name == name) else {
            return;
        };
        if let Err(e) = member.signaler.send(message) {
            debug!(target: "conf.actor.room", room_id = %self.spec.id, member = %name, error = %e, "Delivery to member failed");
        }
    }

    fn deliver_to_engine(&self, kind: EngineKind, message: Message) {
        if let Err(e) = self.engines.get(kind).send(message) {
            debug!(target: "conf.actor.room", room_id = %self.spec.id, engine = %kind, error = %e, "Delivery to engine failed");
        }
    }

    // ------------------------------------------------------------------------
    // Architecture
    // ------------------------------------------------------------------------

    fn switch(&mut self, target: Architecture) -> Option<Switch> {
        let switch = self.architecture.set(target)?;
        let count = self.members.len();

        if let Some(kind) = switch.previous.engine() {
            self.deliver_to_engine(kind, relay::engine_control(kind, false, count));
        }
        if let Some(kind) = switch.current.engine() {
            self.deliver_to_engine(kind, relay::engine_control(kind, true, count));
        }

        let names = self.member_names();
        for name in &names {
            let others: Vec<String> = names.iter().filter(|n| *n != name).cloned().collect();
            self.deliver_to_member(
                name,
                relay::architecture_switch(switch.current).to(Address::peer(name.clone())),
            );
            self.deliver_to_member(
                name,
                relay::user_list(&others).to(Address::peer(name.clone())),
            );
        }
        for kind in EngineKind::ALL {
            self.deliver_to_engine(kind, relay::architecture_switch(switch.current).to(kind.address()));
            self.deliver_to_engine(kind, relay::user_list(&names).to(kind.address()));
        }

        prom::record_architecture_switch(switch.current.as_str());
        info!(
            target: "conf.actor.room",
            room_id = %self.spec.id,
            current = %switch.current,
            previous = %switch.previous,
            "Architecture switched"
        );
        let _ = self.events.send(RoomEvent::ArchitectureSwitched(switch));
        Some(switch)
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel_token.cancel();
        self.closing_deadline = None;

        let dropped = self.members.len();
        for member in self.members.drain(..) {
            member.forwarder.cancel();
        }
        self.metrics.participants_left(dropped);

        let _ = self.closed_tx.send(self.spec.id);
        let _ = self.events.send(RoomEvent::Closed);

        for kind in EngineKind::ALL {
            if let Err(e) = self.provisioner.release(self.spec.id, kind).await {
                warn!(target: "conf.actor.room", room_id = %self.spec.id, engine = %kind, error = %e, "Engine release failed");
            }
        }

        info!(target: "conf.actor.room", room_id = %self.spec.id, dropped_members = dropped, "Room closed");
    }
}

/// Pump a channel's inbound messages into the room mailbox.
fn spawn_forwarder(
    signaler: &Signaler,
    origin: Origin,
    room: mpsc::Sender<RoomMessage>,
    token: CancellationToken,
) {
    let mut inbound = signaler.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                event = inbound.recv() => {
                    match event {
                        Some(SignalerEvent::Message(message)) => {
                            let relay = RoomMessage::Relay {
                                origin,
                                message,
                                received_at: Instant::now(),
                            };
                            if room.send(relay).await.is_err() {
                                break;
                            }
                        }
                        Some(SignalerEvent::Closed) | None => break,
                    }
                }
            }
        }
    });
}

async fn closing_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::MessageType;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvisioner {
        released: Mutex<Vec<EngineKind>>,
        fail_sfu: bool,
    }

    #[async_trait]
    impl EngineProvisioner for RecordingProvisioner {
        async fn provision(&self, _room: RoomId, kind: EngineKind) -> Result<Signaler, ConferenceError> {
            Ok(Signaler::spawn(kind.address().as_str()).0)
        }

        async fn release(&self, _room: RoomId, kind: EngineKind) -> Result<(), ConferenceError> {
            self.released.lock().unwrap().push(kind);
            if self.fail_sfu && kind == EngineKind::Sfu {
                return Err(ConferenceError::Engine("sfu unreachable".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        room: RoomHandle,
        provisioner: Arc<RecordingProvisioner>,
        closed_rx: mpsc::UnboundedReceiver<RoomId>,
        engines: EngineLegs,
    }

    fn participant(name: &str) -> Participant {
        Participant {
            id: ParticipantId::new(),
            name: name.to_string(),
        }
    }

    fn open_socket(name: &str) -> (Signaler, mpsc::UnboundedReceiver<Message>) {
        let (signaler, _task) = Signaler::spawn(name);
        let (tx, rx) = mpsc::unbounded_channel();
        signaler.open(tx).unwrap();
        (signaler, rx)
    }

    fn spawn_room(password: &str, max_members: Option<usize>, fail_sfu: bool) -> Fixture {
        spawn_room_with(password, max_members, fail_sfu, 1)
    }

    fn spawn_room_with(
        password: &str,
        max_members: Option<usize>,
        fail_sfu: bool,
        max_empty_minutes: u64,
    ) -> Fixture {
        let provisioner = Arc::new(RecordingProvisioner {
            released: Mutex::new(Vec::new()),
            fail_sfu,
        });
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let engines = EngineLegs {
            sfu: Signaler::spawn("@sfu").0,
            mcu: Signaler::spawn("@mcu").0,
        };
        let (room, _task) = RoomActor::spawn(
            RoomSpec {
                id: RoomId::new(),
                name: "standup".to_string(),
                creator: participant("host"),
                password: SecretString::from(password),
                max_members,
                max_empty_minutes,
            },
            engines.clone(),
            provisioner.clone(),
            closed_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        Fixture {
            room,
            provisioner,
            closed_rx,
            engines,
        }
    }

    #[tokio::test]
    async fn test_admission_error_order() {
        let fx = spawn_room("secret", Some(1), false);
        let alice = participant("alice");
        let (socket, _rx) = open_socket("alice");

        // Wrong password beats missing transport.
        let err = fx
            .room
            .check_admission(alice.clone(), Some(SecretString::from("nope")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::WrongPassword));

        let err = fx
            .room
            .check_admission(alice.clone(), Some(SecretString::from("secret")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::NoTransport));

        fx.room
            .join(alice.clone(), Some(SecretString::from("secret")), Some(socket.clone()))
            .await
            .unwrap();

        // Full beats everything, including already-member.
        let err = fx
            .room
            .check_admission(alice.clone(), Some(SecretString::from("nope")), Some(socket))
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::RoomFull));
    }

    #[tokio::test]
    async fn test_already_member_and_closed_socket() {
        let fx = spawn_room("", None, false);
        let alice = participant("alice");
        let (socket, _rx) = open_socket("alice");
        fx.room.join(alice.clone(), None, Some(socket.clone())).await.unwrap();

        let err = fx
            .room
            .join(alice.clone(), None, Some(socket))
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::AlreadyMember));

        let bob = participant("bob");
        let (closed_socket, _rx) = open_socket("bob");
        closed_socket.close();
        closed_socket.closed().await;
        let err = fx
            .room
            .join(bob, None, Some(closed_socket))
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::NoTransport));
    }

    #[tokio::test]
    async fn test_join_sends_roster_notices() {
        let fx = spawn_room("", None, false);
        let (alice_socket, mut alice_rx) = open_socket("alice");
        let (bob_socket, mut bob_rx) = open_socket("bob");

        fx.room
            .join(participant("alice"), None, Some(alice_socket))
            .await
            .unwrap();
        let first = alice_rx.recv().await.unwrap();
        assert_eq!(first.kind, MessageType::UserList);
        assert_eq!(first.data, serde_json::json!([]));

        let info = fx
            .room
            .join(participant("bob"), None, Some(bob_socket))
            .await
            .unwrap();
        assert_eq!(info.members, vec!["alice", "bob"]);

        let list = bob_rx.recv().await.unwrap();
        assert_eq!(list.kind, MessageType::UserList);
        assert_eq!(list.data, serde_json::json!(["alice"]));

        let connected = alice_rx.recv().await.unwrap();
        assert_eq!(connected.kind, MessageType::UserConnected);
        assert_eq!(connected.data, "bob");
        assert_eq!(connected.sender, Address::Server);
    }

    #[tokio::test]
    async fn test_duplicate_display_name_is_rejected() {
        let fx = spawn_room("", None, false);
        let (first, _rx1) = open_socket("alice");
        let (second, _rx2) = open_socket("alice");
        fx.room.join(participant("alice"), None, Some(first)).await.unwrap();

        let namesake = participant("alice");
        let err = fx
            .room
            .check_admission(namesake.clone(), None, Some(second.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::NameInUse(_)));

        let err = fx
            .room
            .join(namesake, None, Some(second))
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::NameInUse(_)));
    }

    #[tokio::test]
    async fn test_unbounded_empty_window_keeps_room_open() {
        let mut fx = spawn_room_with("", None, false, u64::MAX);
        let alice = participant("alice");
        let (socket, _rx) = open_socket("alice");
        fx.room.join(alice.clone(), None, Some(socket)).await.unwrap();

        assert!(fx.room.leave(alice.id).await.unwrap());

        let info = fx.room.info().await.unwrap();
        assert!(info.members.is_empty());
        assert!(!fx.room.is_closed());
        assert!(fx.closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_switch_fires_only_on_change_and_controls_engines() {
        let fx = spawn_room("", None, false);
        let mut events = fx.room.subscribe();
        let (sfu_tx, mut sfu_rx) = mpsc::unbounded_channel();
        fx.engines.sfu.open(sfu_tx).unwrap();

        assert!(fx
            .room
            .switch_architecture(Architecture::Mesh)
            .await
            .unwrap()
            .is_none());

        let switch = fx
            .room
            .switch_architecture(Architecture::Sfu)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(switch.previous, Architecture::Mesh);
        assert_eq!(switch.current, Architecture::Sfu);

        let activate = sfu_rx.recv().await.unwrap();
        assert_eq!(activate.kind, MessageType::EngineActivate);
        assert_eq!(activate.data["members"], 0);

        assert_eq!(
            events.recv().await.unwrap(),
            RoomEvent::ArchitectureSwitched(switch)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_releases_sfu_then_mcu_tolerating_failure() {
        let mut fx = spawn_room("", None, true);
        fx.room.close().await;

        assert!(fx.room.is_closed());
        assert_eq!(fx.closed_rx.recv().await.unwrap(), fx.room.id());
        assert_eq!(
            *fx.provisioner.released.lock().unwrap(),
            vec![EngineKind::Sfu, EngineKind::Mcu]
        );
        assert!(matches!(fx.room.info().await, Err(ConferenceError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_closes_after_window() {
        let mut fx = spawn_room("", None, false);
        let alice = participant("alice");
        let (socket, _rx) = open_socket("alice");
        fx.room.join(alice.clone(), None, Some(socket)).await.unwrap();
        assert!(fx.room.leave(alice.id).await.unwrap());

        tokio::time::advance(Duration::from_secs(59)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fx.room.is_closed());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(fx.closed_rx.recv().await.unwrap(), fx.room.id());
        assert!(fx.room.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_closing_timer() {
        let fx = spawn_room("", None, false);
        let alice = participant("alice");
        let (socket, _rx) = open_socket("alice");
        fx.room.join(alice.clone(), None, Some(socket.clone())).await.unwrap();
        fx.room.leave(alice.id).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        fx.room.join(alice, None, Some(socket)).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fx.room.is_closed());
        assert_eq!(fx.room.info().await.unwrap().members, vec!["alice"]);
    }
}
