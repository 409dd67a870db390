//! `Signaler` - one bidirectional, transport-agnostic message channel.
//!
//! A signaler starts *pending*: outbound messages queue in FIFO order until a
//! transport is attached with [`Signaler::open`], which flushes the queue and
//! then forwards every later message immediately. Inbound messages are pushed
//! by the transport adapter with [`Signaler::deliver`] and fanned out to every
//! subscriber in arrival order.
//!
//! # Lifecycle
//!
//! 1. Spawned pending (engine legs) or opened straight away (participant sockets)
//! 2. Runs until `close()` is called, the transport reports closure, or the
//!    transport's receiving side is dropped
//! 3. Subscribers receive exactly one [`SignalerEvent::Closed`]

use super::Message;
use crate::errors::ConferenceError;

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

/// Event observed by a signaler subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalerEvent {
    /// An inbound message, in arrival order.
    Message(Message),
    /// The channel closed. Fires once per subscriber.
    Closed,
}

#[derive(Debug)]
enum SignalerCommand {
    Send(Message),
    Deliver(Message),
    Subscribe(mpsc::UnboundedSender<SignalerEvent>),
    Open(mpsc::UnboundedSender<Message>),
    TransportClosed,
    Close,
}

/// Handle to a signaler.
///
/// Cheap to clone. Every clone addresses the same channel.
#[derive(Clone, Debug)]
pub struct Signaler {
    sender: mpsc::UnboundedSender<SignalerCommand>,
    cancel_token: CancellationToken,
    id: Uuid,
    label: Arc<str>,
}

impl Signaler {
    /// Spawn a pending signaler.
    ///
    /// `label` only appears in logs (participant name, `@sfu`, ...).
    pub fn spawn(label: impl Into<String>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let id = Uuid::new_v4();
        let label: Arc<str> = Arc::from(label.into());

        let actor = SignalerActor {
            id,
            label: Arc::clone(&label),
            receiver,
            cancel_token: cancel_token.clone(),
            state: ChannelState::Pending(VecDeque::new()),
            subscribers: Vec::new(),
        };

        let task = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
                id,
                label,
            },
            task,
        )
    }

    /// Unique identity of this channel (distinguishes a reconnect from the
    /// socket it replaced).
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue or deliver an outbound message.
    ///
    /// Fails with `ChannelClosed` once the channel is closed.
    pub fn send(&self, message: Message) -> Result<(), ConferenceError> {
        if self.is_closed() {
            return Err(ConferenceError::ChannelClosed);
        }
        self.sender
            .send(SignalerCommand::Send(message))
            .map_err(|_| ConferenceError::ChannelClosed)
    }

    /// Push an inbound message received by the transport.
    pub fn deliver(&self, message: Message) -> Result<(), ConferenceError> {
        self.sender
            .send(SignalerCommand::Deliver(message))
            .map_err(|_| ConferenceError::ChannelClosed)
    }

    /// Register for inbound messages.
    ///
    /// Every message delivered after this call is observed exactly once. On a
    /// closed channel the returned receiver is already finished.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.sender.send(SignalerCommand::Subscribe(tx));
        rx
    }

    /// Attach the transport's outbound side and flush the pending queue.
    pub fn open(&self, outbound: mpsc::UnboundedSender<Message>) -> Result<(), ConferenceError> {
        self.sender
            .send(SignalerCommand::Open(outbound))
            .map_err(|_| ConferenceError::ChannelClosed)
    }

    /// Report that the underlying transport went away.
    pub fn transport_closed(&self) {
        let _ = self.sender.send(SignalerCommand::TransportClosed);
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        let _ = self.sender.send(SignalerCommand::Close);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }
}

enum ChannelState {
    Pending(VecDeque<Message>),
    Open(mpsc::UnboundedSender<Message>),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct SignalerActor {
    id: Uuid,
    label: Arc<str>,
    receiver: mpsc::UnboundedReceiver<SignalerCommand>,
    cancel_token: CancellationToken,
    state: ChannelState,
    subscribers: Vec<mpsc::UnboundedSender<SignalerEvent>>,
}

impl SignalerActor {
    #[instrument(skip_all, name = "conf.signaler", fields(label = %self.label, id = %self.id))]
    async fn run(mut self) {
        loop {
            let outbound = match &self.state {
                ChannelState::Open(tx) => Some(tx.clone()),
                ChannelState::Pending(_) => None,
            };
            let transport_gone = async move {
                match outbound {
                    Some(tx) => tx.closed().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle(command) == Flow::Stop {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = transport_gone => {
                    debug!(target: "conf.signaler", label = %self.label, "Transport dropped its receiving side");
                    break;
                }
            }
        }

        self.finish();
    }

    fn handle(&mut self, command: SignalerCommand) -> Flow {
        match command {
            SignalerCommand::Send(message) => match &mut self.state {
                ChannelState::Pending(queue) => {
                    trace!(target: "conf.signaler", label = %self.label, kind = %message.kind, "Queued until open");
                    queue.push_back(message);
                    Flow::Continue
                }
                ChannelState::Open(tx) => {
                    if tx.send(message).is_err() {
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }
            },
            SignalerCommand::Deliver(message) => {
                self.subscribers
                    .retain(|sub| sub.send(SignalerEvent::Message(message.clone())).is_ok());
                Flow::Continue
            }
            SignalerCommand::Subscribe(tx) => {
                self.subscribers.push(tx);
                Flow::Continue
            }
            SignalerCommand::Open(tx) => {
                let queued = match std::mem::replace(&mut self.state, ChannelState::Open(tx.clone()))
                {
                    ChannelState::Pending(queue) => queue,
                    ChannelState::Open(_) => VecDeque::new(),
                };
                debug!(target: "conf.signaler", label = %self.label, flushed = queued.len(), "Channel opened");
                for message in queued {
                    if tx.send(message).is_err() {
                        return Flow::Stop;
                    }
                }
                Flow::Continue
            }
            SignalerCommand::TransportClosed | SignalerCommand::Close => Flow::Stop,
        }
    }

    fn finish(mut self) {
        self.cancel_token.cancel();
        self.receiver.close();

        if let ChannelState::Pending(queue) = &self.state {
            if !queue.is_empty() {
                debug!(
                    target: "conf.signaler",
                    label = %self.label,
                    dropped = queue.len(),
                    "Closed with undelivered queued messages"
                );
            }
        }

        for sub in self.subscribers.drain(..) {
            let _ = sub.send(SignalerEvent::Closed);
        }

        debug!(target: "conf.signaler", label = %self.label, "Signaler closed");
    }
}
