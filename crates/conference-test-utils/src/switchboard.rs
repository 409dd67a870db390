//! In-memory signaling loopback.
//!
//! A [`Switchboard`] plays the room's relay for client-side tests: every
//! endpoint gets an open [`Signaler`], outgoing messages are stamped with the
//! endpoint's name and routed by receiver. Broadcasts reach every other
//! endpoint. Engines join under their address (`@sfu`, `@mcu`).
//!
//! Muting an endpoint drops everything it sends, which is how tests jam a
//! negotiation.

use conference_server::signaling::{Address, Message, Signaler};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct SwitchboardInner {
    endpoints: HashMap<String, Signaler>,
    muted: HashSet<String>,
    log: Vec<Message>,
}

impl SwitchboardInner {
    fn route(&mut self, from: &str, message: Message) {
        if self.muted.contains(from) {
            return;
        }
        let message = message.sent_by(Address::from(from));
        self.log.push(message.clone());

        match &message.receiver {
            Address::Broadcast => {
                for (name, endpoint) in &self.endpoints {
                    if name != from {
                        let _ = endpoint.deliver(message.clone());
                    }
                }
            }
            receiver => {
                if let Some(endpoint) = self.endpoints.get(receiver.as_str()) {
                    let _ = endpoint.deliver(message);
                }
            }
        }
    }
}

/// Loopback relay between client-side signalers.
#[derive(Debug, Clone, Default)]
pub struct Switchboard {
    inner: Arc<Mutex<SwitchboardInner>>,
}

impl Switchboard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint and return its open signaler.
    pub fn join(&self, name: &str) -> Signaler {
        let (signaler, _task) = Signaler::spawn(name);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        signaler.open(tx).unwrap();
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(name.to_string(), signaler.clone());

        let inner = Arc::clone(&self.inner);
        let from = name.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                inner.lock().unwrap().route(&from, message);
            }
        });
        signaler
    }

    /// Deliver a server notice straight to one endpoint.
    pub fn notify(&self, to: &str, message: Message) {
        let message = message.sent_by(Address::Server).to(Address::from(to));
        if let Some(endpoint) = self.inner.lock().unwrap().endpoints.get(to) {
            let _ = endpoint.deliver(message);
        }
    }

    /// Drop everything `name` sends until unmuted.
    pub fn mute(&self, name: &str) {
        self.inner.lock().unwrap().muted.insert(name.to_string());
    }

    pub fn unmute(&self, name: &str) {
        self.inner.lock().unwrap().muted.remove(name);
    }

    /// Every routed message, stamped, in order.
    pub fn log(&self) -> Vec<Message> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Routed messages of one type.
    pub fn log_of(&self, kind: &str) -> Vec<Message> {
        self.log()
            .into_iter()
            .filter(|m| m.kind.as_str() == kind)
            .collect()
    }
}
