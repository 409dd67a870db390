//! Mock engine provisioner.
//!
//! Hands out pending engine legs without any engine process behind them. A
//! test can fetch a leg with [`MockEngineProvisioner::signaler`], open it on
//! a channel it owns and play the engine's part.
//!
//! # Example
//!
//! ```rust,ignore
//! use conference_test_utils::MockEngineProvisioner;
//!
//! let engines = MockEngineProvisioner::builder()
//!     .fail_provision(EngineKind::Mcu)
//!     .build();
//! ```

use async_trait::async_trait;
use common::types::RoomId;
use conference_server::engine::{EngineKind, EngineProvisioner};
use conference_server::errors::ConferenceError;
use conference_server::signaling::Signaler;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// What happened to an engine leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCall {
    Provisioned(RoomId, EngineKind),
    Released(RoomId, EngineKind),
}

#[derive(Debug, Default)]
struct MockEngineInner {
    calls: Vec<EngineCall>,
    legs: HashMap<(RoomId, EngineKind), Signaler>,
    fail_provision: HashSet<EngineKind>,
    fail_release: HashSet<EngineKind>,
}

/// Mock implementation of [`EngineProvisioner`].
#[derive(Debug, Clone, Default)]
pub struct MockEngineProvisioner {
    inner: Arc<Mutex<MockEngineInner>>,
}

impl MockEngineProvisioner {
    /// Provisioner that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> MockEngineProvisionerBuilder {
        MockEngineProvisionerBuilder::default()
    }

    /// Calls in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Releases in order.
    pub fn released(&self) -> Vec<(RoomId, EngineKind)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Released(room, kind) => Some((room, kind)),
                EngineCall::Provisioned(..) => None,
            })
            .collect()
    }

    /// The leg handed out for a room, if still held.
    pub fn signaler(&self, room: RoomId, kind: EngineKind) -> Option<Signaler> {
        self.inner.lock().unwrap().legs.get(&(room, kind)).cloned()
    }

    /// Number of legs currently held.
    pub fn leg_count(&self) -> usize {
        self.inner.lock().unwrap().legs.len()
    }
}

#[async_trait]
impl EngineProvisioner for MockEngineProvisioner {
    async fn provision(&self, room: RoomId, kind: EngineKind) -> Result<Signaler, ConferenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(EngineCall::Provisioned(room, kind));
        if inner.fail_provision.contains(&kind) {
            return Err(ConferenceError::Engine(format!("{kind} unavailable")));
        }
        let (signaler, _task) = Signaler::spawn(kind.address().as_str());
        inner.legs.insert((room, kind), signaler.clone());
        Ok(signaler)
    }

    async fn release(&self, room: RoomId, kind: EngineKind) -> Result<(), ConferenceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(EngineCall::Released(room, kind));
        if let Some(signaler) = inner.legs.remove(&(room, kind)) {
            signaler.close();
        }
        if inner.fail_release.contains(&kind) {
            return Err(ConferenceError::Engine(format!("{kind} release failed")));
        }
        Ok(())
    }
}

/// Builder for [`MockEngineProvisioner`].
#[derive(Debug, Default)]
pub struct MockEngineProvisionerBuilder {
    fail_provision: HashSet<EngineKind>,
    fail_release: HashSet<EngineKind>,
}

impl MockEngineProvisionerBuilder {
    /// Fail provisioning of `kind`.
    #[must_use]
    pub fn fail_provision(mut self, kind: EngineKind) -> Self {
        self.fail_provision.insert(kind);
        self
    }

    /// Fail releasing `kind` (the leg is still closed).
    #[must_use]
    pub fn fail_release(mut self, kind: EngineKind) -> Self {
        self.fail_release.insert(kind);
        self
    }

    #[must_use]
    pub fn build(self) -> MockEngineProvisioner {
        MockEngineProvisioner {
            inner: Arc::new(Mutex::new(MockEngineInner {
                fail_provision: self.fail_provision,
                fail_release: self.fail_release,
                ..MockEngineInner::default()
            })),
        }
    }
}
