//! Scripted peer transport.
//!
//! [`MockTransport`] stands in for a browser peer connection. It records every
//! call, can be told to fail chosen operations, and models just enough of
//! SDP to move tracks end to end: a description lists the sending tracks as
//! `a=track:<id> <kind> <mid>` lines, and applying a remote description emits
//! `TrackAdded` / `TrackEnded` for the difference.
//!
//! # Example
//!
//! ```rust,ignore
//! use conference_test_utils::MockTransport;
//!
//! let (parts, handle) = MockTransport::builder()
//!     .label("alice->bob")
//!     .fail_on("create_offer")
//!     .build();
//!
//! // Hand `parts` to ConnectionActor::spawn, then inspect:
//! assert_eq!(handle.count("create_offer"), 1);
//! ```

use async_trait::async_trait;
use conference_server::media::{MediaKind, MediaTrack, RemoteTrack};
use conference_server::transport::{
    IceCandidate, IceConnectionState, PeerTransport, SessionDescription, TransportError,
    TransportEvent, TransportFactory, TransportParts,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct LocalTrack {
    id: String,
    kind: MediaKind,
    mid: String,
    bound: bool,
    muted: bool,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    label: String,
    calls: Vec<String>,
    local: Vec<LocalTrack>,
    next_mid: u32,
    /// Remote tracks by mid.
    remote: HashMap<String, RemoteTrack>,
    version: u32,
    failures: HashSet<String>,
    auto_negotiation: bool,
    closed: bool,
}

impl MockTransportInner {
    fn check(&mut self, op: &str) -> Result<(), TransportError> {
        self.calls.push(op.to_string());
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.failures.contains(op) {
            return Err(TransportError::Rejected(format!("{op} failed (injected)")));
        }
        Ok(())
    }

    fn render(&mut self, kind: &str) -> String {
        self.version += 1;
        let mut sdp = format!("v=0\r\no=mock {} {} {kind}\r\n", self.label, self.version);
        for track in &self.local {
            sdp.push_str(&format!(
                "a=track:{} {} {}\r\n",
                track.id,
                kind_str(track.kind),
                track.mid
            ));
        }
        sdp
    }
}

fn kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// Parse the `a=track:` lines of a mock description into `(id, kind, mid)`.
fn parse_tracks(sdp: &str) -> Vec<(String, MediaKind, String)> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=track:"))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let id = parts.next()?.to_string();
            let kind = match parts.next()? {
                "audio" => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let mid = parts.next()?.to_string();
            Some((id, kind, mid))
        })
        .collect()
}

/// Origin label embedded in a mock description (`o=mock <label> ...`).
fn parse_origin(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=mock "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

/// Mock implementation of [`PeerTransport`].
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check("create_offer")?;
        Ok(SessionDescription::offer(inner.render("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check("create_answer")?;
        Ok(SessionDescription::answer(inner.render("answer")))
    }

    async fn set_local_description(
        &self,
        _description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check("set_local_description")?;
        for track in &mut inner.local {
            track.bound = true;
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let (added, ended) = {
            let mut inner = self.inner.lock().unwrap();
            inner.check("set_remote_description")?;

            let stream = parse_origin(&description.sdp).unwrap_or_default();
            let listed = parse_tracks(&description.sdp);
            let mids: HashSet<&str> = listed.iter().map(|(_, _, mid)| mid.as_str()).collect();

            let ended: Vec<String> = inner
                .remote
                .keys()
                .filter(|mid| !mids.contains(mid.as_str()))
                .cloned()
                .collect();
            for mid in &ended {
                inner.remote.remove(mid);
            }

            let mut added = Vec::new();
            for (id, kind, mid) in listed {
                if inner.remote.contains_key(&mid) {
                    continue;
                }
                let track = RemoteTrack {
                    id,
                    kind,
                    mid: mid.clone(),
                    streams: vec![stream.clone()],
                    meta: None,
                };
                inner.remote.insert(mid, track.clone());
                added.push(track);
            }
            (added, ended)
        };

        for track in added {
            self.emit(TransportEvent::TrackAdded(track));
        }
        for mid in ended {
            self.emit(TransportEvent::TrackEnded { mid });
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().check("rollback")
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check("add_ice_candidate")?;
        inner.calls.push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().check("restart_ice")
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let negotiate = {
            let mut inner = self.inner.lock().unwrap();
            inner.check("add_track")?;
            let mid = inner.next_mid.to_string();
            inner.next_mid += 1;
            inner.local.push(LocalTrack {
                id: track.id.clone(),
                kind: track.kind,
                mid,
                bound: false,
                muted: false,
            });
            inner.auto_negotiation
        };
        if negotiate {
            self.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<Option<String>, TransportError> {
        let (mid, negotiate) = {
            let mut inner = self.inner.lock().unwrap();
            inner.check("remove_track")?;
            let position = inner.local.iter().position(|t| t.id == track_id);
            let removed = position.map(|i| inner.local.remove(i));
            (
                removed.filter(|t| t.bound).map(|t| t.mid),
                inner.auto_negotiation,
            )
        };
        if negotiate {
            self.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(mid)
    }

    async fn replace_track(
        &self,
        track_id: &str,
        replacement: Option<&MediaTrack>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check("replace_track")?;
        if let Some(track) = inner.local.iter_mut().find(|t| t.id == track_id) {
            track.muted = replacement.is_none();
        }
        Ok(())
    }

    async fn mid_of(&self, track_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .local
            .iter()
            .find(|t| t.id == track_id && t.bound)
            .map(|t| t.mid.clone())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push("close".to_string());
        inner.closed = true;
    }
}

/// Inspection and event-injection side of a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportHandle {
    inner: Arc<Mutex<MockTransportInner>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransportHandle {
    /// Every call in order (`"create_offer"`, `"candidate:<c>"`, ...).
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// How many times an operation was called.
    pub fn count(&self, op: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == op)
            .count()
    }

    /// Ids of local tracks currently sending.
    pub fn sending(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .local
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of local tracks currently muted.
    pub fn muted(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .local
            .iter()
            .filter(|t| t.muted)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of remote tracks currently received.
    pub fn receiving(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .remote
            .values()
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Start or stop failing an operation.
    pub fn set_failing(&self, op: &str, failing: bool) {
        let mut inner = self.inner.lock().unwrap();
        if failing {
            inner.failures.insert(op.to_string());
        } else {
            inner.failures.remove(op);
        }
    }

    /// Inject a transport event.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Gather a local ICE candidate.
    pub fn gather(&self, candidate: &str) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
    }

    pub fn ice_state(&self, state: IceConnectionState) {
        self.emit(TransportEvent::IceConnectionStateChanged(state));
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockTransportBuilder {
    label: String,
    failures: HashSet<String>,
    auto_negotiation: bool,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self {
            label: "mock".to_string(),
            failures: HashSet::new(),
            auto_negotiation: true,
        }
    }
}

impl MockTransportBuilder {
    /// Label written into generated descriptions and remote stream ids.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Fail every call of `op` (`"create_offer"`, `"rollback"`, ...).
    #[must_use]
    pub fn fail_on(mut self, op: impl Into<String>) -> Self {
        self.failures.insert(op.into());
        self
    }

    /// Don't emit `NegotiationNeeded` on track changes.
    #[must_use]
    pub fn without_auto_negotiation(mut self) -> Self {
        self.auto_negotiation = false;
        self
    }

    /// Build the transport parts and a handle to inspect them.
    #[must_use]
    pub fn build(self) -> (TransportParts, MockTransportHandle) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(MockTransportInner {
            label: self.label,
            failures: self.failures,
            auto_negotiation: self.auto_negotiation,
            ..MockTransportInner::default()
        }));

        let transport = MockTransport {
            inner: Arc::clone(&inner),
            events: events.clone(),
        };
        let handle = MockTransportHandle { inner, events };
        ((Box::new(transport), events_rx), handle)
    }
}

/// [`TransportFactory`] producing [`MockTransport`]s and keeping their handles.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    template: MockTransportBuilder,
    refused_peers: Arc<Mutex<HashSet<String>>>,
    created: Arc<Mutex<Vec<(String, String, MockTransportHandle)>>>,
}

impl MockTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `template` (failures, auto-negotiation) for every transport.
    #[must_use]
    pub fn with_template(mut self, template: MockTransportBuilder) -> Self {
        self.template = template;
        self
    }

    /// Refuse to create transports towards `peer`.
    #[must_use]
    pub fn refusing(self, peer: impl Into<String>) -> Self {
        self.refused_peers.lock().unwrap().insert(peer.into());
        self
    }

    /// The most recent transport from `local` to `peer`.
    pub fn handle(&self, local: &str, peer: &str) -> Option<MockTransportHandle> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(l, p, _)| l == local && p == peer)
            .map(|(_, _, h)| h.clone())
    }

    /// `(local, peer)` of every transport created, in order.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(l, p, _)| (l.clone(), p.clone()))
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, local: &str, peer: &str) -> Result<TransportParts, TransportError> {
        if self.refused_peers.lock().unwrap().contains(peer) {
            return Err(TransportError::Rejected(format!("no transport to {peer}")));
        }
        let (parts, handle) = self.template.clone().label(local).build();
        self.created
            .lock()
            .unwrap()
            .push((local.to_string(), peer.to_string(), handle));
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracks_flow_through_descriptions() {
        let ((alice, _alice_events), alice_handle) = MockTransport::builder().label("alice").build();
        let ((bob, mut bob_events), bob_handle) = MockTransport::builder().label("bob").build();

        alice
            .add_track(&MediaTrack::new("cam", MediaKind::Video))
            .await
            .unwrap();
        let offer = alice.create_offer().await.unwrap();
        alice.set_local_description(&offer).await.unwrap();
        bob.set_remote_description(&offer).await.unwrap();

        match bob_events.recv().await.unwrap() {
            TransportEvent::TrackAdded(track) => {
                assert_eq!(track.id, "cam");
                assert_eq!(track.streams, vec!["alice".to_string()]);
            }
            other => unreachable!("unexpected event {other:?}"),
        }
        assert_eq!(bob_handle.receiving(), vec!["cam".to_string()]);
        assert_eq!(alice.mid_of("cam").await.as_deref(), Some("0"));

        assert_eq!(alice.remove_track("cam").await.unwrap().as_deref(), Some("0"));
        let offer = alice.create_offer().await.unwrap();
        bob.set_remote_description(&offer).await.unwrap();
        assert_eq!(
            bob_events.recv().await.unwrap(),
            TransportEvent::TrackEnded { mid: "0".to_string() }
        );
        assert_eq!(alice_handle.count("create_offer"), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let ((transport, _events), handle) = MockTransport::builder().fail_on("create_offer").build();
        assert!(transport.create_offer().await.is_err());

        handle.set_failing("create_offer", false);
        assert!(transport.create_offer().await.is_ok());

        transport.close().await;
        assert_eq!(transport.create_offer().await, Err(TransportError::Closed));
    }

    #[test]
    fn test_factory_refuses_and_records() {
        let factory = MockTransportFactory::new().refusing("mallory");
        assert!(factory.create("alice", "mallory").is_err());
        assert!(factory.create("alice", "bob").is_ok());
        assert_eq!(factory.created(), vec![("alice".to_string(), "bob".to_string())]);
        assert!(factory.handle("alice", "bob").is_some());
    }
}
