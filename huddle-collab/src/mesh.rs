//! Full-mesh voice: one peer link per remote participant.
//!
//! ```text
//!   presence Joined(B) ──► A.precedes(B)? ── yes ─► create link, Offer ──► B
//!                                         └─ no ──► wait for B's Offer
//!
//!   Offer  (no link)   ──► create responder link, Answer ──► source
//!   Offer  (initiator) ──► ignored (glare: the incumbent already offered)
//!   Answer             ──► initiator applies it
//!   Ice                ──► added to the matching link
//!
//!   presence Left(B) / link Failed ──► close + remove link
//! ```
//!
//! Exactly one side of every pair initiates: the peer that joined first,
//! ties broken by peer id. Signals ride the room broadcast, addressed by
//! `target_peer`; everyone else discards them.
//!
//! Actual media plumbing sits behind [`MediaBackend`] / [`PeerLink`] so the
//! mesh logic runs unchanged against a native stack, a browser bridge, or a
//! test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use huddle_core::PeerId;

use crate::error::{MediaAccessError, SignalingError};
use crate::protocol::PresenceMeta;

// ───────────────────────────────────────────────────────────────────
// Signaling wire types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Ice(IceCandidate),
}

/// A signaling message addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub payload: SignalPayload,
    pub source_peer: PeerId,
    pub target_peer: PeerId,
}

// ───────────────────────────────────────────────────────────────────
// Media abstraction
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LocalCandidate { peer: PeerId, candidate: IceCandidate },
    StateChanged { peer: PeerId, state: LinkState },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Handle to the local microphone track.
///
/// Clones share state. Starts disabled: a newly joined participant is muted.
#[derive(Debug, Clone)]
pub struct LocalAudioTrack {
    id: String,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: Arc::new(AtomicBool::new(false)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled && self.is_live(), Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Release the device. A stopped track cannot be re-enabled.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// One negotiated audio connection to a remote peer.
#[async_trait]
pub trait PeerLink: Send {
    async fn create_offer(&mut self) -> Result<String, SignalingError>;

    /// Apply a remote offer and produce the answer SDP.
    async fn accept_offer(&mut self, sdp: &str) -> Result<String, SignalingError>;

    async fn accept_answer(&mut self, sdp: &str) -> Result<(), SignalingError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), SignalingError>;

    async fn close(&mut self);
}

/// Source of microphone tracks and peer links.
#[async_trait]
pub trait MediaBackend: Send {
    type Link: PeerLink;

    async fn open_microphone(&mut self) -> Result<LocalAudioTrack, MediaAccessError>;

    /// New link to `peer` carrying `track`. Candidates and state changes are
    /// reported on `events`.
    fn create_link(
        &mut self,
        peer: PeerId,
        track: &LocalAudioTrack,
        events: LinkEventSender,
    ) -> Result<Self::Link, SignalingError>;
}

/// Backend for participants without audio (headless clients, tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMedia;

/// Link type of [`NoMedia`]; never constructed.
#[derive(Debug)]
pub struct NoLink(PeerId);

#[async_trait]
impl PeerLink for NoLink {
    async fn create_offer(&mut self) -> Result<String, SignalingError> {
        Err(SignalingError::LinkFailed(self.0))
    }

    async fn accept_offer(&mut self, _sdp: &str) -> Result<String, SignalingError> {
        Err(SignalingError::LinkFailed(self.0))
    }

    async fn accept_answer(&mut self, _sdp: &str) -> Result<(), SignalingError> {
        Err(SignalingError::LinkFailed(self.0))
    }

    async fn add_ice_candidate(&mut self, _candidate: IceCandidate) -> Result<(), SignalingError> {
        Err(SignalingError::LinkFailed(self.0))
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl MediaBackend for NoMedia {
    type Link = NoLink;

    async fn open_microphone(&mut self) -> Result<LocalAudioTrack, MediaAccessError> {
        Err(MediaAccessError::NoDevice)
    }

    fn create_link(
        &mut self,
        peer: PeerId,
        _track: &LocalAudioTrack,
        _events: LinkEventSender,
    ) -> Result<Self::Link, SignalingError> {
        Err(SignalingError::LinkFailed(peer))
    }
}

// ───────────────────────────────────────────────────────────────────
// Mesh
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    Connecting,
    Connected,
    Closed,
}

pub struct PeerConnection<L> {
    peer_id: PeerId,
    state: SignalingState,
    is_initiator: bool,
    link: L,
}

impl<L> PeerConnection<L> {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshStatus {
    Idle,
    Active,
    /// Microphone could not be opened; the rest of the session is unaffected.
    Unavailable,
}

/// What the session should do with a link event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Signal(SignalEnvelope),
    Connected(PeerId),
    Failed(PeerId),
    Ignored,
}

pub struct AudioMesh<M: MediaBackend> {
    local: PresenceMeta,
    backend: M,
    track: Option<LocalAudioTrack>,
    connections: HashMap<PeerId, PeerConnection<M::Link>>,
    link_tx: LinkEventSender,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    status: MeshStatus,
}

impl<M: MediaBackend> AudioMesh<M> {
    pub fn new(local: PresenceMeta, backend: M) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Self {
            local,
            backend,
            track: None,
            connections: HashMap::new(),
            link_tx,
            link_rx: Some(link_rx),
            status: MeshStatus::Idle,
        }
    }

    /// Open the microphone (muted). On failure the mesh stays inert.
    pub async fn start(&mut self) -> Result<(), MediaAccessError> {
        match self.backend.open_microphone().await {
            Ok(track) => {
                track.set_enabled(false);
                log::info!("Microphone ready (track {})", track.id());
                self.track = Some(track);
                self.status = MeshStatus::Active;
                Ok(())
            }
            Err(e) => {
                self.status = MeshStatus::Unavailable;
                Err(e)
            }
        }
    }

    pub fn local(&self) -> &PresenceMeta {
        &self.local
    }

    /// Take the join time the room assigned to the local peer. Decides which
    /// side initiates each pair.
    pub fn set_local_joined_at(&mut self, joined_at: u64) {
        self.local.joined_at = joined_at;
    }

    /// Receiver for link events; can be taken once.
    pub fn take_link_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.link_rx.take()
    }

    /// React to a remote arrival. Returns the offer if we are the initiator.
    pub async fn on_join(
        &mut self,
        remote: &PresenceMeta,
    ) -> Result<Option<SignalEnvelope>, SignalingError> {
        if !self.is_active()
            || remote.peer_id == self.local.peer_id
            || self.connections.contains_key(&remote.peer_id)
        {
            return Ok(None);
        }
        if !self.local.precedes(remote) {
            log::debug!("Awaiting offer from {}", remote.peer_id.short());
            return Ok(None);
        }

        let peer = remote.peer_id;
        self.open_link(peer, true)?;
        let result = self.link_mut(&peer)?.create_offer().await;
        let offer = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                self.on_leave(&peer).await;
                return Err(e);
            }
        };
        log::debug!("Offering audio to {}", peer.short());
        Ok(Some(self.envelope(peer, SignalPayload::Offer { sdp: offer })))
    }

    /// Close and forget the link to `peer`.
    pub async fn on_leave(&mut self, peer: &PeerId) -> bool {
        match self.connections.remove(peer) {
            Some(mut conn) => {
                conn.link.close().await;
                log::debug!("Closed audio link to {}", peer.short());
                true
            }
            None => false,
        }
    }

    /// Drop links to peers that are no longer present.
    pub async fn retain_present<F>(&mut self, present: F) -> Vec<PeerId>
    where
        F: Fn(&PeerId) -> bool,
    {
        let gone: Vec<PeerId> = self
            .connections
            .keys()
            .filter(|peer| !present(peer))
            .copied()
            .collect();
        for peer in &gone {
            self.on_leave(peer).await;
        }
        gone
    }

    /// Handle a signaling message. Returns a reply to send back, if any.
    pub async fn on_signal(
        &mut self,
        envelope: SignalEnvelope,
    ) -> Result<Option<SignalEnvelope>, SignalingError> {
        if envelope.target_peer != self.local.peer_id || envelope.source_peer == self.local.peer_id {
            return Ok(None);
        }
        if !self.is_active() {
            return Ok(None);
        }

        let peer = envelope.source_peer;
        match envelope.payload {
            SignalPayload::Offer { sdp } => {
                match self.connections.get(&peer) {
                    Some(conn) if conn.is_initiator => {
                        log::warn!("Ignoring offer from {}: we initiate this pair", peer.short());
                        return Ok(None);
                    }
                    Some(_) => {}
                    None => self.open_link(peer, false)?,
                }
                let result = self.link_mut(&peer)?.accept_offer(&sdp).await;
                match result {
                    Ok(answer) => Ok(Some(self.envelope(peer, SignalPayload::Answer { sdp: answer }))),
                    Err(e) => {
                        self.on_leave(&peer).await;
                        Err(e)
                    }
                }
            }
            SignalPayload::Answer { sdp } => {
                match self.connections.get(&peer) {
                    Some(conn) if conn.is_initiator => {}
                    Some(_) => {
                        log::warn!("Unexpected answer from {}", peer.short());
                        return Ok(None);
                    }
                    None => {
                        log::debug!("Answer from {} without a link", peer.short());
                        return Ok(None);
                    }
                }
                let result = self.link_mut(&peer)?.accept_answer(&sdp).await;
                if let Err(e) = result {
                    self.on_leave(&peer).await;
                    return Err(e);
                }
                Ok(None)
            }
            SignalPayload::Ice(candidate) => {
                if !self.connections.contains_key(&peer) {
                    log::debug!("Candidate from {} without a link", peer.short());
                    return Ok(None);
                }
                let added = self.link_mut(&peer)?.add_ice_candidate(candidate).await;
                if let Err(e) = added {
                    self.on_leave(&peer).await;
                    return Err(e);
                }
                Ok(None)
            }
        }
    }

    /// Fold a link event into connection state.
    pub async fn on_link_event(&mut self, event: LinkEvent) -> LinkOutcome {
        match event {
            LinkEvent::LocalCandidate { peer, candidate } => {
                if !self.connections.contains_key(&peer) {
                    return LinkOutcome::Ignored;
                }
                LinkOutcome::Signal(self.envelope(peer, SignalPayload::Ice(candidate)))
            }
            LinkEvent::StateChanged { peer, state } => {
                let Some(conn) = self.connections.get_mut(&peer) else {
                    return LinkOutcome::Ignored;
                };
                match state {
                    LinkState::Connecting => {
                        conn.state = SignalingState::Connecting;
                        LinkOutcome::Ignored
                    }
                    LinkState::Connected => {
                        conn.state = SignalingState::Connected;
                        log::info!("Audio connected with {}", peer.short());
                        LinkOutcome::Connected(peer)
                    }
                    LinkState::Failed => {
                        log::warn!("Audio link to {} failed", peer.short());
                        self.on_leave(&peer).await;
                        LinkOutcome::Failed(peer)
                    }
                    LinkState::Closed => {
                        self.on_leave(&peer).await;
                        LinkOutcome::Ignored
                    }
                }
            }
        }
    }

    /// Returns `false` when there is no track to mute.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        match &self.track {
            Some(track) => {
                track.set_enabled(!muted);
                true
            }
            None => false,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.track.as_ref().map_or(true, |t| !t.is_enabled())
    }

    /// Stop the microphone, then close every link.
    pub async fn shutdown(&mut self) {
        if let Some(track) = self.track.take() {
            track.stop();
        }
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            self.on_leave(&peer).await;
        }
        if self.status == MeshStatus::Active {
            self.status = MeshStatus::Idle;
        }
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&PeerConnection<M::Link>> {
        self.connections.get(peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.connections.keys()
    }

    pub fn status(&self) -> MeshStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == MeshStatus::Active
    }

    pub fn track(&self) -> Option<&LocalAudioTrack> {
        self.track.as_ref()
    }

    pub fn backend(&self) -> &M {
        &self.backend
    }

    fn open_link(&mut self, peer: PeerId, is_initiator: bool) -> Result<(), SignalingError> {
        let track = self.track.as_ref().ok_or(SignalingError::LinkFailed(peer))?;
        let link = self.backend.create_link(peer, track, self.link_tx.clone())?;
        self.connections.insert(
            peer,
            PeerConnection {
                peer_id: peer,
                state: SignalingState::New,
                is_initiator,
                link,
            },
        );
        Ok(())
    }

    fn link_mut(&mut self, peer: &PeerId) -> Result<&mut M::Link, SignalingError> {
        self.connections
            .get_mut(peer)
            .map(|conn| {
                conn.state = match conn.state {
                    SignalingState::New => SignalingState::Connecting,
                    other => other,
                };
                &mut conn.link
            })
            .ok_or(SignalingError::UnknownPeer(*peer))
    }

    fn envelope(&self, target: PeerId, payload: SignalPayload) -> SignalEnvelope {
        SignalEnvelope {
            payload,
            source_peer: self.local.peer_id,
            target_peer: target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Link double that records every call.
    struct RecordingLink {
        peer: PeerId,
        log: Arc<Mutex<Vec<String>>>,
        fail_offer: bool,
        fail_ice: bool,
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn create_offer(&mut self) -> Result<String, SignalingError> {
            self.log.lock().unwrap().push(format!("offer:{}", self.peer.short()));
            if self.fail_offer {
                return Err(SignalingError::Negotiation {
                    peer: self.peer,
                    reason: "no codec".into(),
                });
            }
            Ok("sdp-offer".into())
        }

        async fn accept_offer(&mut self, sdp: &str) -> Result<String, SignalingError> {
            self.log.lock().unwrap().push(format!("accept_offer:{sdp}"));
            Ok("sdp-answer".into())
        }

        async fn accept_answer(&mut self, sdp: &str) -> Result<(), SignalingError> {
            self.log.lock().unwrap().push(format!("accept_answer:{sdp}"));
            Ok(())
        }

        async fn add_ice_candidate(&mut self, c: IceCandidate) -> Result<(), SignalingError> {
            self.log.lock().unwrap().push(format!("ice:{}", c.candidate));
            if self.fail_ice {
                return Err(SignalingError::Negotiation {
                    peer: self.peer,
                    reason: "bad candidate".into(),
                });
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.log.lock().unwrap().push(format!("close:{}", self.peer.short()));
        }
    }

    #[derive(Default)]
    struct RecordingMedia {
        log: Arc<Mutex<Vec<String>>>,
        deny: bool,
        fail_offer: bool,
        fail_ice: bool,
    }

    #[async_trait]
    impl MediaBackend for RecordingMedia {
        type Link = RecordingLink;

        async fn open_microphone(&mut self) -> Result<LocalAudioTrack, MediaAccessError> {
            if self.deny {
                return Err(MediaAccessError::Denied);
            }
            Ok(LocalAudioTrack::new("mic"))
        }

        fn create_link(
            &mut self,
            peer: PeerId,
            _track: &LocalAudioTrack,
            _events: LinkEventSender,
        ) -> Result<RecordingLink, SignalingError> {
            Ok(RecordingLink {
                peer,
                log: self.log.clone(),
                fail_offer: self.fail_offer,
                fail_ice: self.fail_ice,
            })
        }
    }

    fn meta(name: &str, joined_at: u64) -> PresenceMeta {
        PresenceMeta::with_joined_at(PeerId::random(), name, joined_at)
    }

    async fn started(local: PresenceMeta) -> AudioMesh<RecordingMedia> {
        let mut mesh = AudioMesh::new(local, RecordingMedia::default());
        mesh.start().await.unwrap();
        mesh
    }

    #[tokio::test]
    async fn test_starts_muted() {
        let mesh = started(meta("A", 1)).await;
        assert!(mesh.is_active());
        assert!(mesh.is_muted());
    }

    #[tokio::test]
    async fn test_denied_microphone_leaves_mesh_inert() {
        let mut mesh = AudioMesh::new(
            meta("A", 1),
            RecordingMedia {
                deny: true,
                ..Default::default()
            },
        );
        assert_eq!(mesh.start().await, Err(MediaAccessError::Denied));
        assert_eq!(mesh.status(), MeshStatus::Unavailable);

        let offer = mesh.on_join(&meta("B", 2)).await.unwrap();
        assert!(offer.is_none());
        assert!(!mesh.set_muted(false));
    }

    #[tokio::test]
    async fn test_incumbent_offers_newcomer_waits() {
        let a = meta("A", 1);
        let b = meta("B", 2);
        let mut mesh_a = started(a.clone()).await;
        let mut mesh_b = started(b.clone()).await;

        let offer = mesh_a.on_join(&b).await.unwrap().unwrap();
        assert_eq!(offer.target_peer, b.peer_id);
        assert!(mesh_a.connection(&b.peer_id).unwrap().is_initiator());

        assert!(mesh_b.on_join(&a).await.unwrap().is_none());
        assert_eq!(mesh_b.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let a = meta("A", 1);
        let b = meta("B", 2);
        let mut mesh_a = started(a.clone()).await;
        let mut mesh_b = started(b.clone()).await;

        let offer = mesh_a.on_join(&b).await.unwrap().unwrap();
        let answer = mesh_b.on_signal(offer).await.unwrap().unwrap();
        assert_eq!(answer.payload, SignalPayload::Answer { sdp: "sdp-answer".into() });
        assert!(!mesh_b.connection(&a.peer_id).unwrap().is_initiator());

        assert!(mesh_a.on_signal(answer).await.unwrap().is_none());
        let log = mesh_a.backend().log.lock().unwrap().clone();
        assert!(log.contains(&"accept_answer:sdp-answer".to_string()));
    }

    #[tokio::test]
    async fn test_initiator_ignores_offer() {
        let a = meta("A", 1);
        let b = meta("B", 2);
        let mut mesh_a = started(a.clone()).await;

        mesh_a.on_join(&b).await.unwrap();
        let glare = SignalEnvelope {
            payload: SignalPayload::Offer { sdp: "x".into() },
            source_peer: b.peer_id,
            target_peer: a.peer_id,
        };
        assert!(mesh_a.on_signal(glare).await.unwrap().is_none());
        assert_eq!(mesh_a.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_misaddressed_signal_discarded() {
        let a = meta("A", 1);
        let mut mesh = started(a).await;
        let env = SignalEnvelope {
            payload: SignalPayload::Offer { sdp: "x".into() },
            source_peer: PeerId::random(),
            target_peer: PeerId::random(),
        };
        assert!(mesh.on_signal(env).await.unwrap().is_none());
        assert_eq!(mesh.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_offer_removes_link() {
        let b = meta("B", 2);
        let mut mesh = AudioMesh::new(
            meta("A", 1),
            RecordingMedia {
                fail_offer: true,
                ..Default::default()
            },
        );
        mesh.start().await.unwrap();

        let err = mesh.on_join(&b).await.unwrap_err();
        assert_eq!(err.peer(), b.peer_id);
        assert_eq!(mesh.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_candidate_closes_link() {
        let a = meta("A", 1);
        let b = meta("B", 2);
        let c = meta("C", 3);
        let mut mesh = AudioMesh::new(
            a.clone(),
            RecordingMedia {
                fail_ice: true,
                ..Default::default()
            },
        );
        mesh.start().await.unwrap();
        mesh.on_join(&b).await.unwrap();
        mesh.on_join(&c).await.unwrap();

        let env = SignalEnvelope {
            payload: SignalPayload::Ice(IceCandidate {
                candidate: "candidate:9".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            }),
            source_peer: b.peer_id,
            target_peer: a.peer_id,
        };
        let err = mesh.on_signal(env).await.unwrap_err();
        assert_eq!(err.peer(), b.peer_id);
        assert!(mesh.connection(&b.peer_id).is_none());
        assert!(mesh.connection(&c.peer_id).is_some());

        let log = mesh.backend().log.lock().unwrap().clone();
        assert!(log.contains(&format!("close:{}", b.peer_id.short())));

        // A later join renegotiates from scratch.
        assert!(mesh.on_join(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_link_failure_isolated() {
        let b = meta("B", 2);
        let c = meta("C", 3);
        let mut mesh = started(meta("A", 1)).await;
        mesh.on_join(&b).await.unwrap();
        mesh.on_join(&c).await.unwrap();

        let outcome = mesh
            .on_link_event(LinkEvent::StateChanged {
                peer: b.peer_id,
                state: LinkState::Failed,
            })
            .await;
        assert_eq!(outcome, LinkOutcome::Failed(b.peer_id));
        assert!(mesh.connection(&c.peer_id).is_some());
        assert_eq!(mesh.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_local_candidate_becomes_signal() {
        let a = meta("A", 1);
        let b = meta("B", 2);
        let mut mesh = started(a.clone()).await;
        mesh.on_join(&b).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let outcome = mesh
            .on_link_event(LinkEvent::LocalCandidate {
                peer: b.peer_id,
                candidate: candidate.clone(),
            })
            .await;
        assert_eq!(
            outcome,
            LinkOutcome::Signal(SignalEnvelope {
                payload: SignalPayload::Ice(candidate),
                source_peer: a.peer_id,
                target_peer: b.peer_id,
            })
        );
    }

    #[tokio::test]
    async fn test_mute_toggles_track() {
        let mut mesh = started(meta("A", 1)).await;
        assert!(mesh.set_muted(false));
        assert!(!mesh.is_muted());
        assert!(mesh.track().unwrap().is_enabled());
        mesh.set_muted(true);
        assert!(mesh.is_muted());
    }

    #[tokio::test]
    async fn test_shutdown_stops_track_and_links() {
        let b = meta("B", 2);
        let mut mesh = started(meta("A", 1)).await;
        mesh.on_join(&b).await.unwrap();
        let track = mesh.track().unwrap().clone();

        mesh.shutdown().await;
        assert!(!track.is_live());
        track.set_enabled(true);
        assert!(!track.is_enabled());
        assert_eq!(mesh.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_retain_present() {
        let b = meta("B", 2);
        let c = meta("C", 3);
        let mut mesh = started(meta("A", 1)).await;
        mesh.on_join(&b).await.unwrap();
        mesh.on_join(&c).await.unwrap();

        let keep = b.peer_id;
        let gone = mesh.retain_present(|p| *p == keep).await;
        assert_eq!(gone, vec![c.peer_id]);
        assert_eq!(mesh.connection_count(), 1);
    }
}
