//! Room session: one participant's view of one room.
//!
//! ```text
//!                  ┌──────────────────── RoomSession ────────────────────┐
//!  Channel ──────► │ dispatch(SessionEvent)                              │
//!  (events)        │   ├─ RemotePut/Delete ──► DocumentSyncEngine        │
//!                  │   ├─ Join/Leave/Sync  ──► PresenceManager ──┐       │
//!  Commands ─────► │   │                          transitions ◄──┘       │
//!  (UI)            │   │                          ├─► CursorService      │
//!                  │   │                          └─► AudioMesh          │
//!  Link events ──► │   ├─ Signal/Cursor    ──► AudioMesh / CursorService │
//!  (mesh)          │   └─ ChannelStatus    ──► ChannelSession (retry)    │
//!                  └──────────────────────────┬──────────────────────────┘
//!                                             ▼
//!                                   SessionNotice ──► UI
//! ```
//!
//! All state is owned by the session and mutated from one task, so no
//! locking is involved. [`RoomSession::run`] drives it from a select loop;
//! tests drive it step by step with [`RoomSession::pump`] and
//! [`RoomSession::tick`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use huddle_core::{
    DocumentSyncEngine, LocalEdit, MergeOutcome, Mutation, Payload, RecordId, RemoteOutcome, RoomId,
};

use crate::channel::{Channel, ChannelEvent, ChannelStatus, EventReceiver};
use crate::config::SessionConfig;
use crate::cursor::{CursorService, Vec2};
use crate::error::{SessionClosed, SignalingError};
use crate::event::{Command, SessionEvent, SessionNotice};
use crate::mesh::{AudioMesh, LinkEvent, LinkOutcome, MediaBackend};
use crate::presence::{PresenceManager, PresenceTransition};
use crate::protocol::{BroadcastMessage, PresenceMeta};
use crate::reconnect::{ChannelSession, OfflineQueue, ReconnectPolicy, RetryDecision};

/// Who is joining what, and how.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub room: RoomId,
    pub local: PresenceMeta,
    pub config: SessionConfig,
}

impl SessionContext {
    pub fn new(room: impl Into<RoomId>, local: PresenceMeta) -> Self {
        Self {
            room: room.into(),
            local,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }
}

pub struct RoomSession<C: Channel, M: MediaBackend> {
    ctx: SessionContext,
    channel: C,
    lifecycle: ChannelSession,
    events: Option<EventReceiver>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    engine: DocumentSyncEngine,
    presence: PresenceManager,
    cursors: CursorService,
    mesh: AudioMesh<M>,
    offline: OfflineQueue,
    notices: mpsc::Sender<SessionNotice>,
    next_prune: Instant,
    left: bool,
}

impl<C: Channel, M: MediaBackend> RoomSession<C, M> {
    /// Build a session. Nothing happens until [`enter`](Self::enter).
    pub fn new(ctx: SessionContext, channel: C, media: M) -> (Self, mpsc::Receiver<SessionNotice>) {
        let (notices, notice_rx) = mpsc::channel(ctx.config.notice_capacity);
        let config = &ctx.config;
        let session = Self {
            lifecycle: ChannelSession::new(
                ctx.room.clone(),
                ReconnectPolicy::new(config.retry_base_delay, config.max_retries),
            ),
            events: None,
            link_events: None,
            engine: DocumentSyncEngine::new(ctx.local.peer_id, config.ephemeral_tags.clone()),
            presence: PresenceManager::new(ctx.local.peer_id),
            cursors: CursorService::new(&ctx.local, config.cursor_interval),
            mesh: AudioMesh::new(ctx.local.clone(), media),
            offline: OfflineQueue::new(config.offline_queue_capacity),
            notices,
            next_prune: Instant::now() + config.prune_interval,
            left: false,
            channel,
            ctx,
        };
        (session, notice_rx)
    }

    /// Start local media, then subscribe. A missing microphone only
    /// disables audio.
    pub async fn enter(&mut self) {
        log::info!(
            "{} entering room {}",
            self.ctx.local.display_name,
            self.ctx.room
        );
        if let Err(e) = self.mesh.start().await {
            log::warn!("Audio unavailable: {e}");
            self.notify(SessionNotice::MediaUnavailable(e.to_string()));
        }
        self.link_events = self.mesh.take_link_events();
        self.connect().await;
    }

    // ─── Event dispatch ───────────────────────────────────────────────

    pub async fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::RemotePut { mutation, via } | SessionEvent::RemoteDelete { mutation, via } => {
                let id = mutation.id().clone();
                let outcome = self.engine.on_remote(mutation, via, Instant::now().into_std());
                if let RemoteOutcome::Merged(merged) = outcome {
                    self.notify_merge(&id, merged);
                }
            }
            SessionEvent::LocalPut(edit) | SessionEvent::LocalDelete(edit) => {
                self.apply_edits(vec![edit]).await;
            }
            SessionEvent::Join(meta) => {
                self.adopt_local(&meta);
                let transition = self.presence.on_join(meta);
                self.on_presence(transition.into_iter().collect()).await;
            }
            SessionEvent::Leave(peer) => {
                let transition = self.presence.on_leave(&peer);
                self.on_presence(transition.into_iter().collect()).await;
            }
            SessionEvent::Sync(members) => {
                let local = self.ctx.local.peer_id;
                if let Some(me) = members.iter().find(|m| m.peer_id == local).cloned() {
                    self.adopt_local(&me);
                }
                let transitions = self.presence.on_sync(members);
                self.on_presence(transitions).await;
                let presence = &self.presence;
                self.mesh.retain_present(|peer| presence.contains(peer)).await;
            }
            SessionEvent::ChannelStatusChanged(status) => self.on_status(status).await,
            SessionEvent::SignalReceived(envelope) => {
                let reply = self.mesh.on_signal(envelope).await;
                match reply {
                    Ok(Some(reply)) => self.send(BroadcastMessage::Signal(reply)).await,
                    Ok(None) => {}
                    Err(e) => self.link_failed(e),
                }
            }
            SessionEvent::CursorReceived(state) => {
                if self.cursors.on_remote(state.clone(), &self.presence) {
                    self.notify(SessionNotice::CursorMoved(state));
                }
            }
            SessionEvent::PointerMoved(position) => self.move_pointer(position).await,
            SessionEvent::PersistFailed { id, reason } => {
                log::error!("Relay could not persist {id}: {reason}");
                self.notify(SessionNotice::PersistFailed { id, reason });
            }
        }
    }

    /// The room, not the local clock, decides when we joined.
    fn adopt_local(&mut self, meta: &PresenceMeta) {
        if meta.peer_id != self.ctx.local.peer_id || meta.joined_at == self.mesh.local().joined_at {
            return;
        }
        log::debug!("Room assigned join time {}", meta.joined_at);
        self.ctx.local.joined_at = meta.joined_at;
        self.mesh.set_local_joined_at(meta.joined_at);
    }

    fn notify_merge(&self, id: &RecordId, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted | MergeOutcome::Updated => {
                if let Some(record) = self.engine.store().get(id) {
                    self.notify(SessionNotice::RecordChanged(record.clone()));
                }
            }
            MergeOutcome::Removed => self.notify(SessionNotice::RecordRemoved(id.clone())),
            _ => {}
        }
    }

    async fn on_presence(&mut self, transitions: Vec<PresenceTransition>) {
        if transitions.is_empty() {
            return;
        }
        for transition in transitions {
            self.on_transition(transition).await;
        }
        self.notify(SessionNotice::PeerCountChanged(self.presence.peer_count()));
    }

    async fn on_transition(&mut self, transition: PresenceTransition) {
        if transition.peer() == self.ctx.local.peer_id {
            return;
        }
        match transition {
            PresenceTransition::Joined(meta) => {
                log::info!("{} joined {}", meta.display_name, self.ctx.room);
                if let Some(state) = self.cursors.announce() {
                    self.send(BroadcastMessage::Cursor(state)).await;
                }
                let offer = self.mesh.on_join(&meta).await;
                match offer {
                    Ok(Some(offer)) => self.send(BroadcastMessage::Signal(offer)).await,
                    Ok(None) => {}
                    Err(e) => self.link_failed(e),
                }
            }
            PresenceTransition::Left(peer) => {
                log::info!("Peer {} left {}", peer.short(), self.ctx.room);
                if self.cursors.on_leave(&peer) {
                    self.notify(SessionNotice::CursorRemoved(peer));
                }
                self.mesh.on_leave(&peer).await;
            }
        }
    }

    async fn on_status(&mut self, status: ChannelStatus) {
        if self.left {
            return;
        }
        self.notify(SessionNotice::StatusChanged(status));
        match self.lifecycle.on_status(status, Instant::now()) {
            RetryDecision::Idle => {
                if status == ChannelStatus::Connected {
                    log::info!("Connected to room {}", self.ctx.room);
                    self.flush_offline().await;
                }
            }
            RetryDecision::RetryAfter(delay) => {
                log::warn!(
                    "Channel to {} {status:?}, retry {} in {delay:?}",
                    self.ctx.room,
                    self.lifecycle.retry_count()
                );
                self.teardown_channel().await;
                self.notify(SessionNotice::StatusChanged(ChannelStatus::Retrying));
            }
            RetryDecision::GiveUp => {
                log::error!(
                    "Giving up on room {} after {} failures",
                    self.ctx.room,
                    self.lifecycle.retry_count()
                );
                self.teardown_channel().await;
                self.notify(SessionNotice::StatusChanged(ChannelStatus::Disconnected));
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        let outcome = self.mesh.on_link_event(event).await;
        match outcome {
            LinkOutcome::Signal(envelope) => self.send(BroadcastMessage::Signal(envelope)).await,
            LinkOutcome::Failed(peer) => self.notify(SessionNotice::PeerLinkFailed {
                peer,
                reason: "connection failed".into(),
            }),
            LinkOutcome::Connected(_) | LinkOutcome::Ignored => {}
        }
    }

    fn link_failed(&self, e: SignalingError) {
        log::warn!("Audio link error: {e}");
        self.notify(SessionNotice::PeerLinkFailed {
            peer: e.peer(),
            reason: e.to_string(),
        });
    }

    // ─── Local operations ─────────────────────────────────────────────

    /// Apply edits locally, fan them out, and persist the durable ones.
    pub async fn apply_edits(&mut self, edits: Vec<LocalEdit>) {
        let outbound = match self.engine.apply_local(edits, Instant::now().into_std()) {
            Ok(outbound) => outbound,
            Err(e) => {
                log::warn!("Rejected local edit: {e}");
                self.notify(SessionNotice::EditRejected(e.to_string()));
                return;
            }
        };

        for mutation in &outbound.broadcast {
            match mutation {
                Mutation::Put { record, .. } => {
                    self.notify(SessionNotice::RecordChanged(record.clone()))
                }
                Mutation::Delete { id, .. } => self.notify(SessionNotice::RecordRemoved(id.clone())),
            }
        }
        for mutation in outbound.broadcast {
            self.send(BroadcastMessage::Mutation(mutation)).await;
        }
        for mutation in outbound.durable {
            self.persist(mutation).await;
        }
    }

    pub async fn put(&mut self, id: impl Into<RecordId>, type_tag: &str, payload: impl Into<Payload>) {
        self.apply_edits(vec![LocalEdit::put(id, type_tag, payload)]).await;
    }

    pub async fn delete(&mut self, id: impl Into<RecordId>) {
        self.apply_edits(vec![LocalEdit::delete(id)]).await;
    }

    pub async fn move_pointer(&mut self, position: Vec2) {
        if let Some(state) = self.cursors.pointer_moved(Instant::now(), position) {
            self.send(BroadcastMessage::Cursor(state)).await;
        }
    }

    pub fn set_muted(&mut self, muted: bool) -> bool {
        self.mesh.set_muted(muted)
    }

    async fn send(&mut self, message: BroadcastMessage) {
        if self.lifecycle.status() != ChannelStatus::Connected {
            log::trace!("Offline, not sending {}", message.kind());
            return;
        }
        if let Err(e) = self.channel.broadcast(message).await {
            log::debug!("Broadcast failed: {e}");
        }
    }

    async fn persist(&mut self, mutation: Mutation) {
        if self.lifecycle.status() != ChannelStatus::Connected {
            let id = mutation.id().clone();
            if !self.offline.enqueue(mutation) {
                log::error!("Offline queue full, dropping write of {id}");
                self.notify(SessionNotice::PersistFailed {
                    id,
                    reason: "offline queue full".into(),
                });
            }
            return;
        }
        let id = mutation.id().clone();
        if let Err(e) = self.channel.persist(mutation).await {
            log::error!("Persist of {id} failed: {e}");
            self.notify(SessionNotice::PersistFailed {
                id,
                reason: e.to_string(),
            });
        }
    }

    async fn flush_offline(&mut self) {
        let queued = self.offline.drain();
        if queued.is_empty() {
            return;
        }
        log::info!("Replaying {} queued writes", queued.len());
        for mutation in queued {
            self.persist(mutation).await;
        }
    }

    // ─── Channel lifecycle ────────────────────────────────────────────

    async fn connect(&mut self) {
        let timeout = self.ctx.config.subscribe_timeout;
        self.lifecycle.begin_attempt(Instant::now() + timeout);
        self.notify(SessionNotice::StatusChanged(ChannelStatus::Connecting));
        // Until the room admits us, everyone already present precedes us.
        self.mesh.set_local_joined_at(u64::MAX);

        let attempt = tokio::time::timeout(
            timeout,
            self.channel.subscribe(&self.ctx.room, &self.ctx.local),
        )
        .await;

        match attempt {
            Ok(Ok(events)) => self.events = Some(events),
            Ok(Err(e)) => {
                log::warn!("Subscribe to {} failed: {e}", self.ctx.room);
                self.on_status(ChannelStatus::Error).await;
            }
            Err(_) => {
                log::warn!("Subscribe to {} timed out after {timeout:?}", self.ctx.room);
                self.on_status(ChannelStatus::Timeout).await;
            }
        }
    }

    async fn teardown_channel(&mut self) {
        self.events = None;
        self.channel.unsubscribe().await;
    }

    /// Manual reconnect: fresh retry budget, full teardown, resubscribe.
    pub async fn reconnect(&mut self) {
        if self.left {
            return;
        }
        log::info!("Manual reconnect to {}", self.ctx.room);
        self.lifecycle.manual_reset();
        self.teardown_channel().await;
        self.connect().await;
    }

    /// Leave the room. Idempotent.
    ///
    /// Order: stop listening, leave presence and close the channel, stop the
    /// microphone, then close every peer link.
    pub async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.events = None;
        self.link_events = None;
        self.channel.unsubscribe().await;
        self.lifecycle.close();
        self.mesh.shutdown().await;
        self.cursors.clear();
        self.presence.clear();
        if !self.offline.is_empty() {
            log::warn!("Leaving with {} unsent writes", self.offline.len());
            self.offline.clear();
        }
        self.notify(SessionNotice::StatusChanged(ChannelStatus::Disconnected));
        log::info!("{} left room {}", self.ctx.local.display_name, self.ctx.room);
    }

    // ─── Driving ──────────────────────────────────────────────────────

    /// Dispatch everything already queued on the channel and link streams.
    /// Returns how many items were handled.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;

            let next = match self.events.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(event) => Some(Ok(event)),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(())),
                },
                None => None,
            };
            match next {
                Some(Ok(event)) => {
                    self.on_channel_event(event).await;
                    handled += 1;
                    progressed = true;
                }
                Some(Err(())) => {
                    self.on_channel_closed().await;
                    progressed = true;
                }
                None => {}
            }

            let link = self.link_events.as_mut().and_then(|rx| rx.try_recv().ok());
            if let Some(event) = link {
                self.on_link_event(event).await;
                handled += 1;
                progressed = true;
            }

            if !progressed {
                return handled;
            }
        }
    }

    /// Fire whatever timers are due: trailing cursor update, join deadline,
    /// scheduled retry, tombstone sweep.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        if let Some(state) = self.cursors.flush_due(now) {
            self.send(BroadcastMessage::Cursor(state)).await;
        }
        if self.lifecycle.connect_overdue(now) {
            log::warn!(
                "Room {} not joined within {:?}",
                self.ctx.room,
                self.ctx.config.subscribe_timeout
            );
            self.on_status(ChannelStatus::Timeout).await;
        }
        if self.lifecycle.retry_due(now) {
            log::info!(
                "Retrying room {} (attempt {})",
                self.ctx.room,
                self.lifecycle.retry_count() + 1
            );
            self.teardown_channel().await;
            self.connect().await;
        }
        if now >= self.next_prune {
            self.engine
                .prune(now.into_std(), self.ctx.config.tombstone_ttl);
            self.next_prune = now + self.ctx.config.prune_interval;
        }
    }

    fn next_deadline(&self) -> Instant {
        [
            self.cursors.next_deadline(),
            self.lifecycle.retry_at(),
            self.lifecycle.connect_deadline(),
        ]
        .into_iter()
        .flatten()
        .fold(self.next_prune, Instant::min)
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        for event in SessionEvent::from_channel(event) {
            self.dispatch(event).await;
        }
    }

    async fn on_channel_closed(&mut self) {
        log::warn!("Channel to {} closed", self.ctx.room);
        self.events = None;
        self.on_status(ChannelStatus::Error).await;
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Edit(edits) => self.apply_edits(edits).await,
            Command::PointerMoved(position) => self.move_pointer(position).await,
            Command::SetMuted(muted) => {
                if !self.set_muted(muted) {
                    log::debug!("No microphone to mute");
                }
            }
            Command::Reconnect => self.reconnect().await,
            Command::Leave => self.leave().await,
        }
    }

    /// Enter the room and serve until `Leave` or every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.enter().await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = recv_event(&mut self.events) => match event {
                    Some(event) => self.on_channel_event(event).await,
                    None => self.on_channel_closed().await,
                },
                Some(event) = recv_link(&mut self.link_events) => {
                    self.on_link_event(event).await;
                }
                command = commands.recv() => match command {
                    Some(Command::Leave) | None => {
                        self.leave().await;
                        break;
                    }
                    Some(command) => self.execute(command).await,
                },
                _ = tokio::time::sleep_until(deadline) => self.tick().await,
            }
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn engine(&self) -> &DocumentSyncEngine {
        &self.engine
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn cursors(&self) -> &CursorService {
        &self.cursors
    }

    pub fn mesh(&self) -> &AudioMesh<M> {
        &self.mesh
    }

    pub fn status(&self) -> ChannelStatus {
        self.lifecycle.status()
    }

    pub fn retry_count(&self) -> u32 {
        self.lifecycle.retry_count()
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    fn notify(&self, notice: SessionNotice) {
        if let Err(mpsc::error::TrySendError::Full(notice)) = self.notices.try_send(notice) {
            log::warn!("Notice queue full, dropping {notice:?}");
        }
    }
}

impl<C, M> RoomSession<C, M>
where
    C: Channel + 'static,
    M: MediaBackend + 'static,
    M::Link: 'static,
{
    /// Run on a background task.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(self.run(rx));
        (SessionHandle { tx }, task)
    }
}

async fn recv_event(rx: &mut Option<EventReceiver>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        // Not subscribed: wait forever
        None => std::future::pending().await,
    }
}

async fn recv_link(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable command sender for a spawned session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> Result<(), SessionClosed> {
        self.tx.send(command).await.map_err(|_| SessionClosed)
    }

    pub async fn edit(&self, edits: Vec<LocalEdit>) -> Result<(), SessionClosed> {
        self.send(Command::Edit(edits)).await
    }

    pub async fn put(
        &self,
        id: impl Into<RecordId>,
        type_tag: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<(), SessionClosed> {
        self.edit(vec![LocalEdit::put(id, type_tag, payload)]).await
    }

    pub async fn delete(&self, id: impl Into<RecordId>) -> Result<(), SessionClosed> {
        self.edit(vec![LocalEdit::delete(id)]).await
    }

    pub async fn move_pointer(&self, position: Vec2) -> Result<(), SessionClosed> {
        self.send(Command::PointerMoved(position)).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionClosed> {
        self.send(Command::SetMuted(muted)).await
    }

    pub async fn reconnect(&self) -> Result<(), SessionClosed> {
        self.send(Command::Reconnect).await
    }

    pub async fn leave(&self) -> Result<(), SessionClosed> {
        self.send(Command::Leave).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::error::{PersistenceError, TransportError};
    use crate::mesh::NoMedia;
    use async_trait::async_trait;
    use huddle_core::PeerId;
    use serde_json::json;
    use std::time::Duration;

    /// Accepts the subscription but never hears back from the room.
    #[derive(Default)]
    struct SilentChannel {
        subscribes: usize,
        held: Vec<mpsc::Sender<ChannelEvent>>,
    }

    #[async_trait]
    impl Channel for SilentChannel {
        async fn subscribe(
            &mut self,
            _room: &RoomId,
            _meta: &PresenceMeta,
        ) -> Result<EventReceiver, TransportError> {
            self.subscribes += 1;
            let (tx, rx) = mpsc::channel(8);
            self.held.push(tx);
            Ok(rx)
        }

        async fn unsubscribe(&mut self) {
            self.held.clear();
        }

        async fn broadcast(&mut self, _message: BroadcastMessage) -> Result<(), TransportError> {
            Ok(())
        }

        async fn persist(&mut self, _mutation: Mutation) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    type Session = RoomSession<crate::channel::MemoryChannel, NoMedia>;

    fn session(hub: &MemoryHub, name: &str) -> (Session, mpsc::Receiver<SessionNotice>) {
        let ctx = SessionContext::new("board", PresenceMeta::new(PeerId::random(), name))
            .with_config(SessionConfig::for_testing());
        RoomSession::new(ctx, hub.channel(), NoMedia)
    }

    /// Let forwarder tasks run, dispatching whatever they deliver.
    async fn settle(s: &mut Session) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
            s.pump().await;
        }
    }

    fn drain(rx: &mut mpsc::Receiver<SessionNotice>) -> Vec<SessionNotice> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_enter_without_microphone() {
        let hub = MemoryHub::new();
        let (mut s, mut notices) = session(&hub, "Alice");
        s.enter().await;
        settle(&mut s).await;

        assert_eq!(s.status(), ChannelStatus::Connected);
        let notices = drain(&mut notices);
        assert!(notices.iter().any(|n| matches!(n, SessionNotice::MediaUnavailable(_))));
        assert!(notices.contains(&SessionNotice::StatusChanged(ChannelStatus::Connected)));
        assert_eq!(s.presence().peer_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_edit_rejected() {
        let hub = MemoryHub::new();
        let (mut s, mut notices) = session(&hub, "Alice");
        s.enter().await;
        settle(&mut s).await;
        drain(&mut notices);

        s.put("", "shape", json!(1)).await;
        assert!(matches!(
            drain(&mut notices).as_slice(),
            [SessionNotice::EditRejected(_)]
        ));
        assert!(s.engine().store().is_empty());
    }

    #[tokio::test]
    async fn test_edits_before_connect_are_queued() {
        let hub = MemoryHub::new();
        let (mut s, _notices) = session(&hub, "Alice");

        s.put("shape-1", "shape", json!(1)).await;
        s.put("cam", "camera", json!({})).await;
        assert_eq!(s.offline_len(), 1);

        s.enter().await;
        settle(&mut s).await;
        assert_eq!(s.offline_len(), 0);

        let room = hub.registry().get(&RoomId::new("board")).await.unwrap();
        assert_eq!(room.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let hub = MemoryHub::new();
        let (mut s, mut notices) = session(&hub, "Alice");
        s.enter().await;
        settle(&mut s).await;

        s.leave().await;
        s.leave().await;
        assert!(s.has_left());
        assert_eq!(s.status(), ChannelStatus::Disconnected);
        assert_eq!(hub.registry().room_count().await, 0);

        let disconnects = drain(&mut notices)
            .into_iter()
            .filter(|n| *n == SessionNotice::StatusChanged(ChannelStatus::Disconnected))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_persist_failure_reported() {
        let hub = MemoryHub::new();
        let (mut s, mut notices) = session(&hub, "Alice");
        s.enter().await;
        settle(&mut s).await;
        drain(&mut notices);

        s.dispatch(SessionEvent::PersistFailed {
            id: "shape-1".into(),
            reason: "disk full".into(),
        })
        .await;
        assert_eq!(
            drain(&mut notices),
            vec![SessionNotice::PersistFailed {
                id: "shape-1".into(),
                reason: "disk full".into()
            }]
        );
        // Nothing else changes.
        assert_eq!(s.status(), ChannelStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_join_times_out() {
        let config = SessionConfig::for_testing();
        let ctx = SessionContext::new("board", PresenceMeta::new(PeerId::random(), "Alice"))
            .with_config(config.clone());
        let (mut s, mut notices) = RoomSession::new(ctx, SilentChannel::default(), NoMedia);

        s.enter().await;
        s.pump().await;
        assert_eq!(s.status(), ChannelStatus::Connecting);
        assert!(s.next_deadline() <= Instant::now() + config.subscribe_timeout);

        tokio::time::advance(config.subscribe_timeout + Duration::from_millis(1)).await;
        s.tick().await;

        assert_eq!(s.status(), ChannelStatus::Retrying);
        assert_eq!(s.retry_count(), 1);
        let seen = drain(&mut notices);
        assert!(seen.contains(&SessionNotice::StatusChanged(ChannelStatus::Timeout)));

        // The scheduled retry subscribes again.
        tokio::time::advance(config.retry_base_delay).await;
        s.tick().await;
        assert_eq!(s.status(), ChannelStatus::Connecting);
        assert_eq!(s.channel.subscribes, 2);
    }
}
