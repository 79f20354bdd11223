//! WebSocket relay: room routing, presence, and the durable store.
//!
//! ```text
//! Peer A ──┐                         ┌── Repository (RocksDB / memory)
//!          ├── Join(room) ── RoomGroup ──┤
//! Peer B ──┘       │                 └── broadcast::Sender<ServerFrame>
//!                  │                              │
//!                  │          ┌───────────────────┼──────────────┐
//!                  ▼          ▼                   ▼              ▼
//!               Loaded     Peer A              Peer B         Peer C
//! ```
//!
//! Each connection joins exactly one room. The relay stamps every
//! broadcast with the connection's peer id, so receivers can reject
//! messages whose claimed sender differs. A connection that falls behind
//! the room's buffer is sent a fresh snapshot instead of the missed frames.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Admission, RoomGroup, RoomRegistry};
use crate::error::RelayError;
use crate::persistence::{MemoryRepository, Repository, RocksRepository, StoreConfig};
use crate::protocol::{ClientFrame, ServerFrame};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How often every room re-announces its member list
    pub heartbeat_interval: Duration,
    /// Joins beyond this are rejected
    pub max_peers_per_room: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How long stored tombstones are kept; swept on every heartbeat
    pub tombstone_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 1024,
            heartbeat_interval: Duration::from_secs(30),
            max_peers_per_room: 100,
            storage_path: None,
            tombstone_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub rejected_joins: u64,
    pub failed_writes: u64,
    pub active_rooms: usize,
}

pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Opens RocksDB when `storage_path` is set, otherwise keeps rooms in memory.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let repository: Arc<dyn Repository> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksRepository::open(store_config)?)
            }
            None => Arc::new(MemoryRepository::new()),
        };
        Ok(Self::with_repository(config, repository))
    }

    pub fn with_repository(config: RelayConfig, repository: Arc<dyn Repository>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(config.broadcast_capacity, repository)),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            config,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        match self.registry.repository().rooms() {
            Ok(rooms) if !rooms.is_empty() => {
                log::info!("{} rooms have stored state", rooms.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not list stored rooms: {e}"),
        }

        let registry = self.registry.clone();
        let interval = self.config.heartbeat_interval;
        let ttl = self.config.tombstone_ttl;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let rooms = registry.announce_all().await;
                log::trace!("Heartbeat announced presence in {rooms} rooms");
                if let Err(e) = registry.repository().prune_tombstones(ttl) {
                    log::warn!("Tombstone sweep failed: {e}");
                }
            }
        });

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(RelayError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                addr,
                registry: self.registry.clone(),
                stats: self.stats.clone(),
                max_peers: self.config.max_peers_per_room,
                membership: None,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.handle(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        heartbeat.abort();
        result
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct Membership {
    group: Arc<RoomGroup>,
    admission: Admission,
    rx: broadcast::Receiver<Arc<ServerFrame>>,
}

struct Connection {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
    max_peers: usize,
    membership: Option<Membership>,
}

/// Whether the connection should stay open after a frame.
enum Flow {
    Continue,
    Close,
}

impl Connection {
    async fn handle(mut self, stream: TcpStream) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws_stream.split();
        log::info!("WebSocket connection established from {}", self.addr);
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.pump(&mut sink, &mut source).await;

        if let Some(membership) = self.membership.take() {
            membership.group.untrack(&membership.admission).await;
            if self.registry.remove_if_empty(membership.group.room()).await {
                log::info!("Room {} removed (empty)", membership.group.room());
            }
        }
        let _ = sink.close().await;
        self.stats.write().await.active_connections -= 1;
        result
    }

    async fn pump(
        &mut self,
        sink: &mut WsSink,
        source: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<(), RelayError> {
        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.write().await.total_frames += 1;
                        let frame = match ClientFrame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {}: {e}", self.addr);
                                continue;
                            }
                        };
                        if let Flow::Close = self.on_frame(frame, sink).await? {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {}", self.addr);
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {}: {e}", self.addr);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                },

                frame = recv_room(&mut self.membership) => match frame {
                    Ok(frame) => send_frame(sink, &frame).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("{} lagged by {n} frames, resyncing", self.addr);
                        if let Flow::Close = self.resync(sink).await? {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn on_frame(&mut self, frame: ClientFrame, sink: &mut WsSink) -> Result<Flow, RelayError> {
        let (group, peer) = match (&frame, &self.membership) {
            (ClientFrame::Join { room, meta }, None) => {
                let group = self.registry.get_or_create(room).await;
                if group.member_count().await >= self.max_peers {
                    log::warn!("Room {room} is full, rejecting {}", meta.peer_id);
                    self.stats.write().await.rejected_joins += 1;
                    send_frame(sink, &ServerFrame::Rejected("room is full".into())).await?;
                    return Ok(Flow::Close);
                }
                // Subscribed before loading so no write falls in between.
                let rx = group.subscribe();
                let loaded = match group.load() {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        log::error!("Could not load room {room}: {e}");
                        send_frame(sink, &ServerFrame::Rejected(e.to_string())).await?;
                        self.registry.remove_if_empty(room).await;
                        return Ok(Flow::Close);
                    }
                };
                send_frame(sink, &ServerFrame::Loaded(loaded)).await?;
                let admission = group.admit(meta.clone()).await;
                self.membership = Some(Membership { group, admission, rx });
                return Ok(Flow::Continue);
            }
            (ClientFrame::Ping, _) => {
                send_frame(sink, &ServerFrame::Pong).await?;
                return Ok(Flow::Continue);
            }
            (ClientFrame::Leave, _) => return Ok(Flow::Close),
            (_, None) => {
                log::warn!("Frame from {} before join, ignoring", self.addr);
                return Ok(Flow::Continue);
            }
            (ClientFrame::Join { .. }, Some(_)) => {
                log::warn!("Duplicate join from {}, ignoring", self.addr);
                return Ok(Flow::Continue);
            }
            (_, Some(m)) => (m.group.clone(), m.admission.meta.peer_id),
        };

        match frame {
            ClientFrame::Broadcast(message) => {
                group.publish(peer, message);
            }
            ClientFrame::Persist(mutation) => {
                if let Err(e) = group.persist(&mutation) {
                    self.stats.write().await.failed_writes += 1;
                    let failed = ServerFrame::PersistFailed {
                        id: mutation.id().clone(),
                        reason: e.to_string(),
                    };
                    send_frame(sink, &failed).await?;
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    /// Replace whatever was skipped with the current room state.
    async fn resync(&mut self, sink: &mut WsSink) -> Result<Flow, RelayError> {
        let Some(membership) = &self.membership else {
            return Ok(Flow::Continue);
        };
        match membership.group.resync().await {
            Ok(frames) => {
                for frame in &frames {
                    send_frame(sink, frame).await?;
                }
                Ok(Flow::Continue)
            }
            Err(e) => {
                log::error!("Could not resync {}: {e}", self.addr);
                Ok(Flow::Close)
            }
        }
    }
}

async fn recv_room(
    membership: &mut Option<Membership>,
) -> Result<Arc<ServerFrame>, broadcast::error::RecvError> {
    match membership {
        Some(m) => m.rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}

async fn send_frame(sink: &mut WsSink, frame: &ServerFrame) -> Result<(), RelayError> {
    let data = frame.encode()?;
    sink.send(Message::Binary(data.into())).await?;
    Ok(())
}
