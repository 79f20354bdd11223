//! WebSocket client of the relay.
//!
//! One connection per subscription. A writer task drains an outgoing queue
//! of [`ClientFrame`]s; a reader task decodes [`ServerFrame`]s into
//! [`ChannelEvent`]s. The first `Loaded` frame means the relay accepted the
//! join and is reported as `Status(Connected)`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use huddle_core::{Mutation, RoomId};

use super::{Channel, ChannelEvent, ChannelStatus, EventReceiver};
use crate::error::{PersistenceError, TransportError};
use crate::protocol::{BroadcastMessage, ClientFrame, PresenceMeta, ServerFrame};

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Relay address, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub event_capacity: usize,
    pub ping_interval: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".into(),
            event_capacity: 1024,
            ping_interval: Duration::from_secs(15),
        }
    }
}

pub struct WsChannel {
    config: WsConfig,
    outgoing: Option<mpsc::Sender<ClientFrame>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsChannel {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            outgoing: None,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn is_subscribed(&self) -> bool {
        self.outgoing.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let tx = self.outgoing.as_ref().ok_or(TransportError::NotSubscribed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn subscribe(
        &mut self,
        room: &RoomId,
        meta: &PresenceMeta,
    ) -> Result<EventReceiver, TransportError> {
        self.unsubscribe().await;

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Join goes out before anything else.
        let join = ClientFrame::Join {
            room: room.clone(),
            meta: meta.clone(),
        }
        .encode()?;
        ws_writer
            .send(Message::Binary(join.into()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(256);
        let (event_tx, events) = mpsc::channel(self.config.event_capacity);

        // Writer: outgoing queue → socket. Ends once every sender is gone,
        // which also flushes a trailing Leave.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let data = match frame.encode() {
                    Ok(data) => data,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader: socket → events.
        let peer = meta.peer_id;
        let reader = tokio::spawn(async move {
            let mut joined = false;
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame = match ServerFrame::decode(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Undecodable frame for {}: {e}", peer.short());
                        continue;
                    }
                };
                if let ServerFrame::Rejected(reason) = &frame {
                    log::warn!("Relay rejected {}: {reason}", peer.short());
                    let _ = event_tx.send(ChannelEvent::Status(ChannelStatus::Error)).await;
                    return;
                }
                if !joined && matches!(frame, ServerFrame::Loaded(_)) {
                    joined = true;
                    if event_tx
                        .send(ChannelEvent::Status(ChannelStatus::Connected))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let Some(event) = ChannelEvent::from_frame(frame) else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            log::debug!("Relay connection for {} closed", peer.short());
            let _ = event_tx.send(ChannelEvent::Status(ChannelStatus::Error)).await;
        });

        // Keepalive.
        let ping_tx = out_tx.downgrade();
        let interval = self.config.ping_interval;
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = ping_tx.upgrade() else { break };
                if tx.send(ClientFrame::Ping).await.is_err() {
                    break;
                }
            }
        });

        log::info!("Subscribed to {room} via {}", self.config.url);
        self.outgoing = Some(out_tx);
        self.tasks = vec![reader, pinger];
        // The writer is left to finish on its own so the Leave is flushed.
        drop(writer);
        Ok(events)
    }

    async fn unsubscribe(&mut self) {
        self.stop_tasks();
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(ClientFrame::Leave).await;
        }
    }

    async fn broadcast(&mut self, message: BroadcastMessage) -> Result<(), TransportError> {
        self.send(ClientFrame::Broadcast(message)).await
    }

    /// Queues the write. A relay-side failure comes back later as
    /// [`ChannelEvent::PersistFailed`].
    async fn persist(&mut self, mutation: Mutation) -> Result<(), PersistenceError> {
        self.send(ClientFrame::Persist(mutation))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
