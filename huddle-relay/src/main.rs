//! `huddle-relay` — run the room relay, or watch a room from the terminal.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use huddle_collab::channel::{WsChannel, WsConfig};
use huddle_collab::event::SessionNotice;
use huddle_collab::mesh::NoMedia;
use huddle_collab::protocol::PresenceMeta;
use huddle_collab::relay::{RelayConfig, RelayServer};
use huddle_collab::session::{RoomSession, SessionContext};
use huddle_collab::SessionConfig;
use huddle_core::PeerId;

#[derive(Parser)]
#[command(name = "huddle-relay")]
#[command(version, about = "Realtime room relay with durable record storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve rooms over WebSocket
    Serve {
        /// Address to bind to
        #[arg(short = 'b', long, default_value = "127.0.0.1:9090")]
        bind: String,

        /// RocksDB directory; rooms are kept in memory when omitted
        #[arg(short = 'd', long)]
        data_dir: Option<PathBuf>,

        /// Joins beyond this many members are rejected
        #[arg(long, default_value_t = 100)]
        max_peers: usize,

        /// Seconds between presence re-announcements
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
    },
    /// Join a room without audio and log everything that happens
    Watch {
        /// Relay URL
        #[arg(short = 's', long, default_value = "ws://127.0.0.1:9090")]
        server: String,

        /// Room to join
        #[arg(short = 'r', long)]
        room: String,

        /// Display name
        #[arg(short = 'n', long, default_value = "Watcher")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            data_dir,
            max_peers,
            heartbeat_secs,
        } => {
            let config = RelayConfig {
                bind_addr: bind,
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                max_peers_per_room: max_peers,
                storage_path: data_dir,
                ..RelayConfig::default()
            };
            serve(config).await?;
        }
        Commands::Watch { server, room, name } => watch(server, room, name).await,
    }
    Ok(())
}

async fn serve(config: RelayConfig) -> Result<(), huddle_collab::RelayError> {
    let server = RelayServer::new(config)?;
    let listener = server.bind().await?;
    tokio::select! {
        result = server.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} rooms open",
                stats.total_connections, stats.active_rooms
            );
            Ok(())
        }
    }
}

async fn watch(server: String, room: String, name: String) {
    let meta = PresenceMeta::new(PeerId::random(), name);
    let ctx = SessionContext::new(room, meta).with_config(SessionConfig::default());
    let channel = WsChannel::new(WsConfig::new(server));
    let (session, mut notices) = RoomSession::new(ctx, channel, NoMedia);
    let (handle, task) = session.spawn();

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(notice) => print_notice(&notice),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = handle.leave().await;
                break;
            }
        }
    }
    let _ = task.await;
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::RecordChanged(record) => {
            info!("{} [{}] = {}", record.id, record.type_tag, record.payload.value())
        }
        SessionNotice::RecordRemoved(id) => info!("{id} removed"),
        SessionNotice::PeerCountChanged(n) => info!("{n} in room"),
        SessionNotice::StatusChanged(status) => info!("channel {status:?}"),
        // Cursor traffic is too chatty to log at info.
        SessionNotice::CursorMoved(_) | SessionNotice::CursorRemoved(_) => {}
        other => log::warn!("{other:?}"),
    }
}
