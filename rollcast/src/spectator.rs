//! Host-side spectator fan-out. Keeps the freshest game-state snapshot so a
//! late joiner can resume mid-match, and replays everything broadcast since
//! that snapshot before putting the newcomer on the live stream.

use rollcast_lib::message::{InitialGameState, Message, NetplayConfig, SpectateConfig};
use rollcast_lib::smart_socket::SmartSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Backlog bound between snapshots; a healthy game refreshes the snapshot
/// every round, far below this.
const MAX_BACKLOG: usize = 4096;

struct Spectator {
    id: u64,
    sender: SmartSender,
    reader: JoinHandle<()>,
}

#[derive(Default)]
pub struct SpectatorHub {
    spectators: Vec<Spectator>,
    snapshot: Option<InitialGameState>,
    backlog: Vec<Message>,
    next_id: u64,
}

impl SpectatorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.spectators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectators.is_empty()
    }

    /// The config a newly accepted spectator resumes from.
    pub fn spectate_config(&self, config: &NetplayConfig) -> SpectateConfig {
        SpectateConfig {
            mode: config.mode,
            delay: config.delay,
            rollback: config.rollback,
            win_count: config.win_count,
            host_player: config.host_player,
            session_id: config.session_id,
            names: config.names.clone(),
            initial: self
                .snapshot
                .clone()
                .unwrap_or_else(InitialGameState::pre_initial),
        }
    }

    /// Reserve an id up front so the socket's reader task can report its
    /// death before `add` has even run.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Add an accepted spectator and catch it up on the backlog since the
    /// snapshot it was served.
    pub async fn add(&mut self, id: u64, mut sender: SmartSender, reader: JoinHandle<()>) {
        for msg in &self.backlog {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        info!("spectator {id} joined ({} total)", self.spectators.len() + 1);
        self.spectators.push(Spectator { id, sender, reader });
    }

    pub fn remove(&mut self, id: u64) {
        if let Some(pos) = self.spectators.iter().position(|s| s.id == id) {
            let spectator = self.spectators.swap_remove(pos);
            spectator.reader.abort();
            info!("spectator {id} left ({} remain)", self.spectators.len());
        }
    }

    /// Forward one game broadcast to every spectator, FIFO per socket, and
    /// fold it into the catch-up state.
    pub async fn broadcast(&mut self, msg: &Message) {
        if let Message::InitialGameState(state) = msg {
            self.snapshot = Some(state.clone());
            self.backlog.clear();
        } else if self.backlog.len() < MAX_BACKLOG {
            self.backlog.push(msg.clone());
        }

        let mut dead = Vec::new();
        for spectator in &mut self.spectators {
            if let Err(err) = spectator.sender.send(msg).await {
                debug!("spectator {} dropped: {err}", spectator.id);
                dead.push(spectator.id);
            }
        }
        for id in dead {
            self.remove(id);
        }
    }

    pub fn shutdown(&mut self) {
        for spectator in self.spectators.drain(..) {
            spectator.reader.abort();
        }
        self.backlog.clear();
    }
}

impl Drop for SpectatorHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
