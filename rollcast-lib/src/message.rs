//! Wire and IPC payloads. Everything that crosses a socket or the game
//! process boundary is one variant of [`Message`].

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};
use derive_new::new;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pinger::Statistics;
use crate::version::Version;

pub type SessionId = Uuid;

/// Character / moon slot not chosen yet (attach mode starts in select).
pub const UNKNOWN_POSITION: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ModeKind {
    Host,
    Client,
    SpectateNetplay,
    SpectateBroadcast,
    Broadcast,
    Offline,
    Replay,
}

/// Client mode plus its flag bits. The kind is assigned once per session and
/// only transitions inside the spectate sub-family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientMode {
    pub kind: ModeKind,
    pub flags: u8,
}

impl ClientMode {
    pub const TRAINING: u8 = 1 << 0;
    pub const TOURNAMENT: u8 = 1 << 1;
    pub const UDP_TUNNEL: u8 = 1 << 2;
    pub const IS_WINE: u8 = 1 << 3;
    pub const GAME_STARTED: u8 = 1 << 4;

    pub fn new(kind: ModeKind) -> Self {
        Self { kind, flags: 0 }
    }

    pub fn is_host(&self) -> bool {
        self.kind == ModeKind::Host
    }

    pub fn is_client(&self) -> bool {
        self.kind == ModeKind::Client
    }

    pub fn is_netplay(&self) -> bool {
        matches!(self.kind, ModeKind::Host | ModeKind::Client)
    }

    pub fn is_spectate(&self) -> bool {
        matches!(
            self.kind,
            ModeKind::SpectateNetplay | ModeKind::SpectateBroadcast
        )
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == ModeKind::Broadcast
    }

    /// The game runs on this machine without a remote opponent.
    pub fn is_local(&self) -> bool {
        matches!(
            self.kind,
            ModeKind::Broadcast | ModeKind::Offline | ModeKind::Replay
        )
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn insert(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn is_training(&self) -> bool {
        self.has(Self::TRAINING)
    }

    pub fn is_tournament(&self) -> bool {
        self.has(Self::TOURNAMENT)
    }

    pub fn is_game_started(&self) -> bool {
        self.has(Self::GAME_STARTED)
    }

    pub fn flag_string(&self) -> String {
        let names = [
            (Self::TRAINING, "Training"),
            (Self::TOURNAMENT, "Tournament"),
            (Self::UDP_TUNNEL, "UdpTunnel"),
            (Self::IS_WINE, "IsWine"),
            (Self::GAME_STARTED, "GameStarted"),
        ];
        names
            .iter()
            .filter(|(flag, _)| self.has(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)
    }
}

/// Host or relay endpoint as the user typed it; the hostname is kept so a
/// relay redirect can be compared against the original target.
#[derive(new, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpAddrPort {
    pub addr: String,
    pub port: u16,
}

impl IpAddrPort {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, port) = s
            .rsplit_once(':')
            .with_context(|| format!("missing port in address '{s}'"))?;
        let port = port
            .parse()
            .with_context(|| format!("bad port in address '{s}'"))?;
        if addr.is_empty() {
            bail!("missing host in address '{s}'");
        }
        Ok(Self::new(addr.to_owned(), port))
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        (self.addr.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve '{self}'"))?
            .next()
            .with_context(|| format!("no address for '{self}'"))
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_empty() && self.port == 0
    }
}

impl fmt::Display for IpAddrPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<SocketAddr> for IpAddrPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VersionConfig {
    pub version: Version,
    pub mode: ClientMode,
}

impl VersionConfig {
    pub fn new(mode: ClientMode) -> Self {
        Self {
            version: Version::current(),
            mode,
        }
    }
}

/// Exchanged twice per session: round one carries each side's own name,
/// round two echoes the peer's name back and (host to client) publishes the
/// data port and win count.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InitialConfig {
    pub mode: ClientMode,
    pub data_port: u16,
    pub local_name: String,
    pub remote_name: String,
    pub win_count: u8,
}

impl InitialConfig {
    pub fn new(mode: ClientMode, local_name: String, win_count: u8) -> Self {
        Self {
            mode,
            data_port: 0,
            local_name,
            remote_name: String::new(),
            win_count,
        }
    }
}

/// Two-sided ping statistics; the latency moments stay mergeable so both
/// peers agree on one set of numbers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct PingStats {
    pub latency: Statistics,
    pub packet_loss: u8,
}

impl PingStats {
    pub fn new(latency: Statistics, packet_loss: u8) -> Self {
        Self {
            latency,
            packet_loss,
        }
    }

    /// Two-sided merge: latency moments are added, packet loss is averaged.
    pub fn merge(&self, other: &PingStats) -> PingStats {
        let mut latency = self.latency;
        latency.merge(&other.latency);
        PingStats {
            latency,
            packet_loss: ((u16::from(self.packet_loss) + u16::from(other.packet_loss)) / 2) as u8,
        }
    }
}

/// The terminal negotiated artifact, filled exclusively by the host.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetplayConfig {
    pub mode: ClientMode,
    pub delay: u8,
    pub rollback: u8,
    pub rollback_delay: u8,
    pub win_count: u8,
    pub host_player: u8,
    pub broadcast_port: u16,
    pub session_id: SessionId,
    pub names: [String; 2],
}

impl NetplayConfig {
    pub fn new(mode: ClientMode) -> Self {
        Self {
            mode,
            delay: 0,
            rollback: 0,
            rollback_delay: 0,
            win_count: 2,
            host_player: 1,
            broadcast_port: 0,
            session_id: Uuid::nil(),
            names: [String::new(), String::new()],
        }
    }

    /// Slot the host and client names by the negotiated host player.
    pub fn set_names(&mut self, host_name: &str, client_name: &str) {
        if self.host_player == 1 {
            self.names = [host_name.to_owned(), client_name.to_owned()];
        } else {
            self.names = [client_name.to_owned(), host_name.to_owned()];
        }
    }
}

/// The client's UI may only propose these; the host decides.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DelayProposal {
    pub delay: u8,
    pub rollback: u8,
    pub rollback_delay: u8,
}

/// Client-to-host, in two roles disambiguated by handshake state: at the
/// client's own confirmation it carries the UI proposal; after
/// `NetplayConfig` arrives it echoes the session id as the start gate.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfirmConfig {
    pub proposal: Option<DelayProposal>,
    pub session_id: Option<SessionId>,
}

impl ConfirmConfig {
    pub fn proposal(proposal: DelayProposal) -> Self {
        Self {
            proposal: Some(proposal),
            session_id: None,
        }
    }

    pub fn ack(session_id: SessionId) -> Self {
        Self {
            proposal: None,
            session_id: Some(session_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum NetplayState {
    PreInitial,
    Initial,
    CharaSelect,
    Loading,
    InGame,
    RetryMenu,
}

/// Snapshot a spectator resumes from.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InitialGameState {
    pub netplay_state: NetplayState,
    pub stage: u8,
    pub is_training: bool,
    pub chara: [u8; 2],
    pub moon: [u8; 2],
}

impl InitialGameState {
    /// Nothing chosen yet; characters get picked in select.
    pub fn pre_initial() -> Self {
        Self {
            netplay_state: NetplayState::PreInitial,
            stage: 0,
            is_training: false,
            chara: [UNKNOWN_POSITION; 2],
            moon: [UNKNOWN_POSITION; 2],
        }
    }
}

/// NetplayConfig plus the game-state snapshot, served to spectators.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SpectateConfig {
    pub mode: ClientMode,
    pub delay: u8,
    pub rollback: u8,
    pub win_count: u8,
    pub host_player: u8,
    pub session_id: SessionId,
    pub names: [String; 2],
    pub initial: InitialGameState,
}

#[derive(new, Clone, Debug, Deserialize, Serialize)]
pub struct ErrorMessage {
    pub error: String,
}

#[derive(new, Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Ping {
    pub sequence: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlayerInputs {
    pub frame: u32,
    pub index: u32,
    pub inputs: Vec<u16>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BothInputs {
    pub frame: u32,
    pub index: u32,
    pub inputs: [Vec<u16>; 2],
}

#[derive(new, Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MenuIndex {
    pub index: u32,
    pub value: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RngState {
    pub index: u32,
    pub state: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ChangeKind {
    Delay,
    Rollback,
    RollbackDelay,
}

/// In-game setting change reported by the game over IPC.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ChangeConfig {
    pub kind: ChangeKind,
    pub delay: u8,
    pub rollback: u8,
    pub rollback_delay: u8,
}

/// Launch options published to the game process before the session config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GameOptions {
    pub app_dir: String,
    pub session_id: Option<String>,
    pub training: bool,
    pub tournament: bool,
    pub frame_limiter: bool,
    pub auto_replay_save: bool,
    pub held_start_duration: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Message {
    VersionConfig(VersionConfig),
    InitialConfig(InitialConfig),
    IpAddrPort(IpAddrPort),
    PingStats(PingStats),
    NetplayConfig(NetplayConfig),
    ConfirmConfig(ConfirmConfig),
    SpectateConfig(Box<SpectateConfig>),
    ErrorMessage(ErrorMessage),
    Ping(Ping),
    Pong(Ping),
    PlayerInputs(PlayerInputs),
    BothInputs(BothInputs),
    MenuIndex(MenuIndex),
    InitialGameState(InitialGameState),
    RngState(RngState),
    ChangeConfig(ChangeConfig),
    // IPC-only initialization payloads.
    GameOptions(GameOptions),
    ControllerMappings(Vec<u8>),
    Mode(ClientMode),
}

impl Message {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::VersionConfig(_) => "VersionConfig",
            Message::InitialConfig(_) => "InitialConfig",
            Message::IpAddrPort(_) => "IpAddrPort",
            Message::PingStats(_) => "PingStats",
            Message::NetplayConfig(_) => "NetplayConfig",
            Message::ConfirmConfig(_) => "ConfirmConfig",
            Message::SpectateConfig(_) => "SpectateConfig",
            Message::ErrorMessage(_) => "ErrorMessage",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::PlayerInputs(_) => "PlayerInputs",
            Message::BothInputs(_) => "BothInputs",
            Message::MenuIndex(_) => "MenuIndex",
            Message::InitialGameState(_) => "InitialGameState",
            Message::RngState(_) => "RngState",
            Message::ChangeConfig(_) => "ChangeConfig",
            Message::GameOptions(_) => "GameOptions",
            Message::ControllerMappings(_) => "ControllerMappings",
            Message::Mode(_) => "Mode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_addr_port_parses_and_displays() {
        let addr = IpAddrPort::parse("10.0.0.5:52000").unwrap();
        assert_eq!(addr.addr, "10.0.0.5");
        assert_eq!(addr.port, 52000);
        assert_eq!(addr.to_string(), "10.0.0.5:52000");
        assert!(IpAddrPort::parse("10.0.0.5").is_err());
        assert!(IpAddrPort::parse(":51000").is_err());
    }

    #[test]
    fn mode_flags_round_trip() {
        let mut mode = ClientMode::new(ModeKind::Host);
        assert!(!mode.is_game_started());
        mode.insert(ClientMode::GAME_STARTED | ClientMode::TRAINING);
        assert!(mode.is_game_started());
        assert!(mode.is_training());
        assert_eq!(mode.flag_string(), "Training, GameStarted");
    }

    #[test]
    fn ping_stats_merge_averages_packet_loss() {
        let a = PingStats::new(Statistics::default(), 30);
        let b = PingStats::new(Statistics::default(), 11);
        assert_eq!(a.merge(&b).packet_loss, 20);
        assert_eq!(b.merge(&a).packet_loss, 20);
    }

    #[test]
    fn names_follow_host_player() {
        let mut config = NetplayConfig::new(ClientMode::new(ModeKind::Host));
        config.host_player = 2;
        config.set_names("Alice", "Bob");
        assert_eq!(config.names, ["Bob".to_owned(), "Alice".to_owned()]);
        config.host_player = 1;
        config.set_names("Alice", "Bob");
        assert_eq!(config.names, ["Alice".to_owned(), "Bob".to_owned()]);
    }
}
