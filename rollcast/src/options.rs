use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rollcast_lib::message::IpAddrPort;

#[derive(Parser, Debug)]
#[command(name = "rollcast", version, about = "Peer-to-peer rollback netplay controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: CommandKind,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Subcommand, Debug)]
pub enum CommandKind {
    /// Host a netplay session.
    Host {
        /// Port to listen on; 0 picks an ephemeral port.
        #[arg(default_value_t = 0)]
        port: u16,
    },
    /// Join a hosted session at host:port.
    Join { address: String },
    /// Spectate an in-progress match at host:port.
    Spectate { address: String },
    /// Run the game locally and serve spectators.
    Broadcast,
    /// Run the game locally, offline. Attach requests from the game are
    /// honored without relaunching it.
    Offline,
    /// Play back a recorded session.
    Replay,
}

#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    /// Player name shown to the peer.
    #[arg(long)]
    pub name: Option<String>,

    /// Rounds needed to win the match (host decides).
    #[arg(long, default_value_t = 2)]
    pub win_count: u8,

    #[arg(long)]
    pub training: bool,

    #[arg(long)]
    pub tournament: bool,

    /// Force the relayed UDP tunnel even when a direct path exists.
    #[arg(long)]
    pub tunnel: bool,

    /// Relay server (host:port) used for tunneled sessions.
    #[arg(long)]
    pub relay: Option<String>,

    /// Headless auto-pilot peer: no prompt, no game process.
    #[arg(long)]
    pub dummy: bool,

    /// Determinism check; implies auto-confirmation.
    #[arg(long)]
    pub synctest: bool,

    /// Repeat to also require matching revision, then build time.
    #[arg(long, action = clap::ArgAction::Count)]
    pub strict_version: u8,

    /// Abort the session when the measured delay exceeds this many frames.
    #[arg(long, default_value_t = 9)]
    pub max_real_delay: u8,

    /// Game binary to launch at session start.
    #[arg(long)]
    pub game: Option<PathBuf>,

    /// Skip the public-address lookup when hosting.
    #[arg(long)]
    pub no_lookup: bool,
}

/// Resolved options the controller works from.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub name: String,
    pub win_count: u8,
    pub training: bool,
    pub tournament: bool,
    pub tunnel: bool,
    pub relay: Option<IpAddrPort>,
    pub dummy: bool,
    pub synctest: bool,
    pub strict_version: u8,
    pub max_real_delay: u8,
    pub game_path: Option<PathBuf>,
    /// Fixed IPC port; 0 picks an ephemeral one.
    pub ipc_port: u16,
    pub external_lookup: bool,
    pub load_framestep: bool,
    pub wine: bool,
    pub controller_mappings: Vec<u8>,
    pub app_dir: String,
    pub frame_limiter: bool,
    pub auto_replay_save: bool,
    pub held_start_duration: Option<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            win_count: 2,
            training: false,
            tournament: false,
            tunnel: false,
            relay: None,
            dummy: false,
            synctest: false,
            strict_version: 0,
            max_real_delay: 9,
            game_path: None,
            ipc_port: 0,
            external_lookup: false,
            load_framestep: false,
            wine: false,
            controller_mappings: Vec::new(),
            app_dir: String::new(),
            frame_limiter: false,
            auto_replay_save: false,
            held_start_duration: None,
        }
    }
}

impl SessionOptions {
    pub fn from_args(args: &CommonArgs) -> Result<Self> {
        let relay = args.relay.as_deref().map(IpAddrPort::parse).transpose()?;
        Ok(Self {
            name: args.name.clone().unwrap_or_default(),
            win_count: args.win_count,
            training: args.training,
            tournament: args.tournament,
            tunnel: args.tunnel,
            relay,
            dummy: args.dummy,
            synctest: args.synctest,
            strict_version: args.strict_version,
            max_real_delay: args.max_real_delay,
            game_path: args.game.clone(),
            external_lookup: !args.no_lookup,
            app_dir: std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn join_parses_address_and_flags() {
        let cli = Cli::parse_from([
            "rollcast",
            "join",
            "127.0.0.1:51000",
            "--name",
            "Bob",
            "--strict-version",
            "--strict-version",
            "--max-real-delay",
            "4",
        ]);
        let CommandKind::Join { address } = &cli.command else {
            panic!("expected join");
        };
        assert_eq!(address, "127.0.0.1:51000");
        let options = SessionOptions::from_args(&cli.common).unwrap();
        assert_eq!(options.name, "Bob");
        assert_eq!(options.strict_version, 2);
        assert_eq!(options.max_real_delay, 4);
    }

    #[test]
    fn host_defaults_to_an_ephemeral_port() {
        let cli = Cli::parse_from(["rollcast", "host"]);
        let CommandKind::Host { port } = cli.command else {
            panic!("expected host");
        };
        assert_eq!(port, 0);
    }

    #[test]
    fn bad_relay_address_is_rejected() {
        let cli = Cli::parse_from(["rollcast", "host", "--relay", "nonsense"]);
        assert!(SessionOptions::from_args(&cli.common).is_err());
    }
}
