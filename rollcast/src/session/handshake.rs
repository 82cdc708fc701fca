//! Message handlers for the ten-step connect protocol and the transitions
//! around it: spectator serving, user confirmation, dummy auto-pilot, game
//! start and the attach-mode publish.

use std::net::SocketAddr;
use std::time::Instant as StdInstant;

use anyhow::Result;
use rand::Rng;
use rollcast_lib::message::{
    ClientMode, ConfirmConfig, DelayProposal, ErrorMessage, GameOptions, InitialConfig,
    InitialGameState, IpAddrPort, Message, ModeKind, NetplayConfig, PingStats, SpectateConfig,
    VersionConfig,
};
use rollcast_lib::pinger::Tick;
use rollcast_lib::smart_socket::{SmartSocket, SocketEvent};
use rollcast_lib::version::Version;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    compute_delay, format_stats, Event, Link, Phase, SessionController, SessionError,
    ATTACH_GRACE, DEFAULT_PENDING_TIMEOUT, START_DELAY,
};
use crate::ipc::{IpcChannel, IpcServer};
use crate::timer::Timer;
use crate::ui_bridge::{ConfirmRequest, UiDecision};

/// Mash confirm every fifth frame so dummy peers advance menus and rounds.
const DUMMY_CONFIRM: u16 = 0x0050;

impl SessionController {
    pub(super) async fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Pending { id, socket, msg } => self.on_pending_message(id, socket, *msg).await,
            Event::PendingGone { id } => {
                debug!("pending socket {id} went away before its version exchange");
                Ok(())
            }
            Event::SpectatorClosed { id } => {
                self.hub.remove(id);
                Ok(())
            }
            Event::ExternalIp(address) => {
                self.external_ip = address;
                self.update_status();
                Ok(())
            }
        }
    }

    /// Host accept path: greet with our VersionConfig and pend the socket
    /// until it answers with its own or the pending timeout reaps it.
    pub(super) async fn on_ctrl_accepted(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        debug!("incoming control connection from {peer}");
        let mut socket = match SmartSocket::from_stream(stream) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("dropping bad accept from {peer}: {err}");
                return Ok(());
            }
        };
        let mut mode = self.mode;
        if self.game_started {
            mode.insert(ClientMode::GAME_STARTED);
        }
        if socket
            .send(&Message::VersionConfig(VersionConfig::new(mode)))
            .await
            .is_err()
        {
            return Ok(());
        }
        let id = self.pending_seq;
        self.pending_seq += 1;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            match timeout(DEFAULT_PENDING_TIMEOUT, socket.recv()).await {
                Ok(Ok(SocketEvent::Message(msg))) => {
                    let _ = tx
                        .send(Event::Pending {
                            id,
                            socket,
                            msg: Box::new(msg),
                        })
                        .await;
                }
                _ => {
                    let _ = tx.send(Event::PendingGone { id }).await;
                }
            }
        });
        Ok(())
    }

    async fn on_pending_message(
        &mut self,
        id: u64,
        mut socket: SmartSocket,
        msg: Message,
    ) -> Result<()> {
        let Message::VersionConfig(config) = msg else {
            debug!("pending socket {id} spoke {} first, dropping", msg.kind());
            return Ok(());
        };
        let local = Version::current();
        let strictness = self.options.strict_version;
        info!(
            "pending {id}: version='{}' mode={} flags={{ {} }}",
            config.version.code,
            config.mode,
            config.mode.flag_string()
        );
        if !local.is_similar(&config.version, 1 + strictness) {
            let text = format!(
                "Incompatible host version: {}",
                local.display_for(strictness)
            );
            let _ = socket
                .send(&Message::ErrorMessage(ErrorMessage::new(text)))
                .await;
            return Ok(());
        }
        if config.mode.is_spectate() && !self.game_started {
            let _ = socket
                .send(&Message::ErrorMessage(ErrorMessage::new(
                    SessionError::SpectateNotReady.to_string(),
                )))
                .await;
            return Ok(());
        }
        if self.game_started {
            // Mid-match joiners are spectators regardless of what they
            // dialed as; the client side morphs itself on our GameStarted
            // flag.
            return self.accept_spectator(socket).await;
        }
        if self.ctrl.is_some() {
            let _ = socket
                .send(&Message::ErrorMessage(ErrorMessage::new(
                    SessionError::HostBusy.to_string(),
                )))
                .await;
            return Ok(());
        }

        info!("control socket promoted from {:?}", socket.peer_addr());
        self.ctrl = Some(socket);

        // The data port travels in the identity exchange, so bind it now.
        // Same number as the control port when free, ephemeral otherwise.
        let data = SmartSocket::bind_udp(self.address.port).await?;
        self.initial_config.data_port = data.local_port();
        self.data = Some(data);
        self.initial_config.mode = self.mode;
        let round_one = Message::InitialConfig(self.initial_config.clone());
        if self.send_ctrl(&round_one).await? {
            self.phase = Phase::InitialExchange1;
        }
        Ok(())
    }

    async fn accept_spectator(&mut self, mut socket: SmartSocket) -> Result<()> {
        let Some(config) = self.netplay_config.clone() else {
            debug!("no session config to serve a spectator yet");
            return Ok(());
        };
        let spectate = self.hub.spectate_config(&config);
        if socket
            .send(&Message::SpectateConfig(Box::new(spectate)))
            .await
            .is_err()
        {
            return Ok(());
        }
        let id = self.hub.allocate_id();
        let (sender, mut receiver) = socket.split();
        let tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(SocketEvent::Message(msg)) => {
                        trace!("spectator {id} sent {}", msg.kind());
                    }
                    Ok(SocketEvent::Accepted(_)) => {}
                    Ok(SocketEvent::Closed) | Err(_) => {
                        let _ = tx.send(Event::SpectatorClosed { id }).await;
                        return;
                    }
                }
            }
        });
        self.hub.add(id, sender, reader).await;
        Ok(())
    }

    pub(super) async fn on_ctrl_message(&mut self, msg: Message) -> Result<()> {
        // Any control traffic counts as progress.
        self.stop_timer = None;
        let first = std::mem::replace(&mut self.first_ctrl_read, false);
        match msg {
            Message::ErrorMessage(err) => {
                if self.queueing {
                    self.msg_queue.push(Message::ErrorMessage(err.clone()));
                    self.forward_msg_queue().await;
                }
                self.stop_with(err.error);
                Ok(())
            }
            Message::IpAddrPort(address) if first => self.on_relay_redirect(address).await,
            Message::VersionConfig(config) => self.on_version_config(config).await,
            Message::InitialConfig(config) => self.on_initial_config(config).await,
            Message::PingStats(stats) => self.on_ping_stats(stats).await,
            Message::NetplayConfig(config) => self.on_netplay_config(config).await,
            Message::ConfirmConfig(config) => self.on_confirm_config(config).await,
            Message::SpectateConfig(config) => self.on_spectate_config(*config).await,
            other if self.queueing => {
                self.msg_queue.push(other);
                self.forward_msg_queue().await;
                Ok(())
            }
            other if self.dummy_ready => self.on_dummy_msg(other).await,
            other => {
                debug!("ignoring {} in phase {:?}", other.kind(), self.phase);
                Ok(())
            }
        }
    }

    /// The server relayed us to a peer: re-dial and restart from step one.
    async fn on_relay_redirect(&mut self, address: IpAddrPort) -> Result<()> {
        info!("relay redirect: {} -> {}", self.address, address);
        self.address = address;
        self.ctrl = None;
        self.dial_ctrl().await
    }

    async fn on_version_config(&mut self, config: VersionConfig) -> Result<()> {
        if self.phase != Phase::VersionExchange {
            debug!("ignoring VersionConfig in phase {:?}", self.phase);
            return Ok(());
        }
        let local = Version::current();
        let strictness = self.options.strict_version;
        info!(
            "remote version='{}' mode={} flags={{ {} }}",
            config.version.code,
            config.mode,
            config.mode.flag_string()
        );
        if !local.is_similar(&config.version, 1 + strictness) {
            self.stop_with(SessionError::VersionMismatch(
                config.version.display_for(strictness),
            ));
            return Ok(());
        }

        // A host already in a game turns us into a spectator.
        if self.mode.is_client() && config.mode.is_game_started() && !self.attach {
            info!("host reports a running game, switching to spectate");
            self.mode.kind = ModeKind::SpectateNetplay;
        }
        if self.mode.is_spectate() && config.mode.is_broadcast() {
            self.mode.kind = ModeKind::SpectateBroadcast;
        }

        if self.mode.is_spectate() {
            if !config.mode.is_game_started() {
                self.stop_with(SessionError::SpectateNotReady);
                return Ok(());
            }
            self.phase = Phase::AwaitSpectate;
            return Ok(());
        }

        self.initial_config.mode = self.mode;
        let round_one = Message::InitialConfig(self.initial_config.clone());
        if self.send_ctrl(&round_one).await? {
            self.phase = Phase::InitialExchange1;
        }
        Ok(())
    }

    async fn on_initial_config(&mut self, config: InitialConfig) -> Result<()> {
        match self.phase {
            Phase::InitialExchange1 => {
                self.initial_config.mode.flags |= config.mode.flags;
                self.initial_config.remote_name = if config.local_name.is_empty() {
                    self.ctrl
                        .as_ref()
                        .and_then(|ctrl| ctrl.peer_addr())
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_else(|| "Anonymous".to_owned())
                } else {
                    config.local_name
                };
                let echo = Message::InitialConfig(self.initial_config.clone());
                if self.send_ctrl(&echo).await? {
                    self.phase = Phase::InitialExchange2;
                }
                Ok(())
            }
            Phase::InitialExchange2 => {
                // The peer echoed our name back; adopt its spelling.
                if !config.remote_name.is_empty() {
                    self.initial_config.local_name = config.remote_name;
                }
                info!(
                    "identities settled: '{}' vs '{}'",
                    self.initial_config.local_name, self.initial_config.remote_name
                );
                if self.mode.is_client() {
                    self.initial_config.mode.flags = config.mode.flags;
                    self.initial_config.data_port = config.data_port;
                    self.initial_config.win_count = config.win_count;
                    let target =
                        IpAddrPort::new(self.address.addr.clone(), config.data_port);
                    let tunnel = self.ctrl.as_ref().is_some_and(SmartSocket::is_tunnel);
                    self.data = Some(
                        SmartSocket::connect_udp(&target, tunnel, self.options.relay.as_ref())
                            .await?,
                    );
                    let variant = if self.initial_config.mode.is_training() {
                        "Training"
                    } else {
                        "Versus"
                    };
                    self.ui.display(format!(
                        "Connecting to {}\n\n{variant} mode\n\nCalculating delay...",
                        self.initial_config.remote_name
                    ));
                    self.phase = Phase::Pinging;
                } else if self.data_accepted {
                    self.begin_pinging();
                } else {
                    self.phase = Phase::DataPortOpen;
                }
                Ok(())
            }
            _ => {
                debug!("ignoring InitialConfig in phase {:?}", self.phase);
                Ok(())
            }
        }
    }

    pub(super) fn on_data_accepted(&mut self, peer: SocketAddr) -> Result<()> {
        debug!("data socket accepted {peer}");
        self.data_accepted = true;
        if self.phase == Phase::DataPortOpen {
            self.begin_pinging();
        }
        Ok(())
    }

    fn begin_pinging(&mut self) {
        self.pinger.start(StdInstant::now());
        self.phase = Phase::Pinging;
    }

    pub(super) async fn on_ping_tick(&mut self) -> Result<()> {
        match self.pinger.tick(StdInstant::now()) {
            Some(Tick::Send(ping)) => self.send_data(&Message::Ping(ping)).await,
            Some(Tick::Complete(stats, packet_loss)) => {
                self.on_pinger_completed(stats, packet_loss).await
            }
            None => Ok(()),
        }
    }

    pub(super) async fn on_data_message(&mut self, msg: Message) -> Result<()> {
        self.stop_timer = None;
        if self.mode.is_host() && !self.data_accepted {
            // First datagram carried a payload; treat it as the accept.
            self.on_data_accepted(
                self.data
                    .as_ref()
                    .and_then(SmartSocket::peer_addr)
                    .unwrap_or(([0, 0, 0, 0], 0).into()),
            )?;
        }
        match msg {
            Message::Ping(ping) => self.send_data(&Message::Pong(ping)).await,
            Message::Pong(pong) => {
                if let Some(Tick::Complete(stats, packet_loss)) =
                    self.pinger.got_pong(pong.sequence, StdInstant::now())
                {
                    self.on_pinger_completed(stats, packet_loss).await?;
                }
                Ok(())
            }
            other if self.dummy_ready => self.on_dummy_msg(other).await,
            other => {
                debug!("ignoring {} on the data channel", other.kind());
                Ok(())
            }
        }
    }

    async fn on_pinger_completed(
        &mut self,
        stats: rollcast_lib::pinger::Statistics,
        packet_loss: u8,
    ) -> Result<()> {
        let local = PingStats::new(stats, packet_loss);
        info!(
            "ping complete: mean={:.2} ms worst={:.2} ms stderr={:.2} ms loss={}%",
            stats.mean(),
            stats.worst(),
            stats.std_err(),
            packet_loss
        );
        self.local_stats = Some(local);
        if !self.send_ctrl(&Message::PingStats(local)).await? {
            return Ok(());
        }
        if self.mode.is_client() {
            // The host's stats are already in; clients ping second.
            self.merge_and_check().await?;
        }
        Ok(())
    }

    async fn on_ping_stats(&mut self, stats: PingStats) -> Result<()> {
        if self.phase != Phase::Pinging {
            debug!("ignoring PingStats in phase {:?}", self.phase);
            return Ok(());
        }
        self.remote_stats = Some(stats);
        if self.mode.is_host() {
            // The client answered with its side; settle the numbers.
            return self.merge_and_check().await;
        }
        if !self.pinger.is_running() && !self.pinger.is_completed() {
            self.begin_pinging();
        }
        Ok(())
    }

    async fn merge_and_check(&mut self) -> Result<()> {
        let (Some(local), Some(remote)) = (self.local_stats, self.remote_stats) else {
            debug!("ping stats merge attempted before both sides finished");
            return Ok(());
        };
        let merged = local.merge(&remote);
        info!(
            "ping stats merged: mean={:.2} ms worst={:.2} ms stddev={:.2} ms loss={}%",
            merged.latency.mean(),
            merged.latency.worst(),
            merged.latency.std_dev(),
            merged.packet_loss
        );
        self.merged_stats = Some(merged);
        self.check_delay_and_continue().await
    }

    async fn check_delay_and_continue(&mut self) -> Result<()> {
        let merged = self.merged_stats.unwrap_or_default();
        let delay = compute_delay(merged.latency.mean());
        let max_delay = self.options.max_real_delay;
        if delay > max_delay {
            let error = format!(
                "{}\n\nNetwork delay greater than limit: {max_delay}",
                format_stats(&merged)
            );
            if self.mode.is_host() {
                let message = Message::ErrorMessage(ErrorMessage::new(error));
                if let Some(ctrl) = self.ctrl.as_mut() {
                    let _ = ctrl.send(&message).await;
                }
                self.reset_session();
            } else {
                self.stop_with(error);
            }
            return Ok(());
        }
        self.get_user_confirmation(delay).await
    }

    async fn get_user_confirmation(&mut self, suggested_delay: u8) -> Result<()> {
        self.phase = Phase::AwaitConfirmation;

        // Dummy, synctest and attach sessions drive themselves.
        if self.options.dummy || self.options.synctest || self.attach {
            self.waiting_for_user = true;
            self.user_confirmed = true;
            if self.mode.is_host() {
                let worst = self
                    .merged_stats
                    .map(|stats| stats.latency.worst())
                    .unwrap_or_default();
                let mut config = NetplayConfig::new(self.mode);
                config.delay =
                    (compute_delay(worst) + 1).min(self.options.max_real_delay);
                config.rollback = 4;
                config.rollback_delay = 0;
                config.win_count = self.initial_config.win_count;
                config.host_player = 1;
                config.session_id = Uuid::new_v4();
                config.set_names(
                    &self.initial_config.local_name,
                    &self.initial_config.remote_name,
                );
                self.netplay_config = Some(config.clone());
                if !self.send_ctrl(&Message::NetplayConfig(config)).await? {
                    return Ok(());
                }
                self.phase = Phase::ConfigPublish;
                // Proceed as if the confirmation already came back.
                self.final_config_ready = true;
                return self.start_game_if_ready().await;
            }
            return self
                .apply_user_decision(UiDecision {
                    confirmed: true,
                    delay: suggested_delay,
                    rollback: 4,
                    rollback_delay: 0,
                })
                .await;
        }

        let wake = UdpSocket::bind("127.0.0.1:0").await?;
        let wake_port = wake.local_addr()?.port();
        self.ui_recv = Some(wake);
        self.waiting_for_user = true;
        self.ui.request_confirmation(ConfirmRequest::Netplay {
            initial: self.initial_config.clone(),
            stats: self.merged_stats.unwrap_or_default(),
            suggested_delay,
            wake_port,
        });
        Ok(())
    }

    async fn on_spectate_config(&mut self, config: SpectateConfig) -> Result<()> {
        if !self.mode.is_spectate() || self.phase != Phase::AwaitSpectate {
            debug!("ignoring SpectateConfig in phase {:?}", self.phase);
            return Ok(());
        }
        info!(
            "spectating {} vs {} (state {:?}, stage {})",
            config.names[0], config.names[1], config.initial.netplay_state, config.initial.stage
        );
        self.spectate_config = Some(config);
        // Queue the stream from here on; it flushes once IPC is live.
        self.queueing = true;
        self.phase = Phase::AwaitConfirmation;
        if self.options.dummy || self.options.synctest {
            self.waiting_for_user = true;
            return self
                .apply_user_decision(UiDecision {
                    confirmed: true,
                    ..UiDecision::default()
                })
                .await;
        }
        let wake = UdpSocket::bind("127.0.0.1:0").await?;
        let wake_port = wake.local_addr()?.port();
        self.ui_recv = Some(wake);
        self.waiting_for_user = true;
        let config = self.spectate_config.clone().map(Box::new);
        if let Some(config) = config {
            self.ui
                .request_confirmation(ConfirmRequest::Spectate { config, wake_port });
        }
        Ok(())
    }

    pub(super) async fn on_user_decision(&mut self) -> Result<()> {
        self.ui_recv = None;
        let decision = self.ui.take_decision().unwrap_or_default();
        self.apply_user_decision(decision).await
    }

    async fn apply_user_decision(&mut self, decision: UiDecision) -> Result<()> {
        self.waiting_for_user = false;
        if !decision.confirmed {
            // An unconfirmed wake is a clean exit; no error surfaces.
            info!("user declined, ending session");
            self.stop_clean();
            return Ok(());
        }
        if self.ctrl.is_none() {
            self.stop_with(SessionError::Disconnected);
            return Ok(());
        }
        self.user_confirmed = true;

        match self.mode.kind {
            ModeKind::SpectateNetplay | ModeKind::SpectateBroadcast => {
                self.queueing = true;
                let session_id = self
                    .spectate_config
                    .as_ref()
                    .map(|config| config.session_id)
                    .unwrap_or_else(Uuid::nil);
                if !self
                    .send_ctrl(&Message::ConfirmConfig(ConfirmConfig::ack(session_id)))
                    .await?
                {
                    return Ok(());
                }
                self.start_game().await
            }
            ModeKind::Host => {
                let proposal = self.client_proposal;
                let mut config = NetplayConfig::new(self.mode);
                config.delay = proposal.map_or(decision.delay, |p| p.delay);
                config.rollback = proposal.map_or(decision.rollback, |p| p.rollback);
                config.rollback_delay =
                    proposal.map_or(decision.rollback_delay, |p| p.rollback_delay);
                config.delay = config.delay.min(self.options.max_real_delay);
                config.win_count = self.initial_config.win_count;
                config.host_player = rand::thread_rng().gen_range(1..=2);
                config.session_id = Uuid::new_v4();
                config.set_names(
                    &self.initial_config.local_name,
                    &self.initial_config.remote_name,
                );
                info!(
                    "publishing config: delay={} rollback={} rollbackDelay={} winCount={} hostPlayer={} sessionId={}",
                    config.delay,
                    config.rollback,
                    config.rollback_delay,
                    config.win_count,
                    config.host_player,
                    config.session_id
                );
                self.netplay_config = Some(config.clone());
                if !self.send_ctrl(&Message::NetplayConfig(config)).await? {
                    return Ok(());
                }
                self.phase = Phase::ConfigPublish;
                self.start_game_if_ready().await
            }
            ModeKind::Client => {
                // Only a proposal; the host decides and publishes.
                let proposal = DelayProposal {
                    delay: decision.delay,
                    rollback: decision.rollback,
                    rollback_delay: decision.rollback_delay,
                };
                if !self
                    .send_ctrl(&Message::ConfirmConfig(ConfirmConfig::proposal(proposal)))
                    .await?
                {
                    return Ok(());
                }
                if self.phase == Phase::AwaitConfirmation {
                    self.phase = Phase::ConfigPublish;
                }
                self.start_game_if_ready().await
            }
            _ => Ok(()),
        }
    }

    async fn on_confirm_config(&mut self, config: ConfirmConfig) -> Result<()> {
        if !self.mode.is_host() {
            debug!("unexpected ConfirmConfig");
            return Ok(());
        }
        if let Some(proposal) = config.proposal {
            if !self.user_confirmed {
                debug!(
                    "client proposes delay={} rollback={}",
                    proposal.delay, proposal.rollback
                );
                self.client_proposal = Some(proposal);
            } else {
                debug!("late client proposal ignored");
            }
            return Ok(());
        }
        if !self.user_confirmed || self.phase != Phase::ConfigPublish {
            debug!("unexpected ConfirmConfig in phase {:?}", self.phase);
            return Ok(());
        }
        let expected = self.netplay_config.as_ref().map(|c| c.session_id);
        if config.session_id != expected {
            debug!("ConfirmConfig for a different session ignored");
            return Ok(());
        }
        self.final_config_ready = true;
        self.start_game_if_ready().await
    }

    async fn on_netplay_config(&mut self, config: NetplayConfig) -> Result<()> {
        if !self.mode.is_client() {
            debug!("unexpected NetplayConfig");
            return Ok(());
        }
        if !matches!(
            self.phase,
            Phase::AwaitConfirmation | Phase::ConfigPublish
        ) {
            debug!("ignoring NetplayConfig in phase {:?}", self.phase);
            return Ok(());
        }
        if config.delay > self.options.max_real_delay {
            self.stop_with(format!(
                "Network delay greater than limit: {}",
                self.options.max_real_delay
            ));
            return Ok(());
        }
        info!(
            "received config: delay={} rollback={} winCount={} hostPlayer={} sessionId={}",
            config.delay, config.rollback, config.win_count, config.host_player, config.session_id
        );
        self.netplay_config = Some(config);
        self.final_config_ready = true;
        self.start_game_if_ready().await
    }

    async fn start_game_if_ready(&mut self) -> Result<()> {
        if !(self.user_confirmed && self.final_config_ready) || self.game_launched {
            return Ok(());
        }
        if self.mode.is_client() && !self.ack_sent {
            let session_id = self
                .netplay_config
                .as_ref()
                .map(|config| config.session_id)
                .unwrap_or_else(Uuid::nil);
            if !self
                .send_ctrl(&Message::ConfirmConfig(ConfirmConfig::ack(session_id)))
                .await?
            {
                return Ok(());
            }
            self.ack_sent = true;
        }
        self.start_game().await
    }

    pub(super) async fn start_game(&mut self) -> Result<()> {
        self.game_launched = true;
        self.phase = Phase::Starting;

        if self.mode.is_client() && self.ctrl.as_ref().is_some_and(SmartSocket::is_tunnel) {
            self.mode.insert(ClientMode::UDP_TUNNEL);
        }
        if self.mode.is_netplay() {
            if !self.attach {
                // The flag union settled during the identity exchange wins.
                self.mode.flags |= self.initial_config.mode.flags;
            }
            if let Some(config) = self.netplay_config.as_mut() {
                config.mode.kind = self.mode.kind;
                config.mode.flags = self.mode.flags;
                config.win_count = self.initial_config.win_count;
            }
        }
        if self.mode.is_spectate() {
            if let Some(config) = self.spectate_config.as_ref() {
                self.mode.flags = config.mode.flags;
            }
        }

        if self.options.dummy {
            let training = if self.mode.is_training() {
                " (training)"
            } else {
                ""
            };
            self.ui.display(format!("Dummy is ready{training}"));
            self.dummy_ready = true;
            // Stand-in for a server address, so spectate chains stay alive.
            let placeholder = Message::IpAddrPort(IpAddrPort::new(String::new(), 0));
            if self.ctrl.is_some() && !self.send_ctrl(&placeholder).await? {
                return Ok(());
            }
            if self.mode.is_client() && self.data.is_none() {
                self.data = Some(
                    SmartSocket::connect_udp(
                        &self.address,
                        self.options.tunnel,
                        self.options.relay.as_ref(),
                    )
                    .await?,
                );
            }
            self.stop_timer = Some(Timer::after(2 * DEFAULT_PENDING_TIMEOUT));
            return Ok(());
        }

        self.ui
            .display(format!("Starting {} mode...", self.game_mode_string()));
        self.start_timer = Some(Timer::after(START_DELAY));
        Ok(())
    }

    pub(super) async fn on_start_timer(&mut self) -> Result<()> {
        self.start_timer = None;
        if self.attach {
            return self.publish_attach().await;
        }
        if !self.mode.is_spectate() {
            // Free the session ports before the game binds them. The host
            // keeps its listener so spectators can join the running match.
            self.ctrl = None;
            self.data = None;
            self.data_accepted = false;
            if !(self.mode.is_host() || self.mode.is_broadcast()) {
                self.server_ctrl = None;
            }
        }
        let server = if self.options.ipc_port != 0 {
            IpcServer::bind_on(self.options.ipc_port).await?
        } else {
            IpcServer::bind().await?
        };
        let port = server.port();
        self.ipc_server = Some(server);
        self.proc.launch(port, self.options.load_framestep)?;
        Ok(())
    }

    /// Attach-mode publish: the game keeps running; it only gets the deltas
    /// over its initialization state. The data socket is ours to make here,
    /// since the post-start reconnect never happens on this path.
    async fn publish_attach(&mut self) -> Result<()> {
        sleep(ATTACH_GRACE).await;
        let tunnel = self.ctrl.as_ref().is_some_and(SmartSocket::is_tunnel);
        self.ctrl = None;
        self.data = Some(
            SmartSocket::connect_udp(&self.address, tunnel, self.options.relay.as_ref()).await?,
        );
        let Some(config) = self.netplay_config.clone() else {
            self.stop_with(SessionError::Disconnected);
            return Ok(());
        };
        let mode = self.mode;
        let address = self.address.clone();
        self.send_ipc(&Message::Mode(mode)).await;
        self.send_ipc(&Message::IpAddrPort(address)).await;
        self.send_ipc(&Message::NetplayConfig(config)).await;
        self.send_ipc(&Message::InitialGameState(InitialGameState::pre_initial()))
            .await;
        self.phase = Phase::Running;
        self.ui
            .display(format!("Started {} mode", self.game_mode_string()));
        Ok(())
    }

    pub(super) async fn on_ipc_connected(&mut self, channel: IpcChannel) -> Result<()> {
        info!("game process connected over ipc");
        self.ipc = Some(channel);
        self.ipc_server = None;

        let session_id = if self.mode.is_spectate() {
            self.spectate_config.as_ref().map(|c| c.session_id)
        } else {
            self.netplay_config.as_ref().map(|c| c.session_id)
        };
        let options = GameOptions {
            app_dir: self.options.app_dir.clone(),
            session_id: session_id.map(|id| id.to_string()),
            training: self.mode.is_training(),
            tournament: self.mode.is_tournament(),
            frame_limiter: self.options.frame_limiter,
            auto_replay_save: self.options.auto_replay_save,
            held_start_duration: self.options.held_start_duration,
        };
        let mappings = self.options.controller_mappings.clone();
        let mode = self.mode;
        let address = self.address.clone();
        self.send_ipc(&Message::GameOptions(options)).await;
        self.send_ipc(&Message::ControllerMappings(mappings)).await;
        self.send_ipc(&Message::Mode(mode)).await;
        self.send_ipc(&Message::IpAddrPort(address)).await;

        if self.mode.is_spectate() {
            if let Some(config) = self.spectate_config.clone() {
                self.send_ipc(&Message::SpectateConfig(Box::new(config))).await;
            }
            self.forward_msg_queue().await;
        } else if let Some(config) = self.netplay_config.clone() {
            self.send_ipc(&Message::NetplayConfig(config)).await;
        }

        if self.mode.is_host() || self.mode.is_broadcast() {
            self.game_started = true;
            self.mode.insert(ClientMode::GAME_STARTED);
        }
        self.phase = Phase::Running;
        self.ui
            .display(format!("Started {} mode", self.game_mode_string()));
        Ok(())
    }

    pub(super) async fn on_ipc_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::ErrorMessage(err) => {
                self.stop_with(err.error);
                Ok(())
            }
            Message::NetplayConfig(config) => {
                // Broadcast sessions learn their advertised port this way.
                self.netplay_config = Some(config);
                self.update_status();
                Ok(())
            }
            Message::IpAddrPort(address) => {
                if self.ctrl.is_some() {
                    self.send_ctrl(&Message::IpAddrPort(address)).await?;
                } else if self.mode.is_local() && !self.attach {
                    // The game asked for an outbound connection while idle:
                    // hand this session over to an attach-mode controller.
                    info!("attach requested for {address}");
                    self.attach_request = Some(address);
                    self.stop_clean();
                } else {
                    debug!("ignoring ipc address with no control socket");
                }
                Ok(())
            }
            Message::ChangeConfig(change) => {
                self.on_change_config(change);
                Ok(())
            }
            msg @ (Message::InitialGameState(_)
            | Message::RngState(_)
            | Message::BothInputs(_)
            | Message::MenuIndex(_)) => {
                if self.game_started {
                    self.hub.broadcast(&msg).await;
                }
                Ok(())
            }
            other => {
                debug!("unexpected ipc message {}", other.kind());
                Ok(())
            }
        }
    }

    fn on_change_config(&mut self, change: rollcast_lib::message::ChangeConfig) {
        use rollcast_lib::message::ChangeKind;
        match change.kind {
            ChangeKind::Delay => self
                .ui
                .display(format!("Input delay was changed to {}", change.delay)),
            ChangeKind::RollbackDelay => self.ui.display(format!(
                "P2 input delay was changed to {}",
                change.rollback_delay
            )),
            ChangeKind::Rollback => self
                .ui
                .display(format!("Rollback was changed to {}", change.rollback)),
        }
    }

    pub(super) fn on_ipc_closed(&mut self) {
        if self.ipc.take().is_some() {
            self.stop_with(SessionError::IpcClosed);
        }
    }

    pub(super) async fn on_link_closed(&mut self, link: Link) -> Result<()> {
        debug!("{link:?} socket closed");
        match link {
            Link::Ctrl => self.ctrl = None,
            Link::Data => {
                self.data = None;
                self.data_accepted = false;
            }
        }

        // In-dummy blip: re-dial the data path to the original address and
        // keep going, gated on the idle timer still running.
        if self.dummy_ready && self.stop_timer.is_some() {
            self.data = Some(
                SmartSocket::connect_udp(
                    &self.original_address,
                    self.options.tunnel,
                    self.options.relay.as_ref(),
                )
                .await?,
            );
            return Ok(());
        }

        if self.mode.is_spectate() && self.game_launched {
            // The stream is gone but the game can play out what it has.
            self.forward_msg_queue().await;
            self.send_ipc(&Message::ErrorMessage(ErrorMessage::new(
                SessionError::Disconnected.to_string(),
            )))
            .await;
            return Ok(());
        }

        if self.mode.is_host() && !self.waiting_for_user && !self.game_launched {
            self.reset_session();
            return Ok(());
        }

        if !(self.user_confirmed && self.final_config_ready) || self.dummy_ready {
            let error = if matches!(
                self.phase,
                Phase::Listening
                    | Phase::VersionExchange
                    | Phase::InitialExchange1
                    | Phase::AwaitSpectate
            ) {
                SessionError::TimedOut
            } else {
                SessionError::Disconnected
            };
            self.stop_with(error);
        }
        Ok(())
    }

    async fn on_dummy_msg(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::InitialGameState(state) => {
                info!(
                    "game state: {:?} stage={} training={}",
                    state.netplay_state, state.stage, state.is_training
                );
                Ok(())
            }
            Message::RngState(_) => Ok(()),
            Message::PlayerInputs(mut inputs) => {
                // Answer past our own injected delay, mashing confirm so
                // menus and rounds keep advancing.
                let delay = self
                    .netplay_config
                    .as_ref()
                    .map(|config| config.delay)
                    .unwrap_or_default();
                inputs.frame += u32::from(delay) * 2;
                for (i, input) in inputs.inputs.iter_mut().enumerate() {
                    let frame = inputs.frame + i as u32;
                    *input = if frame % 5 == 0 { DUMMY_CONFIRM } else { 0 };
                }
                self.send_data(&Message::PlayerInputs(inputs)).await
            }
            Message::MenuIndex(menu) => {
                // Always the first retry option; the host's pick wins.
                if self.mode.is_client() {
                    return self
                        .send_data(&Message::MenuIndex(
                            rollcast_lib::message::MenuIndex::new(menu.index, 0),
                        ))
                        .await;
                }
                Ok(())
            }
            Message::BothInputs(both) => {
                trace!("dummy inputs at frame {} index {}", both.frame, both.index);
                Ok(())
            }
            other => {
                debug!("unexpected dummy message {}", other.kind());
                Ok(())
            }
        }
    }

    /// Clear the per-session state after a partial failure and keep the
    /// listener (and external address publication) for the next client.
    fn reset_session(&mut self) {
        info!("resetting host for a new client");
        self.ctrl = None;
        self.data = None;
        self.data_accepted = false;
        self.first_ctrl_read = false;
        self.initial_config.data_port = 0;
        self.initial_config.remote_name.clear();
        self.initial_config.mode = self.mode;
        self.netplay_config = None;
        self.spectate_config = None;
        self.client_proposal = None;
        self.pinger.reset();
        self.remote_stats = None;
        self.local_stats = None;
        self.merged_stats = None;
        self.ui_recv = None;
        self.msg_queue.clear();
        self.queueing = false;
        self.waiting_for_user = false;
        self.user_confirmed = false;
        self.final_config_ready = false;
        self.ack_sent = false;
        self.phase = Phase::Listening;
        self.update_status();
    }

    pub(super) fn update_status(&mut self) {
        if self.waiting_for_user || !(self.mode.is_host() || self.mode.is_broadcast()) {
            return;
        }
        let what = if self.mode.is_broadcast() {
            "Broadcasting"
        } else {
            "Hosting"
        };
        let port = if self.mode.is_broadcast() {
            let port = self
                .netplay_config
                .as_ref()
                .map(|config| config.broadcast_port)
                .unwrap_or_default();
            if port == 0 {
                return;
            }
            port
        } else {
            self.address.port
        };
        let training = if self.mode.is_training() {
            " (training mode)"
        } else {
            ""
        };
        match &self.external_ip {
            Some(ip) => {
                let published = format!("{ip}:{port}");
                self.ui.display(format!("{what} at {published}{training}"));
                self.ui.address_ready(published);
            }
            None => self.ui.display(format!("{what} on port {port}{training}")),
        }
    }

    async fn forward_msg_queue(&mut self) {
        if self.ipc.is_none() || self.msg_queue.is_empty() {
            return;
        }
        for msg in std::mem::take(&mut self.msg_queue) {
            self.send_ipc(&msg).await;
            if self.ipc.is_none() {
                break;
            }
        }
    }

    fn game_mode_string(&self) -> &'static str {
        if self.mode.is_tournament() {
            "tournament"
        } else if self.mode.is_training() {
            "training"
        } else {
            "versus"
        }
    }

    /// Control-channel send; a failure is a peer disconnect. Returns whether
    /// the message actually went out so callers do not advance the handshake
    /// on a session that just reset or stopped underneath them.
    async fn send_ctrl(&mut self, msg: &Message) -> Result<bool> {
        let Some(ctrl) = self.ctrl.as_mut() else {
            self.on_ctrl_send_failed();
            return Ok(false);
        };
        if let Err(err) = ctrl.send(msg).await {
            debug!("control send failed: {err}");
            self.ctrl = None;
            self.on_ctrl_send_failed();
            return Ok(false);
        }
        Ok(true)
    }

    /// Same policy as a read-side disconnect: the host goes back to
    /// listening, everyone else is done.
    fn on_ctrl_send_failed(&mut self) {
        if self.mode.is_host() && !self.game_launched {
            self.reset_session();
        } else {
            self.stop_with(SessionError::Disconnected);
        }
    }

    async fn send_data(&mut self, msg: &Message) -> Result<()> {
        let Some(data) = self.data.as_mut() else {
            self.stop_with(SessionError::Disconnected);
            return Ok(());
        };
        if let Err(err) = data.send(msg).await {
            debug!("data send failed: {err}");
        }
        Ok(())
    }

    /// IPC send; a failure means the game went away.
    async fn send_ipc(&mut self, msg: &Message) {
        let Some(ipc) = self.ipc.as_mut() else {
            return;
        };
        if let Err(err) = ipc.send(msg).await {
            debug!("ipc send failed: {err}");
            self.on_ipc_closed();
        }
    }
}
