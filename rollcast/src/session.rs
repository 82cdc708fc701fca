//! The handshake state machine and session lifecycle orchestrator.
//!
//! One controller drives one session: version gate, identity exchange, data
//! channel, two-sided ping measurement, delay admission, user confirmation,
//! config publication, then the handoff to the game process. A dedicated
//! reactor thread owns every socket and timer; sub-components are state
//! machines fed by the loop, and anything that happens off-loop arrives as
//! an explicit [`Event`] on one queue.

mod handshake;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rollcast_lib::message::{
    ClientMode, InitialConfig, IpAddrPort, Message, ModeKind, NetplayConfig, PingStats,
    SpectateConfig, VersionConfig,
};
use rollcast_lib::pinger::Pinger;
use rollcast_lib::smart_socket::{SmartSocket, SocketEvent};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diagnostics;
use crate::external_ip;
use crate::ipc::{IpcChannel, IpcServer};
use crate::options::SessionOptions;
use crate::process_host::ProcessHost;
use crate::spectator::SpectatorHub;
use crate::timer::Timer;
use crate::ui_bridge::UiBridge;

/// How long a control socket may sit without completing a version exchange.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Final configs are still in flight when both sides agree to start; give
/// them a beat before tearing the session sockets down.
const START_DELAY: Duration = Duration::from_millis(1000);

/// Attach-mode pause so the running game finishes its current IPC drain.
const ATTACH_GRACE: Duration = Duration::from_millis(100);

const FRAME_MS: f64 = 1000.0 / 60.0;

/// Frames of input latency needed to mask the given round trip at 60 Hz.
pub fn compute_delay(mean_ms: f64) -> u8 {
    (mean_ms / FRAME_MS).ceil().clamp(0.0, 255.0) as u8
}

pub fn format_stats(stats: &PingStats) -> String {
    format!(
        "Ping: {:.2} ms (worst {:.2} ms, stdev {:.2} ms, stderr {:.2} ms)\nPacket loss: {}%",
        stats.latency.mean(),
        stats.latency.worst(),
        stats.latency.std_dev(),
        stats.latency.std_err(),
        stats.packet_loss,
    )
}

/// Session error taxonomy; the display strings are what the UI surfaces.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Incompatible host version: {0}")]
    VersionMismatch(String),
    #[error("Not in a game yet, cannot spectate!")]
    SpectateNotReady,
    #[error("Another client is currently connecting!")]
    HostBusy,
    #[error("Disconnected!")]
    Disconnected,
    #[error("Timed out!")]
    TimedOut,
    #[error("Game closed!")]
    IpcClosed,
}

/// Explicit handshake state; a message that is not valid for the current
/// phase is logged and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Listening,
    VersionExchange,
    InitialExchange1,
    InitialExchange2,
    DataPortOpen,
    Pinging,
    AwaitSpectate,
    AwaitConfirmation,
    ConfigPublish,
    Starting,
    Running,
    Terminated,
}

/// Cross-thread cancellation; idempotent and safe from any thread.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Off-loop happenings, posted to the reactor queue.
pub(crate) enum Event {
    /// A pended control socket produced its first message.
    Pending {
        id: u64,
        socket: SmartSocket,
        msg: Box<Message>,
    },
    /// A pended control socket timed out or died before speaking.
    PendingGone { id: u64 },
    SpectatorClosed { id: u64 },
    ExternalIp(Option<String>),
}

enum Step {
    Cancelled,
    Queue(Event),
    CtrlAccept(std::io::Result<(TcpStream, SocketAddr)>),
    Ctrl(Result<SocketEvent>),
    Data(Result<SocketEvent>),
    UiWake,
    IpcAccept(Result<IpcChannel>),
    Ipc(Result<Option<Message>>),
    StopTimer,
    StartTimer,
    PingTick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Link {
    Ctrl,
    Data,
}

/// Everything a finished session hands back. `last_error` is empty on a
/// clean or cancelled exit; `attach` carries the running game to the
/// attach-mode controller.
pub struct SessionOutcome {
    pub last_error: String,
    pub attach: Option<AttachHandoff>,
}

/// A live game process and its IPC channel, surviving the session that
/// spawned them.
pub struct AttachHandoff {
    pub address: IpAddrPort,
    pub ipc: IpcChannel,
    pub proc: ProcessHost,
}

pub struct SessionController {
    mode: ClientMode,
    options: SessionOptions,
    ui: UiBridge,
    stop: StopSignal,

    original_address: IpAddrPort,
    address: IpAddrPort,
    port_tx: watch::Sender<Option<u16>>,

    phase: Phase,
    server_ctrl: Option<TcpListener>,
    ctrl: Option<SmartSocket>,
    data: Option<SmartSocket>,
    data_accepted: bool,
    first_ctrl_read: bool,

    initial_config: InitialConfig,
    netplay_config: Option<NetplayConfig>,
    spectate_config: Option<SpectateConfig>,
    client_proposal: Option<rollcast_lib::message::DelayProposal>,

    pinger: Pinger,
    remote_stats: Option<PingStats>,
    local_stats: Option<PingStats>,
    merged_stats: Option<PingStats>,

    waiting_for_user: bool,
    user_confirmed: bool,
    final_config_ready: bool,
    ack_sent: bool,
    game_launched: bool,
    game_started: bool,
    dummy_ready: bool,
    queueing: bool,
    msg_queue: Vec<Message>,

    ui_recv: Option<UdpSocket>,
    stop_timer: Option<Timer>,
    start_timer: Option<Timer>,

    hub: SpectatorHub,
    proc: ProcessHost,
    ipc_server: Option<IpcServer>,
    ipc: Option<IpcChannel>,
    attach: bool,
    attach_request: Option<IpAddrPort>,

    external_ip: Option<String>,
    pending_seq: u64,

    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,

    last_error: Option<String>,
}

impl SessionController {
    pub fn new(
        kind: ModeKind,
        address: IpAddrPort,
        options: SessionOptions,
        ui: UiBridge,
    ) -> Self {
        let mut mode = ClientMode::new(kind);
        if options.training {
            mode.insert(ClientMode::TRAINING);
        }
        if options.tournament {
            mode.insert(ClientMode::TOURNAMENT);
        }
        if options.tunnel {
            mode.insert(ClientMode::UDP_TUNNEL);
        }
        if options.wine {
            mode.insert(ClientMode::IS_WINE);
        }
        let initial_config = InitialConfig::new(mode, options.name.clone(), options.win_count);
        let proc = ProcessHost::new(options.game_path.clone());
        let (event_tx, event_rx) = mpsc::channel(64);
        let (port_tx, _) = watch::channel(None);
        ui.reset();
        Self {
            mode,
            options,
            ui,
            stop: StopSignal::default(),
            original_address: address.clone(),
            address,
            port_tx,
            phase: Phase::Listening,
            server_ctrl: None,
            ctrl: None,
            data: None,
            data_accepted: false,
            first_ctrl_read: false,
            initial_config,
            netplay_config: None,
            spectate_config: None,
            client_proposal: None,
            pinger: Pinger::default(),
            remote_stats: None,
            local_stats: None,
            merged_stats: None,
            waiting_for_user: false,
            user_confirmed: false,
            final_config_ready: false,
            ack_sent: false,
            game_launched: false,
            game_started: false,
            dummy_ready: false,
            queueing: false,
            msg_queue: Vec::new(),
            ui_recv: None,
            stop_timer: None,
            start_timer: None,
            hub: SpectatorHub::new(),
            proc,
            ipc_server: None,
            ipc: None,
            attach: false,
            attach_request: None,
            external_ip: None,
            pending_seq: 0,
            event_tx,
            event_rx,
            last_error: None,
        }
    }

    /// Attach-mode entry: the game is already running with an open IPC
    /// channel and asked for an outbound connection. Handshakes as a client
    /// with auto-confirmation and never relaunches the process.
    pub fn attach(handoff: AttachHandoff, options: SessionOptions, ui: UiBridge) -> Self {
        let AttachHandoff {
            address,
            ipc,
            proc,
        } = handoff;
        let mut controller = Self::new(ModeKind::Client, address, options, ui);
        controller.attach = true;
        controller.ipc = Some(ipc);
        controller.proc = proc;
        controller
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Publishes the bound control port once a host starts listening.
    pub fn port_watch(&self) -> watch::Receiver<Option<u16>> {
        self.port_tx.subscribe()
    }

    pub async fn run(mut self) -> SessionOutcome {
        info!(
            "session start: mode={} flags={{ {} }} address='{}'",
            self.mode,
            self.mode.flag_string(),
            self.address
        );
        diagnostics::emit("session", &format!("start {}", self.mode));

        if let Err(err) = self.start().await {
            self.fail(err.to_string());
            self.phase = Phase::Terminated;
        }
        while self.phase != Phase::Terminated && !self.stop.is_cancelled() {
            let step = self.next_step().await;
            if let Err(err) = self.handle_step(step).await {
                self.fail(err.to_string());
                break;
            }
        }
        self.teardown();

        let last_error = self.last_error.take().unwrap_or_default();
        if last_error.is_empty() {
            info!("session terminated cleanly");
        } else {
            error!("session terminated: {last_error}");
        }
        let attach = self.attach_request.take().and_then(|address| {
            Some(AttachHandoff {
                address,
                ipc: self.ipc.take()?,
                proc: std::mem::replace(&mut self.proc, ProcessHost::new(None)),
            })
        });
        SessionOutcome { last_error, attach }
    }

    async fn start(&mut self) -> Result<()> {
        if self.attach {
            self.ui.display(format!("Trying {}", self.address));
            return self.dial_ctrl().await;
        }
        match self.mode.kind {
            ModeKind::Host => self.start_host().await,
            ModeKind::Client | ModeKind::SpectateNetplay | ModeKind::SpectateBroadcast => {
                self.start_dial().await
            }
            ModeKind::Broadcast | ModeKind::Offline | ModeKind::Replay => self.start_local().await,
        }
    }

    async fn start_host(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.address.port))
            .await
            .with_context(|| format!("cannot listen on port {}", self.address.port))?;
        self.address.port = listener.local_addr()?.port();
        let _ = self.port_tx.send(Some(self.address.port));
        info!("listening on port {}", self.address.port);
        self.server_ctrl = Some(listener);
        self.phase = Phase::Listening;
        if self.options.external_lookup {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(Event::ExternalIp(external_ip::lookup().await)).await;
            });
        }
        self.update_status();
        Ok(())
    }

    async fn start_dial(&mut self) -> Result<()> {
        let note = if self.options.tunnel { " (UDP tunnel)" } else { "" };
        self.ui.display(format!("Trying {}{}", self.address, note));
        self.dial_ctrl().await
    }

    async fn dial_ctrl(&mut self) -> Result<()> {
        let mut ctrl = SmartSocket::connect_tcp(
            &self.address,
            self.options.tunnel,
            self.options.relay.as_ref(),
        )
        .await?;
        ctrl.send(&Message::VersionConfig(VersionConfig::new(self.mode)))
            .await?;
        self.ctrl = Some(ctrl);
        self.stop_timer = Some(Timer::after(DEFAULT_PENDING_TIMEOUT));
        self.first_ctrl_read = true;
        self.phase = Phase::VersionExchange;
        Ok(())
    }

    async fn start_local(&mut self) -> Result<()> {
        let mut config = NetplayConfig::new(self.mode);
        config.session_id = Uuid::new_v4();
        config.names = ["localP1".to_owned(), "localP2".to_owned()];
        self.netplay_config = Some(config);
        if self.mode.is_broadcast() && self.options.external_lookup {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(Event::ExternalIp(external_ip::lookup().await)).await;
            });
        }
        self.start_game().await
    }

    async fn next_step(&mut self) -> Step {
        let stop_deadline = self.stop_timer.map(|t| t.deadline());
        let start_deadline = self.start_timer.map(|t| t.deadline());
        let ping_deadline = self.pinger.next_tick().map(Instant::from_std);
        let Self {
            stop,
            event_rx,
            server_ctrl,
            ctrl,
            data,
            ui_recv,
            ipc_server,
            ipc,
            ..
        } = self;
        tokio::select! {
            _ = stop.cancelled() => Step::Cancelled,
            Some(event) = event_rx.recv() => Step::Queue(event),
            result = accept_on(server_ctrl) => Step::CtrlAccept(result),
            result = recv_on(ctrl) => Step::Ctrl(result),
            result = recv_on(data) => Step::Data(result),
            _ = wake_on(ui_recv) => Step::UiWake,
            result = ipc_accept_on(ipc_server) => Step::IpcAccept(result),
            result = ipc_recv_on(ipc) => Step::Ipc(result),
            _ = sleep_opt(stop_deadline) => Step::StopTimer,
            _ = sleep_opt(start_deadline) => Step::StartTimer,
            _ = sleep_opt(ping_deadline) => Step::PingTick,
        }
    }

    async fn handle_step(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Cancelled => {
                // Escape or an external cancel: clean exit, no error text.
                self.phase = Phase::Terminated;
                Ok(())
            }
            Step::Queue(event) => self.on_event(event).await,
            Step::CtrlAccept(result) => match result {
                Ok((stream, peer)) => self.on_ctrl_accepted(stream, peer).await,
                Err(err) => {
                    warn!("accept failed: {err}");
                    Ok(())
                }
            },
            Step::Ctrl(result) => match result {
                Ok(SocketEvent::Message(msg)) => self.on_ctrl_message(msg).await,
                Ok(SocketEvent::Accepted(_)) => Ok(()),
                Ok(SocketEvent::Closed) => self.on_link_closed(Link::Ctrl).await,
                Err(err) => {
                    debug!("control socket error: {err}");
                    self.on_link_closed(Link::Ctrl).await
                }
            },
            Step::Data(result) => match result {
                Ok(SocketEvent::Accepted(peer)) => self.on_data_accepted(peer),
                Ok(SocketEvent::Message(msg)) => self.on_data_message(msg).await,
                Ok(SocketEvent::Closed) => self.on_link_closed(Link::Data).await,
                Err(err) => {
                    debug!("data socket error: {err}");
                    self.on_link_closed(Link::Data).await
                }
            },
            Step::UiWake => self.on_user_decision().await,
            Step::IpcAccept(result) => match result {
                Ok(channel) => self.on_ipc_connected(channel).await,
                Err(err) => {
                    warn!("ipc accept failed: {err}");
                    Ok(())
                }
            },
            Step::Ipc(result) => match result {
                Ok(Some(msg)) => self.on_ipc_message(msg).await,
                Ok(None) => {
                    self.on_ipc_closed();
                    Ok(())
                }
                Err(err) => {
                    debug!("ipc error: {err}");
                    self.on_ipc_closed();
                    Ok(())
                }
            },
            Step::StopTimer => {
                self.stop_timer = None;
                self.stop_with(SessionError::TimedOut);
                Ok(())
            }
            Step::StartTimer => self.on_start_timer().await,
            Step::PingTick => self.on_ping_tick().await,
        }
    }

    /// Record an error exactly once; later errors lose.
    fn fail(&mut self, error: impl ToString) {
        if self.last_error.is_none() {
            let error = error.to_string();
            diagnostics::emit("error", &error);
            self.last_error = Some(error);
        }
    }

    fn stop_with(&mut self, error: impl ToString) {
        self.fail(error);
        self.phase = Phase::Terminated;
    }

    fn stop_clean(&mut self) {
        self.phase = Phase::Terminated;
    }

    /// Release everything in a fixed order: control, data, server sockets,
    /// UI wake socket, timers. Runs exactly once, before the thread joins,
    /// so the game process never races the session for its ports.
    fn teardown(&mut self) {
        self.phase = Phase::Terminated;
        self.ctrl = None;
        self.data = None;
        self.server_ctrl = None;
        self.ui_recv = None;
        self.stop_timer = None;
        self.start_timer = None;
        self.pinger.reset();
        self.hub.shutdown();
        if self.attach_request.is_none() {
            self.ipc_server = None;
            self.ipc = None;
            self.proc.close();
        }
        self.ui.notify_stopped();
        diagnostics::emit("session", "stopped");
    }
}

/// Spawned session: the reactor runs on its own thread with its own
/// runtime, the caller keeps the UI side.
pub struct SessionHandle {
    stop: StopSignal,
    thread: Option<std::thread::JoinHandle<SessionOutcome>>,
}

impl SessionHandle {
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn join(mut self) -> SessionOutcome {
        let Some(thread) = self.thread.take() else {
            return SessionOutcome {
                last_error: String::new(),
                attach: None,
            };
        };
        thread.join().unwrap_or_else(|_| SessionOutcome {
            last_error: "Unknown error!".to_owned(),
            attach: None,
        })
    }
}

pub fn spawn(controller: SessionController) -> SessionHandle {
    let stop = controller.stop_signal();
    let thread = std::thread::spawn(move || {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(controller.run())
    });
    SessionHandle {
        stop,
        thread: Some(thread),
    }
}

async fn recv_on(socket: &mut Option<SmartSocket>) -> Result<SocketEvent> {
    match socket.as_mut() {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn accept_on(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn wake_on(socket: &Option<UdpSocket>) {
    match socket {
        Some(socket) => {
            let mut buf = [0u8; 8];
            let _ = socket.recv_from(&mut buf).await;
        }
        None => std::future::pending().await,
    }
}

async fn ipc_accept_on(server: &Option<IpcServer>) -> Result<IpcChannel> {
    match server {
        Some(server) => server.accept().await,
        None => std::future::pending().await,
    }
}

async fn ipc_recv_on(ipc: &mut Option<IpcChannel>) -> Result<Option<Message>> {
    match ipc.as_mut() {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_frames_at_sixty_hertz() {
        assert_eq!(compute_delay(0.0), 0);
        assert_eq!(compute_delay(10.0), 1);
        assert_eq!(compute_delay(16.7), 2);
        assert_eq!(compute_delay(32.0), 2);
        assert_eq!(compute_delay(120.0), 8);
        assert_eq!(compute_delay(1e9), 255);
    }

    #[test]
    fn stop_signal_is_idempotent_and_observable() {
        let signal = StopSignal::default();
        assert!(!signal.is_cancelled());
        signal.cancel();
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wait_returns_after_cancel() {
        let signal = StopSignal::default();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::task::yield_now().await;
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() must wake")
            .unwrap();
    }
}
