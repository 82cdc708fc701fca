//! End-to-end session establishment over loopback: real controllers on both
//! sides, programmatic prompts, and test stubs standing in for the game
//! processes on the IPC ports.

use std::time::Duration;

use rollcast::ipc::IpcChannel;
use rollcast::options::SessionOptions;
use rollcast::process_host::ProcessHost;
use rollcast::session::{AttachHandoff, SessionController, SessionOutcome};
use rollcast::ui_bridge::{ConfirmRequest, UiBridge, UiDecision};
use rollcast_lib::codec::encode_frame;
use rollcast_lib::message::{
    BothInputs, IpAddrPort, MenuIndex, Message, ModeKind, NetplayConfig, NetplayState,
    SpectateConfig, UNKNOWN_POSITION,
};
use rollcast_lib::message::{ClientMode, VersionConfig};
use rollcast_lib::smart_socket::{SmartSocket, SocketEvent};
use rollcast_lib::version::Version;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(30);

fn options(name: &str, ipc_port: u16) -> SessionOptions {
    SessionOptions {
        name: name.to_owned(),
        ipc_port,
        ..SessionOptions::default()
    }
}

/// Stand-in for the interactive prompt: confirm everything, taking the
/// suggested delay.
fn auto_confirm(ui: &UiBridge) -> std::thread::JoinHandle<()> {
    let ui = ui.clone();
    std::thread::spawn(move || {
        while let Some(request) = ui.wait_for_confirmation() {
            let decision = match request {
                ConfirmRequest::Netplay {
                    suggested_delay, ..
                } => UiDecision {
                    confirmed: true,
                    delay: suggested_delay,
                    rollback: 4,
                    rollback_delay: 0,
                },
                ConfirmRequest::Spectate { .. } => UiDecision {
                    confirmed: true,
                    ..UiDecision::default()
                },
            };
            ui.submit(decision);
        }
    })
}

fn decline_once(ui: &UiBridge) -> std::thread::JoinHandle<()> {
    let ui = ui.clone();
    std::thread::spawn(move || {
        if ui.wait_for_confirmation().is_some() {
            ui.submit(UiDecision::default());
        }
    })
}

/// Spawn a host controller and report its bound port.
async fn spawn_host(
    opts: SessionOptions,
    ui: &UiBridge,
) -> (JoinHandle<SessionOutcome>, u16) {
    let host = SessionController::new(
        ModeKind::Host,
        IpAddrPort::new(String::new(), 0),
        opts,
        ui.clone(),
    );
    let mut port_rx = host.port_watch();
    let task = tokio::spawn(host.run());
    let guard = timeout(WAIT, port_rx.wait_for(|port| port.is_some()))
        .await
        .expect("host must bind")
        .expect("host task lives");
    let port = (*guard).expect("port is set");
    drop(guard);
    (task, port)
}

fn spawn_client(
    kind: ModeKind,
    port: u16,
    opts: SessionOptions,
    ui: &UiBridge,
) -> JoinHandle<SessionOutcome> {
    let client = SessionController::new(
        kind,
        IpAddrPort::new("127.0.0.1".to_owned(), port),
        opts,
        ui.clone(),
    );
    tokio::spawn(client.run())
}

/// Pretend to be the spawned game: connect to the controller's IPC port.
async fn game_stub(ipc_port: u16) -> IpcChannel {
    let deadline = Instant::now() + WAIT;
    loop {
        match IpcChannel::connect(ipc_port).await {
            Ok(channel) => return channel,
            Err(_) => {
                assert!(Instant::now() < deadline, "ipc server never appeared");
                sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn recv_msg(channel: &mut IpcChannel) -> Message {
    timeout(WAIT, channel.recv())
        .await
        .expect("ipc read timed out")
        .expect("ipc read failed")
        .expect("ipc closed early")
}

/// Read the launch-mode init sequence and hand back the final config.
async fn read_netplay_init(channel: &mut IpcChannel) -> NetplayConfig {
    let mut kinds = Vec::new();
    loop {
        let msg = recv_msg(channel).await;
        kinds.push(msg.kind());
        if let Message::NetplayConfig(config) = msg {
            assert_eq!(
                kinds,
                [
                    "GameOptions",
                    "ControllerMappings",
                    "Mode",
                    "IpAddrPort",
                    "NetplayConfig"
                ],
                "init sequence out of order"
            );
            return config;
        }
        assert!(kinds.len() < 8, "no NetplayConfig in init sequence: {kinds:?}");
    }
}

async fn read_spectate_init(channel: &mut IpcChannel) -> SpectateConfig {
    let mut kinds = Vec::new();
    loop {
        let msg = recv_msg(channel).await;
        kinds.push(msg.kind());
        if let Message::SpectateConfig(config) = msg {
            assert_eq!(
                kinds,
                [
                    "GameOptions",
                    "ControllerMappings",
                    "Mode",
                    "IpAddrPort",
                    "SpectateConfig"
                ],
                "init sequence out of order"
            );
            return *config;
        }
        assert!(kinds.len() < 8, "no SpectateConfig in init sequence: {kinds:?}");
    }
}

#[tokio::test]
async fn happy_host_client_handshake() {
    let host_ui = UiBridge::new();
    let client_ui = UiBridge::new();

    let (host_task, port) = spawn_host(options("Alice", 47311), &host_ui).await;
    let _host_prompt = auto_confirm(&host_ui);

    let client_task = spawn_client(ModeKind::Client, port, options("Bob", 47312), &client_ui);
    let _client_prompt = auto_confirm(&client_ui);

    let mut host_game = game_stub(47311).await;
    let mut client_game = game_stub(47312).await;

    let host_config = read_netplay_init(&mut host_game).await;
    let client_config = read_netplay_init(&mut client_game).await;

    // Both peers hold the same negotiated artifact.
    assert_eq!(host_config.session_id, client_config.session_id);
    assert_eq!(host_config.delay, client_config.delay);
    assert_eq!(host_config.win_count, 2);
    assert!(host_config.delay <= 9, "delay admission violated");
    assert!((1..=2).contains(&host_config.host_player));

    // Name echo: the host slot carries the host's name.
    let host_slot = usize::from(host_config.host_player - 1);
    assert_eq!(host_config.names[host_slot], "Alice");
    assert_eq!(host_config.names[1 - host_slot], "Bob");
    assert_eq!(client_config.names, host_config.names);

    // The games going away ends both sessions with the standard error.
    drop(host_game);
    drop(client_game);
    let host_outcome = timeout(WAIT, host_task).await.unwrap().unwrap();
    let client_outcome = timeout(WAIT, client_task).await.unwrap().unwrap();
    assert_eq!(host_outcome.last_error, "Game closed!");
    assert_eq!(client_outcome.last_error, "Game closed!");
}

#[tokio::test]
async fn delay_ceiling_breach_resets_host_and_fails_client() {
    let host_ui = UiBridge::new();
    let client_ui = UiBridge::new();

    // Any loopback round trip exceeds a zero-frame ceiling.
    let mut host_opts = options("Alice", 0);
    host_opts.max_real_delay = 0;
    let mut client_opts = options("Bob", 0);
    client_opts.max_real_delay = 0;

    let host = SessionController::new(
        ModeKind::Host,
        IpAddrPort::new(String::new(), 0),
        host_opts,
        host_ui.clone(),
    );
    let host_stop = host.stop_signal();
    let mut port_rx = host.port_watch();
    let host_task = tokio::spawn(host.run());
    let guard = timeout(WAIT, port_rx.wait_for(|port| port.is_some()))
        .await
        .unwrap()
        .unwrap();
    let port = (*guard).expect("port is set");
    drop(guard);
    let _host_prompt = auto_confirm(&host_ui);

    let client_task = spawn_client(ModeKind::Client, port, client_opts, &client_ui);
    let _client_prompt = auto_confirm(&client_ui);

    let client_outcome = timeout(WAIT, client_task).await.unwrap().unwrap();
    assert!(
        client_outcome
            .last_error
            .contains("Network delay greater than limit: 0"),
        "unexpected client error: {}",
        client_outcome.last_error
    );

    // The host reset instead of dying: a fresh dial still gets greeted.
    let target = IpAddrPort::new("127.0.0.1".to_owned(), port);
    let mut probe = timeout(WAIT, SmartSocket::connect_tcp(&target, false, None))
        .await
        .unwrap()
        .expect("host must keep listening after the reset");
    let greeting = timeout(WAIT, probe.recv()).await.unwrap().unwrap();
    assert!(matches!(
        greeting,
        SocketEvent::Message(Message::VersionConfig(_))
    ));

    host_stop.cancel();
    let host_outcome = timeout(WAIT, host_task).await.unwrap().unwrap();
    assert_eq!(host_outcome.last_error, "");
}

#[tokio::test]
async fn relay_redirect_re_dials_and_completes() {
    let host_ui = UiBridge::new();
    let client_ui = UiBridge::new();

    let (host_task, port) = spawn_host(options("Alice", 47321), &host_ui).await;
    let _host_prompt = auto_confirm(&host_ui);

    // A relay that answers every connection by pointing at the real host.
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = relay.accept().await.unwrap();
        let redirect = encode_frame(&Message::IpAddrPort(IpAddrPort::new(
            "127.0.0.1".to_owned(),
            port,
        )))
        .unwrap();
        stream.write_all(&redirect).await.unwrap();
        stream.flush().await.unwrap();
        // Hold the socket briefly so the redirect is read before EOF.
        sleep(Duration::from_millis(500)).await;
    });

    let client_task = spawn_client(
        ModeKind::Client,
        relay_port,
        options("Bob", 47322),
        &client_ui,
    );
    let _client_prompt = auto_confirm(&client_ui);

    let mut host_game = game_stub(47321).await;
    let mut client_game = game_stub(47322).await;
    let host_config = read_netplay_init(&mut host_game).await;
    let client_config = read_netplay_init(&mut client_game).await;
    assert_eq!(host_config.session_id, client_config.session_id);

    drop(host_game);
    drop(client_game);
    timeout(WAIT, host_task).await.unwrap().unwrap();
    timeout(WAIT, client_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_at_the_prompt_exits_cleanly() {
    let host_ui = UiBridge::new();
    let client_ui = UiBridge::new();

    let (host_task, port) = spawn_host(options("Alice", 0), &host_ui).await;
    let _host_prompt = auto_confirm(&host_ui);

    let client_task = spawn_client(ModeKind::Client, port, options("Bob", 47331), &client_ui);
    let _client_prompt = decline_once(&client_ui);

    let client_outcome = timeout(WAIT, client_task).await.unwrap().unwrap();
    assert_eq!(client_outcome.last_error, "", "a declined prompt is clean");

    // No IPC was ever opened on the client side.
    assert!(IpcChannel::connect(47331).await.is_err());

    host_task.abort();
}

#[tokio::test]
async fn spectator_joins_a_running_match_and_gets_the_stream_in_order() {
    let host_ui = UiBridge::new();
    let client_ui = UiBridge::new();
    let spectator_ui = UiBridge::new();

    let (host_task, port) = spawn_host(options("Alice", 47341), &host_ui).await;
    let _host_prompt = auto_confirm(&host_ui);
    let client_task = spawn_client(ModeKind::Client, port, options("Bob", 47342), &client_ui);
    let _client_prompt = auto_confirm(&client_ui);

    let mut host_game = game_stub(47341).await;
    let mut client_game = game_stub(47342).await;
    read_netplay_init(&mut host_game).await;
    read_netplay_init(&mut client_game).await;

    // The running game narrates; everything lands in the catch-up backlog.
    let inputs = |frame| {
        Message::BothInputs(BothInputs {
            frame,
            index: 0,
            inputs: [vec![0x10], vec![0x20]],
        })
    };
    host_game.send(&inputs(1)).await.unwrap();
    host_game.send(&inputs(2)).await.unwrap();

    // A third peer dials in as a spectator mid-match.
    let spectator_task = spawn_client(
        ModeKind::SpectateNetplay,
        port,
        options("Carol", 47343),
        &spectator_ui,
    );
    let _spectator_prompt = auto_confirm(&spectator_ui);

    // More stream while the spectator's game is still coming up; it must be
    // queued and flushed in order, not dropped.
    host_game.send(&inputs(3)).await.unwrap();
    host_game
        .send(&Message::MenuIndex(MenuIndex::new(7, 1)))
        .await
        .unwrap();

    let mut spectator_game = game_stub(47343).await;
    let spectate = read_spectate_init(&mut spectator_game).await;
    assert!(spectate.names.contains(&"Alice".to_owned()));
    assert!(spectate.names.contains(&"Bob".to_owned()));
    assert_eq!(spectate.win_count, 2);

    let mut frames = Vec::new();
    let mut menu = None;
    while menu.is_none() {
        match recv_msg(&mut spectator_game).await {
            Message::BothInputs(both) => frames.push(both.frame),
            Message::MenuIndex(m) => menu = Some(m),
            other => panic!("unexpected spectator message {}", other.kind()),
        }
    }
    assert_eq!(frames, [1, 2, 3], "stream must arrive FIFO");
    assert_eq!(menu.unwrap().index, 7);

    drop(spectator_game);
    drop(host_game);
    drop(client_game);
    timeout(WAIT, spectator_task).await.unwrap().unwrap();
    timeout(WAIT, host_task).await.unwrap().unwrap();
    timeout(WAIT, client_task).await.unwrap().unwrap();
}

async fn dial_raw(port: u16) -> SmartSocket {
    let target = IpAddrPort::new("127.0.0.1".to_owned(), port);
    let mut probe = timeout(WAIT, SmartSocket::connect_tcp(&target, false, None))
        .await
        .unwrap()
        .unwrap();
    let greeting = timeout(WAIT, probe.recv()).await.unwrap().unwrap();
    assert!(matches!(
        greeting,
        SocketEvent::Message(Message::VersionConfig(_))
    ));
    probe
}

async fn expect_error(probe: &mut SmartSocket, needle: &str) {
    let answer = timeout(WAIT, probe.recv()).await.unwrap().unwrap();
    let SocketEvent::Message(Message::ErrorMessage(err)) = answer else {
        panic!("expected an error message, got {answer:?}");
    };
    assert!(
        err.error.contains(needle),
        "unexpected refusal: {}",
        err.error
    );
}

#[tokio::test]
async fn version_mismatch_is_refused_and_host_keeps_listening() {
    let host_ui = UiBridge::new();
    let (host_task, port) = spawn_host(options("Alice", 47361), &host_ui).await;
    let _host_prompt = auto_confirm(&host_ui);

    let mut probe = dial_raw(port).await;
    probe
        .send(&Message::VersionConfig(VersionConfig {
            version: Version {
                code: "0.0.0-elsewhere".to_owned(),
                revision: "f00f".to_owned(),
                build_time: "never".to_owned(),
            },
            mode: ClientMode::new(ModeKind::Client),
        }))
        .await
        .unwrap();
    expect_error(&mut probe, "Incompatible host version:").await;
    drop(probe);

    // The refusal did not poison the host; a matching client still works.
    let client_ui = UiBridge::new();
    let client_task = spawn_client(ModeKind::Client, port, options("Bob", 47362), &client_ui);
    let _client_prompt = auto_confirm(&client_ui);
    let mut host_game = game_stub(47361).await;
    let mut client_game = game_stub(47362).await;
    let host_config = read_netplay_init(&mut host_game).await;
    let client_config = read_netplay_init(&mut client_game).await;
    assert_eq!(host_config.session_id, client_config.session_id);

    drop(host_game);
    drop(client_game);
    timeout(WAIT, host_task).await.unwrap().unwrap();
    timeout(WAIT, client_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn second_client_is_refused_while_one_is_connecting() {
    let host_ui = UiBridge::new();
    let client_ui = UiBridge::new();

    let (host_task, port) = spawn_host(options("Alice", 0), &host_ui).await;
    let client_task = spawn_client(ModeKind::Client, port, options("Bob", 0), &client_ui);
    let _client_prompt = auto_confirm(&client_ui);

    // Block on the host's own prompt: once it fires, the control slot is
    // taken and stays taken until the session resolves.
    let request = tokio::task::spawn_blocking({
        let ui = host_ui.clone();
        move || ui.wait_for_confirmation()
    })
    .await
    .unwrap();
    assert!(request.is_some(), "host never reached confirmation");

    let mut probe = dial_raw(port).await;
    probe
        .send(&Message::VersionConfig(VersionConfig::new(ClientMode::new(
            ModeKind::Client,
        ))))
        .await
        .unwrap();
    expect_error(&mut probe, "Another client is currently connecting!").await;
    drop(probe);

    // Let the session wind down.
    host_ui.submit(UiDecision::default());
    let host_outcome = timeout(WAIT, host_task).await.unwrap().unwrap();
    assert_eq!(host_outcome.last_error, "");
    let _ = timeout(WAIT, client_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_across_threads() {
    let ui = UiBridge::new();
    let host = SessionController::new(
        ModeKind::Host,
        IpAddrPort::new(String::new(), 0),
        options("Alice", 0),
        ui,
    );
    let stop = host.stop_signal();
    let mut port_rx = host.port_watch();
    let task = tokio::spawn(host.run());
    timeout(WAIT, port_rx.wait_for(|port| port.is_some()))
        .await
        .unwrap()
        .unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let stop = stop.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    stop.cancel();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let outcome = timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(outcome.last_error, "", "cancellation sets no error");
}

#[tokio::test]
async fn attach_mode_publishes_deltas_without_relaunching() {
    let host_ui = UiBridge::new();
    let (host_task, port) = spawn_host(options("Alice", 47351), &host_ui).await;
    let _host_prompt = auto_confirm(&host_ui);
    tokio::spawn(async move {
        let mut host_game = game_stub(47351).await;
        read_netplay_init(&mut host_game).await;
        // Keep the host's game alive for the duration.
        sleep(WAIT).await;
        drop(host_game);
    });

    // The game process is already running with an open IPC channel.
    let ipc_server = rollcast::ipc::IpcServer::bind().await.unwrap();
    let ipc_port = ipc_server.port();
    let game_side = tokio::spawn(async move { IpcChannel::connect(ipc_port).await.unwrap() });
    let controller_side = ipc_server.accept().await.unwrap();
    let mut game_side = game_side.await.unwrap();

    let handoff = AttachHandoff {
        address: IpAddrPort::new("127.0.0.1".to_owned(), port),
        ipc: controller_side,
        proc: ProcessHost::new(None),
    };
    let attach_ui = UiBridge::new();
    let attach_task = tokio::spawn(
        SessionController::attach(handoff, SessionOptions::default(), attach_ui).run(),
    );

    // Only the deltas arrive, in order, with the synthetic pre-initial
    // state; options and mappings are not resent.
    let Message::Mode(mode) = recv_msg(&mut game_side).await else {
        panic!("expected the client mode first");
    };
    assert_eq!(mode.kind, ModeKind::Client);
    let Message::IpAddrPort(address) = recv_msg(&mut game_side).await else {
        panic!("expected the remote address");
    };
    assert_eq!(address.port, port);
    let Message::NetplayConfig(config) = recv_msg(&mut game_side).await else {
        panic!("expected the netplay config");
    };
    assert!(config.delay <= 9);
    let Message::InitialGameState(state) = recv_msg(&mut game_side).await else {
        panic!("expected the synthetic initial state");
    };
    assert_eq!(state.netplay_state, NetplayState::PreInitial);
    assert_eq!(state.stage, 0);
    assert_eq!(state.chara, [UNKNOWN_POSITION; 2]);
    assert_eq!(state.moon, [UNKNOWN_POSITION; 2]);

    // The attached game going away ends the session; nothing was spawned.
    drop(game_side);
    let outcome = timeout(WAIT, attach_task).await.unwrap().unwrap();
    assert_eq!(outcome.last_error, "Game closed!");
    host_task.abort();
}
