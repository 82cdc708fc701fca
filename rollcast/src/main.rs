use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use rollcast_lib::message::{IpAddrPort, ModeKind};

use rollcast::cui;
use rollcast::keyboard::KeyboardHook;
use rollcast::options::{Cli, CommandKind, SessionOptions};
use rollcast::session::{self, AttachHandoff, SessionController, StopSignal};
use rollcast::tracing_helper;
use rollcast::ui_bridge::UiBridge;

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_helper::init_tracing(".", "rollcast.log", true);

    let options = SessionOptions::from_args(&cli.common)?;
    let (kind, address) = match &cli.command {
        CommandKind::Host { port } => (ModeKind::Host, IpAddrPort::new(String::new(), *port)),
        CommandKind::Join { address } => (ModeKind::Client, IpAddrPort::parse(address)?),
        CommandKind::Spectate { address } => {
            (ModeKind::SpectateNetplay, IpAddrPort::parse(address)?)
        }
        CommandKind::Broadcast => (ModeKind::Broadcast, IpAddrPort::new(String::new(), 0)),
        CommandKind::Offline => (ModeKind::Offline, IpAddrPort::new(String::new(), 0)),
        CommandKind::Replay => (ModeKind::Replay, IpAddrPort::new(String::new(), 0)),
    };

    let ui = UiBridge::new();
    // Escape cancels whichever session is live; the hook outlives them all.
    let cancel_target: Arc<Mutex<Option<StopSignal>>> = Arc::new(Mutex::new(None));
    let keyboard = KeyboardHook::spawn({
        let cancel = Arc::clone(&cancel_target);
        move || {
            if let Some(stop) = cancel.lock().unwrap().as_ref() {
                stop.cancel();
            }
        }
    });

    let mut pending_attach: Option<AttachHandoff> = None;
    let mut first = true;
    loop {
        let mut session_options = options.clone();
        session_options.load_framestep = keyboard.f8_held();
        let controller = if first {
            first = false;
            SessionController::new(kind, address.clone(), session_options, ui.clone())
        } else if let Some(handoff) = pending_attach.take() {
            // An idle local session handed its running game over; join the
            // requested peer without relaunching anything.
            SessionController::attach(handoff, session_options, ui.clone())
        } else {
            break;
        };
        *cancel_target.lock().unwrap() = Some(controller.stop_signal());

        let handle = session::spawn(controller);
        cui::run(&ui, Some(&keyboard));
        let outcome = handle.join();
        if !outcome.last_error.is_empty() {
            eprintln!("{}", outcome.last_error);
        }
        pending_attach = outcome.attach;
        if pending_attach.is_none() {
            break;
        }
    }
    Ok(())
}
