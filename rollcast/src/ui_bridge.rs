//! Rendezvous between the reactor thread and the interactive prompt.
//!
//! Two mechanisms in tandem: a condition variable blocks the UI thread until
//! the controller wants a confirmation, and a loopback UDP datagram turns
//! the finished prompt into an ordinary readable event inside the reactor,
//! so no cross-thread wakeup machinery leaks into the I/O loop.

use std::net::UdpSocket;
use std::sync::{Arc, Condvar, Mutex};

use rollcast_lib::message::{InitialConfig, PingStats, SpectateConfig};
use tracing::debug;

/// What the controller wants the user to look at.
#[derive(Clone, Debug)]
pub enum ConfirmRequest {
    Netplay {
        initial: InitialConfig,
        stats: PingStats,
        suggested_delay: u8,
        wake_port: u16,
    },
    Spectate {
        config: Box<SpectateConfig>,
        wake_port: u16,
    },
}

impl ConfirmRequest {
    fn wake_port(&self) -> u16 {
        match self {
            Self::Netplay { wake_port, .. } | Self::Spectate { wake_port, .. } => *wake_port,
        }
    }
}

/// The prompt's answer. The value fields only matter when confirmed on a
/// netplay prompt: the host publishes them, the client proposes them.
#[derive(Clone, Copy, Debug, Default)]
pub struct UiDecision {
    pub confirmed: bool,
    pub delay: u8,
    pub rollback: u8,
    pub rollback_delay: u8,
}

#[derive(Default)]
struct Shared {
    waiting: Option<ConfirmRequest>,
    decision: Option<UiDecision>,
    last_status: Option<String>,
    published_address: Option<String>,
    stopped: bool,
}

#[derive(Clone, Default)]
pub struct UiBridge {
    shared: Arc<(Mutex<Shared>, Condvar)>,
}

impl UiBridge {
    pub fn new() -> Self {
        Self::default()
    }

    // Controller side.

    /// Re-arm a bridge for the next session (a host reset or an attach
    /// handoff reuses the same front-end).
    pub fn reset(&self) {
        let mut shared = self.shared.0.lock().unwrap();
        shared.stopped = false;
        shared.waiting = None;
        shared.decision = None;
    }

    pub fn display(&self, text: impl Into<String>) {
        let text = text.into();
        println!("{text}");
        self.shared.0.lock().unwrap().last_status = Some(text);
    }

    /// The `external-ip:port` publication; the front-end offers it for
    /// copy-paste.
    pub fn address_ready(&self, address: String) {
        println!("{address}\n(share this address with the other player)");
        self.shared.0.lock().unwrap().published_address = Some(address);
    }

    pub(crate) fn request_confirmation(&self, request: ConfirmRequest) {
        let (lock, condvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        shared.decision = None;
        shared.waiting = Some(request);
        condvar.notify_all();
    }

    pub(crate) fn take_decision(&self) -> Option<UiDecision> {
        self.shared.0.lock().unwrap().decision.take()
    }

    /// Unblocks any waiting UI thread at session end.
    pub(crate) fn notify_stopped(&self) {
        let (lock, condvar) = &*self.shared;
        lock.lock().unwrap().stopped = true;
        condvar.notify_all();
    }

    // UI side.

    /// Blocks until the controller asks for a confirmation. `None` once the
    /// session has ended.
    pub fn wait_for_confirmation(&self) -> Option<ConfirmRequest> {
        let (lock, condvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        loop {
            if shared.stopped {
                return None;
            }
            if let Some(request) = shared.waiting.clone() {
                return Some(request);
            }
            shared = condvar.wait(shared).unwrap();
        }
    }

    /// Store the answer and wake the reactor with one empty datagram.
    pub fn submit(&self, decision: UiDecision) {
        let wake_port = {
            let mut shared = self.shared.0.lock().unwrap();
            shared.decision = Some(decision);
            shared.waiting.take().map(|request| request.wake_port())
        };
        let Some(port) = wake_port else {
            debug!("decision submitted with no confirmation outstanding");
            return;
        };
        if let Ok(socket) = UdpSocket::bind(("127.0.0.1", 0)) {
            let _ = socket.send_to(&[], ("127.0.0.1", port));
        }
    }

    pub fn last_status(&self) -> Option<String> {
        self.shared.0.lock().unwrap().last_status.clone()
    }

    pub fn published_address(&self) -> Option<String> {
        self.shared.0.lock().unwrap().published_address.clone()
    }
}
