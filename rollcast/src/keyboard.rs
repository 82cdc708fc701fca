//! Console key watcher. Escape cancels the session from any state; F8 held
//! at start opts into the framestep hook. The hook is released while the
//! interactive prompt owns the terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct KeyboardHook {
    enabled: Arc<AtomicBool>,
    f8_held: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl KeyboardHook {
    pub fn spawn(on_cancel: impl Fn() + Send + 'static) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let f8_held = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let enabled = Arc::clone(&enabled);
            let f8_held = Arc::clone(&f8_held);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    match event::poll(POLL_INTERVAL) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) => {
                            debug!("keyboard poll failed: {err}");
                            return;
                        }
                    }
                    let Ok(Event::Key(key)) = event::read() else {
                        continue;
                    };
                    match key.code {
                        KeyCode::F(8) => {
                            f8_held.store(key.kind != KeyEventKind::Release, Ordering::Release);
                        }
                        KeyCode::Esc if key.kind == KeyEventKind::Press => {
                            if enabled.load(Ordering::Acquire) {
                                debug!("escape pressed, cancelling session");
                                on_cancel();
                            }
                        }
                        _ => {}
                    }
                }
            })
        };

        Self {
            enabled,
            f8_held,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Hand the keys to the prompt for a while.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn f8_held(&self) -> bool {
        self.f8_held.load(Ordering::Acquire)
    }
}

impl Drop for KeyboardHook {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
