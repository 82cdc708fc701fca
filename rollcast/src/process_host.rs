//! Launches and terminates the game process. Attach-mode sessions never go
//! through here; they inherit a running child.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

const FRAMESTEP_DLL: &str = "framestep.dll";

pub struct ProcessHost {
    game_path: Option<PathBuf>,
    child: Option<Child>,
}

impl ProcessHost {
    pub fn new(game_path: Option<PathBuf>) -> Self {
        Self {
            game_path,
            child: None,
        }
    }

    /// Spawn the game with the IPC port on its command line. The framestep
    /// hook is only loaded when the DLL sits beside the binary and the user
    /// held F8 at start. Without a configured binary the session waits for
    /// an externally managed process on the same port.
    pub fn launch(&mut self, ipc_port: u16, load_framestep: bool) -> Result<()> {
        let Some(path) = &self.game_path else {
            warn!("no game binary configured; waiting for an external process on port {ipc_port}");
            return Ok(());
        };
        let mut command = Command::new(path);
        command.arg("--ipc-port").arg(ipc_port.to_string());
        if load_framestep {
            let dll = path
                .parent()
                .map(|dir| dir.join(FRAMESTEP_DLL))
                .filter(|dll| dll.exists());
            if let Some(dll) = dll {
                info!("loading framestep hook from {}", dll.display());
                command.arg("--framestep").arg(dll);
            }
        }
        command.kill_on_drop(true);
        let child = command
            .spawn()
            .with_context(|| format!("failed to launch game process '{}'", path.display()))?;
        info!("game process spawned, pid {:?}", child.id());
        self.child = Some(child);
        Ok(())
    }

    pub fn is_spawned(&self) -> bool {
        self.child.is_some()
    }

    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("terminating game process");
            let _ = child.start_kill();
        }
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        self.close();
    }
}
