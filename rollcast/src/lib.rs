pub mod cui;
pub mod diagnostics;
pub mod external_ip;
pub mod ipc;
pub mod keyboard;
pub mod options;
pub mod process_host;
pub mod session;
pub mod spectator;
pub mod timer;
pub mod tracing_helper;
pub mod ui_bridge;
