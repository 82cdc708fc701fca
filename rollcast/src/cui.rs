//! Interactive prompt, run on the main thread while the controller owns its
//! reactor thread. Each confirmation request blocks here until the user
//! answers; the answer travels back through the UI bridge.

use std::io::{self, Write};

use rollcast_lib::message::PingStats;

use crate::keyboard::KeyboardHook;
use crate::session::format_stats;
use crate::ui_bridge::{ConfirmRequest, UiBridge, UiDecision};

fn read_line() -> String {
    io::stdout().flush().unwrap_or_default();
    let mut buf = String::new();
    if io::stdin().read_line(&mut buf).is_err() {
        return String::new();
    }
    buf.trim().to_owned()
}

fn ask_yes_no(prompt: &str) -> bool {
    loop {
        print!("{prompt} (y/n): ");
        match read_line().to_lowercase().as_str() {
            "y" | "yes" => return true,
            "n" | "no" | "" => return false,
            _ => continue,
        }
    }
}

fn ask_number(prompt: &str, default: u8) -> u8 {
    print!("{prompt} [{default}]: ");
    let line = read_line();
    if line.is_empty() {
        return default;
    }
    line.parse().unwrap_or(default)
}

fn netplay_prompt(remote_name: &str, stats: &PingStats, suggested_delay: u8) -> UiDecision {
    println!();
    println!("Connected to {remote_name}");
    println!("{}", format_stats(stats));
    println!();
    if !ask_yes_no("Start the match?") {
        return UiDecision::default();
    }
    let delay = ask_number("Input delay", suggested_delay);
    let rollback = ask_number("Rollback", 4);
    let rollback_delay = ask_number("Rollback delay", 0);
    UiDecision {
        confirmed: true,
        delay,
        rollback,
        rollback_delay,
    }
}

/// Serve confirmation requests until the session ends. A host that resets
/// after a failed client comes back around for the next one.
pub fn run(ui: &UiBridge, keyboard: Option<&KeyboardHook>) {
    while let Some(request) = ui.wait_for_confirmation() {
        // The prompt owns the keys while it reads.
        if let Some(keyboard) = keyboard {
            keyboard.set_enabled(false);
        }
        let decision = match &request {
            ConfirmRequest::Netplay {
                initial,
                stats,
                suggested_delay,
                ..
            } => netplay_prompt(&initial.remote_name, stats, *suggested_delay),
            ConfirmRequest::Spectate { config, .. } => {
                println!();
                println!(
                    "Spectating {} vs {} (first to {})",
                    config.names[0], config.names[1], config.win_count
                );
                if ask_yes_no("Continue?") {
                    UiDecision {
                        confirmed: true,
                        ..UiDecision::default()
                    }
                } else {
                    UiDecision::default()
                }
            }
        };
        if let Some(keyboard) = keyboard {
            keyboard.set_enabled(true);
        }
        ui.submit(decision);
    }
}
