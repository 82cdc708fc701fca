//! Best-effort public address discovery for the hosting status line. A
//! failure only degrades the message; hosting never depends on it.

use anyhow::{ensure, Result};
use tracing::debug;

const LOOKUP_URL: &str = "https://api.ipify.org";

pub async fn lookup() -> Option<String> {
    match fetch().await {
        Ok(address) => {
            debug!("external address: {address}");
            Some(address)
        }
        Err(err) => {
            debug!("external address lookup failed: {err}");
            None
        }
    }
}

async fn fetch() -> Result<String> {
    let body = reqwest::get(LOOKUP_URL)
        .await?
        .error_for_status()?
        .text()
        .await?;
    let address = body.trim();
    ensure!(
        !address.is_empty() && address.len() < 64,
        "unexpected responder body"
    );
    Ok(address.to_owned())
}
