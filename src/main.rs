//! Nearby Client - Main Entry Point
//!
//! Headless desktop client: restores the stored session, keeps location and
//! roster in sync in the background and logs user notifications.

use anyhow::Context;
use tracing::{info, warn};

use nearby_lib::{config::ClientConfig, logging, AppState, Platform};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    logging::init(&config.data_dir);
    info!("Nearby client starting...");
    info!("API: {}", config.api_url);

    let platform = Platform::desktop(&config);
    let state = AppState::new(&config, platform).context("Failed to build HTTP client")?;

    match state.sessions.current() {
        Some(session) => {
            info!("Resuming session for user: {}", session.uid);
            info!("{} cached user(s) around you", state.cache.snapshot().len());
            state.start_background_sync();
        }
        None => warn!("No stored session, log in to start background sync"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    state.scheduler.shutdown();
    Ok(())
}
