#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cargo;
pub mod config;
pub mod console;
pub mod docker;
pub mod error;
pub mod install;
pub mod logging;
pub mod panel;
pub mod servers;
pub mod template;
pub mod webserver;
pub mod websocket;

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::config::KryptonConfig;
use crate::console::Console;
use crate::docker::Gateway;
use crate::panel::PanelClient;
use crate::servers::Servers;
use crate::websocket::auth::ValidationCache;
use crate::websocket::IpGuard;

/// Process-wide daemon state shared with the HTTP and websocket layers.
pub struct AppState {
    pub config: KryptonConfig,
    pub servers: Arc<Servers>,
    pub console: Arc<Console>,
    pub panel: Arc<PanelClient>,
    pub validation: Arc<ValidationCache>,
    pub ip_guard: IpGuard,
}

/// Krypton main entrypoint. Expects a tokio runtime to be set up.
pub async fn krypton_main(config: KryptonConfig) -> anyhow::Result<()> {
    logging::splash();

    tracing::info!("Starting Krypton");

    let console = Arc::new(Console::new());
    let panel = Arc::new(PanelClient::new(&config.remote)?);
    let gateway = Gateway::connect()?;
    let servers = Servers::new(&config, gateway, Arc::clone(&panel), Arc::clone(&console)).await?;

    let validation = Arc::new(ValidationCache::new());
    let _sweeper = validation.spawn_sweeper();

    let ip_guard = IpGuard::new(config.max_connections_per_ip);

    let state = Arc::new(AppState {
        servers,
        console,
        panel,
        validation,
        ip_guard,
        config,
    });

    let webserver_handle = tokio::spawn(webserver::serve(state));

    let mut handles = FuturesUnordered::new();
    handles.push(webserver_handle);

    loop {
        match handles.next().await {
            None => break,
            Some(_result) => {}
        }
    }

    Ok(())
}
