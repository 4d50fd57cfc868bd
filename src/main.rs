//! # eel
//!
//! Serves a web directory and bridges it to the host over the eel RPC
//! protocol.

mod demo;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use eel_core::{ConnectionState, Session};
use eel_telemetry::LogFormat;
use tokio::sync::watch;

use crate::settings::Settings;

/// Eel host server.
#[derive(Parser, Debug)]
#[command(name = "eel", version, about = "Serve a web app and talk to it over eel RPC")]
struct Cli {
    /// Directory of web files to serve.
    web_root: Option<PathBuf>,

    /// Settings file (defaults to ./eel.json when present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Page to open, relative to the web root.
    #[arg(long)]
    start_page: Option<String>,

    /// Default log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Keep serving after the page disconnects.
    #[arg(long)]
    keep_running: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(root) = &self.web_root {
            settings.server.web_root = Some(root.clone());
        }
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(page) = &self.start_page {
            settings.start_page.clone_from(page);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.format = LogFormat::Json;
        }
        if self.keep_running {
            settings.exit_on_disconnect = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = settings::settings_path(cli.config.as_deref());
    let mut settings = settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    let telemetry = settings.logging.telemetry_config()?;
    if let Err(e) = eel_telemetry::init_telemetry(&telemetry) {
        eprintln!("eel: logging already initialised: {e}");
    }

    let session = Arc::new(Session::new(settings.session.clone()));
    demo::expose_all(&session).context("Failed to expose built-in functions")?;

    let handle = eel_server::start(settings.server.clone(), Arc::clone(&session))
        .await
        .context("Failed to start server")?;

    let start_url = format!(
        "http://{}/{}",
        handle.addr,
        settings.start_page.trim_start_matches('/')
    );
    tracing::info!(url = %start_url, "eel ready, open the start page in a browser");
    if settings.server.web_root.is_none() {
        tracing::warn!("no web root configured, only /eel.js and /health are served");
    }

    let state = session.subscribe_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl+c")?;
            tracing::info!("Shutting down");
        }
        () = page_closed(state, settings.exit_on_disconnect) => {
            tracing::info!("Page disconnected, shutting down");
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Resolves once a connected page goes away. Never resolves when `enabled`
/// is false.
async fn page_closed(mut state: watch::Receiver<ConnectionState>, enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }
    if state.wait_for(|s| *s == ConnectionState::Connected).await.is_err() {
        return std::future::pending().await;
    }
    let _ = state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "eel",
            "web",
            "--port",
            "0",
            "--host",
            "0.0.0.0",
            "--start-page",
            "main.html",
            "--json-logs",
            "--keep-running",
        ]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);

        assert_eq!(settings.server.web_root, Some(PathBuf::from("web")));
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.start_page, "main.html");
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(!settings.exit_on_disconnect);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let cli = Cli::parse_from(["eel"]);
        let mut settings = Settings::default();
        settings.server.port = 4321;
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 4321);
        assert!(settings.exit_on_disconnect);
    }

    #[tokio::test]
    async fn page_closed_waits_for_connect_then_disconnect() {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        let waiter = tokio::spawn(page_closed(rx, true));

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let _ = tx.send_replace(ConnectionState::Connected);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let _ = tx.send_replace(ConnectionState::Disconnected);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn page_closed_disabled_never_fires() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let _ = tx.send_replace(ConnectionState::Disconnected);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            page_closed(rx, false),
        )
        .await;
        assert!(result.is_err());
    }
}
