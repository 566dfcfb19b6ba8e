//! echo-relay: a readiness-multiplexed TCP relay
//!
//! Roles:
//! - `serve`: accept connections and echo their bytes back, or store them
//!   in newly created files and acknowledge once the peer half-closes
//! - `send`: stream a file or message to a relay, half-close, print the reply
//! - `check`: probe a relay endpoint and sink location
//!
//! Features:
//! - Single-threaded mio event loop or thread-per-connection blocking server
//! - Fixed-capacity transfer buffers recycled across connections
//! - Configurable handling of partial writes
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod health;
mod runtime;

use config::{Action, CheckSettings, Config, SendSettings, ServeSettings};
use runtime::{Server, ShutdownHandle};
use std::io::{self, Write};
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    run(config)
}

/// Carry out the configured action and map its outcome to an exit status.
fn run(config: Config) -> ExitCode {
    let result = match config.action {
        Action::Serve(settings) => serve(&settings),
        Action::Send(settings) => send(&settings),
        Action::Check(settings) => check(&settings),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Exiting");
            ExitCode::FAILURE
        }
    }
}

fn serve(settings: &ServeSettings) -> Result<bool, Box<dyn std::error::Error>> {
    info!(
        listen = %settings.listen,
        runtime = ?settings.runtime,
        mode = ?settings.relay.mode,
        sink_path = ?settings.relay.sink_path,
        max_connections = settings.max_connections,
        "Starting echo-relay server"
    );
    let server = Server::bind(settings)?;
    watch_signals(server.shutdown_handle())?;
    server.run()?;
    Ok(true)
}

/// Stop the server on SIGINT or SIGTERM; a second signal exits at once.
#[cfg(unix)]
fn watch_signals(handle: ShutdownHandle) -> io::Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    spawn_signal_watcher(Signals::new([SIGINT, SIGTERM])?, handle)
}

#[cfg(not(unix))]
fn watch_signals(_handle: ShutdownHandle) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_watcher(
    mut signals: signal_hook::iterator::Signals,
    handle: ShutdownHandle,
) -> io::Result<()> {
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if handle.is_shutdown() {
                    warn!(signal, "Second signal, exiting immediately");
                    std::process::exit(1);
                }
                info!(signal, "Shutting down");
                if let Err(e) = handle.shutdown() {
                    error!(error = %e, "Failed to wake server for shutdown");
                }
            }
        })?;
    Ok(())
}

fn send(settings: &SendSettings) -> Result<bool, Box<dyn std::error::Error>> {
    info!(connect = %settings.connect, "Sending to relay");
    let transfer = client::send(settings)?;
    info!(
        sent = transfer.sent,
        received = transfer.reply.len(),
        "Relay replied"
    );

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&transfer.reply)?;
    stdout.flush()?;
    Ok(true)
}

fn check(settings: &CheckSettings) -> Result<bool, Box<dyn std::error::Error>> {
    info!(connect = %settings.connect, mode = ?settings.mode, "Checking relay");
    let results = health::verify_all(health::plan(settings));
    Ok(health::report(&results))
}
