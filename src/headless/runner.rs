//! Headless mode runner - session event loop without a UI
//!
//! Starts a [`SessionClient`], prints every [`SessionEvent`] as NDJSON and
//! accepts a few line commands on stdin.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use dlink_app::{credentials_from_env, load_settings, load_settings_from};
use dlink_core::prelude::*;
use dlink_core::SessionEvent;
use dlink_session::{HttpFormPoster, SessionClient, WsConnector};

use super::HeadlessEvent;

/// Commands read from stdin, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinCommand {
    /// `subscribe <channel>...` or `s <channel>...`
    Subscribe(Vec<String>),
    /// `state`
    State,
    /// `q` or `quit`
    Quit,
}

/// Parse one stdin line. Blank lines and unknown commands yield `None`.
pub fn parse_command(line: &str) -> Option<StdinCommand> {
    let mut words = line.split_whitespace();
    let command = words.next()?;
    match command {
        "subscribe" | "s" => {
            let channels: Vec<String> = words.map(str::to_string).collect();
            if channels.is_empty() {
                warn!("Stdin: subscribe needs at least one channel");
                None
            } else {
                Some(StdinCommand::Subscribe(channels))
            }
        }
        "state" => Some(StdinCommand::State),
        "q" | "quit" => Some(StdinCommand::Quit),
        _ => {
            warn!("Unknown stdin command: {}", line.trim());
            None
        }
    }
}

/// One turn of the event loop.
enum Step {
    Event(Option<SessionEvent>),
    Command(Option<StdinCommand>),
    Interrupted,
}

/// Run the session headless until quit, Ctrl+C or a terminal failure.
///
/// Settings come from `config_path` if given (errors are fatal), otherwise
/// from `.dlink/config.toml` in the working directory (errors fall back to
/// defaults). `extra_channels` are subscribed on top of the configured ones.
pub async fn run_headless(config_path: Option<&Path>, extra_channels: Vec<String>) -> Result<()> {
    let settings = match config_path {
        Some(path) => load_settings_from(path)?,
        None => {
            let cwd = std::env::current_dir()?;
            load_settings(&cwd)
        }
    };
    let config = settings.into_session_config(credentials_from_env(), extra_channels)?;

    info!("═══════════════════════════════════════════════════════");
    info!("deribit-link starting in HEADLESS mode");
    info!("Endpoint: {}", config.url);
    info!("Channels: {:?}", config.channels);
    info!("═══════════════════════════════════════════════════════");

    HeadlessEvent::started(&config.url, &config.channels).emit();
    let mut client = SessionClient::start(config, WsConnector, HttpFormPoster::default());

    let (stdin_tx, stdin_rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        spawn_stdin_reader_blocking(stdin_tx);
    });

    let last_close = headless_event_loop(&mut client, stdin_rx).await;
    let final_state = client.state();

    client.shutdown().await?;
    info!("deribit-link headless mode exiting ({})", final_state);

    if !final_state.is_terminal() {
        return Ok(());
    }
    let reason = last_close.unwrap_or_else(|| "session failed".to_string());
    let err = Error::closed(reason);
    HeadlessEvent::error(err.to_string(), err.is_fatal()).emit();
    Err(err)
}

/// Main headless event loop. Returns the last close reason seen.
async fn headless_event_loop(
    client: &mut SessionClient,
    mut stdin_rx: mpsc::Receiver<StdinCommand>,
) -> Option<String> {
    let mut last_close = None;
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let step = tokio::select! {
            event = client.event_receiver().recv() => Step::Event(event),
            command = stdin_rx.recv(), if stdin_open => Step::Command(command),
            _ = &mut ctrl_c => Step::Interrupted,
        };

        match step {
            Step::Event(Some(event)) => {
                if let SessionEvent::Closed { reason } = &event {
                    last_close = Some(reason.clone());
                }
                HeadlessEvent::from(event).emit();
            }
            Step::Event(None) => {
                info!("Session task ended");
                break;
            }
            Step::Command(Some(StdinCommand::Subscribe(channels))) => {
                info!("Stdin: subscribe {:?}", channels);
                if let Err(e) = client.subscribe(channels).await {
                    HeadlessEvent::error(e.to_string(), e.is_fatal()).emit();
                }
            }
            Step::Command(Some(StdinCommand::State)) => {
                HeadlessEvent::state(client.state()).emit();
            }
            Step::Command(Some(StdinCommand::Quit)) => {
                info!("Quit requested");
                break;
            }
            Step::Command(None) => {
                // Stdin closed (e.g. `< /dev/null`); keep streaming.
                stdin_open = false;
            }
            Step::Interrupted => {
                info!("Interrupted");
                break;
            }
        }
    }

    last_close
}

/// Read stdin lines and forward parsed commands (blocking, own thread)
fn spawn_stdin_reader_blocking(cmd_tx: mpsc::Sender<StdinCommand>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    let reader = stdin.lock();

    for line in reader.lines() {
        match line {
            Ok(line) => {
                let Some(command) = parse_command(&line) else {
                    continue;
                };
                let quit = command == StdinCommand::Quit;
                if cmd_tx.blocking_send(command).is_err() || quit {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    info!("Stdin reader exiting");
}
