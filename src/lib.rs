pub mod audio;
pub mod clipboard;
pub mod connection;
pub mod effects;
pub mod logging;
pub mod metrics;
pub mod playback;
pub mod settings;
pub mod state_machine;
pub mod view;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use audio::{GateEvent, MicGate};
use connection::{Connection, Inbound, MedicalSummary, Status};
use effects::{AgentEffectRunner, EffectRunner};
use metrics::SessionMetrics;
use playback::{PlaybackHandle, RodioDecoder, RodioOutput};
use state_machine::{reduce, Effect, Event, Message, Session};
use view::TerminalView;

/// Snapshot of the session published to the presentation layer.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    /// Changes whenever a new session starts
    pub session_id: Option<Uuid>,
    pub status: Status,
    pub active: bool,
    pub connecting: bool,
    pub user_speaking: bool,
    pub current_transcript: String,
    pub conversation: Vec<Message>,
    pub summary: Option<MedicalSummary>,
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    pub metrics: Option<SessionMetrics>,
}

/// Convert the internal session to a UI snapshot
fn session_to_ui(session: &Session, metrics: Option<SessionMetrics>) -> UiState {
    UiState {
        session_id: session.session_id,
        status: session.status,
        active: session.active,
        connecting: session.connecting,
        user_speaking: session.user_speaking,
        current_transcript: session.current_transcript.clone(),
        conversation: session.conversation.clone(),
        summary: session.summary.clone(),
        error: session.error.clone(),
        reconnect_attempts: session.reconnect_attempts,
        metrics,
    }
}

fn emit_ui_state(ui: &watch::Sender<UiState>, session: &Session, runner: &dyn EffectRunner) {
    let snapshot = session_to_ui(session, runner.metrics());
    // No receivers just means nothing is rendering
    let _ = ui.send(snapshot);
}

/// Run the session loop: the only writer of session state.
///
/// Returns after `Event::Exit` has been processed and the runner shut down.
/// The loop holds a sender of its own, so dropping the others does not end it.
pub async fn run_session_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui: watch::Sender<UiState>,
    max_reconnect_attempts: u32,
) {
    let mut session = Session::new(max_reconnect_attempts);

    emit_ui_state(&ui, &session, effect_runner.as_ref());
    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {}", event.kind());

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down session loop");
            effect_runner.shutdown();
            break;
        }

        let (next, effects) = reduce(&session, event);

        if (session.status, session.active, session.connecting)
            != (next.status, next.active, next.connecting)
        {
            log::info!(
                "Session transition: {:?} (active={}, connecting={}) -> {:?} (active={}, connecting={})",
                session.status,
                session.active,
                session.connecting,
                next.status,
                next.active,
                next.connecting
            );
        }

        session = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => emit_ui_state(&ui, &session, effect_runner.as_ref()),
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("Session loop ended");
}

/// Forward connection traffic into the session loop, preserving order
pub async fn forward_inbound(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    tx: mpsc::Sender<Event>,
) {
    while let Some(item) = inbound.recv().await {
        let event = match item {
            Inbound::Message(message) => Event::Server(message),
            Inbound::Closed { code, reason } => Event::SocketClosed { code, reason },
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Forward voice gate events into the session loop
pub async fn forward_gate_events(
    mut events: mpsc::UnboundedReceiver<GateEvent>,
    tx: mpsc::Sender<Event>,
) {
    while let Some(event) = events.recv().await {
        let event = match event {
            GateEvent::SpeechStart => Event::SpeechStarted,
            GateEvent::SpeechEnd(samples) => Event::SpeechEnded { samples },
            GateEvent::Misfire => Event::Misfire,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn run_terminal_view(mut ui: watch::Receiver<UiState>, cancel: CancellationToken) {
    let mut view = TerminalView::new();
    loop {
        let lines = {
            let snapshot = ui.borrow_and_update();
            view.render(&snapshot)
        };
        for line in lines {
            println!("{}", line);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = ui.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

const HELP: &str = "Commands: s = start session, e = end session, c = copy summary, \
                    w = save summary, m = session history, q = quit";

/// A line typed on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    End,
    CopySummary,
    SaveSummary,
    History,
    Quit,
    Help,
    Nothing,
}

fn parse_command(line: &str) -> Command {
    match line.trim() {
        "s" => Command::Start,
        "e" => Command::End,
        "c" => Command::CopySummary,
        "w" => Command::SaveSummary,
        "m" => Command::History,
        "q" => Command::Quit,
        "" => Command::Nothing,
        _ => Command::Help,
    }
}

/// Read line commands from stdin until quit or EOF
async fn run_commands(
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    runner: Arc<dyn EffectRunner>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        let command = match line {
            Ok(Some(line)) => parse_command(&line),
            Ok(None) => Command::Quit,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                Command::Quit
            }
        };

        let event = match command {
            Command::Start => Event::StartRequested,
            Command::End => Event::EndRequested,
            Command::Quit => Event::Exit,
            Command::CopySummary => {
                let summary = ui.borrow().summary.clone();
                match summary {
                    Some(summary) => {
                        let text = view::format_summary_text(&summary, chrono::Local::now());
                        match clipboard::copy_text(text).await {
                            Ok(()) => println!("Summary copied to clipboard"),
                            Err(e) => log::error!("{}", e),
                        }
                    }
                    None => println!("No summary yet"),
                }
                continue;
            }
            Command::SaveSummary => {
                let summary = ui.borrow().summary.clone();
                match summary {
                    Some(summary) => match std::env::current_dir()
                        .map_err(|e| e.to_string())
                        .and_then(|dir| view::write_summary(&dir, &summary))
                    {
                        Ok(path) => println!("Saved {}", path.display()),
                        Err(e) => log::error!("{}", e),
                    },
                    None => println!("No summary yet"),
                }
                continue;
            }
            Command::History => {
                let (sessions, errors) = runner.history();
                for line in view::format_history(&sessions, &errors) {
                    println!("{}", line);
                }
                continue;
            }
            Command::Help => {
                println!("{}", HELP);
                continue;
            }
            Command::Nothing => continue,
        };

        let exit = matches!(event, Event::Exit);
        if tx.send(event).await.is_err() || exit {
            return;
        }
    }
}

/// Entry point for the `medivoice` binary
pub fn run() -> Result<(), String> {
    logging::init();

    // tokio-tungstenite needs a process-wide rustls provider for wss://
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    if let Err(e) = settings::ensure_settings_file() {
        log::warn!("Settings: {}", e);
    }
    let settings = settings::load_settings().with_env_overrides();
    log::info!("Backend: {}", settings.ws_url);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start async runtime: {}", e))?;

    runtime.block_on(async move {
        let (tx, rx) = mpsc::channel::<Event>(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Connection::new(
            settings.ws_url.clone(),
            settings.connect_timeout(),
            inbound_tx,
        ));
        let gate = MicGate::spawn(settings.vad.clone(), gate_tx);
        let playback = PlaybackHandle::spawn(RodioOutput::new(), RodioDecoder);
        let effect_runner = AgentEffectRunner::new(connection, Box::new(gate), playback);

        let (ui_tx, ui_rx) = watch::channel(UiState::default());
        let cancel = CancellationToken::new();

        tokio::spawn(forward_inbound(inbound_rx, tx.clone()));
        tokio::spawn(forward_gate_events(gate_rx, tx.clone()));
        let view_task = tokio::spawn(run_terminal_view(ui_rx.clone(), cancel.clone()));
        tokio::spawn(run_commands(
            tx.clone(),
            ui_rx,
            effect_runner.clone(),
            cancel.clone(),
        ));

        log::info!("MediVoice started");
        run_session_loop(rx, tx, effect_runner, ui_tx, settings.max_reconnect_attempts).await;

        cancel.cancel();
        let _ = view_task.await;
    });

    // Stdin reads block a runtime thread; don't wait for them.
    runtime.shutdown_timeout(Duration::from_millis(500));
    log::info!("MediVoice stopped");
    Ok(())
}
