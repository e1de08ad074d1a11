//! Effect runner for MediVoice
//!
//! This module executes effects produced by the state machine. The runner
//! owns the backend connection, the voice gate and the playback queue.
//! Effects that only queue work (sends, playback) run inline so their order
//! matches the reducer's output; connects run as tasks and report back with
//! events.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{encode_segment, GateError, VoiceGate};
use crate::connection::protocol::CLOSE_NORMAL;
use crate::connection::{ClientMessage, Connection};
use crate::metrics::{ErrorRecord, MetricsCollector, SessionMetrics};
use crate::playback::PlaybackHandle;
use crate::state_machine::{Effect, Event};

/// Trait for running effects.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Release owned resources on exit
    fn shutdown(&self) {}

    /// Counters of the current (or last) session, for the UI snapshot
    fn metrics(&self) -> Option<SessionMetrics> {
        None
    }

    /// Finished sessions and recorded errors, newest first
    fn history(&self) -> (Vec<SessionMetrics>, Vec<ErrorRecord>) {
        (Vec::new(), Vec::new())
    }
}

enum GateCommand {
    Start { id: Uuid, tx: mpsc::Sender<Event> },
    Pause,
}

/// Runs gate commands one at a time, in order, off the async workers
async fn run_gate_commands(
    gate: Arc<Mutex<Box<dyn VoiceGate>>>,
    mut commands: mpsc::UnboundedReceiver<GateCommand>,
) {
    while let Some(cmd) = commands.recv().await {
        let gate = gate.clone();
        match cmd {
            GateCommand::Start { id, tx } => {
                let result = tokio::task::spawn_blocking(move || {
                    let mut gate = lock(&gate);
                    gate.start()
                })
                .await;
                let result = result.unwrap_or_else(|e| Err(GateError::StartFailed(e.to_string())));
                match result {
                    Ok(()) => log::info!("Voice gate started"),
                    Err(err) => {
                        log::warn!("Voice gate failed to start: {}", err);
                        let _ = tx.send(Event::GateFailed { id, err }).await;
                    }
                }
            }
            GateCommand::Pause => {
                let paused = tokio::task::spawn_blocking(move || {
                    let mut gate = lock(&gate);
                    gate.pause();
                })
                .await;
                if let Err(e) = paused {
                    log::warn!("Voice gate pause failed: {}", e);
                }
            }
        }
    }
    log::debug!("Voice gate controller stopped");
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Real effect runner: WebSocket connection, microphone gate, speaker output.
pub struct AgentEffectRunner {
    connection: Arc<Connection>,
    gate: mpsc::UnboundedSender<GateCommand>,
    playback: PlaybackHandle,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl AgentEffectRunner {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        connection: Arc<Connection>,
        gate: Box<dyn VoiceGate>,
        playback: PlaybackHandle,
    ) -> Arc<Self> {
        let (gate_tx, gate_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_gate_commands(Arc::new(Mutex::new(gate)), gate_rx));

        Arc::new(Self {
            connection,
            gate: gate_tx,
            playback,
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
        })
    }

    fn send_gate(&self, cmd: GateCommand) {
        if self.gate.send(cmd).is_err() {
            log::warn!("Voice gate controller is gone");
        }
    }

    /// Close out the current session's metrics before another can start
    fn finish_metrics(&self) {
        let mut m = lock(&self.metrics);
        m.playback_decode_failures(self.playback.decode_failures());
        m.end_session();
    }
}

impl EffectRunner for AgentEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::Connect { id } => {
                {
                    let mut m = lock(&self.metrics);
                    m.start_session(id);
                    m.playback_baseline(self.playback.decode_failures());
                    m.connect_started();
                }
                log::info!("Connecting to {}", self.connection.url());

                let connection = self.connection.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    match connection.connect().await {
                        Ok(()) => {
                            lock(&metrics).connected();
                            let _ = tx.send(Event::ConnectOk { id }).await;
                        }
                        Err(err) => {
                            let _ = tx.send(Event::ConnectFailed { id, err }).await;
                        }
                    }
                });
            }

            Effect::CloseSocket => {
                self.connection.close(CLOSE_NORMAL, "Connect failed");
            }

            Effect::StartGate { id } => self.send_gate(GateCommand::Start { id, tx }),

            Effect::PauseGate => self.send_gate(GateCommand::Pause),

            Effect::SendAudio { samples } => {
                let bytes = encode_segment(&samples);
                let len = bytes.len();
                if self.connection.send_binary(bytes) {
                    log::debug!("Sent speech segment: {} samples, {} bytes", samples.len(), len);
                    lock(&self.metrics).segment_sent(len);
                } else {
                    log::debug!("Dropping speech segment, socket not open");
                    lock(&self.metrics).segment_dropped();
                }
            }

            Effect::SendEndSession => {
                if self.connection.send_message(&ClientMessage::EndSession) {
                    log::info!("Requested end of session");
                } else {
                    log::debug!("end_session not sent, socket not open");
                }
                self.finish_metrics();
            }

            Effect::PlayAudio { data } => {
                lock(&self.metrics).clip_received();
                self.playback.enqueue(data);
            }

            Effect::StopPlayback => self.playback.stop(),

            Effect::RecordMisfire => {
                log::debug!("Speech misfire (too short)");
                lock(&self.metrics).misfire();
            }

            Effect::RecordError { kind, message } => {
                lock(&self.metrics).record_error(kind, &message);
            }

            Effect::EmitUi => {
                log::warn!("EmitUi reached the effect runner; it is handled by the session loop");
            }
        }
    }

    fn shutdown(&self) {
        log::info!("Effect runner shutting down");
        self.connection.shutdown();
        self.playback.dispose();
        self.send_gate(GateCommand::Pause);
        self.finish_metrics();
    }

    fn metrics(&self) -> Option<SessionMetrics> {
        let mut m = lock(&self.metrics);
        m.playback_decode_failures(self.playback.decode_failures());
        m.snapshot()
    }

    fn history(&self) -> (Vec<SessionMetrics>, Vec<ErrorRecord>) {
        let m = lock(&self.metrics);
        (m.get_history(), m.get_errors())
    }
}
