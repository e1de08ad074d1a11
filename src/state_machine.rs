//! Session state machine for MediVoice
//!
//! This module implements the session core using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new session and a list of effects to execute.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::audio::GateError;
use crate::connection::{ConnectError, MedicalSummary, ServerMessage, Status};

/// Shown when a backend `error` message carries no text
pub const DEFAULT_ERROR_MESSAGE: &str = "An error occurred";

pub const CONNECTION_CLOSED_MESSAGE: &str = "Connection closed. Please try again.";
pub const START_FAILED_MESSAGE: &str = "Failed to start session. Please check your connection.";

pub const GATE_LOADING_MESSAGE: &str =
    "Initializing microphone... Please wait a moment and try again.";
pub const GATE_ERRORED_MESSAGE: &str = "Microphone initialization failed. Please restart MediVoice.";
pub const GATE_START_FAILED_MESSAGE: &str =
    "Microphone access failed. Please check microphone permissions and try again.";

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Process-wide message sequence; ids stay unique across sessions
static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation entry; immutable once appended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        let timestamp = Local::now();
        let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            id: format!("{}-{}", timestamp.timestamp_millis(), seq),
            role,
            content,
            timestamp,
        }
    }
}

/// Authoritative session state. All transitions go through the reducer.
#[derive(Debug, Clone)]
pub struct Session {
    /// Id of the current start attempt; connect results for other ids are stale
    pub session_id: Option<Uuid>,
    pub status: Status,
    pub active: bool,
    pub connecting: bool,
    pub user_speaking: bool,
    pub current_transcript: String,
    pub conversation: Vec<Message>,
    pub summary: Option<MedicalSummary>,
    pub error: Option<String>,
    /// Consecutive failed connects; reset on open
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

impl Session {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            session_id: None,
            status: Status::Idle,
            active: false,
            connecting: false,
            user_speaking: false,
            current_transcript: String::new(),
            conversation: Vec::new(),
            summary: None,
            error: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
        }
    }

    /// Fresh session for a new start attempt; keeps process-wide counters
    fn restarted(&self, session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            connecting: true,
            reconnect_attempts: self.reconnect_attempts,
            ..Self::new(self.max_reconnect_attempts)
        }
    }

    fn is_current(&self, id: Uuid) -> bool {
        self.session_id == Some(id)
    }

    fn push(&mut self, role: Role, content: String) {
        self.conversation.push(Message::new(role, content));
    }
}

/// Events that can trigger state transitions.
/// These are sent from the UI, the connection reader, the voice gate and the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start a session
    StartRequested,
    /// User asked to end the session and get a summary
    EndRequested,
    /// Application exit requested
    Exit,

    // Connection events
    ConnectOk {
        id: Uuid,
    },
    ConnectFailed {
        id: Uuid,
        err: ConnectError,
    },
    /// An open socket closed
    SocketClosed {
        code: u16,
        reason: String,
    },
    /// Parsed inbound message
    Server(ServerMessage),

    // Voice gate events
    GateFailed {
        id: Uuid,
        err: GateError,
    },
    SpeechStarted,
    SpeechEnded {
        samples: Vec<f32>,
    },
    Misfire,
}

impl Event {
    /// Short name for logging; avoids dumping sample buffers
    pub fn kind(&self) -> &'static str {
        match self {
            Event::StartRequested => "StartRequested",
            Event::EndRequested => "EndRequested",
            Event::Exit => "Exit",
            Event::ConnectOk { .. } => "ConnectOk",
            Event::ConnectFailed { .. } => "ConnectFailed",
            Event::SocketClosed { .. } => "SocketClosed",
            Event::Server(message) => message.kind(),
            Event::GateFailed { .. } => "GateFailed",
            Event::SpeechStarted => "SpeechStarted",
            Event::SpeechEnded { .. } => "SpeechEnded",
            Event::Misfire => "Misfire",
        }
    }
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect { id: Uuid },
    /// Force any partially opened socket closed
    CloseSocket,
    StartGate { id: Uuid },
    PauseGate,
    /// Encode and send one speech segment
    SendAudio { samples: Vec<f32> },
    SendEndSession,
    PlayAudio { data: String },
    /// Barge-in: stop the assistant's audio
    StopPlayback,
    RecordMisfire,
    RecordError { kind: &'static str, message: String },
    /// Signal to publish a fresh UI snapshot
    EmitUi,
}

fn gate_advisory(err: &GateError) -> &'static str {
    match err {
        GateError::NotReady => GATE_LOADING_MESSAGE,
        GateError::Failed(_) => GATE_ERRORED_MESSAGE,
        GateError::StartFailed(_) => GATE_START_FAILED_MESSAGE,
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.is_empty())
}

/// Reducer function: (session, event) -> (next_session, effects)
///
/// Key rules:
/// - Never mutate the input session
/// - Ignore connect and gate results carrying a stale session id
/// - Once a summary is present, transcript/response/summary messages are no-ops
pub fn reduce(session: &Session, event: Event) -> (Session, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let mut next = session.clone();

    match event {
        // -----------------
        // User commands
        // -----------------
        StartRequested => {
            if session.active || session.connecting {
                log::debug!("Session: start ignored, session already running");
                return (next, vec![]);
            }

            if session.reconnect_attempts >= session.max_reconnect_attempts {
                log::warn!(
                    "Session: {} consecutive connect failures (max {}), trying again",
                    session.reconnect_attempts,
                    session.max_reconnect_attempts
                );
            }

            let id = Uuid::new_v4();
            (session.restarted(id), vec![Connect { id }, EmitUi])
        }

        EndRequested => {
            if session.connecting {
                // The pending connect is left to finish; its result is ignored.
                next.connecting = false;
                next.current_transcript.clear();
                return (next, vec![EmitUi]);
            }
            if !session.active {
                return (next, vec![]);
            }

            next.active = false;
            next.user_speaking = false;
            next.current_transcript.clear();
            (next, vec![SendEndSession, PauseGate, EmitUi])
        }

        Exit => (next, vec![]),

        // -----------------
        // Connection results
        // -----------------
        ConnectOk { id } if session.is_current(id) && session.connecting => {
            next.connecting = false;
            next.active = true;
            next.status = Status::Listening;
            next.error = None;
            next.reconnect_attempts = 0;
            (next, vec![StartGate { id }, EmitUi])
        }

        ConnectFailed { id, err } if session.is_current(id) && session.connecting => {
            log::warn!("Session: connect failed: {}", err);
            next.connecting = false;
            next.active = false;
            next.status = Status::Error;
            next.error = Some(
                if err.is_abnormal_close() {
                    CONNECTION_CLOSED_MESSAGE
                } else {
                    START_FAILED_MESSAGE
                }
                .to_string(),
            );
            next.reconnect_attempts = session.reconnect_attempts.saturating_add(1);
            (
                next,
                vec![
                    CloseSocket,
                    RecordError {
                        kind: "connection",
                        message: err.to_string(),
                    },
                    EmitUi,
                ],
            )
        }

        ConnectOk { id } | ConnectFailed { id, .. } => {
            log::debug!("Session: ignoring stale connect result for {}", id);
            (next, vec![])
        }

        SocketClosed { code, reason } => {
            log::info!("Session: socket closed ({}): {}", code, reason);
            (next, vec![EmitUi])
        }

        // -----------------
        // Voice gate
        // -----------------
        GateFailed { id, err } if session.is_current(id) && session.active => {
            log::warn!("Session: {}", err);
            next.error = Some(gate_advisory(&err).to_string());
            (
                next,
                vec![
                    RecordError {
                        kind: "gate",
                        message: err.to_string(),
                    },
                    EmitUi,
                ],
            )
        }
        GateFailed { .. } => (next, vec![]),

        SpeechStarted => {
            next.user_speaking = true;
            (next, vec![StopPlayback, EmitUi])
        }

        SpeechEnded { samples } => {
            next.user_speaking = false;
            if !session.active {
                log::debug!("Session: dropping speech segment, session not active");
                return (next, vec![EmitUi]);
            }
            (next, vec![SendAudio { samples }, EmitUi])
        }

        Misfire => {
            next.user_speaking = false;
            (next, vec![RecordMisfire, EmitUi])
        }

        // -----------------
        // Inbound messages
        // -----------------
        Server(message) => reduce_server_message(next, message),
    }
}

fn reduce_server_message(mut next: Session, message: ServerMessage) -> (Session, Vec<Effect>) {
    use Effect::*;

    let summarized = next.summary.is_some();
    let kind = message.kind();

    match message {
        ServerMessage::Transcript { .. }
        | ServerMessage::Response { .. }
        | ServerMessage::Summary { .. }
            if summarized =>
        {
            log::debug!("Session: {} ignored after summary", kind);
            (next, vec![])
        }

        ServerMessage::Transcript { text, is_final } => {
            let Some(text) = non_empty(text) else {
                return (next, vec![]);
            };
            if is_final {
                next.push(Role::User, text);
                next.current_transcript.clear();
            } else {
                next.current_transcript = text;
            }
            (next, vec![EmitUi])
        }

        ServerMessage::Response { text } => {
            let Some(text) = non_empty(text) else {
                return (next, vec![]);
            };
            next.push(Role::Assistant, text);
            (next, vec![EmitUi])
        }

        ServerMessage::Audio { data, .. } => match non_empty(data) {
            Some(data) => (next, vec![PlayAudio { data }]),
            None => (next, vec![]),
        },

        ServerMessage::Status { status } => {
            next.status = status;
            (next, vec![EmitUi])
        }

        ServerMessage::Summary { data } => {
            log::info!("Session: summary received");
            next.summary = Some(data);
            (next, vec![EmitUi])
        }

        ServerMessage::Error { message } => {
            let message = non_empty(message).unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
            log::warn!("Session: backend error: {}", message);
            next.status = Status::Error;
            next.error = Some(message.clone());
            (
                next,
                vec![
                    RecordError {
                        kind: "backend",
                        message,
                    },
                    EmitUi,
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(text: &str, is_final: bool) -> Event {
        Event::Server(ServerMessage::Transcript {
            text: Some(text.to_string()),
            is_final,
        })
    }

    fn response(text: &str) -> Event {
        Event::Server(ServerMessage::Response {
            text: Some(text.to_string()),
        })
    }

    fn summary() -> MedicalSummary {
        MedicalSummary {
            chief_complaint: "Headache".to_string(),
            history_of_present_illness: "Three days of frontal headache".to_string(),
            relevant_history: vec!["Migraine".to_string()],
            assessment: "Likely tension headache".to_string(),
            recommendations: vec!["Hydration".to_string()],
        }
    }

    /// Run a start request through a successful connect
    fn active_session() -> Session {
        let (connecting, effects) = reduce(&Session::default(), Event::StartRequested);
        let id = match effects[0] {
            Effect::Connect { id } => id,
            ref other => panic!("expected Connect, got {:?}", other),
        };
        let (active, _) = reduce(&connecting, Event::ConnectOk { id });
        active
    }

    fn apply(session: Session, events: Vec<Event>) -> Session {
        events
            .into_iter()
            .fold(session, |s, e| reduce(&s, e).0)
    }

    // =========================================================================
    // Start / connect
    // =========================================================================

    #[test]
    fn start_resets_session_and_connects() {
        let mut old = active_session();
        old.conversation.push(Message::new(Role::User, "old".to_string()));
        old.active = false;
        old.error = Some("stale".to_string());

        let (next, effects) = reduce(&old, Event::StartRequested);
        assert!(next.connecting);
        assert!(next.conversation.is_empty());
        assert!(next.error.is_none());
        assert_ne!(next.session_id, old.session_id);
        assert!(matches!(effects[0], Effect::Connect { id } if Some(id) == next.session_id));
        assert!(effects.contains(&Effect::EmitUi));
    }

    #[test]
    fn start_while_connecting_is_ignored() {
        let (connecting, _) = reduce(&Session::default(), Event::StartRequested);
        let (next, effects) = reduce(&connecting, Event::StartRequested);
        assert_eq!(next.session_id, connecting.session_id);
        assert!(effects.is_empty());
    }

    #[test]
    fn connect_ok_activates_and_starts_gate() {
        let session = active_session();
        assert!(session.active);
        assert!(!session.connecting);
        assert_eq!(session.status, Status::Listening);
        assert_eq!(session.reconnect_attempts, 0);
    }

    #[test]
    fn connect_failure_with_abnormal_close() {
        let (connecting, _) = reduce(&Session::default(), Event::StartRequested);
        let id = connecting.session_id.unwrap();

        let (next, effects) = reduce(
            &connecting,
            Event::ConnectFailed {
                id,
                err: ConnectError::Closed {
                    code: 1006,
                    reason: String::new(),
                },
            },
        );
        assert!(!next.active);
        assert_eq!(next.status, Status::Error);
        assert_eq!(next.error.as_deref(), Some(CONNECTION_CLOSED_MESSAGE));
        assert_eq!(next.reconnect_attempts, 1);
        assert_eq!(effects[0], Effect::CloseSocket);
    }

    #[test]
    fn connect_timeout_uses_generic_message() {
        let (connecting, _) = reduce(&Session::default(), Event::StartRequested);
        let id = connecting.session_id.unwrap();

        let (next, _) = reduce(
            &connecting,
            Event::ConnectFailed {
                id,
                err: ConnectError::Timeout(std::time::Duration::from_secs(10)),
            },
        );
        assert_eq!(next.error.as_deref(), Some(START_FAILED_MESSAGE));
    }

    #[test]
    fn reconnect_counter_survives_restart_and_resets_on_open() {
        let mut session = Session::new(2);
        for _ in 0..3 {
            let (connecting, _) = reduce(&session, Event::StartRequested);
            let id = connecting.session_id.unwrap();
            session = reduce(
                &connecting,
                Event::ConnectFailed {
                    id,
                    err: ConnectError::Timeout(std::time::Duration::from_secs(1)),
                },
            )
            .0;
        }
        assert_eq!(session.reconnect_attempts, 3);

        // Past the maximum a start still connects
        let (connecting, effects) = reduce(&session, Event::StartRequested);
        assert!(matches!(effects[0], Effect::Connect { .. }));
        assert_eq!(connecting.reconnect_attempts, 3);

        let id = connecting.session_id.unwrap();
        let (open, _) = reduce(&connecting, Event::ConnectOk { id });
        assert_eq!(open.reconnect_attempts, 0);
    }

    #[test]
    fn stale_connect_result_is_ignored() {
        let (connecting, _) = reduce(&Session::default(), Event::StartRequested);
        let (next, effects) = reduce(
            &connecting,
            Event::ConnectOk {
                id: Uuid::new_v4(),
            },
        );
        assert!(next.connecting);
        assert!(!next.active);
        assert!(effects.is_empty());
    }

    #[test]
    fn end_while_connecting_makes_connect_result_stale() {
        let (connecting, _) = reduce(&Session::default(), Event::StartRequested);
        let id = connecting.session_id.unwrap();
        let (ended, effects) = reduce(&connecting, Event::EndRequested);
        assert!(!effects.contains(&Effect::SendEndSession));

        let (next, effects) = reduce(&ended, Event::ConnectOk { id });
        assert!(!next.active);
        assert!(effects.is_empty());
    }

    // =========================================================================
    // Voice gate
    // =========================================================================

    #[test]
    fn gate_advisories_keep_session_active() {
        let session = active_session();
        let id = session.session_id.unwrap();

        let cases = [
            (GateError::NotReady, GATE_LOADING_MESSAGE),
            (GateError::Failed("no model".to_string()), GATE_ERRORED_MESSAGE),
            (
                GateError::StartFailed("denied".to_string()),
                GATE_START_FAILED_MESSAGE,
            ),
        ];
        for (err, expected) in cases {
            let (next, _) = reduce(&session, Event::GateFailed { id, err });
            assert!(next.active);
            assert_ne!(next.status, Status::Error);
            assert_eq!(next.error.as_deref(), Some(expected));
        }
    }

    #[test]
    fn speech_start_stops_playback() {
        let (next, effects) = reduce(&active_session(), Event::SpeechStarted);
        assert!(next.user_speaking);
        assert_eq!(effects[0], Effect::StopPlayback);
    }

    #[test]
    fn speech_end_sends_audio_only_while_active() {
        let samples = vec![0.1, -0.1];
        let (next, effects) = reduce(
            &active_session(),
            Event::SpeechEnded {
                samples: samples.clone(),
            },
        );
        assert!(!next.user_speaking);
        assert_eq!(effects[0], Effect::SendAudio { samples: samples.clone() });

        let (_, effects) = reduce(&Session::default(), Event::SpeechEnded { samples });
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::SendAudio { .. })));
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    #[test]
    fn interim_transcripts_only_keep_latest_text() {
        let session = apply(
            active_session(),
            vec![
                transcript("I have", false),
                transcript("I have a", false),
                transcript("I have a headache", false),
            ],
        );
        assert_eq!(session.current_transcript, "I have a headache");
        assert!(session.conversation.is_empty());
    }

    #[test]
    fn final_transcript_appends_user_message() {
        let session = apply(
            active_session(),
            vec![transcript("I have", false), transcript("I have a headache", true)],
        );
        assert_eq!(session.current_transcript, "");
        assert_eq!(session.conversation.len(), 1);
        assert_eq!(session.conversation[0].role, Role::User);
        assert_eq!(session.conversation[0].content, "I have a headache");
    }

    #[test]
    fn empty_or_missing_text_is_ignored() {
        let session = apply(
            active_session(),
            vec![
                transcript("", true),
                Event::Server(ServerMessage::Transcript {
                    text: None,
                    is_final: true,
                }),
                Event::Server(ServerMessage::Response { text: None }),
                response(""),
            ],
        );
        assert!(session.conversation.is_empty());
    }

    #[test]
    fn message_ids_are_distinct_and_ordered() {
        let session = apply(
            active_session(),
            vec![
                transcript("one", true),
                response("two"),
                transcript("three", true),
                response("four"),
            ],
        );
        let contents: Vec<_> = session
            .conversation
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["one", "two", "three", "four"]);

        let mut ids: Vec<_> = session.conversation.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn audio_is_forwarded_to_playback() {
        let (_, effects) = reduce(
            &active_session(),
            Event::Server(ServerMessage::Audio {
                data: Some("AAAA".to_string()),
                format: Some("mp3".to_string()),
            }),
        );
        assert_eq!(
            effects,
            vec![Effect::PlayAudio {
                data: "AAAA".to_string()
            }]
        );

        let (_, effects) = reduce(
            &active_session(),
            Event::Server(ServerMessage::Audio {
                data: None,
                format: None,
            }),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn status_message_overwrites_status() {
        let (next, _) = reduce(
            &active_session(),
            Event::Server(ServerMessage::Status {
                status: Status::Thinking,
            }),
        );
        assert_eq!(next.status, Status::Thinking);
    }

    #[test]
    fn error_message_sets_error_status() {
        let (next, _) = reduce(
            &active_session(),
            Event::Server(ServerMessage::Error {
                message: Some("Model overloaded".to_string()),
            }),
        );
        assert_eq!(next.status, Status::Error);
        assert_eq!(next.error.as_deref(), Some("Model overloaded"));

        let (next, _) = reduce(
            &active_session(),
            Event::Server(ServerMessage::Error { message: None }),
        );
        assert_eq!(next.status, Status::Error);
        assert_eq!(next.error.as_deref(), Some(DEFAULT_ERROR_MESSAGE));
    }

    #[test]
    fn summary_is_terminal() {
        let first = summary();
        let mut second = summary();
        second.assessment = "Something else".to_string();

        let session = apply(
            active_session(),
            vec![
                transcript("hello", true),
                Event::Server(ServerMessage::Summary { data: first.clone() }),
                transcript("late", false),
                transcript("late", true),
                response("late reply"),
                Event::Server(ServerMessage::Summary { data: second }),
            ],
        );
        assert_eq!(session.summary, Some(first));
        assert_eq!(session.conversation.len(), 1);
        assert_eq!(session.current_transcript, "");
    }

    // =========================================================================
    // End / socket close
    // =========================================================================

    #[test]
    fn end_sends_end_session_before_pausing_gate() {
        let mut session = active_session();
        session.current_transcript = "partial".to_string();

        let (next, effects) = reduce(&session, Event::EndRequested);
        assert!(!next.active);
        assert_eq!(next.current_transcript, "");
        assert_eq!(
            effects,
            vec![Effect::SendEndSession, Effect::PauseGate, Effect::EmitUi]
        );
    }

    #[test]
    fn summary_arrives_after_end() {
        let (ended, _) = reduce(&active_session(), Event::EndRequested);
        let (next, _) = reduce(&ended, Event::Server(ServerMessage::Summary { data: summary() }));
        assert!(next.summary.is_some());
    }

    #[test]
    fn socket_close_leaves_session_unchanged() {
        let session = active_session();
        let (next, _) = reduce(
            &session,
            Event::SocketClosed {
                code: 1006,
                reason: String::new(),
            },
        );
        assert!(next.active);
        assert_eq!(next.status, session.status);
        assert!(next.error.is_none());
    }
}
