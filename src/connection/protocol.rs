//! MediVoice backend protocol types
//!
//! JSON text frames tagged by `type`, plus raw binary PCM frames for speech.
//!
//! # Protocol Overview
//!
//! 1. Connect to the backend WebSocket (default `ws://localhost:8000/ws`)
//! 2. Send each finished speech segment as one binary frame (PCM16 LE, 16 kHz mono)
//! 3. Receive `transcript`, `response`, `audio`, and `status` events
//! 4. Send `end_session`; the backend answers with a `summary`

use serde::{Deserialize, Serialize};

/// Default backend endpoint
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";

/// WebSocket close code for a normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Agent status as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Error,
}

/// Structured summary produced by the backend at the end of a session
///
/// The backend forwards the model's JSON as is, so any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicalSummary {
    pub chief_complaint: String,
    pub history_of_present_illness: String,
    pub relevant_history: Vec<String>,
    pub assessment: String,
    pub recommendations: Vec<String>,
}

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

/// Text messages sent from the client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask the backend to wrap up and produce a summary
    EndSession,
}

// ============================================================================
// Server Messages (received FROM the backend)
// ============================================================================

/// Messages received from the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Speech recognition result for the current utterance
    Transcript {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        is_final: bool,
    },

    /// Assistant reply text
    Response {
        #[serde(default)]
        text: Option<String>,
    },

    /// Synthesized speech for the reply
    Audio {
        /// Base64-encoded audio (mp3 by default)
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        format: Option<String>,
    },

    /// Agent status change
    Status { status: Status },

    /// Final medical summary
    Summary { data: MedicalSummary },

    /// Backend-reported error
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ServerMessage {
    /// Parse a text frame. Unknown types and malformed payloads are errors.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The wire `type` of this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Transcript { .. } => "transcript",
            ServerMessage::Response { .. } => "response",
            ServerMessage::Audio { .. } => "audio",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Summary { .. } => "summary",
            ServerMessage::Error { .. } => "error",
        }
    }
}
