//! WebSocket connection to the MediVoice backend
//!
//! # Architecture
//!
//! ```text
//! Session loop ──send_binary/send_message──▶ writer task ──▶ WebSocket
//!                                                              │
//! Session loop ◀──────── Inbound (mpsc) ◀──── reader task ◀────┘
//! ```
//!
//! # Connect Strategy
//!
//! - One socket at a time; a connect issued while another is in flight joins it
//!   and receives the same outcome
//! - Hard 10s timeout on the opening handshake
//! - No background reconnect: a failed session is restarted by the user

mod client;
pub mod protocol;

pub use client::{Connection, Inbound, CONNECT_TIMEOUT};
pub use protocol::{ClientMessage, MedicalSummary, ServerMessage, Status};

use std::time::Duration;

use protocol::{CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Errors that can occur while opening the backend connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// The configured endpoint is not a valid WebSocket URL
    InvalidUrl(String),
    /// The socket did not open within the connect timeout
    Timeout(Duration),
    /// The socket closed (or the handshake failed) before it opened
    Closed { code: u16, reason: String },
}

impl ConnectError {
    /// True for closes other than a normal (1000) closure.
    /// Only these are surfaced to the user as a connection error.
    pub fn is_abnormal_close(&self) -> bool {
        matches!(self, ConnectError::Closed { code, .. } if *code != CLOSE_NORMAL)
    }

    pub(crate) fn from_ws_error(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Url(e) => ConnectError::InvalidUrl(e.to_string()),
            WsError::HttpFormat(e) => ConnectError::InvalidUrl(e.to_string()),
            WsError::Http(response) => ConnectError::Closed {
                code: CLOSE_ABNORMAL,
                reason: format!("Handshake rejected with HTTP {}", response.status()),
            },
            other => ConnectError::Closed {
                code: CLOSE_ABNORMAL,
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::InvalidUrl(e) => write!(f, "Invalid backend URL: {}", e),
            ConnectError::Timeout(d) => write!(f, "Connection timeout after {:?}", d),
            ConnectError::Closed { code, reason } => {
                write!(f, "WebSocket closed before opening ({}): {}", code, reason)
            }
        }
    }
}

impl std::error::Error for ConnectError {}
