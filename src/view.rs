//! Terminal presentation of the session
//!
//! Pure formatting helpers plus `TerminalView`, which turns successive UI
//! snapshots into the lines that changed since the previous one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use uuid::Uuid;

use crate::connection::{MedicalSummary, Status};
use crate::metrics::{ErrorRecord, SessionMetrics};
use crate::state_machine::{Message, Role};
use crate::UiState;

pub fn status_label(status: Status) -> &'static str {
    match status {
        Status::Idle => "Ready",
        Status::Listening => "Listening...",
        Status::Thinking => "Thinking...",
        Status::Speaking => "Speaking...",
        Status::Error => "Error",
    }
}

pub fn status_hint(status: Status) -> &'static str {
    match status {
        Status::Idle => "Ready to start",
        Status::Listening => "Speak now...",
        Status::Thinking => "Processing...",
        Status::Speaking => "AI responding...",
        Status::Error => "Please try again",
    }
}

/// `[HH:MM] You: ...` / `[HH:MM] MediVoice: ...`
pub fn format_message(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "You",
        Role::Assistant => "MediVoice",
    };
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M"),
        speaker,
        message.content
    )
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain-text export of a summary
pub fn format_summary_text(summary: &MedicalSummary, generated: DateTime<Local>) -> String {
    format!(
        "MEDICAL SUMMARY\n\
         Generated: {}\n\
         \n\
         CHIEF COMPLAINT\n\
         {}\n\
         \n\
         HISTORY OF PRESENT ILLNESS\n\
         {}\n\
         \n\
         RELEVANT HISTORY\n\
         {}\n\
         \n\
         ASSESSMENT\n\
         {}\n\
         \n\
         RECOMMENDATIONS\n\
         {}\n\
         \n\
         ---\n\
         Disclaimer: This summary is AI-generated and is not a substitute for professional medical advice.\n",
        generated.format("%Y-%m-%d %H:%M:%S"),
        summary.chief_complaint,
        summary.history_of_present_illness,
        bullet_list(&summary.relevant_history),
        summary.assessment,
        bullet_list(&summary.recommendations),
    )
}

pub fn summary_file_name(date: NaiveDate) -> String {
    format!("medical-summary-{}.txt", date.format("%Y-%m-%d"))
}

/// Write the summary export into `dir`, returning the file path
pub fn write_summary(dir: &Path, summary: &MedicalSummary) -> Result<PathBuf, String> {
    let now = Local::now();
    let path = dir.join(summary_file_name(now.date_naive()));
    std::fs::write(&path, format_summary_text(summary, now))
        .map_err(|e| format!("Failed to write summary {:?}: {}", path, e))?;
    log::info!("Summary written to {:?}", path);
    Ok(path)
}

fn local_time(unix_secs: u64, format: &str) -> String {
    DateTime::<Utc>::from_timestamp(unix_secs as i64, 0)
        .map(|t| t.with_timezone(&Local).format(format).to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Report of finished sessions and recorded errors, both newest first
pub fn format_history(sessions: &[SessionMetrics], errors: &[ErrorRecord]) -> Vec<String> {
    let mut lines = Vec::new();

    if sessions.is_empty() {
        lines.push("No finished sessions".to_string());
    } else {
        lines.push("Sessions:".to_string());
    }
    for m in sessions {
        let connect = match m.connect_latency_ms {
            Some(ms) => format!("connected in {}ms", ms),
            None => "never connected".to_string(),
        };
        lines.push(format!(
            "  {} {:.1}s, {}: {} segments sent ({} bytes), {} dropped, {} misfires, {} clips ({} undecodable)",
            local_time(m.started_at, "%Y-%m-%d %H:%M"),
            m.duration_ms as f64 / 1000.0,
            connect,
            m.segments_sent,
            m.bytes_sent,
            m.segments_dropped,
            m.misfires,
            m.clips_received,
            m.decode_failures
        ));
    }

    if !errors.is_empty() {
        lines.push("Errors:".to_string());
    }
    for e in errors {
        lines.push(format!(
            "  [{}] {}: {}",
            local_time(e.timestamp, "%H:%M:%S"),
            e.error_type,
            e.message
        ));
    }

    lines
}

/// Tracks what has been printed and emits only what changed
#[derive(Debug, Default)]
pub struct TerminalView {
    session_id: Option<Uuid>,
    printed_messages: usize,
    last_status: Option<(Status, bool, bool)>,
    user_speaking: bool,
    last_transcript: String,
    last_error: Option<String>,
    summary_shown: bool,
}

impl TerminalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, ui: &UiState) -> Vec<String> {
        let mut lines = Vec::new();

        // Snapshots can be skipped, so a restart is only visible as a new id
        if ui.session_id != self.session_id {
            self.session_id = ui.session_id;
            self.printed_messages = 0;
            self.summary_shown = false;
            self.last_transcript.clear();
        }

        let status_key = (ui.status, ui.active, ui.connecting);
        if self.last_status != Some(status_key) {
            self.last_status = Some(status_key);
            lines.push(if ui.connecting {
                "* Connecting...".to_string()
            } else if ui.active {
                format!("* {} ({})", status_label(ui.status), status_hint(ui.status))
            } else {
                format!("* {} (session inactive)", status_label(ui.status))
            });
        }

        if ui.user_speaking != self.user_speaking {
            self.user_speaking = ui.user_speaking;
            if ui.user_speaking {
                lines.push("  (you are speaking)".to_string());
            }
        }

        for message in ui.conversation.iter().skip(self.printed_messages) {
            lines.push(format_message(message));
        }
        self.printed_messages = ui.conversation.len();

        if ui.current_transcript != self.last_transcript {
            if !ui.current_transcript.is_empty() {
                lines.push(format!("  ... {}", ui.current_transcript));
            }
            self.last_transcript = ui.current_transcript.clone();
        }

        if ui.error != self.last_error {
            if let Some(error) = &ui.error {
                lines.push(format!("! {}", error));
            }
            self.last_error = ui.error.clone();
        }

        if let (Some(summary), false) = (&ui.summary, self.summary_shown) {
            self.summary_shown = true;
            lines.push(String::new());
            lines.extend(format_summary_text(summary, Local::now()).lines().map(String::from));
            lines.push("Press 'c' to copy or 'w' to save this summary, 's' to start a new session.".to_string());
        }

        lines
    }
}
