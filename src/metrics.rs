//! Metrics collection for MediVoice sessions
//!
//! Tracks connect latency, speech segments sent, and playback counters per
//! session, plus a short error history. Used for diagnostics; a summary is
//! logged when a session ends and exposed in the UI snapshot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 20;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub session_id: String,
    /// Unix timestamp when the session started (seconds)
    pub started_at: u64,
    /// Time from start request to socket open
    pub connect_latency_ms: Option<u64>,
    pub segments_sent: u64,
    pub bytes_sent: u64,
    /// Segments discarded because the socket was not open
    pub segments_dropped: u64,
    pub misfires: u64,
    pub clips_received: u64,
    pub decode_failures: u64,
    pub duration_ms: u64,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "connection", "gate", "backend")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

struct SessionInProgress {
    id: Uuid,
    started_at: Instant,
    connect_started: Option<Instant>,
    /// Playback queue's decode failure total when the session started
    decode_failure_baseline: u64,
    metrics: SessionMetrics,
}

/// Collects counters for the current session and keeps a short history
pub struct MetricsCollector {
    history: VecDeque<SessionMetrics>,
    /// Newest first
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
        }
    }

    /// Start tracking a new session, finishing any session still open
    pub fn start_session(&mut self, session_id: Uuid) {
        if self.current.is_some() {
            self.end_session();
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress {
            id: session_id,
            started_at: Instant::now(),
            connect_started: None,
            decode_failure_baseline: 0,
            metrics: SessionMetrics {
                session_id: session_id.to_string(),
                started_at: unix_now(),
                ..SessionMetrics::default()
            },
        });
    }

    pub fn connect_started(&mut self) {
        if let Some(ref mut session) = self.current {
            session.connect_started = Some(Instant::now());
        }
    }

    pub fn connected(&mut self) {
        if let Some(ref mut session) = self.current {
            if let Some(started) = session.connect_started.take() {
                let latency = started.elapsed();
                session.metrics.connect_latency_ms = Some(latency.as_millis() as u64);
                log::info!("Metrics: connected in {:?}", latency);
            }
        }
    }

    pub fn segment_sent(&mut self, bytes: usize) {
        if let Some(ref mut session) = self.current {
            session.metrics.segments_sent += 1;
            session.metrics.bytes_sent += bytes as u64;
        }
    }

    pub fn segment_dropped(&mut self) {
        if let Some(ref mut session) = self.current {
            session.metrics.segments_dropped += 1;
        }
    }

    pub fn misfire(&mut self) {
        if let Some(ref mut session) = self.current {
            session.metrics.misfires += 1;
        }
    }

    pub fn clip_received(&mut self) {
        if let Some(ref mut session) = self.current {
            session.metrics.clips_received += 1;
        }
    }

    /// Remember the playback queue's lifetime decode failure count, so later
    /// totals only count this session's failures
    pub fn playback_baseline(&mut self, decode_failures_total: u64) {
        if let Some(ref mut session) = self.current {
            session.decode_failure_baseline = decode_failures_total;
        }
    }

    /// Update decode failures from the playback queue's lifetime total
    pub fn playback_decode_failures(&mut self, decode_failures_total: u64) {
        if let Some(ref mut session) = self.current {
            session.metrics.decode_failures =
                decode_failures_total.saturating_sub(session.decode_failure_baseline);
        }
    }

    /// Finish the current session, logging its summary
    pub fn end_session(&mut self) {
        let Some(session) = self.current.take() else {
            return;
        };

        let mut metrics = session.metrics;
        metrics.duration_ms = session.started_at.elapsed().as_millis() as u64;
        log::info!(
            "Metrics: session {} ended after {:?} - {} segments ({} bytes) sent, {} dropped, {} misfires, {} clips ({} undecodable)",
            session.id,
            Duration::from_millis(metrics.duration_ms),
            metrics.segments_sent,
            metrics.bytes_sent,
            metrics.segments_dropped,
            metrics.misfires,
            metrics.clips_received,
            metrics.decode_failures
        );

        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }

    /// Record an error, tied to the current session if there is one
    pub fn record_error(&mut self, error_type: &str, message: &str) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            session_id: self.current.as_ref().map(|s| s.id.to_string()),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Counters of the session in progress, or the last finished one
    pub fn snapshot(&self) -> Option<SessionMetrics> {
        match &self.current {
            Some(session) => {
                let mut metrics = session.metrics.clone();
                metrics.duration_ms = session.started_at.elapsed().as_millis() as u64;
                Some(metrics)
            }
            None => self.history.front().cloned(),
        }
    }

    /// Finished sessions (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
