//! Ordered playback of synthesized speech
//!
//! The backend sends each reply as one or more base64-encoded audio chunks.
//! Chunks are decoded and played strictly in arrival order, one at a time.
//! `stop()` interrupts the current chunk and drops the rest (barge-in).
//!
//! # Architecture
//!
//! ```text
//! PlaybackHandle ──commands──▶ queue task ──play(clip, gen)──▶ AudioOutput
//!                                  ▲                               │
//!                                  └────────── done(gen) ──────────┘
//! ```
//!
//! Each started clip gets a generation number. A completion for any
//! generation other than the current one (a clip that was stopped) is ignored,
//! so an interrupted clip can never start the next one.
//!
//! Decoding runs on the blocking pool, one payload at a time so clips keep
//! their arrival order. Results come back tagged with the stop epoch they
//! were started in; a decode that finishes after a `stop()` is discarded.

mod rodio_output;

pub use rodio_output::{RodioDecoder, RodioOutput};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Errors from decoding or playing a clip
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// The payload was not valid base64
    Base64(String),
    /// The bytes could not be decoded as audio
    Decode(String),
    /// The output device could not be opened or used
    Device(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::Base64(e) => write!(f, "Invalid base64 audio: {}", e),
            PlaybackError::Decode(e) => write!(f, "Failed to decode audio: {}", e),
            PlaybackError::Device(e) => write!(f, "Audio output unavailable: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// A decoded, playable buffer
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub channels: u16,
    pub sample_rate: u32,
    /// Interleaved samples
    pub samples: Vec<f32>,
}

impl DecodedClip {
    pub fn duration(&self) -> Duration {
        if self.channels == 0 || self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

/// Completion callback handed to [`AudioOutput::play`]
pub type ClipDone = Box<dyn Fn() + Send + 'static>;

/// Turns encoded audio bytes into a playable clip. Called off the async workers.
pub trait ClipDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedClip, PlaybackError>;
}

/// Audio output capability: play one clip at a time
///
/// Methods are called from the queue task and must not block.
pub trait AudioOutput: Send + 'static {
    /// Create the output on first use; resume it if it was suspended
    fn ensure_ready(&mut self) -> Result<(), PlaybackError>;

    /// Start `clip`. `on_done` is called when it finishes playing.
    fn play(&mut self, clip: DecodedClip, on_done: ClipDone) -> Result<(), PlaybackError>;

    /// Halt the current clip. Stopping when nothing plays is not an error.
    fn stop(&mut self);

    /// Release the output
    fn close(&mut self);
}

/// Snapshot of the playback queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub playing: bool,
    pub queued: usize,
    pub clips_received: u64,
    pub decode_failures: u64,
}

enum PlaybackCommand {
    Enqueue(String),
    Stop,
    Dispose,
    Status(oneshot::Sender<PlaybackStatus>),
}

/// Result of a background decode, tagged with the stop epoch it belongs to
struct Decoded {
    epoch: u64,
    result: Result<DecodedClip, PlaybackError>,
}

/// Handle to the playback queue task
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
    decode_failures: Arc<AtomicU64>,
}

impl PlaybackHandle {
    /// Spawn the queue task on the current Tokio runtime
    pub fn spawn<O: AudioOutput, D: ClipDecoder>(output: O, decoder: D) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();
        let decode_failures = Arc::new(AtomicU64::new(0));
        let queue = PlaybackQueue {
            output,
            decoder: Arc::new(decoder),
            pending: VecDeque::new(),
            decoding: false,
            epoch: 0,
            clips: VecDeque::new(),
            current: None,
            generation: 0,
            done_tx,
            decoded_tx,
            clips_received: 0,
            decode_failures: decode_failures.clone(),
        };
        tokio::spawn(queue.run(rx, done_rx, decoded_rx));
        Self {
            tx,
            decode_failures,
        }
    }

    /// Queue a base64-encoded audio chunk
    pub fn enqueue(&self, base64_audio: String) {
        self.send(PlaybackCommand::Enqueue(base64_audio));
    }

    /// Stop the current clip and discard everything queued
    pub fn stop(&self) {
        self.send(PlaybackCommand::Stop);
    }

    /// Stop playback and release the output; the handle is inert afterwards
    pub fn dispose(&self) {
        self.send(PlaybackCommand::Dispose);
    }

    /// Current queue state, or `None` once disposed
    pub async fn status(&self) -> Option<PlaybackStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(PlaybackCommand::Status(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    /// Clips that failed to decode since the queue was created
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    fn send(&self, cmd: PlaybackCommand) {
        if self.tx.send(cmd).is_err() {
            log::debug!("Playback: command ignored, queue disposed");
        }
    }
}

fn decode_payload<D: ClipDecoder>(decoder: &D, data: &str) -> Result<DecodedClip, PlaybackError> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| PlaybackError::Base64(e.to_string()))?;
    decoder.decode(bytes)
}

struct PlaybackQueue<O: AudioOutput, D: ClipDecoder> {
    output: O,
    decoder: Arc<D>,
    /// Payloads waiting to be decoded
    pending: VecDeque<String>,
    /// A decode for the current epoch is running
    decoding: bool,
    /// Bumped by every stop
    epoch: u64,
    clips: VecDeque<DecodedClip>,
    /// Generation of the clip currently playing
    current: Option<u64>,
    generation: u64,
    done_tx: mpsc::UnboundedSender<u64>,
    decoded_tx: mpsc::UnboundedSender<Decoded>,
    clips_received: u64,
    decode_failures: Arc<AtomicU64>,
}

impl<O: AudioOutput, D: ClipDecoder> PlaybackQueue<O, D> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PlaybackCommand>,
        mut done: mpsc::UnboundedReceiver<u64>,
        mut decoded: mpsc::UnboundedReceiver<Decoded>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(generation) = done.recv() => self.on_clip_done(generation),
                Some(result) = decoded.recv() => self.on_decoded(result),
                cmd = commands.recv() => match cmd {
                    Some(PlaybackCommand::Enqueue(data)) => self.enqueue(data),
                    Some(PlaybackCommand::Stop) => self.stop(),
                    Some(PlaybackCommand::Status(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(PlaybackCommand::Dispose) | None => break,
                },
            }
        }

        self.stop();
        self.output.close();
        log::debug!("Playback: queue disposed");
    }

    fn snapshot(&self) -> PlaybackStatus {
        PlaybackStatus {
            playing: self.current.is_some(),
            queued: self.clips.len() + self.pending.len() + usize::from(self.decoding),
            clips_received: self.clips_received,
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&mut self, data: String) {
        self.clips_received += 1;

        if let Err(e) = self.output.ensure_ready() {
            log::error!("Error playing audio: {}", e);
            return;
        }
        self.pending.push_back(data);
        self.decode_next();
    }

    /// Start decoding the oldest pending payload unless one is in flight
    fn decode_next(&mut self) {
        if self.decoding {
            return;
        }
        let Some(data) = self.pending.pop_front() else {
            return;
        };
        self.decoding = true;

        let decoder = self.decoder.clone();
        let decoded_tx = self.decoded_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || decode_payload(decoder.as_ref(), &data))
                .await
                .unwrap_or_else(|e| Err(PlaybackError::Decode(e.to_string())));
            let _ = decoded_tx.send(Decoded { epoch, result });
        });
    }

    fn on_decoded(&mut self, decoded: Decoded) {
        if decoded.epoch != self.epoch {
            log::trace!("Playback: discarding clip decoded before stop");
            return;
        }
        self.decoding = false;

        match decoded.result {
            Ok(clip) => {
                log::debug!("Playback: queued clip of {:?}", clip.duration());
                self.clips.push_back(clip);
                if self.current.is_none() {
                    self.play_next();
                }
            }
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Error playing audio: {}", e);
            }
        }
        self.decode_next();
    }

    fn play_next(&mut self) {
        while let Some(clip) = self.clips.pop_front() {
            self.generation += 1;
            let generation = self.generation;
            let done_tx = self.done_tx.clone();
            let on_done: ClipDone = Box::new(move || {
                let _ = done_tx.send(generation);
            });

            match self.output.play(clip, on_done) {
                Ok(()) => {
                    self.current = Some(generation);
                    return;
                }
                Err(e) => {
                    log::error!("Playback: failed to start clip: {}", e);
                }
            }
        }
        self.current = None;
    }

    fn on_clip_done(&mut self, generation: u64) {
        if self.current != Some(generation) {
            log::trace!("Playback: ignoring completion of stopped clip {}", generation);
            return;
        }
        self.current = None;
        self.play_next();
    }

    fn stop(&mut self) {
        let dropped = self.clips.len() + self.pending.len() + usize::from(self.decoding);
        if self.current.take().is_some() || dropped > 0 {
            log::debug!("Playback: stopped ({} queued clips dropped)", dropped);
        }
        self.output.stop();
        self.clips.clear();
        self.pending.clear();
        self.decoding = false;
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Output that records calls; clips are identified by their first sample
    #[derive(Clone, Default)]
    struct FakeOutput {
        log: Arc<Mutex<Vec<String>>>,
        pending_done: Arc<Mutex<Vec<ClipDone>>>,
    }

    impl FakeOutput {
        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        /// Finish the most recently started clip
        fn finish_current(&self) {
            if let Some(done) = self.pending_done.lock().unwrap().pop() {
                done();
            }
        }
    }

    impl AudioOutput for FakeOutput {
        fn ensure_ready(&mut self) -> Result<(), PlaybackError> {
            Ok(())
        }

        fn play(&mut self, clip: DecodedClip, on_done: ClipDone) -> Result<(), PlaybackError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("play {}", clip.samples[0]));
            self.pending_done.lock().unwrap().push(on_done);
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().push("stop".to_string());
        }

        fn close(&mut self) {
            self.log.lock().unwrap().push("close".to_string());
        }
    }

    /// 0xFF marks a corrupt clip, 0xEE a clip that takes a while to decode
    struct FakeDecoder;

    impl ClipDecoder for FakeDecoder {
        fn decode(&self, bytes: Vec<u8>) -> Result<DecodedClip, PlaybackError> {
            match bytes.first() {
                Some(0xFF) => return Err(PlaybackError::Decode("bad header".to_string())),
                Some(0xEE) => std::thread::sleep(Duration::from_millis(300)),
                _ => {}
            }
            Ok(DecodedClip {
                channels: 1,
                sample_rate: 1000,
                samples: bytes.iter().map(|&b| b as f32).collect(),
            })
        }
    }

    fn clip(id: u8) -> String {
        STANDARD.encode([id, 0, 0])
    }

    /// Poll the queue until `ready` holds
    async fn wait_for(handle: &PlaybackHandle, ready: impl Fn(&PlaybackStatus) -> bool) -> PlaybackStatus {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let status = handle.status().await.unwrap();
                if ready(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_clips_play_in_order_without_overlap() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.enqueue(clip(1));
        handle.enqueue(clip(2));
        let status = wait_for(&handle, |s| s.playing && s.queued == 1).await;
        assert_eq!(status.clips_received, 2);
        assert_eq!(output.calls(), vec!["play 1"]);

        output.finish_current();
        wait_for(&handle, |s| s.playing && s.queued == 0).await;
        assert_eq!(output.calls(), vec!["play 1", "play 2"]);

        output.finish_current();
        wait_for(&handle, |s| !s.playing).await;
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_ignores_late_completion() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.enqueue(clip(1));
        handle.enqueue(clip(2));
        wait_for(&handle, |s| s.playing && s.queued == 1).await;
        handle.stop();
        handle.status().await.unwrap();
        // The stopped clip reports completion anyway
        output.finish_current();

        let status = handle.status().await.unwrap();
        assert!(!status.playing);
        assert_eq!(status.queued, 0);
        assert_eq!(output.calls(), vec!["play 1", "stop"]);

        // A new enqueue starts playback again
        handle.enqueue(clip(3));
        wait_for(&handle, |s| s.playing).await;
        assert_eq!(output.calls(), vec!["play 1", "stop", "play 3"]);
    }

    #[tokio::test]
    async fn test_stop_is_not_delayed_by_a_slow_decode() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.enqueue(STANDARD.encode([0xEE, 0]));
        handle.enqueue(clip(2));
        handle.stop();

        // The queue answers while the decode is still running
        let status = tokio::time::timeout(Duration::from_millis(100), handle.status())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.queued, 0);
        assert_eq!(output.calls(), vec!["stop"]);

        // The slow clip finishes decoding after the stop and is discarded
        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = handle.status().await.unwrap();
        assert!(!status.playing);
        assert_eq!(status.decode_failures, 0);
        assert_eq!(output.calls(), vec!["stop"]);
    }

    #[tokio::test]
    async fn test_slow_decode_keeps_arrival_order() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.enqueue(STANDARD.encode([0xEE, 0]));
        handle.enqueue(clip(3));
        wait_for(&handle, |s| s.playing && s.queued == 1).await;
        assert_eq!(output.calls(), vec!["play 238"]);

        output.finish_current();
        wait_for(&handle, |s| s.playing && s.queued == 0).await;
        assert_eq!(output.calls(), vec!["play 238", "play 3"]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.stop();
        handle.stop();
        let status = handle.status().await.unwrap();
        assert!(!status.playing);
    }

    #[tokio::test]
    async fn test_decode_failures_do_not_stick() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.enqueue("%%% not base64 %%%".to_string());
        handle.enqueue(STANDARD.encode([0xFF, 1]));
        let status = wait_for(&handle, |s| s.decode_failures == 2).await;
        assert!(!status.playing);
        assert_eq!(status.clips_received, 2);
        assert_eq!(handle.decode_failures(), 2);

        handle.enqueue(clip(7));
        wait_for(&handle, |s| s.playing).await;
        assert_eq!(output.calls(), vec!["play 7"]);
    }

    #[tokio::test]
    async fn test_dispose_closes_output() {
        let output = FakeOutput::default();
        let handle = PlaybackHandle::spawn(output.clone(), FakeDecoder);

        handle.enqueue(clip(1));
        wait_for(&handle, |s| s.playing).await;
        handle.dispose();
        // Status fails once the task has exited
        assert!(handle.status().await.is_none());
        assert_eq!(output.calls(), vec!["play 1", "stop", "close"]);
    }

    #[test]
    fn test_clip_duration() {
        let clip = DecodedClip {
            channels: 2,
            sample_rate: 1000,
            samples: vec![0.0; 1000],
        };
        assert_eq!(clip.duration(), Duration::from_millis(500));
    }
}
