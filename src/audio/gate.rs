//! Microphone voice gate
//!
//! A dedicated thread owns the CPAL input stream and the WebRTC classifier
//! (neither is `Send` on every platform). The thread resamples capture buffers
//! to 16 kHz, runs them through the [`SpeechSegmenter`], and forwards
//! [`GateEvent`]s to the async side.
//!
//! ```text
//! Audio Thread (CPAL)        Gate Thread                    Tokio Runtime
//! ┌──────────────┐          ┌──────────────────────┐       ┌──────────────┐
//! │ callback     │─sync ch─▶│ resample → segmenter │─mpsc─▶│ session loop │
//! └──────────────┘          └──────────────────────┘       └──────────────┘
//! ```

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::StreamTrait;
use tokio::sync::mpsc;

use super::capture::MicCapture;
use super::codec::{Resampler, WIRE_SAMPLE_RATE};
use super::vad::{
    GateError, GateEvent, GateStatus, SpeechSegmenter, VadConfig, VoiceGate, WebRtcClassifier,
};

/// Capture buffers queued between the audio callback and the gate thread
const CAPTURE_QUEUE_DEPTH: usize = 64;

/// How long the gate thread waits for audio before checking for commands
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `start()` waits for the gate thread to acknowledge
const START_ACK_TIMEOUT: Duration = Duration::from_secs(2);

enum GateCommand {
    Start(std_mpsc::Sender<Result<(), GateError>>),
    Pause,
    Shutdown,
}

/// Voice gate over the default microphone
pub struct MicGate {
    status: Arc<Mutex<GateStatus>>,
    control: std_mpsc::Sender<GateCommand>,
    worker: Option<JoinHandle<()>>,
}

impl MicGate {
    /// Spawn the gate thread. The gate reports `Loading` until the device is open.
    pub fn spawn(config: VadConfig, events: mpsc::UnboundedSender<GateEvent>) -> Self {
        let status = Arc::new(Mutex::new(GateStatus::Loading));
        let (control, control_rx) = std_mpsc::channel();

        let thread_status = status.clone();
        let worker = std::thread::Builder::new()
            .name("medivoice-gate".to_string())
            .spawn(move || run_gate_thread(config, events, control_rx, thread_status));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Gate: failed to spawn thread: {}", e);
                set_status(&status, GateStatus::Errored(e.to_string()));
                None
            }
        };

        Self {
            status,
            control,
            worker,
        }
    }
}

impl VoiceGate for MicGate {
    fn status(&self) -> GateStatus {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn start(&mut self) -> Result<(), GateError> {
        match self.status() {
            GateStatus::Loading => return Err(GateError::NotReady),
            GateStatus::Errored(e) => return Err(GateError::Failed(e)),
            GateStatus::Ready => {}
        }

        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.control
            .send(GateCommand::Start(reply_tx))
            .map_err(|_| GateError::Failed("Gate thread has exited".to_string()))?;

        match reply_rx.recv_timeout(START_ACK_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(GateError::StartFailed(
                "Gate thread did not acknowledge start".to_string(),
            )),
        }
    }

    fn pause(&mut self) {
        if self.control.send(GateCommand::Pause).is_err() {
            log::debug!("Gate: pause ignored, thread has exited");
        }
    }
}

impl Drop for MicGate {
    fn drop(&mut self) {
        let _ = self.control.send(GateCommand::Shutdown);
        // The thread exits within one poll interval; it is not joined here.
        drop(self.worker.take());
    }
}

fn set_status(status: &Mutex<GateStatus>, next: GateStatus) {
    match status.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

fn run_gate_thread(
    config: VadConfig,
    events: mpsc::UnboundedSender<GateEvent>,
    control: std_mpsc::Receiver<GateCommand>,
    status: Arc<Mutex<GateStatus>>,
) {
    log::info!("Gate: initializing microphone");

    let (audio_tx, audio_rx) = std_mpsc::sync_channel::<Vec<f32>>(CAPTURE_QUEUE_DEPTH);

    let init = MicCapture::new()
        .map_err(|e| e.to_string())
        .and_then(|capture| {
            let stream = capture.build_stream(audio_tx).map_err(|e| e.to_string())?;
            let classifier = WebRtcClassifier::new(WIRE_SAMPLE_RATE, config.aggressiveness)
                .map_err(|e| e.to_string())?;
            Ok((capture.sample_rate(), stream, classifier))
        });

    let (device_rate, stream, mut classifier) = match init {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("Gate: initialization failed: {}", e);
            set_status(&status, GateStatus::Errored(e));
            return;
        }
    };

    let mut segmenter = SpeechSegmenter::new(config, WIRE_SAMPLE_RATE);
    let mut resampler = Resampler::new(device_rate, WIRE_SAMPLE_RATE);
    let mut capturing = false;
    set_status(&status, GateStatus::Ready);
    log::info!("Gate: ready ({}Hz → {}Hz)", device_rate, WIRE_SAMPLE_RATE);

    loop {
        loop {
            match control.try_recv() {
                Ok(GateCommand::Start(reply)) => {
                    let result = stream
                        .play()
                        .map_err(|e| GateError::StartFailed(e.to_string()));
                    capturing = result.is_ok();
                    if capturing {
                        log::info!("Gate: listening");
                    }
                    let _ = reply.send(result);
                }
                Ok(GateCommand::Pause) => {
                    if let Err(e) = stream.pause() {
                        log::warn!("Gate: failed to pause stream: {}", e);
                    }
                    capturing = false;
                    if segmenter.is_speaking() {
                        log::debug!("Gate: paused mid-utterance, discarding partial segment");
                    }
                    segmenter.reset();
                    resampler = Resampler::new(device_rate, WIRE_SAMPLE_RATE);
                    while audio_rx.try_recv().is_ok() {}
                    log::info!("Gate: paused");
                }
                Ok(GateCommand::Shutdown) | Err(std_mpsc::TryRecvError::Disconnected) => {
                    log::debug!("Gate: thread exiting");
                    return;
                }
                Err(std_mpsc::TryRecvError::Empty) => break,
            }
        }

        match audio_rx.recv_timeout(POLL_INTERVAL) {
            Ok(buffer) if capturing => {
                let resampled = resampler.process(&buffer);
                for event in segmenter.push_samples(&resampled, &mut classifier) {
                    if events.send(event).is_err() {
                        log::debug!("Gate: event receiver dropped, thread exiting");
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Gate: capture stream ended");
                set_status(&status, GateStatus::Errored("Capture stream ended".to_string()));
                return;
            }
        }
    }
}
