//! Voice-activity gate
//!
//! Segments a continuous microphone stream into discrete speech intervals.
//! A [`FrameClassifier`] scores fixed-length frames; the [`SpeechSegmenter`]
//! turns those scores into [`GateEvent`]s using start/end thresholds, a
//! silence (redemption) window, pre-speech padding, and a minimum segment
//! length. Anything that owns a microphone and produces these events is a
//! [`VoiceGate`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use webrtc_vad::{SampleRate, Vad, VadMode};

use super::codec::float32_to_int16;

/// Events emitted by a voice gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// Speech began (after pre-speech padding was buffered)
    SpeechStart,
    /// Speech ended; carries the whole segment as mono `f32` samples at 16 kHz
    SpeechEnd(Vec<f32>),
    /// A segment ended but was shorter than the minimum speech duration
    Misfire,
}

/// Readiness of a voice gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateStatus {
    Loading,
    Ready,
    Errored(String),
}

/// Errors returned by [`VoiceGate::start`]
#[derive(Debug, Clone, PartialEq)]
pub enum GateError {
    /// The gate is still initializing its input device
    NotReady,
    /// Initialization failed; the gate cannot be used
    Failed(String),
    /// The device was ready but capture could not start
    StartFailed(String),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::NotReady => write!(f, "Voice gate is still initializing"),
            GateError::Failed(e) => write!(f, "Voice gate initialization failed: {}", e),
            GateError::StartFailed(e) => write!(f, "Failed to start voice gate: {}", e),
        }
    }
}

impl std::error::Error for GateError {}

/// Capability interface for a microphone voice-activity gate.
///
/// Events are delivered on the channel handed to the implementation when it
/// is constructed.
pub trait VoiceGate: Send + 'static {
    fn status(&self) -> GateStatus;
    fn start(&mut self) -> Result<(), GateError>;
    fn pause(&mut self);
}

/// WebRTC VAD aggressiveness (higher rejects more non-speech)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadAggressiveness {
    Quality,
    LowBitrate,
    Aggressive,
    VeryAggressive,
}

impl From<VadAggressiveness> for VadMode {
    fn from(value: VadAggressiveness) -> Self {
        match value {
            VadAggressiveness::Quality => VadMode::Quality,
            VadAggressiveness::LowBitrate => VadMode::LowBitrate,
            VadAggressiveness::Aggressive => VadMode::Aggressive,
            VadAggressiveness::VeryAggressive => VadMode::VeryAggressive,
        }
    }
}

/// Segmentation parameters, tuned for conversational speech with thinking pauses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Frame score at or above which speech starts
    pub positive_speech_threshold: f32,
    /// Frame score below which a frame counts toward ending the segment
    pub negative_speech_threshold: f32,
    /// Silence needed to end a segment (allows thinking pauses)
    pub redemption_ms: u32,
    /// Audio kept from before speech was detected
    pub pre_speech_pad_ms: u32,
    /// Segments with less speech than this are reported as misfires
    pub min_speech_ms: u32,
    /// Classifier frame length; WebRTC VAD accepts 10, 20 or 30
    pub frame_ms: u32,
    pub aggressiveness: VadAggressiveness,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            positive_speech_threshold: 0.6,
            negative_speech_threshold: 0.45,
            redemption_ms: 3000,
            pre_speech_pad_ms: 500,
            min_speech_ms: 300,
            frame_ms: 30,
            aggressiveness: VadAggressiveness::Aggressive,
        }
    }
}

impl VadConfig {
    /// Samples per classifier frame at `sample_rate`
    pub fn frame_len(&self, sample_rate: u32) -> usize {
        (sample_rate as usize * self.frame_ms as usize) / 1000
    }

    fn frames_for(&self, ms: u32) -> usize {
        if self.frame_ms == 0 {
            return 0;
        }
        ms.div_ceil(self.frame_ms) as usize
    }
}

/// Scores a frame of mono samples with a speech probability in [0.0, 1.0]
pub trait FrameClassifier {
    fn speech_probability(&mut self, frame: &[f32]) -> f32;
}

/// Frame classifier backed by WebRTC VAD (binary decisions: 0.0 or 1.0)
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    pub fn new(sample_rate: u32, aggressiveness: VadAggressiveness) -> Result<Self, GateError> {
        let rate = SampleRate::try_from(sample_rate as i32)
            .map_err(|_| GateError::Failed(format!("Unsupported VAD sample rate {}Hz", sample_rate)))?;
        Ok(Self {
            vad: Vad::new_with_rate_and_mode(rate, aggressiveness.into()),
        })
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn speech_probability(&mut self, frame: &[f32]) -> f32 {
        let pcm = float32_to_int16(frame);
        match self.vad.is_voice_segment(&pcm) {
            Ok(true) => 1.0,
            Ok(false) => 0.0,
            Err(()) => {
                log::trace!("VAD: rejected frame of {} samples", pcm.len());
                0.0
            }
        }
    }
}

/// Turns per-frame speech scores into speech segments
pub struct SpeechSegmenter {
    config: VadConfig,
    frame_len: usize,
    redemption_frames: usize,
    pre_pad_frames: usize,
    min_speech_frames: usize,
    /// Samples not yet forming a whole frame
    pending: Vec<f32>,
    /// Recent non-speech frames kept as padding
    pre_roll: VecDeque<Vec<f32>>,
    segment: Vec<f32>,
    speaking: bool,
    speech_frames: usize,
    redemption_count: usize,
}

impl SpeechSegmenter {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        let frame_len = config.frame_len(sample_rate).max(1);
        let redemption_frames = config.frames_for(config.redemption_ms).max(1);
        let pre_pad_frames = config.frames_for(config.pre_speech_pad_ms);
        let min_speech_frames = config.frames_for(config.min_speech_ms);

        log::debug!(
            "VAD: frame_len={}, redemption_frames={}, pre_pad_frames={}, min_speech_frames={}",
            frame_len,
            redemption_frames,
            pre_pad_frames,
            min_speech_frames
        );

        Self {
            config,
            frame_len,
            redemption_frames,
            pre_pad_frames,
            min_speech_frames,
            pending: Vec::with_capacity(frame_len),
            pre_roll: VecDeque::with_capacity(pre_pad_frames + 1),
            segment: Vec::new(),
            speaking: false,
            speech_frames: 0,
            redemption_count: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed samples; returns the events completed by them, in order
    pub fn push_samples(
        &mut self,
        samples: &[f32],
        classifier: &mut dyn FrameClassifier,
    ) -> Vec<GateEvent> {
        let mut events = Vec::new();
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.frame_len {
            let frame: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            let probability = classifier.speech_probability(&frame);
            self.process_frame(frame, probability, &mut events);
        }

        events
    }

    fn process_frame(&mut self, frame: Vec<f32>, probability: f32, events: &mut Vec<GateEvent>) {
        let is_speech = probability >= self.config.positive_speech_threshold;

        if !self.speaking {
            if is_speech {
                self.speaking = true;
                self.speech_frames = 0;
                self.redemption_count = 0;
                self.segment = self.pre_roll.drain(..).flatten().collect();
                events.push(GateEvent::SpeechStart);
            } else {
                self.pre_roll.push_back(frame);
                while self.pre_roll.len() > self.pre_pad_frames {
                    self.pre_roll.pop_front();
                }
                return;
            }
        }

        self.segment.extend_from_slice(&frame);

        if is_speech {
            self.speech_frames += 1;
            self.redemption_count = 0;
        } else if probability < self.config.negative_speech_threshold {
            self.redemption_count += 1;
            if self.redemption_count >= self.redemption_frames {
                events.push(self.finish_segment());
            }
        }
    }

    fn finish_segment(&mut self) -> GateEvent {
        self.speaking = false;
        self.redemption_count = 0;
        let audio = std::mem::take(&mut self.segment);

        if self.speech_frames >= self.min_speech_frames {
            log::debug!(
                "VAD: segment ended ({} speech frames, {} samples)",
                self.speech_frames,
                audio.len()
            );
            GateEvent::SpeechEnd(audio)
        } else {
            log::debug!(
                "VAD: misfire ({} speech frames < {})",
                self.speech_frames,
                self.min_speech_frames
            );
            GateEvent::Misfire
        }
    }

    /// Drop any partial segment and buffered padding
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pre_roll.clear();
        self.segment.clear();
        self.speaking = false;
        self.speech_frames = 0;
        self.redemption_count = 0;
    }
}
