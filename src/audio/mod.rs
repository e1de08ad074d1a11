//! Audio capture and speech gating for MediVoice
//!
//! Captures the microphone with CPAL, segments speech with WebRTC VAD, and
//! converts finished segments to the PCM wire format.

pub mod capture;
pub mod codec;
pub mod gate;
pub mod vad;

pub use capture::{AudioError, MicCapture};
pub use codec::{encode_segment, float32_to_int16, int16_to_float32};
pub use gate::MicGate;
pub use vad::{GateError, GateEvent, GateStatus, VadConfig, VoiceGate};
