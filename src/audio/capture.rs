//! Microphone capture using CPAL
//!
//! Opens the default input device and forwards each callback buffer, mixed
//! down to mono `f32`, over a bounded channel. The stream is created paused;
//! the owner decides when to play it.

use std::sync::mpsc::SyncSender;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use super::codec::downmix_to_mono;

/// Errors that can occur while opening the microphone.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for AudioError {}

/// The default input device and its native configuration.
pub struct MicCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl MicCapture {
    /// Open the default input device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Build a paused input stream that sends mono buffers to `tx`.
    ///
    /// Buffers are dropped when the channel is full; the audio callback never blocks.
    pub fn build_stream(&self, tx: SyncSender<Vec<f32>>) -> Result<Stream, AudioError> {
        let err_fn = |err| log::error!("Audio stream error: {}", err);

        let stream = match self.sample_format {
            SampleFormat::I16 => self.build_stream_typed::<i16>(tx, err_fn),
            SampleFormat::U16 => self.build_stream_typed::<u16>(tx, err_fn),
            SampleFormat::F32 => self.build_stream_typed::<f32>(tx, err_fn),
            _ => Err(AudioError::NoSupportedConfig),
        }?;

        if let Err(e) = stream.pause() {
            log::debug!("Capture: initial pause not supported: {}", e);
        }

        Ok(stream)
    }

    fn build_stream_typed<T>(
        &self,
        tx: SyncSender<Vec<f32>>,
        err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    ) -> Result<Stream, AudioError>
    where
        T: cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        let channels = self.config.channels;

        self.device
            .build_input_stream(
                &self.config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                    if tx.try_send(downmix_to_mono(&samples, channels)).is_err() {
                        log::trace!("Capture: buffer dropped (consumer behind or gone)");
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
    }
}
