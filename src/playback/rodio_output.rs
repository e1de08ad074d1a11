//! Speaker output backed by rodio
//!
//! rodio's `OutputStream` is not `Send`, so it lives on a dedicated thread
//! that is created lazily on first use. Each clip gets its own `Sink`; a
//! trailing `EmptyCallback` source reports natural completion.
//!
//! Opening the device happens on that thread, so `ensure_ready` never blocks
//! the queue task. If the device cannot be opened the thread keeps draining
//! commands and completes every clip at once, and the next `ensure_ready`
//! tries again.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};

use super::{AudioOutput, ClipDecoder, ClipDone, DecodedClip, PlaybackError};

enum DeviceCommand {
    Play(DecodedClip, ClipDone),
    Stop,
    Close,
}

struct Device {
    tx: mpsc::Sender<DeviceCommand>,
    failed: Arc<AtomicBool>,
}

/// Default output device, opened on first `ensure_ready`
#[derive(Default)]
pub struct RodioOutput {
    device: Option<Device>,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_device() -> Result<Device, PlaybackError> {
        let (tx, rx) = mpsc::channel::<DeviceCommand>();
        let failed = Arc::new(AtomicBool::new(false));
        let thread_failed = failed.clone();

        thread::Builder::new()
            .name("medivoice-output".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((_stream, handle)) => {
                    log::info!("Playback: output device opened");
                    run_device(&handle, rx);
                    log::info!("Playback: output device closed");
                }
                Err(e) => {
                    log::error!("Audio output unavailable: {}", e);
                    thread_failed.store(true, Ordering::SeqCst);
                    drain_failed(rx);
                }
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        Ok(Device { tx, failed })
    }
}

fn run_device(handle: &OutputStreamHandle, rx: mpsc::Receiver<DeviceCommand>) {
    let mut current: Option<Sink> = None;
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DeviceCommand::Play(clip, on_done) => {
                if let Some(sink) = current.take() {
                    sink.stop();
                }
                let sink = match Sink::try_new(handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        log::error!("Playback: failed to create sink: {}", e);
                        on_done();
                        continue;
                    }
                };
                sink.append(SamplesBuffer::new(
                    clip.channels,
                    clip.sample_rate,
                    clip.samples,
                ));
                sink.append(EmptyCallback::<f32>::new(on_done));
                current = Some(sink);
            }
            DeviceCommand::Stop => {
                if let Some(sink) = current.take() {
                    sink.stop();
                }
            }
            DeviceCommand::Close => break,
        }
    }
}

/// Without a device every clip finishes immediately so the queue keeps moving
fn drain_failed(rx: mpsc::Receiver<DeviceCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DeviceCommand::Play(_, on_done) => on_done(),
            DeviceCommand::Stop => {}
            DeviceCommand::Close => break,
        }
    }
}

impl AudioOutput for RodioOutput {
    fn ensure_ready(&mut self) -> Result<(), PlaybackError> {
        let usable = self
            .device
            .as_ref()
            .is_some_and(|device| !device.failed.load(Ordering::SeqCst));
        if !usable {
            self.close();
            self.device = Some(Self::spawn_device()?);
        }
        Ok(())
    }

    fn play(&mut self, clip: DecodedClip, on_done: ClipDone) -> Result<(), PlaybackError> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| PlaybackError::Device("output not initialized".to_string()))?;

        if device.tx.send(DeviceCommand::Play(clip, on_done)).is_err() {
            // Thread died; reopen on the next ensure_ready
            self.device = None;
            return Err(PlaybackError::Device("output thread exited".to_string()));
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(device) = &self.device {
            let _ = device.tx.send(DeviceCommand::Stop);
        }
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            let _ = device.tx.send(DeviceCommand::Close);
        }
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decodes mp3 and wav payloads with rodio's built-in decoders
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioDecoder;

impl ClipDecoder for RodioDecoder {
    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedClip, PlaybackError> {
        let decoder =
            Decoder::new(Cursor::new(bytes)).map_err(|e| PlaybackError::Decode(e.to_string()))?;
        let channels = decoder.channels();
        let sample_rate = decoder.sample_rate();
        let samples: Vec<f32> = decoder.convert_samples().collect();

        if samples.is_empty() {
            return Err(PlaybackError::Decode("no audio frames".to_string()));
        }

        Ok(DecodedClip {
            channels,
            sample_rate,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav_clip() {
        let bytes = wav_bytes(&[0, 16384, -16384, 0], 24000);

        let clip = RodioDecoder.decode(bytes).unwrap();
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.sample_rate, 24000);
        assert_eq!(clip.samples.len(), 4);
        assert!((clip.samples[1] - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = RodioDecoder.decode(b"definitely not audio".to_vec());
        assert!(matches!(result, Err(PlaybackError::Decode(_))));
    }

    #[test]
    fn test_play_before_ready_fails() {
        let mut output = RodioOutput::new();
        let clip = DecodedClip {
            channels: 1,
            sample_rate: 16000,
            samples: vec![0.0; 16],
        };
        let result = output.play(clip, Box::new(|| {}));
        assert!(matches!(result, Err(PlaybackError::Device(_))));
        // Stop and close without a device are no-ops
        output.stop();
        output.close();
    }

    #[test]
    fn test_failed_device_completes_clips() {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || drain_failed(rx));

        let clip = DecodedClip {
            channels: 1,
            sample_rate: 16000,
            samples: vec![0.0; 16],
        };
        tx.send(DeviceCommand::Play(
            clip,
            Box::new(move || {
                let _ = done_tx.send(());
            }),
        ))
        .unwrap();
        done_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();

        tx.send(DeviceCommand::Close).unwrap();
        handle.join().unwrap();
    }
}
