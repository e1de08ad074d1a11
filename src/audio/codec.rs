//! Sample format conversions for the speech pipeline
//!
//! The microphone delivers `f32` samples in [-1.0, 1.0] at the device rate.
//! The backend expects raw little-endian 16-bit PCM, mono, at 16 kHz.
//!
//! Scaling is asymmetric so that both ends of the `i16` range are reachable:
//! negative samples scale by 32768, non-negative samples by 32767.

/// Sample rate of PCM frames sent to the backend
pub const WIRE_SAMPLE_RATE: u32 = 16_000;

/// Convert `f32` samples to 16-bit signed PCM
///
/// Each sample is clamped to [-1.0, 1.0] and truncated toward zero after scaling.
/// NaN encodes as silence.
pub fn float32_to_int16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| sample_to_i16(s)).collect()
}

fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Convert 16-bit signed PCM back to `f32` samples
pub fn int16_to_float32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Pack PCM samples as little-endian bytes (the wire format of binary frames)
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Unpack little-endian PCM bytes. A trailing odd byte is ignored.
pub fn le_bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode a speech segment for sending: `f32` → PCM16 → little-endian bytes
pub fn encode_segment(samples: &[f32]) -> Vec<u8> {
    pcm_to_le_bytes(&float32_to_int16(samples))
}

/// Average interleaved frames down to a single channel
pub fn downmix_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let channels = channels as usize;
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Streaming mono resampler
///
/// Capture buffers rarely divide evenly by the rate ratio, so the resampler
/// carries its leftover input and fractional position into the next call.
/// Integer ratios (48kHz → 16kHz) average each group of samples. Other ratios
/// (44.1kHz → 16kHz) use linear interpolation.
#[derive(Debug, Clone)]
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    /// Input not yet consumed: a partial averaging group, or the last sample
    /// kept as the left interpolation point
    pending: Vec<f32>,
    /// Interpolation position into `pending`, in units of `1 / target_rate`
    position: u64,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        if target_rate == 0 || source_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing audio through",
                source_rate,
                target_rate
            );
        }
        Self {
            source_rate,
            target_rate,
            pending: Vec::new(),
            position: 0,
        }
    }

    fn passthrough(&self) -> bool {
        self.target_rate == 0 || self.source_rate == 0 || self.source_rate == self.target_rate
    }

    /// Resample the next chunk of a continuous stream
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.passthrough() {
            return samples.to_vec();
        }
        self.pending.extend_from_slice(samples);

        if self.source_rate > self.target_rate && self.source_rate % self.target_rate == 0 {
            let ratio = (self.source_rate / self.target_rate) as usize;
            let whole = self.pending.len() - self.pending.len() % ratio;
            let out = self.pending[..whole]
                .chunks(ratio)
                .map(|chunk| chunk.iter().sum::<f32>() / ratio as f32)
                .collect();
            self.pending.drain(..whole);
            return out;
        }

        let source = self.source_rate as u64;
        let target = self.target_rate as u64;
        let mut out = Vec::new();
        loop {
            let idx = (self.position / target) as usize;
            if idx + 1 >= self.pending.len() {
                break;
            }
            let frac = (self.position % target) as f32 / target as f32;
            let a = self.pending[idx];
            let b = self.pending[idx + 1];
            out.push(a + (b - a) * frac);
            self.position += source;
        }

        // Keep the last sample as the left neighbour for the next chunk
        if self.pending.len() > 1 {
            let consumed = self.pending.len() - 1;
            self.position -= consumed as u64 * target;
            self.pending.drain(..consumed);
        }
        out
    }
}
