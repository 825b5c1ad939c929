use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use whisperline_foundation::AudioError;

/// Streaming resampler for mono i16 audio using Rubato's sinc interpolation.
///
/// - Maintains internal buffers to handle arbitrary-sized input chunks
/// - Buffers input to satisfy Rubato's fixed chunk requirement
/// - Tuned for speech: medium filter length, cutoff just below Nyquist
pub struct StreamResampler {
    in_rate: u32,
    out_rate: u32,
    resampler: SincFixedIn<f32>,
    input_buffer: Vec<f32>,
    output_buffer: Vec<f32>,
    chunk_size: usize,
}

impl StreamResampler {
    /// Create a new mono resampler from in_rate -> out_rate.
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, AudioError> {
        // 512 input samples keeps latency low while amortizing filter cost
        let chunk_size = 512;

        let sinc_params = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 128,
            window: WindowFunction::Blackman2,
        };

        let resampler = SincFixedIn::<f32>::new(
            out_rate as f64 / in_rate as f64,
            2.0,
            sinc_params,
            chunk_size,
            1, // mono
        )
        .map_err(|e| AudioError::Fatal(format!("Failed to create resampler: {e}")))?;

        Ok(Self {
            in_rate,
            out_rate,
            resampler,
            input_buffer: Vec::with_capacity(chunk_size * 2),
            output_buffer: Vec::new(),
            chunk_size,
        })
    }

    /// Process an arbitrary chunk of mono i16 samples.
    /// Returns a freshly allocated Vec with resampled i16 at out_rate.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.in_rate == self.out_rate {
            return input.to_vec();
        }

        for &sample in input {
            self.input_buffer.push(sample as f32 / 32768.0);
        }

        while self.input_buffer.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.input_buffer.drain(..self.chunk_size).collect();
            let input_frames = vec![chunk];

            let output_frames = match self.resampler.process(&input_frames, None) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::error!(target: "audio", "Resampler error: {}", e);
                    return Vec::new();
                }
            };

            if !output_frames.is_empty() && !output_frames[0].is_empty() {
                self.output_buffer.extend_from_slice(&output_frames[0]);
            }
        }

        let mut result = Vec::with_capacity(self.output_buffer.len());
        for &sample in &self.output_buffer {
            let clamped = sample.clamp(-1.0, 1.0);
            result.push((clamped * 32767.0).round() as i16);
        }
        self.output_buffer.clear();

        result
    }

    pub fn input_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.out_rate
    }
}
