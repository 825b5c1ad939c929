pub mod capture;
pub mod chunker;
pub mod device;
pub mod level;
pub mod resampler;
pub mod ring_buffer;

// Public API
pub use capture::{CaptureStats, CaptureThread, DeviceConfig};
pub use chunker::{AudioChunker, ChunkerConfig, FRAME_SIZE_SAMPLES, TARGET_SAMPLE_RATE};
pub use device::{DeviceInfo, DeviceManager};
pub use level::LevelMeter;
pub use ring_buffer::AudioRingBuffer;

use std::sync::Arc;

/// One fixed chunk of pipeline audio: 16 kHz, mono, S16LE.
///
/// Frames are shared across the broadcast fan-out, so the payload is
/// reference-counted and immutable after production.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub timestamp_ms: u64,
}
