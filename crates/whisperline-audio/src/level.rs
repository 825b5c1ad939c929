use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free input level indicator, written from the capture callback.
///
/// The level is the mean absolute sample amplitude normalized to [0.0, 1.0],
/// stored as raw f32 bits so the callback never takes a lock.
#[derive(Debug, Default)]
pub struct LevelMeter {
    bits: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    pub fn update(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let sum: u64 = samples.iter().map(|&s| (s as i32).unsigned_abs() as u64).sum();
        let mean = sum as f32 / samples.len() as f32;
        let level = (mean / 32768.0).clamp(0.0, 1.0);
        self.bits.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.bits.store(0.0f32.to_bits(), Ordering::Relaxed);
    }
}
