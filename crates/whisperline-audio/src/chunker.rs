use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use super::capture::DeviceConfig;
use super::resampler::StreamResampler;
use super::ring_buffer::AudioConsumer;
use crate::AudioFrame;
use whisperline_foundation::AudioError;

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// 100 ms of audio at the target rate.
pub const FRAME_SIZE_SAMPLES: usize = 1_600;

pub struct ChunkerConfig {
    pub frame_size_samples: usize,
    pub sample_rate_hz: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            frame_size_samples: FRAME_SIZE_SAMPLES,
            sample_rate_hz: TARGET_SAMPLE_RATE,
        }
    }
}

/// Turns the raw capture stream into fixed-size 16 kHz mono frames.
///
/// Multi-channel input is downmixed by averaging, off-rate input is
/// resampled, and frame timestamps are derived from the emitted sample
/// count so they stay monotonic regardless of callback jitter.
pub struct AudioChunker {
    worker: ChunkerWorker,
}

impl AudioChunker {
    pub fn new(
        consumer: AudioConsumer,
        device_config: DeviceConfig,
        output_tx: broadcast::Sender<AudioFrame>,
        cfg: ChunkerConfig,
    ) -> Result<Self, AudioError> {
        let worker = ChunkerWorker::new(consumer, device_config, output_tx, cfg)?;
        Ok(Self { worker })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let mut worker = self.worker;
        tokio::spawn(async move {
            worker.run().await;
        })
    }
}

struct ChunkerWorker {
    consumer: AudioConsumer,
    channels: u16,
    output_tx: broadcast::Sender<AudioFrame>,
    cfg: ChunkerConfig,
    buffer: VecDeque<i16>,
    read_buf: Vec<i16>,
    samples_emitted: u64,
    resampler: Option<StreamResampler>,
}

impl ChunkerWorker {
    fn new(
        consumer: AudioConsumer,
        device_config: DeviceConfig,
        output_tx: broadcast::Sender<AudioFrame>,
        cfg: ChunkerConfig,
    ) -> Result<Self, AudioError> {
        let resampler = if device_config.sample_rate != cfg.sample_rate_hz {
            tracing::info!(
                target: "audio",
                "Resampling {} Hz {} ch -> {} Hz mono",
                device_config.sample_rate,
                device_config.channels,
                cfg.sample_rate_hz
            );
            Some(StreamResampler::new(
                device_config.sample_rate,
                cfg.sample_rate_hz,
            )?)
        } else {
            None
        };

        let cap = cfg.frame_size_samples * 4;
        Ok(Self {
            consumer,
            channels: device_config.channels,
            output_tx,
            cfg,
            buffer: VecDeque::with_capacity(cap),
            read_buf: vec![0i16; 4096],
            samples_emitted: 0,
            resampler,
        })
    }

    async fn run(&mut self) {
        tracing::info!(target: "audio", "Audio chunker started");

        loop {
            if self.pump() == 0 {
                // Ring buffer drained and the capture side is gone:
                // nothing more will ever arrive.
                if self.consumer.is_abandoned() {
                    break;
                }
                // At 16 kHz a 1600-sample frame spans 100 ms; polling at 25 ms
                // checks several times per frame period without busy-waiting.
                time::sleep(Duration::from_millis(25)).await;
            }
        }

        tracing::info!(
            target: "audio",
            frames = self.samples_emitted / self.cfg.frame_size_samples as u64,
            "Audio chunker stopped"
        );
    }

    /// Drain whatever the capture thread has produced and emit every
    /// complete frame. Returns the number of raw samples consumed.
    fn pump(&mut self) -> usize {
        let n = self.consumer.read(&mut self.read_buf);
        if n == 0 {
            return 0;
        }

        let mono = self.downmix(&self.read_buf[..n]);
        let at_rate = match &mut self.resampler {
            Some(rs) => rs.process(&mono),
            None => mono,
        };
        self.buffer.extend(at_rate);
        self.flush_ready_frames();
        n
    }

    fn downmix(&self, samples: &[i16]) -> Vec<i16> {
        if self.channels <= 1 {
            return samples.to_vec();
        }
        let channels = self.channels as usize;
        samples
            .chunks_exact(channels)
            .map(|chunk| {
                let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    }

    fn flush_ready_frames(&mut self) {
        let fs = self.cfg.frame_size_samples;
        while self.buffer.len() >= fs {
            let out: Vec<i16> = self.buffer.drain(..fs).collect();

            let timestamp_ms =
                (self.samples_emitted as u128 * 1000 / self.cfg.sample_rate_hz as u128) as u64;

            let frame = AudioFrame {
                samples: out.into(),
                timestamp_ms,
            };

            // A broadcast send fails only when nobody is subscribed, which
            // just means no recording consumer is attached yet.
            match self.output_tx.send(frame) {
                Ok(receivers) => {
                    tracing::trace!(target: "audio", "Frame sent to {} receivers", receivers);
                }
                Err(_) => {
                    tracing::warn!(target: "audio", "No active listeners for audio frames");
                }
            }

            self.samples_emitted += fs as u64;
        }
    }
}
