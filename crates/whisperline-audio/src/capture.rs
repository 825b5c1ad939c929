use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::device::DeviceManager;
use super::level::LevelMeter;
use super::ring_buffer::AudioProducer;
use whisperline_foundation::AudioError;

/// Set while a capture thread owns an input stream. Exactly one recording
/// may hold the microphone at a time.
static CAPTURE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// RAII claim on the single capture slot. Dropping it releases the slot,
/// including on every early-exit path of the capture thread.
struct ActiveGuard;

impl ActiveGuard {
    fn try_acquire() -> Result<Self, AudioError> {
        if CAPTURE_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AudioError::AlreadyRecording);
        }
        Ok(Self)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Native stream parameters negotiated with the selected device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub callbacks: AtomicU64,
    pub samples_captured: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub last_callback: RwLock<Option<Instant>>,
}

/// Handle to the dedicated audio thread.
pub struct CaptureThread {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureThread {
    /// Spawn the capture thread and wait for the device to start producing.
    ///
    /// Fails with `AlreadyRecording` when another capture is live, and with
    /// the underlying device error when the stream cannot be opened.
    pub fn spawn(
        audio_producer: AudioProducer,
        level: Arc<LevelMeter>,
        device_name: Option<String>,
    ) -> Result<(Self, DeviceConfig, Arc<CaptureStats>), AudioError> {
        let guard = ActiveGuard::try_acquire()?;

        let running = Arc::new(AtomicBool::new(true));
        let shutdown = running.clone();
        let stats = Arc::new(CaptureStats::default());
        let stats_out = stats.clone();

        // The thread reports its startup outcome through this slot; errors
        // from device resolution surface to the caller instead of a timeout.
        let startup: Arc<RwLock<Option<Result<DeviceConfig, AudioError>>>> =
            Arc::new(RwLock::new(None));
        let startup_slot = startup.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                // Owns the capture slot until the thread exits
                let _guard = guard;

                let mut capture =
                    AudioCapture::new(audio_producer, level, stats, running.clone());

                match capture.start(device_name.as_deref()) {
                    Ok(cfg) => {
                        *startup_slot.write() = Some(Ok(cfg));
                    }
                    Err(e) => {
                        *startup_slot.write() = Some(Err(e));
                        return;
                    }
                }

                while running.load(Ordering::SeqCst) {
                    if capture.restart_needed.load(Ordering::SeqCst) {
                        tracing::warn!(target: "audio", "Stream error; attempting restart");
                        capture.stop_stream();
                        capture.restart_needed.store(false, Ordering::SeqCst);
                        match capture.start(device_name.as_deref()) {
                            Ok(_) => {
                                tracing::info!(target: "audio", "Capture stream restarted")
                            }
                            Err(e) => {
                                tracing::error!(
                                    target: "audio",
                                    "Failed to restart capture: {}",
                                    e
                                );
                                break;
                            }
                        }
                    }
                    thread::sleep(Duration::from_millis(100));
                }

                tracing::info!(target: "audio", "Audio capture thread shutting down");
                capture.stop_stream();
            })
            .map_err(|e| AudioError::Fatal(format!("Failed to spawn audio thread: {e}")))?;

        // Wait for the thread to report how startup went
        let deadline = Instant::now() + Duration::from_secs(3);
        let cfg = loop {
            if let Some(outcome) = startup.write().take() {
                match outcome {
                    Ok(cfg) => break cfg,
                    Err(e) => {
                        let _ = handle.join();
                        return Err(e);
                    }
                }
            }
            if Instant::now() >= deadline {
                shutdown.store(false, Ordering::SeqCst);
                let _ = handle.join();
                return Err(AudioError::Fatal(
                    "Capture thread did not start within timeout".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(10));
        };

        tracing::info!(
            target: "audio",
            "Capture started: {} Hz, {} channel(s)",
            cfg.sample_rate,
            cfg.channels
        );

        Ok((Self { handle, shutdown }, cfg, stats_out))
    }

    pub fn stop(self) {
        self.shutdown.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

struct AudioCapture {
    device_manager: Option<DeviceManager>,
    stream: Option<Stream>,
    audio_producer: Arc<Mutex<AudioProducer>>,
    level: Arc<LevelMeter>,
    stats: Arc<CaptureStats>,
    running: Arc<AtomicBool>,
    restart_needed: Arc<AtomicBool>,
}

impl AudioCapture {
    fn new(
        audio_producer: AudioProducer,
        level: Arc<LevelMeter>,
        stats: Arc<CaptureStats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device_manager: None,
            stream: None,
            audio_producer: Arc::new(Mutex::new(audio_producer)),
            level,
            stats,
            running,
            restart_needed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn start(&mut self, device_name: Option<&str>) -> Result<DeviceConfig, AudioError> {
        let manager = match self.device_manager.as_mut() {
            Some(m) => m,
            None => {
                self.device_manager = Some(DeviceManager::new()?);
                self.device_manager
                    .as_mut()
                    .ok_or_else(|| AudioError::Fatal("device manager missing".into()))?
            }
        };

        let device = manager.open_device(device_name)?;
        if let Ok(n) = device.name() {
            tracing::info!(target: "audio", "Selected input device: {}", n);
        }
        let (config, sample_format) = negotiate_config(&device)?;

        let device_config = DeviceConfig {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };

        let stream = self.build_stream(device, config, sample_format)?;
        stream.play()?;
        self.stream = Some(stream);

        Ok(device_config)
    }

    fn build_stream(
        &mut self,
        device: cpal::Device,
        config: StreamConfig,
        sample_format: SampleFormat,
    ) -> Result<Stream, AudioError> {
        let audio_producer = Arc::clone(&self.audio_producer);
        let level = Arc::clone(&self.level);
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let restart_needed = Arc::clone(&self.restart_needed);

        let err_fn = move |err: cpal::StreamError| {
            tracing::error!(target: "audio", "Audio stream error: {}", err);
            restart_needed.store(true, Ordering::SeqCst);
        };

        // Common handler after converting to i16
        let handle_i16 = move |i16_data: &[i16]| {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            level.update(i16_data);

            let written = audio_producer.lock().write(i16_data);
            stats.callbacks.fetch_add(1, Ordering::Relaxed);
            stats
                .samples_captured
                .fetch_add(written as u64, Ordering::Relaxed);
            if written < i16_data.len() {
                stats
                    .samples_dropped
                    .fetch_add((i16_data.len() - written) as u64, Ordering::Relaxed);
            }
            *stats.last_callback.write() = Some(Instant::now());
        };

        // Use thread-local buffers to avoid allocations in the audio callback
        thread_local! {
            static CONVERT_BUFFER: std::cell::RefCell<Vec<i16>> =
                const { std::cell::RefCell::new(Vec::new()) };
        }

        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &_| {
                    handle_i16(data);
                },
                err_fn,
                None,
            )?,
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &_| {
                    CONVERT_BUFFER.with(|buf| {
                        let mut converted = buf.borrow_mut();
                        converted.clear();
                        converted.reserve(data.len());
                        // Clamp [-1.0, 1.0] and scale to i16
                        for &s in data {
                            let clamped = s.clamp(-1.0, 1.0);
                            converted.push((clamped * 32767.0).round() as i16);
                        }
                        handle_i16(&converted);
                    });
                },
                err_fn,
                None,
            )?,
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &_| {
                    CONVERT_BUFFER.with(|buf| {
                        let mut converted = buf.borrow_mut();
                        converted.clear();
                        converted.reserve(data.len());
                        // Convert unsigned [0,65535] to signed [-32768,32767]
                        for &s in data {
                            converted.push((s as i32 - 32768) as i16);
                        }
                        handle_i16(&converted);
                    });
                },
                err_fn,
                None,
            )?,
            other => {
                return Err(AudioError::FormatNotSupported {
                    format: format!("{other:?}"),
                });
            }
        };

        Ok(stream)
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
    }
}

fn negotiate_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
    // Prefer the device default; fall back to the first supported config
    if let Ok(default_config) = device.default_input_config() {
        return Ok((
            StreamConfig {
                channels: default_config.channels(),
                sample_rate: default_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            default_config.sample_format(),
        ));
    }

    if let Ok(configs) = device.supported_input_configs() {
        if let Some(config) = configs.into_iter().next() {
            let sample_format = config.sample_format();
            return Ok((config.with_max_sample_rate().into(), sample_format));
        }
    }

    Err(AudioError::FormatNotSupported {
        format: "No supported audio formats".to_string(),
    })
}


#[cfg(test)]
mod convert_tests {
    // unit tests for sample format conversions

    #[test]
    fn f32_to_i16_basic() {
        let src = [-1.0f32, -0.5, 0.0, 0.5, 1.0];
        let expected = [-32767i16, -16384, 0, 16384, 32767];
        let mut out = Vec::new();
        for &s in &src {
            out.push((s.clamp(-1.0, 1.0) * 32767.0).round() as i16);
        }
        assert_eq!(&out[..], &expected);
    }

    #[test]
    fn f32_out_of_range_is_clamped() {
        let src = [-2.0f32, 2.0];
        let out: Vec<i16> = src
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
            .collect();
        assert_eq!(&out[..], &[-32767, 32767]);
    }

    #[test]
    fn u16_to_i16_centering() {
        let src = [0u16, 32768, 65535];
        let expected = [-32768i16, 0, 32767];
        let out: Vec<i16> = src.iter().map(|&s| (s as i32 - 32768) as i16).collect();
        assert_eq!(&out[..], &expected);
    }
}
