//! Microphone capture producing fixed-size frames for the STT stream.
//!
//! The server expects 24 kHz mono f32 frames of 1920 samples (80 ms). The
//! cpal stream lives on a dedicated thread (cpal streams are not `Send`);
//! frames cross into the async pipeline over a bounded channel that drops
//! on overflow rather than stalling capture.

use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

/// Sample rate required by the STT server.
pub const SAMPLE_RATE: u32 = 24_000;
/// Samples per frame (80 ms at 24 kHz).
pub const FRAME_SAMPLES: usize = 1920;
/// Capacity of the frame queue; overflow drops frames.
pub const QUEUE_CAPACITY: usize = 50;

/// An available audio input device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub is_default: bool,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let suffix = if self.is_default { " (default)" } else { "" };
        write!(
            f,
            "[{}] {} - {}Hz, {} ch{}",
            self.index, self.name, self.sample_rate, self.channels, suffix
        )
    }
}

/// Enumerate input devices for `--list-devices`.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    for (index, device) in host
        .input_devices()
        .context("Failed to enumerate input devices")?
        .enumerate()
    {
        let name = device.name().unwrap_or_else(|_| "(unnamed)".to_string());
        let config = device
            .default_input_config()
            .context("Failed to query device config")?;
        devices.push(DeviceInfo {
            index,
            is_default: Some(&name) == default_name.as_ref(),
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            name,
        });
    }
    Ok(devices)
}

/// Multiply by `gain` and hard-clip into [-1, 1].
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

/// Average interleaved channels down to mono.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Root-mean-square level of a frame.
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Accumulates incoming sample slices into fixed frames and pushes them
/// onto the bounded queue, dropping on overflow.
struct FrameChunker {
    buffer: Vec<f32>,
    channels: u16,
    gain: f32,
    tx: mpsc::Sender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
}

impl FrameChunker {
    fn new(channels: u16, gain: f32, tx: mpsc::Sender<Vec<f32>>, dropped: Arc<AtomicU64>) -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_SAMPLES * 2),
            channels,
            gain,
            tx,
            dropped,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        let mut mono = to_mono(samples, self.channels);
        apply_gain(&mut mono, self.gain);
        self.buffer.extend_from_slice(&mono);

        while self.buffer.len() >= FRAME_SAMPLES {
            let frame: Vec<f32> = self.buffer.drain(..FRAME_SAMPLES).collect();
            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Microphone capture bound to one input device.
pub struct AudioCapture {
    device_index: i32,
    gain: f64,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    frames_rx: Option<mpsc::Receiver<Vec<f32>>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// `device_index` of -1 selects the OS default input device.
    pub fn new(device_index: i32, gain: f64) -> Self {
        Self {
            device_index,
            gain,
            dropped: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            frames_rx: None,
            worker: None,
        }
    }

    /// Open the device and begin capturing. Device-open failure is an error
    /// here; later read errors surface only as the frame queue closing.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let device_index = self.device_index;
        let gain = self.gain as f32;
        let dropped = self.dropped.clone();
        let stop = self.stop.clone();

        let worker = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread(device_index, gain, tx, dropped, stop, ready_tx))
            .context("Failed to spawn audio capture thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.frames_rx = Some(rx);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                bail!("audio capture thread exited during startup")
            }
        }
    }

    /// Take the frame queue. The queue closes when capture stops or the
    /// stream errors.
    pub fn take_frames(&mut self) -> Result<mpsc::Receiver<Vec<f32>>> {
        self.frames_rx
            .take()
            .ok_or_else(|| anyhow!("audio capture not started or frames already taken"))
    }

    /// Frames dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop capturing and release the device.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    pub fn close(&mut self) {
        self.stop();
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    device_index: i32,
    gain: f32,
    tx: mpsc::Sender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    match build_stream(device_index, gain, tx, dropped, stop.clone()) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn build_stream(
    device_index: i32,
    gain: f32,
    tx: mpsc::Sender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = if device_index >= 0 {
        host.input_devices()
            .context("Failed to enumerate input devices")?
            .nth(device_index as usize)
            .ok_or_else(|| anyhow!("device index {device_index} out of range"))?
    } else {
        host.default_input_device()
            .context("No input device available")?
    };

    let default_config = device
        .default_input_config()
        .context("Failed to get default input config")?;
    let channels = default_config.channels();

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut chunker = FrameChunker::new(channels, gain, tx, dropped);

    // Stream errors close the frame queue by ending the capture thread.
    let err_fn = move |err| {
        error!(error = %err, "audio stream error");
        stop.store(true, Ordering::SeqCst);
    };

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| chunker.push(data),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                chunker.push(&samples);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|&s| (f32::from(s) - 32768.0) / 32768.0)
                    .collect();
                chunker.push(&samples);
            },
            err_fn,
            None,
        ),
        format => bail!("unsupported sample format: {format:?}"),
    }
    .context("Failed to build input stream")?;

    stream.play().context("Failed to start audio stream")?;

    Ok(stream)
}

#[cfg(test)]
#[path = "audio_test.rs"]
mod tests;
