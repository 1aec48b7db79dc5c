//! CPAL input devices as capture drivers.
//!
//! [`CpalCapture`] opens an input stream on its own thread and feeds every
//! hardware block, converted to 16-bit little-endian PCM, through the
//! capturer's [`CaptureCallback`].
//!
//! # Example
//!
//! ```no_run
//! use dspflow::device::CpalCapture;
//!
//! for device in CpalCapture::list_inputs() {
//!     println!("{}: {} Hz, {} ch", device.name(), device.sample_rate(), device.channels());
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig};
use tracing::{debug, error, info};

use crate::adapter::param;
use crate::capture::{CaptureCallback, CaptureDriver};
use crate::error::{Error, Result};

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// A discovered audio input device.
pub struct CpalCapture {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
    worker: Option<Worker>,
}

impl CpalCapture {
    /// The system's default input device, if there is one.
    pub fn default_input() -> Option<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device()?;
        Self::open(device)
    }

    /// Every input device that reports a default configuration.
    pub fn list_inputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|devices| devices.filter_map(Self::open).collect())
            .unwrap_or_default()
    }

    fn open(device: cpal::Device) -> Option<Self> {
        let config = device.default_input_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Self {
            device,
            config,
            name,
            worker: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels()
    }

    /// Format parameters to set on the capturer so its frames match what this
    /// device delivers.
    pub fn params(&self) -> [(u32, u32); 3] {
        [
            (param::SAMPLE_RATE, self.sample_rate()),
            (param::CHANNELS, self.channels() as u32),
            (param::PCM_WIDTH, 16),
        ]
    }
}

impl CaptureDriver for CpalCapture {
    fn start(&mut self, callback: CaptureCallback) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::Driver("capture already running".into()));
        }
        let device = self.device.clone();
        let format = self.config.sample_format();
        let config = self.config.config();
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        // cpal streams are not Send; the stream lives and dies on this thread
        let flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            let stream = match build_stream(&device, format, &config, callback) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            if let Err(err) = stream.play() {
                let _ = ready_tx.send(Err(err.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            while !flag.load(Ordering::Acquire) {
                std::thread::park();
            }
            debug!("capture stream closed");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(device = %self.name, rate = self.sample_rate(), channels = self.channels(), "capture stream running");
                self.worker = Some(Worker { stop, thread });
                Ok(())
            }
            Ok(Err(msg)) => {
                let _ = thread.join();
                Err(Error::Driver(msg))
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Driver("capture thread exited".into()))
            }
        }
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        worker.thread.thread().unpark();
        if worker.thread.join().is_err() {
            error!(device = %self.name, "capture thread panicked");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    format: SampleFormat,
    config: &cpal::StreamConfig,
    mut callback: CaptureCallback,
) -> core::result::Result<cpal::Stream, String> {
    let on_error = |err: cpal::StreamError| error!(%err, "capture stream error");
    let mut bytes = Vec::new();
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _| {
                pack(&mut bytes, data.iter().map(|&s| pcm16_from_f32(s)));
                callback.deliver(&bytes);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _| {
                pack(&mut bytes, data.iter().copied());
                callback.deliver(&bytes);
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _| {
                pack(&mut bytes, data.iter().map(|&s| (s as i32 - 32_768) as i16));
                callback.deliver(&bytes);
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported sample format {other:?}")),
    };
    stream.map_err(|err| err.to_string())
}

fn pack(bytes: &mut Vec<u8>, samples: impl Iterator<Item = i16>) {
    bytes.clear();
    bytes.extend(samples.flat_map(i16::to_le_bytes));
}

fn pcm16_from_f32(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_samples_clamp_to_pcm16() {
        assert_eq!(pcm16_from_f32(0.0), 0);
        assert_eq!(pcm16_from_f32(1.5), i16::MAX);
        assert_eq!(pcm16_from_f32(-1.0), -i16::MAX);
    }

    #[test]
    fn samples_pack_little_endian() {
        let mut bytes = vec![0xff; 3];
        pack(&mut bytes, [1i16, -2].into_iter());
        assert_eq!(bytes, vec![1, 0, 0xfe, 0xff]);
    }
}
