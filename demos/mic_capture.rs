//! Capture from the default input device and report levels.
//!
//! Run with: cargo run --example mic_capture --features cpal_capture

use std::thread::sleep;
use std::time::{Duration, Instant};

use dspflow::adapter::param;
use dspflow::codecs::CaptureEngine;
use dspflow::{Adapter, AudioCapturer, CaptureSetup, CpalCapture, Message, Opcode, Runtime};
use tracing_subscriber::EnvFilter;

const FRAME_SAMPLES: u32 = 480;
const SECONDS: u64 = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = CpalCapture::default_input().ok_or("No input device")?;
    println!("capturing from {} ({} Hz, {} ch)", device.name(), device.sample_rate(), device.channels());

    let frame_bytes = (FRAME_SAMPLES * device.channels() as u32 * 2) as usize;
    let mut params = device.params().to_vec();
    params.push((param::FRAME_SAMPLES, FRAME_SAMPLES));

    let mut rt = Runtime::default();
    let mic = rt.create::<AudioCapturer>(Adapter::typed(CaptureEngine::default()), CaptureSetup::new(device))?;
    rt.set_params(mic, &params);
    for _ in 0..4 {
        rt.send(Message::fill_this_buffer(rt.client(), mic.port(0), frame_bytes));
    }

    let start = Instant::now();
    let mut frames = 0u64;
    while start.elapsed() < Duration::from_secs(SECONDS) {
        rt.run_until_idle();
        for msg in rt.drain_client() {
            if msg.opcode != Opcode::FillThisBuffer || msg.format.is_some() {
                continue;
            }
            if msg.length > 0 {
                frames += 1;
                let peak = msg
                    .payload()
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]).saturating_abs())
                    .max()
                    .unwrap_or(0);
                if frames % 25 == 0 {
                    let bar = "#".repeat(peak as usize * 40 / i16::MAX as usize);
                    println!("{frames:6} {bar}");
                }
            }
            rt.send(Message::fill_this_buffer(rt.client(), mic.port(0), frame_bytes));
        }
        sleep(Duration::from_millis(2));
    }

    if let Some(capturer) = rt.capturer(mic) {
        println!("{} frames, {} overruns", capturer.inner().frames(), capturer.inner().overruns());
    }
    rt.unregister(mic);
    rt.run_until_idle();
    Ok(())
}
