//! Two reference codecs in a row, fed a sine wave by the host.
//!
//! Run with: cargo run --example codec_chain
//! Set RUST_LOG=dspflow=debug to watch the components come up.

use dspflow::adapter::param;
use dspflow::codecs::PcmCopy;
use dspflow::{Adapter, AudioCodec, CodecConfig, Message, Opcode, Runtime, RuntimeConfig};
use tracing_subscriber::EnvFilter;

const RATE: u32 = 48_000;
const FRAME_SAMPLES: u32 = 256;
const FRAMES: usize = 32;

fn sine(frame: usize) -> Vec<u8> {
    let start = frame * FRAME_SAMPLES as usize;
    (start..start + FRAME_SAMPLES as usize)
        .map(|n| (2.0 * std::f32::consts::PI * 440.0 * n as f32 / RATE as f32).sin())
        .map(|s| (s * 0.5 * i16::MAX as f32) as i16)
        .flat_map(i16::to_le_bytes)
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut rt = Runtime::new(RuntimeConfig::default());
    let params = [
        (param::CHANNELS, 1),
        (param::SAMPLE_RATE, RATE),
        (param::FRAME_SAMPLES, FRAME_SAMPLES),
    ];
    let decode = rt.create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default())?;
    let post = rt.create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default().with_bypass(true))?;
    rt.set_params(decode, &params);
    rt.set_params(post, &params);
    rt.route(decode.port(1), post.port(0), 2);

    let frame_bytes = FRAME_SAMPLES as usize * 2;
    // one extra for the format handshake
    rt.send(Message::fill_this_buffer(rt.client(), post.port(1), frame_bytes));

    let mut received = 0usize;
    let mut peak = 0i16;
    for n in 0..=FRAMES {
        let data = if n < FRAMES { sine(n) } else { Vec::new() };
        rt.send(Message::fill_this_buffer(rt.client(), post.port(1), frame_bytes));
        rt.send(Message::empty_this_buffer(rt.client(), decode.port(0), data));
        rt.run_until_idle();

        for msg in rt.drain_client() {
            if let Some(status) = msg.status.filter(|s| !s.is_ok()) {
                return Err(format!("{:?} failed: {}", msg.opcode, status.code()).into());
            }
            if let Some(format) = msg.format {
                println!("stream: {} Hz, {} ch, {} bit, {} bytes a frame", format.sample_rate, format.channels, format.pcm_width, format.length);
                continue;
            }
            if msg.opcode == Opcode::FillThisBuffer && msg.length > 0 {
                received += msg.length;
                peak = msg
                    .payload()
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]).saturating_abs())
                    .fold(peak, i16::max);
            }
            if msg.opcode == Opcode::EmptyThisBuffer && msg.is_eos() {
                println!("end of stream answered");
            }
        }
    }

    let stats = rt.codec(post).map(|c| c.inner().stats()).unwrap_or_default();
    println!("received {received} bytes, {} samples, peak {peak}", stats.samples);
    println!("graph: {:?}", rt.topology().processing_order()?);
    Ok(())
}
