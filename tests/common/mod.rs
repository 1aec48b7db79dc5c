#![allow(dead_code)]

use dspflow::adapter::param;
use dspflow::codecs::PcmCopy;
use dspflow::{Adapter, Address, AudioCodec, CodecConfig, ComponentId, Message, Opcode, Runtime, Status};
use tracing_subscriber::EnvFilter;

/// Route test logs through the test harness. `RUST_LOG=dspflow=trace` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Mono, two samples a frame: 4 bytes of 16-bit PCM.
pub const MONO_2: [(u32, u32); 2] = [(param::CHANNELS, 1), (param::FRAME_SAMPLES, 2)];

/// Mono, four samples a frame: 8 bytes of 16-bit PCM.
pub const MONO_4: [(u32, u32); 2] = [(param::CHANNELS, 1), (param::FRAME_SAMPLES, 4)];

pub fn runtime() -> Runtime {
    init_tracing();
    Runtime::default()
}

/// A copy codec configured with `params`.
pub fn codec(rt: &mut Runtime, params: &[(u32, u32)]) -> ComponentId {
    let id = rt
        .create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default())
        .unwrap();
    rt.set_params(id, params);
    id
}

pub fn host_buffers(rt: &mut Runtime, port: Address, n: usize, capacity: usize) {
    for _ in 0..n {
        let msg = Message::fill_this_buffer(rt.client(), port, capacity);
        rt.send(msg);
    }
}

pub fn data(rt: &mut Runtime, port: Address, bytes: &[u8]) {
    let msg = Message::empty_this_buffer(rt.client(), port, bytes.to_vec());
    rt.send(msg);
}

pub fn eos(rt: &mut Runtime, port: Address) {
    data(rt, port, &[]);
}

/// Payloads the host got back in FILL_THIS_BUFFER responses, format handshakes
/// and empty returns left out.
pub fn filled(msgs: &[Message]) -> Vec<Vec<u8>> {
    msgs.iter()
        .filter(|m| m.opcode == Opcode::FillThisBuffer && m.format.is_none() && m.length > 0)
        .map(|m| m.payload().to_vec())
        .collect()
}

/// End-of-stream answers that came back from `port`.
pub fn eos_answers(msgs: &[Message], port: Address) -> usize {
    msgs.iter()
        .filter(|m| m.is_response() && m.is_eos() && m.src == port)
        .count()
}

/// Status of the first response to an `opcode` command.
pub fn status(msgs: &[Message], opcode: Opcode) -> Option<Status> {
    msgs.iter()
        .find(|m| m.is_response() && m.opcode == opcode)
        .and_then(|m| m.status)
}
