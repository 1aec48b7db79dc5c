use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dspflow::adapter::param;
use dspflow::codecs::PcmCopy;
use dspflow::message::{decode_params, encode_params};
use dspflow::scheduler::Scheduler;
use dspflow::{Adapter, AudioCodec, CodecConfig, ComponentId, Message, Runtime, Urgency};

const FRAME: usize = 512;

/// Two copy codecs in a row, warmed up past runtime-init.
fn chain() -> (Runtime, ComponentId, ComponentId) {
    let mut rt = Runtime::default();
    let params = [(param::CHANNELS, 2), (param::FRAME_SAMPLES, 128)];
    let a = rt
        .create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default())
        .unwrap();
    let b = rt
        .create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default())
        .unwrap();
    rt.set_params(a, &params);
    rt.set_params(b, &params);
    rt.route(a.port(1), b.port(0), 2);
    for _ in 0..2 {
        rt.send(Message::fill_this_buffer(rt.client(), b.port(1), FRAME));
    }
    rt.send(Message::empty_this_buffer(rt.client(), a.port(0), vec![0; FRAME]));
    rt.run_until_idle();
    rt.drain_client();
    (rt, a, b)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("Runtime: frame through two codecs", |b| {
        let (mut rt, first, last) = chain();
        let frame: Vec<u8> = (0..FRAME).map(|i| i as u8).collect();

        b.iter(|| {
            rt.send(Message::fill_this_buffer(rt.client(), last.port(1), FRAME));
            rt.send(Message::empty_this_buffer(rt.client(), first.port(0), frame.clone()));
            black_box(rt.run_until_idle());
            black_box(rt.drain_client());
        })
    });

    c.bench_function("Scheduler: arm and pop 64", |b| {
        let mut sched = Scheduler::new();
        let ids: Vec<ComponentId> = (1..=64).map(|n| ComponentId::new(0, n)).collect();

        b.iter(|| {
            for (i, &id) in ids.iter().enumerate() {
                let urgency = if i % 4 == 0 { Urgency::After(1) } else { Urgency::Now };
                sched.arm(id, urgency, 0);
            }
            while let Some(id) = sched.pop_due(1) {
                black_box(id);
            }
        })
    });

    c.bench_function("SET_PARAM payload encode+decode", |b| {
        let pairs: Vec<(u32, u32)> = (0..16).map(|i| (i, i * 1000)).collect();
        b.iter(|| decode_params(&encode_params(black_box(&pairs))).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
