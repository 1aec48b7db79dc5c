//! Single-in, single-out audio codec.

use tracing::{debug, trace};

use super::{
    announce, host_buffer, receive, route_output, shift, AnyComponent, Base, Component, ComponentType, Cycle,
    Lifecycle, Readiness, Specialization,
};
use crate::adapter::{ApiCmd, MemType};
use crate::config::CodecConfig;
use crate::context::{ProcessContext, Request, Urgency};
use crate::error::{Error, Result};
use crate::message::{Message, Opcode, Status};
use crate::port::{FlushStart, InputPort, OutputEvent, OutputPort};

pub const INPUT: u8 = 0;
pub const OUTPUT: u8 = 1;

/// Byte counts of a codec, for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Consumed by the last execute.
    pub consumed: usize,
    /// Produced by the last execute.
    pub produced: usize,
    pub total_consumed: u64,
    pub total_produced: u64,
    /// Sample frames (all channels) produced since the stream started.
    pub samples: u64,
}

/// Drives a one-in, one-out vendor codec.
///
/// In copy mode input bytes are gathered into the vendor's input block, which
/// lets a frame span several port buffers. In bypass mode the vendor reads the
/// front port buffer in place.
#[derive(Debug)]
pub struct AudioCodec {
    config: CodecConfig,
    input: InputPort,
    output: OutputPort,
    /// Bytes waiting in the input block (copy mode).
    staged: usize,
    input_over: bool,
    /// End-of-stream marker, answered once draining completes.
    eos: Option<Message>,
    /// Flush requests waiting for the output flush to echo.
    flush_waiters: Vec<Message>,
    stats: CodecStats,
}

impl AudioCodec {
    pub fn input(&self) -> &InputPort {
        &self.input
    }

    pub fn output(&self) -> &OutputPort {
        &self.output
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    pub fn config(&self) -> CodecConfig {
        self.config
    }

    /// Tell the vendor the input is over, once, when end of stream reaches
    /// the front of the queue.
    fn check_input_over(&mut self, base: &mut Base, at_eos: bool) -> Result<()> {
        if !at_eos || self.input_over {
            return Ok(());
        }
        self.eos = self.input.take_eos();
        base.adapter_mut().command(ApiCmd::InputOver, 0, 0)?;
        self.input_over = true;
        debug!(id = %base.id(), "input over");
        Ok(())
    }

    fn stage(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Readiness> {
        if self.config.bypass {
            self.stage_direct(base)
        } else {
            self.stage_copy(base, cx)
        }
    }

    /// Give back what the vendor consumed: shift the input block, or advance
    /// the front port buffer in bypass mode.
    fn reconcile_input(&mut self, base: &mut Base, consumed: usize, cx: &mut ProcessContext<'_>) {
        if self.config.bypass {
            self.input.consume(consumed, cx);
        } else if let Some(block) = base.memory_mut().block_mut(MemType::Input, 0) {
            shift(&mut block.data, &mut self.staged, consumed);
        }
    }

    fn stage_copy(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Readiness> {
        let block = base
            .memory_mut()
            .block_mut(MemType::Input, 0)
            .ok_or(Error::InvalidState("vendor has no input block"))?;
        let size = block.size.min(block.data.len());
        let at_eos = if self.staged < size {
            self.input.fill(&mut block.data[..size], &mut self.staged, cx)
        } else {
            self.input.at_eos()
        };
        self.check_input_over(base, at_eos)?;
        if self.staged == 0 && !self.input_over {
            return Ok(Readiness::NoData);
        }
        base.adapter_mut()
            .command(ApiCmd::SetInputBytes, 0, self.staged as u32)?;
        Ok(Readiness::Ready)
    }

    fn stage_direct(&mut self, base: &mut Base) -> Result<Readiness> {
        let avail = self.input.available();
        if avail == 0 {
            let at_eos = self.input.at_eos();
            self.check_input_over(base, at_eos)?;
            if !self.input_over {
                return Ok(Readiness::NoData);
            }
        } else {
            self.input.mark_setup();
        }
        base.adapter_mut().command(ApiCmd::SetInputBytes, 0, avail as u32)?;
        Ok(Readiness::Ready)
    }

    /// The vendor is done: send end of stream and answer ours once it is
    /// through.
    fn drain(&mut self, cx: &mut ProcessContext<'_>) {
        if self.output.is_unrouting() {
            return;
        }
        if self.output.flush(Opcode::EmptyThisBuffer, cx) == FlushStart::Done {
            self.output.complete_all(cx);
            self.finish_eos(cx);
        }
    }

    fn finish_eos(&mut self, cx: &mut ProcessContext<'_>) {
        if let Some(eos) = self.eos.take() {
            cx.respond(eos, Status::Ok);
        }
    }

    fn flush_output(&mut self, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let start = if self.output.is_unrouting() {
            FlushStart::InProgress
        } else {
            self.output.flush(Opcode::Flush, cx)
        };
        if start != FlushStart::Done {
            self.flush_waiters.push(req.take()?);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.staged = 0;
        self.input_over = false;
        self.stats = CodecStats::default();
    }
}

impl Specialization for AudioCodec {
    type Config = CodecConfig;

    fn new(config: CodecConfig, base: &mut Base) -> Result<Self> {
        let depth = base.port_depth();
        Ok(Self {
            config,
            input: InputPort::new(base.id().port(INPUT), depth),
            output: OutputPort::new(base.id().port(OUTPUT), depth, 0),
            staged: 0,
            input_over: false,
            eos: None,
            flush_waiters: Vec::new(),
            stats: CodecStats::default(),
        })
    }

    fn comp_type(&self) -> ComponentType {
        ComponentType::Codec
    }

    fn wrap(component: Component<Self>) -> AnyComponent {
        AnyComponent::Codec(component)
    }

    fn post_init(&mut self, base: &mut Base) -> Result<()> {
        self.output.set_length(base.block_size(MemType::Output, 0));
        Ok(())
    }

    /// Runtime-init sees input the same way execute does, so a vendor can
    /// read a stream header before it fixes the format.
    fn preprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Readiness> {
        match base.lifecycle() {
            Lifecycle::RuntimeInit => self.stage(base, cx),
            Lifecycle::Execution => {
                if !self.output.has_buffer() {
                    return Ok(Readiness::NoData);
                }
                let readiness = self.stage(base, cx)?;
                if readiness == Readiness::Ready {
                    self.output.mark_setup();
                }
                Ok(readiness)
            }
            _ => Ok(Readiness::NoData),
        }
    }

    fn direct_input(&mut self) -> Option<&mut [u8]> {
        if self.config.bypass {
            self.input.data()
        } else {
            None
        }
    }

    fn postprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>, cycle: Cycle) -> Result<()> {
        let consumed = base.adapter_mut().query(ApiCmd::GetCurIdxInputBuf, 0)? as usize;
        let Cycle::Execute { done } = cycle else {
            self.reconcile_input(base, consumed, cx);
            trace!(id = %base.id(), consumed, "runtime-init step");
            // an unfinished init that made progress goes again; one that
            // made none waits for more input
            if base.lifecycle() == Lifecycle::RuntimeInit && consumed > 0 {
                base.schedule(cx, Urgency::Now);
            }
            return Ok(());
        };
        let produced = base.adapter_mut().query(ApiCmd::GetOutputBytes, 0)? as usize;
        self.reconcile_input(base, consumed, cx);

        if produced > 0 {
            let block = base
                .memory()
                .block(MemType::Output, 0)
                .ok_or(Error::InvalidState("vendor has no output block"))?;
            let n = produced.min(block.data.len());
            self.output.produce_from(&block.data[..n], cx)?;
        }

        let frame_bytes = base.stream().map_or(0, |s| s.frame_bytes());
        self.stats.consumed = consumed;
        self.stats.produced = produced;
        self.stats.total_consumed += consumed as u64;
        self.stats.total_produced += produced as u64;
        if frame_bytes > 0 {
            self.stats.samples = self.stats.total_produced / frame_bytes as u64;
        }
        trace!(id = %base.id(), consumed, produced, done, "codec cycle");

        if done {
            self.drain(cx);
        } else if consumed > 0 || produced > 0 {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn runtime_ready(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<()> {
        if let Some(stream) = base.stream() {
            announce(&mut self.output, stream, cx);
        }
        Ok(())
    }

    fn route(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != OUTPUT {
            return Err(Error::InvalidPort(port));
        }
        route_output(base, &mut self.output, req, cx)?;
        if self.input.is_ready() {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn unroute(&mut self, _base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != OUTPUT {
            return Err(Error::InvalidPort(port));
        }
        self.output.unroute(req, cx)?;
        Ok(())
    }

    fn empty_this_buffer(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != INPUT {
            return Err(Error::InvalidPort(port));
        }
        if receive(base, &mut self.input, req.take()?, cx)? {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn fill_this_buffer(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != OUTPUT {
            return Err(Error::InvalidPort(port));
        }
        if host_buffer(&mut self.output, req, cx)? {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    /// An input flush discards the stream: queued input goes back, the vendor
    /// is reset and the flush follows downstream.
    fn flush(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        match req.message()?.dst.port {
            INPUT => {
                self.input.purge(cx);
                self.input.restart();
                self.finish_eos(cx);
                self.reset();
                base.reset_stream()?;
                self.output.rearm();
                self.flush_output(req, cx)
            }
            OUTPUT => self.flush_output(req, cx),
            port => Err(Error::InvalidPort(port)),
        }
    }

    fn pause(&mut self, _base: &mut Base, req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        match req.message()?.dst.port {
            INPUT => self.input.pause(),
            OUTPUT => self.output.pause(),
            port => return Err(Error::InvalidPort(port)),
        }
        Ok(())
    }

    fn resume(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let ready = match req.message()?.dst.port {
            INPUT => self.input.resume(),
            OUTPUT => self.output.resume(),
            port => return Err(Error::InvalidPort(port)),
        };
        if ready {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn returned(&mut self, base: &mut Base, msg: Message, cx: &mut ProcessContext<'_>) -> Result<()> {
        if msg.dst.port != OUTPUT {
            return Err(Error::InvalidPort(msg.dst.port));
        }
        match self.output.put(msg, cx) {
            OutputEvent::Buffer { ready } => {
                if ready && self.input.is_ready() {
                    base.schedule(cx, Urgency::Now);
                }
            }
            OutputEvent::Echo { flushed, unrouted } => {
                if let Some(msg) = unrouted {
                    cx.respond(msg, Status::Ok);
                }
                if flushed == Some(Opcode::EmptyThisBuffer) {
                    self.finish_eos(cx);
                }
                for msg in self.flush_waiters.drain(..) {
                    cx.respond(msg, Status::Ok);
                }
            }
            OutputEvent::Ignored => {}
        }
        Ok(())
    }

    fn shutdown(&mut self, _base: &mut Base, cx: &mut ProcessContext<'_>) {
        self.input.purge(cx);
        self.finish_eos(cx);
        if !self.output.is_unrouting() {
            self.output.flush(Opcode::Flush, cx);
        }
    }

    fn drained(&self) -> bool {
        self.output.drained()
    }

    fn release(&mut self, cx: &mut ProcessContext<'_>) {
        self.output.release(cx);
        for msg in self.flush_waiters.drain(..) {
            cx.respond(msg, Status::Ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{param, Adapter};
    use crate::codecs::PcmCopy;
    use crate::component::{Dispatch, Lifecycle};
    use crate::config::RuntimeConfig;
    use crate::context::Outbox;
    use crate::message::{Address, ComponentId, RouteDesc};

    const HOST: Address = Address::client(0);
    const PEER: Address = Address::new(0, 9, 0);

    struct Rig {
        codec: Component<AudioCodec>,
        scratch: Vec<u8>,
    }

    impl Rig {
        fn new(config: CodecConfig) -> Self {
            let codec = Component::create(
                ComponentId::new(0, 1),
                Adapter::typed(PcmCopy::default()),
                config,
                &RuntimeConfig::default(),
            )
            .unwrap();
            let mut rig = Self {
                codec,
                scratch: vec![0; 4096],
            };
            // 4 mono samples, 8 bytes a frame
            let set = Message::set_param(HOST, rig.port(INPUT), &[(param::CHANNELS, 1), (param::FRAME_SAMPLES, 4)]);
            rig.send(set);
            rig
        }

        fn port(&self, port: u8) -> Address {
            self.codec.id().port(port)
        }

        fn send(&mut self, msg: Message) -> Vec<Message> {
            self.dispatch(Some(msg))
        }

        fn process(&mut self) -> Vec<Message> {
            self.dispatch(None)
        }

        fn dispatch(&mut self, msg: Option<Message>) -> Vec<Message> {
            let mut outbox = Outbox::default();
            let mut cx = ProcessContext::new(0, &mut self.scratch, &mut outbox);
            self.codec.dispatch(msg, &mut cx);
            outbox.messages
        }

        fn data(&mut self, bytes: &[u8]) -> Vec<Message> {
            self.send(Message::empty_this_buffer(HOST, self.port(INPUT), bytes.to_vec()))
        }
    }

    #[test]
    fn full_buffer_is_consumed_and_forwarded_once() {
        let mut rig = Rig::new(CodecConfig::default());
        rig.send(Message::route(HOST, rig.port(OUTPUT), RouteDesc::new(PEER, 2)));
        rig.data(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let init = rig.process();
        assert_eq!(rig.codec.lifecycle(), Lifecycle::Execution);
        assert!(init.iter().any(|m| m.format.is_some() && m.dst == PEER));
        let returned: Vec<_> = init.iter().filter(|m| m.dst == HOST).collect();
        assert_eq!(returned.len(), 1, "input buffer staged and answered during runtime-init");

        let out = rig.process();
        let forwarded: Vec<_> = out.iter().filter(|m| m.dst == PEER).collect();
        assert_eq!(forwarded.len(), 1, "output sent downstream once");
        assert_eq!(forwarded[0].payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let codec = rig.codec.inner();
        assert_eq!(codec.stats().consumed, 8);
        assert!(!codec.input().is_setup());
        assert!(!codec.output().is_setup());
        assert_eq!(codec.output().in_flight(), 1);

        // nothing new: another cycle sends nothing
        assert!(rig.process().iter().all(|m| m.dst != PEER));
    }

    #[test]
    fn frame_spans_two_port_buffers() {
        let mut rig = Rig::new(CodecConfig::default());
        rig.send(Message::fill_this_buffer(HOST, rig.port(OUTPUT), 16));
        rig.send(Message::fill_this_buffer(HOST, rig.port(OUTPUT), 16));
        rig.data(&[1, 2, 3, 4, 5]);
        rig.data(&[6, 7, 8, 9]);
        let init = rig.process();
        // first buffer fully staged, second has one byte left
        assert_eq!(init.iter().filter(|m| m.opcode == Opcode::EmptyThisBuffer).count(), 1);
        assert_eq!(rig.codec.inner().input().queued(), 1);

        let out = rig.process();
        let produced: Vec<_> = out
            .iter()
            .filter(|m| m.opcode == Opcode::FillThisBuffer && m.format.is_none())
            .collect();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn end_of_stream_to_host_output() {
        let mut rig = Rig::new(CodecConfig::default().with_bypass(true));
        rig.send(Message::fill_this_buffer(HOST, rig.port(OUTPUT), 16));
        rig.send(Message::fill_this_buffer(HOST, rig.port(OUTPUT), 16));
        rig.send(Message::fill_this_buffer(HOST, rig.port(OUTPUT), 16));
        rig.data(&[1, 2, 3, 4]);
        rig.data(&[]);
        rig.process();
        let out = rig.process();
        assert!(out.iter().any(|m| m.opcode == Opcode::FillThisBuffer && m.payload() == [1, 2, 3, 4]));

        let out = rig.process();
        assert_eq!(rig.codec.lifecycle(), Lifecycle::Completed);
        let eos = out.iter().find(|m| m.opcode == Opcode::EmptyThisBuffer).unwrap();
        assert_eq!(eos.length, 0);
        assert!(eos.status.unwrap().is_ok());
        assert!(out.iter().any(|m| m.opcode == Opcode::FillThisBuffer && m.length == 0));

        // a second end of stream is answered without draining again
        let again = rig.data(&[]);
        assert_eq!(again.len(), 1);
        assert!(again[0].is_response());
    }

    #[test]
    fn routed_eos_waits_for_echo() {
        let mut rig = Rig::new(CodecConfig::default());
        rig.send(Message::route(HOST, rig.port(OUTPUT), RouteDesc::new(PEER, 1)));
        rig.data(&[]);
        rig.process();
        let out = rig.process();
        assert_eq!(rig.codec.lifecycle(), Lifecycle::Completed);
        let ctrl = out.into_iter().find(|m| m.dst == PEER && m.is_eos()).unwrap();
        assert!(rig.codec.inner().output().is_flushing());

        let out = rig.send(ctrl.into_response(Status::Ok));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_eos() && out[0].dst == HOST);
    }

    #[test]
    fn input_flush_resets_stream() {
        let mut rig = Rig::new(CodecConfig::default());
        rig.send(Message::fill_this_buffer(HOST, rig.port(OUTPUT), 16));
        rig.data(&[1, 2]);
        rig.process();
        assert_eq!(rig.codec.lifecycle(), Lifecycle::Execution);

        let out = rig.send(Message::flush(HOST, rig.port(INPUT)));
        assert_eq!(rig.codec.lifecycle(), Lifecycle::PostInit);
        assert!(out.iter().any(|m| m.opcode == Opcode::Flush && m.status == Some(Status::Ok)));
        assert_eq!(rig.codec.inner().input().queued(), 0);
    }

    #[test]
    fn wrong_port_is_refused() {
        let mut rig = Rig::new(CodecConfig::default());
        let out = rig.send(Message::route(HOST, rig.port(INPUT), RouteDesc::new(PEER, 1)));
        assert_eq!(out[0].status, Some(Status::from(&Error::InvalidPort(INPUT))));
    }
}
