//! Multi-input, multi-output processor.
//!
//! Inputs are ports `0..n`, outputs `n..n + m`. Unlike the mixer, the vendor
//! decides when the stream ends: every input is marked over as its end of
//! stream arrives, and the component keeps calling the vendor until it
//! reports done. End of stream then goes out on every output, and the
//! upstream end-of-stream messages are answered once all outputs have
//! flushed.

use itertools::Itertools;
use tracing::{debug, info, trace};

use super::{
    announce, host_buffer, receive, route_output, shift, AnyComponent, Base, Component, ComponentType, Cycle,
    Lifecycle, Readiness, Specialization,
};
use crate::adapter::{param, ApiCmd, MemType};
use crate::config::MimoConfig;
use crate::context::{ProcessContext, Request, Urgency};
use crate::error::{Error, Result};
use crate::message::{Message, Opcode, Status, StreamParams};
use crate::port::{FlushStart, InputPort, OutputEvent, OutputPort};

#[derive(Debug)]
struct Lane {
    port: InputPort,
    filled: usize,
    /// The vendor has been told this input is over.
    over: bool,
    /// End-of-stream message, answered once the outputs have flushed.
    eos: Option<Message>,
}

#[derive(Debug)]
pub struct MimoProcessor {
    inputs: Vec<Lane>,
    outputs: Vec<OutputPort>,
    /// End of stream is going out; waiting for every output to flush.
    finishing: bool,
    flush_waiters: Vec<(u8, Message)>,
}

enum Side {
    Input(usize),
    Output(usize),
}

impl MimoProcessor {
    pub fn inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, n: usize) -> Option<&InputPort> {
        self.inputs.get(n).map(|l| &l.port)
    }

    /// The `n`th output, counted from zero (its port is `inputs() + n`).
    pub fn output(&self, n: usize) -> Option<&OutputPort> {
        self.outputs.get(n)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing
    }

    fn side(&self, port: u8) -> Result<Side> {
        let p = port as usize;
        if p < self.inputs.len() {
            Ok(Side::Input(p))
        } else if p < self.inputs.len() + self.outputs.len() {
            Ok(Side::Output(p - self.inputs.len()))
        } else {
            Err(Error::InvalidPort(port))
        }
    }

    fn output_index(&self, port: u8) -> Result<usize> {
        match self.side(port)? {
            Side::Output(j) => Ok(j),
            Side::Input(_) => Err(Error::InvalidPort(port)),
        }
    }

    /// Outputs that take part in a cycle: fed or routed, and not paused.
    fn live_outputs(&self) -> impl Iterator<Item = &OutputPort> {
        self.outputs
            .iter()
            .filter(|o| (o.is_routed() || o.is_active()) && !o.is_paused())
    }

    fn mark_over(&mut self, base: &mut Base, i: usize) -> Result<()> {
        base.adapter_mut().command(ApiCmd::InputOver, i as u32, 0)?;
        self.inputs[i].over = true;
        debug!(id = %base.id(), input = i, "input over");
        Ok(())
    }

    /// Stage every input. Returns whether there is anything for the vendor.
    fn stage(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<bool> {
        let mut work = false;
        for i in 0..self.inputs.len() {
            let lane = &mut self.inputs[i];
            if !lane.over {
                let block = base
                    .memory_mut()
                    .block_mut(MemType::Input, i)
                    .ok_or(Error::InvalidState("vendor has fewer inputs than ports"))?;
                let size = block.size.min(block.data.len());
                let at_eos = lane.port.fill(&mut block.data[..size], &mut lane.filled, cx);
                if at_eos && lane.filled == 0 {
                    lane.eos = lane.port.take_eos();
                    self.mark_over(base, i)?;
                    work = true;
                }
            }
            work |= self.inputs[i].filled > 0;
        }

        let live = self.inputs.iter().filter(|l| l.port.is_active());
        if live.clone().count() > 0 && live.clone().all(|l| l.over) {
            let idle = self
                .inputs
                .iter()
                .positions(|l| !l.port.is_active() && !l.over)
                .collect_vec();
            for i in idle {
                self.mark_over(base, i)?;
                work = true;
            }
        }

        for (i, lane) in self.inputs.iter().enumerate() {
            base.adapter_mut()
                .command(ApiCmd::SetInputBytes, i as u32, lane.filled as u32)?;
        }
        Ok(work)
    }

    fn finish(&mut self, base: &Base, cx: &mut ProcessContext<'_>) {
        info!(id = %base.id(), "vendor done, flushing outputs");
        self.finishing = true;
        for output in &mut self.outputs {
            if output.is_unrouting() {
                continue;
            }
            if output.flush(Opcode::EmptyThisBuffer, cx) == FlushStart::Done {
                output.complete_all(cx);
            }
        }
        self.check_finished(cx);
    }

    /// Answer the upstream end-of-stream messages once every output is flushed.
    fn check_finished(&mut self, cx: &mut ProcessContext<'_>) {
        if !self.finishing {
            return;
        }
        let flushed = self
            .outputs
            .iter()
            .all(|o| o.flush_done() || (!o.is_routed() && !o.is_flushing()));
        if !flushed {
            return;
        }
        self.finishing = false;
        for lane in &mut self.inputs {
            lane.port.purge(cx);
            lane.filled = 0;
            if let Some(eos) = lane.eos.take() {
                cx.respond(eos, Status::Ok);
            }
        }
        debug!("outputs flushed, end of stream answered");
    }

    fn answer_waiters(&mut self, port: u8, cx: &mut ProcessContext<'_>) {
        let (done, keep): (Vec<_>, Vec<_>) = self.flush_waiters.drain(..).partition(|(p, _)| *p == port);
        self.flush_waiters = keep;
        for (_, msg) in done {
            cx.respond(msg, Status::Ok);
        }
    }
}

impl Specialization for MimoProcessor {
    type Config = MimoConfig;

    fn new(config: MimoConfig, base: &mut Base) -> Result<Self> {
        let (n, m) = (config.inputs, config.outputs);
        if n == 0 || m == 0 || n as usize + m as usize > u8::MAX as usize {
            return Err(Error::Malformed("mimo port counts"));
        }
        base.adapter_mut().set_config(param::INPUTS, n as u32)?;
        base.adapter_mut().set_config(param::OUTPUTS, m as u32)?;
        let depth = base.port_depth();
        let id = base.id();
        Ok(Self {
            inputs: (0..n)
                .map(|p| Lane {
                    port: InputPort::new(id.port(p), depth),
                    filled: 0,
                    over: false,
                    eos: None,
                })
                .collect(),
            outputs: (0..m).map(|j| OutputPort::new(id.port(n + j), depth, 0)).collect(),
            finishing: false,
            flush_waiters: Vec::new(),
        })
    }

    fn comp_type(&self) -> ComponentType {
        ComponentType::Mimo
    }

    fn wrap(component: Component<Self>) -> AnyComponent {
        AnyComponent::Mimo(component)
    }

    fn post_init(&mut self, base: &mut Base) -> Result<()> {
        for (j, output) in self.outputs.iter_mut().enumerate() {
            output.set_length(base.block_size(MemType::Output, j));
        }
        Ok(())
    }

    fn preprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Readiness> {
        match base.lifecycle() {
            Lifecycle::RuntimeInit => {
                let any = self.inputs.iter().any(|l| l.port.is_ready());
                Ok(if any { Readiness::Ready } else { Readiness::NoData })
            }
            Lifecycle::Execution => {
                if self.finishing {
                    return Ok(Readiness::NoData);
                }
                let fed = {
                    let mut live = self.live_outputs().peekable();
                    live.peek().is_some() && live.all(OutputPort::has_buffer)
                };
                if !fed {
                    trace!(id = %base.id(), "waiting for output buffers");
                    return Ok(Readiness::NoData);
                }
                if !self.stage(base, cx)? {
                    return Ok(Readiness::NoData);
                }
                for output in self.outputs.iter_mut().filter(|o| o.has_buffer()) {
                    output.mark_setup();
                }
                Ok(Readiness::Ready)
            }
            _ => Ok(Readiness::NoData),
        }
    }

    fn postprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>, cycle: Cycle) -> Result<()> {
        let Cycle::Execute { done } = cycle else {
            return Ok(());
        };

        for (i, lane) in self.inputs.iter_mut().enumerate() {
            let consumed = base.adapter_mut().query(ApiCmd::GetCurIdxInputBuf, i as u32)? as usize;
            if let Some(block) = base.memory_mut().block_mut(MemType::Input, i) {
                shift(&mut block.data, &mut lane.filled, consumed);
            }
        }

        for (j, output) in self.outputs.iter_mut().enumerate() {
            if !output.has_buffer() {
                continue;
            }
            let produced = base.adapter_mut().query(ApiCmd::GetOutputBytes, j as u32)? as usize;
            if produced == 0 {
                continue;
            }
            let block = base
                .memory()
                .block(MemType::Output, j)
                .ok_or(Error::InvalidState("vendor has fewer outputs than ports"))?;
            let n = produced.min(block.data.len());
            output.produce_from(&block.data[..n], cx)?;
        }

        if done {
            self.finish(base, cx);
        } else {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn runtime_ready(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<()> {
        if let Some(stream) = base.stream() {
            for (j, output) in self.outputs.iter_mut().enumerate() {
                let length = base.block_size(MemType::Output, j) as u32;
                announce(output, StreamParams { length, ..stream }, cx);
            }
        }
        Ok(())
    }

    fn route(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let j = self.output_index(req.message()?.dst.port)?;
        route_output(base, &mut self.outputs[j], req, cx)?;
        base.schedule(cx, Urgency::Now);
        Ok(())
    }

    fn unroute(&mut self, _base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let j = self.output_index(req.message()?.dst.port)?;
        self.outputs[j].unroute(req, cx)?;
        Ok(())
    }

    fn empty_this_buffer(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        let Side::Input(i) = self.side(port)? else {
            return Err(Error::InvalidPort(port));
        };
        if receive(base, &mut self.inputs[i].port, req.take()?, cx)? {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn fill_this_buffer(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let j = self.output_index(req.message()?.dst.port)?;
        if host_buffer(&mut self.outputs[j], req, cx)? {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn flush(&mut self, _base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        match self.side(port)? {
            Side::Input(i) => {
                let lane = &mut self.inputs[i];
                lane.port.purge(cx);
                lane.port.restart();
                lane.filled = 0;
                if let Some(eos) = lane.eos.take() {
                    cx.respond(eos, Status::Ok);
                }
            }
            Side::Output(j) => {
                let output = &mut self.outputs[j];
                let start = if output.is_unrouting() {
                    FlushStart::InProgress
                } else {
                    output.flush(Opcode::Flush, cx)
                };
                if start != FlushStart::Done {
                    self.flush_waiters.push((port, req.take()?));
                }
            }
        }
        Ok(())
    }

    fn pause(&mut self, _base: &mut Base, req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        match self.side(req.message()?.dst.port)? {
            Side::Input(i) => self.inputs[i].port.pause(),
            Side::Output(j) => self.outputs[j].pause(),
        }
        Ok(())
    }

    fn resume(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let ready = match self.side(req.message()?.dst.port)? {
            Side::Input(i) => self.inputs[i].port.resume(),
            Side::Output(j) => self.outputs[j].resume(),
        };
        if ready {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn returned(&mut self, base: &mut Base, msg: Message, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = msg.dst.port;
        let j = self.output_index(port)?;
        match self.outputs[j].put(msg, cx) {
            OutputEvent::Buffer { ready: true } => base.schedule(cx, Urgency::Now),
            OutputEvent::Echo { unrouted, .. } => {
                if let Some(msg) = unrouted {
                    cx.respond(msg, Status::Ok);
                }
                self.answer_waiters(port, cx);
                self.check_finished(cx);
            }
            _ => {}
        }
        Ok(())
    }

    fn shutdown(&mut self, _base: &mut Base, cx: &mut ProcessContext<'_>) {
        for lane in &mut self.inputs {
            lane.port.purge(cx);
            lane.filled = 0;
            if let Some(eos) = lane.eos.take() {
                cx.respond(eos, Status::Ok);
            }
        }
        self.finishing = false;
        for output in self.outputs.iter_mut().filter(|o| !o.is_unrouting()) {
            output.flush(Opcode::Flush, cx);
        }
    }

    fn drained(&self) -> bool {
        self.outputs.iter().all(OutputPort::drained)
    }

    fn release(&mut self, cx: &mut ProcessContext<'_>) {
        for output in &mut self.outputs {
            output.release(cx);
        }
        for (_, msg) in self.flush_waiters.drain(..) {
            cx.respond(msg, Status::Ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Adapter;
    use crate::codecs::PcmSum;
    use crate::component::Dispatch;
    use crate::config::RuntimeConfig;
    use crate::context::Outbox;
    use crate::message::{Address, ComponentId, RouteDesc};

    const HOST: Address = Address::client(0);
    const PEER: Address = Address::new(0, 9, 0);

    struct Rig {
        mimo: Component<MimoProcessor>,
        scratch: Vec<u8>,
    }

    impl Rig {
        fn new(inputs: u8, outputs: u8) -> Self {
            let mimo = Component::create(
                ComponentId::new(0, 4),
                Adapter::typed(PcmSum::default()),
                MimoConfig::default().with_inputs(inputs).with_outputs(outputs),
                &RuntimeConfig::default(),
            )
            .unwrap();
            let mut rig = Self {
                mimo,
                scratch: vec![0; 1024],
            };
            rig.send(Message::set_param(
                HOST,
                rig.port(0),
                &[(param::CHANNELS, 1), (param::FRAME_SAMPLES, 2)],
            ));
            rig
        }

        fn port(&self, p: u8) -> Address {
            self.mimo.id().port(p)
        }

        fn send(&mut self, msg: Message) -> Vec<Message> {
            let mut outbox = Outbox::default();
            let mut cx = ProcessContext::new(0, &mut self.scratch, &mut outbox);
            self.mimo.dispatch(Some(msg), &mut cx);
            outbox.messages
        }

        fn process(&mut self) -> Vec<Message> {
            let mut outbox = Outbox::default();
            let mut cx = ProcessContext::new(0, &mut self.scratch, &mut outbox);
            self.mimo.dispatch(None, &mut cx);
            outbox.messages
        }

        fn data(&mut self, input: u8, bytes: &[u8]) -> Vec<Message> {
            self.send(Message::empty_this_buffer(HOST, self.port(input), bytes.to_vec()))
        }

        fn feed_output(&mut self, port: u8, n: usize) {
            for _ in 0..n {
                self.send(Message::fill_this_buffer(HOST, self.port(port), 16));
            }
        }
    }

    fn filled(out: &[Message]) -> Vec<(u8, Vec<u8>)> {
        out.iter()
            .filter(|m| m.opcode == Opcode::FillThisBuffer && m.format.is_none() && m.length > 0)
            .map(|m| (m.src.port, m.payload().to_vec()))
            .collect()
    }

    #[test]
    fn every_output_gets_the_sum() {
        let mut rig = Rig::new(2, 2);
        rig.feed_output(2, 2);
        rig.feed_output(3, 2);
        rig.data(0, &[1, 0, 2, 0]);
        rig.data(1, &[3, 0, 4, 0]);
        rig.process();

        let out = rig.process();
        let got = filled(&out);
        assert_eq!(got, vec![(2, vec![4, 0, 6, 0]), (3, vec![4, 0, 6, 0])]);
    }

    #[test]
    fn waits_for_all_live_outputs() {
        let mut rig = Rig::new(1, 2);
        rig.feed_output(2, 2);
        rig.feed_output(3, 1);
        rig.data(0, &[1, 0, 1, 0]);
        rig.process();

        // output 3 spent its only buffer on the format
        assert!(filled(&rig.process()).is_empty());
        rig.feed_output(3, 1);
        assert_eq!(filled(&rig.process()).len(), 2);
    }

    #[test]
    fn eos_answered_after_outputs_flush() {
        let mut rig = Rig::new(1, 1);
        let route = RouteDesc::new(PEER, 2);
        rig.send(Message::route(HOST, rig.port(1), route));
        rig.data(0, &[1, 0, 1, 0]);
        rig.data(0, &[]);
        rig.process();

        let out = rig.process();
        assert!(out.iter().any(|m| m.dst == PEER && m.length == 4));

        // end of stream reaches the vendor, which reports done
        let out = rig.process();
        assert_eq!(rig.mimo.lifecycle(), Lifecycle::Completed);
        let ctrl = out.into_iter().find(|m| m.dst == PEER && m.is_eos()).unwrap();
        assert!(rig.mimo.inner().is_finishing());

        let out = rig.send(ctrl.into_response(Status::Ok));
        assert!(!rig.mimo.inner().is_finishing());
        let eos = out.iter().find(|m| m.dst == HOST).unwrap();
        assert!(eos.is_eos());
    }

    #[test]
    fn idle_inputs_are_closed_with_the_last_live_one() {
        let mut rig = Rig::new(2, 1);
        rig.feed_output(2, 3);
        rig.data(0, &[]);
        rig.process();
        rig.process();
        assert_eq!(rig.mimo.lifecycle(), Lifecycle::Completed);
        assert!(!rig.mimo.inner().is_finishing());
    }

    #[test]
    fn late_end_of_stream_is_answered_on_every_input() {
        let mut rig = Rig::new(2, 1);
        rig.feed_output(2, 3);
        rig.data(0, &[]);
        rig.process();
        rig.process();
        assert_eq!(rig.mimo.lifecycle(), Lifecycle::Completed);

        for input in 0..2 {
            let out = rig.data(input, &[]);
            assert_eq!(out.len(), 1, "input {input}");
            assert!(out[0].is_response() && out[0].is_eos());
            assert_eq!(rig.mimo.inner().input(input as usize).unwrap().queued(), 0);
        }
        assert!(!rig.mimo.is_scheduled());
    }

    #[test]
    fn output_port_on_input_side_is_refused() {
        let mut rig = Rig::new(2, 1);
        let out = rig.send(Message::fill_this_buffer(HOST, rig.port(0), 16));
        assert_eq!(out[0].status, Some(Status::from(&Error::InvalidPort(0))));
        let out = rig.send(Message::pause(HOST, rig.port(7)));
        assert_eq!(out[0].status, Some(Status::from(&Error::InvalidPort(7))));
    }
}
