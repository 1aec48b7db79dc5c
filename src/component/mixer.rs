//! N-track mixer with per-track presentation timestamps.
//!
//! Tracks are input ports `0..n`, the mix leaves through port `n`. The mixer
//! keeps a clock in frames. A track takes part in a frame once its timestamp
//! is due; a track that is not due yet is skipped without holding the others
//! back. The stream ends the moment no track is active any more, without
//! asking the vendor.

use tracing::{debug, info, trace};

use super::{
    announce, host_buffer, receive, route_output, shift, AnyComponent, Base, Component, ComponentType, Cycle,
    Lifecycle, Readiness, Specialization,
};
use crate::adapter::{param, ApiCmd, MemType};
use crate::config::MixerConfig;
use crate::context::{ProcessContext, Request, Urgency};
use crate::error::{Error, Result};
use crate::message::{Message, Opcode, Status};
use crate::port::{FlushStart, InputPort, OutputEvent, OutputPort};

#[derive(Debug)]
struct Track {
    port: InputPort,
    /// Mixer frame at which this track's next frame plays.
    pts: u64,
    /// Bytes staged in this track's input block.
    filled: usize,
    due: bool,
}

impl Track {
    fn is_due(&self, clock: u64) -> bool {
        self.port.is_active() && !self.port.is_paused() && self.pts <= clock
    }
}

#[derive(Debug)]
pub struct Mixer {
    tracks: Vec<Track>,
    output: OutputPort,
    clock: u64,
    started: bool,
    draining: bool,
    flush_waiters: Vec<Message>,
}

impl Mixer {
    pub fn tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, n: usize) -> Option<&InputPort> {
        self.tracks.get(n).map(|t| &t.port)
    }

    pub fn track_pts(&self, n: usize) -> Option<u64> {
        self.tracks.get(n).map(|t| t.pts)
    }

    pub fn output(&self) -> &OutputPort {
        &self.output
    }

    /// Frames mixed so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn output_port(&self) -> u8 {
        self.tracks.len() as u8
    }

    fn track_mut(&mut self, port: u8) -> Result<&mut Track> {
        self.tracks
            .get_mut(port as usize)
            .ok_or(Error::InvalidPort(port))
    }

    fn track_param(&self, id: u32) -> Option<usize> {
        let n = id.checked_sub(param::TRACK_START)? as usize;
        (n < self.tracks.len()).then_some(n)
    }

    fn finish(&mut self, base: &Base, cx: &mut ProcessContext<'_>) {
        info!(id = %base.id(), clock = self.clock, "no active track, end of stream");
        if self.output.is_unrouting() {
            return;
        }
        if self.output.flush(Opcode::EmptyThisBuffer, cx) == FlushStart::Done {
            self.output.complete_all(cx);
        }
    }

    /// Stage every due track. `None` when a due track is short of a frame.
    fn stage(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Option<()>> {
        let clock = self.clock;
        for (i, track) in self.tracks.iter_mut().enumerate() {
            track.due = track.is_due(clock);
            if !track.due {
                continue;
            }
            let block = base
                .memory_mut()
                .block_mut(MemType::Input, i)
                .ok_or(Error::InvalidState("vendor has fewer inputs than tracks"))?;
            let size = block.size.min(block.data.len());
            let at_eos = if track.filled < size {
                track.port.fill(&mut block.data[..size], &mut track.filled, cx)
            } else {
                track.port.at_eos()
            };
            if track.filled < size && !at_eos {
                trace!(id = %base.id(), track = i, filled = track.filled, "track not set up");
                return Ok(None);
            }
        }
        for (i, track) in self.tracks.iter().enumerate() {
            let bytes = if track.due { track.filled } else { 0 };
            base.adapter_mut()
                .command(ApiCmd::SetInputBytes, i as u32, bytes as u32)?;
        }
        Ok(Some(()))
    }
}

impl Specialization for Mixer {
    type Config = MixerConfig;

    fn new(config: MixerConfig, base: &mut Base) -> Result<Self> {
        if config.tracks == 0 || config.tracks == u8::MAX {
            return Err(Error::Malformed("mixer track count"));
        }
        base.adapter_mut().set_config(param::INPUTS, config.tracks as u32)?;
        base.adapter_mut().set_config(param::OUTPUTS, 1)?;
        let depth = base.port_depth();
        let tracks = (0..config.tracks)
            .map(|p| Track {
                port: InputPort::new(base.id().port(p), depth),
                pts: 0,
                filled: 0,
                due: false,
            })
            .collect();
        Ok(Self {
            tracks,
            output: OutputPort::new(base.id().port(config.tracks), depth, 0),
            clock: 0,
            started: false,
            draining: false,
            flush_waiters: Vec::new(),
        })
    }

    fn comp_type(&self) -> ComponentType {
        ComponentType::Mixer
    }

    fn wrap(component: Component<Self>) -> AnyComponent {
        AnyComponent::Mixer(component)
    }

    fn post_init(&mut self, base: &mut Base) -> Result<()> {
        self.output.set_length(base.block_size(MemType::Output, 0));
        Ok(())
    }

    fn set_param(&mut self, _base: &mut Base, id: u32, value: u32) -> Option<Result<()>> {
        if id < param::TRACK_START {
            return None;
        }
        Some(match self.track_param(id) {
            Some(n) => {
                self.tracks[n].pts = value as u64;
                debug!(track = n, pts = value, "track start");
                Ok(())
            }
            None => Err(Error::InvalidPort((id - param::TRACK_START) as u8)),
        })
    }

    fn get_param(&self, _base: &Base, id: u32) -> Option<Result<u32>> {
        if id < param::TRACK_START {
            return None;
        }
        Some(match self.track_param(id) {
            Some(n) => Ok(self.tracks[n].pts as u32),
            None => Err(Error::InvalidPort((id - param::TRACK_START) as u8)),
        })
    }

    fn preprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Readiness> {
        match base.lifecycle() {
            Lifecycle::RuntimeInit => {
                let any = self.tracks.iter().any(|t| t.port.is_ready());
                Ok(if any { Readiness::Ready } else { Readiness::NoData })
            }
            Lifecycle::Execution => {
                self.started |= self.tracks.iter().any(|t| t.port.has_received());
                if self.started && !self.tracks.iter().any(|t| t.port.is_active()) {
                    self.draining = true;
                    return Ok(Readiness::Drain);
                }
                if !self.started || !self.output.has_buffer() {
                    return Ok(Readiness::NoData);
                }
                match self.stage(base, cx)? {
                    Some(()) => {
                        self.output.mark_setup();
                        Ok(Readiness::Ready)
                    }
                    None => Ok(Readiness::NoData),
                }
            }
            _ => Ok(Readiness::NoData),
        }
    }

    fn postprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>, cycle: Cycle) -> Result<()> {
        let Cycle::Execute { done } = cycle else {
            return Ok(());
        };
        if self.draining {
            self.draining = false;
            self.finish(base, cx);
            return Ok(());
        }

        for i in 0..self.tracks.len() {
            if !self.tracks[i].due {
                continue;
            }
            let consumed = base.adapter_mut().query(ApiCmd::GetCurIdxInputBuf, i as u32)? as usize;
            let track = &mut self.tracks[i];
            if let Some(block) = base.memory_mut().block_mut(MemType::Input, i) {
                shift(&mut block.data, &mut track.filled, consumed);
            }
            track.pts += 1;
            if track.filled == 0 {
                if let Some(eos) = track.port.take_eos() {
                    track.port.deactivate();
                    debug!(id = %base.id(), track = i, "track retired");
                    cx.respond(eos, Status::Ok);
                }
            }
        }

        let produced = base.adapter_mut().query(ApiCmd::GetOutputBytes, 0)? as usize;
        if produced > 0 {
            let block = base
                .memory()
                .block(MemType::Output, 0)
                .ok_or(Error::InvalidState("vendor has no output block"))?;
            let n = produced.min(block.data.len());
            self.output.produce_from(&block.data[..n], cx)?;
            self.clock += 1;
        }
        trace!(id = %base.id(), clock = self.clock, produced, "mix");

        // paused or starved tracks wait for their next put
        let pending = self.tracks.iter().any(|t| t.port.is_ready() || t.filled > 0);
        let retired = !self.tracks.iter().any(|t| t.port.is_active());
        if done {
            self.finish(base, cx);
        } else if pending || retired {
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
        if port != self.output_port() {
            return Err(Error::InvalidPort(port));
        }
        route_output(base, &mut self.output, req, cx)?;
        base.schedule(cx, Urgency::Now);
        Ok(())
    }

    fn unroute(&mut self, _base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != self.output_port() {
            return Err(Error::InvalidPort(port));
        }
        self.output.unroute(req, cx)?;
        Ok(())
    }

    fn empty_this_buffer(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        let track = self.track_mut(port)?;
        if receive(base, &mut track.port, req.take()?, cx)? {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn fill_this_buffer(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != self.output_port() {
            return Err(Error::InvalidPort(port));
        }
        if host_buffer(&mut self.output, req, cx)? {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn flush(&mut self, _base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port == self.output_port() {
            let start = if self.output.is_unrouting() {
                FlushStart::InProgress
            } else {
                self.output.flush(Opcode::Flush, cx)
            };
            if start != FlushStart::Done {
                self.flush_waiters.push(req.take()?);
            }
            return Ok(());
        }
        let track = self.track_mut(port)?;
        track.port.purge(cx);
        track.port.restart();
        track.filled = 0;
        Ok(())
    }

    /// Suspends one track (or the output). A paused track is never due, so
    /// the others keep mixing.
    fn pause(&mut self, _base: &mut Base, req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port == self.output_port() {
            self.output.pause();
        } else {
            self.track_mut(port)?.port.pause();
            debug!(track = port, "track paused");
        }
        Ok(())
    }

    fn resume(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        let ready = if port == self.output_port() {
            self.output.resume()
        } else {
            debug!(track = port, "track resumed");
            self.track_mut(port)?.port.resume()
        };
        if ready {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn returned(&mut self, base: &mut Base, msg: Message, cx: &mut ProcessContext<'_>) -> Result<()> {
        if msg.dst.port != self.output_port() {
            return Err(Error::InvalidPort(msg.dst.port));
        }
        match self.output.put(msg, cx) {
            OutputEvent::Buffer { ready: true } => base.schedule(cx, Urgency::Now),
            OutputEvent::Echo { unrouted, .. } => {
                if let Some(msg) = unrouted {
                    cx.respond(msg, Status::Ok);
                }
                for msg in self.flush_waiters.drain(..) {
                    cx.respond(msg, Status::Ok);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn shutdown(&mut self, _base: &mut Base, cx: &mut ProcessContext<'_>) {
        for track in &mut self.tracks {
            track.port.purge(cx);
            track.filled = 0;
        }
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
    use crate::adapter::Adapter;
    use crate::codecs::PcmSum;
    use crate::component::Dispatch;
    use crate::config::RuntimeConfig;
    use crate::context::Outbox;
    use crate::message::{Address, ComponentId};

    const HOST: Address = Address::client(0);

    struct Rig {
        mixer: Component<Mixer>,
        scratch: Vec<u8>,
    }

    impl Rig {
        fn new(tracks: u8) -> Self {
            let mixer = Component::create(
                ComponentId::new(0, 3),
                Adapter::typed(PcmSum::default()),
                MixerConfig::default().with_tracks(tracks),
                &RuntimeConfig::default(),
            )
            .unwrap();
            let mut rig = Self {
                mixer,
                scratch: vec![0; 1024],
            };
            // 2 mono samples: 4 bytes a frame
            rig.send(Message::set_param(
                HOST,
                rig.port(0),
                &[(param::CHANNELS, 1), (param::FRAME_SAMPLES, 2)],
            ));
            rig
        }

        fn port(&self, p: u8) -> Address {
            self.mixer.id().port(p)
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
            self.mixer.dispatch(msg, &mut cx);
            outbox.messages
        }

        fn track_data(&mut self, track: u8, bytes: &[u8]) -> Vec<Message> {
            self.send(Message::empty_this_buffer(HOST, self.port(track), bytes.to_vec()))
        }

        fn host_buffers(&mut self, n: usize) {
            let out = self.port(self.mixer.inner().output_port());
            for _ in 0..n {
                self.send(Message::fill_this_buffer(HOST, out, 16));
            }
        }

        fn mixed(out: &[Message]) -> Vec<Vec<u8>> {
            out.iter()
                .filter(|m| m.opcode == Opcode::FillThisBuffer && m.format.is_none() && m.length > 0)
                .map(|m| m.payload().to_vec())
                .collect()
        }
    }

    #[test]
    fn track_not_yet_due_is_skipped() {
        let mut rig = Rig::new(2);
        rig.send(Message::set_param(HOST, rig.port(0), &[(param::TRACK_START + 1, 1)]));
        rig.host_buffers(3);
        rig.track_data(0, &[1, 0, 2, 0]);
        rig.track_data(1, &[5, 0, 6, 0]);
        rig.process();

        let out = rig.process();
        assert_eq!(Rig::mixed(&out), vec![vec![1, 0, 2, 0]]);
        let mixer = rig.mixer.inner();
        assert_eq!(mixer.track(0).unwrap().queued(), 0, "due track consumed");
        assert_eq!(mixer.track(1).unwrap().queued(), 1, "future track untouched");
        assert_eq!(mixer.clock(), 1);
    }

    #[test]
    fn waits_until_every_due_track_is_set_up() {
        let mut rig = Rig::new(2);
        rig.host_buffers(3);
        rig.track_data(0, &[1, 0, 1, 0]);
        rig.track_data(1, &[2, 0]);
        rig.process();

        for _ in 0..3 {
            let out = rig.process();
            assert!(Rig::mixed(&out).is_empty());
        }
        assert_eq!(rig.mixer.inner().clock(), 0);

        rig.track_data(1, &[3, 0]);
        let out = rig.process();
        assert_eq!(Rig::mixed(&out), vec![vec![3, 0, 4, 0]]);
    }

    #[test]
    fn eos_as_soon_as_no_track_is_active() {
        let mut rig = Rig::new(2);
        rig.host_buffers(3);
        rig.track_data(0, &[1, 0, 1, 0]);
        rig.track_data(0, &[]);
        rig.process();

        let out = rig.process();
        assert_eq!(Rig::mixed(&out).len(), 1);
        let retired = out.iter().find(|m| m.opcode == Opcode::EmptyThisBuffer && m.is_response());
        assert!(retired.is_some(), "track eos answered on retirement");

        let out = rig.process();
        assert_eq!(rig.mixer.lifecycle(), Lifecycle::Completed);
        assert!(out.iter().any(|m| m.opcode == Opcode::FillThisBuffer && m.length == 0));

        // track 1 never carried data
        let late = rig.track_data(1, &[]);
        assert_eq!(late.len(), 1);
        assert!(late[0].is_response() && late[0].is_eos());
        assert_eq!(rig.mixer.inner().track(1).unwrap().queued(), 0);
    }

    #[test]
    fn paused_track_does_not_block_others() {
        let mut rig = Rig::new(2);
        rig.host_buffers(3);
        rig.track_data(1, &[9, 0]);
        rig.send(Message::pause(HOST, rig.port(1)));
        rig.track_data(0, &[1, 0, 1, 0]);
        rig.process();
        let out = rig.process();
        assert_eq!(Rig::mixed(&out), vec![vec![1, 0, 1, 0]]);
        assert_eq!(rig.mixer.inner().track_pts(1), Some(0));
    }

    #[test]
    fn track_start_is_readable() {
        let mut rig = Rig::new(2);
        rig.send(Message::set_param(HOST, rig.port(0), &[(param::TRACK_START, 7)]));
        let out = rig.send(Message::get_param(HOST, rig.port(0), &[param::TRACK_START]));
        assert_eq!(crate::message::decode_params(out[0].payload()).unwrap(), vec![(param::TRACK_START, 7)]);
        let out = rig.send(Message::set_param(HOST, rig.port(0), &[(param::TRACK_START + 5, 1)]));
        assert!(!out[0].status.unwrap().is_ok());
    }
}
