//! Audio capturer: a source fed by a hardware capture driver.
//!
//! The driver's callback writes samples into a lock-free ring and raises the
//! component's interrupt line. Each cycle moves one frame from the ring into
//! the vendor's output block and sends it on port 0.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, trace, warn};

use super::{
    announce, host_buffer, route_output, AnyComponent, Base, Component, ComponentType, Cycle, Lifecycle, Readiness,
    Specialization,
};
use crate::adapter::{ApiCmd, MemType};
use crate::capture::{CaptureCallback, CaptureDriver, CaptureShared, IrqSender};
use crate::config::CaptureConfig;
use crate::context::{ProcessContext, Request, Urgency};
use crate::error::{Error, Result};
use crate::message::{Message, Opcode, Status};
use crate::port::{FlushStart, OutputEvent, OutputPort};

pub const OUTPUT: u8 = 0;

/// What a capturer is created from.
pub struct CaptureSetup {
    pub config: CaptureConfig,
    pub driver: Box<dyn CaptureDriver>,
}

impl CaptureSetup {
    pub fn new(driver: impl CaptureDriver + 'static) -> Self {
        Self {
            config: CaptureConfig::default(),
            driver: Box::new(driver),
        }
    }

    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for CaptureSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSetup").field("config", &self.config).finish_non_exhaustive()
    }
}

pub struct AudioCapturer {
    config: CaptureConfig,
    output: OutputPort,
    driver: Box<dyn CaptureDriver>,
    ring: Consumer<u8>,
    /// Writing half of the ring until the driver is started with it.
    producer: Option<Producer<u8>>,
    irq: Option<IrqSender>,
    shared: Arc<CaptureShared>,
    started: bool,
    frames: u64,
    overruns: u32,
    flush_waiters: Vec<Message>,
}

impl fmt::Debug for AudioCapturer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioCapturer")
            .field("config", &self.config)
            .field("output", &self.output)
            .field("buffered", &self.ring.slots())
            .field("started", &self.started)
            .field("frames", &self.frames)
            .field("overruns", &self.overruns)
            .finish_non_exhaustive()
    }
}

impl AudioCapturer {
    pub fn output(&self) -> &OutputPort {
        &self.output
    }

    /// Captured bytes not yet sent.
    pub fn buffered(&self) -> usize {
        self.ring.slots()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Frames sent so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Times the ring was found overflowed.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    pub fn shared(&self) -> &Arc<CaptureShared> {
        &self.shared
    }

    fn start(&mut self, base: &Base) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let irq = self
            .irq
            .take()
            .ok_or(Error::InvalidState("capturer has no interrupt line"))?;
        let producer = self
            .producer
            .take()
            .ok_or(Error::InvalidState("capture ring already handed out"))?;
        self.shared.running.store(true, Ordering::Release);
        self.driver
            .start(CaptureCallback::new(producer, Arc::clone(&self.shared), irq))?;
        self.started = true;
        info!(id = %base.id(), ring = self.config.ring_bytes, "capture started");
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if self.started {
            self.driver.stop();
        }
    }

    fn frame(base: &Base) -> usize {
        base.block_size(MemType::Output, 0)
    }
}

impl Specialization for AudioCapturer {
    type Config = CaptureSetup;

    fn new(setup: CaptureSetup, base: &mut Base) -> Result<Self> {
        if setup.config.ring_bytes == 0 {
            return Err(Error::Malformed("capture ring size"));
        }
        let (producer, ring) = RingBuffer::new(setup.config.ring_bytes);
        Ok(Self {
            config: setup.config,
            output: OutputPort::new(base.id().port(OUTPUT), base.port_depth(), 0),
            driver: setup.driver,
            ring,
            producer: Some(producer),
            irq: None,
            shared: Arc::new(CaptureShared::default()),
            started: false,
            frames: 0,
            overruns: 0,
            flush_waiters: Vec::new(),
        })
    }

    fn comp_type(&self) -> ComponentType {
        ComponentType::Capturer
    }

    fn wrap(component: Component<Self>) -> AnyComponent {
        AnyComponent::Capturer(component)
    }

    fn post_init(&mut self, base: &mut Base) -> Result<()> {
        self.output.set_length(Self::frame(base));
        Ok(())
    }

    fn preprocess(&mut self, base: &mut Base, _cx: &mut ProcessContext<'_>) -> Result<Readiness> {
        match base.lifecycle() {
            Lifecycle::RuntimeInit => Ok(Readiness::Ready),
            Lifecycle::Execution => {
                self.shared.pending.store(false, Ordering::Release);
                if self.shared.overflow.swap(false, Ordering::AcqRel) {
                    self.overruns += 1;
                    warn!(id = %base.id(), overruns = self.overruns, "capture ring overflowed, samples lost");
                }
                let frame = Self::frame(base);
                if frame == 0 || !self.output.has_buffer() || self.ring.slots() < frame {
                    return Ok(Readiness::NoData);
                }
                let block = base
                    .memory_mut()
                    .block_mut(MemType::Output, 0)
                    .ok_or(Error::InvalidState("vendor has no output block"))?;
                let chunk = self
                    .ring
                    .read_chunk(frame)
                    .map_err(|_| Error::InvalidState("capture ring underrun"))?;
                let (first, second) = chunk.as_slices();
                block.data[..first.len()].copy_from_slice(first);
                block.data[first.len()..frame].copy_from_slice(second);
                chunk.commit_all();
                self.output.mark_setup();
                Ok(Readiness::Ready)
            }
            _ => Ok(Readiness::NoData),
        }
    }

    fn postprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>, cycle: Cycle) -> Result<()> {
        let Cycle::Execute { done } = cycle else {
            return Ok(());
        };
        let produced = base.adapter_mut().query(ApiCmd::GetOutputBytes, 0)? as usize;
        let block = base
            .memory()
            .block(MemType::Output, 0)
            .ok_or(Error::InvalidState("vendor has no output block"))?;
        let n = produced.min(block.data.len());
        if n > 0 {
            self.output.produce_from(&block.data[..n], cx)?;
            self.frames += 1;
        }
        trace!(id = %base.id(), frames = self.frames, buffered = self.ring.slots(), "captured frame out");

        if done {
            info!(id = %base.id(), frames = self.frames, "capture complete");
            self.stop();
            if self.output.flush(Opcode::EmptyThisBuffer, cx) == FlushStart::Done {
                self.output.complete_all(cx);
            }
        } else if self.ring.slots() >= Self::frame(base) {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn runtime_ready(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<()> {
        self.start(base)?;
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
        base.schedule(cx, Urgency::Now);
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

    fn flush(&mut self, _base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != OUTPUT {
            return Err(Error::InvalidPort(port));
        }
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

    /// Stops accepting samples; whatever the driver delivers meanwhile is
    /// dropped.
    fn pause(&mut self, base: &mut Base, req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != OUTPUT {
            return Err(Error::InvalidPort(port));
        }
        self.output.pause();
        self.shared.running.store(false, Ordering::Release);
        debug!(id = %base.id(), "capture paused");
        Ok(())
    }

    fn resume(&mut self, base: &mut Base, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let port = req.message()?.dst.port;
        if port != OUTPUT {
            return Err(Error::InvalidPort(port));
        }
        if self.started && base.lifecycle() == Lifecycle::Execution {
            self.shared.running.store(true, Ordering::Release);
        }
        if self.output.resume() {
            base.schedule(cx, Urgency::Now);
        }
        Ok(())
    }

    fn returned(&mut self, base: &mut Base, msg: Message, cx: &mut ProcessContext<'_>) -> Result<()> {
        if msg.dst.port != OUTPUT {
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
        self.stop();
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

    fn wants_interrupt(&self) -> bool {
        true
    }

    fn attach_interrupt(&mut self, irq: IrqSender) {
        self.irq = Some(irq);
    }
}
