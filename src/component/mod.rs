//! Components: the graph nodes hosted by a [`Runtime`](crate::Runtime).
//!
//! Every component is a [`Component<S>`]: a [`Base`] holding what all units
//! share (lifecycle, vendor adapter, memory, scheduling flag) and a
//! [`Specialization`] that owns the ports and decides how buffers meet the
//! vendor. The runtime sees them through [`AnyComponent`].
//!
//! A message is handled by [`Dispatch::dispatch`]. `None` is the scheduler
//! asking for one processing cycle: preprocess, one vendor call, postprocess.

use delegate::delegate;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{param, Adapter, ApiCmd, ApiValue, ExecPhase, InitPhase, MemType, MemoryTable};
use crate::capture::IrqSender;
use crate::config::RuntimeConfig;
use crate::context::{ProcessContext, Request, Urgency};
use crate::error::{Error, Result};
use crate::message::{
    decode_params, decode_params_ext, encode_params, encode_params_ext, ComponentId, Message, Opcode, RouteDesc,
    Status, StreamParams,
};
use crate::port::{InputEvent, InputPort, OutputEvent, OutputPort};

pub mod capturer;
pub mod codec;
pub mod mimo;
pub mod mixer;

pub use capturer::{AudioCapturer, CaptureSetup};
pub use codec::{AudioCodec, CodecStats};
pub use mimo::MimoProcessor;
pub use mixer::Mixer;

/// Where a component is in its life. Exactly one state holds at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Created; vendor defaults loaded, no memory claimed yet.
    Idle,
    /// Static configuration done, memory and ports allocated.
    PostInit,
    /// Deriving stream parameters with the vendor.
    RuntimeInit,
    Execution,
    /// Vendor reported end of stream; only draining remains.
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Codec,
    Mixer,
    Mimo,
    Capturer,
}

/// Answer of a preprocess hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Buffers are arranged; call the vendor.
    Ready,
    /// A port is not ready. Not an error: wait for the next put.
    NoData,
    /// Finish the stream without calling the vendor.
    Drain,
}

/// What the cycle that just ran did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cycle {
    RuntimeInit,
    Execute { done: bool },
}

/// State shared by every specialization.
#[derive(Debug)]
pub struct Base {
    id: ComponentId,
    lifecycle: Lifecycle,
    scheduled: bool,
    adapter: Adapter,
    memory: MemoryTable,
    stream: Option<StreamParams>,
    init_event: bool,
    port_depth: usize,
    scratch_limit: usize,
    unregister: Option<Message>,
}

impl Base {
    fn new(id: ComponentId, adapter: Adapter, config: &RuntimeConfig) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Idle,
            scheduled: false,
            adapter,
            memory: MemoryTable::default(),
            stream: None,
            init_event: false,
            port_depth: config.port_depth,
            scratch_limit: config.scratch_size,
            unregister: None,
        }
    }

    /// Size the vendor handle and load its defaults.
    fn pre_init(&mut self) -> Result<()> {
        let size = self.adapter.query(ApiCmd::GetApiSize, 0)? as usize;
        self.adapter.allocate_handle(size);
        self.adapter
            .call(ApiCmd::Init(InitPhase::PreConfigParams), 0, ApiValue::None)?;
        debug!(id = %self.id, size, "pre-init");
        Ok(())
    }

    /// Freeze static configuration and claim vendor memory. Returns whether
    /// this call did it.
    fn post_init(&mut self) -> Result<bool> {
        if self.lifecycle != Lifecycle::Idle {
            return Ok(false);
        }
        self.adapter
            .call(ApiCmd::Init(InitPhase::PostConfigParams), 0, ApiValue::None)?;
        self.memory = MemoryTable::allocate(&mut self.adapter, self.scratch_limit)?;
        self.lifecycle = Lifecycle::PostInit;
        debug!(
            id = %self.id,
            blocks = self.memory.blocks().len(),
            bytes = self.memory.allocated(),
            scratch = self.memory.scratch_size(),
            "post-init"
        );
        Ok(true)
    }

    fn enter_runtime_init(&mut self) -> Result<()> {
        self.memory.refresh(&mut self.adapter)?;
        self.lifecycle = Lifecycle::RuntimeInit;
        trace!(id = %self.id, "runtime-init");
        Ok(())
    }

    /// One vendor call for the current lifecycle state. Returns whether the
    /// vendor reported end of stream.
    fn step(&mut self, cx: &mut ProcessContext<'_>, direct: Option<&mut [u8]>) -> Result<bool> {
        match self.lifecycle {
            Lifecycle::RuntimeInit => {
                let io = self.memory.io(&mut *cx.scratch, direct);
                self.adapter
                    .call(ApiCmd::Init(InitPhase::Process), 0, ApiValue::Io(io))?;
                if self.adapter.query(ApiCmd::Init(InitPhase::DoneQuery), 0)? != 0 {
                    self.finish_runtime_init()?;
                }
                Ok(false)
            }
            Lifecycle::Execution => {
                let io = self.memory.io(&mut *cx.scratch, direct);
                self.adapter
                    .call(ApiCmd::Execute(ExecPhase::Execute), 0, ApiValue::Io(io))?;
                let done = self.adapter.query(ApiCmd::Execute(ExecPhase::DoneQuery), 0)? != 0;
                if done {
                    self.complete();
                }
                Ok(done)
            }
            _ => Ok(false),
        }
    }

    /// Read the stream the vendor settled on. A fatal code or a zero value
    /// leaves the component in runtime-init.
    fn finish_runtime_init(&mut self) -> Result<()> {
        self.memory.refresh(&mut self.adapter)?;
        let length = self.memory.block(MemType::Output, 0).map_or(0, |b| b.size);
        let stream = StreamParams {
            sample_rate: self.stream_param(param::SAMPLE_RATE, "vendor reported no sample rate")?,
            channels: self.stream_param(param::CHANNELS, "vendor reported no channels")?,
            pcm_width: self.stream_param(param::PCM_WIDTH, "vendor reported no sample width")?,
            length: length as u32,
        };
        self.stream = Some(stream);
        self.lifecycle = Lifecycle::Execution;
        self.init_event = true;
        debug!(id = %self.id, ?stream, "runtime-init done");
        Ok(())
    }

    fn stream_param(&mut self, id: u32, missing: &'static str) -> Result<u32> {
        match self.adapter.get_config(id)? {
            0 => Err(Error::InvalidState(missing)),
            v => Ok(v),
        }
    }

    fn complete(&mut self) {
        self.lifecycle = Lifecycle::Completed;
        info!(id = %self.id, "stream complete");
    }

    fn take_init_event(&mut self) -> bool {
        core::mem::take(&mut self.init_event)
    }

    /// Start over for a new stream: the next cycle re-runs runtime-init.
    pub fn reset_stream(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Idle {
            return Ok(());
        }
        self.adapter
            .call(ApiCmd::Init(InitPhase::PostConfigParams), 0, ApiValue::None)?;
        self.lifecycle = Lifecycle::PostInit;
        self.stream = None;
        self.init_event = false;
        debug!(id = %self.id, "stream reset");
        Ok(())
    }

    /// Take the upstream format as configuration. Only possible before the
    /// vendor has fixed its format.
    pub fn apply_format(&mut self, params: StreamParams) -> Result<()> {
        if !matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::PostInit) {
            debug!(id = %self.id, ?params, lifecycle = ?self.lifecycle, "format ignored");
            return Ok(());
        }
        self.adapter.set_config(param::SAMPLE_RATE, params.sample_rate)?;
        self.adapter.set_config(param::CHANNELS, params.channels)?;
        self.adapter.set_config(param::PCM_WIDTH, params.pcm_width)?;
        trace!(id = %self.id, ?params, "format applied");
        Ok(())
    }

    /// Ask for a processing cycle. A no-op while already scheduled or while
    /// unregistering.
    pub fn schedule(&mut self, cx: &mut ProcessContext<'_>, urgency: Urgency) {
        if self.unregister.is_some() || self.scheduled {
            return;
        }
        self.scheduled = true;
        cx.schedule(urgency);
    }

    /// Drop any pending run of this component.
    pub fn cancel(&mut self, cx: &mut ProcessContext<'_>) {
        self.scheduled = false;
        cx.cancel();
    }

    fn release(&mut self) {
        self.memory.release();
        self.adapter.release();
        self.stream = None;
        self.lifecycle = Lifecycle::Idle;
    }

    /// Core and instance this component was registered under.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Format fixed by runtime-init. `None` before execution starts and again
    /// after a reset.
    pub fn stream(&self) -> Option<StreamParams> {
        self.stream
    }

    /// A run is pending with the scheduler.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// An unregister command waits for the ports to drain.
    pub fn is_unregistering(&self) -> bool {
        self.unregister.is_some()
    }

    /// Queue depth every port of this component gets.
    pub fn port_depth(&self) -> usize {
        self.port_depth
    }

    /// The vendor behind this component.
    pub fn adapter_mut(&mut self) -> &mut Adapter {
        &mut self.adapter
    }

    /// Blocks the vendor asked for, sized after post-init.
    pub fn memory(&self) -> &MemoryTable {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryTable {
        &mut self.memory
    }

    /// Size of the `n`th block of `kind`, 0 if the vendor asked for none.
    pub fn block_size(&self, kind: MemType, n: usize) -> usize {
        self.memory.block(kind, n).map_or(0, |b| b.size)
    }
}

/// The per-unit half of a component.
///
/// Command hooks answer through the [`Request`] slot: take the message to keep
/// it (queued on a port, parked until an echo), leave it to have the
/// dispatcher respond with the hook's result.
pub trait Specialization: Send + Sized + 'static {
    type Config;

    /// Build ports and preset vendor configuration. Runs right after pre-init.
    fn new(config: Self::Config, base: &mut Base) -> Result<Self>;

    fn comp_type(&self) -> ComponentType;

    fn wrap(component: Component<Self>) -> AnyComponent;

    /// Memory is allocated; size ports from it.
    fn post_init(&mut self, base: &mut Base) -> Result<()>;

    /// Arrange buffers for the next vendor call.
    fn preprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<Readiness>;

    /// Reconcile what the vendor consumed and produced with the ports.
    fn postprocess(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>, cycle: Cycle) -> Result<()>;

    /// Runtime-init finished and `base.stream()` is known.
    fn runtime_ready(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>) -> Result<()>;

    /// A port buffer the vendor reads directly instead of its input block.
    fn direct_input(&mut self) -> Option<&mut [u8]> {
        None
    }

    /// Component-level parameter. `None` passes it to the vendor.
    fn set_param(&mut self, _base: &mut Base, _id: u32, _value: u32) -> Option<Result<()>> {
        None
    }

    fn get_param(&self, _base: &Base, _id: u32) -> Option<Result<u32>> {
        None
    }

    fn route(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::Route))
    }

    fn unroute(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::Unroute))
    }

    fn empty_this_buffer(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::EmptyThisBuffer))
    }

    fn fill_this_buffer(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::FillThisBuffer))
    }

    fn flush(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::Flush))
    }

    fn pause(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::Pause))
    }

    fn resume(&mut self, _base: &mut Base, _req: &mut Request, _cx: &mut ProcessContext<'_>) -> Result<()> {
        Err(Error::UnsupportedOpcode(Opcode::Resume))
    }

    /// A buffer or control message this component sent came back.
    fn returned(&mut self, base: &mut Base, msg: Message, cx: &mut ProcessContext<'_>) -> Result<()>;

    /// First teardown stage: stop producing and flush every port.
    fn shutdown(&mut self, base: &mut Base, cx: &mut ProcessContext<'_>);

    /// Nothing this component owns is still held by a peer.
    fn drained(&self) -> bool;

    /// Second teardown stage: give back whatever is still queued.
    fn release(&mut self, cx: &mut ProcessContext<'_>);

    fn wants_interrupt(&self) -> bool {
        false
    }

    fn attach_interrupt(&mut self, _irq: IrqSender) {}
}

/// A graph node: shared base plus its specialization.
#[derive(Debug)]
pub struct Component<S> {
    base: Base,
    inner: S,
    retired: bool,
}

impl<S: Specialization> Component<S> {
    /// Construct and pre-init. The vendor is asked for its handle size and
    /// loads its defaults; memory is claimed later, at post-init.
    pub fn create(id: ComponentId, adapter: Adapter, config: S::Config, runtime: &RuntimeConfig) -> Result<Self> {
        let mut base = Base::new(id, adapter, runtime);
        base.pre_init()?;
        let inner = S::new(config, &mut base)?;
        Ok(Self {
            base,
            inner,
            retired: false,
        })
    }

    delegate! {
        to self.base {
            pub fn lifecycle(&self) -> Lifecycle;
            pub fn stream(&self) -> Option<StreamParams>;
            pub fn is_scheduled(&self) -> bool;
            pub fn is_unregistering(&self) -> bool;
            pub fn memory(&self) -> &MemoryTable;
        }
    }

    /// State shared by every component type.
    pub fn base(&self) -> &Base {
        &self.base
    }

    /// The type-specific half.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Whether the specialization is driven by an interrupt line.
    pub fn wants_interrupt(&self) -> bool {
        self.inner.wants_interrupt()
    }

    /// Hand the specialization its interrupt line. The runtime does this once,
    /// right after creation.
    pub fn attach_interrupt(&mut self, irq: IrqSender) {
        self.inner.attach_interrupt(irq);
    }

    fn ensure_post_init(&mut self) -> Result<()> {
        if self.base.post_init()? {
            self.inner.post_init(&mut self.base)?;
        }
        Ok(())
    }

    fn handle(&mut self, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        let msg = req.message()?;
        let opcode = msg.opcode;
        if msg.is_response() {
            let msg = req.take()?;
            if opcode.carries_buffer() {
                return self.inner.returned(&mut self.base, msg, cx);
            }
            trace!(id = %self.base.id, ?msg, "response dropped");
            return Ok(());
        }
        if self.base.is_unregistering() && opcode != Opcode::Unregister {
            return Err(Error::InvalidState("component is unregistering"));
        }

        match opcode {
            Opcode::SetParam => {
                self.set_params(req)?;
                self.ensure_post_init()
            }
            Opcode::SetParamExt => {
                for (id, mut value) in decode_params_ext(req.message()?.payload())? {
                    self.base
                        .adapter
                        .call(ApiCmd::SetConfigParam, id, ApiValue::Bytes(value.as_mut_slice()))?;
                }
                self.ensure_post_init()
            }
            Opcode::GetParam => self.get_params(req),
            Opcode::GetParamExt => {
                let msg = req.message_mut()?;
                let mut records = decode_params_ext(msg.payload())?;
                for (id, value) in records.iter_mut() {
                    self.base
                        .adapter
                        .call(ApiCmd::GetConfigParam, *id, ApiValue::Bytes(value.as_mut_slice()))?;
                }
                let refs: Vec<(u32, &[u8])> = records.iter().map(|(id, v)| (*id, v.as_slice())).collect();
                msg.buffer = encode_params_ext(&refs);
                msg.length = msg.buffer.len();
                Ok(())
            }
            Opcode::Route => {
                self.ensure_post_init()?;
                self.inner.route(&mut self.base, req, cx)
            }
            Opcode::Unroute => self.inner.unroute(&mut self.base, req, cx),
            Opcode::EmptyThisBuffer => {
                self.ensure_post_init()?;
                self.inner.empty_this_buffer(&mut self.base, req, cx)
            }
            Opcode::FillThisBuffer => {
                self.ensure_post_init()?;
                self.inner.fill_this_buffer(&mut self.base, req, cx)
            }
            Opcode::Flush => self.inner.flush(&mut self.base, req, cx),
            Opcode::Pause => self.inner.pause(&mut self.base, req, cx),
            Opcode::Resume => self.inner.resume(&mut self.base, req, cx),
            Opcode::Unregister => self.unregister(req, cx),
        }
    }

    fn set_params(&mut self, req: &mut Request) -> Result<()> {
        for (id, value) in decode_params(req.message()?.payload())? {
            match self.inner.set_param(&mut self.base, id, value) {
                Some(result) => result?,
                None => self.base.adapter.set_config(id, value)?,
            }
            trace!(id = %self.base.id, param = id, value, "set param");
        }
        Ok(())
    }

    fn get_params(&mut self, req: &mut Request) -> Result<()> {
        let msg = req.message_mut()?;
        let mut pairs = decode_params(msg.payload())?;
        for (id, value) in pairs.iter_mut() {
            *value = match self.inner.get_param(&self.base, *id) {
                Some(result) => result?,
                None => self.base.adapter.get_config(*id)?,
            };
        }
        msg.buffer = encode_params(&pairs);
        msg.length = msg.buffer.len();
        Ok(())
    }

    /// First stage of teardown. The request is answered once every port has
    /// drained.
    fn unregister(&mut self, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<()> {
        if self.base.is_unregistering() {
            return Err(Error::InvalidState("unregister already in progress"));
        }
        info!(id = %self.base.id, "unregistering");
        self.base.cancel(cx);
        self.inner.shutdown(&mut self.base, cx);
        self.base.unregister = Some(req.take()?);
        Ok(())
    }

    /// Second stage of teardown, once nothing is held by a peer.
    fn try_retire(&mut self, cx: &mut ProcessContext<'_>) {
        if self.retired || !self.base.is_unregistering() || !self.inner.drained() {
            return;
        }
        self.inner.release(cx);
        self.base.release();
        if let Some(msg) = self.base.unregister.take() {
            cx.respond(msg, Status::Ok);
        }
        self.retired = true;
        info!(id = %self.base.id, "retired");
    }

    /// One processing cycle.
    fn process(&mut self, cx: &mut ProcessContext<'_>) -> Result<()> {
        self.base.scheduled = false;
        if self.base.is_unregistering() {
            return Ok(());
        }
        match self.base.lifecycle {
            Lifecycle::Idle | Lifecycle::Completed => return Ok(()),
            Lifecycle::PostInit => self.base.enter_runtime_init()?,
            Lifecycle::RuntimeInit | Lifecycle::Execution => {}
        }

        let cycle = match self.inner.preprocess(&mut self.base, cx)? {
            Readiness::NoData => {
                trace!(id = %self.base.id, "no data");
                return Ok(());
            }
            Readiness::Drain => {
                self.base.complete();
                Cycle::Execute { done: true }
            }
            Readiness::Ready => {
                let init = self.base.lifecycle == Lifecycle::RuntimeInit;
                let done = self.base.step(cx, self.inner.direct_input())?;
                if init {
                    Cycle::RuntimeInit
                } else {
                    Cycle::Execute { done }
                }
            }
        };

        if self.base.take_init_event() {
            self.inner.runtime_ready(&mut self.base, cx)?;
            self.base.schedule(cx, Urgency::Now);
        }
        self.inner.postprocess(&mut self.base, cx, cycle)
    }
}

/// What the runtime needs from any component.
#[enum_delegate::register]
pub trait Dispatch {
    fn id(&self) -> ComponentId;

    fn comp_type(&self) -> ComponentType;

    fn current_lifecycle(&self) -> Lifecycle;

    /// Handle a message, or run one cycle when `msg` is `None`.
    fn dispatch(&mut self, msg: Option<Message>, cx: &mut ProcessContext<'_>);

    /// Interrupt or host kick: ask for a cycle.
    fn wake(&mut self, cx: &mut ProcessContext<'_>);

    /// Teardown finished; the runtime may drop this component.
    fn retired(&self) -> bool;
}

impl<S: Specialization> Dispatch for Component<S> {
    fn id(&self) -> ComponentId {
        self.base.id
    }

    fn comp_type(&self) -> ComponentType {
        self.inner.comp_type()
    }

    fn current_lifecycle(&self) -> Lifecycle {
        self.base.lifecycle
    }

    fn dispatch(&mut self, msg: Option<Message>, cx: &mut ProcessContext<'_>) {
        match msg {
            None => {
                if let Err(err) = self.process(cx) {
                    error!(id = %self.base.id, %err, code = %err.code(), "processing failed");
                }
            }
            Some(msg) => {
                let opcode = msg.opcode;
                let response = msg.is_response();
                let mut req = Request::new(msg);
                let result = self.handle(&mut req, cx);
                match (result, req.into_inner()) {
                    (Ok(()), Some(msg)) if !response => cx.respond(msg, Status::Ok),
                    (Ok(()), _) => {}
                    (Err(err), Some(msg)) if !response => {
                        warn!(id = %self.base.id, ?opcode, %err, "command failed");
                        cx.respond(msg, Status::from(&err));
                    }
                    (Err(err), _) => {
                        error!(id = %self.base.id, ?opcode, %err, code = %err.code(), "command failed");
                    }
                }
            }
        }
        self.try_retire(cx);
    }

    fn wake(&mut self, cx: &mut ProcessContext<'_>) {
        self.base.schedule(cx, Urgency::Now);
    }

    fn retired(&self) -> bool {
        self.retired
    }
}

/// Every component kind behind one type.
#[enum_delegate::implement(Dispatch)]
#[derive(Debug)]
pub enum AnyComponent {
    Codec(Component<AudioCodec>),
    Mixer(Component<Mixer>),
    Mimo(Component<MimoProcessor>),
    Capturer(Component<AudioCapturer>),
}

/// Typed views used by the runtime's accessors. Each returns `None` for
/// any other component type.
impl AnyComponent {
    pub fn as_codec(&self) -> Option<&Component<AudioCodec>> {
        match self {
            AnyComponent::Codec(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_mixer(&self) -> Option<&Component<Mixer>> {
        match self {
            AnyComponent::Mixer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_mimo(&self) -> Option<&Component<MimoProcessor>> {
        match self {
            AnyComponent::Mimo(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_capturer(&self) -> Option<&Component<AudioCapturer>> {
        match self {
            AnyComponent::Capturer(c) => Some(c),
            _ => None,
        }
    }
}

/// Put a data message on `port`.
///
/// A format message is applied to the vendor and answered at once, as is a
/// duplicate end of stream. Once the stream is complete every end of stream
/// is a duplicate, even on a port that never carried data. Returns whether
/// the port became ready.
pub(crate) fn receive(
    base: &mut Base,
    port: &mut InputPort,
    msg: Message,
    cx: &mut ProcessContext<'_>,
) -> Result<bool> {
    if msg.is_eos() && base.lifecycle() == Lifecycle::Completed {
        debug!(id = %base.id, port = %port.addr(), "end of stream after completion");
        cx.respond(msg, Status::Ok);
        return Ok(false);
    }
    match port.put(msg, cx)? {
        InputEvent::Format(msg) => {
            let result = match msg.format {
                Some(params) => base.apply_format(params),
                None => Ok(()),
            };
            cx.respond_with(msg, &result);
            Ok(false)
        }
        InputEvent::Duplicate(msg) => {
            cx.respond(msg, Status::Ok);
            Ok(false)
        }
        InputEvent::Queued { ready } => Ok(ready),
    }
}

/// Route `port` as the request describes and announce the stream, if known.
pub(crate) fn route_output(
    base: &Base,
    port: &mut OutputPort,
    req: &Request,
    cx: &mut ProcessContext<'_>,
) -> Result<()> {
    let desc = RouteDesc::decode(req.message()?.payload())?;
    port.route(&desc, port.length())?;
    if let Some(stream) = base.stream() {
        announce(port, stream, cx);
    }
    Ok(())
}

/// Take a host FILL_THIS_BUFFER onto `port`. Returns whether the port
/// became ready.
pub(crate) fn host_buffer(port: &mut OutputPort, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<bool> {
    port.accepts_host_buffer(req.message()?)?;
    let msg = req.take()?;
    Ok(matches!(port.put(msg, cx), OutputEvent::Buffer { ready: true }))
}

/// Size `port` for the stream and send it the handshake.
pub(crate) fn announce(port: &mut OutputPort, stream: StreamParams, cx: &mut ProcessContext<'_>) {
    port.set_length(stream.length as usize);
    let params = StreamParams {
        length: port.length() as u32,
        ..stream
    };
    port.send_format(params, cx);
}

/// Drop the first `n` bytes of `block[..*filled]`, keeping the rest at the front.
pub(crate) fn shift(block: &mut [u8], filled: &mut usize, n: usize) {
    let n = n.min(*filled);
    block.copy_within(n..*filled, 0);
    *filled -= n;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::PcmCopy;
    use crate::config::CodecConfig;
    use crate::context::Outbox;
    use crate::message::Address;

    const HOST: Address = Address::client(0);

    fn codec() -> Component<AudioCodec> {
        let id = ComponentId::new(0, 1);
        Component::create(id, Adapter::typed(PcmCopy::default()), CodecConfig::default(), &RuntimeConfig::default())
            .unwrap()
    }

    fn run(c: &mut Component<AudioCodec>, msg: Option<Message>) -> Vec<Message> {
        let mut scratch = vec![0u8; 1024];
        let mut outbox = Outbox::default();
        let mut cx = ProcessContext::new(0, &mut scratch, &mut outbox);
        c.dispatch(msg, &mut cx);
        outbox.messages
    }

    #[test]
    fn first_set_param_runs_post_init() {
        let mut c = codec();
        assert_eq!(c.lifecycle(), Lifecycle::Idle);
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::set_param(HOST, addr, &[(param::CHANNELS, 1)])));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, Some(Status::Ok));
        assert_eq!(c.lifecycle(), Lifecycle::PostInit);
        assert!(c.memory().allocated() > 0);
    }

    #[test]
    fn rejected_param_keeps_prior_state() {
        let mut c = codec();
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::set_param(HOST, addr, &[(param::CHANNELS, 0)])));
        assert_eq!(out[0].status.map(Status::code), Some(crate::error::ReturnCode::CONFIG_INVALID_PARAM));
        assert_eq!(c.lifecycle(), Lifecycle::Idle);
    }

    #[test]
    fn get_param_fills_values() {
        let mut c = codec();
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::get_param(HOST, addr, &[param::SAMPLE_RATE])));
        assert_eq!(decode_params(out[0].payload()).unwrap(), vec![(param::SAMPLE_RATE, 48_000)]);
    }

    #[test]
    fn extended_params_go_through_bytes() {
        let mut c = codec();
        let rate = 16_000u32.to_le_bytes();
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::set_param_ext(HOST, addr, &[(param::SAMPLE_RATE, &rate[..])])));
        assert_eq!(out[0].status, Some(Status::Ok));
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::get_param_ext(HOST, addr, &[(param::SAMPLE_RATE, 4)])));
        let records = decode_params_ext(out[0].payload()).unwrap();
        assert_eq!(records, vec![(param::SAMPLE_RATE, rate.to_vec())]);
    }

    #[test]
    fn null_message_on_idle_component_does_nothing() {
        let mut c = codec();
        assert!(run(&mut c, None).is_empty());
        assert_eq!(c.lifecycle(), Lifecycle::Idle);
    }

    #[test]
    fn responses_to_requests_are_never_answered() {
        let mut c = codec();
        let resp = Message::pause(c.id().port(0), HOST).into_response(Status::Ok);
        assert!(run(&mut c, Some(resp)).is_empty());
    }

    #[test]
    fn unregister_of_idle_component_retires_at_once() {
        let mut c = codec();
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::unregister(HOST, addr)));
        assert!(c.retired());
        assert_eq!(out.last().map(|m| m.opcode), Some(Opcode::Unregister));
        assert_eq!(out.last().and_then(|m| m.status), Some(Status::Ok));
    }

    #[test]
    fn commands_after_unregister_are_refused() {
        let mut c = codec();
        let route = Message::route(HOST, c.id().port(1), RouteDesc::new(Address::new(0, 2, 0), 1));
        run(&mut c, Some(route));
        // a buffer is out, so teardown waits
        let data = Message::empty_this_buffer(HOST, c.id().port(0), vec![1; 8]);
        run(&mut c, Some(data));
        run(&mut c, None);
        run(&mut c, None);
        let addr = c.id().port(0);
        run(&mut c, Some(Message::unregister(HOST, addr)));
        assert!(!c.retired());
        let addr = c.id().port(0);
        let out = run(&mut c, Some(Message::pause(HOST, addr)));
        assert!(!out[0].status.unwrap().is_ok());
    }
}
