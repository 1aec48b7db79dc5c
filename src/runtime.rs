//! The per-core runtime: owns components and drives them.

use std::collections::VecDeque;

use hashbrown::HashMap;
use tracing::{debug, info, trace, warn};

use crate::adapter::Adapter;
use crate::capture::{interrupt_line, IrqReceiver};
use crate::component::{
    AnyComponent, AudioCapturer, AudioCodec, Component, Dispatch, Lifecycle, MimoProcessor, Mixer, Specialization,
};
use crate::config::RuntimeConfig;
use crate::context::{Outbox, ProcessContext};
use crate::error::{Error, Result};
use crate::graph::Topology;
use crate::message::{Address, ComponentId, Message, Opcode, RouteDesc, Status};
use crate::scheduler::Scheduler;

/// Hosts the components of one core and runs them to completion, one call at
/// a time.
///
/// The host talks to components only through messages: [`send`](Self::send)
/// queues a command, [`recv`](Self::recv) picks up responses and buffers
/// addressed to the host. Nothing runs until the loop is driven with
/// [`run_once`](Self::run_once) or [`run_until_idle`](Self::run_until_idle).
///
/// # Example
///
/// ```
/// use dspflow::{adapter::param, codecs::PcmCopy, Adapter, AudioCodec, CodecConfig, Message, Runtime, RuntimeConfig};
///
/// let mut rt = Runtime::new(RuntimeConfig::default());
/// let codec = rt.create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default()).unwrap();
///
/// rt.send(Message::set_param(rt.client(), codec.port(0), &[(param::CHANNELS, 1)]));
/// rt.run_until_idle();
///
/// let response = rt.recv().unwrap();
/// assert!(response.status.unwrap().is_ok());
/// ```
///
/// # Scheduling
///
/// A component asks for processing through its context; the runtime keeps
/// at most one pending entry per component. Each [`run_once`](Self::run_once)
/// first turns raised capture interrupts into schedule requests, then
/// delivers one queued message, and otherwise runs one due component.
pub struct Runtime {
    config: RuntimeConfig,
    components: HashMap<ComponentId, AnyComponent>,
    topology: Topology,
    inbox: VecDeque<Message>,
    client: VecDeque<Message>,
    scheduler: Scheduler,
    irqs: Vec<IrqReceiver>,
    scratch: Vec<u8>,
    outbox: Outbox,
    clock: u64,
    next_instance: u16,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            scratch: vec![0; config.scratch_size],
            config,
            components: HashMap::new(),
            topology: Topology::new(),
            inbox: VecDeque::new(),
            client: VecDeque::new(),
            scheduler: Scheduler::new(),
            irqs: Vec::new(),
            outbox: Outbox::default(),
            clock: 0,
            next_instance: 1,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Host endpoint of this core. Responses to host commands arrive here.
    pub fn client(&self) -> Address {
        Address::client(self.config.core)
    }

    /// Construct and pre-init a component of kind `S`.
    ///
    /// The component stays idle until its first SET_PARAM (or first data)
    /// triggers post-init.
    pub fn create<S: Specialization>(&mut self, adapter: Adapter, config: S::Config) -> Result<ComponentId> {
        let id = self.allocate_id()?;
        let mut component = Component::<S>::create(id, adapter, config, &self.config)?;
        if component.wants_interrupt() {
            let (irq, line) = interrupt_line(id, self.config.irq_capacity);
            component.attach_interrupt(irq);
            self.irqs.push(line);
        }
        let component = S::wrap(component);
        info!(%id, kind = ?component.comp_type(), "component created");
        self.components.insert(id, component);
        self.topology.add_node(id);
        Ok(id)
    }

    fn allocate_id(&mut self) -> Result<ComponentId> {
        for _ in 0..u16::MAX {
            let instance = self.next_instance;
            self.next_instance = self.next_instance.checked_add(1).unwrap_or(1);
            let id = ComponentId::new(self.config.core, instance);
            if !self.components.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::InvalidState("no free component instance"))
    }

    /// Queue a message for delivery.
    pub fn send(&mut self, msg: Message) {
        trace!(?msg, "host send");
        self.inbox.push_back(msg);
    }

    /// Next message addressed to the host.
    pub fn recv(&mut self) -> Option<Message> {
        self.client.pop_front()
    }

    /// Every message addressed to the host so far.
    pub fn drain_client(&mut self) -> Vec<Message> {
        self.client.drain(..).collect()
    }

    /// Set parameters on a component.
    pub fn set_params(&mut self, id: ComponentId, pairs: &[(u32, u32)]) {
        self.send(Message::set_param(self.client(), id.port(0), pairs));
    }

    /// Connect output `from` to input `to` with a pool of `buffers`.
    pub fn route(&mut self, from: Address, to: Address, buffers: u32) {
        self.send(Message::route(self.client(), from, RouteDesc::new(to, buffers)));
    }

    pub fn unroute(&mut self, from: Address) {
        self.send(Message::unroute(self.client(), from));
    }

    pub fn unregister(&mut self, id: ComponentId) {
        self.send(Message::unregister(self.client(), id.port(0)));
    }

    /// Ask `id` for a processing cycle, as an interrupt would.
    pub fn wake(&mut self, id: ComponentId) -> Result<()> {
        let component = self.components.get_mut(&id).ok_or(Error::UnknownComponent(id))?;
        self.outbox.clear();
        let mut cx = ProcessContext::new(self.config.core, &mut self.scratch, &mut self.outbox);
        component.wake(&mut cx);
        self.apply(id, false);
        Ok(())
    }

    /// Move the scheduler clock forward.
    pub fn advance(&mut self, ticks: u64) {
        self.clock = self.clock.saturating_add(ticks);
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// One step of the loop. Returns whether anything happened.
    pub fn run_once(&mut self) -> bool {
        let raised: Vec<ComponentId> = self
            .irqs
            .iter_mut()
            .flat_map(|line| core::iter::from_fn(move || line.pop()))
            .collect();
        let mut worked = !raised.is_empty();
        for id in raised {
            trace!(%id, "interrupt");
            if let Err(err) = self.wake(id) {
                debug!(%id, %err, "interrupt for a removed component");
            }
        }

        if let Some(msg) = self.inbox.pop_front() {
            self.deliver(msg);
            return true;
        }
        if let Some(id) = self.scheduler.pop_due(self.clock) {
            self.run(id, None);
            worked = true;
        }
        worked
    }

    /// Run until no message is queued and no component is due. Returns the
    /// number of steps taken.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while self.run_once() {
            steps += 1;
        }
        steps
    }

    fn deliver(&mut self, msg: Message) {
        let dst = msg.dst;
        if dst.id.core != self.config.core {
            self.reject(msg, Error::ForeignCore(dst.id.core));
            return;
        }
        if dst.id.is_client() {
            self.client.push_back(msg);
            return;
        }
        if !self.components.contains_key(&dst.id) {
            self.reject(msg, Error::UnknownComponent(dst.id));
            return;
        }
        self.run(dst.id, Some(msg));
    }

    fn reject(&mut self, msg: Message, err: Error) {
        if msg.is_response() {
            debug!(?msg, %err, "undeliverable response dropped");
            return;
        }
        warn!(?msg, %err, "message rejected");
        let response = msg.into_response(Status::from(&err));
        self.post(response);
    }

    fn run(&mut self, id: ComponentId, msg: Option<Message>) {
        let Some(component) = self.components.get_mut(&id) else {
            return;
        };
        self.outbox.clear();
        let mut cx = ProcessContext::new(self.config.core, &mut self.scratch, &mut self.outbox);
        component.dispatch(msg, &mut cx);
        let retired = component.retired();
        self.apply(id, retired);
    }

    /// Carry out what the last call to `id` asked for.
    fn apply(&mut self, id: ComponentId, retired: bool) {
        if self.outbox.cancel {
            self.scheduler.cancel(id);
        }
        if let Some(urgency) = self.outbox.schedule.take() {
            self.scheduler.arm(id, urgency, self.clock);
        }
        let messages = core::mem::take(&mut self.outbox.messages);
        for msg in messages {
            self.observe(&msg);
            self.post(msg);
        }
        if retired {
            self.components.remove(&id);
            self.topology.remove_node(id);
            self.scheduler.cancel(id);
            self.irqs.retain(|line| line.id() != id);
            info!(%id, "component removed");
        }
    }

    fn post(&mut self, msg: Message) {
        if msg.dst.id.is_client() && msg.dst.id.core == self.config.core {
            self.client.push_back(msg);
        } else {
            self.inbox.push_back(msg);
        }
    }

    /// Mirror successful ROUTE and UNROUTE into the topology.
    fn observe(&mut self, msg: &Message) {
        if msg.status != Some(Status::Ok) {
            return;
        }
        match msg.opcode {
            Opcode::Route => match RouteDesc::decode(msg.payload()) {
                Ok(desc) => {
                    if let Err(err) = self.topology.connect(msg.src, desc.dst) {
                        debug!(src = %msg.src, dst = %desc.dst, %err, "edge not recorded");
                    }
                }
                Err(err) => debug!(%err, "route response without descriptor"),
            },
            Opcode::Unroute => {
                self.topology.disconnect(msg.src);
            }
            _ => {}
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.components.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn lifecycle(&self, id: ComponentId) -> Option<Lifecycle> {
        self.components.get(&id).map(Dispatch::current_lifecycle)
    }

    pub fn is_scheduled(&self, id: ComponentId) -> bool {
        self.scheduler.is_armed(id)
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn component(&self, id: ComponentId) -> Option<&AnyComponent> {
        self.components.get(&id)
    }

    pub fn codec(&self, id: ComponentId) -> Option<&Component<AudioCodec>> {
        self.components.get(&id)?.as_codec()
    }

    pub fn mixer(&self, id: ComponentId) -> Option<&Component<Mixer>> {
        self.components.get(&id)?.as_mixer()
    }

    pub fn mimo(&self, id: ComponentId) -> Option<&Component<MimoProcessor>> {
        self.components.get(&id)?.as_mimo()
    }

    pub fn capturer(&self, id: ComponentId) -> Option<&Component<AudioCapturer>> {
        self.components.get(&id)?.as_capturer()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::param;
    use crate::codecs::PcmCopy;
    use crate::config::CodecConfig;
    use crate::error::ReturnCode;

    fn codec(rt: &mut Runtime) -> ComponentId {
        rt.create::<AudioCodec>(Adapter::typed(PcmCopy::default()), CodecConfig::default())
            .unwrap()
    }

    #[test]
    fn ids_are_handed_out_per_core() {
        let mut rt = Runtime::new(RuntimeConfig::default().with_core(2));
        let a = codec(&mut rt);
        let b = codec(&mut rt);
        assert_eq!(a, ComponentId::new(2, 1));
        assert_eq!(b, ComponentId::new(2, 2));
        assert_eq!(rt.topology().node_count(), 2);
    }

    #[test]
    fn foreign_core_is_rejected() {
        let mut rt = Runtime::default();
        rt.send(Message::pause(rt.client(), Address::new(3, 1, 0)));
        rt.run_until_idle();
        let resp = rt.recv().unwrap();
        assert_eq!(resp.status, Some(Status::from(&Error::ForeignCore(3))));
        assert_eq!(resp.status.unwrap().code(), ReturnCode::API_INVALID_CMD);
    }

    #[test]
    fn unknown_component_is_rejected() {
        let mut rt = Runtime::default();
        rt.send(Message::pause(rt.client(), Address::new(0, 40, 0)));
        rt.run_until_idle();
        let resp = rt.recv().unwrap();
        assert!(!resp.status.unwrap().is_ok());
        assert!(rt.recv().is_none());
    }

    #[test]
    fn unregister_removes_the_component() {
        let mut rt = Runtime::default();
        let id = codec(&mut rt);
        rt.set_params(id, &[(param::CHANNELS, 1)]);
        rt.unregister(id);
        rt.run_until_idle();
        assert!(!rt.contains(id));
        assert_eq!(rt.topology().node_count(), 0);
        let last = rt.drain_client().pop().unwrap();
        assert_eq!(last.opcode, Opcode::Unregister);
        assert_eq!(last.status, Some(Status::Ok));
    }

    #[test]
    fn deferred_work_waits_for_the_clock() {
        let mut rt = Runtime::default();
        let id = codec(&mut rt);
        rt.scheduler.arm(id, crate::context::Urgency::After(3), rt.clock());
        assert!(!rt.run_once());
        rt.advance(3);
        assert!(rt.run_once());
        assert!(!rt.is_scheduled(id));
    }
}
