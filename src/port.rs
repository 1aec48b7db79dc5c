//! Ports: the buffered endpoints of graph edges and their flow-control
//! protocol.
//!
//! An [`OutputPort`] is either routed (it owns a pool of buffers that travel
//! to the peer and come back as responses) or fed by the host, which lends it
//! buffers through FILL_THIS_BUFFER. An [`InputPort`] queues whatever its
//! upstream sends and returns each buffer once it is consumed.
//!
//! Topology changes never free a buffer that a peer might still hold: unroute
//! with buffers in flight sends a flush downstream and only tears the pool
//! down once that exact control message (matched by [`Token`]) comes back.

use hashbrown::HashSet;
use tracing::{debug, trace, warn};

use crate::context::{ProcessContext, Request};
use crate::error::{Error, Result};
use crate::message::{Address, Message, Opcode, RouteDesc, Status, StreamParams, Token};
use crate::queue::MsgQueue;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Flags(u8);

impl Flags {
    fn has(self, f: u8) -> bool {
        self.0 & f != 0
    }

    fn set(&mut self, f: u8) {
        self.0 |= f;
    }

    fn clear(&mut self, f: u8) {
        self.0 &= !f;
    }
}

/// What happened to a message put on an input port.
#[derive(Debug)]
pub enum InputEvent {
    /// Runtime-init handshake from upstream. The caller applies and answers it.
    Format(Message),
    /// End of stream for a port that already reached it. The caller answers it
    /// without draining again.
    Duplicate(Message),
    /// Queued. `ready` is set when the port went from empty to ready.
    Queued { ready: bool },
}

/// Receiving end of an edge.
#[derive(Debug)]
pub struct InputPort {
    addr: Address,
    queue: MsgQueue,
    /// Bytes of the front buffer already consumed.
    offset: usize,
    flags: Flags,
    format: Option<StreamParams>,
}

impl InputPort {
    pub const ACTIVE: u8 = 1 << 0;
    pub const PAUSED: u8 = 1 << 1;
    /// Front buffer has been handed to the vendor and not yet fully consumed.
    pub const SETUP: u8 = 1 << 2;
    /// End of stream reached and taken.
    pub const DONE: u8 = 1 << 3;
    /// At least one data buffer arrived since the port was created.
    pub const RECEIVED: u8 = 1 << 4;

    /// An idle port at `addr` queueing up to `depth` buffers.
    pub fn new(addr: Address, depth: usize) -> Self {
        Self {
            addr,
            queue: MsgQueue::new(depth),
            offset: 0,
            flags: Flags::default(),
            format: None,
        }
    }

    /// Where senders address this port.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Raw flag bits, see the associated constants.
    pub fn flags(&self) -> u8 {
        self.flags.0
    }

    /// The port carries a live stream.
    pub fn is_active(&self) -> bool {
        self.flags.has(Self::ACTIVE)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.has(Self::PAUSED)
    }

    pub fn is_setup(&self) -> bool {
        self.flags.has(Self::SETUP)
    }

    /// The end of stream was taken and [`restart`](Self::restart) has not
    /// been called since.
    pub fn is_done(&self) -> bool {
        self.flags.has(Self::DONE)
    }

    /// Any data buffer, as opposed to only a format or an end of stream.
    pub fn has_received(&self) -> bool {
        self.flags.has(Self::RECEIVED)
    }

    /// Format the upstream announced, if any.
    pub fn format(&self) -> Option<StreamParams> {
        self.format
    }

    /// Buffers waiting, an end-of-stream marker included.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Take ownership of an incoming data or format message.
    ///
    /// A full queue answers the sender with an error and returns
    /// [`Error::QueueFull`].
    pub fn put(&mut self, mut msg: Message, cx: &mut ProcessContext<'_>) -> Result<InputEvent> {
        msg.length = msg.length.min(msg.buffer.len());
        if let Some(params) = msg.format {
            trace!(port = %self.addr, ?params, "format received");
            self.format = Some(params);
            self.flags.set(Self::ACTIVE);
            return Ok(InputEvent::Format(msg));
        }
        if msg.is_eos() && (self.is_done() || self.queue.iter().any(Message::is_eos)) {
            debug!(port = %self.addr, "duplicate end of stream");
            return Ok(InputEvent::Duplicate(msg));
        }

        let was_ready = self.is_ready();
        let eos = msg.is_eos();
        if let Err(msg) = self.queue.push(msg) {
            let err = Error::QueueFull(self.addr.port);
            cx.respond(msg, Status::from(&err));
            return Err(err);
        }
        self.flags.set(Self::ACTIVE);
        if !eos {
            self.flags.set(Self::RECEIVED);
        }
        Ok(InputEvent::Queued {
            ready: !was_ready && self.is_ready(),
        })
    }

    /// Something is queued and the port is not paused.
    pub fn is_ready(&self) -> bool {
        !self.is_paused() && !self.queue.is_empty()
    }

    /// Unconsumed bytes in the front buffer.
    pub fn available(&self) -> usize {
        match self.queue.front() {
            Some(m) if !m.is_eos() && !self.is_paused() => m.length.saturating_sub(self.offset),
            _ => 0,
        }
    }

    /// The front message is the end-of-stream marker.
    pub fn at_eos(&self) -> bool {
        !self.is_paused() && self.queue.front().is_some_and(Message::is_eos)
    }

    /// Unconsumed part of the front buffer, for direct (bypass) use.
    pub fn data(&mut self) -> Option<&mut [u8]> {
        if self.is_paused() {
            return None;
        }
        let offset = self.offset;
        match self.queue.front_mut() {
            Some(m) if !m.is_eos() => {
                let end = m.length.min(m.buffer.len());
                Some(&mut m.buffer[offset..end])
            }
            _ => None,
        }
    }

    /// The vendor reads straight from the front buffer.
    pub fn mark_setup(&mut self) {
        self.flags.set(Self::SETUP);
    }

    /// Mark `n` bytes of the front buffer consumed. A fully consumed buffer is
    /// returned to its sender. Returns whether that happened.
    pub fn consume(&mut self, n: usize, cx: &mut ProcessContext<'_>) -> bool {
        let Some(front) = self.queue.front() else {
            return false;
        };
        if front.is_eos() {
            return false;
        }
        self.offset += n;
        if self.offset < front.length {
            return false;
        }
        self.offset = 0;
        self.flags.clear(Self::SETUP);
        if let Some(msg) = self.queue.pop() {
            cx.respond(msg, Status::Ok);
        }
        true
    }

    /// Copy queued bytes into `dst[*filled..]`, consuming them. Returns whether
    /// the end of stream is now at the front.
    pub fn fill(&mut self, dst: &mut [u8], filled: &mut usize, cx: &mut ProcessContext<'_>) -> bool {
        while *filled < dst.len() && !self.is_paused() {
            let Some(front) = self.queue.front() else {
                break;
            };
            if front.is_eos() {
                break;
            }
            let src = &front.buffer[self.offset..front.length.min(front.buffer.len())];
            let k = src.len().min(dst.len() - *filled);
            dst[*filled..*filled + k].copy_from_slice(&src[..k]);
            *filled += k;
            self.flags.set(Self::SETUP);
            self.consume(k, cx);
        }
        self.at_eos()
    }

    /// Pop the end-of-stream marker if it is at the front.
    pub fn take_eos(&mut self) -> Option<Message> {
        if !self.at_eos() {
            return None;
        }
        self.offset = 0;
        self.flags.clear(Self::SETUP);
        self.flags.set(Self::DONE);
        self.queue.pop()
    }

    /// Return every queued buffer to its sender. Returns how many went back.
    ///
    /// A port that already took its end of stream stays done, so a late
    /// duplicate is still answered as one. Use [`restart`](Self::restart) to
    /// accept a new stream.
    pub fn purge(&mut self, cx: &mut ProcessContext<'_>) -> usize {
        let n = self.queue.len();
        for msg in self.queue.drain() {
            cx.respond(msg, Status::Ok);
        }
        self.offset = 0;
        self.flags.clear(Self::SETUP);
        if n > 0 {
            debug!(port = %self.addr, n, "input purged");
        }
        n
    }

    /// Forget the end of stream so the port takes a new stream.
    pub fn restart(&mut self) {
        self.flags.clear(Self::DONE);
    }

    /// A paused port reports nothing available until resumed.
    pub fn pause(&mut self) {
        self.flags.set(Self::PAUSED);
    }

    /// Returns whether the port became ready.
    pub fn resume(&mut self) -> bool {
        self.flags.clear(Self::PAUSED);
        self.is_ready()
    }

    /// Stop counting this port as a live stream.
    pub fn deactivate(&mut self) {
        self.flags.clear(Self::ACTIVE);
    }
}

/// Outcome of starting a flush on an output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStart {
    /// Nothing routed; complete already.
    Done,
    /// Control message sent; completion arrives with its echo.
    Pending,
    /// An earlier flush is still waiting for its echo.
    InProgress,
}

/// Outcome of an unroute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrouteStart {
    /// No buffer was in flight; the edge is gone.
    Done,
    /// A flush is out; the request is parked until its echo returns.
    Pending,
}

/// What happened to a message put on an output port.
#[derive(Debug)]
pub enum OutputEvent {
    /// A buffer became available. `ready` is set when the port went from no
    /// buffer to one.
    Buffer { ready: bool },
    /// The saved control message came back.
    Echo {
        /// Kind of flush that completed, if one was running.
        flushed: Option<Opcode>,
        /// Parked unroute request, now complete.
        unrouted: Option<Message>,
    },
    /// Consumed by the port itself.
    Ignored,
}

#[derive(Debug)]
struct Route {
    dst: Address,
    pool: HashSet<Token>,
}

/// Sending end of an edge.
#[derive(Debug)]
pub struct OutputPort {
    addr: Address,
    /// Capacity of the host-fed queue.
    depth: usize,
    queue: MsgQueue,
    /// Bytes per transfer.
    length: usize,
    flags: Flags,
    route: Option<Route>,
    control: Option<Token>,
    flush_kind: Option<Opcode>,
    pending_unroute: Option<Message>,
    pending_format: Option<StreamParams>,
    format_token: Option<Token>,
}

impl OutputPort {
    pub const ACTIVE: u8 = 1 << 0;
    pub const PAUSED: u8 = 1 << 1;
    /// Front buffer is being filled by the vendor.
    pub const SETUP: u8 = 1 << 2;
    pub const FLUSHING: u8 = 1 << 3;
    pub const FLUSH_DONE: u8 = 1 << 4;
    pub const UNROUTING: u8 = 1 << 5;
    /// End of stream delivered; late host buffers are answered empty.
    pub const EOS: u8 = 1 << 6;

    /// A host-fed port. Routed buffers are `length` bytes unless the route asks
    /// for more.
    pub fn new(addr: Address, depth: usize, length: usize) -> Self {
        Self {
            addr,
            depth,
            queue: MsgQueue::new(depth),
            length,
            flags: Flags::default(),
            route: None,
            control: None,
            flush_kind: None,
            pending_unroute: None,
            pending_format: None,
            format_token: None,
        }
    }

    /// Where peers return buffers.
    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn flags(&self) -> u8 {
        self.flags.0
    }

    /// Transfer length of one buffer.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_routed(&self) -> bool {
        self.route.is_some()
    }

    /// Peer input the route feeds.
    pub fn dst(&self) -> Option<Address> {
        self.route.as_ref().map(|r| r.dst)
    }

    pub fn is_active(&self) -> bool {
        self.flags.has(Self::ACTIVE)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.has(Self::PAUSED)
    }

    pub fn is_setup(&self) -> bool {
        self.flags.has(Self::SETUP)
    }

    /// A flush was sent and its echo is outstanding.
    pub fn is_flushing(&self) -> bool {
        self.flags.has(Self::FLUSHING)
    }

    /// The last flush came back and nothing was produced since.
    pub fn flush_done(&self) -> bool {
        self.flags.has(Self::FLUSH_DONE)
    }

    /// An unroute waits for its flush echo.
    pub fn is_unrouting(&self) -> bool {
        self.flags.has(Self::UNROUTING)
    }

    /// Pool buffers currently held by the peer.
    pub fn in_flight(&self) -> usize {
        match &self.route {
            Some(r) => r.pool.len().saturating_sub(self.queue.len()),
            None => 0,
        }
    }

    /// Buffers waiting here to be filled.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Establish the edge and allocate its buffer pool.
    ///
    /// `length` is the producer's own transfer size; the route may ask for
    /// more, never less.
    pub fn route(&mut self, desc: &RouteDesc, length: usize) -> Result<()> {
        if self.route.is_some() {
            return Err(Error::AlreadyRouted(self.addr.port));
        }
        if desc.buffers == 0 {
            return Err(Error::Malformed("route"));
        }
        if !self.queue.is_empty() {
            return Err(Error::InvalidState("host buffers are queued on this port"));
        }
        let requested = desc.length as usize;
        if requested != 0 && requested < length {
            return Err(Error::BufferTooSmall {
                need: length,
                got: requested,
            });
        }
        self.length = requested.max(length);

        let mut pool = HashSet::with_capacity(desc.buffers as usize);
        self.queue = MsgQueue::new(desc.buffers as usize);
        for _ in 0..desc.buffers {
            let buf = Message::pool_buffer(self.addr, desc.dst, self.length);
            pool.insert(buf.token);
            self.queue
                .push(buf)
                .map_err(|_| Error::QueueFull(self.addr.port))?;
        }
        self.route = Some(Route { dst: desc.dst, pool });
        self.pending_format = None;
        self.flags.set(Self::ACTIVE);
        self.flags.clear(Self::FLUSH_DONE | Self::EOS);
        debug!(port = %self.addr, dst = %desc.dst, buffers = desc.buffers, length = self.length, "routed");
        Ok(())
    }

    /// Begin tearing the edge down.
    ///
    /// Completes at once when every pool buffer is home. Otherwise sends one
    /// flush downstream and parks the request until that flush echoes back.
    pub fn unroute(&mut self, req: &mut Request, cx: &mut ProcessContext<'_>) -> Result<UnrouteStart> {
        let Some(route) = &self.route else {
            return Err(Error::NotRouted(self.addr.port));
        };
        if self.is_unrouting() {
            return Err(Error::InvalidState("unroute already in progress"));
        }
        if self.in_flight() == 0 && !self.is_flushing() {
            debug!(port = %self.addr, "unrouted");
            self.teardown();
            return Ok(UnrouteStart::Done);
        }

        let dst = route.dst;
        self.pending_unroute = Some(req.take()?);
        self.flags.set(Self::UNROUTING);
        if !self.is_flushing() {
            let ctrl = Message::flush(self.addr, dst);
            self.control = Some(ctrl.token);
            cx.send(ctrl);
        }
        debug!(port = %self.addr, in_flight = self.in_flight(), "unroute waiting for flush echo");
        Ok(UnrouteStart::Pending)
    }

    /// Start a flush of `kind` (FLUSH, or EMPTY_THIS_BUFFER for end of stream).
    ///
    /// An unrouted port hands its queued host buffers back empty and is done.
    pub fn flush(&mut self, kind: Opcode, cx: &mut ProcessContext<'_>) -> FlushStart {
        let Some(route) = &self.route else {
            for mut msg in self.queue.drain() {
                msg.length = 0;
                cx.respond(msg, Status::Ok);
            }
            self.flags.clear(Self::SETUP);
            self.flags.set(Self::FLUSH_DONE);
            return FlushStart::Done;
        };
        if self.is_flushing() {
            return FlushStart::InProgress;
        }
        let ctrl = match kind {
            Opcode::EmptyThisBuffer => Message::empty_this_buffer(self.addr, route.dst, Vec::new()),
            _ => Message::flush(self.addr, route.dst),
        };
        self.control = Some(ctrl.token);
        self.flush_kind = Some(kind);
        self.flags.set(Self::FLUSHING);
        self.flags.clear(Self::FLUSH_DONE);
        if kind == Opcode::EmptyThisBuffer {
            self.flags.set(Self::EOS);
        }
        debug!(port = %self.addr, ?kind, "flush sent");
        cx.send(ctrl);
        FlushStart::Pending
    }

    /// Check a host FILL_THIS_BUFFER before taking it.
    pub fn accepts_host_buffer(&self, msg: &Message) -> Result<()> {
        if self.route.is_some() {
            return Err(Error::InvalidState("port is routed"));
        }
        if msg.buffer.len() < self.length.max(StreamParams::ENCODED_LEN) {
            return Err(Error::BufferTooSmall {
                need: self.length.max(StreamParams::ENCODED_LEN),
                got: msg.buffer.len(),
            });
        }
        if self.queue.is_full() && !self.flags.has(Self::EOS) && self.pending_format.is_none() {
            return Err(Error::QueueFull(self.addr.port));
        }
        Ok(())
    }

    /// Take a host buffer or a message coming back from the peer.
    pub fn put(&mut self, mut msg: Message, cx: &mut ProcessContext<'_>) -> OutputEvent {
        if msg.is_response() {
            return self.put_returned(msg);
        }

        // host buffer
        if self.flags.has(Self::EOS) {
            msg.length = 0;
            cx.respond(msg, Status::Ok);
            return OutputEvent::Ignored;
        }
        if let Some(params) = self.pending_format.take() {
            write_format(&mut msg, params);
            cx.respond(msg, Status::Ok);
            return OutputEvent::Ignored;
        }
        let was_ready = self.has_buffer();
        msg.length = 0;
        if let Err(msg) = self.queue.push(msg) {
            warn!(port = %self.addr, "host buffer over capacity");
            cx.respond(msg, Status::from(&Error::QueueFull(self.addr.port)));
            return OutputEvent::Ignored;
        }
        self.flags.set(Self::ACTIVE);
        OutputEvent::Buffer {
            ready: !was_ready && self.has_buffer(),
        }
    }

    fn put_returned(&mut self, msg: Message) -> OutputEvent {
        if self.control.is_some_and(|t| t == msg.token) {
            self.control = None;
            let flushed = if self.is_flushing() {
                self.flags.clear(Self::FLUSHING);
                self.flags.set(Self::FLUSH_DONE);
                self.flush_kind.take()
            } else {
                None
            };
            let unrouted = if self.is_unrouting() {
                debug!(port = %self.addr, "flush echoed, unrouted");
                self.teardown();
                self.pending_unroute.take()
            } else {
                None
            };
            trace!(port = %self.addr, ?flushed, "control echo");
            return OutputEvent::Echo { flushed, unrouted };
        }
        if self.format_token.is_some_and(|t| t == msg.token) {
            self.format_token = None;
            return OutputEvent::Ignored;
        }

        let Some(route) = &self.route else {
            debug!(port = %self.addr, ?msg, "stray response on unrouted port");
            return OutputEvent::Ignored;
        };
        if !route.pool.contains(&msg.token) {
            debug!(port = %self.addr, ?msg, "response for a buffer this port does not own");
            return OutputEvent::Ignored;
        }
        if let Some(Status::Failed(code)) = msg.status {
            warn!(port = %self.addr, %code, "peer rejected buffer");
        }

        let was_ready = self.has_buffer();
        let mut msg = msg.into_request();
        msg.opcode = Opcode::EmptyThisBuffer;
        msg.length = 0;
        if msg.buffer.len() < self.length {
            msg.buffer.resize(self.length, 0);
        }
        // capacity equals the pool size, so a pool buffer always fits
        if self.queue.push(msg).is_err() {
            warn!(port = %self.addr, "pool buffer returned twice");
        }
        OutputEvent::Buffer {
            ready: !was_ready && self.has_buffer(),
        }
    }

    /// A buffer is available for the vendor to fill.
    pub fn has_buffer(&self) -> bool {
        !self.is_unrouting()
            && !self.is_paused()
            && !self.flags.has(Self::EOS)
            && self.pending_format.is_none()
            && !self.queue.is_empty()
    }

    /// The buffer the next produced bytes go to.
    pub fn data(&mut self) -> Option<&mut Message> {
        if !self.has_buffer() {
            return None;
        }
        self.flags.set(Self::SETUP);
        self.queue.front_mut()
    }

    /// The vendor writes straight into the front buffer.
    pub fn mark_setup(&mut self) {
        self.flags.set(Self::SETUP);
    }

    /// Send `n` bytes already written into the front buffer on their way.
    pub fn produce(&mut self, n: usize, cx: &mut ProcessContext<'_>) -> Result<()> {
        if !self.has_buffer() {
            return Err(Error::InvalidState("no output buffer"));
        }
        let mut msg = self
            .queue
            .pop()
            .ok_or(Error::InvalidState("no output buffer"))?;
        self.flags.clear(Self::SETUP);
        msg.length = n;
        match &self.route {
            Some(route) => {
                msg.src = self.addr;
                msg.dst = route.dst;
                trace!(port = %self.addr, n, "buffer downstream");
                cx.send(msg);
            }
            None => {
                trace!(port = %self.addr, n, "buffer to host");
                cx.respond(msg, Status::Ok);
            }
        }
        Ok(())
    }

    /// Copy `bytes` into the next buffer and send it.
    pub fn produce_from(&mut self, bytes: &[u8], cx: &mut ProcessContext<'_>) -> Result<()> {
        let buf = self.data().ok_or(Error::InvalidState("no output buffer"))?;
        if buf.buffer.len() < bytes.len() {
            return Err(Error::BufferTooSmall {
                need: bytes.len(),
                got: buf.buffer.len(),
            });
        }
        buf.buffer[..bytes.len()].copy_from_slice(bytes);
        self.produce(bytes.len(), cx)
    }

    /// End of stream on a host-fed port: hand every queued buffer back empty.
    pub fn complete_all(&mut self, cx: &mut ProcessContext<'_>) {
        self.flags.set(Self::EOS);
        if self.route.is_some() {
            return;
        }
        for mut msg in self.queue.drain() {
            msg.length = 0;
            cx.respond(msg, Status::Ok);
        }
    }

    /// Announce the stream parameters to whoever is downstream.
    pub fn send_format(&mut self, params: StreamParams, cx: &mut ProcessContext<'_>) {
        match &self.route {
            Some(route) => {
                let msg = Message::format(self.addr, route.dst, params);
                self.format_token = Some(msg.token);
                cx.send(msg);
            }
            None => match self.queue.pop() {
                Some(mut msg) => {
                    write_format(&mut msg, params);
                    cx.respond(msg, Status::Ok);
                }
                None => self.pending_format = Some(params),
            },
        }
    }

    /// Grow the transfer size; queued pool buffers grow with it.
    pub fn set_length(&mut self, length: usize) {
        if length <= self.length {
            return;
        }
        self.length = length;
        if self.route.is_some() {
            for msg in self.queue.iter_mut() {
                msg.buffer.resize(length, 0);
            }
        }
    }

    pub fn pause(&mut self) {
        self.flags.set(Self::PAUSED);
    }

    /// Returns whether a buffer is ready to fill.
    pub fn resume(&mut self) -> bool {
        self.flags.clear(Self::PAUSED);
        self.has_buffer()
    }

    /// Start a new stream on this port.
    pub fn rearm(&mut self) {
        self.flags.clear(Self::EOS | Self::FLUSH_DONE);
    }

    /// No flush or unroute outstanding and every pool buffer is home.
    pub fn drained(&self) -> bool {
        !self.is_flushing() && !self.is_unrouting() && self.in_flight() == 0
    }

    /// Give host buffers back and drop the pool. Only valid once drained.
    pub fn release(&mut self, cx: &mut ProcessContext<'_>) {
        if self.route.is_none() {
            for mut msg in self.queue.drain() {
                msg.length = 0;
                cx.respond(msg, Status::Ok);
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.route = None;
        self.queue = MsgQueue::new(self.depth);
        self.control = None;
        self.flush_kind = None;
        self.format_token = None;
        self.flags.clear(Self::ACTIVE | Self::SETUP | Self::FLUSHING | Self::UNROUTING);
    }
}

fn write_format(msg: &mut Message, params: StreamParams) {
    let bytes = params.encode();
    let n = bytes.len().min(msg.buffer.len());
    msg.buffer[..n].copy_from_slice(&bytes[..n]);
    msg.length = n;
    msg.format = Some(params);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Outbox;

    const HOST: Address = Address::client(0);

    fn ctx<'a>(scratch: &'a mut [u8], outbox: &'a mut Outbox) -> ProcessContext<'a> {
        ProcessContext::new(0, scratch, outbox)
    }

    fn routed(buffers: u32) -> OutputPort {
        let mut port = OutputPort::new(Address::new(0, 1, 1), 4, 8);
        port.route(&RouteDesc::new(Address::new(0, 2, 0), buffers), 8)
            .unwrap();
        port
    }

    #[test]
    fn route_twice_is_rejected() {
        let mut port = routed(2);
        let err = port.route(&RouteDesc::new(Address::new(0, 3, 0), 2), 8).unwrap_err();
        assert!(matches!(err, Error::AlreadyRouted(1)));
    }

    #[test]
    fn route_shorter_than_transfer_is_rejected() {
        let mut port = OutputPort::new(Address::new(0, 1, 1), 4, 8);
        let desc = RouteDesc::new(Address::new(0, 2, 0), 2).with_length(4);
        assert!(matches!(port.route(&desc, 8), Err(Error::BufferTooSmall { need: 8, got: 4 })));
        assert!(!port.is_routed());
    }

    #[test]
    fn idle_unroute_completes_without_flush() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = routed(2);
        let mut req = Request::new(Message::unroute(HOST, port.addr()));
        assert_eq!(port.unroute(&mut req, &mut cx).unwrap(), UnrouteStart::Done);
        assert!(!req.is_taken());
        assert!(!port.is_routed());
        assert!(outbox.messages.is_empty());
    }

    #[test]
    fn busy_unroute_waits_for_its_own_echo() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = routed(2);
        port.data().unwrap().buffer[0] = 1;
        port.produce(4, &mut cx).unwrap();
        assert_eq!(port.in_flight(), 1);

        let mut req = Request::new(Message::unroute(HOST, port.addr()));
        assert_eq!(port.unroute(&mut req, &mut cx).unwrap(), UnrouteStart::Pending);
        assert!(req.is_taken());
        assert!(port.data().is_none(), "no reuse while unrouting");

        let mut sent: Vec<Message> = outbox.messages.drain(..).collect();
        assert_eq!(sent.len(), 2);
        let flush = sent.pop().unwrap();
        let data = sent.pop().unwrap();
        assert_eq!(flush.opcode, Opcode::Flush);

        let mut cx = ctx(&mut scratch, &mut outbox);
        // returning buffer alone does not complete the unroute
        assert!(matches!(port.put(data.into_response(Status::Ok), &mut cx), OutputEvent::Buffer { .. }));
        assert!(port.is_routed());
        match port.put(flush.into_response(Status::Ok), &mut cx) {
            OutputEvent::Echo { unrouted: Some(msg), .. } => assert_eq!(msg.opcode, Opcode::Unroute),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!port.is_routed());
    }

    #[test]
    fn flush_on_unrouted_port_is_immediate() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = OutputPort::new(Address::new(0, 1, 1), 4, 8);
        assert_eq!(port.flush(Opcode::Flush, &mut cx), FlushStart::Done);
        assert!(port.flush_done());
        assert!(outbox.messages.is_empty());
    }

    #[test]
    fn second_flush_reports_in_progress() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = routed(1);
        assert_eq!(port.flush(Opcode::EmptyThisBuffer, &mut cx), FlushStart::Pending);
        assert_eq!(port.flush(Opcode::EmptyThisBuffer, &mut cx), FlushStart::InProgress);
        assert_eq!(outbox.messages.len(), 1);
        assert!(outbox.messages[0].is_eos());
    }

    #[test]
    fn host_buffers_come_back_with_produced_length() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = OutputPort::new(Address::new(0, 1, 1), 2, 8);
        let fill = Message::fill_this_buffer(HOST, port.addr(), 16);
        port.accepts_host_buffer(&fill).unwrap();
        assert!(matches!(port.put(fill, &mut cx), OutputEvent::Buffer { ready: true }));
        port.produce_from(&[1, 2, 3], &mut cx).unwrap();
        let back = &outbox.messages[0];
        assert_eq!(back.dst, HOST);
        assert_eq!(back.payload(), &[1, 2, 3]);
    }

    #[test]
    fn unrouted_format_waits_for_a_host_buffer() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = OutputPort::new(Address::new(0, 1, 1), 2, 8);
        let params = StreamParams { sample_rate: 8_000, channels: 1, pcm_width: 16, length: 8 };
        port.send_format(params, &mut cx);
        assert!(outbox.messages.is_empty());
        let mut cx = ctx(&mut scratch, &mut outbox);
        port.put(Message::fill_this_buffer(HOST, port.addr(), 16), &mut cx);
        assert_eq!(outbox.messages[0].format, Some(params));
        assert_eq!(StreamParams::decode(outbox.messages[0].payload()).unwrap(), params);
    }

    #[test]
    fn input_signals_ready_once() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = InputPort::new(Address::new(0, 1, 0), 4);
        let first = port.put(Message::empty_this_buffer(HOST, port.addr(), vec![1; 4]), &mut cx);
        assert!(matches!(first, Ok(InputEvent::Queued { ready: true })));
        let second = port.put(Message::empty_this_buffer(HOST, port.addr(), vec![2; 4]), &mut cx);
        assert!(matches!(second, Ok(InputEvent::Queued { ready: false })));
        assert_eq!(port.available(), 4);
    }

    #[test]
    fn fill_spans_buffers_and_returns_them() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = InputPort::new(Address::new(0, 1, 0), 4);
        port.put(Message::empty_this_buffer(HOST, port.addr(), vec![1, 2, 3]), &mut cx).unwrap();
        port.put(Message::empty_this_buffer(HOST, port.addr(), vec![4, 5, 6]), &mut cx).unwrap();
        port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx).unwrap();

        let mut dst = [0u8; 4];
        let mut filled = 0;
        assert!(!port.fill(&mut dst, &mut filled, &mut cx));
        assert_eq!(dst, [1, 2, 3, 4]);
        assert_eq!(outbox.messages.len(), 1);

        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut dst = [0u8; 4];
        let mut filled = 0;
        assert!(port.fill(&mut dst, &mut filled, &mut cx));
        assert_eq!(filled, 2);
        assert_eq!(&dst[..2], &[5, 6]);
        assert!(port.take_eos().is_some());
        assert!(port.is_done());
    }

    #[test]
    fn duplicate_eos_is_reported() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = InputPort::new(Address::new(0, 1, 0), 4);
        port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx).unwrap();
        let again = port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx);
        assert!(matches!(again, Ok(InputEvent::Duplicate(_))));
        port.take_eos().unwrap();
        let late = port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx);
        assert!(matches!(late, Ok(InputEvent::Duplicate(_))));
    }

    #[test]
    fn purge_keeps_the_stream_done_until_restart() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = InputPort::new(Address::new(0, 1, 0), 4);
        port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx).unwrap();
        port.take_eos().unwrap();
        assert_eq!(port.purge(&mut cx), 0);
        assert!(port.is_done());

        let late = port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx);
        assert!(matches!(late, Ok(InputEvent::Duplicate(_))));
        assert_eq!(port.queued(), 0);

        port.restart();
        assert!(!port.is_done());
        let fresh = port.put(Message::empty_this_buffer(HOST, port.addr(), Vec::new()), &mut cx);
        assert!(matches!(fresh, Ok(InputEvent::Queued { .. })));
    }

    #[test]
    fn full_input_answers_sender() {
        let (mut scratch, mut outbox) = ([0u8; 0], Outbox::default());
        let mut cx = ctx(&mut scratch, &mut outbox);
        let mut port = InputPort::new(Address::new(0, 1, 0), 1);
        port.put(Message::empty_this_buffer(HOST, port.addr(), vec![1]), &mut cx).unwrap();
        let err = port.put(Message::empty_this_buffer(HOST, port.addr(), vec![2]), &mut cx);
        assert!(matches!(err, Err(Error::QueueFull(0))));
        assert_eq!(outbox.messages.len(), 1);
        assert!(!outbox.messages[0].status.unwrap().is_ok());
    }
}
