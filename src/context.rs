//! Per-invocation context handed to every component call.

use tracing::trace;

use crate::error::{Error, Result};
use crate::message::{Message, Status};

/// When a scheduled component should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Urgency {
    /// Next pass of the run loop.
    Now,
    /// After the runtime clock advances by this many ticks.
    After(u64),
}

/// Side effects collected during one call, applied by the runtime afterwards.
#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<Message>,
    pub schedule: Option<Urgency>,
    pub cancel: bool,
}

impl Outbox {
    pub fn clear(&mut self) {
        self.messages.clear();
        self.schedule = None;
        self.cancel = false;
    }
}

/// What a component sees while it runs.
///
/// `scratch` is the core-wide scratch arena. It is only valid for the
/// duration of one call and must not be assumed to keep its contents.
pub struct ProcessContext<'a> {
    pub(crate) core: u8,
    pub(crate) scratch: &'a mut [u8],
    pub(crate) outbox: &'a mut Outbox,
}

impl<'a> ProcessContext<'a> {
    pub fn new(core: u8, scratch: &'a mut [u8], outbox: &'a mut Outbox) -> Self {
        Self {
            core,
            scratch,
            outbox,
        }
    }

    pub fn core(&self) -> u8 {
        self.core
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    pub fn scratch_mut(&mut self) -> &mut [u8] {
        &mut *self.scratch
    }

    /// Queue a message for delivery after this call returns.
    pub fn send(&mut self, msg: Message) {
        trace!(?msg, "send");
        self.outbox.messages.push(msg);
    }

    /// Answer a request.
    pub fn respond(&mut self, msg: Message, status: Status) {
        self.send(msg.into_response(status));
    }

    pub fn respond_with(&mut self, msg: Message, result: &Result<()>) {
        let status = match result {
            Ok(()) => Status::Ok,
            Err(e) => Status::from(e),
        };
        self.respond(msg, status);
    }

    pub(crate) fn schedule(&mut self, urgency: Urgency) {
        self.outbox.cancel = false;
        self.outbox.schedule = Some(urgency);
    }

    pub(crate) fn cancel(&mut self) {
        self.outbox.schedule = None;
        self.outbox.cancel = true;
    }
}

/// A request being handled.
///
/// A handler that keeps the message (queues it on a port or answers it
/// itself) takes it out; whatever is left in the slot is answered by the
/// dispatcher once the handler returns.
#[derive(Debug)]
pub struct Request {
    msg: Option<Message>,
}

impl Request {
    pub fn new(msg: Message) -> Self {
        Self { msg: Some(msg) }
    }

    pub fn message(&self) -> Result<&Message> {
        self.msg.as_ref().ok_or(Error::InvalidState("request already taken"))
    }

    pub fn message_mut(&mut self) -> Result<&mut Message> {
        self.msg.as_mut().ok_or(Error::InvalidState("request already taken"))
    }

    pub fn take(&mut self) -> Result<Message> {
        self.msg.take().ok_or(Error::InvalidState("request already taken"))
    }

    pub fn is_taken(&self) -> bool {
        self.msg.is_none()
    }

    pub fn into_inner(self) -> Option<Message> {
        self.msg
    }
}
