//! Hardware capture boundary.
//!
//! A [`CaptureDriver`] owns the device and calls [`CaptureCallback::deliver`]
//! from its own context (an interrupt handler, a driver thread). The callback
//! never touches ports or queues of the runtime: it writes into a lock-free
//! ring, sets atomic flags and raises one interrupt per batch. The runtime
//! turns that interrupt into a schedule request on its next pass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::trace;

use crate::error::{Error, Result};
use crate::message::ComponentId;

/// Sending half of an interrupt line, handed to the capture callback.
pub struct IrqSender {
    id: ComponentId,
    line: Producer<ComponentId>,
}

impl IrqSender {
    /// Raise the interrupt. Returns `false` if the line is saturated, in
    /// which case an earlier raise is still pending anyway.
    pub fn raise(&mut self) -> bool {
        self.line.push(self.id).is_ok()
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }
}

/// Receiving half, polled by the runtime.
pub struct IrqReceiver {
    id: ComponentId,
    line: Consumer<ComponentId>,
}

impl IrqReceiver {
    pub fn pop(&mut self) -> Option<ComponentId> {
        self.line.pop().ok()
    }

    pub fn pending(&self) -> usize {
        self.line.slots()
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }
}

/// Create an interrupt line for component `id`.
pub fn interrupt_line(id: ComponentId, capacity: usize) -> (IrqSender, IrqReceiver) {
    let (line_tx, line_rx) = RingBuffer::new(capacity.max(1));
    (
        IrqSender { id, line: line_tx },
        IrqReceiver { id, line: line_rx },
    )
}

/// Flags shared between the capture callback and the capturer.
#[derive(Debug, Default)]
pub struct CaptureShared {
    /// Data arrived since the capturer last looked.
    pub pending: AtomicBool,
    /// The ring was full and bytes were dropped.
    pub overflow: AtomicBool,
    /// Callback accepts data. Cleared while paused or stopped.
    pub running: AtomicBool,
    /// Bytes written into the ring so far.
    pub delivered: AtomicU64,
}

/// What a driver calls when the hardware has a block of samples.
pub struct CaptureCallback {
    ring: Producer<u8>,
    shared: Arc<CaptureShared>,
    irq: IrqSender,
}

impl CaptureCallback {
    pub(crate) fn new(ring: Producer<u8>, shared: Arc<CaptureShared>, irq: IrqSender) -> Self {
        Self { ring, shared, irq }
    }

    /// Hand captured bytes over. Safe to call from interrupt context: it only
    /// writes into the ring and flips atomics.
    ///
    /// Raises the interrupt only when no earlier raise is still unserviced.
    pub fn deliver(&mut self, data: &[u8]) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        let n = data.len().min(self.ring.slots());
        if n > 0 {
            if let Ok(chunk) = self.ring.write_chunk_uninit(n) {
                chunk.fill_from_iter(data[..n].iter().copied());
            }
            self.shared.delivered.fetch_add(n as u64, Ordering::Relaxed);
        }
        if n < data.len() {
            self.shared.overflow.store(true, Ordering::Release);
        }
        if !self.shared.pending.swap(true, Ordering::AcqRel) {
            self.irq.raise();
        }
    }

    pub fn shared(&self) -> &Arc<CaptureShared> {
        &self.shared
    }
}

/// A capture device.
pub trait CaptureDriver: Send {
    /// Start delivering through `callback`.
    fn start(&mut self, callback: CaptureCallback) -> Result<()>;

    fn stop(&mut self);
}

type Slot = Arc<Mutex<Option<CaptureCallback>>>;

/// Driver without hardware: samples are pushed through its [`ManualTrigger`].
#[derive(Default)]
pub struct ManualDriver {
    slot: Slot,
}

impl ManualDriver {
    pub fn new() -> (Self, ManualTrigger) {
        let slot = Slot::default();
        (
            Self { slot: slot.clone() },
            ManualTrigger { slot },
        )
    }
}

impl CaptureDriver for ManualDriver {
    fn start(&mut self, callback: CaptureCallback) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Driver("manual driver lock poisoned".into()))?;
        *slot = Some(callback);
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

/// Stands in for the hardware interrupt of a [`ManualDriver`].
#[derive(Clone)]
pub struct ManualTrigger {
    slot: Slot,
}

impl ManualTrigger {
    /// Deliver `data` as if the hardware just completed a transfer. Returns
    /// `false` when the driver is not started.
    pub fn fire(&self, data: &[u8]) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_mut() {
            Some(callback) => {
                trace!(bytes = data.len(), "manual capture");
                callback.deliver(data);
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}
