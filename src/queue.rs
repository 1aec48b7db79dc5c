//! Bounded FIFO of messages held by a port.

use std::collections::VecDeque;

use crate::message::{Message, Token};

/// Insertion-ordered message queue with a capacity fixed at creation.
#[derive(Debug, Default)]
pub struct MsgQueue {
    items: VecDeque<Message>,
    capacity: usize,
}

impl MsgQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message.
    ///
    /// Returns `Err(msg)` if the queue is full, handing the message back.
    pub fn push(&mut self, msg: Message) -> Result<(), Message> {
        if self.is_full() {
            return Err(msg);
        }
        self.items.push_back(msg);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Message> {
        self.items.front_mut()
    }

    /// Remove the message carrying `token`, wherever it sits.
    pub fn take(&mut self, token: Token) -> Option<Message> {
        let pos = self.items.iter().position(|m| m.token == token)?;
        self.items.remove(pos)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.items.iter().any(|m| m.token == token)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity. Queued messages beyond it are kept.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.items.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.items.iter_mut()
    }
}
