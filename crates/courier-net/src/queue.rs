//! Outbound envelope bookkeeping owned by the transport task.
//!
//! Envelopes wait in `pending` while the link is down and move to
//! `in_flight` once written. The relay's ack removes them from
//! `in_flight`; a dropped link moves every unacknowledged envelope back to
//! the head of `pending` in its original order.

use std::collections::VecDeque;

use courier_shared::{Envelope, MessageId};

use crate::error::TransportError;

#[derive(Debug)]
pub struct OutboundQueue {
    pending: VecDeque<Envelope>,
    in_flight: Vec<Envelope>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            capacity,
        }
    }

    /// Append a new envelope to the tail.
    ///
    /// The capacity applies to fresh sends only; requeued in-flight
    /// envelopes are never refused.
    pub fn push(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        if self.pending.len() >= self.capacity {
            return Err(TransportError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.pending.push_back(envelope);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.pending.pop_front()
    }

    pub fn push_front(&mut self, envelope: Envelope) {
        self.pending.push_front(envelope);
    }

    pub fn mark_in_flight(&mut self, envelope: Envelope) {
        self.in_flight.push(envelope);
    }

    /// Drop an in-flight envelope on ack. Returns `false` for unknown ids.
    pub fn acknowledge(&mut self, id: &MessageId) -> bool {
        match self.in_flight.iter().position(|e| &e.id == id) {
            Some(index) => {
                self.in_flight.remove(index);
                true
            }
            None => false,
        }
    }

    /// Forget an envelope the relay refused so it is never resent.
    pub fn reject(&mut self, id: &MessageId) -> bool {
        self.acknowledge(id) || self.discard(id)
    }

    /// Move every unacknowledged envelope back to the head of the queue.
    pub fn requeue_in_flight(&mut self) -> usize {
        let count = self.in_flight.len();
        for envelope in self.in_flight.drain(..).rev() {
            self.pending.push_front(envelope);
        }
        count
    }

    /// Remove a still-pending envelope. In-flight envelopes are untouched.
    pub fn discard(&mut self, id: &MessageId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|e| &e.id != id);
        self.pending.len() != before
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}
