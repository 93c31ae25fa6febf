//! Ordering queue between the stream and the reconciler.
//!
//! Records can arrive ahead of their logical position (server timestamps a
//! little out of order, or missing entirely). The queue buffers decoded
//! events sorted by their ordering key and hands them to the reconciler in
//! key order. Exclusive access (`&mut self`) makes the drain single-consumer
//! by construction; a failure applying one event is logged and never stops
//! the events behind it.

use tracing::warn;

use crate::error::Result;
use crate::event::RawEvent;

/// Sorted buffer of decoded events awaiting reconciliation.
#[derive(Debug, Default)]
pub struct OrderingQueue {
    buffer: Vec<RawEvent>,
}

impl OrderingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Insert an event at its sorted position.
    ///
    /// Events with equal keys keep their insertion order: the new event goes
    /// after existing equals, so equal-key records are never reordered.
    pub fn push(&mut self, event: RawEvent) {
        let key = event.ordering_key();
        let index = self.buffer.partition_point(|e| e.ordering_key() <= key);
        self.buffer.insert(index, event);
    }

    /// Apply every buffered event, in key order, to `apply`.
    ///
    /// An error from `apply` is logged with the event's kind and the drain
    /// continues with the next event. Returns the number of events handed
    /// out (failed ones included).
    pub fn drain<F>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(RawEvent) -> Result<()>,
    {
        let mut processed = 0;
        while !self.buffer.is_empty() {
            let event = self.buffer.remove(0);
            let kind = event.kind.clone();
            processed += 1;
            if let Err(e) = apply(event) {
                warn!(kind = %kind, error = %e, "failed to apply event, skipping");
            }
        }
        processed
    }

    /// Drop everything still buffered. Used when the subscription closes;
    /// undrained events are not carried into the next subscription.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
