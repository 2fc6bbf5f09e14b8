//! Ordered buffer of not-yet-acknowledged outbound message records.

use hostlink_core::AgentMessageRecord;

/// Byte-size cap for one outbound batch. Never splits a single record: an
/// oversized record still ships alone.
pub(crate) const MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// One queued record awaiting delivery or acknowledgement.
#[derive(Debug, Clone)]
pub(crate) struct PendingMessage {
    pub serial: u32,
    pub delivery_attempts: u32,
    pub record: AgentMessageRecord,
}

/// Per-session delivery queue, kept sorted by ascending serial.
///
/// Serials start at 1 and reset to 1 only via [`DeliveryQueue::reset_serial`],
/// which the session invokes once every delivery has been acknowledged and
/// nothing remains queued.
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    items: Vec<PendingMessage>,
    next_serial: u32,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            next_serial: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a record under the next serial.
    pub fn push(&mut self, record: AgentMessageRecord) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.items.push(PendingMessage {
            serial,
            delivery_attempts: 0,
            record,
        });
    }

    /// Greedily take records in serial order up to `max_bytes`.
    ///
    /// The cap is not enforced against a single record; if the first record
    /// alone exceeds it, that record is taken by itself.
    pub fn take_batch(&mut self, max_bytes: usize) -> Vec<PendingMessage> {
        let mut batch = Vec::new();
        let mut total = 0usize;
        while !self.items.is_empty() {
            let estimate = self.items[0].record.size_estimate();
            if total + estimate > max_bytes && !batch.is_empty() {
                break;
            }
            total += estimate;
            batch.push(self.items.remove(0));
        }
        batch
    }

    /// Put a failed batch back, restoring absolute serial order against
    /// anything enqueued meanwhile. Attempt counters are not rolled back.
    pub fn requeue(&mut self, batch: Vec<PendingMessage>) {
        self.items.extend(batch);
        self.items.sort_by_key(|message| message.serial);
    }

    /// Drop already-delivered messages after a resume: from the queue front,
    /// every message attempted at least once whose serial does not exceed
    /// the remote's reported last-transmitted batch id.
    pub fn discard_delivered(&mut self, last_tx_batch_id: u32) {
        if last_tx_batch_id == 0 {
            return;
        }
        while let Some(first) = self.items.first() {
            if first.delivery_attempts > 0 && first.serial <= last_tx_batch_id {
                self.items.remove(0);
            } else {
                break;
            }
        }
    }

    /// Restart serials at 1. Only valid once fully drained and acknowledged.
    pub fn reset_serial(&mut self) {
        self.next_serial = 1;
    }

    /// Drop everything. Used when the owning session is destroyed.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
