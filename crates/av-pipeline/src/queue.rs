//! Per-track FIFO of compressed packets.
//!
//! The packet reader pushes, the track's decode loop pops. The mutex is held only for the
//! push/pop itself, never across a decode call.
//!
//! The bound is advisory: `push` never blocks, and producers are expected to consult
//! [`PacketQueue::needs_packet`] before pulling more input for this track.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::packet::QueueItem;

/// Thread-safe packet FIFO with a high watermark.
#[derive(Debug)]
pub struct PacketQueue {
    items: Mutex<VecDeque<QueueItem>>,
    high_watermark: usize,
}

impl PacketQueue {
    pub fn new(high_watermark: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(high_watermark + 1)),
            high_watermark: high_watermark.max(1),
        }
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    /// Append `item` in arrival order.
    pub fn push(&self, item: QueueItem) {
        self.items.lock().push_back(item);
    }

    /// Remove the oldest item.
    pub fn pop(&self) -> Option<QueueItem> {
        self.items.lock().pop_front()
    }

    /// Current queued items (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// `true` while the queue is below its high watermark.
    pub fn needs_packet(&self) -> bool {
        self.items.lock().len() < self.high_watermark
    }

    /// Drop everything still queued and return how many items were released.
    pub fn clear(&self) -> usize {
        let mut g = self.items.lock();
        let n = g.len();
        g.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, TrackId};
    use std::sync::Arc;
    use std::thread;

    fn pkt(n: i64) -> QueueItem {
        QueueItem::Packet(Packet::new(TrackId(0), Some(n), vec![n as u8]))
    }

    #[test]
    fn pops_in_arrival_order() {
        let q = PacketQueue::new(4);
        q.push(pkt(1));
        q.push(pkt(2));
        q.push(QueueItem::EndMarker);
        assert_eq!(q.pop(), Some(pkt(1)));
        assert_eq!(q.pop(), Some(pkt(2)));
        assert_eq!(q.pop(), Some(QueueItem::EndMarker));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn needs_packet_toggles_at_watermark() {
        let q = PacketQueue::new(2);
        assert!(q.needs_packet());
        q.push(pkt(1));
        assert!(q.needs_packet());
        q.push(pkt(2));
        assert!(!q.needs_packet());
        q.pop();
        assert!(q.needs_packet());
    }

    #[test]
    fn zero_watermark_is_clamped() {
        let q = PacketQueue::new(0);
        assert_eq!(q.high_watermark(), 1);
        assert!(q.needs_packet());
    }

    #[test]
    fn clear_reports_released_items() {
        let q = PacketQueue::new(8);
        q.push(pkt(1));
        q.push(QueueItem::EndMarker);
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_push_and_pop_preserve_order() {
        let q = Arc::new(PacketQueue::new(16));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for n in 0..200 {
                    q.push(pkt(n));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 200 {
            if let Some(QueueItem::Packet(p)) = q.pop() {
                seen.push(p.pts.unwrap());
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
