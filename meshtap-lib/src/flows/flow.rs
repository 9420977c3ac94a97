//! Bounded producer buffer keyed on a destination peer, attachable to any
//! sink. Buffered packets survive attach/detach.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::proto::dataproto::DataPacket;
use crate::PeerId;

pub struct DataProtoFlow {
    capacity: usize,
    buffer: VecDeque<DataPacket>,
    attached: Option<PeerId>,
    last_activity: Instant,
}

impl DataProtoFlow {
    pub fn new(capacity: usize, now: Instant) -> DataProtoFlow {
        DataProtoFlow {
            capacity,
            buffer: VecDeque::new(),
            attached: None,
            last_activity: now,
        }
    }

    /// Attaches to the sink owned by `sink_owner`. Buffered packets carry
    /// over and drain into the new sink.
    pub fn attach(&mut self, sink_owner: PeerId) {
        debug_assert!(self.attached.is_none(), "flow is already attached");
        self.attached = Some(sink_owner);
    }

    pub fn detach(&mut self) -> Option<PeerId> {
        self.attached.take()
    }

    pub fn attached(&self) -> Option<PeerId> {
        self.attached
    }

    /// Enqueues a packet; a full buffer drops the packet and reports false.
    pub fn push(&mut self, packet: DataPacket, now: Instant) -> bool {
        self.last_activity = now;
        if self.buffer.len() >= self.capacity {
            return false;
        }
        self.buffer.push_back(packet);
        true
    }

    pub fn pop(&mut self) -> Option<DataPacket> {
        self.buffer.pop_front()
    }

    /// Returns a popped packet to the head of the buffer, used when the
    /// sink's writer turns out to be saturated.
    pub fn push_front(&mut self, packet: DataPacket) {
        self.buffer.push_front(packet);
    }

    pub fn peek(&self) -> Option<&DataPacket> {
        self.buffer.front()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(n: u8) -> DataPacket {
        DataPacket { flags: 0, from: 1, dests: vec![2], payload: Bytes::from(vec![n]) }
    }

    #[test]
    fn test_bounded_buffer_drops_on_full() {
        let now = Instant::now();
        let mut f = DataProtoFlow::new(2, now);
        assert!(f.push(pkt(1), now));
        assert!(f.push(pkt(2), now));
        assert!(!f.push(pkt(3), now), "full buffer drops");
        assert_eq!(f.len(), 2);
        assert_eq!(f.pop(), Some(pkt(1)));
    }

    #[test]
    fn test_buffer_survives_reattach() {
        let now = Instant::now();
        let mut f = DataProtoFlow::new(8, now);
        f.attach(5);
        f.push(pkt(1), now);
        assert_eq!(f.detach(), Some(5));
        f.attach(7);
        assert_eq!(f.attached(), Some(7));
        assert_eq!(f.pop(), Some(pkt(1)), "packets carried across attach boundary");
    }
}
