//! Receive side toward the tap: a bounded buffer per source peer drains
//! fairly into the device writer; idle buffers are evicted.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::PeerId;

struct SourceBuffer {
    queue: VecDeque<Bytes>,
    last_activity: Instant,
}

pub struct ReceiveDevice {
    tap_tx: mpsc::Sender<Bytes>,
    capacity: usize,
    inactivity: Duration,
    buffers: HashMap<PeerId, SourceBuffer, RandomState>,
    rotation: VecDeque<PeerId>,
}

impl ReceiveDevice {
    pub fn new(
        tap_tx: mpsc::Sender<Bytes>,
        capacity: usize,
        inactivity: Duration,
    ) -> ReceiveDevice {
        ReceiveDevice {
            tap_tx,
            capacity,
            inactivity,
            buffers: HashMap::default(),
            rotation: VecDeque::new(),
        }
    }

    /// Buffers a frame received from `src` for delivery to the tap. A full
    /// buffer drops the frame.
    pub fn push(&mut self, src: PeerId, frame: Bytes, now: Instant) {
        if !self.buffers.contains_key(&src) {
            self.rotation.push_back(src);
            self.buffers
                .insert(src, SourceBuffer { queue: VecDeque::new(), last_activity: now });
        }
        let buffer = self.buffers.get_mut(&src).expect("buffer just ensured");
        buffer.last_activity = now;
        if buffer.queue.len() < self.capacity {
            buffer.queue.push_back(frame);
        }
        self.drain();
    }

    /// Fair round-robin drain into the device writer.
    pub fn drain(&mut self) {
        let tap_tx = self.tap_tx.clone();
        for _ in 0..self.rotation.len() {
            let Some(src) = self.rotation.pop_front() else {
                break;
            };
            self.rotation.push_back(src);
            let Some(buffer) = self.buffers.get_mut(&src) else {
                continue;
            };
            while let Some(frame) = buffer.queue.front() {
                match tap_tx.try_send(frame.clone()) {
                    Ok(()) => {
                        buffer.queue.pop_front();
                    }
                    Err(_) => return,
                }
            }
        }
    }

    pub fn remove_peer(&mut self, src: PeerId) {
        self.buffers.remove(&src);
        self.rotation.retain(|p| *p != src);
    }

    /// Evicts buffers that have been idle past the inactivity window.
    pub fn tick(&mut self, now: Instant) {
        let idle: Vec<PeerId> = self
            .buffers
            .iter()
            .filter(|(_, b)| {
                b.queue.is_empty() && now.duration_since(b.last_activity) >= self.inactivity
            })
            .map(|(p, _)| *p)
            .collect();
        for src in idle {
            self.remove_peer(src);
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }
}
