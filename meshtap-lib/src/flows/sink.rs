//! Per-link sender state: fair rotation over attached flows, keepalive
//! emission and liveness detection from the received-data flag.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::flows::FlowKey;
use crate::proto::dataproto::{DataPacket, FLAG_RECEIVED_DATA};
use crate::PeerId;

/// Liveness edge reported to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Up,
    Down,
}

pub struct DataProtoSink {
    owner: PeerId,
    tx: mpsc::Sender<Bytes>,
    rotation: VecDeque<FlowKey>,
    keepalive_interval: Duration,
    receive_timer: Duration,
    last_send: Instant,
    recv_deadline: Instant,
    last_activity: Option<Instant>,
    up: bool,
}

impl DataProtoSink {
    pub fn new(
        owner: PeerId,
        tx: mpsc::Sender<Bytes>,
        keepalive_interval: Duration,
        receive_timer: Duration,
        now: Instant,
    ) -> DataProtoSink {
        DataProtoSink {
            owner,
            tx,
            rotation: VecDeque::new(),
            keepalive_interval,
            receive_timer,
            last_send: now,
            recv_deadline: now + receive_timer,
            last_activity: None,
            up: false,
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn add_flow(&mut self, key: FlowKey) {
        debug_assert!(!self.rotation.contains(&key));
        self.rotation.push_back(key);
    }

    pub fn remove_flow(&mut self, key: FlowKey) {
        self.rotation.retain(|k| *k != key);
    }

    pub fn flows(&self) -> impl Iterator<Item = FlowKey> + '_ {
        self.rotation.iter().copied()
    }

    /// Next flow to drain; the caller rotates through until the writer has
    /// no more capacity.
    pub fn rotate(&mut self) -> Option<FlowKey> {
        let key = self.rotation.pop_front()?;
        self.rotation.push_back(key);
        Some(key)
    }

    pub fn num_flows(&self) -> usize {
        self.rotation.len()
    }

    /// Hands an encoded packet to the link writer; false when the writer is
    /// saturated and the packet must stay buffered.
    pub fn try_send(&mut self, packet: Bytes, now: Instant) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.last_send = now;
                true
            }
            Err(_) => false,
        }
    }

    /// Flag value for outgoing packets: set while traffic from the peer has
    /// been seen within the receive window.
    pub fn received_flag(&self, now: Instant) -> u8 {
        match self.last_activity {
            Some(at) if now.duration_since(at) < self.receive_timer => FLAG_RECEIVED_DATA,
            _ => 0,
        }
    }

    /// Accounts an incoming packet on this link. Returns `Up` on the first
    /// packet carrying the received-data flag after a down period.
    pub fn on_packet(&mut self, flags: u8, now: Instant) -> Option<LinkSignal> {
        self.last_activity = Some(now);
        if flags & FLAG_RECEIVED_DATA == 0 {
            return None;
        }
        self.recv_deadline = now + self.receive_timer;
        if !self.up {
            self.up = true;
            return Some(LinkSignal::Up);
        }
        None
    }

    /// Keepalive/liveness housekeeping. Emits a keepalive when the link was
    /// silent for a full interval and reports `Down` when the receive timer
    /// expires.
    pub fn tick(&mut self, from: PeerId, now: Instant) -> Option<LinkSignal> {
        if now.duration_since(self.last_send) >= self.keepalive_interval {
            let mut ka = DataPacket::keepalive(from);
            ka.flags = self.received_flag(now);
            // best effort: a saturated writer means traffic is moving anyway
            self.try_send(ka.encode(), now);
        }
        if self.up && now >= self.recv_deadline {
            self.up = false;
            return Some(LinkSignal::Down);
        }
        None
    }
}
