//! Frame decider: answers "which peers receive this outbound frame?".
//!
//! Source MACs from peer traffic populate a bounded LRU learning table;
//! IGMP snooping tracks per-peer multicast group membership with aging
//! deadlines. Device-side frames are analyzed for queries and then decided:
//! broadcast goes to every peer, IPv4 multicast to the group members, known
//! unicast to the learned peer, anything else is flooded.

pub mod lru;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ahash::RandomState;
use tokio::time::Instant;
use tracing::debug;

use crate::decider::lru::LruList;
use crate::PeerId;

pub type Mac = [u8; 6];

pub const ETHERNET_HEADER_LEN: usize = 14;

const BROADCAST: Mac = [0xff; 6];
const MULTICAST_IPV4_PREFIX: [u8; 3] = [0x01, 0x00, 0x5e];

/// IPv4 multicast group identity as carried by a mapped Ethernet address:
/// the low 23 bits of the group address.
fn masked_group(group: u32) -> u32 {
    group & 0x007f_ffff
}

#[derive(Debug, Clone, Copy)]
pub struct DeciderConfig {
    pub max_macs: usize,
    pub max_groups: usize,
    pub igmp_group_membership_interval: Duration,
    pub igmp_last_member_query_time: Duration,
}

struct MacEntry {
    mac: Mac,
    peer: PeerId,
}

struct GroupEntry {
    peer: PeerId,
    group: u32,
    deadline: Instant,
}

pub struct FrameDecider {
    cfg: DeciderConfig,
    peers: HashSet<PeerId, RandomState>,
    mac_index: HashMap<Mac, usize, RandomState>,
    mac_lru: LruList<MacEntry>,
    group_index: HashMap<(PeerId, u32), usize, RandomState>,
    group_lru: LruList<GroupEntry>,
    members: HashMap<u32, HashSet<PeerId, RandomState>, RandomState>,
}

impl FrameDecider {
    pub fn new(cfg: DeciderConfig) -> FrameDecider {
        FrameDecider {
            cfg,
            peers: HashSet::default(),
            mac_index: HashMap::default(),
            mac_lru: LruList::new(),
            group_index: HashMap::default(),
            group_lru: LruList::new(),
            members: HashMap::default(),
        }
    }

    pub fn add_peer(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        let macs: Vec<usize> = self
            .mac_lru
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(h, _)| h)
            .collect();
        for h in macs {
            let entry = self.mac_lru.remove(h);
            self.mac_index.remove(&entry.mac);
        }
        let groups: Vec<usize> = self
            .group_lru
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(h, _)| h)
            .collect();
        for h in groups {
            self.drop_group(h);
        }
    }

    pub fn num_macs(&self) -> usize {
        self.mac_lru.len()
    }

    pub fn num_groups(&self) -> usize {
        self.group_lru.len()
    }

    /// Analyzes a frame received from `peer`: learns the source MAC and
    /// tracks IGMP membership changes.
    pub fn analyze_peer_frame(&mut self, peer: PeerId, frame: &[u8], now: Instant) {
        if frame.len() < ETHERNET_HEADER_LEN {
            return;
        }
        let src: Mac = frame[6..12].try_into().expect("slice is 6 bytes");
        if src[0] & 1 == 0 {
            self.learn_mac(peer, src);
        }
        for op in parse_igmp(frame) {
            match op {
                Igmp::Report(group) => self.join_group(peer, masked_group(group), now),
                Igmp::Leave(group) => {
                    self.shorten_membership(Some(peer), masked_group(group), now)
                }
                Igmp::Query { group: Some(group) } => {
                    self.shorten_membership(None, masked_group(group), now)
                }
                Igmp::Query { group: None } => {}
            }
        }
    }

    /// Analyzes a device-side frame before deciding destinations; only the
    /// observed IGMP queries matter here.
    pub fn analyze_device_frame(&mut self, frame: &[u8], now: Instant) {
        if frame.len() < ETHERNET_HEADER_LEN {
            return;
        }
        for op in parse_igmp(frame) {
            if let Igmp::Query { group: Some(group) } = op {
                self.shorten_membership(None, masked_group(group), now);
            }
        }
    }

    /// Destination peers for an outbound frame.
    pub fn decide(&self, frame: &[u8], now: Instant) -> Vec<PeerId> {
        if frame.len() < ETHERNET_HEADER_LEN {
            return Vec::new();
        }
        let dst: Mac = frame[0..6].try_into().expect("slice is 6 bytes");
        if dst == BROADCAST {
            return self.all_peers();
        }
        if dst[0..3] == MULTICAST_IPV4_PREFIX && dst[3] & 0x80 == 0 {
            let group =
                ((dst[3] as u32 & 0x7f) << 16) | ((dst[4] as u32) << 8) | dst[5] as u32;
            return match self.members.get(&group) {
                Some(members) => members
                    .iter()
                    .copied()
                    .filter(|p| self.membership_live(*p, group, now))
                    .collect(),
                None => Vec::new(),
            };
        }
        if dst[0] & 1 == 0 {
            if let Some(&h) = self.mac_index.get(&dst) {
                let peer = self.mac_lru.get(h).peer;
                if self.peers.contains(&peer) {
                    return vec![peer];
                }
            }
        }
        // unknown unicast and non-IPv4 group traffic floods
        self.all_peers()
    }

    /// Drops expired group memberships.
    pub fn tick(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .group_lru
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(h, _)| h)
            .collect();
        for h in expired {
            let entry = self.group_lru.get(h);
            debug!(peer = entry.peer, group = entry.group, "group membership expired");
            self.drop_group(h);
        }
    }

    fn all_peers(&self) -> Vec<PeerId> {
        self.peers.iter().copied().collect()
    }

    fn membership_live(&self, peer: PeerId, group: u32, now: Instant) -> bool {
        self.group_index
            .get(&(peer, group))
            .map(|&h| self.group_lru.get(h).deadline > now)
            .unwrap_or(false)
    }

    fn learn_mac(&mut self, peer: PeerId, mac: Mac) {
        match self.mac_index.get(&mac) {
            Some(&h) => {
                self.mac_lru.get_mut(h).peer = peer;
                self.mac_lru.touch(h);
            }
            None => {
                if self.mac_lru.len() == self.cfg.max_macs {
                    let lru = self.mac_lru.lru().expect("table is non-empty");
                    let evicted = self.mac_lru.remove(lru);
                    self.mac_index.remove(&evicted.mac);
                }
                let h = self.mac_lru.insert(MacEntry { mac, peer });
                self.mac_index.insert(mac, h);
            }
        }
    }

    fn join_group(&mut self, peer: PeerId, group: u32, now: Instant) {
        let deadline = now + self.cfg.igmp_group_membership_interval;
        match self.group_index.get(&(peer, group)) {
            Some(&h) => {
                self.group_lru.get_mut(h).deadline = deadline;
                self.group_lru.touch(h);
            }
            None => {
                if self.group_lru.len() == self.cfg.max_groups {
                    let lru = self.group_lru.lru().expect("table is non-empty");
                    self.drop_group(lru);
                }
                let h = self.group_lru.insert(GroupEntry { peer, group, deadline });
                self.group_index.insert((peer, group), h);
                self.members.entry(group).or_default().insert(peer);
            }
        }
    }

    /// A leave or a group-specific query caps the remaining membership
    /// lifetime at the last-member-query time.
    fn shorten_membership(&mut self, only_peer: Option<PeerId>, group: u32, now: Instant) {
        let cap = now + self.cfg.igmp_last_member_query_time;
        let handles: Vec<usize> = self
            .group_lru
            .iter()
            .filter(|(_, e)| e.group == group && only_peer.is_none_or(|p| e.peer == p))
            .map(|(h, _)| h)
            .collect();
        for h in handles {
            let entry = self.group_lru.get_mut(h);
            entry.deadline = entry.deadline.min(cap);
        }
    }

    fn drop_group(&mut self, h: usize) {
        let entry = self.group_lru.remove(h);
        self.group_index.remove(&(entry.peer, entry.group));
        if let Some(members) = self.members.get_mut(&entry.group) {
            members.remove(&entry.peer);
            if members.is_empty() {
                self.members.remove(&entry.group);
            }
        }
    }
}

enum Igmp {
    Report(u32),
    Leave(u32),
    Query { group: Option<u32> },
}

// IGMPv3 group record types
const MODE_IS_INCLUDE: u8 = 1;
const MODE_IS_EXCLUDE: u8 = 2;
const CHANGE_TO_INCLUDE: u8 = 3;
const CHANGE_TO_EXCLUDE: u8 = 4;

/// Extracts the IGMP operations from an Ethernet frame, if it carries any.
fn parse_igmp(frame: &[u8]) -> Vec<Igmp> {
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != 0x0800 {
        return Vec::new();
    }
    let Some(ip) = frame.get(ETHERNET_HEADER_LEN..) else {
        return Vec::new();
    };
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return Vec::new();
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < 20 || ip.len() < ihl {
        return Vec::new();
    }
    if ip[9] != 2 {
        return Vec::new();
    }
    let igmp = &ip[ihl..];
    if igmp.len() < 8 {
        return Vec::new();
    }
    let group = u32::from_be_bytes([igmp[4], igmp[5], igmp[6], igmp[7]]);
    match igmp[0] {
        0x12 | 0x16 => vec![Igmp::Report(group)],
        0x17 => vec![Igmp::Leave(group)],
        0x11 => vec![Igmp::Query { group: (group != 0).then_some(group) }],
        0x22 => parse_igmpv3_report(igmp),
        _ => Vec::new(),
    }
}

/// IGMPv3 membership report: one operation per group record. An EXCLUDE
/// filter mode is a join, an INCLUDE mode with no sources is a leave.
fn parse_igmpv3_report(igmp: &[u8]) -> Vec<Igmp> {
    let num_records = u16::from_be_bytes([igmp[6], igmp[7]]) as usize;
    let mut ops = Vec::new();
    let mut rest = &igmp[8..];
    for _ in 0..num_records {
        if rest.len() < 8 {
            break;
        }
        let rec_type = rest[0];
        let aux_len = rest[1] as usize * 4;
        let num_sources = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let group = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let rec_len = 8 + 4 * num_sources + aux_len;
        if rest.len() < rec_len {
            break;
        }
        match rec_type {
            MODE_IS_EXCLUDE | CHANGE_TO_EXCLUDE => ops.push(Igmp::Report(group)),
            MODE_IS_INCLUDE | CHANGE_TO_INCLUDE if num_sources == 0 => {
                ops.push(Igmp::Leave(group))
            }
            _ => {}
        }
        rest = &rest[rec_len..];
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg() -> DeciderConfig {
        DeciderConfig {
            max_macs: 4,
            max_groups: 4,
            igmp_group_membership_interval: Duration::from_secs(260),
            igmp_last_member_query_time: Duration::from_secs(2),
        }
    }

    fn eth(dst: Mac, src: Mac) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend_from_slice(&[0u8; 20]);
        f
    }

    fn mac(last: u8) -> Mac {
        [0xaa, 0, 0, 0, 0, last]
    }

    fn igmp_frame(src: Mac, igmp_type: u8, group: [u8; 4]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x01, 0x00, 0x5e, 0, 0, 1]);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0x08, 0x00]);
        // minimal IPv4 header, proto 2
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 2;
        f.extend_from_slice(&ip);
        f.extend_from_slice(&[igmp_type, 0, 0, 0]);
        f.extend_from_slice(&group);
        f
    }

    #[test]
    fn test_unknown_unicast_floods_then_learns() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        d.add_peer(2);

        let to_b = eth(mac(2), mac(1));
        let mut dests = d.decide(&to_b, now);
        dests.sort_unstable();
        assert_eq!(dests, vec![1, 2], "unknown unicast floods");

        // a frame from peer 2 teaches us where aa:...:02 lives
        d.analyze_peer_frame(2, &eth(mac(1), mac(2)), now);
        assert_eq!(d.decide(&to_b, now), vec![2]);
    }

    #[test]
    fn test_broadcast_goes_to_all() {
        let mut d = FrameDecider::new(cfg());
        d.add_peer(1);
        d.add_peer(2);
        let mut dests = d.decide(&eth(BROADCAST, mac(9)), Instant::now());
        dests.sort_unstable();
        assert_eq!(dests, vec![1, 2]);
    }

    #[test]
    fn test_multicast_follows_igmp_membership() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        d.add_peer(2);

        // 239.1.2.3 -> mac 01:00:5e:01:02:03
        let group = [239, 1, 2, 3];
        d.analyze_peer_frame(1, &igmp_frame(mac(1), 0x16, group), now);

        let frame = eth([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03], mac(9));
        assert_eq!(d.decide(&frame, now), vec![1]);

        // non-member group has no destinations
        let other = eth([0x01, 0x00, 0x5e, 0x04, 0x05, 0x06], mac(9));
        assert!(d.decide(&other, now).is_empty());
    }

    #[test]
    fn test_membership_ages_out() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        let group = [239, 1, 2, 3];
        d.analyze_peer_frame(1, &igmp_frame(mac(1), 0x16, group), now);

        let frame = eth([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03], mac(9));
        let later = now + Duration::from_secs(261);
        assert!(d.decide(&frame, later).is_empty());
        d.tick(later);
        assert_eq!(d.num_groups(), 0);
    }

    #[test]
    fn test_group_specific_query_accelerates_expiry() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        let group = [239, 1, 2, 3];
        d.analyze_peer_frame(1, &igmp_frame(mac(1), 0x16, group), now);

        // query observed on the device side caps the lifetime at 2s
        d.analyze_device_frame(&igmp_frame(mac(9), 0x11, group), now);

        let frame = eth([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03], mac(9));
        assert_eq!(d.decide(&frame, now + Duration::from_secs(1)), vec![1]);
        assert!(d.decide(&frame, now + Duration::from_secs(3)).is_empty());
    }

    #[test]
    fn test_mac_table_bounded_with_lru_eviction() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        d.add_peer(2);
        for i in 0..5u8 {
            d.analyze_peer_frame(1, &eth(mac(99), mac(i)), now);
        }
        assert_eq!(d.num_macs(), cfg().max_macs);
        // mac(0) was evicted: frames to it flood again
        let mut flooded = d.decide(&eth(mac(0), mac(99)), now);
        flooded.sort_unstable();
        assert_eq!(flooded, vec![1, 2]);
        assert_eq!(d.decide(&eth(mac(4), mac(99)), now), vec![1]);
    }

    #[test]
    fn test_igmpv3_exclude_record_joins() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);

        let mut f = Vec::new();
        f.extend_from_slice(&[0x01, 0x00, 0x5e, 0, 0, 0x16]);
        f.extend_from_slice(&mac(1));
        f.extend_from_slice(&[0x08, 0x00]);
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 2;
        f.extend_from_slice(&ip);
        // v3 report, one CHANGE_TO_EXCLUDE record for 239.1.2.3
        f.extend_from_slice(&[0x22, 0, 0, 0, 0, 0, 0, 1]);
        f.extend_from_slice(&[4, 0, 0, 0, 239, 1, 2, 3]);
        d.analyze_peer_frame(1, &f, now);

        let frame = eth([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03], mac(9));
        assert_eq!(d.decide(&frame, now), vec![1]);
    }

    #[test]
    fn test_group_table_bounded() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        for i in 0..6u8 {
            d.analyze_peer_frame(1, &igmp_frame(mac(1), 0x16, [239, 0, 0, i]), now);
        }
        assert_eq!(d.num_groups(), cfg().max_groups);
    }

    #[test]
    fn test_remove_peer_purges_state() {
        let mut d = FrameDecider::new(cfg());
        let now = Instant::now();
        d.add_peer(1);
        d.add_peer(2);
        d.analyze_peer_frame(1, &eth(mac(9), mac(1)), now);
        d.analyze_peer_frame(1, &igmp_frame(mac(1), 0x16, [239, 1, 2, 3]), now);
        d.remove_peer(1);
        assert_eq!(d.num_macs(), 0);
        assert_eq!(d.num_groups(), 0);
        assert_eq!(d.decide(&eth(mac(1), mac(9)), now), vec![2], "flood excludes removed peer");
    }
}
