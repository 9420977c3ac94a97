//! DataProto frame format carried over peer links:
//! `flags:u8 | from_id:u16 LE | num_dest:u8 | dest_id:u16 LE × num_dest | payload`.
//! An empty payload is a keepalive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::consts::DATAPROTO_MAX_PEER_IDS;
use crate::PeerId;

/// The sender has recently received traffic on this link; feeds the remote
/// liveness timer.
pub const FLAG_RECEIVED_DATA: u8 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub flags: u8,
    pub from: PeerId,
    pub dests: Vec<PeerId>,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn keepalive(from: PeerId) -> DataPacket {
        DataPacket { flags: 0, from, dests: Vec::new(), payload: Bytes::new() }
    }

    pub fn is_keepalive(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        4 + 2 * self.dests.len() + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        debug_assert!(self.dests.len() <= DATAPROTO_MAX_PEER_IDS);
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u8(self.flags);
        out.put_u16_le(self.from);
        out.put_u8(self.dests.len() as u8);
        for dest in &self.dests {
            out.put_u16_le(*dest);
        }
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Option<DataPacket> {
        if buf.remaining() < 4 {
            return None;
        }
        let flags = buf.get_u8();
        let from = buf.get_u16_le();
        let num_dest = buf.get_u8() as usize;
        if num_dest > DATAPROTO_MAX_PEER_IDS || buf.remaining() < 2 * num_dest {
            return None;
        }
        let dests = (0..num_dest).map(|_| buf.get_u16_le()).collect();
        Some(DataPacket { flags, from, dests, payload: buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_destinations() {
        let pkt = DataPacket {
            flags: FLAG_RECEIVED_DATA,
            from: 3,
            dests: vec![1, 2],
            payload: Bytes::from_static(b"frame"),
        };
        let back = DataPacket::decode(pkt.encode()).expect("decode");
        assert_eq!(back, pkt);
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let ka = DataPacket::keepalive(9);
        assert!(ka.is_keepalive());
        let back = DataPacket::decode(ka.encode()).expect("decode");
        assert!(back.is_keepalive());
        assert_eq!(back.from, 9);
        assert!(back.dests.is_empty());
    }

    #[test]
    fn test_truncated_dest_list_rejected() {
        let pkt = DataPacket {
            flags: 0,
            from: 1,
            dests: vec![2, 3],
            payload: Bytes::new(),
        };
        let enc = pkt.encode();
        assert!(DataPacket::decode(enc.slice(..enc.len() - 1)).is_none());
    }

    #[test]
    fn test_excessive_dest_count_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u8(0);
        raw.put_u16_le(1);
        raw.put_u8((DATAPROTO_MAX_PEER_IDS + 1) as u8);
        raw.put_bytes(0, 2 * (DATAPROTO_MAX_PEER_IDS + 1));
        assert!(DataPacket::decode(raw.freeze()).is_none());
    }
}
