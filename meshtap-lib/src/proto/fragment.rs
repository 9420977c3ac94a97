//! Fragmentation codec.
//!
//! A frame is cut into chunks, each prefixed with
//! `frame_id:u16 LE | chunk_start:u16 LE | chunk_len:u16 LE | is_last:u8`.
//! Chunks are packed greedily into output packets no larger than the output
//! MTU. The assembler keeps a bounded number of in-flight frames and requires
//! chunks of one frame to arrive in order without gaps.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const CHUNK_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_id: u16,
    pub chunk_start: u16,
    pub chunk_len: u16,
    pub is_last: bool,
}

impl ChunkHeader {
    pub fn write(&self, out: &mut BytesMut) {
        out.put_u16_le(self.frame_id);
        out.put_u16_le(self.chunk_start);
        out.put_u16_le(self.chunk_len);
        out.put_u8(self.is_last as u8);
    }

    pub fn read(buf: &mut impl Buf) -> Option<ChunkHeader> {
        if buf.remaining() < CHUNK_HEADER_LEN {
            return None;
        }
        Some(ChunkHeader {
            frame_id: buf.get_u16_le(),
            chunk_start: buf.get_u16_le(),
            chunk_len: buf.get_u16_le(),
            is_last: buf.get_u8() != 0,
        })
    }
}

/// Splits frames into chunked output packets.
///
/// A partially filled output packet is kept open across frames so that small
/// frames coalesce; the caller decides when to [`flush`](Self::flush).
pub struct Disassembler {
    output_mtu: usize,
    chunk_mtu: usize,
    next_frame_id: u16,
    current: BytesMut,
}

impl Disassembler {
    /// `output_mtu` must leave room for at least one header plus one byte of
    /// payload. `chunk_mtu` optionally limits a single chunk's payload.
    pub fn new(output_mtu: usize, chunk_mtu: Option<usize>) -> Disassembler {
        assert!(output_mtu > CHUNK_HEADER_LEN);
        let chunk_mtu = chunk_mtu.unwrap_or(u16::MAX as usize).min(u16::MAX as usize);
        assert!(chunk_mtu > 0);
        Disassembler {
            output_mtu,
            chunk_mtu,
            next_frame_id: 0,
            current: BytesMut::new(),
        }
    }

    /// Encodes one frame, appending every output packet that fills up to
    /// `out`. The trailing partially filled packet stays open.
    pub fn push_frame(&mut self, frame: &[u8], out: &mut Vec<Bytes>) {
        assert!(frame.len() <= u16::MAX as usize);
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let mut pos = 0usize;
        loop {
            let space = self.output_mtu - self.current.len();
            let min_chunk = CHUNK_HEADER_LEN + usize::from(!frame.is_empty());
            if space < min_chunk {
                out.push(self.current.split().freeze());
                continue;
            }

            let chunk_len = (frame.len() - pos)
                .min(space - CHUNK_HEADER_LEN)
                .min(self.chunk_mtu);
            let is_last = pos + chunk_len == frame.len();
            ChunkHeader {
                frame_id,
                chunk_start: pos as u16,
                chunk_len: chunk_len as u16,
                is_last,
            }
            .write(&mut self.current);
            self.current.extend_from_slice(&frame[pos..pos + chunk_len]);
            pos += chunk_len;

            if is_last {
                break;
            }
        }

        if self.output_mtu - self.current.len() < CHUNK_HEADER_LEN + 1 {
            out.push(self.current.split().freeze());
        }
    }

    /// Emits the open partially filled packet, if any.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.current.split().freeze())
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.current.is_empty()
    }
}

struct Slot {
    frame_id: u16,
    buf: BytesMut,
    last_touch: u64,
}

/// Reassembles chunked packets back into frames.
pub struct Assembler {
    slots: Vec<Slot>,
    num_slots: usize,
    max_frame: usize,
    clock: u64,
}

impl Assembler {
    pub fn new(num_slots: usize, max_frame: usize) -> Assembler {
        assert!(num_slots > 0);
        Assembler {
            slots: Vec::with_capacity(num_slots),
            num_slots,
            max_frame,
            clock: 0,
        }
    }

    /// Feeds one received packet; completed frames are appended to `out`.
    /// Malformed trailing data silently ends processing of the packet.
    pub fn input(&mut self, packet: &[u8], out: &mut Vec<Bytes>) {
        let mut buf = packet;
        while buf.has_remaining() {
            let Some(header) = ChunkHeader::read(&mut buf) else {
                return;
            };
            let len = header.chunk_len as usize;
            if buf.remaining() < len {
                return;
            }
            let payload = &buf[..len];
            self.input_chunk(header, payload, out);
            buf.advance(len);
        }
    }

    fn input_chunk(&mut self, header: ChunkHeader, payload: &[u8], out: &mut Vec<Bytes>) {
        self.clock += 1;
        let clock = self.clock;

        match self.slots.iter().position(|s| s.frame_id == header.frame_id) {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.last_touch = clock;
                if header.chunk_start as usize != slot.buf.len() {
                    // out-of-order or gap chunk invalidates the whole frame
                    self.slots.swap_remove(idx);
                    return;
                }
                if slot.buf.len() + payload.len() > self.max_frame {
                    self.slots.swap_remove(idx);
                    return;
                }
                slot.buf.extend_from_slice(payload);
                if header.is_last {
                    let slot = self.slots.swap_remove(idx);
                    out.push(slot.buf.freeze());
                }
            }
            None => {
                if header.chunk_start != 0 {
                    return;
                }
                if payload.len() > self.max_frame {
                    return;
                }
                if header.is_last {
                    out.push(Bytes::copy_from_slice(payload));
                    return;
                }
                if self.slots.len() == self.num_slots {
                    let oldest = self
                        .slots
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.last_touch)
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    self.slots.swap_remove(oldest);
                }
                let mut buf = BytesMut::with_capacity(self.max_frame.min(4096));
                buf.extend_from_slice(payload);
                self.slots.push(Slot {
                    frame_id: header.frame_id,
                    buf,
                    last_touch: clock,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frames: &[&[u8]], output_mtu: usize) -> Vec<Bytes> {
        let mut dis = Disassembler::new(output_mtu, None);
        let mut packets = Vec::new();
        for frame in frames {
            dis.push_frame(frame, &mut packets);
        }
        if let Some(p) = dis.flush() {
            packets.push(p);
        }
        let mut asm = Assembler::new(4, 4096);
        let mut out = Vec::new();
        for p in &packets {
            asm.input(p, &mut out);
        }
        out
    }

    #[test]
    fn test_roundtrip_single_small_frame() {
        let frame = b"hello world".as_slice();
        let out = roundtrip(&[frame], 64);
        assert_eq!(out, vec![Bytes::copy_from_slice(frame)]);
    }

    #[test]
    fn test_roundtrip_large_frame_multiple_packets() {
        let frame: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let out = roundtrip(&[&frame], 200);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn test_empty_frame_single_last_chunk() {
        let mut dis = Disassembler::new(64, None);
        let mut packets = Vec::new();
        dis.push_frame(&[], &mut packets);
        let p = dis.flush().expect("open packet");
        assert!(packets.is_empty());
        let mut buf = &p[..];
        let h = ChunkHeader::read(&mut buf).expect("header");
        assert_eq!(h.chunk_len, 0);
        assert!(h.is_last);
        assert!(!buf.has_remaining());

        let mut asm = Assembler::new(4, 4096);
        let mut out = Vec::new();
        asm.input(&p, &mut out);
        assert_eq!(out, vec![Bytes::new()]);
    }

    #[test]
    fn test_chunk_count_bound() {
        let mtu = 200usize;
        let frame = vec![7u8; 1000];
        let mut dis = Disassembler::new(mtu, None);
        let mut packets = Vec::new();
        dis.push_frame(&frame, &mut packets);
        if let Some(p) = dis.flush() {
            packets.push(p);
        }
        let chunks: usize = packets
            .iter()
            .map(|p| {
                let mut n = 0;
                let mut buf = &p[..];
                while let Some(h) = ChunkHeader::read(&mut buf) {
                    buf.advance(h.chunk_len as usize);
                    n += 1;
                }
                n
            })
            .sum();
        let bound = frame.len().div_ceil(mtu - CHUNK_HEADER_LEN);
        // each full packet carries one maximal chunk, plus the remainder
        assert!(chunks <= bound + 1, "chunks = {chunks}, bound = {bound}");
    }

    #[test]
    fn test_coalesces_small_frames_into_one_packet() {
        let mut dis = Disassembler::new(512, None);
        let mut packets = Vec::new();
        dis.push_frame(b"aaaa", &mut packets);
        dis.push_frame(b"bbbb", &mut packets);
        assert!(packets.is_empty());
        let p = dis.flush().expect("coalesced packet");
        let mut asm = Assembler::new(4, 4096);
        let mut out = Vec::new();
        asm.input(&p, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], b"aaaa");
        assert_eq!(&out[1][..], b"bbbb");
    }

    #[test]
    fn test_out_of_order_chunk_discards_slot() {
        let mut asm = Assembler::new(4, 4096);
        let mut out = Vec::new();

        let mut p1 = BytesMut::new();
        ChunkHeader { frame_id: 9, chunk_start: 0, chunk_len: 4, is_last: false }.write(&mut p1);
        p1.extend_from_slice(b"abcd");
        asm.input(&p1, &mut out);

        // gap: start 8 instead of 4
        let mut p2 = BytesMut::new();
        ChunkHeader { frame_id: 9, chunk_start: 8, chunk_len: 4, is_last: true }.write(&mut p2);
        p2.extend_from_slice(b"efgh");
        asm.input(&p2, &mut out);
        assert!(out.is_empty());

        // frame id 9 is gone; a correct continuation no longer completes
        let mut p3 = BytesMut::new();
        ChunkHeader { frame_id: 9, chunk_start: 4, chunk_len: 4, is_last: true }.write(&mut p3);
        p3.extend_from_slice(b"efgh");
        asm.input(&p3, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_slot_eviction_least_recently_touched() {
        let mut asm = Assembler::new(2, 4096);
        let mut out = Vec::new();
        for id in 0..3u16 {
            let mut p = BytesMut::new();
            ChunkHeader { frame_id: id, chunk_start: 0, chunk_len: 1, is_last: false }
                .write(&mut p);
            p.extend_from_slice(&[id as u8]);
            asm.input(&p, &mut out);
        }
        // frame 0 was evicted; finishing it does nothing
        let mut p = BytesMut::new();
        ChunkHeader { frame_id: 0, chunk_start: 1, chunk_len: 1, is_last: true }.write(&mut p);
        p.extend_from_slice(b"x");
        asm.input(&p, &mut out);
        assert!(out.is_empty());

        // frames 1 and 2 still complete
        for id in 1..3u16 {
            let mut p = BytesMut::new();
            ChunkHeader { frame_id: id, chunk_start: 1, chunk_len: 1, is_last: true }
                .write(&mut p);
            p.extend_from_slice(b"y");
            asm.input(&p, &mut out);
        }
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_oversize_frame_dropped() {
        let mut asm = Assembler::new(2, 8);
        let mut out = Vec::new();
        let mut p = BytesMut::new();
        ChunkHeader { frame_id: 1, chunk_start: 0, chunk_len: 6, is_last: false }.write(&mut p);
        p.extend_from_slice(b"aaaaaa");
        asm.input(&p, &mut out);
        let mut p = BytesMut::new();
        ChunkHeader { frame_id: 1, chunk_start: 6, chunk_len: 6, is_last: true }.write(&mut p);
        p.extend_from_slice(b"bbbbbb");
        asm.input(&p, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_frame_id_wraps() {
        let mut dis = Disassembler::new(64, None);
        dis.next_frame_id = u16::MAX;
        let mut packets = Vec::new();
        dis.push_frame(b"a", &mut packets);
        dis.push_frame(b"b", &mut packets);
        assert_eq!(dis.next_frame_id, 1);
    }
}
