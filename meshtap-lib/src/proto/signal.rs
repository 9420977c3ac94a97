//! Peer-to-peer control messages, relayed through the rendezvous server.
//! Framed as `type:u16 LE | payload_len:u16 LE | payload`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MSG_YOUCONNECT: u16 = 0;
pub const MSG_CANNOTCONNECT: u16 = 1;
pub const MSG_CANNOTBIND: u16 = 2;
pub const MSG_YOURETRY: u16 = 3;
pub const MSG_SEED: u16 = 4;
pub const MSG_CONFIRMSEED: u16 = 5;

const ADDR_KIND_V4: u8 = 4;
const ADDR_KIND_V6: u8 = 6;

/// An external address tagged with the scope it is reachable from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedAddr {
    pub scope: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Master offers a direct endpoint: address candidates plus the UDP
    /// encryption key or the TCP connect password.
    YouConnect {
        addrs: Vec<ScopedAddr>,
        key: Option<Vec<u8>>,
        password: Option<u64>,
    },
    CannotConnect,
    CannotBind,
    YouRetry,
    Seed { seed_id: u16, key: Vec<u8>, iv: Vec<u8> },
    ConfirmSeed { seed_id: u16 },
}

impl PeerMessage {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        let msg_type = match self {
            PeerMessage::YouConnect { addrs, key, password } => {
                payload.put_u8(addrs.len() as u8);
                for a in addrs {
                    let scope = a.scope.as_bytes();
                    payload.put_u8(scope.len() as u8);
                    payload.extend_from_slice(scope);
                    match a.addr.ip() {
                        IpAddr::V4(ip) => {
                            payload.put_u8(ADDR_KIND_V4);
                            payload.extend_from_slice(&ip.octets());
                        }
                        IpAddr::V6(ip) => {
                            payload.put_u8(ADDR_KIND_V6);
                            payload.extend_from_slice(&ip.octets());
                        }
                    }
                    payload.put_u16_le(a.addr.port());
                }
                payload.put_u8(key.as_ref().map(|k| k.len()).unwrap_or(0) as u8);
                if let Some(key) = key {
                    payload.extend_from_slice(key);
                }
                payload.put_u8(password.is_some() as u8);
                if let Some(p) = password {
                    payload.put_u64_le(*p);
                }
                MSG_YOUCONNECT
            }
            PeerMessage::CannotConnect => MSG_CANNOTCONNECT,
            PeerMessage::CannotBind => MSG_CANNOTBIND,
            PeerMessage::YouRetry => MSG_YOURETRY,
            PeerMessage::Seed { seed_id, key, iv } => {
                payload.put_u16_le(*seed_id);
                payload.put_u8(key.len() as u8);
                payload.extend_from_slice(key);
                payload.put_u8(iv.len() as u8);
                payload.extend_from_slice(iv);
                MSG_SEED
            }
            PeerMessage::ConfirmSeed { seed_id } => {
                payload.put_u16_le(*seed_id);
                MSG_CONFIRMSEED
            }
        };
        let mut out = BytesMut::with_capacity(4 + payload.len());
        out.put_u16_le(msg_type);
        out.put_u16_le(payload.len() as u16);
        out.extend_from_slice(&payload);
        out.freeze()
    }

    /// Strict decode; any length mismatch or stray trailing data yields
    /// `None` and the message is ignored upstream.
    pub fn decode(mut buf: Bytes) -> Option<PeerMessage> {
        if buf.remaining() < 4 {
            return None;
        }
        let msg_type = buf.get_u16_le();
        let payload_len = buf.get_u16_le() as usize;
        if buf.remaining() != payload_len {
            return None;
        }
        match msg_type {
            MSG_YOUCONNECT => {
                let num_addrs = take_u8(&mut buf)? as usize;
                let mut addrs = Vec::with_capacity(num_addrs);
                for _ in 0..num_addrs {
                    let scope_len = take_u8(&mut buf)? as usize;
                    let scope = take_bytes(&mut buf, scope_len)?;
                    let scope = String::from_utf8(scope.to_vec()).ok()?;
                    let ip: IpAddr = match take_u8(&mut buf)? {
                        ADDR_KIND_V4 => {
                            let o = take_bytes(&mut buf, 4)?;
                            Ipv4Addr::new(o[0], o[1], o[2], o[3]).into()
                        }
                        ADDR_KIND_V6 => {
                            let o = take_bytes(&mut buf, 16)?;
                            let mut b = [0u8; 16];
                            b.copy_from_slice(&o);
                            Ipv6Addr::from(b).into()
                        }
                        _ => return None,
                    };
                    if buf.remaining() < 2 {
                        return None;
                    }
                    let port = buf.get_u16_le();
                    addrs.push(ScopedAddr { scope, addr: SocketAddr::new(ip, port) });
                }
                let key_len = take_u8(&mut buf)? as usize;
                let key = if key_len > 0 {
                    Some(take_bytes(&mut buf, key_len)?.to_vec())
                } else {
                    None
                };
                let password = match take_u8(&mut buf)? {
                    0 => None,
                    1 => {
                        if buf.remaining() < 8 {
                            return None;
                        }
                        Some(buf.get_u64_le())
                    }
                    _ => return None,
                };
                end(&buf)?;
                Some(PeerMessage::YouConnect { addrs, key, password })
            }
            MSG_CANNOTCONNECT => end(&buf).map(|_| PeerMessage::CannotConnect),
            MSG_CANNOTBIND => end(&buf).map(|_| PeerMessage::CannotBind),
            MSG_YOURETRY => end(&buf).map(|_| PeerMessage::YouRetry),
            MSG_SEED => {
                if buf.remaining() < 2 {
                    return None;
                }
                let seed_id = buf.get_u16_le();
                let key_len = take_u8(&mut buf)? as usize;
                let key = take_bytes(&mut buf, key_len)?.to_vec();
                let iv_len = take_u8(&mut buf)? as usize;
                let iv = take_bytes(&mut buf, iv_len)?.to_vec();
                end(&buf)?;
                Some(PeerMessage::Seed { seed_id, key, iv })
            }
            MSG_CONFIRMSEED => {
                if buf.remaining() != 2 {
                    return None;
                }
                Some(PeerMessage::ConfirmSeed { seed_id: buf.get_u16_le() })
            }
            _ => None,
        }
    }
}

fn take_u8(buf: &mut Bytes) -> Option<u8> {
    buf.has_remaining().then(|| buf.get_u8())
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Option<Bytes> {
    (buf.remaining() >= len).then(|| buf.split_to(len))
}

fn end(buf: &Bytes) -> Option<()> {
    buf.is_empty().then_some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youconnect_roundtrip_udp() {
        let msg = PeerMessage::YouConnect {
            addrs: vec![
                ScopedAddr { scope: "lan".into(), addr: "127.0.0.1:10000".parse().unwrap() },
                ScopedAddr { scope: "inet".into(), addr: "[2001:db8::1]:443".parse().unwrap() },
            ],
            key: Some(vec![7u8; 16]),
            password: None,
        };
        assert_eq!(PeerMessage::decode(msg.encode()), Some(msg));
    }

    #[test]
    fn test_youconnect_roundtrip_tcp_password() {
        let msg = PeerMessage::YouConnect {
            addrs: vec![ScopedAddr {
                scope: "lan".into(),
                addr: "10.0.0.1:7000".parse().unwrap(),
            }],
            key: None,
            password: Some(0x0123456789abcdef),
        };
        assert_eq!(PeerMessage::decode(msg.encode()), Some(msg));
    }

    #[test]
    fn test_simple_messages_roundtrip() {
        for msg in [
            PeerMessage::CannotConnect,
            PeerMessage::CannotBind,
            PeerMessage::YouRetry,
            PeerMessage::ConfirmSeed { seed_id: 42 },
        ] {
            assert_eq!(PeerMessage::decode(msg.encode()), Some(msg));
        }
    }

    #[test]
    fn test_seed_roundtrip() {
        let msg = PeerMessage::Seed {
            seed_id: 1,
            key: vec![1u8; 16],
            iv: vec![2u8; 8],
        };
        assert_eq!(PeerMessage::decode(msg.encode()), Some(msg));
    }

    #[test]
    fn test_unknown_type_ignored() {
        let mut raw = BytesMut::new();
        raw.put_u16_le(99);
        raw.put_u16_le(0);
        assert_eq!(PeerMessage::decode(raw.freeze()), None);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let enc = PeerMessage::ConfirmSeed { seed_id: 1 }.encode();
        assert!(PeerMessage::decode(enc.slice(..enc.len() - 1)).is_none());

        let mut padded = BytesMut::from(&enc[..]);
        padded.put_u8(0);
        assert!(PeerMessage::decode(padded.freeze()).is_none());
    }

    #[test]
    fn test_stray_data_in_payload_rejected() {
        let msg = PeerMessage::CannotBind.encode();
        let mut raw = BytesMut::from(&msg[..]);
        raw[2] = 1; // claim 1 byte of payload
        raw.put_u8(0xaa);
        assert!(PeerMessage::decode(raw.freeze()).is_none());
    }
}
