//! Secure-packet codec.
//!
//! Wire layout, outermost first:
//! `[hash][otp_seed_id:u16 LE | otp_index:u16 LE][iv][ciphertext]`,
//! each section present only when the corresponding feature is enabled.
//! The digest is computed over the whole packet with the hash field zeroed.
//! Decode failures are silent drops, never link errors.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::otp::{OtpParams, OtpReceiver, OtpSender, SendIndex};
use crate::crypto::{random_bytes, CipherMode, HashMode};

/// Security feature selection for one endpoint, shared by all UDP links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityParams {
    pub cipher: Option<CipherMode>,
    pub hash: Option<HashMode>,
    pub otp: Option<OtpParams>,
}

impl SecurityParams {
    /// Worst-case bytes the codec adds to a payload.
    pub fn overhead(&self) -> usize {
        let hash = self.hash.map(HashMode::digest_len).unwrap_or(0);
        let otp = if self.otp.is_some() { 4 } else { 0 };
        // IV plus length prefix plus a full block of padding
        let enc = self
            .cipher
            .map(|c| 2 * c.block_len() + 2)
            .unwrap_or(0);
        hash + otp + enc
    }

    /// Largest plaintext that fits a packet of `packet_mtu` bytes.
    pub fn payload_mtu(&self, packet_mtu: usize) -> usize {
        packet_mtu.saturating_sub(self.overhead())
    }
}

#[derive(Debug)]
pub enum EncodeError {
    /// Encryption enabled but no key installed yet.
    NoKey,
    /// OTP indices exhausted; packets drop until a fresh seed is confirmed.
    OtpExhausted,
}

pub struct Encoded {
    pub packet: Bytes,
    /// The send seed is approaching exhaustion; rotate.
    pub seed_warning: bool,
}

/// Send side: encrypt, stamp the OTP pair, digest.
pub struct SppEncoder {
    params: SecurityParams,
    key: Option<Vec<u8>>,
    otp: Option<OtpSender>,
}

impl SppEncoder {
    pub fn new(params: SecurityParams) -> SppEncoder {
        SppEncoder {
            params,
            key: None,
            otp: params.otp.map(OtpSender::new),
        }
    }

    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key = Some(key);
    }

    pub fn set_send_seed(&mut self, seed_id: u16) {
        if let Some(otp) = self.otp.as_mut() {
            otp.set_seed(seed_id);
        }
    }

    pub fn encode(&mut self, payload: &[u8]) -> Result<Encoded, EncodeError> {
        let mut seed_warning = false;
        let otp_pair = match self.otp.as_mut() {
            Some(otp) => match otp.next() {
                SendIndex::Unavailable => return Err(EncodeError::OtpExhausted),
                SendIndex::Ok { seed_id, index, warn } => {
                    seed_warning = warn;
                    Some((seed_id, index))
                }
            },
            None => None,
        };

        let hash_len = self.params.hash.map(HashMode::digest_len).unwrap_or(0);
        let mut packet = BytesMut::new();
        packet.put_bytes(0, hash_len);
        if let Some((seed_id, index)) = otp_pair {
            packet.put_u16_le(seed_id);
            packet.put_u16_le(index);
        }
        match self.params.cipher {
            Some(cipher) => {
                let key = self.key.as_ref().ok_or(EncodeError::NoKey)?;
                let iv = random_bytes(cipher.block_len());
                let ciphertext = cipher.encrypt(key, &iv, payload).ok_or(EncodeError::NoKey)?;
                packet.extend_from_slice(&iv);
                packet.extend_from_slice(&ciphertext);
            }
            None => packet.extend_from_slice(payload),
        }

        if let Some(hash) = self.params.hash {
            let digest = hash.digest(&packet);
            packet[..hash_len].copy_from_slice(&digest);
        }

        Ok(Encoded { packet: packet.freeze(), seed_warning })
    }
}

pub struct Decoded {
    pub payload: Bytes,
    /// First packet accepted under this pending receive seed; the session
    /// layer replies CONFIRMSEED.
    pub seed_ready: Option<u16>,
}

/// Receive side: digest check, replay check, decrypt, commit.
pub struct SppDecoder {
    params: SecurityParams,
    key: Option<Vec<u8>>,
    otp: Option<OtpReceiver>,
}

impl SppDecoder {
    pub fn new(params: SecurityParams) -> SppDecoder {
        SppDecoder {
            params,
            key: None,
            otp: params.otp.map(|p| OtpReceiver::new(p.num)),
        }
    }

    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key = Some(key);
    }

    pub fn add_recv_seed(&mut self, seed_id: u16) {
        if let Some(otp) = self.otp.as_mut() {
            otp.add_seed(seed_id);
        }
    }

    /// `None` means the packet is silently dropped.
    pub fn decode(&mut self, packet: &[u8]) -> Option<Decoded> {
        let hash_len = self.params.hash.map(HashMode::digest_len).unwrap_or(0);
        let otp_len = if self.params.otp.is_some() { 4 } else { 0 };
        if packet.len() < hash_len + otp_len {
            return None;
        }

        if let Some(hash) = self.params.hash {
            let mut zeroed = packet.to_vec();
            zeroed[..hash_len].fill(0);
            if hash.digest(&zeroed) != packet[..hash_len] {
                return None;
            }
        }

        let mut rest = &packet[hash_len..];
        let otp_pair = if self.params.otp.is_some() {
            let seed_id = u16::from_le_bytes([rest[0], rest[1]]);
            let index = u16::from_le_bytes([rest[2], rest[3]]);
            rest = &rest[4..];
            if !self.otp.as_ref().is_some_and(|o| o.check(seed_id, index)) {
                return None;
            }
            Some((seed_id, index))
        } else {
            None
        };

        let payload = match self.params.cipher {
            Some(cipher) => {
                let key = self.key.as_ref()?;
                let block = cipher.block_len();
                if rest.len() < block || (rest.len() - block) % block != 0 {
                    return None;
                }
                let (iv, ciphertext) = rest.split_at(block);
                Bytes::from(cipher.decrypt(key, iv, ciphertext)?)
            }
            None => Bytes::copy_from_slice(rest),
        };

        let seed_ready = match otp_pair {
            Some((seed_id, index)) => {
                let committed = self.otp.as_mut()?.commit(seed_id, index)?;
                committed.first_under_seed.then_some(seed_id)
            }
            None => None,
        };

        Some(Decoded { payload, seed_ready })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_feature_sets() -> Vec<SecurityParams> {
        let otp = Some(OtpParams { cipher: CipherMode::Aes, num: 64, num_warn: 8 });
        let mut sets = Vec::new();
        for cipher in [None, Some(CipherMode::Aes), Some(CipherMode::Blowfish)] {
            for hash in [None, Some(HashMode::Md5), Some(HashMode::Sha1)] {
                for otp in [None, otp] {
                    sets.push(SecurityParams { cipher, hash, otp });
                }
            }
        }
        sets
    }

    fn pair(params: SecurityParams) -> (SppEncoder, SppDecoder) {
        let mut enc = SppEncoder::new(params);
        let mut dec = SppDecoder::new(params);
        if params.cipher.is_some() {
            let key = vec![0x5au8; 16];
            enc.set_key(key.clone());
            dec.set_key(key);
        }
        if params.otp.is_some() {
            enc.set_send_seed(0);
            dec.add_recv_seed(0);
        }
        (enc, dec)
    }

    #[test]
    fn test_roundtrip_every_feature_set() {
        for params in all_feature_sets() {
            let (mut enc, mut dec) = pair(params);
            let payload = b"ethernet frame bytes";
            let out = enc.encode(payload).ok().expect("encode");
            let back = dec.decode(&out.packet).expect("decode");
            assert_eq!(&back.payload[..], payload, "params {params:?}");
        }
    }

    #[test]
    fn test_replay_rejected() {
        let params = SecurityParams {
            cipher: Some(CipherMode::Aes),
            hash: Some(HashMode::Md5),
            otp: Some(OtpParams { cipher: CipherMode::Aes, num: 16, num_warn: 4 }),
        };
        let (mut enc, mut dec) = pair(params);
        let out = enc.encode(b"once").ok().expect("encode");
        assert!(dec.decode(&out.packet).is_some());
        assert!(dec.decode(&out.packet).is_none(), "replay must drop");
    }

    #[test]
    fn test_corrupted_packet_dropped() {
        let params = SecurityParams {
            cipher: Some(CipherMode::Aes),
            hash: Some(HashMode::Sha1),
            otp: None,
        };
        let (mut enc, mut dec) = pair(params);
        let out = enc.encode(b"payload").ok().expect("encode");
        let mut bad = out.packet.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(dec.decode(&bad).is_none());
    }

    #[test]
    fn test_seed_ready_fires_on_first_packet_only() {
        let params = SecurityParams {
            cipher: None,
            hash: None,
            otp: Some(OtpParams { cipher: CipherMode::Aes, num: 16, num_warn: 4 }),
        };
        let (mut enc, mut dec) = pair(params);
        let first = dec.decode(&enc.encode(b"a").ok().expect("encode").packet).expect("ok");
        assert_eq!(first.seed_ready, Some(0));
        let second = dec.decode(&enc.encode(b"b").ok().expect("encode").packet).expect("ok");
        assert_eq!(second.seed_ready, None);
    }

    #[test]
    fn test_exhaustion_then_rotation() {
        let params = SecurityParams {
            cipher: None,
            hash: None,
            otp: Some(OtpParams { cipher: CipherMode::Aes, num: 4, num_warn: 1 }),
        };
        let (mut enc, mut dec) = pair(params);
        let mut warned = false;
        for _ in 0..4 {
            let out = enc.encode(b"x").ok().expect("encode");
            warned |= out.seed_warning;
            assert!(dec.decode(&out.packet).is_some());
        }
        assert!(warned);
        assert!(matches!(enc.encode(b"x"), Err(EncodeError::OtpExhausted)));

        dec.add_recv_seed(1);
        enc.set_send_seed(1);
        let out = enc.encode(b"y").ok().expect("encode after rotation");
        let back = dec.decode(&out.packet).expect("decode under new seed");
        assert_eq!(back.seed_ready, Some(1));
    }

    #[test]
    fn test_payload_mtu_accounts_for_overhead() {
        for params in all_feature_sets() {
            let (mut enc, _) = pair(params);
            let mtu = 256;
            let payload = vec![1u8; params.payload_mtu(mtu)];
            let out = enc.encode(&payload).ok().expect("encode");
            assert!(out.packet.len() <= mtu, "params {params:?}: {}", out.packet.len());
        }
    }
}
