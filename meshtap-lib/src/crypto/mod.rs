//! Symmetric primitives used by the secure-packet codec: CBC block ciphers,
//! packet digests and one-time sequence seeds.

pub mod otp;

use aes::Aes128;
use blowfish::Blowfish;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use digest::Digest;
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;

/// Block cipher selection for packet encryption or OTP seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Aes,
    Blowfish,
}

impl CipherMode {
    pub fn key_len(self) -> usize {
        16
    }

    pub fn block_len(self) -> usize {
        match self {
            CipherMode::Aes => 16,
            CipherMode::Blowfish => 8,
        }
    }

    /// CBC-encrypts `{data_len:u16 LE, data}` with PKCS#7 padding, so the
    /// plaintext length survives the block rounding.
    pub fn encrypt(self, key: &[u8], iv: &[u8], data: &[u8]) -> Option<Vec<u8>> {
        debug_assert!(data.len() <= u16::MAX as usize);
        let mut plain = Vec::with_capacity(2 + data.len());
        plain.extend_from_slice(&(data.len() as u16).to_le_bytes());
        plain.extend_from_slice(data);
        match self {
            CipherMode::Aes => {
                let enc = cbc::Encryptor::<Aes128>::new_from_slices(key, iv).ok()?;
                Some(enc.encrypt_padded_vec_mut::<Pkcs7>(&plain))
            }
            CipherMode::Blowfish => {
                let enc = cbc::Encryptor::<Blowfish>::new_from_slices(key, iv).ok()?;
                Some(enc.encrypt_padded_vec_mut::<Pkcs7>(&plain))
            }
        }
    }

    /// Inverse of [`encrypt`](Self::encrypt). Any padding or length
    /// inconsistency yields `None`.
    pub fn decrypt(self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let plain = match self {
            CipherMode::Aes => {
                let dec = cbc::Decryptor::<Aes128>::new_from_slices(key, iv).ok()?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()?
            }
            CipherMode::Blowfish => {
                let dec = cbc::Decryptor::<Blowfish>::new_from_slices(key, iv).ok()?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()?
            }
        };
        if plain.len() < 2 {
            return None;
        }
        let data_len = u16::from_le_bytes([plain[0], plain[1]]) as usize;
        if plain.len() - 2 < data_len {
            return None;
        }
        Some(plain[2..2 + data_len].to_vec())
    }
}

/// Digest selection for packet integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    Md5,
    Sha1,
}

impl HashMode {
    pub fn digest_len(self) -> usize {
        match self {
            HashMode::Md5 => 16,
            HashMode::Sha1 => 20,
        }
    }

    /// Digest over a full packet whose hash field has been zeroed.
    pub fn digest(self, packet: &[u8]) -> Vec<u8> {
        match self {
            HashMode::Md5 => Md5::digest(packet).to_vec(),
            HashMode::Sha1 => Sha1::digest(packet).to_vec(),
        }
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}
