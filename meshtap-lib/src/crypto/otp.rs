//! One-time sequence authentication.
//!
//! Every secured datagram carries a `(seed_id, otp_index)` pair. The sender
//! counts indices up to the configured limit and asks the session layer for a
//! fresh seed ahead of exhaustion; the receiver keeps a used-index bitmap per
//! seed and accepts each pair at most once. Up to two receive seeds overlap
//! so rotation never drops traffic. Seed key and IV material travels in SEED
//! signalling messages and identifies the seed; acceptance itself is the
//! bitmap check combined with the packet's decrypt and digest verification.

use crate::crypto::CipherMode;

/// Sizing for OTP seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpParams {
    pub cipher: CipherMode,
    pub num: u16,
    pub num_warn: u16,
}

/// Outcome of drawing the next send index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendIndex {
    /// No seed installed or the current seed is used up; the packet must be
    /// dropped until a new seed is confirmed.
    Unavailable,
    Ok {
        seed_id: u16,
        index: u16,
        /// Set exactly once, when the counter crosses `num - num_warn`.
        warn: bool,
    },
}

/// Send-side OTP counter.
pub struct OtpSender {
    params: OtpParams,
    seed: Option<SendSeed>,
}

struct SendSeed {
    id: u16,
    next_index: u16,
    warned: bool,
}

impl OtpSender {
    pub fn new(params: OtpParams) -> OtpSender {
        OtpSender { params, seed: None }
    }

    /// Installs a confirmed send seed and resets the index to 0.
    pub fn set_seed(&mut self, id: u16) {
        self.seed = Some(SendSeed { id, next_index: 0, warned: false });
    }

    pub fn next(&mut self) -> SendIndex {
        let Some(seed) = self.seed.as_mut() else {
            return SendIndex::Unavailable;
        };
        if seed.next_index >= self.params.num {
            return SendIndex::Unavailable;
        }
        let index = seed.next_index;
        seed.next_index += 1;
        let warn = !seed.warned && seed.next_index >= self.params.num - self.params.num_warn;
        if warn {
            seed.warned = true;
        }
        SendIndex::Ok { seed_id: seed.id, index, warn }
    }
}

/// Outcome of committing a received `(seed_id, index)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    /// True for the first packet observed under this seed; triggers the
    /// CONFIRMSEED reply.
    pub first_under_seed: bool,
}

struct RecvSeed {
    id: u16,
    used: Vec<u64>,
    seen_any: bool,
}

/// Receive-side replay filter; holds at most two overlapping seeds.
pub struct OtpReceiver {
    num: u16,
    seeds: Vec<RecvSeed>,
}

impl OtpReceiver {
    pub fn new(num: u16) -> OtpReceiver {
        OtpReceiver { num, seeds: Vec::with_capacity(2) }
    }

    /// Registers a pending receive seed, displacing the older one if two are
    /// already held.
    pub fn add_seed(&mut self, id: u16) {
        if self.seeds.iter().any(|s| s.id == id) {
            return;
        }
        if self.seeds.len() == 2 {
            self.seeds.remove(0);
        }
        let words = (self.num as usize).div_ceil(64);
        self.seeds.push(RecvSeed { id, used: vec![0; words], seen_any: false });
    }

    /// Checks acceptability without consuming the index.
    pub fn check(&self, seed_id: u16, index: u16) -> bool {
        if index >= self.num {
            return false;
        }
        self.seeds
            .iter()
            .find(|s| s.id == seed_id)
            .map(|s| s.used[index as usize / 64] & (1u64 << (index % 64)) == 0)
            .unwrap_or(false)
    }

    /// Consumes the index after the packet passed decryption and digest
    /// verification.
    pub fn commit(&mut self, seed_id: u16, index: u16) -> Option<Committed> {
        if index >= self.num {
            return None;
        }
        let seed = self.seeds.iter_mut().find(|s| s.id == seed_id)?;
        let word = &mut seed.used[index as usize / 64];
        let bit = 1u64 << (index % 64);
        if *word & bit != 0 {
            return None;
        }
        *word |= bit;
        let first = !seed.seen_any;
        seed.seen_any = true;
        Some(Committed { first_under_seed: first })
    }
}
