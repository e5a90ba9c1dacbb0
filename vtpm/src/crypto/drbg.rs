// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! NIST SP 800-90A HMAC_DRBG over SHA-256.
//!
//! The complete DRBG state is plain data so that it can be kept in the
//! orderly state and survive an orderly shutdown.

use super::HashAlg;
use alloc::vec::Vec;

/// Length of K and V.
pub const DRBG_STATE_SIZE: usize = 32;
/// Number of generate calls after which a reseed is required.
pub const RESEED_INTERVAL: u64 = 1 << 20;

const DRBG_HASH: HashAlg = HashAlg::Sha256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HmacDrbg {
    pub key: [u8; DRBG_STATE_SIZE],
    pub value: [u8; DRBG_STATE_SIZE],
    pub reseed_counter: u64,
}

impl Default for HmacDrbg {
    fn default() -> Self {
        Self {
            key: [0; DRBG_STATE_SIZE],
            value: [1; DRBG_STATE_SIZE],
            reseed_counter: 0,
        }
    }
}

fn to_state(bytes: &[u8]) -> [u8; DRBG_STATE_SIZE] {
    let mut out = [0u8; DRBG_STATE_SIZE];
    let len = bytes.len().min(DRBG_STATE_SIZE);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

impl HmacDrbg {
    /// Instantiates the DRBG from entropy, nonce and personalization input.
    pub fn instantiate(entropy: &[u8], nonce: &[u8], personalization: &[u8]) -> Self {
        let mut drbg = Self::default();
        drbg.update(&[entropy, nonce, personalization]);
        drbg.reseed_counter = 1;
        drbg
    }

    fn update(&mut self, provided: &[&[u8]]) {
        let has_data = provided.iter().any(|p| !p.is_empty());

        let mut parts: Vec<&[u8]> = Vec::with_capacity(provided.len() + 2);
        parts.push(&self.value);
        parts.push(&[0x00]);
        parts.extend_from_slice(provided);
        let key = to_state(&DRBG_HASH.hmac(&self.key, &parts));
        self.key = key;
        self.value = to_state(&DRBG_HASH.hmac(&self.key, &[&self.value]));

        if !has_data {
            return;
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(provided.len() + 2);
        parts.push(&self.value);
        parts.push(&[0x01]);
        parts.extend_from_slice(provided);
        let key = to_state(&DRBG_HASH.hmac(&self.key, &parts));
        self.key = key;
        self.value = to_state(&DRBG_HASH.hmac(&self.key, &[&self.value]));
    }

    /// Mixes fresh entropy and optional additional input into the state.
    pub fn reseed(&mut self, entropy: &[u8], additional: &[u8]) {
        self.update(&[entropy, additional]);
        self.reseed_counter = 1;
    }

    /// Whether the next generate call must be preceded by a reseed.
    pub fn needs_reseed(&self) -> bool {
        self.reseed_counter == 0 || self.reseed_counter > RESEED_INTERVAL
    }

    /// Fills `out` with pseudo-random bytes.
    pub fn generate(&mut self, out: &mut [u8], additional: &[u8]) {
        if !additional.is_empty() {
            self.update(&[additional]);
        }
        let mut filled = 0;
        while filled < out.len() {
            self.value = to_state(&DRBG_HASH.hmac(&self.key, &[&self.value]));
            let n = (out.len() - filled).min(DRBG_STATE_SIZE);
            out[filled..filled + n].copy_from_slice(&self.value[..n]);
            filled += n;
        }
        self.update(&[additional]);
        self.reseed_counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_seed() {
        let mut a = HmacDrbg::instantiate(b"entropy-entropy", b"nonce", b"tpm");
        let mut b = a.clone();
        let mut out_a = [0u8; 80];
        let mut out_b = [0u8; 80];
        a.generate(&mut out_a, &[]);
        b.generate(&mut out_b, &[]);
        assert_eq!(out_a, out_b);
        assert_eq!(a, b);

        let mut next = [0u8; 80];
        a.generate(&mut next, &[]);
        assert_ne!(next, out_a);
    }

    #[test]
    fn reseed_changes_output() {
        let mut a = HmacDrbg::instantiate(b"entropy", b"", b"");
        let mut b = a.clone();
        b.reseed(b"more entropy", b"");
        let mut out_a = [0u8; 16];
        let mut out_b = [0u8; 16];
        a.generate(&mut out_a, &[]);
        b.generate(&mut out_b, &[]);
        assert_ne!(out_a, out_b);
        assert!(!a.needs_reseed());
        assert!(HmacDrbg::default().needs_reseed());
    }
}
