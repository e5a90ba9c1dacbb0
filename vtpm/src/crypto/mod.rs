// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Crypto API used by the TPM core.
//!
//! The core never touches a cipher or hash implementation directly; it
//! goes through the traits declared here. Exactly one implementation is
//! compiled in and exposed as [`Crypto`].

use crate::marshal::{Cursor, Marshal, MarshalError, Unmarshal};
use crate::types::{TPM_ALG_NULL, TPM_ALG_SHA256, TPM_ALG_SHA384, TPM_ALG_SHA512};
use alloc::vec::Vec;

pub mod drbg;
pub mod rustcrypto;

pub use rustcrypto::RustCrypto as Crypto;

/// Errors reported by the crypto implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Authenticated decryption failed
    Integrity,
    /// A key or IV of the wrong length
    KeyLength,
    /// The platform could not deliver entropy
    Entropy,
}

/// Hash algorithms implemented by this TPM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub const ALL: [HashAlg; 3] = [HashAlg::Sha256, HashAlg::Sha384, HashAlg::Sha512];

    pub fn from_alg_id(id: u16) -> Option<Self> {
        match id {
            TPM_ALG_SHA256 => Some(Self::Sha256),
            TPM_ALG_SHA384 => Some(Self::Sha384),
            TPM_ALG_SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn alg_id(self) -> u16 {
        match self {
            Self::Sha256 => TPM_ALG_SHA256,
            Self::Sha384 => TPM_ALG_SHA384,
            Self::Sha512 => TPM_ALG_SHA512,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Position of the algorithm in per-algorithm scratch arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Sha256 => 0,
            Self::Sha384 => 1,
            Self::Sha512 => 2,
        }
    }

    /// Decodes a TPMI_ALG_HASH that may also be TPM_ALG_NULL.
    pub fn unmarshal_or_null(cur: &mut Cursor<'_>) -> Result<Option<Self>, MarshalError> {
        match cur.u16()? {
            TPM_ALG_NULL => Ok(None),
            id => Self::from_alg_id(id).map(Some).ok_or(MarshalError::Hash),
        }
    }

    pub fn marshal_or_null(alg: Option<Self>, out: &mut Vec<u8>) -> usize {
        alg.map_or(TPM_ALG_NULL, Self::alg_id).marshal(out)
    }

    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        <Crypto as digest::Algorithm>::digest(self, parts)
    }

    pub fn hmac(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        <Crypto as digest::Algorithm>::hmac(self, key, parts)
    }
}

impl Marshal for HashAlg {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.alg_id().marshal(out)
    }
}

impl Unmarshal for HashAlg {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Self::from_alg_id(cur.u16()?).ok_or(MarshalError::Hash)
    }
}

pub mod digest {
    //! API for message digests and HMAC.

    use super::HashAlg;
    use alloc::vec::Vec;

    pub trait Algorithm {
        /// Digests the concatenation of `parts`.
        fn digest(alg: HashAlg, parts: &[&[u8]]) -> Vec<u8>;

        /// Computes the HMAC of the concatenation of `parts` under `key`.
        fn hmac(alg: HashAlg, key: &[u8], parts: &[&[u8]]) -> Vec<u8>;
    }
}

pub mod aead {
    //! API for authenticated encryption with associated data

    use super::CryptoError;
    use alloc::vec::Vec;

    /// Authenticated tag size (128 bits)
    pub const AUTHTAG_SIZE: usize = 16;
    /// Initialization vector size (96 bits)
    pub const IV_SIZE: usize = 12;
    /// Key size (256 bits)
    pub const KEY_SIZE: usize = 32;

    /// AES-256 GCM
    pub trait Aes256GcmTrait {
        /// Encrypts `inbuf`, returning the ciphertext followed by the tag.
        fn seal(
            iv: &[u8; IV_SIZE],
            key: &[u8; KEY_SIZE],
            aad: &[u8],
            inbuf: &[u8],
        ) -> Result<Vec<u8>, CryptoError>;

        /// Decrypts and authenticates `inbuf` (ciphertext followed by tag).
        fn open(
            iv: &[u8; IV_SIZE],
            key: &[u8; KEY_SIZE],
            aad: &[u8],
            inbuf: &[u8],
        ) -> Result<Vec<u8>, CryptoError>;
    }
}

pub mod sym {
    //! API for AES in CFB mode, used for parameter encryption.

    use super::CryptoError;

    pub const BLOCK_SIZE: usize = 16;

    pub trait AesCfbTrait {
        /// Encrypts `buf` in place. `key` must be 16 or 32 bytes.
        fn cfb_encrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], buf: &mut [u8])
            -> Result<(), CryptoError>;

        /// Decrypts `buf` in place. `key` must be 16 or 32 bytes.
        fn cfb_decrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], buf: &mut [u8])
            -> Result<(), CryptoError>;
    }
}

/// SP800-108 counter-mode KDF with HMAC (KDFa).
///
/// `label` is used without its terminating zero; one is appended here.
pub fn kdfa(
    alg: HashAlg,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bytes: usize,
) -> Vec<u8> {
    let bits = u32::try_from(bytes * 8).unwrap_or(u32::MAX).to_be_bytes();
    let mut out = Vec::with_capacity(bytes + alg.digest_size());
    let mut counter: u32 = 0;
    while out.len() < bytes {
        counter += 1;
        let block = alg.hmac(
            key,
            &[
                &counter.to_be_bytes(),
                label,
                &[0],
                context_u,
                context_v,
                &bits,
            ],
        );
        out.extend_from_slice(&block);
    }
    out.truncate(bytes);
    out
}

/// Masks `data` in place with a KDFa "XOR" stream.
pub fn xor_obfuscate(
    alg: HashAlg,
    key: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    data: &mut [u8],
) {
    let mask = kdfa(alg, key, b"XOR", context_u, context_v, data.len());
    for (d, m) in data.iter_mut().zip(mask.iter()) {
        *d ^= m;
    }
}

/// Compares two byte strings without an early exit on the first mismatch.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_answer() {
        let d = HashAlg::Sha256.digest(&[b"a", b"bc"]);
        assert_eq!(
            d[..8],
            [0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea]
        );
        assert_eq!(d.len(), 32);
        assert_eq!(HashAlg::Sha384.digest(&[]).len(), 48);
        assert_eq!(HashAlg::Sha512.digest(&[]).len(), 64);
    }

    #[test]
    fn kdfa_lengths_and_determinism() {
        let a = kdfa(HashAlg::Sha256, b"key", b"ATH", b"u", b"v", 48);
        let b = kdfa(HashAlg::Sha256, b"key", b"ATH", b"u", b"v", 48);
        let c = kdfa(HashAlg::Sha256, b"key", b"ATH", b"v", b"u", 48);
        assert_eq!(a.len(), 48);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn xor_round_trip() {
        let mut data = *b"parameter";
        xor_obfuscate(HashAlg::Sha384, b"k", b"n1", b"n2", &mut data);
        assert_ne!(&data, b"parameter");
        xor_obfuscate(HashAlg::Sha384, b"k", b"n1", b"n2", &mut data);
        assert_eq!(&data, b"parameter");
    }

    #[test]
    fn constant_time_compare() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
