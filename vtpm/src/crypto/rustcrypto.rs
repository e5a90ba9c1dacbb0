// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! RustCrypto implementation

use aes::{Aes128, Aes256};
use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, Key, KeyInit, Nonce,
};
use alloc::vec::Vec;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::aead::{Aes256GcmTrait, IV_SIZE, KEY_SIZE};
use super::digest::Algorithm;
use super::sym::{AesCfbTrait, BLOCK_SIZE};
use super::{CryptoError, HashAlg};

/// Crypto backend built on the RustCrypto crates.
#[derive(Copy, Clone, Debug)]
pub struct RustCrypto;

macro_rules! digest_parts {
    ($d:ty, $parts:expr) => {{
        let mut h = <$d as Digest>::new();
        for part in $parts {
            Digest::update(&mut h, part);
        }
        h.finalize().to_vec()
    }};
}

macro_rules! hmac_parts {
    ($d:ty, $key:expr, $parts:expr) => {{
        // HMAC takes keys of any length, so this never fails
        match <Hmac<$d> as Mac>::new_from_slice($key) {
            Ok(mut mac) => {
                for part in $parts {
                    Mac::update(&mut mac, part);
                }
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        }
    }};
}

impl Algorithm for RustCrypto {
    fn digest(alg: HashAlg, parts: &[&[u8]]) -> Vec<u8> {
        match alg {
            HashAlg::Sha256 => digest_parts!(Sha256, parts),
            HashAlg::Sha384 => digest_parts!(Sha384, parts),
            HashAlg::Sha512 => digest_parts!(Sha512, parts),
        }
    }

    fn hmac(alg: HashAlg, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        match alg {
            HashAlg::Sha256 => hmac_parts!(Sha256, key, parts),
            HashAlg::Sha384 => hmac_parts!(Sha384, key, parts),
            HashAlg::Sha512 => hmac_parts!(Sha512, key, parts),
        }
    }
}

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq)]
enum AesGcmOperation {
    Encrypt = 0,
    Decrypt = 1,
}

fn aes_gcm_do(
    operation: AesGcmOperation,
    iv: &[u8; IV_SIZE],
    key: &[u8; KEY_SIZE],
    aad: &[u8],
    inbuf: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload { msg: inbuf, aad };

    let aes_key = Key::<Aes256Gcm>::from_slice(key);
    let gcm = Aes256Gcm::new(aes_key);
    let nonce = Nonce::from_slice(iv);

    let result = if operation == AesGcmOperation::Encrypt {
        gcm.encrypt(nonce, payload)
    } else {
        gcm.decrypt(nonce, payload)
    };
    result.map_err(|_| CryptoError::Integrity)
}

impl Aes256GcmTrait for RustCrypto {
    fn seal(
        iv: &[u8; IV_SIZE],
        key: &[u8; KEY_SIZE],
        aad: &[u8],
        inbuf: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        aes_gcm_do(AesGcmOperation::Encrypt, iv, key, aad, inbuf)
    }

    fn open(
        iv: &[u8; IV_SIZE],
        key: &[u8; KEY_SIZE],
        aad: &[u8],
        inbuf: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        aes_gcm_do(AesGcmOperation::Decrypt, iv, key, aad, inbuf)
    }
}

impl AesCfbTrait for RustCrypto {
    fn cfb_encrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], buf: &mut [u8]) -> Result<(), CryptoError> {
        match key.len() {
            16 => Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::KeyLength)?
                .encrypt(buf),
            32 => Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::KeyLength)?
                .encrypt(buf),
            _ => return Err(CryptoError::KeyLength),
        }
        Ok(())
    }

    fn cfb_decrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], buf: &mut [u8]) -> Result<(), CryptoError> {
        match key.len() {
            16 => Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::KeyLength)?
                .decrypt(buf),
            32 => Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::KeyLength)?
                .decrypt(buf),
            _ => return Err(CryptoError::KeyLength),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_rfc4231_case2() {
        let mac = RustCrypto::hmac(
            HashAlg::Sha256,
            b"Jefe",
            &[b"what do ya want ", b"for nothing?"],
        );
        assert_eq!(
            mac[..8],
            [0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e]
        );
    }

    #[test]
    fn gcm_detects_tampering() {
        let key = [7u8; KEY_SIZE];
        let iv = [1u8; IV_SIZE];
        let sealed = RustCrypto::seal(&iv, &key, b"aad", b"secret").expect("Failed to seal");
        let opened = RustCrypto::open(&iv, &key, b"aad", &sealed).expect("Failed to open");
        assert_eq!(opened, b"secret");

        let mut bad = sealed.clone();
        bad[0] ^= 1;
        assert_eq!(
            RustCrypto::open(&iv, &key, b"aad", &bad),
            Err(CryptoError::Integrity)
        );
        assert!(RustCrypto::open(&iv, &key, b"other", &sealed).is_err());
    }

    #[test]
    fn cfb_round_trip() {
        let key = [3u8; 16];
        let iv = [9u8; BLOCK_SIZE];
        let mut buf = *b"not a multiple of sixteen";
        RustCrypto::cfb_encrypt(&key, &iv, &mut buf).expect("Failed to encrypt");
        assert_ne!(&buf, b"not a multiple of sixteen");
        RustCrypto::cfb_decrypt(&key, &iv, &mut buf).expect("Failed to decrypt");
        assert_eq!(&buf, b"not a multiple of sixteen");
        assert!(RustCrypto::cfb_encrypt(&[0u8; 5], &iv, &mut buf).is_err());
    }
}
