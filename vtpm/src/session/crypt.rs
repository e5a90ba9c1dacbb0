// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Parameter encryption.
//!
//! Only the first parameter of a command or response can be encrypted
//! and only if it is a TPM2B. The size field stays in the clear.

use super::{Session, SymDef};
use crate::command::Command;
use crate::crypto::sym::{AesCfbTrait, BLOCK_SIZE};
use crate::crypto::{kdfa, xor_obfuscate, Crypto};
use crate::engine::Engine;
use crate::failure::{FatalCode, Fault};
use crate::rc::TpmReqError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Applies the session's symmetric algorithm to `data`. `nonce_newer`
/// and `nonce_older` are the contextU and contextV of the key derivation.
fn apply(
    session: &Session,
    key: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    data: &mut [u8],
    direction: Direction,
) -> Result<(), TpmReqError> {
    match session.symmetric {
        SymDef::Null => Err(TpmReqError::symmetric()),
        SymDef::Xor(hash) => {
            xor_obfuscate(hash, key, nonce_newer, nonce_older, data);
            Ok(())
        }
        SymDef::Aes { key_bits } => {
            let key_len = usize::from(key_bits / 8);
            let material = kdfa(
                session.auth_hash,
                key,
                b"CFB",
                nonce_newer,
                nonce_older,
                key_len + BLOCK_SIZE,
            );
            let (aes_key, iv_bytes) = material.split_at(key_len);
            let mut iv = [0u8; BLOCK_SIZE];
            iv.copy_from_slice(iv_bytes);
            let result = match direction {
                Direction::Encrypt => Crypto::cfb_encrypt(aes_key, &iv, data),
                Direction::Decrypt => Crypto::cfb_decrypt(aes_key, &iv, data),
            };
            result.map_err(|_| Fault::new(FatalCode::Crypto).into())
        }
    }
}

/// The data of the TPM2B at the start of `params`.
fn first_tpm2b(params: &mut [u8]) -> Option<&mut [u8]> {
    let size = usize::from(u16::from_be_bytes([*params.first()?, *params.get(1)?]));
    params.get_mut(2..2 + size)
}

impl Engine {
    /// Decrypts the first command parameter in place.
    pub(crate) fn decrypt_parameters(
        &self,
        cmd: &Command<'_>,
        params: &mut [u8],
    ) -> Result<(), TpmReqError> {
        let Some(i) = cmd.decrypt_session else {
            return Ok(());
        };
        let auth = &cmd.sessions[i];
        let session = self.session(auth.handle).ok_or_else(Fault::internal)?;
        let data = first_tpm2b(params).ok_or_else(|| TpmReqError::size().param(1))?;
        apply(
            session,
            &auth.key,
            &auth.nonce_caller,
            &session.nonce_tpm,
            data,
            Direction::Decrypt,
        )
    }

    /// Encrypts the first response parameter in place. Runs after the
    /// nonces were rolled.
    pub(crate) fn encrypt_response(
        &self,
        cmd: &Command<'_>,
        params: &mut [u8],
    ) -> Result<(), TpmReqError> {
        let Some(i) = cmd.encrypt_session else {
            return Ok(());
        };
        let auth = &cmd.sessions[i];
        let session = self.session(auth.handle).ok_or_else(Fault::internal)?;
        let Some(data) = first_tpm2b(params) else {
            return Err(Fault::internal().into());
        };
        apply(
            session,
            &auth.key,
            &session.nonce_tpm,
            &auth.nonce_caller,
            data,
            Direction::Encrypt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashAlg;
    use crate::marshal::{Tpm2bDigest, Tpm2bNonce};
    use crate::session::{zero_digest, SessionFlags, SessionType};
    use crate::types::HMAC_SESSION_FIRST;

    fn session(symmetric: SymDef) -> Session {
        Session {
            handle: HMAC_SESSION_FIRST,
            session_type: SessionType::Hmac,
            flags: SessionFlags::empty(),
            auth_hash: HashAlg::Sha256,
            nonce_tpm: Tpm2bNonce::new(&[3; 16]).expect("Failed to build nonce"),
            session_key: Tpm2bDigest::new(&[9; 32]).expect("Failed to build key"),
            symmetric,
            bound_entity: Tpm2bDigest::empty(),
            policy_digest: zero_digest(HashAlg::Sha256),
            command_code: None,
            audit_digest: Tpm2bDigest::empty(),
        }
    }

    #[test]
    fn cfb_round_trip() {
        for bits in [128, 256] {
            let s = session(SymDef::Aes { key_bits: bits });
            let mut data = *b"the first parameter";
            apply(&s, b"key", b"caller", b"tpm", &mut data, Direction::Encrypt)
                .expect("Failed to encrypt");
            assert_ne!(&data, b"the first parameter");
            apply(&s, b"key", b"caller", b"tpm", &mut data, Direction::Decrypt)
                .expect("Failed to decrypt");
            assert_eq!(&data, b"the first parameter");
        }
    }

    #[test]
    fn nonce_order_matters() {
        let s = session(SymDef::Xor(HashAlg::Sha256));
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        apply(&s, b"key", b"n1", b"n2", &mut a, Direction::Encrypt).expect("Failed to mask");
        apply(&s, b"key", b"n2", b"n1", &mut b, Direction::Encrypt).expect("Failed to mask");
        assert_ne!(a, b);
    }

    #[test]
    fn first_parameter_bounds() {
        let mut params = [0, 3, 1, 2, 3, 4];
        assert_eq!(first_tpm2b(&mut params).map(|d| d.len()), Some(3));
        let mut short = [0, 9, 1];
        assert!(first_tpm2b(&mut short).is_none());
        assert!(first_tpm2b(&mut []).is_none());
    }
}
