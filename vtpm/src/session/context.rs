// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Context save and load.
//!
//! A saved context is the snapshot encoding of a session or object slot,
//! sealed with AES-256-GCM. The key is derived from the proof of the
//! hierarchy the context belongs to (the null proof for sessions), the
//! context sequence number and the reset count, so every TPM Reset
//! invalidates saved sessions and null hierarchy objects. The sequence
//! number, saved handle and hierarchy are authenticated as associated
//! data.

use super::{handle_index, is_session_handle, Session};
use crate::crypto::aead::{Aes256GcmTrait, IV_SIZE, KEY_SIZE};
use crate::crypto::{kdfa, Crypto, HashAlg};
use crate::engine::Engine;
use crate::failure::{FatalCode, Fault};
use crate::marshal::{Cursor, Marshal, MarshalError, Tpm2bContextData, Unmarshal};
use crate::object::ObjectSlot;
use crate::rc::{TpmRc, TpmReqError};
use crate::state::{SessionContext, SEED_SIZE};
use crate::types::*;
use alloc::vec::Vec;

/// TPMS_CONTEXT
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub blob: Tpm2bContextData,
}

impl Marshal for TpmsContext {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.sequence.marshal(out)
            + self.saved_handle.marshal(out)
            + self.hierarchy.marshal(out)
            + self.blob.marshal(out)
    }
}

impl Unmarshal for TpmsContext {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let sequence = cur.u64()?;
        let saved_handle = cur.u32()?;
        let hierarchy = cur.u32()?;
        if !matches!(
            hierarchy,
            TPM_RH_OWNER | TPM_RH_ENDORSEMENT | TPM_RH_PLATFORM | TPM_RH_NULL
        ) {
            return Err(MarshalError::Value);
        }
        Ok(Self {
            sequence,
            saved_handle,
            hierarchy,
            blob: Unmarshal::unmarshal(cur)?,
        })
    }
}

const CONTEXT_HASH: HashAlg = HashAlg::Sha256;

/// Key, IV and associated data protecting one context.
struct ContextProtection {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    aad: Vec<u8>,
}

impl Engine {
    pub(crate) fn hierarchy_proof(&self, hierarchy: u32) -> &[u8; SEED_SIZE] {
        match hierarchy {
            TPM_RH_OWNER => &self.gp.sh_proof,
            TPM_RH_ENDORSEMENT => &self.gp.eh_proof,
            TPM_RH_PLATFORM => &self.gp.ph_proof,
            _ => &self.gr.null_proof,
        }
    }

    fn context_protection(&self, sequence: u64, saved_handle: u32, hierarchy: u32) -> ContextProtection {
        let proof = if is_session_handle(saved_handle) {
            &self.gr.null_proof
        } else {
            self.hierarchy_proof(hierarchy)
        };
        let seq = sequence.to_be_bytes();
        let handle = saved_handle.to_be_bytes();
        let material = kdfa(
            CONTEXT_HASH,
            proof,
            b"CONTEXT",
            &seq,
            &self.gp.reset_count.to_be_bytes(),
            KEY_SIZE,
        );
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&material);
        let mut iv = [0u8; IV_SIZE];
        iv[..8].copy_from_slice(&seq);
        iv[8..].copy_from_slice(&handle);

        let mut aad = Vec::new();
        sequence.marshal(&mut aad);
        saved_handle.marshal(&mut aad);
        hierarchy.marshal(&mut aad);
        if saved_handle == CONTEXT_HANDLE_STCLEAR {
            self.gr.clear_count.marshal(&mut aad);
        }
        ContextProtection { key, iv, aad }
    }

    fn seal_context(
        &self,
        sequence: u64,
        saved_handle: u32,
        hierarchy: u32,
        plain: &[u8],
    ) -> Result<TpmsContext, TpmReqError> {
        let p = self.context_protection(sequence, saved_handle, hierarchy);
        let sealed = Crypto::seal(&p.iv, &p.key, &p.aad, plain)
            .map_err(|_| Fault::new(FatalCode::Crypto))?;
        let blob = Tpm2bContextData::from_vec(sealed).map_err(|_| TpmReqError::rc(TpmRc::MEMORY))?;
        Ok(TpmsContext {
            sequence,
            saved_handle,
            hierarchy,
            blob,
        })
    }

    fn open_context(&self, context: &TpmsContext) -> Result<Vec<u8>, TpmReqError> {
        let p = self.context_protection(context.sequence, context.saved_handle, context.hierarchy);
        Crypto::open(&p.iv, &p.key, &p.aad, &context.blob)
            .map_err(|_| TpmReqError::integrity().param(1))
    }

    /// TPM2_ContextSave. Saving a session takes it out of its slot;
    /// a saved object stays loaded.
    pub(crate) fn save_context(&mut self, handle: u32) -> Result<TpmsContext, TpmReqError> {
        if is_session_handle(handle) {
            let slot = self
                .session_slot(handle)
                .map_err(|_| TpmReqError::handle().at_handle(1))?;
            let session = self.sessions.get(slot).ok_or_else(Fault::internal)?;
            let sequence = self.gr.context_counter;
            let next = sequence
                .checked_add(1)
                .ok_or(TpmReqError::rc(TpmRc::TOO_MANY_CONTEXTS))?;
            let context = self.seal_context(sequence, handle, TPM_RH_NULL, &session.to_bytes())?;
            self.gr.context_counter = next;
            self.sessions.remove(slot);
            self.gr.context_array[handle_index(handle)] = SessionContext::Saved(sequence);
            return Ok(context);
        }

        let slot = self
            .objects
            .get(handle)
            .ok_or_else(|| TpmReqError::handle().at_handle(1))?;
        let saved_handle = match slot {
            ObjectSlot::Sequence(_) => CONTEXT_HANDLE_SEQUENCE,
            ObjectSlot::Regular(object)
                if object.public.attributes.contains(ObjectAttributes::ST_CLEAR) =>
            {
                CONTEXT_HANDLE_STCLEAR
            }
            ObjectSlot::Regular(_) => CONTEXT_HANDLE_OBJECT,
        };
        let sequence = self.gr.object_context_id;
        let next = sequence
            .checked_add(1)
            .ok_or(TpmReqError::rc(TpmRc::TOO_MANY_CONTEXTS))?;
        let context = self.seal_context(sequence, saved_handle, slot.hierarchy(), &slot.to_bytes())?;
        self.gr.object_context_id = next;
        Ok(context)
    }

    /// TPM2_ContextLoad. Returns the handle of the loaded entity.
    pub(crate) fn load_context(&mut self, context: &TpmsContext) -> Result<u32, TpmReqError> {
        let handle = context.saved_handle;
        if is_session_handle(handle) {
            let index = handle_index(handle);
            let entry = self.gr.context_array.get(index).copied();
            if entry != Some(SessionContext::Saved(context.sequence)) {
                return Err(TpmReqError::handle().param(1));
            }
            if !self.sessions.has_free_slot() {
                return Err(TpmReqError::rc(TpmRc::SESSION_MEMORY));
            }
            let plain = self.open_context(context)?;
            let session = decode_exact::<Session>(&plain)?;
            if session.handle != handle {
                return Err(TpmReqError::integrity().param(1));
            }
            let slot = self.sessions.insert(session)?;
            self.gr.context_array[index] = SessionContext::Loaded(slot);
            return Ok(handle);
        }

        if !matches!(
            handle,
            CONTEXT_HANDLE_OBJECT | CONTEXT_HANDLE_SEQUENCE | CONTEXT_HANDLE_STCLEAR
        ) {
            return Err(TpmReqError::handle().param(1));
        }
        if !self.hierarchy_enabled(context.hierarchy) {
            return Err(TpmReqError::hierarchy().param(1));
        }
        if self.objects.free_slots() == 0 {
            return Err(TpmReqError::rc(TpmRc::OBJECT_MEMORY));
        }
        let plain = self.open_context(context)?;
        let slot = decode_exact::<ObjectSlot>(&plain)?;
        if slot.hierarchy() != context.hierarchy || slot.is_shadow() {
            return Err(TpmReqError::integrity().param(1));
        }
        self.objects.insert(slot)
    }

    /// TPM2_FlushContext.
    pub(crate) fn flush_context(&mut self, handle: u32) -> Result<(), TpmReqError> {
        match handle_type(handle) {
            HT_TRANSIENT => {
                self.objects
                    .remove(handle)
                    .ok_or_else(|| TpmReqError::handle().param(1))?;
            }
            HT_HMAC_SESSION | HT_POLICY_SESSION => {
                if !self.flush_session(handle) {
                    return Err(TpmReqError::handle().param(1));
                }
            }
            _ => return Err(TpmReqError::handle().param(1)),
        }
        if self.exclusive_audit == Some(handle) {
            self.exclusive_audit = None;
        }
        Ok(())
    }
}

/// Decodes an authenticated context body that must be consumed exactly.
fn decode_exact<T: Unmarshal>(plain: &[u8]) -> Result<T, TpmReqError> {
    let mut cur = Cursor::new(plain);
    let value = T::unmarshal(&mut cur).map_err(|_| TpmReqError::integrity().param(1))?;
    cur.end().map_err(|_| TpmReqError::integrity().param(1))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wire_format() {
        let context = TpmsContext {
            sequence: 0x100,
            saved_handle: HMAC_SESSION_FIRST + 2,
            hierarchy: TPM_RH_NULL,
            blob: Tpm2bContextData::new(&[1, 2, 3]).expect("Failed to build blob"),
        };
        let bytes = context.to_bytes();
        assert_eq!(bytes.len(), 8 + 4 + 4 + 2 + 3);
        assert_eq!(&bytes[8..12], &[0x02, 0x00, 0x00, 0x02]);
        let mut cur = Cursor::new(&bytes);
        assert_eq!(TpmsContext::unmarshal(&mut cur), Ok(context));
        assert!(cur.end().is_ok());
    }

    #[test]
    fn unknown_hierarchy_rejected() {
        let mut bytes = Vec::new();
        0x100u64.marshal(&mut bytes);
        CONTEXT_HANDLE_OBJECT.marshal(&mut bytes);
        TPM_RH_LOCKOUT.marshal(&mut bytes);
        0u16.marshal(&mut bytes);
        assert_eq!(
            TpmsContext::unmarshal(&mut Cursor::new(&bytes)),
            Err(MarshalError::Value)
        );
    }
}
