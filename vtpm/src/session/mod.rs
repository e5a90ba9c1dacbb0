// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Authorization sessions.
//!
//! Every active session has an entry in the context array of the
//! state-reset data, indexed by the low 24 bits of its handle. An entry is
//! either free, loaded into one of the session slots, or saved out with a
//! context sequence number. A saved context blob is only accepted while
//! its entry still carries the same sequence number, which invalidates it
//! across TPM Reset and after the session was flushed.

pub mod auth;
pub mod context;
mod crypt;

use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::marshal::{Cursor, Marshal, MarshalError, Tpm2bDigest, Tpm2bNonce, Unmarshal};
use crate::rc::{TpmRc, TpmReqError};
use crate::state::SessionContext;
use crate::types::*;
use alloc::vec::Vec;
use bitflags::bitflags;

pub use auth::AuthSession;

/// Mask of the session index in a session handle.
const HANDLE_INDEX_MASK: u32 = 0x00FF_FFFF;

bitflags! {
    /// Session state flags.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SessionFlags: u16 {
        /// Trial policy session
        const TRIAL = 1 << 0;
        /// Session is bound to an entity
        const BOUND = 1 << 1;
        /// PolicyAuthValue was executed
        const INCLUDE_AUTH = 1 << 2;
        /// PolicyPassword was executed
        const INCLUDE_PASSWORD = 1 << 3;
        /// Session is used for audit
        const AUDIT = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionType {
    Hmac,
    Policy,
}

/// TPMT_SYM_DEF used for parameter encryption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SymDef {
    #[default]
    Null,
    Xor(HashAlg),
    /// AES in CFB mode
    Aes { key_bits: u16 },
}

impl Marshal for SymDef {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        match self {
            Self::Null => TPM_ALG_NULL.marshal(out),
            Self::Xor(hash) => TPM_ALG_XOR.marshal(out) + hash.marshal(out),
            Self::Aes { key_bits } => {
                TPM_ALG_AES.marshal(out) + key_bits.marshal(out) + TPM_ALG_CFB.marshal(out)
            }
        }
    }
}

impl Unmarshal for SymDef {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        match cur.u16()? {
            TPM_ALG_NULL => Ok(Self::Null),
            TPM_ALG_XOR => Ok(Self::Xor(HashAlg::unmarshal(cur)?)),
            TPM_ALG_AES => {
                let key_bits = cur.u16()?;
                if key_bits != 128 && key_bits != 256 {
                    return Err(MarshalError::KeySize);
                }
                if cur.u16()? != TPM_ALG_CFB {
                    return Err(MarshalError::Mode);
                }
                Ok(Self::Aes { key_bits })
            }
            _ => Err(MarshalError::Symmetric),
        }
    }
}

/// A loaded session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub handle: u32,
    pub session_type: SessionType,
    pub flags: SessionFlags,
    pub auth_hash: HashAlg,
    pub nonce_tpm: Tpm2bNonce,
    pub session_key: Tpm2bDigest,
    pub symmetric: SymDef,
    /// Digest identifying the entity the session is bound to
    pub bound_entity: Tpm2bDigest,
    pub policy_digest: Tpm2bDigest,
    /// Command the policy is restricted to
    pub command_code: Option<u32>,
    pub audit_digest: Tpm2bDigest,
}

impl Session {
    pub fn is_policy(&self) -> bool {
        self.session_type == SessionType::Policy
    }

    pub fn is_trial(&self) -> bool {
        self.flags.contains(SessionFlags::TRIAL)
    }

    /// Clears the policy state, keeping the session type.
    pub fn reset_policy(&mut self) {
        self.policy_digest = zero_digest(self.auth_hash);
        self.command_code = None;
        self.flags
            .remove(SessionFlags::INCLUDE_AUTH | SessionFlags::INCLUDE_PASSWORD);
    }

    /// policyDigest := H(policyDigest || parts)
    pub fn policy_extend(&mut self, parts: &[&[u8]]) {
        let mut all: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        all.push(self.policy_digest.as_slice());
        all.extend_from_slice(parts);
        let digest = self.auth_hash.digest(&all);
        self.policy_digest = Tpm2bDigest::from_vec(digest).unwrap_or_default();
    }
}

/// Identifies the entity a session is bound to.
pub(crate) fn bind_digest(name: &[u8], auth: &[u8]) -> Tpm2bDigest {
    Tpm2bDigest::from_vec(HashAlg::Sha256.digest(&[name, auth])).unwrap_or_default()
}

/// All-zero digest of the size of `alg`.
pub fn zero_digest(alg: HashAlg) -> Tpm2bDigest {
    Tpm2bDigest::from_vec(alloc::vec![0u8; alg.digest_size()]).unwrap_or_default()
}

impl Marshal for Session {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let session_type = match self.session_type {
            SessionType::Hmac => TPM_SE_HMAC,
            SessionType::Policy => TPM_SE_POLICY,
        };
        self.handle.marshal(out)
            + session_type.marshal(out)
            + self.flags.bits().marshal(out)
            + self.auth_hash.marshal(out)
            + self.nonce_tpm.marshal(out)
            + self.session_key.marshal(out)
            + self.symmetric.marshal(out)
            + self.bound_entity.marshal(out)
            + self.policy_digest.marshal(out)
            + self.command_code.marshal(out)
            + self.audit_digest.marshal(out)
    }
}

impl Unmarshal for Session {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let handle = cur.u32()?;
        let session_type = match cur.u8()? {
            TPM_SE_HMAC => SessionType::Hmac,
            TPM_SE_POLICY => SessionType::Policy,
            _ => return Err(MarshalError::Value),
        };
        let expected = match session_type {
            SessionType::Hmac => HT_HMAC_SESSION,
            SessionType::Policy => HT_POLICY_SESSION,
        };
        if handle_type(handle) != expected {
            return Err(MarshalError::Value);
        }
        let flags = SessionFlags::from_bits(cur.u16()?).ok_or(MarshalError::ReservedBits)?;
        Ok(Self {
            handle,
            session_type,
            flags,
            auth_hash: Unmarshal::unmarshal(cur)?,
            nonce_tpm: Unmarshal::unmarshal(cur)?,
            session_key: Unmarshal::unmarshal(cur)?,
            symmetric: Unmarshal::unmarshal(cur)?,
            bound_entity: Unmarshal::unmarshal(cur)?,
            policy_digest: Unmarshal::unmarshal(cur)?,
            command_code: Unmarshal::unmarshal(cur)?,
            audit_digest: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// Session slots in RAM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTable {
    slots: Vec<Option<Session>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn get(&self, slot: u8) -> Option<&Session> {
        self.slots.get(usize::from(slot))?.as_ref()
    }

    pub fn get_mut(&mut self, slot: u8) -> Option<&mut Session> {
        self.slots.get_mut(usize::from(slot))?.as_mut()
    }

    /// Stores `session` in a free slot and returns the slot number.
    pub fn insert(&mut self, session: Session) -> Result<u8, TpmReqError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TpmReqError::rc(TpmRc::SESSION_MEMORY))?;
        self.slots[slot] = Some(session);
        u8::try_from(slot).map_err(|_| TpmReqError::rc(TpmRc::SESSION_MEMORY))
    }

    pub fn remove(&mut self, slot: u8) -> Option<Session> {
        self.slots.get_mut(usize::from(slot))?.take()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn loaded(&self) -> impl Iterator<Item = &Session> + '_ {
        self.slots.iter().flatten()
    }
}

impl Marshal for SessionTable {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let mut len = (self.slots.len() as u16).marshal(out);
        for slot in self.slots.iter() {
            len += slot.marshal(out);
        }
        len
    }
}

impl Unmarshal for SessionTable {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let count = usize::from(cur.u16()?);
        if count > 0xFF {
            return Err(MarshalError::Size);
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(Option::<Session>::unmarshal(cur)?);
        }
        Ok(Self { slots })
    }
}

/// Index of a session handle in the context array.
pub fn handle_index(handle: u32) -> usize {
    (handle & HANDLE_INDEX_MASK) as usize
}

pub fn is_session_handle(handle: u32) -> bool {
    matches!(handle_type(handle), HT_HMAC_SESSION | HT_POLICY_SESSION)
}

impl Engine {
    fn context_entry(&self, handle: u32) -> Option<SessionContext> {
        if !is_session_handle(handle) {
            return None;
        }
        self.gr.context_array.get(handle_index(handle)).copied()
    }

    /// Slot of the loaded session `handle`.
    pub(crate) fn session_slot(&self, handle: u32) -> Result<u8, SessionLookup> {
        match self.context_entry(handle) {
            Some(SessionContext::Loaded(slot)) => match self.sessions.get(slot) {
                Some(session) if session.handle == handle => Ok(slot),
                _ => Err(SessionLookup::Unknown),
            },
            Some(SessionContext::Saved(_)) => Err(SessionLookup::Saved),
            _ => Err(SessionLookup::Unknown),
        }
    }

    pub(crate) fn session(&self, handle: u32) -> Option<&Session> {
        let slot = self.session_slot(handle).ok()?;
        self.sessions.get(slot)
    }

    pub(crate) fn session_mut(&mut self, handle: u32) -> Option<&mut Session> {
        let slot = self.session_slot(handle).ok()?;
        self.sessions.get_mut(slot)
    }

    /// Allocates a handle and a slot for a new session built by `build`.
    pub(crate) fn start_session(
        &mut self,
        session_type: SessionType,
        build: impl FnOnce(u32) -> Session,
    ) -> Result<u32, TpmReqError> {
        if !self.sessions.has_free_slot() {
            return Err(TpmReqError::rc(TpmRc::SESSION_MEMORY));
        }
        let index = self
            .gr
            .context_array
            .iter()
            .position(|entry| *entry == SessionContext::Free)
            .ok_or(TpmReqError::rc(TpmRc::SESSION_HANDLES))?;
        let base = match session_type {
            SessionType::Hmac => HMAC_SESSION_FIRST,
            SessionType::Policy => POLICY_SESSION_FIRST,
        };
        let handle = base + index as u32;
        let slot = self.sessions.insert(build(handle))?;
        self.gr.context_array[index] = SessionContext::Loaded(slot);
        Ok(handle)
    }

    /// Forgets the session, whether it is loaded or saved out.
    pub(crate) fn flush_session(&mut self, handle: u32) -> bool {
        let index = handle_index(handle);
        match self.context_entry(handle) {
            Some(SessionContext::Loaded(slot)) => {
                self.sessions.remove(slot);
            }
            Some(SessionContext::Saved(_)) => {}
            _ => return false,
        }
        self.gr.context_array[index] = SessionContext::Free;
        true
    }

    /// Handles of the loaded sessions, or of the saved ones, in ascending
    /// order. Saved sessions are reported in the HMAC session range.
    pub(crate) fn session_handles(&self, saved: bool) -> Vec<u32> {
        let mut handles: Vec<u32> = self
            .gr
            .context_array
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                SessionContext::Loaded(slot) if !saved => {
                    self.sessions.get(*slot).map(|s| s.handle)
                }
                SessionContext::Saved(_) if saved => Some(HMAC_SESSION_FIRST + index as u32),
                _ => None,
            })
            .collect();
        handles.sort_unstable();
        handles
    }
}

/// Why a session handle could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionLookup {
    Unknown,
    Saved,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn hmac_session(handle: u32) -> Session {
        Session {
            handle,
            session_type: SessionType::Hmac,
            flags: SessionFlags::empty(),
            auth_hash: HashAlg::Sha256,
            nonce_tpm: Tpm2bNonce::new(&[1; 16]).expect("Failed to build nonce"),
            session_key: Tpm2bDigest::empty(),
            symmetric: SymDef::Aes { key_bits: 128 },
            bound_entity: Tpm2bDigest::empty(),
            policy_digest: zero_digest(HashAlg::Sha256),
            command_code: None,
            audit_digest: Tpm2bDigest::empty(),
        }
    }

    #[test]
    fn sym_def_wire_format() {
        let data = [0x00, 0x06, 0x00, 0x80, 0x00, 0x43];
        assert_eq!(
            SymDef::unmarshal(&mut Cursor::new(&data)),
            Ok(SymDef::Aes { key_bits: 128 })
        );
        let bad_mode = [0x00, 0x06, 0x00, 0x80, 0x00, 0x44];
        assert_eq!(
            SymDef::unmarshal(&mut Cursor::new(&bad_mode)),
            Err(MarshalError::Mode)
        );
        let bad_bits = [0x00, 0x06, 0x00, 0xC0, 0x00, 0x43];
        assert_eq!(
            SymDef::unmarshal(&mut Cursor::new(&bad_bits)),
            Err(MarshalError::KeySize)
        );
        assert_eq!(SymDef::Xor(HashAlg::Sha256).to_bytes(), [0x00, 0x0A, 0x00, 0x0B]);
    }

    #[test]
    fn policy_reset_keeps_trial() {
        let mut session = hmac_session(POLICY_SESSION_FIRST);
        session.session_type = SessionType::Policy;
        session.flags = SessionFlags::TRIAL | SessionFlags::INCLUDE_AUTH;
        session.policy_extend(&[&cc::POLICY_AUTH_VALUE.to_be_bytes()[..]]);
        session.command_code = Some(cc::NV_READ);
        session.reset_policy();
        assert_eq!(session.policy_digest, zero_digest(HashAlg::Sha256));
        assert_eq!(session.flags, SessionFlags::TRIAL);
        assert_eq!(session.command_code, None);
    }

    #[test]
    fn table_snapshot() {
        let mut table = SessionTable::new(3);
        assert!(matches!(table.insert(hmac_session(HMAC_SESSION_FIRST)), Ok(0)));
        assert!(matches!(table.insert(hmac_session(HMAC_SESSION_FIRST + 1)), Ok(1)));
        table.remove(0);
        assert_eq!(table.free_slots(), 2);
        let bytes = table.to_bytes();
        let mut cur = Cursor::new(&bytes);
        assert_eq!(SessionTable::unmarshal(&mut cur), Ok(table));
        assert!(cur.end().is_ok());
    }

    #[test]
    fn session_handle_must_match_type() {
        let mut session = hmac_session(POLICY_SESSION_FIRST);
        session.session_type = SessionType::Hmac;
        let bytes = session.to_bytes();
        assert_eq!(
            Session::unmarshal(&mut Cursor::new(&bytes)),
            Err(MarshalError::Value)
        );
    }
}
