// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! The four state aggregates.
//!
//! * [`PersistentData`] lives in NV and is written whenever one of its
//!   fields changes.
//! * [`StateResetData`] survives TPM Restart and TPM Resume; it is written
//!   on Shutdown and reinitialized by TPM Reset.
//! * [`StateClearData`] survives TPM Resume only.
//! * [`OrderlyData`] changes on nearly every command and is only flushed
//!   to NV on an orderly event.
//!
//! The `Marshal`/`Unmarshal` implementations here are used by volatile
//! state snapshots. The NV encoding is separate, see [`crate::nv`].

use crate::config::TpmConfig;
use crate::crypto::drbg::HmacDrbg;
use crate::crypto::HashAlg;
use crate::marshal::{Cursor, Marshal, MarshalError, Tpm2bAuth, Tpm2bDigest, Unmarshal};
use crate::pcr::{PcrAllocation, PcrSave};
use crate::types::{cc, CC_BITMAP_BYTES};
use alloc::vec;
use alloc::vec::Vec;

/// Size of primary seeds and hierarchy proofs.
pub const SEED_SIZE: usize = 32;
/// `orderly_state` value when no orderly shutdown is pending.
pub const SHUTDOWN_NONE: u16 = 0xFFFF;

/// Authorization value and policy of a hierarchy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HierarchyAuth {
    pub auth: Tpm2bAuth,
    pub policy_alg: Option<HashAlg>,
    pub policy: Tpm2bDigest,
}

impl Marshal for HierarchyAuth {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.auth.marshal(out)
            + HashAlg::marshal_or_null(self.policy_alg, out)
            + self.policy.marshal(out)
    }
}

impl Unmarshal for HierarchyAuth {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            auth: Unmarshal::unmarshal(cur)?,
            policy_alg: HashAlg::unmarshal_or_null(cur)?,
            policy: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// One bit per command code in `cc::FIRST..=cc::LAST`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcBitmap(pub [u8; CC_BITMAP_BYTES]);

impl CcBitmap {
    fn bit(code: u32) -> Option<(usize, u8)> {
        if !(cc::FIRST..=cc::LAST).contains(&code) {
            return None;
        }
        let n = (code - cc::FIRST) as usize;
        Some((n / 8, 1 << (n % 8)))
    }

    pub fn is_set(&self, code: u32) -> bool {
        Self::bit(code).is_some_and(|(i, mask)| self.0[i] & mask != 0)
    }

    /// Sets or clears the bit of `code`. Returns whether it changed.
    pub fn assign(&mut self, code: u32, set: bool) -> bool {
        let Some((i, mask)) = Self::bit(code) else {
            return false;
        };
        let old = self.0[i];
        if set {
            self.0[i] |= mask;
        } else {
            self.0[i] &= !mask;
        }
        old != self.0[i]
    }

    /// Command codes whose bit is set, in ascending order.
    pub fn codes(&self) -> impl Iterator<Item = u32> + '_ {
        (cc::FIRST..=cc::LAST).filter(|code| self.is_set(*code))
    }
}

/// State kept across all power cycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentData {
    pub disable_clear: bool,
    pub owner: HierarchyAuth,
    pub endorsement: HierarchyAuth,
    pub lockout: HierarchyAuth,
    pub eps_seed: [u8; SEED_SIZE],
    pub sps_seed: [u8; SEED_SIZE],
    pub pps_seed: [u8; SEED_SIZE],
    pub eh_proof: [u8; SEED_SIZE],
    pub sh_proof: [u8; SEED_SIZE],
    pub ph_proof: [u8; SEED_SIZE],
    pub total_reset_count: u64,
    pub reset_count: u32,
    pub pcr_allocated: PcrAllocation,
    /// Commands that need physical presence when authorized by the platform
    pub pp_commands: CcBitmap,
    pub audit_commands: CcBitmap,
    pub audit_hash_alg: Option<HashAlg>,
    pub audit_counter: u64,
    // Dictionary attack protection
    pub failed_tries: u32,
    pub max_tries: u32,
    pub recovery_time: u32,
    pub lockout_recovery: u32,
    pub lockout_auth_enabled: bool,
    /// Shutdown type of the last orderly shutdown, or [`SHUTDOWN_NONE`]
    pub orderly_state: u16,
    pub algorithm_set: u32,
    pub firmware_v1: u32,
    pub firmware_v2: u32,
}

/// Dictionary attack defaults: three tries, one per 1000 seconds, lockout
/// authorization back after a day.
const DEFAULT_MAX_TRIES: u32 = 3;
const DEFAULT_RECOVERY_TIME: u32 = 1000;
const DEFAULT_LOCKOUT_RECOVERY: u32 = 86400;

impl PersistentData {
    /// Manufacture-time values. Seeds and proofs are filled in by the caller.
    pub fn new(config: &TpmConfig) -> Self {
        let mut pp_commands = CcBitmap::default();
        pp_commands.assign(cc::PP_COMMANDS, true);
        let mut audit_commands = CcBitmap::default();
        audit_commands.assign(cc::SET_COMMAND_CODE_AUDIT_STATUS, true);
        Self {
            disable_clear: false,
            owner: HierarchyAuth::default(),
            endorsement: HierarchyAuth::default(),
            lockout: HierarchyAuth::default(),
            eps_seed: [0; SEED_SIZE],
            sps_seed: [0; SEED_SIZE],
            pps_seed: [0; SEED_SIZE],
            eh_proof: [0; SEED_SIZE],
            sh_proof: [0; SEED_SIZE],
            ph_proof: [0; SEED_SIZE],
            total_reset_count: 0,
            reset_count: 0,
            pcr_allocated: PcrAllocation::new(&config.pcr_banks, config.pcr_count),
            pp_commands,
            audit_commands,
            audit_hash_alg: None,
            audit_counter: 0,
            failed_tries: 0,
            max_tries: DEFAULT_MAX_TRIES,
            recovery_time: DEFAULT_RECOVERY_TIME,
            lockout_recovery: DEFAULT_LOCKOUT_RECOVERY,
            lockout_auth_enabled: true,
            orderly_state: SHUTDOWN_NONE,
            algorithm_set: 0,
            firmware_v1: config.firmware_version.0,
            firmware_v2: config.firmware_version.1,
        }
    }

    /// Whether dictionary attack protected entities are locked out.
    pub fn in_lockout(&self) -> bool {
        self.max_tries == 0 || self.failed_tries >= self.max_tries
    }
}

/// Where an active session currently lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionContext {
    #[default]
    Free,
    /// Loaded in the given session slot
    Loaded(u8),
    /// Context saved with the given sequence number
    Saved(u64),
}

impl Marshal for SessionContext {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        match self {
            Self::Free => 0u8.marshal(out),
            Self::Loaded(slot) => 1u8.marshal(out) + slot.marshal(out),
            Self::Saved(seq) => 2u8.marshal(out) + seq.marshal(out),
        }
    }
}

impl Unmarshal for SessionContext {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        match cur.u8()? {
            0 => Ok(Self::Free),
            1 => Ok(Self::Loaded(cur.u8()?)),
            2 => Ok(Self::Saved(cur.u64()?)),
            _ => Err(MarshalError::Value),
        }
    }
}

/// ECC commit bookkeeping, present when ECC support is configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EccCommit {
    pub counter: u64,
    pub nonce: [u8; SEED_SIZE],
    pub array: [u8; 16],
}

impl Marshal for EccCommit {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.counter.marshal(out) + self.nonce.marshal(out) + self.array.marshal(out)
    }
}

impl Unmarshal for EccCommit {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            counter: Unmarshal::unmarshal(cur)?,
            nonce: Unmarshal::unmarshal(cur)?,
            array: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// First sequence number handed out after a TPM Reset.
pub const FIRST_CONTEXT_SEQUENCE: u64 = 0x100;

/// State that is reinitialized by TPM Reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateResetData {
    pub null_proof: [u8; SEED_SIZE],
    pub null_seed: [u8; SEED_SIZE],
    pub clear_count: u32,
    pub restart_count: u32,
    pub object_context_id: u64,
    pub context_counter: u64,
    /// Indexed by the low bits of a session handle
    pub context_array: Vec<SessionContext>,
    /// Present when command audit is configured
    pub command_audit_digest: Option<Tpm2bDigest>,
    pub pcr_counter: u32,
    /// Present when ECC is configured
    pub commit: Option<EccCommit>,
}

impl StateResetData {
    pub fn new(config: &TpmConfig) -> Self {
        Self {
            null_proof: [0; SEED_SIZE],
            null_seed: [0; SEED_SIZE],
            clear_count: 0,
            restart_count: 0,
            object_context_id: FIRST_CONTEXT_SEQUENCE,
            context_counter: FIRST_CONTEXT_SEQUENCE,
            context_array: vec![SessionContext::Free; config.max_active_sessions],
            command_audit_digest: config.command_audit.then(Tpm2bDigest::empty),
            pcr_counter: 0,
            commit: config.ecc.then(EccCommit::default),
        }
    }

    /// Checks that optional blocks match the configuration.
    pub fn matches(&self, config: &TpmConfig) -> bool {
        self.context_array.len() == config.max_active_sessions
            && self.command_audit_digest.is_some() == config.command_audit
            && self.commit.is_some() == config.ecc
    }
}

impl Marshal for StateResetData {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let mut len = self.null_proof.marshal(out)
            + self.null_seed.marshal(out)
            + self.clear_count.marshal(out)
            + self.restart_count.marshal(out)
            + self.object_context_id.marshal(out)
            + self.context_counter.marshal(out)
            + (self.context_array.len() as u16).marshal(out);
        for entry in self.context_array.iter() {
            len += entry.marshal(out);
        }
        len + self.command_audit_digest.marshal(out)
            + self.pcr_counter.marshal(out)
            + self.commit.marshal(out)
    }
}

impl Unmarshal for StateResetData {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let null_proof = Unmarshal::unmarshal(cur)?;
        let null_seed = Unmarshal::unmarshal(cur)?;
        let clear_count = cur.u32()?;
        let restart_count = cur.u32()?;
        let object_context_id = cur.u64()?;
        let context_counter = cur.u64()?;
        let count = usize::from(cur.u16()?);
        if count > 0xFF {
            return Err(MarshalError::Size);
        }
        let mut context_array = Vec::with_capacity(count);
        for _ in 0..count {
            context_array.push(SessionContext::unmarshal(cur)?);
        }
        Ok(Self {
            null_proof,
            null_seed,
            clear_count,
            restart_count,
            object_context_id,
            context_counter,
            context_array,
            command_audit_digest: Unmarshal::unmarshal(cur)?,
            pcr_counter: cur.u32()?,
            commit: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// State that is reinitialized by Startup(CLEAR).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateClearData {
    pub sh_enable: bool,
    pub eh_enable: bool,
    pub ph_enable_nv: bool,
    pub platform: HierarchyAuth,
    pub pcr_save: PcrSave,
}

impl Default for StateClearData {
    fn default() -> Self {
        Self {
            sh_enable: true,
            eh_enable: true,
            ph_enable_nv: true,
            platform: HierarchyAuth::default(),
            pcr_save: PcrSave::default(),
        }
    }
}

impl Marshal for StateClearData {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.sh_enable.marshal(out)
            + self.eh_enable.marshal(out)
            + self.ph_enable_nv.marshal(out)
            + self.platform.marshal(out)
            + self.pcr_save.marshal(out)
    }
}

impl Unmarshal for StateClearData {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            sh_enable: Unmarshal::unmarshal(cur)?,
            eh_enable: Unmarshal::unmarshal(cur)?,
            ph_enable_nv: Unmarshal::unmarshal(cur)?,
            platform: Unmarshal::unmarshal(cur)?,
            pcr_save: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// State flushed to NV only on orderly events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderlyData {
    /// Milliseconds the TPM has been powered since manufacture
    pub clock: u64,
    pub clock_safe: bool,
    pub drbg: HmacDrbg,
    /// Clock value at the last dictionary attack self-heal step
    pub self_heal_timer: u64,
    /// Clock value at which lockout authorization was disabled
    pub lockout_timer: u64,
}

impl Marshal for HmacDrbg {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.key.marshal(out) + self.value.marshal(out) + self.reseed_counter.marshal(out)
    }
}

impl Unmarshal for HmacDrbg {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            key: Unmarshal::unmarshal(cur)?,
            value: Unmarshal::unmarshal(cur)?,
            reseed_counter: cur.u64()?,
        })
    }
}

impl Marshal for OrderlyData {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.clock.marshal(out)
            + self.clock_safe.marshal(out)
            + self.drbg.marshal(out)
            + self.self_heal_timer.marshal(out)
            + self.lockout_timer.marshal(out)
    }
}

impl Unmarshal for OrderlyData {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            clock: cur.u64()?,
            clock_safe: Unmarshal::unmarshal(cur)?,
            drbg: Unmarshal::unmarshal(cur)?,
            self_heal_timer: cur.u64()?,
            lockout_timer: cur.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cc_bitmap() {
        let mut bitmap = CcBitmap::default();
        assert!(bitmap.assign(cc::CLEAR, true));
        assert!(!bitmap.assign(cc::CLEAR, true));
        assert!(bitmap.assign(cc::LAST, true));
        assert!(!bitmap.assign(0x1A0, true));
        assert_eq!(bitmap.codes().collect::<Vec<_>>(), vec![cc::CLEAR, cc::LAST]);
        assert!(bitmap.assign(cc::CLEAR, false));
        assert!(!bitmap.is_set(cc::CLEAR));
    }

    #[test]
    fn optional_blocks_follow_config() {
        let config = TpmConfig {
            ecc: false,
            ..Default::default()
        };
        let gr = StateResetData::new(&config);
        assert!(gr.commit.is_none());
        assert!(gr.command_audit_digest.is_some());
        assert!(gr.matches(&config));
        assert!(!gr.matches(&TpmConfig::default()));
    }

    #[test]
    fn state_reset_snapshot_encoding() {
        let mut gr = StateResetData::new(&TpmConfig::default());
        gr.context_array[2] = SessionContext::Saved(0x1234);
        gr.context_array[5] = SessionContext::Loaded(1);
        gr.pcr_counter = 9;
        let bytes = gr.to_bytes();
        let mut cur = Cursor::new(&bytes);
        assert_eq!(StateResetData::unmarshal(&mut cur), Ok(gr));
        assert!(cur.end().is_ok());
    }

    #[test]
    fn lockout_threshold() {
        let mut gp = PersistentData::new(&TpmConfig::default());
        assert!(!gp.in_lockout());
        gp.failed_tries = gp.max_tries;
        assert!(gp.in_lockout());
        assert!(gp.pp_commands.is_set(cc::PP_COMMANDS));
        assert!(gp.audit_commands.is_set(cc::SET_COMMAND_CODE_AUDIT_STATUS));
    }
}
