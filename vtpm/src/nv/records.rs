// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! NV encoding of the state aggregates.

use super::{NvDecoder, NvEncoder, NvError, NvLayout, NvRecord};
use crate::config::TpmConfig;
use crate::crypto::drbg::HmacDrbg;
use crate::crypto::HashAlg;
use crate::pcr::{PcrAllocation, PcrSave};
use crate::state::{
    CcBitmap, EccCommit, HierarchyAuth, OrderlyData, PersistentData, SessionContext,
    StateClearData, StateResetData,
};
use crate::marshal::Tpm2bDigest;
use alloc::vec::Vec;
use core::ops::Range;

fn encode_hierarchy(enc: &mut NvEncoder, h: &HierarchyAuth) {
    enc.sized(&h.auth);
    enc.hash_alg(h.policy_alg);
    enc.sized(&h.policy);
}

fn decode_hierarchy(dec: &mut NvDecoder<'_>) -> Result<HierarchyAuth, NvError> {
    Ok(HierarchyAuth {
        auth: dec.sized()?,
        policy_alg: dec.hash_alg()?,
        policy: dec.sized()?,
    })
}

fn encode_allocation(enc: &mut NvEncoder, alloc: &PcrAllocation) {
    for alg in HashAlg::ALL {
        enc.bytes(&alloc.select(alg));
    }
}

fn decode_allocation(dec: &mut NvDecoder<'_>) -> Result<PcrAllocation, NvError> {
    let mut alloc = PcrAllocation::default();
    for alg in HashAlg::ALL {
        alloc.set(alg, dec.array()?);
    }
    Ok(alloc)
}

/// Version 1 lacked the firmware version pair and the audit counter.
const PERSISTENT_V1: u16 = 1;

impl NvRecord for PersistentData {
    const MAGIC: u32 = 0x4e56_4750; // "NVGP"
    const VERSION: u16 = 2;
    const MIN_VERSION: u16 = PERSISTENT_V1;

    fn region(layout: &NvLayout) -> Range<usize> {
        layout.persistent.clone()
    }

    fn encode(&self, enc: &mut NvEncoder) {
        enc.bool(self.disable_clear);
        encode_hierarchy(enc, &self.owner);
        encode_hierarchy(enc, &self.endorsement);
        encode_hierarchy(enc, &self.lockout);
        enc.bytes(&self.eps_seed);
        enc.bytes(&self.sps_seed);
        enc.bytes(&self.pps_seed);
        enc.bytes(&self.eh_proof);
        enc.bytes(&self.sh_proof);
        enc.bytes(&self.ph_proof);
        enc.u64(self.total_reset_count);
        enc.u32(self.reset_count);
        encode_allocation(enc, &self.pcr_allocated);
        enc.bytes(&self.pp_commands.0);
        enc.bytes(&self.audit_commands.0);
        enc.hash_alg(self.audit_hash_alg);
        enc.u32(self.failed_tries);
        enc.u32(self.max_tries);
        enc.u32(self.recovery_time);
        enc.u32(self.lockout_recovery);
        enc.bool(self.lockout_auth_enabled);
        enc.u16(self.orderly_state);
        enc.u32(self.algorithm_set);
        // Added in version 2
        enc.u32(self.firmware_v1);
        enc.u32(self.firmware_v2);
        enc.u64(self.audit_counter);
    }

    fn decode(
        dec: &mut NvDecoder<'_>,
        version: u16,
        config: &TpmConfig,
    ) -> Result<Self, NvError> {
        let mut gp = PersistentData {
            disable_clear: dec.bool()?,
            owner: decode_hierarchy(dec)?,
            endorsement: decode_hierarchy(dec)?,
            lockout: decode_hierarchy(dec)?,
            eps_seed: dec.array()?,
            sps_seed: dec.array()?,
            pps_seed: dec.array()?,
            eh_proof: dec.array()?,
            sh_proof: dec.array()?,
            ph_proof: dec.array()?,
            total_reset_count: dec.u64()?,
            reset_count: dec.u32()?,
            pcr_allocated: decode_allocation(dec)?,
            pp_commands: CcBitmap(dec.array()?),
            audit_commands: CcBitmap(dec.array()?),
            audit_hash_alg: dec.hash_alg()?,
            failed_tries: dec.u32()?,
            max_tries: dec.u32()?,
            recovery_time: dec.u32()?,
            lockout_recovery: dec.u32()?,
            lockout_auth_enabled: dec.bool()?,
            orderly_state: dec.u16()?,
            algorithm_set: dec.u32()?,
            firmware_v1: config.firmware_version.0,
            firmware_v2: config.firmware_version.1,
            audit_counter: 0,
        };
        if version > PERSISTENT_V1 {
            gp.firmware_v1 = dec.u32()?;
            gp.firmware_v2 = dec.u32()?;
            gp.audit_counter = dec.u64()?;
        }
        Ok(gp)
    }
}

const CONTEXT_FREE: u8 = 0;
const CONTEXT_LOADED: u8 = 1;
const CONTEXT_SAVED: u8 = 2;

impl NvRecord for StateResetData {
    const MAGIC: u32 = 0x4e56_4752; // "NVGR"
    const VERSION: u16 = 1;
    const MIN_VERSION: u16 = 1;

    fn region(layout: &NvLayout) -> Range<usize> {
        layout.state_reset.clone()
    }

    fn encode(&self, enc: &mut NvEncoder) {
        enc.bytes(&self.null_proof);
        enc.bytes(&self.null_seed);
        enc.u32(self.clear_count);
        enc.u32(self.restart_count);
        enc.u64(self.object_context_id);
        enc.u64(self.context_counter);
        enc.u16(self.context_array.len() as u16);
        for entry in self.context_array.iter() {
            match entry {
                SessionContext::Free => {
                    enc.u8(CONTEXT_FREE);
                    enc.u64(0);
                }
                SessionContext::Loaded(slot) => {
                    enc.u8(CONTEXT_LOADED);
                    enc.u64(u64::from(*slot));
                }
                SessionContext::Saved(seq) => {
                    enc.u8(CONTEXT_SAVED);
                    enc.u64(*seq);
                }
            }
        }
        // Optional blocks keep their space when absent
        enc.bool(self.command_audit_digest.is_some());
        enc.sized(self.command_audit_digest.as_ref().unwrap_or(&Tpm2bDigest::empty()));
        enc.u32(self.pcr_counter);
        let commit = self.commit.clone().unwrap_or_default();
        enc.bool(self.commit.is_some());
        enc.u64(commit.counter);
        enc.bytes(&commit.nonce);
        enc.bytes(&commit.array);
    }

    fn decode(
        dec: &mut NvDecoder<'_>,
        _version: u16,
        config: &TpmConfig,
    ) -> Result<Self, NvError> {
        let null_proof = dec.array()?;
        let null_seed = dec.array()?;
        let clear_count = dec.u32()?;
        let restart_count = dec.u32()?;
        let object_context_id = dec.u64()?;
        let context_counter = dec.u64()?;
        let count = usize::from(dec.u16()?);
        if count != config.max_active_sessions {
            return Err(NvError::Corrupt);
        }
        let mut context_array = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = dec.u8()?;
            let value = dec.u64()?;
            context_array.push(match tag {
                CONTEXT_FREE => SessionContext::Free,
                CONTEXT_LOADED => {
                    SessionContext::Loaded(u8::try_from(value).map_err(|_| NvError::Corrupt)?)
                }
                CONTEXT_SAVED => SessionContext::Saved(value),
                _ => return Err(NvError::Corrupt),
            });
        }
        let has_audit = dec.bool()?;
        let audit = dec.sized()?;
        let pcr_counter = dec.u32()?;
        let has_commit = dec.bool()?;
        let commit = EccCommit {
            counter: dec.u64()?,
            nonce: dec.array()?,
            array: dec.array()?,
        };
        if has_audit != config.command_audit || has_commit != config.ecc {
            return Err(NvError::Corrupt);
        }
        Ok(Self {
            null_proof,
            null_seed,
            clear_count,
            restart_count,
            object_context_id,
            context_counter,
            context_array,
            command_audit_digest: has_audit.then_some(audit),
            pcr_counter,
            commit: has_commit.then_some(commit),
        })
    }
}

impl NvRecord for StateClearData {
    const MAGIC: u32 = 0x4e56_4743; // "NVGC"
    const VERSION: u16 = 1;
    const MIN_VERSION: u16 = 1;

    fn region(layout: &NvLayout) -> Range<usize> {
        layout.state_clear.clone()
    }

    fn encode(&self, enc: &mut NvEncoder) {
        enc.bool(self.sh_enable);
        enc.bool(self.eh_enable);
        enc.bool(self.ph_enable_nv);
        encode_hierarchy(enc, &self.platform);
        for alg in HashAlg::ALL {
            enc.bytes(self.pcr_save.bank(alg));
        }
    }

    fn decode(
        dec: &mut NvDecoder<'_>,
        _version: u16,
        _config: &TpmConfig,
    ) -> Result<Self, NvError> {
        let sh_enable = dec.bool()?;
        let eh_enable = dec.bool()?;
        let ph_enable_nv = dec.bool()?;
        let platform = decode_hierarchy(dec)?;
        let mut pcr_save = PcrSave::default();
        for alg in HashAlg::ALL {
            pcr_save.set_bank(alg, dec.bytes(PcrSave::bank_size(alg))?);
        }
        Ok(Self {
            sh_enable,
            eh_enable,
            ph_enable_nv,
            platform,
            pcr_save,
        })
    }
}

impl NvRecord for OrderlyData {
    const MAGIC: u32 = 0x4e56_474f; // "NVGO"
    const VERSION: u16 = 1;
    const MIN_VERSION: u16 = 1;

    fn region(layout: &NvLayout) -> Range<usize> {
        layout.orderly.clone()
    }

    fn encode(&self, enc: &mut NvEncoder) {
        enc.u64(self.clock);
        enc.bool(self.clock_safe);
        enc.bytes(&self.drbg.key);
        enc.bytes(&self.drbg.value);
        enc.u64(self.drbg.reseed_counter);
        enc.u64(self.self_heal_timer);
        enc.u64(self.lockout_timer);
    }

    fn decode(
        dec: &mut NvDecoder<'_>,
        _version: u16,
        _config: &TpmConfig,
    ) -> Result<Self, NvError> {
        Ok(Self {
            clock: dec.u64()?,
            clock_safe: dec.bool()?,
            drbg: HmacDrbg {
                key: dec.array()?,
                value: dec.array()?,
                reseed_counter: dec.u64()?,
            },
            self_heal_timer: dec.u64()?,
            lockout_timer: dec.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryPlatform, Platform};
    use crate::state::SessionContext;

    fn setup(config: &TpmConfig) -> (NvLayout, MemoryPlatform) {
        let layout = NvLayout::new(config).expect("Failed to compute layout");
        (layout, MemoryPlatform::new(config.nv_size))
    }

    #[test]
    fn persistent_round_trip() {
        let config = TpmConfig::default();
        let (layout, mut platform) = setup(&config);
        let mut gp = PersistentData::new(&config);
        gp.owner.auth = crate::marshal::Tpm2bAuth::new(b"owner").expect("Failed to build auth");
        gp.reset_count = 7;
        gp.audit_counter = 3;
        gp.eps_seed = [0x42; 32];
        layout.store(&mut platform, &gp).expect("Failed to store");
        assert_eq!(layout.load::<PersistentData>(&platform, &config), Ok(gp));
    }

    #[test]
    fn persistent_v1_is_upgraded() {
        let config = TpmConfig::default();
        let (layout, mut platform) = setup(&config);
        let mut gp = PersistentData::new(&config);
        gp.reset_count = 5;
        gp.firmware_v1 = 1;
        gp.audit_counter = 99;
        layout.store(&mut platform, &gp).expect("Failed to store");

        // Rewrite as version 1: drop the trailing fields
        let mut enc = NvEncoder::new();
        gp.encode(&mut enc);
        let mut body = enc.finish();
        body.truncate(body.len() - 16);
        let start = layout.persistent.start;
        platform.nv_write(start, &[0, 1]).expect("Failed to write NV");
        platform.nv_write(start + 6, &body).expect("Failed to write NV");

        let upgraded = layout
            .load::<PersistentData>(&platform, &config)
            .expect("Failed to upgrade");
        assert_eq!(upgraded.reset_count, 5);
        assert_eq!(upgraded.firmware_v1, config.firmware_version.0);
        assert_eq!(upgraded.audit_counter, 0);

        platform.nv_write(start, &[0, 0]).expect("Failed to write NV");
        assert_eq!(
            layout.load::<PersistentData>(&platform, &config),
            Err(NvError::VersionUnsupported)
        );
        platform.nv_write(start, &[0, 3]).expect("Failed to write NV");
        assert_eq!(
            layout.load::<PersistentData>(&platform, &config),
            Err(NvError::VersionTooNew)
        );
    }

    #[test]
    fn state_reset_round_trip_both_configs() {
        for (ecc, command_audit) in [(true, true), (false, false), (true, false)] {
            let config = TpmConfig {
                ecc,
                command_audit,
                ..Default::default()
            };
            let (layout, mut platform) = setup(&config);
            let mut gr = StateResetData::new(&config);
            gr.context_array[1] = SessionContext::Saved(0x1_0000_0001);
            gr.context_array[3] = SessionContext::Loaded(2);
            gr.restart_count = 4;
            layout.store(&mut platform, &gr).expect("Failed to store");
            assert_eq!(layout.load::<StateResetData>(&platform, &config), Ok(gr));

            // A region written with the other setting is rejected
            let other = TpmConfig {
                ecc: !ecc,
                ..config.clone()
            };
            assert_eq!(
                layout.load::<StateResetData>(&platform, &other),
                Err(NvError::Corrupt)
            );
        }
    }

    #[test]
    fn state_clear_keeps_pcr_save() {
        let config = TpmConfig::default();
        let (layout, mut platform) = setup(&config);
        let mut gc = StateClearData {
            sh_enable: false,
            ..Default::default()
        };
        let bank = alloc::vec![0x33u8; PcrSave::bank_size(HashAlg::Sha256)];
        assert!(gc.pcr_save.set_bank(HashAlg::Sha256, &bank));
        layout.store(&mut platform, &gc).expect("Failed to store");
        assert_eq!(layout.load::<StateClearData>(&platform, &config), Ok(gc));
    }
}
