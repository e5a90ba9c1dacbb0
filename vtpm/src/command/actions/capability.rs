// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! TPM2_GetCapability.
//!
//! Every capability is a sorted list. `property` selects the first item
//! reported and `count` bounds the number of items. `moreData` tells the
//! caller that items past the last one returned exist.

use super::audit::MAX_CAP_CC;
use crate::command::{implemented, Request, Response};
use crate::config::PCR_SELECT_SIZE;
use crate::engine::{Engine, CLOCK_UPDATE_SHIFT};
use crate::marshal::{marshal_list, Marshal, MAX_DIGEST_SIZE};
use crate::rc::{ParamExt, TpmReqError};
use crate::state::SHUTDOWN_NONE;
use crate::types::*;
use alloc::vec::Vec;

const MAX_CAP_ALGS: usize = 64;
const MAX_CAP_HANDLES: usize = 254;
const MAX_TPM_PROPERTIES: usize = 127;

// TPMA_ALGORITHM
const ALG_SYMMETRIC: u32 = 1 << 1;
const ALG_HASH: u32 = 1 << 2;
const ALG_OBJECT: u32 = 1 << 3;
const ALG_SIGNING: u32 = 1 << 8;
const ALG_ENCRYPTING: u32 = 1 << 9;
const ALG_METHOD: u32 = 1 << 10;

/// Implemented algorithms and their TPMA_ALGORITHM, by algorithm ID.
const ALGORITHMS: [(u16, u32); 9] = [
    (TPM_ALG_HMAC, ALG_HASH | ALG_SIGNING),
    (TPM_ALG_AES, ALG_SYMMETRIC),
    (TPM_ALG_KEYEDHASH, ALG_HASH | ALG_OBJECT),
    (TPM_ALG_XOR, ALG_SYMMETRIC | ALG_HASH),
    (TPM_ALG_SHA256, ALG_HASH),
    (TPM_ALG_SHA384, ALG_HASH),
    (TPM_ALG_SHA512, ALG_HASH),
    (TPM_ALG_KDF1_SP800_108, ALG_HASH | ALG_METHOD),
    (TPM_ALG_CFB, ALG_SYMMETRIC | ALG_ENCRYPTING),
];

/// Handles that always exist, in ascending order.
const PERMANENT_HANDLES: [u32; 7] = [
    TPM_RH_OWNER,
    TPM_RH_NULL,
    TPM_RS_PW,
    TPM_RH_LOCKOUT,
    TPM_RH_ENDORSEMENT,
    TPM_RH_PLATFORM,
    TPM_RH_PLATFORM_NV,
];

/// Writes up to `count` of the `items` starting at the first one whose
/// key is at least `first`. Returns whether items were left out.
fn select<T: Marshal>(items: Vec<(u32, T)>, first: u32, count: usize, out: &mut Vec<u8>) -> bool {
    let mut tail: Vec<T> = items
        .into_iter()
        .filter(|(key, _)| *key >= first)
        .map(|(_, item)| item)
        .collect();
    let more = tail.len() > count;
    tail.truncate(count);
    marshal_list(&tail, out);
    more
}

/// A TPMS_ALG_PROPERTY or TPMS_TAGGED_PROPERTY.
#[derive(Clone, Copy, Debug)]
struct Tagged<T>(T, u32);

impl<T: Marshal> Marshal for Tagged<T> {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.0.marshal(out) + self.1.marshal(out)
    }
}

impl Engine {
    /// Handles of NV entries of the given handle type.
    fn nv_handles(&self, ty: u8) -> Result<Vec<u32>, TpmReqError> {
        let mut handles: Vec<u32> = self
            .layout
            .entries(&*self.platform)?
            .into_iter()
            .map(|entry| entry.handle)
            .filter(|handle| handle_type(*handle) == ty)
            .collect();
        handles.sort_unstable();
        Ok(handles)
    }

    fn handles_of_type(&self, ty: u8) -> Result<Vec<u32>, TpmReqError> {
        let handles = match ty {
            HT_PCR => (0..self.config.pcr_count as u32).collect(),
            HT_NV_INDEX | HT_PERSISTENT => self.nv_handles(ty)?,
            HT_HMAC_SESSION => self.session_handles(false),
            HT_POLICY_SESSION => self.session_handles(true),
            HT_TRANSIENT => self.objects.handles().collect(),
            HT_PERMANENT => PERMANENT_HANDLES.to_vec(),
            _ => Vec::new(),
        };
        Ok(handles)
    }

    fn permanent_flags(&self) -> u32 {
        let gp = &self.gp;
        let mut flags = PERMANENT_TPM_GENERATED_EPS;
        let bits = [
            (!gp.owner.auth.is_empty(), PERMANENT_OWNER_AUTH_SET),
            (!gp.endorsement.auth.is_empty(), PERMANENT_ENDORSEMENT_AUTH_SET),
            (!gp.lockout.auth.is_empty(), PERMANENT_LOCKOUT_AUTH_SET),
            (gp.disable_clear, PERMANENT_DISABLE_CLEAR),
            (gp.in_lockout(), PERMANENT_IN_LOCKOUT),
        ];
        for (set, bit) in bits {
            if set {
                flags |= bit;
            }
        }
        flags
    }

    fn startup_clear_flags(&self) -> u32 {
        let bits = [
            (self.ph_enable, STARTUP_CLEAR_PH_ENABLE),
            (self.gc.sh_enable, STARTUP_CLEAR_SH_ENABLE),
            (self.gc.eh_enable, STARTUP_CLEAR_EH_ENABLE),
            (self.gc.ph_enable_nv, STARTUP_CLEAR_PH_ENABLE_NV),
            (self.gp.orderly_state != SHUTDOWN_NONE, STARTUP_CLEAR_ORDERLY),
        ];
        bits.iter()
            .filter(|(set, _)| *set)
            .fold(0, |flags, (_, bit)| flags | bit)
    }

    /// Every TPM property, fixed ones first.
    fn tpm_properties(&self) -> Result<Vec<(u32, u32)>, TpmReqError> {
        let config = &self.config;
        let commands = implemented(config).count() as u32;
        let loaded = self.session_handles(false).len() as u32;
        let saved = self.session_handles(true).len() as u32;
        let active_max = config.max_active_sessions as u32;
        let nv_indices = self.nv_handles(HT_NV_INDEX)?.len() as u32;
        let persistent = self.nv_handles(HT_PERSISTENT)?.len() as u32;
        let audit_counter = self.gp.audit_counter;

        Ok(alloc::vec![
            (TPM_PT_FAMILY_INDICATOR, TPM_SPEC_FAMILY),
            (TPM_PT_LEVEL, TPM_SPEC_LEVEL),
            (TPM_PT_REVISION, TPM_SPEC_VERSION),
            (TPM_PT_DAY_OF_YEAR, TPM_SPEC_DAY_OF_YEAR),
            (TPM_PT_YEAR, TPM_SPEC_YEAR),
            (TPM_PT_MANUFACTURER, config.manufacturer),
            (TPM_PT_VENDOR_STRING_1, config.vendor_strings[0]),
            (TPM_PT_VENDOR_STRING_2, config.vendor_strings[1]),
            (TPM_PT_VENDOR_STRING_3, config.vendor_strings[2]),
            (TPM_PT_VENDOR_STRING_4, config.vendor_strings[3]),
            (TPM_PT_VENDOR_TPM_TYPE, 1),
            (TPM_PT_FIRMWARE_VERSION_1, config.firmware_version.0),
            (TPM_PT_FIRMWARE_VERSION_2, config.firmware_version.1),
            (TPM_PT_INPUT_BUFFER, 1024),
            (TPM_PT_HR_TRANSIENT_MIN, config.max_loaded_objects as u32),
            (TPM_PT_HR_PERSISTENT_MIN, 2),
            (TPM_PT_HR_LOADED_MIN, config.max_loaded_sessions as u32),
            (TPM_PT_ACTIVE_SESSIONS_MAX, active_max),
            (TPM_PT_PCR_COUNT, config.pcr_count as u32),
            (TPM_PT_PCR_SELECT_MIN, PCR_SELECT_SIZE as u32),
            (TPM_PT_CONTEXT_GAP_MAX, u32::MAX),
            (TPM_PT_NV_INDEX_MAX, config.max_nv_index_size as u32),
            (TPM_PT_CLOCK_UPDATE, 1 << CLOCK_UPDATE_SHIFT),
            (TPM_PT_CONTEXT_HASH, u32::from(TPM_ALG_SHA256)),
            (TPM_PT_CONTEXT_SYM, u32::from(TPM_ALG_AES)),
            (TPM_PT_CONTEXT_SYM_SIZE, 256),
            (TPM_PT_MAX_COMMAND_SIZE, config.max_command_size as u32),
            (TPM_PT_MAX_RESPONSE_SIZE, config.max_response_size as u32),
            (TPM_PT_MAX_DIGEST, MAX_DIGEST_SIZE as u32),
            (TPM_PT_TOTAL_COMMANDS, commands),
            (TPM_PT_LIBRARY_COMMANDS, commands),
            (TPM_PT_NV_BUFFER_MAX, 1024),
            (TPM_PT_PERMANENT, self.permanent_flags()),
            (TPM_PT_STARTUP_CLEAR, self.startup_clear_flags()),
            (TPM_PT_HR_NV_INDEX, nv_indices),
            (TPM_PT_HR_LOADED, loaded),
            (TPM_PT_HR_LOADED_AVAIL, self.sessions.free_slots() as u32),
            (TPM_PT_HR_ACTIVE, loaded + saved),
            (TPM_PT_HR_ACTIVE_AVAIL, active_max.saturating_sub(loaded + saved)),
            (TPM_PT_HR_TRANSIENT_AVAIL, self.objects.free_slots() as u32),
            (TPM_PT_HR_PERSISTENT, persistent),
            (TPM_PT_LOCKOUT_COUNTER, self.gp.failed_tries),
            (TPM_PT_MAX_AUTH_FAIL, self.gp.max_tries),
            (TPM_PT_LOCKOUT_INTERVAL, self.gp.recovery_time),
            (TPM_PT_LOCKOUT_RECOVERY, self.gp.lockout_recovery),
            (TPM_PT_AUDIT_COUNTER_0, (audit_counter >> 32) as u32),
            (TPM_PT_AUDIT_COUNTER_1, audit_counter as u32),
        ])
    }
}

/// TPM2_GetCapability.
pub(crate) fn get_capability(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let capability = req.params.u32().param(1)?;
    let property = req.params.u32().param(2)?;
    let count = usize::try_from(req.params.u32().param(3)?).unwrap_or(usize::MAX);
    req.finish()?;

    let mut list = Vec::new();
    let more = match capability {
        TPM_CAP_ALGS => {
            let first = u16::try_from(property).map_err(|_| TpmReqError::value().param(2))?;
            let algs = ALGORITHMS
                .iter()
                .map(|&(alg, attrs)| (u32::from(alg), Tagged(alg, attrs)))
                .collect();
            select(algs, u32::from(first), count.min(MAX_CAP_ALGS), &mut list)
        }
        TPM_CAP_HANDLES => {
            let ty = handle_type(property);
            let handles = engine
                .handles_of_type(ty)
                .map_err(|e| e.param(2))?
                .into_iter()
                .map(|h| (h & 0x00FF_FFFF, h))
                .collect();
            select(handles, property & 0x00FF_FFFF, count.min(MAX_CAP_HANDLES), &mut list)
        }
        TPM_CAP_COMMANDS => {
            let commands = implemented(&engine.config)
                .map(|entry| (entry.code, entry.tpma_cc()))
                .collect();
            select(commands, property, count.min(MAX_CAP_CC), &mut list)
        }
        TPM_CAP_PP_COMMANDS | TPM_CAP_AUDIT_COMMANDS => {
            let bitmap = if capability == TPM_CAP_PP_COMMANDS {
                &engine.gp.pp_commands
            } else {
                &engine.gp.audit_commands
            };
            let codes = bitmap.codes().map(|code| (code, code)).collect();
            select(codes, property, count.min(MAX_CAP_CC), &mut list)
        }
        TPM_CAP_PCRS => {
            if property != 0 {
                return Err(TpmReqError::value().param(2));
            }
            engine.gp.pcr_allocated.to_selection().marshal(&mut list);
            false
        }
        TPM_CAP_TPM_PROPERTIES => {
            let props = engine
                .tpm_properties()?
                .into_iter()
                .map(|(pt, value)| (pt, Tagged(pt, value)))
                .collect();
            select(props, property, count.min(MAX_TPM_PROPERTIES), &mut list)
        }
        _ => return Err(TpmReqError::value().param(1)),
    };

    more.marshal(&mut rsp.params);
    capability.marshal(&mut rsp.params);
    rsp.params.extend_from_slice(&list);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_reports_more_data() {
        let items = (1u32..=5).map(|i| (i, i)).collect();
        let mut out = Vec::new();
        assert!(select(items, 2, 2, &mut out));
        assert_eq!(out, [0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, 3]);

        let items = (1u32..=5).map(|i| (i, i)).collect();
        out.clear();
        assert!(!select(items, 4, 8, &mut out));
        assert_eq!(&out[..4], &2u32.to_be_bytes());
    }

    #[test]
    fn algorithms_are_sorted() {
        for pair in ALGORITHMS.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        for pair in PERMANENT_HANDLES.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
