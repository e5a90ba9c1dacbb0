// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Command audit and physical presence lists.

use crate::command::{lookup, CommandAttrs, Request, Response};
use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::marshal::{unmarshal_list, Cursor, MarshalError, Tpm2bDigest};
use crate::rc::{ParamExt, TpmReqError};
use crate::types::*;
use alloc::vec::Vec;

/// Most command codes in a TPML_CC.
pub(crate) const MAX_CAP_CC: usize = 256;

fn unmarshal_cc_list(cur: &mut Cursor<'_>) -> Result<Vec<u32>, MarshalError> {
    unmarshal_list::<u32>(cur, MAX_CAP_CC)
}

/// TPM2_SetCommandCodeAuditStatus.
///
/// Changing the audit algorithm clears the audit digest and cannot be
/// combined with list changes. TPM2_SetCommandCodeAuditStatus itself is
/// always audited.
pub(crate) fn set_audit_status(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let alg = HashAlg::unmarshal_or_null(&mut req.params).param(1)?;
    let set_list = unmarshal_cc_list(&mut req.params).param(2)?;
    let clear_list = unmarshal_cc_list(&mut req.params).param(3)?;
    req.finish()?;

    if let Some(alg) = alg.filter(|alg| engine.gp.audit_hash_alg != Some(*alg)) {
        if !set_list.is_empty() || !clear_list.is_empty() {
            return Err(TpmReqError::value().param(1));
        }
        engine.gp.audit_hash_alg = Some(alg);
        if engine.gr.command_audit_digest.is_some() {
            engine.gr.command_audit_digest = Some(Tpm2bDigest::empty());
        }
        log::info!("command audit digest now uses {:?}", alg);
        return engine.write_persistent();
    }

    let audit = &mut engine.gp.audit_commands;
    let mut changed = false;
    for code in set_list {
        if lookup(code, &engine.config).is_some() {
            changed |= audit.assign(code, true);
        }
    }
    for code in clear_list {
        if code != cc::SET_COMMAND_CODE_AUDIT_STATUS {
            changed |= audit.assign(code, false);
        }
    }
    if changed {
        engine.write_persistent()?;
    }
    Ok(())
}

/// TPM2_PP_Commands. Codes of commands that cannot be gated by physical
/// presence are ignored.
pub(crate) fn pp_commands(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let set_list = unmarshal_cc_list(&mut req.params).param(1)?;
    let clear_list = unmarshal_cc_list(&mut req.params).param(2)?;
    req.finish()?;

    let gated = |code: u32| {
        lookup(code, &engine.config).is_some_and(|entry| entry.attrs.contains(CommandAttrs::PP))
    };
    let mut pp = engine.gp.pp_commands;
    for code in set_list {
        if gated(code) {
            pp.assign(code, true);
        }
    }
    for code in clear_list {
        if gated(code) && code != cc::PP_COMMANDS {
            pp.assign(code, false);
        }
    }
    if pp != engine.gp.pp_commands {
        engine.gp.pp_commands = pp;
        engine.write_persistent()?;
    }
    Ok(())
}
