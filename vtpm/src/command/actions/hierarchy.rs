// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Hierarchy management: enables, authorization values and policies,
//! TPM2_Clear.

use crate::command::{Request, Response};
use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::marshal::{Tpm2bAuth, Tpm2bDigest, Unmarshal};
use crate::rc::{ParamExt, TpmRc, TpmReqError};
use crate::session::auth::trim_auth;
use crate::state::{HierarchyAuth, SEED_SIZE};
use crate::types::*;

/// Longest authorization value a hierarchy takes: the digest size of the
/// context integrity hash.
const MAX_HIERARCHY_AUTH: usize = 32;

/// TPM2_HierarchyControl.
///
/// The platform may enable or disable anything. Owner and endorsement may
/// only disable their own hierarchy.
pub(crate) fn hierarchy_control(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let auth_handle = req.handles[0];
    let enable = req.params.u32().param(1)?;
    let state = bool::unmarshal(&mut req.params).param(2)?;
    req.finish()?;

    if !matches!(
        enable,
        TPM_RH_OWNER | TPM_RH_ENDORSEMENT | TPM_RH_PLATFORM | TPM_RH_PLATFORM_NV
    ) {
        return Err(TpmReqError::value().param(1));
    }
    if auth_handle != TPM_RH_PLATFORM && (state || enable != auth_handle) {
        return Err(TpmReqError::rc(TpmRc::AUTH_TYPE).at_handle(1));
    }

    match enable {
        TPM_RH_PLATFORM => engine.ph_enable = state,
        TPM_RH_OWNER => engine.gc.sh_enable = state,
        TPM_RH_ENDORSEMENT => engine.gc.eh_enable = state,
        _ => engine.gc.ph_enable_nv = state,
    }
    if !state && enable != TPM_RH_PLATFORM_NV {
        engine.objects.flush_hierarchy(enable);
    }
    if enable != TPM_RH_PLATFORM {
        engine.clear_orderly = true;
    }
    log::debug!("hierarchy {:#x} enabled: {}", enable, state);
    Ok(())
}

/// The stored authorization of a hierarchy handle.
fn hierarchy_auth(engine: &mut Engine, handle: u32) -> &mut HierarchyAuth {
    match handle {
        TPM_RH_OWNER => &mut engine.gp.owner,
        TPM_RH_ENDORSEMENT => &mut engine.gp.endorsement,
        TPM_RH_LOCKOUT => &mut engine.gp.lockout,
        _ => &mut engine.gc.platform,
    }
}

/// Persists a change made through [`hierarchy_auth`].
fn hierarchy_changed(engine: &mut Engine, handle: u32) -> Result<(), TpmReqError> {
    if handle == TPM_RH_PLATFORM {
        engine.clear_orderly = true;
        Ok(())
    } else {
        engine.write_persistent()
    }
}

/// TPM2_HierarchyChangeAuth.
pub(crate) fn change_auth(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let handle = req.handles[0];
    let new_auth = Tpm2bAuth::unmarshal(&mut req.params).param(1)?;
    req.finish()?;

    let trimmed = trim_auth(&new_auth);
    if trimmed.len() > MAX_HIERARCHY_AUTH {
        return Err(TpmReqError::size().param(1));
    }
    hierarchy_auth(engine, handle).auth = Tpm2bAuth::new(trimmed)?;
    hierarchy_changed(engine, handle)
}

/// TPM2_SetPrimaryPolicy. A NULL algorithm takes an empty policy and
/// removes policy authorization.
pub(crate) fn set_primary_policy(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let handle = req.handles[0];
    let policy = Tpm2bDigest::unmarshal(&mut req.params).param(1)?;
    let alg = HashAlg::unmarshal_or_null(&mut req.params).param(2)?;
    req.finish()?;

    let expected = alg.map_or(0, HashAlg::digest_size);
    if policy.len() != expected {
        return Err(TpmReqError::size().param(1));
    }
    let auth = hierarchy_auth(engine, handle);
    auth.policy_alg = alg;
    auth.policy = policy;
    hierarchy_changed(engine, handle)
}

/// TPM2_Clear. Removes the owner: new storage seed and proofs, empty
/// authorization values and every owner object and NV index is gone.
pub(crate) fn clear(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    if engine.gp.disable_clear {
        return Err(TpmReqError::rc(TpmRc::DISABLED));
    }

    let mut seeds = [[0u8; SEED_SIZE]; 3];
    for seed in seeds.iter_mut() {
        engine.random(seed)?;
    }
    let [sps_seed, sh_proof, eh_proof] = seeds;
    engine.gp.sps_seed = sps_seed;
    engine.gp.sh_proof = sh_proof;
    engine.gp.eh_proof = eh_proof;
    engine.gp.owner = HierarchyAuth::default();
    engine.gp.endorsement = HierarchyAuth::default();
    engine.gp.lockout = HierarchyAuth::default();
    engine.gp.failed_tries = 0;

    if !engine.gc.sh_enable || !engine.gc.eh_enable {
        engine.gc.sh_enable = true;
        engine.gc.eh_enable = true;
        engine.clear_orderly = true;
    }
    engine.objects.flush_hierarchy(TPM_RH_OWNER);
    engine.objects.flush_hierarchy(TPM_RH_ENDORSEMENT);
    engine.nv_clear_owner()?;
    engine.write_persistent()?;
    log::info!("TPM cleared");
    Ok(())
}

/// TPM2_ClearControl. Only the platform can enable TPM2_Clear again.
pub(crate) fn clear_control(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let disable = bool::unmarshal(&mut req.params).param(1)?;
    req.finish()?;
    if req.handles[0] == TPM_RH_LOCKOUT && !disable {
        return Err(TpmReqError::auth_fail());
    }
    engine.gp.disable_clear = disable;
    engine.write_persistent()
}
