// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Dictionary attack commands. Both need lockout authorization, which is
//! itself disabled for `lockout_recovery` seconds after a failed attempt.

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::nv::NvUpdate;
use crate::rc::{ParamExt, TpmReqError};

/// TPM2_DictionaryAttackLockReset.
pub(crate) fn lock_reset(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    engine.gp.failed_tries = 0;
    engine.write_persistent()?;
    log::info!("dictionary attack lockout reset");
    Ok(())
}

/// TPM2_DictionaryAttackParameters.
pub(crate) fn parameters(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let max_tries = req.params.u32().param(1)?;
    let recovery_time = req.params.u32().param(2)?;
    let lockout_recovery = req.params.u32().param(3)?;
    req.finish()?;

    engine.gp.max_tries = max_tries;
    engine.gp.recovery_time = recovery_time;
    engine.gp.lockout_recovery = lockout_recovery;
    engine.gp.failed_tries = engine.gp.failed_tries.min(max_tries);
    engine.go.self_heal_timer = engine.go.clock;
    engine.nv_update.raise(NvUpdate::Orderly);
    engine.write_persistent()
}
