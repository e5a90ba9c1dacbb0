// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::marshal::Marshal;
use crate::nv::NvUpdate;
use crate::rc::{ParamExt, TpmReqError};

/// Largest value ClockSet accepts.
const CLOCK_MAX: u64 = 0xFFFF_0000_0000_0000;

/// TPM2_ReadClock: TPMS_TIME_INFO.
pub(crate) fn read_clock(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let time = engine.time();
    let out = &mut rsp.params;
    time.marshal(out);
    engine.go.clock.marshal(out);
    engine.gp.reset_count.marshal(out);
    engine.gr.restart_count.marshal(out);
    engine.go.clock_safe.marshal(out);
    Ok(())
}

/// TPM2_ClockSet. Clock can only be moved forward.
pub(crate) fn clock_set(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let new_time = req.params.u64().param(1)?;
    req.finish()?;
    if new_time > CLOCK_MAX || new_time < engine.go.clock {
        return Err(TpmReqError::value().param(1));
    }
    engine.go.clock = new_time;
    engine.nv_update.raise(NvUpdate::Orderly);
    Ok(())
}
