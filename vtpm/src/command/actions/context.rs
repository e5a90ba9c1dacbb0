// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::marshal::{Marshal, Unmarshal};
use crate::rc::{ParamExt, TpmReqError};
use crate::session::context::TpmsContext;

pub(crate) fn context_save(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let context = engine.save_context(req.handles[0])?;
    context.marshal(&mut rsp.params);
    Ok(())
}

pub(crate) fn context_load(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let context = TpmsContext::unmarshal(&mut req.params).param(1)?;
    req.finish()?;
    rsp.handle = Some(engine.load_context(&context)?);
    Ok(())
}

/// TPM2_FlushContext. The handle is a parameter, not part of the handle
/// area.
pub(crate) fn flush_context(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let handle = req.params.u32().param(1)?;
    req.finish()?;
    engine.flush_context(handle)
}
