// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::marshal::{marshal_bytes, Marshal, Unmarshal};
use crate::rc::{ParamExt, TpmRc, TpmReqError};

/// TPM2_SelfTest. Every algorithm is tested at startup, so there is
/// nothing left to do.
pub(crate) fn self_test(
    _engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let _full_test = bool::unmarshal(&mut req.params).param(1)?;
    req.finish()
}

/// TPM2_GetTestResult outside of failure mode.
pub(crate) fn get_test_result(
    _engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    marshal_bytes(&[], &mut rsp.params);
    TpmRc::SUCCESS.0.marshal(&mut rsp.params);
    Ok(())
}
