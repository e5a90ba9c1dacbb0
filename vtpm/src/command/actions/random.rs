// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::failure::{FatalCode, Fault};
use crate::marshal::{marshal_bytes, Tpm2bSensitiveData, Unmarshal, MAX_DIGEST_SIZE};
use crate::nv::NvUpdate;
use crate::rc::{ParamExt, TpmReqError};
use alloc::vec;

/// TPM2_GetRandom. Requests are capped at the largest digest size.
pub(crate) fn get_random(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let requested = req.params.u16().param(1)?;
    req.finish()?;

    let mut bytes = vec![0u8; usize::from(requested).min(MAX_DIGEST_SIZE)];
    engine.random(&mut bytes)?;
    marshal_bytes(&bytes, &mut rsp.params);
    Ok(())
}

/// TPM2_StirRandom: reseeds the DRBG with fresh entropy and the caller's
/// data as additional input.
pub(crate) fn stir_random(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let data = Tpm2bSensitiveData::unmarshal(&mut req.params).param(1)?;
    req.finish()?;

    let mut entropy = [0u8; 32];
    engine
        .platform
        .get_entropy(&mut entropy)
        .map_err(|_| Fault::new(FatalCode::Entropy))?;
    engine.go.drbg.reseed(&entropy, &data);
    engine.nv_update.raise(NvUpdate::Orderly);
    Ok(())
}
