// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! PCR commands.
//!
//! Changing a PCR that an orderly TPM2_Shutdown(STATE) saved makes the
//! saved state stale, so the next Startup cannot resume.

use crate::command::{Request, Response};
use crate::config::PCR_SELECT_SIZE;
use crate::engine::Engine;
use crate::marshal::{Marshal, Unmarshal};
use crate::crypto::HashAlg;
use crate::pcr::{can_extend, can_reset, DigestValues, PcrSelectionList, SAVED_PCR_COUNT};
use crate::rc::{ParamExt, TpmRc, TpmReqError};
use crate::types::*;

impl Engine {
    pub(super) fn pcr_changed(&mut self, pcr: usize) {
        self.gr.pcr_counter = self.gr.pcr_counter.wrapping_add(1);
        if pcr < SAVED_PCR_COUNT {
            self.clear_orderly = true;
        }
    }
}

/// TPM2_PCR_Extend. Extending TPM_RH_NULL is a no-op.
pub(crate) fn extend(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let handle = req.handles[0];
    let digests = DigestValues::unmarshal(&mut req.params).param(1)?;
    req.finish()?;
    if handle == TPM_RH_NULL {
        return Ok(());
    }

    let pcr = handle as usize;
    if !can_extend(pcr, engine.platform.locality()) {
        return Err(TpmReqError::rc(TpmRc::LOCALITY));
    }
    for value in digests.0.iter() {
        // Digests for unallocated banks are ignored
        engine.pcrs.extend(pcr, value.alg, &value.digest);
    }
    engine.pcr_changed(pcr);
    Ok(())
}

/// TPM2_PCR_Reset.
pub(crate) fn reset(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let pcr = req.handles[0] as usize;
    req.finish()?;
    if !can_reset(pcr, engine.platform.locality()) {
        return Err(TpmReqError::rc(TpmRc::LOCALITY));
    }
    engine.pcrs.reset(pcr);
    engine.pcr_changed(pcr);
    Ok(())
}

/// TPM2_PCR_Read.
pub(crate) fn read(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let selection = PcrSelectionList::unmarshal(&mut req.params).param(1)?;
    req.finish()?;

    let (selected, digests) = engine.pcrs.read(&selection);
    engine.gr.pcr_counter.marshal(&mut rsp.params);
    selected.marshal(&mut rsp.params);
    digests.marshal(&mut rsp.params);
    Ok(())
}

/// TPM2_PCR_Allocate. The new allocation is recorded in the persistent
/// data and takes effect at the next power on.
pub(crate) fn allocate(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let request = PcrSelectionList::unmarshal(&mut req.params).param(1)?;
    req.finish()?;

    let pcr_count = engine.config.pcr_count;
    let mut allocation = engine.gp.pcr_allocated.clone();
    for selection in request.0.iter() {
        let beyond = (pcr_count..PCR_SELECT_SIZE * 8)
            .any(|pcr| selection.select[pcr / 8] & (1 << (pcr % 8)) != 0);
        if beyond {
            return Err(TpmReqError::value().param(1));
        }
        allocation.set(selection.hash, selection.select);
    }

    let bank_size = |alg: HashAlg| pcr_count * alg.digest_size();
    let size_needed: usize = allocation.banks().map(bank_size).sum();
    let size_available: usize = HashAlg::ALL.into_iter().map(bank_size).sum();
    let success = allocation.banks().next().is_some();
    if success {
        engine.gp.pcr_allocated = allocation;
        engine.write_persistent()?;
    }

    let out = &mut rsp.params;
    success.marshal(out);
    (pcr_count as u32).marshal(out);
    (size_needed as u32).marshal(out);
    (size_available as u32).marshal(out);
    Ok(())
}
