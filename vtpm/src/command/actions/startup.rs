// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! TPM2_Startup and TPM2_Shutdown.
//!
//! The startup type is chosen from the requested type and the type of the
//! last orderly shutdown:
//!
//! | request | last shutdown | result  |
//! |---------|---------------|---------|
//! | STATE   | STATE         | Resume  |
//! | STATE   | other         | error   |
//! | CLEAR   | STATE         | Restart |
//! | CLEAR   | other         | Reset   |

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::failure::{FatalCode, Fault};
use crate::nv::NvUpdate;
use crate::rc::{ParamExt, TpmReqError};
use crate::state::{SessionContext, StateClearData, StateResetData, SHUTDOWN_NONE};
use crate::types::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartupKind {
    Reset,
    Restart,
    Resume,
}

fn startup_type(req: &mut Request<'_>) -> Result<u16, TpmReqError> {
    let su = req.params.u16().param(1)?;
    req.finish()?;
    if su != TPM_SU_CLEAR && su != TPM_SU_STATE {
        return Err(TpmReqError::value().param(1));
    }
    Ok(su)
}

pub(crate) fn startup(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let su = startup_type(req)?;
    engine.startup(su)
}

pub(crate) fn shutdown(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let su = startup_type(req)?;
    engine.shutdown(su)
}

impl Engine {
    fn startup(&mut self, su: u16) -> Result<(), TpmReqError> {
        let last = self.gp.orderly_state;
        let kind = match (su, last) {
            (TPM_SU_STATE, TPM_SU_STATE) => StartupKind::Resume,
            (TPM_SU_STATE, _) => return Err(TpmReqError::value().param(1)),
            (_, TPM_SU_STATE) => StartupKind::Restart,
            _ => StartupKind::Reset,
        };
        let orderly = last != SHUTDOWN_NONE;

        match kind {
            StartupKind::Reset => self.tpm_reset(orderly)?,
            StartupKind::Restart | StartupKind::Resume => {
                self.gr.restart_count = self.gr.restart_count.wrapping_add(1);
                if kind == StartupKind::Restart {
                    self.gr.clear_count = self
                        .gr
                        .clear_count
                        .checked_add(1)
                        .ok_or_else(|| Fault::new(FatalCode::CounterOverflow))?;
                }
                // Sessions that were loaded at shutdown are gone
                for entry in self.gr.context_array.iter_mut() {
                    if matches!(entry, SessionContext::Loaded(_)) {
                        *entry = SessionContext::Free;
                    }
                }
            }
        }

        self.pcrs.reset_all();
        if kind == StartupKind::Resume {
            self.pcrs.restore(&self.gc.pcr_save);
        } else {
            self.gc = StateClearData::default();
            self.nv_startup_clear()?;
        }

        self.ph_enable = true;
        self.exclusive_audit = None;
        self.gp.orderly_state = SHUTDOWN_NONE;
        self.write_persistent()?;
        self.write_state_reset()?;
        self.write_state_clear()?;
        self.started = true;
        log::info!(
            "TPM startup: {:?}, reset count {}, restart count {}",
            kind,
            self.gp.reset_count,
            self.gr.restart_count
        );
        Ok(())
    }

    /// TPM Reset: new reset epoch, new null hierarchy.
    fn tpm_reset(&mut self, orderly: bool) -> Result<(), TpmReqError> {
        self.gp.reset_count = self
            .gp
            .reset_count
            .checked_add(1)
            .ok_or_else(|| Fault::new(FatalCode::CounterOverflow))?;
        self.gp.total_reset_count = self.gp.total_reset_count.wrapping_add(1);

        let mut gr = StateResetData::new(&self.config);
        self.random(&mut gr.null_proof)?;
        self.random(&mut gr.null_seed)?;
        self.gr = gr;

        if !orderly {
            self.go.clock_safe = false;
            // An unorderly shutdown may have hidden an authorization failure
            if self.gp.recovery_time != 0 && !self.gp.in_lockout() {
                self.gp.failed_tries += 1;
            }
        }
        if self.gp.lockout_recovery == 0 {
            self.gp.lockout_auth_enabled = true;
        }
        self.go.self_heal_timer = self.go.clock;
        self.go.lockout_timer = self.go.clock;
        Ok(())
    }

    fn shutdown(&mut self, su: u16) -> Result<(), TpmReqError> {
        if su == TPM_SU_STATE {
            self.pcrs.save(&mut self.gc.pcr_save);
            self.write_state_clear()?;
        }
        self.write_state_reset()?;
        self.gp.orderly_state = su;
        self.write_persistent()?;
        self.nv_update.raise(NvUpdate::Orderly);
        log::info!(
            "TPM orderly shutdown: {}",
            if su == TPM_SU_STATE { "STATE" } else { "CLEAR" }
        );
        Ok(())
    }
}
