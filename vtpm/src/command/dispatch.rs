// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! The command entry point.
//!
//! A command runs through header parsing, handle resolution, session
//! processing, the action and response session processing. Any step can
//! end the command early with a response code. The post-command NV
//! bookkeeping and the response header are never skipped.

use super::{command_code_error, lookup, Command, CommandAttrs, HandleSet, Request, Response};
use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::failure::{FatalCode, Fault};
use crate::marshal::{Cursor, Marshal, Tpm2bDigest};
use crate::nv::packed_nums::*;
use crate::object::{Object, ObjectSlot};
use crate::rc::{TpmRc, TpmReqError};
use crate::session::auth::{parse_sessions, rp_hash, MIN_AUTH_SIZE};
use crate::session::zero_digest;
use crate::types::*;
use alloc::vec::Vec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
struct CommandHeader {
    tag: u16_be,
    size: u32_be,
    code: u32_be,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
struct ResponseHeader {
    tag: u16_be,
    size: u32_be,
    rc: u32_be,
}

/// A successful command on its way into the response buffer.
#[derive(Debug)]
struct Reply {
    tag: u16,
    handle: Option<u32>,
    params: Vec<u8>,
    sessions: Vec<u8>,
}

impl Reply {
    /// Writes the response into `out`. Returns `None` if it is longer than
    /// `limit`.
    fn write(&self, out: &mut [u8], limit: usize) -> Option<usize> {
        let mut body = Vec::new();
        if let Some(handle) = self.handle {
            handle.marshal(&mut body);
        }
        if self.tag == TPM_ST_SESSIONS {
            u32::try_from(self.params.len()).ok()?.marshal(&mut body);
        }
        body.extend_from_slice(&self.params);
        body.extend_from_slice(&self.sessions);

        let len = TPM_HEADER_SIZE + body.len();
        if len > limit.min(out.len()) {
            return None;
        }
        write_header(out, self.tag, len, TpmRc::SUCCESS);
        out[TPM_HEADER_SIZE..len].copy_from_slice(&body);
        Some(len)
    }
}

fn write_header(out: &mut [u8], tag: u16, len: usize, rc: TpmRc) {
    let header = ResponseHeader {
        tag: tag.into(),
        size: (len as u32).into(),
        rc: rc.0.into(),
    };
    out[..TPM_HEADER_SIZE].copy_from_slice(header.as_bytes());
}

/// Header-only response carrying `rc`.
fn write_error(out: &mut [u8], rc: TpmRc) -> usize {
    write_header(out, TPM_ST_NO_SESSIONS, TPM_HEADER_SIZE, rc);
    TPM_HEADER_SIZE
}

impl Engine {
    /// Executes a command and writes the response into `response`.
    ///
    /// Returns the response length. Bytes of `response` past the response
    /// are zeroed. A buffer too small for a response header receives
    /// nothing.
    pub fn execute_into(&mut self, request: &[u8], response: &mut [u8]) -> usize {
        if response.len() < TPM_HEADER_SIZE {
            return 0;
        }
        if self.failure.is_failed() {
            return self.failure.respond(&self.config, request, response);
        }

        let outcome = self.dispatch(request);
        let outcome = match self.finish_command() {
            Ok(()) => outcome,
            Err(fault) => Err(TpmReqError::Fatal(fault)),
        };

        let limit = self.config.max_response_size;
        let len = match outcome {
            Ok(reply) => reply
                .write(response, limit)
                .unwrap_or_else(|| write_error(response, TpmRc::SIZE)),
            Err(TpmReqError::Response(rc)) => write_error(response, rc),
            Err(TpmReqError::Fatal(fault)) => {
                self.enter_failure_mode(&fault);
                write_error(response, TpmRc::FAILURE)
            }
        };
        response[len..].fill(0);

        if log::log_enabled!(log::Level::Debug) {
            let code = request
                .get(6..TPM_HEADER_SIZE)
                .map_or(0, |c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
            let rc = u32::from_be_bytes([response[6], response[7], response[8], response[9]]);
            log::debug!("command {:#x}: rc {:#x}, {} bytes", code, rc, len);
        }
        len
    }

    fn dispatch(&mut self, request: &[u8]) -> Result<Reply, TpmReqError> {
        let (header, body) = CommandHeader::read_from_prefix(request)
            .map_err(|_| TpmReqError::rc(TpmRc::COMMAND_SIZE))?;
        let size = usize::try_from(header.size.get()).unwrap_or(usize::MAX);
        if size != request.len() || size > self.config.max_command_size {
            return Err(TpmReqError::rc(TpmRc::COMMAND_SIZE));
        }
        let tag = header.tag.get();
        if tag != TPM_ST_NO_SESSIONS && tag != TPM_ST_SESSIONS {
            return Err(TpmReqError::rc(TpmRc::BAD_TAG));
        }
        let code = header.code.get();
        let entry = lookup(code, &self.config).ok_or_else(command_code_error)?;
        if !self.initialized || self.started == (code == cc::STARTUP) {
            return Err(TpmReqError::rc(TpmRc::INITIALIZE));
        }

        self.update_time();
        self.da_self_heal()?;

        let mut cur = Cursor::new(body);
        let mut cmd = Command::new(entry);
        for (i, class) in entry.handles.iter().enumerate() {
            let n = i + 1;
            let handle = cur
                .u32()
                .map_err(|_| TpmReqError::rc(TpmRc::INSUFFICIENT))?;
            let name = self.resolve_handle(handle, *class, n)?;
            cmd.handles
                .try_push(handle)
                .map_err(|_| Fault::internal())?;
            cmd.names.try_push(name).map_err(|_| Fault::internal())?;
        }

        if tag == TPM_ST_SESSIONS {
            if entry.attrs.contains(CommandAttrs::NO_SESSIONS) {
                return Err(TpmReqError::rc(TpmRc::AUTH_CONTEXT));
            }
            let auth_size = cur
                .u32()
                .map_err(|_| TpmReqError::rc(TpmRc::AUTHSIZE))?;
            let auth_size = usize::try_from(auth_size).unwrap_or(usize::MAX);
            if auth_size < MIN_AUTH_SIZE || auth_size > cur.remaining() {
                return Err(TpmReqError::size());
            }
            let area = cur.take(auth_size)?;
            cmd.sessions = parse_sessions(area)?;
            cmd.set_params(cur.rest());
            self.check_sessions(&mut cmd)?;
        } else {
            if entry.auth_handles > 0 {
                return Err(TpmReqError::rc(TpmRc::AUTH_MISSING));
            }
            cmd.set_params(cur.rest());
        }

        let mut params = cur.rest().to_vec();
        self.decrypt_parameters(&cmd, &mut params)?;
        if entry.attrs.contains(CommandAttrs::NV) {
            self.nv_available()?;
        }
        if self.platform.is_canceled() {
            return Err(TpmReqError::rc(TpmRc::CANCELED));
        }

        let mut request = Request {
            handles: &cmd.handles,
            params: Cursor::new(&params),
        };
        let mut response = Response::default();
        entry.run(self, &mut request, &mut response)?;
        if response.handle.is_some() != entry.attrs.contains(CommandAttrs::RESPONSE_HANDLE) {
            return Err(Fault::internal().into());
        }

        let mut sessions = Vec::new();
        if tag == TPM_ST_SESSIONS {
            self.roll_nonces(&cmd)?;
            self.encrypt_response(&cmd, &mut response.params)?;
            sessions = self.response_sessions(&mut cmd, &response.params)?;
        }

        if self.config.command_audit && self.gp.audit_commands.is_set(code) {
            if let Some(alg) = self.gp.audit_hash_alg {
                self.command_audit(&mut cmd, alg, &response.params)?;
            }
        }

        self.exclusive_audit = cmd
            .audit_session
            .map(|i| cmd.sessions[i].handle)
            .filter(|handle| self.session(*handle).is_some());

        Ok(Reply {
            tag,
            handle: response.handle,
            params: response.params,
            sessions,
        })
    }

    /// Checks that `handle` is of a type slot `n` accepts and refers to
    /// something that exists. Returns the name of the handle.
    fn resolve_handle(
        &mut self,
        handle: u32,
        class: HandleSet,
        n: usize,
    ) -> Result<Vec<u8>, TpmReqError> {
        if !class.intersects(HandleSet::classify(handle)) {
            return Err(TpmReqError::value().at_handle(n));
        }
        match handle_type(handle) {
            HT_TRANSIENT => self
                .objects
                .get(handle)
                .map(|slot| slot.name(handle))
                .ok_or(TpmReqError::rc(TpmRc::reference_handle(n))),
            HT_PERSISTENT => self.load_evict_shadow(handle, n),
            HT_NV_INDEX => {
                let index = self.nv_index(handle).map_err(|e| e.at_handle(n))?;
                Ok(index.public.name())
            }
            HT_PCR => {
                if handle as usize >= self.config.pcr_count {
                    return Err(TpmReqError::value().at_handle(n));
                }
                Ok(handle.to_be_bytes().to_vec())
            }
            HT_HMAC_SESSION | HT_POLICY_SESSION => {
                if self.session_slot(handle).is_err() {
                    return Err(TpmReqError::rc(TpmRc::reference_handle(n)));
                }
                Ok(handle.to_be_bytes().to_vec())
            }
            _ => {
                if handle != TPM_RH_LOCKOUT && !self.hierarchy_enabled(handle) {
                    return Err(TpmReqError::hierarchy().at_handle(n));
                }
                Ok(handle.to_be_bytes().to_vec())
            }
        }
    }

    /// Loads the RAM shadow of an evicted object for the duration of the
    /// command.
    fn load_evict_shadow(&mut self, handle: u32, n: usize) -> Result<Vec<u8>, TpmReqError> {
        if let Some(slot) = self.objects.get(handle) {
            return Ok(slot.name(handle));
        }
        let entry = self
            .layout
            .find_entry(&*self.platform, handle)?
            .ok_or_else(|| TpmReqError::handle().at_handle(n))?;
        let object = Object::nv_decode(&entry.body, handle)
            .map_err(|_| Fault::new(FatalCode::NvUnrecoverable))?;
        if !self.hierarchy_enabled(object.hierarchy) {
            return Err(TpmReqError::hierarchy().at_handle(n));
        }
        let name = object.name.to_vec();
        self.objects.insert(ObjectSlot::Regular(object))?;
        Ok(name)
    }

    /// Extends the command audit digest. The first audited command after
    /// the digest was cleared starts a new audit sequence.
    fn command_audit(
        &mut self,
        cmd: &mut Command<'_>,
        alg: HashAlg,
        params: &[u8],
    ) -> Result<(), TpmReqError> {
        let Some(old) = self.gr.command_audit_digest.clone() else {
            return Ok(());
        };
        let cp_hash = cmd.cp_hash(alg);
        let rp_hash = rp_hash(alg, cmd.entry.code, params);
        let old = if old.is_empty() {
            self.gp.audit_counter = self
                .gp
                .audit_counter
                .checked_add(1)
                .ok_or_else(|| Fault::new(FatalCode::CounterOverflow))?;
            self.write_persistent()?;
            zero_digest(alg)
        } else {
            old
        };
        let digest = alg.digest(&[old.as_slice(), cp_hash.as_slice(), rp_hash.as_slice()]);
        self.gr.command_audit_digest =
            Some(Tpm2bDigest::from_vec(digest).map_err(|_| Fault::internal())?);
        Ok(())
    }
}
