// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Session start and the policy commands.

use crate::command::{lookup, Request, Response};
use crate::crypto::{kdfa, HashAlg};
use crate::engine::Engine;
use crate::marshal::{Marshal, Tpm2bDigest, Tpm2bNonce, Unmarshal};
use crate::rc::{ParamExt, TpmRc, TpmReqError};
use crate::session::{bind_digest, zero_digest, Session, SessionFlags, SessionType, SymDef};
use crate::types::*;
use alloc::vec;

/// Shortest nonceCaller accepted by TPM2_StartAuthSession.
const MIN_NONCE_SIZE: usize = 16;

/// TPM2_StartAuthSession.
///
/// Salted sessions are not supported: tpmKey must be TPM_RH_NULL and the
/// encrypted salt empty.
pub(crate) fn start_auth_session(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let tpm_key = req.handles[0];
    let bind = req.handles[1];
    let nonce_caller = Tpm2bNonce::unmarshal(&mut req.params).param(1)?;
    let salt = Tpm2bDigest::unmarshal(&mut req.params).param(2)?;
    let session_type = req.params.u8().param(3)?;
    let symmetric = SymDef::unmarshal(&mut req.params).param(4)?;
    let auth_hash = HashAlg::unmarshal(&mut req.params).param(5)?;
    req.finish()?;

    if tpm_key != TPM_RH_NULL {
        return Err(TpmReqError::rc(TpmRc::KEY).at_handle(1));
    }
    if !salt.is_empty() {
        return Err(TpmReqError::value().param(2));
    }
    let (kind, flags) = match session_type {
        TPM_SE_HMAC => (SessionType::Hmac, SessionFlags::empty()),
        TPM_SE_POLICY => (SessionType::Policy, SessionFlags::empty()),
        TPM_SE_TRIAL => (SessionType::Policy, SessionFlags::TRIAL),
        _ => return Err(TpmReqError::value().param(3)),
    };
    if nonce_caller.len() < MIN_NONCE_SIZE || nonce_caller.len() > auth_hash.digest_size() {
        return Err(TpmReqError::size().param(1));
    }

    let digest_size = auth_hash.digest_size();
    let mut nonce_tpm = vec![0u8; digest_size];
    engine.random(&mut nonce_tpm)?;
    let nonce_tpm = Tpm2bNonce::from_vec(nonce_tpm)?;

    let (session_key, bound_entity, flags) = if bind == TPM_RH_NULL {
        (Tpm2bDigest::empty(), Tpm2bDigest::empty(), flags)
    } else {
        let auth = engine.entity_auth(bind).map_err(|e| e.at_handle(2))?.auth;
        let name = engine.entity_name(bind).map_err(|e| e.at_handle(2))?;
        let key = kdfa(
            auth_hash,
            &auth,
            b"ATH",
            &nonce_tpm,
            &nonce_caller,
            digest_size,
        );
        (
            Tpm2bDigest::from_vec(key)?,
            bind_digest(&name, &auth),
            flags | SessionFlags::BOUND,
        )
    };

    let response_nonce = nonce_tpm.clone();
    let handle = engine.start_session(kind, |handle| Session {
        handle,
        session_type: kind,
        flags,
        auth_hash,
        nonce_tpm,
        session_key,
        symmetric,
        bound_entity,
        policy_digest: zero_digest(auth_hash),
        command_code: None,
        audit_digest: Tpm2bDigest::empty(),
    })?;
    log::debug!("started session {:#x}", handle);

    rsp.handle = Some(handle);
    response_nonce.marshal(&mut rsp.params);
    Ok(())
}

fn policy_session<'a>(engine: &'a mut Engine, req: &Request<'_>) -> Result<&'a mut Session, TpmReqError> {
    engine
        .session_mut(req.handles[0])
        .ok_or_else(|| TpmReqError::handle().at_handle(1))
}

/// TPM2_PolicyRestart.
pub(crate) fn policy_restart(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    policy_session(engine, req)?.reset_policy();
    Ok(())
}

/// TPM2_PolicyGetDigest.
pub(crate) fn policy_get_digest(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let session = policy_session(engine, req)?;
    session.policy_digest.marshal(&mut rsp.params);
    Ok(())
}

/// TPM2_PolicyAuthValue: the authorization HMAC must include the
/// entity's authValue.
pub(crate) fn policy_auth_value(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let session = policy_session(engine, req)?;
    session.policy_extend(&[&cc::POLICY_AUTH_VALUE.to_be_bytes()[..]]);
    session.flags.remove(SessionFlags::INCLUDE_PASSWORD);
    session.flags.insert(SessionFlags::INCLUDE_AUTH);
    Ok(())
}

/// TPM2_PolicyPassword: the authValue is sent in the clear. The digest
/// is the same as for TPM2_PolicyAuthValue.
pub(crate) fn policy_password(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let session = policy_session(engine, req)?;
    session.policy_extend(&[&cc::POLICY_AUTH_VALUE.to_be_bytes()[..]]);
    session.flags.remove(SessionFlags::INCLUDE_AUTH);
    session.flags.insert(SessionFlags::INCLUDE_PASSWORD);
    Ok(())
}

/// TPM2_PolicyCommandCode.
pub(crate) fn policy_command_code(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let code = req.params.u32().param(1)?;
    req.finish()?;
    if lookup(code, &engine.config).is_none() {
        return Err(TpmReqError::rc(TpmRc::POLICY_CC).param(1));
    }
    let session = policy_session(engine, req)?;
    if session.command_code.is_some_and(|current| current != code) {
        return Err(TpmReqError::value().param(1));
    }
    session.policy_extend(&[&cc::POLICY_COMMAND_CODE.to_be_bytes()[..], &code.to_be_bytes()[..]]);
    session.command_code = Some(code);
    Ok(())
}
