// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Authorization area processing.
//!
//! A command carries up to three sessions. The first sessions authorize
//! the handles in the authorization area of the command, in order; any
//! further session may only be used for parameter encryption or audit.

use super::{bind_digest, zero_digest, Session, SessionFlags, SessionLookup, SymDef};
use crate::command::{Command, CommandAttrs};
use crate::crypto::{ct_eq, HashAlg};
use crate::engine::Engine;
use crate::failure::Fault;
use crate::marshal::{marshal_bytes, Cursor, Marshal, MarshalError, Tpm2bAuth, Tpm2bNonce, Unmarshal};
use crate::nv::NvUpdate;
use crate::platform::NvReadyState;
use crate::rc::{TpmRc, TpmReqError};
use crate::types::*;
use alloc::vec;
use alloc::vec::Vec;
use arrayvec::ArrayVec;

/// Most sessions a command can carry.
pub const MAX_SESSIONS: usize = 3;

/// Smallest valid authorization area: one password session.
pub const MIN_AUTH_SIZE: usize = 9;

/// A session entry of a command's authorization area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSession {
    pub handle: u32,
    pub nonce_caller: Tpm2bNonce,
    pub attributes: SessionAttributes,
    pub hmac: Tpm2bAuth,
    /// HMAC and parameter encryption key, set once the session is checked
    pub(crate) key: Vec<u8>,
}

impl AuthSession {
    pub fn is_password(&self) -> bool {
        self.handle == TPM_RS_PW
    }

    fn has(&self, attr: SessionAttributes) -> bool {
        self.attributes.contains(attr)
    }
}

/// Splits an authorization area into its sessions.
pub fn parse_sessions(area: &[u8]) -> Result<ArrayVec<AuthSession, MAX_SESSIONS>, TpmReqError> {
    let mut cur = Cursor::new(area);
    let mut sessions = ArrayVec::new();
    while cur.remaining() > 0 {
        if sessions.is_full() {
            return Err(TpmReqError::rc(TpmRc::AUTH_CONTEXT));
        }
        let n = sessions.len() + 1;
        let handle = cur.u32().map_err(|_| TpmReqError::size())?;
        let nonce_caller = Tpm2bNonce::unmarshal(&mut cur).map_err(|e| match e {
            MarshalError::Size => TpmReqError::size().at_session(n),
            _ => TpmReqError::size(),
        })?;
        let raw = cur.u8().map_err(|_| TpmReqError::size())?;
        let attributes = SessionAttributes::from_bits(raw)
            .ok_or_else(|| TpmReqError::attributes().at_session(n))?;
        let hmac = Tpm2bAuth::unmarshal(&mut cur).map_err(|e| match e {
            MarshalError::Size => TpmReqError::size().at_session(n),
            _ => TpmReqError::size(),
        })?;
        sessions.push(AuthSession {
            handle,
            nonce_caller,
            attributes,
            hmac,
            key: Vec::new(),
        });
    }
    Ok(sessions)
}

/// Authorization values are compared without trailing zeros.
pub fn trim_auth(auth: &[u8]) -> &[u8] {
    let len = auth.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &auth[..len]
}

/// What the authorization of one handle is checked against.
#[derive(Clone, Debug)]
pub(crate) struct EntityAuth {
    pub handle: u32,
    pub auth: Vec<u8>,
    pub policy: Option<(HashAlg, Vec<u8>)>,
    /// Password and HMAC authorization are possible
    pub user_auth: bool,
    pub da_protected: bool,
}

impl EntityAuth {
    fn plain(handle: u32, auth: &[u8]) -> Self {
        Self {
            handle,
            auth: trim_auth(auth).to_vec(),
            policy: None,
            user_auth: true,
            da_protected: false,
        }
    }

    fn is_lockout(&self) -> bool {
        self.handle == TPM_RH_LOCKOUT
    }
}

impl Engine {
    /// Authorization value and policy of the entity behind `handle`.
    pub(crate) fn entity_auth(&self, handle: u32) -> Result<EntityAuth, TpmReqError> {
        let hierarchy = |handle: u32, h: &crate::state::HierarchyAuth| EntityAuth {
            policy: h.policy_alg.map(|alg| (alg, h.policy.to_vec())),
            ..EntityAuth::plain(handle, &h.auth)
        };
        let entity = match handle {
            TPM_RH_OWNER => hierarchy(handle, &self.gp.owner),
            TPM_RH_ENDORSEMENT => hierarchy(handle, &self.gp.endorsement),
            TPM_RH_PLATFORM => hierarchy(handle, &self.gc.platform),
            TPM_RH_LOCKOUT => hierarchy(handle, &self.gp.lockout),
            TPM_RH_NULL => EntityAuth::plain(handle, &[]),
            _ => match handle_type(handle) {
                HT_PCR => EntityAuth::plain(handle, &[]),
                HT_TRANSIENT | HT_PERSISTENT => {
                    let slot = self.objects.get(handle).ok_or_else(TpmReqError::handle)?;
                    match slot.as_object() {
                        Some(object) => {
                            let attrs = object.public.attributes;
                            let policy = &object.public.auth_policy;
                            EntityAuth {
                                handle,
                                auth: slot.auth().map(trim_auth).unwrap_or_default().to_vec(),
                                policy: (!policy.is_empty())
                                    .then(|| (object.public.name_alg, policy.to_vec())),
                                user_auth: object.sensitive.is_some()
                                    && attrs.contains(ObjectAttributes::USER_WITH_AUTH),
                                da_protected: object.is_da_protected(),
                            }
                        }
                        None => EntityAuth::plain(handle, slot.auth().unwrap_or_default()),
                    }
                }
                HT_NV_INDEX => {
                    let index = self.nv_index(handle)?;
                    let policy = &index.public.auth_policy;
                    EntityAuth {
                        handle,
                        auth: trim_auth(&index.auth).to_vec(),
                        policy: (!policy.is_empty())
                            .then(|| (index.public.name_alg, policy.to_vec())),
                        user_auth: true,
                        da_protected: !index.public.attributes.no_da(),
                    }
                }
                _ => return Err(TpmReqError::handle()),
            },
        };
        Ok(entity)
    }

    /// Validates the authorization area and checks every authorization.
    ///
    /// Only a failed authorization of a DA protected entity has a side
    /// effect: the failure counter is incremented and written to NV.
    pub(crate) fn check_sessions(&mut self, cmd: &mut Command<'_>) -> Result<(), TpmReqError> {
        let auth_handles = cmd.entry.auth_handles;
        if cmd.sessions.len() < auth_handles {
            return Err(TpmReqError::rc(TpmRc::AUTH_MISSING));
        }
        self.check_session_structure(cmd)?;
        self.check_physical_presence(cmd)?;

        for i in 0..cmd.sessions.len() {
            if i < auth_handles {
                let entity = self.entity_auth(cmd.handles[i]).map_err(|e| e.at_handle(i + 1))?;
                self.authorize(cmd, i, &entity)?;
            } else if !cmd.sessions[i].is_password() {
                self.check_unbound_hmac(cmd, i)?;
            }
        }
        Ok(())
    }

    fn check_session_structure(&self, cmd: &mut Command<'_>) -> Result<(), TpmReqError> {
        let entry = cmd.entry;
        for (i, auth) in cmd.sessions.iter().enumerate() {
            let n = i + 1;
            let fail = |err: TpmReqError| Err(err.at_session(n));
            if cmd.sessions[..i].iter().any(|s| s.handle == auth.handle) {
                return fail(TpmReqError::handle());
            }
            if auth.is_password() {
                if !auth.nonce_caller.is_empty() {
                    return fail(TpmReqError::rc(TpmRc::NONCE));
                }
                if auth.attributes & !SessionAttributes::CONTINUE_SESSION
                    != SessionAttributes::empty()
                    || i >= entry.auth_handles
                {
                    return fail(TpmReqError::attributes());
                }
                continue;
            }

            if !super::is_session_handle(auth.handle) {
                return fail(TpmReqError::value());
            }
            let session = match self.session_slot(auth.handle) {
                Ok(slot) => self.sessions.get(slot).ok_or_else(|| TpmReqError::from(Fault::internal()))?,
                Err(SessionLookup::Saved) | Err(SessionLookup::Unknown) => {
                    return Err(TpmReqError::rc(TpmRc::reference_session(n)));
                }
            };
            if auth.nonce_caller.len() > session.auth_hash.digest_size() {
                return fail(TpmReqError::size());
            }
            let audit = auth.has(SessionAttributes::AUDIT);
            if !audit
                && auth
                    .attributes
                    .intersects(SessionAttributes::AUDIT_EXCLUSIVE | SessionAttributes::AUDIT_RESET)
            {
                return fail(TpmReqError::attributes());
            }
            if auth.has(SessionAttributes::DECRYPT) {
                if cmd.decrypt_session.is_some() || !entry.attrs.contains(CommandAttrs::DECRYPT) {
                    return fail(TpmReqError::attributes());
                }
                if session.symmetric == SymDef::Null {
                    return fail(TpmReqError::symmetric());
                }
                cmd.decrypt_session = Some(i);
            }
            if auth.has(SessionAttributes::ENCRYPT) {
                if cmd.encrypt_session.is_some() || !entry.attrs.contains(CommandAttrs::ENCRYPT) {
                    return fail(TpmReqError::attributes());
                }
                if session.symmetric == SymDef::Null {
                    return fail(TpmReqError::symmetric());
                }
                cmd.encrypt_session = Some(i);
            }
            if audit {
                if cmd.audit_session.is_some() {
                    return fail(TpmReqError::attributes());
                }
                if auth.has(SessionAttributes::AUDIT_EXCLUSIVE)
                    && self.exclusive_audit != Some(auth.handle)
                {
                    return Err(TpmReqError::rc(TpmRc::EXCLUSIVE));
                }
                cmd.audit_session = Some(i);
            }
            if i < entry.auth_handles {
                if session.is_trial() {
                    return fail(TpmReqError::attributes());
                }
            } else if !auth.attributes.intersects(
                SessionAttributes::DECRYPT | SessionAttributes::ENCRYPT | SessionAttributes::AUDIT,
            ) {
                return fail(TpmReqError::attributes());
            }
        }
        Ok(())
    }

    /// Platform authorization of a command in the PP list needs physical
    /// presence.
    fn check_physical_presence(&self, cmd: &Command<'_>) -> Result<(), TpmReqError> {
        let code = cmd.entry.code;
        if !cmd.entry.attrs.contains(CommandAttrs::PP) || !self.gp.pp_commands.is_set(code) {
            return Ok(());
        }
        let platform_auth = cmd.handles[..cmd.entry.auth_handles]
            .iter()
            .any(|&h| h == TPM_RH_PLATFORM);
        if platform_auth && !self.platform.physical_presence() {
            return Err(TpmReqError::rc(TpmRc::PP));
        }
        Ok(())
    }

    fn authorize(
        &mut self,
        cmd: &mut Command<'_>,
        i: usize,
        entity: &EntityAuth,
    ) -> Result<(), TpmReqError> {
        let n = i + 1;
        if entity.is_lockout() && !self.gp.lockout_auth_enabled {
            return Err(TpmReqError::rc(TpmRc::LOCKOUT));
        }
        if entity.da_protected && self.gp.in_lockout() {
            return Err(TpmReqError::rc(TpmRc::LOCKOUT));
        }

        if cmd.sessions[i].is_password() {
            if !entity.user_auth {
                return Err(TpmReqError::rc(TpmRc::AUTH_UNAVAILABLE).at_session(n));
            }
            let offered = trim_auth(&cmd.sessions[i].hmac);
            if !ct_eq(offered, &entity.auth) {
                return Err(self.auth_failure(entity, n));
            }
            return Ok(());
        }

        let session = self
            .session(cmd.sessions[i].handle)
            .cloned()
            .ok_or_else(|| TpmReqError::from(Fault::internal()))?;
        let name = cmd.names[i].clone();

        if !session.is_policy() {
            if !entity.user_auth {
                return Err(TpmReqError::rc(TpmRc::AUTH_UNAVAILABLE).at_session(n));
            }
            let bound = session.flags.contains(SessionFlags::BOUND)
                && session.bound_entity == bind_digest(&name, &entity.auth);
            let key = session_hmac_key(&session, (!bound).then_some(entity.auth.as_slice()));
            if !self.verify_hmac(cmd, i, &session, &key) {
                return Err(self.auth_failure(entity, n));
            }
            cmd.sessions[i].key = key;
            return Ok(());
        }

        let Some((policy_alg, policy)) = &entity.policy else {
            return Err(TpmReqError::rc(TpmRc::POLICY_FAIL).at_session(n));
        };
        if *policy_alg != session.auth_hash || !ct_eq(policy, &session.policy_digest) {
            return Err(TpmReqError::rc(TpmRc::POLICY_FAIL).at_session(n));
        }
        if session.command_code.is_some_and(|code| code != cmd.entry.code) {
            return Err(TpmReqError::rc(TpmRc::POLICY_CC).at_session(n));
        }
        if session.flags.contains(SessionFlags::INCLUDE_PASSWORD) {
            let offered = trim_auth(&cmd.sessions[i].hmac);
            if !ct_eq(offered, &entity.auth) {
                return Err(self.auth_failure(entity, n));
            }
        } else {
            let auth = session
                .flags
                .contains(SessionFlags::INCLUDE_AUTH)
                .then_some(entity.auth.as_slice());
            let key = session_hmac_key(&session, auth);
            if auth.is_some() && !self.verify_hmac(cmd, i, &session, &key) {
                return Err(self.auth_failure(entity, n));
            }
            cmd.sessions[i].key = key;
        }
        Ok(())
    }

    /// Checks the HMAC of a session that authorizes nothing.
    fn check_unbound_hmac(&mut self, cmd: &mut Command<'_>, i: usize) -> Result<(), TpmReqError> {
        let session = self
            .session(cmd.sessions[i].handle)
            .cloned()
            .ok_or_else(|| TpmReqError::from(Fault::internal()))?;
        let key = session_hmac_key(&session, None);
        if !session.is_policy() && !self.verify_hmac(cmd, i, &session, &key) {
            return Err(TpmReqError::auth_fail().at_session(i + 1));
        }
        cmd.sessions[i].key = key;
        Ok(())
    }

    fn verify_hmac(&self, cmd: &mut Command<'_>, i: usize, session: &Session, key: &[u8]) -> bool {
        let cp_hash = cmd.cp_hash(session.auth_hash);
        // The first session also covers the nonces of the encryption
        // sessions
        let mut others: ArrayVec<usize, 2> = ArrayVec::new();
        if i == 0 {
            for other in [cmd.decrypt_session, cmd.encrypt_session].into_iter().flatten() {
                if other != 0 && !others.contains(&other) {
                    others.push(other);
                }
            }
        }
        let extra: Vec<Tpm2bNonce> = others
            .iter()
            .filter_map(|&other| self.session(cmd.sessions[other].handle))
            .map(|s| s.nonce_tpm.clone())
            .collect();
        let auth = &cmd.sessions[i];
        let attrs = [auth.attributes.bits()];
        let mut parts: Vec<&[u8]> = vec![
            cp_hash.as_slice(),
            auth.nonce_caller.as_slice(),
            session.nonce_tpm.as_slice(),
        ];
        parts.extend(extra.iter().map(|nonce| nonce.as_slice()));
        parts.push(&attrs[..]);
        let expected = session.auth_hash.hmac(key, &parts);
        ct_eq(&expected, &auth.hmac)
    }

    /// Records a failed authorization and returns the error to report.
    fn auth_failure(&mut self, entity: &EntityAuth, n: usize) -> TpmReqError {
        if !entity.is_lockout() && !entity.da_protected {
            return TpmReqError::bad_auth().at_session(n);
        }
        match self.platform.nv_ready_state() {
            NvReadyState::Ready => {}
            NvReadyState::Unavailable => return TpmReqError::rc(TpmRc::NV_UNAVAILABLE),
            NvReadyState::RateLimited => return TpmReqError::rc(TpmRc::NV_RATE),
        }
        if entity.is_lockout() {
            if self.gp.lockout_recovery != 0 {
                self.gp.lockout_auth_enabled = false;
                self.go.lockout_timer = self.go.clock;
                self.nv_update.raise(NvUpdate::Orderly);
            }
            log::warn!("lockout authorization failed, lockout auth disabled");
        } else {
            self.gp.failed_tries = self.gp.failed_tries.saturating_add(1);
            if self.gp.in_lockout() {
                log::warn!("dictionary attack lockout after {} failures", self.gp.failed_tries);
            }
        }
        if let Err(err) = self.write_persistent() {
            return err;
        }
        TpmReqError::auth_fail().at_session(n)
    }

    /// Updates the sessions after a successful command and returns the
    /// response authorization area. `params` is already encrypted.
    pub(crate) fn response_sessions(
        &mut self,
        cmd: &mut Command<'_>,
        params: &[u8],
    ) -> Result<Vec<u8>, TpmReqError> {
        let mut out = Vec::new();
        for i in 0..cmd.sessions.len() {
            let auth = cmd.sessions[i].clone();
            if auth.is_password() {
                marshal_bytes(&[], &mut out);
                auth.attributes.bits().marshal(&mut out);
                marshal_bytes(&[], &mut out);
                continue;
            }
            let cp_hash = cmd.cp_hash(self.session_alg(auth.handle)?);
            let Some(session) = self.session_mut(auth.handle) else {
                return Err(Fault::internal().into());
            };
            let rp_hash = rp_hash(session.auth_hash, cmd.entry.code, params);

            if auth.has(SessionAttributes::AUDIT) {
                if auth.has(SessionAttributes::AUDIT_RESET)
                    || !session.flags.contains(SessionFlags::AUDIT)
                {
                    session.audit_digest = zero_digest(session.auth_hash);
                }
                let digest = session.auth_hash.digest(&[
                    session.audit_digest.as_slice(),
                    cp_hash.as_slice(),
                    rp_hash.as_slice(),
                ]);
                session.audit_digest = crate::marshal::Tpm2bDigest::from_vec(digest)
                    .map_err(|_| Fault::internal())?;
                session.flags.insert(SessionFlags::AUDIT);
            }

            let password = session.flags.contains(SessionFlags::INCLUDE_PASSWORD);
            let attrs = [auth.attributes.bits()];
            let hmac = if password {
                Vec::new()
            } else {
                session.auth_hash.hmac(
                    &auth.key,
                    &[
                        rp_hash.as_slice(),
                        session.nonce_tpm.as_slice(),
                        auth.nonce_caller.as_slice(),
                        &attrs[..],
                    ],
                )
            };
            if session.is_policy() && i < cmd.entry.auth_handles {
                session.reset_policy();
            }
            marshal_bytes(&session.nonce_tpm, &mut out);
            attrs[0].marshal(&mut out);
            marshal_bytes(&hmac, &mut out);

            if !auth.has(SessionAttributes::CONTINUE_SESSION) {
                self.flush_session(auth.handle);
            }
        }
        Ok(out)
    }

    /// Draws a fresh nonceTPM for every session of the command.
    pub(crate) fn roll_nonces(&mut self, cmd: &Command<'_>) -> Result<(), TpmReqError> {
        for auth in cmd.sessions.iter().filter(|s| !s.is_password()) {
            let len = self
                .session(auth.handle)
                .map(|s| s.nonce_tpm.len())
                .ok_or_else(|| TpmReqError::from(Fault::internal()))?;
            let mut nonce = vec![0u8; len];
            self.random(&mut nonce)?;
            if let Some(session) = self.session_mut(auth.handle) {
                session.nonce_tpm = Tpm2bNonce::from_vec(nonce).map_err(|_| Fault::internal())?;
            }
        }
        Ok(())
    }

    fn session_alg(&self, handle: u32) -> Result<HashAlg, TpmReqError> {
        self.session(handle)
            .map(|s| s.auth_hash)
            .ok_or_else(|| Fault::internal().into())
    }
}

/// sessionKey || authValue
fn session_hmac_key(session: &Session, auth: Option<&[u8]>) -> Vec<u8> {
    let mut key = session.session_key.to_vec();
    key.extend_from_slice(auth.unwrap_or_default());
    key
}

/// rpHash = H(responseCode || commandCode || parameters), for a successful
/// command.
pub fn rp_hash(alg: HashAlg, code: u32, params: &[u8]) -> Vec<u8> {
    let rc = TpmRc::SUCCESS.0.to_be_bytes();
    let code = code.to_be_bytes();
    alg.digest(&[&rc[..], &code[..], params])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_session(auth: &[u8]) -> Vec<u8> {
        let mut area = Vec::new();
        TPM_RS_PW.marshal(&mut area);
        marshal_bytes(&[], &mut area);
        SessionAttributes::CONTINUE_SESSION.bits().marshal(&mut area);
        marshal_bytes(auth, &mut area);
        area
    }

    #[test]
    fn parse_password_session() {
        let area = password_session(b"secret");
        let sessions = parse_sessions(&area).expect("Failed to parse sessions");
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_password());
        assert_eq!(sessions[0].hmac.as_slice(), b"secret");
    }

    #[test]
    fn malformed_area() {
        let mut area = password_session(b"");
        area.pop();
        assert!(matches!(
            parse_sessions(&area),
            Err(TpmReqError::Response(rc)) if rc == TpmRc::SIZE
        ));

        let mut area = password_session(b"");
        area[6] = 0x18;
        assert!(matches!(
            parse_sessions(&area),
            Err(TpmReqError::Response(rc)) if rc == TpmRc::ATTRIBUTES.with_session(1)
        ));

        let area: Vec<u8> = (0..4).flat_map(|_| password_session(b"")).collect();
        assert!(matches!(
            parse_sessions(&area),
            Err(TpmReqError::Response(rc)) if rc == TpmRc::AUTH_CONTEXT
        ));
    }

    #[test]
    fn trailing_zeros_ignored() {
        assert_eq!(trim_auth(b"abc\0\0"), b"abc");
        assert_eq!(trim_auth(&[0, 0]), b"");
        assert_eq!(trim_auth(b"a\0b"), b"a\0b");
    }

    #[test]
    fn response_hash_covers_code() {
        let a = rp_hash(HashAlg::Sha256, cc::GET_RANDOM, &[1, 2]);
        let b = rp_hash(HashAlg::Sha256, cc::STIR_RANDOM, &[1, 2]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
