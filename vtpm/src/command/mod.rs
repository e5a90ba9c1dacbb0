// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Command table and per-command context.
//!
//! The handle area of a command is not self-describing: how many handles
//! follow the header, which of them need authorization and which handle
//! types each may take is a property of the command and comes from
//! [`COMMANDS`].

mod actions;
mod dispatch;
#[cfg(test)]
mod tests;

use crate::config::TpmConfig;
use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::marshal::Cursor;
use crate::pcr::HASH_COUNT;
use crate::rc::{TpmReqError, TpmRc};
use crate::session::auth::{AuthSession, MAX_SESSIONS};
use crate::types::*;
use actions::*;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::fmt;

/// Most handles in the handle area of any command.
pub const MAX_HANDLES: usize = 3;

bitflags! {
    /// Handle types a handle slot accepts.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct HandleSet: u16 {
        const OWNER = 1 << 0;
        const ENDORSEMENT = 1 << 1;
        const PLATFORM = 1 << 2;
        const LOCKOUT = 1 << 3;
        const NULL = 1 << 4;
        const TRANSIENT = 1 << 5;
        const PERSISTENT = 1 << 6;
        const NV_INDEX = 1 << 7;
        const PCR = 1 << 8;
        const HMAC_SESSION = 1 << 9;
        const POLICY_SESSION = 1 << 10;

        const OBJECT = Self::TRANSIENT.bits() | Self::PERSISTENT.bits();
        const HIERARCHY = Self::OWNER.bits() | Self::ENDORSEMENT.bits() | Self::PLATFORM.bits();
        const OWNER_OR_PLATFORM = Self::OWNER.bits() | Self::PLATFORM.bits();
        const LOCKOUT_OR_PLATFORM = Self::LOCKOUT.bits() | Self::PLATFORM.bits();
        const HIERARCHY_AUTH = Self::HIERARCHY.bits() | Self::LOCKOUT.bits();
        const NV_AUTH = Self::OWNER_OR_PLATFORM.bits() | Self::NV_INDEX.bits();
        const PCR_OR_NULL = Self::PCR.bits() | Self::NULL.bits();
        const SESSION = Self::HMAC_SESSION.bits() | Self::POLICY_SESSION.bits();
        const SAVEABLE = Self::TRANSIENT.bits() | Self::SESSION.bits();
        const TPM_KEY = Self::OBJECT.bits() | Self::NULL.bits();
        const BIND = Self::HIERARCHY_AUTH.bits()
            | Self::OBJECT.bits()
            | Self::NV_INDEX.bits()
            | Self::PCR.bits()
            | Self::NULL.bits();
    }
}

impl HandleSet {
    /// The class `handle` belongs to.
    pub fn classify(handle: u32) -> Self {
        match handle {
            TPM_RH_OWNER => Self::OWNER,
            TPM_RH_ENDORSEMENT => Self::ENDORSEMENT,
            TPM_RH_PLATFORM => Self::PLATFORM,
            TPM_RH_LOCKOUT => Self::LOCKOUT,
            TPM_RH_NULL => Self::NULL,
            _ => match handle_type(handle) {
                HT_PCR => Self::PCR,
                HT_NV_INDEX => Self::NV_INDEX,
                HT_HMAC_SESSION => Self::HMAC_SESSION,
                HT_POLICY_SESSION => Self::POLICY_SESSION,
                HT_TRANSIENT => Self::TRANSIENT,
                HT_PERSISTENT => Self::PERSISTENT,
                _ => Self::empty(),
            },
        }
    }
}

bitflags! {
    /// Static properties of a command.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct CommandAttrs: u8 {
        /// The response carries a handle
        const RESPONSE_HANDLE = 1 << 0;
        /// The first parameter may be encrypted
        const DECRYPT = 1 << 1;
        /// The first response parameter may be encrypted
        const ENCRYPT = 1 << 2;
        /// The command may write NV
        const NV = 1 << 3;
        /// The command takes no sessions at all
        const NO_SESSIONS = 1 << 4;
        /// Platform authorization may require physical presence
        const PP = 1 << 5;
    }
}

macro_rules! attrs {
    ($($flag:ident),*) => {
        CommandAttrs::empty()$(.union(CommandAttrs::$flag))*
    };
}

/// An action reads its parameters from the request and writes its
/// response parameters.
pub(crate) type Action = fn(&mut Engine, &mut Request<'_>, &mut Response) -> Result<(), TpmReqError>;

pub struct CommandEntry {
    pub code: u32,
    pub handles: &'static [HandleSet],
    /// Number of leading handles that need authorization
    pub auth_handles: usize,
    pub attrs: CommandAttrs,
    action: Action,
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("code", &format_args!("{:#x}", self.code))
            .field("handles", &self.handles.len())
            .field("auth_handles", &self.auth_handles)
            .field("attrs", &self.attrs)
            .finish()
    }
}

impl CommandEntry {
    /// TPMA_CC of the command.
    pub fn tpma_cc(&self) -> u32 {
        let index = self.code & 0xFFFF;
        let nv = u32::from(self.attrs.contains(CommandAttrs::NV)) << 22;
        let flushed = u32::from(self.code == cc::FLUSH_CONTEXT) << 24;
        let handles = (self.handles.len() as u32 & 0x7) << 25;
        let rhandle = u32::from(self.attrs.contains(CommandAttrs::RESPONSE_HANDLE)) << 28;
        index | nv | flushed | handles | rhandle
    }

    pub(crate) fn run(
        &self,
        engine: &mut Engine,
        request: &mut Request<'_>,
        response: &mut Response,
    ) -> Result<(), TpmReqError> {
        (self.action)(engine, request, response)
    }
}

const fn entry(
    code: u32,
    handles: &'static [HandleSet],
    auth_handles: usize,
    attrs: CommandAttrs,
    action: Action,
) -> CommandEntry {
    CommandEntry {
        code,
        handles,
        auth_handles,
        attrs,
        action,
    }
}

use HandleSet as H;

/// Every implemented command, ordered by command code.
pub static COMMANDS: [CommandEntry; 46] = [
    entry(cc::EVICT_CONTROL, &[H::OWNER_OR_PLATFORM, H::OBJECT], 1, attrs!(NV, PP), object::evict_control),
    entry(cc::HIERARCHY_CONTROL, &[H::HIERARCHY], 1, attrs!(NV, PP), hierarchy::hierarchy_control),
    entry(cc::NV_UNDEFINE_SPACE, &[H::OWNER_OR_PLATFORM, H::NV_INDEX], 1, attrs!(NV, PP), nv::undefine_space),
    entry(cc::CLEAR, &[H::LOCKOUT_OR_PLATFORM], 1, attrs!(NV, PP), hierarchy::clear),
    entry(cc::CLEAR_CONTROL, &[H::LOCKOUT_OR_PLATFORM], 1, attrs!(NV, PP), hierarchy::clear_control),
    entry(cc::CLOCK_SET, &[H::OWNER_OR_PLATFORM], 1, attrs!(NV, PP), clock::clock_set),
    entry(cc::HIERARCHY_CHANGE_AUTH, &[H::HIERARCHY_AUTH], 1, attrs!(NV, DECRYPT, PP), hierarchy::change_auth),
    entry(cc::NV_DEFINE_SPACE, &[H::OWNER_OR_PLATFORM], 1, attrs!(NV, DECRYPT, PP), nv::define_space),
    entry(cc::PCR_ALLOCATE, &[H::PLATFORM], 1, attrs!(NV, PP), pcr::allocate),
    entry(cc::PP_COMMANDS, &[H::PLATFORM], 1, attrs!(NV, PP), audit::pp_commands),
    entry(cc::SET_PRIMARY_POLICY, &[H::HIERARCHY_AUTH], 1, attrs!(NV, DECRYPT, PP), hierarchy::set_primary_policy),
    entry(cc::NV_WRITE, &[H::NV_AUTH, H::NV_INDEX], 1, attrs!(NV, DECRYPT, PP), nv::write),
    entry(cc::DICTIONARY_ATTACK_LOCK_RESET, &[H::LOCKOUT], 1, attrs!(NV), da::lock_reset),
    entry(cc::DICTIONARY_ATTACK_PARAMETERS, &[H::LOCKOUT], 1, attrs!(NV), da::parameters),
    entry(cc::PCR_RESET, &[H::PCR], 1, attrs!(), pcr::reset),
    entry(cc::SEQUENCE_COMPLETE, &[H::TRANSIENT], 1, attrs!(DECRYPT, ENCRYPT), hash::sequence_complete),
    entry(cc::SET_COMMAND_CODE_AUDIT_STATUS, &[H::OWNER_OR_PLATFORM], 1, attrs!(NV, PP), audit::set_audit_status),
    entry(cc::SELF_TEST, &[], 0, attrs!(), testing::self_test),
    entry(cc::STARTUP, &[], 0, attrs!(NO_SESSIONS), startup::startup),
    entry(cc::SHUTDOWN, &[], 0, attrs!(NV), startup::shutdown),
    entry(cc::STIR_RANDOM, &[], 0, attrs!(DECRYPT), random::stir_random),
    entry(cc::NV_READ, &[H::NV_AUTH, H::NV_INDEX], 1, attrs!(ENCRYPT, PP), nv::read),
    entry(cc::HMAC_START, &[H::OBJECT], 1, attrs!(RESPONSE_HANDLE, DECRYPT), hash::hmac_start),
    entry(cc::SEQUENCE_UPDATE, &[H::TRANSIENT], 1, attrs!(DECRYPT), hash::sequence_update),
    entry(cc::UNSEAL, &[H::OBJECT], 1, attrs!(ENCRYPT), object::unseal),
    entry(cc::CONTEXT_LOAD, &[], 0, attrs!(NO_SESSIONS, RESPONSE_HANDLE), context::context_load),
    entry(cc::CONTEXT_SAVE, &[H::SAVEABLE], 0, attrs!(NO_SESSIONS), context::context_save),
    entry(cc::FLUSH_CONTEXT, &[], 0, attrs!(NO_SESSIONS), context::flush_context),
    entry(cc::LOAD_EXTERNAL, &[], 0, attrs!(RESPONSE_HANDLE, DECRYPT, ENCRYPT), object::load_external),
    entry(cc::NV_READ_PUBLIC, &[H::NV_INDEX], 0, attrs!(ENCRYPT), nv::read_public),
    entry(cc::POLICY_AUTH_VALUE, &[H::POLICY_SESSION], 0, attrs!(), session::policy_auth_value),
    entry(cc::POLICY_COMMAND_CODE, &[H::POLICY_SESSION], 0, attrs!(), session::policy_command_code),
    entry(cc::READ_PUBLIC, &[H::OBJECT], 0, attrs!(ENCRYPT), object::read_public),
    entry(cc::START_AUTH_SESSION, &[H::TPM_KEY, H::BIND], 0, attrs!(RESPONSE_HANDLE, DECRYPT, ENCRYPT), session::start_auth_session),
    entry(cc::GET_CAPABILITY, &[], 0, attrs!(), capability::get_capability),
    entry(cc::GET_RANDOM, &[], 0, attrs!(ENCRYPT), random::get_random),
    entry(cc::GET_TEST_RESULT, &[], 0, attrs!(ENCRYPT), testing::get_test_result),
    entry(cc::HASH, &[], 0, attrs!(DECRYPT, ENCRYPT), hash::hash),
    entry(cc::PCR_READ, &[], 0, attrs!(), pcr::read),
    entry(cc::POLICY_RESTART, &[H::POLICY_SESSION], 0, attrs!(), session::policy_restart),
    entry(cc::READ_CLOCK, &[], 0, attrs!(), clock::read_clock),
    entry(cc::PCR_EXTEND, &[H::PCR_OR_NULL], 1, attrs!(), pcr::extend),
    entry(cc::EVENT_SEQUENCE_COMPLETE, &[H::PCR_OR_NULL, H::TRANSIENT], 2, attrs!(DECRYPT), hash::event_sequence_complete),
    entry(cc::HASH_SEQUENCE_START, &[], 0, attrs!(RESPONSE_HANDLE, DECRYPT), hash::hash_sequence_start),
    entry(cc::POLICY_GET_DIGEST, &[H::POLICY_SESSION], 0, attrs!(ENCRYPT), session::policy_get_digest),
    entry(cc::POLICY_PASSWORD, &[H::POLICY_SESSION], 0, attrs!(), session::policy_password),
];

/// Looks up an implemented command. Command audit configuration decides
/// whether the audit status command exists.
pub fn lookup(code: u32, config: &TpmConfig) -> Option<&'static CommandEntry> {
    if code == cc::SET_COMMAND_CODE_AUDIT_STATUS && !config.command_audit {
        return None;
    }
    COMMANDS.iter().find(|entry| entry.code == code)
}

/// Implemented commands in ascending command code order.
pub fn implemented(config: &TpmConfig) -> impl Iterator<Item = &'static CommandEntry> + '_ {
    COMMANDS
        .iter()
        .filter(move |entry| lookup(entry.code, config).is_some())
}

/// Handles and parameters as seen by an action.
#[derive(Debug)]
pub(crate) struct Request<'a> {
    pub handles: &'a [u32],
    pub params: Cursor<'a>,
}

impl Request<'_> {
    /// Fails unless every parameter byte was consumed.
    pub fn finish(&self) -> Result<(), TpmReqError> {
        self.params.end().map_err(|_| TpmReqError::size())
    }
}

/// Output of an action.
#[derive(Debug, Default)]
pub(crate) struct Response {
    pub handle: Option<u32>,
    pub params: Vec<u8>,
}

/// Everything the session layer needs to know about the running command.
#[derive(Debug)]
pub(crate) struct Command<'a> {
    pub entry: &'static CommandEntry,
    pub handles: ArrayVec<u32, MAX_HANDLES>,
    /// Names of the handles, for the parameter hash
    pub names: ArrayVec<Vec<u8>, MAX_HANDLES>,
    pub sessions: ArrayVec<AuthSession, MAX_SESSIONS>,
    pub decrypt_session: Option<usize>,
    pub encrypt_session: Option<usize>,
    pub audit_session: Option<usize>,
    /// Parameter area as received, before decryption
    raw_params: &'a [u8],
    cp_hashes: [Option<Vec<u8>>; HASH_COUNT],
}

impl<'a> Command<'a> {
    pub fn new(entry: &'static CommandEntry) -> Self {
        Self {
            entry,
            handles: ArrayVec::new(),
            names: ArrayVec::new(),
            sessions: ArrayVec::new(),
            decrypt_session: None,
            encrypt_session: None,
            audit_session: None,
            raw_params: &[],
            cp_hashes: Default::default(),
        }
    }

    pub fn set_params(&mut self, params: &'a [u8]) {
        self.raw_params = params;
    }

    /// cpHash = H(commandCode || names || parameters)
    pub fn cp_hash(&mut self, alg: HashAlg) -> Vec<u8> {
        if let Some(digest) = &self.cp_hashes[alg.index()] {
            return digest.clone();
        }
        let code = self.entry.code.to_be_bytes();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(self.names.len() + 2);
        parts.push(&code[..]);
        parts.extend(self.names.iter().map(Vec::as_slice));
        parts.push(self.raw_params);
        let digest = alg.digest(&parts);
        self.cp_hashes[alg.index()] = Some(digest.clone());
        digest
    }
}

/// Response code of a command that is not implemented.
pub(crate) fn command_code_error() -> TpmReqError {
    TpmReqError::rc(TpmRc::COMMAND_CODE)
}

#[cfg(test)]
mod table_tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_unique() {
        for pair in COMMANDS.windows(2) {
            assert!(pair[0].code < pair[1].code, "{:#x}", pair[1].code);
        }
        for entry in COMMANDS.iter() {
            assert!(entry.auth_handles <= entry.handles.len());
            assert!(entry.handles.len() <= MAX_HANDLES);
            assert!((cc::FIRST..=cc::LAST).contains(&entry.code));
        }
    }

    #[test]
    fn audit_command_follows_config() {
        let config = TpmConfig::default();
        assert!(lookup(cc::SET_COMMAND_CODE_AUDIT_STATUS, &config).is_some());
        let config = TpmConfig {
            command_audit: false,
            ..Default::default()
        };
        assert!(lookup(cc::SET_COMMAND_CODE_AUDIT_STATUS, &config).is_none());
        assert_eq!(implemented(&config).count(), COMMANDS.len() - 1);
        assert!(lookup(0xFFFF_FFF0, &config).is_none());
    }

    #[test]
    fn handle_classes() {
        assert_eq!(HandleSet::classify(TPM_RH_OWNER), HandleSet::OWNER);
        assert_eq!(HandleSet::classify(0x8000_0001), HandleSet::TRANSIENT);
        assert_eq!(HandleSet::classify(0x0100_0000), HandleSet::NV_INDEX);
        assert_eq!(HandleSet::classify(7), HandleSet::PCR);
        assert!(HandleSet::classify(TPM_RS_PW).is_empty());
        assert!(HandleSet::BIND.contains(HandleSet::PCR));
    }

    #[test]
    fn tpma_cc_encoding() {
        let entry = lookup(cc::NV_UNDEFINE_SPACE, &TpmConfig::default()).expect("Failed to find command");
        assert_eq!(entry.tpma_cc(), 0x122 | (1 << 22) | (2 << 25));
        let entry = lookup(cc::FLUSH_CONTEXT, &TpmConfig::default()).expect("Failed to find command");
        assert_eq!(entry.tpma_cc(), 0x165 | (1 << 24));
    }
}
