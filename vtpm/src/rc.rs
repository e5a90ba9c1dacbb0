// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! TPM response codes and the error type used on the command path.

use crate::failure::Fault;
use crate::marshal::MarshalError;
use bitfield_struct::bitfield;
use core::fmt;

/// A TPM_RC value as returned in a response header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TpmRc(pub u32);

const RC_VER1: u32 = 0x100;
const RC_FMT1: u32 = 0x080;
const RC_WARN: u32 = 0x900;

macro_rules! rc_consts {
    ($($name:ident = $base:ident + $off:expr;)*) => {
        $(pub const $name: TpmRc = TpmRc($base + $off);)*
    };
}

impl TpmRc {
    pub const SUCCESS: TpmRc = TpmRc(0);
    pub const BAD_TAG: TpmRc = TpmRc(0x01E);

    rc_consts! {
        INITIALIZE = RC_VER1 + 0x000;
        FAILURE = RC_VER1 + 0x001;
        SEQUENCE = RC_VER1 + 0x003;
        DISABLED = RC_VER1 + 0x020;
        EXCLUSIVE = RC_VER1 + 0x021;
        AUTH_TYPE = RC_VER1 + 0x024;
        AUTH_MISSING = RC_VER1 + 0x025;
        POLICY = RC_VER1 + 0x026;
        PCR = RC_VER1 + 0x027;
        PCR_CHANGED = RC_VER1 + 0x028;
        UPGRADE = RC_VER1 + 0x02D;
        TOO_MANY_CONTEXTS = RC_VER1 + 0x02E;
        AUTH_UNAVAILABLE = RC_VER1 + 0x02F;
        REBOOT = RC_VER1 + 0x030;
        UNBALANCED = RC_VER1 + 0x031;
        COMMAND_SIZE = RC_VER1 + 0x042;
        COMMAND_CODE = RC_VER1 + 0x043;
        AUTHSIZE = RC_VER1 + 0x044;
        AUTH_CONTEXT = RC_VER1 + 0x045;
        NV_RANGE = RC_VER1 + 0x046;
        NV_SIZE = RC_VER1 + 0x047;
        NV_LOCKED = RC_VER1 + 0x048;
        NV_AUTHORIZATION = RC_VER1 + 0x049;
        NV_UNINITIALIZED = RC_VER1 + 0x04A;
        NV_SPACE = RC_VER1 + 0x04B;
        NV_DEFINED = RC_VER1 + 0x04C;
        BAD_CONTEXT = RC_VER1 + 0x050;
        CPHASH = RC_VER1 + 0x051;
        PARENT = RC_VER1 + 0x052;
        NEEDS_TEST = RC_VER1 + 0x053;
        NO_RESULT = RC_VER1 + 0x054;
        SENSITIVE = RC_VER1 + 0x055;

        ASYMMETRIC = RC_FMT1 + 0x001;
        ATTRIBUTES = RC_FMT1 + 0x002;
        HASH = RC_FMT1 + 0x003;
        VALUE = RC_FMT1 + 0x004;
        HIERARCHY = RC_FMT1 + 0x005;
        KEY_SIZE = RC_FMT1 + 0x007;
        MODE = RC_FMT1 + 0x009;
        TYPE = RC_FMT1 + 0x00A;
        HANDLE = RC_FMT1 + 0x00B;
        KDF = RC_FMT1 + 0x00C;
        RANGE = RC_FMT1 + 0x00D;
        AUTH_FAIL = RC_FMT1 + 0x00E;
        NONCE = RC_FMT1 + 0x00F;
        PP = RC_FMT1 + 0x010;
        SCHEME = RC_FMT1 + 0x012;
        SIZE = RC_FMT1 + 0x015;
        SYMMETRIC = RC_FMT1 + 0x016;
        TAG = RC_FMT1 + 0x017;
        SELECTOR = RC_FMT1 + 0x018;
        INSUFFICIENT = RC_FMT1 + 0x01A;
        KEY = RC_FMT1 + 0x01C;
        POLICY_FAIL = RC_FMT1 + 0x01D;
        INTEGRITY = RC_FMT1 + 0x01F;
        TICKET = RC_FMT1 + 0x020;
        RESERVED_BITS = RC_FMT1 + 0x021;
        BAD_AUTH = RC_FMT1 + 0x022;
        EXPIRED = RC_FMT1 + 0x023;
        POLICY_CC = RC_FMT1 + 0x024;
        BINDING = RC_FMT1 + 0x025;

        CONTEXT_GAP = RC_WARN + 0x001;
        OBJECT_MEMORY = RC_WARN + 0x002;
        SESSION_MEMORY = RC_WARN + 0x003;
        MEMORY = RC_WARN + 0x004;
        SESSION_HANDLES = RC_WARN + 0x005;
        OBJECT_HANDLES = RC_WARN + 0x006;
        LOCALITY = RC_WARN + 0x007;
        CANCELED = RC_WARN + 0x009;
        TESTING = RC_WARN + 0x00A;
        REFERENCE_H0 = RC_WARN + 0x010;
        REFERENCE_S0 = RC_WARN + 0x018;
        NV_RATE = RC_WARN + 0x020;
        LOCKOUT = RC_WARN + 0x021;
        RETRY = RC_WARN + 0x022;
        NV_UNAVAILABLE = RC_WARN + 0x023;
    }

    /// Whether this is a format-one code that can carry a handle,
    /// parameter or session number.
    pub fn is_fmt1(self) -> bool {
        self.0 & RC_FMT1 != 0
    }

    fn numbered(self, parameter: bool, number: u8) -> Self {
        if !self.is_fmt1() {
            return self;
        }
        let code = Fmt1Code::from(self.0)
            .with_parameter(parameter)
            .with_number(number & 0xF);
        Self(code.into())
    }

    /// Tags the code with the 1-based number of the offending handle.
    pub fn with_handle(self, n: usize) -> Self {
        self.numbered(false, n.min(7) as u8)
    }

    /// Tags the code with the 1-based number of the offending parameter.
    pub fn with_param(self, n: usize) -> Self {
        self.numbered(true, n.min(15) as u8)
    }

    /// Tags the code with the 1-based number of the offending session.
    pub fn with_session(self, n: usize) -> Self {
        self.numbered(false, 0x8 | n.min(7) as u8)
    }

    /// The code with any handle, parameter or session number removed.
    pub fn base(self) -> Self {
        if self.is_fmt1() {
            Self(Fmt1Code::from(self.0).with_parameter(false).with_number(0).into())
        } else {
            self
        }
    }

    /// Warning codes that reference a handle or session carry its number in
    /// the low bits instead of a format-one field.
    pub fn reference_handle(n: usize) -> Self {
        Self(Self::REFERENCE_H0.0 + n.saturating_sub(1).min(6) as u32)
    }

    pub fn reference_session(n: usize) -> Self {
        Self(Self::REFERENCE_S0.0 + n.saturating_sub(1).min(6) as u32)
    }
}

impl fmt::Debug for TpmRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TpmRc({:#05x})", self.0)
    }
}

impl fmt::Display for TpmRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

impl From<TpmRc> for u32 {
    fn from(rc: TpmRc) -> u32 {
        rc.0
    }
}

/// Layout of a format-one response code.
#[bitfield(u32)]
struct Fmt1Code {
    #[bits(6)]
    error: u8,
    parameter: bool,
    fmt1: bool,
    #[bits(4)]
    number: u8,
    #[bits(20)]
    rsvd_31_12: u32,
}

/// Error type of everything running on behalf of a command.
///
/// `Response` errors are reported to the caller in the response header.
/// `Fatal` errors put the engine into failure mode and must be propagated
/// up to the dispatcher untouched.
#[derive(Debug, Clone, Copy)]
pub enum TpmReqError {
    Response(TpmRc),
    Fatal(Fault),
}

macro_rules! impl_rc_err {
    ($name:ident, $v:ident) => {
        pub fn $name() -> Self {
            Self::Response(TpmRc::$v)
        }
    };
}

impl TpmReqError {
    impl_rc_err!(attributes, ATTRIBUTES);
    impl_rc_err!(auth_fail, AUTH_FAIL);
    impl_rc_err!(bad_auth, BAD_AUTH);
    impl_rc_err!(handle, HANDLE);
    impl_rc_err!(hash, HASH);
    impl_rc_err!(hierarchy, HIERARCHY);
    impl_rc_err!(size, SIZE);
    impl_rc_err!(value, VALUE);
    impl_rc_err!(integrity, INTEGRITY);
    impl_rc_err!(sequence, SEQUENCE);
    impl_rc_err!(symmetric, SYMMETRIC);
    impl_rc_err!(type_error, TYPE);

    pub fn rc(rc: TpmRc) -> Self {
        Self::Response(rc)
    }

    /// Adds a parameter number to a format-one response code.
    pub fn param(self, n: usize) -> Self {
        match self {
            Self::Response(rc) => Self::Response(rc.with_param(n)),
            fatal => fatal,
        }
    }

    /// Adds a handle number to a format-one response code.
    pub fn at_handle(self, n: usize) -> Self {
        match self {
            Self::Response(rc) => Self::Response(rc.with_handle(n)),
            fatal => fatal,
        }
    }

    /// Adds a session number to a format-one response code.
    pub fn at_session(self, n: usize) -> Self {
        match self {
            Self::Response(rc) => Self::Response(rc.with_session(n)),
            fatal => fatal,
        }
    }
}

impl From<TpmRc> for TpmReqError {
    fn from(rc: TpmRc) -> Self {
        Self::Response(rc)
    }
}

impl From<Fault> for TpmReqError {
    fn from(fault: Fault) -> Self {
        Self::Fatal(fault)
    }
}

impl From<MarshalError> for TpmReqError {
    fn from(err: MarshalError) -> Self {
        Self::Response(err.rc())
    }
}

/// Converts unmarshaling results into command errors tagged with the
/// number of the parameter being decoded.
pub trait ParamExt<T> {
    fn param(self, n: usize) -> Result<T, TpmReqError>;
}

impl<T> ParamExt<T> for Result<T, MarshalError> {
    fn param(self, n: usize) -> Result<T, TpmReqError> {
        self.map_err(|e| TpmReqError::from(e).param(n))
    }
}

impl<T> ParamExt<T> for Result<T, TpmReqError> {
    fn param(self, n: usize) -> Result<T, TpmReqError> {
        self.map_err(|e| e.param(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt1_numbers() {
        assert_eq!(TpmRc::VALUE.with_param(1).0, 0x1C4);
        assert_eq!(TpmRc::HANDLE.with_handle(2).0, 0x28B);
        assert_eq!(TpmRc::AUTH_FAIL.with_session(1).0, 0x98E);
        assert_eq!(TpmRc::AUTH_FAIL.with_session(1).base(), TpmRc::AUTH_FAIL);
    }

    #[test]
    fn fmt0_unchanged() {
        assert_eq!(TpmRc::INITIALIZE.with_param(3), TpmRc::INITIALIZE);
        assert_eq!(TpmRc::LOCKOUT.with_session(1), TpmRc::LOCKOUT);
        assert_eq!(TpmRc::reference_handle(1).0, 0x910);
        assert_eq!(TpmRc::reference_session(2).0, 0x919);
    }
}
