// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! TPM 2.0 wire constants and attribute words.

use bitfield_struct::bitfield;
use bitflags::bitflags;

// Structure tags
pub const TPM_ST_RSP_COMMAND: u16 = 0x00C4;
pub const TPM_ST_NULL: u16 = 0x8000;
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;
pub const TPM_ST_SESSIONS: u16 = 0x8002;
pub const TPM_ST_HASHCHECK: u16 = 0x8024;

/// Size of the fixed command/response header (tag, size, code).
pub const TPM_HEADER_SIZE: usize = 10;

/// Value marking data as generated by the TPM ("\xffTCG").
pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;

// Handle types (most significant octet of a handle)
pub const HR_SHIFT: u32 = 24;
pub const HT_PCR: u8 = 0x00;
pub const HT_NV_INDEX: u8 = 0x01;
pub const HT_HMAC_SESSION: u8 = 0x02;
pub const HT_POLICY_SESSION: u8 = 0x03;
pub const HT_PERMANENT: u8 = 0x40;
pub const HT_TRANSIENT: u8 = 0x80;
pub const HT_PERSISTENT: u8 = 0x81;

pub const PCR_FIRST: u32 = 0x0000_0000;
pub const NV_INDEX_FIRST: u32 = 0x0100_0000;
pub const NV_INDEX_LAST: u32 = 0x01FF_FFFF;
pub const HMAC_SESSION_FIRST: u32 = 0x0200_0000;
pub const POLICY_SESSION_FIRST: u32 = 0x0300_0000;
pub const TRANSIENT_FIRST: u32 = 0x8000_0000;
pub const PERSISTENT_FIRST: u32 = 0x8100_0000;
pub const PERSISTENT_LAST: u32 = 0x81FF_FFFF;
pub const PLATFORM_PERSISTENT: u32 = 0x8180_0000;

// Permanent handles
pub const TPM_RH_OWNER: u32 = 0x4000_0001;
pub const TPM_RH_NULL: u32 = 0x4000_0007;
pub const TPM_RS_PW: u32 = 0x4000_0009;
pub const TPM_RH_LOCKOUT: u32 = 0x4000_000A;
pub const TPM_RH_ENDORSEMENT: u32 = 0x4000_000B;
pub const TPM_RH_PLATFORM: u32 = 0x4000_000C;
pub const TPM_RH_PLATFORM_NV: u32 = 0x4000_000D;

// Saved-context handles for objects
pub const CONTEXT_HANDLE_OBJECT: u32 = 0x8000_0000;
pub const CONTEXT_HANDLE_SEQUENCE: u32 = 0x8000_0001;
pub const CONTEXT_HANDLE_STCLEAR: u32 = 0x8000_0002;

/// Returns the handle type of `handle`.
pub const fn handle_type(handle: u32) -> u8 {
    (handle >> HR_SHIFT) as u8
}

// Algorithm identifiers
pub const TPM_ALG_ERROR: u16 = 0x0000;
pub const TPM_ALG_HMAC: u16 = 0x0005;
pub const TPM_ALG_AES: u16 = 0x0006;
pub const TPM_ALG_KEYEDHASH: u16 = 0x0008;
pub const TPM_ALG_XOR: u16 = 0x000A;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_KDF1_SP800_108: u16 = 0x0022;
pub const TPM_ALG_CFB: u16 = 0x0043;

// Session types
pub const TPM_SE_HMAC: u8 = 0x00;
pub const TPM_SE_POLICY: u8 = 0x01;
pub const TPM_SE_TRIAL: u8 = 0x03;

// Startup and shutdown types
pub const TPM_SU_CLEAR: u16 = 0x0000;
pub const TPM_SU_STATE: u16 = 0x0001;

pub const TPM_YES: u8 = 1;
pub const TPM_NO: u8 = 0;

// Capabilities
pub const TPM_CAP_ALGS: u32 = 0x0000_0000;
pub const TPM_CAP_HANDLES: u32 = 0x0000_0001;
pub const TPM_CAP_COMMANDS: u32 = 0x0000_0002;
pub const TPM_CAP_PP_COMMANDS: u32 = 0x0000_0003;
pub const TPM_CAP_AUDIT_COMMANDS: u32 = 0x0000_0004;
pub const TPM_CAP_PCRS: u32 = 0x0000_0005;
pub const TPM_CAP_TPM_PROPERTIES: u32 = 0x0000_0006;

// Fixed properties
pub const TPM_PT_FAMILY_INDICATOR: u32 = 0x100;
pub const TPM_PT_LEVEL: u32 = 0x101;
pub const TPM_PT_REVISION: u32 = 0x102;
pub const TPM_PT_DAY_OF_YEAR: u32 = 0x103;
pub const TPM_PT_YEAR: u32 = 0x104;
pub const TPM_PT_MANUFACTURER: u32 = 0x105;
pub const TPM_PT_VENDOR_STRING_1: u32 = 0x106;
pub const TPM_PT_VENDOR_STRING_2: u32 = 0x107;
pub const TPM_PT_VENDOR_STRING_3: u32 = 0x108;
pub const TPM_PT_VENDOR_STRING_4: u32 = 0x109;
pub const TPM_PT_VENDOR_TPM_TYPE: u32 = 0x10A;
pub const TPM_PT_FIRMWARE_VERSION_1: u32 = 0x10B;
pub const TPM_PT_FIRMWARE_VERSION_2: u32 = 0x10C;
pub const TPM_PT_INPUT_BUFFER: u32 = 0x10D;
pub const TPM_PT_HR_TRANSIENT_MIN: u32 = 0x10E;
pub const TPM_PT_HR_PERSISTENT_MIN: u32 = 0x10F;
pub const TPM_PT_HR_LOADED_MIN: u32 = 0x110;
pub const TPM_PT_ACTIVE_SESSIONS_MAX: u32 = 0x111;
pub const TPM_PT_PCR_COUNT: u32 = 0x112;
pub const TPM_PT_PCR_SELECT_MIN: u32 = 0x113;
pub const TPM_PT_CONTEXT_GAP_MAX: u32 = 0x114;
pub const TPM_PT_NV_INDEX_MAX: u32 = 0x117;
pub const TPM_PT_CLOCK_UPDATE: u32 = 0x119;
pub const TPM_PT_CONTEXT_HASH: u32 = 0x11A;
pub const TPM_PT_CONTEXT_SYM: u32 = 0x11B;
pub const TPM_PT_CONTEXT_SYM_SIZE: u32 = 0x11C;
pub const TPM_PT_MAX_COMMAND_SIZE: u32 = 0x11E;
pub const TPM_PT_MAX_RESPONSE_SIZE: u32 = 0x11F;
pub const TPM_PT_MAX_DIGEST: u32 = 0x120;
pub const TPM_PT_TOTAL_COMMANDS: u32 = 0x129;
pub const TPM_PT_LIBRARY_COMMANDS: u32 = 0x12A;
pub const TPM_PT_NV_BUFFER_MAX: u32 = 0x12C;
// Variable properties
pub const TPM_PT_PERMANENT: u32 = 0x200;
pub const TPM_PT_STARTUP_CLEAR: u32 = 0x201;
pub const TPM_PT_HR_NV_INDEX: u32 = 0x202;
pub const TPM_PT_HR_LOADED: u32 = 0x203;
pub const TPM_PT_HR_LOADED_AVAIL: u32 = 0x204;
pub const TPM_PT_HR_ACTIVE: u32 = 0x205;
pub const TPM_PT_HR_ACTIVE_AVAIL: u32 = 0x206;
pub const TPM_PT_HR_TRANSIENT_AVAIL: u32 = 0x207;
pub const TPM_PT_HR_PERSISTENT: u32 = 0x208;
pub const TPM_PT_LOCKOUT_COUNTER: u32 = 0x20E;
pub const TPM_PT_MAX_AUTH_FAIL: u32 = 0x20F;
pub const TPM_PT_LOCKOUT_INTERVAL: u32 = 0x210;
pub const TPM_PT_LOCKOUT_RECOVERY: u32 = 0x211;
pub const TPM_PT_AUDIT_COUNTER_0: u32 = 0x213;
pub const TPM_PT_AUDIT_COUNTER_1: u32 = 0x214;

pub const TPM_SPEC_FAMILY: u32 = 0x322E_3000;
pub const TPM_SPEC_LEVEL: u32 = 0;
pub const TPM_SPEC_VERSION: u32 = 159;
pub const TPM_SPEC_YEAR: u32 = 2019;
pub const TPM_SPEC_DAY_OF_YEAR: u32 = 312;

bitflags! {
    /// TPMA_SESSION
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SessionAttributes: u8 {
        const CONTINUE_SESSION = 1 << 0;
        const AUDIT_EXCLUSIVE = 1 << 1;
        const AUDIT_RESET = 1 << 2;
        const DECRYPT = 1 << 5;
        const ENCRYPT = 1 << 6;
        const AUDIT = 1 << 7;
    }
}

impl SessionAttributes {
    pub const RESERVED: u8 = 0x18;
}

bitflags! {
    /// TPMA_OBJECT
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ObjectAttributes: u32 {
        const FIXED_TPM = 1 << 1;
        const ST_CLEAR = 1 << 2;
        const FIXED_PARENT = 1 << 4;
        const SENSITIVE_DATA_ORIGIN = 1 << 5;
        const USER_WITH_AUTH = 1 << 6;
        const ADMIN_WITH_POLICY = 1 << 7;
        const NO_DA = 1 << 10;
        const ENCRYPTED_DUPLICATION = 1 << 11;
        const RESTRICTED = 1 << 16;
        const DECRYPT = 1 << 17;
        const SIGN_ENCRYPT = 1 << 18;
    }
}

impl ObjectAttributes {
    /// Bits that must be zero in a TPMA_OBJECT.
    pub const RESERVED: u32 = 0xFFF8_F309;
}

/// TPMA_NV, with the index type packed in bits 4..8.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct NvAttributes {
    pub ppwrite: bool,
    pub ownerwrite: bool,
    pub authwrite: bool,
    pub policywrite: bool,
    #[bits(4)]
    pub nt: u8,
    #[bits(2)]
    __: u8,
    pub policy_delete: bool,
    pub writelocked: bool,
    pub writeall: bool,
    pub writedefine: bool,
    pub write_stclear: bool,
    pub globallock: bool,
    pub ppread: bool,
    pub ownerread: bool,
    pub authread: bool,
    pub policyread: bool,
    #[bits(5)]
    __: u8,
    pub no_da: bool,
    pub orderly: bool,
    pub clear_stclear: bool,
    pub readlocked: bool,
    pub written: bool,
    pub platformcreate: bool,
    pub read_stclear: bool,
}

impl NvAttributes {
    /// Bits that must be zero in a TPMA_NV.
    pub const RESERVED: u32 = 0x01F0_0300;
    /// TPM_NT_ORDINARY
    pub const NT_ORDINARY: u8 = 0;
}

// TPMA_PERMANENT
pub const PERMANENT_OWNER_AUTH_SET: u32 = 1 << 0;
pub const PERMANENT_ENDORSEMENT_AUTH_SET: u32 = 1 << 1;
pub const PERMANENT_LOCKOUT_AUTH_SET: u32 = 1 << 2;
pub const PERMANENT_DISABLE_CLEAR: u32 = 1 << 8;
pub const PERMANENT_IN_LOCKOUT: u32 = 1 << 9;
pub const PERMANENT_TPM_GENERATED_EPS: u32 = 1 << 10;

// TPMA_STARTUP_CLEAR
pub const STARTUP_CLEAR_PH_ENABLE: u32 = 1 << 0;
pub const STARTUP_CLEAR_SH_ENABLE: u32 = 1 << 1;
pub const STARTUP_CLEAR_EH_ENABLE: u32 = 1 << 2;
pub const STARTUP_CLEAR_PH_ENABLE_NV: u32 = 1 << 3;
pub const STARTUP_CLEAR_ORDERLY: u32 = 1 << 31;

/// TPM_CC values of the commands known to the command table.
pub mod cc {
    pub const FIRST: u32 = 0x0000_011F;
    pub const EVICT_CONTROL: u32 = 0x0000_0120;
    pub const HIERARCHY_CONTROL: u32 = 0x0000_0121;
    pub const NV_UNDEFINE_SPACE: u32 = 0x0000_0122;
    pub const CLEAR: u32 = 0x0000_0126;
    pub const CLEAR_CONTROL: u32 = 0x0000_0127;
    pub const CLOCK_SET: u32 = 0x0000_0128;
    pub const HIERARCHY_CHANGE_AUTH: u32 = 0x0000_0129;
    pub const NV_DEFINE_SPACE: u32 = 0x0000_012A;
    pub const PCR_ALLOCATE: u32 = 0x0000_012B;
    pub const PP_COMMANDS: u32 = 0x0000_012D;
    pub const SET_PRIMARY_POLICY: u32 = 0x0000_012E;
    pub const NV_WRITE: u32 = 0x0000_0137;
    pub const DICTIONARY_ATTACK_LOCK_RESET: u32 = 0x0000_0139;
    pub const DICTIONARY_ATTACK_PARAMETERS: u32 = 0x0000_013A;
    pub const PCR_RESET: u32 = 0x0000_013D;
    pub const SEQUENCE_COMPLETE: u32 = 0x0000_013E;
    pub const SET_COMMAND_CODE_AUDIT_STATUS: u32 = 0x0000_0140;
    pub const SELF_TEST: u32 = 0x0000_0143;
    pub const STARTUP: u32 = 0x0000_0144;
    pub const SHUTDOWN: u32 = 0x0000_0145;
    pub const STIR_RANDOM: u32 = 0x0000_0146;
    pub const NV_READ: u32 = 0x0000_014E;
    pub const UNSEAL: u32 = 0x0000_015E;
    pub const HMAC_START: u32 = 0x0000_015B;
    pub const SEQUENCE_UPDATE: u32 = 0x0000_015C;
    pub const CONTEXT_LOAD: u32 = 0x0000_0161;
    pub const CONTEXT_SAVE: u32 = 0x0000_0162;
    pub const FLUSH_CONTEXT: u32 = 0x0000_0165;
    pub const LOAD_EXTERNAL: u32 = 0x0000_0167;
    pub const NV_READ_PUBLIC: u32 = 0x0000_0169;
    pub const POLICY_AUTH_VALUE: u32 = 0x0000_016B;
    pub const POLICY_COMMAND_CODE: u32 = 0x0000_016C;
    pub const READ_PUBLIC: u32 = 0x0000_0173;
    pub const START_AUTH_SESSION: u32 = 0x0000_0176;
    pub const GET_CAPABILITY: u32 = 0x0000_017A;
    pub const GET_RANDOM: u32 = 0x0000_017B;
    pub const GET_TEST_RESULT: u32 = 0x0000_017C;
    pub const HASH: u32 = 0x0000_017D;
    pub const PCR_READ: u32 = 0x0000_017E;
    pub const POLICY_RESTART: u32 = 0x0000_0180;
    pub const READ_CLOCK: u32 = 0x0000_0181;
    pub const PCR_EXTEND: u32 = 0x0000_0182;
    pub const EVENT_SEQUENCE_COMPLETE: u32 = 0x0000_0185;
    pub const HASH_SEQUENCE_START: u32 = 0x0000_0186;
    pub const POLICY_GET_DIGEST: u32 = 0x0000_0189;
    pub const POLICY_PASSWORD: u32 = 0x0000_018C;
    pub const LAST: u32 = 0x0000_019F;
}

/// Number of command codes covered by the audit and PP bitmaps.
pub const CC_BITMAP_BITS: usize = (cc::LAST - cc::FIRST + 1) as usize;
/// Size in bytes of the audit and PP bitmaps.
pub const CC_BITMAP_BYTES: usize = CC_BITMAP_BITS.div_ceil(8);
