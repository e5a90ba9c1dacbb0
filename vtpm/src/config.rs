// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

use crate::crypto::HashAlg;
use crate::error::TpmError;
use alloc::vec;
use alloc::vec::Vec;

/// Build-time shape of the TPM: table capacities, identity and optional
/// state blocks.
///
/// The capability flags (`ecc`, `command_audit`) decide which optional
/// blocks appear in volatile state snapshots. A snapshot taken with one
/// setting is rejected by an engine configured with the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TpmConfig {
    pub max_loaded_objects: usize,
    pub max_loaded_sessions: usize,
    pub max_active_sessions: usize,
    pub pcr_count: usize,
    pub max_command_size: usize,
    pub max_response_size: usize,
    pub nv_size: usize,
    pub max_nv_index_size: usize,
    pub max_sequence_size: usize,
    /// Hash algorithms with an allocated PCR bank after manufacture.
    pub pcr_banks: Vec<HashAlg>,
    pub manufacturer: u32,
    pub vendor_strings: [u32; 4],
    pub firmware_version: (u32, u32),
    /// ECC commit state is present.
    pub ecc: bool,
    /// Command audit digest state is present.
    pub command_audit: bool,
}

/// "IBM " in ASCII, as used by most software TPMs.
const DEFAULT_MANUFACTURER: u32 = 0x4942_4D20;

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            max_loaded_objects: 3,
            max_loaded_sessions: 3,
            max_active_sessions: 64,
            pcr_count: 24,
            max_command_size: 4096,
            max_response_size: 4096,
            nv_size: 16 * 1024,
            max_nv_index_size: 2048,
            max_sequence_size: 64 * 1024,
            pcr_banks: vec![HashAlg::Sha256],
            manufacturer: DEFAULT_MANUFACTURER,
            vendor_strings: [
                u32::from_be_bytes(*b"SW  "),
                u32::from_be_bytes(*b" TPM"),
                0,
                0,
            ],
            firmware_version: (0x2019_1023, 0x0016_3636),
            ecc: true,
            command_audit: true,
        }
    }
}

/// PCR select bitmaps are always this many octets.
pub const PCR_SELECT_SIZE: usize = 3;

impl TpmConfig {
    /// Rejects configurations the state layout cannot represent.
    pub fn validate(&self) -> Result<(), TpmError> {
        if self.max_loaded_objects == 0 || self.max_loaded_objects > 0xFF {
            return Err(TpmError::Config("max_loaded_objects"));
        }
        if self.max_loaded_sessions == 0
            || self.max_loaded_sessions > self.max_active_sessions
            || self.max_active_sessions > 0xFF
        {
            return Err(TpmError::Config("session capacities"));
        }
        if self.pcr_count == 0 || self.pcr_count > PCR_SELECT_SIZE * 8 {
            return Err(TpmError::Config("pcr_count"));
        }
        if self.pcr_banks.is_empty() {
            return Err(TpmError::Config("pcr_banks"));
        }
        if self.max_command_size < 64 || self.max_response_size < 64 {
            return Err(TpmError::Config("buffer sizes"));
        }
        if self.max_nv_index_size > 0xFFFF {
            return Err(TpmError::Config("max_nv_index_size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(TpmConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_capacities() {
        let config = TpmConfig {
            max_loaded_sessions: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TpmConfig {
            pcr_count: 25,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
