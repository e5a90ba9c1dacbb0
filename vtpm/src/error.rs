// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

use crate::crypto::CryptoError;
use crate::marshal::MarshalError;
use crate::nv::NvError;
use crate::volatile::VolatileError;

// Functions private to a module may use the leaf error types. Public
// functions outside the command path return a TpmError wrapping the leaf
// error of the module that failed. Command code uses TpmReqError instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TpmError {
    // Malformed binary data
    Marshal(MarshalError),
    // Errors related to the backing store and its layout
    Nv(NvError),
    // Errors related to volatile state snapshots
    Volatile(VolatileError),
    // Errors reported by the crypto implementation
    Crypto(CryptoError),
    // The configuration cannot be represented
    Config(&'static str),
    // The engine is in failure mode
    Failed,
}

impl From<MarshalError> for TpmError {
    fn from(err: MarshalError) -> Self {
        Self::Marshal(err)
    }
}

impl From<CryptoError> for TpmError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}
