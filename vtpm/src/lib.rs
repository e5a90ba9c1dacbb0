// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Command execution core of a software TPM 2.0.
//!
//! The crate receives raw TPM command buffers, validates and dispatches
//! them, manages authorization sessions and keeps the persistent and
//! volatile TPM state consistent with a host-provided backing store. All
//! mutable state lives in an explicitly owned [`Engine`]; the host is
//! responsible for serializing calls into it.

#![no_std]

extern crate alloc;

pub mod command;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod failure;
pub mod marshal;
pub mod nv;
pub mod object;
pub mod pcr;
pub mod platform;
pub mod rc;
pub mod session;
pub mod state;
pub mod types;
pub mod volatile;

pub use config::TpmConfig;
pub use engine::Engine;
pub use error::TpmError;
pub use failure::FaultRecord;
pub use platform::{MemoryPlatform, NvReadyState, Platform};
pub use rc::TpmRc;
