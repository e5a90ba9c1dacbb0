// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Command actions, grouped by command family.
//!
//! An action sees its handles already resolved and authorized. It decodes
//! all of its parameters and rejects leftover bytes before touching any
//! state.

pub(super) mod audit;
pub(super) mod capability;
pub(super) mod clock;
pub(super) mod context;
pub(super) mod da;
pub(super) mod hash;
pub(super) mod hierarchy;
pub(super) mod nv;
pub(super) mod object;
pub(super) mod pcr;
pub(super) mod random;
pub(super) mod session;
pub(super) mod startup;
pub(super) mod testing;
