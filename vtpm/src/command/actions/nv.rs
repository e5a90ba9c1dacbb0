// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! NV index commands. Only ordinary indices are supported.
//!
//! An index lives in an NV entry. The data of an ORDERLY index is kept in
//! the index cache instead and reaches NV with the orderly data.

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::marshal::{marshal_bytes, marshal_sized, unmarshal_sized, Tpm2bAuth, Tpm2bMaxNvBuffer, Unmarshal};
use crate::nv::{NvIndex, NvPublic, NvUpdate};
use crate::rc::{ParamExt, TpmRc, TpmReqError};
use crate::types::*;

impl Engine {
    /// Looks up an index that is accessible with the current hierarchy
    /// enables.
    fn accessible_index(&self, handle: u32, n: usize) -> Result<NvIndex, TpmReqError> {
        let index = self.nv_index(handle).map_err(|e| e.at_handle(n))?;
        let enabled = if index.public.attributes.platformcreate() {
            self.gc.ph_enable_nv
        } else {
            self.gc.sh_enable
        };
        if !enabled {
            return Err(TpmReqError::handle().at_handle(n));
        }
        Ok(index)
    }

    /// Writes back the attributes and, for non-ORDERLY indices, the data.
    fn store_index(&mut self, index: &NvIndex) -> Result<(), TpmReqError> {
        self.layout
            .update_entry(&mut *self.platform, index.public.nv_index, &index.encode())?;
        self.nv_update.raise(NvUpdate::Nv);
        Ok(())
    }

    /// Updates the data of `index`, wherever it lives.
    fn store_index_data(&mut self, index: &NvIndex, attrs_changed: bool) -> Result<(), TpmReqError> {
        if !index.is_orderly() {
            return self.store_index(index);
        }
        let handle = index.public.nv_index;
        let cached = self
            .index_cache
            .get_mut(handle)
            .ok_or_else(TpmReqError::handle)?;
        cached.clone_from(&index.data);
        self.nv_update.raise(NvUpdate::Orderly);
        if attrs_changed {
            self.store_index(index)?;
        }
        Ok(())
    }

    /// Startup(CLEAR) processing: releases the STCLEAR locks and clears
    /// the written flag of CLEAR_STCLEAR indices.
    pub(super) fn nv_startup_clear(&mut self) -> Result<(), TpmReqError> {
        let entries = self.layout.entries(&*self.platform)?;
        for entry in entries {
            if handle_type(entry.handle) != HT_NV_INDEX {
                continue;
            }
            let mut index = NvIndex::decode(&entry.body)?;
            let old = index.public.attributes;
            let mut attrs = old;
            if attrs.write_stclear() {
                attrs.set_writelocked(false);
            }
            if attrs.read_stclear() {
                attrs.set_readlocked(false);
            }
            if attrs.clear_stclear() {
                attrs.set_written(false);
            }
            if attrs != old {
                index.public.attributes = attrs;
                self.layout
                    .update_entry(&mut *self.platform, entry.handle, &index.encode())?;
                self.nv_update.raise(NvUpdate::Nv);
            }
        }
        Ok(())
    }

    /// Removes every owner index and every owner persistent object.
    pub(super) fn nv_clear_owner(&mut self) -> Result<(), TpmReqError> {
        let entries = self.layout.entries(&*self.platform)?;
        for entry in entries {
            let remove = match handle_type(entry.handle) {
                HT_NV_INDEX => {
                    let index = NvIndex::decode(&entry.body)?;
                    if index.public.attributes.platformcreate() {
                        false
                    } else {
                        if index.is_orderly() {
                            self.index_cache.remove(entry.handle);
                            self.nv_update.raise(NvUpdate::Orderly);
                        }
                        true
                    }
                }
                HT_PERSISTENT => entry.handle < PLATFORM_PERSISTENT,
                _ => false,
            };
            if remove {
                self.layout.remove_entry(&mut *self.platform, entry.handle)?;
                self.nv_update.raise(NvUpdate::Nv);
            }
        }
        Ok(())
    }
}

fn check_new_public(public: &NvPublic, platform: bool) -> Result<(), TpmReqError> {
    let attrs = public.attributes;
    let bad_attrs = || Err(TpmReqError::attributes().param(2));
    if attrs.nt() != NvAttributes::NT_ORDINARY {
        return bad_attrs();
    }
    if attrs.written() || attrs.writelocked() || attrs.readlocked() || attrs.policy_delete() {
        return bad_attrs();
    }
    if attrs.platformcreate() != platform {
        return bad_attrs();
    }
    if !(attrs.ppwrite() || attrs.ownerwrite() || attrs.authwrite() || attrs.policywrite()) {
        return bad_attrs();
    }
    if !(attrs.ppread() || attrs.ownerread() || attrs.authread() || attrs.policyread()) {
        return bad_attrs();
    }
    if !public.auth_policy.is_empty() && public.auth_policy.len() != public.name_alg.digest_size() {
        return Err(TpmReqError::size().param(2));
    }
    Ok(())
}

/// TPM2_NV_DefineSpace.
pub(crate) fn define_space(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let auth_handle = req.handles[0];
    let auth = Tpm2bAuth::unmarshal(&mut req.params).param(1)?;
    let public = unmarshal_sized::<NvPublic>(&mut req.params).param(2)?;
    req.finish()?;

    let platform = auth_handle == TPM_RH_PLATFORM;
    check_new_public(&public, platform)?;
    if usize::from(public.data_size) > engine.config.max_nv_index_size {
        return Err(TpmReqError::size().param(2));
    }
    if auth.len() > public.name_alg.digest_size() {
        return Err(TpmReqError::size().param(1));
    }
    if platform && !engine.gc.ph_enable_nv {
        return Err(TpmReqError::hierarchy().at_handle(1));
    }
    let handle = public.nv_index;
    if engine.layout.find_entry(&*engine.platform, handle)?.is_some() {
        return Err(TpmReqError::rc(TpmRc::NV_DEFINED));
    }

    let index = NvIndex {
        data: alloc::vec![0u8; usize::from(public.data_size)],
        public,
        auth,
    };
    if index.is_orderly() {
        engine.index_cache.insert(handle, index.data.len())?;
    }
    if let Err(err) = engine.layout.add_entry(&mut *engine.platform, handle, &index.encode()) {
        engine.index_cache.remove(handle);
        return Err(err.into());
    }
    engine.nv_update.raise(if index.is_orderly() {
        NvUpdate::Orderly
    } else {
        NvUpdate::Nv
    });
    log::debug!("defined NV index {:#x}, {} bytes", handle, index.data.len());
    Ok(())
}

/// TPM2_NV_UndefineSpace.
pub(crate) fn undefine_space(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let auth_handle = req.handles[0];
    let handle = req.handles[1];
    let index = engine.accessible_index(handle, 2)?;
    let attrs = index.public.attributes;
    if attrs.platformcreate() != (auth_handle == TPM_RH_PLATFORM) {
        return Err(TpmReqError::rc(TpmRc::NV_AUTHORIZATION));
    }
    if attrs.policy_delete() {
        return Err(TpmReqError::attributes().at_handle(2));
    }

    engine.layout.remove_entry(&mut *engine.platform, handle)?;
    engine.nv_update.raise(NvUpdate::Nv);
    if index.is_orderly() {
        engine.index_cache.remove(handle);
        engine.nv_update.raise(NvUpdate::Orderly);
    }
    Ok(())
}

/// Whether `auth_handle` may write `index`.
fn write_allowed(index: &NvIndex, auth_handle: u32) -> bool {
    let attrs = index.public.attributes;
    match auth_handle {
        TPM_RH_OWNER => attrs.ownerwrite(),
        TPM_RH_PLATFORM => attrs.ppwrite(),
        _ => attrs.authwrite() || attrs.policywrite(),
    }
}

fn read_allowed(index: &NvIndex, auth_handle: u32) -> bool {
    let attrs = index.public.attributes;
    match auth_handle {
        TPM_RH_OWNER => attrs.ownerread(),
        TPM_RH_PLATFORM => attrs.ppread(),
        _ => attrs.authread() || attrs.policyread(),
    }
}

/// The auth handle of NV_Read and NV_Write must be the owner, the
/// platform or the index itself.
fn check_auth_handle(auth_handle: u32, handle: u32) -> Result<(), TpmReqError> {
    if handle_type(auth_handle) == HT_NV_INDEX && auth_handle != handle {
        return Err(TpmReqError::rc(TpmRc::NV_AUTHORIZATION));
    }
    Ok(())
}

/// TPM2_NV_Write.
pub(crate) fn write(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let data = Tpm2bMaxNvBuffer::unmarshal(&mut req.params).param(1)?;
    let offset = usize::from(req.params.u16().param(2)?);
    req.finish()?;

    let auth_handle = req.handles[0];
    let handle = req.handles[1];
    check_auth_handle(auth_handle, handle)?;
    let mut index = engine.accessible_index(handle, 2)?;
    let attrs = index.public.attributes;
    if attrs.writelocked() {
        return Err(TpmReqError::rc(TpmRc::NV_LOCKED));
    }
    if !write_allowed(&index, auth_handle) {
        return Err(TpmReqError::rc(TpmRc::NV_AUTHORIZATION));
    }
    let size = usize::from(index.public.data_size);
    if offset + data.len() > size {
        return Err(TpmReqError::rc(TpmRc::NV_RANGE));
    }
    if attrs.writeall() && (offset != 0 || data.len() != size) {
        return Err(TpmReqError::rc(TpmRc::NV_RANGE));
    }

    index.data[offset..offset + data.len()].copy_from_slice(&data);
    let first_write = !attrs.written();
    index.public.attributes.set_written(true);
    engine.store_index_data(&index, first_write)
}

/// TPM2_NV_Read.
pub(crate) fn read(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let size = usize::from(req.params.u16().param(1)?);
    let offset = usize::from(req.params.u16().param(2)?);
    req.finish()?;

    let auth_handle = req.handles[0];
    let handle = req.handles[1];
    check_auth_handle(auth_handle, handle)?;
    let index = engine.accessible_index(handle, 2)?;
    let attrs = index.public.attributes;
    if attrs.readlocked() {
        return Err(TpmReqError::rc(TpmRc::NV_LOCKED));
    }
    if !read_allowed(&index, auth_handle) {
        return Err(TpmReqError::rc(TpmRc::NV_AUTHORIZATION));
    }
    if !attrs.written() {
        return Err(TpmReqError::rc(TpmRc::NV_UNINITIALIZED));
    }
    if size > Tpm2bMaxNvBuffer::MAX {
        return Err(TpmReqError::value().param(1));
    }
    if offset + size > usize::from(index.public.data_size) {
        return Err(TpmReqError::rc(TpmRc::NV_RANGE));
    }
    marshal_bytes(&index.data[offset..offset + size], &mut rsp.params);
    Ok(())
}

/// TPM2_NV_ReadPublic.
pub(crate) fn read_public(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let index = engine.accessible_index(req.handles[0], 1)?;
    marshal_sized(&index.public, &mut rsp.params);
    marshal_bytes(&index.public.name(), &mut rsp.params);
    Ok(())
}
