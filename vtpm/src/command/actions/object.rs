// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! KEYEDHASH object commands.
//!
//! Objects only enter the TPM through TPM2_LoadExternal. A loaded object
//! can be made persistent with TPM2_EvictControl, which stores it as an NV
//! entry under its persistent handle.

use crate::command::{Request, Response};
use crate::engine::Engine;
use crate::marshal::{marshal_sized, unmarshal_sized, Cursor, Marshal, Tpm2bName, Unmarshal};
use crate::nv::NvUpdate;
use crate::object::{Object, ObjectSlot, PublicArea, SensitiveArea};
use crate::rc::{ParamExt, TpmRc, TpmReqError};
use crate::types::*;
use alloc::vec::Vec;

/// Decodes a TPM2B_SENSITIVE, which may be empty.
fn unmarshal_optional_sensitive(
    cur: &mut Cursor<'_>,
) -> Result<Option<SensitiveArea>, TpmReqError> {
    let size = usize::from(cur.u16().param(1)?);
    if size == 0 {
        return Ok(None);
    }
    let mut inner = Cursor::new(cur.take(size).param(1)?);
    let sensitive = SensitiveArea::unmarshal(&mut inner).param(1)?;
    inner.end().param(1)?;
    Ok(Some(sensitive))
}

/// TPM2_LoadExternal.
pub(crate) fn load_external(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let sensitive = unmarshal_optional_sensitive(&mut req.params)?;
    let public = unmarshal_sized::<PublicArea>(&mut req.params).param(2)?;
    let hierarchy = req.params.u32().param(3)?;
    req.finish()?;

    if !matches!(
        hierarchy,
        TPM_RH_OWNER | TPM_RH_ENDORSEMENT | TPM_RH_PLATFORM | TPM_RH_NULL
    ) {
        return Err(TpmReqError::value().param(3));
    }
    if !engine.hierarchy_enabled(hierarchy) {
        return Err(TpmReqError::hierarchy().param(3));
    }
    if let Some(sensitive) = &sensitive {
        let attrs = public.attributes;
        if attrs.intersects(ObjectAttributes::FIXED_TPM | ObjectAttributes::FIXED_PARENT) {
            return Err(TpmReqError::attributes().param(2));
        }
        if sensitive.auth.len() > public.name_alg.digest_size() {
            return Err(TpmReqError::size().param(1));
        }
        // unique binds the public area to the sensitive one
        let unique = public
            .name_alg
            .digest(&[sensitive.seed.as_slice(), sensitive.data.as_slice()]);
        if public.unique.as_slice() != unique.as_slice() {
            return Err(TpmReqError::rc(TpmRc::BINDING));
        }
    }

    let object = Object::new(public, sensitive, hierarchy);
    let name = object.name.clone();
    rsp.handle = Some(engine.objects.insert(ObjectSlot::Regular(object))?);
    name.marshal(&mut rsp.params);
    Ok(())
}

/// Qualified name of an object whose parent is a hierarchy.
fn qualified_name(object: &Object) -> Result<Tpm2bName, TpmReqError> {
    let alg = object.public.name_alg;
    let mut qn = alg.alg_id().to_be_bytes().to_vec();
    qn.extend_from_slice(&alg.digest(&[&object.hierarchy.to_be_bytes()[..], object.name.as_slice()]));
    Ok(Tpm2bName::from_vec(qn)?)
}

/// TPM2_ReadPublic.
pub(crate) fn read_public(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let handle = req.handles[0];
    let object = match engine.objects.get(handle) {
        Some(ObjectSlot::Regular(object)) => object,
        Some(ObjectSlot::Sequence(_)) => return Err(TpmReqError::sequence().at_handle(1)),
        None => return Err(TpmReqError::handle().at_handle(1)),
    };
    let qualified = qualified_name(object)?;
    marshal_sized(&object.public, &mut rsp.params);
    object.name.marshal(&mut rsp.params);
    qualified.marshal(&mut rsp.params);
    Ok(())
}

/// TPM2_Unseal.
pub(crate) fn unseal(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    req.finish()?;
    let object = engine
        .objects
        .object(req.handles[0])
        .ok_or_else(|| TpmReqError::type_error().at_handle(1))?;
    let attrs = object.public.attributes;
    if attrs.intersects(
        ObjectAttributes::RESTRICTED | ObjectAttributes::DECRYPT | ObjectAttributes::SIGN_ENCRYPT,
    ) {
        return Err(TpmReqError::attributes().at_handle(1));
    }
    let sensitive = object
        .sensitive
        .as_ref()
        .ok_or_else(|| TpmReqError::rc(TpmRc::AUTH_UNAVAILABLE))?;
    sensitive.data.marshal(&mut rsp.params);
    Ok(())
}

/// Whether `auth` may evict objects of `hierarchy` and use `persistent`.
fn evict_allowed(auth: u32, hierarchy: u32) -> bool {
    match auth {
        TPM_RH_PLATFORM => hierarchy == TPM_RH_PLATFORM,
        _ => matches!(hierarchy, TPM_RH_OWNER | TPM_RH_ENDORSEMENT),
    }
}

fn persistent_range_ok(auth: u32, persistent: u32) -> bool {
    if handle_type(persistent) != HT_PERSISTENT {
        return false;
    }
    match auth {
        TPM_RH_PLATFORM => persistent >= PLATFORM_PERSISTENT,
        _ => persistent < PLATFORM_PERSISTENT,
    }
}

/// TPM2_EvictControl. Evicts a transient object to `persistent`, or
/// removes the persistent object `persistent` names.
pub(crate) fn evict_control(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let auth = req.handles[0];
    let handle = req.handles[1];
    let persistent = req.params.u32().param(1)?;
    req.finish()?;

    if !persistent_range_ok(auth, persistent) {
        return Err(TpmReqError::rc(TpmRc::RANGE).param(1));
    }
    let object = match engine.objects.get(handle) {
        Some(ObjectSlot::Regular(object)) => object,
        Some(ObjectSlot::Sequence(_)) => return Err(TpmReqError::type_error().at_handle(2)),
        None => return Err(TpmReqError::handle().at_handle(2)),
    };
    if !evict_allowed(auth, object.hierarchy) {
        return Err(TpmReqError::hierarchy().at_handle(2));
    }

    let platform = &mut *engine.platform;
    if handle_type(handle) == HT_PERSISTENT {
        if handle != persistent {
            return Err(TpmReqError::handle().param(1));
        }
        if !engine.layout.remove_entry(platform, persistent)? {
            return Err(TpmReqError::handle().at_handle(2));
        }
        log::debug!("removed persistent object {:#x}", persistent);
    } else {
        if object.public.attributes.contains(ObjectAttributes::ST_CLEAR) {
            return Err(TpmReqError::attributes().at_handle(2));
        }
        if engine.layout.find_entry(platform, persistent)?.is_some() {
            return Err(TpmReqError::rc(TpmRc::NV_DEFINED));
        }
        let body: Vec<u8> = object.nv_encode();
        engine.layout.add_entry(platform, persistent, &body)?;
        log::debug!("evicted {:#x} to {:#x}", handle, persistent);
    }
    engine.nv_update.raise(NvUpdate::Nv);
    Ok(())
}
