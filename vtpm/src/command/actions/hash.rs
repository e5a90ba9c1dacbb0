// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Hash, HMAC and event sequences.

use crate::command::{Request, Response};
use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::marshal::{marshal_bytes, Marshal, Tpm2bAuth, Tpm2bDigest, Tpm2bMaxBuffer, Unmarshal};
use crate::object::{KeyedHashScheme, ObjectSlot, SequenceKind, SequenceObject};
use crate::pcr::{can_extend, DigestValues, TaggedHash};
use crate::rc::{ParamExt, TpmRc, TpmReqError};
use crate::types::*;
use alloc::vec::Vec;

/// TPMT_TK_HASHCHECK
#[derive(Debug)]
struct HashCheckTicket {
    hierarchy: u32,
    digest: Vec<u8>,
}

impl HashCheckTicket {
    fn null() -> Self {
        Self {
            hierarchy: TPM_RH_NULL,
            digest: Vec::new(),
        }
    }
}

impl Marshal for HashCheckTicket {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        TPM_ST_HASHCHECK.marshal(out) + self.hierarchy.marshal(out) + marshal_bytes(&self.digest, out)
    }
}

fn unmarshal_hierarchy(req: &mut Request<'_>, n: usize) -> Result<u32, TpmReqError> {
    let hierarchy = req.params.u32().param(n)?;
    if !matches!(
        hierarchy,
        TPM_RH_OWNER | TPM_RH_ENDORSEMENT | TPM_RH_PLATFORM | TPM_RH_NULL
    ) {
        return Err(TpmReqError::value().param(n));
    }
    Ok(hierarchy)
}

impl Engine {
    /// Ticket proving that `digest` was computed by this TPM over data
    /// that did not start with TPM_GENERATED_VALUE.
    fn hash_ticket(&self, alg: HashAlg, hierarchy: u32, digest: &[u8], allowed: bool) -> HashCheckTicket {
        if hierarchy == TPM_RH_NULL || !allowed {
            return HashCheckTicket::null();
        }
        let proof = self.hierarchy_proof(hierarchy);
        HashCheckTicket {
            hierarchy,
            digest: alg.hmac(proof, &[&TPM_ST_HASHCHECK.to_be_bytes()[..], digest]),
        }
    }
}

fn allowed_in_ticket(data: &[u8]) -> bool {
    !data.starts_with(&TPM_GENERATED_VALUE.to_be_bytes())
}

/// TPM2_Hash.
pub(crate) fn hash(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let data = Tpm2bMaxBuffer::unmarshal(&mut req.params).param(1)?;
    let alg = HashAlg::unmarshal(&mut req.params).param(2)?;
    let hierarchy = unmarshal_hierarchy(req, 3)?;
    req.finish()?;
    if !engine.hierarchy_enabled(hierarchy) {
        return Err(TpmReqError::hierarchy().param(3));
    }

    let digest = alg.digest(&[data.as_slice()]);
    let ticket = engine.hash_ticket(alg, hierarchy, &digest, allowed_in_ticket(&data));
    marshal_bytes(&digest, &mut rsp.params);
    ticket.marshal(&mut rsp.params);
    Ok(())
}

/// TPM2_HashSequenceStart. TPM_ALG_NULL starts an event sequence.
pub(crate) fn hash_sequence_start(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let auth = Tpm2bAuth::unmarshal(&mut req.params).param(1)?;
    let alg = HashAlg::unmarshal_or_null(&mut req.params).param(2)?;
    req.finish()?;

    let kind = match alg {
        Some(alg) => {
            if auth.len() > alg.digest_size() {
                return Err(TpmReqError::size().param(1));
            }
            SequenceKind::Hash(alg)
        }
        None => SequenceKind::Event,
    };
    let slot = ObjectSlot::Sequence(SequenceObject::new(kind, auth));
    rsp.handle = Some(engine.objects.insert(slot)?);
    Ok(())
}

/// TPM2_HMAC_Start. The key is a KEYEDHASH signing object; its scheme
/// picks the hash unless the caller names one.
pub(crate) fn hmac_start(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let auth = Tpm2bAuth::unmarshal(&mut req.params).param(1)?;
    let requested = HashAlg::unmarshal_or_null(&mut req.params).param(2)?;
    req.finish()?;

    let object = engine
        .objects
        .object(req.handles[0])
        .ok_or_else(|| TpmReqError::type_error().at_handle(1))?;
    let attrs = object.public.attributes;
    if !attrs.contains(ObjectAttributes::SIGN_ENCRYPT)
        || attrs.intersects(ObjectAttributes::RESTRICTED | ObjectAttributes::DECRYPT)
    {
        return Err(TpmReqError::rc(TpmRc::KEY).at_handle(1));
    }
    let alg = match (object.public.scheme, requested) {
        (KeyedHashScheme::Hmac(alg), None) => alg,
        (KeyedHashScheme::Hmac(alg), Some(req_alg)) if alg == req_alg => alg,
        (KeyedHashScheme::Null, Some(req_alg)) => req_alg,
        (KeyedHashScheme::Xor { .. }, _) => {
            return Err(TpmReqError::rc(TpmRc::SCHEME).at_handle(1));
        }
        _ => return Err(TpmReqError::value().param(2)),
    };
    if auth.len() > alg.digest_size() {
        return Err(TpmReqError::size().param(1));
    }
    let key = object
        .sensitive
        .as_ref()
        .ok_or_else(|| TpmReqError::rc(TpmRc::KEY).at_handle(1))?
        .data
        .clone();

    let slot = ObjectSlot::Sequence(SequenceObject::new(SequenceKind::Hmac { alg, key }, auth));
    rsp.handle = Some(engine.objects.insert(slot)?);
    Ok(())
}

fn sequence_mut<'a>(
    engine: &'a mut Engine,
    handle: u32,
    n: usize,
) -> Result<&'a mut SequenceObject, TpmReqError> {
    engine
        .objects
        .get_mut(handle)
        .and_then(ObjectSlot::as_sequence_mut)
        .ok_or_else(|| TpmReqError::rc(TpmRc::MODE).at_handle(n))
}

/// TPM2_SequenceUpdate.
pub(crate) fn sequence_update(
    engine: &mut Engine,
    req: &mut Request<'_>,
    _rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let buffer = Tpm2bMaxBuffer::unmarshal(&mut req.params).param(1)?;
    req.finish()?;
    let max = engine.config.max_sequence_size;
    sequence_mut(engine, req.handles[0], 1)?.update(&buffer, max)
}

/// TPM2_SequenceComplete. Completes a hash or HMAC sequence and flushes
/// it.
pub(crate) fn sequence_complete(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let buffer = Tpm2bMaxBuffer::unmarshal(&mut req.params).param(1)?;
    let hierarchy = unmarshal_hierarchy(req, 2)?;
    req.finish()?;

    let handle = req.handles[0];
    let max = engine.config.max_sequence_size;
    let seq = sequence_mut(engine, handle, 1)?;
    if seq.kind == SequenceKind::Event {
        return Err(TpmReqError::rc(TpmRc::MODE).at_handle(1));
    }
    seq.update(&buffer, max)?;
    let kind = seq.kind.clone();
    let allowed = seq.ticket_allowed();
    let data = core::mem::take(&mut seq.data);

    let (result, ticket) = match kind {
        SequenceKind::Hash(alg) => {
            let digest = alg.digest(&[data.as_slice()]);
            let ticket = engine.hash_ticket(alg, hierarchy, &digest, allowed);
            (digest, ticket)
        }
        SequenceKind::Hmac { alg, key } => (
            alg.hmac(&key, &[data.as_slice()]),
            HashCheckTicket::null(),
        ),
        SequenceKind::Event => return Err(TpmReqError::rc(TpmRc::MODE).at_handle(1)),
    };
    engine.objects.remove(handle);

    Tpm2bDigest::from_vec(result)?.marshal(&mut rsp.params);
    ticket.marshal(&mut rsp.params);
    Ok(())
}

/// TPM2_EventSequenceComplete. Digests the event in every implemented
/// hash and extends the digests into the PCR unless it is TPM_RH_NULL.
pub(crate) fn event_sequence_complete(
    engine: &mut Engine,
    req: &mut Request<'_>,
    rsp: &mut Response,
) -> Result<(), TpmReqError> {
    let buffer = Tpm2bMaxBuffer::unmarshal(&mut req.params).param(1)?;
    req.finish()?;

    let pcr_handle = req.handles[0];
    let handle = req.handles[1];
    if pcr_handle != TPM_RH_NULL && !can_extend(pcr_handle as usize, engine.platform.locality()) {
        return Err(TpmReqError::rc(TpmRc::LOCALITY));
    }
    let max = engine.config.max_sequence_size;
    let seq = sequence_mut(engine, handle, 2)?;
    if seq.kind != SequenceKind::Event {
        return Err(TpmReqError::rc(TpmRc::MODE).at_handle(2));
    }
    seq.update(&buffer, max)?;
    let data = core::mem::take(&mut seq.data);
    let digests = DigestValues(
        HashAlg::ALL
            .into_iter()
            .map(|alg| TaggedHash {
                alg,
                digest: alg.digest(&[data.as_slice()]),
            })
            .collect(),
    );

    if pcr_handle != TPM_RH_NULL {
        let pcr = pcr_handle as usize;
        for value in digests.0.iter() {
            engine.pcrs.extend(pcr, value.alg, &value.digest);
        }
        engine.pcr_changed(pcr);
    }
    engine.objects.remove(handle);

    digests.marshal(&mut rsp.params);
    Ok(())
}
