// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Loaded objects.
//!
//! Objects live in a fixed number of slots. A slot holds either a regular
//! (KEYEDHASH) object or a hash/HMAC/event sequence. The handle of a
//! loaded object is `TRANSIENT_FIRST + slot index`. Persistent objects are
//! loaded into a free slot for the duration of a single command as an
//! "evict shadow" and dropped again when the command ends.

use crate::crypto::HashAlg;
use crate::marshal::{
    Cursor, Marshal, MarshalError, Tpm2b, Tpm2bAuth, Tpm2bDigest, Tpm2bName,
    Tpm2bSensitiveData, Unmarshal,
};
use crate::nv::{NvDecoder, NvEncoder, NvError};
use crate::rc::{TpmRc, TpmReqError};
use crate::types::*;
use alloc::vec::Vec;

/// Upper bound of the data a sequence can carry in a snapshot.
const MAX_SEQUENCE_DATA: usize = 1 << 20;

/// TPMT_KEYEDHASH_SCHEME
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyedHashScheme {
    Null,
    Hmac(HashAlg),
    Xor { hash: HashAlg, kdf: u16 },
}

impl Marshal for KeyedHashScheme {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        match self {
            Self::Null => TPM_ALG_NULL.marshal(out),
            Self::Hmac(hash) => TPM_ALG_HMAC.marshal(out) + hash.marshal(out),
            Self::Xor { hash, kdf } => {
                TPM_ALG_XOR.marshal(out) + hash.marshal(out) + kdf.marshal(out)
            }
        }
    }
}

impl Unmarshal for KeyedHashScheme {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        match cur.u16()? {
            TPM_ALG_NULL => Ok(Self::Null),
            TPM_ALG_HMAC => Ok(Self::Hmac(HashAlg::unmarshal(cur)?)),
            TPM_ALG_XOR => {
                let hash = HashAlg::unmarshal(cur)?;
                let kdf = cur.u16()?;
                if kdf != TPM_ALG_KDF1_SP800_108 {
                    return Err(MarshalError::Value);
                }
                Ok(Self::Xor { hash, kdf })
            }
            _ => Err(MarshalError::Scheme),
        }
    }
}

/// TPMT_PUBLIC of a KEYEDHASH object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicArea {
    pub name_alg: HashAlg,
    pub attributes: ObjectAttributes,
    pub auth_policy: Tpm2bDigest,
    pub scheme: KeyedHashScheme,
    pub unique: Tpm2bDigest,
}

impl PublicArea {
    /// nameAlg followed by the digest of the public area.
    pub fn name(&self) -> Tpm2bName {
        let public = self.to_bytes();
        let mut name = self.name_alg.alg_id().to_be_bytes().to_vec();
        name.extend_from_slice(&self.name_alg.digest(&[public.as_slice()]));
        Tpm2bName::from_vec(name).unwrap_or_default()
    }
}

impl Marshal for PublicArea {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        TPM_ALG_KEYEDHASH.marshal(out)
            + self.name_alg.marshal(out)
            + self.attributes.bits().marshal(out)
            + self.auth_policy.marshal(out)
            + self.scheme.marshal(out)
            + self.unique.marshal(out)
    }
}

impl Unmarshal for PublicArea {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        if cur.u16()? != TPM_ALG_KEYEDHASH {
            return Err(MarshalError::Type);
        }
        let name_alg = HashAlg::unmarshal(cur)?;
        let attributes = cur.u32()?;
        if attributes & ObjectAttributes::RESERVED != 0 {
            return Err(MarshalError::ReservedBits);
        }
        Ok(Self {
            name_alg,
            attributes: ObjectAttributes::from_bits_retain(attributes),
            auth_policy: Unmarshal::unmarshal(cur)?,
            scheme: Unmarshal::unmarshal(cur)?,
            unique: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// TPMT_SENSITIVE of a KEYEDHASH object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensitiveArea {
    pub auth: Tpm2bAuth,
    pub seed: Tpm2bDigest,
    pub data: Tpm2bSensitiveData,
}

impl Marshal for SensitiveArea {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        TPM_ALG_KEYEDHASH.marshal(out)
            + self.auth.marshal(out)
            + self.seed.marshal(out)
            + self.data.marshal(out)
    }
}

impl Unmarshal for SensitiveArea {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        if cur.u16()? != TPM_ALG_KEYEDHASH {
            return Err(MarshalError::Type);
        }
        Ok(Self {
            auth: Unmarshal::unmarshal(cur)?,
            seed: Unmarshal::unmarshal(cur)?,
            data: Unmarshal::unmarshal(cur)?,
        })
    }
}

/// A regular loaded object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub public: PublicArea,
    /// Absent for public-only objects
    pub sensitive: Option<SensitiveArea>,
    pub name: Tpm2bName,
    pub hierarchy: u32,
    /// Persistent handle if this is the shadow of an evicted object
    pub evict_handle: Option<u32>,
}

impl Object {
    pub fn new(public: PublicArea, sensitive: Option<SensitiveArea>, hierarchy: u32) -> Self {
        Self {
            name: public.name(),
            public,
            sensitive,
            hierarchy,
            evict_handle: None,
        }
    }

    pub fn is_da_protected(&self) -> bool {
        !self.public.attributes.contains(ObjectAttributes::NO_DA)
    }

    /// Body of the NV entry holding this object once it is evicted.
    pub fn nv_encode(&self) -> Vec<u8> {
        let mut enc = NvEncoder::new();
        let public = self.public.to_bytes();
        enc.u32(self.hierarchy);
        enc.u16(public.len() as u16);
        enc.bytes(&public);
        match &self.sensitive {
            Some(sensitive) => {
                let sensitive = sensitive.to_bytes();
                enc.bool(true);
                enc.u16(sensitive.len() as u16);
                enc.bytes(&sensitive);
            }
            None => enc.bool(false),
        }
        enc.finish()
    }

    pub fn nv_decode(body: &[u8], handle: u32) -> Result<Self, NvError> {
        let mut dec = NvDecoder::new(body);
        let hierarchy = dec.u32()?;
        let len = usize::from(dec.u16()?);
        let public = PublicArea::unmarshal(&mut Cursor::new(dec.bytes(len)?))
            .map_err(|_| NvError::Corrupt)?;
        let sensitive = if dec.bool()? {
            let len = usize::from(dec.u16()?);
            Some(
                SensitiveArea::unmarshal(&mut Cursor::new(dec.bytes(len)?))
                    .map_err(|_| NvError::Corrupt)?,
            )
        } else {
            None
        };
        let mut object = Self::new(public, sensitive, hierarchy);
        object.evict_handle = Some(handle);
        Ok(object)
    }
}

/// What a sequence object accumulates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequenceKind {
    Hash(HashAlg),
    Hmac { alg: HashAlg, key: Tpm2bSensitiveData },
    /// Digests in every implemented hash for an event
    Event,
}

/// A hash, HMAC or event sequence in progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceObject {
    pub kind: SequenceKind,
    pub auth: Tpm2bAuth,
    pub data: Vec<u8>,
}

impl SequenceObject {
    pub fn new(kind: SequenceKind, auth: Tpm2bAuth) -> Self {
        Self {
            kind,
            auth,
            data: Vec::new(),
        }
    }

    /// Appends `data`, bounded by `max` bytes in total.
    pub fn update(&mut self, data: &[u8], max: usize) -> Result<(), TpmReqError> {
        if self.data.len() + data.len() > max {
            return Err(TpmReqError::rc(TpmRc::MEMORY));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Data starting with the TPM-generated marker never gets a ticket.
    pub fn ticket_allowed(&self) -> bool {
        !self.data.starts_with(&TPM_GENERATED_VALUE.to_be_bytes())
    }
}

/// Contents of an object slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectSlot {
    Regular(Object),
    Sequence(SequenceObject),
}

impl ObjectSlot {
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Regular(object) => Some(object),
            Self::Sequence(_) => None,
        }
    }

    pub fn as_sequence_mut(&mut self) -> Option<&mut SequenceObject> {
        match self {
            Self::Regular(_) => None,
            Self::Sequence(seq) => Some(seq),
        }
    }

    pub fn hierarchy(&self) -> u32 {
        match self {
            Self::Regular(object) => object.hierarchy,
            Self::Sequence(_) => TPM_RH_NULL,
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self, Self::Regular(Object { evict_handle: Some(_), .. }))
    }

    /// Name used in command parameter hashes.
    pub fn name(&self, handle: u32) -> Vec<u8> {
        match self {
            Self::Regular(object) => object.name.to_vec(),
            Self::Sequence(_) => handle.to_be_bytes().to_vec(),
        }
    }

    /// Authorization value of the slot, if one is available.
    pub fn auth(&self) -> Option<&[u8]> {
        match self {
            Self::Regular(object) => object.sensitive.as_ref().map(|s| s.auth.as_slice()),
            Self::Sequence(seq) => Some(&seq.auth),
        }
    }
}

const SLOT_REGULAR: u8 = 0;
const SLOT_SEQUENCE: u8 = 1;
const SEQ_HASH: u8 = 0;
const SEQ_HMAC: u8 = 1;
const SEQ_EVENT: u8 = 2;

impl Marshal for ObjectSlot {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        match self {
            Self::Regular(object) => {
                SLOT_REGULAR.marshal(out)
                    + object.public.marshal(out)
                    + object.sensitive.marshal(out)
                    + object.hierarchy.marshal(out)
                    + object.evict_handle.marshal(out)
            }
            Self::Sequence(seq) => {
                let mut len = SLOT_SEQUENCE.marshal(out);
                len += match &seq.kind {
                    SequenceKind::Hash(alg) => SEQ_HASH.marshal(out) + alg.marshal(out),
                    SequenceKind::Hmac { alg, key } => {
                        SEQ_HMAC.marshal(out) + alg.marshal(out) + key.marshal(out)
                    }
                    SequenceKind::Event => SEQ_EVENT.marshal(out),
                };
                len + seq.auth.marshal(out)
                    + (seq.data.len() as u32).marshal(out)
                    + marshal_raw(&seq.data, out)
            }
        }
    }
}

fn marshal_raw(data: &[u8], out: &mut Vec<u8>) -> usize {
    out.extend_from_slice(data);
    data.len()
}

impl Unmarshal for ObjectSlot {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        match cur.u8()? {
            SLOT_REGULAR => {
                let public = PublicArea::unmarshal(cur)?;
                let sensitive = Option::<SensitiveArea>::unmarshal(cur)?;
                let hierarchy = cur.u32()?;
                let mut object = Object::new(public, sensitive, hierarchy);
                object.evict_handle = Unmarshal::unmarshal(cur)?;
                Ok(Self::Regular(object))
            }
            SLOT_SEQUENCE => {
                let kind = match cur.u8()? {
                    SEQ_HASH => SequenceKind::Hash(HashAlg::unmarshal(cur)?),
                    SEQ_HMAC => SequenceKind::Hmac {
                        alg: HashAlg::unmarshal(cur)?,
                        key: Tpm2b::unmarshal(cur)?,
                    },
                    SEQ_EVENT => SequenceKind::Event,
                    _ => return Err(MarshalError::Value),
                };
                let auth = Tpm2bAuth::unmarshal(cur)?;
                let len = cur.u32()? as usize;
                if len > MAX_SEQUENCE_DATA {
                    return Err(MarshalError::Size);
                }
                Ok(Self::Sequence(SequenceObject {
                    kind,
                    auth,
                    data: cur.take(len)?.to_vec(),
                }))
            }
            _ => Err(MarshalError::Value),
        }
    }
}

/// The object slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectTable {
    slots: Vec<Option<ObjectSlot>>,
}

impl ObjectTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn index_of(handle: u32) -> Option<usize> {
        if handle_type(handle) != HT_TRANSIENT {
            return None;
        }
        Some((handle - TRANSIENT_FIRST) as usize)
    }

    fn handle_of(index: usize) -> u32 {
        TRANSIENT_FIRST + index as u32
    }

    /// Slot index of `handle`, which is either the handle of a loaded
    /// object or the persistent handle of a loaded shadow.
    fn find(&self, handle: u32) -> Option<usize> {
        if handle_type(handle) == HT_PERSISTENT {
            return self.slots.iter().position(|slot| {
                matches!(slot, Some(ObjectSlot::Regular(o)) if o.evict_handle == Some(handle))
            });
        }
        let index = Self::index_of(handle)?;
        self.slots.get(index)?.as_ref()?;
        Some(index)
    }

    pub fn get(&self, handle: u32) -> Option<&ObjectSlot> {
        self.find(handle).and_then(|i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut ObjectSlot> {
        self.find(handle).and_then(|i| self.slots[i].as_mut())
    }

    pub fn object(&self, handle: u32) -> Option<&Object> {
        self.get(handle).and_then(ObjectSlot::as_object)
    }

    pub fn is_loaded(&self, handle: u32) -> bool {
        self.find(handle).is_some()
    }

    /// Stores `slot` in the first free slot and returns its handle.
    pub fn insert(&mut self, slot: ObjectSlot) -> Result<u32, TpmReqError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TpmReqError::rc(TpmRc::OBJECT_MEMORY))?;
        self.slots[index] = Some(slot);
        Ok(Self::handle_of(index))
    }

    pub fn remove(&mut self, handle: u32) -> Option<ObjectSlot> {
        let index = self.find(handle)?;
        self.slots[index].take()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Drops every evict shadow.
    pub fn flush_shadows(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(ObjectSlot::is_shadow) {
                *slot = None;
            }
        }
    }

    /// Drops every object belonging to `hierarchy`.
    pub fn flush_hierarchy(&mut self, hierarchy: u32) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.hierarchy() == hierarchy) {
                *slot = None;
            }
        }
    }

    /// Handles of the loaded transient objects, in ascending order.
    pub fn handles(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref()
                .filter(|s| !s.is_shadow())
                .map(|_| Self::handle_of(i))
        })
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Marshal for ObjectTable {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let mut len = (self.slots.len() as u16).marshal(out);
        for slot in self.slots.iter() {
            len += slot.marshal(out);
        }
        len
    }
}

impl Unmarshal for ObjectTable {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let count = usize::from(cur.u16()?);
        if count > 0xFF {
            return Err(MarshalError::Size);
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(Option::<ObjectSlot>::unmarshal(cur)?);
        }
        Ok(Self { slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    pub(crate) fn sealed_object(secret: &[u8]) -> Object {
        let sensitive = SensitiveArea {
            auth: Tpm2bAuth::new(b"objauth").expect("Failed to build auth"),
            seed: Tpm2bDigest::new(&[7; 32]).expect("Failed to build seed"),
            data: Tpm2bSensitiveData::new(secret).expect("Failed to build data"),
        };
        let unique = HashAlg::Sha256.digest(&[sensitive.seed.as_slice(), sensitive.data.as_slice()]);
        let public = PublicArea {
            name_alg: HashAlg::Sha256,
            attributes: ObjectAttributes::USER_WITH_AUTH | ObjectAttributes::NO_DA,
            auth_policy: Tpm2bDigest::empty(),
            scheme: KeyedHashScheme::Null,
            unique: Tpm2bDigest::from_vec(unique).expect("Failed to build unique"),
        };
        Object::new(public, Some(sensitive), TPM_RH_NULL)
    }

    #[test]
    fn public_area_wire_format() {
        let object = sealed_object(b"secret");
        let bytes = object.public.to_bytes();
        assert_eq!(&bytes[..2], &TPM_ALG_KEYEDHASH.to_be_bytes());
        let mut cur = Cursor::new(&bytes);
        assert_eq!(PublicArea::unmarshal(&mut cur), Ok(object.public.clone()));
        assert!(cur.end().is_ok());
        assert_eq!(object.name.len(), 34);

        let mut rsa = bytes.clone();
        rsa[..2].copy_from_slice(&0x0001u16.to_be_bytes());
        assert_eq!(
            PublicArea::unmarshal(&mut Cursor::new(&rsa)),
            Err(MarshalError::Type)
        );

        let mut reserved = bytes;
        reserved[4..8].copy_from_slice(&1u32.to_be_bytes());
        assert_eq!(
            PublicArea::unmarshal(&mut Cursor::new(&reserved)),
            Err(MarshalError::ReservedBits)
        );
    }

    #[test]
    fn slots_and_handles() {
        let mut table = ObjectTable::new(2);
        let h1 = table
            .insert(ObjectSlot::Regular(sealed_object(b"a")))
            .expect("Failed to insert");
        let seq = SequenceObject::new(SequenceKind::Event, Tpm2bAuth::empty());
        let h2 = table.insert(ObjectSlot::Sequence(seq)).expect("Failed to insert");
        assert_eq!(h1, TRANSIENT_FIRST);
        assert_eq!(h2, TRANSIENT_FIRST + 1);
        assert!(table
            .insert(ObjectSlot::Regular(sealed_object(b"b")))
            .is_err());
        assert!(table.remove(h1).is_some());
        assert!(!table.is_loaded(h1));
        assert!(table.get(TRANSIENT_FIRST + 7).is_none());
        assert_eq!(table.handles().collect::<Vec<_>>(), vec![h2]);
    }

    #[test]
    fn shadows_are_flushed() {
        let mut table = ObjectTable::new(3);
        let mut object = sealed_object(b"p");
        object.evict_handle = Some(PERSISTENT_FIRST + 1);
        table.insert(ObjectSlot::Regular(object)).expect("Failed to insert");
        assert!(table.object(PERSISTENT_FIRST + 1).is_some());
        assert_eq!(table.handles().count(), 0);
        table.flush_shadows();
        assert_eq!(table.free_slots(), 3);
    }

    #[test]
    fn nv_entry_body() {
        let object = sealed_object(b"persist");
        let decoded = Object::nv_decode(&object.nv_encode(), PERSISTENT_FIRST)
            .expect("Failed to decode");
        assert_eq!(decoded.public, object.public);
        assert_eq!(decoded.sensitive, object.sensitive);
        assert_eq!(decoded.evict_handle, Some(PERSISTENT_FIRST));
    }

    #[test]
    fn sequence_is_bounded() {
        let mut seq = SequenceObject::new(SequenceKind::Hash(HashAlg::Sha256), Tpm2bAuth::empty());
        seq.update(&[1; 8], 10).expect("Failed to update");
        assert!(seq.update(&[1; 3], 10).is_err());
        assert!(seq.ticket_allowed());
        let mut generated =
            SequenceObject::new(SequenceKind::Hash(HashAlg::Sha256), Tpm2bAuth::empty());
        generated
            .update(&TPM_GENERATED_VALUE.to_be_bytes(), 10)
            .expect("Failed to update");
        assert!(!generated.ticket_allowed());
    }

    #[test]
    fn table_snapshot() {
        let mut table = ObjectTable::new(3);
        table
            .insert(ObjectSlot::Regular(sealed_object(b"x")))
            .expect("Failed to insert");
        let mut seq = SequenceObject::new(
            SequenceKind::Hmac {
                alg: HashAlg::Sha384,
                key: Tpm2bSensitiveData::new(b"key").expect("Failed to build key"),
            },
            Tpm2bAuth::empty(),
        );
        seq.update(b"data", 100).expect("Failed to update");
        table.insert(ObjectSlot::Sequence(seq)).expect("Failed to insert");
        let bytes = table.to_bytes();
        let mut cur = Cursor::new(&bytes);
        assert_eq!(ObjectTable::unmarshal(&mut cur), Ok(table));
        assert!(cur.end().is_ok());
    }
}
