// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! User-defined NV index space and the orderly index cache.
//!
//! The index space is a list of `(size:u32 | handle:u32 | body)` entries
//! terminated by a zero size. It holds both NV indices and evicted
//! objects; the handle type tells them apart.

use super::{NvDecoder, NvEncoder, NvError, NvLayout, NvRecord, INDEX_CACHE_SIZE};
use crate::config::TpmConfig;
use crate::crypto::HashAlg;
use crate::marshal::{Cursor, Marshal, MarshalError, Tpm2bAuth, Tpm2bDigest, Unmarshal};
use crate::platform::Platform;
use crate::types::{NvAttributes, NV_INDEX_FIRST, NV_INDEX_LAST};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

/// Size of the `size` and `handle` fields of an entry.
const ENTRY_HEADER_SIZE: usize = 8;
/// Size of the terminating zero size field.
const TERMINATOR_SIZE: usize = 4;

/// An entry of the index space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvEntry {
    pub offset: usize,
    pub handle: u32,
    pub body: Vec<u8>,
}

impl NvEntry {
    fn size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.body.len()
    }
}

fn read_u32(platform: &dyn Platform, offset: usize) -> Result<u32, NvError> {
    let mut buf = [0u8; 4];
    platform.nv_read(offset, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

impl NvLayout {
    /// Empties the index space.
    pub fn format_entries(&self, platform: &mut dyn Platform) -> Result<(), NvError> {
        platform.nv_write(self.user.start, &[0; TERMINATOR_SIZE])
    }

    /// Lists all entries, validating the list structure.
    pub fn entries(&self, platform: &dyn Platform) -> Result<Vec<NvEntry>, NvError> {
        let mut entries = Vec::new();
        let mut offset = self.user.start;
        loop {
            if offset + TERMINATOR_SIZE > self.user.end {
                return Err(NvError::Corrupt);
            }
            let size = read_u32(platform, offset)? as usize;
            if size == 0 {
                return Ok(entries);
            }
            if size < ENTRY_HEADER_SIZE || offset + size + TERMINATOR_SIZE > self.user.end {
                return Err(NvError::Corrupt);
            }
            let handle = read_u32(platform, offset + 4)?;
            let mut body = vec![0u8; size - ENTRY_HEADER_SIZE];
            platform.nv_read(offset + ENTRY_HEADER_SIZE, &mut body)?;
            entries.push(NvEntry {
                offset,
                handle,
                body,
            });
            offset += size;
        }
    }

    pub fn find_entry(
        &self,
        platform: &dyn Platform,
        handle: u32,
    ) -> Result<Option<NvEntry>, NvError> {
        Ok(self
            .entries(platform)?
            .into_iter()
            .find(|e| e.handle == handle))
    }

    fn end_of_entries(&self, entries: &[NvEntry]) -> usize {
        entries
            .last()
            .map_or(self.user.start, |e| e.offset + e.size())
    }

    /// Bytes still available for a new entry body.
    pub fn free_space(&self, platform: &dyn Platform) -> Result<usize, NvError> {
        let end = self.end_of_entries(&self.entries(platform)?);
        Ok(self
            .user
            .end
            .saturating_sub(end + ENTRY_HEADER_SIZE + TERMINATOR_SIZE))
    }

    /// Appends an entry. The handle must not exist yet.
    pub fn add_entry(
        &self,
        platform: &mut dyn Platform,
        handle: u32,
        body: &[u8],
    ) -> Result<(), NvError> {
        let entries = self.entries(platform)?;
        let end = self.end_of_entries(&entries);
        let size = ENTRY_HEADER_SIZE + body.len();
        if end + size + TERMINATOR_SIZE > self.user.end {
            return Err(NvError::NoSpace);
        }
        let size32 = u32::try_from(size).map_err(|_| NvError::NoSpace)?;
        let mut data = Vec::with_capacity(size + TERMINATOR_SIZE);
        data.extend_from_slice(&size32.to_be_bytes());
        data.extend_from_slice(&handle.to_be_bytes());
        data.extend_from_slice(body);
        data.extend_from_slice(&[0; TERMINATOR_SIZE]);
        platform.nv_write(end, &data)
    }

    /// Removes the entry of `handle` and compacts the list. Returns false
    /// if no such entry exists.
    pub fn remove_entry(&self, platform: &mut dyn Platform, handle: u32) -> Result<bool, NvError> {
        let entries = self.entries(platform)?;
        let Some(entry) = entries.iter().find(|e| e.handle == handle) else {
            return Ok(false);
        };
        let tail_start = entry.offset + entry.size();
        let tail_end = self.end_of_entries(&entries) + TERMINATOR_SIZE;
        let mut tail = vec![0u8; tail_end - tail_start];
        platform.nv_read(tail_start, &mut tail)?;
        platform.nv_write(entry.offset, &tail)?;
        Ok(true)
    }

    /// Replaces the body of an existing entry.
    pub fn update_entry(
        &self,
        platform: &mut dyn Platform,
        handle: u32,
        body: &[u8],
    ) -> Result<(), NvError> {
        let entry = self
            .find_entry(platform, handle)?
            .ok_or(NvError::Corrupt)?;
        if entry.body.len() == body.len() {
            return platform.nv_write(entry.offset + ENTRY_HEADER_SIZE, body);
        }
        self.remove_entry(platform, handle)?;
        self.add_entry(platform, handle, body)
    }
}

/// TPMS_NV_PUBLIC
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvPublic {
    pub nv_index: u32,
    pub name_alg: HashAlg,
    pub attributes: NvAttributes,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl NvPublic {
    /// nameAlg followed by the digest of the public area.
    pub fn name(&self) -> Vec<u8> {
        let public = self.to_bytes();
        let mut name = self.name_alg.alg_id().to_be_bytes().to_vec();
        name.extend_from_slice(&self.name_alg.digest(&[public.as_slice()]));
        name
    }
}

impl Marshal for NvPublic {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.nv_index.marshal(out)
            + self.name_alg.marshal(out)
            + u32::from(self.attributes).marshal(out)
            + self.auth_policy.marshal(out)
            + self.data_size.marshal(out)
    }
}

impl Unmarshal for NvPublic {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let nv_index = cur.u32()?;
        if !(NV_INDEX_FIRST..=NV_INDEX_LAST).contains(&nv_index) {
            return Err(MarshalError::Value);
        }
        let name_alg = HashAlg::unmarshal(cur)?;
        let attributes = cur.u32()?;
        if attributes & NvAttributes::RESERVED != 0 {
            return Err(MarshalError::ReservedBits);
        }
        Ok(Self {
            nv_index,
            name_alg,
            attributes: NvAttributes::from(attributes),
            auth_policy: Unmarshal::unmarshal(cur)?,
            data_size: cur.u16()?,
        })
    }
}

/// An NV index as kept in the index space.
///
/// The data of ORDERLY indices lives in the [`IndexCache`] and is not
/// part of the entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvIndex {
    pub public: NvPublic,
    pub auth: Tpm2bAuth,
    pub data: Vec<u8>,
}

impl NvIndex {
    pub fn is_orderly(&self) -> bool {
        self.public.attributes.orderly()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = NvEncoder::new();
        enc.u32(self.public.nv_index);
        enc.u16(self.public.name_alg.alg_id());
        enc.u32(self.public.attributes.into());
        enc.sized(&self.public.auth_policy);
        enc.u16(self.public.data_size);
        enc.sized(&self.auth);
        if !self.is_orderly() {
            enc.bytes(&self.data);
        }
        enc.finish()
    }

    pub fn decode(body: &[u8]) -> Result<Self, NvError> {
        let mut dec = NvDecoder::new(body);
        let nv_index = dec.u32()?;
        let name_alg = dec.hash_alg()?.ok_or(NvError::Corrupt)?;
        let attributes = NvAttributes::from(dec.u32()?);
        let auth_policy = dec.sized()?;
        let data_size = dec.u16()?;
        let auth = dec.sized()?;
        let data = if attributes.orderly() {
            Vec::new()
        } else {
            dec.bytes(usize::from(data_size))?.to_vec()
        };
        Ok(Self {
            public: NvPublic {
                nv_index,
                name_alg,
                attributes,
                auth_policy,
                data_size,
            },
            auth,
            data,
        })
    }
}

/// RAM copy of the data of ORDERLY NV indices, flushed with the orderly
/// data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexCache {
    entries: Vec<(u32, Vec<u8>)>,
}

/// Region header plus entry count.
const CACHE_OVERHEAD: usize = 6 + 2;
/// Handle and length of a cache entry.
const CACHE_ENTRY_OVERHEAD: usize = 6;

impl IndexCache {
    pub fn get(&self, handle: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, d)| d.as_slice())
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Vec<u8>> {
        self.entries
            .iter_mut()
            .find(|(h, _)| *h == handle)
            .map(|(_, d)| d)
    }

    fn used(&self) -> usize {
        CACHE_OVERHEAD
            + self
                .entries
                .iter()
                .map(|(_, d)| CACHE_ENTRY_OVERHEAD + d.len())
                .sum::<usize>()
    }

    /// Adds a zero-filled entry of `size` bytes. Fails if the cache is
    /// full.
    pub fn insert(&mut self, handle: u32, size: usize) -> Result<(), NvError> {
        if self.used() + CACHE_ENTRY_OVERHEAD + size > INDEX_CACHE_SIZE {
            return Err(NvError::NoSpace);
        }
        self.remove(handle);
        self.entries.push((handle, vec![0u8; size]));
        Ok(())
    }

    pub fn remove(&mut self, handle: u32) {
        self.entries.retain(|(h, _)| *h != handle);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.entries.iter().map(|(h, d)| (*h, d.as_slice()))
    }
}

impl NvRecord for IndexCache {
    const MAGIC: u32 = 0x4e56_4943; // "NVIC"
    const VERSION: u16 = 1;
    const MIN_VERSION: u16 = 1;

    fn region(layout: &NvLayout) -> Range<usize> {
        layout.index_cache.clone()
    }

    fn encode(&self, enc: &mut NvEncoder) {
        enc.u16(self.entries.len() as u16);
        for (handle, data) in self.entries.iter() {
            enc.u32(*handle);
            enc.u16(data.len() as u16);
            enc.bytes(data);
        }
    }

    fn decode(
        dec: &mut NvDecoder<'_>,
        _version: u16,
        _config: &TpmConfig,
    ) -> Result<Self, NvError> {
        let count = usize::from(dec.u16()?);
        let mut cache = Self::default();
        for _ in 0..count {
            let handle = dec.u32()?;
            let len = usize::from(dec.u16()?);
            cache.entries.push((handle, dec.bytes(len)?.to_vec()));
        }
        Ok(cache)
    }
}

impl Marshal for IndexCache {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let mut len = (self.entries.len() as u16).marshal(out);
        for (handle, data) in self.entries.iter() {
            len += handle.marshal(out) + crate::marshal::marshal_bytes(data, out);
        }
        len
    }
}

impl Unmarshal for IndexCache {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let count = usize::from(cur.u16()?);
        let mut cache = Self::default();
        for _ in 0..count {
            let handle = cur.u32()?;
            let len = usize::from(cur.u16()?);
            cache.entries.push((handle, cur.take(len)?.to_vec()));
        }
        if cache.used() > INDEX_CACHE_SIZE {
            return Err(MarshalError::Size);
        }
        Ok(cache)
    }
}
