// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Persistent store adapter.
//!
//! The NV address space is split into fixed regions, one per state
//! aggregate, followed by the index cache and the user-defined index
//! space:
//!
//! ```text
//! | persistent | state reset | state clear | orderly | pad | index cache | indices ... |
//! 0                                                  1K-aligned
//! ```
//!
//! Each region starts with a big-endian `(version, magic)` header. Region
//! bodies are written with [`NvEncoder`], an explicit field-by-field
//! big-endian codec with fixed-width fields, and never through the wire
//! marshaling layer.

pub mod index;
mod records;

use crate::config::TpmConfig;
use crate::crypto::HashAlg;
use crate::error::TpmError;
use crate::failure::{FatalCode, Fault};
use crate::marshal::Tpm2b;
use crate::platform::Platform;
use crate::rc::{TpmRc, TpmReqError};
use crate::state::{OrderlyData, PersistentData, StateClearData, StateResetData};
use crate::types::TPM_ALG_NULL;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use index::{IndexCache, NvEntry, NvIndex, NvPublic};

#[allow(non_camel_case_types)]
pub(crate) mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}
use packed_nums::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NvError {
    /// Access outside the NV address space
    OutOfRange,
    /// The platform cannot write NV
    Unavailable,
    /// The platform is throttling NV writes
    RateLimited,
    /// Region header carries the wrong magic
    BadMagic,
    /// Region was written by a newer version
    VersionTooNew,
    /// Region version has no upgrade path
    VersionUnsupported,
    /// Region body cannot be decoded
    Corrupt,
    /// Not enough room left in the region
    NoSpace,
}

impl From<NvError> for TpmError {
    fn from(err: NvError) -> Self {
        Self::Nv(err)
    }
}

impl From<NvError> for TpmReqError {
    #[track_caller]
    fn from(err: NvError) -> Self {
        match err {
            NvError::Unavailable => Self::rc(TpmRc::NV_UNAVAILABLE),
            NvError::RateLimited => Self::rc(TpmRc::NV_RATE),
            NvError::NoSpace => Self::rc(TpmRc::NV_SPACE),
            _ => Self::Fatal(Fault::new(FatalCode::NvUnrecoverable)),
        }
    }
}

/// Write intent of the running command.
///
/// Ordered so that raising the intent never loses a stronger request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NvUpdate {
    #[default]
    None,
    /// NV was written and must be committed
    Nv,
    /// Orderly data must be flushed, then NV committed
    Orderly,
}

impl NvUpdate {
    pub fn raise(&mut self, to: Self) {
        if to > *self {
            *self = to;
        }
    }
}

/// Fixed region header.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
struct RegionHeader {
    version: u16_be,
    magic: u32_be,
}

const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();
/// Regions are reserved in multiples of this size.
const REGION_ALIGN: usize = 64;
/// The index cache starts on this boundary.
const INDEX_CACHE_ALIGN: usize = 1024;
/// Size of the index cache region.
pub const INDEX_CACHE_SIZE: usize = 1024;
/// The user index space must hold at least this much.
const MIN_USER_SPACE: usize = 256;

/// Big-endian field writer for NV region bodies.
#[derive(Debug, Default)]
pub struct NvEncoder {
    buf: Vec<u8>,
}

impl NvEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bool(&mut self, v: bool) {
        self.u8(u8::from(v));
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes a sized buffer padded to its maximum size, so that the
    /// encoded length does not depend on the value.
    pub fn sized<const N: usize>(&mut self, v: &Tpm2b<N>) {
        self.u16(v.len() as u16);
        self.bytes(v);
        self.buf.resize(self.buf.len() + (N - v.len()), 0);
    }

    pub fn hash_alg(&mut self, alg: Option<HashAlg>) {
        self.u16(alg.map_or(TPM_ALG_NULL, HashAlg::alg_id));
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian field reader for NV region bodies.
#[derive(Debug)]
pub struct NvDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> NvDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], NvError> {
        let end = self.pos.checked_add(len).ok_or(NvError::Corrupt)?;
        let bytes = self.buf.get(self.pos..end).ok_or(NvError::Corrupt)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], NvError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, NvError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, NvError> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, NvError> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, NvError> {
        self.array().map(u64::from_be_bytes)
    }

    pub fn bool(&mut self) -> Result<bool, NvError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(NvError::Corrupt),
        }
    }

    pub fn sized<const N: usize>(&mut self) -> Result<Tpm2b<N>, NvError> {
        let len = usize::from(self.u16()?);
        let data = self.bytes(N)?;
        let value = data.get(..len).ok_or(NvError::Corrupt)?;
        Tpm2b::new(value).map_err(|_| NvError::Corrupt)
    }

    pub fn hash_alg(&mut self) -> Result<Option<HashAlg>, NvError> {
        match self.u16()? {
            TPM_ALG_NULL => Ok(None),
            id => HashAlg::from_alg_id(id).map(Some).ok_or(NvError::Corrupt),
        }
    }
}

/// A structure stored in its own NV region.
pub trait NvRecord: Sized {
    const MAGIC: u32;
    /// Version written by this implementation
    const VERSION: u16;
    /// Oldest version that can still be read
    const MIN_VERSION: u16;

    fn region(layout: &NvLayout) -> Range<usize>;

    fn encode(&self, enc: &mut NvEncoder);

    /// Decodes a body written with `version`, upgrading older versions.
    fn decode(dec: &mut NvDecoder<'_>, version: u16, config: &TpmConfig)
        -> Result<Self, NvError>;
}

fn encoded_len<T: NvRecord>(record: &T) -> usize {
    let mut enc = NvEncoder::new();
    record.encode(&mut enc);
    enc.len()
}

fn reserve(start: usize, body: usize) -> Range<usize> {
    start..start + (REGION_HEADER_SIZE + body).next_multiple_of(REGION_ALIGN)
}

/// Offsets of the NV regions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvLayout {
    pub persistent: Range<usize>,
    pub state_reset: Range<usize>,
    pub state_clear: Range<usize>,
    pub orderly: Range<usize>,
    pub index_cache: Range<usize>,
    pub user: Range<usize>,
}

impl NvLayout {
    /// Computes the layout for `config`. The aggregates have a fixed NV
    /// encoding size, so measuring their initial values is exact.
    pub fn new(config: &TpmConfig) -> Result<Self, TpmError> {
        let persistent = reserve(0, encoded_len(&PersistentData::new(config)));
        let state_reset = reserve(persistent.end, encoded_len(&StateResetData::new(config)));
        let state_clear = reserve(state_reset.end, encoded_len(&StateClearData::default()));
        let orderly = reserve(state_clear.end, encoded_len(&OrderlyData::default()));
        let cache_start = orderly.end.next_multiple_of(INDEX_CACHE_ALIGN);
        let index_cache = cache_start..cache_start + INDEX_CACHE_SIZE;
        if config.nv_size < index_cache.end + MIN_USER_SPACE {
            return Err(TpmError::Config("nv_size too small for the state aggregates"));
        }
        let user = index_cache.end..config.nv_size;
        Ok(Self {
            persistent,
            state_reset,
            state_clear,
            orderly,
            index_cache,
            user,
        })
    }

    /// Writes `record` with its header into its region.
    pub fn store<T: NvRecord>(
        &self,
        platform: &mut dyn Platform,
        record: &T,
    ) -> Result<(), NvError> {
        let region = T::region(self);
        let header = RegionHeader {
            version: T::VERSION.into(),
            magic: T::MAGIC.into(),
        };
        let mut enc = NvEncoder::new();
        enc.bytes(header.as_bytes());
        record.encode(&mut enc);
        let data = enc.finish();
        if data.len() > region.len() {
            return Err(NvError::NoSpace);
        }
        platform.nv_write(region.start, &data)
    }

    fn read_region<T: NvRecord>(&self, platform: &dyn Platform) -> Result<Vec<u8>, NvError> {
        let region = T::region(self);
        let mut buf = vec![0u8; region.len()];
        platform.nv_read(region.start, &mut buf)?;
        Ok(buf)
    }

    fn check_header<T: NvRecord>(buf: &[u8]) -> Result<(u16, &[u8]), NvError> {
        let (header, body) = RegionHeader::read_from_prefix(buf).map_err(|_| NvError::Corrupt)?;
        let version = header.version.get();
        let magic = header.magic.get();
        if magic != T::MAGIC {
            return Err(NvError::BadMagic);
        }
        if version > T::VERSION {
            return Err(NvError::VersionTooNew);
        }
        if version < T::MIN_VERSION {
            return Err(NvError::VersionUnsupported);
        }
        Ok((version, body))
    }

    /// Reads and validates the record stored in its region.
    pub fn load<T: NvRecord>(
        &self,
        platform: &dyn Platform,
        config: &TpmConfig,
    ) -> Result<T, NvError> {
        let buf = self.read_region::<T>(platform)?;
        let (version, body) = Self::check_header::<T>(&buf).inspect_err(|e| {
            log::error!("NV region at {:#x}: invalid header: {:?}", T::region(self).start, e);
        })?;
        if version < T::VERSION {
            log::warn!(
                "NV region at {:#x}: upgrading version {} to {}",
                T::region(self).start,
                version,
                T::VERSION
            );
        }
        T::decode(&mut NvDecoder::new(body), version, config)
    }

    /// Whether the region of `T` carries a readable header.
    pub fn has_valid<T: NvRecord>(&self, platform: &dyn Platform) -> bool {
        self.read_region::<T>(platform)
            .is_ok_and(|buf| Self::check_header::<T>(&buf).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::Tpm2bAuth;
    use crate::platform::MemoryPlatform;

    #[test]
    fn fixed_width_encoding() {
        let mut enc = NvEncoder::new();
        enc.sized(&Tpm2b::<8>::new(&[1, 2]).expect("Failed to build TPM2B"));
        enc.u32(0xdead_beef);
        let data = enc.finish();
        assert_eq!(data.len(), 2 + 8 + 4);

        let mut dec = NvDecoder::new(&data);
        assert_eq!(dec.sized::<8>().expect("Failed to decode").as_slice(), &[1, 2]);
        assert_eq!(dec.u32(), Ok(0xdead_beef));
        assert_eq!(dec.u8(), Err(NvError::Corrupt));
    }

    #[test]
    fn oversized_field_is_corrupt() {
        let mut enc = NvEncoder::new();
        enc.sized(&Tpm2bAuth::empty());
        let mut data = enc.finish();
        data[1] = 65;
        assert_eq!(NvDecoder::new(&data).sized::<64>(), Err(NvError::Corrupt));
    }

    #[test]
    fn layout_is_ordered() {
        let layout = NvLayout::new(&TpmConfig::default()).expect("Failed to compute layout");
        assert_eq!(layout.persistent.start, 0);
        assert!(layout.persistent.end <= layout.state_reset.start);
        assert!(layout.state_reset.end <= layout.state_clear.start);
        assert!(layout.state_clear.end <= layout.orderly.start);
        assert_eq!(layout.index_cache.start % INDEX_CACHE_ALIGN, 0);
        assert!(layout.orderly.end <= layout.index_cache.start);
        assert_eq!(layout.user.end, TpmConfig::default().nv_size);

        let tiny = TpmConfig {
            nv_size: 2048,
            ..Default::default()
        };
        assert!(NvLayout::new(&tiny).is_err());
    }

    #[test]
    fn header_validation() {
        let config = TpmConfig::default();
        let layout = NvLayout::new(&config).expect("Failed to compute layout");
        let mut platform = MemoryPlatform::new(config.nv_size);
        assert!(!layout.has_valid::<OrderlyData>(&platform));

        let go = OrderlyData {
            clock: 1234,
            ..Default::default()
        };
        layout.store(&mut platform, &go).expect("Failed to store");
        assert_eq!(layout.load::<OrderlyData>(&platform, &config), Ok(go));

        // Magic mismatch
        platform
            .nv_write(layout.orderly.start + 2, &[0, 0, 0, 0])
            .expect("Failed to write NV");
        assert_eq!(
            layout.load::<OrderlyData>(&platform, &config),
            Err(NvError::BadMagic)
        );
    }
}
