// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Binary marshaling layer.
//!
//! All TPM wire data is big-endian. Decoding goes through a [`Cursor`]
//! that tracks the remaining input; every read is bounds checked and a
//! short buffer is reported as [`MarshalError::Insufficient`]. Encoding
//! appends to a `Vec<u8>` and reports the number of bytes written.

use crate::rc::TpmRc;
use alloc::vec::Vec;
use core::ops::Deref;

/// Decode failures, each mapping onto a TPM response code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarshalError {
    /// Fewer bytes remain than the value needs
    Insufficient,
    /// A size field exceeds its maximum or its enclosing buffer
    Size,
    /// An enumerated value outside its allowed set
    Value,
    /// Unknown structure tag
    Tag,
    /// Unknown union selector
    Selector,
    /// Unsupported or disallowed hash algorithm
    Hash,
    /// Unsupported object type
    Type,
    /// Unsupported symmetric algorithm
    Symmetric,
    /// Unsupported scheme
    Scheme,
    /// Unsupported mode
    Mode,
    /// Unsupported key size
    KeySize,
    /// Reserved bits set in an attribute word
    ReservedBits,
}

impl MarshalError {
    pub fn rc(self) -> TpmRc {
        match self {
            Self::Insufficient => TpmRc::INSUFFICIENT,
            Self::Size => TpmRc::SIZE,
            Self::Value => TpmRc::VALUE,
            Self::Tag => TpmRc::TAG,
            Self::Selector => TpmRc::SELECTOR,
            Self::Hash => TpmRc::HASH,
            Self::Type => TpmRc::TYPE,
            Self::Symmetric => TpmRc::SYMMETRIC,
            Self::Scheme => TpmRc::SCHEME,
            Self::Mode => TpmRc::MODE,
            Self::KeySize => TpmRc::KEY_SIZE,
            Self::ReservedBits => TpmRc::RESERVED_BITS,
        }
    }
}

/// Read cursor over an input buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> &'a [u8] {
        &self.buf[..self.pos]
    }

    /// Bytes not yet consumed, without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Consumes `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], MarshalError> {
        if len > self.remaining() {
            return Err(MarshalError::Insufficient);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], MarshalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, MarshalError> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, MarshalError> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, MarshalError> {
        self.take_array().map(u64::from_be_bytes)
    }

    /// Fails with [`MarshalError::Size`] unless all input was consumed.
    pub fn end(&self) -> Result<(), MarshalError> {
        if self.remaining() != 0 {
            return Err(MarshalError::Size);
        }
        Ok(())
    }
}

/// Types with a wire encoding.
pub trait Marshal {
    /// Appends the encoding of `self` to `out`, returning its length.
    fn marshal(&self, out: &mut Vec<u8>) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal(&mut out);
        out
    }
}

/// Types that can be decoded without outside context.
pub trait Unmarshal: Sized {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError>;
}

/// Union types whose arm is chosen by a selector carried elsewhere.
pub trait UnmarshalSelector: Sized {
    fn unmarshal_with(cur: &mut Cursor<'_>, selector: u16) -> Result<Self, MarshalError>;
}

macro_rules! impl_uint {
    ($t:ty, $get:ident) => {
        impl Marshal for $t {
            fn marshal(&self, out: &mut Vec<u8>) -> usize {
                out.extend_from_slice(&self.to_be_bytes());
                size_of::<$t>()
            }
        }

        impl Unmarshal for $t {
            fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
                cur.$get()
            }
        }
    };
}

impl_uint!(u8, u8);
impl_uint!(u16, u16);
impl_uint!(u32, u32);
impl_uint!(u64, u64);

/// TPMI_YES_NO
impl Marshal for bool {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        u8::from(*self).marshal(out)
    }
}

impl Unmarshal for bool {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        match cur.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(MarshalError::Value),
        }
    }
}

/// Fixed-size octet arrays are encoded without a length.
impl<const N: usize> Marshal for [u8; N] {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        out.extend_from_slice(self);
        N
    }
}

impl<const N: usize> Unmarshal for [u8; N] {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(cur.take(N)?);
        Ok(out)
    }
}

/// Optional values carry a YES/NO presence marker.
impl<T: Marshal> Marshal for Option<T> {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        match self {
            Some(v) => true.marshal(out) + v.marshal(out),
            None => false.marshal(out),
        }
    }
}

impl<T: Unmarshal> Unmarshal for Option<T> {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        if bool::unmarshal(cur)? {
            Ok(Some(T::unmarshal(cur)?))
        } else {
            Ok(None)
        }
    }
}

/// A size-prefixed byte buffer holding at most `N` bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tpm2b<const N: usize>(Vec<u8>);

impl<const N: usize> Tpm2b<N> {
    pub const MAX: usize = N;

    pub fn new(data: &[u8]) -> Result<Self, MarshalError> {
        if data.len() > N {
            return Err(MarshalError::Size);
        }
        Ok(Self(data.to_vec()))
    }

    pub fn from_vec(data: Vec<u8>) -> Result<Self, MarshalError> {
        if data.len() > N {
            return Err(MarshalError::Size);
        }
        Ok(Self(data))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl<const N: usize> Deref for Tpm2b<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> Marshal for Tpm2b<N> {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        marshal_bytes(&self.0, out)
    }
}

impl<const N: usize> Unmarshal for Tpm2b<N> {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let size = usize::from(cur.u16()?);
        if size > N {
            return Err(MarshalError::Size);
        }
        Ok(Self(cur.take(size)?.to_vec()))
    }
}

/// Largest digest of any implemented hash.
pub const MAX_DIGEST_SIZE: usize = 64;

pub type Tpm2bDigest = Tpm2b<MAX_DIGEST_SIZE>;
pub type Tpm2bNonce = Tpm2b<MAX_DIGEST_SIZE>;
pub type Tpm2bAuth = Tpm2b<MAX_DIGEST_SIZE>;
pub type Tpm2bData = Tpm2b<MAX_DIGEST_SIZE>;
pub type Tpm2bName = Tpm2b<{ MAX_DIGEST_SIZE + 2 }>;
pub type Tpm2bSensitiveData = Tpm2b<128>;
pub type Tpm2bMaxBuffer = Tpm2b<1024>;
pub type Tpm2bMaxNvBuffer = Tpm2b<1024>;
pub type Tpm2bEvent = Tpm2b<1024>;
pub type Tpm2bContextData = Tpm2b<4096>;

/// Encodes `data` as a TPM2B. `data` must fit a `u16` length.
pub fn marshal_bytes(data: &[u8], out: &mut Vec<u8>) -> usize {
    let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
    len.marshal(out);
    out.extend_from_slice(&data[..usize::from(len)]);
    2 + usize::from(len)
}

/// Encodes `value` preceded by its encoded size as a `u16`.
pub fn marshal_sized<T: Marshal>(value: &T, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    out.extend_from_slice(&[0, 0]);
    let len = value.marshal(out);
    let size = u16::try_from(len).unwrap_or(u16::MAX).to_be_bytes();
    out[start..start + 2].copy_from_slice(&size);
    len + 2
}

/// Decodes a size-prefixed structure. The structure must consume exactly
/// the declared number of bytes and a zero size is rejected.
pub fn unmarshal_sized<T: Unmarshal>(cur: &mut Cursor<'_>) -> Result<T, MarshalError> {
    let size = usize::from(cur.u16()?);
    if size == 0 {
        return Err(MarshalError::Size);
    }
    if size > cur.remaining() {
        return Err(MarshalError::Size);
    }
    let mut inner = Cursor::new(cur.take(size)?);
    let value = T::unmarshal(&mut inner)?;
    inner.end()?;
    Ok(value)
}

/// Decodes a TPML list header, bounding the element count by `max`.
pub fn unmarshal_count(cur: &mut Cursor<'_>, max: usize) -> Result<usize, MarshalError> {
    let count = cur.u32()?;
    let count = usize::try_from(count).map_err(|_| MarshalError::Size)?;
    if count > max {
        return Err(MarshalError::Size);
    }
    Ok(count)
}

/// Encodes a TPML list.
pub fn marshal_list<T: Marshal>(items: &[T], out: &mut Vec<u8>) -> usize {
    let count = u32::try_from(items.len()).unwrap_or(u32::MAX);
    let mut len = count.marshal(out);
    for item in items {
        len += item.marshal(out);
    }
    len
}

/// Decodes a TPML list of at most `max` elements.
pub fn unmarshal_list<T: Unmarshal>(
    cur: &mut Cursor<'_>,
    max: usize,
) -> Result<Vec<T>, MarshalError> {
    let count = unmarshal_count(cur, max)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::unmarshal(cur)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn cursor_reads_big_endian() {
        let data = [0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0xaa];
        let mut cur = Cursor::new(&data);
        assert_eq!(cur.u16(), Ok(0x8001));
        assert_eq!(cur.u32(), Ok(12));
        assert_eq!(cur.remaining(), 1);
        assert_eq!(cur.u16(), Err(MarshalError::Insufficient));
        // A failed read does not consume anything
        assert_eq!(cur.u8(), Ok(0xaa));
        assert!(cur.end().is_ok());
    }

    #[test]
    fn tpm2b_bounds() {
        let data = [0x00, 0x03, 1, 2, 3];
        let b = Tpm2b::<4>::unmarshal(&mut Cursor::new(&data)).expect("Failed to decode TPM2B");
        assert_eq!(b.as_slice(), &[1, 2, 3]);

        let b = Tpm2b::<2>::unmarshal(&mut Cursor::new(&data));
        assert_eq!(b, Err(MarshalError::Size));

        let short = [0x00, 0x05, 1, 2];
        let b = Tpm2b::<8>::unmarshal(&mut Cursor::new(&short));
        assert_eq!(b, Err(MarshalError::Insufficient));
    }

    #[test]
    fn sized_structure_must_be_exact() {
        // Declared size of 6 around a 4-byte value
        let data = [0x00, 0x06, 0, 0, 0, 1, 0, 0];
        let r = unmarshal_sized::<u32>(&mut Cursor::new(&data));
        assert_eq!(r, Err(MarshalError::Size));

        // Declared size larger than the buffer
        let data = [0x00, 0x08, 0, 0, 0, 1];
        let r = unmarshal_sized::<u32>(&mut Cursor::new(&data));
        assert_eq!(r, Err(MarshalError::Size));

        let data = [0x00, 0x04, 0, 0, 0, 1];
        assert_eq!(unmarshal_sized::<u32>(&mut Cursor::new(&data)), Ok(1));

        let mut out = Vec::new();
        assert_eq!(marshal_sized(&7u32, &mut out), 6);
        assert_eq!(out, vec![0, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn list_count_bounded() {
        let data = [0, 0, 0, 3, 0, 1, 0, 2, 0, 3];
        assert!(unmarshal_list::<u16>(&mut Cursor::new(&data), 2).is_err());
        let items = unmarshal_list::<u16>(&mut Cursor::new(&data), 3).expect("Failed to decode list");
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn presence_marker() {
        let mut out = Vec::new();
        assert_eq!(Some(0x1234u16).marshal(&mut out), 3);
        assert_eq!(None::<u16>.marshal(&mut out), 1);
        assert_eq!(out, vec![1, 0x12, 0x34, 0]);
        let mut cur = Cursor::new(&out);
        assert_eq!(Option::<u16>::unmarshal(&mut cur), Ok(Some(0x1234)));
        assert_eq!(Option::<u16>::unmarshal(&mut cur), Ok(None));
        assert!(cur.end().is_ok());
    }

    #[test]
    fn yes_no() {
        assert_eq!(bool::unmarshal(&mut Cursor::new(&[1])), Ok(true));
        assert_eq!(bool::unmarshal(&mut Cursor::new(&[2])), Err(MarshalError::Value));
    }
}
