// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Platform configuration registers.

use crate::config::PCR_SELECT_SIZE;
use crate::crypto::HashAlg;
use crate::marshal::{
    marshal_bytes, marshal_list, unmarshal_list, Cursor, Marshal, MarshalError,
    Tpm2bDigest, Unmarshal, UnmarshalSelector,
};
use alloc::vec;
use alloc::vec::Vec;

/// Number of implemented hash algorithms, and the bound of the PCR lists.
pub const HASH_COUNT: usize = HashAlg::ALL.len();
/// PCRs below this index are saved by Shutdown(STATE).
pub const SAVED_PCR_COUNT: usize = 16;
/// Maximum number of digests returned by one PCR_Read.
pub const MAX_PCR_READ_DIGESTS: usize = 8;

/// Locality masks: bit `n` allows locality `n`.
const LOC_ALL: u8 = 0x1F;
const LOC_NONE: u8 = 0x00;

#[derive(Clone, Copy, Debug)]
struct PcrAttributes {
    state_save: bool,
    reset_locality: u8,
    extend_locality: u8,
}

const fn attributes(pcr: usize) -> PcrAttributes {
    match pcr {
        0..=15 => PcrAttributes {
            state_save: true,
            reset_locality: LOC_NONE,
            extend_locality: LOC_ALL,
        },
        16 | 23 => PcrAttributes {
            state_save: false,
            reset_locality: LOC_ALL,
            extend_locality: LOC_ALL,
        },
        17..=19 => PcrAttributes {
            state_save: false,
            reset_locality: 0x10,
            extend_locality: 0x1C,
        },
        20 => PcrAttributes {
            state_save: false,
            reset_locality: 0x1C,
            extend_locality: 0x0E,
        },
        _ => PcrAttributes {
            state_save: false,
            reset_locality: 0x04,
            extend_locality: 0x04,
        },
    }
}

fn locality_bit(locality: u8) -> u8 {
    if locality < 5 {
        1 << locality
    } else {
        0
    }
}

pub fn can_reset(pcr: usize, locality: u8) -> bool {
    attributes(pcr).reset_locality & locality_bit(locality) != 0
}

pub fn can_extend(pcr: usize, locality: u8) -> bool {
    attributes(pcr).extend_locality & locality_bit(locality) != 0
}

/// PCRs 17 to 22 start out as all ones until a dynamic launch resets them.
fn initial_value(alg: HashAlg, pcr: usize) -> Vec<u8> {
    let fill = if (17..=22).contains(&pcr) { 0xff } else { 0x00 };
    vec![fill; alg.digest_size()]
}

fn is_selected(select: &[u8; PCR_SELECT_SIZE], pcr: usize) -> bool {
    select
        .get(pcr / 8)
        .is_some_and(|byte| byte & (1 << (pcr % 8)) != 0)
}

fn set_selected(select: &mut [u8; PCR_SELECT_SIZE], pcr: usize) {
    if let Some(byte) = select.get_mut(pcr / 8) {
        *byte |= 1 << (pcr % 8);
    }
}

/// Which PCRs exist in which bank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PcrAllocation {
    select: [[u8; PCR_SELECT_SIZE]; HASH_COUNT],
}

impl PcrAllocation {
    /// Allocates every PCR in each of `banks`.
    pub fn new(banks: &[HashAlg], pcr_count: usize) -> Self {
        let mut alloc = Self::default();
        for alg in banks {
            let mut select = [0u8; PCR_SELECT_SIZE];
            (0..pcr_count).for_each(|pcr| set_selected(&mut select, pcr));
            alloc.set(*alg, select);
        }
        alloc
    }

    pub fn select(&self, alg: HashAlg) -> [u8; PCR_SELECT_SIZE] {
        self.select[alg.index()]
    }

    pub fn set(&mut self, alg: HashAlg, select: [u8; PCR_SELECT_SIZE]) {
        self.select[alg.index()] = select;
    }

    pub fn is_allocated(&self, alg: HashAlg) -> bool {
        self.select(alg).iter().any(|b| *b != 0)
    }

    /// Algorithms with at least one allocated PCR.
    pub fn banks(&self) -> impl Iterator<Item = HashAlg> + '_ {
        HashAlg::ALL.into_iter().filter(|alg| self.is_allocated(*alg))
    }

    pub fn to_selection(&self) -> PcrSelectionList {
        PcrSelectionList(
            HashAlg::ALL
                .into_iter()
                .map(|hash| PcrSelection {
                    hash,
                    select: self.select(hash),
                })
                .collect(),
        )
    }
}

/// TPMS_PCR_SELECTION
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcrSelection {
    pub hash: HashAlg,
    pub select: [u8; PCR_SELECT_SIZE],
}

impl Marshal for PcrSelection {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let len = self.hash.marshal(out) + (PCR_SELECT_SIZE as u8).marshal(out);
        out.extend_from_slice(&self.select);
        len + PCR_SELECT_SIZE
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let hash = HashAlg::unmarshal(cur)?;
        let size = usize::from(cur.u8()?);
        if size > PCR_SELECT_SIZE {
            return Err(MarshalError::Value);
        }
        let mut select = [0u8; PCR_SELECT_SIZE];
        select[..size].copy_from_slice(cur.take(size)?);
        Ok(Self { hash, select })
    }
}

/// TPML_PCR_SELECTION
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PcrSelectionList(pub Vec<PcrSelection>);

impl Marshal for PcrSelectionList {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        marshal_list(&self.0, out)
    }
}

impl Unmarshal for PcrSelectionList {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        unmarshal_list(cur, HASH_COUNT).map(Self)
    }
}

/// TPMU_HA: a digest whose size is chosen by the hash algorithm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashDigest(pub Vec<u8>);

impl UnmarshalSelector for HashDigest {
    fn unmarshal_with(cur: &mut Cursor<'_>, selector: u16) -> Result<Self, MarshalError> {
        let alg = HashAlg::from_alg_id(selector).ok_or(MarshalError::Selector)?;
        Ok(Self(cur.take(alg.digest_size())?.to_vec()))
    }
}

/// TPMT_HA
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedHash {
    pub alg: HashAlg,
    pub digest: Vec<u8>,
}

impl Marshal for TaggedHash {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let len = self.alg.marshal(out);
        out.extend_from_slice(&self.digest);
        len + self.digest.len()
    }
}

impl Unmarshal for TaggedHash {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let alg = HashAlg::unmarshal(cur)?;
        let HashDigest(digest) = HashDigest::unmarshal_with(cur, alg.alg_id())?;
        Ok(Self { alg, digest })
    }
}

/// TPML_DIGEST_VALUES
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DigestValues(pub Vec<TaggedHash>);

impl Marshal for DigestValues {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        marshal_list(&self.0, out)
    }
}

impl Unmarshal for DigestValues {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        unmarshal_list(cur, HASH_COUNT).map(Self)
    }
}

/// TPML_DIGEST
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DigestList(pub Vec<Tpm2bDigest>);

impl Marshal for DigestList {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        marshal_list(&self.0, out)
    }
}

impl Unmarshal for DigestList {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        unmarshal_list(cur, MAX_PCR_READ_DIGESTS).map(Self)
    }
}

/// Values of the state-saved PCRs, kept in the state-clear data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrSave {
    banks: [Vec<u8>; HASH_COUNT],
}

impl Default for PcrSave {
    fn default() -> Self {
        Self {
            banks: HashAlg::ALL.map(|alg| vec![0u8; Self::bank_size(alg)]),
        }
    }
}

impl PcrSave {
    pub fn bank_size(alg: HashAlg) -> usize {
        SAVED_PCR_COUNT * alg.digest_size()
    }

    pub fn bank(&self, alg: HashAlg) -> &[u8] {
        &self.banks[alg.index()]
    }

    /// Replaces a bank. Returns false if `data` has the wrong length.
    pub fn set_bank(&mut self, alg: HashAlg, data: &[u8]) -> bool {
        if data.len() != Self::bank_size(alg) {
            return false;
        }
        self.banks[alg.index()].copy_from_slice(data);
        true
    }
}

impl Marshal for PcrSave {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.banks.iter().map(|b| marshal_bytes(b, out)).sum()
    }
}

impl Unmarshal for PcrSave {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let mut save = Self::default();
        for alg in HashAlg::ALL {
            let len = usize::from(cur.u16()?);
            if !save.set_bank(alg, cur.take(len)?) {
                return Err(MarshalError::Size);
            }
        }
        Ok(save)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PcrBank {
    alg: HashAlg,
    select: [u8; PCR_SELECT_SIZE],
    values: Vec<Vec<u8>>,
}

/// The live PCR banks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrBanks {
    pcr_count: usize,
    banks: Vec<PcrBank>,
}

impl PcrBanks {
    /// Creates the banks described by `alloc`, each PCR at its initial value.
    pub fn new(alloc: &PcrAllocation, pcr_count: usize) -> Self {
        let banks = alloc
            .banks()
            .map(|alg| PcrBank {
                alg,
                select: alloc.select(alg),
                values: (0..pcr_count).map(|pcr| initial_value(alg, pcr)).collect(),
            })
            .collect();
        Self { pcr_count, banks }
    }

    pub fn pcr_count(&self) -> usize {
        self.pcr_count
    }

    pub fn allocated(&self) -> impl Iterator<Item = HashAlg> + '_ {
        self.banks.iter().map(|b| b.alg)
    }

    fn bank(&self, alg: HashAlg) -> Option<&PcrBank> {
        self.banks.iter().find(|b| b.alg == alg)
    }

    /// Value of `pcr` in the `alg` bank, if allocated.
    pub fn value(&self, alg: HashAlg, pcr: usize) -> Option<&[u8]> {
        let bank = self.bank(alg)?;
        if !is_selected(&bank.select, pcr) {
            return None;
        }
        bank.values.get(pcr).map(Vec::as_slice)
    }

    /// Extends `pcr` in the bank of `alg`. Digests for unallocated banks
    /// are ignored. Returns whether anything changed.
    pub fn extend(&mut self, pcr: usize, alg: HashAlg, digest: &[u8]) -> bool {
        let Some(bank) = self.banks.iter_mut().find(|b| b.alg == alg) else {
            return false;
        };
        if !is_selected(&bank.select, pcr) {
            return false;
        }
        let Some(value) = bank.values.get_mut(pcr) else {
            return false;
        };
        *value = alg.digest(&[value.as_slice(), digest]);
        true
    }

    /// Sets `pcr` back to zero in every bank.
    pub fn reset(&mut self, pcr: usize) {
        for bank in self.banks.iter_mut() {
            if let Some(value) = bank.values.get_mut(pcr) {
                value.fill(0);
            }
        }
    }

    /// Resets every PCR to its initial value.
    pub fn reset_all(&mut self) {
        for bank in self.banks.iter_mut() {
            for (pcr, value) in bank.values.iter_mut().enumerate() {
                *value = initial_value(bank.alg, pcr);
            }
        }
    }

    /// Reads the selected PCRs. Stops after [`MAX_PCR_READ_DIGESTS`]
    /// values; the returned selection reports what was actually read.
    pub fn read(&self, selection: &PcrSelectionList) -> (PcrSelectionList, DigestList) {
        let mut out_sel = Vec::new();
        let mut digests = Vec::new();
        for sel in selection.0.iter() {
            let mut read = PcrSelection {
                hash: sel.hash,
                select: [0; PCR_SELECT_SIZE],
            };
            for pcr in 0..PCR_SELECT_SIZE * 8 {
                if !is_selected(&sel.select, pcr) || digests.len() >= MAX_PCR_READ_DIGESTS {
                    continue;
                }
                if let Some(value) = self.value(sel.hash, pcr) {
                    if let Ok(d) = Tpm2bDigest::new(value) {
                        digests.push(d);
                        set_selected(&mut read.select, pcr);
                    }
                }
            }
            out_sel.push(read);
        }
        (PcrSelectionList(out_sel), DigestList(digests))
    }

    /// Copies the state-saved PCRs into `save`.
    pub fn save(&self, save: &mut PcrSave) {
        for bank in self.banks.iter() {
            let data: Vec<u8> = bank
                .values
                .iter()
                .take(SAVED_PCR_COUNT)
                .flatten()
                .copied()
                .collect();
            if data.len() == PcrSave::bank_size(bank.alg) {
                save.set_bank(bank.alg, &data);
            }
        }
    }

    /// Restores the state-saved PCRs from `save`.
    pub fn restore(&mut self, save: &PcrSave) {
        for bank in self.banks.iter_mut() {
            let size = bank.alg.digest_size();
            let saved = save.bank(bank.alg).chunks_exact(size);
            for (pcr, (value, data)) in bank.values.iter_mut().zip(saved).enumerate() {
                if attributes(pcr).state_save {
                    value.copy_from_slice(data);
                }
            }
        }
    }
}

impl Marshal for PcrBanks {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        let mut len = (self.pcr_count as u8).marshal(out) + (self.banks.len() as u8).marshal(out);
        for bank in self.banks.iter() {
            len += bank.alg.marshal(out);
            out.extend_from_slice(&bank.select);
            len += PCR_SELECT_SIZE;
            for value in bank.values.iter() {
                out.extend_from_slice(value);
                len += value.len();
            }
        }
        len
    }
}

impl Unmarshal for PcrBanks {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        let pcr_count = usize::from(cur.u8()?);
        if pcr_count > PCR_SELECT_SIZE * 8 {
            return Err(MarshalError::Value);
        }
        let count = usize::from(cur.u8()?);
        if count > HASH_COUNT {
            return Err(MarshalError::Size);
        }
        let mut banks: Vec<PcrBank> = Vec::with_capacity(count);
        for _ in 0..count {
            let alg = HashAlg::unmarshal(cur)?;
            if banks.iter().any(|b| b.alg == alg) {
                return Err(MarshalError::Value);
            }
            let mut select = [0u8; PCR_SELECT_SIZE];
            select.copy_from_slice(cur.take(PCR_SELECT_SIZE)?);
            let mut values = Vec::with_capacity(pcr_count);
            for _ in 0..pcr_count {
                values.push(cur.take(alg.digest_size())?.to_vec());
            }
            banks.push(PcrBank {
                alg,
                select,
                values,
            });
        }
        Ok(Self { pcr_count, banks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banks() -> PcrBanks {
        let alloc = PcrAllocation::new(&[HashAlg::Sha256, HashAlg::Sha384], 24);
        PcrBanks::new(&alloc, 24)
    }

    #[test]
    fn extend_chains_digests() {
        let mut pcrs = banks();
        let digest = [0x11u8; 32];
        assert!(pcrs.extend(0, HashAlg::Sha256, &digest));
        let expected = HashAlg::Sha256.digest(&[&[0u8; 32], &digest]);
        assert_eq!(pcrs.value(HashAlg::Sha256, 0), Some(expected.as_slice()));
        // SHA-512 is not allocated
        assert!(!pcrs.extend(0, HashAlg::Sha512, &[0u8; 64]));
        assert_eq!(pcrs.value(HashAlg::Sha384, 0), Some(&[0u8; 48][..]));
    }

    #[test]
    fn drtm_pcrs_start_at_ones() {
        let mut pcrs = banks();
        assert_eq!(pcrs.value(HashAlg::Sha256, 17), Some(&[0xffu8; 32][..]));
        pcrs.reset(17);
        assert_eq!(pcrs.value(HashAlg::Sha256, 17), Some(&[0u8; 32][..]));
        pcrs.reset_all();
        assert_eq!(pcrs.value(HashAlg::Sha256, 17), Some(&[0xffu8; 32][..]));
    }

    #[test]
    fn read_is_bounded() {
        let pcrs = banks();
        let sel = PcrSelectionList(vec![
            PcrSelection {
                hash: HashAlg::Sha256,
                select: [0xff, 0x0f, 0],
            },
            PcrSelection {
                hash: HashAlg::Sha512,
                select: [0x01, 0, 0],
            },
        ]);
        let (out, digests) = pcrs.read(&sel);
        assert_eq!(digests.0.len(), MAX_PCR_READ_DIGESTS);
        assert_eq!(out.0[0].select, [0xff, 0, 0]);
        assert_eq!(out.0[1].select, [0, 0, 0]);
    }

    #[test]
    fn save_restore_only_saved_pcrs() {
        let mut pcrs = banks();
        pcrs.extend(3, HashAlg::Sha256, &[1u8; 32]);
        pcrs.extend(16, HashAlg::Sha256, &[1u8; 32]);
        let mut save = PcrSave::default();
        pcrs.save(&mut save);
        let before = pcrs.clone();

        pcrs.reset_all();
        pcrs.restore(&save);
        assert_eq!(pcrs.value(HashAlg::Sha256, 3), before.value(HashAlg::Sha256, 3));
        assert_eq!(pcrs.value(HashAlg::Sha256, 16), Some(&[0u8; 32][..]));
    }

    #[test]
    fn selection_wire_format() {
        let data = [0x00, 0x0b, 0x02, 0x01, 0x80];
        let sel = PcrSelection::unmarshal(&mut Cursor::new(&data)).expect("Failed to decode selection");
        assert_eq!(sel.select, [0x01, 0x80, 0x00]);
        let data = [0x00, 0x0b, 0x04, 0, 0, 0, 0];
        assert_eq!(PcrSelection::unmarshal(&mut Cursor::new(&data)), Err(MarshalError::Value));
    }

    #[test]
    fn localities() {
        assert!(can_reset(16, 0));
        assert!(!can_reset(0, 0));
        assert!(!can_reset(17, 0));
        assert!(can_reset(17, 4));
        assert!(can_extend(0, 3));
        assert!(!can_extend(21, 0));
    }
}
