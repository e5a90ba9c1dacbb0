// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Services the TPM core consumes from its host.

use crate::crypto::{CryptoError, HashAlg};
use crate::failure::FaultRecord;
use crate::nv::NvError;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::Debug;

/// Availability of the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NvReadyState {
    Ready,
    /// The store cannot be written at all
    Unavailable,
    /// Writes are temporarily throttled
    RateLimited,
}

/// Host platform as seen by the TPM core.
///
/// NV writes are buffered by the platform and only become durable with
/// [`Platform::nv_commit`], which the core calls at most once per command.
pub trait Platform: Debug {
    /// Reads `buf.len()` bytes of NV starting at `offset`.
    fn nv_read(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvError>;

    /// Writes `data` to NV at `offset`. Not durable until committed.
    fn nv_write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvError>;

    /// Makes all written data durable. Returns false on failure.
    fn nv_commit(&mut self) -> bool;

    fn nv_ready_state(&self) -> NvReadyState;

    /// Total size of the NV address space.
    fn nv_size(&self) -> usize;

    /// Monotonic time in milliseconds.
    fn clock_ms(&mut self) -> u64;

    /// Fills `buf` with entropy.
    fn get_entropy(&mut self, buf: &mut [u8]) -> Result<(), CryptoError>;

    /// Locality of the command being executed.
    fn locality(&self) -> u8 {
        0
    }

    /// Whether physical presence is currently asserted.
    fn physical_presence(&self) -> bool {
        false
    }

    /// Whether the host asked to cancel the running command.
    fn is_canceled(&self) -> bool {
        false
    }

    /// Notification that the TPM entered failure mode.
    fn fail(&mut self, _record: &FaultRecord) {}
}

#[derive(Debug)]
struct MemoryNv {
    image: Vec<u8>,
    committed: Vec<u8>,
    ready: NvReadyState,
    fail_commit: bool,
    fail_write: bool,
    commits: usize,
    clock: u64,
    locality: u8,
    physical_presence: bool,
    entropy_seed: [u8; 32],
    entropy_counter: u64,
    faults: Vec<FaultRecord>,
}

/// NV and platform services backed by RAM.
///
/// Clones share the same state, so a host (or a test) can keep a handle
/// to inspect the store, advance the clock or inject faults while the
/// engine owns another clone.
#[derive(Clone, Debug)]
pub struct MemoryPlatform {
    inner: Rc<RefCell<MemoryNv>>,
}

impl MemoryPlatform {
    pub fn new(nv_size: usize) -> Self {
        Self::with_seed(nv_size, [0x5a; 32])
    }

    pub fn with_seed(nv_size: usize, entropy_seed: [u8; 32]) -> Self {
        let nv = MemoryNv {
            image: vec![0xff; nv_size],
            committed: vec![0xff; nv_size],
            ready: NvReadyState::Ready,
            fail_commit: false,
            fail_write: false,
            commits: 0,
            clock: 0,
            locality: 0,
            physical_presence: false,
            entropy_seed,
            entropy_counter: 0,
            faults: Vec::new(),
        };
        Self {
            inner: Rc::new(RefCell::new(nv)),
        }
    }

    /// Makes every subsequent commit fail.
    pub fn set_commit_failure(&self, fail: bool) {
        self.inner.borrow_mut().fail_commit = fail;
    }

    /// Makes every subsequent NV write fail as unavailable, while the
    /// ready state keeps reporting what was set.
    pub fn set_write_failure(&self, fail: bool) {
        self.inner.borrow_mut().fail_write = fail;
    }

    pub fn set_ready_state(&self, state: NvReadyState) {
        self.inner.borrow_mut().ready = state;
    }

    pub fn commit_count(&self) -> usize {
        self.inner.borrow().commits
    }

    pub fn advance_clock(&self, ms: u64) {
        let mut nv = self.inner.borrow_mut();
        nv.clock = nv.clock.saturating_add(ms);
    }

    pub fn set_locality(&self, locality: u8) {
        self.inner.borrow_mut().locality = locality;
    }

    pub fn set_physical_presence(&self, asserted: bool) {
        self.inner.borrow_mut().physical_presence = asserted;
    }

    /// Drops every uncommitted write, as a power loss would.
    pub fn power_cycle(&self) {
        let mut nv = self.inner.borrow_mut();
        nv.image = nv.committed.clone();
    }

    /// Copy of the durable NV contents.
    pub fn committed(&self) -> Vec<u8> {
        self.inner.borrow().committed.clone()
    }

    /// Overwrites both NV images.
    pub fn load_image(&self, image: &[u8]) {
        let mut nv = self.inner.borrow_mut();
        let len = image.len().min(nv.image.len());
        nv.image[..len].copy_from_slice(&image[..len]);
        nv.committed = nv.image.clone();
    }

    /// Failure notifications received so far.
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.inner.borrow().faults.clone()
    }
}

impl Platform for MemoryPlatform {
    fn nv_read(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvError> {
        let nv = self.inner.borrow();
        let src = offset
            .checked_add(buf.len())
            .and_then(|end| nv.image.get(offset..end))
            .ok_or(NvError::OutOfRange)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn nv_write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvError> {
        let mut nv = self.inner.borrow_mut();
        if nv.fail_write || nv.ready == NvReadyState::Unavailable {
            return Err(NvError::Unavailable);
        }
        let dst = offset
            .checked_add(data.len())
            .and_then(|end| nv.image.get_mut(offset..end))
            .ok_or(NvError::OutOfRange)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn nv_commit(&mut self) -> bool {
        let mut nv = self.inner.borrow_mut();
        nv.commits += 1;
        if nv.fail_commit || nv.ready == NvReadyState::Unavailable {
            return false;
        }
        nv.committed = nv.image.clone();
        true
    }

    fn nv_ready_state(&self) -> NvReadyState {
        self.inner.borrow().ready
    }

    fn nv_size(&self) -> usize {
        self.inner.borrow().image.len()
    }

    fn clock_ms(&mut self) -> u64 {
        self.inner.borrow().clock
    }

    fn get_entropy(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        let mut nv = self.inner.borrow_mut();
        for chunk in buf.chunks_mut(32) {
            nv.entropy_counter += 1;
            let block = HashAlg::Sha256.digest(&[&nv.entropy_seed, &nv.entropy_counter.to_be_bytes()]);
            chunk.copy_from_slice(&block[..chunk.len()]);
        }
        Ok(())
    }

    fn locality(&self) -> u8 {
        self.inner.borrow().locality
    }

    fn physical_presence(&self) -> bool {
        self.inner.borrow().physical_presence
    }

    fn fail(&mut self, record: &FaultRecord) {
        self.inner.borrow_mut().faults.push(*record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_need_commit_to_survive() {
        let mut platform = MemoryPlatform::new(64);
        let observer = platform.clone();
        platform.nv_write(4, &[1, 2, 3]).expect("Failed to write NV");
        assert!(platform.nv_commit());
        platform.nv_write(4, &[9]).expect("Failed to write NV");
        observer.power_cycle();

        let mut buf = [0u8; 3];
        platform.nv_read(4, &mut buf).expect("Failed to read NV");
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(observer.commit_count(), 1);
    }

    #[test]
    fn out_of_range_and_failures() {
        let mut platform = MemoryPlatform::new(16);
        assert_eq!(platform.nv_write(15, &[0, 0]), Err(NvError::OutOfRange));
        platform.set_commit_failure(true);
        assert!(!platform.nv_commit());
        platform.set_ready_state(NvReadyState::Unavailable);
        assert_eq!(platform.nv_write(0, &[0]), Err(NvError::Unavailable));
    }

    #[test]
    fn entropy_is_not_constant() {
        let mut platform = MemoryPlatform::new(16);
        let mut a = [0u8; 40];
        let mut b = [0u8; 40];
        platform.get_entropy(&mut a).expect("Failed to get entropy");
        platform.get_entropy(&mut b).expect("Failed to get entropy");
        assert_ne!(a, b);
    }
}
