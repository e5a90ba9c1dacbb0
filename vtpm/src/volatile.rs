// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Volatile state snapshots.
//!
//! A snapshot carries everything a powered TPM keeps only in RAM: the
//! state-reset, state-clear and orderly aggregates as they stand between
//! two commands, the index cache, the object and session tables, the PCR
//! banks and the failure latch. The persistent aggregate and all NV
//! entries stay in NV and are not part of it.
//!
//! The blob is a sequence of sections, each starting with a
//! `(version:u16, magic:u32)` header, followed by a SHA-256 digest of all
//! preceding bytes. The digest algorithm is fixed and does not depend on
//! the PCR banks or any other configured algorithm.
//!
//! A snapshot is applied completely or not at all. A rejected snapshot
//! puts the engine into failure mode.

use crate::crypto::{ct_eq, HashAlg};
use crate::engine::Engine;
use crate::error::TpmError;
use crate::failure::{FatalCode, Fault, FaultRecord};
use crate::marshal::{Cursor, Marshal, MarshalError, Unmarshal};
use crate::nv::{IndexCache, NvUpdate};
use crate::object::ObjectTable;
use crate::pcr::PcrBanks;
use crate::session::{handle_index, SessionTable};
use crate::state::{OrderlyData, SessionContext, StateClearData, StateResetData};
use alloc::vec::Vec;

const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_DIGEST: HashAlg = HashAlg::Sha256;
const DIGEST_SIZE: usize = 32;

/// Section magics, in snapshot order.
mod magic {
    pub const HEADER: u32 = 0x5654_5056; // "VTPV"
    pub const ENGINE: u32 = 0x454e_4731;
    pub const FAILURE: u32 = 0x4641_494c;
    pub const STATE_RESET: u32 = 0x5352_5354;
    pub const STATE_CLEAR: u32 = 0x5343_4c52;
    pub const ORDERLY: u32 = 0x4f52_444c;
    pub const INDEX_CACHE: u32 = 0x4e56_4348;
    pub const OBJECTS: u32 = 0x4f42_4a53;
    pub const SESSIONS: u32 = 0x5345_5353;
    pub const PCRS: u32 = 0x5043_5253;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolatileError {
    /// The engine has not been powered on
    NotInitialized,
    /// The blob is too short to carry a digest
    Truncated,
    /// The trailing digest does not match the content
    Digest,
    /// A section header carries the wrong magic
    Magic,
    /// A section was written by an unknown version
    Version,
    /// A section body cannot be decoded
    Malformed(MarshalError),
    /// The snapshot was taken with a different configuration
    Config,
    /// Tables in the snapshot contradict each other
    Inconsistent,
}

impl From<MarshalError> for VolatileError {
    fn from(err: MarshalError) -> Self {
        Self::Malformed(err)
    }
}

impl From<VolatileError> for TpmError {
    fn from(err: VolatileError) -> Self {
        Self::Volatile(err)
    }
}

fn section(magic: u32, out: &mut Vec<u8>) {
    SNAPSHOT_VERSION.marshal(out);
    magic.marshal(out);
}

fn expect_section(cur: &mut Cursor<'_>, magic: u32) -> Result<(), VolatileError> {
    let version = cur.u16()?;
    if cur.u32()? != magic {
        return Err(VolatileError::Magic);
    }
    if version != SNAPSHOT_VERSION {
        return Err(VolatileError::Version);
    }
    Ok(())
}

impl Marshal for FaultRecord {
    fn marshal(&self, out: &mut Vec<u8>) -> usize {
        self.function.marshal(out) + self.line.marshal(out) + self.code.marshal(out)
    }
}

impl Unmarshal for FaultRecord {
    fn unmarshal(cur: &mut Cursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            function: cur.u32()?,
            line: cur.u32()?,
            code: cur.u32()?,
        })
    }
}

/// Decoded snapshot content, applied only once all of it checked out.
#[derive(Debug)]
struct Snapshot {
    started: bool,
    ph_enable: bool,
    exclusive_audit: Option<u32>,
    time: u64,
    fault: Option<FaultRecord>,
    fail_on_fail: u32,
    gr: StateResetData,
    gc: StateClearData,
    go: OrderlyData,
    index_cache: IndexCache,
    objects: ObjectTable,
    sessions: SessionTable,
    pcrs: PcrBanks,
}

impl Snapshot {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, VolatileError> {
        expect_section(cur, magic::HEADER)?;
        expect_section(cur, magic::ENGINE)?;
        let started = bool::unmarshal(cur)?;
        let ph_enable = bool::unmarshal(cur)?;
        let exclusive_audit = Option::<u32>::unmarshal(cur)?;
        let time = cur.u64()?;
        expect_section(cur, magic::FAILURE)?;
        let fault = Option::<FaultRecord>::unmarshal(cur)?;
        let fail_on_fail = cur.u32()?;
        expect_section(cur, magic::STATE_RESET)?;
        let gr = StateResetData::unmarshal(cur)?;
        expect_section(cur, magic::STATE_CLEAR)?;
        let gc = StateClearData::unmarshal(cur)?;
        expect_section(cur, magic::ORDERLY)?;
        let go = OrderlyData::unmarshal(cur)?;
        expect_section(cur, magic::INDEX_CACHE)?;
        let index_cache = IndexCache::unmarshal(cur)?;
        expect_section(cur, magic::OBJECTS)?;
        let objects = ObjectTable::unmarshal(cur)?;
        expect_section(cur, magic::SESSIONS)?;
        let sessions = SessionTable::unmarshal(cur)?;
        expect_section(cur, magic::PCRS)?;
        let pcrs = PcrBanks::unmarshal(cur)?;
        cur.end()?;
        Ok(Self {
            started,
            ph_enable,
            exclusive_audit,
            time,
            fault,
            fail_on_fail,
            gr,
            gc,
            go,
            index_cache,
            objects,
            sessions,
            pcrs,
        })
    }

    /// Checks that the snapshot fits `engine`: table sizes and optional
    /// blocks follow the configuration, and the context array and the
    /// session table agree on which sessions are loaded.
    fn check(&self, engine: &Engine) -> Result<(), VolatileError> {
        let config = &engine.config;
        if !self.gr.matches(config)
            || self.objects.capacity() != config.max_loaded_objects
            || self.sessions.capacity() != config.max_loaded_sessions
            || self.pcrs.pcr_count() != config.pcr_count
            || !self.pcrs.allocated().eq(engine.pcrs.allocated())
        {
            return Err(VolatileError::Config);
        }

        let mut referenced = 0;
        for (index, entry) in self.gr.context_array.iter().enumerate() {
            if let SessionContext::Loaded(slot) = entry {
                let session = self
                    .sessions
                    .get(*slot)
                    .ok_or(VolatileError::Inconsistent)?;
                if handle_index(session.handle) != index {
                    return Err(VolatileError::Inconsistent);
                }
                referenced += 1;
            }
        }
        if referenced != self.sessions.loaded().count() {
            return Err(VolatileError::Inconsistent);
        }
        Ok(())
    }
}

impl Engine {
    /// Serializes the RAM-only state of a powered engine.
    pub fn save_volatile(&mut self) -> Result<Vec<u8>, TpmError> {
        if !self.initialized {
            return Err(VolatileError::NotInitialized.into());
        }
        let time = self.time();
        let mut out = Vec::new();
        section(magic::HEADER, &mut out);
        section(magic::ENGINE, &mut out);
        self.started.marshal(&mut out);
        self.ph_enable.marshal(&mut out);
        self.exclusive_audit.marshal(&mut out);
        time.marshal(&mut out);
        section(magic::FAILURE, &mut out);
        self.failure.record().marshal(&mut out);
        self.failure.fail_on_fail().marshal(&mut out);
        section(magic::STATE_RESET, &mut out);
        self.gr.marshal(&mut out);
        section(magic::STATE_CLEAR, &mut out);
        self.gc.marshal(&mut out);
        section(magic::ORDERLY, &mut out);
        self.go.marshal(&mut out);
        section(magic::INDEX_CACHE, &mut out);
        self.index_cache.marshal(&mut out);
        section(magic::OBJECTS, &mut out);
        self.objects.marshal(&mut out);
        section(magic::SESSIONS, &mut out);
        self.sessions.marshal(&mut out);
        section(magic::PCRS, &mut out);
        self.pcrs.marshal(&mut out);

        let digest = SNAPSHOT_DIGEST.digest(&[out.as_slice()]);
        out.extend_from_slice(&digest);
        log::debug!("saved volatile state, {} bytes", out.len());
        Ok(out)
    }

    /// Replaces the RAM-only state with a snapshot taken by
    /// [`Engine::save_volatile`] on an engine with the same configuration
    /// and NV contents.
    ///
    /// The engine must have been powered on. Any other failure is fatal.
    pub fn restore_volatile(&mut self, blob: &[u8]) -> Result<(), TpmError> {
        if !self.initialized {
            return Err(VolatileError::NotInitialized.into());
        }
        match self.load_snapshot(blob) {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot);
                log::info!("restored volatile state");
                Ok(())
            }
            Err(err) => {
                log::warn!("rejected volatile snapshot: {:?}", err);
                log::error!("volatile state restore failed");
                self.enter_failure_mode(&Fault::new(FatalCode::VolatileState));
                Err(err.into())
            }
        }
    }

    fn load_snapshot(&self, blob: &[u8]) -> Result<Snapshot, VolatileError> {
        let split = blob
            .len()
            .checked_sub(DIGEST_SIZE)
            .ok_or(VolatileError::Truncated)?;
        let (content, stored) = blob.split_at(split);
        let digest = SNAPSHOT_DIGEST.digest(&[content]);
        if !ct_eq(&digest, stored) {
            return Err(VolatileError::Digest);
        }
        let snapshot = Snapshot::decode(&mut Cursor::new(content))?;
        snapshot.check(self)?;
        Ok(snapshot)
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.started = snapshot.started;
        self.ph_enable = snapshot.ph_enable;
        self.exclusive_audit = snapshot.exclusive_audit;
        self.failure.restore(snapshot.fault, snapshot.fail_on_fail);
        self.gr = snapshot.gr;
        self.gc = snapshot.gc;
        self.go = snapshot.go;
        self.index_cache = snapshot.index_cache;
        self.objects = snapshot.objects;
        self.objects.flush_shadows();
        self.sessions = snapshot.sessions;
        self.pcrs = snapshot.pcrs;
        self.nv_update = NvUpdate::None;
        self.clear_orderly = false;
        let now = self.platform.clock_ms();
        self.boot_ms = now.saturating_sub(snapshot.time);
        self.last_tick = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TpmConfig;
    use crate::engine::tests::powered_engine;
    use crate::platform::MemoryPlatform;
    use crate::types::*;
    use alloc::boxed::Box;

    fn command(code: u32, params: &[u8]) -> Vec<u8> {
        let mut cmd = Vec::new();
        TPM_ST_NO_SESSIONS.marshal(&mut cmd);
        ((TPM_HEADER_SIZE + params.len()) as u32).marshal(&mut cmd);
        code.marshal(&mut cmd);
        cmd.extend_from_slice(params);
        cmd
    }

    fn rc(response: &[u8]) -> u32 {
        u32::from_be_bytes([response[6], response[7], response[8], response[9]])
    }

    /// A started engine with a PCR extended and a hash sequence loaded.
    fn busy_engine() -> (Engine, MemoryPlatform) {
        busy_engine_with(TpmConfig::default())
    }

    fn busy_engine_with(config: TpmConfig) -> (Engine, MemoryPlatform) {
        let (mut engine, platform) = powered_engine(config);
        let rsp = engine.execute(&command(cc::STARTUP, &TPM_SU_CLEAR.to_be_bytes()), 4096);
        assert_eq!(rc(&rsp), 0);

        // PCR_Extend(16) with an empty password session
        let mut cmd = Vec::new();
        TPM_ST_SESSIONS.marshal(&mut cmd);
        0u32.marshal(&mut cmd);
        cc::PCR_EXTEND.marshal(&mut cmd);
        16u32.marshal(&mut cmd);
        9u32.marshal(&mut cmd);
        TPM_RS_PW.marshal(&mut cmd);
        0u16.marshal(&mut cmd);
        0u8.marshal(&mut cmd);
        0u16.marshal(&mut cmd);
        1u32.marshal(&mut cmd);
        TPM_ALG_SHA256.marshal(&mut cmd);
        cmd.extend_from_slice(&[0xab; 32]);
        let len = (cmd.len() as u32).to_be_bytes();
        cmd[2..6].copy_from_slice(&len);
        let rsp = engine.execute(&cmd, 4096);
        assert_eq!(rc(&rsp), 0);

        let mut params = Vec::new();
        0u16.marshal(&mut params);
        TPM_ALG_SHA256.marshal(&mut params);
        let rsp = engine.execute(&command(cc::HASH_SEQUENCE_START, &params), 4096);
        assert_eq!(rc(&rsp), 0);
        (engine, platform)
    }

    fn fresh_engine(platform: &MemoryPlatform) -> Engine {
        fresh_engine_with(platform, TpmConfig::default())
    }

    fn fresh_engine_with(platform: &MemoryPlatform, config: TpmConfig) -> Engine {
        let mut engine =
            Engine::new(Box::new(platform.clone()), config).expect("Failed to create engine");
        engine.power_on().expect("Failed to power on");
        engine
    }

    #[test]
    fn round_trip() {
        let (mut engine, platform) = busy_engine();
        let blob = engine.save_volatile().expect("Failed to save");

        let mut restored = fresh_engine(&platform);
        restored.restore_volatile(&blob).expect("Failed to restore");
        assert!(restored.started);
        assert_eq!(restored.gr, engine.gr);
        assert_eq!(restored.pcrs.value(HashAlg::Sha256, 16), engine.pcrs.value(HashAlg::Sha256, 16));
        assert_eq!(restored.save_volatile().expect("Failed to save"), blob);

        // The restored engine keeps executing commands
        let rsp = restored.execute(&command(cc::GET_RANDOM, &8u16.to_be_bytes()), 4096);
        assert_eq!(rc(&rsp), 0);
    }

    fn minimal_config() -> TpmConfig {
        TpmConfig {
            ecc: false,
            command_audit: false,
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_without_optional_state() {
        let (mut engine, platform) = busy_engine_with(minimal_config());
        let blob = engine.save_volatile().expect("Failed to save");

        let mut restored = fresh_engine_with(&platform, minimal_config());
        restored.restore_volatile(&blob).expect("Failed to restore");
        assert!(restored.started);
        assert_eq!(restored.gr, engine.gr);
        assert_eq!(restored.save_volatile().expect("Failed to save"), blob);

        let rsp = restored.execute(&command(cc::GET_RANDOM, &8u16.to_be_bytes()), 4096);
        assert_eq!(rc(&rsp), 0);
    }

    #[test]
    fn capability_flags_must_match() {
        let (mut full, _platform) = busy_engine();
        let full_blob = full.save_volatile().expect("Failed to save");
        let (mut minimal, _platform) = busy_engine_with(minimal_config());
        let minimal_blob = minimal.save_volatile().expect("Failed to save");

        let (mut target, _platform) = powered_engine(minimal_config());
        assert_eq!(
            target.restore_volatile(&full_blob),
            Err(TpmError::Volatile(VolatileError::Config))
        );
        let (mut target, _platform) = powered_engine(TpmConfig::default());
        assert_eq!(
            target.restore_volatile(&minimal_blob),
            Err(TpmError::Volatile(VolatileError::Config))
        );
    }

    #[test]
    fn corruption_is_fatal() {
        let (mut engine, platform) = busy_engine();
        let blob = engine.save_volatile().expect("Failed to save");
        for pos in [0, 7, blob.len() / 2, blob.len() - DIGEST_SIZE, blob.len() - 1] {
            let mut bad = blob.clone();
            bad[pos] ^= 0x01;
            let mut target = fresh_engine(&platform);
            assert_eq!(
                target.restore_volatile(&bad),
                Err(TpmError::Volatile(VolatileError::Digest))
            );
            assert!(target.is_failed());
            assert!(!target.started);
        }
    }

    #[test]
    fn truncated_blob_rejected() {
        let (_engine, platform) = busy_engine();
        let mut target = fresh_engine(&platform);
        assert_eq!(
            target.restore_volatile(&[0; 8]),
            Err(TpmError::Volatile(VolatileError::Truncated))
        );
        assert!(target.is_failed());
    }

    #[test]
    fn configuration_must_match() {
        let (mut engine, platform) = busy_engine();
        let blob = engine.save_volatile().expect("Failed to save");
        let config = TpmConfig {
            max_loaded_objects: 5,
            ..Default::default()
        };
        let mut target =
            Engine::new(Box::new(platform.clone()), config).expect("Failed to create engine");
        target.power_on().expect("Failed to power on");
        assert_eq!(
            target.restore_volatile(&blob),
            Err(TpmError::Volatile(VolatileError::Config))
        );
    }

    #[test]
    fn needs_power_on() {
        let config = TpmConfig::default();
        let platform = MemoryPlatform::new(config.nv_size);
        let mut engine = Engine::new(Box::new(platform), config).expect("Failed to create engine");
        assert_eq!(
            engine.save_volatile(),
            Err(TpmError::Volatile(VolatileError::NotInitialized))
        );
        assert!(!engine.is_failed());
    }
}
