// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! The TPM context.
//!
//! [`Engine`] owns every piece of TPM state: the four state aggregates, the
//! transient object, session and PCR tables and the failure latch. Commands
//! run with exclusive access to it, one at a time.

use crate::config::TpmConfig;
use crate::crypto::drbg::HmacDrbg;
use crate::error::TpmError;
use crate::failure::{FailureGovernor, FatalCode, Fault, FaultRecord};
use crate::nv::{IndexCache, NvError, NvIndex, NvLayout, NvUpdate};
use crate::object::ObjectTable;
use crate::pcr::PcrBanks;
use crate::platform::{NvReadyState, Platform};
use crate::rc::{TpmRc, TpmReqError};
use crate::session::SessionTable;
use crate::state::{OrderlyData, PersistentData, StateClearData, StateResetData};
use crate::types::*;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

/// Entropy drawn to instantiate the DRBG.
const ENTROPY_SIZE: usize = 48;
/// Entropy drawn to reseed the DRBG.
const RESEED_ENTROPY_SIZE: usize = 32;
/// Clock is flushed to NV whenever it crosses a multiple of 2^22 ms.
pub(crate) const CLOCK_UPDATE_SHIFT: u32 = 22;

#[derive(Debug)]
pub struct Engine {
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) config: TpmConfig,
    pub(crate) layout: NvLayout,
    pub(crate) gp: PersistentData,
    pub(crate) gr: StateResetData,
    pub(crate) gc: StateClearData,
    pub(crate) go: OrderlyData,
    pub(crate) index_cache: IndexCache,
    pub(crate) objects: ObjectTable,
    pub(crate) sessions: SessionTable,
    pub(crate) pcrs: PcrBanks,
    pub(crate) failure: FailureGovernor,
    /// power_on() loaded the state from NV
    pub(crate) initialized: bool,
    /// Startup was accepted
    pub(crate) started: bool,
    /// Platform hierarchy enable, cleared by HierarchyControl until the
    /// next Startup(CLEAR)
    pub(crate) ph_enable: bool,
    /// Session that audited every command since it was last used
    pub(crate) exclusive_audit: Option<u32>,
    /// Write intent of the running command
    pub(crate) nv_update: NvUpdate,
    /// The running command changed state that an orderly shutdown saved
    pub(crate) clear_orderly: bool,
    /// Platform time at power on
    pub(crate) boot_ms: u64,
    /// Platform time of the last clock update
    pub(crate) last_tick: u64,
}

impl Engine {
    /// Creates an engine on top of `platform`. Does not touch NV.
    pub fn new(platform: Box<dyn Platform>, config: TpmConfig) -> Result<Self, TpmError> {
        config.validate()?;
        let layout = NvLayout::new(&config)?;
        if platform.nv_size() < config.nv_size {
            return Err(TpmError::Config("platform NV is smaller than nv_size"));
        }
        let gp = PersistentData::new(&config);
        let pcrs = PcrBanks::new(&gp.pcr_allocated, config.pcr_count);
        Ok(Self {
            platform,
            layout,
            gr: StateResetData::new(&config),
            gc: StateClearData::default(),
            go: OrderlyData::default(),
            index_cache: IndexCache::default(),
            objects: ObjectTable::new(config.max_loaded_objects),
            sessions: SessionTable::new(config.max_loaded_sessions),
            pcrs,
            gp,
            config,
            failure: FailureGovernor::default(),
            initialized: false,
            started: false,
            ph_enable: false,
            exclusive_audit: None,
            nv_update: NvUpdate::None,
            clear_orderly: false,
            boot_ms: 0,
            last_tick: 0,
        })
    }

    pub fn config(&self) -> &TpmConfig {
        &self.config
    }

    /// Writes a freshly manufactured TPM to NV.
    ///
    /// Unless `first_time` is set, a store that already carries valid
    /// persistent data is left alone and `Ok(false)` is returned.
    pub fn manufacture(&mut self, first_time: bool) -> Result<bool, TpmError> {
        if !first_time && self.layout.has_valid::<PersistentData>(&*self.platform) {
            log::info!("TPM already manufactured");
            return Ok(false);
        }

        let mut entropy = [0u8; ENTROPY_SIZE];
        self.platform.get_entropy(&mut entropy)?;
        let (seed, nonce) = entropy.split_at(RESEED_ENTROPY_SIZE);
        let mut drbg = HmacDrbg::instantiate(seed, nonce, b"manufacture");

        let mut gp = PersistentData::new(&self.config);
        // A new TPM starts as if it had been shut down orderly
        gp.orderly_state = TPM_SU_CLEAR;
        for secret in [
            &mut gp.eps_seed,
            &mut gp.sps_seed,
            &mut gp.pps_seed,
            &mut gp.eh_proof,
            &mut gp.sh_proof,
            &mut gp.ph_proof,
        ] {
            drbg.generate(secret, &[]);
        }
        let mut gr = StateResetData::new(&self.config);
        drbg.generate(&mut gr.null_proof, &[]);
        drbg.generate(&mut gr.null_seed, &[]);
        let gc = StateClearData::default();
        let go = OrderlyData {
            drbg,
            ..Default::default()
        };
        let index_cache = IndexCache::default();

        let platform = &mut *self.platform;
        self.layout.store(platform, &gp)?;
        self.layout.store(platform, &gr)?;
        self.layout.store(platform, &gc)?;
        self.layout.store(platform, &go)?;
        self.layout.store(platform, &index_cache)?;
        self.layout.format_entries(platform)?;
        if !platform.nv_commit() {
            log::error!("NV commit failed during manufacture");
            return Err(TpmError::Nv(NvError::Unavailable));
        }

        self.pcrs = PcrBanks::new(&gp.pcr_allocated, self.config.pcr_count);
        self.gp = gp;
        self.gr = gr;
        self.gc = gc;
        self.go = go;
        self.index_cache = index_cache;
        self.initialized = false;
        self.started = false;
        log::info!("TPM manufactured");
        Ok(true)
    }

    /// Forgets the manufactured state held in RAM.
    pub fn teardown(&mut self) {
        self.gp = PersistentData::new(&self.config);
        self.gr = StateResetData::new(&self.config);
        self.gc = StateClearData::default();
        self.go = OrderlyData::default();
        self.index_cache = IndexCache::default();
        self.objects.clear();
        self.sessions.clear();
        self.pcrs = PcrBanks::new(&self.gp.pcr_allocated, self.config.pcr_count);
        self.initialized = false;
        self.started = false;
        self.exclusive_audit = None;
    }

    /// _TPM_Init: loads all state aggregates from NV and waits for
    /// Startup.
    pub fn power_on(&mut self) -> Result<(), TpmError> {
        if self.failure.is_failed() {
            return Err(TpmError::Failed);
        }
        let platform = &*self.platform;
        let gp = self.layout.load::<PersistentData>(platform, &self.config)?;
        let gr = self.layout.load::<StateResetData>(platform, &self.config)?;
        let gc = self.layout.load::<StateClearData>(platform, &self.config)?;
        let go = self.layout.load::<OrderlyData>(platform, &self.config)?;
        let index_cache = self.layout.load::<IndexCache>(platform, &self.config)?;

        self.pcrs = PcrBanks::new(&gp.pcr_allocated, self.config.pcr_count);
        self.gp = gp;
        self.gr = gr;
        self.gc = gc;
        self.go = go;
        self.index_cache = index_cache;
        self.objects.clear();
        self.sessions.clear();
        self.exclusive_audit = None;
        self.nv_update = NvUpdate::None;
        self.clear_orderly = false;
        self.ph_enable = false;
        self.started = false;
        self.initialized = true;
        self.boot_ms = self.platform.clock_ms();
        self.last_tick = self.boot_ms;
        log::info!(
            "TPM power on: reset count {}, orderly state {:#x}",
            self.gp.reset_count,
            self.gp.orderly_state
        );
        Ok(())
    }

    /// Executes a command and returns the response, which is at most
    /// `max_response_size` bytes long.
    pub fn execute(&mut self, request: &[u8], max_response_size: usize) -> Vec<u8> {
        let mut response = vec![0u8; max_response_size.max(TPM_HEADER_SIZE)];
        let len = self.execute_into(request, &mut response);
        response.truncate(len);
        response
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_failed()
    }

    /// The fault that put the engine into failure mode.
    pub fn fault(&self) -> Option<FaultRecord> {
        self.failure.record()
    }

    /// Latches failure mode and notifies the platform.
    pub(crate) fn enter_failure_mode(&mut self, fault: &Fault) {
        let record = self.failure.trip(fault);
        self.platform.fail(&record);
    }

    /// Fills `buf` from the DRBG, reseeding it when due.
    pub(crate) fn random(&mut self, buf: &mut [u8]) -> Result<(), TpmReqError> {
        if self.go.drbg.needs_reseed() {
            let mut entropy = [0u8; RESEED_ENTROPY_SIZE];
            self.platform
                .get_entropy(&mut entropy)
                .map_err(|_| Fault::new(FatalCode::Entropy))?;
            self.go.drbg.reseed(&entropy, &[]);
        }
        self.go.drbg.generate(buf, &[]);
        Ok(())
    }

    /// Fails unless NV can be written right now.
    pub(crate) fn nv_available(&self) -> Result<(), TpmReqError> {
        match self.platform.nv_ready_state() {
            NvReadyState::Ready => Ok(()),
            NvReadyState::Unavailable => Err(TpmReqError::rc(TpmRc::NV_UNAVAILABLE)),
            NvReadyState::RateLimited => Err(TpmReqError::rc(TpmRc::NV_RATE)),
        }
    }

    /// Writes the persistent data and records the write intent.
    pub(crate) fn write_persistent(&mut self) -> Result<(), TpmReqError> {
        self.layout.store(&mut *self.platform, &self.gp)?;
        self.nv_update.raise(NvUpdate::Nv);
        Ok(())
    }

    pub(crate) fn write_state_reset(&mut self) -> Result<(), TpmReqError> {
        self.layout.store(&mut *self.platform, &self.gr)?;
        self.nv_update.raise(NvUpdate::Nv);
        Ok(())
    }

    pub(crate) fn write_state_clear(&mut self) -> Result<(), TpmReqError> {
        self.layout.store(&mut *self.platform, &self.gc)?;
        self.nv_update.raise(NvUpdate::Nv);
        Ok(())
    }

    /// The NV index `handle` with the data of an orderly index taken from
    /// the index cache.
    pub(crate) fn nv_index(&self, handle: u32) -> Result<NvIndex, TpmReqError> {
        let entry = self
            .layout
            .find_entry(&*self.platform, handle)?
            .ok_or_else(TpmReqError::handle)?;
        let mut index =
            NvIndex::decode(&entry.body).map_err(|_| Fault::new(FatalCode::NvUnrecoverable))?;
        if index.is_orderly() {
            index.data = self
                .index_cache
                .get(handle)
                .ok_or_else(|| Fault::new(FatalCode::NvUnrecoverable))?
                .to_vec();
        }
        Ok(index)
    }

    /// Name of the entity behind a resolved handle. Objects and NV indices
    /// have a digest name, everything else is named by its handle.
    pub(crate) fn entity_name(&self, handle: u32) -> Result<Vec<u8>, TpmReqError> {
        match handle_type(handle) {
            HT_TRANSIENT | HT_PERSISTENT => self
                .objects
                .get(handle)
                .map(|slot| slot.name(handle))
                .ok_or_else(TpmReqError::handle),
            HT_NV_INDEX => Ok(self.nv_index(handle)?.public.name()),
            _ => Ok(handle.to_be_bytes().to_vec()),
        }
    }

    /// Whether the hierarchy `handle` is enabled. TPM_RH_NULL always is.
    pub(crate) fn hierarchy_enabled(&self, handle: u32) -> bool {
        match handle {
            TPM_RH_OWNER => self.gc.sh_enable,
            TPM_RH_ENDORSEMENT => self.gc.eh_enable,
            TPM_RH_PLATFORM => self.ph_enable,
            TPM_RH_NULL => true,
            _ => false,
        }
    }

    /// Milliseconds since power on.
    pub(crate) fn time(&mut self) -> u64 {
        self.platform.clock_ms().saturating_sub(self.boot_ms)
    }

    /// Advances Clock by the platform time elapsed since the last command.
    /// Crossing an update interval schedules an orderly flush of Clock.
    pub(crate) fn update_time(&mut self) {
        let now = self.platform.clock_ms();
        let delta = now.saturating_sub(self.last_tick);
        self.last_tick = now;
        let old = self.go.clock;
        self.go.clock = old.saturating_add(delta);
        if old >> CLOCK_UPDATE_SHIFT != self.go.clock >> CLOCK_UPDATE_SHIFT
            && self.platform.nv_ready_state() == NvReadyState::Ready
        {
            self.go.clock_safe = true;
            self.nv_update.raise(NvUpdate::Orderly);
        }
    }

    /// Recovers dictionary attack failures and lockout authorization as
    /// Clock advances. Recovery only takes effect once it is written to
    /// NV; while NV is not ready it is deferred.
    pub(crate) fn da_self_heal(&mut self) -> Result<(), TpmReqError> {
        let clock = self.go.clock;
        let mut failed_tries = self.gp.failed_tries;
        let mut lockout_auth_enabled = self.gp.lockout_auth_enabled;
        let mut self_heal_timer = self.go.self_heal_timer;

        if failed_tries == 0 || self.gp.recovery_time == 0 {
            self_heal_timer = clock;
        } else {
            let step = u64::from(self.gp.recovery_time) * 1000;
            let steps = clock.saturating_sub(self_heal_timer) / step;
            if steps > 0 {
                let heal = u32::try_from(steps).unwrap_or(u32::MAX);
                failed_tries = failed_tries.saturating_sub(heal);
                self_heal_timer += steps * step;
            }
        }

        if !lockout_auth_enabled {
            let recovery = u64::from(self.gp.lockout_recovery) * 1000;
            if recovery != 0 && clock.saturating_sub(self.go.lockout_timer) >= recovery {
                lockout_auth_enabled = true;
            }
        }

        let unchanged = failed_tries == self.gp.failed_tries
            && lockout_auth_enabled == self.gp.lockout_auth_enabled;
        if unchanged {
            self.go.self_heal_timer = self_heal_timer;
            return Ok(());
        }
        if self.platform.nv_ready_state() != NvReadyState::Ready {
            return Ok(());
        }

        let old = (self.gp.failed_tries, self.gp.lockout_auth_enabled);
        self.gp.failed_tries = failed_tries;
        self.gp.lockout_auth_enabled = lockout_auth_enabled;
        if let Err(err) = self.write_persistent() {
            log::error!("failed to write dictionary attack state");
            (self.gp.failed_tries, self.gp.lockout_auth_enabled) = old;
            return Err(err);
        }
        self.go.self_heal_timer = self_heal_timer;
        Ok(())
    }

    /// Ends a command: flushes orderly data if requested and commits NV
    /// once. A failed commit is fatal.
    pub(crate) fn finish_command(&mut self) -> Result<(), Fault> {
        let update = core::mem::take(&mut self.nv_update);
        let clear_orderly = core::mem::take(&mut self.clear_orderly);
        self.objects.flush_shadows();

        let mut update = update;
        if clear_orderly && self.gp.orderly_state != crate::state::SHUTDOWN_NONE {
            self.gp.orderly_state = crate::state::SHUTDOWN_NONE;
            self.layout
                .store(&mut *self.platform, &self.gp)
                .map_err(|_| Fault::new(FatalCode::NvUnrecoverable))?;
            update.raise(NvUpdate::Nv);
        }
        if update == NvUpdate::Orderly {
            let platform = &mut *self.platform;
            self.layout
                .store(platform, &self.go)
                .and_then(|_| self.layout.store(platform, &self.index_cache))
                .map_err(|_| Fault::new(FatalCode::NvUnrecoverable))?;
        }
        if update != NvUpdate::None && !self.platform.nv_commit() {
            log::error!("NV commit failed");
            return Err(Fault::new(FatalCode::NvUnrecoverable));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::MemoryPlatform;

    /// A manufactured and powered-on engine, plus a handle to its platform.
    pub(crate) fn powered_engine(config: TpmConfig) -> (Engine, MemoryPlatform) {
        let platform = MemoryPlatform::new(config.nv_size);
        let mut engine =
            Engine::new(Box::new(platform.clone()), config).expect("Failed to create engine");
        assert_eq!(engine.manufacture(true), Ok(true));
        engine.power_on().expect("Failed to power on");
        (engine, platform)
    }

    #[test]
    fn manufacture_is_idempotent() {
        let config = TpmConfig::default();
        let platform = MemoryPlatform::new(config.nv_size);
        let mut engine = Engine::new(Box::new(platform.clone()), config)
            .expect("Failed to create engine");
        assert_eq!(engine.manufacture(false), Ok(true));
        let image = platform.committed();
        assert_eq!(engine.manufacture(false), Ok(false));
        assert_eq!(platform.committed(), image);
        assert_eq!(engine.manufacture(true), Ok(true));
        assert_ne!(engine.gp.eps_seed, [0; 32]);
        assert_ne!(engine.gp.eps_seed, engine.gp.sps_seed);
    }

    #[test]
    fn power_on_needs_manufactured_store() {
        let config = TpmConfig::default();
        let platform = MemoryPlatform::new(config.nv_size);
        let mut engine =
            Engine::new(Box::new(platform), config).expect("Failed to create engine");
        assert_eq!(engine.power_on(), Err(TpmError::Nv(NvError::BadMagic)));
        assert!(!engine.initialized);
    }

    #[test]
    fn undersized_platform_rejected() {
        let config = TpmConfig::default();
        let platform = MemoryPlatform::new(config.nv_size / 2);
        assert!(matches!(
            Engine::new(Box::new(platform), config),
            Err(TpmError::Config(_))
        ));
    }

    #[test]
    fn power_on_loads_aggregates() {
        let (mut engine, _platform) = powered_engine(TpmConfig::default());
        let gp = engine.gp.clone();
        engine.teardown();
        assert_ne!(engine.gp, gp);
        engine.power_on().expect("Failed to power on");
        assert_eq!(engine.gp, gp);
        assert!(engine.initialized);
        assert!(!engine.started);
    }

    #[test]
    fn drbg_output_changes_state() {
        let (mut engine, _platform) = powered_engine(TpmConfig::default());
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        engine.random(&mut a).expect("Failed to get random");
        engine.random(&mut b).expect("Failed to get random");
        assert_ne!(a, b);
    }

    #[test]
    fn failed_commit_is_fatal() {
        let (mut engine, platform) = powered_engine(TpmConfig::default());
        engine.write_persistent().expect("Failed to write");
        platform.set_commit_failure(true);
        assert!(engine.finish_command().is_err());
        assert_eq!(engine.nv_update, NvUpdate::None);
    }
}
