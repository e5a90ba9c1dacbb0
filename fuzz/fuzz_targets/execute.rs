// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vtpm::{Engine, MemoryPlatform, TpmConfig};

const MAX_RESPONSE_SIZE: usize = 4096;
const HEADER_SIZE: usize = 10;

#[derive(Arbitrary, Debug)]
enum EngineAction<'a> {
    Execute(&'a [u8]),
    /// Execute with the size field patched to the buffer length
    ExecuteSized(&'a [u8]),
    AdvanceClock(u32),
    SetLocality(u8),
    PhysicalPresence(bool),
    PowerCycle,
    SaveRestore,
}

/// Copies `cmd` into a buffer whose header size field matches its length,
/// so inputs get past the size check.
fn sized_command(cmd: &[u8]) -> Vec<u8> {
    let mut buf = cmd.to_vec();
    if buf.len() >= HEADER_SIZE {
        let len = buf.len() as u32;
        buf[2..6].copy_from_slice(&len.to_be_bytes());
    }
    buf
}

fn check_response(engine: &Engine, rsp: &[u8]) {
    assert!(rsp.len() >= HEADER_SIZE);
    assert!(rsp.len() <= MAX_RESPONSE_SIZE);
    let size = u32::from_be_bytes([rsp[2], rsp[3], rsp[4], rsp[5]]) as usize;
    assert_eq!(size, rsp.len());
    if engine.is_failed() {
        assert!(engine.fault().is_some());
    }
}

fn startup(engine: &mut Engine) {
    // TPM2_Startup(TPM_SU_CLEAR)
    let cmd = [
        0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x44, 0x00, 0x00,
    ];
    let rsp = engine.execute(&cmd, MAX_RESPONSE_SIZE);
    check_response(engine, &rsp);
}

fuzz_target!(|actions: Vec<EngineAction<'_>>| {
    let config = TpmConfig::default();
    let platform = MemoryPlatform::new(config.nv_size);
    let mut engine = Engine::new(Box::new(platform.clone()), config).unwrap();
    engine.manufacture(true).unwrap();
    engine.power_on().unwrap();
    startup(&mut engine);

    for action in actions.into_iter() {
        match action {
            EngineAction::Execute(cmd) => {
                let rsp = engine.execute(cmd, MAX_RESPONSE_SIZE);
                check_response(&engine, &rsp);
            }
            EngineAction::ExecuteSized(cmd) => {
                let rsp = engine.execute(&sized_command(cmd), MAX_RESPONSE_SIZE);
                check_response(&engine, &rsp);
            }
            EngineAction::AdvanceClock(ms) => platform.advance_clock(u64::from(ms)),
            EngineAction::SetLocality(locality) => platform.set_locality(locality % 5),
            EngineAction::PhysicalPresence(asserted) => platform.set_physical_presence(asserted),
            EngineAction::PowerCycle => {
                engine.teardown();
                platform.power_cycle();
                if engine.power_on().is_ok() {
                    startup(&mut engine);
                }
            }
            EngineAction::SaveRestore if !engine.is_failed() => {
                if let Ok(blob) = engine.save_volatile() {
                    engine.restore_volatile(&blob).unwrap();
                }
            }
            EngineAction::SaveRestore => {}
        }
    }
});
