// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;
use vtpm::{Engine, MemoryPlatform, TpmConfig};

const MAX_RESPONSE_SIZE: usize = 4096;

/// Committed NV image of a manufactured TPM, built once.
fn manufactured_image() -> &'static [u8] {
    static IMAGE: OnceLock<Vec<u8>> = OnceLock::new();
    IMAGE.get_or_init(|| {
        let config = TpmConfig::default();
        let platform = MemoryPlatform::new(config.nv_size);
        let mut engine = Engine::new(Box::new(platform.clone()), config).unwrap();
        engine.manufacture(true).unwrap();
        platform.committed()
    })
}

/// A restored snapshot may carry a latched fault, so only the shape of
/// the response is checked.
fn check_response(engine: &Engine, rsp: &[u8]) {
    assert!(rsp.len() >= 10);
    let size = u32::from_be_bytes([rsp[2], rsp[3], rsp[4], rsp[5]]) as usize;
    assert_eq!(size, rsp.len());
    let rc = u32::from_be_bytes([rsp[6], rsp[7], rsp[8], rsp[9]]);
    if engine.is_failed() {
        // Failure mode answers GetRandom with TPM_RC_COMMAND_CODE
        assert_eq!(rc, 0x143);
        assert_eq!(rsp.len(), 10);
    } else if rc == 0 {
        assert_eq!(rsp.len(), 10 + 2 + 8);
    } else {
        assert_eq!(rsp.len(), 10);
    }
}

fuzz_target!(|data: &[u8]| {
    let config = TpmConfig::default();
    let platform = MemoryPlatform::new(config.nv_size);
    platform.load_image(manufactured_image());
    let mut engine = Engine::new(Box::new(platform), config).unwrap();
    engine.power_on().unwrap();

    match engine.restore_volatile(data) {
        Ok(()) => {
            // TPM2_GetRandom(8)
            let cmd = [
                0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x7b, 0x00, 0x08,
            ];
            let rsp = engine.execute(&cmd, MAX_RESPONSE_SIZE);
            check_response(&engine, &rsp);
        }
        Err(_) => assert!(engine.is_failed()),
    }
});
