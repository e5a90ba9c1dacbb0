// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Command scenarios driven through [`Engine::execute`] with raw command
//! buffers.

use crate::config::TpmConfig;
use crate::crypto::HashAlg;
use crate::engine::tests::powered_engine;
use crate::engine::Engine;
use crate::error::TpmError;
use crate::marshal::{marshal_bytes, marshal_sized, Marshal, Tpm2bDigest};
use crate::nv::index::NvPublic;
use crate::platform::MemoryPlatform;
use crate::rc::TpmRc;
use crate::types::*;
use alloc::vec;
use alloc::vec::Vec;

const MAX_RESPONSE: usize = 4096;
const NV_HANDLE: u32 = 0x0150_0001;

fn command(tag: u16, code: u32, handles: &[u32], sessions: &[u8], params: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    tag.marshal(&mut out);
    0u32.marshal(&mut out);
    code.marshal(&mut out);
    for handle in handles {
        handle.marshal(&mut out);
    }
    if tag == TPM_ST_SESSIONS {
        (sessions.len() as u32).marshal(&mut out);
        out.extend_from_slice(sessions);
    }
    out.extend_from_slice(params);
    let len = out.len() as u32;
    out[2..6].copy_from_slice(&len.to_be_bytes());
    out
}

fn plain(code: u32, handles: &[u32], params: &[u8]) -> Vec<u8> {
    command(TPM_ST_NO_SESSIONS, code, handles, &[], params)
}

fn password_session(auth: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    TPM_RS_PW.marshal(&mut out);
    marshal_bytes(&[], &mut out);
    SessionAttributes::CONTINUE_SESSION.bits().marshal(&mut out);
    marshal_bytes(auth, &mut out);
    out
}

fn with_password(code: u32, handles: &[u32], auth: &[u8], params: &[u8]) -> Vec<u8> {
    command(TPM_ST_SESSIONS, code, handles, &password_session(auth), params)
}

fn rc(rsp: &[u8]) -> TpmRc {
    TpmRc(u32::from_be_bytes([rsp[6], rsp[7], rsp[8], rsp[9]]))
}

/// Parameter area of a successful response with the sessions tag.
fn session_params(rsp: &[u8]) -> &[u8] {
    let size = u32::from_be_bytes([rsp[10], rsp[11], rsp[12], rsp[13]]) as usize;
    &rsp[14..14 + size]
}

fn u16_param(value: u16) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn run(engine: &mut Engine, cmd: &[u8]) -> Vec<u8> {
    engine.execute(cmd, MAX_RESPONSE)
}

fn run_ok(engine: &mut Engine, cmd: &[u8]) -> Vec<u8> {
    let rsp = run(engine, cmd);
    assert_eq!(rc(&rsp), TpmRc::SUCCESS, "command {:02x?}", &cmd[6..10]);
    rsp
}

fn startup(engine: &mut Engine, su: u16) -> TpmRc {
    rc(&run(engine, &plain(cc::STARTUP, &[], &u16_param(su))))
}

fn started_engine() -> (Engine, MemoryPlatform) {
    let (mut engine, platform) = powered_engine(TpmConfig::default());
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    (engine, platform)
}

fn clock_set_params(time: u64) -> Vec<u8> {
    time.to_be_bytes().to_vec()
}

fn extend_params(alg: HashAlg, digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    1u32.marshal(&mut out);
    alg.marshal(&mut out);
    out.extend_from_slice(digest);
    out
}

fn start_session(engine: &mut Engine, session_type: u8) -> (u32, Vec<u8>) {
    let mut params = Vec::new();
    marshal_bytes(&[0x11; 16], &mut params);
    marshal_bytes(&[], &mut params);
    session_type.marshal(&mut params);
    TPM_ALG_NULL.marshal(&mut params);
    TPM_ALG_SHA256.marshal(&mut params);
    let rsp = run_ok(
        engine,
        &plain(cc::START_AUTH_SESSION, &[TPM_RH_NULL, TPM_RH_NULL], &params),
    );
    let handle = u32::from_be_bytes([rsp[10], rsp[11], rsp[12], rsp[13]]);
    let size = u16::from_be_bytes([rsp[14], rsp[15]]) as usize;
    (handle, rsp[16..16 + size].to_vec())
}

fn nv_public(attributes: NvAttributes) -> NvPublic {
    NvPublic {
        nv_index: NV_HANDLE,
        name_alg: HashAlg::Sha256,
        attributes,
        auth_policy: Tpm2bDigest::empty(),
        data_size: 8,
    }
}

fn define_index(engine: &mut Engine, public: &NvPublic, auth: &[u8]) -> TpmRc {
    let mut params = Vec::new();
    marshal_bytes(auth, &mut params);
    marshal_sized(public, &mut params);
    rc(&run(
        engine,
        &with_password(cc::NV_DEFINE_SPACE, &[TPM_RH_OWNER], &[], &params),
    ))
}

fn nv_read(engine: &mut Engine, auth: &[u8]) -> Vec<u8> {
    let mut params = u16_param(8);
    params.extend_from_slice(&u16_param(0));
    run(
        engine,
        &with_password(cc::NV_READ, &[NV_HANDLE, NV_HANDLE], auth, &params),
    )
}

#[test]
fn unknown_command_code() {
    let (mut engine, platform) = started_engine();
    let commits = platform.commit_count();
    let rsp = run(&mut engine, &plain(0xFFFF_FFF0, &[], &[]));
    assert_eq!(rsp.len(), TPM_HEADER_SIZE);
    assert_eq!(rc(&rsp), TpmRc::COMMAND_CODE);
    assert_eq!(platform.commit_count(), commits);
}

#[test]
fn startup_is_required_once() {
    let (mut engine, _platform) = powered_engine(TpmConfig::default());
    let rsp = run(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(rc(&rsp), TpmRc::INITIALIZE);
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::INITIALIZE);
    let rsp = run_ok(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(rsp.len(), TPM_HEADER_SIZE + 2 + 8);
}

#[test]
fn command_size_checks() {
    let (mut engine, platform) = started_engine();
    let commits = platform.commit_count();

    let mut cmd = plain(cc::GET_RANDOM, &[], &u16_param(8));
    cmd[2..6].copy_from_slice(&13u32.to_be_bytes());
    let rsp = run(&mut engine, &cmd);
    assert_eq!(rsp.len(), TPM_HEADER_SIZE);
    assert_eq!(rc(&rsp), TpmRc::COMMAND_SIZE);

    let mut cmd = plain(cc::STIR_RANDOM, &[], &[]);
    cmd.resize(engine.config.max_command_size + 1, 0);
    let len = cmd.len() as u32;
    cmd[2..6].copy_from_slice(&len.to_be_bytes());
    assert_eq!(rc(&run(&mut engine, &cmd)), TpmRc::COMMAND_SIZE);

    let rsp = run(&mut engine, &command(0x8103, cc::GET_RANDOM, &[], &[], &u16_param(8)));
    assert_eq!(rc(&rsp), TpmRc::BAD_TAG);
    assert_eq!(platform.commit_count(), commits);
}

#[test]
fn oversized_auth_area() {
    let (mut engine, _platform) = started_engine();
    let mut cmd = with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], &[], &clock_set_params(5000));
    // authSize follows the handle
    cmd[14..18].copy_from_slice(&0x1000u32.to_be_bytes());
    assert_eq!(rc(&run(&mut engine, &cmd)), TpmRc::SIZE);
}

#[test]
fn trailing_parameter_bytes() {
    let (mut engine, _platform) = started_engine();
    let clock = engine.go.clock;
    let mut params = clock_set_params(1_000_000);
    params.push(0);
    let rsp = run(
        &mut engine,
        &with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], &[], &params),
    );
    assert_eq!(rc(&rsp), TpmRc::SIZE);
    assert_eq!(engine.go.clock, clock);
}

#[test]
fn failed_commit_enters_failure_mode() {
    let (mut engine, platform) = started_engine();
    platform.set_commit_failure(true);
    let rsp = run(
        &mut engine,
        &with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], &[], &clock_set_params(1_000_000)),
    );
    assert_eq!(rc(&rsp), TpmRc::FAILURE);
    assert!(engine.is_failed());
    assert!(engine.fault().is_some());
    assert_eq!(platform.faults().len(), 1);

    platform.set_commit_failure(false);
    let rsp = run(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(rsp.len(), TPM_HEADER_SIZE);
    assert_eq!(rc(&rsp), TpmRc::COMMAND_CODE);

    let record = engine.fault().expect("Failed to record fault");
    let rsp = run(&mut engine, &plain(cc::GET_TEST_RESULT, &[], &[]));
    assert_eq!(rc(&rsp), TpmRc::SUCCESS);
    let mut out_data = u16_param(12);
    out_data.extend_from_slice(&record.function.to_be_bytes());
    out_data.extend_from_slice(&record.line.to_be_bytes());
    out_data.extend_from_slice(&record.code.to_be_bytes());
    out_data.extend_from_slice(&TpmRc::FAILURE.0.to_be_bytes());
    assert_eq!(&rsp[TPM_HEADER_SIZE..], &out_data[..]);
    engine.teardown();
    assert_eq!(engine.power_on(), Err(TpmError::Failed));
}

#[test]
fn one_commit_per_command() {
    let (mut engine, platform) = started_engine();
    let attrs = NvAttributes::new().with_authwrite(true).with_authread(true);
    let commits = platform.commit_count();
    assert_eq!(define_index(&mut engine, &nv_public(attrs), b"secret"), TpmRc::SUCCESS);
    assert_eq!(platform.commit_count(), commits + 1);

    let commits = platform.commit_count();
    run_ok(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(platform.commit_count(), commits);
}

#[test]
fn resume_restores_pcrs() {
    let (mut engine, platform) = started_engine();
    run_ok(
        &mut engine,
        &with_password(cc::PCR_EXTEND, &[0], &[], &extend_params(HashAlg::Sha256, &[0xab; 32])),
    );
    let pcr0 = engine
        .pcrs
        .value(HashAlg::Sha256, 0)
        .expect("Failed to read PCR 0")
        .to_vec();
    assert_ne!(pcr0, [0u8; 32]);

    run_ok(&mut engine, &plain(cc::SHUTDOWN, &[], &u16_param(TPM_SU_STATE)));
    engine.teardown();
    platform.power_cycle();
    engine.power_on().expect("Failed to power on");
    assert_eq!(startup(&mut engine, TPM_SU_STATE), TpmRc::SUCCESS);
    assert_eq!(engine.pcrs.value(HashAlg::Sha256, 0), Some(pcr0.as_slice()));

    // The next resume needs another orderly shutdown
    engine.teardown();
    engine.power_on().expect("Failed to power on");
    assert_eq!(
        startup(&mut engine, TPM_SU_STATE),
        TpmRc::VALUE.with_param(1)
    );
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    assert_eq!(engine.pcrs.value(HashAlg::Sha256, 0), Some(&[0u8; 32][..]));
}

fn reboot(engine: &mut Engine, platform: &MemoryPlatform) {
    engine.teardown();
    platform.power_cycle();
    engine.power_on().expect("Failed to power on");
}

#[test]
fn startup_kinds() {
    let (mut engine, platform) = started_engine();
    assert_eq!(engine.gp.failed_tries, 0);
    let reset_count = engine.gp.reset_count;

    // TPM Restart
    run_ok(&mut engine, &plain(cc::SHUTDOWN, &[], &u16_param(TPM_SU_STATE)));
    reboot(&mut engine, &platform);
    let restart_count = engine.gr.restart_count;
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    assert_eq!(engine.gp.reset_count, reset_count);
    assert_eq!(engine.gr.restart_count, restart_count + 1);

    // Orderly TPM Reset
    run_ok(&mut engine, &plain(cc::SHUTDOWN, &[], &u16_param(TPM_SU_CLEAR)));
    reboot(&mut engine, &platform);
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    assert_eq!(engine.gp.reset_count, reset_count + 1);
    assert_eq!(engine.gr.restart_count, 0);
    assert_eq!(engine.gp.failed_tries, 0);

    // Unorderly TPM Reset
    reboot(&mut engine, &platform);
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    assert_eq!(engine.gp.reset_count, reset_count + 2);
    assert_eq!(engine.gp.failed_tries, 1);
    assert!(!engine.go.clock_safe);
}

#[test]
fn nv_define_write_read() {
    let (mut engine, _platform) = started_engine();
    let attrs = NvAttributes::new().with_authwrite(true).with_authread(true);
    let public = nv_public(attrs);
    assert_eq!(define_index(&mut engine, &public, b"secret"), TpmRc::SUCCESS);
    assert_eq!(define_index(&mut engine, &public, b"secret"), TpmRc::NV_DEFINED);

    assert_eq!(rc(&nv_read(&mut engine, b"secret")), TpmRc::NV_UNINITIALIZED);

    let mut params = Vec::new();
    marshal_bytes(b"01234567", &mut params);
    params.extend_from_slice(&u16_param(0));
    run_ok(
        &mut engine,
        &with_password(cc::NV_WRITE, &[NV_HANDLE, NV_HANDLE], b"secret", &params),
    );

    let rsp = nv_read(&mut engine, b"secret");
    assert_eq!(rc(&rsp), TpmRc::SUCCESS);
    let data = session_params(&rsp);
    assert_eq!(&data[..2], &[0, 8]);
    assert_eq!(&data[2..], b"01234567");

    let rsp = run_ok(&mut engine, &plain(cc::NV_READ_PUBLIC, &[NV_HANDLE], &[]));
    let mut written = public.clone();
    written.attributes.set_written(true);
    let mut expected = Vec::new();
    marshal_sized(&written, &mut expected);
    marshal_bytes(&written.name(), &mut expected);
    assert_eq!(&rsp[TPM_HEADER_SIZE..], expected.as_slice());
}

#[test]
fn dictionary_attack_lockout() {
    let (mut engine, platform) = started_engine();
    let mut params = Vec::new();
    2u32.marshal(&mut params);
    10u32.marshal(&mut params);
    0u32.marshal(&mut params);
    run_ok(
        &mut engine,
        &with_password(cc::DICTIONARY_ATTACK_PARAMETERS, &[TPM_RH_LOCKOUT], &[], &params),
    );
    let attrs = NvAttributes::new().with_authwrite(true).with_authread(true);
    assert_eq!(define_index(&mut engine, &nv_public(attrs), b"secret"), TpmRc::SUCCESS);

    for _ in 0..2 {
        let rsp = nv_read(&mut engine, b"wrong");
        assert_eq!(rc(&rsp), TpmRc::AUTH_FAIL.with_session(1));
    }
    assert_eq!(engine.gp.failed_tries, 2);
    assert_eq!(rc(&nv_read(&mut engine, b"secret")), TpmRc::LOCKOUT);

    // The failure count is durable
    engine.teardown();
    platform.power_cycle();
    engine.power_on().expect("Failed to power on");
    assert_eq!(engine.gp.failed_tries, 2);
    assert_eq!(startup(&mut engine, TPM_SU_CLEAR), TpmRc::SUCCESS);
    assert_eq!(rc(&nv_read(&mut engine, b"secret")), TpmRc::LOCKOUT);

    run_ok(
        &mut engine,
        &with_password(cc::DICTIONARY_ATTACK_LOCK_RESET, &[TPM_RH_LOCKOUT], &[], &[]),
    );
    assert_eq!(engine.gp.failed_tries, 0);
    assert_eq!(rc(&nv_read(&mut engine, b"secret")), TpmRc::NV_UNINITIALIZED);
}

#[test]
fn self_heal_waits_for_nv_write() {
    let (mut engine, platform) = started_engine();
    let mut params = Vec::new();
    3u32.marshal(&mut params);
    10u32.marshal(&mut params);
    0u32.marshal(&mut params);
    run_ok(
        &mut engine,
        &with_password(cc::DICTIONARY_ATTACK_PARAMETERS, &[TPM_RH_LOCKOUT], &[], &params),
    );
    let attrs = NvAttributes::new().with_authwrite(true).with_authread(true);
    assert_eq!(define_index(&mut engine, &nv_public(attrs), b"secret"), TpmRc::SUCCESS);
    assert_eq!(rc(&nv_read(&mut engine, b"wrong")), TpmRc::AUTH_FAIL.with_session(1));
    assert_eq!(engine.gp.failed_tries, 1);

    platform.advance_clock(10_000);
    platform.set_write_failure(true);
    let rsp = run(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(rc(&rsp), TpmRc::NV_UNAVAILABLE);
    assert_eq!(engine.gp.failed_tries, 1);
    assert!(!engine.is_failed());

    platform.set_write_failure(false);
    let commits = platform.commit_count();
    run_ok(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(engine.gp.failed_tries, 0);
    assert_eq!(platform.commit_count(), commits + 1);

    // The healed count is durable
    reboot(&mut engine, &platform);
    assert_eq!(engine.gp.failed_tries, 0);
}

#[test]
fn owner_password_mismatch_is_not_counted() {
    let (mut engine, _platform) = started_engine();
    let rsp = run(
        &mut engine,
        &with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], b"guess", &clock_set_params(1_000_000)),
    );
    assert_eq!(rc(&rsp), TpmRc::BAD_AUTH.with_session(1));
    assert_eq!(engine.gp.failed_tries, 0);
}

fn hmac_session_area(handle: u32, nonce_caller: &[u8], hmac: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    handle.marshal(&mut out);
    marshal_bytes(nonce_caller, &mut out);
    SessionAttributes::CONTINUE_SESSION.bits().marshal(&mut out);
    marshal_bytes(hmac, &mut out);
    out
}

fn start_encrypting_session(engine: &mut Engine) -> u32 {
    let mut params = Vec::new();
    marshal_bytes(&[0x22; 16], &mut params);
    marshal_bytes(&[], &mut params);
    TPM_SE_HMAC.marshal(&mut params);
    TPM_ALG_AES.marshal(&mut params);
    128u16.marshal(&mut params);
    TPM_ALG_CFB.marshal(&mut params);
    TPM_ALG_SHA256.marshal(&mut params);
    let rsp = run_ok(
        engine,
        &plain(cc::START_AUTH_SESSION, &[TPM_RH_NULL, TPM_RH_NULL], &params),
    );
    u32::from_be_bytes([rsp[10], rsp[11], rsp[12], rsp[13]])
}

fn session_area(sessions: &[(u32, SessionAttributes)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (handle, attributes) in sessions {
        handle.marshal(&mut out);
        marshal_bytes(&[], &mut out);
        attributes.bits().marshal(&mut out);
        marshal_bytes(&[], &mut out);
    }
    out
}

#[test]
fn one_session_per_role() {
    let (mut engine, _platform) = started_engine();
    let first = start_encrypting_session(&mut engine);
    let second = start_encrypting_session(&mut engine);
    let stir = {
        let mut params = Vec::new();
        marshal_bytes(&[0x33; 16], &mut params);
        params
    };

    for (code, params, attributes) in [
        (cc::STIR_RANDOM, stir.clone(), SessionAttributes::DECRYPT),
        (cc::GET_RANDOM, u16_param(8), SessionAttributes::ENCRYPT),
        (cc::GET_RANDOM, u16_param(8), SessionAttributes::AUDIT),
    ] {
        let attributes = attributes | SessionAttributes::CONTINUE_SESSION;
        let sessions = session_area(&[(first, attributes), (second, attributes)]);
        let rsp = run(&mut engine, &command(TPM_ST_SESSIONS, code, &[], &sessions, &params));
        assert_eq!(rc(&rsp), TpmRc::ATTRIBUTES.with_session(2));
    }
}

#[test]
fn unbound_hmac_session() {
    let (mut engine, _platform) = started_engine();
    let (handle, nonce_tpm) = start_session(&mut engine, TPM_SE_HMAC);
    assert_eq!(handle_type(handle), HT_HMAC_SESSION);
    assert_eq!(nonce_tpm.len(), 32);

    let alg = HashAlg::Sha256;
    let params = clock_set_params(1_000_000);
    let nonce_caller = [0x22u8; 16];
    let attrs = [SessionAttributes::CONTINUE_SESSION.bits()];
    let cp_hash = alg.digest(&[
        &cc::CLOCK_SET.to_be_bytes()[..],
        &TPM_RH_OWNER.to_be_bytes()[..],
        &params,
    ]);
    let hmac = alg.hmac(&[], &[&cp_hash, &nonce_caller, &nonce_tpm, &attrs]);

    // A corrupted HMAC fails and leaves the session usable
    let mut bad = hmac.clone();
    bad[0] ^= 1;
    let area = hmac_session_area(handle, &nonce_caller, &bad);
    let rsp = run(
        &mut engine,
        &command(TPM_ST_SESSIONS, cc::CLOCK_SET, &[TPM_RH_OWNER], &area, &params),
    );
    assert_eq!(rc(&rsp), TpmRc::BAD_AUTH.with_session(1));

    let area = hmac_session_area(handle, &nonce_caller, &hmac);
    let rsp = run_ok(
        &mut engine,
        &command(TPM_ST_SESSIONS, cc::CLOCK_SET, &[TPM_RH_OWNER], &area, &params),
    );
    assert!(engine.go.clock >= 1_000_000);

    assert!(session_params(&rsp).is_empty());
    let nonce_size = u16::from_be_bytes([rsp[14], rsp[15]]) as usize;
    assert_eq!(nonce_size, 32);
    let new_nonce = &rsp[16..16 + nonce_size];
    assert_ne!(new_nonce, nonce_tpm.as_slice());
    let rest = &rsp[16 + nonce_size..];
    assert_eq!(rest[0], attrs[0]);
    let rp_hash = alg.digest(&[&0u32.to_be_bytes()[..], &cc::CLOCK_SET.to_be_bytes()[..]]);
    let expected = alg.hmac(&[], &[&rp_hash, new_nonce, &nonce_caller, &attrs]);
    assert_eq!(&rest[1..3], &(expected.len() as u16).to_be_bytes());
    assert_eq!(&rest[3..], expected.as_slice());
}

#[test]
fn policy_command_code_digest() {
    let (mut engine, _platform) = started_engine();
    let (handle, _) = start_session(&mut engine, TPM_SE_POLICY);
    assert_eq!(handle_type(handle), HT_POLICY_SESSION);

    run_ok(
        &mut engine,
        &plain(cc::POLICY_COMMAND_CODE, &[handle], &cc::NV_READ.to_be_bytes()),
    );
    let rsp = run_ok(&mut engine, &plain(cc::POLICY_GET_DIGEST, &[handle], &[]));
    let expected = HashAlg::Sha256.digest(&[
        &[0u8; 32][..],
        &cc::POLICY_COMMAND_CODE.to_be_bytes()[..],
        &cc::NV_READ.to_be_bytes()[..],
    ]);
    assert_eq!(&rsp[10..12], &[0, 32]);
    assert_eq!(&rsp[12..], expected.as_slice());

    // A policy bound to one command cannot switch to another
    let rsp = run(
        &mut engine,
        &plain(cc::POLICY_COMMAND_CODE, &[handle], &cc::NV_WRITE.to_be_bytes()),
    );
    assert_eq!(rc(&rsp), TpmRc::VALUE.with_param(1));
}

#[test]
fn session_context_round_trip() {
    let (mut engine, _platform) = started_engine();
    let (handle, _) = start_session(&mut engine, TPM_SE_HMAC);

    let rsp = run_ok(&mut engine, &plain(cc::CONTEXT_SAVE, &[handle], &[]));
    let context = rsp[TPM_HEADER_SIZE..].to_vec();
    assert!(engine.session(handle).is_none());

    let rsp = run_ok(&mut engine, &plain(cc::CONTEXT_LOAD, &[], &context));
    assert_eq!(&rsp[10..14], &handle.to_be_bytes());
    assert!(engine.session(handle).is_some());

    let rsp = run(&mut engine, &plain(cc::CONTEXT_LOAD, &[], &context));
    assert_eq!(rc(&rsp), TpmRc::HANDLE.with_param(1));

    run_ok(&mut engine, &plain(cc::FLUSH_CONTEXT, &[], &handle.to_be_bytes()));
    assert!(engine.session(handle).is_none());
}

/// One step of the command audit digest.
fn audit_step(digest: &[u8], code: u32, names: &[u32], params: &[u8], rsp_params: &[u8]) -> Vec<u8> {
    let alg = HashAlg::Sha256;
    let code = code.to_be_bytes();
    let names: Vec<[u8; 4]> = names.iter().map(|n| n.to_be_bytes()).collect();
    let mut parts: Vec<&[u8]> = vec![&code[..]];
    parts.extend(names.iter().map(|n| &n[..]));
    parts.push(params);
    let cp_hash = alg.digest(&parts);
    let rp_hash = alg.digest(&[&0u32.to_be_bytes()[..], &code[..], rsp_params]);
    alg.digest(&[digest, &cp_hash, &rp_hash])
}

#[test]
fn command_audit_digest() {
    let (mut engine, _platform) = started_engine();
    assert_eq!(engine.gp.audit_counter, 0);

    let mut select_alg = Vec::new();
    TPM_ALG_SHA256.marshal(&mut select_alg);
    0u32.marshal(&mut select_alg);
    0u32.marshal(&mut select_alg);
    run_ok(
        &mut engine,
        &with_password(cc::SET_COMMAND_CODE_AUDIT_STATUS, &[TPM_RH_OWNER], &[], &select_alg),
    );
    assert_eq!(engine.gp.audit_counter, 1);
    let digest = audit_step(
        &[0u8; 32],
        cc::SET_COMMAND_CODE_AUDIT_STATUS,
        &[TPM_RH_OWNER],
        &select_alg,
        &[],
    );

    let mut set_random = Vec::new();
    TPM_ALG_NULL.marshal(&mut set_random);
    1u32.marshal(&mut set_random);
    cc::GET_RANDOM.marshal(&mut set_random);
    0u32.marshal(&mut set_random);
    run_ok(
        &mut engine,
        &with_password(cc::SET_COMMAND_CODE_AUDIT_STATUS, &[TPM_RH_OWNER], &[], &set_random),
    );
    assert!(engine.gp.audit_commands.is_set(cc::GET_RANDOM));
    let digest = audit_step(
        &digest,
        cc::SET_COMMAND_CODE_AUDIT_STATUS,
        &[TPM_RH_OWNER],
        &set_random,
        &[],
    );

    let params = u16_param(8);
    let rsp = run_ok(&mut engine, &plain(cc::GET_RANDOM, &[], &params));
    let digest = audit_step(&digest, cc::GET_RANDOM, &[], &params, &rsp[TPM_HEADER_SIZE..]);

    assert_eq!(engine.gp.audit_counter, 1);
    let current = engine
        .gr
        .command_audit_digest
        .clone()
        .expect("Failed to get audit digest");
    assert_eq!(current.as_slice(), digest.as_slice());
}

#[test]
fn physical_presence_gates_platform_auth() {
    let (mut engine, platform) = started_engine();
    let mut params = Vec::new();
    1u32.marshal(&mut params);
    cc::CLOCK_SET.marshal(&mut params);
    0u32.marshal(&mut params);
    let cmd = with_password(cc::PP_COMMANDS, &[TPM_RH_PLATFORM], &[], &params);

    assert_eq!(rc(&run(&mut engine, &cmd)), TpmRc::PP);
    platform.set_physical_presence(true);
    run_ok(&mut engine, &cmd);
    assert!(engine.gp.pp_commands.is_set(cc::CLOCK_SET));

    platform.set_physical_presence(false);
    let clock_set = with_password(
        cc::CLOCK_SET,
        &[TPM_RH_PLATFORM],
        &[],
        &clock_set_params(1_000_000),
    );
    assert_eq!(rc(&run(&mut engine, &clock_set)), TpmRc::PP);
    // Owner authorization is not gated
    run_ok(
        &mut engine,
        &with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], &[], &clock_set_params(1_000_000)),
    );
}

#[test]
fn clock_advances_and_is_saved() {
    let (mut engine, platform) = started_engine();
    let commits = platform.commit_count();
    platform.advance_clock(1 << crate::engine::CLOCK_UPDATE_SHIFT);
    run_ok(&mut engine, &plain(cc::GET_RANDOM, &[], &u16_param(8)));
    assert_eq!(platform.commit_count(), commits + 1);
    assert!(engine.go.clock >= 1 << crate::engine::CLOCK_UPDATE_SHIFT);
    assert!(engine.go.clock_safe);

    let rsp = run(
        &mut engine,
        &with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], &[], &clock_set_params(1)),
    );
    assert_eq!(rc(&rsp), TpmRc::VALUE.with_param(1));
}

#[test]
fn pcr_locality() {
    let (mut engine, platform) = started_engine();
    let cmd = with_password(
        cc::PCR_EXTEND,
        &[17],
        &[],
        &extend_params(HashAlg::Sha256, &[0x01; 32]),
    );
    assert_eq!(rc(&run(&mut engine, &cmd)), TpmRc::LOCALITY);
    platform.set_locality(3);
    run_ok(&mut engine, &cmd);
}

#[test]
fn hierarchy_auth_and_clear() {
    let (mut engine, _platform) = started_engine();
    let attrs = NvAttributes::new().with_authwrite(true).with_authread(true);
    assert_eq!(define_index(&mut engine, &nv_public(attrs), b"secret"), TpmRc::SUCCESS);

    let mut params = Vec::new();
    marshal_bytes(b"owner-pw", &mut params);
    run_ok(
        &mut engine,
        &with_password(cc::HIERARCHY_CHANGE_AUTH, &[TPM_RH_OWNER], &[], &params),
    );
    let clock_set = |auth: &[u8]| {
        with_password(cc::CLOCK_SET, &[TPM_RH_OWNER], auth, &clock_set_params(1_000_000))
    };
    assert_eq!(
        rc(&run(&mut engine, &clock_set(&[]))),
        TpmRc::BAD_AUTH.with_session(1)
    );
    run_ok(&mut engine, &clock_set(b"owner-pw"));

    run_ok(
        &mut engine,
        &with_password(cc::CLEAR, &[TPM_RH_LOCKOUT], &[], &[]),
    );
    run_ok(&mut engine, &clock_set(&[]));
    let rsp = run(&mut engine, &plain(cc::NV_READ_PUBLIC, &[NV_HANDLE], &[]));
    assert_eq!(rc(&rsp), TpmRc::HANDLE.with_handle(1));

    // Clear can be disabled with lockout authorization
    run_ok(
        &mut engine,
        &with_password(cc::CLEAR_CONTROL, &[TPM_RH_LOCKOUT], &[], &[TPM_YES]),
    );
    let rsp = run(&mut engine, &with_password(cc::CLEAR, &[TPM_RH_LOCKOUT], &[], &[]));
    assert_eq!(rc(&rsp), TpmRc::DISABLED);
}

#[test]
fn hash_command() {
    let (mut engine, _platform) = started_engine();
    let mut params = Vec::new();
    marshal_bytes(b"abc", &mut params);
    TPM_ALG_SHA256.marshal(&mut params);
    TPM_RH_OWNER.marshal(&mut params);
    let rsp = run_ok(&mut engine, &plain(cc::HASH, &[], &params));
    let expected = HashAlg::Sha256.digest(&[b"abc"]);
    assert_eq!(&rsp[10..12], &[0, 32]);
    assert_eq!(&rsp[12..44], expected.as_slice());
}
