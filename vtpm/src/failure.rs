// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//

//! Failure mode.
//!
//! Once an internal invariant is violated or a durable write fails, the
//! engine latches into failure mode for the rest of its lifetime. In that
//! state only TPM2_GetTestResult and single-property TPM2_GetCapability
//! are answered, from a fixed-size stack buffer, and every other request
//! receives the same canned TPM_RC_COMMAND_CODE response.

use crate::config::TpmConfig;
use crate::rc::TpmRc;
use crate::types::*;
use core::panic::Location;

/// Fault codes recorded when entering failure mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FatalCode {
    Internal = 3,
    Parameter = 4,
    Entropy = 5,
    SelfTest = 6,
    Crypto = 7,
    NvUnrecoverable = 8,
    Drbg = 10,
    CounterOverflow = 12,
    VolatileState = 14,
}

/// A fatal condition on its way up to the dispatcher.
#[derive(Clone, Copy, Debug)]
pub struct Fault {
    pub code: FatalCode,
    pub location: &'static Location<'static>,
}

impl Fault {
    #[track_caller]
    pub fn new(code: FatalCode) -> Self {
        Self {
            code,
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn internal() -> Self {
        Self::new(FatalCode::Internal)
    }
}

/// Fixed-width description of the first fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// Identifier of the source file that raised the fault
    pub function: u32,
    pub line: u32,
    pub code: u32,
}

/// FNV-1a, used to turn a source path into a stable identifier.
fn location_id(file: &str) -> u32 {
    file.bytes().fold(0x811c_9dc5u32, |h, b| {
        (h ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

impl From<&Fault> for FaultRecord {
    fn from(fault: &Fault) -> Self {
        Self {
            function: location_id(fault.location.file()),
            line: fault.location.line(),
            code: fault.code as u32,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FailureGovernor {
    record: Option<FaultRecord>,
    fail_on_fail: u32,
}

/// Size of the stack buffer failure-mode responses are built in.
const FAILURE_RESPONSE_SIZE: usize = 64;

impl FailureGovernor {
    pub fn is_failed(&self) -> bool {
        self.record.is_some()
    }

    /// The first fault, if failure mode was entered.
    pub fn record(&self) -> Option<FaultRecord> {
        self.record
    }

    /// Number of faults reported after the first one.
    pub fn fail_on_fail(&self) -> u32 {
        self.fail_on_fail
    }

    /// Latches failure mode. Only the first fault is kept; any later fault
    /// is logged and counted.
    pub fn trip(&mut self, fault: &Fault) -> FaultRecord {
        let new = FaultRecord::from(fault);
        match self.record {
            Some(first) => {
                self.fail_on_fail = self.fail_on_fail.saturating_add(1);
                log::error!(
                    "fail on fail: code={} at {}:{}, first fault code={}",
                    new.code,
                    fault.location.file(),
                    fault.location.line(),
                    first.code
                );
                first
            }
            None => {
                log::error!(
                    "entering failure mode: code={:?} at {}:{}",
                    fault.code,
                    fault.location.file(),
                    fault.location.line()
                );
                self.record = Some(new);
                new
            }
        }
    }

    /// Reinstates a latch carried in a volatile state snapshot.
    pub(crate) fn restore(&mut self, record: Option<FaultRecord>, fail_on_fail: u32) {
        if self.record.is_none() {
            self.record = record;
        }
        self.fail_on_fail = self.fail_on_fail.max(fail_on_fail);
    }

    /// Answers `request` while in failure mode and returns the response
    /// length written into `response`.
    ///
    /// `response` must hold at least a response header.
    pub fn respond(&self, config: &TpmConfig, request: &[u8], response: &mut [u8]) -> usize {
        let mut buf = [0u8; FAILURE_RESPONSE_SIZE];
        let len = self
            .build_response(config, request, &mut buf)
            .unwrap_or_else(|| canned_response(&mut buf));
        let len = if len <= response.len() {
            len
        } else {
            canned_response(&mut buf)
        };
        response[..len].copy_from_slice(&buf[..len]);
        response[len..].fill(0);
        len
    }

    fn build_response(
        &self,
        config: &TpmConfig,
        request: &[u8],
        buf: &mut [u8; FAILURE_RESPONSE_SIZE],
    ) -> Option<usize> {
        let record = self.record.unwrap_or(FaultRecord {
            function: 0,
            line: 0,
            code: 0,
        });
        let header = request.get(..TPM_HEADER_SIZE)?;
        let tag = u16::from_be_bytes([header[0], header[1]]);
        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        let code = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);
        if tag != TPM_ST_NO_SESSIONS || usize::try_from(size).ok()? != request.len() {
            return None;
        }
        let params = &request[TPM_HEADER_SIZE..];

        let mut w = FixedWriter { buf, pos: TPM_HEADER_SIZE };
        match code {
            cc::GET_TEST_RESULT => {
                if !params.is_empty() {
                    return None;
                }
                // outData: location and code of the first fault
                w.u16(12)?;
                w.u32(record.function)?;
                w.u32(record.line)?;
                w.u32(record.code)?;
                w.u32(TpmRc::FAILURE.0)?;
            }
            cc::GET_CAPABILITY => {
                if params.len() != 12 {
                    return None;
                }
                let capability = u32::from_be_bytes([params[0], params[1], params[2], params[3]]);
                let property = u32::from_be_bytes([params[4], params[5], params[6], params[7]]);
                if capability != TPM_CAP_TPM_PROPERTIES {
                    return None;
                }
                let value = match property {
                    TPM_PT_MANUFACTURER => config.manufacturer,
                    TPM_PT_VENDOR_STRING_1 => config.vendor_strings[0],
                    TPM_PT_VENDOR_STRING_2 => config.vendor_strings[1],
                    TPM_PT_VENDOR_STRING_3 => config.vendor_strings[2],
                    TPM_PT_VENDOR_STRING_4 => config.vendor_strings[3],
                    TPM_PT_VENDOR_TPM_TYPE => 1,
                    TPM_PT_FIRMWARE_VERSION_1 => config.firmware_version.0,
                    TPM_PT_FIRMWARE_VERSION_2 => config.firmware_version.1,
                    _ => record.code,
                };
                // moreData, capability, one tagged property
                w.u8(TPM_NO)?;
                w.u32(TPM_CAP_TPM_PROPERTIES)?;
                w.u32(1)?;
                w.u32(property)?;
                w.u32(value)?;
            }
            _ => return None,
        }
        let len = w.pos;
        write_header(buf, len, TpmRc::SUCCESS)?;
        Some(len)
    }
}

struct FixedWriter<'a> {
    buf: &'a mut [u8; FAILURE_RESPONSE_SIZE],
    pos: usize,
}

impl FixedWriter<'_> {
    fn put(&mut self, bytes: &[u8]) -> Option<()> {
        let dst = self.buf.get_mut(self.pos..self.pos + bytes.len())?;
        dst.copy_from_slice(bytes);
        self.pos += bytes.len();
        Some(())
    }

    fn u8(&mut self, v: u8) -> Option<()> {
        self.put(&[v])
    }

    fn u16(&mut self, v: u16) -> Option<()> {
        self.put(&v.to_be_bytes())
    }

    fn u32(&mut self, v: u32) -> Option<()> {
        self.put(&v.to_be_bytes())
    }
}

fn write_header(buf: &mut [u8], len: usize, rc: TpmRc) -> Option<()> {
    let size = u32::try_from(len).ok()?;
    buf.get_mut(0..2)?.copy_from_slice(&TPM_ST_NO_SESSIONS.to_be_bytes());
    buf.get_mut(2..6)?.copy_from_slice(&size.to_be_bytes());
    buf.get_mut(6..10)?.copy_from_slice(&rc.0.to_be_bytes());
    Some(())
}

/// Writes the header-only TPM_RC_COMMAND_CODE response.
fn canned_response(buf: &mut [u8; FAILURE_RESPONSE_SIZE]) -> usize {
    buf.fill(0);
    buf[0..2].copy_from_slice(&TPM_ST_NO_SESSIONS.to_be_bytes());
    buf[2..6].copy_from_slice(&10u32.to_be_bytes());
    buf[6..10].copy_from_slice(&TpmRc::COMMAND_CODE.0.to_be_bytes());
    TPM_HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn request(code: u32, params: &[u8]) -> Vec<u8> {
        let mut req = Vec::new();
        req.extend_from_slice(&TPM_ST_NO_SESSIONS.to_be_bytes());
        req.extend_from_slice(&((TPM_HEADER_SIZE + params.len()) as u32).to_be_bytes());
        req.extend_from_slice(&code.to_be_bytes());
        req.extend_from_slice(params);
        req
    }

    fn failed() -> FailureGovernor {
        let mut gov = FailureGovernor::default();
        gov.trip(&Fault::new(FatalCode::NvUnrecoverable));
        gov
    }

    #[test]
    fn first_fault_wins() {
        let mut gov = failed();
        let first = gov.record().expect("Failed to record fault");
        assert_eq!(first.code, FatalCode::NvUnrecoverable as u32);
        gov.trip(&Fault::new(FatalCode::SelfTest));
        assert_eq!(gov.record(), Some(first));
        assert_eq!(gov.fail_on_fail(), 1);
        assert!(gov.is_failed());
    }

    #[test]
    fn get_test_result_reports_fault() {
        let gov = failed();
        let record = gov.record().expect("Failed to record fault");
        let mut rsp = [0xffu8; 64];
        let len = gov.respond(&TpmConfig::default(), &request(cc::GET_TEST_RESULT, &[]), &mut rsp);
        assert_eq!(len, 28);
        assert_eq!(&rsp[6..10], &[0, 0, 0, 0]);
        assert_eq!(&rsp[10..12], &[0, 12]);
        assert_eq!(&rsp[16..20], &record.line.to_be_bytes());
        assert_eq!(&rsp[20..24], &record.code.to_be_bytes());
        assert_eq!(&rsp[24..28], &TpmRc::FAILURE.0.to_be_bytes());
        assert!(rsp[28..].iter().all(|&b| b == 0));
    }

    #[test]
    fn get_capability_single_property() {
        let gov = failed();
        let config = TpmConfig::default();
        let mut params = Vec::new();
        params.extend_from_slice(&TPM_CAP_TPM_PROPERTIES.to_be_bytes());
        params.extend_from_slice(&TPM_PT_MANUFACTURER.to_be_bytes());
        params.extend_from_slice(&8u32.to_be_bytes());
        let mut rsp = [0u8; 64];
        let len = gov.respond(&config, &request(cc::GET_CAPABILITY, &params), &mut rsp);
        assert_eq!(len, 27);
        assert_eq!(&rsp[15..19], &1u32.to_be_bytes());
        assert_eq!(&rsp[23..27], &config.manufacturer.to_be_bytes());

        // Non-identity properties report the fault code
        params[4..8].copy_from_slice(&TPM_PT_PCR_COUNT.to_be_bytes());
        gov.respond(&config, &request(cc::GET_CAPABILITY, &params), &mut rsp);
        assert_eq!(&rsp[23..27], &(FatalCode::NvUnrecoverable as u32).to_be_bytes());
    }

    #[test]
    fn everything_else_is_canned() {
        let gov = failed();
        let config = TpmConfig::default();
        let mut canned = [0u8; 64];
        let len = gov.respond(&config, &request(cc::STARTUP, &[0, 0]), &mut canned);
        assert_eq!(len, TPM_HEADER_SIZE);
        assert_eq!(&canned[6..10], &TpmRc::COMMAND_CODE.0.to_be_bytes());

        for req in [
            request(0xFFFF_FFF0, &[]),
            request(cc::GET_TEST_RESULT, &[1]),
            Vec::from(&[0x80u8, 0x01][..]),
            Vec::new(),
        ] {
            let mut rsp = [0xaau8; 64];
            let len = gov.respond(&config, &req, &mut rsp);
            assert_eq!(len, TPM_HEADER_SIZE);
            assert_eq!(rsp, canned);
        }
    }
}
