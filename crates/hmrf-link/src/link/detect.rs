// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Module detection handshake.
//!
//! A fixed sequence of probes identifies the hardware flavour and collects
//! serial, SGTIN, radio addresses and firmware version. Each state sends one
//! HM command frame and waits for exactly one response shape:
//!
//! ```text
//! Legacy       Identify -> LegacyGetVersion -> LegacyGetSerial -> Done
//! DualCoPro    Identify -> GetSgtin -> TrxGetVersion -> TrxGetDefaultRfAddress
//!                       -> LlMacGetSerial -> LlMacGetDefaultRfAddress -> Done
//! RPI-RF-MOD   Identify -> GetSgtin -> TrxGetVersion -> TrxGetDefaultRfAddress
//!                       -> TrxGetMcuType -> HmSystemGetDefaultRfAddress -> Done
//! ```
//!
//! A bootloader answering Identify is told to start its application and
//! Identify is probed again. Any accepted answer resets the retry budget;
//! `max_retries` consecutive timeouts abort the run with an empty identity.
//! A module still answering from its bootloader after `MAX_APP_RESTARTS`
//! application starts is given up as well.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::identity::{ModuleIdentity, ModuleType};
use super::FrameHandler;
use crate::config::DetectionConfig;
use crate::hm_frame::*;

const ID_BOOTLOADER: &str = "Co_CPU_BL";
const ID_TRX_BOOTLOADER: &str = "HMIP_TRX_Bl";
const ID_LEGACY_APP: &str = "Co_CPU_App";
const ID_DUAL_COPRO_APP: &str = "DualCoPro_App";
const ID_TRX_APP: &str = "HMIP_TRX_App";

/// START_APP commands sent before a module stuck in its bootloader is given up
const MAX_APP_RESTARTS: u32 = 2;

/// Detection step. The discriminants are stable state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DetectState {
    Identify = 0,
    LegacyGetVersion = 10,
    LegacyGetSerial = 11,
    GetSgtin = 20,
    TrxGetVersion = 30,
    TrxGetDefaultRfAddress = 31,
    TrxGetMcuType = 32,
    LlMacGetSerial = 40,
    LlMacGetDefaultRfAddress = 41,
    HmSystemGetDefaultRfAddress = 50,
    Done = 255,
}

/// Expected payload length of a response.
#[derive(Debug, Clone, Copy)]
enum Len {
    Exact(usize),
    AtLeast(usize),
}

impl Len {
    fn matches(self, len: usize) -> bool {
        match self {
            Len::Exact(n) => len == n,
            Len::AtLeast(n) => len >= n,
        }
    }
}

impl DetectState {
    const ALL: [DetectState; 11] = [
        DetectState::Identify,
        DetectState::LegacyGetVersion,
        DetectState::LegacyGetSerial,
        DetectState::GetSgtin,
        DetectState::TrxGetVersion,
        DetectState::TrxGetDefaultRfAddress,
        DetectState::TrxGetMcuType,
        DetectState::LlMacGetSerial,
        DetectState::LlMacGetDefaultRfAddress,
        DetectState::HmSystemGetDefaultRfAddress,
        DetectState::Done,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Probe sent on entering the state, as (destination, command).
    pub fn probe(self) -> Option<(u8, u8)> {
        let probe = match self {
            DetectState::Identify => (DST_COMMON, CMD_COMMON_IDENTIFY),
            DetectState::LegacyGetVersion => (DST_HMSYSTEM, CMD_HMSYSTEM_GET_VERSION),
            DetectState::LegacyGetSerial => (DST_HMSYSTEM, CMD_HMSYSTEM_GET_SERIAL),
            DetectState::GetSgtin => (DST_COMMON, CMD_COMMON_GET_SGTIN),
            DetectState::TrxGetVersion => (DST_TRX, CMD_TRX_GET_VERSION),
            DetectState::TrxGetDefaultRfAddress => (DST_TRX, CMD_TRX_GET_DEFAULT_RF_ADDRESS),
            DetectState::TrxGetMcuType => (DST_TRX, CMD_TRX_GET_MCU_TYPE),
            DetectState::LlMacGetSerial => (DST_LLMAC, CMD_LLMAC_GET_SERIAL),
            DetectState::LlMacGetDefaultRfAddress => (DST_LLMAC, CMD_LLMAC_GET_DEFAULT_RF_ADDRESS),
            DetectState::HmSystemGetDefaultRfAddress => {
                (DST_HMSYSTEM, CMD_HMSYSTEM_GET_DEFAULT_RF_ADDRESS)
            }
            DetectState::Done => return None,
        };
        Some(probe)
    }

    /// Response shape that completes this state.
    fn expected(self) -> &'static [(u8, u8, Len)] {
        match self {
            // Application and bootloader answer on the common layer; legacy
            // firmware only answers the system-layer fallback identify.
            DetectState::Identify => &[
                (DST_COMMON, CMD_COMMON_ACK, Len::AtLeast(2)),
                (DST_HMSYSTEM, CMD_HMSYSTEM_ACK, Len::AtLeast(2)),
            ],
            DetectState::LegacyGetVersion => &[(DST_HMSYSTEM, CMD_HMSYSTEM_ACK, Len::Exact(4))],
            DetectState::LegacyGetSerial => &[(DST_HMSYSTEM, CMD_HMSYSTEM_ACK, Len::Exact(11))],
            DetectState::GetSgtin => &[(DST_COMMON, CMD_COMMON_ACK, Len::Exact(13))],
            DetectState::TrxGetVersion => &[(DST_TRX, CMD_TRX_ACK, Len::AtLeast(4))],
            DetectState::TrxGetDefaultRfAddress => &[(DST_TRX, CMD_TRX_ACK, Len::Exact(4))],
            DetectState::TrxGetMcuType => &[(DST_TRX, CMD_TRX_ACK, Len::Exact(2))],
            DetectState::LlMacGetSerial => &[(DST_LLMAC, CMD_LLMAC_ACK, Len::Exact(11))],
            DetectState::LlMacGetDefaultRfAddress => &[(DST_LLMAC, CMD_LLMAC_ACK, Len::Exact(4))],
            DetectState::HmSystemGetDefaultRfAddress => {
                &[(DST_HMSYSTEM, CMD_HMSYSTEM_ACK, Len::Exact(4))]
            }
            DetectState::Done => &[],
        }
    }

    /// True when `frame` is the response this state waits for.
    pub fn accepts(self, frame: &HmFrame) -> bool {
        frame.is_ack_ok()
            && self.expected().iter().any(|&(dst, cmd, len)| {
                frame.destination == dst && frame.command == cmd && len.matches(frame.data.len())
            })
    }
}

/// Firmware family learned from the identify answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavour {
    Legacy,
    DualCoPro,
    RpiRfMod,
}

impl Flavour {
    fn module_type(self) -> ModuleType {
        match self {
            Flavour::Legacy | Flavour::DualCoPro => ModuleType::HmModRpiPcb,
            Flavour::RpiRfMod => ModuleType::RpiRfMod,
        }
    }
}

/// Outcome of one accepted response.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Next(DetectState),
    Bootloader,
    Unrecognized,
}

fn mac24(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(3)
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

fn version(bytes: &[u8]) -> [u8; 3] {
    [bytes[0], bytes[1], bytes[2]]
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Apply an accepted response and pick the next state.
fn advance(
    state: DetectState,
    frame: &HmFrame,
    identity: &mut ModuleIdentity,
    flavour: &mut Option<Flavour>,
) -> Step {
    let payload = &frame.data[1..];

    match state {
        DetectState::Identify => {
            let id = ascii(payload);
            log::debug!("[DETECT] identify answer \"{}\"", id);
            match id.as_str() {
                ID_BOOTLOADER | ID_TRX_BOOTLOADER => Step::Bootloader,
                ID_LEGACY_APP => {
                    *flavour = Some(Flavour::Legacy);
                    Step::Next(DetectState::LegacyGetVersion)
                }
                ID_DUAL_COPRO_APP => {
                    *flavour = Some(Flavour::DualCoPro);
                    Step::Next(DetectState::GetSgtin)
                }
                ID_TRX_APP => {
                    *flavour = Some(Flavour::RpiRfMod);
                    Step::Next(DetectState::GetSgtin)
                }
                _ => Step::Unrecognized,
            }
        }
        DetectState::LegacyGetVersion => {
            identity.firmware_version = version(payload);
            Step::Next(DetectState::LegacyGetSerial)
        }
        DetectState::LegacyGetSerial => {
            identity.serial = ascii(payload);
            Step::Next(DetectState::Done)
        }
        DetectState::GetSgtin => {
            identity.sgtin = hex_upper(payload);
            Step::Next(DetectState::TrxGetVersion)
        }
        DetectState::TrxGetVersion => {
            identity.firmware_version = version(payload);
            Step::Next(DetectState::TrxGetDefaultRfAddress)
        }
        DetectState::TrxGetDefaultRfAddress => {
            identity.hmip_radio_mac = mac24(payload);
            if *flavour == Some(Flavour::RpiRfMod) {
                Step::Next(DetectState::TrxGetMcuType)
            } else {
                Step::Next(DetectState::LlMacGetSerial)
            }
        }
        DetectState::TrxGetMcuType => {
            log::debug!("[DETECT] MCU type {}", payload[0]);
            Step::Next(DetectState::HmSystemGetDefaultRfAddress)
        }
        DetectState::LlMacGetSerial => {
            identity.serial = ascii(payload);
            Step::Next(DetectState::LlMacGetDefaultRfAddress)
        }
        DetectState::LlMacGetDefaultRfAddress => {
            identity.bidcos_radio_mac = mac24(payload);
            Step::Next(DetectState::Done)
        }
        DetectState::HmSystemGetDefaultRfAddress => {
            identity.bidcos_radio_mac = mac24(payload);
            identity.serial = identity.sgtin.clone();
            Step::Next(DetectState::Done)
        }
        DetectState::Done => Step::Next(DetectState::Done),
    }
}

/// Frame consumer installed on the link while detection runs.
///
/// Parses every frame and forwards the one matching the current state.
pub(crate) struct DetectionHandler {
    state: Arc<AtomicU8>,
    tx: Sender<HmFrame>,
}

impl FrameHandler for DetectionHandler {
    fn handle_frame(&self, frame: &[u8]) {
        let Some(frame) = HmFrame::try_parse(frame) else {
            log::trace!("[DETECT] ignoring unparsable frame ({} bytes)", frame.len());
            return;
        };

        let accepted = DetectState::from_code(self.state.load(Ordering::Acquire))
            .is_some_and(|s| s.accepts(&frame));
        if !accepted {
            log::trace!(
                "[DETECT] unexpected frame dst=0x{:02X} cmd=0x{:02X} len={}",
                frame.destination,
                frame.command,
                frame.data.len()
            );
            return;
        }

        if let Err(TrySendError::Full(_)) = self.tx.try_send(frame) {
            log::debug!("[DETECT] response already pending, dropped duplicate");
        }
    }
}

/// Handler plus the state cell and response queue it feeds.
pub(crate) fn detection_channel() -> (Arc<DetectionHandler>, Arc<AtomicU8>, Receiver<HmFrame>) {
    let state = Arc::new(AtomicU8::new(DetectState::Identify.code()));
    let (tx, rx) = channel::bounded(1);
    let handler = Arc::new(DetectionHandler {
        state: state.clone(),
        tx,
    });
    (handler, state, rx)
}

/// One detection run. `send` writes already-encoded frames to the module.
pub(crate) struct Detector<'a> {
    config: &'a DetectionConfig,
    state_cell: &'a AtomicU8,
    responses: &'a Receiver<HmFrame>,
    send: &'a mut dyn FnMut(&[u8]),
    counter: u8,
}

impl<'a> Detector<'a> {
    pub(crate) fn new(
        config: &'a DetectionConfig,
        state_cell: &'a AtomicU8,
        responses: &'a Receiver<HmFrame>,
        send: &'a mut dyn FnMut(&[u8]),
    ) -> Self {
        Self {
            config,
            state_cell,
            responses,
            send,
            counter: 0,
        }
    }

    fn send_command(&mut self, destination: u8, command: u8) {
        let frame = HmFrame::new(self.counter, destination, command, &[]);
        self.counter = self.counter.wrapping_add(1);
        (self.send)(&frame.encode());
    }

    fn wait(&self, timeout: Duration) -> Option<HmFrame> {
        match self.responses.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Run to completion. Returns an empty identity when detection aborts.
    pub(crate) fn run(mut self) -> ModuleIdentity {
        let mut identity = ModuleIdentity::default();
        let mut flavour = None;
        let mut state = DetectState::Identify;
        let mut retries = 0u32;
        let mut restarts = 0u32;
        let mut long_wait = true;
        let mut fallback_sent = false;

        while let Some((destination, command)) = state.probe() {
            self.state_cell.store(state.code(), Ordering::Release);
            while self.responses.try_recv().is_ok() {}

            log::debug!("[DETECT] state {} ({:?})", state.code(), state);
            self.send_command(destination, command);

            let timeout = if long_wait {
                self.config.first_probe_timeout()
            } else {
                self.config.probe_timeout()
            };
            long_wait = false;

            let mut response = self.wait(timeout);
            if response.is_none() && state == DetectState::Identify && !fallback_sent {
                fallback_sent = true;
                log::debug!("[DETECT] no answer on common layer, trying system identify");
                self.send_command(DST_HMSYSTEM, CMD_HMSYSTEM_IDENTIFY);
                response = self.wait(self.config.probe_timeout());
            }

            let step = match response {
                Some(frame) => advance(state, &frame, &mut identity, &mut flavour),
                None => {
                    retries += 1;
                    log::debug!(
                        "[DETECT] timeout in state {} ({}/{})",
                        state.code(),
                        retries,
                        self.config.max_retries
                    );
                    if retries >= self.config.max_retries {
                        return self.abort(state);
                    }
                    continue;
                }
            };

            match step {
                Step::Next(next) => {
                    retries = 0;
                    state = next;
                }
                Step::Bootloader => {
                    retries = 0;
                    restarts += 1;
                    if restarts > MAX_APP_RESTARTS {
                        log::warn!(
                            "[DETECT] module stays in bootloader after {} application starts",
                            MAX_APP_RESTARTS
                        );
                        return self.abort(state);
                    }
                    log::info!("[DETECT] module is in bootloader, starting application");
                    self.send_command(DST_COMMON, CMD_COMMON_START_APP);
                    long_wait = true;
                }
                Step::Unrecognized => {
                    retries += 1;
                    log::warn!("[DETECT] unrecognized identify answer");
                    if retries >= self.config.max_retries {
                        return self.abort(state);
                    }
                }
            }
        }

        self.state_cell.store(DetectState::Done.code(), Ordering::Release);
        identity.module_type = flavour.map_or(ModuleType::None, Flavour::module_type);
        identity
    }

    fn abort(&self, state: DetectState) -> ModuleIdentity {
        self.state_cell.store(DetectState::Done.code(), Ordering::Release);
        log::warn!(
            "[DETECT] no response in state {} after {} attempts, giving up",
            state.code(),
            self.config.max_retries
        );
        ModuleIdentity::default()
    }
}
