// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory UART, reset line and a simulated radio module for tests.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::codec::FrameCodec;
use crate::config::UartConfig;
use crate::error::{LinkError, Result};
use crate::hm_frame::*;
use crate::uart::{push_event, ResetLine, UartDriver, UartEvent};

/// Firmware the simulated module pretends to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimKind {
    Legacy,
    DualCoPro,
    RpiRfMod,
    /// Answers identify with an unknown string.
    Unknown,
    /// Never answers.
    Silent,
}

/// Radio module answering detection probes.
pub(crate) struct SimulatedModule {
    kind: SimKind,
    bootloader: bool,
    boot_delay: usize,
    booting: usize,
    ignored: Vec<(u8, u8)>,
    drop_first: usize,
    probes: HashMap<(u8, u8), usize>,
    decoder: FrameCodec,
}

impl SimulatedModule {
    pub(crate) fn new(kind: SimKind) -> Self {
        Self {
            kind,
            bootloader: false,
            boot_delay: 0,
            booting: 0,
            ignored: Vec::new(),
            drop_first: 0,
            probes: HashMap::new(),
            decoder: FrameCodec::new(true),
        }
    }

    /// Start in the bootloader; START_APP switches to the application.
    pub(crate) fn in_bootloader(mut self) -> Self {
        self.bootloader = true;
        self
    }

    /// Leave the first `n` identify probes after START_APP unanswered while
    /// the application boots.
    pub(crate) fn booting_for(mut self, n: usize) -> Self {
        self.boot_delay = n;
        self
    }

    /// Never answer (destination, command).
    pub(crate) fn ignoring(mut self, destination: u8, command: u8) -> Self {
        self.ignored.push((destination, command));
        self
    }

    /// Leave the first `n` probes of every command unanswered.
    pub(crate) fn dropping_first(mut self, n: usize) -> Self {
        self.drop_first = n;
        self
    }

    pub(crate) fn probe_count(&self, destination: u8, command: u8) -> usize {
        self.probes.get(&(destination, command)).copied().unwrap_or(0)
    }

    pub(crate) fn was_probed(&self, destination: u8, command: u8) -> bool {
        self.probe_count(destination, command) > 0
    }

    /// Feed escaped wire bytes, return the encoded replies.
    pub(crate) fn respond_to_wire(&mut self, wire: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        self.decoder.append_slice(wire, |f| frames.push(f.to_vec()));

        frames
            .iter()
            .filter_map(|raw| HmFrame::try_parse(raw))
            .filter_map(|probe| self.respond(&probe))
            .map(|reply| reply.encode())
            .collect()
    }

    fn respond(&mut self, probe: &HmFrame) -> Option<HmFrame> {
        let key = (probe.destination, probe.command);
        let seen = self.probes.entry(key).or_insert(0);
        *seen += 1;
        if *seen <= self.drop_first || self.ignored.contains(&key) {
            return None;
        }

        let ack = |command: u8, payload: &[u8]| Some(ack_reply(probe, command, payload));

        let kind = self.kind;
        if kind == SimKind::Silent {
            return None;
        }

        match key {
            (DST_COMMON, CMD_COMMON_IDENTIFY) if self.booting > 0 => {
                self.booting -= 1;
                None
            }
            (DST_COMMON, CMD_COMMON_IDENTIFY) => {
                let id: &[u8] = match (kind, self.bootloader) {
                    (SimKind::Legacy, _) => return None,
                    (SimKind::RpiRfMod, true) => b"HMIP_TRX_Bl",
                    (_, true) => b"Co_CPU_BL",
                    (SimKind::RpiRfMod, false) => b"HMIP_TRX_App",
                    (SimKind::DualCoPro, false) => b"DualCoPro_App",
                    _ => b"Mystery_App",
                };
                ack(CMD_COMMON_ACK, id)
            }
            (DST_COMMON, CMD_COMMON_START_APP) => {
                self.bootloader = false;
                self.booting = self.boot_delay;
                ack(CMD_COMMON_ACK, &[])
            }
            (DST_COMMON, CMD_COMMON_GET_SGTIN) if kind != SimKind::Legacy => ack(
                CMD_COMMON_ACK,
                &[0x30, 0x14, 0xF7, 0x11, 0xA0, 0x00, 0x1F, 0x5A, 0x49, 0xA3, 0xC2, 0xB1][..],
            ),
            (DST_HMSYSTEM, CMD_HMSYSTEM_IDENTIFY) if kind == SimKind::Legacy => {
                ack(CMD_HMSYSTEM_ACK, &b"Co_CPU_App"[..])
            }
            (DST_HMSYSTEM, CMD_HMSYSTEM_GET_VERSION) if kind == SimKind::Legacy => {
                ack(CMD_HMSYSTEM_ACK, &[1, 4, 1][..])
            }
            (DST_HMSYSTEM, CMD_HMSYSTEM_GET_SERIAL) if kind == SimKind::Legacy => {
                ack(CMD_HMSYSTEM_ACK, &b"LEQ0123456"[..])
            }
            (DST_HMSYSTEM, CMD_HMSYSTEM_GET_DEFAULT_RF_ADDRESS) => {
                ack(CMD_HMSYSTEM_ACK, &[0xFE, 0xDC, 0xBA][..])
            }
            (DST_TRX, CMD_TRX_GET_VERSION) => match kind {
                SimKind::RpiRfMod => ack(CMD_TRX_ACK, &[4, 2, 18, 0][..]),
                _ => ack(CMD_TRX_ACK, &[2, 8, 6][..]),
            },
            (DST_TRX, CMD_TRX_GET_DEFAULT_RF_ADDRESS) => ack(CMD_TRX_ACK, &[0x12, 0x34, 0x56][..]),
            (DST_TRX, CMD_TRX_GET_MCU_TYPE) => ack(CMD_TRX_ACK, &[0x03][..]),
            (DST_LLMAC, CMD_LLMAC_GET_SERIAL) => ack(CMD_LLMAC_ACK, &b"NEQ7654321"[..]),
            (DST_LLMAC, CMD_LLMAC_GET_DEFAULT_RF_ADDRESS) => {
                ack(CMD_LLMAC_ACK, &[0xAB, 0xCD, 0xEF][..])
            }
            _ => None,
        }
    }
}

fn ack_reply(probe: &HmFrame, command: u8, payload: &[u8]) -> HmFrame {
    let mut data = vec![ACK_OK];
    data.extend_from_slice(payload);
    HmFrame::new(probe.counter, probe.destination, command, &data)
}

#[derive(Default)]
struct MockState {
    installed: bool,
    written: Vec<u8>,
    flushes: usize,
    events: Option<(Sender<UartEvent>, Receiver<UartEvent>)>,
    module: Option<SimulatedModule>,
}

/// UART whose TX is recorded and whose RX is fed by the test or by an
/// attached [`SimulatedModule`].
#[derive(Clone, Default)]
pub(crate) struct MockUart {
    state: Arc<Mutex<MockState>>,
}

impl MockUart {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_module(module: SimulatedModule) -> Self {
        let uart = Self::new();
        uart.state.lock().module = Some(module);
        uart
    }

    /// Queue an RX event as the driver would.
    pub(crate) fn inject(&self, event: UartEvent) {
        let state = self.state.lock();
        if let Some((tx, rx)) = &state.events {
            push_event(tx, rx, event);
        }
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub(crate) fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    pub(crate) fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.state.lock().installed
    }

    pub(crate) fn with_sim<R>(&self, f: impl FnOnce(&SimulatedModule) -> R) -> Option<R> {
        self.state.lock().module.as_ref().map(f)
    }
}

impl UartDriver for MockUart {
    fn install(&mut self, config: &UartConfig) -> Result<Receiver<UartEvent>> {
        let mut state = self.state.lock();
        if state.installed {
            return Err(LinkError::AlreadyStarted);
        }
        let (tx, rx) = channel::bounded(config.queue_depth);
        state.events = Some((tx, rx.clone()));
        state.installed = true;
        Ok(rx)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.installed {
            return Err(LinkError::NotStarted);
        }
        state.written.extend_from_slice(data);

        let replies = match state.module.as_mut() {
            Some(module) => module.respond_to_wire(data),
            None => Vec::new(),
        };
        if let Some((tx, rx)) = &state.events {
            for reply in replies {
                push_event(tx, rx, UartEvent::Data(reply));
            }
        }
        Ok(data.len())
    }

    fn flush_input(&mut self) -> Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn uninstall(&mut self) {
        let mut state = self.state.lock();
        state.installed = false;
        state.events = None;
    }
}

/// Reset line recording every level change.
#[derive(Clone, Default)]
pub(crate) struct MockResetLine {
    levels: Arc<Mutex<Vec<bool>>>,
}

impl MockResetLine {
    pub(crate) fn levels(&self) -> Vec<bool> {
        self.levels.lock().clone()
    }
}

impl ResetLine for MockResetLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        self.levels.lock().push(high);
        Ok(())
    }
}
