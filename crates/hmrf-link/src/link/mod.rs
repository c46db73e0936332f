// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Radio module link.
//!
//! [`ModuleLink`] owns the UART driver and the reset line. A receive thread
//! drains UART events into a [`FrameCodec`] and hands every completed frame
//! to the currently registered [`FrameHandler`]. The handler can be swapped
//! from any thread while frames are being dispatched.
//!
//! # Lifecycle
//!
//! ```text
//! start():  LEDs off -> install UART -> spawn RX thread -> reset
//!           -> detection (blocking) -> reset
//! stop():   reset -> stop RX thread -> uninstall UART
//! ```

mod detect;
mod identity;

pub use detect::DetectState;
pub use identity::{IdentityStatus, ModuleIdentity, ModuleType};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};

use crate::codec::FrameCodec;
use crate::config::{BridgeConfig, DetectionConfig, UartConfig};
use crate::error::{LinkError, Result};
use crate::led::RgbLed;
use crate::uart::{ResetLine, UartDriver, UartEvent};

/// Receive thread wake-up interval, bounds `stop()` latency
const RX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consumer of decoded module frames.
///
/// Called on the link's receive thread. The slice is only valid for the
/// duration of the call.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, frame: &[u8]);
}

/// State shared with the receive thread.
struct Dispatch {
    handler: ArcSwapOption<Arc<dyn FrameHandler>>,
    decode_escaped: AtomicBool,
    running: AtomicBool,
}

impl Dispatch {
    fn deliver(&self, frame: &[u8]) {
        match self.handler.load_full() {
            Some(handler) => handler.handle_frame(frame),
            None => log::trace!("[LINK] no frame handler, dropped {} bytes", frame.len()),
        }
    }
}

/// UART-attached radio module.
pub struct ModuleLink {
    uart_config: UartConfig,
    detection: DetectionConfig,
    reset_pulse: Duration,
    uart: Arc<Mutex<Box<dyn UartDriver>>>,
    reset: Mutex<Box<dyn ResetLine>>,
    leds: RgbLed,
    dispatch: Arc<Dispatch>,
    identity: RwLock<ModuleIdentity>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ModuleLink {
    pub fn new(
        config: &BridgeConfig,
        uart: Box<dyn UartDriver>,
        reset: Box<dyn ResetLine>,
        leds: RgbLed,
    ) -> Self {
        Self {
            uart_config: config.uart.clone(),
            detection: config.detection.clone(),
            reset_pulse: config.reset.pulse(),
            uart: Arc::new(Mutex::new(uart)),
            reset: Mutex::new(reset),
            leds,
            dispatch: Arc::new(Dispatch {
                handler: ArcSwapOption::empty(),
                decode_escaped: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            identity: RwLock::new(ModuleIdentity::default()),
            rx_thread: Mutex::new(None),
        }
    }

    /// Open the UART, start receiving and identify the module.
    ///
    /// Blocks for the whole detection run. A module that does not answer is
    /// not an error: the identity stays at [`ModuleType::None`].
    pub fn start(&self) -> Result<()> {
        if self.dispatch.running.swap(true, Ordering::AcqRel) {
            return Err(LinkError::AlreadyStarted);
        }

        self.set_led(false, false, false);

        let events = match self.uart.lock().install(&self.uart_config) {
            Ok(events) => events,
            Err(e) => {
                self.dispatch.running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let dispatch = self.dispatch.clone();
        let uart = self.uart.clone();
        let handle = std::thread::Builder::new()
            .name("hmrf-uart-rx".into())
            .spawn(move || rx_loop(&dispatch, &uart, &events))
            .map_err(|e| {
                self.dispatch.running.store(false, Ordering::Release);
                self.uart.lock().uninstall();
                LinkError::Spawn(e.to_string())
            })?;
        *self.rx_thread.lock() = Some(handle);

        log::info!("[LINK] started on {}", self.uart_config.device.display());

        self.reset_module();
        if self.detection.enabled {
            self.detect_module();
        }
        self.reset_module();

        Ok(())
    }

    /// Reset the module and tear down the UART. No-op when not started.
    pub fn stop(&self) {
        if !self.dispatch.running.load(Ordering::Acquire) {
            return;
        }

        self.reset_module();
        self.dispatch.running.store(false, Ordering::Release);

        if let Some(handle) = self.rx_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("[LINK] receive thread panicked");
            }
        }
        self.uart.lock().uninstall();

        log::info!("[LINK] stopped");
    }

    pub fn is_running(&self) -> bool {
        self.dispatch.running.load(Ordering::Acquire)
    }

    /// Replace the frame consumer and the codec's escape decoding mode.
    ///
    /// `None` disables dispatch: frames are still decoded, then dropped.
    pub fn set_frame_handler(&self, handler: Option<Arc<dyn FrameHandler>>, decode_escaped: bool) {
        self.dispatch
            .decode_escaped
            .store(decode_escaped, Ordering::Release);
        self.dispatch.handler.store(handler.map(Arc::new));
    }

    /// Write already-framed bytes to the module.
    pub fn send_frame(&self, frame: &[u8]) -> Result<()> {
        log::trace!("[LINK] tx {:02X?}", frame);
        self.uart.lock().write_bytes(frame)?;
        Ok(())
    }

    /// Pulse the reset line: high for one pulse width, then low for one.
    pub fn reset_module(&self) {
        let mut line = self.reset.lock();
        for level in [true, false] {
            if let Err(e) = line.set_level(level) {
                log::warn!("[LINK] reset line: {}", e);
            }
            std::thread::sleep(self.reset_pulse);
        }
    }

    pub fn set_led(&self, red: bool, green: bool, blue: bool) {
        self.leds.set(red, green, blue);
    }

    pub fn identity(&self) -> ModuleIdentity {
        self.identity.read().clone()
    }

    pub fn module_type(&self) -> ModuleType {
        self.identity.read().module_type
    }

    pub fn serial(&self) -> String {
        self.identity.read().serial.clone()
    }

    pub fn sgtin(&self) -> String {
        self.identity.read().sgtin.clone()
    }

    pub fn bidcos_radio_mac(&self) -> u32 {
        self.identity.read().bidcos_radio_mac
    }

    pub fn hmip_radio_mac(&self) -> u32 {
        self.identity.read().hmip_radio_mac
    }

    pub fn firmware_version(&self) -> [u8; 3] {
        self.identity.read().firmware_version
    }

    fn detect_module(&self) {
        *self.identity.write() = ModuleIdentity::default();

        let (handler, state, responses) = detect::detection_channel();
        self.set_frame_handler(Some(handler as Arc<dyn FrameHandler>), true);

        let mut send = |wire: &[u8]| {
            if let Err(e) = self.send_frame(wire) {
                log::warn!("[DETECT] failed to send probe: {}", e);
            }
        };
        let identity = detect::Detector::new(&self.detection, &state, &responses, &mut send).run();

        self.set_frame_handler(None, false);

        if identity.is_detected() {
            log::info!(
                "[DETECT] {} serial={} fw={} bidcos=0x{:06X} hmip=0x{:06X}",
                identity.module_type,
                identity.serial,
                identity.firmware_version_string(),
                identity.bidcos_radio_mac,
                identity.hmip_radio_mac
            );
        } else {
            log::warn!("[DETECT] no radio module detected");
        }

        *self.identity.write() = identity;
    }
}

impl Drop for ModuleLink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ModuleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLink")
            .field("device", &self.uart_config.device)
            .field("running", &self.is_running())
            .field("identity", &*self.identity.read())
            .finish()
    }
}

fn rx_loop(dispatch: &Dispatch, uart: &Mutex<Box<dyn UartDriver>>, events: &Receiver<UartEvent>) {
    let mut codec = FrameCodec::new(dispatch.decode_escaped.load(Ordering::Acquire));

    if let Err(e) = uart.lock().flush_input() {
        log::warn!("[UART] flush failed: {}", e);
    }

    while dispatch.running.load(Ordering::Acquire) {
        let event = match events.recv_timeout(RX_POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let decode_escaped = dispatch.decode_escaped.load(Ordering::Acquire);
        if codec.decode_escaped() != decode_escaped {
            codec.set_decode_escaped(decode_escaped);
        }

        match event {
            UartEvent::Data(bytes) => {
                log::trace!("[UART] rx {:02X?}", bytes);
                codec.append_slice(&bytes, |frame| dispatch.deliver(frame));
            }
            UartEvent::FifoOverflow | UartEvent::BufferFull => {
                log::warn!("[UART] {:?}, discarding pending input", event);
                if let Err(e) = uart.lock().flush_input() {
                    log::warn!("[UART] flush failed: {}", e);
                }
                while events.try_recv().is_ok() {}
                codec.flush();
            }
            UartEvent::Break | UartEvent::ParityError | UartEvent::FrameError => {
                log::debug!("[UART] {:?}, dropping partial frame", event);
                codec.flush();
            }
        }
    }

    log::debug!("[LINK] receive thread exiting");
}
