// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Module-facing transports: UART event source/sink and the reset line.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::UartConfig;
use crate::error::{LinkError, Result};

/// Read chunk size of the serial reader thread
const READ_CHUNK: usize = 256;

/// Back-off after a read error or end of file
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event reported by a UART driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UartEvent {
    /// Received bytes, in order.
    Data(Vec<u8>),
    /// Hardware FIFO overflowed, input was lost.
    FifoOverflow,
    /// Driver ring buffer full, input was lost.
    BufferFull,
    /// Break condition on the line.
    Break,
    ParityError,
    FrameError,
}

/// Push an event into a bounded queue, dropping the oldest queued event when
/// the queue is full. Never blocks.
///
/// Returns `false` once the consumer side is gone.
pub fn push_event(tx: &Sender<UartEvent>, rx: &Receiver<UartEvent>, event: UartEvent) -> bool {
    let mut event = event;
    loop {
        match tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(ev)) => {
                if rx.try_recv().is_ok() {
                    log::debug!("[UART] event queue full, dropped oldest event");
                }
                event = ev;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// UART driver consumed by [`crate::link::ModuleLink`].
///
/// Receive events are delivered through the queue returned by `install`;
/// writes go straight to the transmit path.
pub trait UartDriver: Send {
    /// Open the port and start delivering events.
    fn install(&mut self, config: &UartConfig) -> Result<Receiver<UartEvent>>;

    /// Write raw bytes to TX. Returns the number of bytes written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize>;

    /// Discard any input buffered by the driver.
    fn flush_input(&mut self) -> Result<()>;

    /// Close the port. Idempotent.
    fn uninstall(&mut self);
}

// ---------------------------------------------------------------------------
// Serial device (file-based)
// ---------------------------------------------------------------------------

/// Queue the reader thread currently feeds, `None` while uninstalled.
type EventSink = Arc<Mutex<Option<(Sender<UartEvent>, Receiver<UartEvent>)>>>;

/// Serial device driver using plain file I/O.
///
/// Line settings (115200 8N1, raw mode) are expected to be configured
/// externally, e.g. with `stty -F <dev> 115200 raw -echo`.
///
/// A blocking read cannot be interrupted, so the reader thread outlives
/// `uninstall` and is reattached to the queue of the next `install`. Input
/// read while uninstalled is discarded. The thread exits once the driver is
/// dropped and its pending read returns.
pub struct SerialUart {
    device_path: PathBuf,
    writer: Option<File>,
    sink: EventSink,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialUart {
    pub fn new(device_path: impl AsRef<Path>) -> Self {
        Self {
            device_path: device_path.as_ref().to_path_buf(),
            writer: None,
            sink: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    fn reader_alive(&self) -> bool {
        self.reader.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn spawn_reader(&mut self) -> Result<()> {
        let reader = OpenOptions::new().read(true).open(&self.device_path)?;
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = stop.clone();
        let sink = self.sink.clone();
        let device = self.device_path.display().to_string();

        let handle = std::thread::Builder::new()
            .name("hmrf-uart-reader".into())
            .spawn(move || read_loop(reader, &sink, &stop, &device))
            .map_err(|e| LinkError::Spawn(e.to_string()))?;
        self.reader = Some(handle);
        Ok(())
    }
}

fn deliver(sink: &Mutex<Option<(Sender<UartEvent>, Receiver<UartEvent>)>>, event: UartEvent) {
    if let Some((tx, rx)) = sink.lock().as_ref() {
        push_event(tx, rx, event);
    }
}

fn read_loop(
    mut reader: File,
    sink: &Mutex<Option<(Sender<UartEvent>, Receiver<UartEvent>)>>,
    stop: &AtomicBool,
    device: &str,
) {
    let mut buf = [0u8; READ_CHUNK];
    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => std::thread::sleep(READ_ERROR_BACKOFF),
            Ok(n) => deliver(sink, UartEvent::Data(buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("[UART] read error on {}: {}", device, e);
                deliver(sink, UartEvent::FrameError);
                std::thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
    log::debug!("[UART] reader for {} stopped", device);
}

impl UartDriver for SerialUart {
    fn install(&mut self, config: &UartConfig) -> Result<Receiver<UartEvent>> {
        if self.writer.is_some() {
            return Err(LinkError::AlreadyStarted);
        }

        let writer = OpenOptions::new().write(true).open(&self.device_path)?;

        let (tx, rx) = channel::bounded(config.queue_depth);
        *self.sink.lock() = Some((tx, rx.clone()));

        if !self.reader_alive() {
            if let Err(e) = self.spawn_reader() {
                *self.sink.lock() = None;
                return Err(e);
            }
        }

        log::info!(
            "[UART] opened {} (configured {} baud externally)",
            self.device_path.display(),
            config.baud_rate
        );

        self.writer = Some(writer);
        Ok(rx)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let writer = self.writer.as_mut().ok_or(LinkError::NotStarted)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    fn flush_input(&mut self) -> Result<()> {
        // Bytes already read by the reader thread are dropped with the queue.
        if let Some((_, rx)) = self.sink.lock().as_ref() {
            while rx.try_recv().is_ok() {}
        }
        Ok(())
    }

    fn uninstall(&mut self) {
        self.writer = None;
        *self.sink.lock() = None;
    }
}

impl Drop for SerialUart {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        *self.sink.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// Reset line
// ---------------------------------------------------------------------------

/// Output driving the module's reset input.
pub trait ResetLine: Send {
    fn set_level(&mut self, high: bool) -> Result<()>;
}

/// Module without a controllable reset line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResetLine;

impl ResetLine for NoResetLine {
    fn set_level(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }
}

/// Reset line backed by a sysfs GPIO value file
/// (e.g. `/sys/class/gpio/gpio18/value`, already exported as output).
#[derive(Debug, Clone)]
pub struct SysfsResetLine {
    value_path: PathBuf,
}

impl SysfsResetLine {
    pub fn new(value_path: impl AsRef<Path>) -> Self {
        Self {
            value_path: value_path.as_ref().to_path_buf(),
        }
    }
}

impl ResetLine for SysfsResetLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        std::fs::write(&self.value_path, if high { b"1" } else { b"0" })?;
        Ok(())
    }
}
