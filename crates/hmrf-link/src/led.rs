// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status LED registry.
//!
//! LEDs are registered explicitly by the composition root and addressed
//! through [`LedHandle`] indices. Drivers behind [`Led`] are external; the
//! registry only records and forwards the requested pattern.

use parking_lot::Mutex;

use crate::error::{LinkError, Result};

/// Maximum number of LEDs a registry accepts
pub const MAX_LED_COUNT: usize = 5;

/// Indicator pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedState {
    #[default]
    Off,
    On,
    Blink,
    BlinkInverted,
    BlinkFast,
    BlinkSlow,
}

/// A single indicator output.
pub trait Led: Send {
    fn set_state(&mut self, state: LedState);
}

/// LED that only logs its transitions. Used on hosts without indicators.
#[derive(Debug)]
pub struct LogLed {
    name: &'static str,
    state: LedState,
}

impl LogLed {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: LedState::Off,
        }
    }
}

impl Led for LogLed {
    fn set_state(&mut self, state: LedState) {
        if self.state != state {
            log::debug!("[LED] {} {:?} -> {:?}", self.name, self.state, state);
            self.state = state;
        }
    }
}

/// Index of a registered LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedHandle(usize);

impl LedHandle {
    pub const fn index(self) -> usize {
        self.0
    }
}

struct LedSlot {
    led: Box<dyn Led>,
    state: LedState,
}

/// Fixed-capacity LED table.
#[derive(Default)]
pub struct LedRegistry {
    slots: Vec<Mutex<LedSlot>>,
}

impl LedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an LED. Fails once [`MAX_LED_COUNT`] slots are taken.
    pub fn register(&mut self, led: Box<dyn Led>) -> Result<LedHandle> {
        if self.slots.len() >= MAX_LED_COUNT {
            return Err(LinkError::LedRegistryFull(MAX_LED_COUNT));
        }
        self.slots.push(Mutex::new(LedSlot {
            led,
            state: LedState::Off,
        }));
        Ok(LedHandle(self.slots.len() - 1))
    }

    pub fn set_state(&self, handle: LedHandle, state: LedState) -> Result<()> {
        let slot = self
            .slots
            .get(handle.0)
            .ok_or(LinkError::UnknownLed(handle.0))?;
        let mut slot = slot.lock();
        slot.state = state;
        slot.led.set_state(state);
        Ok(())
    }

    /// Last pattern requested for `handle`.
    pub fn state(&self, handle: LedHandle) -> Option<LedState> {
        self.slots.get(handle.0).map(|s| s.lock().state)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for LedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedRegistry")
            .field("len", &self.slots.len())
            .finish()
    }
}

/// Red/green/blue indicator triple driven by the link and the tunnel.
#[derive(Debug, Clone)]
pub struct RgbLed {
    registry: std::sync::Arc<LedRegistry>,
    red: LedHandle,
    green: LedHandle,
    blue: LedHandle,
}

impl RgbLed {
    pub fn new(
        registry: std::sync::Arc<LedRegistry>,
        red: LedHandle,
        green: LedHandle,
        blue: LedHandle,
    ) -> Self {
        Self {
            registry,
            red,
            green,
            blue,
        }
    }

    /// Registry with three [`LogLed`]s.
    pub fn logging() -> Result<Self> {
        let mut registry = LedRegistry::new();
        let red = registry.register(Box::new(LogLed::new("red")))?;
        let green = registry.register(Box::new(LogLed::new("green")))?;
        let blue = registry.register(Box::new(LogLed::new("blue")))?;
        Ok(Self::new(std::sync::Arc::new(registry), red, green, blue))
    }

    /// Switch each colour fully on or off.
    pub fn set(&self, red: bool, green: bool, blue: bool) {
        for (handle, on) in [(self.red, red), (self.green, green), (self.blue, blue)] {
            let state = if on { LedState::On } else { LedState::Off };
            if let Err(e) = self.registry.set_state(handle, state) {
                log::warn!("[LED] {}", e);
            }
        }
    }

    /// Current on/off view as (red, green, blue).
    pub fn get(&self) -> (bool, bool, bool) {
        let on = |h| self.registry.state(h) == Some(LedState::On);
        (on(self.red), on(self.green), on(self.blue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Recorder(Arc<Mutex<Vec<LedState>>>);

    impl Led for Recorder {
        fn set_state(&mut self, state: LedState) {
            self.0.lock().push(state);
        }
    }

    #[test]
    fn test_register_and_set() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = LedRegistry::new();
        let h = reg.register(Box::new(Recorder(seen.clone()))).unwrap();

        reg.set_state(h, LedState::BlinkFast).unwrap();

        assert_eq!(reg.state(h), Some(LedState::BlinkFast));
        assert_eq!(*seen.lock(), vec![LedState::BlinkFast]);
    }

    #[test]
    fn test_registry_capacity() {
        let mut reg = LedRegistry::new();
        for _ in 0..MAX_LED_COUNT {
            reg.register(Box::new(LogLed::new("x"))).unwrap();
        }
        assert!(matches!(
            reg.register(Box::new(LogLed::new("x"))),
            Err(LinkError::LedRegistryFull(MAX_LED_COUNT))
        ));
        assert_eq!(reg.len(), MAX_LED_COUNT);
    }

    #[test]
    fn test_unknown_handle() {
        let reg = LedRegistry::new();
        assert!(reg.set_state(LedHandle(3), LedState::On).is_err());
        assert_eq!(reg.state(LedHandle(3)), None);
    }

    #[test]
    fn test_rgb_set_get() {
        let rgb = RgbLed::logging().unwrap();
        assert_eq!(rgb.get(), (false, false, false));
        rgb.set(true, true, false);
        assert_eq!(rgb.get(), (true, true, false));
        rgb.set(true, false, false);
        assert_eq!(rgb.get(), (true, false, false));
    }
}
