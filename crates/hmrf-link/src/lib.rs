// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hmrf-link - Homematic radio module link stack
//!
//! Bridges a Homematic radio daughter-module attached over UART to a single
//! network client over UDP, and identifies which module is attached.
//!
//! ## Architecture
//!
//! ```text
//!  UART bytes                                            UDP :3008
//!      |                                                     ^
//!      v                                                     |
//! +------------+   frames   +-------------+  FrameHandler  +---------------+
//! | FrameCodec | ---------> | ModuleLink  | -------------> | TunnelSession | <--> peer
//! +------------+            |  detection  | <------------- |  keepalive    |
//!                           +-------------+   send_frame   +---------------+
//!                                  |
//!                                  v
//!                          UART TX / reset line
//! ```
//!
//! - [`codec::FrameCodec`] turns the UART byte stream into `0xFD`-delimited,
//!   length-prefixed frames, optionally undoing the `0xFC` escape scheme.
//! - [`link::ModuleLink`] owns the UART lifecycle, dispatches decoded frames to
//!   one swappable [`link::FrameHandler`] and runs module detection at startup.
//! - [`tunnel::TunnelSession`] exposes the raw frame stream to exactly one
//!   authorized UDP peer with session, keepalive and CRC checks.
//!
//! Nothing in the background paths is fatal: malformed input is logged and
//! dropped, a missing module leaves [`link::ModuleType::None`].

pub mod codec;
pub mod config;
pub mod error;
pub mod hm_frame;
pub mod led;
pub mod link;
pub mod tunnel;
pub mod uart;

#[cfg(test)]
mod testutil;

// Re-exports for convenience.
pub use codec::{CodecState, FrameCodec};
pub use config::{BridgeConfig, ConfigError, DetectionConfig, ResetConfig, TunnelConfig, UartConfig};
pub use error::{LinkError, Result};
pub use hm_frame::HmFrame;
pub use led::{Led, LedHandle, LedRegistry, LedState, LogLed, RgbLed};
pub use link::{FrameHandler, ModuleIdentity, ModuleLink, ModuleType};
pub use tunnel::{PacketError, PacketType, TunnelSession};
pub use uart::{NoResetLine, ResetLine, SerialUart, SysfsResetLine, UartDriver, UartEvent};

/// Version of hmrf-link
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
