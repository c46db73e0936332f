// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel datagram format
//!
//! ```text
//! +------+-----+-----------------+---------+
//! | TYPE | SEQ |   PAYLOAD (N)   | CRC(BE) |
//! +------+-----+-----------------+---------+
//!    1B    1B        0..n B          2B
//! ```
//!
//! The CRC is the module protocol CRC ([`crate::hm_frame::crc16`]) over TYPE,
//! SEQ and PAYLOAD.

use std::net::SocketAddr;

use thiserror::Error;

use crate::hm_frame::crc16;

/// Protocol version carried in Connect
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes of TYPE + SEQ + CRC
pub const PACKET_OVERHEAD: usize = 4;

/// Connect request from a peer: `[version]`
pub const CONNECT_REQUEST_LEN: usize = PACKET_OVERHEAD + 1;

/// Connect acknowledge from the bridge: `[version, echo]`
pub const CONNECT_ACK_LEN: usize = PACKET_OVERHEAD + 2;

/// Largest module frame forwarded in one datagram (MTU - IP/UDP headers -
/// tunnel overhead)
pub const MAX_FRAME_PAYLOAD: usize = 1500 - 28 - PACKET_OVERHEAD;

/// Datagram type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    KeepAlive = 2,
    SetLed = 3,
    Reset = 4,
    StartTunnel = 5,
    StopTunnel = 6,
    Frame = 7,
}

impl PacketType {
    /// Whether a datagram of `len` bytes (including header and CRC) is
    /// well-formed for this type, in either direction. Connect is a request
    /// or an acknowledge; the bridge only accepts the request.
    pub fn accepts_length(self, len: usize) -> bool {
        match self {
            PacketType::Connect => len == CONNECT_REQUEST_LEN || len == CONNECT_ACK_LEN,
            PacketType::SetLed => len == 5,
            PacketType::Reset | PacketType::StartTunnel | PacketType::StopTunnel => len == 4,
            PacketType::Frame => len >= 5,
            PacketType::Disconnect | PacketType::KeepAlive => true,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketType::Connect,
            1 => PacketType::Disconnect,
            2 => PacketType::KeepAlive,
            3 => PacketType::SetLed,
            4 => PacketType::Reset,
            5 => PacketType::StartTunnel,
            6 => PacketType::StopTunnel,
            7 => PacketType::Frame,
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

/// Reasons a datagram is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),

    #[error("packet from invalid address {0}")]
    InvalidAddress(SocketAddr),

    #[error("invalid crc (expected 0x{expected:04X}, got 0x{actual:04X})")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("invalid {kind:?} packet length {len}")]
    InvalidLength { kind: PacketType, len: usize },
}

/// A validated datagram borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub kind: PacketType,
    pub seq: u8,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Check the trailing CRC. `data` must hold at least the overhead.
    pub fn verify_crc(data: &[u8]) -> Result<(), PacketError> {
        if data.len() < PACKET_OVERHEAD {
            return Err(PacketError::TooShort(data.len()));
        }
        let split = data.len() - 2;
        let expected = crc16(&data[..split]);
        let actual = u16::from_be_bytes([data[split], data[split + 1]]);
        if expected != actual {
            return Err(PacketError::CrcMismatch { expected, actual });
        }
        Ok(())
    }

    /// Decode type and per-type length of a datagram whose CRC already
    /// checked out.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_OVERHEAD {
            return Err(PacketError::TooShort(data.len()));
        }
        let kind = PacketType::try_from(data[0])?;
        if !kind.accepts_length(data.len()) {
            return Err(PacketError::InvalidLength {
                kind,
                len: data.len(),
            });
        }
        Ok(Self {
            kind,
            seq: data[1],
            payload: &data[2..data.len() - 2],
        })
    }

    /// Verify the CRC, then parse.
    pub fn decode(data: &'a [u8]) -> Result<Self, PacketError> {
        Self::verify_crc(data)?;
        Self::parse(data)
    }
}

/// Build a datagram.
pub fn encode(kind: PacketType, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + PACKET_OVERHEAD);
    out.push(kind as u8);
    out.push(seq);
    out.extend_from_slice(payload);
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}
