// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HM command frame used between the link and the radio module
//!
//! ```text
//! +------+---------+-----+-----+-----+-----------+---------+
//! | 0xFD | LEN(BE) | DST | CNT | CMD |   DATA    | CRC(BE) |
//! +------+---------+-----+-----+-----+-----------+---------+
//! ```
//!
//! `LEN = 3 + DATA.len()`. The CRC covers everything from the marker to the
//! end of DATA, unescaped. On the wire everything after the marker is
//! escaped (see [`crate::codec`]).

use crate::codec::{self, FRAME_START};

/// Legacy system layer (identify, version, serial)
pub const DST_HMSYSTEM: u8 = 0x00;
/// HmIP transceiver
pub const DST_TRX: u8 = 0x01;
/// BidCoS low-level MAC
pub const DST_LLMAC: u8 = 0x03;
/// Common layer, answered by bootloader and application alike
pub const DST_COMMON: u8 = 0xFE;

pub const CMD_COMMON_IDENTIFY: u8 = 0x01;
pub const CMD_COMMON_START_BL: u8 = 0x02;
pub const CMD_COMMON_START_APP: u8 = 0x03;
pub const CMD_COMMON_GET_SGTIN: u8 = 0x04;
pub const CMD_COMMON_ACK: u8 = 0x05;

pub const CMD_HMSYSTEM_IDENTIFY: u8 = 0x00;
pub const CMD_HMSYSTEM_GET_VERSION: u8 = 0x02;
pub const CMD_HMSYSTEM_GET_DEFAULT_RF_ADDRESS: u8 = 0x03;
pub const CMD_HMSYSTEM_ACK: u8 = 0x04;
pub const CMD_HMSYSTEM_GET_SERIAL: u8 = 0x0B;

pub const CMD_TRX_ACK: u8 = 0x01;
pub const CMD_TRX_GET_VERSION: u8 = 0x02;
pub const CMD_TRX_GET_MCU_TYPE: u8 = 0x09;
pub const CMD_TRX_GET_DEFAULT_RF_ADDRESS: u8 = 0x10;

pub const CMD_LLMAC_ACK: u8 = 0x01;
pub const CMD_LLMAC_GET_SERIAL: u8 = 0x07;
pub const CMD_LLMAC_GET_DEFAULT_RF_ADDRESS: u8 = 0x08;

/// First data byte of a positive acknowledge
pub const ACK_OK: u8 = 0x01;

/// Header bytes counted by LEN (dst, cnt, cmd)
const HEADER_LEN: usize = 3;

/// A decoded HM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmFrame {
    pub destination: u8,
    pub counter: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl HmFrame {
    pub fn new(counter: u8, destination: u8, command: u8, data: &[u8]) -> Self {
        Self {
            destination,
            counter,
            command,
            data: data.to_vec(),
        }
    }

    /// Encode into escaped wire bytes ready for the UART.
    pub fn encode(&self) -> Vec<u8> {
        let len = (HEADER_LEN + self.data.len()) as u16;

        let mut raw = Vec::with_capacity(self.data.len() + 8);
        raw.push(FRAME_START);
        raw.extend_from_slice(&len.to_be_bytes());
        raw.push(self.destination);
        raw.push(self.counter);
        raw.push(self.command);
        raw.extend_from_slice(&self.data);
        let crc = crc16(&raw);

        codec::encode_frame(&raw[3..], crc)
    }

    /// Parse an unescaped frame as delivered by the codec in escape-decoding
    /// mode. Returns `None` on any length or CRC mismatch.
    pub fn try_parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 3 + HEADER_LEN + 2 || buf[0] != FRAME_START {
            return None;
        }

        let len = usize::from(u16::from_be_bytes([buf[1], buf[2]]));
        if len < HEADER_LEN || buf.len() != len + 5 {
            return None;
        }

        let crc = u16::from_be_bytes([buf[len + 3], buf[len + 4]]);
        if crc16(&buf[..len + 3]) != crc {
            return None;
        }

        Some(Self {
            destination: buf[3],
            counter: buf[4],
            command: buf[5],
            data: buf[6..len + 3].to_vec(),
        })
    }

    /// True for a positive acknowledge (`ACK_OK` leading byte).
    pub fn is_ack_ok(&self) -> bool {
        self.data.first() == Some(&ACK_OK)
    }
}

/// CRC-16 used by the module protocol (polynomial 0x8005, init 0xD77F)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xD77F;

    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
