// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-stream framing for the radio module UART
//!
//! ## Frame Format
//!
//! ```text
//! +------+--------+--------+---------------+---------+
//! | 0xFD | LEN_HI | LEN_LO |  BODY (LEN)   |  CRC16  |
//! +------+--------+--------+---------------+---------+
//!   1B      1B       1B        0..n B          2B
//! ```
//!
//! - `0xFD`: frame start marker, never escaped
//! - `LEN`: big-endian body length, excluding the two CRC bytes
//! - every byte after the marker that equals `0xFC` or `0xFD` is sent as
//!   `0xFC, byte & 0x7F`
//!
//! The decoder keeps the marker and the raw length bytes in the emitted
//! frame. In raw mode (`decode_escaped == false`) escape prefixes are kept
//! too, so a frame can be forwarded to the tunnel byte-for-byte.

/// Frame start marker
pub const FRAME_START: u8 = 0xFD;

/// Escape prefix
pub const ESCAPE_CHAR: u8 = 0xFC;

/// Decoder buffer capacity. A frame reaching it is delivered truncated.
pub const MAX_FRAME_SIZE: usize = 2048;

/// CRC bytes trailing every frame body
pub const CRC_LEN: usize = 2;

/// Decoder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    /// No frame in progress, waiting for `0xFD`
    Idle,
    /// Got marker, waiting for length high byte
    AwaitLengthHigh,
    /// Waiting for length low byte
    AwaitLengthLow,
    /// Receiving body and CRC
    AwaitData,
    /// Frame finished (transient, reset to `Idle` once delivered)
    Complete,
}

/// Stateful de-framer for the module byte stream.
///
/// Only one task may drive a codec; it has no interior synchronization.
pub struct FrameCodec {
    buf: Box<[u8; MAX_FRAME_SIZE]>,
    buf_pos: usize,
    frame_pos: usize,
    frame_length: usize,
    state: CodecState,
    is_escaped: bool,
    decode_escaped: bool,
}

impl FrameCodec {
    /// Create a decoder in the given escape mode.
    pub fn new(decode_escaped: bool) -> Self {
        Self {
            buf: Box::new([0u8; MAX_FRAME_SIZE]),
            buf_pos: 0,
            frame_pos: 0,
            frame_length: 0,
            state: CodecState::Idle,
            is_escaped: false,
            decode_escaped,
        }
    }

    /// Feed one byte.
    ///
    /// Returns the buffered frame when it completes (or hits the buffer
    /// capacity). The slice is only valid until the next call.
    pub fn append(&mut self, byte: u8) -> Option<&[u8]> {
        let mut chr = byte;

        match byte {
            FRAME_START => {
                self.buf_pos = 0;
                self.is_escaped = false;
                self.state = CodecState::AwaitLengthHigh;
            }

            ESCAPE_CHAR => {
                // A stray prefix outside a frame must not grow the buffer.
                if !self.in_frame() {
                    return None;
                }
                self.is_escaped = true;
                if self.decode_escaped {
                    return None;
                }
                // Raw mode: stored as data but not counted. The length
                // counts unescaped bytes, so the prefix is not part of it.
            }

            _ => {
                if self.is_escaped && self.decode_escaped {
                    chr |= 0x80;
                }
                // Length bytes are always interpreted unescaped, even when
                // the stored byte stays raw.
                let value = if self.is_escaped { chr | 0x80 } else { chr };

                match self.state {
                    CodecState::Idle | CodecState::Complete => return None,

                    CodecState::AwaitLengthHigh => {
                        self.frame_length = usize::from(value) << 8;
                        self.state = CodecState::AwaitLengthLow;
                    }

                    CodecState::AwaitLengthLow => {
                        self.frame_length |= usize::from(value);
                        self.frame_length += CRC_LEN;
                        self.frame_pos = 0;
                        self.state = CodecState::AwaitData;
                    }

                    CodecState::AwaitData => {
                        self.frame_pos += 1;
                        if self.frame_pos == self.frame_length {
                            self.state = CodecState::Complete;
                        }
                    }
                }
                self.is_escaped = false;
            }
        }

        self.buf[self.buf_pos] = chr;
        self.buf_pos += 1;

        if self.buf_pos == MAX_FRAME_SIZE {
            self.state = CodecState::Complete;
        }

        if self.state == CodecState::Complete {
            self.state = CodecState::Idle;
            return Some(&self.buf[..self.buf_pos]);
        }

        None
    }

    /// Feed a chunk of bytes, calling `on_frame` for every completed frame
    /// in stream order.
    pub fn append_slice<F>(&mut self, data: &[u8], mut on_frame: F)
    where
        F: FnMut(&[u8]),
    {
        for &byte in data {
            if let Some(frame) = self.append(byte) {
                on_frame(frame);
            }
        }
    }

    /// Drop any partially received frame.
    pub fn flush(&mut self) {
        self.state = CodecState::Idle;
        self.buf_pos = 0;
        self.is_escaped = false;
    }

    /// Switch escape decoding on or off.
    pub fn set_decode_escaped(&mut self, decode_escaped: bool) {
        self.decode_escaped = decode_escaped;
    }

    /// Current escape decoding mode
    pub const fn decode_escaped(&self) -> bool {
        self.decode_escaped
    }

    /// Current decoder state
    pub const fn state(&self) -> CodecState {
        self.state
    }

    const fn in_frame(&self) -> bool {
        !matches!(self.state, CodecState::Idle | CodecState::Complete)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("state", &self.state)
            .field("buf_pos", &self.buf_pos)
            .field("frame_pos", &self.frame_pos)
            .field("frame_length", &self.frame_length)
            .field("decode_escaped", &self.decode_escaped)
            .finish()
    }
}

/// Append `data` to `out`, escaping `0xFC` and `0xFD`.
pub fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &byte in data {
        if byte == FRAME_START || byte == ESCAPE_CHAR {
            out.push(ESCAPE_CHAR);
            out.push(byte & 0x7F);
        } else {
            out.push(byte);
        }
    }
}

/// Build a complete wire frame from `body` and its `crc`.
///
/// The length field counts the body only.
pub fn encode_frame(body: &[u8], crc: u16) -> Vec<u8> {
    let len = body.len() as u16;
    let mut out = Vec::with_capacity(body.len() + 8);
    out.push(FRAME_START);
    escape_into(&mut out, &len.to_be_bytes());
    escape_into(&mut out, body);
    escape_into(&mut out, &crc.to_be_bytes());
    out
}
