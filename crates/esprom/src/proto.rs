//! Loader command packets and responses.
//!
//! # Wire format (inside SLIP frames, all little-endian)
//!
//! ```text
//! REQUEST:  [1: dir=0x00] [1: cmd] [2: payload len] [4: checksum] [payload]
//! RESPONSE: [1: dir=0x01] [1: cmd] [2: body len]    [4: value]    [body]
//! ```
//!
//! Responses end with status bytes: 4 on the ESP32 ROM loader, 2 once
//! the stub is running. The first status byte is zero on success; the
//! second carries the loader's error code.

use crate::FlashError;

/// Request direction byte.
pub const DIR_REQUEST: u8 = 0x00;
/// Response direction byte.
pub const DIR_RESPONSE: u8 = 0x01;

/// Checksum seed for data-bearing commands.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Loader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    ReadReg = 0x0A,
    /// Stub-only: erase the entire flash.
    EraseFlash = 0xD0,
}

/// XOR checksum over a data payload, seeded with [`CHECKSUM_SEED`].
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(CHECKSUM_SEED, |acc, &b| acc ^ b) as u32
}

/// The classic sync payload: `07 07 12 20` followed by 32 × `55`.
pub fn sync_payload() -> Vec<u8> {
    let mut p = vec![0x07, 0x07, 0x12, 0x20];
    p.extend(std::iter::repeat_n(0x55, 32));
    p
}

/// Builds a request packet (to be SLIP-encoded before sending).
pub fn request(cmd: Command, payload: &[u8], checksum: u32) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(8 + payload.len());
    pkt.push(DIR_REQUEST);
    pkt.push(cmd as u8);
    pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    pkt.extend_from_slice(&checksum.to_le_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// A parsed loader response.
#[derive(Debug, Clone)]
pub struct Response {
    pub cmd: u8,
    pub value: u32,
    pub body: Vec<u8>,
}

impl Response {
    /// Parses a de-SLIPped frame as a response packet.
    ///
    /// Returns `None` for frames that are not responses at all (the stub
    /// greeting, boot log noise) so callers can skip them.
    pub fn parse(frame: &[u8]) -> Result<Option<Response>, FlashError> {
        if frame.first() != Some(&DIR_RESPONSE) {
            return Ok(None);
        }
        if frame.len() < 8 {
            return Err(FlashError::Malformed(format!(
                "response frame too short: {} bytes",
                frame.len()
            )));
        }
        let cmd = frame[1];
        let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = frame[8..].to_vec();
        if body.len() != len {
            return Err(FlashError::Malformed(format!(
                "response body length {} does not match header {len}",
                body.len()
            )));
        }
        Ok(Some(Response { cmd, value, body }))
    }

    /// Checks the trailing status bytes (`status_len` of them).
    pub fn check_status(&self, cmd: Command, status_len: usize) -> Result<(), FlashError> {
        if self.body.len() < status_len {
            return Err(FlashError::Malformed(format!(
                "response to {cmd:?} carries no status bytes"
            )));
        }
        let status = &self.body[self.body.len() - status_len..];
        if status[0] != 0 {
            return Err(FlashError::Status {
                cmd,
                code: status.get(1).copied().unwrap_or(0),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

/// Four little-endian words, the shape of every *_BEGIN payload.
pub fn words(a: u32, b: u32, c: u32, d: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(16);
    for w in [a, b, c, d] {
        p.extend_from_slice(&w.to_le_bytes());
    }
    p
}

/// Payload for FLASH_DATA / MEM_DATA: `size, seq, 0, 0` header + data.
pub fn data_payload(data: &[u8], seq: u32) -> Vec<u8> {
    let mut p = words(data.len() as u32, seq, 0, 0);
    p.extend_from_slice(data);
    p
}
