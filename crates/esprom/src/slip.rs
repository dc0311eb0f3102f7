//! SLIP framing (RFC 1055 flavor used by the ESP serial loader).
//!
//! ```text
//! frame:  C0 <escaped payload> C0
//! escape: C0 -> DB DC, DB -> DB DD
//! ```

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped form of END.
pub const ESC_END: u8 = 0xDC;
/// Escaped form of ESC.
pub const ESC_ESC: u8 = 0xDD;

/// Encodes one payload as a SLIP frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &b in payload {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Incremental SLIP decoder.
///
/// Bytes arrive from the port in arbitrary chunk boundaries; feed them
/// in with [`push`](Self::push) and collect whole de-escaped frames.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    frame: Vec<u8>,
    in_frame: bool,
    in_escape: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes in, returning every frame completed by them.
    /// Empty frames (back-to-back delimiters) are discarded.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if !self.in_frame {
                if b == END {
                    self.in_frame = true;
                }
                continue;
            }
            if self.in_escape {
                self.in_escape = false;
                match b {
                    ESC_END => self.frame.push(END),
                    ESC_ESC => self.frame.push(ESC),
                    // Invalid escape; keep the raw byte and move on.
                    other => self.frame.push(other),
                }
                continue;
            }
            match b {
                END => {
                    if !self.frame.is_empty() {
                        frames.push(std::mem::take(&mut self.frame));
                    }
                    self.in_frame = false;
                }
                ESC => self.in_escape = true,
                other => self.frame.push(other),
            }
        }
        frames
    }
}
