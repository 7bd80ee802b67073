//! 7-bit framing.
//!
//! Frames are delimited by `BEGIN` and `END`, the only bytes on the wire with the
//! high bit set. Payload high bits are stripped and collected into mark bytes
//! appended after the payload, one mark byte per 7 payload bytes.

use thiserror::Error;

pub const BEGIN: u8 = 0xD4;
pub const END: u8 = 0x81;

const MARK_MASK: u8 = 0x80;

/// Default frame buffer size, fits a 4 KiB payload with marks and delimiters
pub const FRAME_CAPACITY: usize = 4096 + 4096 / 7 + 2;

#[derive(Copy, Clone, PartialEq, Debug, Error)]
pub enum FrameError {
    /// Payload does not fit the frame buffer once encoded
    #[error("payload of {0} bytes does not fit the frame buffer")]
    TooLong(usize),

    /// Marker byte other than BEGIN or END inside a frame
    #[error("unexpected marker 0x{0:02x} inside frame")]
    UnexpectedMarker(u8),

    /// Received frame exceeds the buffer
    #[error("receive buffer overflow")]
    Overflow,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum RxState {
    Idle,
    Receiving,
}

/// Number of mark bytes appended to `n` payload bytes
pub fn mark_len(n: usize) -> usize {
    (n + 6) / 7
}

/// Stuff the first `n` bytes of `buf` in place, appending mark bytes.
///
/// `buf` must hold at least `n + mark_len(n)` bytes. Returns the body length.
pub fn encode_in_place(buf: &mut [u8], n: usize) -> usize {
    let marks = mark_len(n);
    for m in &mut buf[n..n + marks] {
        *m = 0;
    }

    for i in 0..n {
        if buf[i] & MARK_MASK != 0 {
            buf[n + i / 7] |= 1 << (i % 7);
            buf[i] &= !MARK_MASK;
        }
    }

    n + marks
}

/// Encode a payload into a frame body (without delimiters)
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut body = payload.to_vec();
    body.resize(payload.len() + mark_len(payload.len()), 0);
    encode_in_place(&mut body, payload.len());
    body
}

/// Restore a frame body in place, returning the payload length.
///
/// The trailing `ceil(len / 8)` bytes of `body` are taken as mark bytes.
pub fn decode(body: &mut [u8]) -> usize {
    let n = body.len();
    let marks = (n + 7) / 8;
    let data = n - marks;

    for i in 0..data {
        if body[data + i / 7] & (1 << (i % 7)) != 0 {
            body[i] |= MARK_MASK;
        }
    }

    data
}

/// Reusable frame buffer for both directions of an exchange
pub struct Framer {
    buf: Vec<u8>,
    ptr: usize,
    state: RxState,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            ptr: 0,
            state: RxState::Idle,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Largest payload `make` accepts
    pub fn max_payload(&self) -> usize {
        let mut n = self.capacity().saturating_sub(2);
        while n > 0 && n + mark_len(n) + 2 > self.capacity() {
            n -= 1;
        }
        n
    }

    pub fn reset(&mut self) {
        self.ptr = 0;
        self.state = RxState::Idle;
    }

    /// Writable payload area for the next outgoing frame
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[1..]
    }

    /// Frame the first `n` bytes of the payload area, returning the wire bytes
    pub fn make(&mut self, n: usize) -> Result<&[u8], FrameError> {
        if n + mark_len(n) + 2 > self.capacity() {
            return Err(FrameError::TooLong(n));
        }

        self.buf[0] = BEGIN;
        let len = encode_in_place(&mut self.buf[1..], n);
        self.buf[len + 1] = END;

        Ok(&self.buf[..len + 2])
    }

    /// Feed one received byte.
    ///
    /// Returns the payload length once a frame completes, the payload is then
    /// available through `received`.
    pub fn push(&mut self, byte: u8) -> Result<Option<usize>, FrameError> {
        match self.state {
            RxState::Idle => {
                if byte == BEGIN {
                    self.ptr = 0;
                    self.state = RxState::Receiving;
                }
                Ok(None)
            }
            RxState::Receiving if byte & MARK_MASK != 0 => match byte {
                END => {
                    let len = decode(&mut self.buf[..self.ptr]);
                    self.reset();
                    Ok(Some(len))
                }
                BEGIN => {
                    trace!("Frame restarted after {} bytes", self.ptr);
                    self.ptr = 0;
                    Ok(None)
                }
                _ => {
                    self.reset();
                    Err(FrameError::UnexpectedMarker(byte))
                }
            },
            RxState::Receiving => {
                if self.ptr >= self.capacity() {
                    self.reset();
                    return Err(FrameError::Overflow);
                }
                self.buf[self.ptr] = byte;
                self.ptr += 1;
                Ok(None)
            }
        }
    }

    /// Payload of the last completed frame
    pub fn received(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    pub fn received_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[..len]
    }
}
