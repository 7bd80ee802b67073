//! ECBM wire protocol.
//!
//! Requests: `[fill][address][dir|type][signature BE16][payload][crc32 BE][fill bytes]`
//! Answers:  `[fill][address][dir|type][payload][crc32 BE][fill bytes]`
//!
//! The checksum covers everything before it. With a session key the whole
//! packet, fill included, is encrypted with the block cipher.

use core::fmt::Debug;
use core::ops::Range;

use crate::cipher::{self, Key, BLOCK_LEN};
use crate::crc::crc32;
use crate::error::Error;

pub const ADDR_BROADCAST: u8 = 0;

pub const DEFAULT_TIMEOUT_MS: u32 = 250;

pub const ENC_FILL_BYTE: u8 = 0x5A;

pub const MAX_SESSIONS: usize = 8;

pub const REQUEST_HEADER_LEN: usize = 5;
pub const ANSWER_HEADER_LEN: usize = 3;
pub const CRC_LEN: usize = 4;

/// Worst case bytes added around a request payload
pub const REQUEST_OVERHEAD: usize = REQUEST_HEADER_LEN + CRC_LEN + BLOCK_LEN;

const DIR_MASK: u8 = 0b0001_0000;
const TYPE_MASK: u8 = 0b0000_1111;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Direction {
    Request = 0b0001_0000,
    Answer = 0b0000_0000,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum PacketType {
    Write = 0b0000,
    Read = 0b0001,
    /// Session challenge request
    EncSession = 0b0100,
    /// Only ever sent by devices
    Error = 0b1000,
}

impl PacketType {
    pub fn from_bits(v: u8) -> Option<Self> {
        match v & TYPE_MASK {
            0b0000 => Some(PacketType::Write),
            0b0001 => Some(PacketType::Read),
            0b0100 => Some(PacketType::EncSession),
            0b1000 => Some(PacketType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Signature {
    /// Reboot the device, it forgets its session
    Reset = 0,

    /// Device name and version
    Info = 1,

    /// Presence ping, devices typically blink
    Pick = 15,

    /// Start a firmware upload with name, version and test phrase
    BootBegin = 16,

    /// Finish an upload with checksum and length
    BootEnd = 17,

    /// Checksum of the installed application
    BootChecksum = 18,

    /// Offset prefixed firmware chunk
    BootWrite = 20,

    /// Name and version of the installed application
    BootFwInfo = 22,

    /// Replace the long term authentication key
    AuthKey = 24,
}

/// Fill bytes needed for a packet of `len` bytes (checksum included)
pub fn fill_len(len: usize, encrypted: bool) -> usize {
    if encrypted {
        BLOCK_LEN - (len % BLOCK_LEN)
    } else {
        0
    }
}

fn put_crc(buf: &mut [u8], len: usize) {
    let crc = crc32(&buf[..len]);
    buf[len..len + CRC_LEN].copy_from_slice(&crc.to_be_bytes());
}

fn seal(buf: &mut [u8], len: usize, fill: usize, key: Option<&Key>) -> usize {
    if let Some(key) = key {
        for b in &mut buf[len..len + fill] {
            *b = ENC_FILL_BYTE;
        }
        cipher::encode_buf(key, &mut buf[..len + fill]);
    }
    len + fill
}

/// Assemble a request into `buf`, returning the packet length.
///
/// `buf` must hold `payload.len() + REQUEST_OVERHEAD` bytes.
pub fn build_request(
    buf: &mut [u8],
    addr: u8,
    ptype: PacketType,
    sig: u16,
    payload: &[u8],
    key: Option<&Key>,
) -> usize {
    let body = REQUEST_HEADER_LEN + payload.len();

    // Reads always go out as a single 16 byte block when encrypted
    let fill = match ptype {
        PacketType::Write => fill_len(body + CRC_LEN, key.is_some()),
        _ if key.is_some() => 7,
        _ => 0,
    };

    buf[0] = fill as u8;
    buf[1] = addr;
    buf[2] = Direction::Request as u8 | ptype as u8;
    buf[3..5].copy_from_slice(&sig.to_be_bytes());
    buf[5..body].copy_from_slice(payload);
    put_crc(buf, body);

    seal(buf, body + CRC_LEN, fill, key)
}

/// Assemble an answer into `buf` as a device would, returning the packet length
pub fn build_answer(
    buf: &mut [u8],
    addr: u8,
    ptype: PacketType,
    payload: &[u8],
    key: Option<&Key>,
) -> usize {
    let body = ANSWER_HEADER_LEN + payload.len();
    let fill = fill_len(body + CRC_LEN, key.is_some());

    buf[0] = fill as u8;
    buf[1] = addr;
    buf[2] = Direction::Answer as u8 | ptype as u8;
    buf[3..body].copy_from_slice(payload);
    put_crc(buf, body);

    seal(buf, body + CRC_LEN, fill, key)
}

/// Decrypt and check framing common to both directions, returning the checksum offset
fn open<E: Debug>(
    packet: &mut [u8],
    header: usize,
    dir: Direction,
    key: Option<&Key>,
) -> Result<usize, Error<E>> {
    if let Some(key) = key {
        if packet.len() % BLOCK_LEN != 0 {
            debug!("Encrypted packet length {} is not block aligned", packet.len());
            return Err(Error::Integrity);
        }
        cipher::decode_buf(key, packet);
    }

    let fill = *packet.first().ok_or(Error::Integrity)? as usize;
    if packet.len() < header + CRC_LEN + fill {
        debug!("Short packet ({} bytes, fill {})", packet.len(), fill);
        return Err(Error::Integrity);
    }

    if packet[2] & DIR_MASK != dir as u8 {
        debug!("Unexpected direction in packet header 0x{:02x}", packet[2]);
        return Err(Error::Integrity);
    }

    let crc_at = packet.len() - fill - CRC_LEN;
    let mut expected = [0u8; CRC_LEN];
    expected.copy_from_slice(&packet[crc_at..crc_at + CRC_LEN]);

    if crc32(&packet[..crc_at]) != u32::from_be_bytes(expected) {
        debug!("Packet checksum mismatch");
        return Err(Error::Integrity);
    }

    Ok(crc_at)
}

/// Validate an answer in place and return the range of its payload.
///
/// Error answers become `Error::Application` with the device code.
pub fn parse_answer<E: Debug>(
    packet: &mut [u8],
    addr: u8,
    expected: PacketType,
    key: Option<&Key>,
) -> Result<Range<usize>, Error<E>> {
    let end = open(packet, ANSWER_HEADER_LEN, Direction::Answer, key)?;

    if packet[1] != addr {
        debug!("Answer from address {} while expecting {}", packet[1], addr);
        return Err(Error::Integrity);
    }

    match PacketType::from_bits(packet[2]) {
        Some(PacketType::Error) => match packet[ANSWER_HEADER_LEN..end].first() {
            Some(&code) if code != 0 => Err(Error::Application(code)),
            _ => Err(Error::Integrity),
        },
        Some(t) if t == expected => Ok(ANSWER_HEADER_LEN..end),
        t => {
            debug!("Unexpected answer type {:?} (expected {:?})", t, expected);
            Err(Error::Integrity)
        }
    }
}

/// Decoded request header, device side
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub addr: u8,
    pub ptype: PacketType,
    pub sig: u16,
    pub payload: Range<usize>,
}

/// Validate a request in place as a device would
pub fn parse_request<E: Debug>(packet: &mut [u8], key: Option<&Key>) -> Result<Request, Error<E>> {
    let end = open(packet, REQUEST_HEADER_LEN, Direction::Request, key)?;

    let ptype = PacketType::from_bits(packet[2]).ok_or(Error::Integrity)?;

    Ok(Request {
        addr: packet[1],
        ptype,
        sig: u16::from_be_bytes([packet[3], packet[4]]),
        payload: REQUEST_HEADER_LEN..end,
    })
}
