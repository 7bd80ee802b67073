//! Error taxonomy.
//!
//! Every error maps onto a negative numeric code in one of three bands so logs
//! and callers can tell device rejections, local driver faults and link faults
//! apart: application `-1..=-255`, internal `-256..=-511`, bus `-512..=-1023`.

use core::fmt::Debug;

use thiserror::Error;

use crate::framer::FrameError;

pub const ERR_APP_FIRST: i32 = -1;
pub const ERR_APP_LAST: i32 = -255;
pub const ERR_INT_FIRST: i32 = -256;
pub const ERR_INT_LAST: i32 = -511;
pub const ERR_BUS_FIRST: i32 = -512;
pub const ERR_BUS_LAST: i32 = -1023;

/// Application error codes reported by devices
pub mod app {
    pub const NO_SIGNATURE: u8 = 1;
    pub const INTERNAL: u8 = 4;
    pub const BOOT_BAD_CHECKSUM: u8 = 16;
    pub const BOOT_BAD_KEY: u8 = 17;
    pub const NO_ENCRYPTION: u8 = 24;
    pub const MUST_ENCRYPT: u8 = 25;
}

pub const ERR_READ: i32 = -256;
pub const ERR_WRITE: i32 = -258;
pub const ERR_OVERFLOW: i32 = -260;
pub const ERR_NO_MEM: i32 = -262;
pub const ERR_INVALID_ARG: i32 = -300;
pub const ERR_ENCODE: i32 = -310;

pub const ERR_TIMEOUT: i32 = -512;
pub const ERR_INTEGRITY: i32 = -520;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Band {
    /// Fault reported by the device itself
    Application,
    /// Local driver fault
    Internal,
    /// Timing or link fault
    Bus,
}

impl Band {
    /// Classify a numeric code, `None` for success or unknown ranges
    pub fn of(code: i32) -> Option<Band> {
        if code <= ERR_APP_FIRST && code >= ERR_APP_LAST {
            Some(Band::Application)
        } else if code <= ERR_INT_FIRST && code >= ERR_INT_LAST {
            Some(Band::Internal)
        } else if code <= ERR_BUS_FIRST && code >= ERR_BUS_LAST {
            Some(Band::Bus)
        } else {
            None
        }
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<E: Debug> {
    /// Device answered with an error packet
    #[error("device reported error {0}")]
    Application(u8),

    #[error("transport read failed: {0:?}")]
    Read(E),

    #[error("transport write failed: {0:?}")]
    Write(E),

    /// Response does not fit the supplied buffer
    #[error("buffer overflow")]
    Overflow,

    #[error("all session slots are in use")]
    SessionTableFull,

    #[error("out of memory")]
    NoMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("frame encode failed: {0}")]
    Encode(FrameError),

    #[error("response timeout")]
    Timeout,

    /// Malformed, truncated or mismatched response
    #[error("response integrity error")]
    Integrity,
}

impl<E: Debug> Error<E> {
    /// Numeric code of this error
    pub fn code(&self) -> i32 {
        match self {
            Error::Application(c) => -(*c as i32),
            Error::Read(_) => ERR_READ,
            Error::Write(_) => ERR_WRITE,
            Error::Overflow | Error::SessionTableFull => ERR_OVERFLOW,
            Error::NoMemory => ERR_NO_MEM,
            Error::InvalidArgument(_) => ERR_INVALID_ARG,
            Error::Encode(_) => ERR_ENCODE,
            Error::Timeout => ERR_TIMEOUT,
            Error::Integrity => ERR_INTEGRITY,
        }
    }

    pub fn band(&self) -> Band {
        match self {
            Error::Application(_) => Band::Application,
            Error::Timeout | Error::Integrity => Band::Bus,
            _ => Band::Internal,
        }
    }

    /// Bus faults and transport read/write failures may clear on a repeat.
    ///
    /// Application errors and faults found before any I/O are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Read(_) | Error::Write(_) => true,
            e => e.band() == Band::Bus,
        }
    }
}
