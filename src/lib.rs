//! ECBM serial bootloader host.
//!
//! Addressed, checksummed and optionally encrypted request/response exchanges
//! with bus nodes over any `embedded-hal` serial port, and the authenticated
//! firmware upload sequence built on top.
//!
//! ```text
//! Bootloader -> Ecbm -> Framer -> serial port
//! ```

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod boot;
pub mod cipher;
pub mod crc;
pub mod ecbm;
pub mod error;
pub mod firmware;
pub mod framer;
pub mod protocol;
pub mod session;

pub use boot::Bootloader;
pub use cipher::Key;
pub use ecbm::Ecbm;
pub use error::{Band, Error};
pub use firmware::{DeviceInfo, FirmwareFile, FirmwareInfo};
pub use protocol::{Signature, ADDR_BROADCAST};

/// Byte transport, a serial port with a shared read/write error type.
///
/// `read` must not block: `WouldBlock` signals that no byte is pending.
pub trait Transport<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> Transport<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Silence period after which a device response is abandoned
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "250"))]
    pub response_timeout_ms: u32,

    /// Period to poll for response bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: protocol::DEFAULT_TIMEOUT_MS,
            poll_delay_ms: 10,
        }
    }
}
