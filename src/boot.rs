//! Firmware upload sequence.
//!
//! Construction authenticates, reboots the device into its bootloader and
//! authenticates again. Uploads then stream the encrypted image in offset
//! tagged chunks and ask the device to verify the result.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::cipher::Key;
use crate::ecbm::Ecbm;
use crate::error::Error;
use crate::firmware::{DeviceInfo, FirmwareInfo, TEST_PHRASE_LEN};
use crate::Transport;

/// Time allowed for a device to reboot after a reset request
pub const SETTLE_DELAY_MS: u32 = 500;

/// Retries per chunk after the first attempt
pub const BLOCK_RETRIES: usize = 5;

pub const RETRY_DELAY_MS: u32 = 100;

pub const BEGIN_TIMEOUT_MS: u32 = 5000;
pub const BLOCK_TIMEOUT_MS: u32 = 2500;
pub const END_TIMEOUT_MS: u32 = 5000;

pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Authenticated bootloader connection to a single device
pub struct Bootloader<'a, P, D, E> {
    ecbm: &'a mut Ecbm<P, D, E>,
    addr: u8,
    info: DeviceInfo,
}

impl<'a, P, D, E> Bootloader<'a, P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Authenticate with a device and reboot it into its bootloader
    pub fn new(ecbm: &'a mut Ecbm<P, D, E>, addr: u8, auth_key: &Key) -> Result<Self, Error<E>> {
        trace!("Static auth key: {}", hex::encode(auth_key));

        if let Err(e) = ecbm.begin_session(addr, auth_key) {
            error!("Failed to begin pre-reset session: {}", e);
            return Err(e);
        }

        debug!("Resetting device {}", addr);
        match ecbm.reset(addr) {
            Ok(()) => (),
            // Devices may reboot before answering
            Err(Error::Timeout) => debug!("No answer to reset request"),
            Err(e) => {
                error!("Failed to reset device: {}", e);
                return Err(e);
            }
        }

        ecbm.delay_ms(SETTLE_DELAY_MS);

        if let Err(e) = ecbm.begin_session(addr, auth_key) {
            error!("Failed to begin session: {}", e);
            return Err(e);
        }

        let info = match ecbm.read_info(addr) {
            Ok(i) => i,
            Err(e) => {
                error!("Failed to read bootloader info: {}", e);
                return Err(e);
            }
        };

        info!("Bootloader: {}", info);

        Ok(Self { ecbm, addr, info })
    }

    pub fn address(&self) -> u8 {
        self.addr
    }

    /// Bootloader identity read during construction
    pub fn bootloader_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn upload_firmware(
        &mut self,
        info: &FirmwareInfo,
        test_phrase: &[u8; TEST_PHRASE_LEN],
        data: &[u8],
        block_size: usize,
    ) -> Result<(), Error<E>> {
        self.upload_firmware_with_progress(info, test_phrase, data, block_size, |_, _| ())
    }

    /// Upload an encrypted image, reporting `(sent, total)` after each chunk
    pub fn upload_firmware_with_progress(
        &mut self,
        info: &FirmwareInfo,
        test_phrase: &[u8; TEST_PHRASE_LEN],
        data: &[u8],
        block_size: usize,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), Error<E>> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("firmware is empty"));
        }
        if data.len() % 8 != 0 {
            error!("Firmware length must be a multiple of 8, got {}", data.len());
            return Err(Error::InvalidArgument("firmware length must be a multiple of 8"));
        }
        if block_size == 0 {
            return Err(Error::InvalidArgument("block size must be non-zero"));
        }
        // Each chunk goes out behind its 4 byte offset
        if block_size.min(data.len()) + 4 > self.ecbm.max_write_len() {
            error!(
                "Block size {} exceeds the {} byte frame limit",
                block_size,
                self.ecbm.max_write_len().saturating_sub(4)
            );
            return Err(Error::InvalidArgument("block size too large"));
        }
        if data.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("firmware too large"));
        }

        info!("Sending firmware info for {}", info);
        self.ecbm.begin_upload_firmware(
            self.addr,
            &info.name,
            &info.version,
            test_phrase,
            BEGIN_TIMEOUT_MS,
        )?;

        info!("Uploading {} bytes in {} byte blocks", data.len(), block_size);
        for (i, chunk) in data.chunks(block_size).enumerate() {
            let offset = i * block_size;
            self.write_block(chunk, offset as u32)?;
            progress(offset + chunk.len(), data.len());
        }

        info!("Verifying");
        self.ecbm.end_upload_firmware(
            self.addr,
            info.checksum,
            data.len() as u32,
            END_TIMEOUT_MS,
        )?;

        info!("Upload and verify complete");
        Ok(())
    }

    /// Write one chunk, retrying bus and transport faults
    fn write_block(&mut self, chunk: &[u8], offset: u32) -> Result<(), Error<E>> {
        let mut retries = 0;

        loop {
            match self
                .ecbm
                .write_firmware_block(self.addr, chunk, offset, BLOCK_TIMEOUT_MS)
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && retries < BLOCK_RETRIES => {
                    retries += 1;
                    warn!(
                        "Failed to write block at 0x{:08x}: {} (retry {}/{})",
                        offset, e, retries, BLOCK_RETRIES
                    );
                    self.ecbm.delay_ms(RETRY_DELAY_MS);
                }
                Err(e) => {
                    error!("Failed to write block at 0x{:08x}: {}", offset, e);
                    return Err(e);
                }
            }
        }
    }

    /// Ask the device to identify itself
    pub fn pick(&mut self) -> Result<(), Error<E>> {
        self.ecbm.pick(self.addr)
    }

    /// Identity of the installed application
    pub fn firmware_info(&mut self) -> Result<FirmwareInfo, Error<E>> {
        let info = self.ecbm.firmware_info(self.addr)?;
        let checksum = self.ecbm.firmware_checksum(self.addr)?;

        Ok(FirmwareInfo {
            name: info.name,
            version: info.version,
            checksum,
        })
    }

    /// Replace the device authentication key, effective from the next session
    pub fn set_new_auth_key(&mut self, key: &Key) -> Result<(), Error<E>> {
        self.ecbm.set_new_auth_key(self.addr, key)
    }
}
