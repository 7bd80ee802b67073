//! ECBM command protocol.

use core::fmt::Debug;
use core::marker::PhantomData;
use core::ops::Range;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::cipher::{self, Key, KEY_LEN};
use crate::error::Error;
use crate::firmware::{encode_name, DeviceInfo, NAME_LEN, TEST_PHRASE_LEN};
use crate::framer::Framer;
use crate::protocol::{self, PacketType, Signature, ADDR_BROADCAST, REQUEST_OVERHEAD};
use crate::session::SessionTable;
use crate::{Options, Transport};

/// Protocol instance bound to one transport.
///
/// Owns the frame buffer and the session table, so exchanges are strictly one
/// at a time. Use one instance per port.
pub struct Ecbm<P, D, E> {
    port: P,
    delay: D,
    options: Options,
    framer: Framer,
    sessions: SessionTable,
    _err: PhantomData<E>,
}

impl<P, D, E> Ecbm<P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new protocol instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            port,
            delay,
            options,
            framer: Framer::new(),
            sessions: SessionTable::default(),
            _err: PhantomData,
        }
    }

    /// Release the underlying port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Response (silence) timeout in milliseconds
    pub fn timeout(&self) -> u32 {
        self.options.response_timeout_ms
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.options.response_timeout_ms = timeout_ms;
    }

    /// Run `f` with a temporary response timeout
    pub fn with_timeout<T>(&mut self, timeout_ms: u32, f: impl FnOnce(&mut Self) -> T) -> T {
        let prev = self.timeout();
        self.set_timeout(timeout_ms);
        let r = f(self);
        self.set_timeout(prev);
        r
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn session_key(&self, addr: u8) -> Option<&Key> {
        self.sessions.get(addr)
    }

    /// Largest payload a single write can carry
    pub fn max_write_len(&self) -> usize {
        self.framer.max_payload().saturating_sub(REQUEST_OVERHEAD)
    }

    /// Discard stale bytes left over from an aborted exchange.
    ///
    /// A read failure ends the drain, the exchange goes ahead regardless.
    fn drain(&mut self) -> usize {
        let mut n = 0;
        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    warn!("Read failed while draining: {:?}", e);
                    break;
                }
            }
        }
        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }
        n
    }

    /// Send the packet in the frame buffer and await the answer frame.
    ///
    /// Returns the answer length, or `None` for broadcasts.
    fn transfer(&mut self, len: usize, addr: u8) -> Result<Option<usize>, Error<E>> {
        self.drain();

        let wire = self.framer.make(len).map_err(Error::Encode)?;
        trace!("Sending frame: {:02x?}", wire);

        for b in wire {
            block!(self.port.write(*b)).map_err(Error::Write)?;
        }
        block!(self.port.flush()).map_err(Error::Write)?;

        self.framer.reset();

        if addr == ADDR_BROADCAST {
            return Ok(None);
        }

        self.receive().map(Some)
    }

    /// Poll for one answer frame, the timeout restarts on every received byte
    fn receive(&mut self) -> Result<usize, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut silence = 0;
        let mut received = false;

        loop {
            match self.port.read() {
                Ok(b) => {
                    received = true;
                    silence = 0;

                    match self.framer.push(b) {
                        Ok(Some(n)) if n > 0 => {
                            trace!("Received frame: {:02x?}", self.framer.received(n));
                            return Ok(n);
                        }
                        Ok(_) => (),
                        Err(e) => {
                            debug!("Framing error: {}", e);
                            return Err(Error::Integrity);
                        }
                    }
                }
                Err(nb::Error::WouldBlock) => {
                    self.delay.delay_ms(poll);
                    silence += poll;

                    if silence > self.options.response_timeout_ms {
                        self.framer.reset();
                        return if received {
                            error!("Response stalled mid-frame");
                            Err(Error::Integrity)
                        } else {
                            error!("Response timeout");
                            Err(Error::Timeout)
                        };
                    }
                }
                Err(nb::Error::Other(e)) => return Err(Error::Read(e)),
            }
        }
    }

    /// Run one request/answer exchange, returning the answer payload range
    /// within the frame buffer (`None` for broadcasts)
    fn exchange(
        &mut self,
        addr: u8,
        ptype: PacketType,
        sig: u16,
        payload: &[u8],
        answer: PacketType,
    ) -> Result<Option<Range<usize>>, Error<E>> {
        if payload.len() > self.max_write_len() {
            return Err(Error::InvalidArgument("payload too long"));
        }

        let key = self.sessions.get(addr).copied();

        debug!(
            "Request {:?} to {} sig {} ({} bytes{})",
            ptype,
            addr,
            sig,
            payload.len(),
            if key.is_some() { ", encrypted" } else { "" }
        );

        let len = protocol::build_request(self.framer.payload_mut(), addr, ptype, sig, payload, key.as_ref());

        let n = match self.transfer(len, addr)? {
            Some(n) => n,
            None => return Ok(None),
        };

        let packet = self.framer.received_mut(n);
        protocol::parse_answer(packet, addr, answer, key.as_ref()).map(Some)
    }

    /// Write `data` to signature `sig` of device `addr`.
    ///
    /// Broadcast writes return as soon as the frame is sent.
    pub fn write(&mut self, addr: u8, sig: u16, data: &[u8]) -> Result<(), Error<E>> {
        self.exchange(addr, PacketType::Write, sig, data, PacketType::Write)
            .map(|_| ())
    }

    /// Read signature `sig` of device `addr` into `buf`, returning the byte count
    pub fn read(&mut self, addr: u8, sig: u16, buf: &mut [u8]) -> Result<usize, Error<E>> {
        self.read_typed(addr, sig, PacketType::Read, buf)
    }

    fn read_typed(
        &mut self,
        addr: u8,
        sig: u16,
        ptype: PacketType,
        buf: &mut [u8],
    ) -> Result<usize, Error<E>> {
        if addr == ADDR_BROADCAST {
            return Err(Error::InvalidArgument("cannot read from broadcast address"));
        }

        let range = self
            .exchange(addr, ptype, sig, &[], PacketType::Read)?
            .ok_or(Error::Integrity)?;

        let n = range.len();
        if n > buf.len() {
            debug!("Answer of {} bytes exceeds {} byte buffer", n, buf.len());
            return Err(Error::Overflow);
        }

        buf[..n].copy_from_slice(&self.framer.received(range.end)[range]);
        Ok(n)
    }

    /// Establish an encrypted session with a device.
    ///
    /// The device answers with a random challenge, which decrypted under the
    /// base key becomes the session key.
    pub fn begin_session(&mut self, addr: u8, base_key: &Key) -> Result<(), Error<E>> {
        if addr == ADDR_BROADCAST {
            return Err(Error::InvalidArgument("broadcast address cannot hold a session"));
        }

        self.sessions.remove(addr);

        if !self.sessions.has_room_for(addr) {
            return Err(Error::SessionTableFull);
        }

        let mut challenge = [0u8; KEY_LEN];
        let n = self.read_typed(addr, 0, PacketType::EncSession, &mut challenge)?;
        if n != KEY_LEN {
            debug!("Session challenge of {} bytes", n);
            return Err(Error::Integrity);
        }

        let mut key = [0u8; KEY_LEN];
        cipher::decode(base_key, &challenge, &mut key);

        self.sessions
            .insert(addr, key)
            .map_err(|_| Error::SessionTableFull)?;

        debug!("Session established with device {}", addr);
        Ok(())
    }

    /// Forget the session for one device, returning whether one existed
    pub fn close_session(&mut self, addr: u8) -> bool {
        self.sessions.remove(addr)
    }

    /// Forget all sessions, returning how many were open
    pub fn close_all_sessions(&mut self) -> usize {
        self.sessions.clear()
    }

    fn read_device_info(&mut self, addr: u8, sig: Signature) -> Result<DeviceInfo, Error<E>> {
        let mut buf = [0u8; NAME_LEN + 3];
        let n = self.read(addr, sig as u16, &mut buf)?;
        DeviceInfo::parse(&buf[..n]).ok_or(Error::Integrity)
    }

    /// Name and version of the running program (bootloader or application)
    pub fn read_info(&mut self, addr: u8) -> Result<DeviceInfo, Error<E>> {
        self.read_device_info(addr, Signature::Info)
    }

    /// Name and version of the installed application
    pub fn firmware_info(&mut self, addr: u8) -> Result<DeviceInfo, Error<E>> {
        self.read_device_info(addr, Signature::BootFwInfo)
    }

    /// Checksum of the installed application
    pub fn firmware_checksum(&mut self, addr: u8) -> Result<u32, Error<E>> {
        let mut buf = [0u8; 4];
        let n = self.read(addr, Signature::BootChecksum as u16, &mut buf)?;
        if n != 4 {
            return Err(Error::Integrity);
        }
        Ok(u32::from_be_bytes(buf))
    }

    pub fn pick(&mut self, addr: u8) -> Result<(), Error<E>> {
        self.write(addr, Signature::Pick as u16, &[])
    }

    /// Reboot a device, its session is dropped whatever the outcome
    pub fn reset(&mut self, addr: u8) -> Result<(), Error<E>> {
        let r = self.write(addr, Signature::Reset as u16, &[]);
        self.sessions.remove(addr);
        r
    }

    /// Reboot every device on the bus, returning the number of sessions dropped
    pub fn reset_bus(&mut self) -> Result<usize, Error<E>> {
        let n = self.close_all_sessions();
        self.write(ADDR_BROADCAST, Signature::Reset as u16, &[])?;
        Ok(n)
    }

    /// Replace the long term authentication key of a device
    pub fn set_new_auth_key(&mut self, addr: u8, key: &Key) -> Result<(), Error<E>> {
        self.write(addr, Signature::AuthKey as u16, key)
    }

    pub fn begin_upload_firmware(
        &mut self,
        addr: u8,
        name: &str,
        version: &[u8; 3],
        test_phrase: &[u8; TEST_PHRASE_LEN],
        timeout_ms: u32,
    ) -> Result<(), Error<E>> {
        let mut buf = Vec::with_capacity(NAME_LEN + 3 + TEST_PHRASE_LEN);
        encode_name(name, &mut buf);
        buf.extend_from_slice(version);
        buf.extend_from_slice(test_phrase);

        self.with_timeout(timeout_ms, |s| s.write(addr, Signature::BootBegin as u16, &buf))
    }

    pub fn write_firmware_block(
        &mut self,
        addr: u8,
        data: &[u8],
        offset: u32,
        timeout_ms: u32,
    ) -> Result<(), Error<E>> {
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&offset.to_be_bytes());
        buf.extend_from_slice(data);

        self.with_timeout(timeout_ms, |s| s.write(addr, Signature::BootWrite as u16, &buf))
    }

    pub fn end_upload_firmware(
        &mut self,
        addr: u8,
        checksum: u32,
        len: u32,
        timeout_ms: u32,
    ) -> Result<(), Error<E>> {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&checksum.to_be_bytes());
        buf[4..].copy_from_slice(&len.to_be_bytes());

        self.with_timeout(timeout_ms, |s| s.write(addr, Signature::BootEnd as u16, &buf))
    }
}
