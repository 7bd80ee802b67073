//! Simulated ECBM devices behind a mock serial port.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use ecbm_loader::cipher::{self, Key};
use ecbm_loader::crc::crc32;
use ecbm_loader::error::app;
use ecbm_loader::framer::{self, BEGIN, END};
use ecbm_loader::protocol::{self, PacketType, Signature, ADDR_BROADCAST};
use ecbm_loader::{Ecbm, Options};

#[derive(Clone, PartialEq, Debug)]
pub struct SimError;

pub struct SimDevice {
    pub addr: u8,
    pub auth_key: Key,
    /// Firmware key, used to verify uploaded images
    pub fw_key: Key,
    pub session: Option<Key>,
    pub challenge: [u8; 16],

    pub boot_name: String,
    pub boot_version: [u8; 3],
    pub app_name: String,
    pub app_version: [u8; 3],
    pub app_checksum: u32,

    pub image: Vec<u8>,
    pub begin: Option<(String, [u8; 3], [u8; 16])>,
    pub end: Option<(u32, u32)>,

    /// Attempts seen per block offset
    pub block_attempts: BTreeMap<u32, usize>,
    /// Number of attempts to leave unanswered per block offset
    pub drop_blocks: BTreeMap<u32, usize>,

    pub resets: usize,
    pub picks: usize,
    pub requests: usize,
}

impl SimDevice {
    pub fn new(addr: u8, auth_key: Key) -> Self {
        Self {
            addr,
            auth_key,
            fw_key: [0u8; 16],
            session: None,
            challenge: [addr; 16],
            boot_name: "sim-boot".to_string(),
            boot_version: [1, 2, 3],
            app_name: String::new(),
            app_version: [0; 3],
            app_checksum: 0,
            image: vec![],
            begin: None,
            end: None,
            block_attempts: BTreeMap::new(),
            drop_blocks: BTreeMap::new(),
            resets: 0,
            picks: 0,
            requests: 0,
        }
    }

    /// Session key the host is expected to derive from the current challenge
    pub fn expected_session_key(&self) -> Key {
        let mut k = [0u8; 16];
        cipher::decode(&self.auth_key, &self.challenge, &mut k);
        k
    }

    fn answer(&self, ptype: PacketType, payload: &[u8], key: Option<&Key>) -> Vec<u8> {
        let mut buf = vec![0u8; payload.len() + 32];
        let n = protocol::build_answer(&mut buf, self.addr, ptype, payload, key);

        let mut wire = vec![BEGIN];
        wire.extend(framer::encode(&buf[..n]));
        wire.push(END);
        wire
    }

    fn error(&self, code: u8, key: Option<&Key>) -> Vec<u8> {
        self.answer(PacketType::Error, &[code], key)
    }

    /// Handle one decoded packet, returning wire bytes to send back
    pub fn handle(&mut self, packet: &[u8]) -> Vec<u8> {
        // Try the session key first, then plaintext
        let mut candidates = vec![];
        if let Some(k) = self.session {
            candidates.push(Some(k));
        }
        candidates.push(None);

        for key in candidates {
            let mut p = packet.to_vec();
            let req = match protocol::parse_request::<SimError>(&mut p, key.as_ref()) {
                Ok(r) => r,
                Err(_) => continue,
            };

            if req.addr != self.addr && req.addr != ADDR_BROADCAST {
                return vec![];
            }

            self.requests += 1;
            let payload = p[req.payload.clone()].to_vec();
            return self.dispatch(req.addr, req.ptype, req.sig, &payload, key);
        }

        vec![]
    }

    fn dispatch(&mut self, to: u8, ptype: PacketType, sig: u16, payload: &[u8], key: Option<Key>) -> Vec<u8> {
        let key = key.as_ref();

        if to == ADDR_BROADCAST {
            if sig == Signature::Reset as u16 {
                self.reboot();
            }
            return vec![];
        }

        match ptype {
            PacketType::EncSession => {
                let a = self.answer(PacketType::Read, &self.challenge, None);
                self.session = Some(self.expected_session_key());
                a
            }
            PacketType::Read => self.on_read(sig, key),
            PacketType::Write => self.on_write(sig, payload, key),
            PacketType::Error => vec![],
        }
    }

    fn reboot(&mut self) {
        self.session = None;
        self.resets += 1;
        for c in self.challenge.iter_mut() {
            *c = c.wrapping_add(0x11);
        }
    }

    fn on_read(&mut self, sig: u16, key: Option<&Key>) -> Vec<u8> {
        let info = |name: &str, version: &[u8; 3]| {
            let mut v = name.as_bytes().to_vec();
            v.push(0);
            v.extend_from_slice(version);
            v
        };

        match sig {
            s if s == Signature::Info as u16 => {
                self.answer(PacketType::Read, &info(&self.boot_name, &self.boot_version), key)
            }
            s if s == Signature::BootFwInfo as u16 => {
                self.answer(PacketType::Read, &info(&self.app_name, &self.app_version), key)
            }
            s if s == Signature::BootChecksum as u16 => {
                self.answer(PacketType::Read, &self.app_checksum.to_be_bytes(), key)
            }
            _ => self.error(app::NO_SIGNATURE, key),
        }
    }

    fn on_write(&mut self, sig: u16, payload: &[u8], key: Option<&Key>) -> Vec<u8> {
        let ok = |d: &Self| d.answer(PacketType::Write, &[], key);

        match sig {
            s if s == Signature::Pick as u16 => {
                self.picks += 1;
                ok(self)
            }
            s if s == Signature::Reset as u16 => {
                let a = ok(self);
                self.reboot();
                a
            }
            _ if key.is_none() => self.error(app::MUST_ENCRYPT, None),
            s if s == Signature::AuthKey as u16 => {
                if payload.len() != 16 {
                    return self.error(app::INTERNAL, key);
                }
                self.auth_key.copy_from_slice(payload);
                ok(self)
            }
            s if s == Signature::BootBegin as u16 => {
                let nul = match payload.iter().position(|b| *b == 0) {
                    Some(n) => n,
                    None => return self.error(app::INTERNAL, key),
                };
                let rest = &payload[nul + 1..];
                if rest.len() != 3 + 16 {
                    return self.error(app::INTERNAL, key);
                }

                let name = String::from_utf8_lossy(&payload[..nul]).into_owned();
                let mut version = [0u8; 3];
                version.copy_from_slice(&rest[..3]);
                let mut phrase = [0u8; 16];
                phrase.copy_from_slice(&rest[3..]);

                self.begin = Some((name, version, phrase));
                self.image.clear();
                ok(self)
            }
            s if s == Signature::BootWrite as u16 => {
                if payload.len() < 4 {
                    return self.error(app::INTERNAL, key);
                }
                let offset = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                *self.block_attempts.entry(offset).or_insert(0) += 1;

                if let Some(n) = self.drop_blocks.get_mut(&offset) {
                    if *n > 0 {
                        *n -= 1;
                        return vec![];
                    }
                }

                let data = &payload[4..];
                let end = offset as usize + data.len();
                if self.image.len() < end {
                    self.image.resize(end, 0);
                }
                self.image[offset as usize..end].copy_from_slice(data);
                ok(self)
            }
            s if s == Signature::BootEnd as u16 => {
                if payload.len() != 8 {
                    return self.error(app::INTERNAL, key);
                }
                let checksum = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let len = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                self.end = Some((checksum, len));

                let mut plain = self.image.clone();
                cipher::decode_buf(&self.fw_key, &mut plain);

                if len as usize != plain.len() || crc32(&plain) != checksum {
                    return self.error(app::BOOT_BAD_CHECKSUM, key);
                }

                if let Some((name, version, _)) = &self.begin {
                    self.app_name = name.clone();
                    self.app_version = *version;
                }
                self.app_checksum = checksum;
                ok(self)
            }
            _ => self.error(app::NO_SIGNATURE, key),
        }
    }
}

/// Devices sharing one serial line
#[derive(Default)]
pub struct SimBus {
    pub devices: Vec<SimDevice>,
    /// Raw request frames seen on the line
    pub frames: Vec<Vec<u8>>,
    /// Frame indices whose final byte fails to write, once each.
    /// Failed frames are still recorded in `frames`.
    pub fail_frames: BTreeSet<usize>,
}

impl SimBus {
    pub fn device(&mut self, addr: u8) -> &mut SimDevice {
        self.devices
            .iter_mut()
            .find(|d| d.addr == addr)
            .expect("no such device")
    }

    fn on_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        self.frames.push(frame.to_vec());

        let mut body = frame[1..frame.len() - 1].to_vec();
        let n = framer::decode(&mut body);
        body.truncate(n);

        let mut out = vec![];
        for d in self.devices.iter_mut() {
            out.extend(d.handle(&body));
        }
        out
    }
}

pub struct SimPort {
    bus: Rc<RefCell<SimBus>>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl Read<u8> for SimPort {
    type Error = SimError;

    fn read(&mut self) -> nb::Result<u8, SimError> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for SimPort {
    type Error = SimError;

    fn write(&mut self, b: u8) -> nb::Result<(), SimError> {
        if b == BEGIN {
            self.tx.clear();
        }
        self.tx.push(b);
        if b == END {
            let frame = std::mem::take(&mut self.tx);

            let mut bus = self.bus.borrow_mut();
            let index = bus.frames.len();
            if bus.fail_frames.remove(&index) {
                // Logged on the line, never delivered
                bus.frames.push(frame);
                return Err(nb::Error::Other(SimError));
            }

            let answer = bus.on_frame(&frame);
            self.rx.extend(answer);
        }
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), SimError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SimDelay {
    pub total: Rc<RefCell<u64>>,
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        *self.total.borrow_mut() += ms as u64;
    }
}

pub type SimEcbm = Ecbm<SimPort, SimDelay, SimError>;

/// Build a protocol instance over a bus of simulated devices
pub fn setup(devices: Vec<SimDevice>) -> (SimEcbm, Rc<RefCell<SimBus>>, SimDelay) {
    let bus = Rc::new(RefCell::new(SimBus {
        devices,
        frames: vec![],
        fail_frames: BTreeSet::new(),
    }));

    let port = SimPort {
        bus: bus.clone(),
        rx: VecDeque::new(),
        tx: vec![],
    };

    let delay = SimDelay::default();

    (Ecbm::new(port, delay.clone(), Options::default()), bus, delay)
}
