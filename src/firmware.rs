//! Firmware descriptors and the encrypted firmware container.

use core::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cipher::{self, Key, BLOCK_LEN, KEY_LEN};
use crate::crc::{crc32, crc32_step};

/// Maximum name length on the wire, terminator included
pub const NAME_LEN: usize = 32;

pub const TEST_PHRASE_LEN: usize = 16;

pub const FIRMWARE_EXTENSION: &str = "bin";

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware file must have '.{}' extension, not '{0}'", FIRMWARE_EXTENSION)]
    Extension(String),

    #[error("version must be three numbers between 0..255 delimited by dots, e.g. '0.5.12', not '{0}'")]
    Version(String),

    #[error("key must be written as 32 hex symbols, e.g. '00112233445566778899AABBCCDDEEFF'")]
    Key,

    #[error("test phrase must be {} ASCII symbols", TEST_PHRASE_LEN)]
    TestPhrase,

    #[error("container field '{0}' has length {1}")]
    FieldLength(&'static str, usize),

    #[error("container encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("container decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Name and version as reported by a device
#[derive(Clone, PartialEq, Debug, Default)]
pub struct DeviceInfo {
    pub name: String,
    pub version: [u8; 3],
}

impl DeviceInfo {
    /// Decode a NUL terminated name followed by three version bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let window = &data[..data.len().min(NAME_LEN)];
        let (name, used) = match window.iter().position(|b| *b == 0) {
            Some(n) => (&window[..n], n + 1),
            // Unterminated names are cut to fit a terminator
            None if window.len() == NAME_LEN => (&window[..NAME_LEN - 1], NAME_LEN),
            None => return None,
        };

        let v = data.get(used..used + 3)?;

        Some(Self {
            name: String::from_utf8_lossy(name).into_owned(),
            version: [v[0], v[1], v[2]],
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, VersionDisplay(&self.version))
    }
}

struct VersionDisplay<'a>(&'a [u8; 3]);

impl<'a> fmt::Display for VersionDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Logical identity of a firmware image
#[derive(Clone, PartialEq, Debug, Default)]
pub struct FirmwareInfo {
    pub name: String,
    pub version: [u8; 3],
    pub checksum: u32,
}

impl FirmwareInfo {
    /// Devices report a zero checksum when no application is installed
    pub fn is_empty(&self) -> bool {
        self.checksum == 0
    }
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "no app");
        }
        write!(
            f,
            "{} v{} (checksum 0x{:08X})",
            self.name,
            VersionDisplay(&self.version),
            self.checksum
        )
    }
}

/// Encode a name as sent to devices: NUL terminated, at most `NAME_LEN` bytes
pub fn encode_name(name: &str, buf: &mut Vec<u8>) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    buf.extend_from_slice(&bytes[..n]);
    buf.push(0);
}

/// Pad byte used to align images to the cipher block size
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Filler {
    Ones,
    Zeros,
}

impl Filler {
    pub fn byte(&self) -> u8 {
        match self {
            Filler::Ones => 0xFF,
            Filler::Zeros => 0x00,
        }
    }
}

impl Default for Filler {
    fn default() -> Self {
        Filler::Ones
    }
}

/// On-disk firmware container, a positional msgpack array
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FirmwareFile {
    pub name: String,
    #[serde(with = "bin")]
    pub version: Vec<u8>,
    /// Checksum of the padded plaintext image
    pub checksum: u32,
    #[serde(with = "bin")]
    pub test_phrase: Vec<u8>,
    /// Padded and encrypted image
    #[serde(with = "bin")]
    pub data: Vec<u8>,
}

impl FirmwareFile {
    /// Pad, checksum and encrypt a raw image
    pub fn package(
        name: &str,
        version: [u8; 3],
        key: &Key,
        test_phrase: &str,
        mut data: Vec<u8>,
        filler: Filler,
    ) -> Result<Self, FirmwareError> {
        let test_phrase = make_test_phrase(key, test_phrase)?;

        while data.len() % BLOCK_LEN != 0 {
            data.push(filler.byte());
        }

        let checksum = crc32(&data);
        cipher::encode_buf(key, &mut data);

        Ok(Self {
            name: name.to_string(),
            version: version.to_vec(),
            checksum,
            test_phrase: test_phrase.to_vec(),
            data,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FirmwareError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, FirmwareError> {
        Ok(rmp_serde::from_slice(raw)?)
    }

    pub fn info(&self) -> Result<FirmwareInfo, FirmwareError> {
        if self.version.len() != 3 {
            return Err(FirmwareError::FieldLength("version", self.version.len()));
        }

        Ok(FirmwareInfo {
            name: self.name.clone(),
            version: [self.version[0], self.version[1], self.version[2]],
            checksum: self.checksum,
        })
    }

    pub fn test_phrase(&self) -> Result<[u8; TEST_PHRASE_LEN], FirmwareError> {
        let mut p = [0u8; TEST_PHRASE_LEN];
        if self.test_phrase.len() != TEST_PHRASE_LEN {
            return Err(FirmwareError::FieldLength("test_phrase", self.test_phrase.len()));
        }
        p.copy_from_slice(&self.test_phrase);
        Ok(p)
    }
}

/// Check the source image has the expected extension
pub fn check_extension(path: &Path) -> Result<(), FirmwareError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(FIRMWARE_EXTENSION) => Ok(()),
        Some(e) => Err(FirmwareError::Extension(format!(".{}", e))),
        None => Err(FirmwareError::Extension(String::new())),
    }
}

/// Parse `major.minor.patch`, components outside 0..=255 become 255
pub fn parse_version(s: &str) -> Result<[u8; 3], FirmwareError> {
    let parts = s
        .trim()
        .split('.')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| FirmwareError::Version(s.to_string()))?;

    if parts.len() != 3 {
        return Err(FirmwareError::Version(s.to_string()));
    }

    let mut version = [0u8; 3];
    for (v, p) in version.iter_mut().zip(parts) {
        *v = if (0..=255).contains(&p) { p as u8 } else { 255 };
    }

    Ok(version)
}

/// Parse a key written as 32 hex characters
pub fn parse_key(s: &str) -> Result<Key, FirmwareError> {
    if s.len() != KEY_LEN * 2 {
        return Err(FirmwareError::Key);
    }

    let mut key = [0u8; KEY_LEN];
    hex::decode_to_slice(s, &mut key).map_err(|_| FirmwareError::Key)?;
    Ok(key)
}

/// Encrypt a 16 character phrase with the firmware key
pub fn make_test_phrase(key: &Key, phrase: &str) -> Result<[u8; TEST_PHRASE_LEN], FirmwareError> {
    if phrase.len() != TEST_PHRASE_LEN || !phrase.is_ascii() {
        return Err(FirmwareError::TestPhrase);
    }

    let mut out = [0u8; TEST_PHRASE_LEN];
    cipher::encode(key, phrase.as_bytes(), &mut out);
    Ok(out)
}

/// Derive an authentication key from a numeric PIN
pub fn pin_to_key(pin: u32) -> Key {
    let digits = [(pin % 100) as u8, ((pin % 10000) / 100) as u8, (pin / 10000) as u8];

    let mut key = [0u8; KEY_LEN];
    let mut crc = pin.wrapping_add(1);

    for chunk in key.chunks_exact_mut(4) {
        for d in &digits {
            crc = crc32_step(crc, *d);
        }
        chunk.copy_from_slice(&crc.to_be_bytes());
    }

    key
}

/// Byte fields are stored as msgpack `bin`
mod bin {
    use core::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(v.as_ref())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        // Older containers stored bytes as integer arrays
        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}
