//! Per-device session keys.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cipher::Key;
use crate::protocol::{ADDR_BROADCAST, MAX_SESSIONS};

#[derive(Copy, Clone, PartialEq, Debug, Error)]
pub enum SessionError {
    #[error("broadcast address cannot hold a session")]
    Broadcast,

    #[error("session table full ({0} slots)")]
    Full(usize),
}

/// Bounded map of device address to session key.
///
/// At most one key per address, never one for the broadcast address.
#[derive(Clone, Debug)]
pub struct SessionTable {
    keys: BTreeMap<u8, Key>,
    capacity: usize,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(MAX_SESSIONS)
    }
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: BTreeMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether a new address could be added
    pub fn has_room_for(&self, addr: u8) -> bool {
        self.keys.contains_key(&addr) || self.keys.len() < self.capacity
    }

    pub fn get(&self, addr: u8) -> Option<&Key> {
        if addr == ADDR_BROADCAST {
            return None;
        }
        self.keys.get(&addr)
    }

    /// Store a key, replacing any existing key for the address
    pub fn insert(&mut self, addr: u8, key: Key) -> Result<(), SessionError> {
        if addr == ADDR_BROADCAST {
            return Err(SessionError::Broadcast);
        }
        if !self.has_room_for(addr) {
            return Err(SessionError::Full(self.capacity));
        }

        self.keys.insert(addr, key);
        Ok(())
    }

    /// Drop the key for an address, returning whether one existed
    pub fn remove(&mut self, addr: u8) -> bool {
        self.keys.remove(&addr).is_some()
    }

    /// Drop every key, returning how many were held
    pub fn clear(&mut self) -> usize {
        let n = self.keys.len();
        self.keys.clear();
        n
    }

    pub fn addresses(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys.keys().cloned()
    }
}
