//! Lightweight block cipher used for session and firmware encryption.
//!
//! 8-byte blocks under a 16-byte key, the key schedule is recomputed for every
//! block and mutates its own state as it goes. Buffers are processed block by
//! block with no chaining, devices expect exactly this.
//!
//! Keys and blocks are interpreted as little-endian 32-bit words.

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 8;

const ROUNDS: usize = 16;

pub type Key = [u8; KEY_LEN];

fn key_words(key: &Key) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, w) in k.iter_mut().enumerate() {
        *w = u32::from_le_bytes([key[i * 4], key[i * 4 + 1], key[i * 4 + 2], key[i * 4 + 3]]);
    }
    k
}

/// Advance the key schedule for round `i`, returning the round key
fn next_subkey(k: &mut [u32; 4], i: usize) -> u32 {
    let sk = k[0]
        .wrapping_add(k[1])
        .wrapping_add(k[2].wrapping_add(k[3]) ^ (k[0] << (k[2] & 0x1F)));
    k[i % 4] = sk;
    sk
}

#[inline]
fn mix(sk: u32, b: u32) -> u32 {
    (sk.wrapping_add(b) << 9) ^ (sk.wrapping_sub(b) ^ (sk.wrapping_add(b) >> 14))
}

fn load(block: &[u8]) -> (u32, u32) {
    (
        u32::from_le_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_le_bytes([block[4], block[5], block[6], block[7]]),
    )
}

fn store(block: &mut [u8], b0: u32, b1: u32) {
    block[..4].copy_from_slice(&b0.to_le_bytes());
    block[4..8].copy_from_slice(&b1.to_le_bytes());
}

/// Encrypt a single 8-byte block in place
pub fn encode_block(key: &Key, block: &mut [u8; BLOCK_LEN]) {
    let mut k = key_words(key);
    let (mut b0, mut b1) = load(block);

    for i in 0..ROUNDS {
        let sk = next_subkey(&mut k, i);
        b0 = b0.wrapping_add(mix(sk, b1));
        b1 = b1.wrapping_add(mix(sk, b0));
    }

    store(block, b0, b1);
}

/// Decrypt a single 8-byte block in place
pub fn decode_block(key: &Key, block: &mut [u8; BLOCK_LEN]) {
    let mut k = key_words(key);
    let mut subkeys = [0u32; ROUNDS];
    for (i, sk) in subkeys.iter_mut().enumerate() {
        *sk = next_subkey(&mut k, i);
    }

    let (mut b0, mut b1) = load(block);

    for sk in subkeys.iter().rev() {
        b1 = b1.wrapping_sub(mix(*sk, b0));
        b0 = b0.wrapping_sub(mix(*sk, b1));
    }

    store(block, b0, b1);
}

fn for_each_block(data: &mut [u8], mut f: impl FnMut(&mut [u8; BLOCK_LEN])) {
    for chunk in data.chunks_exact_mut(BLOCK_LEN) {
        let mut block = [0u8; BLOCK_LEN];
        block.copy_from_slice(chunk);
        f(&mut block);
        chunk.copy_from_slice(&block);
    }
}

/// Encrypt every whole block of `data` in place.
///
/// A trailing partial block is left untouched, callers pad to a multiple of 8.
pub fn encode_buf(key: &Key, data: &mut [u8]) {
    for_each_block(data, |b| encode_block(key, b));
}

/// Decrypt every whole block of `data` in place
pub fn decode_buf(key: &Key, data: &mut [u8]) {
    for_each_block(data, |b| decode_block(key, b));
}

/// Encrypt `src` into `dst`, which must be at least as long as `src`
pub fn encode(key: &Key, src: &[u8], dst: &mut [u8]) {
    let dst = &mut dst[..src.len()];
    dst.copy_from_slice(src);
    encode_buf(key, dst);
}

/// Decrypt `src` into `dst`, which must be at least as long as `src`
pub fn decode(key: &Key, src: &[u8], dst: &mut [u8]) {
    let dst = &mut dst[..src.len()];
    dst.copy_from_slice(src);
    decode_buf(key, dst);
}
