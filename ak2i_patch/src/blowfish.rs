// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! KEY1, the Blowfish variant the NDS cartridge protocol uses.
//!
//! Word 0x00..0x12 of the hash table are the round keys, followed by four
//! 0x100 entry S-boxes at 0x12, 0x112, 0x212 and 0x312. A block is two
//! consecutive words of a buffer, low word first.

use crate::key_table::HashTable;
use crate::Error;

/// Round function. The operator order (add, xor, add) is fixed by hardware.
#[inline]
fn feistel(hash_table: &HashTable, z: u32) -> u32 {
    let z = z as usize;
    let mut x = hash_table[0x012 + ((z >> 24) & 0xFF)];
    x = hash_table[0x112 + ((z >> 16) & 0xFF)].wrapping_add(x);
    x = hash_table[0x212 + ((z >> 8) & 0xFF)] ^ x;
    hash_table[0x312 + (z & 0xFF)].wrapping_add(x)
}

/// Encrypt the block at `buf[offset..offset + 2]` in place.
///
/// The caller guarantees `offset + 1` is in bounds.
pub fn forward(hash_table: &HashTable, buf: &mut [u32], offset: usize) {
    let mut x = buf[offset + 1];
    let mut y = buf[offset];
    for i in 0..0x10 {
        let z = hash_table[i] ^ x;
        x = y ^ feistel(hash_table, z);
        y = z;
    }
    buf[offset] = x ^ hash_table[0x10];
    buf[offset + 1] = y ^ hash_table[0x11];
}

/// Decrypt the block at `buf[offset..offset + 2]` in place.
pub fn reverse(hash_table: &HashTable, buf: &mut [u32], offset: usize) {
    let mut x = buf[offset + 1];
    let mut y = buf[offset];
    for i in (0x2..=0x11).rev() {
        let z = hash_table[i] ^ x;
        x = y ^ feistel(hash_table, z);
        y = z;
    }
    buf[offset] = x ^ hash_table[0x1];
    buf[offset + 1] = y ^ hash_table[0x0];
}

/// Encrypt every block of `words`, which must hold a whole number of blocks
pub fn encrypt_words(hash_table: &HashTable, words: &mut [u32]) -> Result<(), Error> {
    if words.len() % 2 != 0 {
        return Err(Error::UnalignedInput {
            input: "cipher input",
            len: words.len() * 4,
            align: 8,
        });
    }
    for offset in (0..words.len()).step_by(2) {
        forward(hash_table, words, offset);
    }
    Ok(())
}

/// Decrypt every block of `words`, undoing [`encrypt_words`]
pub fn decrypt_words(hash_table: &HashTable, words: &mut [u32]) -> Result<(), Error> {
    if words.len() % 2 != 0 {
        return Err(Error::UnalignedInput {
            input: "cipher input",
            len: words.len() * 4,
            align: 8,
        });
    }
    for offset in (0..words.len()).step_by(2) {
        reverse(hash_table, words, offset);
    }
    Ok(())
}
