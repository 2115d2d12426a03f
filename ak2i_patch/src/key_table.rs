// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;
use ak2i_areas::{
    KEY_SOURCE_LEN, KEY_SOURCE_OFFSET, KEY_TABLE_HEADER_LEN, KEY_TABLE_LEN, KEY_TABLE_WORDS,
};
use byteorder::{ByteOrder, LittleEndian};

/// Round keys and S-boxes for the KEY1 Blowfish variant, as stored in flash
pub type HashTable = [u32; KEY_TABLE_WORDS];

/// Pull the key source out of a boot11 dump.
///
/// boot11 copies it from here before deriving the table (ref: 0xFFFF82D0).
pub fn extract_key_source(boot11: &[u8], offset: usize) -> Result<&[u8], Error> {
    offset
        .checked_add(KEY_SOURCE_LEN)
        .and_then(|end| boot11.get(offset..end))
        .ok_or(Error::TruncatedInput {
            input: "boot11 dump",
            needed: offset.saturating_add(KEY_SOURCE_LEN),
            actual: boot11.len(),
        })
}

/// Same as [`extract_key_source`] at the retail boot11 offset
pub fn extract_retail_key_source(boot11: &[u8]) -> Result<&[u8], Error> {
    extract_key_source(boot11, KEY_SOURCE_OFFSET)
}

/// A 0x1048 byte key table: 0x48 permuted bytes followed by the key source.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyTable([u8; KEY_TABLE_LEN]);

impl KeyTable {
    /// Derive the table the way boot11 does on retail units (ref: 0xFFFF98E8).
    ///
    /// Header byte `x` is the key source byte at
    /// `0x100 * (x % 16) + key_source[x]`. Every read comes from the source,
    /// never from header bytes already written.
    pub fn build(key_source: &[u8]) -> Result<KeyTable, Error> {
        if key_source.len() != KEY_SOURCE_LEN {
            return Err(Error::InvalidInputSize {
                input: "key source",
                expected: "exactly 0x1000 bytes",
                actual: key_source.len(),
            });
        }

        let mut table = [0u8; KEY_TABLE_LEN];
        let (header, body) = table.split_at_mut(KEY_TABLE_HEADER_LEN);
        for (x, out) in header.iter_mut().enumerate() {
            let idx = 0x100 * (x % 16) + key_source[x] as usize;
            *out = key_source[idx];
        }
        body.copy_from_slice(key_source);

        Ok(KeyTable(table))
    }

    /// Load a table previously written by [`KeyTable::build`]
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyTable, Error> {
        let table: [u8; KEY_TABLE_LEN] =
            bytes.try_into().map_err(|_| Error::InvalidInputSize {
                input: "key table",
                expected: "exactly 0x1048 bytes",
                actual: bytes.len(),
            })?;
        Ok(KeyTable(table))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The permuted bytes
    pub fn header(&self) -> &[u8] {
        &self.0[..KEY_TABLE_HEADER_LEN]
    }

    /// The verbatim key source
    pub fn body(&self) -> &[u8] {
        &self.0[KEY_TABLE_HEADER_LEN..]
    }

    /// The table as the little-endian words the cipher indexes
    pub fn hash_table(&self) -> HashTable {
        let mut words = [0u32; KEY_TABLE_WORDS];
        LittleEndian::read_u32_into(&self.0, &mut words);
        words
    }
}

impl std::fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyTable")
            .field("header", &hex::encode(self.header()))
            .finish_non_exhaustive()
    }
}
