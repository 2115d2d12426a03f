// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Little-endian conversion between byte buffers and 32-bit words

use crate::Error;
use byteorder::{ByteOrder, LittleEndian};

pub fn to_words(input: &'static str, bytes: &[u8]) -> Result<Vec<u32>, Error> {
    if bytes.len() % 4 != 0 {
        return Err(Error::UnalignedInput {
            input,
            len: bytes.len(),
            align: 4,
        });
    }
    let mut words = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(bytes, &mut words);
    Ok(words)
}

pub fn from_words(words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * 4];
    LittleEndian::write_u32_into(words, &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_order() {
        let words = to_words("test", &[0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        assert_eq!(words, vec![0x0403_0201, 0xDDCC_BBAA]);
        assert_eq!(from_words(&words), [0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn rejects_partial_word() {
        let err = to_words("sections", &[0; 6]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnalignedInput {
                len: 6,
                align: 4,
                ..
            }
        ));
    }
}
