// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crc_any::CRCu16;

/// CRC16 as used by the NDS header and secure area fields.
///
/// This is CRC-16/MODBUS:
/// poly: 0x8005 (0xa001 reflected)
/// initial: 0xffff
/// final xor: 0x0000
/// reflected: yes
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16modbus();
    crc.digest(bytes);
    crc.get_crc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_initial_value() {
        assert_eq!(crc16(b""), 0xFFFF);
    }

    #[test]
    fn check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn single_byte() {
        // 0xFFFF ^ 0x00 shifted through eight rounds of 0xA001
        assert_eq!(crc16(&[0x00]), 0x40BF);
    }
}
