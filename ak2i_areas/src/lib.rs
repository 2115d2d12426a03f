// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed layout of the AK2I flashcart firmware image.
//!
//! The lower half of the flash holds the cart's own stage-2 data; the loader
//! we target reads the "fake ROM" starting at 0x80000:
//!
//! | offset  | size   | desc                                         |
//! | 0x80000 | 0x2000 | key table (0x1048 bytes + padding)           |
//! | 0x82000 | 0x1000 | NDS header                                   |
//! | 0x83600 | 0x48   | first 0x48 bytes of the key table            |
//! | 0x84800 | 0x1000 | next 0xBF0 bytes of the key table            |
//! | 0x86000 | 0x4000 | secure area                                  |
//! | 0x8A000 | ...    | data area                                    |

use byteorder::{ByteOrder, LittleEndian};
use packed_struct::prelude::*;
use serde::Deserialize;
use std::ops::Range;

/// Offset of the key source inside a boot11 dump
pub const KEY_SOURCE_OFFSET: usize = 0xB498;
pub const KEY_SOURCE_LEN: usize = 0x1000;

/// Derived key table: a 0x48 byte permuted header followed by the key source
pub const KEY_TABLE_LEN: usize = 0x1048;
pub const KEY_TABLE_HEADER_LEN: usize = 0x48;
pub const KEY_TABLE_WORDS: usize = KEY_TABLE_LEN / 4;

/// Bytes of the key table body mirrored into the second fragment
pub const KEY_FRAGMENT_2_LEN: usize = 0xBF0;

/// Every firmware payload starts with this much header; the rest are sections
pub const FIRM_HEADER_LEN: usize = 0x200;

// The secure area is four identical units of zero padding followed by the
// firmware header. A zeroed area is not run through KEY1 by the loader.
pub const SECURE_PAD_LEN: usize = 0xE00;
pub const SECURE_UNIT_LEN: usize = SECURE_PAD_LEN + FIRM_HEADER_LEN;
pub const SECURE_UNIT_COUNT: usize = 4;
pub const SECURE_LEN: usize = SECURE_UNIT_LEN * SECURE_UNIT_COUNT;

// Offsets inside the NDS header
pub const HEADER_GAME_TITLE: Range<usize> = 0x00..0x0C;
pub const HEADER_GAME_CODE: Range<usize> = 0x0C..0x10;
pub const HEADER_FLAGS: Range<usize> = 0x60..0x70;
pub const HEADER_ICON_BANNER: Range<usize> = 0x68..0x6C;
pub const HEADER_CRC_COVERED: Range<usize> = 0x00..0x15E;
pub const HEADER_CRC: Range<usize> = 0x15E..0x160;
pub const HEADER_PATCHED_LEN: usize = HEADER_CRC.end;

/// Secure transfer timeout stored in the high half of the last flags word
pub const SECURE_TRANSFER_TIMEOUT: u16 = 0x0D7E;

/// A fixed byte range of the image
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub const fn new(offset: usize, len: usize) -> Region {
        Region { offset, len }
    }

    /// One past the last byte, or `None` if that is past `usize::MAX`
    pub const fn checked_end(&self) -> Option<usize> {
        self.offset.checked_add(self.len)
    }

    /// Saturates at `usize::MAX`; layouts are validated with
    /// [`Region::checked_end`] before any region is sliced
    pub const fn end(&self) -> usize {
        self.offset.saturating_add(self.len)
    }

    pub const fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Where each replaced region lives in the flash image.
///
/// Defaults to the layout the AK2I loader expects; a TOML file with the same
/// keys may be used to describe a different dump.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RomLayout {
    pub key_table: Region,
    pub header: Region,
    pub key_fragment_1: Region,
    pub key_fragment_2: Region,
    pub secure: Region,
    /// The data area runs from here to the end of the image
    pub data_offset: usize,
}

impl Default for RomLayout {
    fn default() -> RomLayout {
        RomLayout {
            key_table: Region::new(0x80000, KEY_TABLE_LEN),
            header: Region::new(0x82000, 0x1000),
            key_fragment_1: Region::new(0x83600, KEY_TABLE_HEADER_LEN),
            key_fragment_2: Region::new(0x84800, KEY_FRAGMENT_2_LEN),
            secure: Region::new(0x86000, SECURE_LEN),
            data_offset: 0x8A000,
        }
    }
}

impl RomLayout {
    /// The replaced regions in address order, with a name for diagnostics
    pub fn regions(&self) -> [(&'static str, Region); 5] {
        [
            ("key table", self.key_table),
            ("header", self.header),
            ("key fragment 1", self.key_fragment_1),
            ("key fragment 2", self.key_fragment_2),
            ("secure area", self.secure),
        ]
    }

    /// Smallest image that holds every fixed region plus `data_len` bytes of
    /// firmware sections. Saturates, so an impossible layout asks for an
    /// impossible image rather than wrapping.
    pub fn required_len(&self, data_len: usize) -> usize {
        self.regions()
            .iter()
            .map(|(_, r)| r.end())
            .max()
            .unwrap_or(0)
            .max(self.data_offset.saturating_add(data_len))
    }

    /// Absolute range of a header field
    pub fn header_field(&self, field: Range<usize>) -> Range<usize> {
        self.header.offset.saturating_add(field.start)..self.header.offset.saturating_add(field.end)
    }
}

/// NTRCARD ROMCTRL register as programmed by the loader from the header
#[derive(Clone, Debug, PartialEq, Eq, PackedStruct)]
#[packed_struct(size_bytes = "4", endian = "msb", bit_numbering = "lsb0")]
pub struct CardControl {
    /// Gap before the first word of a transfer
    #[packed_field(bits = "0..=12")]
    pub delay1: Integer<u16, packed_bits::Bits<13>>,

    #[packed_field(bits = "13")]
    pub sec_dat: bool,

    #[packed_field(bits = "14")]
    pub sec_en: bool,

    /// Gap after the command
    #[packed_field(bits = "16..=21")]
    pub delay2: Integer<u8, packed_bits::Bits<6>>,

    #[packed_field(bits = "22")]
    pub sec_cmd: bool,

    /// 4.2MHz transfer clock instead of 6.7MHz
    #[packed_field(bits = "27")]
    pub clk_slow: bool,
}

impl CardControl {
    /// Settings for normal (KEY2) reads
    pub fn normal() -> CardControl {
        CardControl {
            delay1: 0x18.into(),
            sec_dat: false,
            sec_en: false,
            delay2: 0.into(),
            sec_cmd: false,
            clk_slow: true,
        }
    }

    /// Settings for secure area reads. The KEY1 bits stay clear since the
    /// secure area is stored unencrypted.
    pub fn secure() -> CardControl {
        CardControl {
            delay1: 0x8F8.into(),
            sec_dat: false,
            sec_en: false,
            delay2: 0x18.into(),
            sec_cmd: false,
            clk_slow: true,
        }
    }

    pub fn to_word(&self) -> Result<u32, PackingError> {
        // pack() emits the register MSB first
        Ok(u32::from_be_bytes(self.pack()?))
    }

    pub fn from_word(word: u32) -> Result<CardControl, PackingError> {
        CardControl::unpack(&word.to_be_bytes())
    }
}

/// The 16 bytes at header+0x60
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeaderFlags {
    pub normal_ctrl: u32,
    pub secure_ctrl: u32,
    pub icon_banner_offset: u32,
    pub secure_crc: u16,
    pub secure_timeout: u16,
}

impl HeaderFlags {
    pub fn new(icon_banner_offset: u32, secure_crc: u16) -> Result<HeaderFlags, PackingError> {
        Ok(HeaderFlags {
            normal_ctrl: CardControl::normal().to_word()?,
            secure_ctrl: CardControl::secure().to_word()?,
            icon_banner_offset,
            secure_crc,
            secure_timeout: SECURE_TRANSFER_TIMEOUT,
        })
    }

    pub fn to_words(&self) -> [u32; 4] {
        [
            self.normal_ctrl,
            self.secure_ctrl,
            self.icon_banner_offset,
            ((self.secure_timeout as u32) << 16) | self.secure_crc as u32,
        ]
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        LittleEndian::write_u32_into(&self.to_words(), &mut out);
        out
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> HeaderFlags {
        let mut words = [0u32; 4];
        LittleEndian::read_u32_into(bytes, &mut words);
        HeaderFlags {
            normal_ctrl: words[0],
            secure_ctrl: words[1],
            icon_banner_offset: words[2],
            secure_crc: words[3] as u16,
            secure_timeout: (words[3] >> 16) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_control_words() {
        assert_eq!(CardControl::normal().to_word().unwrap(), 0x0800_0018);
        assert_eq!(CardControl::secure().to_word().unwrap(), 0x0818_08F8);
        assert_eq!(
            CardControl::from_word(0x0818_08F8).unwrap(),
            CardControl::secure()
        );
    }

    #[test]
    fn flags_layout() {
        let flags = HeaderFlags::new(0x1234_5678, 0xBEEF).unwrap();
        let bytes = flags.to_bytes();
        assert_eq!(&bytes[0..4], &[0x18, 0x00, 0x00, 0x08]);
        assert_eq!(&bytes[4..8], &[0xF8, 0x08, 0x18, 0x08]);
        assert_eq!(&bytes[8..12], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&bytes[12..16], &[0xEF, 0xBE, 0x7E, 0x0D]);
        assert_eq!(HeaderFlags::from_bytes(&bytes), flags);
    }

    #[test]
    fn default_layout_matches_flash_map() {
        let layout = RomLayout::default();
        assert_eq!(layout.key_table.range(), 0x80000..0x81048);
        assert_eq!(layout.secure.end(), layout.data_offset);
        assert_eq!(layout.required_len(0), 0x8A000);
        assert_eq!(layout.required_len(0x100), 0x8A100);
        assert_eq!(layout.header_field(HEADER_CRC), 0x8215E..0x82160);
    }

    #[test]
    fn region_end_near_address_limit() {
        let top = Region::new(usize::MAX - 0x10, SECURE_LEN);
        assert_eq!(top.checked_end(), None);
        assert_eq!(top.end(), usize::MAX);

        let mut layout = RomLayout::default();
        layout.secure = top;
        assert_eq!(layout.required_len(0), usize::MAX);
        layout.secure = RomLayout::default().secure;
        layout.data_offset = usize::MAX;
        assert_eq!(layout.required_len(0x100), usize::MAX);
    }
}
