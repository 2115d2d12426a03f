// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::checksum::crc16;
use crate::key_table::KeyTable;
use crate::{blowfish, words, Error};
use ak2i_areas::{
    HeaderFlags, Region, RomLayout, FIRM_HEADER_LEN, HEADER_CRC, HEADER_CRC_COVERED, HEADER_FLAGS,
    HEADER_ICON_BANNER, HEADER_PATCHED_LEN, KEY_FRAGMENT_2_LEN, KEY_TABLE_HEADER_LEN,
    KEY_TABLE_LEN, SECURE_LEN, SECURE_PAD_LEN, SECURE_UNIT_COUNT,
};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

/// What gets written to the two key table fragment regions
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FragmentSource {
    /// The first 0x48 bytes and the following 0xBF0 bytes of the key table
    #[default]
    KeyTable,
    /// The same ranges taken from the start of the flash dump, where the
    /// cart keeps its own stage-2 key table
    RomMirror,
}

/// Treatment of the firmware sections before they land in the data area
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SectionCipher {
    /// Copied through unchanged
    #[default]
    Plain,
    /// Every 8 byte block is KEY1 encrypted with the key table
    Encrypt,
}

#[derive(Clone, Debug, Default)]
pub struct Splicer {
    layout: RomLayout,
    fragments: FragmentSource,
    sections: SectionCipher,
}

/// Ensure a layout can be spliced: fixed region sizes, ascending and
/// non-overlapping, all before the data area.
pub fn check_layout(layout: &RomLayout) -> Result<(), Error> {
    let sizes = [
        ("key table", layout.key_table, KEY_TABLE_LEN),
        ("key fragment 1", layout.key_fragment_1, KEY_TABLE_HEADER_LEN),
        ("key fragment 2", layout.key_fragment_2, KEY_FRAGMENT_2_LEN),
        ("secure area", layout.secure, SECURE_LEN),
    ];
    for (name, region, len) in sizes {
        if region.len != len {
            return Err(Error::InvalidLayout(format!(
                "{name} must be {len:#x} bytes, got {:#x}",
                region.len
            )));
        }
    }
    if layout.header.len < HEADER_PATCHED_LEN {
        return Err(Error::InvalidLayout(format!(
            "header must be at least {HEADER_PATCHED_LEN:#x} bytes, got {:#x}",
            layout.header.len
        )));
    }

    let regions = layout.regions();
    for (name, region) in regions {
        if region.checked_end().is_none() {
            return Err(Error::InvalidLayout(format!(
                "{name} at {:#x} runs past the end of the address space",
                region.offset
            )));
        }
    }
    for pair in regions.windows(2) {
        let ((a_name, a), (b_name, b)) = (pair[0], pair[1]);
        if a.end() > b.offset {
            return Err(Error::InvalidLayout(format!(
                "{a_name} ({:#x}..{:#x}) runs into {b_name} at {:#x}",
                a.offset,
                a.end(),
                b.offset
            )));
        }
    }
    let (last_name, last) = regions[regions.len() - 1];
    if last.end() > layout.data_offset {
        return Err(Error::InvalidLayout(format!(
            "{last_name} ends at {:#x}, past the data area at {:#x}",
            last.end(),
            layout.data_offset
        )));
    }
    Ok(())
}

/// Four copies of 0xE00 zero bytes followed by the firmware header.
///
/// An all-zero secure area skips the loader's KEY1 decryption
/// (gbatek: DS Cartridge Secure Area).
pub fn secure_block(firm_header: &[u8]) -> Vec<u8> {
    let mut unit = vec![0u8; SECURE_PAD_LEN];
    unit.extend_from_slice(firm_header);
    unit.repeat(SECURE_UNIT_COUNT)
}

/// Rebuild the first 0x160 bytes of the NDS header: flags at 0x60 replaced,
/// CRC of everything before 0x15E appended.
pub fn build_header(rom_header: &[u8], secure_crc: u16) -> Result<Vec<u8>, Error> {
    if rom_header.len() < HEADER_PATCHED_LEN {
        return Err(Error::TruncatedInput {
            input: "header",
            needed: HEADER_PATCHED_LEN,
            actual: rom_header.len(),
        });
    }

    let icon_banner = LittleEndian::read_u32(&rom_header[HEADER_ICON_BANNER]);
    let flags = HeaderFlags::new(icon_banner, secure_crc)?;

    let mut header = rom_header[..HEADER_PATCHED_LEN].to_vec();
    header[HEADER_FLAGS].copy_from_slice(&flags.to_bytes());
    let crc = crc16(&header[HEADER_CRC_COVERED]);
    LittleEndian::write_u16(&mut header[HEADER_CRC], crc);
    Ok(header)
}

/// Splice with the default layout and options
pub fn inject(key_table: &KeyTable, firmware: &[u8], rom: &[u8]) -> Result<Vec<u8>, Error> {
    Splicer::default().inject(key_table, firmware, rom)
}

impl Splicer {
    pub fn new(layout: RomLayout) -> Result<Splicer, Error> {
        check_layout(&layout)?;
        Ok(Splicer {
            layout,
            ..Splicer::default()
        })
    }

    pub fn fragments(mut self, fragments: FragmentSource) -> Splicer {
        self.fragments = fragments;
        self
    }

    pub fn section_cipher(mut self, sections: SectionCipher) -> Splicer {
        self.sections = sections;
        self
    }

    pub fn layout(&self) -> &RomLayout {
        &self.layout
    }

    /// Build a patched image from `rom` with `firmware` installed.
    ///
    /// Every input is checked before anything is assembled. The result is the
    /// same length as `rom`; bytes outside the replaced regions are copied
    /// unchanged.
    pub fn inject(
        &self,
        key_table: &KeyTable,
        firmware: &[u8],
        rom: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if firmware.len() < FIRM_HEADER_LEN {
            return Err(Error::InvalidInputSize {
                input: "firmware",
                expected: "at least 0x200 bytes",
                actual: firmware.len(),
            });
        }
        let (firm_header, firm_sections) = firmware.split_at(FIRM_HEADER_LEN);

        let needed = self.layout.required_len(firm_sections.len());
        if rom.len() < needed {
            return Err(Error::TruncatedInput {
                input: "flash image",
                needed,
                actual: rom.len(),
            });
        }

        let sections = self.encode_sections(key_table, firm_sections)?;

        let secure = secure_block(firm_header);
        let secure_crc = crc16(&secure);
        debug!("secure area crc: {secure_crc:04x}");

        let header = build_header(&rom[self.layout.header.range()], secure_crc)?;
        debug!(
            "header crc: {:04x}",
            LittleEndian::read_u16(&header[HEADER_CRC])
        );

        let fragment_src = match self.fragments {
            FragmentSource::KeyTable => key_table.as_bytes(),
            FragmentSource::RomMirror => rom,
        };
        let fragment_1 = &fragment_src[..KEY_TABLE_HEADER_LEN];
        let fragment_2 =
            &fragment_src[KEY_TABLE_HEADER_LEN..KEY_TABLE_HEADER_LEN + KEY_FRAGMENT_2_LEN];

        let header_region = Region::new(self.layout.header.offset, HEADER_PATCHED_LEN);
        let data_region = Region::new(self.layout.data_offset, sections.len());

        let mut out = rom.to_vec();
        for (name, region, bytes) in [
            ("key table", self.layout.key_table, key_table.as_bytes()),
            ("header", header_region, &header[..]),
            ("key fragment 1", self.layout.key_fragment_1, fragment_1),
            ("key fragment 2", self.layout.key_fragment_2, fragment_2),
            ("secure area", self.layout.secure, &secure[..]),
            ("firmware sections", data_region, &sections[..]),
        ] {
            debug!(
                "{name}: {:#07x}..{:#07x} ({:#x} bytes)",
                region.offset,
                region.end(),
                bytes.len()
            );
            out[region.range()].copy_from_slice(bytes);
        }

        Ok(out)
    }

    fn encode_sections(&self, key_table: &KeyTable, sections: &[u8]) -> Result<Vec<u8>, Error> {
        let mut words = words::to_words("firmware sections", sections)?;
        match self.sections {
            SectionCipher::Plain => {}
            SectionCipher::Encrypt => {
                blowfish::encrypt_words(&key_table.hash_table(), &mut words)?;
            }
        }
        Ok(words::from_words(&words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ak2i_areas::{KEY_SOURCE_LEN, SECURE_UNIT_LEN};

    fn key_table() -> KeyTable {
        let src: Vec<u8> = (0..KEY_SOURCE_LEN).map(|i| (i * 7 + 3) as u8).collect();
        KeyTable::build(&src).unwrap()
    }

    fn rom(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i ^ (i >> 11)) as u8).collect()
    }

    #[test]
    fn secure_block_units() {
        let secure = secure_block(&[0xAA; FIRM_HEADER_LEN]);
        assert_eq!(secure.len(), SECURE_LEN);
        for unit in secure.chunks(SECURE_UNIT_LEN) {
            assert!(unit[..SECURE_PAD_LEN].iter().all(|&b| b == 0));
            assert!(unit[SECURE_PAD_LEN..].iter().all(|&b| b == 0xAA));
        }
    }

    #[test]
    fn header_fields() {
        let mut rom_header = vec![0x11; 0x1000];
        rom_header[HEADER_ICON_BANNER].copy_from_slice(&0x0004_5600u32.to_le_bytes());
        let header = build_header(&rom_header, 0xCAFE).unwrap();

        assert_eq!(header.len(), HEADER_PATCHED_LEN);
        assert_eq!(&header[..0x60], &rom_header[..0x60]);
        assert_eq!(&header[0x70..0x15E], &rom_header[0x70..0x15E]);
        assert_eq!(&header[0x60..0x64], &0x0800_0018u32.to_le_bytes());
        assert_eq!(&header[0x64..0x68], &0x0818_08F8u32.to_le_bytes());
        assert_eq!(&header[0x68..0x6C], &0x0004_5600u32.to_le_bytes());
        assert_eq!(&header[0x6C..0x70], &0x0D7E_CAFEu32.to_le_bytes());
        assert_eq!(
            LittleEndian::read_u16(&header[HEADER_CRC]),
            crc16(&header[..0x15E])
        );
    }

    #[test]
    fn short_header_is_truncated() {
        let err = build_header(&[0; 0x100], 0).unwrap_err();
        assert!(matches!(err, Error::TruncatedInput { needed: 0x160, .. }));
    }

    #[test]
    fn output_keeps_length_and_untouched_bytes() {
        let layout = RomLayout::default();
        let firmware: Vec<u8> = (0..0x600).map(|i| (i * 13) as u8).collect();
        let rom = rom(layout.data_offset + 0x1000);
        let table = key_table();
        let out = inject(&table, &firmware, &rom).unwrap();
        assert_eq!(out.len(), rom.len());

        let header_end = layout.header.offset + HEADER_PATCHED_LEN;
        let data_end = layout.data_offset + firmware.len() - FIRM_HEADER_LEN;
        let touched = [
            layout.key_table.range(),
            layout.header.offset..header_end,
            layout.key_fragment_1.range(),
            layout.key_fragment_2.range(),
            layout.secure.range(),
            layout.data_offset..data_end,
        ];
        for (i, (a, b)) in out.iter().zip(rom.iter()).enumerate() {
            if !touched.iter().any(|r| r.contains(&i)) {
                assert_eq!(a, b, "byte {i:#x} changed");
            }
        }

        assert_eq!(&out[layout.key_table.range()], table.as_bytes());
        assert_eq!(&out[layout.key_fragment_1.range()], table.header());
        assert_eq!(&out[layout.key_fragment_2.range()], &table.body()[..KEY_FRAGMENT_2_LEN]);
        assert_eq!(&out[layout.data_offset..data_end], &firmware[FIRM_HEADER_LEN..]);
    }

    #[test]
    fn rom_mirror_fragments() {
        let layout = RomLayout::default();
        let rom = rom(layout.data_offset);
        let out = Splicer::default()
            .fragments(FragmentSource::RomMirror)
            .inject(&key_table(), &[0x55u8; FIRM_HEADER_LEN], &rom)
            .unwrap();
        assert_eq!(&out[layout.key_fragment_1.range()], &rom[..0x48]);
        assert_eq!(&out[layout.key_fragment_2.range()], &rom[0x48..0xC38]);
    }

    #[test]
    fn encrypted_sections_decrypt_back() {
        let layout = RomLayout::default();
        let table = key_table();
        let mut firmware = vec![0u8; FIRM_HEADER_LEN];
        firmware.extend((0..0x40u8).map(|b| b.wrapping_mul(5)));
        let out = Splicer::default()
            .section_cipher(SectionCipher::Encrypt)
            .inject(&table, &firmware, &rom(layout.data_offset + 0x40))
            .unwrap();

        let data = &out[layout.data_offset..layout.data_offset + 0x40];
        assert_ne!(data, &firmware[FIRM_HEADER_LEN..]);
        let mut words = words::to_words("data", data).unwrap();
        blowfish::decrypt_words(&table.hash_table(), &mut words).unwrap();
        assert_eq!(words::from_words(&words), &firmware[FIRM_HEADER_LEN..]);
    }

    #[test]
    fn input_errors() {
        let layout = RomLayout::default();
        let table = key_table();

        let err = inject(&table, &[0u8; FIRM_HEADER_LEN - 1], &rom(layout.data_offset)).unwrap_err();
        assert!(matches!(err, Error::InvalidInputSize { input: "firmware", .. }));

        let err = inject(&table, &[0u8; FIRM_HEADER_LEN + 8], &rom(layout.data_offset + 4)).unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedInput { needed, actual, .. }
                if needed == layout.data_offset + 8 && actual == layout.data_offset + 4
        ));

        let err = inject(&table, &[0u8; FIRM_HEADER_LEN + 6], &rom(layout.data_offset + 8)).unwrap_err();
        assert!(matches!(err, Error::UnalignedInput { len: 6, .. }));
    }

    #[test]
    fn layout_checks() {
        assert!(Splicer::new(RomLayout::default()).is_ok());

        let mut overlapping = RomLayout::default();
        overlapping.key_fragment_1.offset = overlapping.header.offset + 0x100;
        assert!(matches!(
            Splicer::new(overlapping),
            Err(Error::InvalidLayout(_))
        ));

        let mut short_secure = RomLayout::default();
        short_secure.secure.len = 0x1000;
        assert!(check_layout(&short_secure).is_err());

        let mut late_data = RomLayout::default();
        late_data.data_offset = late_data.secure.offset;
        assert!(check_layout(&late_data).is_err());
    }

    #[test]
    fn layout_near_address_limit() {
        let mut top_secure = RomLayout::default();
        top_secure.secure.offset = usize::MAX - 0x10;
        assert!(matches!(
            check_layout(&top_secure),
            Err(Error::InvalidLayout(_))
        ));

        let mut top_table = RomLayout::default();
        top_table.key_table.offset = usize::MAX - 0x10;
        assert!(matches!(
            Splicer::new(top_table),
            Err(Error::InvalidLayout(_))
        ));

        // Accepted layout, but no image can be long enough for these sections
        let mut top_data = RomLayout::default();
        top_data.data_offset = usize::MAX - 0x10;
        let splicer = Splicer::new(top_data).unwrap();
        let firmware = vec![0u8; FIRM_HEADER_LEN + 0x100];
        assert!(matches!(
            splicer.inject(&key_table(), &firmware, &rom(0x8A000)),
            Err(Error::TruncatedInput { needed: usize::MAX, .. })
        ));
    }
}
