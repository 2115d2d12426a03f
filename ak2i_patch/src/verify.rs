// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::checksum::crc16;
use crate::key_table::KeyTable;
use crate::splice::check_layout;
use crate::Error;
use ak2i_areas::{
    CardControl, HeaderFlags, RomLayout, HEADER_CRC, HEADER_CRC_COVERED, HEADER_FLAGS,
    HEADER_GAME_CODE, HEADER_GAME_TITLE, HEADER_PATCHED_LEN, KEY_FRAGMENT_2_LEN,
    KEY_TABLE_HEADER_LEN, SECURE_PAD_LEN, SECURE_TRANSFER_TIMEOUT, SECURE_UNIT_LEN,
};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug as pass, info, trace, warn};
use std::io::Write as _;

macro_rules! error {
    ($failed:ident, $($arg:tt)*) => {
        $failed = true;
        log::error!($($arg)*);
    }
}

/// Column tag for each level. Passing checks are logged at debug and the
/// decoded register dumps behind `--verbose` at trace.
fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "FAIL",
        log::Level::Warn => "WARN",
        log::Level::Info => "",
        log::Level::Debug => "PASS",
        log::Level::Trace => "  ·",
    }
}

/// Initializes a logger that pretty-prints logging from `verify_image`
pub fn init_verify_logger(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format(|buf, record| {
            let mut level_style = buf.style();

            level_style.set_color(match record.level() {
                log::Level::Info => env_logger::fmt::Color::Cyan,
                log::Level::Trace => env_logger::fmt::Color::White,
                log::Level::Warn => env_logger::fmt::Color::Yellow,
                log::Level::Error => env_logger::fmt::Color::Red,
                log::Level::Debug => env_logger::fmt::Color::Green,
            });
            if record.level() == log::Level::Info {
                level_style.set_bold(true);
            }

            let tag = level_tag(record.level());
            let body = record.args().to_string();
            if tag.is_empty() {
                writeln!(buf, "{}", level_style.value(body))
            } else {
                writeln!(
                    buf,
                    "{: <4} | {}",
                    level_style.value(tag),
                    body.replace('\n', "\n     | ")
                )
            }
        })
        .filter(
            None,
            if verbose {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Debug
            },
        )
        .init();
}

/// Game title and code from an NDS header, NUL padding stripped
pub fn describe_header(header: &[u8]) -> (String, String) {
    let text = |bytes: &[u8]| {
        String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string()
    };
    (
        text(&header[HEADER_GAME_TITLE]),
        text(&header[HEADER_GAME_CODE]),
    )
}

/// Check a patched flash image: header CRC, card control flags, secure area
/// contents and CRC, and (given the key table) the key regions.
pub fn verify_image(
    image: &[u8],
    layout: &RomLayout,
    key_table: Option<&KeyTable>,
) -> Result<(), Error> {
    check_layout(layout)?;
    let needed = layout.required_len(0);
    if image.len() < needed {
        return Err(Error::TruncatedInput {
            input: "flash image",
            needed,
            actual: image.len(),
        });
    }

    let mut failed = false;

    info!("=== Header ===");
    let header = &image[layout.header_field(0..HEADER_PATCHED_LEN)];
    let (title, code) = describe_header(header);
    info!("title: {title:?}, game code: {code:?}");

    let stored_crc = LittleEndian::read_u16(&header[HEADER_CRC]);
    let header_crc = crc16(&header[HEADER_CRC_COVERED]);
    if stored_crc != header_crc {
        error!(
            failed,
            "header CRC {stored_crc:04x} does not match computed {header_crc:04x}"
        );
    } else {
        pass!("header CRC matches ({header_crc:04x})");
    }

    let mut raw_flags = [0u8; 16];
    raw_flags.copy_from_slice(&header[HEADER_FLAGS]);
    let flags = HeaderFlags::from_bytes(&raw_flags);
    trace!("{:#x?}", flags);
    trace!("normal: {:#?}", CardControl::from_word(flags.normal_ctrl)?);
    trace!("secure: {:#?}", CardControl::from_word(flags.secure_ctrl)?);

    for (name, stored, expected) in [
        ("normal", flags.normal_ctrl, CardControl::normal().to_word()?),
        ("secure", flags.secure_ctrl, CardControl::secure().to_word()?),
    ] {
        if stored != expected {
            error!(
                failed,
                "{name} card control is {stored:08x}, expected {expected:08x}"
            );
        } else {
            pass!("{name} card control is {stored:08x}");
        }
    }
    if flags.secure_timeout != SECURE_TRANSFER_TIMEOUT {
        warn!(
            "secure transfer timeout is {:04x}, expected {SECURE_TRANSFER_TIMEOUT:04x}",
            flags.secure_timeout
        );
    }
    trace!("icon/banner offset: {:#x}", flags.icon_banner_offset);

    info!("=== Secure area ===");
    let secure = &image[layout.secure.range()];
    let secure_crc = crc16(secure);
    if secure_crc != flags.secure_crc {
        error!(
            failed,
            "secure area CRC {secure_crc:04x} does not match header field {:04x}",
            flags.secure_crc
        );
    } else {
        pass!("secure area CRC matches ({secure_crc:04x})");
    }

    let mut units = secure.chunks(SECURE_UNIT_LEN);
    let first = units.next().unwrap_or_default();
    if !first[..SECURE_PAD_LEN].iter().all(|&b| b == 0) {
        error!(failed, "secure area padding is not zero filled");
    } else if !units.all(|unit| unit == first) {
        error!(failed, "secure area units are not identical");
    } else {
        pass!("secure area holds four copies of the firmware header");
    }
    trace!(
        "firmware header: {}",
        hex::encode(&first[SECURE_PAD_LEN..SECURE_PAD_LEN + 0x20])
    );

    if let Some(table) = key_table {
        info!("=== Key table ===");
        if &image[layout.key_table.range()] != table.as_bytes() {
            error!(failed, "key table region does not match the given key table");
        } else {
            pass!("key table region matches");
        }

        let fragment_1 = &image[layout.key_fragment_1.range()];
        let fragment_2 = &image[layout.key_fragment_2.range()];
        if fragment_1 == table.header() && fragment_2 == &table.body()[..KEY_FRAGMENT_2_LEN] {
            pass!("key fragments come from the key table");
        } else if fragment_1 == &image[..KEY_TABLE_HEADER_LEN]
            && fragment_2 == &image[KEY_TABLE_HEADER_LEN..KEY_TABLE_HEADER_LEN + KEY_FRAGMENT_2_LEN]
        {
            pass!("key fragments mirror the stage-2 key data");
        } else {
            warn!("key fragments match neither the key table nor the stage-2 key data");
        }
    }

    if failed {
        Err(Error::VerificationFailed)
    } else {
        Ok(())
    }
}
