// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use ak2i_areas::{RomLayout, HEADER_PATCHED_LEN, KEY_SOURCE_OFFSET};
use ak2i_patch::{
    key_table::{self, KeyTable},
    splice::{FragmentSource, SectionCipher, Splicer},
    verify,
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use log::info;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Fragments {
    /// Copy from the key table
    KeyTable,
    /// Copy the stage-2 key data at the start of the flash dump
    RomMirror,
}

#[derive(Debug, Parser)]
enum Command {
    /// Extract blowfish.bin from boot11
    Blowfish {
        #[clap(value_name = "boot11.bin")]
        boot11_file: PathBuf,

        /// out filename
        #[clap(long = "out", default_value = "blowfish.bin")]
        dest_bin: PathBuf,

        /// Offset of the key source in the boot11 dump
        #[clap(long, value_parser = parse_int::parse::<usize>, default_value_t = KEY_SOURCE_OFFSET)]
        key_offset: usize,

        /// The input is already the 0x1000 byte key source
        #[clap(long, conflicts_with = "key_offset")]
        raw: bool,
    },
    /// Inject boot9strap into an AK2I flash file
    Inject {
        #[clap(value_name = "blowfish.bin")]
        blowfish_file: PathBuf,

        #[clap(value_name = "boot9strap_ntr.bin")]
        firm_file: PathBuf,

        #[clap(value_name = "ak2i_flash.bin")]
        flash_file: PathBuf,

        /// out filename
        #[clap(long = "out", default_value = "ak2i_patch.bin")]
        dest_bin: PathBuf,

        /// TOML file describing a non-default flash layout
        #[clap(long)]
        layout: Option<PathBuf>,

        /// Source of the key table fragments
        #[clap(long, value_enum, default_value = "key-table")]
        fragments: Fragments,

        /// KEY1 encrypt the firmware sections (untested on hardware)
        #[clap(long)]
        encrypt_sections: bool,
    },
    /// Check the header, secure area and key regions of a patched flash file
    Verify {
        #[clap(short, long)]
        verbose: bool,

        #[clap(value_name = "ak2i_patch.bin")]
        src_img: PathBuf,

        /// Also check the key table regions against this blowfish.bin
        #[clap(long)]
        blowfish: Option<PathBuf>,

        /// TOML file describing a non-default flash layout
        #[clap(long)]
        layout: Option<PathBuf>,
    },
}

#[derive(Debug, Parser)]
#[clap(name = "ak2i_patch", about = "Inject boot9strap firm for AK2I flashcart")]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    // Any usage error, including an unknown mode, exits with status 1
    let cmd = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    // Verify has a custom logger; everyone else can use the default
    if !matches!(cmd.cmd, Command::Verify { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cmd.cmd {
        Command::Blowfish {
            boot11_file,
            dest_bin,
            key_offset,
            raw,
        } => {
            let input = read(&boot11_file)?;
            let key_source = if raw {
                &input[..]
            } else {
                key_table::extract_key_source(&input, key_offset)?
            };
            let table = KeyTable::build(key_source)?;
            std::fs::write(&dest_bin, table.as_bytes())?;
            info!("Key table written to {}", dest_bin.display());
        }
        Command::Inject {
            blowfish_file,
            firm_file,
            flash_file,
            dest_bin,
            layout,
            fragments,
            encrypt_sections,
        } => {
            let table = KeyTable::from_bytes(&read(&blowfish_file)?)?;
            let firmware = read(&firm_file)?;
            let flash = read(&flash_file)?;

            let sections = if encrypt_sections {
                println!(
                    "{}: encrypted firmware sections have not been confirmed to boot",
                    "WARNING".yellow()
                );
                SectionCipher::Encrypt
            } else {
                SectionCipher::Plain
            };
            let splicer = Splicer::new(load_layout(layout.as_deref())?)?
                .fragments(match fragments {
                    Fragments::KeyTable => FragmentSource::KeyTable,
                    Fragments::RomMirror => FragmentSource::RomMirror,
                })
                .section_cipher(sections);

            let out = patch(&splicer, &table, &firmware, &flash)?;
            std::fs::write(&dest_bin, out)?;
            info!("Patched flash written to {}", dest_bin.display());
        }
        Command::Verify {
            verbose,
            src_img,
            blowfish,
            layout,
        } => {
            let image = read(&src_img)?;
            let table = blowfish
                .map(|path| -> Result<KeyTable> { Ok(KeyTable::from_bytes(&read(&path)?)?) })
                .transpose()?;
            let layout = load_layout(layout.as_deref())?;
            verify::init_verify_logger(verbose);
            verify::verify_image(&image, &layout, table.as_ref())?;
        }
    }

    Ok(())
}

/// Splice, then name the game from the header of the checked image
fn patch(splicer: &Splicer, table: &KeyTable, firmware: &[u8], flash: &[u8]) -> Result<Vec<u8>> {
    let out = splicer.inject(table, firmware, flash)?;
    let (title, code) =
        verify::describe_header(&out[splicer.layout().header_field(0..HEADER_PATCHED_LEN)]);
    info!("Patched {title:?} ({code})");
    Ok(out)
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("could not read {path:?}"))
}

fn load_layout(path: Option<&Path>) -> Result<RomLayout> {
    match path {
        None => Ok(RomLayout::default()),
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("could not read {path:?}"))?;
            toml::from_str(&contents).with_context(|| format!("could not parse layout {path:?}"))
        }
    }
}
