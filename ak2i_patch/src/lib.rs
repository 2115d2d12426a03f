// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod blowfish;
pub mod checksum;
pub mod key_table;
pub mod splice;
pub mod verify;
pub mod words;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid {input} size: expected {expected}, got {actual:#x} bytes")]
    InvalidInputSize {
        input: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("truncated {input}: need at least {needed:#x} bytes, got {actual:#x}")]
    TruncatedInput {
        input: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("{input} length {len:#x} is not a multiple of {align}")]
    UnalignedInput {
        input: &'static str,
        len: usize,
        align: usize,
    },

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("struct packing error: {0}")]
    PackingError(#[from] packed_struct::PackingError),

    #[error("verification failed; see log for details")]
    VerificationFailed,
}
