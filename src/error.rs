//! Address manager errors.

use std::io;

use bitcoin::consensus::encode;

use thiserror::Error;

/// An error occuring while operating on the address database.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An encoding/decoding error.
    #[error("encode/decode error: {0}")]
    Encode(#[from] encode::Error),

    /// The stream declares a format this version cannot parse. The table is
    /// left empty; callers may want to keep the file around rather than
    /// overwrite it.
    #[error(
        "unsupported address database format {format}: \
         compatible with formats >= {lowest_compatible}, but the maximum supported is {max}"
    )]
    UnsupportedFormat {
        /// Format byte found in the stream.
        format: u8,
        /// Lowest format the stream claims compatibility with.
        lowest_compatible: u8,
        /// Highest format this version knows how to parse.
        max: u8,
    },

    /// The stream is malformed, or the decoded table failed the consistency
    /// check. The table is left empty.
    #[error("corrupt address database: {0}")]
    Corrupt(String),
}
