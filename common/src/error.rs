//! Errors raised while resolving USDT notes and generating readers

use std::path::PathBuf;

/// Specific types of errors the note parser and code generator can raise.
#[derive(thiserror::Error, Debug)]
pub enum StapsdtError {
    /// The binary could not be read from disk.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The binary is not an ELF file the parser understands.
    #[error("invalid ELF file: {0}")]
    Elf(#[from] object::read::Error),
    /// A stapsdt note did not follow the expected layout.
    #[error("malformed stapsdt note: {0}")]
    MalformedNote(String),
    /// No PT_LOAD segment covers the address.
    #[error("address {0:#x} is not covered by any loadable segment")]
    Unmapped(u64),
    /// An argument spec could not be parsed or is not supported.
    #[error("unsupported USDT argument '{0}'")]
    Argument(String),
}
