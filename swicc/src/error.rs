use thiserror::Error;

/// Internal return codes for the filesystem and virtual-address layers.
///
/// APDU handlers translate every non-success variant into a status word before
/// it crosses the command/response boundary; `Error` itself never reaches a
/// transport caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk image has an invalid or missing magic prefix")]
    BadMagic,

    #[error("malformed item: {0}")]
    InvalidItem(String),

    #[error("file not found")]
    FileNotFound,

    #[error("file system structural failure: {0}")]
    Failure(String),

    #[error("invalid parameter: {0}")]
    BadParam(String),
}

pub type Result<T> = std::result::Result<T, Error>;
