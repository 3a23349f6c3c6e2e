#![allow(dead_code)]

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTP errors
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("invalid packet version")]
    BadVersion,
    #[error("header plus padding exceeds packet length")]
    ErrInconsistentLengths,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("malformed one-byte extension element")]
    ErrMalformedExtension,

    #[error("header extension id must be between 1 and 14 for RFC 5285 extensions")]
    ErrRfc8285oneByteHeaderIdrange,

    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("{0}")]
    Other(String),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
