// src/codec/error.rs
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed before the message was complete")]
    UnexpectedEof,

    #[error("malformed message head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("message body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("invalid chunked body")]
    InvalidChunk,

    #[error("invalid {0}")]
    Invalid(&'static str),
}
