//! HTTP/1.x message codec.
//!
//! Heads are parsed with `httparse`; messages are represented with the
//! `http` types re-exported by hyper. Bodies are read fully into memory and
//! re-framed with an explicit `Content-Length`, unless the message carries
//! transfer codings besides `chunked`; those are kept and the body is
//! written back as a single chunk.

mod body;
mod error;
mod request;
mod response;

pub use error::CodecError;
pub use request::{read_request, write_request};
pub use response::{read_response, write_response};

use bytes::Bytes;
use hyper::header::{HeaderMap, CONNECTION, CONTENT_LENGTH};
use hyper::Version;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Size limits applied while reading a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_head_bytes: usize,
    pub max_headers: usize,
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_headers: 100,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Response extension holding a reason phrase that differs from the
/// canonical one for its status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(Bytes);

impl ReasonPhrase {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Parses the `Content-Length` header.
///
/// Repeated or comma-separated values are accepted only if they agree.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let value = value
            .to_str()
            .map_err(|_| CodecError::InvalidContentLength)?;
        for part in value.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidContentLength)?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(CodecError::InvalidContentLength)
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Whether the sender of a message expects the connection to close after it.
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    if version == Version::HTTP_10 {
        !has_token("keep-alive")
    } else {
        has_token("close")
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

pub(crate) fn version_from(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

/// Reads one message head, up to and including the blank line.
///
/// Returns `Ok(None)` if the stream ends before any byte of a head arrives.
/// Empty lines preceding the start line are skipped.
pub(crate) async fn read_head<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let start = head.len();
        let budget = (max + 1).saturating_sub(start) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut head).await?;

        if head.len() > max {
            return Err(CodecError::HeadTooLarge(max));
        }
        if n == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(CodecError::UnexpectedEof)
            };
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            return Err(CodecError::UnexpectedEof);
        }
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

pub(crate) fn append_headers(
    map: &mut HeaderMap,
    parsed: &[httparse::Header<'_>],
) -> Result<(), CodecError> {
    use hyper::header::{HeaderName, HeaderValue};

    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| CodecError::Invalid("header name"))?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| CodecError::Invalid("header value"))?;
        map.append(name, value);
    }
    Ok(())
}

pub(crate) fn encode_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}
