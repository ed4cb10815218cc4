// src/codec/body.rs
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::Extensions;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecError, Limits};

/// How the body of a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilEof,
}

/// Extension marking a message whose buffered body has to be written back
/// with chunked framing, because its `Transfer-Encoding` carries codings
/// that are passed through undecoded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rechunk;

fn transfer_codings(headers: &HeaderMap) -> Vec<&str> {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .flat_map(|value| value.to_str().unwrap_or("").split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .collect()
}

/// Returns `Some(true)` if the final transfer coding is `chunked`,
/// `Some(false)` for any other coding, `None` without the header.
pub(crate) fn chunked_coding(headers: &HeaderMap) -> Option<bool> {
    transfer_codings(headers)
        .last()
        .map(|coding| coding.eq_ignore_ascii_case("chunked"))
}

pub(crate) async fn read_body<R>(
    reader: &mut R,
    framing: Framing,
    limits: &Limits,
) -> Result<Bytes, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let max = limits.max_body_bytes;
    match framing {
        Framing::Empty => Ok(Bytes::new()),
        Framing::Length(len) => {
            if len > max as u64 {
                return Err(CodecError::BodyTooLarge(max));
            }
            let mut body = Vec::with_capacity((len as usize).min(64 * 1024));
            (&mut *reader).take(len).read_to_end(&mut body).await?;
            if body.len() as u64 != len {
                return Err(CodecError::UnexpectedEof);
            }
            Ok(body.into())
        }
        Framing::UntilEof => {
            let mut body = Vec::new();
            (&mut *reader)
                .take(max as u64 + 1)
                .read_to_end(&mut body)
                .await?;
            if body.len() > max {
                return Err(CodecError::BodyTooLarge(max));
            }
            Ok(body.into())
        }
        Framing::Chunked => read_chunked(reader, limits).await,
    }
}

async fn read_chunked<R>(reader: &mut R, limits: &Limits) -> Result<Bytes, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let max = limits.max_body_bytes;
    let mut body = Vec::new();
    let mut line = Vec::with_capacity(32);

    loop {
        read_line(reader, &mut line, limits.max_head_bytes).await?;
        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => return Err(CodecError::InvalidChunk),
        };

        if size == 0 {
            // Trailer fields are read and dropped.
            loop {
                read_line(reader, &mut line, limits.max_head_bytes).await?;
                if is_blank(&line) {
                    return Ok(body.into());
                }
            }
        }

        if (body.len() as u64).saturating_add(size) > max as u64 {
            return Err(CodecError::BodyTooLarge(max));
        }
        let before = body.len();
        (&mut *reader).take(size).read_to_end(&mut body).await?;
        if (body.len() - before) as u64 != size {
            return Err(CodecError::UnexpectedEof);
        }

        read_line(reader, &mut line, limits.max_head_bytes).await?;
        if !is_blank(&line) {
            return Err(CodecError::InvalidChunk);
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

/// Reads one line into `line`, terminator included.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> Result<(), CodecError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', line)
        .await?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(if line.len() > max {
            CodecError::InvalidChunk
        } else {
            CodecError::UnexpectedEof
        });
    }
    Ok(())
}

/// Replaces the framing a decoded body arrived with.
///
/// Without codings other than `chunked` the body gets an explicit
/// `Content-Length`. Otherwise the remaining codings are kept, `chunked` is
/// re-appended and `true` is returned: the body must then be written with
/// [`write_body`] under a [`Rechunk`] marker.
pub(crate) fn reframe(headers: &mut HeaderMap, len: usize) -> Result<bool, CodecError> {
    let mut codings: Vec<String> = transfer_codings(headers)
        .into_iter()
        .map(str::to_owned)
        .collect();
    if codings
        .last()
        .map_or(false, |coding| coding.eq_ignore_ascii_case("chunked"))
    {
        codings.pop();
    }

    headers.remove(TRANSFER_ENCODING);
    if codings.is_empty() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        return Ok(false);
    }

    codings.push("chunked".to_owned());
    let value = HeaderValue::from_str(&codings.join(", "))
        .map_err(|_| CodecError::Invalid("transfer-encoding"))?;
    headers.remove(CONTENT_LENGTH);
    headers.insert(TRANSFER_ENCODING, value);
    Ok(true)
}

/// Writes a buffered body, as a single chunk when the message is marked
/// with [`Rechunk`].
pub(crate) async fn write_body<W>(
    writer: &mut W,
    extensions: &Extensions,
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if extensions.get::<Rechunk>().is_none() {
        return writer.write_all(body).await;
    }
    if !body.is_empty() {
        writer
            .write_all(format!("{:x}\r\n", body.len()).as_bytes())
            .await?;
        writer.write_all(body).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"0\r\n\r\n").await
}
