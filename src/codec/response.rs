// src/codec/response.rs
use bytes::Bytes;
use hyper::{Method, Response, StatusCode};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::body::{self, Framing};
use super::{append_headers, content_length, encode_headers, read_head, version_from, version_str};
use super::{wants_close, CodecError, Limits, ReasonPhrase};

/// Reads the response to a request sent with `method`.
///
/// Returns the response together with whether the connection can carry
/// another exchange afterwards. Interim 1xx responses (other than 101) are
/// consumed and skipped.
pub async fn read_response<R>(
    reader: &mut R,
    method: &Method,
    limits: &Limits,
) -> Result<(Response<Bytes>, bool), CodecError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let head = read_head(reader, limits.max_head_bytes)
            .await?
            .ok_or(CodecError::UnexpectedEof)?;

        let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
        let mut parsed = httparse::Response::new(&mut headers);
        if parsed.parse(&head)?.is_partial() {
            return Err(CodecError::UnexpectedEof);
        }

        let status = parsed
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(CodecError::Invalid("status code"))?;

        let mut response = Response::new(Bytes::new());
        *response.status_mut() = status;
        *response.version_mut() = version_from(parsed.version);
        append_headers(response.headers_mut(), parsed.headers)?;
        if let Some(reason) = parsed.reason {
            if Some(reason) != status.canonical_reason() {
                response
                    .extensions_mut()
                    .insert(ReasonPhrase(Bytes::copy_from_slice(reason.as_bytes())));
            }
        }

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }

        let framing = framing_for(method, &response)?;
        let payload = body::read_body(reader, framing, limits).await?;
        if matches!(framing, Framing::Chunked | Framing::UntilEof)
            && body::reframe(response.headers_mut(), payload.len())?
        {
            response.extensions_mut().insert(body::Rechunk);
        }
        *response.body_mut() = payload;

        let reusable = framing != Framing::UntilEof
            && status != StatusCode::SWITCHING_PROTOCOLS
            && !wants_close(response.version(), response.headers());

        return Ok((response, reusable));
    }
}

fn framing_for(method: &Method, response: &Response<Bytes>) -> Result<Framing, CodecError> {
    let status = response.status();
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }

    Ok(match body::chunked_coding(response.headers()) {
        Some(true) => Framing::Chunked,
        Some(false) => Framing::UntilEof,
        None => match content_length(response.headers())? {
            Some(len) => Framing::Length(len),
            None => Framing::UntilEof,
        },
    })
}

/// Serializes a response and flushes the writer.
pub async fn write_response<W>(writer: &mut W, response: &Response<Bytes>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = response.status();
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(version_str(response.version()).as_bytes());
    head.push(b' ');
    head.extend_from_slice(status.as_str().as_bytes());
    head.push(b' ');
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => head.extend_from_slice(reason.as_bytes()),
        None => head.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes()),
    }
    head.extend_from_slice(b"\r\n");
    encode_headers(&mut head, response.headers());

    writer.write_all(&head).await?;
    body::write_body(writer, response.extensions(), response.body()).await?;
    writer.flush().await
}
