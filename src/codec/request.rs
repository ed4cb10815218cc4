// src/codec/request.rs
use bytes::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request, Uri};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::body::{self, Framing};
use super::{append_headers, content_length, encode_headers, read_head, version_from, version_str};
use super::{CodecError, Limits};

/// Reads one request from the stream.
///
/// `Ok(None)` means the peer closed the stream cleanly between requests.
pub async fn read_request<R>(
    reader: &mut R,
    limits: &Limits,
) -> Result<Option<Request<Bytes>>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let head = match read_head(reader, limits.max_head_bytes).await? {
        Some(head) => head,
        None => return Ok(None),
    };

    let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut parsed = httparse::Request::new(&mut headers);
    if parsed.parse(&head)?.is_partial() {
        return Err(CodecError::UnexpectedEof);
    }

    let method = parsed
        .method
        .ok_or(CodecError::Invalid("method"))
        .and_then(|m| Method::from_bytes(m.as_bytes()).map_err(|_| CodecError::Invalid("method")))?;
    let uri: Uri = parsed
        .path
        .ok_or(CodecError::Invalid("request target"))?
        .parse()
        .map_err(|_| CodecError::Invalid("request target"))?;

    let mut request = Request::new(Bytes::new());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version_from(parsed.version);
    append_headers(request.headers_mut(), parsed.headers)?;

    let framing = match body::chunked_coding(request.headers()) {
        Some(true) => Framing::Chunked,
        // A request body cannot be delimited by closing the connection.
        Some(false) => return Err(CodecError::Invalid("transfer-encoding")),
        None => match content_length(request.headers())? {
            Some(len) => Framing::Length(len),
            None => Framing::Empty,
        },
    };

    let payload = body::read_body(reader, framing, limits).await?;
    if framing == Framing::Chunked && body::reframe(request.headers_mut(), payload.len())? {
        request.extensions_mut().insert(body::Rechunk);
    }
    *request.body_mut() = payload;

    Ok(Some(request))
}

/// Serializes a request and flushes the writer.
///
/// Absolute-form targets are sent in origin-form, with `Host` taken from
/// the target's authority.
pub async fn write_request<W>(writer: &mut W, request: &Request<Bytes>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let uri = request.uri();
    let absolute = uri
        .authority()
        .filter(|_| request.method() != Method::CONNECT);

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method().as_str().as_bytes());
    head.push(b' ');
    match absolute {
        Some(_) => head.extend_from_slice(
            uri.path_and_query()
                .map(|pq| pq.as_str())
                .filter(|pq| !pq.is_empty())
                .unwrap_or("/")
                .as_bytes(),
        ),
        None => head.extend_from_slice(uri.to_string().as_bytes()),
    }
    head.push(b' ');
    head.extend_from_slice(version_str(request.version()).as_bytes());
    head.extend_from_slice(b"\r\n");

    match absolute.and_then(|authority| HeaderValue::from_str(authority.as_str()).ok()) {
        Some(host) => {
            let mut headers = request.headers().clone();
            headers.insert(HOST, host);
            encode_headers(&mut head, &headers);
        }
        None => encode_headers(&mut head, request.headers()),
    }

    writer.write_all(&head).await?;
    body::write_body(writer, request.extensions(), request.body()).await?;
    writer.flush().await
}
