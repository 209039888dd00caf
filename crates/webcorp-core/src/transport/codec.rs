/// HTTP/1.1 message codec.
///
/// Writes request heads and reads complete responses, body included, so the
/// connection is always positioned at the start of the next response.

use crate::error::{Error, Result};
use crate::transport::Response;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};
use std::io::{self, BufRead, Read, Write};
use tracing::debug;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4 * 1024;
/// Bytes kept from a 401/407 body. The remainder is read and discarded.
pub const MAX_CHALLENGE_BODY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Serialize and send one request.
///
/// `host` is used for the `Host` header unless `headers` already carries one.
/// `Content-Length` is added for bodies, and as `0` for body-less methods that
/// conventionally carry one.
pub fn write_request<W: Write>(
    w: &mut W,
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> Result<()> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, target).as_bytes());
    if !headers.contains_key(HOST) {
        head.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
    }
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if !headers.contains_key(CONTENT_LENGTH) && !headers.contains_key(TRANSFER_ENCODING) {
        match body {
            Some(b) => head.extend_from_slice(format!("Content-Length: {}\r\n", b.len()).as_bytes()),
            None if expects_body(method) => head.extend_from_slice(b"Content-Length: 0\r\n"),
            None => {}
        }
    }
    head.extend_from_slice(b"\r\n");

    w.write_all(&head)?;
    if let Some(b) = body {
        w.write_all(b)?;
    }
    w.flush()?;
    Ok(())
}

fn expects_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Chunked,
    Length(u64),
    UntilClose,
}

/// Read a complete response to a request made with `method`.
///
/// Interim `1xx` responses (other than `101`) are skipped. Returns the
/// response and its framing; `Framing::UntilClose` means the peer ended the
/// body by closing, so the connection cannot be reused.
///
/// Authentication challenge bodies are always drained but only the first
/// [`MAX_CHALLENGE_BODY`] bytes are kept.
pub fn read_response<R: BufRead>(r: &mut R, method: &Method) -> Result<(Response, Framing)> {
    loop {
        let head = read_head(r)?;
        let mut response = parse_head(&head)?;
        if response.status.is_informational() && response.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        let framing = framing(method, response.status, &response.headers)?;
        let limit = match response.status {
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => MAX_CHALLENGE_BODY,
            _ => usize::MAX,
        };
        response.body = read_body(r, framing, limit)?;
        return Ok((response, framing));
    }
}

fn read_head<R: BufRead>(r: &mut R) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    loop {
        let start = head.len();
        let n = r.by_ref().take((MAX_HEAD_BYTES + 1 - start) as u64).read_until(b'\n', &mut head)?;
        if n == 0 {
            let msg = if head.is_empty() {
                "connection closed before response"
            } else {
                "connection closed inside response head"
            };
            return Err(Error::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, msg)));
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(Error::malformed("response head too large"));
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            // Tolerate stray blank lines left by a previous response.
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

fn parse_head(head: &[u8]) -> Result<Response> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::malformed("incomplete response head")),
        Err(e) => return Err(Error::malformed(format!("unparseable response head: {}", e))),
    }

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let code = parsed.code.ok_or_else(|| Error::malformed("missing status code"))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| Error::malformed(format!("invalid status code {}", code)))?;
    let reason = parsed.reason.unwrap_or_default().to_string();

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Error::malformed(format!("invalid header name '{}'", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Error::malformed(format!("invalid value for header '{}'", h.name)))?;
        headers.append(name, value);
    }

    Ok(Response {
        version,
        status,
        reason,
        headers,
        body: Vec::new(),
    })
}

/// Decide body framing per RFC 9112 section 6.3.
pub fn framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Result<Framing> {
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || (*method == Method::CONNECT && status.is_success())
    {
        return Ok(Framing::Empty);
    }

    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(Framing::Chunked);
    }
    if headers.contains_key(TRANSFER_ENCODING) {
        return Ok(Framing::UntilClose);
    }

    match headers.get(CONTENT_LENGTH) {
        Some(v) => {
            let len = v
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::malformed("invalid Content-Length"))?;
            Ok(if len == 0 { Framing::Empty } else { Framing::Length(len) })
        }
        None => Ok(Framing::UntilClose),
    }
}

/// Body sink that keeps up to `limit` bytes and counts the rest.
struct BodyBuffer {
    data: Vec<u8>,
    limit: usize,
    discarded: u64,
}

impl Write for BodyBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let keep = self.limit.saturating_sub(self.data.len()).min(buf.len());
        self.data.extend_from_slice(&buf[..keep]);
        self.discarded += (buf.len() - keep) as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn read_body<R: BufRead>(r: &mut R, framing: Framing, limit: usize) -> Result<Vec<u8>> {
    let mut body = BodyBuffer {
        data: Vec::new(),
        limit,
        discarded: 0,
    };
    match framing {
        Framing::Empty => {}
        Framing::Length(len) => {
            let n = io::copy(&mut r.by_ref().take(len), &mut body)?;
            if n < len {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body truncated at {} of {} bytes", n, len),
                )));
            }
        }
        Framing::Chunked => read_chunked(r, &mut body)?,
        Framing::UntilClose => {
            io::copy(r, &mut body)?;
        }
    }
    if body.discarded > 0 {
        debug!(kept = body.data.len(), discarded = body.discarded, "response body truncated");
    }
    Ok(body.data)
}

fn read_chunked<R: BufRead>(r: &mut R, body: &mut BodyBuffer) -> Result<()> {
    loop {
        let line = read_line(r)?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| Error::malformed(format!("invalid chunk size '{}'", size_field)))?;
        if size == 0 {
            // Trailer section ends with an empty line.
            while !read_line(r)?.is_empty() {}
            return Ok(());
        }
        if io::copy(&mut r.by_ref().take(size), body)? < size {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunk truncated",
            )));
        }
        if !read_line(r)?.is_empty() {
            return Err(Error::malformed("missing CRLF after chunk data"));
        }
    }
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String> {
    let mut raw = Vec::new();
    let n = r.by_ref().take(MAX_CHUNK_LINE as u64).read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside chunked body",
        )));
    }
    if !raw.ends_with(b"\n") {
        return Err(Error::malformed("chunk line too long"));
    }
    let line = String::from_utf8_lossy(&raw);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
