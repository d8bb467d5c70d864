//! Response encoding: the outbound half of the framing stage.

use bytes::{BufMut, BytesMut};

use crate::request::Version;
use crate::response::Response;

/// Per-exchange encoding decisions made by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Version of the request being answered.
    pub version: Version,
    /// Whether the connection stays open after this response.
    pub keep_alive: bool,
    /// Responses to `HEAD` carry the length but not the body.
    pub head_request: bool,
}

/// Writes `response` to `dst` as an HTTP/1.1 message.
///
/// `content-length` always equals the body length; any framing headers the
/// application set are replaced. `connection: close` is added when the
/// exchange is not persistent.
pub fn encode_response(response: &Response, options: EncodeOptions, dst: &mut BytesMut) {
    let status = response.status();
    let body = response.body();

    dst.reserve(128 + response.headers().len() * 32 + body.len());
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(status.as_u16().to_string().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(status.canonical_reason().as_bytes());
    dst.put_slice(b"\r\n");

    for (name, value) in response.headers().iter() {
        if is_framing_header(name) {
            continue;
        }
        put_header(dst, name.as_bytes(), value);
    }

    put_header(dst, b"content-length", body.len().to_string().as_bytes());
    if !options.keep_alive {
        put_header(dst, b"connection", b"close");
    } else if options.version == Version::Http10 {
        put_header(dst, b"connection", b"keep-alive");
    }
    dst.put_slice(b"\r\n");

    if !options.head_request {
        dst.put_slice(body);
    }
}

/// Writes the interim `100 Continue` response.
pub fn encode_continue(dst: &mut BytesMut) {
    dst.put_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}

fn put_header(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.put_slice(name);
    dst.put_slice(b": ");
    dst.put_slice(value);
    dst.put_slice(b"\r\n");
}
