//! Request framing: turns a decrypted byte stream into protocol fragments.
//!
//! The decoder is pull-based. Each call to [`RequestDecoder::decode`] consumes
//! as many bytes as it needs from the caller's buffer and yields at most one
//! [`Fragment`], or `None` when more input is required. Bytes belonging to a
//! pipelined follow-up request are left in the buffer untouched.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::HttpError;
use crate::request::{Method, Version};

/// Maximum number of header lines accepted in one request head.
pub const MAX_HEADERS: usize = 64;

/// Default limit for the request line plus header block.
pub const DEFAULT_MAX_HEAD_SIZE: usize = 8 * 1024;

/// Longest chunk-size line (including extensions) we are willing to buffer.
const MAX_CHUNK_LINE: usize = 1024;

/// How the body of the current message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body follows the head.
    Empty,
    /// `Content-Length` framing.
    Known(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// One piece of a request, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    RequestLine {
        method: Method,
        target: String,
        version: Version,
    },
    Header {
        name: String,
        value: Bytes,
    },
    /// End of the header block; announces how the body is framed.
    HeadersEnd { body: BodyLength },
    Body(Bytes),
    /// End-of-message marker.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers { consumed: usize },
}

/// Per-connection HTTP/1.1 request decoder.
#[derive(Debug)]
pub struct RequestDecoder {
    state: DecodeState,
    pending: VecDeque<Fragment>,
    max_head_size: usize,
}

impl RequestDecoder {
    /// Creates a decoder that rejects heads larger than `max_head_size`.
    ///
    /// # Panics
    ///
    /// Panics if `max_head_size` is 0.
    pub fn new(max_head_size: usize) -> Self {
        assert!(max_head_size > 0, "max_head_size must be positive");
        Self {
            state: DecodeState::Head,
            pending: VecDeque::with_capacity(MAX_HEADERS + 3),
            max_head_size,
        }
    }

    /// Returns true between messages: nothing is half-decoded.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Head && self.pending.is_empty()
    }

    /// Decodes the next fragment from `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold enough bytes.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Fragment>, HttpError> {
        if let Some(fragment) = self.pending.pop_front() {
            return Ok(Some(fragment));
        }

        loop {
            match self.state {
                DecodeState::Head => {
                    if !self.decode_head(src)? {
                        return Ok(None);
                    }
                    return Ok(self.pending.pop_front());
                }
                DecodeState::Fixed { remaining: 0 } => {
                    self.state = DecodeState::Head;
                    return Ok(Some(Fragment::End));
                }
                DecodeState::Fixed { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let chunk = take_up_to(src, remaining);
                    self.state = DecodeState::Fixed {
                        remaining: remaining - chunk.len() as u64,
                    };
                    return Ok(Some(Fragment::Body(chunk)));
                }
                DecodeState::ChunkSize => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > MAX_CHUNK_LINE {
                            return Err(HttpError::InvalidChunk("chunk size line too long"));
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&src[..line_end])?;
                    src.advance(line_end + 2);
                    self.state = if size == 0 {
                        DecodeState::Trailers { consumed: 0 }
                    } else {
                        DecodeState::ChunkData { remaining: size }
                    };
                }
                DecodeState::ChunkData { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let chunk = take_up_to(src, remaining);
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData { remaining: left }
                    };
                    return Ok(Some(Fragment::Body(chunk)));
                }
                DecodeState::ChunkDataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(HttpError::InvalidChunk("missing CRLF after chunk data"));
                    }
                    src.advance(2);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers { consumed } => {
                    let Some(line_end) = find_crlf(src) else {
                        if consumed + src.len() > self.max_head_size {
                            return Err(HttpError::HeadTooLarge {
                                limit: self.max_head_size,
                            });
                        }
                        return Ok(None);
                    };
                    src.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = DecodeState::Head;
                        return Ok(Some(Fragment::End));
                    }
                    // Trailer fields are accepted and dropped.
                    self.state = DecodeState::Trailers {
                        consumed: consumed + line_end + 2,
                    };
                }
            }
        }
    }

    /// Parses a complete head into `self.pending`. Returns false if `src`
    /// holds only part of the head.
    fn decode_head(&mut self, src: &mut BytesMut) -> Result<bool, HttpError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut slots);

        let head_len = match parsed.parse(src) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if src.len() > self.max_head_size {
                    return Err(HttpError::HeadTooLarge {
                        limit: self.max_head_size,
                    });
                }
                return Ok(false);
            }
            Err(e) => return Err(HttpError::MalformedHead(e.to_string())),
        };

        if head_len > self.max_head_size {
            return Err(HttpError::HeadTooLarge {
                limit: self.max_head_size,
            });
        }

        let (Some(method), Some(target), Some(minor)) =
            (parsed.method, parsed.path, parsed.version)
        else {
            return Err(HttpError::MalformedHead("incomplete request line".to_string()));
        };
        let version = Version::from_minor(minor)?;
        let body = body_length(parsed.headers)?;

        self.pending.push_back(Fragment::RequestLine {
            method: Method::parse(method),
            target: target.to_string(),
            version,
        });
        for header in parsed.headers.iter() {
            self.pending.push_back(Fragment::Header {
                name: header.name.to_string(),
                value: Bytes::copy_from_slice(header.value),
            });
        }
        self.pending.push_back(Fragment::HeadersEnd { body });

        self.state = match body {
            BodyLength::Empty => {
                self.pending.push_back(Fragment::End);
                DecodeState::Head
            }
            BodyLength::Known(remaining) => DecodeState::Fixed { remaining },
            BodyLength::Chunked => DecodeState::ChunkSize,
        };

        src.advance(head_len);
        Ok(true)
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAD_SIZE)
    }
}

/// Determines body framing from the parsed header block.
fn body_length(headers: &[httparse::Header<'_>]) -> Result<BodyLength, HttpError> {
    let mut content_length: Option<u64> = None;
    let mut transfer_encoding = false;

    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = parse_content_length(header.value)?;
            if content_length.is_some_and(|previous| previous != value) {
                return Err(HttpError::InvalidContentLength);
            }
            content_length = Some(value);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let all_chunked = header
                .value
                .split(|b| *b == b',')
                .all(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"));
            if !all_chunked {
                return Err(HttpError::UnsupportedTransferEncoding(
                    String::from_utf8_lossy(header.value).into_owned(),
                ));
            }
            transfer_encoding = true;
        }
    }

    match (transfer_encoding, content_length) {
        (true, Some(_)) => Err(HttpError::ConflictingFraming),
        (true, None) => Ok(BodyLength::Chunked),
        (false, None | Some(0)) => Ok(BodyLength::Empty),
        (false, Some(n)) => Ok(BodyLength::Known(n)),
    }
}

fn parse_content_length(value: &[u8]) -> Result<u64, HttpError> {
    let digits = value.trim_ascii();
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(HttpError::InvalidContentLength);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::InvalidContentLength)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let size = line
        .split(|b| *b == b';')
        .next()
        .unwrap_or_default()
        .trim_ascii();
    if size.is_empty() || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(HttpError::InvalidChunk("invalid chunk size"));
    }
    std::str::from_utf8(size)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or(HttpError::InvalidChunk("chunk size overflow"))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn take_up_to(src: &mut BytesMut, limit: u64) -> Bytes {
    let n = usize::try_from(limit).map_or(src.len(), |limit| limit.min(src.len()));
    src.split_to(n).freeze()
}
