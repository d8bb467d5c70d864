//! Message assembly: aggregates fragments into one immutable [`Request`].

use bytes::BytesMut;

use crate::error::HttpError;
use crate::framing::{BodyLength, Fragment};
use crate::request::{HeaderMap, Method, Request, Version};

/// Outcome of pushing one fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    /// More fragments are needed.
    Pending,
    /// The client asked for `Expect: 100-continue`; an interim response
    /// should be written before the body arrives.
    Continue,
    /// A full message is available.
    Complete(Request),
}

#[derive(Debug)]
struct PartialRequest {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    body: BytesMut,
    headers_done: bool,
}

/// Buffers fragments until a message boundary, enforcing a body size limit.
#[derive(Debug)]
pub struct Assembler {
    max_message_size: usize,
    partial: Option<PartialRequest>,
}

impl Assembler {
    /// Creates an assembler that rejects bodies above `max_message_size`.
    ///
    /// # Panics
    ///
    /// Panics if `max_message_size` is 0.
    pub fn new(max_message_size: usize) -> Self {
        assert!(max_message_size > 0, "max_message_size must be positive");
        Self {
            max_message_size,
            partial: None,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Returns true when no message is partially assembled.
    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Discards any partially assembled message.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feeds one fragment from the framing stage.
    pub fn push(&mut self, fragment: Fragment) -> Result<Assembled, HttpError> {
        match fragment {
            Fragment::RequestLine {
                method,
                target,
                version,
            } => {
                if self.partial.is_some() {
                    return Err(HttpError::UnexpectedFragment {
                        fragment: "request line",
                    });
                }
                self.partial = Some(PartialRequest {
                    method,
                    target,
                    version,
                    headers: HeaderMap::new(),
                    body: BytesMut::new(),
                    headers_done: false,
                });
                Ok(Assembled::Pending)
            }
            Fragment::Header { name, value } => {
                let partial = self.in_head("header")?;
                partial.headers.append(name, value);
                Ok(Assembled::Pending)
            }
            Fragment::HeadersEnd { body } => {
                let limit = self.max_message_size;
                let partial = self.in_head("end of headers")?;
                partial.headers_done = true;

                if let BodyLength::Known(declared) = body {
                    if declared > limit as u64 {
                        self.partial = None;
                        return Err(HttpError::MessageTooLarge {
                            size: declared,
                            limit,
                        });
                    }
                    // Bounded by the check above.
                    partial.body.reserve(declared as usize);
                }

                let wants_continue = body != BodyLength::Empty
                    && partial.version == Version::Http11
                    && partial.headers.has_token("expect", "100-continue");
                Ok(if wants_continue {
                    Assembled::Continue
                } else {
                    Assembled::Pending
                })
            }
            Fragment::Body(chunk) => {
                let limit = self.max_message_size;
                let partial = self.in_body("body")?;
                let size = partial.body.len() + chunk.len();
                if size > limit {
                    self.partial = None;
                    return Err(HttpError::MessageTooLarge {
                        size: size as u64,
                        limit,
                    });
                }
                partial.body.extend_from_slice(&chunk);
                Ok(Assembled::Pending)
            }
            Fragment::End => {
                self.in_body("end of message")?;
                let Some(done) = self.partial.take() else {
                    return Err(HttpError::UnexpectedFragment {
                        fragment: "end of message",
                    });
                };
                Ok(Assembled::Complete(Request::new(
                    done.method,
                    done.target,
                    done.version,
                    done.headers,
                    done.body.freeze(),
                )))
            }
        }
    }

    fn in_head(&mut self, fragment: &'static str) -> Result<&mut PartialRequest, HttpError> {
        match self.partial.as_mut() {
            Some(partial) if !partial.headers_done => Ok(partial),
            _ => Err(HttpError::UnexpectedFragment { fragment }),
        }
    }

    fn in_body(&mut self, fragment: &'static str) -> Result<&mut PartialRequest, HttpError> {
        match self.partial.as_mut() {
            Some(partial) if partial.headers_done => Ok(partial),
            _ => Err(HttpError::UnexpectedFragment { fragment }),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn head(assembler: &mut Assembler, body: BodyLength, headers: &[(&str, &str)]) -> Assembled {
        assembler
            .push(Fragment::RequestLine {
                method: Method::Post,
                target: "/upload".to_string(),
                version: Version::Http11,
            })
            .expect("request line");
        for (name, value) in headers {
            assembler
                .push(Fragment::Header {
                    name: (*name).to_string(),
                    value: Bytes::copy_from_slice(value.as_bytes()),
                })
                .expect("header");
        }
        assembler
            .push(Fragment::HeadersEnd { body })
            .expect("headers end")
    }

    #[test]
    fn assembles_body_across_chunks_and_resets() {
        let mut assembler = Assembler::new(64);
        head(&mut assembler, BodyLength::Chunked, &[("Host", "a")]);
        assert!(!assembler.is_idle());

        assembler.push(Fragment::Body(Bytes::from_static(b"abc"))).expect("body");
        assembler.push(Fragment::Body(Bytes::from_static(b"def"))).expect("body");
        let Assembled::Complete(request) = assembler.push(Fragment::End).expect("end") else {
            panic!("expected a complete request");
        };

        assert_eq!(request.body(), &Bytes::from_static(b"abcdef"));
        assert_eq!(request.headers().get_str("host"), Some("a"));
        assert!(assembler.is_idle(), "assembler must reset for keep-alive reuse");
    }

    #[test]
    fn declared_length_over_limit_fails_before_body() {
        let mut assembler = Assembler::new(10);
        assembler
            .push(Fragment::RequestLine {
                method: Method::Post,
                target: "/".to_string(),
                version: Version::Http11,
            })
            .expect("request line");
        let err = assembler
            .push(Fragment::HeadersEnd {
                body: BodyLength::Known(11),
            })
            .expect_err("declared size over the limit");
        assert_eq!(err, HttpError::MessageTooLarge { size: 11, limit: 10 });
        assert!(!err.is_framing());
    }

    #[test]
    fn streamed_body_over_limit_fails() {
        let mut assembler = Assembler::new(4);
        head(&mut assembler, BodyLength::Chunked, &[]);
        assembler.push(Fragment::Body(Bytes::from_static(b"1234"))).expect("at limit");
        let err = assembler
            .push(Fragment::Body(Bytes::from_static(b"5")))
            .expect_err("over limit");
        assert_eq!(err, HttpError::MessageTooLarge { size: 5, limit: 4 });
    }

    #[test]
    fn expect_continue_is_reported_once_headers_end() {
        let mut assembler = Assembler::new(64);
        let outcome = head(
            &mut assembler,
            BodyLength::Known(3),
            &[("Expect", "100-continue")],
        );
        assert_eq!(outcome, Assembled::Continue);
    }

    #[test]
    fn out_of_order_fragments_are_rejected() {
        let mut assembler = Assembler::new(64);
        assert!(assembler.push(Fragment::End).is_err());
        assert!(
            assembler
                .push(Fragment::Body(Bytes::from_static(b"x")))
                .is_err()
        );

        head(&mut assembler, BodyLength::Empty, &[]);
        let err = assembler
            .push(Fragment::Header {
                name: "Late".to_string(),
                value: Bytes::new(),
            })
            .expect_err("header after end of headers");
        assert_eq!(err, HttpError::UnexpectedFragment { fragment: "header" });
    }
}
