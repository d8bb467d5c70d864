//! # parapet-http: HTTP/1.1 messages for the parapet server
//!
//! This crate holds the protocol half of a connection pipeline. It knows
//! nothing about sockets or TLS: bytes go in, immutable messages come out,
//! and responses are encoded back into bytes.
//!
//! ```text
//! ┌──────────────┐   Fragment   ┌─────────────┐   Request   ┌────────────┐
//! │RequestDecoder│ ───────────→ │  Assembler  │ ──────────→ │  handler   │
//! │  (framing)   │              │ (max size)  │             │ (external) │
//! └──────────────┘              └─────────────┘             └─────┬──────┘
//!        ↑ decrypted bytes                                        │ Response
//!                                 encode_response ←───────────────┘
//! ```
//!
//! Both stages are stateful per connection and are reused across keep-alive
//! exchanges: after `Fragment::End` the decoder expects a new request head and
//! the assembler starts from an empty buffer.

mod assembly;
mod encode;
mod error;
mod framing;
mod request;
mod response;

pub use assembly::{Assembled, Assembler};
pub use encode::{EncodeOptions, encode_continue, encode_response};
pub use error::HttpError;
pub use framing::{BodyLength, DEFAULT_MAX_HEAD_SIZE, Fragment, MAX_HEADERS, RequestDecoder};
pub use request::{HeaderMap, Method, Request, Version};
pub use response::{Response, StatusCode};
