//! Application callback seam.
//!
//! One handler value is built at startup and shared read-only by every
//! worker. It is invoked on the owning worker thread once per assembled
//! request, so it must not block materially.

use std::sync::Arc;

use parapet_http::{Request, Response};
use thiserror::Error;

/// Failure reported by an application callback.
///
/// The connection that produced the request is closed; nothing else is
/// affected.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Produces a response for one request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        self(request)
    }
}

/// Handler shared by every connection.
pub type SharedHandler = Arc<dyn Handler>;

/// Answers every request with `200 OK` and the body `Hello`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloHandler;

impl HelloHandler {
    pub const BODY: &'static str = "Hello";
}

impl Handler for HelloHandler {
    fn handle(&self, _request: Request) -> Result<Response, HandlerError> {
        Ok(Response::ok(Self::BODY).with_header("content-type", "text/plain"))
    }
}
