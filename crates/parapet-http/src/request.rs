//! Immutable request value and its header map.

use std::fmt;

use bytes::Bytes;

use crate::error::HttpError;

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
    /// Any other token accepted by the request-line grammar.
    Extension(String),
}

impl Method {
    /// Parses a method token. Unknown tokens become `Method::Extension`.
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            other => Self::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
            Self::Extension(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Maps the minor version reported by the parser (`HTTP/1.x`).
    pub fn from_minor(minor: u8) -> Result<Self, HttpError> {
        match minor {
            0 => Ok(Self::Http10),
            1 => Ok(Self::Http11),
            other => Err(HttpError::UnsupportedVersion(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header multimap.
///
/// Insertion order is preserved and names compare case-insensitively.
/// Header counts are small (at most [`crate::MAX_HEADERS`] on requests), so a
/// linear scan beats hashing here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Bytes)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.get_all(name).next()
    }

    /// Returns the first value for `name` if it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Iterates over every value for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Bytes> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns true if any comma-separated element of any `name` value equals
    /// `token` (case-insensitive), e.g. `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(|b| *b == b',')
                .any(|element| element.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
        })
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A complete request as produced by the assembler.
///
/// There are no setters: once built the request is handed to the
/// application callback and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    pub fn new(
        method: Method,
        target: impl Into<String>,
        version: Version,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            method,
            target: target.into(),
            version,
            headers,
            body: body.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request-target exactly as sent (origin form, absolute form, ...).
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether the connection persists after this exchange.
    ///
    /// HTTP/1.1 persists unless the client sent `Connection: close`; HTTP/1.0
    /// persists only with an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(version: Version, connection: Option<&'static str>) -> Request {
        let mut headers = HeaderMap::new();
        if let Some(value) = connection {
            headers.append("Connection", value);
        }
        Request::new(Method::Get, "/", version, headers, Bytes::new())
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_ordered() {
        let mut headers = HeaderMap::new();
        headers.append("X-Trace", "a");
        headers.append("Host", "localhost");
        headers.append("x-trace", "b");

        assert_eq!(headers.get_str("host"), Some("localhost"));
        let traces: Vec<_> = headers.get_all("X-TRACE").cloned().collect();
        assert_eq!(traces, vec![Bytes::from("a"), Bytes::from("b")]);

        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Trace", "Host", "x-trace"]);
    }

    #[test]
    fn looked_up_values_outlive_the_name() {
        let mut headers = HeaderMap::new();
        headers.append("Host", "localhost");

        let host = {
            let name = String::from("HOST");
            headers.get_str(&name)
        };
        assert_eq!(host, Some("localhost"));
    }

    #[test]
    fn token_matching_splits_lists() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", "Upgrade,  Keep-Alive");
        assert!(headers.has_token("connection", "keep-alive"));
        assert!(headers.has_token("connection", "upgrade"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn keep_alive_defaults_follow_version() {
        assert!(request_with(Version::Http11, None).keep_alive());
        assert!(!request_with(Version::Http11, Some("close")).keep_alive());
        assert!(!request_with(Version::Http10, None).keep_alive());
        assert!(request_with(Version::Http10, Some("keep-alive")).keep_alive());
    }

    #[test]
    fn unknown_methods_round_trip_their_token() {
        let method = Method::parse("PROPFIND");
        assert_eq!(method, Method::Extension("PROPFIND".to_string()));
        assert_eq!(method.as_str(), "PROPFIND");
        assert_eq!(Method::parse("GET"), Method::Get);
    }

    #[test]
    fn only_http_1x_versions_are_accepted() {
        assert_eq!(Version::from_minor(1), Ok(Version::Http11));
        assert_eq!(Version::from_minor(0), Ok(Version::Http10));
        assert_eq!(Version::from_minor(2), Err(HttpError::UnsupportedVersion(2)));
    }
}
