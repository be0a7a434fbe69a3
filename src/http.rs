// src/http.rs
use std::collections::HashMap;

// Predefined header names routed to fixed Request fields.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_USER_AGENT: &str = "User-Agent";
pub const HEADER_ACCEPT: &str = "Accept";
pub const HEADER_HOST: &str = "Host";
pub const HEADER_CONNECTION: &str = "Connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// Reason phrase for a status code. Codes without an entry render as
/// `Unknown` rather than failing.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Append a base-10 integer to `buf` without going through a formatter.
/// Handles zero and negative values.
pub fn append_int(buf: &mut Vec<u8>, n: i64) {
    if n == 0 {
        buf.push(b'0');
        return;
    }

    let mut v = n;
    if v < 0 {
        buf.push(b'-');
        v = -v;
    }

    let mut digits = [0u8; 20];
    let mut count = 0;
    while v > 0 {
        digits[count] = b'0' + (v % 10) as u8;
        v /= 10;
        count += 1;
    }

    while count > 0 {
        count -= 1;
        buf.push(digits[count]);
    }
}

/// A parsed HTTP/1.1 request.
///
/// Requests are pooled: every field keeps its capacity across `reset` so a
/// recycled instance parses the next request without reallocating. The
/// common header names live in fixed fields; everything else lands in
/// `extra_headers`.
#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub proto: String,

    // Predefined common header fields
    pub content_type: String,
    pub content_length: String,
    pub user_agent: String,
    pub accept: String,
    pub host: String,
    pub connection: String,

    pub extra_headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            body: Vec::with_capacity(1024),
            ..Default::default()
        }
    }

    /// Reset logical state for reuse. Capacity of owned buffers and maps is
    /// preserved.
    pub fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.proto.clear();
        self.content_type.clear();
        self.content_length.clear();
        self.user_agent.clear();
        self.accept.clear();
        self.host.clear();
        self.connection.clear();
        self.extra_headers.clear();
        self.query.clear();
        self.body.clear();
    }

    /// Store a header, routing known names to the predefined fields.
    pub fn set_header(&mut self, key: &str, value: &str) {
        match key {
            HEADER_CONTENT_TYPE => assign(&mut self.content_type, value),
            HEADER_CONTENT_LENGTH => assign(&mut self.content_length, value),
            HEADER_USER_AGENT => assign(&mut self.user_agent, value),
            HEADER_ACCEPT => assign(&mut self.accept, value),
            HEADER_HOST => assign(&mut self.host, value),
            HEADER_CONNECTION => assign(&mut self.connection, value),
            _ => {
                self.extra_headers
                    .insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Look up a header, predefined fields first.
    pub fn header(&self, key: &str) -> &str {
        match key {
            HEADER_CONTENT_TYPE => &self.content_type,
            HEADER_CONTENT_LENGTH => &self.content_length,
            HEADER_USER_AGENT => &self.user_agent,
            HEADER_ACCEPT => &self.accept,
            HEADER_HOST => &self.host,
            HEADER_CONNECTION => &self.connection,
            _ => self
                .extra_headers
                .get(key)
                .map(String::as_str)
                .unwrap_or(""),
        }
    }

    /// Serialize the request line back to wire form (used by tests and
    /// diagnostics).
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.path, self.proto)
    }
}

fn assign(field: &mut String, value: &str) {
    field.clear();
    field.push_str(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_bytes() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"POST"), Method::Post);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
    }

    #[test]
    fn test_append_int() {
        let mut buf = Vec::new();
        append_int(&mut buf, 0);
        assert_eq!(buf, b"0");

        buf.clear();
        append_int(&mut buf, 12345);
        assert_eq!(buf, b"12345");

        buf.clear();
        append_int(&mut buf, -42);
        assert_eq!(buf, b"-42");
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(201), "Created");
        assert_eq!(status_text(400), "Bad Request");
        assert_eq!(status_text(404), "Not Found");
        assert_eq!(status_text(500), "Internal Server Error");
        assert_eq!(status_text(299), "Unknown");
    }

    #[test]
    fn test_header_routing() {
        let mut req = Request::new();
        req.set_header("Host", "example.com");
        req.set_header("X-Custom", "1");

        assert_eq!(req.host, "example.com");
        assert_eq!(req.header("Host"), "example.com");
        assert_eq!(req.header("X-Custom"), "1");
        assert_eq!(req.header("X-Missing"), "");
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut req = Request::new();
        req.path.push_str("/some/long/path/with/capacity");
        req.body.extend_from_slice(&[0u8; 512]);
        let path_cap = req.path.capacity();
        let body_cap = req.body.capacity();

        req.reset();

        assert!(req.path.is_empty());
        assert!(req.body.is_empty());
        assert_eq!(req.path.capacity(), path_cap);
        assert_eq!(req.body.capacity(), body_cap);
    }
}
