// src/context.rs
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::http::{append_int, status_text, Request};
use crate::syscalls;

const INLINE_PARAMS: usize = 4;

/// Per-request facade: request introspection on one side, response
/// emission on the other.
///
/// Contexts are pooled. `reset` restores logical state without releasing
/// the capacity of the parameter slots, response buffer, or header map.
/// Emission frames the response into the owned buffer and issues a single
/// buffered write to the fd; partial writes retry until the write timeout.
pub struct Context {
    fd: RawFd,
    request: Option<Request>,

    param_keys: [String; INLINE_PARAMS],
    param_values: [String; INLINE_PARAMS],
    param_count: usize,
    param_overflow: HashMap<String, String>,

    response_buf: Vec<u8>,
    response_headers: HashMap<String, String>,
    status_code: u16,
    aborted: bool,
    detached: bool,
    headers_sent: bool,
    io_failed: bool,
    write_timeout: Option<Duration>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            fd: -1,
            request: None,
            param_keys: Default::default(),
            param_values: Default::default(),
            param_count: 0,
            param_overflow: HashMap::new(),
            response_buf: Vec::with_capacity(4096),
            response_headers: HashMap::new(),
            status_code: 200,
            aborted: false,
            detached: false,
            headers_sent: false,
            io_failed: false,
            write_timeout: None,
        }
    }

    /// Rebind the context for a new request. Capacity is retained
    /// everywhere; only logical state resets.
    pub fn reset(&mut self, fd: RawFd, request: Option<Request>) {
        self.fd = fd;
        self.request = request;
        self.param_count = 0;
        self.param_overflow.clear();
        self.response_buf.clear();
        self.response_headers.clear();
        self.status_code = 200;
        self.aborted = false;
        self.detached = false;
        self.headers_sent = false;
        self.io_failed = false;
        self.write_timeout = None;
    }

    pub fn attach_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    pub(crate) fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = Some(timeout);
    }

    // ---- Request introspection ----

    pub fn method(&self) -> &str {
        self.request.as_ref().map_or("", |r| r.method.as_str())
    }

    pub fn path(&self) -> &str {
        self.request.as_ref().map_or("", |r| r.path.as_str())
    }

    pub fn proto(&self) -> &str {
        self.request.as_ref().map_or("", |r| r.proto.as_str())
    }

    /// Route parameter by name: the four inline slots first, then the
    /// overflow map.
    pub fn param(&self, key: &str) -> &str {
        for i in 0..self.param_count.min(INLINE_PARAMS) {
            if self.param_keys[i] == key {
                return &self.param_values[i];
            }
        }
        self.param_overflow
            .get(key)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        if self.param_count < INLINE_PARAMS {
            let i = self.param_count;
            self.param_keys[i].clear();
            self.param_keys[i].push_str(key);
            self.param_values[i].clear();
            self.param_values[i].push_str(value);
            self.param_count += 1;
        } else {
            self.param_overflow
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn query(&self, key: &str) -> &str {
        self.request
            .as_ref()
            .and_then(|r| r.query.get(key))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn header(&self, key: &str) -> &str {
        self.request.as_ref().map_or("", |r| r.header(key))
    }

    pub fn body(&self) -> &[u8] {
        self.request.as_ref().map_or(&[], |r| r.body.as_slice())
    }

    /// Bind the JSON body to a value.
    pub fn bind<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.body())
    }

    // ---- Response state ----

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.response_headers
            .insert(key.to_string(), value.to_string());
    }

    pub fn status(&mut self, code: u16) {
        self.status_code = code;
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Raw fd access for upgrade-style handlers. Marking the context
    /// detached tells the engine to forget the connection without closing
    /// the socket; the handler owns it from then on.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn detach(&mut self) -> RawFd {
        self.detached = true;
        self.fd
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub(crate) fn io_failed(&self) -> bool {
        self.io_failed
    }

    pub(crate) fn mark_io_failed(&mut self) {
        self.io_failed = true;
    }

    /// The framed response bytes of the last emission.
    pub fn response_bytes(&self) -> &[u8] {
        &self.response_buf
    }

    // ---- Response emission ----

    pub fn string(&mut self, code: u16, s: &str) {
        self.emit(code, "text/plain", s.as_bytes());
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, code: u16, v: &T) {
        match serde_json::to_vec(v) {
            Ok(data) => self.emit(code, "application/json", &data),
            Err(e) => {
                warn!(error = %e, "response serialization failed");
                self.emit(
                    500,
                    "application/json",
                    b"{\"error\":\"Internal Server Error\"}",
                );
            }
        }
    }

    pub fn bytes(&mut self, code: u16, data: &[u8]) {
        self.emit(code, "application/octet-stream", data);
    }

    pub fn data(&mut self, code: u16, content_type: &str, data: &[u8]) {
        self.emit(code, content_type, data);
    }

    /// Status line and headers only, Content-Length 0.
    pub fn empty(&mut self, code: u16) {
        self.emit(code, "", b"");
    }

    pub fn error(&mut self, code: u16, message: &str) {
        self.json(
            code,
            &serde_json::json!({ "code": code, "message": message }),
        );
    }

    pub fn success<T: Serialize>(&mut self, data: &T) {
        self.json(
            200,
            &serde_json::json!({ "code": 0, "data": data, "message": "success" }),
        );
    }

    /// Buffered file emission with an extension-derived content type.
    pub fn serve_file(&mut self, file_path: &str) -> std::io::Result<()> {
        let contents = match std::fs::read(file_path) {
            Ok(c) => c,
            Err(e) => {
                self.string(404, "File not found");
                return Err(e);
            }
        };

        let content_type = content_type_for(file_path);
        self.emit(200, content_type, &contents);
        Ok(())
    }

    /// Frame and write one response: status line, Content-Type, user-set
    /// headers, Content-Length, blank line, body. Only the first emission
    /// per request goes out.
    fn emit(&mut self, code: u16, content_type: &str, body: &[u8]) {
        if self.headers_sent {
            return;
        }

        self.status_code = code;

        let buf = &mut self.response_buf;
        buf.clear();

        buf.extend_from_slice(b"HTTP/1.1 ");
        append_int(buf, code as i64);
        buf.push(b' ');
        buf.extend_from_slice(status_text(code).as_bytes());
        buf.extend_from_slice(b"\r\n");

        if !content_type.is_empty() {
            buf.extend_from_slice(b"Content-Type: ");
            buf.extend_from_slice(content_type.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        for (k, v) in &self.response_headers {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(v.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"Content-Length: ");
        append_int(buf, body.len() as i64);
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(body);

        self.write_out();
    }

    fn write_out(&mut self) {
        self.headers_sent = true;

        // Unbound contexts (tests, detached handlers) keep the frame in
        // the buffer without touching a socket.
        if self.fd < 0 {
            return;
        }

        let deadline = self.write_timeout.map(|t| Instant::now() + t);
        if let Err(e) = syscalls::write_full(self.fd, &self.response_buf, deadline) {
            warn!(fd = self.fd, error = %e, "response write failed");
            self.io_failed = true;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn content_type_for(file_path: &str) -> &'static str {
    let ext = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_request;

    fn request_from(bytes: &[u8]) -> Request {
        let mut req = Request::new();
        parse_request(bytes, &mut req).unwrap();
        req
    }

    #[test]
    fn test_string_frames_exact_bytes() {
        let mut ctx = Context::new();
        ctx.string(200, "Welcome");
        assert_eq!(
            ctx.response_bytes(),
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 7\r\n\r\nWelcome"
        );
    }

    #[test]
    fn test_json_frames_content_length() {
        let mut ctx = Context::new();
        ctx.json(201, &serde_json::json!({"id": 7}));

        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(resp.contains("Content-Type: application/json\r\n"));
        let body = resp.split("\r\n\r\n").nth(1).unwrap();
        assert!(resp.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert_eq!(body, "{\"id\":7}");
    }

    #[test]
    fn test_user_headers_in_frame() {
        let mut ctx = Context::new();
        ctx.set_header("X-Request-ID", "41");
        ctx.string(200, "ok");
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.contains("X-Request-ID: 41\r\n"));
    }

    #[test]
    fn test_only_first_emission_wins() {
        let mut ctx = Context::new();
        ctx.string(200, "first");
        ctx.string(500, "second");
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.ends_with("first"));
        assert_eq!(ctx.status_code(), 200);
    }

    #[test]
    fn test_inline_params_then_overflow() {
        let mut ctx = Context::new();
        for i in 0..6 {
            ctx.set_param(&format!("k{}", i), &format!("v{}", i));
        }

        assert_eq!(ctx.param("k0"), "v0");
        assert_eq!(ctx.param("k3"), "v3");
        // Entries past the inline slots come from the overflow map.
        assert_eq!(ctx.param("k4"), "v4");
        assert_eq!(ctx.param("k5"), "v5");
        assert_eq!(ctx.param("missing"), "");
    }

    #[test]
    fn test_request_accessors() {
        let req = request_from(
            b"POST /items?page=2 HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nhi",
        );
        let mut ctx = Context::new();
        ctx.reset(-1, Some(req));

        assert_eq!(ctx.method(), "POST");
        assert_eq!(ctx.path(), "/items");
        assert_eq!(ctx.query("page"), "2");
        assert_eq!(ctx.query("absent"), "");
        assert_eq!(ctx.header("Host"), "h");
        assert_eq!(ctx.body(), b"hi");
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut ctx = Context::new();
        ctx.set_param("key", "value-with-some-length");
        ctx.string(200, "a body that occupies buffer capacity");
        let buf_cap = ctx.response_buf.capacity();

        ctx.reset(-1, None);

        assert_eq!(ctx.param_count, 0);
        assert!(ctx.response_buf.is_empty());
        assert_eq!(ctx.response_buf.capacity(), buf_cap);
        assert!(!ctx.headers_sent);
        assert_eq!(ctx.status_code(), 200);
    }

    #[test]
    fn test_bind_json_body() {
        #[derive(serde::Deserialize)]
        struct Payload {
            name: String,
        }

        let req = request_from(b"POST / HTTP/1.1\r\nContent-Length: 14\r\n\r\n{\"name\":\"ada\"}");
        let mut ctx = Context::new();
        ctx.reset(-1, Some(req));
        let p: Payload = ctx.bind().unwrap();
        assert_eq!(p.name, "ada");
    }

    #[test]
    fn test_detach_marks_context() {
        let mut ctx = Context::new();
        ctx.reset(12, None);
        let fd = ctx.detach();
        assert_eq!(fd, 12);
        assert!(ctx.is_detached());
    }

    #[test]
    fn test_success_and_error_envelopes() {
        let mut ctx = Context::new();
        ctx.success(&serde_json::json!({"n": 1}));
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("\"message\":\"success\""));

        let mut ctx = Context::new();
        ctx.error(400, "nope");
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(resp.contains("\"message\":\"nope\""));
    }
}
