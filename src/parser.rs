// src/parser.rs
use thiserror::Error;

use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The buffer holds a prefix of a valid request; read more and retry.
    #[error("incomplete request")]
    Incomplete,
    /// The buffer is malformed and no amount of further data can fix it.
    #[error("invalid request")]
    Invalid,
}

/// Parse one HTTP/1.1 request out of `buf` into `req`, returning the number
/// of bytes consumed (start-line + headers + body). The caller owns
/// pipelining: parse again at `buf[consumed..]` for the next request.
///
/// `req` is reset before use, so a pooled instance can be handed in as-is.
pub fn parse_request(buf: &[u8], req: &mut Request) -> Result<usize, ParseError> {
    req.reset();

    // Request line: METHOD SP REQUEST-TARGET SP HTTP-VERSION CRLF
    let line_end = find_crlf(buf, 0).ok_or(ParseError::Incomplete)?;
    let line = &buf[..line_end];

    let sp1 = memchr(line, b' ').ok_or(ParseError::Invalid)?;
    let sp2 = memchr(&line[sp1 + 1..], b' ')
        .map(|i| i + sp1 + 1)
        .ok_or(ParseError::Invalid)?;

    let method = as_str(&line[..sp1])?;
    let target = as_str(&line[sp1 + 1..sp2])?;
    let proto = as_str(&line[sp2 + 1..])?;

    if method.is_empty() || target.is_empty() {
        return Err(ParseError::Invalid);
    }

    req.method.push_str(method);
    req.proto.push_str(proto);

    // Split the query string off the target.
    match target.find('?') {
        Some(q) => {
            req.path.push_str(&target[..q]);
            parse_query(req, &target[q + 1..]);
        }
        None => req.path.push_str(target),
    }

    // Headers, terminated by an empty line.
    let mut cursor = line_end + 2;
    loop {
        let end = find_crlf(buf, cursor).ok_or(ParseError::Incomplete)?;
        if end == cursor {
            cursor = end + 2;
            break; // blank line: end of headers
        }

        let line = &buf[cursor..end];
        let colon = memchr(line, b':').ok_or(ParseError::Invalid)?;
        if colon == 0 {
            return Err(ParseError::Invalid);
        }

        let key = as_str(&line[..colon])?.trim();
        let value = as_str(&line[colon + 1..])?.trim();
        req.set_header(key, value);

        cursor = end + 2;
    }

    // Body: exactly Content-Length bytes, or empty.
    let body_len = if req.content_length.is_empty() {
        0
    } else {
        req.content_length
            .parse::<usize>()
            .map_err(|_| ParseError::Invalid)?
    };

    if buf.len() - cursor < body_len {
        return Err(ParseError::Incomplete);
    }
    req.body.extend_from_slice(&buf[cursor..cursor + body_len]);

    Ok(cursor + body_len)
}

fn parse_query(req: &mut Request, query: &str) {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => req.query.insert(k.to_string(), v.to_string()),
            None => req.query.insert(pair.to_string(), String::new()),
        };
    }
}

fn as_str(b: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(b).map_err(|_| ParseError::Invalid)
}

fn memchr(buf: &[u8], needle: u8) -> Option<usize> {
    buf.iter().position(|&b| b == needle)
}

/// Position of the next CRLF at or after `from`, or None if the buffer ends
/// first.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Result<(Request, usize), ParseError> {
        let mut req = Request::new();
        let consumed = parse_request(bytes, &mut req)?;
        Ok((req, consumed))
    }

    #[test]
    fn test_parse_basic_request() {
        let raw = b"GET /some/path?foo=bar&empty HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test\r\n\r\n";
        let (req, consumed) = parse(raw).unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/some/path");
        assert_eq!(req.proto, "HTTP/1.1");
        assert_eq!(req.query.get("foo").unwrap(), "bar");
        assert_eq!(req.query.get("empty").unwrap(), "");
        assert_eq!(req.host, "localhost");
        assert_eq!(req.user_agent, "test");
        assert!(req.body.is_empty());
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_body_exactly_content_length() {
        let raw = b"POST /api HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nbodyGET /next";
        let (req, consumed) = parse(raw).unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.body, b"body");
        // Consumption stops at the body boundary so the pipelined
        // follower is untouched.
        assert_eq!(&raw[consumed..], b"GET /next");
    }

    #[test]
    fn test_parse_incomplete_start_line() {
        assert_eq!(parse(b"GET /some/pa").unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_parse_incomplete_headers() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap_err(),
            ParseError::Incomplete
        );
    }

    #[test]
    fn test_parse_incomplete_body() {
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort").unwrap_err(),
            ParseError::Incomplete
        );
    }

    #[test]
    fn test_parse_missing_second_space() {
        assert_eq!(
            parse(b"GET /nospace\r\nHost: x\r\n\r\n").unwrap_err(),
            ParseError::Invalid
        );
    }

    #[test]
    fn test_parse_header_without_colon() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\nBadHeader\r\n\r\n").unwrap_err(),
            ParseError::Invalid
        );
    }

    #[test]
    fn test_unknown_proto_preserved() {
        let (req, _) = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.proto, "HTTP/1.0");
    }

    #[test]
    fn test_extra_headers_and_trimming() {
        let (req, _) =
            parse(b"GET / HTTP/1.1\r\nX-Trace:   abc  \r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(req.extra_headers.get("X-Trace").unwrap(), "abc");
        assert_eq!(req.accept, "*/*");
    }

    #[test]
    fn test_request_line_round_trip() {
        let raw = b"DELETE /v1/items/9?force=1 HTTP/1.1\r\nHost: h\r\n\r\n";
        let (req, _) = parse(raw).unwrap();
        // The query string never round-trips: it lives in req.query.
        assert_eq!(req.request_line(), "DELETE /v1/items/9 HTTP/1.1");

        let mut again = Request::new();
        again.reset();
        let raw2 = b"DELETE /v1/items/9 HTTP/1.1\r\nHost: h\r\n\r\n";
        parse_request(raw2, &mut again).unwrap();
        assert_eq!(again.request_line(), "DELETE /v1/items/9 HTTP/1.1");
    }
}
