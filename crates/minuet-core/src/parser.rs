//! HTTP/1.1 request parsing.
//!
//! The input is a contiguous byte slice holding one request, headers and
//! body included. Content-Length is not re-validated here; whatever follows
//! the blank line is the body.

use memchr::memmem;
use thiserror::Error;

use crate::http::{MAX_HEADERS, MAX_PATH_LEN, Method, Request};

const MAX_METHOD_LEN: usize = 15;
const MAX_VERSION_LEN: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The header terminator has not arrived yet.
    #[error("incomplete request")]
    Incomplete,
    /// Malformed request line or header line.
    #[error("invalid request format")]
    InvalidFormat,
    /// Request-target longer than the 2047-byte ceiling.
    #[error("request path too long")]
    PathTooLong,
    /// More than 64 header lines.
    #[error("too many headers")]
    TooManyHeaders,
}

fn parse_token(line: &[u8], start: usize, max_len: usize) -> Result<(&str, usize), ParseError> {
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(rest.len());
    if end == 0 || end > max_len {
        return Err(ParseError::InvalidFormat);
    }
    let token = std::str::from_utf8(&rest[..end]).map_err(|_| ParseError::InvalidFormat)?;
    Ok((token, start + end))
}

/// Parse one request out of `buf`. The buffer must contain the complete head
/// (terminated by a blank line); the remainder becomes the body.
pub fn parse_request(buf: &[u8]) -> Result<Request, ParseError> {
    let head_end = memmem::find(buf, b"\r\n\r\n").ok_or(ParseError::Incomplete)?;
    let head = &buf[..head_end];
    let body = buf[head_end + 4..].to_vec();

    let mut lines = head.split(|&b| b == b'\n').map(|line| {
        if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        }
    });

    let request_line = lines.next().ok_or(ParseError::InvalidFormat)?;

    let (method_str, after_method) = parse_token(request_line, 0, MAX_METHOD_LEN)?;
    if after_method >= request_line.len() || request_line[after_method] != b' ' {
        return Err(ParseError::InvalidFormat);
    }

    let rest = &request_line[after_method + 1..];
    let target_end = rest
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::InvalidFormat)?;
    if target_end == 0 {
        return Err(ParseError::InvalidFormat);
    }
    if target_end >= MAX_PATH_LEN {
        return Err(ParseError::PathTooLong);
    }
    let path = std::str::from_utf8(&rest[..target_end]).map_err(|_| ParseError::InvalidFormat)?;

    let version_bytes = &rest[target_end + 1..];
    if version_bytes.is_empty() || version_bytes.len() > MAX_VERSION_LEN {
        return Err(ParseError::InvalidFormat);
    }
    let version =
        std::str::from_utf8(version_bytes).map_err(|_| ParseError::InvalidFormat)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }
        let colon = match line.iter().position(|&b| b == b':') {
            Some(idx) => idx,
            // Header lines without a colon are skipped, as the original
            // parser did.
            None => continue,
        };
        let name = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::InvalidFormat)?;
        let value_bytes = &line[colon + 1..];
        let value =
            std::str::from_utf8(value_bytes).map_err(|_| ParseError::InvalidFormat)?;
        headers.push((name.to_string(), value.trim_start().to_string()));
    }

    let session_id = cookie_value(&headers, "session_id");

    Ok(Request {
        method: Method::from_bytes(method_str.as_bytes()),
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body,
        session_id,
        session: None,
    })
}

/// Tokenize the `Cookie` header and pick one cookie's value.
fn cookie_value(headers: &[(String, String)], cookie_name: &str) -> Option<String> {
    let cookie_header = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Cookie"))
        .map(|(_, v)| v.as_str())?;

    for part in cookie_header.split(';') {
        let part = part.trim_start();
        if let Some(rest) = part.strip_prefix(cookie_name) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.to_string());
            }
        }
    }
    None
}
