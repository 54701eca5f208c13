//! Minimal URL handling: scheme/host/port/path splitting and
//! percent-encoding of query components. Covers what the client needs, not
//! full RFC 3986.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::{FetchError, FetchResult};

/// Everything except unreserved characters is escaped, matching what
/// curl_easy_escape produced for the original client.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Decode percent escapes; `+` decodes to a space.
pub fn decode_component(s: &str) -> String {
    let with_spaces = s.replace('+', " ");
    percent_encoding::percent_decode_str(&with_spaces)
        .decode_utf8_lossy()
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

pub fn parse_url(url: &str) -> FetchResult<ParsedUrl> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| FetchError::InvalidParam(format!("missing scheme in URL: {url}")))?;
    let scheme = scheme.to_ascii_lowercase();

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(FetchError::InvalidParam(format!("missing host in URL: {url}")));
    }

    let default_port = match scheme.as_str() {
        "http" => 80,
        "https" => 443,
        other => {
            return Err(FetchError::InvalidParam(format!(
                "unsupported scheme: {other}"
            )));
        }
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| FetchError::InvalidParam(format!("invalid port in URL: {url}")))?;
            (host, port)
        }
        None => (authority, default_port),
    };

    Ok(ParsedUrl {
        scheme,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_path() {
        let url = parse_url("http://example.com:8080/a/b?c=1").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/a/b?c=1");
    }

    #[test]
    fn default_ports_apply() {
        assert_eq!(parse_url("http://example.com").unwrap().port, 80);
        assert_eq!(parse_url("https://example.com/x").unwrap().port, 443);
        assert_eq!(parse_url("http://example.com").unwrap().path, "/");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_url("example.com/x").is_err());
        assert!(parse_url("ftp://example.com").is_err());
        assert!(parse_url("http://example.com:notaport/").is_err());
        assert!(parse_url("http:///x").is_err());
    }

    #[test]
    fn component_encoding_keeps_unreserved() {
        assert_eq!(encode_component("abc-_.~123"), "abc-_.~123");
        assert_eq!(encode_component("a b&c"), "a%20b%26c");
        assert_eq!(encode_component("ü"), "%C3%BC");
    }

    #[test]
    fn component_decoding_maps_plus_to_space() {
        assert_eq!(decode_component("a+b%26c"), "a b&c");
        assert_eq!(decode_component("plain"), "plain");
    }
}
