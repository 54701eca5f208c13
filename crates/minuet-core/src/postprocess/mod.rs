//! Response post-processing: content-type-driven minification followed by
//! Accept-Encoding negotiation. Runs after handler completion and before
//! serialization; every failure path keeps the original body.

pub mod compress;
pub mod minify;

use tracing::debug;

use crate::http::{Body, Request, Response};
pub use compress::{Coding, MIN_COMPRESS_SIZE, pick_coding};

const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "mjs", "json", "txt", "xml", "svg",
];

const COMPRESSIBLE_TYPES: &[&str] = &[
    "text/html",
    "text/css",
    "text/plain",
    "application/javascript",
    "application/json",
    "application/xml",
    "image/svg+xml",
];

/// Compressible content only; binary and pre-compressed formats are
/// short-circuited. Extension of the request path decides; pathless dynamic
/// responses fall back to their content type.
fn is_compressible(req_path: &str, content_type: Option<&str>) -> bool {
    let path = match req_path.find('?') {
        Some(idx) => &req_path[..idx],
        None => req_path,
    };
    if let Some(idx) = path.rfind('.') {
        let ext = &path[idx + 1..];
        return COMPRESSIBLE_EXTENSIONS
            .iter()
            .any(|ok| ext.eq_ignore_ascii_case(ok));
    }
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            COMPRESSIBLE_TYPES.iter().any(|t| ct.contains(t))
        }
        None => false,
    }
}

/// Minify then compress the response body in place.
pub fn postprocess(req: &Request, res: &mut Response) {
    if res.body.is_empty() {
        return;
    }

    // Step 1: minify HTML/CSS/JS (by content type, any size); adopt the
    // result only when it shrank.
    if let Some(content_type) = res.header("Content-Type").map(str::to_string) {
        let body = res.body.as_bytes();
        if let Some(minified) = minify::minify(&content_type, body) {
            if !minified.is_empty() && minified.len() < body.len() {
                debug!(
                    target: "compress",
                    from = body.len(),
                    to = minified.len(),
                    "minified body"
                );
                res.body = Body::Bytes(minified);
            }
        }
    }

    // Step 2: compression negotiation, only for bodies strictly larger
    // than the floor.
    if res.body.len() <= MIN_COMPRESS_SIZE {
        return;
    }
    if !is_compressible(&req.path, res.header("Content-Type")) {
        return;
    }
    let Some(accept) = req.header("Accept-Encoding") else {
        return;
    };
    let Some(coding) = pick_coding(accept) else {
        return;
    };

    let body = res.body.as_bytes();
    if let Some(compressed) = compress::compress(coding, body) {
        debug!(
            target: "compress",
            coding = coding.header_value(),
            from = body.len(),
            to = compressed.len(),
            "compressed body"
        );
        res.body = Body::Bytes(compressed);
        res.add_header("Content-Encoding", coding.header_value());
        res.add_header("Vary", "Accept-Encoding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, ResponseState};
    use std::io::Read;

    fn request(path: &str, accept_encoding: Option<&str>) -> Request {
        let mut headers = Vec::new();
        if let Some(ae) = accept_encoding {
            headers.push(("Accept-Encoding".to_string(), ae.to_string()));
        }
        Request {
            method: Method::Get,
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: Vec::new(),
            session_id: None,
            session: None,
        }
    }

    fn html_response(body: String) -> Response {
        let mut res = Response::new();
        res.status = 200;
        res.add_header("Content-Type", "text/html");
        res.set_body(body);
        res.state = ResponseState::Processed;
        res
    }

    #[test]
    fn six_kib_html_gets_gzip_with_vary() {
        let body = "<p>hello compression world</p>".repeat(205);
        assert!(body.len() > 6000);
        let req = request("/page.html", Some("gzip, br;q=0.8"));
        let mut res = html_response(body.clone());

        postprocess(&req, &mut res);

        assert_eq!(res.header("Content-Encoding"), Some("gzip"));
        assert_eq!(res.header("Vary"), Some("Accept-Encoding"));
        assert!(res.body.len() < body.len());

        let mut decoder = flate2::read::GzDecoder::new(res.body.as_bytes());
        let mut restored = String::new();
        decoder.read_to_string(&mut restored).unwrap();
        // Minification ran first, so the wire body inflates to the minified
        // document.
        assert_eq!(restored.len(), res_minified_len(&body));
    }

    fn res_minified_len(body: &str) -> usize {
        minify::minify("text/html", body.as_bytes())
            .map(|m| if m.len() < body.len() { m.len() } else { body.len() })
            .unwrap_or(body.len())
    }

    #[test]
    fn identity_only_request_is_not_compressed() {
        let body = "<p>hello</p>".repeat(600);
        let req = request("/page.html", Some("identity"));
        let mut res = html_response(body);

        postprocess(&req, &mut res);
        assert_eq!(res.header("Content-Encoding"), None);
        assert_eq!(res.header("Vary"), None);
    }

    #[test]
    fn small_bodies_skip_compression() {
        let req = request("/page.html", Some("gzip"));
        let mut res = html_response("<p>tiny</p>".to_string());

        postprocess(&req, &mut res);
        assert_eq!(res.header("Content-Encoding"), None);
    }

    #[test]
    fn binary_extensions_are_short_circuited() {
        let body = vec![0u8; 8192];
        let req = request("/image.png", Some("gzip"));
        let mut res = Response::new();
        res.status = 200;
        res.add_header("Content-Type", "image/png");
        res.set_body(body);

        postprocess(&req, &mut res);
        assert_eq!(res.header("Content-Encoding"), None);
    }

    #[test]
    fn brotli_wins_ties() {
        let body = "<p>hello compression world</p>".repeat(300);
        let req = request("/page.html", Some("br, gzip"));
        let mut res = html_response(body);

        postprocess(&req, &mut res);
        assert_eq!(res.header("Content-Encoding"), Some("br"));
    }

    #[test]
    fn minification_alone_applies_without_accept_encoding() {
        let body = "<p>  spaced   out  </p>\n".repeat(40);
        let req = request("/page.html", None);
        let mut res = html_response(body.clone());

        postprocess(&req, &mut res);
        assert_eq!(res.header("Content-Encoding"), None);
        assert!(res.body.len() < body.len());
    }

    #[test]
    fn tiny_bodies_are_minified_but_never_compressed() {
        let req = request("/hello.css", Some("gzip, br"));
        let mut res = Response::new();
        res.status = 200;
        res.add_header("Content-Type", "text/css");
        res.set_body("body {  color : red ; }\n");
        res.state = ResponseState::Processed;

        postprocess(&req, &mut res);
        assert_eq!(res.body.as_bytes(), b"body{color:red;}");
        assert_eq!(res.header("Content-Encoding"), None);
    }

    #[test]
    fn exactly_four_kib_is_not_compressed() {
        // The floor is strict: a body must exceed 4096 bytes.
        let body = "x".repeat(MIN_COMPRESS_SIZE);
        let req = request("/data.txt", Some("gzip"));
        let mut res = Response::new();
        res.status = 200;
        res.add_header("Content-Type", "text/plain");
        res.set_body(body);
        res.state = ResponseState::Processed;

        postprocess(&req, &mut res);
        assert_eq!(res.body.len(), MIN_COMPRESS_SIZE);
        assert_eq!(res.header("Content-Encoding"), None);

        let mut res = Response::new();
        res.status = 200;
        res.add_header("Content-Type", "text/plain");
        res.set_body("x".repeat(MIN_COMPRESS_SIZE + 1));
        res.state = ResponseState::Processed;

        postprocess(&req, &mut res);
        assert_eq!(res.header("Content-Encoding"), Some("gzip"));
        assert!(res.body.len() < MIN_COMPRESS_SIZE + 1);
    }

    #[test]
    fn extensionless_path_uses_content_type() {
        assert!(is_compressible("/", Some("text/html")));
        assert!(is_compressible("/data", Some("application/json")));
        assert!(!is_compressible("/data", Some("image/png")));
        assert!(!is_compressible("/archive.zip", Some("text/html")));
    }
}
