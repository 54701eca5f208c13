//! Completed-transfer view: status, body, raw headers, timing, lazy JSON.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{FetchError, FetchResult};

pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Raw response head as received, status line included.
    pub headers_raw: String,
    pub total_time: Duration,
    json: RefCell<Option<Rc<Value>>>,
}

impl FetchResponse {
    pub(crate) fn new(
        status: u16,
        body: Vec<u8>,
        headers_raw: String,
        total_time: Duration,
    ) -> Self {
        FetchResponse {
            status,
            body,
            headers_raw,
            total_time,
            json: RefCell::new(None),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Case-insensitive lookup in the raw response head.
    pub fn header(&self, name: &str) -> Option<String> {
        for line in self.headers_raw.lines().skip(1) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
        None
    }

    /// Parse the body as JSON on first access; the parsed value is cached.
    pub fn json(&self) -> FetchResult<Rc<Value>> {
        if let Some(value) = self.json.borrow().as_ref() {
            return Ok(value.clone());
        }
        let parsed: Value =
            serde_json::from_slice(&self.body).map_err(|e| FetchError::Json(e.to_string()))?;
        let value = Rc::new(parsed);
        *self.json.borrow_mut() = Some(value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FetchResponse {
        FetchResponse::new(
            200,
            br#"{"login":"octocat","public_repos":8}"#.to_vec(),
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nX-RateLimit: 60\r\n"
                .to_string(),
            Duration::from_millis(12),
        )
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let res = sample();
        assert_eq!(
            res.header("content-type").as_deref(),
            Some("application/json")
        );
        assert_eq!(res.header("x-ratelimit").as_deref(), Some("60"));
        assert_eq!(res.header("missing"), None);
    }

    #[test]
    fn json_parses_lazily_and_caches() {
        let res = sample();
        let first = res.json().unwrap();
        assert_eq!(first["login"], "octocat");
        assert_eq!(first["public_repos"], 8);

        let second = res.json().unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let res = FetchResponse::new(
            200,
            b"<html>".to_vec(),
            "HTTP/1.1 200 OK\r\n".to_string(),
            Duration::ZERO,
        );
        assert!(matches!(res.json(), Err(FetchError::Json(_))));
    }
}
