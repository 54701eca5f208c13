//! HTTP request/response model and response serialization.

use std::any::Any;
use std::io::Write;

use crate::session::SessionHandle;

pub const MAX_HEADERS: usize = 64;
pub const MAX_PATH_LEN: usize = 2048;

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
}

/// A parsed request. Immutable after parse except for the session binding,
/// which the pipeline resolves before the handler runs.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Request target as received, query string included.
    pub path: String,
    pub version: String,
    pub(crate) headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Value of the `session_id` cookie, when present.
    pub session_id: Option<String>,
    pub session: Option<SessionHandle>,
}

impl Request {
    /// Case-insensitive header lookup; names were captured verbatim.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn path_without_query(&self) -> &str {
        match self.path.find('?') {
            Some(idx) => &self.path[..idx],
            None => &self.path,
        }
    }
}

/// Scheduling signal between handlers and the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    NotProcessed,
    Processing,
    Processed,
    Error,
}

pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Borrowed static content; never copied or freed.
    Static(&'static [u8]),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
            Body::Static(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(b) => b.as_slice(),
            Body::Static(b) => b,
        }
    }
}

pub type CancelHook = Box<dyn FnOnce(Option<Box<dyn Any>>)>;

/// Mutable during handler execution. Once `state` reaches `Processed`, body
/// and headers are the final bytes to serialize.
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Body,
    /// Display priority derived from the MIME class of static assets.
    pub priority: i32,
    pub state: ResponseState,
    /// Context handed to `async_cancel` when the connection dies before the
    /// response completes.
    pub async_data: Option<Box<dyn Any>>,
    pub async_cancel: Option<CancelHook>,
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: 404,
            headers: Vec::new(),
            body: Body::Empty,
            priority: 0,
            state: ResponseState::NotProcessed,
            async_data: None,
            async_cancel: None,
        }
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        if self.headers.len() < MAX_HEADERS {
            self.headers.push((key.to_string(), value.to_string()));
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = Body::Bytes(body.into());
    }

    pub fn set_static_body(&mut self, body: &'static [u8]) {
        self.body = Body::Static(body);
    }

    /// Invoke the cancellation hook at most once; both fields are cleared so
    /// a second invocation is a no-op.
    pub fn invoke_cancel(&mut self) {
        if let Some(hook) = self.async_cancel.take() {
            let data = self.async_data.take();
            hook(data);
        } else {
            self.async_data = None;
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

pub fn status_message(code: u16) -> &'static str {
    match code {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Serialize status line, headers, an automatic `Content-Length`, the blank
/// line and the body.
pub fn serialize_response(res: &mut Response) -> Vec<u8> {
    let body_len = res.body.len();
    res.add_header("Content-Length", &body_len.to_string());

    let mut out = Vec::with_capacity(128 + body_len);
    let _ = write!(
        out,
        "HTTP/1.1 {} {}\r\n",
        res.status,
        status_message(res.status)
    );
    for (key, value) in &res.headers {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(res.body.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn serializer_emits_content_length_matching_body() {
        let mut res = Response::new();
        res.status = 200;
        res.add_header("Content-Type", "text/plain");
        res.set_body("hello");
        res.state = ResponseState::Processed;

        let wire = serialize_response(&mut res);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(status_message(200), "OK");
        assert_eq!(status_message(404), "Not Found");
        assert_eq!(status_message(500), "Internal Server Error");
        assert_eq!(status_message(403), "Unknown");
    }

    #[test]
    fn cancel_hook_runs_at_most_once() {
        let hits = Rc::new(Cell::new(0u32));
        let counter = hits.clone();

        let mut res = Response::new();
        res.async_data = Some(Box::new(42u32));
        res.async_cancel = Some(Box::new(move |data| {
            counter.set(counter.get() + 1);
            let value = data.unwrap().downcast::<u32>().unwrap();
            assert_eq!(*value, 42);
        }));

        res.invoke_cancel();
        res.invoke_cancel();
        assert_eq!(hits.get(), 1);
        assert!(res.async_data.is_none());
        assert!(res.async_cancel.is_none());
    }

    #[test]
    fn static_body_is_borrowed() {
        let mut res = Response::new();
        res.set_static_body(b"<h1>404 Not Found</h1>");
        assert_eq!(res.body.len(), 22);
        assert_eq!(res.body.as_bytes(), b"<h1>404 Not Found</h1>");
    }
}
