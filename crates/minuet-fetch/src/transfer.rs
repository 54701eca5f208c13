//! Per-transfer non-blocking state machine driven by reactor readiness.
//!
//! One transfer owns one socket: connect, send the serialized request, read
//! the response (Content-Length, chunked or close-delimited framing),
//! follow up to `max_redirects` redirects, then surface a `FetchResponse`
//! through the completion callback. Timeouts are reactor timers;
//! cancellation detaches the socket and completes with `Cancelled`.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::net::ToSocketAddrs;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use libc::c_int;
use memchr::memmem;
use tracing::debug;

use minuet_core::reactor::{EventHandler, Interest, Reactor, Ready, Repeat, Token};
use minuet_core::syscalls;

use crate::client::FetchConfig;
use crate::error::{FetchError, FetchResult};
use crate::request::{FetchMethod, FetchRequest};
use crate::response::FetchResponse;
use crate::url::{self, ParsedUrl};

pub type FetchCallback = Box<dyn FnOnce(&FetchRequest, FetchResult<FetchResponse>)>;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Sending,
    Receiving,
}

pub(crate) struct Transfer {
    reactor: Rc<Reactor>,
    config: FetchConfig,
    request: FetchRequest,
    url: RefCell<ParsedUrl>,
    phase: Cell<Phase>,
    fd: Cell<c_int>,
    token: Cell<Option<Token>>,
    out: RefCell<Vec<u8>>,
    out_pos: Cell<usize>,
    inbuf: RefCell<Vec<u8>>,
    redirects_left: Cell<u32>,
    started: Instant,
    total_timer: Cell<Option<u64>>,
    connect_timer: Cell<Option<u64>>,
    callback: RefCell<Option<FetchCallback>>,
    done: Cell<bool>,
}

/// Cancellation handle returned by `FetchClient::execute`.
pub struct FetchHandle {
    reactor: Rc<Reactor>,
    transfer: Weak<Transfer>,
}

impl FetchHandle {
    pub fn cancel(&self) {
        if let Some(transfer) = self.transfer.upgrade() {
            transfer.finish(&self.reactor, Err(FetchError::Cancelled));
        }
    }

    pub fn is_finished(&self) -> bool {
        match self.transfer.upgrade() {
            Some(transfer) => transfer.done.get(),
            None => true,
        }
    }
}

impl Transfer {
    /// Launch a transfer. Failures before the socket exists are reported
    /// through the callback on the next reactor tick, never synchronously,
    /// so fan-in accounting sees a uniform completion path.
    pub(crate) fn start(
        reactor: Rc<Reactor>,
        config: FetchConfig,
        request: FetchRequest,
        callback: FetchCallback,
    ) -> FetchHandle {
        let parsed = url::parse_url(&request.final_url());
        let parsed = match parsed {
            Ok(parsed) if parsed.scheme == "https" => Err(FetchError::TlsUnsupported),
            other => other,
        };

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                reactor.spawn(move |_| callback(&request, Err(e)));
                return FetchHandle {
                    reactor,
                    transfer: Weak::new(),
                };
            }
        };

        let transfer = Rc::new(Transfer {
            reactor: reactor.clone(),
            redirects_left: Cell::new(config.max_redirects),
            config,
            request,
            url: RefCell::new(parsed),
            phase: Cell::new(Phase::Connecting),
            fd: Cell::new(-1),
            token: Cell::new(None),
            out: RefCell::new(Vec::new()),
            out_pos: Cell::new(0),
            inbuf: RefCell::new(Vec::new()),
            started: Instant::now(),
            total_timer: Cell::new(None),
            connect_timer: Cell::new(None),
            callback: RefCell::new(Some(callback)),
            done: Cell::new(false),
        });

        let weak = Rc::downgrade(&transfer);
        let total = reactor.add_timer(
            Duration::from_millis(transfer.config.timeout_ms),
            Repeat::Once,
            move |r| {
                if let Some(t) = weak.upgrade() {
                    t.finish(r, Err(FetchError::Timeout));
                }
            },
        );
        transfer.total_timer.set(Some(total));

        if let Err(e) = transfer.begin_connect(&reactor) {
            transfer.finish(&reactor, Err(e));
        }

        FetchHandle {
            reactor,
            transfer: Rc::downgrade(&transfer),
        }
    }

    fn begin_connect(self: &Rc<Self>, reactor: &Reactor) -> FetchResult<()> {
        let (host, port) = {
            let url = self.url.borrow();
            (url.host.clone(), url.port)
        };

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| FetchError::Network(format!("resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| FetchError::Network(format!("no address for {host}")))?;

        let (fd, _established) =
            syscalls::connect_socket(&addr).map_err(|e| FetchError::Network(e.to_string()))?;
        self.fd.set(fd);
        self.phase.set(Phase::Connecting);

        let token = self
            .reactor
            .add_watch(fd, Interest::WRITABLE, self.clone())
            .map_err(|e| FetchError::Network(e.to_string()))?;
        self.token.set(Some(token));

        let weak = Rc::downgrade(self);
        let connect = reactor.add_timer(
            Duration::from_millis(self.config.connect_timeout_ms),
            Repeat::Once,
            move |r| {
                if let Some(t) = weak.upgrade() {
                    if t.phase.get() == Phase::Connecting {
                        t.finish(r, Err(FetchError::Timeout));
                    }
                }
            },
        );
        self.connect_timer.set(Some(connect));

        debug!(target: "fetch", host = %host, port, fd, "connecting");
        Ok(())
    }

    /// Drop socket and watch; leaves the total timer running.
    fn detach_io(&self, reactor: &Reactor) {
        if let Some(token) = self.token.take() {
            reactor.remove_watch(token, self.fd.get());
        }
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            syscalls::close_fd(fd);
        }
        if let Some(id) = self.connect_timer.take() {
            reactor.cancel_timer(id);
        }
    }

    pub(crate) fn finish(
        self: &Rc<Self>,
        reactor: &Reactor,
        result: FetchResult<FetchResponse>,
    ) {
        if self.done.replace(true) {
            return;
        }
        self.detach_io(reactor);
        if let Some(id) = self.total_timer.take() {
            reactor.cancel_timer(id);
        }

        let Some(callback) = self.callback.borrow_mut().take() else {
            return;
        };
        // Completion runs on the next tick so callers observe a uniform
        // asynchronous contract.
        let this = self.clone();
        reactor.spawn(move |_| callback(&this.request, result));
    }

    fn fail_io(self: &Rc<Self>, reactor: &Reactor, e: impl ToString) {
        self.finish(reactor, Err(FetchError::Network(e.to_string())));
    }

    fn build_request_bytes(&self) -> FetchResult<Vec<u8>> {
        let url = self.url.borrow();
        Ok(build_request_bytes(
            &self.request,
            &url,
            &self.config.user_agent,
        )?)
    }

    fn start_sending(self: &Rc<Self>, reactor: &Reactor) {
        match self.build_request_bytes() {
            Ok(bytes) => {
                *self.out.borrow_mut() = bytes;
                self.out_pos.set(0);
                self.phase.set(Phase::Sending);
                self.send_some(reactor);
            }
            Err(e) => self.finish(reactor, Err(e)),
        }
    }

    fn send_some(self: &Rc<Self>, reactor: &Reactor) {
        loop {
            let pos = self.out_pos.get();
            let len = self.out.borrow().len();
            if pos >= len {
                self.phase.set(Phase::Receiving);
                if let Some(token) = self.token.get() {
                    if let Err(e) = reactor.rearm(token, self.fd.get(), Interest::READABLE) {
                        self.fail_io(reactor, e);
                    }
                }
                return;
            }

            let result = {
                let out = self.out.borrow();
                syscalls::write_nonblocking(self.fd.get(), &out[pos..])
            };
            match result {
                Ok(Some(n)) => self.out_pos.set(pos + n),
                Ok(None) => return,
                Err(e) => {
                    self.fail_io(reactor, e);
                    return;
                }
            }
        }
    }

    fn read_some(self: &Rc<Self>, reactor: &Reactor) {
        let mut chunk = [0u8; READ_CHUNK];
        let mut eof = false;
        loop {
            match syscalls::read_nonblocking(self.fd.get(), &mut chunk) {
                Ok(Some(0)) => {
                    eof = true;
                    break;
                }
                Ok(Some(n)) => self.inbuf.borrow_mut().extend_from_slice(&chunk[..n]),
                Ok(None) => break,
                Err(e) => {
                    self.fail_io(reactor, e);
                    return;
                }
            }
        }
        self.try_complete(reactor, eof);
    }

    fn try_complete(self: &Rc<Self>, reactor: &Reactor, eof: bool) {
        let (status, headers_raw, body) = {
            let inbuf = self.inbuf.borrow();
            let Some(head_end) = memmem::find(inbuf.as_slice(), b"\r\n\r\n") else {
                if eof {
                    self.finish(
                        reactor,
                        Err(FetchError::Protocol("connection closed mid-headers".into())),
                    );
                }
                return;
            };

            let headers_raw = String::from_utf8_lossy(&inbuf[..head_end + 2]).into_owned();
            let status = match parse_status_line(&headers_raw) {
                Some(status) => status,
                None => {
                    drop(inbuf);
                    self.finish(
                        reactor,
                        Err(FetchError::Protocol("malformed status line".into())),
                    );
                    return;
                }
            };

            let raw_body = &inbuf[head_end + 4..];
            let content_length = head_header(&headers_raw, "Content-Length")
                .and_then(|v| v.parse::<usize>().ok());
            let chunked = head_header(&headers_raw, "Transfer-Encoding")
                .map(|v| v.eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);

            let body = if chunked {
                match decode_chunked(raw_body) {
                    Ok(Some(decoded)) => decoded,
                    Ok(None) => {
                        if eof {
                            drop(inbuf);
                            self.finish(
                                reactor,
                                Err(FetchError::Protocol("truncated chunked body".into())),
                            );
                        }
                        return;
                    }
                    Err(e) => {
                        drop(inbuf);
                        self.finish(reactor, Err(e));
                        return;
                    }
                }
            } else if let Some(expected) = content_length {
                if raw_body.len() < expected {
                    if eof {
                        drop(inbuf);
                        self.finish(
                            reactor,
                            Err(FetchError::Protocol("truncated response body".into())),
                        );
                    }
                    return;
                }
                raw_body[..expected].to_vec()
            } else {
                // Close-delimited body.
                if !eof {
                    return;
                }
                raw_body.to_vec()
            };

            (status, headers_raw, body)
        };

        self.complete(reactor, status, headers_raw, body);
    }

    fn complete(self: &Rc<Self>, reactor: &Reactor, status: u16, headers_raw: String, body: Vec<u8>) {
        let is_redirect = matches!(status, 301 | 302 | 303 | 307 | 308);
        if self.config.follow_redirects && is_redirect {
            if let Some(location) = head_header(&headers_raw, "Location") {
                self.follow_redirect(reactor, status, &location);
                return;
            }
        }

        let response = FetchResponse::new(status, body, headers_raw, self.started.elapsed());
        debug!(
            target: "fetch",
            status,
            bytes = response.body.len(),
            ms = response.total_time.as_millis() as u64,
            "transfer complete"
        );
        self.finish(reactor, Ok(response));
    }

    fn follow_redirect(self: &Rc<Self>, reactor: &Reactor, status: u16, location: &str) {
        if self.redirects_left.get() == 0 {
            self.finish(reactor, Err(FetchError::TooManyRedirects));
            return;
        }
        self.redirects_left.set(self.redirects_left.get() - 1);

        let next = if location.contains("://") {
            match url::parse_url(location) {
                Ok(parsed) if parsed.scheme == "https" => {
                    self.finish(reactor, Err(FetchError::TlsUnsupported));
                    return;
                }
                Ok(parsed) => parsed,
                Err(e) => {
                    self.finish(reactor, Err(e));
                    return;
                }
            }
        } else if location.starts_with('/') {
            let mut current = self.url.borrow().clone();
            current.path = location.to_string();
            current
        } else {
            self.finish(
                reactor,
                Err(FetchError::Protocol(format!(
                    "unsupported redirect target: {location}"
                ))),
            );
            return;
        };

        debug!(target: "fetch", status, location = %location, "following redirect");
        self.detach_io(reactor);
        *self.url.borrow_mut() = next;
        self.inbuf.borrow_mut().clear();
        self.out.borrow_mut().clear();
        self.out_pos.set(0);

        if let Err(e) = self.begin_connect(reactor) {
            self.finish(reactor, Err(e));
        }
    }
}

impl EventHandler for Transfer {
    fn on_event(self: Rc<Self>, reactor: &Reactor, _token: Token, ready: Ready) {
        if self.done.get() {
            return;
        }
        match self.phase.get() {
            Phase::Connecting => {
                match syscalls::take_socket_error(self.fd.get()) {
                    Ok(None) => {
                        if let Some(id) = self.connect_timer.take() {
                            reactor.cancel_timer(id);
                        }
                        self.start_sending(reactor);
                    }
                    Ok(Some(e)) => self.fail_io(reactor, e),
                    Err(e) => self.fail_io(reactor, e),
                }
            }
            Phase::Sending => {
                if ready.writable {
                    self.send_some(reactor);
                }
            }
            Phase::Receiving => {
                if ready.readable {
                    self.read_some(reactor);
                }
            }
        }
    }
}

/// Serialize the request head and body for the wire.
pub(crate) fn build_request_bytes(
    request: &FetchRequest,
    url: &ParsedUrl,
    user_agent: &str,
) -> FetchResult<Vec<u8>> {
    let body = request.wire_body()?;

    let mut out = Vec::with_capacity(256);
    let _ = write!(out, "{} {} HTTP/1.1\r\n", request.method.as_str(), url.path);
    if url.port == 80 {
        let _ = write!(out, "Host: {}\r\n", url.host);
    } else {
        let _ = write!(out, "Host: {}:{}\r\n", url.host, url.port);
    }
    let _ = write!(out, "User-Agent: {user_agent}\r\n");
    out.extend_from_slice(b"Accept: */*\r\nConnection: close\r\n");

    for (name, value) in request.headers() {
        let _ = write!(out, "{name}: {value}\r\n");
    }

    match body {
        Some((bytes, content_type)) => {
            if let Some(ct) = content_type {
                if !request.has_header("Content-Type") {
                    let _ = write!(out, "Content-Type: {ct}\r\n");
                }
            }
            let _ = write!(out, "Content-Length: {}\r\n\r\n", bytes.len());
            out.extend_from_slice(&bytes);
        }
        None => {
            if !matches!(request.method, FetchMethod::Get | FetchMethod::Head) {
                out.extend_from_slice(b"Content-Length: 0\r\n");
            }
            out.extend_from_slice(b"\r\n");
        }
    }

    Ok(out)
}

fn parse_status_line(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse::<u16>().ok()
}

/// Case-insensitive header lookup in a raw response head.
fn head_header(head: &str, name: &str) -> Option<String> {
    for line in head.lines().skip(1) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Decode a chunked body. `Ok(None)` means more bytes are needed.
fn decode_chunked(raw: &[u8]) -> FetchResult<Option<Vec<u8>>> {
    let mut out = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &raw[pos..];
        let Some(line_end) = memmem::find(rest, b"\r\n") else {
            return Ok(None);
        };
        let size_str = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| FetchError::Protocol("invalid chunk size".into()))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_len = usize::from_str_radix(size_str, 16)
            .map_err(|_| FetchError::Protocol("invalid chunk size".into()))?;

        let data_start = pos + line_end + 2;
        if chunk_len == 0 {
            // Trailer section ends with a blank line.
            return if raw.len() >= data_start + 2 {
                Ok(Some(out))
            } else {
                Ok(None)
            };
        }

        if raw.len() < data_start + chunk_len + 2 {
            return Ok(None);
        }
        out.extend_from_slice(&raw[data_start..data_start + chunk_len]);
        pos = data_start + chunk_len + 2;
    }
}
