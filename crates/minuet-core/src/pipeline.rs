//! Per-connection request pipeline: read, parse, resolve session, route,
//! serve, write. Handlers that stay asynchronous park their exchange on the
//! pending-response list; everything else is answered inline.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use libc::c_int;
use tracing::{debug, warn};

use crate::http::{self, Request, Response, ResponseState};
use crate::parser::{self, ParseError};
use crate::postprocess;
use crate::reactor::{EventHandler, Interest, Reactor, Ready, Token};
use crate::routing::RouteMatch;
use crate::server::ServerContext;
use crate::session::SESSION_LIFETIME_SECS;
use crate::syscalls;

const READ_CHUNK: usize = 8192;
/// Ceiling for one buffered request head+body.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

const NOT_FOUND_HTML: &[u8] = b"<h1>404 Not Found</h1>";

/// One request/response pair in flight. The pending list owns the `Rc`;
/// async completions hold `Weak` handles and must check `cancelled`.
pub struct Exchange {
    pub id: u64,
    pub req: Request,
    pub res: RefCell<Response>,
    pub cancelled: Cell<bool>,
}

pub struct Connection {
    pub(crate) fd: c_int,
    pub(crate) id: u64,
    token: Cell<Token>,
    ctx: Rc<ServerContext>,
    read_buf: RefCell<Vec<u8>>,
    write_buf: RefCell<Vec<u8>>,
    write_pos: Cell<usize>,
    /// A request is being handled; further input is dropped until the
    /// response went out (one request per connection at a time).
    busy: Cell<bool>,
    pub(crate) closed: Cell<bool>,
}

impl Connection {
    /// Register a freshly accepted socket with the reactor.
    pub(crate) fn accept(reactor: &Reactor, ctx: Rc<ServerContext>, fd: c_int) {
        let id = ctx.next_connection_id();
        let conn = Rc::new(Connection {
            fd,
            id,
            token: Cell::new(0),
            ctx,
            read_buf: RefCell::new(Vec::new()),
            write_buf: RefCell::new(Vec::new()),
            write_pos: Cell::new(0),
            busy: Cell::new(false),
            closed: Cell::new(false),
        });

        match reactor.add_watch(fd, Interest::READABLE, conn.clone()) {
            Ok(token) => {
                conn.token.set(token);
                debug!(target: "server", fd, id, "connection accepted");
            }
            Err(e) => {
                warn!(target: "server", fd, "failed to watch connection: {e}");
                syscalls::close_fd(fd);
            }
        }
    }

    pub(crate) fn close(&self, reactor: &Reactor) {
        if self.closed.replace(true) {
            return;
        }
        debug!(target: "server", fd = self.fd, id = self.id, "connection closed");
        reactor.remove_watch(self.token.get(), self.fd);
        syscalls::close_fd(self.fd);
        self.ctx.pending.cancel_for_connection(self.id);
    }

    fn handle_readable(self: &Rc<Self>, reactor: &Reactor) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match syscalls::read_nonblocking(self.fd, &mut chunk) {
                Ok(Some(0)) => {
                    self.close(reactor);
                    return;
                }
                Ok(Some(n)) => {
                    self.read_buf.borrow_mut().extend_from_slice(&chunk[..n]);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "server", fd = self.fd, "read error: {e}");
                    self.close(reactor);
                    return;
                }
            }
        }
        self.process_input(reactor);
    }

    fn process_input(self: &Rc<Self>, reactor: &Reactor) {
        if self.read_buf.borrow().is_empty() {
            return;
        }
        if self.busy.get() {
            let dropped = self.read_buf.borrow().len();
            warn!(
                target: "server",
                fd = self.fd,
                dropped,
                "request already in flight, dropping bytes"
            );
            self.read_buf.borrow_mut().clear();
            return;
        }

        {
            let buf = self.read_buf.borrow();
            if !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                if buf.len() > MAX_REQUEST_BYTES {
                    warn!(target: "server", fd = self.fd, "oversized request head, dropping");
                    drop(buf);
                    self.read_buf.borrow_mut().clear();
                }
                return;
            }
        }

        let raw = std::mem::take(&mut *self.read_buf.borrow_mut());
        let req = match parser::parse_request(&raw) {
            Ok(req) => req,
            Err(ParseError::Incomplete) => {
                *self.read_buf.borrow_mut() = raw;
                return;
            }
            Err(e) => {
                // Connection stays open and idle; no response is owed for a
                // malformed request.
                warn!(target: "server", fd = self.fd, "failed to parse request: {e}");
                return;
            }
        };

        self.busy.set(true);
        self.dispatch(reactor, req);
    }

    /// Route, resolve the session, run the handler, then either answer
    /// inline or park the exchange.
    fn dispatch(self: &Rc<Self>, reactor: &Reactor, mut req: Request) {
        let ctx = self.ctx.clone();
        let request_id = ctx.next_request_id();

        if cfg!(debug_assertions) {
            ctx.bench.borrow_mut().start(request_id, &req.path);
        }

        let routed: Option<RouteMatch> = {
            let routes = ctx.routes.borrow();
            routes.lookup(&req.path)
        };

        let mut res = Response::new();

        if routed.as_ref().is_some_and(|m| m.requires_session) {
            let old_id = req.session_id.clone();
            let session = ctx.sessions.borrow_mut().get_or_create(old_id.as_deref());
            let new_id = session.borrow().id.clone();
            if old_id.as_deref() != Some(new_id.as_str()) {
                let cookie = format!(
                    "session_id={}; HttpOnly; Path=/; Max-Age={}",
                    new_id, SESSION_LIFETIME_SECS
                );
                res.add_header("Set-Cookie", &cookie);
                debug!(target: "session", fd = self.fd, "issued session cookie");
            }
            req.session_id = Some(new_id);
            req.session = Some(session);
        }

        let exchange = Rc::new(Exchange {
            id: request_id,
            req,
            res: RefCell::new(res),
            cancelled: Cell::new(false),
        });

        match routed {
            Some(m) => {
                debug!(target: "routing", path = %exchange.req.path, "handler invoked");
                (m.handler)(&ctx, &exchange);
            }
            None => {
                let mut served_static = false;
                {
                    let mut fileserver = ctx.fileserver.borrow_mut();
                    if let Some(fs) = fileserver.as_mut() {
                        if fs.handles_url(&exchange.req.path) {
                            fs.handle_request(
                                &exchange.req.path,
                                &mut exchange.res.borrow_mut(),
                            );
                            served_static = true;
                        }
                    }
                }
                if !served_static {
                    debug!(target: "server", path = %exchange.req.path, "no handler, returning 404");
                    let mut res = exchange.res.borrow_mut();
                    res.status = 404;
                    res.add_header("Content-Type", "text/html");
                    res.set_static_body(NOT_FOUND_HTML);
                    res.state = ResponseState::Processed;
                }
            }
        }

        let state = exchange.res.borrow().state;
        if state == ResponseState::Processed {
            self.send_response(reactor, &exchange);
        } else {
            debug!(target: "server", id = request_id, "response pending, parked");
            self.ctx
                .pending
                .park(exchange, Rc::downgrade(self), self.id);
        }
    }

    /// Post-process, serialize and write one completed exchange.
    pub(crate) fn send_response(&self, reactor: &Reactor, exchange: &Exchange) {
        {
            let mut res = exchange.res.borrow_mut();
            if res.state != ResponseState::Processed {
                warn!(target: "server", "response not ready to send");
                return;
            }
            postprocess::postprocess(&exchange.req, &mut res);

            if cfg!(debug_assertions) {
                self.ctx.bench.borrow_mut().end(exchange.id);
            }

            let wire = http::serialize_response(&mut res);
            debug!(
                target: "server",
                status = res.status,
                bytes = wire.len(),
                "response serialized"
            );
            self.write_buf.borrow_mut().extend_from_slice(&wire);
        }

        self.busy.set(false);
        self.flush_writes(reactor);
    }

    fn flush_writes(&self, reactor: &Reactor) {
        loop {
            let pos = self.write_pos.get();
            let remaining = {
                let buf = self.write_buf.borrow();
                buf.len() - pos
            };
            if remaining == 0 {
                self.write_buf.borrow_mut().clear();
                self.write_pos.set(0);
                if let Err(e) = reactor.rearm(self.token.get(), self.fd, Interest::READABLE) {
                    debug!(target: "server", fd = self.fd, "rearm failed: {e}");
                }
                return;
            }

            let result = {
                let buf = self.write_buf.borrow();
                syscalls::write_nonblocking(self.fd, &buf[pos..])
            };
            match result {
                Ok(Some(n)) => {
                    self.write_pos.set(pos + n);
                }
                Ok(None) => {
                    // Partial write; resume when the socket drains.
                    if let Err(e) = reactor.rearm(self.token.get(), self.fd, Interest::BOTH) {
                        warn!(target: "server", fd = self.fd, "rearm for write failed: {e}");
                        self.close(reactor);
                    }
                    return;
                }
                Err(e) => {
                    warn!(target: "server", fd = self.fd, "write error: {e}");
                    self.close(reactor);
                    return;
                }
            }
        }
    }
}

impl EventHandler for Connection {
    fn on_event(self: Rc<Self>, reactor: &Reactor, _token: Token, ready: Ready) {
        if self.closed.get() {
            return;
        }
        if ready.writable && self.write_pos.get() < self.write_buf.borrow().len() {
            self.flush_writes(reactor);
        }
        if self.closed.get() {
            return;
        }
        if ready.readable {
            self.handle_readable(reactor);
        }
    }
}
