//! Per-query asynchronous state machine.
//!
//! ```text
//! Init → Connecting → Handshaking → Querying → StoringResult
//!                                                  │
//!                                                  ▼
//!                                           FetchingRows → Finished
//! any state on error                        ─────────────→ Error
//! ```
//!
//! Every pump of the machine reads and writes non-blocking; when the socket
//! would block, a reactor watch is armed for the needed readiness together
//! with the phase's timeout, and the machine resumes on the observed mask.
//! `Init` is the launch path in [`run_query`]; error transitions
//! short-circuit into the completion callback instead of a stored variant.

use std::cell::{Cell, RefCell};
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::time::Duration;

use libc::c_int;
use tracing::{debug, warn};

use minuet_core::reactor::{EventHandler, Interest, Reactor, Ready, Repeat, Token};
use minuet_core::syscalls;

use crate::auth;
use crate::codec;
use crate::error::MysqlError;
use crate::protocol::{self, NATIVE_PASSWORD_PLUGIN};
use crate::row::{QueryResult, Row};

/// Connection settings; timeouts are per phase, in milliseconds.
#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        MysqlConfig {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: None,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
        }
    }
}

impl MysqlConfig {
    /// Read the conventional `MYSQL_*` environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = MysqlConfig::default();
        if let Ok(host) = std::env::var("MYSQL_HOST") {
            config.host = host;
        }
        if let Some(port) = std::env::var("MYSQL_PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Ok(user) = std::env::var("MYSQL_USER") {
            config.user = user;
        }
        if let Ok(password) = std::env::var("MYSQL_PASSWORD") {
            config.password = password;
        }
        config.database = std::env::var("MYSQL_DATABASE").ok();
        config
    }
}

pub type QueryCallback = Box<dyn FnOnce(Result<QueryResult, MysqlError>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Connecting,
    Handshaking,
    Querying,
    StoringResult,
    FetchingRows,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStage {
    AwaitGreeting,
    AwaitAuthResult,
}

enum Step {
    Continue,
    WaitRead,
    WaitWrite,
    Done,
}

enum Fill {
    Progress,
    WouldBlock,
    Eof,
}

struct AsyncQuery {
    reactor: Rc<Reactor>,
    config: MysqlConfig,
    sql: String,

    state: Cell<QueryState>,
    hs_stage: Cell<HandshakeStage>,

    fd: Cell<c_int>,
    token: Cell<Option<Token>>,
    inbuf: RefCell<Vec<u8>>,
    out: RefCell<Vec<u8>>,
    out_pos: Cell<usize>,
    last_seq: Cell<u8>,

    column_count: Cell<Option<usize>>,
    columns_read: Cell<usize>,
    result: RefCell<QueryResult>,

    io_timer: Cell<Option<u64>>,
    callback: RefCell<Option<QueryCallback>>,
    done: Cell<bool>,
}

/// Start one query. The callback fires exactly once on a later reactor
/// tick, with either the marshaled result (ownership transfers) or an
/// error; launch failures take the same path.
pub fn run_query(reactor: &Rc<Reactor>, config: &MysqlConfig, sql: &str, callback: QueryCallback) {
    let addr = match (config.host.as_str(), config.port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                let host = config.host.clone();
                reactor.spawn(move |_| {
                    callback(Err(MysqlError::Network(format!("no address for {host}"))))
                });
                return;
            }
        },
        Err(e) => {
            let message = format!("resolve {}: {e}", config.host);
            reactor.spawn(move |_| callback(Err(MysqlError::Network(message))));
            return;
        }
    };

    let (fd, _established) = match syscalls::connect_socket(&addr) {
        Ok(pair) => pair,
        Err(e) => {
            let message = e.to_string();
            reactor.spawn(move |_| callback(Err(MysqlError::Network(message))));
            return;
        }
    };

    let query = Rc::new(AsyncQuery {
        reactor: reactor.clone(),
        config: config.clone(),
        sql: sql.to_string(),
        state: Cell::new(QueryState::Connecting),
        hs_stage: Cell::new(HandshakeStage::AwaitGreeting),
        fd: Cell::new(fd),
        token: Cell::new(None),
        inbuf: RefCell::new(Vec::new()),
        out: RefCell::new(Vec::new()),
        out_pos: Cell::new(0),
        last_seq: Cell::new(0),
        column_count: Cell::new(None),
        columns_read: Cell::new(0),
        result: RefCell::new(QueryResult::default()),
        io_timer: Cell::new(None),
        callback: RefCell::new(Some(callback)),
        done: Cell::new(false),
    });

    match reactor.add_watch(fd, Interest::WRITABLE, query.clone()) {
        Ok(token) => query.token.set(Some(token)),
        Err(e) => {
            syscalls::close_fd(fd);
            let message = e.to_string();
            let q = query.clone();
            reactor.spawn(move |_| {
                if let Some(cb) = q.callback.borrow_mut().take() {
                    cb(Err(MysqlError::Network(message)));
                }
            });
            return;
        }
    }
    query.arm_timer(reactor, config.connect_timeout_ms);
    debug!(target: "mysql", host = %config.host, port = config.port, "query started");
}

impl AsyncQuery {
    fn arm_timer(self: &Rc<Self>, reactor: &Reactor, timeout_ms: u64) {
        if let Some(id) = self.io_timer.take() {
            reactor.cancel_timer(id);
        }
        let weak = Rc::downgrade(self);
        let id = reactor.add_timer(Duration::from_millis(timeout_ms), Repeat::Once, move |r| {
            if let Some(query) = weak.upgrade() {
                query.fail(r, MysqlError::Timeout);
            }
        });
        self.io_timer.set(Some(id));
    }

    fn detach(&self, reactor: &Reactor) {
        if let Some(token) = self.token.take() {
            reactor.remove_watch(token, self.fd.get());
        }
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            syscalls::close_fd(fd);
        }
        if let Some(id) = self.io_timer.take() {
            reactor.cancel_timer(id);
        }
    }

    fn finish(self: &Rc<Self>, reactor: &Reactor, result: Result<QueryResult, MysqlError>) {
        if self.done.replace(true) {
            return;
        }
        self.detach(reactor);
        let Some(callback) = self.callback.borrow_mut().take() else {
            return;
        };
        reactor.spawn(move |_| callback(result));
    }

    fn fail(self: &Rc<Self>, reactor: &Reactor, error: MysqlError) {
        warn!(target: "mysql", "query failed: {error}");
        self.finish(reactor, Err(error));
    }

    fn pump(self: &Rc<Self>, reactor: &Reactor) {
        loop {
            match self.step() {
                Ok(Step::Continue) => continue,
                Ok(Step::WaitRead) => {
                    self.wait(reactor, Interest::READABLE, self.config.read_timeout_ms);
                    return;
                }
                Ok(Step::WaitWrite) => {
                    self.wait(reactor, Interest::WRITABLE, self.config.write_timeout_ms);
                    return;
                }
                Ok(Step::Done) => return,
                Err(e) => {
                    self.fail(reactor, e);
                    return;
                }
            }
        }
    }

    fn wait(self: &Rc<Self>, reactor: &Reactor, interest: Interest, timeout_ms: u64) {
        if let Some(token) = self.token.get() {
            if let Err(e) = reactor.rearm(token, self.fd.get(), interest) {
                self.fail(reactor, MysqlError::Network(e.to_string()));
                return;
            }
        }
        self.arm_timer(reactor, timeout_ms);
    }

    /// One state-machine transition. `Continue` loops, the `Wait`s arm a
    /// watch and suspend, `Done` means the callback was scheduled.
    fn step(self: &Rc<Self>) -> Result<Step, MysqlError> {
        // Pending output always drains first.
        if self.out_pos.get() < self.out.borrow().len() {
            return self.flush_out();
        }

        match self.state.get() {
            QueryState::Connecting => {
                match syscalls::take_socket_error(self.fd.get()) {
                    Ok(None) => {}
                    Ok(Some(e)) => return Err(MysqlError::Network(e.to_string())),
                    Err(e) => return Err(MysqlError::Network(e.to_string())),
                }
                self.state.set(QueryState::Handshaking);
                self.hs_stage.set(HandshakeStage::AwaitGreeting);
                Ok(Step::Continue)
            }

            QueryState::Handshaking => {
                let Some(payload) = self.next_packet()? else {
                    return self.fill_or_wait();
                };

                match self.hs_stage.get() {
                    HandshakeStage::AwaitGreeting => {
                        let handshake = protocol::HandshakeV10::parse(&payload)?;
                        debug!(
                            target: "mysql",
                            server = %handshake.server_version,
                            plugin = %handshake.auth_plugin,
                            "greeting received"
                        );
                        if handshake.auth_plugin != NATIVE_PASSWORD_PLUGIN {
                            return Err(MysqlError::Auth(format!(
                                "unsupported auth plugin: {}",
                                handshake.auth_plugin
                            )));
                        }
                        let scramble = auth::native_password_scramble(
                            &self.config.password,
                            &handshake.auth_seed,
                        );
                        let response = protocol::build_handshake_response(
                            &self.config.user,
                            &scramble,
                            self.config.database.as_deref(),
                        );
                        self.queue_packet(self.last_seq.get().wrapping_add(1), &response);
                        self.hs_stage.set(HandshakeStage::AwaitAuthResult);
                        Ok(Step::Continue)
                    }
                    HandshakeStage::AwaitAuthResult => match payload.first() {
                        Some(&protocol::OK_MARKER) => {
                            self.state.set(QueryState::Querying);
                            Ok(Step::Continue)
                        }
                        Some(&protocol::ERR_MARKER) => Err(protocol::parse_err(&payload)),
                        Some(&protocol::EOF_MARKER) => {
                            let switch = protocol::parse_auth_switch(&payload)?;
                            if switch.plugin != NATIVE_PASSWORD_PLUGIN {
                                return Err(MysqlError::Auth(format!(
                                    "unsupported auth plugin: {}",
                                    switch.plugin
                                )));
                            }
                            let scramble = auth::native_password_scramble(
                                &self.config.password,
                                &switch.seed,
                            );
                            self.queue_packet(self.last_seq.get().wrapping_add(1), &scramble);
                            Ok(Step::Continue)
                        }
                        _ => Err(MysqlError::Protocol("unexpected auth packet".into())),
                    },
                }
            }

            QueryState::Querying => {
                let command = protocol::build_com_query(&self.sql);
                // A new command restarts the packet sequence.
                self.queue_packet(0, &command);
                self.state.set(QueryState::StoringResult);
                Ok(Step::Continue)
            }

            QueryState::StoringResult => {
                let Some(payload) = self.next_packet()? else {
                    return self.fill_or_wait();
                };

                match self.column_count.get() {
                    None => match payload.first() {
                        Some(&protocol::OK_MARKER) => {
                            let ok = protocol::parse_ok(&payload)?;
                            self.result.borrow_mut().affected_rows = ok.affected_rows;
                            self.state.set(QueryState::Finished);
                            Ok(Step::Continue)
                        }
                        Some(&protocol::ERR_MARKER) => Err(protocol::parse_err(&payload)),
                        _ => {
                            let (count, _) = codec::lenenc_int(&payload, 0).ok_or_else(|| {
                                MysqlError::Protocol("invalid column count".into())
                            })?;
                            self.column_count.set(Some(count as usize));
                            Ok(Step::Continue)
                        }
                    },
                    Some(count) if self.columns_read.get() < count => {
                        let name = protocol::parse_column_name(&payload)?;
                        self.result.borrow_mut().column_names.push(name);
                        self.columns_read.set(self.columns_read.get() + 1);
                        Ok(Step::Continue)
                    }
                    Some(_) => {
                        if protocol::is_eof(&payload) {
                            self.state.set(QueryState::FetchingRows);
                            Ok(Step::Continue)
                        } else {
                            Err(MysqlError::Protocol(
                                "expected EOF after column definitions".into(),
                            ))
                        }
                    }
                }
            }

            QueryState::FetchingRows => {
                let Some(payload) = self.next_packet()? else {
                    return self.fill_or_wait();
                };

                if protocol::is_eof(&payload) {
                    self.state.set(QueryState::Finished);
                    return Ok(Step::Continue);
                }
                if payload.first() == Some(&protocol::ERR_MARKER) {
                    return Err(protocol::parse_err(&payload));
                }

                let columns = self.column_count.get().unwrap_or(0);
                let values = protocol::parse_text_row(&payload, columns)?;
                self.result.borrow_mut().rows.push(Row::new(values));
                Ok(Step::Continue)
            }

            QueryState::Finished => {
                let result = std::mem::take(&mut *self.result.borrow_mut());
                debug!(
                    target: "mysql",
                    rows = result.rows.len(),
                    affected = result.affected_rows,
                    "query finished"
                );
                self.finish(&self.reactor.clone(), Ok(result));
                Ok(Step::Done)
            }
        }
    }

    /// Pop the next complete packet off the read buffer.
    fn next_packet(&self) -> Result<Option<Vec<u8>>, MysqlError> {
        let mut inbuf = self.inbuf.borrow_mut();
        match codec::read_packet(inbuf.as_slice()) {
            Some(packet) => {
                let payload = packet.payload.to_vec();
                self.last_seq.set(packet.seq);
                let consumed = packet.consumed;
                inbuf.drain(..consumed);
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    fn fill_or_wait(&self) -> Result<Step, MysqlError> {
        let mut chunk = [0u8; 16 * 1024];
        match self.fill_read(&mut chunk)? {
            Fill::Progress => Ok(Step::Continue),
            Fill::WouldBlock => Ok(Step::WaitRead),
            Fill::Eof => Err(MysqlError::ConnectionClosed),
        }
    }

    fn fill_read(&self, chunk: &mut [u8]) -> Result<Fill, MysqlError> {
        match syscalls::read_nonblocking(self.fd.get(), chunk) {
            Ok(Some(0)) => Ok(Fill::Eof),
            Ok(Some(n)) => {
                self.inbuf.borrow_mut().extend_from_slice(&chunk[..n]);
                Ok(Fill::Progress)
            }
            Ok(None) => Ok(Fill::WouldBlock),
            Err(e) => Err(MysqlError::Network(e.to_string())),
        }
    }

    fn queue_packet(&self, seq: u8, payload: &[u8]) {
        codec::write_packet(&mut self.out.borrow_mut(), seq, payload);
        self.last_seq.set(seq);
    }

    fn flush_out(&self) -> Result<Step, MysqlError> {
        loop {
            let pos = self.out_pos.get();
            let len = self.out.borrow().len();
            if pos >= len {
                self.out.borrow_mut().clear();
                self.out_pos.set(0);
                return Ok(Step::Continue);
            }
            let written = {
                let out = self.out.borrow();
                syscalls::write_nonblocking(self.fd.get(), &out[pos..])
            };
            match written {
                Ok(Some(n)) => self.out_pos.set(pos + n),
                Ok(None) => return Ok(Step::WaitWrite),
                Err(e) => return Err(MysqlError::Network(e.to_string())),
            }
        }
    }
}

impl EventHandler for AsyncQuery {
    fn on_event(self: Rc<Self>, reactor: &Reactor, _token: Token, _ready: Ready) {
        if self.done.get() {
            return;
        }
        if let Some(id) = self.io_timer.take() {
            reactor.cancel_timer(id);
        }
        self.pump(reactor);
    }
}
