//! Server assembly: one explicit context value owns every shared structure
//! (no process-wide singletons), a listener feeds the connection pipeline,
//! and the reactor drives it all until shutdown.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;
use tracing::{info, warn};

use crate::error::{MinuetError, MinuetResult};
use crate::fileserver::FileServer;
use crate::pending::{PENDING_SWEEP_INTERVAL, PendingList};
use crate::pipeline::Connection;
use crate::reactor::{EventHandler, Interest, Reactor, Ready, Repeat, Token};
use crate::routing::RouteTable;
use crate::session::SessionStore;
use crate::speedbench::SpeedBench;
use crate::syscalls;

/// Everything the pipeline and handlers share, reactor-local.
pub struct ServerContext {
    pub reactor: Rc<Reactor>,
    pub routes: RefCell<RouteTable>,
    pub fileserver: RefCell<Option<FileServer>>,
    pub sessions: RefCell<SessionStore>,
    pub pending: PendingList,
    pub bench: RefCell<SpeedBench>,
    next_conn_id: Cell<u64>,
    next_request_id: Cell<u64>,
}

impl ServerContext {
    fn new(reactor: Rc<Reactor>) -> Rc<Self> {
        Rc::new(ServerContext {
            reactor,
            routes: RefCell::new(RouteTable::new()),
            fileserver: RefCell::new(None),
            sessions: RefCell::new(SessionStore::new()),
            pending: PendingList::new(),
            bench: RefCell::new(SpeedBench::new()),
            next_conn_id: Cell::new(1),
            next_request_id: Cell::new(1),
        })
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        id
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id + 1);
        id
    }
}

struct Listener {
    fd: c_int,
    ctx: Rc<ServerContext>,
}

impl EventHandler for Listener {
    fn on_event(self: Rc<Self>, reactor: &Reactor, _token: Token, _ready: Ready) {
        // Drain the accept queue.
        loop {
            match syscalls::accept_connection(self.fd) {
                Ok(Some(client_fd)) => {
                    Connection::accept(reactor, self.ctx.clone(), client_fd);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "server", "accept failed: {e}");
                    break;
                }
            }
        }
    }
}

pub struct Server {
    ctx: Rc<ServerContext>,
    shutdown: Arc<AtomicBool>,
    listen_fd: Cell<Option<c_int>>,
}

impl Server {
    pub fn new() -> MinuetResult<Self> {
        let reactor = Reactor::new()?;
        Ok(Server {
            ctx: ServerContext::new(reactor),
            shutdown: Arc::new(AtomicBool::new(false)),
            listen_fd: Cell::new(None),
        })
    }

    pub fn context(&self) -> &Rc<ServerContext> {
        &self.ctx
    }

    /// Cloneable flag; storing `true` stops the reactor within one tick.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Route SIGINT/SIGTERM into the shutdown flag.
    pub fn install_ctrlc_handler(&self) -> MinuetResult<()> {
        let flag = self.shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Release);
        })
        .map_err(|e| MinuetError::Other(format!("failed to set signal handler: {e}")))
    }

    /// Bind the listener; returns the actual port (resolves port 0).
    pub fn bind(&self, host: &str, port: u16) -> MinuetResult<u16> {
        let fd = syscalls::create_listen_socket(host, port)?;
        let bound = syscalls::local_port(fd)?;
        self.listen_fd.set(Some(fd));
        info!(target: "server", host, port = bound, "listener bound");
        Ok(bound)
    }

    /// Register the listener and the pending-response watchdog, then run
    /// the reactor until the shutdown flag flips.
    pub fn run(&self) -> MinuetResult<()> {
        let fd = self
            .listen_fd
            .get()
            .ok_or_else(|| MinuetError::Other("server not bound".to_string()))?;

        let listener = Rc::new(Listener {
            fd,
            ctx: self.ctx.clone(),
        });
        self.ctx
            .reactor
            .add_watch(fd, Interest::READABLE, listener)?;

        let sweep_ctx = self.ctx.clone();
        self.ctx
            .reactor
            .add_timer(PENDING_SWEEP_INTERVAL, Repeat::Periodic, move |reactor| {
                sweep_ctx.pending.sweep(reactor);
            });

        info!(target: "server", "entering event loop");
        let result = self.ctx.reactor.run(&self.shutdown);

        syscalls::close_fd(fd);
        self.listen_fd.set(None);
        info!(target: "server", "event loop finished, resources released");
        result
    }
}
