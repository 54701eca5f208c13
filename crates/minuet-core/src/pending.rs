//! Pending-response watch list.
//!
//! Exchanges whose handlers stayed asynchronous are parked here together
//! with a weak handle to their connection. A periodic reactor timer sweeps
//! the list: entries whose response reached `Processed` are serialized and
//! sent; entries whose connection died are cancelled, their `async_cancel`
//! hook invoked at most once, and released.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::http::ResponseState;
use crate::pipeline::{Connection, Exchange};
use crate::reactor::Reactor;

/// Sweep interval for parked responses.
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct PendingEntry {
    exchange: Rc<Exchange>,
    conn: Weak<Connection>,
    conn_id: u64,
}

pub struct PendingList {
    entries: RefCell<Vec<PendingEntry>>,
}

impl PendingList {
    pub fn new() -> Self {
        PendingList {
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn park(&self, exchange: Rc<Exchange>, conn: Weak<Connection>, conn_id: u64) {
        self.entries.borrow_mut().push(PendingEntry {
            exchange,
            conn,
            conn_id,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Mark every entry bound to a closing connection as cancelled and run
    /// its cancel hook. The entries themselves are released by the sweep.
    pub fn cancel_for_connection(&self, conn_id: u64) {
        let mut hooks = Vec::new();
        for entry in self
            .entries
            .borrow_mut()
            .iter_mut()
            .filter(|e| e.conn_id == conn_id)
        {
            entry.exchange.cancelled.set(true);
            let mut res = entry.exchange.res.borrow_mut();
            if let Some(hook) = res.async_cancel.take() {
                let data = res.async_data.take();
                hooks.push((hook, data));
            } else {
                res.async_data = None;
            }
            debug!(target: "server", conn_id, "pending response cancelled");
        }
        // Hooks run outside the list borrow; they may reach back into the
        // server context.
        for (hook, data) in hooks {
            hook(data);
        }
    }

    /// One tick of the watchdog.
    pub fn sweep(&self, reactor: &Reactor) {
        if self.entries.borrow().is_empty() {
            return;
        }

        let drained = std::mem::take(&mut *self.entries.borrow_mut());
        let mut kept = Vec::new();

        for entry in drained {
            if entry.exchange.cancelled.get() {
                // Cancel hook already ran when the connection died.
                debug!(target: "server", id = entry.exchange.id, "releasing cancelled exchange");
                continue;
            }

            let state = entry.exchange.res.borrow().state;
            match state {
                ResponseState::Processed => {
                    if let Some(conn) = entry.conn.upgrade() {
                        if !conn.closed.get() {
                            debug!(
                                target: "server",
                                id = entry.exchange.id,
                                "pending response completed, sending"
                            );
                            conn.send_response(reactor, &entry.exchange);
                            continue;
                        }
                    }
                    // Connection gone without a cancel pass; release.
                    entry.exchange.res.borrow_mut().invoke_cancel();
                }
                ResponseState::Error => {
                    debug!(target: "server", id = entry.exchange.id, "pending response errored");
                    entry.exchange.res.borrow_mut().invoke_cancel();
                }
                _ => kept.push(entry),
            }
        }

        self.entries.borrow_mut().extend(kept);
    }
}

impl Default for PendingList {
    fn default() -> Self {
        Self::new()
    }
}
