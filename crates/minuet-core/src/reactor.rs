//! Single-threaded event loop owning sockets and timers.
//!
//! All I/O callbacks and handlers run on the reactor thread. Handlers must
//! never block; they either finish their work synchronously or register a
//! watch/timer and return. Watch handlers are `Rc`s cloned out of the
//! registry before dispatch, so a running handler may add or remove watches
//! and timers reentrantly.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libc::c_int;
use tracing::{debug, warn};

use crate::error::MinuetResult;
use crate::syscalls::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, Epoll, EpollEvent};

pub type Token = u64;
pub type TimerId = u64;

/// Idle epoll timeout when no timer is due sooner.
const IDLE_WAIT_MS: i32 = 1000;
const EVENT_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn events(self) -> u32 {
        let mut ev = 0;
        if self.readable {
            ev |= EPOLLIN;
        }
        if self.writable {
            ev |= EPOLLOUT;
        }
        ev
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    /// Peer hangup or socket error; surfaced as readable so the next read
    /// observes EOF or the error.
    pub hangup: bool,
}

impl Ready {
    fn from_events(ev: u32) -> Self {
        Ready {
            readable: ev & (EPOLLIN | EPOLLHUP | EPOLLERR) != 0,
            writable: ev & EPOLLOUT != 0,
            hangup: ev & (EPOLLHUP | EPOLLERR) != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    Periodic,
}

/// A watch callback. Implementors are registered as `Rc<dyn EventHandler>`
/// and invoked with the readiness observed for their token.
pub trait EventHandler {
    fn on_event(self: Rc<Self>, reactor: &Reactor, token: Token, ready: Ready);
}

type TimerCallback = Box<dyn FnMut(&Reactor)>;
type SpawnCallback = Box<dyn FnOnce(&Reactor)>;

struct TimerSlot {
    period: Option<Duration>,
    callback: Option<TimerCallback>,
}

struct Inner {
    handlers: HashMap<Token, Rc<dyn EventHandler>>,
    timers: HashMap<TimerId, TimerSlot>,
    queue: BinaryHeap<Reverse<(Instant, TimerId)>>,
    spawned: Vec<SpawnCallback>,
    next_token: Token,
    next_timer: TimerId,
}

pub struct Reactor {
    epoll: Epoll,
    inner: RefCell<Inner>,
}

impl Reactor {
    pub fn new() -> MinuetResult<Rc<Self>> {
        Ok(Rc::new(Reactor {
            epoll: Epoll::new()?,
            inner: RefCell::new(Inner {
                handlers: HashMap::new(),
                timers: HashMap::new(),
                queue: BinaryHeap::new(),
                spawned: Vec::new(),
                next_token: 1,
                next_timer: 1,
            }),
        }))
    }

    // ---- Watches ----

    pub fn add_watch(
        &self,
        fd: c_int,
        interest: Interest,
        handler: Rc<dyn EventHandler>,
    ) -> MinuetResult<Token> {
        let token = {
            let mut inner = self.inner.borrow_mut();
            let token = inner.next_token;
            inner.next_token += 1;
            token
        };
        self.epoll.add(fd, token, interest.events())?;
        self.inner.borrow_mut().handlers.insert(token, handler);
        Ok(token)
    }

    pub fn rearm(&self, token: Token, fd: c_int, interest: Interest) -> MinuetResult<()> {
        self.epoll.modify(fd, token, interest.events())
    }

    pub fn remove_watch(&self, token: Token, fd: c_int) {
        if let Err(e) = self.epoll.delete(fd) {
            debug!(target: "reactor", "epoll delete for fd {fd}: {e}");
        }
        self.inner.borrow_mut().handlers.remove(&token);
    }

    pub fn watch_count(&self) -> usize {
        self.inner.borrow().handlers.len()
    }

    // ---- Timers ----

    pub fn add_timer(
        &self,
        delay: Duration,
        repeat: Repeat,
        callback: impl FnMut(&Reactor) + 'static,
    ) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_timer;
        inner.next_timer += 1;
        inner.timers.insert(
            id,
            TimerSlot {
                period: match repeat {
                    Repeat::Once => None,
                    Repeat::Periodic => Some(delay),
                },
                callback: Some(Box::new(callback)),
            },
        );
        inner.queue.push(Reverse((Instant::now() + delay, id)));
        id
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.inner.borrow_mut().timers.remove(&id);
    }

    /// Run a closure on the next loop tick.
    pub fn spawn(&self, callback: impl FnOnce(&Reactor) + 'static) {
        self.inner.borrow_mut().spawned.push(Box::new(callback));
    }

    // ---- Loop ----

    /// Dispatch until the shutdown flag is raised. Per-connection failures
    /// never terminate the loop; only a broken epoll instance does.
    pub fn run(&self, shutdown: &AtomicBool) -> MinuetResult<()> {
        let mut events = vec![EpollEvent { events: 0, u64: 0 }; EVENT_BATCH];

        while !shutdown.load(Ordering::Acquire) {
            self.run_spawned();

            let timeout = self.next_timeout_ms();
            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    warn!(target: "reactor", "epoll wait failed: {e}");
                    return Err(e);
                }
            };

            for event in events.iter().take(n) {
                let token = event.u64;
                let ready = Ready::from_events(event.events);
                let handler = self.inner.borrow().handlers.get(&token).cloned();
                if let Some(handler) = handler {
                    handler.on_event(self, token, ready);
                }
            }

            self.fire_due_timers();
        }

        Ok(())
    }

    fn run_spawned(&self) {
        loop {
            let batch = std::mem::take(&mut self.inner.borrow_mut().spawned);
            if batch.is_empty() {
                return;
            }
            for callback in batch {
                callback(self);
            }
        }
    }

    fn next_timeout_ms(&self) -> i32 {
        let inner = self.inner.borrow();
        if !inner.spawned.is_empty() {
            return 0;
        }
        match inner.queue.peek() {
            Some(Reverse((deadline, _))) => {
                let now = Instant::now();
                if *deadline <= now {
                    0
                } else {
                    let ms = deadline.duration_since(now).as_millis() as i64;
                    ms.min(IDLE_WAIT_MS as i64) as i32
                }
            }
            None => IDLE_WAIT_MS,
        }
    }

    fn fire_due_timers(&self) {
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                let now = Instant::now();
                let is_due =
                    matches!(inner.queue.peek(), Some(Reverse((deadline, _))) if *deadline <= now);
                if is_due {
                    inner.queue.pop().map(|Reverse((_, id))| id)
                } else {
                    None
                }
            };

            let Some(id) = due else { return };

            // Take the callback out so the timer may be cancelled or
            // re-registered from within its own invocation.
            let (mut callback, period) = {
                let mut inner = self.inner.borrow_mut();
                match inner.timers.get_mut(&id) {
                    Some(slot) => match slot.callback.take() {
                        Some(cb) => (cb, slot.period),
                        None => continue,
                    },
                    // Cancelled while still queued; stale heap entry.
                    None => continue,
                }
            };

            callback(self);

            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.timers.get_mut(&id) {
                Some(slot) => {
                    if let Some(period) = period {
                        slot.callback = Some(callback);
                        inner.queue.push(Reverse((Instant::now() + period, id)));
                    } else {
                        inner.timers.remove(&id);
                    }
                }
                // Cancelled during its own invocation.
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn run_briefly(reactor: &Reactor, shutdown: &Arc<AtomicBool>) {
        let flag = shutdown.clone();
        reactor.add_timer(Duration::from_millis(50), Repeat::Once, move |_| {
            flag.store(true, Ordering::Release);
        });
        reactor.run(shutdown).unwrap();
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let reactor = Reactor::new().unwrap();
        let hits = Rc::new(Cell::new(0u32));
        let counter = hits.clone();
        reactor.add_timer(Duration::from_millis(1), Repeat::Once, move |_| {
            counter.set(counter.get() + 1);
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        run_briefly(&reactor, &shutdown);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn periodic_timer_repeats_until_cancelled() {
        let reactor = Reactor::new().unwrap();
        let hits = Rc::new(Cell::new(0u32));
        let counter = hits.clone();
        let id_cell = Rc::new(Cell::new(0u64));
        let id_for_cb = id_cell.clone();
        let id = reactor.add_timer(Duration::from_millis(1), Repeat::Periodic, move |r| {
            counter.set(counter.get() + 1);
            if counter.get() >= 3 {
                r.cancel_timer(id_for_cb.get());
            }
        });
        id_cell.set(id);

        let shutdown = Arc::new(AtomicBool::new(false));
        run_briefly(&reactor, &shutdown);
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn spawned_callbacks_run_next_tick() {
        let reactor = Reactor::new().unwrap();
        let hit = Rc::new(Cell::new(false));
        let flag = hit.clone();
        reactor.spawn(move |_| flag.set(true));

        let shutdown = Arc::new(AtomicBool::new(false));
        run_briefly(&reactor, &shutdown);
        assert!(hit.get());
    }
}
