//! Fan-in barrier: wait for N asynchronous operations, invoke a single
//! completion once all of them settle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::warn;

type Completion<D> = Box<dyn FnOnce(&mut D)>;

struct Inner<D> {
    data: RefCell<D>,
    pending: Cell<usize>,
    completed: Cell<bool>,
    on_complete: RefCell<Option<Completion<D>>>,
}

impl<D> Inner<D> {
    fn check_completion(&self) {
        if self.pending.get() != 0 || self.completed.get() {
            return;
        }
        let Some(callback) = self.on_complete.borrow_mut().take() else {
            return;
        };
        self.completed.set(true);
        callback(&mut self.data.borrow_mut());
    }
}

/// Aggregates heterogeneous async results into one completion. Each started
/// operation holds a [`FanInOp`] guard; when the last one settles, the
/// completion fires exactly once.
pub struct FanIn<D> {
    inner: Rc<Inner<D>>,
}

impl<D: 'static> FanIn<D> {
    pub fn new(data: D, on_complete: impl FnOnce(&mut D) + 'static) -> Self {
        FanIn {
            inner: Rc::new(Inner {
                data: RefCell::new(data),
                pending: Cell::new(0),
                completed: Cell::new(false),
                on_complete: RefCell::new(Some(Box::new(on_complete))),
            }),
        }
    }

    /// Account for one more pending operation. The returned guard must be
    /// settled by the operation's completion callback.
    pub fn start(&self) -> FanInOp<D> {
        self.inner.pending.set(self.inner.pending.get() + 1);
        FanInOp {
            inner: self.inner.clone(),
            settled: Cell::new(false),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.get()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.get()
    }
}

impl<D> Clone for FanIn<D> {
    fn clone(&self) -> Self {
        FanIn {
            inner: self.inner.clone(),
        }
    }
}

/// Guard for one started operation.
pub struct FanInOp<D> {
    inner: Rc<Inner<D>>,
    settled: Cell<bool>,
}

impl<D> FanInOp<D> {
    /// Merge this operation's outcome into the aggregated data and release
    /// the slot. Fires the completion when this was the last pending op.
    pub fn settle(self, merge: impl FnOnce(&mut D)) {
        self.settled.set(true);
        merge(&mut self.inner.data.borrow_mut());
        let pending = self.inner.pending.get();
        self.inner.pending.set(pending.saturating_sub(1));
        self.inner.check_completion();
    }
}

impl<D> Drop for FanInOp<D> {
    fn drop(&mut self) {
        if self.settled.get() {
            return;
        }
        // A dropped guard means the launch path lost its callback; release
        // the slot so the barrier cannot deadlock.
        warn!(target: "fanin", "operation guard dropped without settling");
        let pending = self.inner.pending.get();
        self.inner.pending.set(pending.saturating_sub(1));
        self.inner.check_completion();
    }
}
