use crate::job::Header;
use crate::runtime::Handle;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

/// Per-thread scheduler state, present only on pool worker threads.
/// Installed by the worker before it reaches the startup barrier.
pub(crate) struct WorkerContext {
    /// The index this thread serves as.
    pub(crate) index: usize,

    /// Scheduler access for awaiters and unit completion paths.
    pub(crate) handle: Handle,

    /// The unit currently being run, if any. Set by the worker loop
    /// immediately before invoking a unit; implicit parenting reads it.
    pub(crate) current: Cell<Option<NonNull<Header>>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

pub(crate) fn init_worker_context(index: usize, handle: Handle) {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        debug_assert!(ctx.is_none(), "worker context initialized twice");
        *ctx = Some(WorkerContext {
            index,
            handle,
            current: Cell::new(None),
        });
    });
}

pub(crate) fn clear_worker_context() {
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
}

/// Runs `f` against the worker context, if this thread is a pool worker.
pub(crate) fn with<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(f))
}

/// Scheduler access from code that only ever runs on workers.
pub(crate) fn handle<R>(f: impl FnOnce(&Handle) -> R) -> R {
    with(|ctx| f(&ctx.handle)).expect("not running on a job system worker")
}

/// The unit currently running on this thread, if any.
pub(crate) fn current_unit() -> Option<NonNull<Header>> {
    with(|ctx| ctx.current.get()).flatten()
}

/// Swaps the current-unit register, returning the previous value. Only the
/// worker loop calls this, around each unit invocation.
pub(crate) fn set_current(unit: Option<NonNull<Header>>) -> Option<NonNull<Header>> {
    with(|ctx| ctx.current.replace(unit)).expect("not running on a job system worker")
}

pub(crate) fn current_worker_index() -> Option<usize> {
    with(|ctx| ctx.index)
}

/// Index of the worker the calling thread serves as, or `None` when called
/// from outside the pool.
pub fn current_worker() -> Option<usize> {
    current_worker_index()
}
