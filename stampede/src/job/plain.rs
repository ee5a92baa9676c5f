#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::{self, UnitAlloc};
use crate::context;
use crate::job::header::{Header, Kind, Vtable, notify_parent};
use std::any::TypeId;
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

pub(crate) type Callable = Box<dyn FnOnce() + Send + 'static>;

/// A plain run-to-completion job: one callable, an optional continuation
/// scheduled after this job's entire subtree has finished, and a cell that
/// goes back to the recycle queue once the job is done.
#[repr(C)]
pub(crate) struct JobCell {
    pub(crate) header: Header,

    /// Taken exactly once per run.
    callable: UnsafeCell<Option<Callable>>,

    /// Scheduled by the terminal transition, reparented onto this job's
    /// parent.
    continuation: Cell<Option<NonNull<Header>>>,
}

static JOB_VTABLE: Vtable = Vtable {
    run,
    child_finished,
    store_value,
    shutdown,
    dealloc,
    output_type,
    kind: Kind::PlainJob,
};

impl JobCell {
    /// Allocates a fresh, unarmed cell.
    pub(crate) fn allocate(resource: &'static dyn UnitAlloc) -> NonNull<Header> {
        let cell = JobCell {
            header: Header::new(&JOB_VTABLE, resource),
            callable: UnsafeCell::new(None),
            continuation: Cell::new(None),
        };
        alloc::alloc_cell(resource, cell).cast()
    }

    /// Arms a fresh or recycled cell for one run.
    ///
    /// # Safety
    ///
    /// The cell must not be linked into any queue or visible to any worker.
    pub(crate) unsafe fn prepare(
        ptr: NonNull<Header>,
        callable: Callable,
        worker: i32,
        parent: Option<NonNull<Header>>,
    ) {
        let cell = Self::from_header(ptr);
        cell.header.reset();
        cell.header.worker.set(worker);
        cell.header.parent.set(parent);
        *cell.callable.get() = Some(callable);
    }

    /// # Safety
    ///
    /// Same contract as [`JobCell::prepare`].
    pub(crate) unsafe fn set_continuation(ptr: NonNull<Header>, continuation: NonNull<Header>) {
        Self::from_header(ptr).continuation.set(Some(continuation));
    }

    unsafe fn from_header<'a>(ptr: NonNull<Header>) -> &'a JobCell {
        ptr.cast::<JobCell>().as_ref()
    }
}

/// Runs the callable with one self credit held, so children it submits
/// cannot complete the job before the callable has returned.
unsafe fn run(ptr: NonNull<Header>) {
    let cell = JobCell::from_header(ptr);
    cell.header.children.store(1, Ordering::Relaxed);

    let callable = (*cell.callable.get())
        .take()
        .expect("plain job scheduled without a callable");
    callable();

    if cell.header.children.fetch_sub(1, Ordering::AcqRel) == 1 {
        on_finished(ptr);
    }
}

unsafe fn child_finished(ptr: NonNull<Header>) {
    if ptr.as_ref().children.fetch_sub(1, Ordering::AcqRel) == 1 {
        on_finished(ptr);
    }
}

/// Terminal transition, called exactly once per job lifetime: fire the
/// continuation, notify the parent, recycle the carcass.
unsafe fn on_finished(ptr: NonNull<Header>) {
    let cell = JobCell::from_header(ptr);

    if let Some(continuation) = cell.continuation.take() {
        // The continuation inherits this job's parent, which must learn of
        // the new child before it hears that this job is done.
        if let Some(parent) = cell.header.parent.get() {
            parent.as_ref().children.fetch_add(1, Ordering::Relaxed);
            continuation.as_ref().parent.set(Some(parent));
        }
        context::handle(|handle| handle.schedule(continuation));
    }

    notify_parent(ptr);

    // The carcass goes back only after the parent has been notified, and
    // with the parent link severed: recycled storage must never alias a unit
    // whose completion is still in flight, and the shutdown drain must not
    // re-notify through a finished job's stale link.
    cell.header.parent.set(None);
    context::handle(|handle| handle.recycle(ptr));
}

unsafe fn store_value(_ptr: NonNull<Header>, _value: *mut ()) {
    unreachable!("plain jobs have no return slot");
}

fn output_type() -> TypeId {
    TypeId::of::<()>()
}

/// Shutdown drain: the job is released without running. A pending
/// continuation is reachable only through this cell, so it is released here
/// as well. The parent is still notified so that units suspended on this
/// subtree become queue-reachable and get swept by the same drain.
unsafe fn shutdown(ptr: NonNull<Header>) {
    let cell = JobCell::from_header(ptr);
    drop((*cell.callable.get()).take());
    if let Some(continuation) = cell.continuation.take() {
        (continuation.as_ref().vtable.shutdown)(continuation);
    }
    notify_parent(ptr);
    dealloc(ptr);
}

unsafe fn dealloc(ptr: NonNull<Header>) {
    let resource = ptr.as_ref().alloc;
    alloc::dealloc_cell(resource, ptr.cast::<JobCell>());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SYSTEM_ALLOC;
    use crate::job::header::{ANY_WORKER, UnitState};

    fn free(unit: NonNull<Header>) {
        unsafe { (unit.as_ref().vtable.dealloc)(unit) };
    }

    #[test]
    fn recycled_cell_is_indistinguishable_from_fresh() {
        let fresh = JobCell::allocate(&SYSTEM_ALLOC);

        let used = JobCell::allocate(&SYSTEM_ALLOC);
        unsafe {
            JobCell::prepare(used, Box::new(|| {}), 3, Some(fresh));
            // Scribble the traces a completed run leaves behind.
            used.as_ref().children.store(7, Ordering::Relaxed);
            used.as_ref().set_state(UnitState::RETURNED);

            JobCell::prepare(used, Box::new(|| {}), ANY_WORKER, None);
        }

        let fresh_header = unsafe { fresh.as_ref() }.snapshot();
        let reused_header = unsafe { used.as_ref() }.snapshot();
        assert_eq!(fresh_header, reused_header);

        free(fresh);
        free(used);
    }

    #[test]
    fn shutdown_releases_a_pending_continuation() {
        let job = JobCell::allocate(&SYSTEM_ALLOC);
        let continuation = JobCell::allocate(&SYSTEM_ALLOC);
        unsafe {
            JobCell::prepare(job, Box::new(|| {}), ANY_WORKER, None);
            JobCell::prepare(continuation, Box::new(|| {}), ANY_WORKER, None);
            JobCell::set_continuation(job, continuation);

            // Both cells are freed; under an asserting allocator (see the
            // scheduler shutdown test) a leak here would be caught.
            (job.as_ref().vtable.shutdown)(job);
        }
    }
}
