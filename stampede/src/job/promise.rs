#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::{self, UnitAlloc};
use crate::context;
use crate::job::coro::ReturnSlot;
use crate::job::header::{Header, Kind, UnitState, Vtable, notify_parent, unit_ref_dec};
use std::any::TypeId;
use std::cell::UnsafeCell;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Either the coroutine body or nothing, once the body has been consumed.
enum Stage<F: Future> {
    Running(F),
    Consumed,
}

/// The cell behind one structured coroutine: the unit header, the stored
/// body, and a reference to the slot shared with the external [`Coro`]
/// handle. The body does not run until the promise is scheduled and a worker
/// resumes it.
///
/// `Header` must stay the first field; the scheduler holds thin
/// `NonNull<Header>` pointers into these cells.
///
/// [`Coro`]: crate::job::Coro
#[repr(C)]
pub(crate) struct PromiseCell<F: Future> {
    header: Header,
    stage: UnsafeCell<Stage<F>>,
    slot: Arc<ReturnSlot<F::Output>>,
}

impl<F> PromiseCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    pub(crate) fn allocate(
        body: F,
        slot: Arc<ReturnSlot<F::Output>>,
        resource: &'static dyn UnitAlloc,
    ) -> NonNull<Header> {
        let cell = PromiseCell {
            header: Header::new(vtable::<F>(), resource),
            stage: UnsafeCell::new(Stage::Running(body)),
            slot,
        };
        alloc::alloc_cell(resource, cell).cast()
    }

    unsafe fn from_header<'a>(ptr: NonNull<Header>) -> &'a Self {
        ptr.cast::<Self>().as_ref()
    }
}

/// One table per coroutine body type; the typed deallocator of the design.
fn vtable<F>() -> &'static Vtable
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    &Vtable {
        run: run::<F>,
        child_finished,
        store_value: store_value::<F>,
        shutdown: shutdown::<F>,
        dealloc: dealloc::<F>,
        output_type: output_type::<F>,
        kind: Kind::Promise,
    }
}

/// Resumes the coroutine. One self credit is held across the poll so that
/// children scheduled by an awaiter cannot observe a zero count and resume
/// this promise while its frame is still live on this worker's stack; for
/// the same reason, yield and completion hand-offs happen here, after `poll`
/// has returned, never inside an awaiter.
unsafe fn run<F>(ptr: NonNull<Header>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = PromiseCell::<F>::from_header(ptr);
    let header = &cell.header;

    if header.state().contains(UnitState::RETURNED) {
        // Rescheduled by the last of the children that were still pending
        // when the body returned.
        finalize(ptr);
        return;
    }

    header.children.store(1, Ordering::Relaxed);
    header.clear_state(UnitState::YIELDED);
    cell.slot.clear();

    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    let poll = {
        // Safety: the worker loop guarantees mutual exclusion, and the cell
        // is heap-allocated and never moves.
        let stage = &mut *cell.stage.get();
        match stage {
            Stage::Running(body) => Pin::new_unchecked(body).poll(&mut cx),
            Stage::Consumed => unreachable!("coroutine resumed after completion"),
        }
    };

    match poll {
        Poll::Ready(value) => {
            cell.slot.put(value);
            *cell.stage.get() = Stage::Consumed;
            header.set_state(UnitState::RETURNED);

            if header.children.fetch_sub(1, Ordering::AcqRel) == 1 {
                finalize(ptr);
            }
            // Otherwise children submitted from the body are still pending;
            // the last one reschedules this promise and the RETURNED branch
            // above finalizes, keeping the parent behind all descendants.
        }
        Poll::Pending => {
            let yielded = header.state().contains(UnitState::YIELDED);
            let prior = header.children.fetch_sub(1, Ordering::AcqRel);

            if yielded {
                // The frame is suspended now; hand the value to the parent
                // and drop scheduler custody until it resumes us.
                notify_parent(ptr);
                unit_ref_dec(ptr);
            } else if prior == 1 {
                // No pending children: either every child finished during
                // the poll, or this is a resume_on migration. Requeue for
                // the (possibly new) preferred worker.
                context::handle(|handle| handle.schedule(ptr));
            }
        }
    }
}

/// Completion: the value is in the slot and the frame is gone. Tell the
/// parent, drop scheduler custody.
unsafe fn finalize(ptr: NonNull<Header>) {
    notify_parent(ptr);
    unit_ref_dec(ptr);
}

unsafe fn child_finished(ptr: NonNull<Header>) {
    if ptr.as_ref().children.fetch_sub(1, Ordering::AcqRel) == 1 {
        context::handle(|handle| handle.schedule(ptr));
    }
}

/// Writes a yielded value. `value` points at an `Option<F::Output>` the
/// caller has already checked against `output_type`.
unsafe fn store_value<F>(ptr: NonNull<Header>, value: *mut ())
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = PromiseCell::<F>::from_header(ptr);
    let value = (*value.cast::<Option<F::Output>>())
        .take()
        .expect("yield handed over an empty value");
    cell.slot.put(value);
}

/// Shutdown drain: the frame is destroyed without running, and the parent is
/// notified so units suspended on this one become queue-reachable for the
/// same drain. The external handle, if still alive, keeps the slot readable
/// and frees the cell when it drops.
unsafe fn shutdown<F>(ptr: NonNull<Header>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = PromiseCell::<F>::from_header(ptr);
    *cell.stage.get() = Stage::Consumed;
    notify_parent(ptr);
    unit_ref_dec(ptr);
}

unsafe fn dealloc<F>(ptr: NonNull<Header>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let resource = ptr.as_ref().alloc;
    alloc::dealloc_cell(resource, ptr.cast::<PromiseCell<F>>());
}

fn output_type<F>() -> TypeId
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TypeId::of::<F::Output>()
}
