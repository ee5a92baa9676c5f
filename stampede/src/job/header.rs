#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::UnitAlloc;
use bitflags::bitflags;
use std::any::TypeId;
use std::cell::Cell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicU32, Ordering};

/// Preferred-worker sentinel: run wherever a worker picks the unit up.
pub(crate) const ANY_WORKER: i32 = -1;

bitflags! {
    /// Unit state observable across threads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct UnitState: u8 {
        /// Suspended by `yield_value`; the worker must not requeue it.
        const YIELDED = 1;
        /// The coroutine body has returned; the next resume finalizes.
        const RETURNED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    PlainJob,
    Promise,
}

/// Table of function pointers shared by every unit of one concrete type.
/// For coroutine promises there is one instance per body type, which makes
/// it the promise-typed deallocator of the design.
pub(crate) struct Vtable {
    /// Runs or resumes the unit on the current worker.
    pub(crate) run: unsafe fn(NonNull<Header>),

    /// One child subtree finished: decrement `children` and fire the
    /// completion edge when the count reaches zero.
    pub(crate) child_finished: unsafe fn(NonNull<Header>),

    /// Writes a yielded value into the unit's return slot. `value` points at
    /// an `Option<T>` whose `T` matches `output_type`.
    pub(crate) store_value: unsafe fn(NonNull<Header>, *mut ()),

    /// Shutdown drain: destroy the payload without running it and release
    /// scheduler custody.
    pub(crate) shutdown: unsafe fn(NonNull<Header>),

    /// Releases the cell's storage.
    pub(crate) dealloc: unsafe fn(NonNull<Header>),

    /// Witness for the value type accepted by `store_value`.
    pub(crate) output_type: fn() -> TypeId,

    pub(crate) kind: Kind,
}

/// Hot per-unit data. Every cell starts with a `Header` so the scheduler can
/// treat plain jobs and coroutine promises through one thin pointer.
///
/// The `Cell` fields are written only by the thread that currently owns the
/// unit (the submitting thread before the first schedule, the running worker
/// afterwards), which is what makes the unchecked `Send`/`Sync` sound.
#[repr(C)]
pub(crate) struct Header {
    /// Intrusive link; owned by whichever queue currently holds the unit.
    pub(crate) next: AtomicPtr<Header>,

    /// Pending descendants, plus one self credit while the unit runs.
    /// Reaching zero is the edge that fires parent notification.
    pub(crate) children: AtomicI32,

    /// Owners of the cell storage: the scheduler while it has custody, plus
    /// the external handle for coroutine promises. Plain jobs stay at one.
    refs: AtomicU32,

    state: AtomicU8,

    /// Preferred worker index, [`ANY_WORKER`] when unpinned.
    pub(crate) worker: Cell<i32>,

    /// Non-owning back-reference; the parent outlives the child by the
    /// structured-concurrency invariant. Never mutated after the unit has
    /// been scheduled.
    pub(crate) parent: Cell<Option<NonNull<Header>>>,

    pub(crate) vtable: &'static Vtable,

    /// The resource that allocated this cell; deallocation goes back to it.
    pub(crate) alloc: &'static dyn UnitAlloc,
}

unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub(crate) fn new(vtable: &'static Vtable, alloc: &'static dyn UnitAlloc) -> Header {
        Header {
            next: AtomicPtr::new(ptr::null_mut()),
            children: AtomicI32::new(0),
            refs: AtomicU32::new(1),
            state: AtomicU8::new(0),
            worker: Cell::new(ANY_WORKER),
            parent: Cell::new(None),
            vtable,
            alloc,
        }
    }

    pub(crate) fn state(&self) -> UnitState {
        UnitState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, bits: UnitState) {
        self.state.fetch_or(bits.bits(), Ordering::Release);
    }

    pub(crate) fn clear_state(&self, bits: UnitState) {
        self.state.fetch_and(!bits.bits(), Ordering::Release);
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the header to its freshly-constructed state so a recycled
    /// cell is indistinguishable from a new one.
    pub(crate) fn reset(&self) {
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
        self.children.store(0, Ordering::Relaxed);
        self.refs.store(1, Ordering::Relaxed);
        self.state.store(0, Ordering::Relaxed);
        self.worker.set(ANY_WORKER);
        self.parent.set(None);
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (bool, i32, u32, u8, i32, bool) {
        (
            self.next.load(Ordering::Relaxed).is_null(),
            self.children.load(Ordering::Relaxed),
            self.refs.load(Ordering::Relaxed),
            self.state.load(Ordering::Relaxed),
            self.worker.get(),
            self.parent.get().is_some(),
        )
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.vtable.kind)
            .field("children", &self.children.load(Ordering::Relaxed))
            .field("worker", &self.worker.get())
            .field("state", &self.state())
            .finish()
    }
}

/// Drops one storage reference, freeing the cell when it was the last.
///
/// # Safety
///
/// The caller must hold one of the counted references.
pub(crate) unsafe fn unit_ref_dec(ptr: NonNull<Header>) {
    let header = ptr.as_ref();
    if header.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        (header.vtable.dealloc)(ptr);
    }
}

/// Notifies the parent, if any, that one child subtree has fully finished.
///
/// # Safety
///
/// `ptr` must be a live unit whose parent link, if set, points at a live
/// unit (the structured-concurrency invariant).
pub(crate) unsafe fn notify_parent(ptr: NonNull<Header>) {
    if let Some(parent) = ptr.as_ref().parent.get() {
        (parent.as_ref().vtable.child_finished)(parent);
    }
}
