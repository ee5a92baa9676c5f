use crate::alloc::{SYSTEM_ALLOC, UnitAlloc};
use crate::job::header::{Header, UnitState, unit_ref_dec};
use crate::job::promise::PromiseCell;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

/// The value cell shared between a coroutine promise and its handle.
///
/// Both sides hold an `Arc`; whichever drops last releases the storage, so
/// the value stays readable after the coroutine frame itself is gone.
pub(crate) struct ReturnSlot<T>(Mutex<Option<T>>);

impl<T> ReturnSlot<T> {
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub(crate) fn put(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    pub(crate) fn clear(&self) {
        *self.0.lock() = None;
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().take()
    }

    pub(crate) fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.0.lock().clone()
    }
}

/// Handle to a structured coroutine: how the outside world schedules the
/// coroutine and reads the value it returns or yields.
///
/// The coroutine starts suspended; nothing runs until it is scheduled with
/// [`JobSystem::spawn`] or awaited as a child with [`join`]. Dropping the
/// handle detaches the coroutine: a scheduled body keeps running, and the
/// cell is freed once the scheduler is done with it.
///
/// [`JobSystem::spawn`]: crate::JobSystem::spawn
/// [`join`]: crate::join
pub struct Coro<T> {
    raw: NonNull<Header>,
    slot: Arc<ReturnSlot<T>>,
    _p: PhantomData<T>,
}

unsafe impl<T: Send> Send for Coro<T> {}
unsafe impl<T: Send> Sync for Coro<T> {}

impl<T: Send + 'static> Coro<T> {
    /// Wraps `body` as a schedulable coroutine.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::new_in(body, &SYSTEM_ALLOC)
    }

    /// Like [`Coro::new`], with the promise cell allocated from `resource`.
    pub fn new_in<F>(body: F, resource: &'static dyn UnitAlloc) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let slot = Arc::new(ReturnSlot::new());
        let raw = PromiseCell::allocate(body, slot.clone(), resource);
        Coro {
            raw,
            slot,
            _p: PhantomData,
        }
    }
}

impl<T> Coro<T> {
    /// Pins the coroutine to `worker`'s local queue before it is scheduled.
    /// An index outside the pool falls back to the central queue.
    pub fn pin_to(self, worker: usize) -> Self {
        unsafe { self.raw.as_ref() }.worker.set(worker as i32);
        self
    }

    /// Clones the current value out of the shared slot, if the coroutine has
    /// returned or yielded one.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.get()
    }

    /// Takes the current value out of the shared slot.
    pub fn take(&self) -> Option<T> {
        self.slot.take()
    }

    /// True once the coroutine body has returned.
    pub fn is_finished(&self) -> bool {
        unsafe { self.raw.as_ref() }
            .state()
            .contains(UnitState::RETURNED)
    }

    pub(crate) fn raw(&self) -> NonNull<Header> {
        self.raw
    }
}

impl<T> Drop for Coro<T> {
    fn drop(&mut self) {
        unsafe { unit_ref_dec(self.raw) };
    }
}

impl<T> fmt::Debug for Coro<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coro")
            .field("finished", &self.is_finished())
            .finish()
    }
}
