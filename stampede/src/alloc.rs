use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Pluggable memory resource for unit storage.
///
/// Implementations hand out raw blocks for job and promise cells. A pointer
/// to the resource travels with every cell, so deallocation never needs a
/// global registry lookup.
///
/// Allocation failure is fatal to the process; there is no meaningful
/// recovery inside a scheduler core.
pub trait UnitAlloc: Send + Sync + 'static {
    /// Allocates `layout.size()` bytes at `layout.align()` alignment.
    ///
    /// Returning null means exhaustion; the caller aborts.
    ///
    /// # Safety
    ///
    /// `layout` must have non-zero size.
    unsafe fn allocate(&self, layout: Layout) -> *mut u8;

    /// Releases a block previously returned by [`UnitAlloc::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this same resource with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout);
}

/// The process allocator, used wherever nothing else is configured.
#[derive(Debug, Default)]
pub struct SystemAlloc;

/// Shared instance handed to cells when no override is given.
pub static SYSTEM_ALLOC: SystemAlloc = SystemAlloc;

impl UnitAlloc for SystemAlloc {
    unsafe fn allocate(&self, layout: Layout) -> *mut u8 {
        unsafe { alloc(layout) }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        unsafe { dealloc(ptr, layout) }
    }
}

/// Moves `value` into a block from `resource`. Aborts on exhaustion.
pub(crate) fn alloc_cell<T>(resource: &'static dyn UnitAlloc, value: T) -> NonNull<T> {
    let layout = Layout::new::<T>();
    let ptr = unsafe { resource.allocate(layout) }.cast::<T>();
    let Some(ptr) = NonNull::new(ptr) else {
        handle_alloc_error(layout);
    };
    unsafe { ptr.as_ptr().write(value) };
    ptr
}

/// Drops the cell in place and returns its block to `resource`.
///
/// # Safety
///
/// `ptr` must have come from [`alloc_cell`] with the same `T` and `resource`,
/// and no reference to the cell may outlive this call.
pub(crate) unsafe fn dealloc_cell<T>(resource: &'static dyn UnitAlloc, ptr: NonNull<T>) {
    unsafe {
        ptr.as_ptr().drop_in_place();
        resource.deallocate(ptr.as_ptr().cast(), Layout::new::<T>());
    }
}
