use crate::job::header::Header;
use std::ptr::{self, NonNull};
use std::sync::atomic::{
    AtomicPtr,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

/// A lock-free intrusive stack of schedulable units.
///
/// One type backs all three queue roles: the per-worker local queues (many
/// producers, one consumer, popped oldest-first), the shared central queue,
/// and the recycle queue of plain-job carcasses (many producers and
/// consumers, popped LIFO).
///
/// Units link through their embedded `next` pointer and belong to at most
/// one queue at a time. A unit re-enters a queue only after it has been
/// popped and fully reset, so the head CAS can never observe a stale `next`
/// pointer on a republished node; implementations touching the recycle path
/// must keep that property intact.
#[derive(Debug)]
pub(crate) struct UnitQueue {
    head: AtomicPtr<Header>,
}

impl UnitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Relaxed).is_null()
    }

    /// Publishes `unit` at the head.
    pub(crate) fn push(&self, unit: NonNull<Header>) {
        let node = unit.as_ptr();
        let mut head = self.head.load(Relaxed);
        loop {
            unsafe { (*node).next.store(head, Relaxed) };
            match self.head.compare_exchange_weak(head, node, Release, Relaxed) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the most recently pushed unit. Safe for concurrent consumers;
    /// under contention LIFO order is not strict and callers tolerate that.
    pub(crate) fn pop(&self) -> Option<NonNull<Header>> {
        let mut head = self.head.load(Relaxed);
        loop {
            let node = NonNull::new(head)?;
            let next = unsafe { node.as_ref().next.load(Acquire) };
            match self.head.compare_exchange_weak(head, next, AcqRel, Relaxed) {
                Ok(_) => {
                    unsafe { node.as_ref().next.store(ptr::null_mut(), Relaxed) };
                    return Some(node);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the oldest unit by walking to the tail.
    ///
    /// Only the owning worker may call this. Producers extend the list at
    /// the head side only, so the walk is race-free except for the lone-node
    /// case, where the unlink goes through the head pointer and a failed CAS
    /// means a producer got in first and the walk restarts.
    pub(crate) fn pop_oldest(&self) -> Option<NonNull<Header>> {
        loop {
            let head = NonNull::new(self.head.load(Acquire))?;

            let mut prev: Option<NonNull<Header>> = None;
            let mut tail = head;
            while let Some(next) = NonNull::new(unsafe { tail.as_ref().next.load(Acquire) }) {
                prev = Some(tail);
                tail = next;
            }

            match prev {
                Some(prev) => {
                    unsafe { prev.as_ref().next.store(ptr::null_mut(), Release) };
                    return Some(tail);
                }
                None => {
                    if self
                        .head
                        .compare_exchange(tail.as_ptr(), ptr::null_mut(), AcqRel, Relaxed)
                        .is_ok()
                    {
                        return Some(tail);
                    }
                }
            }
        }
    }

    /// Takes the whole list in one swap. Single-threaded shutdown sweep.
    pub(crate) fn drain(&self) -> Drain {
        Drain {
            next: NonNull::new(self.head.swap(ptr::null_mut(), AcqRel)),
        }
    }
}

pub(crate) struct Drain {
    next: Option<NonNull<Header>>,
}

impl Iterator for Drain {
    type Item = NonNull<Header>;

    fn next(&mut self) -> Option<NonNull<Header>> {
        let node = self.next.take()?;
        unsafe {
            self.next = NonNull::new(node.as_ref().next.load(Relaxed));
            node.as_ref().next.store(ptr::null_mut(), Relaxed);
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SYSTEM_ALLOC;
    use crate::job::plain::JobCell;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    fn unit() -> NonNull<Header> {
        JobCell::allocate(&SYSTEM_ALLOC)
    }

    fn free(unit: NonNull<Header>) {
        unsafe { (unit.as_ref().vtable.dealloc)(unit) };
    }

    #[test]
    fn lifo_pop_reverses_push_order() {
        let queue = UnitQueue::new();
        let units: Vec<_> = (0..3).map(|_| unit()).collect();
        for u in &units {
            queue.push(*u);
        }

        let mut popped = Vec::new();
        while let Some(u) = queue.pop() {
            popped.push(u);
        }

        assert!(queue.is_empty());
        assert_eq!(popped, units.iter().rev().copied().collect::<Vec<_>>());
        for u in popped {
            free(u);
        }
    }

    #[test]
    fn pop_oldest_is_fifo() {
        let queue = UnitQueue::new();
        let units: Vec<_> = (0..5).map(|_| unit()).collect();
        for u in &units {
            queue.push(*u);
        }

        let mut popped = Vec::new();
        while let Some(u) = queue.pop_oldest() {
            popped.push(u);
        }

        assert_eq!(popped, units);
        for u in popped {
            free(u);
        }
    }

    #[test]
    fn push_pop_preserves_the_multiset() {
        let queue = Arc::new(UnitQueue::new());
        let producers = 4;
        let per_producer = 250;

        let mut expected = BTreeSet::new();
        let mut batches = Vec::new();
        for _ in 0..producers {
            let batch: Vec<usize> = (0..per_producer)
                .map(|_| {
                    let u = unit();
                    expected.insert(u.as_ptr() as usize);
                    u.as_ptr() as usize
                })
                .collect();
            batches.push(batch);
        }

        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for addr in batch {
                        let ptr = NonNull::new(addr as *mut Header).unwrap();
                        queue.push(ptr);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut popped = BTreeSet::new();
        while let Some(u) = queue.pop() {
            popped.insert(u.as_ptr() as usize);
        }

        assert_eq!(popped, expected);
        for addr in popped {
            free(NonNull::new(addr as *mut Header).unwrap());
        }
    }

    #[test]
    fn drain_sweeps_everything() {
        let queue = UnitQueue::new();
        let units: Vec<_> = (0..10).map(|_| unit()).collect();
        for u in &units {
            queue.push(*u);
        }

        let drained: Vec<_> = queue.drain().collect();
        assert_eq!(drained.len(), units.len());
        assert!(queue.is_empty());
        for u in drained {
            free(u);
        }
    }
}
