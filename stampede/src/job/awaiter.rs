use crate::context;
use crate::job::coro::Coro;
use crate::job::header::{ANY_WORKER, Header, UnitState};
use crate::job::plain::Callable;
use std::any::TypeId;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// A callable wrapped for scheduling in awaited vectors and tuples, and in
/// [`JobSystem::submit_batch`].
///
/// [`JobSystem::submit_batch`]: crate::JobSystem::submit_batch
pub struct JobFn(pub(crate) Callable);

/// Wraps a callable so it can be fanned out alongside coroutines.
pub fn job<F: FnOnce() + Send + 'static>(f: F) -> JobFn {
    JobFn(Box::new(f))
}

/// A shape of children that one [`join`] can fan out: a single coroutine, a
/// vector of coroutines or callables, or a tuple of such vectors.
pub trait ChildGroup {
    /// What the awaiting parent sees once every child has finished.
    type Output;

    /// Number of children that will be scheduled.
    fn count(&self) -> usize;

    /// Links every child to `parent` and schedules it. The caller has
    /// already added `count()` to the parent's child counter.
    fn schedule(&mut self, parent: NonNull<Header>);

    /// Produces the result after all children have completed.
    fn finish(self) -> Self::Output;
}

impl<'a, T: Send + 'static> ChildGroup for &'a Coro<T> {
    type Output = T;

    fn count(&self) -> usize {
        1
    }

    fn schedule(&mut self, parent: NonNull<Header>) {
        let raw = self.raw();
        unsafe { raw.as_ref() }.parent.set(Some(parent));
        context::handle(|handle| handle.submit_promise(raw));
    }

    fn finish(self) -> T {
        self.take()
            .expect("child coroutine resumed its parent without a value")
    }
}

impl<T: Send + 'static> ChildGroup for Coro<T> {
    type Output = T;

    fn count(&self) -> usize {
        1
    }

    fn schedule(&mut self, parent: NonNull<Header>) {
        <&Coro<T> as ChildGroup>::schedule(&mut &*self, parent);
    }

    fn finish(self) -> T {
        self.take()
            .expect("child coroutine resumed its parent without a value")
    }
}

impl<'a, T: Send + 'static> ChildGroup for &'a Vec<Coro<T>> {
    type Output = ();

    fn count(&self) -> usize {
        self.len()
    }

    fn schedule(&mut self, parent: NonNull<Header>) {
        context::handle(|handle| {
            for coro in self.iter() {
                let raw = coro.raw();
                unsafe { raw.as_ref() }.parent.set(Some(parent));
                handle.submit_promise(raw);
            }
        });
    }

    fn finish(self) {}
}

impl<T: Send + 'static> ChildGroup for Vec<Coro<T>> {
    type Output = ();

    fn count(&self) -> usize {
        self.len()
    }

    fn schedule(&mut self, parent: NonNull<Header>) {
        <&Vec<Coro<T>> as ChildGroup>::schedule(&mut &*self, parent);
    }

    fn finish(self) {}
}

impl ChildGroup for Vec<JobFn> {
    type Output = ();

    fn count(&self) -> usize {
        self.len()
    }

    fn schedule(&mut self, parent: NonNull<Header>) {
        context::handle(|handle| {
            for JobFn(callable) in self.drain(..) {
                let unit = handle.new_job(callable, ANY_WORKER, Some(parent));
                handle.schedule(unit);
            }
        });
    }

    fn finish(self) {}
}

macro_rules! impl_child_group_for_tuple {
    ($($member:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($member: ChildGroup),+> ChildGroup for ($($member,)+) {
            type Output = ();

            fn count(&self) -> usize {
                let ($($member,)+) = self;
                0 $(+ $member.count())+
            }

            fn schedule(&mut self, parent: NonNull<Header>) {
                let ($($member,)+) = self;
                $($member.schedule(parent);)+
            }

            fn finish(self) {
                let ($($member,)+) = self;
                $(drop($member.finish());)+
            }
        }
    };
}

impl_child_group_for_tuple!(A, B);
impl_child_group_for_tuple!(A, B, C);
impl_child_group_for_tuple!(A, B, C, D);

/// Future returned by [`join`].
pub struct Join<G: ChildGroup> {
    group: Option<G>,
    scheduled: bool,
}

impl<G: ChildGroup> Unpin for Join<G> {}

/// Awaits a group of children from inside a coroutine.
///
/// The parent's child counter is topped up by the whole group in one step
/// before any child is scheduled, so an early finisher in one vector cannot
/// resume the parent while later vectors are still being fanned out. An
/// empty group completes inline without suspending.
///
/// A single `&Coro<T>` or `Coro<T>` produces the child's value; vectors and
/// tuples produce `()`.
pub fn join<G: ChildGroup>(group: G) -> Join<G> {
    Join {
        group: Some(group),
        scheduled: false,
    }
}

impl<G: ChildGroup> Future for Join<G> {
    type Output = G::Output;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<G::Output> {
        let this = self.get_mut();

        if this.scheduled {
            let group = this.group.take().expect("join polled after completion");
            return Poll::Ready(group.finish());
        }

        let mut group = this.group.take().expect("join polled after completion");
        let count = group.count();
        if count == 0 {
            return Poll::Ready(group.finish());
        }

        let parent = context::current_unit()
            .expect("join must be awaited from inside the job system");
        unsafe { parent.as_ref() }
            .children
            .fetch_add(count as i32, Ordering::Relaxed);
        group.schedule(parent);

        this.group = Some(group);
        this.scheduled = true;
        Poll::Pending
    }
}

/// Future returned by [`resume_on`].
pub struct ResumeOn {
    worker: usize,
    rescheduled: bool,
}

/// Migrates the current coroutine to `worker`'s local queue.
///
/// Completes inline when already running there; otherwise the code after the
/// await runs on that worker, with no guarantee of when.
pub fn resume_on(worker: usize) -> ResumeOn {
    ResumeOn {
        worker,
        rescheduled: false,
    }
}

impl Future for ResumeOn {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.rescheduled {
            return Poll::Ready(());
        }

        let current = context::current_worker_index()
            .expect("resume_on must be awaited from inside the job system");
        if current == self.worker {
            return Poll::Ready(());
        }

        let unit = context::current_unit()
            .expect("resume_on must be awaited from inside a scheduled unit");
        unsafe { unit.as_ref() }.worker.set(self.worker as i32);
        self.rescheduled = true;
        // The worker loop requeues the promise once the frame is suspended.
        Poll::Pending
    }
}

/// Future returned by [`yield_value`].
pub struct YieldValue<T: Send + 'static> {
    value: Option<T>,
    suspended: bool,
}

impl<T: Send + 'static> Unpin for YieldValue<T> {}

/// Publishes `value` to the current coroutine's shared slot and suspends
/// until the parent awaits the coroutine again.
///
/// The parent sees exactly one completion notification per yield: a
/// plain-job parent gets one `children` decrement, a coroutine parent is
/// rescheduled when the decrement reaches zero.
///
/// # Panics
///
/// Panics when `T` is not the awaiting coroutine's return type.
pub fn yield_value<T: Send + 'static>(value: T) -> YieldValue<T> {
    YieldValue {
        value: Some(value),
        suspended: false,
    }
}

impl<T: Send + 'static> Future for YieldValue<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.suspended {
            return Poll::Ready(());
        }

        let unit = context::current_unit()
            .expect("yield_value must be awaited from inside the job system");
        let header = unsafe { unit.as_ref() };
        assert_eq!(
            (header.vtable.output_type)(),
            TypeId::of::<T>(),
            "yield_value type does not match the coroutine's return type",
        );

        let mut value = this.value.take();
        unsafe {
            (header.vtable.store_value)(unit, (&mut value) as *mut Option<T> as *mut ());
        }
        header.set_state(UnitState::YIELDED);
        this.suspended = true;
        // Parent notification happens in the worker loop after the frame has
        // suspended; resuming the parent here could hand it a child that is
        // still mid-poll on this stack.
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_join_is_ready_without_a_worker() {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        let mut empty = join(Vec::<JobFn>::new());
        assert!(Pin::new(&mut empty).poll(&mut cx).is_ready());

        let mut empty_tuple = join((Vec::<JobFn>::new(), Vec::<JobFn>::new()));
        assert!(Pin::new(&mut empty_tuple).poll(&mut cx).is_ready());
    }
}
