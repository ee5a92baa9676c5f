use crate::context;
use crate::job::header::Header;
use crate::job::plain::{Callable, JobCell};
use crate::queue::UnitQueue;
use crate::runtime::runtime::Config;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Stack-first capacity for batch submission buffers.
pub(crate) const BATCH_SPILL_THRESHOLD: usize = 16;

pub(crate) struct Scheduler {
    pub(crate) cfg: Config,

    /// One queue per worker, popped oldest-first by its owner only.
    locals: Box<[UnitQueue]>,

    /// Shared fallback queue; any worker may pop.
    central: UnitQueue,

    /// Finished plain-job carcasses waiting for reuse.
    recycle: UnitQueue,

    /// Raised once by `terminate`; workers observe it between units.
    terminate: AtomicBool,

    /// Workers that have not yet left their loop. Whoever decrements this to
    /// zero performs the shutdown drain.
    pub(super) active_workers: AtomicUsize,

    /// Every worker rendezvouses here before popping its first unit.
    pub(super) startup: Barrier,

    pub(super) join_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(cfg: Config) -> Scheduler {
        let locals: Box<[UnitQueue]> = (0..cfg.worker_threads).map(|_| UnitQueue::new()).collect();
        Scheduler {
            locals,
            central: UnitQueue::new(),
            recycle: UnitQueue::new(),
            terminate: AtomicBool::new(false),
            active_workers: AtomicUsize::new(cfg.worker_threads),
            startup: Barrier::new(cfg.worker_threads),
            join_handles: Mutex::new(Vec::new()),
            cfg,
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Raises the terminate flag. Queued units stop being popped; in-flight
    /// units finish naturally. Idempotent.
    pub(crate) fn terminate(&self) {
        if !self.terminate.swap(true, Ordering::AcqRel) {
            tracing::debug!("job system terminating");
        }
    }

    pub(super) fn local_queue(&self, index: usize) -> &UnitQueue {
        &self.locals[index]
    }

    pub(super) fn central_queue(&self) -> &UnitQueue {
        &self.central
    }

    /// Shutdown sweep run by the last worker to exit: every still-queued
    /// unit is released through its own deallocation policy without running.
    ///
    /// Releasing a unit still notifies its parent, which can requeue parents
    /// and continuations that were suspended outside any queue; the sweep
    /// repeats until the queues stop refilling so those are reclaimed too.
    pub(super) fn drain_all(&self) {
        let mut dropped = 0usize;
        loop {
            let mut swept = 0usize;
            for queue in self.locals.iter().chain([&self.central, &self.recycle]) {
                for unit in queue.drain() {
                    unsafe { (unit.as_ref().vtable.shutdown)(unit) };
                    swept += 1;
                }
            }
            if swept == 0 {
                break;
            }
            dropped += swept;
        }
        tracing::debug!(dropped, "drained queues at shutdown");
    }
}

/// Shared, cloneable reference to the scheduler: what workers, the façade,
/// and the worker-local context hold.
#[derive(Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Deref for Handle {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.0
    }
}

impl Handle {
    /// Routes a ready unit: pinned units go to their worker's local queue,
    /// everything else to the central queue.
    pub(crate) fn schedule(&self, unit: NonNull<Header>) {
        let worker = unsafe { unit.as_ref() }.worker.get();
        if (0..self.cfg.worker_threads as i32).contains(&worker) {
            self.locals[worker as usize].push(unit);
        } else {
            self.central.push(unit);
        }
    }

    /// Takes scheduler custody of a coroutine promise and routes it.
    pub(crate) fn submit_promise(&self, unit: NonNull<Header>) {
        if self.is_terminated() {
            tracing::warn!("coroutine scheduled after terminate; dropping");
            return;
        }
        unsafe { unit.as_ref() }.ref_inc();
        self.schedule(unit);
    }

    /// Pops a recycled carcass or allocates a fresh cell, and arms it.
    pub(crate) fn new_job(
        &self,
        callable: Callable,
        worker: i32,
        parent: Option<NonNull<Header>>,
    ) -> NonNull<Header> {
        let unit = self
            .recycle
            .pop()
            .unwrap_or_else(|| JobCell::allocate(self.cfg.allocator));
        unsafe { JobCell::prepare(unit, callable, worker, parent) };
        unit
    }

    /// Returns a finished carcass for reuse.
    pub(crate) fn recycle(&self, unit: NonNull<Header>) {
        self.recycle.push(unit);
    }

    /// Submits one callable. The implicit parent is the unit running on the
    /// submitting worker, if any.
    pub(crate) fn submit(&self, callable: Callable, worker: i32) {
        if self.is_terminated() {
            tracing::warn!("job submitted after terminate; dropping");
            return;
        }
        let parent = context::current_unit();
        if let Some(parent) = parent {
            unsafe { parent.as_ref() }
                .children
                .fetch_add(1, Ordering::Relaxed);
        }
        let unit = self.new_job(callable, worker, parent);
        self.schedule(unit);
    }

    /// Submits a callable with a continuation that runs once the callable's
    /// entire subtree has finished.
    pub(crate) fn submit_then(&self, callable: Callable, continuation: Callable, worker: i32) {
        if self.is_terminated() {
            tracing::warn!("job submitted after terminate; dropping");
            return;
        }
        let parent = context::current_unit();
        if let Some(parent) = parent {
            unsafe { parent.as_ref() }
                .children
                .fetch_add(1, Ordering::Relaxed);
        }
        let unit = self.new_job(callable, worker, parent);
        // The continuation is reparented when the job finishes; until then it
        // is reachable only through the job's cell.
        let continuation = self.new_job(continuation, crate::job::header::ANY_WORKER, None);
        unsafe { JobCell::set_continuation(unit, continuation) };
        self.schedule(unit);
    }

    /// Submits a batch. The parent's counter is topped up by the whole batch
    /// before any job is pushed, mirroring the awaiter fan-out rule.
    pub(crate) fn submit_batch(
        &self,
        callables: impl IntoIterator<Item = Callable>,
        worker: i32,
    ) {
        if self.is_terminated() {
            tracing::warn!("batch submitted after terminate; dropping");
            return;
        }
        let parent = context::current_unit();
        let units: SmallVec<[NonNull<Header>; BATCH_SPILL_THRESHOLD]> = callables
            .into_iter()
            .map(|callable| self.new_job(callable, worker, parent))
            .collect();
        if let Some(parent) = parent {
            unsafe { parent.as_ref() }
                .children
                .fetch_add(units.len() as i32, Ordering::Relaxed);
        }
        for unit in units {
            self.schedule(unit);
        }
    }
}
