use crate::alloc::{SYSTEM_ALLOC, UnitAlloc};
use crate::context;
use crate::job::header::ANY_WORKER;
use crate::job::{Coro, JobFn};
use crate::runtime::scheduler::{Handle, Scheduler};
use crate::runtime::{pool, worker};
use crate::utils::thread as thread_name;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Empty passes through both queues before an idle worker naps.
const SPIN_TICKS: u32 = 20;

/// How long an idle worker naps. Worker 0 never sleeps.
const IDLE_SLEEP: Duration = Duration::from_micros(1);

/// Names worker threads by index.
#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync>);

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|index| format!("stampede-{index}")))
}

/// Configures and starts a [`JobSystem`].
pub struct Builder {
    /// Defaults to one worker per CPU core.
    worker_threads: Option<usize>,

    /// When set, index 0 is served by the embedding thread.
    reserve_entry_worker: bool,

    thread_name: ThreadNameFn,

    thread_stack_size: Option<usize>,

    spin_ticks: u32,

    idle_sleep: Duration,

    allocator: &'static dyn UnitAlloc,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            reserve_entry_worker: false,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            spin_ticks: SPIN_TICKS,
            idle_sleep: IDLE_SLEEP,
            allocator: &SYSTEM_ALLOC,
        }
    }

    /// Sets the total number of workers, including a reserved entry worker.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Builder {
        assert!(val > 0, "worker_threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Reserves index 0 for the embedding thread, which must then call
    /// [`JobSystem::run_entry_worker`]. Until it does, the spawned workers
    /// wait at the startup barrier.
    pub fn reserve_entry_worker(mut self) -> Builder {
        self.reserve_entry_worker = true;
        self
    }

    /// Sets the prefix for worker thread names. The default yields
    /// `stampede-{index}`.
    pub fn thread_name(mut self, val: impl Into<String>) -> Builder {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |index| format!("{val}-{index}")));
        self
    }

    /// Sets a function used to name worker threads from their index.
    pub fn thread_name_fn<F>(mut self, f: F) -> Builder
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for pool-spawned worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Builder {
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets how many empty queue passes a worker makes before napping.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    #[track_caller]
    pub fn spin_ticks(mut self, val: u32) -> Builder {
        assert!(val > 0, "spin_ticks cannot be set to 0");
        self.spin_ticks = val;
        self
    }

    /// Sets how long an idle worker naps between passes.
    pub fn idle_sleep(mut self, val: Duration) -> Builder {
        self.idle_sleep = val;
        self
    }

    /// Sets the memory resource for scheduler-allocated unit cells.
    pub fn allocator(mut self, val: &'static dyn UnitAlloc) -> Builder {
        self.allocator = val;
        self
    }

    /// Builds the pool and spawns its workers. The returned system is ready
    /// to accept submissions.
    pub fn try_build(self) -> Result<JobSystem> {
        let cfg: Config = self.try_into()?;
        tracing::debug!(workers = cfg.worker_threads, start_index = cfg.start_index, "starting job system");

        let handle = Scheduler::new(cfg).into_handle();
        pool::spawn_workers(&handle)?;
        Ok(JobSystem { handle })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("worker_threads", &self.worker_threads)
            .field("reserve_entry_worker", &self.reserve_entry_worker)
            .field("spin_ticks", &self.spin_ticks)
            .field("idle_sleep", &self.idle_sleep)
            .finish_non_exhaustive()
    }
}

/// Builder output injected into the scheduler and read by every worker.
#[derive(Clone)]
pub(crate) struct Config {
    pub(crate) worker_threads: usize,

    /// 0 when the pool spawns every worker; 1 when the embedding thread
    /// serves as worker 0.
    pub(crate) start_index: usize,

    pub(crate) thread_name: ThreadNameFn,

    pub(crate) thread_stack_size: Option<usize>,

    pub(crate) spin_ticks: u32,

    pub(crate) idle_sleep: Duration,

    pub(crate) allocator: &'static dyn UnitAlloc,
}

impl TryFrom<Builder> for Config {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Config> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        Ok(Config {
            worker_threads,
            start_index: usize::from(builder.reserve_entry_worker),
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            spin_ticks: builder.spin_ticks,
            idle_sleep: builder.idle_sleep,
            allocator: builder.allocator,
        })
    }
}

/// The job system façade: a fixed pool of workers fed by per-worker local
/// queues and a shared central queue.
///
/// Plain jobs go in through the `submit` family; coroutines through
/// [`JobSystem::spawn`]. Work submitted from inside a running unit makes
/// that unit the parent, and the parent is not finished until the whole
/// subtree is.
pub struct JobSystem {
    pub(crate) handle: Handle,
}

impl JobSystem {
    /// Submits `f` as a plain job on any worker.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.submit(Box::new(f), ANY_WORKER);
    }

    /// Submits `f` pinned to `worker`'s local queue. An index outside the
    /// pool falls back to the central queue.
    pub fn submit_on<F>(&self, worker: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.submit(Box::new(f), worker as i32);
    }

    /// Submits `f` with a continuation that begins strictly after `f`'s
    /// entire descendant subtree has finished.
    pub fn submit_then<F, G>(&self, f: F, continuation: G)
    where
        F: FnOnce() + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.handle
            .submit_then(Box::new(f), Box::new(continuation), ANY_WORKER);
    }

    /// Submits a batch of callables on any worker.
    pub fn submit_batch<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = JobFn>,
    {
        self.handle
            .submit_batch(jobs.into_iter().map(|JobFn(c)| c), ANY_WORKER);
    }

    /// Submits a batch of callables pinned to `worker`.
    pub fn submit_batch_on<I>(&self, worker: usize, jobs: I)
    where
        I: IntoIterator<Item = JobFn>,
    {
        self.handle
            .submit_batch(jobs.into_iter().map(|JobFn(c)| c), worker as i32);
    }

    /// Schedules a coroutine. The implicit parent (the unit running on the
    /// submitting worker, if any) waits for it like any other child. The
    /// handle stays with the caller for reading the result.
    pub fn spawn<T: Send + 'static>(&self, coro: &Coro<T>) {
        if self.handle.is_terminated() {
            tracing::warn!("coroutine scheduled after terminate; dropping");
            return;
        }
        let raw = coro.raw();
        if let Some(parent) = context::current_unit() {
            unsafe { parent.as_ref() }
                .children
                .fetch_add(1, Ordering::Relaxed);
            unsafe { raw.as_ref() }.parent.set(Some(parent));
        }
        self.handle.submit_promise(raw);
    }

    /// Schedules a batch of coroutines. The implicit parent's child counter
    /// is topped up by the whole batch before any coroutine is pushed.
    pub fn spawn_batch<T: Send + 'static>(&self, coros: &[Coro<T>]) {
        if self.handle.is_terminated() {
            tracing::warn!("coroutines scheduled after terminate; dropping");
            return;
        }
        let parent = context::current_unit();
        if let Some(parent) = parent {
            unsafe { parent.as_ref() }
                .children
                .fetch_add(coros.len() as i32, Ordering::Relaxed);
        }
        for coro in coros {
            let raw = coro.raw();
            unsafe { raw.as_ref() }.parent.set(parent);
            self.handle.submit_promise(raw);
        }
    }

    /// Serves as worker 0 on the calling thread until termination. Requires
    /// [`Builder::reserve_entry_worker`].
    pub fn run_entry_worker(&self) -> Result<()> {
        if self.handle.cfg.start_index != 1 {
            return Err(anyhow!(
                "entry worker not reserved; use Builder::reserve_entry_worker"
            ));
        }
        if context::current_worker().is_some() {
            return Err(anyhow!("this thread already serves as a pool worker"));
        }

        // Pool threads are named through thread::Builder; the embedding
        // thread only gets the pthread route.
        thread_name::set_current_thread_name(&(self.handle.cfg.thread_name.0)(0));
        context::init_worker_context(0, self.handle.clone());
        worker::run(self.handle.clone(), 0);
        Ok(())
    }

    /// Raises the terminate flag: in-flight units finish naturally, queued
    /// units are drained without execution by the last worker to exit.
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    /// Blocks until every pool-spawned worker has exited. Does not itself
    /// terminate; pair with [`JobSystem::terminate`] or use
    /// [`JobSystem::shutdown`].
    pub fn wait_for_termination(&self) -> Result<()> {
        pool::join_all(&self.handle)
    }

    /// Terminates and waits.
    pub fn shutdown(&self) -> Result<()> {
        self.terminate();
        self.wait_for_termination()
    }

    pub fn worker_count(&self) -> usize {
        self.handle.cfg.worker_threads
    }
}

impl fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("workers", &self.worker_count())
            .field("terminated", &self.handle.is_terminated())
            .finish()
    }
}
