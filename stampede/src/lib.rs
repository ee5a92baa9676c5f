//! A job system for games and other latency-sensitive, CPU-bound workloads.
//!
//! Two kinds of schedulable units run on a fixed pool of worker threads:
//! *plain jobs*, callables invoked once to completion with their cells
//! recycled afterwards, and *structured coroutines*, suspendable tasks that
//! fan out children, await them, migrate between workers, or yield values to
//! a parent. The pool enforces the structured-concurrency discipline: a
//! parent is not finished until every descendant it spawned has finished.
//!
//! Coroutine suspension points are exactly the awaiters ([`join`],
//! [`resume_on`], [`yield_value`]); between them a unit runs to completion
//! on one worker. Futures that park on a [`std::task::Waker`] are outside
//! the contract.
//!
//! ```no_run
//! use stampede::{Builder, Coro, join};
//!
//! let pool = Builder::new().worker_threads(4).try_build()?;
//!
//! let total = Coro::new(async {
//!     let parts: Vec<Coro<u64>> = (0..8)
//!         .map(|lane| Coro::new(async move { lane * lane }))
//!         .collect();
//!     join(&parts).await;
//!     parts.iter().filter_map(|part| part.take()).sum::<u64>()
//! });
//!
//! pool.spawn(&total);
//! while !total.is_finished() {
//!     std::thread::yield_now();
//! }
//! assert_eq!(total.get(), Some(140));
//!
//! pool.shutdown()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod alloc;

mod context;
pub use context::current_worker;

mod job;
pub use job::{ChildGroup, Coro, JobFn, Join, ResumeOn, YieldValue, job, join, resume_on, yield_value};

mod queue;

mod runtime;
pub use runtime::{Builder, JobSystem};

mod utils;

#[cfg(test)]
mod test_utils;
