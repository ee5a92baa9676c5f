use super::*;
use crate::current_worker;
use crate::job::{Coro, JobFn, job, join, resume_on, yield_value};
use crate::test_utils::{CountingAlloc, wait_until};
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

assert_impl_all!(JobSystem: Send, Sync);
assert_impl_all!(Handle: Send, Sync);
assert_impl_all!(Coro<i32>: Send, Sync);

/// Counts how often the wrapped future is polled; one poll means it
/// completed without suspending.
struct PollCount<F> {
    inner: F,
    polls: Arc<AtomicUsize>,
}

impl<F: Future + Unpin> Future for PollCount<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        this.polls.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut this.inner).poll(cx)
    }
}

#[rstest]
#[case::one_worker(1)]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn fan_out_sum(#[case] workers: usize) {
    let system = Builder::new().worker_threads(workers).try_build().unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    let body_completed = completed.clone();
    let parent = Coro::new(async move {
        let children: Vec<Coro<i32>> = (0..100)
            .map(|_| {
                let completed = body_completed.clone();
                Coro::new(async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                    1
                })
            })
            .collect();

        join(&children).await;

        let sum: i32 = children.iter().filter_map(|child| child.take()).sum();
        body_completed.fetch_add(1, Ordering::SeqCst);
        sum
    });

    system.spawn(&parent);
    wait_until("fan-out parent", || parent.is_finished());

    assert_eq!(parent.get(), Some(100));
    assert_eq!(completed.load(Ordering::SeqCst), 101);
    system.shutdown().unwrap();
}

#[test]
fn continuation_runs_after_the_whole_subtree() {
    let system = Arc::new(Builder::new().worker_threads(3).try_build().unwrap());
    let counter = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let spawner = system.clone();
    let child_counter = counter.clone();
    let continuation_counter = counter.clone();
    let continuation_observed = observed.clone();

    system.submit_then(
        move || {
            for _ in 0..10 {
                let counter = child_counter.clone();
                spawner.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        },
        move || {
            continuation_observed.store(
                continuation_counter.load(Ordering::SeqCst),
                Ordering::SeqCst,
            );
            continuation_counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    wait_until("continuation", || {
        observed.load(Ordering::SeqCst) != usize::MAX
    });
    assert_eq!(
        observed.load(Ordering::SeqCst),
        10,
        "continuation must observe every descendant's increment"
    );
    system.shutdown().unwrap();
}

#[test]
fn resume_on_migrates_and_skips_noop_migrations() {
    let system = Builder::new().worker_threads(4).try_build().unwrap();
    let polls = Arc::new(AtomicUsize::new(0));

    let noop_polls = polls.clone();
    let coro = Coro::new(async move {
        resume_on(3).await;
        let after_migration = current_worker();

        PollCount {
            inner: resume_on(3),
            polls: noop_polls,
        }
        .await;

        (after_migration, current_worker())
    });

    system.spawn(&coro);
    wait_until("migrating coroutine", || coro.is_finished());

    assert_eq!(coro.get(), Some((Some(3), Some(3))));
    assert_eq!(
        polls.load(Ordering::SeqCst),
        1,
        "resume_on for the current worker must not suspend"
    );
    system.shutdown().unwrap();
}

#[test]
fn heterogeneous_tuple_awaits_all_children() {
    let system = Builder::new().worker_threads(2).try_build().unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let resumes = Arc::new(AtomicUsize::new(0));

    let children_finished = finished.clone();
    let parent_resumes = resumes.clone();
    let parent = Coro::new(async move {
        let coros: Vec<Coro<i32>> = (0..3)
            .map(|i| {
                let finished = children_finished.clone();
                Coro::new(async move {
                    finished.fetch_add(1, Ordering::SeqCst);
                    i as i32
                })
            })
            .collect();
        let callables: Vec<JobFn> = (0..2)
            .map(|_| {
                let finished = children_finished.clone();
                job(move || {
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        join((coros, callables)).await;
        parent_resumes.fetch_add(1, Ordering::SeqCst);
    });

    system.spawn(&parent);
    wait_until("tuple parent", || parent.is_finished());

    assert_eq!(finished.load(Ordering::SeqCst), 5);
    assert_eq!(resumes.load(Ordering::SeqCst), 1, "parent resumes exactly once");
    system.shutdown().unwrap();
}

#[test]
fn yield_loop_drives_values_in_order() {
    let system = Builder::new().worker_threads(2).try_build().unwrap();

    let producer = Coro::new(async move {
        for v in 1..=5 {
            yield_value(v).await;
        }
        0
    });

    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = observed.clone();
    let driver = Coro::new(async move {
        for _ in 0..5 {
            let v = join(&producer).await;
            sink.lock().push(v);
        }
        join(&producer).await
    });

    system.spawn(&driver);
    wait_until("yield driver", || driver.is_finished());

    assert_eq!(*observed.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(driver.get(), Some(0));
    system.shutdown().unwrap();
}

#[test]
fn yield_notifies_a_plain_job_parent_once() {
    let system = Arc::new(Builder::new().worker_threads(2).try_build().unwrap());
    let continuation_ran = Arc::new(AtomicUsize::new(0));

    let spawner = system.clone();
    let observed = continuation_ran.clone();
    system.submit_then(
        move || {
            let child = Coro::new(async {
                yield_value(42i32).await;
                0
            });
            spawner.spawn(&child);
            // The handle drops here; the single yield notification is what
            // lets the submitting job finish.
        },
        move || {
            observed.fetch_add(1, Ordering::SeqCst);
        },
    );

    wait_until("continuation after yield", || {
        continuation_ran.load(Ordering::SeqCst) == 1
    });
    system.shutdown().unwrap();
}

#[test]
fn empty_groups_do_not_suspend() {
    let system = Builder::new().worker_threads(1).try_build().unwrap();
    let polls = Arc::new(AtomicUsize::new(0));

    let probe = polls.clone();
    let coro = Coro::new(async move {
        PollCount {
            inner: join(Vec::<Coro<i32>>::new()),
            polls: probe.clone(),
        }
        .await;
        PollCount {
            inner: join((Vec::<Coro<i32>>::new(), Vec::<JobFn>::new())),
            polls: probe,
        }
        .await;
        7
    });

    system.spawn(&coro);
    wait_until("empty-join coroutine", || coro.is_finished());

    assert_eq!(coro.get(), Some(7));
    assert_eq!(polls.load(Ordering::SeqCst), 2);
    system.shutdown().unwrap();
}

#[test]
fn coroutine_finishes_after_detached_job_children() {
    let system = Arc::new(Builder::new().worker_threads(2).try_build().unwrap());
    let child_done = Arc::new(AtomicUsize::new(0));

    let submitter = system.clone();
    let probe = child_done.clone();
    let reader = child_done.clone();
    let driver = Coro::new(async move {
        let inner = Coro::new(async move {
            // A plain job submitted from the body and never awaited still
            // holds the coroutine's completion open.
            submitter.submit(move || {
                thread::sleep(Duration::from_millis(10));
                probe.fetch_add(1, Ordering::SeqCst);
            });
        });
        join(inner).await;
        reader.load(Ordering::SeqCst)
    });

    system.spawn(&driver);
    wait_until("driver", || driver.is_finished());

    assert_eq!(driver.get(), Some(1));
    system.shutdown().unwrap();
}

#[test]
fn pinned_jobs_run_in_fifo_order() {
    let system = Builder::new().worker_threads(2).try_build().unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for seq in 0..16 {
        let order = order.clone();
        system.submit_on(1, move || {
            assert_eq!(current_worker(), Some(1));
            order.lock().push(seq);
        });
    }

    wait_until("pinned jobs", || order.lock().len() == 16);
    assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    system.shutdown().unwrap();
}

#[test]
fn pinned_coroutine_starts_on_its_worker() {
    let system = Builder::new().worker_threads(2).try_build().unwrap();

    let coro = Coro::new(async move { current_worker() }).pin_to(1);
    system.spawn(&coro);

    wait_until("pinned coroutine", || coro.is_finished());
    assert_eq!(coro.get(), Some(Some(1)));
    system.shutdown().unwrap();
}

#[test]
fn batch_submission_runs_every_job() {
    let system = Builder::new().worker_threads(3).try_build().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<JobFn> = (0..64)
        .map(|_| {
            let ran = ran.clone();
            job(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    system.submit_batch(jobs);

    wait_until("batch", || ran.load(Ordering::SeqCst) == 64);
    system.shutdown().unwrap();
}

#[test]
fn spawn_batch_runs_every_coroutine() {
    let system = Builder::new().worker_threads(2).try_build().unwrap();

    let coros: Vec<Coro<usize>> = (0..32).map(|i| Coro::new(async move { i })).collect();
    system.spawn_batch(&coros);

    wait_until("batch of coroutines", || coros.iter().all(Coro::is_finished));
    for (i, coro) in coros.iter().enumerate() {
        assert_eq!(coro.get(), Some(i));
    }
    system.shutdown().unwrap();
}

#[test]
fn shutdown_drains_queues_and_frees_all_unit_storage() {
    static DRAIN_ALLOC: CountingAlloc = CountingAlloc::new();
    let baseline = DRAIN_ALLOC.live();

    let system = Builder::new()
        .worker_threads(2)
        .allocator(&DRAIN_ALLOC)
        .try_build()
        .unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..1_000 {
        let ran = ran.clone();
        system.submit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    let coros: Vec<Coro<i32>> = (0..10)
        .map(|i| Coro::new_in(async move { i }, &DRAIN_ALLOC))
        .collect();
    system.spawn_batch(&coros);

    system.terminate();
    system.wait_for_termination().unwrap();
    drop(coros);

    assert!(system.handle.central_queue().is_empty());
    for index in 0..system.worker_count() {
        assert!(system.handle.local_queue(index).is_empty());
    }
    assert!(ran.load(Ordering::SeqCst) <= 1_000);
    assert_eq!(
        DRAIN_ALLOC.live(),
        baseline,
        "unit storage leaked across shutdown"
    );
    assert!(DRAIN_ALLOC.total() > 0);
}

#[test]
fn entry_thread_serves_worker_zero() {
    let system = Arc::new(
        Builder::new()
            .worker_threads(2)
            .reserve_entry_worker()
            .try_build()
            .unwrap(),
    );

    let entry_thread = thread::current().id();
    let hit = Arc::new(AtomicUsize::new(0));

    let probe = hit.clone();
    let terminator = system.clone();
    system.submit_on(0, move || {
        if current_worker() == Some(0) && thread::current().id() == entry_thread {
            probe.fetch_add(1, Ordering::SeqCst);
        }
        terminator.terminate();
    });

    system.run_entry_worker().unwrap();
    system.wait_for_termination().unwrap();
    assert_eq!(hit.load(Ordering::SeqCst), 1);
}

#[test]
fn run_entry_worker_requires_reservation() {
    let system = Builder::new().worker_threads(1).try_build().unwrap();
    assert!(system.run_entry_worker().is_err());
    system.shutdown().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn workers_get_named_threads() {
    use crate::utils::thread::get_current_thread_name;

    let system = Builder::new()
        .worker_threads(2)
        .thread_name("herd")
        .try_build()
        .unwrap();
    let name = Arc::new(parking_lot::Mutex::new(String::new()));

    let out = name.clone();
    system.submit(move || {
        *out.lock() = get_current_thread_name().unwrap_or_default();
    });

    wait_until("named job", || !name.lock().is_empty());
    assert!(name.lock().starts_with("herd-"));
    system.shutdown().unwrap();
}
