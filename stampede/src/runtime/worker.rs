use crate::context;
use crate::job::Header;
use crate::runtime::scheduler::Handle;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::thread;

/// The worker loop. Pops the local queue oldest-first, falls back to the
/// central queue, and runs what it finds with the current-unit register set.
/// Idle workers other than worker 0 nap briefly after `spin_ticks` empty
/// passes; worker 0 stays hot for latency-sensitive callers.
pub(super) fn run(handle: Handle, index: usize) {
    handle.startup.wait();
    tracing::trace!(worker = index, "worker loop starting");

    let spin_ticks = handle.cfg.spin_ticks;
    let idle_sleep = handle.cfg.idle_sleep;
    let mut idle = 0u32;

    loop {
        if handle.is_terminated() {
            break;
        }

        let unit = handle
            .local_queue(index)
            .pop_oldest()
            .or_else(|| handle.central_queue().pop());

        match unit {
            Some(unit) => {
                invoke(unit);
                idle = 0;
            }
            None => {
                idle += 1;
                if idle >= spin_ticks && index != 0 {
                    thread::sleep(idle_sleep);
                    idle = 0;
                }
            }
        }
    }

    tracing::trace!(worker = index, "worker loop exiting");

    // The last worker out sweeps every queue with the terminate flag up.
    if handle.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        handle.drain_all();
    }

    context::clear_worker_context();
}

/// Runs one unit with the current-unit register set for implicit parenting.
/// A panic escaping a unit is fatal: the scheduler cannot unwind a half-run
/// subtree, so the process aborts.
fn invoke(unit: NonNull<Header>) {
    let previous = context::set_current(Some(unit));
    let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        (unit.as_ref().vtable.run)(unit);
    }));
    context::set_current(previous);

    if let Err(payload) = result {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        tracing::error!(panic = msg, "panic escaped a scheduled unit; aborting");
        std::process::abort();
    }
}
