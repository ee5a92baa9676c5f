use crate::context;
use crate::runtime::scheduler::Handle;
use crate::runtime::worker;
use anyhow::{Result, anyhow};
use std::thread;

/// Spawns every pool-owned worker thread. With a reserved entry worker the
/// embedder later serves index 0 through `JobSystem::run_entry_worker`; the
/// spawned workers wait at the startup barrier until it arrives.
pub(super) fn spawn_workers(handle: &Handle) -> Result<()> {
    for index in handle.cfg.start_index..handle.cfg.worker_threads {
        let mut builder = thread::Builder::new().name((handle.cfg.thread_name.0)(index));
        if let Some(stack_size) = handle.cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker_handle = handle.clone();
        let join = builder
            .spawn(move || {
                context::init_worker_context(index, worker_handle.clone());
                worker::run(worker_handle, index);
            })
            .map_err(|e| anyhow!("failed to spawn worker {index}: {e}"))?;

        handle.join_handles.lock().push(join);
    }
    Ok(())
}

/// Joins every spawned worker, reporting panicked threads.
pub(super) fn join_all(handle: &Handle) -> Result<()> {
    let handles: Vec<_> = handle.join_handles.lock().drain(..).collect();

    let panicked = handles
        .into_iter()
        .filter_map(|join| join.join().err())
        .count();

    if panicked == 0 {
        Ok(())
    } else {
        Err(anyhow!("{panicked} worker thread(s) panicked"))
    }
}
