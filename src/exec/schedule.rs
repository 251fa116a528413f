use crate::{
    config::BuildMode,
    device::DeviceEnv,
    handshake::WorkerState,
    runtime::Runtime,
    sync::Backoff,
};
use tracing::debug;

/// Scheduler-thread routine.
///
/// Scheduler `idx` owns the compute cores `c` with `c % schedulers == idx`
/// and feeds each idle, running core from the ready queue of its core type.
/// In sequential mode it starts only after the build is done; in concurrent
/// mode it keeps polling for newly published tasks until the build is done
/// and every published task completed.
pub fn schedule(runtime: &Runtime, idx: usize, env: &dyn DeviceEnv) {
    runtime.check_layout();
    let slot = runtime.scheduler_slot(idx);
    slot.begin();
    let schedulers = runtime.scheduler_count();
    let owned_cores = || (idx..runtime.core_count()).step_by(schedulers);
    let quit_cores = || owned_cores().for_each(|core| runtime.core_slot(core).request_quit());
    let backoff = Backoff::new();

    if runtime.build_mode() == BuildMode::Sequential {
        while !runtime.build_done() {
            if env.cancelled() {
                quit_cores();
                slot.abort();
                return;
            }
            backoff.snooze();
        }
        backoff.reset();
    }

    loop {
        if env.cancelled() || runtime.is_aborted() {
            quit_cores();
            slot.abort();
            return;
        }
        let mut dispatched = false;
        for core in owned_cores() {
            let hs = runtime.core_slot(core);
            if hs.state() != WorkerState::Running || !hs.is_idle() {
                continue;
            }
            if let Some(task) = runtime.pop_ready(hs.core_type()) {
                runtime.mark_dispatched(task);
                debug!(scheduler = idx, core, %task, "task dispatched");
                hs.dispatch(task);
                dispatched = true;
            }
        }
        // `build_done` is read before the counts: once it is set the published
        // count is final.
        if runtime.build_done() && runtime.completed_count() == runtime.published_count() {
            break;
        }
        if dispatched {
            backoff.reset();
        } else {
            backoff.snooze();
        }
    }

    quit_cores();
    slot.finish();
}
