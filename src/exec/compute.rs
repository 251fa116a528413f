use crate::{
    device::DeviceEnv,
    exec::KERNEL_FAULT_STATUS,
    runtime::Runtime,
    sync::Backoff,
    types::TaskId,
};
use tracing::error;

/// Compute-core routine: run whatever the owning scheduler puts into this
/// core's mailbox until asked to quit.
pub fn compute(runtime: &Runtime, idx: usize, env: &dyn DeviceEnv) {
    runtime.check_layout();
    let slot = runtime.core_slot(idx);
    slot.begin();
    let backoff = Backoff::new();
    loop {
        if env.cancelled() {
            slot.abort();
            return;
        }
        if let Some(task) = slot.pending_task() {
            execute(runtime, idx, task, env);
            slot.retire();
            backoff.reset();
            continue;
        }
        if slot.quit_requested() {
            break;
        }
        backoff.snooze();
    }
    if runtime.is_aborted() {
        slot.abort();
    } else {
        slot.finish();
    }
}

fn execute(runtime: &Runtime, core: usize, task: TaskId, env: &dyn DeviceEnv) {
    // Only published tasks reach a mailbox.
    let view = runtime.task(task).expect("compute::execute: [1]");
    match env.invoke(view.function_addr, view.args()) {
        Ok(()) => runtime.complete_task(task),
        Err(err) => {
            error!(core, %task, func_id = view.func_id, %err, "kernel fault");
            runtime.abort(KERNEL_FAULT_STATUS);
        }
    }
}
