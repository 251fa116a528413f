use crate::{
    delegate::BuildApi,
    device::DeviceEnv,
    graph::{GraphBuilder, GraphError},
    runtime::Runtime,
};
use tracing::{debug, error};

/// Builder-thread routine: resolve the embedded delegate and let it build the
/// graph, then seal the build.
///
/// A failing build records its status and aborts the run. Either way the
/// build is marked done so schedulers stop waiting for it.
pub fn build(runtime: &Runtime, env: &dyn DeviceEnv) {
    runtime.check_layout();
    let slot = runtime.builder_slot();
    slot.begin();
    match run_delegate(runtime, env) {
        Ok(()) => {
            debug!(tasks = runtime.published_count(), "graph build done");
            runtime.signal_build_done();
            slot.finish();
        }
        Err(err) => {
            let status = err.status();
            error!(%err, status, "graph build failed");
            runtime.set_build_status(status);
            runtime.abort(status);
            runtime.signal_build_done();
            slot.abort();
        }
    }
}

fn run_delegate(runtime: &Runtime, env: &dyn DeviceEnv) -> Result<(), GraphError> {
    let Some((image, entry)) = runtime.delegate() else {
        // Nothing to build: the host already did.
        return Ok(());
    };
    let delegate = env.resolve_delegate(image, entry).map_err(|err| {
        error!(%err, entry, "delegate resolution failed");
        GraphError::DelegateUnresolved {
            entry: entry.to_owned(),
        }
    })?;
    // SAFETY: this routine is launched once per run and the host holds no
    // builder while the runtime is on the device.
    let builder = unsafe { GraphBuilder::attach(runtime) };
    let mut api = BuildApi::new(builder, env);
    delegate(&mut api)?;
    api.into_builder().finish()
}
