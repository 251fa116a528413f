#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use core::time::Duration;
use proptest::prelude::*;
use tgr::{
    config::{BuildMode, LaunchConfig},
    coordinator::{Arg, Coordinator, CoordinatorState, RuntimeError},
    delegate::{BuildApi, GraphSource},
    device::{Device, DeviceError},
    exec::KERNEL_FAULT_STATUS,
    graph::{GraphApi, GraphError},
    handshake::WorkerState,
    platform::{MAX_DELEGATE_IMAGE, MAX_FUNC_ID, MAX_ORCH_ARGS},
    sim::{SimConfig, SimDevice, SimMemory},
    types::{CoreType, FuncId, TaskId},
};

const NOOP: FuncId = 0;
const ADD: FuncId = 1;
const ADD_SCALAR: FuncId = 2;
const MUL: FuncId = 3;
const FILL: FuncId = 4;
const INCREMENT: FuncId = 5;

/// Two binaries are loaded by `ready`.
const BINARIES: usize = 2;

fn bad_args(func_id: FuncId) -> DeviceError {
    DeviceError::KernelFault {
        func_id,
        reason: "bad arguments".to_owned(),
    }
}

fn elementwise(
    func_id: FuncId,
    op: fn(f32, f32) -> f32,
) -> impl Fn(&SimMemory, &[u64]) -> Result<(), DeviceError> + Send + Sync + 'static {
    move |mem, args| {
        let &[x, y, out, n] = args else {
            return Err(bad_args(func_id));
        };
        let x = mem.read_f32s(x, n as usize)?;
        let y = mem.read_f32s(y, n as usize)?;
        let z: Vec<f32> = x.iter().zip(&y).map(|(&a, &b)| op(a, b)).collect();
        mem.write_f32s(out, &z)
    }
}

fn add_scalar(mem: &SimMemory, args: &[u64]) -> Result<(), DeviceError> {
    let &[x, s, out, n] = args else {
        return Err(bad_args(ADD_SCALAR));
    };
    let s = f32::from_bits(s as u32);
    let z: Vec<f32> = mem.read_f32s(x, n as usize)?.iter().map(|v| v + s).collect();
    mem.write_f32s(out, &z)
}

fn fill(mem: &SimMemory, args: &[u64]) -> Result<(), DeviceError> {
    let &[out, len] = args else {
        return Err(bad_args(FILL));
    };
    mem.write(out, &vec![1; len as usize])
}

fn increment(mem: &SimMemory, args: &[u64]) -> Result<(), DeviceError> {
    let &[buf, len] = args else {
        return Err(bad_args(INCREMENT));
    };
    let mut bytes = vec![0; len as usize];
    mem.read(&mut bytes, buf)?;
    bytes.iter_mut().for_each(|b| *b = b.wrapping_add(1));
    mem.write(buf, &bytes)
}

/// `f = (a + b + 1) * (a + b + 2)` over `n` floats, with the intermediates in
/// device memory allocated by the delegate.
fn vector_example(api: &mut BuildApi<'_>) -> Result<(), GraphError> {
    let &[a, b, f, n] = api.orch_args() else {
        return Err(GraphError::Delegate { status: -1 });
    };
    let bytes = n as usize * size_of::<f32>();
    let c = api.device_malloc(bytes)?;
    let d = api.device_malloc(bytes)?;
    let e = api.device_malloc(bytes)?;
    let one = u64::from(1f32.to_bits());
    let two = u64::from(2f32.to_bits());

    let t0 = api.add_task(&[a, b, c, n], ADD, CoreType::Aiv, 0)?;
    let t1 = api.add_task(&[c, one, d, n], ADD_SCALAR, CoreType::Aiv, 0)?;
    let t2 = api.add_task(&[c, two, e, n], ADD_SCALAR, CoreType::Aiv, 0)?;
    let t3 = api.add_task(&[d, e, f, n], MUL, CoreType::Aic, 0)?;
    // `t0` goes out before its successors are wired, so linking may race with
    // its completion in concurrent mode.
    api.publish_task(t0)?;
    api.add_successor_conditional(t0, t1)?;
    api.add_successor_conditional(t0, t2)?;
    api.add_successor_conditional(t1, t3)?;
    api.add_successor_conditional(t2, t3)?;
    for task in [t1, t2, t3] {
        api.publish_task(task)?;
    }
    Ok(())
}

fn device() -> SimDevice {
    SimDevice::builder()
        .kernel(NOOP, |_, _| Ok(()))
        .kernel(ADD, elementwise(ADD, |a, b| a + b))
        .kernel(ADD_SCALAR, add_scalar)
        .kernel(MUL, elementwise(MUL, |a, b| a * b))
        .kernel(FILL, fill)
        .kernel(INCREMENT, increment)
        .kernel(6, |_, _| Err(DeviceError::KernelFault {
            func_id: 6,
            reason: "faulty".to_owned(),
        }))
        .delegate("vector_example", vector_example)
        .delegate("fails", |_| Err(GraphError::Delegate { status: -5 }))
        .build()
}

fn ready(device: SimDevice, funcs: &[FuncId]) -> Coordinator<SimConfig> {
    let mut coord = Coordinator::<SimConfig>::new(device);
    coord.ensure_device_ready(0).unwrap();
    for &func_id in funcs {
        coord
            .register_function(func_id, format!("kernel-{func_id}").as_bytes())
            .unwrap();
    }
    coord.load_binaries(b"scheduler", b"aicore").unwrap();
    assert_eq!(coord.state(), CoordinatorState::BinariesLoaded);
    coord
}

fn launch(build_mode: BuildMode) -> LaunchConfig {
    LaunchConfig {
        build_mode,
        wait_bound: Duration::from_secs(5),
        ..LaunchConfig::default()
    }
}

fn live(coord: &Coordinator<SimConfig>) -> usize {
    coord.device().memory().live_allocations()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[test]
fn host_built_diamond_runs_in_dependency_order() {
    let mut coord = ready(device(), &[NOOP]);
    let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];
    let session = coord
        .init_runtime(
            vec![],
            GraphSource::host(move |b, _| {
                let tasks = [
                    b.add_task(&[], NOOP, CoreType::Aic, 0)?,
                    b.add_task(&[1], NOOP, CoreType::Aiv, 0)?,
                    b.add_task(&[2], NOOP, CoreType::Aiv, 0)?,
                    b.add_task(&[], NOOP, CoreType::Aic, 0)?,
                ];
                for (p, s) in edges {
                    b.add_successor_conditional(tasks[p], tasks[s])?;
                }
                for task in tasks {
                    b.publish_task(task)?;
                }
                Ok(())
            }),
        )
        .unwrap();
    assert_eq!(session.runtime().published_count(), 4);
    assert!(session.runtime().build_done());
    assert!(session.runtime().is_dispatch_eligible(TaskId::new(0)));
    assert!(!session.runtime().is_dispatch_eligible(TaskId::new(3)));

    let report = coord.run(session, &launch(BuildMode::Concurrent)).unwrap();
    assert_eq!(coord.state(), CoordinatorState::Complete);
    assert_eq!((report.published, report.dispatched, report.completed), (4, 4, 4));
    for (p, s) in edges {
        let done = report.tasks[p].complete_seq.unwrap();
        let started = report.tasks[s].dispatch_seq.unwrap();
        assert!(done < started, "t{p} completed at {done}, t{s} dispatched at {started}");
    }
    assert_eq!(report.tasks[1].core_type, Some(CoreType::Aiv));
    assert_eq!(report.tasks[3].fanin, 2);
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Done));
    assert_eq!(report.workers.iter().map(|w| w.executed).sum::<u32>(), 4);
    // Four schedulers, one block of three cores.
    assert_eq!(report.workers.len(), 4 + 3);
}

#[test]
fn delegate_builds_the_vector_example_in_both_modes() {
    let mut coord = ready(device(), &[ADD, ADD_SCALAR, MUL]);
    let baseline = live(&coord);
    assert_eq!(baseline, 3 + BINARIES);

    let n = 256;
    let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let b = vec![2.0f32; n];
    let expected: Vec<f32> = (0..n).map(|i| (i as f32 + 3.0) * (i as f32 + 4.0)).collect();
    let (a, b) = (f32_bytes(&a), f32_bytes(&b));

    for mode in [BuildMode::Sequential, BuildMode::Concurrent] {
        let mut f = vec![0u8; n * size_of::<f32>()];
        let session = coord
            .init_runtime(
                vec![
                    Arg::Input(&a),
                    Arg::Input(&b),
                    Arg::Output(&mut f),
                    Arg::Scalar(n as u64),
                ],
                GraphSource::delegate(b"delegate-image".to_vec(), "vector_example"),
            )
            .unwrap();
        assert!(session.runtime().is_delegated());
        assert_eq!(session.runtime().task_count(), 0);
        assert_eq!(session.copy_back_len(), 1);

        let report = coord.run(session, &launch(mode)).unwrap();
        assert_eq!(report.build_mode, mode);
        assert_eq!(report.completed, 4);
        assert_eq!(f32s(&f), expected, "{mode}");
        // Builder slot plus three schedulers.
        assert_eq!(
            report
                .workers
                .iter()
                .filter(|w| w.core_type.is_none())
                .count(),
            4
        );
        assert_eq!(live(&coord), baseline, "{mode}");
    }
}

#[test]
fn sequential_mode_publishes_everything_before_dispatch() {
    let device = SimDevice::builder()
        .kernel(NOOP, |_, _| Ok(()))
        .delegate("five", |api| {
            let mut prev = None;
            for _ in 0..5 {
                let task = api.add_task(&[], NOOP, CoreType::Aiv, 0)?;
                if let Some(prev) = prev {
                    api.add_successor_conditional(prev, task)?;
                }
                api.publish_task(task)?;
                prev = Some(task);
            }
            std::thread::sleep(Duration::from_millis(50));
            if api.runtime().dispatched_count() != 0 {
                return Err(GraphError::Delegate { status: -42 });
            }
            Ok(())
        })
        .build();
    let mut coord = ready(device, &[NOOP]);
    let session = coord
        .init_runtime(vec![], GraphSource::delegate(b"img".to_vec(), "five"))
        .unwrap();
    let report = coord.run(session, &launch(BuildMode::Sequential)).unwrap();
    assert_eq!(report.completed, 5);
    let seqs: Vec<u32> = report.tasks.iter().map(|t| t.complete_seq.unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

fn fill_graph(tasks: usize) -> impl FnOnce(&mut tgr::graph::GraphBuilder<'_>, &[u64]) -> Result<(), GraphError> {
    move |b, args| {
        for _ in 0..tasks {
            let task = b.add_task(args, FILL, CoreType::Aiv, 0)?;
            b.publish_task(task)?;
        }
        Ok(())
    }
}

#[test]
fn missing_worker_checkpoint_fails_without_copy_back() {
    let device = SimDevice::builder().kernel(FILL, fill).offline_core(2).build();
    let mut coord = ready(device, &[FILL]);
    let baseline = live(&coord);

    let mut out = [0xaau8; 8];
    let session = coord
        .init_runtime(
            vec![Arg::Output(&mut out), Arg::Scalar(8)],
            GraphSource::host(fill_graph(3)),
        )
        .unwrap();
    let launch = LaunchConfig {
        wait_bound: Duration::from_millis(200),
        ..launch(BuildMode::Concurrent)
    };
    let err = coord.run(session, &launch).unwrap_err();
    assert_eq!(err, RuntimeError::HandshakeTimeout { incomplete: 1 });
    assert_eq!(out, [0xaa; 8]);
    assert_eq!(coord.state(), CoordinatorState::Failed);
    assert_eq!(live(&coord), baseline);
}

#[test]
fn unservable_graph_times_out_and_recovers() {
    let device = SimDevice::builder()
        .kernel(FILL, fill)
        .offline_core(1)
        .offline_core(2)
        .build();
    let mut coord = ready(device, &[FILL]);
    let baseline = live(&coord);
    let bound = Duration::from_millis(200);

    let mut out = [0u8; 4];
    let session = coord
        .init_runtime(
            vec![Arg::Output(&mut out), Arg::Scalar(4)],
            GraphSource::host(fill_graph(1)),
        )
        .unwrap();
    let launch = LaunchConfig {
        wait_bound: bound,
        ..launch(BuildMode::Concurrent)
    };
    let err = coord.run(session, &launch).unwrap_err();
    assert_eq!(err, RuntimeError::StreamTimeout { bound });
    assert_eq!(out, [0; 4]);
    assert_eq!(coord.state(), CoordinatorState::Failed);
    assert_eq!(live(&coord), baseline);

    // The streams drained, so the coordinator accepts another run. The
    // offline cores still never check in.
    let session = coord
        .init_runtime(vec![], GraphSource::host(|_, _| Ok(())))
        .unwrap();
    assert_eq!(
        coord.run(session, &launch),
        Err(RuntimeError::HandshakeTimeout { incomplete: 2 })
    );
    assert_eq!(live(&coord), baseline);
}

/// Allocates a scratch buffer, then publishes one task filling it.
fn fill_scratch(api: &mut BuildApi<'_>) -> Result<(), GraphError> {
    let scratch = api.device_malloc(64)?;
    let task = api.add_task(&[scratch, 64], FILL, CoreType::Aiv, 0)?;
    api.publish_task(task)
}

#[test]
fn timed_out_run_frees_delegate_allocations() {
    let device = SimDevice::builder()
        .kernel(FILL, fill)
        .offline_core(1)
        .offline_core(2)
        .delegate("fill_scratch", fill_scratch)
        .build();
    let mut coord = ready(device, &[FILL]);
    let baseline = live(&coord);
    let bound = Duration::from_millis(200);
    for mode in [BuildMode::Sequential, BuildMode::Concurrent] {
        let session = coord
            .init_runtime(vec![], GraphSource::delegate(b"img".to_vec(), "fill_scratch"))
            .unwrap();
        let launch = LaunchConfig {
            wait_bound: bound,
            ..launch(mode)
        };
        let err = coord.run(session, &launch).unwrap_err();
        assert_eq!(err, RuntimeError::StreamTimeout { bound }, "{mode}");
        assert_eq!(coord.state(), CoordinatorState::Failed);
        assert_eq!(live(&coord), baseline, "{mode}");
    }
}

#[test]
fn delegate_failure_is_reported_with_its_status() {
    let mut coord = ready(device(), &[NOOP]);
    let baseline = live(&coord);
    for (entry, status) in [("fails", -5), ("not-linked", -11)] {
        for mode in [BuildMode::Sequential, BuildMode::Concurrent] {
            let session = coord
                .init_runtime(vec![], GraphSource::delegate(b"img".to_vec(), entry))
                .unwrap();
            let err = coord.run(session, &launch(mode)).unwrap_err();
            assert_eq!(err, RuntimeError::DelegateFailed { status }, "{entry} {mode}");
            assert_eq!(live(&coord), baseline);
        }
    }
}

#[test]
fn delegate_out_of_device_memory_fails_the_build() {
    let device = SimDevice::builder()
        .kernel(NOOP, |_, _| Ok(()))
        .delegate("greedy", |api| api.device_malloc(usize::MAX).map(drop))
        .build();
    let mut coord = ready(device, &[NOOP]);
    let baseline = live(&coord);
    let session = coord
        .init_runtime(vec![], GraphSource::delegate(b"img".to_vec(), "greedy"))
        .unwrap();
    let err = coord.run(session, &launch(BuildMode::Concurrent)).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::DelegateFailed {
            status: GraphError::DeviceAlloc { size: usize::MAX }.status(),
        }
    );
    assert_eq!(live(&coord), baseline);
}

#[test]
fn kernel_fault_aborts_the_run() {
    let mut coord = ready(device(), &[FILL, 6]);
    let mut out = [7u8; 4];
    let session = coord
        .init_runtime(
            vec![Arg::InOut(&mut out), Arg::Scalar(4)],
            GraphSource::host(|b, args| {
                let bad = b.add_task(&[], 6, CoreType::Aic, 0)?;
                let after = b.add_task(args, FILL, CoreType::Aiv, 0)?;
                b.add_successor_conditional(bad, after)?;
                b.publish_task(bad)?;
                b.publish_task(after)
            }),
        )
        .unwrap();
    let err = coord.run(session, &launch(BuildMode::Concurrent)).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::ExecutionAborted {
            status: KERNEL_FAULT_STATUS
        }
    );
    assert_eq!(out, [7; 4]);
}

#[test]
fn host_build_errors_release_marshalled_buffers() {
    let mut coord = ready(device(), &[NOOP]);
    let baseline = live(&coord);
    let input = [1u8; 32];
    let err = coord
        .init_runtime(
            vec![Arg::Input(&input)],
            GraphSource::host(|b, _| {
                let t0 = b.add_task(&[], NOOP, CoreType::Aiv, 0)?;
                let t1 = b.add_task(&[], NOOP, CoreType::Aiv, 0)?;
                b.add_successor_conditional(t0, t1)?;
                b.publish_task(t1)
            }),
        )
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::Graph(GraphError::InertPredecessor {
            predecessor: TaskId::new(0),
            successor: TaskId::new(1),
        })
    );
    assert_eq!(live(&coord), baseline);
    assert_eq!(coord.state(), CoordinatorState::BinariesLoaded);
}

#[test]
fn allocation_failure_releases_earlier_buffers() {
    let device = SimDevice::builder()
        .kernel(NOOP, |_, _| Ok(()))
        .memory_limit(4096)
        .build();
    let mut coord = ready(device, &[NOOP]);
    let baseline = live(&coord);
    let small = [0u8; 16];
    let big = vec![0u8; 8192];
    let err = coord
        .init_runtime(
            vec![Arg::Input(&small), Arg::Input(&big)],
            GraphSource::host(|_, _| Ok(())),
        )
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::Device(DeviceError::AllocationFailed { size: 8192 })
    );
    assert_eq!(live(&coord), baseline);
}

#[test]
fn orch_arg_capacity_is_checked_before_marshalling() {
    // Marshalling every buffer would exhaust this memory first.
    let device = SimDevice::builder()
        .kernel(NOOP, |_, _| Ok(()))
        .memory_limit(4096)
        .build();
    let mut coord = ready(device, &[NOOP]);
    let baseline = live(&coord);
    let buf = [0u8; 128];
    let args = (0..=MAX_ORCH_ARGS).map(|_| Arg::Input(&buf)).collect();
    let err = coord
        .init_runtime(args, GraphSource::host(|_, _| Ok(())))
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::OrchArgCapacity {
            count: MAX_ORCH_ARGS + 1,
            limit: MAX_ORCH_ARGS,
        }
    );
    assert_eq!(live(&coord), baseline);
}

#[test]
fn delegate_limits_are_checked_before_launch() {
    let mut coord = ready(device(), &[NOOP]);
    let baseline = live(&coord);
    let image = vec![0u8; MAX_DELEGATE_IMAGE + 1];
    let err = coord
        .init_runtime(vec![], GraphSource::delegate(image, "vector_example"))
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::DelegateTooLarge {
            size: MAX_DELEGATE_IMAGE + 1,
            limit: MAX_DELEGATE_IMAGE,
        }
    );
    let err = coord
        .init_runtime(vec![], GraphSource::delegate(b"img".to_vec(), ""))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::DelegateEntryTooLong { len: 0, .. }));
    assert_eq!(live(&coord), baseline);
}

#[test]
fn invalid_launch_releases_the_session() {
    let mut coord = ready(device(), &[NOOP]);
    let baseline = live(&coord);
    let input = [0u8; 8];
    let session = coord
        .init_runtime(vec![Arg::Input(&input)], GraphSource::host(|_, _| Ok(())))
        .unwrap();
    assert_eq!(session.allocations().len(), 1);
    let launch = LaunchConfig {
        block_dim: 0,
        ..LaunchConfig::default()
    };
    assert!(matches!(
        coord.run(session, &launch),
        Err(RuntimeError::InvalidLaunch { .. })
    ));
    assert_eq!(live(&coord), baseline);
}

#[test]
fn device_setup_is_idempotent() {
    let mut coord = Coordinator::<SimConfig>::new(device());
    assert!(matches!(
        coord.register_function(NOOP, b"k"),
        Err(RuntimeError::InvalidState { .. })
    ));
    coord.ensure_device_ready(0).unwrap();
    coord.ensure_device_ready(0).unwrap();
    assert_eq!(coord.device().contexts_created(), 1);
    assert!(matches!(
        coord.ensure_device_ready(1),
        Err(RuntimeError::InvalidState { .. })
    ));
    assert!(matches!(
        coord.init_runtime(vec![], GraphSource::host(|_, _| Ok(()))),
        Err(RuntimeError::InvalidState { .. })
    ));

    coord.release();
    assert_eq!(coord.state(), CoordinatorState::Uninitialized);
    assert_eq!(coord.device().memory().live_allocations(), 0);
}

#[test]
fn registration_rules() {
    let mut coord = ready(device(), &[NOOP]);
    assert_eq!(
        coord.register_function(MAX_FUNC_ID as FuncId, b"k"),
        Err(RuntimeError::FuncIdOutOfRange {
            func_id: MAX_FUNC_ID as FuncId
        })
    );
    assert!(matches!(
        coord.register_function(40, b"k"),
        Err(RuntimeError::Device(DeviceError::KernelNotLinked { func_id: 40 }))
    ));
    assert_eq!(
        coord.function_addr(ADD),
        Err(RuntimeError::UnregisteredFunction { func_id: ADD })
    );

    // Re-registering replaces the routine and frees the old one.
    let before = live(&coord);
    let old = coord.function_addr(NOOP).unwrap();
    coord.register_function(NOOP, b"noop-v2").unwrap();
    assert_ne!(coord.function_addr(NOOP).unwrap(), old);
    assert_eq!(live(&coord), before);

    let session = coord
        .init_runtime(vec![], GraphSource::host(|_, _| Ok(())))
        .unwrap();
    assert_eq!(
        session.runtime().function_addr(NOOP),
        coord.function_addr(NOOP).ok()
    );
    coord.run(session, &launch(BuildMode::Concurrent)).unwrap();
    assert_eq!(
        coord.register_function(ADD, b"k"),
        Err(RuntimeError::RegistrationClosed)
    );
}

#[test]
fn device_memory_is_reachable_through_the_backend() {
    let coord = ready(device(), &[]);
    let dev = coord.device();
    let addr = dev.allocate(4).unwrap();
    dev.copy_to_device(addr, &[1, 2, 3, 4]).unwrap();
    let mut back = [0u8; 4];
    dev.copy_from_device(&mut back, addr).unwrap();
    assert_eq!(back, [1, 2, 3, 4]);
    dev.free(addr).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn inout_buffers_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut coord = ready(device(), &[INCREMENT]);
        let baseline = live(&coord);
        let mut buf = data.clone();
        let len = buf.len() as u64;
        let session = coord
            .init_runtime(
                vec![Arg::InOut(&mut buf), Arg::Scalar(len)],
                GraphSource::host(|b, args| {
                    let task = b.add_task(args, INCREMENT, CoreType::Aiv, 0)?;
                    b.publish_task(task)
                }),
            )
            .unwrap();
        coord.run(session, &launch(BuildMode::Concurrent)).unwrap();
        let expected: Vec<u8> = data.iter().map(|b| b.wrapping_add(1)).collect();
        prop_assert_eq!(buf, expected);
        prop_assert_eq!(live(&coord), baseline);
    }
}
