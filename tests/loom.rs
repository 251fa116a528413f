#![allow(missing_docs)]
#![cfg(feature = "loom")]

use loom::thread;
use std::sync::Arc;
use tgr::{
    graph::{GraphApi, GraphBuilder},
    runtime::Runtime,
    types::{CoreType, TaskId},
};

fn runtime() -> Box<Runtime> {
    let mut rt = Runtime::new_boxed();
    rt.set_function_addr(0, 0x100).unwrap();
    rt
}

fn published(rt: &mut Runtime, args: &[u64]) -> TaskId {
    let mut b = rt.builder();
    let task = b.add_task(args, 0, CoreType::Aiv, 0).unwrap();
    b.publish_task(task).unwrap();
    task
}

fn spin_pop(rt: &Runtime) -> TaskId {
    loop {
        if let Some(task) = rt.pop_ready(CoreType::Aiv) {
            return task;
        }
        thread::yield_now();
    }
}

#[test]
fn published_task_is_fully_visible() {
    loom::model(|| {
        let rt: Arc<Runtime> = Arc::from(runtime());

        let worker = {
            let rt = rt.clone();
            thread::spawn(move || {
                let task = spin_pop(&rt);
                let view = rt.task(task).unwrap();
                assert_eq!(view.args(), &[7, 9]);
                assert_eq!(view.function_addr, 0x100);
                rt.complete_task(task);
            })
        };

        // SAFETY: the only builder of `rt`.
        let mut b = unsafe { GraphBuilder::attach(&rt) };
        let task = b.add_task(&[7, 9], 0, CoreType::Aiv, 0).unwrap();
        b.publish_task(task).unwrap();

        worker.join().unwrap();
        assert!(rt.is_completed(task));
        assert_eq!(rt.completed_count(), 1);
    });
}

#[test]
fn link_races_with_predecessor_completion() {
    loom::model(|| {
        let mut rt = runtime();
        let t0 = published(&mut rt, &[]);
        let t1 = rt.builder().add_task(&[], 0, CoreType::Aiv, 0).unwrap();
        let rt: Arc<Runtime> = Arc::from(rt);

        let worker = {
            let rt = rt.clone();
            thread::spawn(move || {
                let task = rt.pop_ready(CoreType::Aiv).unwrap();
                assert_eq!(task, t0);
                rt.complete_task(task);
            })
        };

        // SAFETY: the only builder of `rt`.
        let mut b = unsafe { GraphBuilder::attach(&rt) };
        b.add_successor_conditional(t0, t1).unwrap();
        b.publish_task(t1).unwrap();

        worker.join().unwrap();
        // Whichever side released last enqueued `t1`, exactly once.
        assert_eq!(rt.pop_ready(CoreType::Aiv), Some(t1));
        assert_eq!(rt.pop_ready(CoreType::Aiv), None);
        assert!(rt.is_completed(t0));
    });
}

#[test]
fn join_is_enqueued_once() {
    loom::model(|| {
        let mut rt = runtime();
        let t0 = published(&mut rt, &[]);
        let t1 = published(&mut rt, &[]);
        let t2 = {
            let mut b = rt.builder();
            let t2 = b.add_task(&[], 0, CoreType::Aiv, 0).unwrap();
            b.add_successor_conditional(t0, t2).unwrap();
            b.add_successor_conditional(t1, t2).unwrap();
            b.publish_task(t2).unwrap();
            t2
        };
        assert_eq!(rt.pop_ready(CoreType::Aiv), Some(t0));
        assert_eq!(rt.pop_ready(CoreType::Aiv), Some(t1));
        let rt: Arc<Runtime> = Arc::from(rt);

        let handles: Vec<_> = [t0, t1]
            .into_iter()
            .map(|task| {
                let rt = rt.clone();
                thread::spawn(move || rt.complete_task(task))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(rt.pop_ready(CoreType::Aiv), Some(t2));
        assert_eq!(rt.pop_ready(CoreType::Aiv), None);
        assert!(rt.is_dispatch_eligible(t2));
    });
}

#[test]
fn concurrent_consumers_split_the_ready_queue() {
    loom::model(|| {
        let mut rt = runtime();
        let t0 = published(&mut rt, &[]);
        let t1 = published(&mut rt, &[]);
        let rt: Arc<Runtime> = Arc::from(rt);

        let other = {
            let rt = rt.clone();
            thread::spawn(move || rt.pop_ready(CoreType::Aiv))
        };
        let mine = rt.pop_ready(CoreType::Aiv);
        let theirs = other.join().unwrap();

        let mut taken: Vec<TaskId> = mine.into_iter().chain(theirs).collect();
        taken.extend(rt.pop_ready(CoreType::Aiv));
        taken.sort();
        assert_eq!(taken, vec![t0, t1]);
    });
}
