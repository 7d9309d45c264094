//! Cross-thread task hand-off

use moonbridge_engine::{BridgeError, HostValue, LuaApi, State, TaskScheduler, TypeKey};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_tasks_from_threads_run_once_in_order() {
    let scheduler = Arc::new(TaskScheduler::new());
    let barrier = Arc::new(Barrier::new(3));
    let enqueue_order = Arc::new(Mutex::new(Vec::new()));
    let run_order = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..3u32)
        .map(|worker| {
            let scheduler = Arc::clone(&scheduler);
            let barrier = Arc::clone(&barrier);
            let enqueue_order = Arc::clone(&enqueue_order);
            let run_order = Arc::clone(&run_order);
            thread::spawn(move || {
                barrier.wait();
                let mut enqueued = enqueue_order.lock();
                let completion = scheduler.enqueue(
                    move |_vm| {
                        run_order.lock().push(worker);
                        Ok(HostValue::Integer(worker as i64))
                    },
                    TypeKey::of::<i64>(),
                );
                enqueued.push(worker);
                (worker, completion)
            })
        })
        .collect();
    let completions: Vec<_> = producers.into_iter().map(|p| p.join().unwrap()).collect();
    assert_eq!(scheduler.pending(), 3);

    let mut vm = State::new();
    assert_eq!(scheduler.drain(&mut vm), 3);
    assert_eq!(scheduler.drain(&mut vm), 0);
    assert_eq!(*run_order.lock(), *enqueue_order.lock());

    for (worker, mut completion) in completions {
        assert_eq!(
            completion.try_take(),
            Some(Ok(HostValue::Integer(worker as i64)))
        );
    }
    assert_eq!(scheduler.stats().completed, 3);
}

#[test]
fn test_close_resolves_tasks_enqueued_concurrently() {
    let scheduler = Arc::new(TaskScheduler::new());
    let barrier = Arc::new(Barrier::new(5));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..500)
                    .map(|_| scheduler.enqueue(|_| Ok(HostValue::Nil), TypeKey::of::<()>()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    barrier.wait();
    scheduler.close();

    for producer in producers {
        for completion in producer.join().unwrap() {
            assert_eq!(completion.wait(), Err(BridgeError::SchedulerClosed));
        }
    }
    assert!(scheduler.is_closed());
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(scheduler.stats().dropped, 2000);
}

#[test]
fn test_worker_waits_for_vm_tick() {
    let scheduler = Arc::new(TaskScheduler::new());
    let mut vm = State::new();
    scheduler.install(&mut vm, "test.scheduler");

    let worker = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || {
            scheduler
                .enqueue(
                    |vm: &mut dyn LuaApi| {
                        vm.push_string("ran on vm");
                        Ok(HostValue::String(vm.to_str(-1).unwrap_or_default()))
                    },
                    TypeKey::of::<String>(),
                )
                .wait()
        })
    };

    while scheduler.pending() == 0 {
        thread::yield_now();
    }
    vm.tick().unwrap();
    assert_eq!(vm.top(), 0);
    assert_eq!(
        worker.join().unwrap(),
        Ok(HostValue::String("ran on vm".into()))
    );
}

#[test]
fn test_result_type_is_checked() {
    let scheduler = TaskScheduler::new();
    let mut completion = scheduler.enqueue(|_| Ok(HostValue::Bool(true)), TypeKey::of::<String>());
    let mut vm = State::new();
    scheduler.drain(&mut vm);
    assert!(matches!(
        completion.try_take(),
        Some(Err(BridgeError::TypeMismatch { .. }))
    ));
    assert_eq!(scheduler.stats().failed, 1);
}

#[test]
fn test_closed_scheduler_resolves_everything() {
    let scheduler = TaskScheduler::new();
    let queued = scheduler.enqueue(|_| Ok(HostValue::Nil), TypeKey::of::<()>());
    assert_eq!(scheduler.close(), 1);
    assert_eq!(queued.wait(), Err(BridgeError::SchedulerClosed));

    let late = scheduler.enqueue(|_| Ok(HostValue::Nil), TypeKey::of::<()>());
    assert_eq!(late.wait(), Err(BridgeError::SchedulerClosed));
    assert_eq!(scheduler.stats().dropped, 2);
}
