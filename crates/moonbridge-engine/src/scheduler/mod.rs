//! Async Bridge (Task Scheduler)
//!
//! Host work finishing on arbitrary threads must not touch the VM. It queues
//! a callback here instead; the VM thread drains the queue once per tick and
//! runs each callback there, in FIFO order.
//!
//! - [`TaskScheduler::enqueue`] is callable from any thread.
//! - [`TaskScheduler::drain`] runs only the tasks queued when it starts;
//!   tasks enqueued by a running callback wait for the next tick.
//! - Every completion is resolved exactly once.

mod task;

pub use task::{CompletionHandle, ScheduledTask, TaskCallback, TaskId};

use crate::bridge::marshal;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostValue, TypeKey};
use crate::vm::{LuaApi, LuaResult};
use crossbeam::channel::{self, Receiver, Sender};
use std::rc::Rc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by `enqueue`
    pub enqueued: u64,
    /// Tasks that ran and produced a value
    pub completed: u64,
    /// Tasks that ran and failed (including result type mismatches)
    pub failed: u64,
    /// Tasks dropped without running
    pub dropped: u64,
}

/// Multi-producer queue of callbacks for the VM thread
pub struct TaskScheduler {
    tx: Sender<ScheduledTask>,
    rx: Receiver<ScheduledTask>,
    /// Held shared by `enqueue` across its check and send, exclusively by `close`
    closed: RwLock<bool>,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl TaskScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            closed: RwLock::new(false),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `callback` to run on the VM thread. Its result must conform to
    /// `result_type`.
    pub fn enqueue<F>(&self, callback: F, result_type: TypeKey) -> CompletionHandle
    where
        F: FnOnce(&mut dyn LuaApi) -> BridgeResult<HostValue> + Send + 'static,
    {
        let (task, handle) = ScheduledTask::new(Box::new(callback), result_type);
        let closed = self.closed.read();
        if *closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            task.resolve(Err(BridgeError::SchedulerClosed));
            return handle;
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Err(channel::SendError(task)) = self.tx.send(task) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            task.resolve(Err(BridgeError::SchedulerClosed));
        }
        drop(closed);
        handle
    }

    /// Run the tasks queued at the moment of the call. VM thread only.
    /// Returns the number of tasks run.
    pub fn drain(&self, vm: &mut dyn LuaApi) -> usize {
        let pending = self.rx.len();
        let mut ran = 0;
        for _ in 0..pending {
            let Ok(task) = self.rx.try_recv() else {
                break;
            };
            self.run(vm, task);
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, "scheduler drained");
        }
        ran
    }

    fn run(&self, vm: &mut dyn LuaApi, task: ScheduledTask) {
        let ScheduledTask {
            id,
            callback,
            result_type,
            completion,
        } = task;

        let base = vm.top();
        let result = callback(&mut *vm).and_then(|value| {
            if marshal::conforms(&value, result_type) {
                Ok(value)
            } else {
                Err(BridgeError::mismatch(result_type.short_name(), value.kind_name()))
            }
        });
        vm.set_top(base);

        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task = %id, error = %err, "scheduled task failed");
            }
        }
        if completion.send(result).is_err() {
            tracing::trace!(task = %id, "completion dropped before resolution");
        }
    }

    /// Number of tasks waiting for a drain
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drain on every tick of `vm` under the hook id `hook_id`
    pub fn install(self: &Arc<Self>, vm: &mut dyn LuaApi, hook_id: &str) {
        let scheduler = Arc::clone(self);
        vm.add_tick_hook(
            hook_id,
            Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
                scheduler.drain(vm);
                Ok(0)
            }),
        );
        tracing::debug!(hook = hook_id, "scheduler installed");
    }

    /// Remove the tick hook installed by [`install`](Self::install)
    pub fn uninstall(&self, vm: &mut dyn LuaApi, hook_id: &str) -> bool {
        let removed = vm.remove_tick_hook(hook_id);
        if removed {
            tracing::debug!(hook = hook_id, "scheduler uninstalled");
        }
        removed
    }

    /// Stop accepting tasks and resolve everything still queued with
    /// `SchedulerClosed`. Returns the number of tasks dropped.
    pub fn close(&self) -> usize {
        *self.closed.write() = true;
        let mut dropped = 0;
        while let Ok(task) = self.rx.try_recv() {
            task.resolve(Err(BridgeError::SchedulerClosed));
            dropped += 1;
        }
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Current counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::State;

    #[test]
    fn test_drain_runs_in_order() {
        let scheduler = TaskScheduler::new();
        let mut vm = State::new();
        let a = scheduler.enqueue(|_| Ok(HostValue::Integer(1)), TypeKey::of::<i64>());
        let mut b = scheduler.enqueue(|_| Ok(HostValue::Integer(2)), TypeKey::of::<i64>());
        assert!(b.try_take().is_none());

        assert_eq!(scheduler.drain(&mut vm), 2);
        assert_eq!(a.wait().unwrap(), HostValue::Integer(1));
        assert_eq!(b.try_take().unwrap().unwrap(), HostValue::Integer(2));
        assert_eq!(scheduler.drain(&mut vm), 0);
    }

    #[test]
    fn test_result_type_is_checked() {
        let scheduler = TaskScheduler::new();
        let mut vm = State::new();
        let handle = scheduler.enqueue(|_| Ok(HostValue::Bool(true)), TypeKey::of::<String>());
        scheduler.drain(&mut vm);
        assert_eq!(
            handle.wait().unwrap_err(),
            BridgeError::mismatch("String", "bool")
        );
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[test]
    fn test_tasks_enqueued_while_draining_wait() {
        let scheduler = Arc::new(TaskScheduler::new());
        let mut vm = State::new();
        let inner = Arc::clone(&scheduler);
        let late = Arc::new(parking_lot::Mutex::new(None));
        let late_slot = Arc::clone(&late);
        scheduler.enqueue(
            move |_| {
                *late_slot.lock() = Some(inner.enqueue(|_| Ok(HostValue::Nil), TypeKey::of::<()>()));
                Ok(HostValue::Nil)
            },
            TypeKey::of::<()>(),
        );

        assert_eq!(scheduler.drain(&mut vm), 1);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.drain(&mut vm), 1);
        let handle = late.lock().take().unwrap();
        assert_eq!(handle.wait().unwrap(), HostValue::Nil);
    }

    #[test]
    fn test_tick_hook_drains() {
        let scheduler = Arc::new(TaskScheduler::new());
        let mut vm = State::new();
        scheduler.install(&mut vm, "drain");
        let handle = scheduler.enqueue(|vm| {
            vm.push_number(4.0);
            Ok(HostValue::Number(vm.to_number(-1).unwrap_or_default()))
        }, TypeKey::of::<f64>());

        vm.tick().unwrap();
        assert_eq!(handle.wait().unwrap(), HostValue::Number(4.0));
        assert_eq!(vm.top(), 0);

        assert!(scheduler.uninstall(&mut vm, "drain"));
        assert_eq!(vm.tick_hook_count(), 0);
    }

    #[test]
    fn test_close_drops_pending() {
        let scheduler = TaskScheduler::new();
        let queued = scheduler.enqueue(|_| Ok(HostValue::Nil), TypeKey::of::<()>());
        assert_eq!(scheduler.close(), 1);
        assert_eq!(queued.wait().unwrap_err(), BridgeError::SchedulerClosed);

        let late = scheduler.enqueue(|_| Ok(HostValue::Nil), TypeKey::of::<()>());
        assert_eq!(late.wait().unwrap_err(), BridgeError::SchedulerClosed);
        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                enqueued: 1,
                completed: 0,
                failed: 0,
                dropped: 2
            }
        );
    }
}
