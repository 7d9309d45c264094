//! Scheduled tasks and their completions

use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostValue, TypeKey};
use crate::vm::LuaApi;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Unique identifier for a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Work run on the VM thread
pub type TaskCallback = Box<dyn FnOnce(&mut dyn LuaApi) -> BridgeResult<HostValue> + Send>;

/// A queued callback with its expected result type and completion
pub struct ScheduledTask {
    pub(crate) id: TaskId,
    pub(crate) callback: TaskCallback,
    pub(crate) result_type: TypeKey,
    pub(crate) completion: oneshot::Sender<BridgeResult<HostValue>>,
}

impl ScheduledTask {
    pub(crate) fn new(callback: TaskCallback, result_type: TypeKey) -> (Self, CompletionHandle) {
        let id = TaskId::new();
        let (tx, rx) = oneshot::channel();
        let task = Self {
            id,
            callback,
            result_type,
            completion: tx,
        };
        (task, CompletionHandle { id, rx })
    }

    /// Resolve the completion; a dropped handle is not an error
    pub(crate) fn resolve(self, result: BridgeResult<HostValue>) {
        if self.completion.send(result).is_err() {
            tracing::trace!(task = %self.id, "completion dropped before resolution");
        }
    }
}

/// Receiving end of a task's result.
///
/// Resolves exactly once: with the callback's value, its error, or
/// `SchedulerClosed` if the task was dropped without running.
#[derive(Debug)]
pub struct CompletionHandle {
    id: TaskId,
    rx: oneshot::Receiver<BridgeResult<HostValue>>,
}

impl CompletionHandle {
    /// Task this handle belongs to
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the current thread until the task has run.
    ///
    /// Must not be called on the VM thread (the task could never run) nor
    /// from inside an async runtime.
    pub fn wait(self) -> BridgeResult<HostValue> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(BridgeError::SchedulerClosed))
    }

    /// Result if the task has run; `None` while it is pending
    pub fn try_take(&mut self) -> Option<BridgeResult<HostValue>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BridgeError::SchedulerClosed)),
        }
    }
}

impl Future for CompletionHandle {
    type Output = BridgeResult<HostValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BridgeError::SchedulerClosed)))
    }
}
