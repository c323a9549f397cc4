//! Cancellable lifetime tokens with deadlines and structured subtasks.
//!
//! A [Task] resolves its terminal slot exactly once, either through
//! [Task::cancel] (abortive) or [Task::cleanup] (intentional completion).
//! Work that must stop when the task resolves awaits [Task::resolved] or
//! runs under [Task::race], [Task::wrap] or [Task::poll]. Subtasks derived
//! with [Task::subtask] cancel automatically when their parent resolves.

use futures::future::Either;
use futures::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Longest representable deadline; anything above is clamped.
const MAX_DEADLINE_MS: u64 = i32::MAX as u64;

/// Sentinel deadline meaning "never".
pub const NO_DEADLINE: u64 = u64::MAX;

/// Error surfaced to consumers awaiting work under a resolved task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Task cancelled: {reason}")]
pub struct Cancelled {
    pub reason: String,
}

/// Outcome of [Task::race].
#[derive(Debug, PartialEq, Eq)]
pub enum Raced<T> {
    Value(T),
    Cancelled(String),
}

/// Verdict of one [Task::poll] iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum PollStep {
    Continue,
    Done,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct Task {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    cancelled: Option<String>,
    watchers: Vec<futures::channel::oneshot::Sender<String>>,
    deadline: Option<async_std::task::JoinHandle<()>>,
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cancelled: None,
                watchers: Vec::new(),
                deadline: None,
            })),
        }
    }

    /// Resolves the terminal slot abortively. A second resolution is a
    /// no-op.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.resolve(reason.into());
    }

    /// Resolves the terminal slot as intentional completion; the reason is
    /// recorded with a `"cleanup: "` prefix and the deadline timer is
    /// cleared.
    pub fn cleanup(&self, reason: impl Into<String>) {
        self.resolve(format!("cleanup: {}", reason.into()));
    }

    /// The recorded reason, once resolved. Stable across calls.
    pub fn cancelled(&self) -> Option<String> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    /// Awaits the terminal slot, yielding the recorded reason.
    pub fn resolved(&self) -> impl Future<Output = String> + Send + 'static {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.cancelled {
                Some(reason) => Either::Left(future::ready(reason.clone())),
                None => {
                    let (sender, receiver) = futures::channel::oneshot::channel();
                    inner.watchers.push(sender);
                    Either::Right(receiver.then(|result| match result {
                        Ok(reason) => future::ready(reason).left_future(),
                        // The task was dropped without resolving; park
                        // forever so racing consumers fall through to their
                        // own side.
                        Err(_dropped) => future::pending().right_future(),
                    }))
                }
            }
        };
        receiver
    }

    /// Schedules a cancel with reason `"timeout: <reason>"` after `ms`
    /// milliseconds. [NO_DEADLINE] is a no-op; excessive values clamp. A
    /// new deadline replaces any previously armed one.
    pub fn deadline(&self, ms: u64, reason: impl Into<String>) {
        if ms == NO_DEADLINE {
            return;
        }
        let ms = ms.min(MAX_DEADLINE_MS);
        let reason = reason.into();
        let task = self.clone();
        let timer = async_std::task::spawn(async move {
            async_std::task::sleep(Duration::from_millis(ms)).await;
            task.cancel(format!("timeout: {}", reason));
        });
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled.is_some() {
            drop(inner);
            async_std::task::spawn(timer.cancel());
            return;
        }
        if let Some(previous) = inner.deadline.replace(timer) {
            async_std::task::spawn(previous.cancel());
        }
    }

    /// Races `fut` against the terminal slot, then cleans the task up.
    pub async fn race<T>(&self, fut: impl Future<Output = T>) -> Raced<T> {
        let resolved = self.resolved();
        futures::pin_mut!(fut);
        futures::pin_mut!(resolved);
        let outcome = match future::select(fut, resolved).await {
            Either::Left((value, _)) => Raced::Value(value),
            Either::Right((reason, _)) => Raced::Cancelled(reason),
        };
        self.cleanup("race finished");
        outcome
    }

    /// Loops `step` until the task resolves, the step reports [PollStep::Done],
    /// or it reports a failure reason (which cancels the task). Returns the
    /// terminal reason, or `None` after a normal [PollStep::Done].
    pub async fn poll<F, Fut>(&self, mut step: F) -> Option<String>
    where
        F: FnMut(Task) -> Fut,
        Fut: Future<Output = PollStep>,
    {
        loop {
            if let Some(reason) = self.cancelled() {
                return Some(reason);
            }
            match step(self.clone()).await {
                PollStep::Continue => {}
                PollStep::Done => return None,
                PollStep::Fail(reason) => {
                    self.cancel(reason.clone());
                    return Some(reason);
                }
            }
        }
    }

    /// Runs `fut` under a fresh subtask raced against it, returning a
    /// handle that can cancel the work or give it its own deadline.
    pub fn wrap<T, Fut>(&self, fut: Fut) -> TaskHandle<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let subtask = self.subtask();
        let resolved = subtask.resolved();
        let fut = async move {
            futures::pin_mut!(fut);
            futures::pin_mut!(resolved);
            match future::select(fut, resolved).await {
                Either::Left((value, _)) => Ok(value),
                Either::Right((reason, _)) => Err(Cancelled { reason }),
            }
        }
        .boxed();
        TaskHandle {
            task: subtask,
            fut,
        }
    }

    /// Derives a child task that cancels with `"parent cancelled: …"` once
    /// this task resolves.
    pub fn subtask(&self) -> Task {
        let child = Task::new();
        let child2 = child.clone();
        let parent_resolved = self.resolved();
        async_std::task::spawn(async move {
            let reason = parent_resolved.await;
            child2.cancel(format!("parent cancelled: {}", reason));
        });
        child
    }

    fn resolve(&self, reason: String) {
        let (watchers, deadline) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled.is_some() {
                return;
            }
            tracing::trace!(%reason, "task resolved");
            inner.cancelled = Some(reason.clone());
            (
                std::mem::take(&mut inner.watchers),
                inner.deadline.take(),
            )
        };
        for watcher in watchers {
            let _ = watcher.send(reason.clone());
        }
        if let Some(timer) = deadline {
            async_std::task::spawn(timer.cancel());
        }
    }
}

/// Handle returned by [Task::wrap]: awaitable for the raced result and
/// able to cancel or deadline the wrapped work.
pub struct TaskHandle<T> {
    task: Task,
    fut: future::BoxFuture<'static, Result<T, Cancelled>>,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self, reason: impl Into<String>) {
        self.task.cancel(reason);
    }

    pub fn deadline(&self, ms: u64, reason: impl Into<String>) -> &Self {
        self.task.deadline(ms, reason);
        self
    }

    /// The subtask controlling the wrapped work.
    pub fn task(&self) -> &Task {
        &self.task
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, Cancelled>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("task", &self.task).finish()
    }
}
