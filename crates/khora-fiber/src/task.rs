// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Task handles and their awaiters.

use crate::combinators::failure::FailedPromise;
use crate::error::{FiberError, FiberResult};
use crate::pool::lock;
use crate::promise::{FiberTaskStatus, PromisePool};
use crate::scheduler::Continuation;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Reads the outcome of a settled task, whatever its value type.
pub(crate) type OutcomeReader = Box<dyn Fn() -> FiberResult<()> + Send>;

/// A handle to an asynchronous operation producing a `T`.
///
/// A handle either refers to a pooled promise together with the generation it
/// observed when it was created, or carries an already-known outcome inline.
/// Handles do not own their promise. Once the promise is recycled, every
/// operation on an old handle fails with [`FiberError::StaleHandle`].
///
/// Awaiting a handle inside a fiber suspends the fiber until the promise settles:
///
/// ```ignore
/// let texture = fibers.spawn(async move { load_texture(path).await });
/// let texture = texture.await?;
/// ```
pub struct FiberTask<T: Send + 'static = ()> {
    source: TaskSource<T>,
}

enum TaskSource<T: Send + 'static> {
    Ready(T),
    Failed(FailedPromise),
    Pooled {
        pool: Arc<PromisePool<T>>,
        index: u32,
        generation: u16,
    },
}

impl<T: Send + 'static> FiberTask<T> {
    pub(crate) fn pooled(pool: Arc<PromisePool<T>>, index: u32, generation: u16) -> Self {
        Self {
            source: TaskSource::Pooled {
                pool,
                index,
                generation,
            },
        }
    }

    /// Creates a handle to an already-known value. No promise is rented.
    pub fn from_result(value: T) -> Self {
        Self {
            source: TaskSource::Ready(value),
        }
    }

    /// Creates a handle to an operation that already failed.
    ///
    /// Passing [`FiberError::Canceled`] yields a canceled task.
    pub fn from_error(error: impl Into<FiberError>) -> Self {
        Self {
            source: TaskSource::Failed(FailedPromise::new(error.into())),
        }
    }

    /// Returns the status of the operation.
    ///
    /// ## Returns
    ///
    /// [`FiberError::StaleHandle`] if the promise has been recycled since this
    /// handle was created.
    pub fn status(&self) -> FiberResult<FiberTaskStatus> {
        self.peek_status().inspect_err(|error| {
            log::error!("Status query on a stale fiber task: {error}");
        })
    }

    /// Returns `true` once the operation has left [`FiberTaskStatus::Pending`].
    ///
    /// A stale handle is reported as completed.
    pub fn is_completed(&self) -> bool {
        self.peek_status().map_or(true, FiberTaskStatus::is_completed)
    }

    /// Cancels the operation if it is still pending.
    ///
    /// Canceling never touches a promise that has been recycled: a stale handle
    /// gets [`FiberError::StaleHandle`] back and the slot's new occupant is left
    /// untouched. Canceling a task that already completed is a no-op returning
    /// `Ok(false)`.
    pub fn cancel(&self) -> FiberResult<bool> {
        match &self.source {
            TaskSource::Ready(_) | TaskSource::Failed(_) => Ok(false),
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => pool.cancel(*index, *generation).inspect_err(|error| {
                log::error!("Cancel on a stale fiber task was ignored: {error}");
            }),
        }
    }

    /// Runs the operation as fire-and-forget.
    ///
    /// A failure is logged once the operation settles instead of being reported
    /// as unobserved.
    pub fn forget(self) {
        let read_outcome = self.outcome_reader();
        let registered = self.on_completed(Box::new(move || {
            if let Err(error) = read_outcome() {
                if !error.is_canceled() {
                    log::error!("A forgotten fiber task failed: {error}");
                }
            }
        }));
        if let Err(error) = registered {
            log::error!("Forgetting a stale fiber task: {error}");
        }
    }

    /// The generation observed by this handle, `None` for inline outcomes.
    pub fn generation(&self) -> Option<u16> {
        match &self.source {
            TaskSource::Pooled { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    /// Returns `true` if the outcome is carried inline, without a pooled promise.
    pub fn is_inline(&self) -> bool {
        !matches!(self.source, TaskSource::Pooled { .. })
    }

    pub(crate) fn peek_status(&self) -> FiberResult<FiberTaskStatus> {
        match &self.source {
            TaskSource::Ready(_) => Ok(FiberTaskStatus::Succeeded),
            TaskSource::Failed(failed) => Ok(failed.status()),
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => pool.status(*index, *generation),
        }
    }

    /// Registers a continuation, running it right away if the task is complete.
    pub(crate) fn on_completed(&self, continuation: Continuation) -> FiberResult<()> {
        match &self.source {
            TaskSource::Ready(_) | TaskSource::Failed(_) => {
                continuation();
                Ok(())
            }
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => pool.on_completed(*index, *generation, continuation),
        }
    }

    /// Registers a combinator hook, run even when the task is canceled lazily.
    pub(crate) fn on_settled(&self, hook: Continuation) -> FiberResult<()> {
        match &self.source {
            TaskSource::Ready(_) | TaskSource::Failed(_) => {
                hook();
                Ok(())
            }
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => pool.on_settled(*index, *generation, hook),
        }
    }

    /// Returns a closure reading how this task ended, without its value.
    pub(crate) fn outcome_reader(&self) -> OutcomeReader {
        match &self.source {
            TaskSource::Ready(_) => Box::new(|| Ok(())),
            TaskSource::Failed(failed) => {
                let error = failed.error();
                Box::new(move || Err(error.clone()))
            }
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => {
                let (pool, index, generation) = (Arc::clone(pool), *index, *generation);
                Box::new(move || pool.outcome(index, generation))
            }
        }
    }
}

impl<T: Clone + Send + 'static> FiberTask<T> {
    /// Returns the value of a completed operation.
    ///
    /// ## Returns
    ///
    /// The captured failure if the operation faulted, [`FiberError::Canceled`]
    /// if it was canceled and [`FiberError::NotCompleted`] if it is still pending.
    pub fn result(&self) -> FiberResult<T> {
        self.get_result().inspect_err(|error| {
            if error.is_stale() {
                log::error!("Result query on a stale fiber task: {error}");
            }
        })
    }

    /// Returns the awaiter of this task.
    pub fn awaiter(&self) -> FiberTaskAwaiter<T> {
        FiberTaskAwaiter::new(self.clone())
    }

    fn get_result(&self) -> FiberResult<T> {
        match &self.source {
            TaskSource::Ready(value) => Ok(value.clone()),
            TaskSource::Failed(failed) => Err(failed.error()),
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => pool.result(*index, *generation),
        }
    }
}

impl FiberTask<()> {
    /// A task that has already succeeded.
    pub fn completed() -> Self {
        Self::from_result(())
    }
}

impl<T: Clone + Send + 'static> Clone for FiberTask<T> {
    fn clone(&self) -> Self {
        let source = match &self.source {
            TaskSource::Ready(value) => TaskSource::Ready(value.clone()),
            TaskSource::Failed(failed) => TaskSource::Failed(failed.clone()),
            TaskSource::Pooled {
                pool,
                index,
                generation,
            } => TaskSource::Pooled {
                pool: Arc::clone(pool),
                index: *index,
                generation: *generation,
            },
        };
        Self { source }
    }
}

impl<T: Send + 'static> fmt::Debug for FiberTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            TaskSource::Ready(_) => f.write_str("FiberTask(ready)"),
            TaskSource::Failed(failed) => write!(f, "FiberTask({})", failed.status()),
            TaskSource::Pooled {
                index, generation, ..
            } => write!(f, "FiberTask({index}@{generation})"),
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for FiberTask<T> {
    type Output = FiberResult<T>;
    type IntoFuture = FiberTaskAwaiter<T>;

    fn into_future(self) -> Self::IntoFuture {
        FiberTaskAwaiter::new(self)
    }
}

impl<T: Clone + Send + 'static> IntoFuture for &FiberTask<T> {
    type Output = FiberResult<T>;
    type IntoFuture = FiberTaskAwaiter<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.awaiter()
    }
}

/// Suspends a fiber until a [`FiberTask`] completes.
///
/// The awaiter registers a single continuation on the task's promise the first
/// time it finds the task pending; that continuation wakes whichever fiber
/// polled it last.
#[must_use = "futures do nothing unless awaited"]
pub struct FiberTaskAwaiter<T: Clone + Send + 'static> {
    task: FiberTask<T>,
    registered: AtomicBool,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl<T: Clone + Send + 'static> FiberTaskAwaiter<T> {
    fn new(task: FiberTask<T>) -> Self {
        Self {
            task,
            registered: AtomicBool::new(false),
            waker: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns `true` once the task has completed.
    pub fn is_completed(&self) -> bool {
        self.task.is_completed()
    }

    /// Returns the outcome of the task. See [`FiberTask::result`].
    pub fn get_result(&self) -> FiberResult<T> {
        self.task.result()
    }

    /// Runs `continuation` once the task completes, or right away if it already has.
    pub fn on_completed(&self, continuation: impl FnOnce() + Send + 'static) -> FiberResult<()> {
        self.task.on_completed(Box::new(continuation))
    }
}

impl<T: Clone + Send + 'static> Future for FiberTaskAwaiter<T> {
    type Output = FiberResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.into_ref().get_ref();
        match this.task.peek_status() {
            Ok(FiberTaskStatus::Pending) => {}
            Ok(_) => return Poll::Ready(this.task.result()),
            Err(error) => {
                log::error!("Awaiting a stale fiber task: {error}");
                return Poll::Ready(Err(error));
            }
        }

        *lock(&this.waker) = Some(cx.waker().clone());
        if !this.registered.swap(true, Ordering::AcqRel) {
            let slot = Arc::clone(&this.waker);
            let registered = this.task.on_completed(Box::new(move || {
                let waker = lock(&slot).take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }));
            if let Err(error) = registered {
                return Poll::Ready(Err(error));
            }
        }
        Poll::Pending
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for FiberTaskAwaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberTaskAwaiter")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_value_needs_no_promise() {
        let task = FiberTask::from_result(42u32);

        assert!(task.is_inline());
        assert_eq!(task.generation(), None);
        assert_eq!(task.status().unwrap(), FiberTaskStatus::Succeeded);
        assert_eq!(task.result().unwrap(), 42);
        assert!(!task.cancel().unwrap(), "Inline tasks cannot be canceled");
    }

    #[test]
    fn test_failed_task_re_raises_its_error_to_every_reader() {
        let task: FiberTask<u32> = FiberTask::from_error(anyhow::anyhow!("corrupt archive"));
        let copy = task.clone();

        assert_eq!(task.status().unwrap(), FiberTaskStatus::Faulted);
        for reader in [task, copy] {
            let error = reader.result().unwrap_err();
            assert_eq!(error.to_string(), "The fiber task faulted: corrupt archive");
        }
    }

    #[test]
    fn test_canceled_inline_task() {
        let task: FiberTask = FiberTask::from_error(FiberError::Canceled);
        assert_eq!(task.status().unwrap(), FiberTaskStatus::Canceled);
        assert!(task.result().unwrap_err().is_canceled());
    }

    #[test]
    fn test_completed_task_runs_continuations_inline() {
        let task = FiberTask::completed();
        let awaiter = task.awaiter();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        awaiter
            .on_completed(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        assert!(awaiter.is_completed());
        assert!(ran.load(Ordering::SeqCst));
        assert!(awaiter.get_result().is_ok());
    }
}
