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

//! Manual completion of pooled promises.

use super::{FiberTaskStatus, PromiseKind, PromisePool};
use crate::error::{FiberError, FiberResult};
use crate::task::FiberTask;
use std::sync::Arc;

/// The producing side of a [`FiberTask`] completed by hand.
///
/// A source is how asynchronous work living outside the fiber runtime, such as
/// a platform I/O callback, hands its result back. The callback posts to the
/// [`Scheduler`](crate::Scheduler), and the posted closure resolves the source on
/// the logical thread.
///
/// Dropping a source that was never resolved faults its task with
/// [`FiberError::SourceDropped`].
pub struct FiberTaskSource<T: Send + 'static> {
    pool: Arc<PromisePool<T>>,
    index: u32,
    generation: u16,
    settled: bool,
}

impl<T: Send + 'static> FiberTaskSource<T> {
    pub(crate) fn new(pool: Arc<PromisePool<T>>) -> Self {
        let (index, generation) = pool.rent(PromiseKind::Source);
        Self {
            pool,
            index,
            generation,
            settled: false,
        }
    }

    /// Returns a handle to the task this source completes.
    pub fn task(&self) -> FiberTask<T> {
        FiberTask::pooled(Arc::clone(&self.pool), self.index, self.generation)
    }

    /// Returns `true` if a consumer canceled the task.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self.pool.status(self.index, self.generation),
            Ok(FiberTaskStatus::Canceled)
        )
    }

    /// Completes the task with `value`.
    ///
    /// ## Returns
    ///
    /// `Ok(false)` if the task was canceled in the meantime.
    pub fn resolve(mut self, value: T) -> FiberResult<bool> {
        self.settle(Ok(value))
    }

    /// Fails the task with `error`.
    pub fn reject(mut self, error: impl Into<FiberError>) -> FiberResult<bool> {
        self.settle(Err(error.into()))
    }

    /// Cancels the task from the producing side.
    pub fn cancel(mut self) -> FiberResult<bool> {
        self.settled = true;
        self.pool.cancel(self.index, self.generation)
    }

    fn settle(&mut self, outcome: FiberResult<T>) -> FiberResult<bool> {
        self.settled = true;
        self.pool.complete(self.index, self.generation, outcome)
    }
}

impl<T: Send + 'static> Drop for FiberTaskSource<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Ok(true) = self.settle(Err(FiberError::SourceDropped)) {
            log::warn!(
                "Fiber task source {}@{} was dropped before it was resolved.",
                self.index,
                self.generation
            );
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for FiberTaskSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberTaskSource")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("settled", &self.settled)
            .finish()
    }
}
