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

//! Waiting for every task of a set.

use super::{Building, Combinator};
use crate::error::{FiberError, FiberResult};
use crate::promise::{PromiseKind, PromisePool};
use crate::task::FiberTask;
use std::sync::Arc;

/// Counts settled children of a WhenAll promise.
#[derive(Default)]
pub(crate) struct WhenAllState {
    expected: usize,
    settled: usize,
    begun: bool,
    done: bool,
    failure: Option<FiberError>,
}

impl Combinator for WhenAllState {
    const NAME: &'static str = "WhenAll";

    fn state_mut(kind: &mut PromiseKind<()>) -> Option<&mut Self> {
        match kind {
            PromiseKind::WhenAll(state) => Some(state),
            _ => None,
        }
    }

    fn add_child(&mut self) {
        self.expected += 1;
    }

    fn record(&mut self, outcome: FiberResult<()>) {
        self.settled += 1;
        match outcome {
            Ok(()) | Err(FiberError::Canceled) => {}
            Err(error) => {
                self.failure.get_or_insert(error);
            }
        }
    }

    fn begin(&mut self) {
        self.begun = true;
    }

    fn take_if_done(&mut self) -> Option<FiberResult<()>> {
        if self.done || !self.begun || self.settled < self.expected {
            return None;
        }
        self.done = true;
        Some(self.failure.take().map_or(Ok(()), Err))
    }
}

/// Builds a task that completes once every added task has settled.
///
/// The task succeeds if no child faulted, otherwise it faults with the first
/// failure. Canceled children count as settled. Canceling the WhenAll task does
/// not cancel its children.
///
/// ```ignore
/// let all = fibers.when_all().add(&load_mesh).add(&load_texture).begin();
/// ```
#[must_use = "a WhenAll is canceled if it is dropped before `begin` is called"]
pub struct WhenAllBuilder {
    building: Building<WhenAllState>,
}

impl WhenAllBuilder {
    pub(crate) fn new(pool: Arc<PromisePool<()>>) -> Self {
        Self {
            building: Building::new(pool, PromiseKind::WhenAll(WhenAllState::default())),
        }
    }

    /// Adds a child. Tasks that have already completed are counted too.
    pub fn add<T: Send + 'static>(mut self, task: &FiberTask<T>) -> Self {
        self.building.add(task);
        self
    }

    /// Closes the set of children and returns the WhenAll task.
    pub fn begin(mut self) -> FiberTask<()> {
        self.building.begin()
    }
}

impl std::fmt::Debug for WhenAllBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhenAllBuilder").finish_non_exhaustive()
    }
}
