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

//! Waiting for the first task of a set.

use super::{unless_canceled, Building, Combinator};
use crate::error::{FiberError, FiberResult};
use crate::promise::{PromiseKind, PromisePool};
use crate::task::FiberTask;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct WhenAnyState {
    candidates: usize,
    canceled: usize,
    begun: bool,
    done: bool,
    winner: Option<FiberResult<()>>,
}

impl Combinator for WhenAnyState {
    const NAME: &'static str = "WhenAny";

    fn state_mut(kind: &mut PromiseKind<()>) -> Option<&mut Self> {
        match kind {
            PromiseKind::WhenAny(state) => Some(state),
            _ => None,
        }
    }

    fn add_child(&mut self) {
        self.candidates += 1;
    }

    fn record(&mut self, outcome: FiberResult<()>) {
        match unless_canceled(outcome) {
            None => self.canceled += 1,
            Some(outcome) => {
                if !self.done && self.winner.is_none() {
                    self.winner = Some(outcome);
                }
            }
        }
    }

    fn begin(&mut self) {
        self.begun = true;
    }

    fn take_if_done(&mut self) -> Option<FiberResult<()>> {
        if self.done || !self.begun {
            return None;
        }
        let outcome = match self.winner.take() {
            Some(outcome) => outcome,
            None if self.canceled >= self.candidates => Err(FiberError::Canceled),
            None => return None,
        };
        self.done = true;
        Some(outcome)
    }
}

/// Builds a task that completes with the first added task to settle.
///
/// The first child to succeed or fault decides the outcome and later children
/// are ignored. A canceled child drops out of the race; if every child is
/// canceled, or none was added, the WhenAny task is canceled. Canceling the
/// WhenAny task does not cancel its children.
#[must_use = "a WhenAny is canceled if it is dropped before `begin` is called"]
pub struct WhenAnyBuilder {
    building: Building<WhenAnyState>,
}

impl WhenAnyBuilder {
    pub(crate) fn new(pool: Arc<PromisePool<()>>) -> Self {
        Self {
            building: Building::new(pool, PromiseKind::WhenAny(WhenAnyState::default())),
        }
    }

    /// Adds a candidate.
    pub fn add<T: Send + 'static>(mut self, task: &FiberTask<T>) -> Self {
        self.building.add(task);
        self
    }

    /// Closes the race and returns the WhenAny task.
    pub fn begin(mut self) -> FiberTask<()> {
        self.building.begin()
    }
}

impl std::fmt::Debug for WhenAnyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhenAnyBuilder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_settled_child_wins() {
        let mut state = WhenAnyState::default();
        state.add_child();
        state.add_child();
        state.begin();

        state.record(Err(FiberError::faulted(anyhow::anyhow!("lost the race"))));
        state.record(Ok(()));

        let outcome = state.take_if_done().unwrap();
        assert!(outcome.is_err());
        assert!(state.take_if_done().is_none());
    }

    #[test]
    fn test_cancellations_drop_out_of_the_race() {
        let mut state = WhenAnyState::default();
        state.add_child();
        state.add_child();
        state.begin();

        state.record(Err(FiberError::Canceled));
        assert!(state.take_if_done().is_none());

        state.record(Err(FiberError::Canceled));
        assert!(matches!(state.take_if_done(), Some(Err(FiberError::Canceled))));
    }

    #[test]
    fn test_empty_race_is_canceled() {
        let mut state = WhenAnyState::default();
        state.begin();
        assert!(matches!(state.take_if_done(), Some(Err(FiberError::Canceled))));
    }

    #[test]
    fn test_winner_recorded_before_begin_is_kept() {
        let mut state = WhenAnyState::default();
        state.add_child();
        state.record(Ok(()));
        assert!(state.take_if_done().is_none());

        state.begin();
        assert!(matches!(state.take_if_done(), Some(Ok(()))));
    }
}
