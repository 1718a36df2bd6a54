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

//! Composite waits built on pooled promises.
//!
//! [`WhenAllBuilder`](when_all::WhenAllBuilder) and
//! [`WhenAnyBuilder`](when_any::WhenAnyBuilder) share a two-phase protocol:
//! children are added one by one, then `begin` marks the set as closed. Children
//! may settle at any point, including before they are added, so completion is
//! only decided once the combinator has begun.

pub mod delay;
pub mod failure;
pub mod when_all;
pub mod when_any;

use crate::error::{FiberError, FiberResult};
use crate::promise::{PromiseKind, PromisePool};
use crate::task::FiberTask;
use std::sync::Arc;

/// Book-keeping of a combinator promise.
pub(crate) trait Combinator: Send + Sized + 'static {
    const NAME: &'static str;

    fn state_mut(kind: &mut PromiseKind<()>) -> Option<&mut Self>;

    fn add_child(&mut self);

    /// Records how one child ended.
    fn record(&mut self, outcome: FiberResult<()>);

    fn begin(&mut self);

    /// Returns the combinator's own outcome once it is decided, at most once.
    fn take_if_done(&mut self) -> Option<FiberResult<()>>;
}

/// A combinator promise under construction.
pub(crate) struct Building<C: Combinator> {
    pool: Arc<PromisePool<()>>,
    index: u32,
    generation: u16,
    begun: bool,
    _combinator: std::marker::PhantomData<fn() -> C>,
}

impl<C: Combinator> Building<C> {
    pub(crate) fn new(pool: Arc<PromisePool<()>>, state: PromiseKind<()>) -> Self {
        let (index, generation) = pool.rent(state);
        Self {
            pool,
            index,
            generation,
            begun: false,
            _combinator: std::marker::PhantomData,
        }
    }

    pub(crate) fn add<T: Send + 'static>(&mut self, task: &FiberTask<T>) {
        let counted = self.pool.with_slot(self.index, self.generation, |slot| {
            if let Some(state) = C::state_mut(&mut slot.kind) {
                state.add_child();
            }
        });
        if counted.is_err() {
            log::warn!("Cannot add a child to a recycled {}.", C::NAME);
            return;
        }

        let (index, generation) = (self.index, self.generation);
        let pool = Arc::clone(&self.pool);
        let read_outcome = task.outcome_reader();
        let registered = task.on_settled(Box::new(move || {
            child_settled::<C>(&pool, index, generation, read_outcome());
        }));

        if let Err(error) = registered {
            log::error!("A stale task was added to {}: {error}", C::NAME);
            child_settled::<C>(&self.pool, index, generation, Err(error));
        }
    }

    pub(crate) fn begin(&mut self) -> FiberTask<()> {
        self.begun = true;
        let outcome = self.pool.with_slot(self.index, self.generation, |slot| {
            C::state_mut(&mut slot.kind).and_then(|state| {
                state.begin();
                state.take_if_done()
            })
        });
        if let Ok(Some(outcome)) = outcome {
            let _ = self.pool.complete(self.index, self.generation, outcome);
        }
        FiberTask::pooled(Arc::clone(&self.pool), self.index, self.generation)
    }
}

impl<C: Combinator> Drop for Building<C> {
    fn drop(&mut self) {
        if self.begun {
            return;
        }
        log::warn!("A {} was dropped before it began; canceling it.", C::NAME);
        let _ = self.pool.cancel(self.index, self.generation);
    }
}

fn child_settled<C: Combinator>(
    pool: &Arc<PromisePool<()>>,
    index: u32,
    generation: u16,
    outcome: FiberResult<()>,
) {
    let done = pool.with_slot(index, generation, |slot| {
        C::state_mut(&mut slot.kind).and_then(|state| {
            state.record(outcome);
            state.take_if_done()
        })
    });

    match done {
        Ok(Some(outcome)) => {
            let _ = pool.complete(index, generation, outcome);
        }
        Ok(None) => {}
        // The combinator itself was canceled and recycled; its children keep running.
        Err(_) => {}
    }
}

/// Maps a child outcome that was canceled to `None`.
pub(crate) fn unless_canceled(outcome: FiberResult<()>) -> Option<FiberResult<()>> {
    match outcome {
        Err(FiberError::Canceled) => None,
        other => Some(other),
    }
}
