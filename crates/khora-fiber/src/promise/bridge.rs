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

//! Drives resumable state machines through the promise protocol.
//!
//! A bridged promise owns a suspended [`StateMachine`]. Every time the machine
//! is woken, the promise schedules an advance on the scheduler, which resumes
//! the machine during the next drain. When the machine finishes, its outcome
//! completes the promise.

use super::{FiberTaskStatus, PromiseKind, PromisePool};
use crate::error::{FiberError, FiberResult};
use crate::task::FiberTask;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

/// A resumable computation producing a `T`.
///
/// This is the explicit form of an `async` body: `resume` runs the machine up
/// to its next suspension point. It must arrange for `cx.waker()` to be woken
/// before returning [`Poll::Pending`], otherwise it is never resumed again.
///
/// Any `Pin<Box<F>>` where `F` is a future yielding a [`FiberResult`] is a state
/// machine, which is how [`Fibers::spawn`](crate::Fibers::spawn) bridges `async` blocks.
pub trait StateMachine<T>: Send {
    /// Runs the machine until it completes or suspends.
    fn resume(&mut self, cx: &mut Context<'_>) -> Poll<FiberResult<T>>;
}

impl<T, F> StateMachine<T> for Pin<Box<F>>
where
    F: Future<Output = FiberResult<T>> + Send + ?Sized,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> Poll<FiberResult<T>> {
        self.as_mut().poll(cx)
    }
}

/// State stored in a bridged promise slot.
pub(crate) struct BridgeState<T> {
    /// The suspended machine. `None` while it is being resumed.
    machine: Option<Box<dyn StateMachine<T>>>,
    waker: Option<Waker>,
    /// Set when a wake arrives while the machine is out of its slot.
    rewake: bool,
}

impl<T> BridgeState<T> {
    fn new() -> Self {
        Self {
            machine: None,
            waker: None,
            rewake: false,
        }
    }
}

/// Wakes a bridged promise by scheduling its advance.
struct BridgeWaker<T> {
    pool: Weak<PromisePool<T>>,
    index: u32,
    generation: u16,
}

impl<T: Send + 'static> Wake for BridgeWaker<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let (index, generation) = (self.index, self.generation);
        let scheduler = pool.scheduler.clone();
        scheduler.schedule(move || pool.advance(index, generation));
    }
}

enum AdvanceStep<T> {
    Resume(Box<dyn StateMachine<T>>, Waker),
    Release,
    Idle,
}

impl<T: Send + 'static> PromisePool<T> {
    /// Rents a bridged promise and runs the first step of `machine` right away.
    ///
    /// ## Returns
    ///
    /// An inline handle if the machine produced its value during its first step.
    /// A machine that failed there keeps its pooled promise, so the failure is
    /// reported as unobserved if nobody reads it.
    pub(crate) fn spawn(self: &Arc<Self>, mut machine: Box<dyn StateMachine<T>>) -> FiberTask<T> {
        let (index, generation) = self.rent(PromiseKind::Bridge(BridgeState::new()));
        let waker = Waker::from(Arc::new(BridgeWaker {
            pool: Arc::downgrade(self),
            index,
            generation,
        }));

        match resume(&mut *machine, &waker) {
            Poll::Ready(Ok(value)) => {
                drop(machine);
                self.release(index, generation);
                return FiberTask::from_result(value);
            }
            Poll::Ready(Err(error)) => {
                drop(machine);
                if self.complete(index, generation, Err(error)).is_err() {
                    log::error!("Fiber {index}@{generation} was recycled during its first step.");
                }
            }
            Poll::Pending => self.park(index, generation, machine, waker),
        }
        FiberTask::pooled(Arc::clone(self), index, generation)
    }

    /// Resumes the machine of a bridged promise.
    ///
    /// A canceled promise is returned to its pool instead, and its machine is
    /// dropped without running again.
    pub(crate) fn advance(self: &Arc<Self>, index: u32, generation: u16) {
        let step = self.with_slot(index, generation, |slot| {
            match slot.status() {
                FiberTaskStatus::Pending => {}
                FiberTaskStatus::Canceled => return AdvanceStep::Release,
                _ => return AdvanceStep::Idle,
            }
            let PromiseKind::Bridge(state) = &mut slot.kind else {
                return AdvanceStep::Idle;
            };
            match (state.machine.take(), state.waker.clone()) {
                (Some(machine), Some(waker)) => AdvanceStep::Resume(machine, waker),
                (machine, _) => {
                    state.machine = machine;
                    state.rewake = true;
                    AdvanceStep::Idle
                }
            }
        });

        match step {
            Ok(AdvanceStep::Resume(mut machine, waker)) => {
                match resume(&mut *machine, &waker) {
                    Poll::Ready(outcome) => {
                        drop(machine);
                        if self.complete(index, generation, outcome).is_err() {
                            log::trace!("Fiber {index}@{generation} finished after being recycled.");
                        }
                    }
                    Poll::Pending => self.park(index, generation, machine, waker),
                }
            }
            Ok(AdvanceStep::Release) => {
                self.release(index, generation);
            }
            Ok(AdvanceStep::Idle) => {}
            Err(_) => log::trace!("Ignoring wake of recycled fiber {index}@{generation}."),
        }
    }

    /// Stores a suspended machine back into its slot.
    fn park(
        self: &Arc<Self>,
        index: u32,
        generation: u16,
        machine: Box<dyn StateMachine<T>>,
        waker: Waker,
    ) {
        let parked = self.with_slot(index, generation, move |slot| {
            if slot.status() != FiberTaskStatus::Pending {
                return (Some(machine), false);
            }
            let PromiseKind::Bridge(state) = &mut slot.kind else {
                return (Some(machine), false);
            };
            state.machine = Some(machine);
            state.waker = Some(waker);
            (None, std::mem::take(&mut state.rewake))
        });

        match parked {
            Ok((None, true)) => {
                let pool = Arc::clone(self);
                self.scheduler
                    .schedule(move || pool.advance(index, generation));
            }
            // A machine that could not be parked is dropped here, outside the pool lock.
            Ok(_) => {}
            Err(_) => log::trace!("Fiber {index}@{generation} was recycled while running."),
        }
    }
}

/// Resumes `machine` once, turning a panic into a fault.
fn resume<T>(machine: &mut dyn StateMachine<T>, waker: &Waker) -> Poll<FiberResult<T>> {
    let mut cx = Context::from_waker(waker);
    match panic::catch_unwind(AssertUnwindSafe(|| machine.resume(&mut cx))) {
        Ok(poll) => poll,
        Err(payload) => Poll::Ready(Err(FiberError::from_panic(payload))),
    }
}
