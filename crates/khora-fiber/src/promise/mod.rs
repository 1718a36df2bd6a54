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

//! The promise state machine behind every pooled [`FiberTask`](crate::FiberTask).
//!
//! A promise lives in a slot of a [`PromisePool`] and moves one way:
//! `Pending → {Succeeded, Faulted, Canceled}`. When it leaves `Pending`, its
//! queued continuations run once, in the order they were registered, followed by
//! the settle hooks of any combinator waiting on it. Reaching a
//! terminal status schedules the slot's return to its pool for the next tick.
//! Returning bumps the slot's generation, so every handle captured before the
//! return goes stale.
//!
//! With [`FiberConfig::wake_on_cancel`] disabled, a canceled promise leaves its
//! continuations parked. Settle hooks still run, so combinators always learn
//! that a child dropped out.
//!
//! Every operation takes the generation the caller observed. A mismatch is
//! reported as [`FiberError::StaleHandle`] and never touches the slot.

pub mod bridge;
pub mod source;

use crate::combinators::delay::DelayState;
use crate::combinators::when_all::WhenAllState;
use crate::combinators::when_any::WhenAnyState;
use crate::config::FiberConfig;
use crate::error::{FiberError, FiberResult};
use crate::pool::{lock, Pool, PoolAware, PoolCounters};
use crate::scheduler::{run_guarded, Continuation, Scheduler};
use bridge::BridgeState;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// The status of a [`FiberTask`](crate::FiberTask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberTaskStatus {
    /// The operation has not finished yet.
    Pending,
    /// The operation produced a value.
    Succeeded,
    /// The operation was canceled.
    Canceled,
    /// The operation failed.
    Faulted,
}

impl FiberTaskStatus {
    /// Returns `true` for every status except [`FiberTaskStatus::Pending`].
    pub fn is_completed(self) -> bool {
        self != FiberTaskStatus::Pending
    }
}

impl fmt::Display for FiberTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberTaskStatus::Pending => "pending",
            FiberTaskStatus::Succeeded => "succeeded",
            FiberTaskStatus::Canceled => "canceled",
            FiberTaskStatus::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// What a rented promise slot is doing.
pub(crate) enum PromiseKind<T> {
    /// Freshly created or recycled.
    Idle,
    /// Completed by hand through a [`FiberTaskSource`](source::FiberTaskSource).
    Source,
    /// Drives a resumable state machine.
    Bridge(BridgeState<T>),
    /// Completes after an amount of tick time.
    Delay(DelayState),
    /// Completes once every child has settled.
    WhenAll(WhenAllState),
    /// Completes once the first child has settled.
    WhenAny(WhenAnyState),
}

/// One reusable promise.
pub(crate) struct PromiseSlot<T> {
    generation: u16,
    status: FiberTaskStatus,
    continuations: VecDeque<Continuation>,
    /// Combinator subscriptions, run on every terminal transition.
    settle_hooks: VecDeque<Continuation>,
    result: Option<T>,
    error: Option<FiberError>,
    observed: bool,
    pub(crate) kind: PromiseKind<T>,
}

impl<T> PromiseSlot<T> {
    fn new() -> Self {
        Self {
            generation: 0,
            status: FiberTaskStatus::Pending,
            continuations: VecDeque::new(),
            settle_hooks: VecDeque::new(),
            result: None,
            error: None,
            observed: false,
            kind: PromiseKind::Idle,
        }
    }

    pub(crate) fn status(&self) -> FiberTaskStatus {
        self.status
    }

    fn failure(&self) -> FiberError {
        self.error.clone().unwrap_or_else(|| {
            FiberError::faulted(anyhow::anyhow!("the failure was not captured"))
        })
    }
}

impl<T> PoolAware for PromiseSlot<T> {
    fn on_rent(&mut self) {
        self.status = FiberTaskStatus::Pending;
    }

    fn on_return(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.continuations.clear();
        self.settle_hooks.clear();
        self.result = None;
        self.error = None;
        self.observed = false;
        self.kind = PromiseKind::Idle;
    }
}

/// Payload taken out of a slot on return, dropped once the pool lock is released.
struct Recycled<T> {
    _kind: PromiseKind<T>,
    _continuations: VecDeque<Continuation>,
    _settle_hooks: VecDeque<Continuation>,
    _result: Option<T>,
}

/// The pool of every promise producing a `T`.
pub(crate) struct PromisePool<T> {
    slots: Mutex<Pool<PromiseSlot<T>>>,
    pub(crate) scheduler: Scheduler,
    config: FiberConfig,
    counters: Arc<PoolCounters>,
}

impl<T: Send + 'static> PromisePool<T> {
    pub(crate) fn new(scheduler: Scheduler, config: FiberConfig, counters: Arc<PoolCounters>) -> Self {
        Self {
            slots: Mutex::new(Pool::with_capacity(config.initial_pool_capacity)),
            scheduler,
            config,
            counters,
        }
    }

    /// Rents a pending slot running `kind`. Returns its index and generation.
    pub(crate) fn rent(&self, kind: PromiseKind<T>) -> (u32, u16) {
        let mut slots = lock(&self.slots);
        let (index, slot) = slots.create_or_rent(PromiseSlot::new);
        slot.kind = kind;
        let generation = slot.generation;
        self.counters.rented.fetch_add(1, Ordering::Relaxed);
        (index, generation)
    }

    /// Runs `f` on the slot if `generation` is still current.
    pub(crate) fn with_slot<R>(
        &self,
        index: u32,
        generation: u16,
        f: impl FnOnce(&mut PromiseSlot<T>) -> R,
    ) -> FiberResult<R> {
        let mut slots = lock(&self.slots);
        match slots.get_mut(index) {
            Some(slot) if slot.generation == generation => Ok(f(slot)),
            Some(slot) => Err(FiberError::StaleHandle {
                held: generation,
                current: slot.generation,
            }),
            None => Err(FiberError::StaleHandle {
                held: generation,
                current: 0,
            }),
        }
    }

    pub(crate) fn status(&self, index: u32, generation: u16) -> FiberResult<FiberTaskStatus> {
        self.with_slot(index, generation, |slot| slot.status)
    }

    /// Registers `continuation`, or runs it right away if the promise is no longer pending.
    pub(crate) fn on_completed(
        &self,
        index: u32,
        generation: u16,
        continuation: Continuation,
    ) -> FiberResult<()> {
        self.subscribe(index, generation, continuation, |slot| &mut slot.continuations)
    }

    /// Registers a combinator hook. Unlike a continuation, it also runs when the
    /// promise is canceled lazily.
    pub(crate) fn on_settled(
        &self,
        index: u32,
        generation: u16,
        hook: Continuation,
    ) -> FiberResult<()> {
        self.subscribe(index, generation, hook, |slot| &mut slot.settle_hooks)
    }

    fn subscribe(
        &self,
        index: u32,
        generation: u16,
        continuation: Continuation,
        queue: fn(&mut PromiseSlot<T>) -> &mut VecDeque<Continuation>,
    ) -> FiberResult<()> {
        let ready = self.with_slot(index, generation, move |slot| {
            if slot.status == FiberTaskStatus::Pending {
                queue(slot).push_back(continuation);
                None
            } else {
                Some(continuation)
            }
        })?;

        if let Some(continuation) = ready {
            continuation();
        }
        Ok(())
    }

    /// Moves a pending promise to its terminal status.
    ///
    /// `Err(FiberError::Canceled)` settles the promise as canceled, any other error
    /// faults it. Returns `Ok(false)` if the promise had already left `Pending`.
    pub(crate) fn complete(
        self: &Arc<Self>,
        index: u32,
        generation: u16,
        outcome: FiberResult<T>,
    ) -> FiberResult<bool> {
        let continuations = self.with_slot(index, generation, |slot| {
            if slot.status != FiberTaskStatus::Pending {
                return None;
            }
            let status = match outcome {
                Ok(value) => {
                    slot.result = Some(value);
                    FiberTaskStatus::Succeeded
                }
                Err(FiberError::Canceled) => FiberTaskStatus::Canceled,
                Err(error) => {
                    slot.error = Some(error);
                    FiberTaskStatus::Faulted
                }
            };
            Some(self.set_status(slot, status))
        })?;

        let Some(continuations) = continuations else {
            return Ok(false);
        };
        self.schedule_release(index, generation);
        run_continuations(continuations);
        Ok(true)
    }

    /// Cancels a pending promise. Terminal promises are left untouched.
    pub(crate) fn cancel(self: &Arc<Self>, index: u32, generation: u16) -> FiberResult<bool> {
        let continuations = self.with_slot(index, generation, |slot| {
            (slot.status == FiberTaskStatus::Pending)
                .then(|| self.set_status(slot, FiberTaskStatus::Canceled))
        })?;

        let Some(continuations) = continuations else {
            return Ok(false);
        };
        log::trace!("Fiber promise {index}@{generation} canceled.");
        self.schedule_release(index, generation);
        run_continuations(continuations);
        Ok(true)
    }

    /// Applies a status transition and returns the continuations it releases,
    /// settle hooks last.
    fn set_status(
        &self,
        slot: &mut PromiseSlot<T>,
        status: FiberTaskStatus,
    ) -> VecDeque<Continuation> {
        slot.status = status;
        let mut released = match status {
            FiberTaskStatus::Pending => return VecDeque::new(),
            FiberTaskStatus::Canceled if !self.config.wake_on_cancel => VecDeque::new(),
            _ => std::mem::take(&mut slot.continuations),
        };
        released.append(&mut slot.settle_hooks);
        released
    }

    /// Returns the slot to the pool during the next tick.
    pub(crate) fn schedule_release(self: &Arc<Self>, index: u32, generation: u16) {
        let pool = Arc::clone(self);
        self.scheduler
            .schedule_next_tick(move || {
                pool.release(index, generation);
            });
    }

    /// Returns the slot to the pool now, invalidating every handle to it.
    ///
    /// Returns `false` if the slot was already recycled.
    pub(crate) fn release(&self, index: u32, generation: u16) -> bool {
        let recycled = {
            let mut slots = lock(&self.slots);
            if !slots.is_rented(index) {
                return false;
            }
            let Some(slot) = slots.get_mut(index) else {
                return false;
            };
            if slot.generation != generation {
                return false;
            }

            if slot.status == FiberTaskStatus::Faulted
                && !slot.observed
                && self.config.report_unobserved_failures
            {
                if let Some(error) = &slot.error {
                    log::error!("An unobserved fiber failure was recycled: {error}");
                    self.counters
                        .unobserved_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
            }

            let recycled = Recycled {
                _kind: std::mem::replace(&mut slot.kind, PromiseKind::Idle),
                _continuations: std::mem::take(&mut slot.continuations),
                _settle_hooks: std::mem::take(&mut slot.settle_hooks),
                _result: slot.result.take(),
            };
            slots.give_back(index);
            recycled
        };

        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        log::trace!("Fiber promise {index}@{generation} returned to its pool.");
        drop(recycled);
        true
    }
}

impl<T: Clone + Send + 'static> PromisePool<T> {
    /// Reads the outcome of a terminal promise and marks it as observed.
    pub(crate) fn result(&self, index: u32, generation: u16) -> FiberResult<T> {
        self.with_slot(index, generation, |slot| match slot.status {
            FiberTaskStatus::Pending => Err(FiberError::NotCompleted),
            FiberTaskStatus::Succeeded => {
                slot.observed = true;
                slot.result.clone().ok_or(FiberError::NotCompleted)
            }
            FiberTaskStatus::Canceled => {
                slot.observed = true;
                Err(FiberError::Canceled)
            }
            FiberTaskStatus::Faulted => {
                slot.observed = true;
                Err(slot.failure())
            }
        })?
    }
}

impl<T: Send + 'static> PromisePool<T> {
    /// Reads how a terminal promise ended without touching its payload.
    ///
    /// A faulted promise read this way counts as observed.
    pub(crate) fn outcome(&self, index: u32, generation: u16) -> FiberResult<()> {
        self.with_slot(index, generation, |slot| match slot.status {
            FiberTaskStatus::Pending => Err(FiberError::NotCompleted),
            FiberTaskStatus::Succeeded => Ok(()),
            FiberTaskStatus::Canceled => Err(FiberError::Canceled),
            FiberTaskStatus::Faulted => {
                slot.observed = true;
                Err(slot.failure())
            }
        })?
    }
}

fn run_continuations(continuations: VecDeque<Continuation>) {
    for continuation in continuations {
        run_guarded(continuation, "promise continuation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<PromisePool<u32>> {
        Arc::new(PromisePool::new(
            Scheduler::new(),
            FiberConfig::default(),
            Arc::new(PoolCounters::default()),
        ))
    }

    #[test]
    fn test_continuations_run_in_registration_order() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 1..=3 {
            let order = Arc::clone(&order);
            pool.on_completed(index, generation, Box::new(move || order.lock().unwrap().push(id)))
                .unwrap();
        }
        assert!(order.lock().unwrap().is_empty());

        assert!(pool.complete(index, generation, Ok(7)).unwrap());

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(pool.result(index, generation).unwrap(), 7);
    }

    #[test]
    fn test_on_completed_runs_inline_once_complete() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        pool.complete(index, generation, Ok(1)).unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        pool.on_completed(index, generation, Box::new(move || *flag.lock().unwrap() = true))
            .unwrap();

        assert!(*ran.lock().unwrap(), "A completed promise runs continuations synchronously");
    }

    #[test]
    fn test_terminal_status_is_one_way() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);

        assert!(pool.complete(index, generation, Ok(1)).unwrap());
        assert!(!pool.complete(index, generation, Ok(2)).unwrap());
        assert!(!pool.cancel(index, generation).unwrap());

        assert_eq!(pool.status(index, generation).unwrap(), FiberTaskStatus::Succeeded);
        assert_eq!(pool.result(index, generation).unwrap(), 1);
    }

    #[test]
    fn test_release_invalidates_the_generation() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        pool.complete(index, generation, Ok(5)).unwrap();

        assert!(pool.release(index, generation));
        assert!(!pool.release(index, generation), "Release is idempotent");

        let error = pool.status(index, generation).unwrap_err();
        assert!(error.is_stale());

        let (reused, next_generation) = pool.rent(PromiseKind::Source);
        assert_eq!(reused, index);
        assert_eq!(next_generation, generation.wrapping_add(1));
        assert!(pool.result(index, generation).unwrap_err().is_stale());
        assert!(pool.cancel(index, generation).unwrap_err().is_stale());
        assert_eq!(pool.status(reused, next_generation).unwrap(), FiberTaskStatus::Pending);
    }

    #[test]
    fn test_fault_is_reported_to_every_reader() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        pool.complete(index, generation, Err(FiberError::faulted(anyhow::anyhow!("io"))))
            .unwrap();

        for _ in 0..2 {
            let error = pool.result(index, generation).unwrap_err();
            assert_eq!(error.to_string(), "The fiber task faulted: io");
        }
        assert_eq!(pool.status(index, generation).unwrap(), FiberTaskStatus::Faulted);
    }

    #[test]
    fn test_canceled_outcome_settles_as_canceled() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        pool.complete(index, generation, Err(FiberError::Canceled)).unwrap();

        assert_eq!(pool.status(index, generation).unwrap(), FiberTaskStatus::Canceled);
        assert!(pool.result(index, generation).unwrap_err().is_canceled());
    }

    #[test]
    fn test_lazy_cancellation_keeps_waiters_parked() {
        let pool = Arc::new(PromisePool::<u32>::new(
            Scheduler::new(),
            FiberConfig {
                wake_on_cancel: false,
                ..Default::default()
            },
            Arc::new(PoolCounters::default()),
        ));
        let (index, generation) = pool.rent(PromiseKind::Source);
        let woken = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&woken);
        pool.on_completed(index, generation, Box::new(move || *flag.lock().unwrap() = true))
            .unwrap();

        assert!(pool.cancel(index, generation).unwrap());

        assert!(!*woken.lock().unwrap());
        assert_eq!(pool.status(index, generation).unwrap(), FiberTaskStatus::Canceled);
    }

    #[test]
    fn test_lazy_cancellation_still_runs_settle_hooks() {
        let pool = Arc::new(PromisePool::<u32>::new(
            Scheduler::new(),
            FiberConfig {
                wake_on_cancel: false,
                ..Default::default()
            },
            Arc::new(PoolCounters::default()),
        ));
        let (index, generation) = pool.rent(PromiseKind::Source);
        let order = Arc::new(Mutex::new(Vec::new()));
        let parked = Arc::clone(&order);
        pool.on_completed(index, generation, Box::new(move || parked.lock().unwrap().push("awaiter")))
            .unwrap();
        let hooked = Arc::clone(&order);
        pool.on_settled(index, generation, Box::new(move || hooked.lock().unwrap().push("hook")))
            .unwrap();

        assert!(pool.cancel(index, generation).unwrap());

        assert_eq!(*order.lock().unwrap(), vec!["hook"]);
    }

    #[test]
    fn test_settle_hooks_run_after_continuations() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        let order = Arc::new(Mutex::new(Vec::new()));
        let hooked = Arc::clone(&order);
        pool.on_settled(index, generation, Box::new(move || hooked.lock().unwrap().push("hook")))
            .unwrap();
        let awaited = Arc::clone(&order);
        pool.on_completed(index, generation, Box::new(move || awaited.lock().unwrap().push("awaiter")))
            .unwrap();

        pool.complete(index, generation, Ok(1)).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["awaiter", "hook"]);
    }

    #[test]
    fn test_release_is_scheduled_for_the_next_tick() {
        let pool = pool();
        let (index, generation) = pool.rent(PromiseKind::Source);
        pool.complete(index, generation, Ok(3)).unwrap();

        pool.scheduler.tick(std::time::Duration::ZERO);

        assert!(pool.status(index, generation).unwrap_err().is_stale());
    }

    #[test]
    fn test_unobserved_fault_is_counted_once() {
        let counters = Arc::new(PoolCounters::default());
        let pool = Arc::new(PromisePool::<u32>::new(
            Scheduler::new(),
            FiberConfig::default(),
            Arc::clone(&counters),
        ));

        let (observed, observed_generation) = pool.rent(PromiseKind::Source);
        pool.complete(observed, observed_generation, Err(FiberError::faulted(anyhow::anyhow!("seen"))))
            .unwrap();
        let _ = pool.result(observed, observed_generation);

        let (ignored, ignored_generation) = pool.rent(PromiseKind::Source);
        pool.complete(ignored, ignored_generation, Err(FiberError::faulted(anyhow::anyhow!("lost"))))
            .unwrap();

        pool.release(observed, observed_generation);
        pool.release(ignored, ignored_generation);
        pool.release(ignored, ignored_generation);

        assert_eq!(counters.snapshot().unobserved_failures, 1);
        assert_eq!(counters.snapshot().returned, 2);
    }
}
