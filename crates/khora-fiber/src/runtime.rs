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

//! The fiber runtime facade.

use crate::combinators::when_all::WhenAllBuilder;
use crate::combinators::when_any::WhenAnyBuilder;
use crate::config::FiberConfig;
use crate::error::FiberResult;
use crate::pool::{FiberStats, PoolCounters, PoolRegistry};
use crate::promise::bridge::StateMachine;
use crate::promise::source::FiberTaskSource;
use crate::promise::PromisePool;
use crate::scheduler::{Scheduler, TickReport, YieldAwaitable};
use crate::task::FiberTask;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

struct FibersInner {
    scheduler: Scheduler,
    pools: PoolRegistry,
    config: FiberConfig,
    counters: Arc<PoolCounters>,
}

/// One fiber runtime: a scheduler plus one promise pool per result type.
///
/// The host owns a `Fibers` value and calls [`Fibers::tick`] once per frame.
/// Clones are cheap and share the same runtime, so a clone can be moved into
/// fiber bodies that need to start more work.
#[derive(Clone)]
pub struct Fibers {
    inner: Arc<FibersInner>,
}

impl Fibers {
    /// Creates a runtime with the given configuration.
    pub fn new(config: FiberConfig) -> Self {
        log::info!(
            "Fiber runtime initialized (pool capacity {}, wake on cancel: {}).",
            config.initial_pool_capacity,
            config.wake_on_cancel
        );
        Self {
            inner: Arc::new(FibersInner {
                scheduler: Scheduler::new(),
                pools: PoolRegistry::default(),
                config,
                counters: Arc::new(PoolCounters::default()),
            }),
        }
    }

    /// The scheduler driving this runtime.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &FiberConfig {
        &self.inner.config
    }

    /// A snapshot of promise pool activity.
    pub fn stats(&self) -> FiberStats {
        self.inner.counters.snapshot()
    }

    /// Runs one frame of scheduled work. `delta` is the time elapsed since the
    /// previous frame and drives every pending delay.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a tick.
    pub fn tick(&self, delta: Duration) -> TickReport {
        self.inner.scheduler.tick(delta)
    }

    /// Starts a fiber running `future`.
    ///
    /// The future runs synchronously up to its first suspension point before
    /// this returns. A future that finishes without suspending yields an inline
    /// task.
    pub fn spawn<T, F>(&self, future: F) -> FiberTask<T>
    where
        T: Send + 'static,
        F: Future<Output = FiberResult<T>> + Send + 'static,
    {
        self.spawn_machine(Box::pin(future))
    }

    /// Starts a fiber driving a hand-written state machine.
    pub fn spawn_machine<T: Send + 'static>(
        &self,
        machine: impl StateMachine<T> + 'static,
    ) -> FiberTask<T> {
        self.pool::<T>().spawn(Box::new(machine))
    }

    /// Creates a task completed by hand through the returned source.
    pub fn source<T: Send + 'static>(&self) -> FiberTaskSource<T> {
        FiberTaskSource::new(self.pool::<T>())
    }

    /// A task that succeeds once `duration` of tick time has elapsed.
    pub fn delay(&self, duration: Duration) -> FiberTask<()> {
        self.pool::<()>().delay(duration)
    }

    /// Suspends the calling fiber until the next tick.
    pub fn yield_now(&self) -> YieldAwaitable {
        self.inner.scheduler.yield_now()
    }

    /// Starts building a task that waits for every added task.
    pub fn when_all(&self) -> WhenAllBuilder {
        WhenAllBuilder::new(self.pool::<()>())
    }

    /// Starts building a task that waits for the first added task.
    pub fn when_any(&self) -> WhenAnyBuilder {
        WhenAnyBuilder::new(self.pool::<()>())
    }

    /// Waits for every task of `tasks`.
    pub fn all_of<T: Send + 'static>(&self, tasks: &[FiberTask<T>]) -> FiberTask<()> {
        tasks
            .iter()
            .fold(self.when_all(), |builder, task| builder.add(task))
            .begin()
    }

    /// Waits for the first task of `tasks` to settle.
    pub fn any_of<T: Send + 'static>(&self, tasks: &[FiberTask<T>]) -> FiberTask<()> {
        tasks
            .iter()
            .fold(self.when_any(), |builder, task| builder.add(task))
            .begin()
    }

    /// Races `task` against a delay of `duration`.
    ///
    /// The returned task settles as soon as either does. Check the status of
    /// `task` to tell completion from timeout.
    pub fn with_timeout<T: Send + 'static>(
        &self,
        task: &FiberTask<T>,
        duration: Duration,
    ) -> FiberTask<()> {
        let timer = self.delay(duration);
        self.when_any().add(task).add(&timer).begin()
    }

    fn pool<T: Send + 'static>(&self) -> Arc<PromisePool<T>> {
        let inner = &self.inner;
        inner.pools.get_or_insert_with(|| {
            PromisePool::<T>::new(
                inner.scheduler.clone(),
                inner.config.clone(),
                Arc::clone(&inner.counters),
            )
        })
    }
}

impl Default for Fibers {
    fn default() -> Self {
        Self::new(FiberConfig::default())
    }
}

impl std::fmt::Debug for Fibers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fibers")
            .field("scheduler", &self.inner.scheduler)
            .field("pools", &self.inner.pools.len())
            .field("stats", &self.stats())
            .finish()
    }
}
