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

//! The cooperative, tick-driven scheduler.
//!
//! A [`Scheduler`] owns three FIFO queues:
//!
//! - the **work queue**, filled by [`Scheduler::schedule`]. Work scheduled while a
//!   tick is draining runs within that same tick.
//! - the **next-tick queue**, filled by [`Scheduler::schedule_next_tick`]. Its
//!   content is moved onto the work queue at the start of the following tick.
//!   Yield points and delay timers live here.
//! - the **marshalled queue**, filled by [`Scheduler::post`] and
//!   [`Scheduler::send`] from code running off the logical thread.
//!
//! Every queue accepts producers on any thread. Only the thread calling
//! [`Scheduler::tick`] consumes them.

use crate::error::panic_message;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A zero-argument callback run once when an operation completes or a tick drains.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// A callback posted from another thread, paired with its opaque state.
struct Marshalled {
    callback: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
    state: Box<dyn Any + Send>,
}

struct SchedulerInner {
    work_tx: flume::Sender<Continuation>,
    work_rx: flume::Receiver<Continuation>,
    next_tick_tx: flume::Sender<Continuation>,
    next_tick_rx: flume::Receiver<Continuation>,
    marshalled_tx: flume::Sender<Marshalled>,
    marshalled_rx: flume::Receiver<Marshalled>,
    ticking: AtomicBool,
    frame: AtomicU64,
    delta_nanos: AtomicU64,
}

/// A handle to a cooperative scheduler. Clones share the same queues.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// A summary of the work performed by one [`Scheduler::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The frame number of this tick, starting at 1.
    pub frame: u64,
    /// Continuations run from the work queue (including next-tick work).
    pub executed: usize,
    /// Marshalled callbacks run.
    pub marshalled: usize,
    /// Callbacks that panicked. Their panics were logged and swallowed.
    pub panicked: usize,
}

impl Scheduler {
    /// Creates a scheduler with empty queues.
    pub fn new() -> Self {
        let (work_tx, work_rx) = flume::unbounded();
        let (next_tick_tx, next_tick_rx) = flume::unbounded();
        let (marshalled_tx, marshalled_rx) = flume::unbounded();
        Self {
            inner: Arc::new(SchedulerInner {
                work_tx,
                work_rx,
                next_tick_tx,
                next_tick_rx,
                marshalled_tx,
                marshalled_rx,
                ticking: AtomicBool::new(false),
                frame: AtomicU64::new(0),
                delta_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueues `callback` on the work queue.
    ///
    /// If a tick is draining, the callback runs before that tick returns.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.inner.work_tx.send(Box::new(callback)) {
            log::error!("Failed to schedule a continuation: {e}.");
        }
    }

    /// Enqueues `callback` so that it runs during the next tick, never the current one.
    pub fn schedule_next_tick(&self, callback: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.inner.next_tick_tx.send(Box::new(callback)) {
            log::error!("Failed to schedule a next-tick continuation: {e}.");
        }
    }

    /// Marshals `callback(state)` onto the logical thread.
    ///
    /// Safe to call from any thread. The callback runs during the next tick,
    /// after the work queue has been drained.
    pub fn post<S: Send + 'static>(&self, callback: impl FnOnce(S) + Send + 'static, state: S) {
        let callback = move |state: Box<dyn Any + Send>| match state.downcast::<S>() {
            Ok(state) => callback(*state),
            Err(_) => log::error!("Marshalled callback received state of an unexpected type."),
        };
        let marshalled = Marshalled {
            callback: Box::new(callback),
            state: Box::new(state),
        };
        if let Err(e) = self.inner.marshalled_tx.send(marshalled) {
            log::error!("Failed to post a marshalled callback: {e}.");
        }
    }

    /// Like [`post`](Self::post), but returns a receipt the producer can block on
    /// until the callback has run on the logical thread.
    pub fn send<S: Send + 'static>(
        &self,
        callback: impl FnOnce(S) + Send + 'static,
        state: S,
    ) -> SendReceipt {
        let (done_tx, done_rx) = flume::bounded(1);
        self.post(
            move |state| {
                callback(state);
                let _ = done_tx.send(());
            },
            state,
        );
        SendReceipt { done: done_rx }
    }

    /// Returns a future that completes on the next tick.
    pub fn yield_now(&self) -> YieldAwaitable {
        YieldAwaitable {
            scheduler: self.clone(),
            yielded: false,
        }
    }

    /// Runs all ready work for one frame.
    ///
    /// Next-tick work is moved onto the work queue, then the work queue and the
    /// marshalled queue are drained until both are empty. A panic escaping one
    /// callback is logged and does not stop the drain.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a callback being run by this scheduler.
    pub fn tick(&self, delta: Duration) -> TickReport {
        let inner = &self.inner;
        assert!(
            !inner.ticking.swap(true, Ordering::AcqRel),
            "Scheduler::tick must not be called from inside a scheduled continuation"
        );
        let _guard = TickGuard(&inner.ticking);

        let frame = inner.frame.fetch_add(1, Ordering::Relaxed) + 1;
        let delta_nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        inner.delta_nanos.store(delta_nanos, Ordering::Relaxed);

        let mut report = TickReport {
            frame,
            ..Default::default()
        };

        // Only work deferred before this tick started is promoted; work deferred
        // during the drain below waits for the next frame.
        for callback in inner.next_tick_rx.drain() {
            if let Err(e) = inner.work_tx.send(callback) {
                log::error!("Failed to promote a next-tick continuation: {e}.");
            }
        }

        loop {
            while let Ok(callback) = inner.work_rx.try_recv() {
                report.executed += 1;
                if !run_guarded(callback, "scheduled continuation") {
                    report.panicked += 1;
                }
            }

            while let Ok(Marshalled { callback, state }) = inner.marshalled_rx.try_recv() {
                report.marshalled += 1;
                if !run_guarded(move || callback(state), "marshalled callback") {
                    report.panicked += 1;
                }
            }

            if inner.work_rx.is_empty() && inner.marshalled_rx.is_empty() {
                break;
            }
        }

        log::trace!(
            "Fiber tick {frame}: {} continuations, {} marshalled, {} panicked.",
            report.executed,
            report.marshalled,
            report.panicked
        );
        report
    }

    /// Number of ticks run so far.
    pub fn frame(&self) -> u64 {
        self.inner.frame.load(Ordering::Relaxed)
    }

    /// The elapsed time passed to the current (or most recent) tick.
    pub fn delta_time(&self) -> Duration {
        Duration::from_nanos(self.inner.delta_nanos.load(Ordering::Relaxed))
    }

    /// Returns `true` while a tick is draining.
    pub fn is_ticking(&self) -> bool {
        self.inner.ticking.load(Ordering::Acquire)
    }

    /// Number of callbacks waiting in all queues.
    pub fn pending(&self) -> usize {
        self.inner.work_rx.len() + self.inner.next_tick_rx.len() + self.inner.marshalled_rx.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("frame", &self.frame())
            .field("pending", &self.pending())
            .finish()
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Completion receipt for a callback marshalled with [`Scheduler::send`].
#[derive(Debug)]
pub struct SendReceipt {
    done: flume::Receiver<()>,
}

impl SendReceipt {
    /// Blocks until the callback has run. Returns `false` if it panicked or was dropped.
    pub fn wait(self) -> bool {
        self.done.recv().is_ok()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> bool {
        self.done.recv_timeout(timeout).is_ok()
    }

    /// Returns `true` if the callback has already run.
    pub fn is_done(&self) -> bool {
        !self.done.is_empty()
    }
}

/// A future that suspends its fiber until the next tick.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldAwaitable {
    scheduler: Scheduler,
    yielded: bool,
}

impl Future for YieldAwaitable {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }

        this.yielded = true;
        let waker = cx.waker().clone();
        this.scheduler.schedule_next_tick(move || waker.wake());
        Poll::Pending
    }
}

/// Runs `callback`, logging and swallowing any panic. Returns `false` if it panicked.
pub(crate) fn run_guarded(callback: impl FnOnce(), context: &str) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(payload) => {
            log::error!(
                "An unhandled panic escaped a {context}: {}",
                panic_message(payload.as_ref())
            );
            false
        }
    }
}
